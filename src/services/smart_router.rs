//! Smart router: extract → classify → suggest → learn, with a decision log.

use crate::error::Result;
use crate::models::{doc_type_label, DocType, MappingProvider, MappingSuggestion};
use crate::ocr::OcrExtractor;
use crate::services::classifier::{
    available_parsers, ClassificationMethod, ClassificationResult, DocumentClassifier,
};
use crate::services::confidence_gate::{ConfidenceGatingPolicy, GateAction};
use crate::services::learner::{MappingLearner, DEFAULT_CONFIRM_THRESHOLD};
use crate::services::mapping_suggester::MappingSuggester;
use crate::sources::{file_extension, open_source, SourceKind, TabularSource};
use crate::types::{OcrLayout, RawRow};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Rows read for classification and assisted mapping.
pub const SAMPLE_ROWS: usize = 5;
/// Cache partition used when the caller names no tenant.
pub const ANONYMOUS_TENANT: &str = "anonymous";

/// One entry of the ordered decision log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum DecisionStep {
    Extract {
        source: SourceKind,
        headers: usize,
        sample_rows: usize,
        parser_confidence: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        ocr_layout: Option<OcrLayout>,
    },
    Classify {
        doc_type: String,
        confidence: f64,
        method: ClassificationMethod,
        suggested_parser: String,
    },
    LayoutHint {
        layout: OcrLayout,
        doc_type: String,
    },
    Suggest {
        provider: MappingProvider,
        confidence: f64,
        from_cache: bool,
        mapped: usize,
    },
    Learn {
        applied: bool,
        provider: MappingProvider,
    },
    LearnSkipped {
        reason: String,
    },
    Gate {
        action: GateAction,
        overall_confidence: f64,
        learned_confirmation: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub suggested_parser: String,
    /// Doc type name, or "generic" when undetermined.
    pub suggested_doc_type: String,
    pub confidence: f64,
    pub headers_sample: Vec<String>,
    pub sample_rows: Vec<RawRow>,
    pub mapping_suggestion: Option<MappingSuggestion>,
    pub decision_log: Vec<DecisionStep>,
    pub requires_confirmation: bool,
    pub available_parsers: Vec<String>,
    pub parser_confidence: f64,
    #[serde(skip)]
    pub doc_type: Option<DocType>,
    #[serde(skip)]
    pub classification: Option<ClassificationResult>,
}

/// What the router knows about a source before classification.
pub struct SourceSample<'a> {
    pub kind: SourceKind,
    pub headers: &'a [String],
    pub rows: &'a [RawRow],
    pub extension: &'a str,
    pub parser_confidence: f64,
    pub ocr_layout: Option<OcrLayout>,
}

fn layout_doc_type(layout: OcrLayout) -> Option<DocType> {
    match layout {
        OcrLayout::Invoice => Some(DocType::Invoice),
        OcrLayout::Receipt => Some(DocType::ExpenseReceipt),
        OcrLayout::BankStatement => Some(DocType::BankTx),
        OcrLayout::Unknown => None,
    }
}

pub struct SmartRouter {
    classifier: Arc<DocumentClassifier>,
    suggester: Arc<MappingSuggester>,
    learner: Arc<MappingLearner>,
    ocr: Option<Arc<dyn OcrExtractor>>,
    policy: ConfidenceGatingPolicy,
}

impl SmartRouter {
    pub fn new(
        classifier: Arc<DocumentClassifier>,
        suggester: Arc<MappingSuggester>,
        learner: Arc<MappingLearner>,
    ) -> Self {
        Self {
            classifier,
            suggester,
            learner,
            ocr: None,
            policy: ConfidenceGatingPolicy::default(),
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrExtractor>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_policy(mut self, policy: ConfidenceGatingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn classifier(&self) -> &DocumentClassifier {
        &self.classifier
    }

    pub fn learner(&self) -> &MappingLearner {
        &self.learner
    }

    pub fn policy(&self) -> &ConfidenceGatingPolicy {
        &self.policy
    }

    /// Open a file with the configured OCR capability.
    pub fn open(&self, path: &Path) -> Result<TabularSource> {
        open_source(path, self.ocr.as_deref())
    }

    /// Analyze a file. Only extraction failures are errors.
    pub fn analyze(&self, path: &Path, tenant_id: Option<&str>, use_ai: bool) -> Result<AnalysisResult> {
        let mut source = self.open(path)?;
        let rows = source.take_sample(SAMPLE_ROWS)?;
        let ext = file_extension(path);
        let sample = SourceSample {
            kind: source.kind,
            headers: &source.headers,
            rows: &rows,
            extension: &ext,
            parser_confidence: source.parser_confidence,
            ocr_layout: source.ocr_layout,
        };
        Ok(self.analyze_sample(&sample, tenant_id, use_ai))
    }

    /// Classification, mapping and learning over already extracted headers/rows.
    pub fn analyze_sample(
        &self,
        sample: &SourceSample<'_>,
        tenant_id: Option<&str>,
        use_ai: bool,
    ) -> AnalysisResult {
        let mut log = vec![DecisionStep::Extract {
            source: sample.kind,
            headers: sample.headers.len(),
            sample_rows: sample.rows.len(),
            parser_confidence: sample.parser_confidence,
            ocr_layout: sample.ocr_layout,
        }];

        let classification = self
            .classifier
            .classify(sample.headers, Some(sample.rows), sample.extension);
        log.push(DecisionStep::Classify {
            doc_type: classification.doc_type_label().to_string(),
            confidence: classification.confidence,
            method: classification.method,
            suggested_parser: classification.suggested_parser.clone(),
        });

        let mut doc_type = classification.doc_type;
        if doc_type.is_none() {
            if let Some((layout, hinted)) = sample
                .ocr_layout
                .and_then(|l| layout_doc_type(l).map(|d| (l, d)))
            {
                log.push(DecisionStep::LayoutHint {
                    layout,
                    doc_type: hinted.as_str().to_string(),
                });
                doc_type = Some(hinted);
            }
        }

        let mapping_suggestion =
            doc_type.map(|doc_type| self.suggest_and_learn(sample, doc_type, tenant_id, use_ai, &mut log));

        let requires_confirmation = match (&mapping_suggestion, doc_type) {
            (Some(suggestion), Some(doc_type)) => {
                let learned_confirmation = tenant_id
                    .map(|t| {
                        self.learner
                            .should_confirm_mapping(t, doc_type, &suggestion.mappings, DEFAULT_CONFIRM_THRESHOLD)
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);
                let mapping_score = if learned_confirmation { 1.0 } else { suggestion.confidence };
                // Nothing has been validated yet; validation is scored at ingestion.
                let decision = self.policy.evaluate(&self.policy.gate(
                    sample.parser_confidence,
                    classification.confidence,
                    mapping_score,
                    1.0,
                ));
                log.push(DecisionStep::Gate {
                    action: decision.action,
                    overall_confidence: decision.overall_confidence,
                    learned_confirmation,
                });
                decision.action != GateAction::AutoApprove
            }
            _ => true,
        };

        let result = AnalysisResult {
            suggested_parser: classification.suggested_parser.clone(),
            suggested_doc_type: doc_type_label(doc_type).to_string(),
            confidence: classification.confidence,
            headers_sample: sample.headers.to_vec(),
            sample_rows: sample.rows.iter().take(3).cloned().collect(),
            mapping_suggestion,
            decision_log: log,
            requires_confirmation,
            available_parsers: available_parsers(),
            parser_confidence: sample.parser_confidence,
            doc_type,
            classification: Some(classification),
        };
        tracing::info!(
            doc_type = %result.suggested_doc_type,
            confidence = result.confidence,
            requires_confirmation,
            "analysis complete"
        );
        result
    }

    /// Mapping for a caller-chosen doc type, with learned corrections applied.
    pub fn mapping_for(
        &self,
        sample: &SourceSample<'_>,
        doc_type: DocType,
        tenant_id: Option<&str>,
        use_ai: bool,
    ) -> MappingSuggestion {
        let mut log = Vec::new();
        self.suggest_and_learn(sample, doc_type, tenant_id, use_ai, &mut log)
    }

    fn suggest_and_learn(
        &self,
        sample: &SourceSample<'_>,
        doc_type: DocType,
        tenant_id: Option<&str>,
        use_ai: bool,
        log: &mut Vec<DecisionStep>,
    ) -> MappingSuggestion {
        let tenant = tenant_id.unwrap_or(ANONYMOUS_TENANT);
        let baseline = self
            .suggester
            .suggest(sample.headers, sample.rows, doc_type, tenant, use_ai);
        log.push(DecisionStep::Suggest {
            provider: baseline.provider,
            confidence: baseline.confidence,
            from_cache: baseline.from_cache,
            mapped: baseline.mappings.len(),
        });
        let Some(tenant_id) = tenant_id else {
            log.push(DecisionStep::LearnSkipped {
                reason: "no tenant".to_string(),
            });
            return baseline;
        };
        match self.learner.apply(tenant_id, sample.headers, &baseline) {
            Ok(improved) => {
                log.push(DecisionStep::Learn {
                    applied: improved.mappings != baseline.mappings,
                    provider: improved.provider,
                });
                improved
            }
            Err(e) => {
                tracing::warn!(tenant_id, error = %e, "mapping statistics unavailable; keeping baseline");
                log.push(DecisionStep::LearnSkipped {
                    reason: e.to_string(),
                });
                baseline
            }
        }
    }
}
