//! Inbound request/response surface. Each command takes a deserializable
//! payload, runs against [`PipelineState`] and returns a serializable response.

use crate::cache::MappingCache;
use crate::config::PipelineConfig;
use crate::db::Db;
use crate::error::{PipelineError, Result};
use crate::models::{CanonicalDocument, MappingFeedback, MappingSuggestion};
use crate::ocr::AzureLayoutClient;
use crate::provider::HttpAssistant;
use crate::services::classifier::{
    retrain as retrain_model, ClassificationFeedback, DocumentClassifier, NaiveBayesModel,
    TextClassification,
};
use crate::services::confidence_gate::{ConfidenceGatingPolicy, GateAction};
use crate::services::ingestion::{IngestReport, IngestRequest, IngestionWorker};
use crate::services::jobs::{spawn_ingest, spawn_promote, JobHandle};
use crate::services::learner::MappingLearner;
use crate::services::mapping_suggester::MappingSuggester;
use crate::services::promotion::{resolve_doc_type, ItemPromotion, PromotionDispatcher};
use crate::services::smart_router::{AnalysisResult, SmartRouter};
use crate::types::{ImportBatch, ImportItem, IngestSummary, ItemStatus, PromotionSummary};
use crate::validators::validate_document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Error payload returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandError {
    pub kind: String,
    pub message: String,
}

impl CommandError {
    fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CommandError {}

impl From<PipelineError> for CommandError {
    fn from(e: PipelineError) -> Self {
        CommandError::new(e.kind(), e.to_string())
    }
}

pub type CommandResult<T> = std::result::Result<T, CommandError>;

/// Everything a command needs, built once from configuration.
pub struct PipelineState {
    pub config: PipelineConfig,
    pub db: Arc<Db>,
    pub cache: Arc<MappingCache>,
    pub classifier: Arc<DocumentClassifier>,
    pub learner: Arc<MappingLearner>,
    pub router: Arc<SmartRouter>,
    pub worker: Arc<IngestionWorker>,
    pub dispatcher: Arc<PromotionDispatcher>,
}

impl PipelineState {
    /// Open the store at `config.db_path` and wire the services.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let db = Db::new(config.db_path.clone())?;
        Self::with_db(config, db)
    }

    /// Same wiring over an in-memory store.
    pub fn in_memory(config: PipelineConfig) -> Result<Self> {
        Self::with_db(config, Db::open_in_memory()?)
    }

    fn with_db(config: PipelineConfig, db: Db) -> Result<Self> {
        let db = Arc::new(db);

        let assistant = match &config.assist {
            Some(assist) => match HttpAssistant::new(assist.clone()) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    tracing::warn!(error = %e, "assistance provider disabled");
                    None
                }
            },
            None => None,
        };

        let model_path = config.model_path();
        let model = if model_path.exists() {
            NaiveBayesModel::load(&model_path).unwrap_or_else(|e| {
                tracing::warn!(path = %model_path.display(), error = %e, "saved model unreadable; using seed model");
                retrain_model(&[])
            })
        } else {
            retrain_model(&[])
        };
        let mut classifier = DocumentClassifier::new().with_model(model);
        if let Some(assistant) = &assistant {
            classifier = classifier.with_assistant(assistant.clone(), config.assist_threshold);
        }
        let classifier = Arc::new(classifier);

        let cache = Arc::new(MappingCache::new(config.cache_ttl));
        let mut suggester = MappingSuggester::new(cache.clone())
            .with_defaults(&config.default_country, &config.default_currency);
        if let Some(assistant) = &assistant {
            suggester = suggester.with_assistant(assistant.clone());
        }

        let learner = Arc::new(MappingLearner::new(db.clone()));
        let mut router = SmartRouter::new(classifier.clone(), Arc::new(suggester), learner.clone())
            .with_policy(ConfidenceGatingPolicy::new(config.gate));
        if let Some(ocr) = &config.ocr {
            router = router.with_ocr(Arc::new(AzureLayoutClient::new(ocr)?));
        }
        let router = Arc::new(router);

        let worker = Arc::new(
            IngestionWorker::new(db.clone(), router.clone())
                .with_batch_size(config.ingest_batch_size)
                .with_defaults(&config.default_country, &config.default_currency),
        );
        let dispatcher = Arc::new(PromotionDispatcher::new(db.clone()));

        tracing::info!(
            db = %config.db_path.display(),
            ocr = config.ocr_status(),
            assist = assistant.is_some(),
            "pipeline ready"
        );
        Ok(Self {
            config,
            db,
            cache,
            classifier,
            learner,
            router,
            worker,
            dispatcher,
        })
    }
}

fn parse_doc_type(name: &str) -> CommandResult<crate::models::DocType> {
    resolve_doc_type(name)
        .ok_or_else(|| CommandError::new("invalid_request", format!("unknown document type '{}'", name)))
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub ocr: &'static str,
    pub assist: bool,
    pub db_path: String,
    pub cached_mappings: usize,
}

pub fn status(state: &PipelineState) -> StatusResponse {
    StatusResponse {
        ocr: state.config.ocr_status(),
        assist: state.config.assist.is_some(),
        db_path: state.config.db_path.display().to_string(),
        cached_mappings: state.cache.len(),
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalyzePayload {
    pub path: PathBuf,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub use_ai: bool,
}

pub fn analyze(state: &PipelineState, payload: AnalyzePayload) -> CommandResult<AnalysisResult> {
    Ok(state
        .router
        .analyze(&payload.path, payload.tenant_id.as_deref(), payload.use_ai)?)
}

#[derive(Debug, Deserialize)]
pub struct ClassifyPayload {
    pub text: String,
    #[serde(default)]
    pub available_parsers: Vec<String>,
}

pub fn classify(state: &PipelineState, payload: ClassifyPayload) -> TextClassification {
    state
        .classifier
        .classify_text(&payload.text, &payload.available_parsers)
}

/// Single-header verdict: was `header → canonical_field` right?
#[derive(Debug, Deserialize)]
pub struct HeaderFeedbackPayload {
    pub tenant_id: String,
    pub doc_type: String,
    pub header: String,
    pub canonical_field: String,
    pub correct: bool,
}

pub fn record_header_feedback(state: &PipelineState, payload: HeaderFeedbackPayload) -> CommandResult<()> {
    let doc_type = parse_doc_type(&payload.doc_type)?;
    if !doc_type.canonical_fields().contains(&payload.canonical_field.as_str()) {
        return Err(CommandError::new(
            "invalid_request",
            format!("'{}' is not a {} field", payload.canonical_field, doc_type),
        ));
    }
    state.learner.record_header_feedback(
        &payload.tenant_id,
        doc_type,
        &payload.header,
        &payload.canonical_field,
        payload.correct,
    )?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub updated: usize,
}

pub fn record_mapping_feedback(state: &PipelineState, payload: MappingFeedback) -> CommandResult<FeedbackResponse> {
    let updated = state.learner.record_feedback(&payload)?;
    Ok(FeedbackResponse { updated })
}

pub fn record_classification_feedback(
    state: &PipelineState,
    payload: ClassificationFeedback,
) -> CommandResult<()> {
    state.db.record_classification_feedback(&payload)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct IngestPayload {
    pub tenant_id: String,
    pub path: PathBuf,
    pub doc_type: Option<String>,
    pub country: Option<String>,
    pub currency: Option<String>,
    /// Mapping confirmed by the user after `analyze`.
    pub mapping: Option<MappingSuggestion>,
    #[serde(default)]
    pub use_ai: bool,
}

fn ingest_request(payload: IngestPayload) -> CommandResult<IngestRequest> {
    let doc_type = payload.doc_type.as_deref().map(parse_doc_type).transpose()?;
    Ok(IngestRequest {
        tenant_id: payload.tenant_id,
        path: payload.path,
        doc_type,
        country: payload.country.map(|c| c.to_uppercase()),
        currency: payload.currency.map(|c| c.to_uppercase()),
        mapping: payload.mapping,
        use_ai: payload.use_ai,
    })
}

/// Ingest on the calling thread.
pub fn ingest(state: &PipelineState, payload: IngestPayload) -> CommandResult<IngestReport> {
    let request = ingest_request(payload)?;
    Ok(state.worker.ingest(&request)?)
}

/// Ingest as a background job.
pub fn start_ingest(state: &PipelineState, payload: IngestPayload) -> CommandResult<JobHandle<IngestSummary>> {
    let request = ingest_request(payload)?;
    Ok(spawn_ingest(state.worker.clone(), request)?)
}

#[derive(Debug, Deserialize)]
pub struct PromotePayload {
    pub tenant_id: String,
    pub batch_id: i64,
    /// The user reviewed a batch whose gate asked for confirmation.
    #[serde(default)]
    pub confirmed: bool,
}

/// Gate action recorded by ingestion; batches without one need confirmation.
fn recorded_gate(batch: &ImportBatch) -> GateAction {
    batch
        .summary
        .as_ref()
        .and_then(|s| s.get("gate"))
        .and_then(|g| g.get("action"))
        .and_then(|a| serde_json::from_value(a.clone()).ok())
        .unwrap_or(GateAction::Confirm)
}

fn check_gate(state: &PipelineState, payload: &PromotePayload) -> CommandResult<()> {
    let batch = state.db.get_batch(&payload.tenant_id, payload.batch_id)?;
    match recorded_gate(&batch) {
        GateAction::AutoApprove => Ok(()),
        GateAction::Confirm if payload.confirmed => Ok(()),
        GateAction::Confirm => Err(CommandError::new(
            "confirmation_required",
            format!("batch {} needs confirmation before promotion", payload.batch_id),
        )),
        GateAction::Block => Err(CommandError::new(
            "gate_blocked",
            format!("batch {} confidence is too low to promote", payload.batch_id),
        )),
    }
}

pub fn promote(state: &PipelineState, payload: PromotePayload) -> CommandResult<PromotionSummary> {
    check_gate(state, &payload)?;
    Ok(state
        .dispatcher
        .promote_batch(&payload.tenant_id, payload.batch_id)?)
}

pub fn start_promote(state: &PipelineState, payload: PromotePayload) -> CommandResult<JobHandle<PromotionSummary>> {
    check_gate(state, &payload)?;
    Ok(spawn_promote(
        state.dispatcher.clone(),
        payload.tenant_id,
        payload.batch_id,
    )?)
}

#[derive(Debug, Deserialize)]
pub struct ItemPayload {
    pub tenant_id: String,
    pub item_id: i64,
}

pub fn promote_item(state: &PipelineState, payload: ItemPayload) -> CommandResult<ItemPromotion> {
    Ok(state
        .dispatcher
        .promote_item(&payload.tenant_id, payload.item_id)?)
}

#[derive(Debug, Deserialize)]
pub struct BatchPayload {
    pub tenant_id: String,
    pub batch_id: i64,
}

pub fn get_batch(state: &PipelineState, payload: BatchPayload) -> CommandResult<ImportBatch> {
    Ok(state.db.get_batch(&payload.tenant_id, payload.batch_id)?)
}

#[derive(Debug, Deserialize)]
pub struct ListItemsPayload {
    pub tenant_id: String,
    pub batch_id: i64,
    pub status: Option<String>,
}

pub fn list_items(state: &PipelineState, payload: ListItemsPayload) -> CommandResult<Vec<ImportItem>> {
    let status = match payload.status.as_deref() {
        Some(s) => Some(ItemStatus::parse(&s.to_uppercase()).ok_or_else(|| {
            CommandError::new("invalid_request", format!("unknown item status '{}'", s))
        })?),
        None => None,
    };
    Ok(state
        .db
        .list_items(&payload.tenant_id, payload.batch_id, status)?)
}

#[derive(Debug, Deserialize)]
pub struct UpdateItemPayload {
    pub tenant_id: String,
    pub item_id: i64,
    pub canonical_doc: Value,
}

/// Replace an item's canonical document and re-validate it.
pub fn update_item(state: &PipelineState, payload: UpdateItemPayload) -> CommandResult<ImportItem> {
    let doc = CanonicalDocument::new(payload.canonical_doc);
    let report = validate_document(&doc);
    let status = if report.is_valid() {
        ItemStatus::Ok
    } else {
        ItemStatus::ErrorValidation
    };
    state
        .db
        .update_item_canonical(&payload.tenant_id, payload.item_id, &doc, status)?;
    if !report.is_valid() {
        state.db.update_item_status(
            &payload.tenant_id,
            payload.item_id,
            status,
            &report.to_item_errors(),
        )?;
    }
    Ok(state.db.get_item(&payload.tenant_id, payload.item_id)?)
}

#[derive(Debug, Serialize)]
pub struct RetrainResponse {
    pub feedback_examples: usize,
    pub model_path: String,
}

/// Offline retraining: seed corpus plus every classification verdict.
pub fn retrain(state: &PipelineState) -> CommandResult<RetrainResponse> {
    let feedback = state.db.classification_feedback()?;
    let model = retrain_model(&feedback);
    let model_path = state.config.model_path();
    model.save(&model_path)?;
    state.classifier.replace_model(model);
    tracing::info!(examples = feedback.len(), path = %model_path.display(), "classifier retrained");
    Ok(RetrainResponse {
        feedback_examples: feedback.len(),
        model_path: model_path.display().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeedbackType, FieldFeedback};
    use serde_json::json;

    fn state(dir: &tempfile::TempDir) -> PipelineState {
        let config = PipelineConfig {
            db_path: dir.path().join("pipeline.db"),
            ..PipelineConfig::default()
        };
        PipelineState::from_config(config).unwrap()
    }

    fn products(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("productos.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn ingest_products(state: &PipelineState, path: PathBuf) -> IngestReport {
        ingest(
            state,
            IngestPayload {
                tenant_id: "t1".to_string(),
                path,
                doc_type: Some("productos".to_string()),
                country: None,
                currency: None,
                mapping: None,
                use_ai: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn blocked_batch_is_not_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let report = ingest_products(&state, products(&dir, "SKU,Nombre,Precio\nA-1,,x\nA-2,,y\n"));
        assert_eq!(report.gate.action, GateAction::Block);

        let err = promote(
            &state,
            PromotePayload {
                tenant_id: "t1".to_string(),
                batch_id: report.batch_id,
                confirmed: true,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, "gate_blocked");
        assert_eq!(state.db.count_destination_rows("products", "t1").unwrap(), 0);
    }

    #[test]
    fn confirmation_unlocks_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        // Two of six headers mapped: every row validates but the gate asks.
        let report = ingest_products(
            &state,
            products(&dir, "Nombre,Precio,Xq1,Xq2,Xq3,Xq4\nTornillo,0.25,q,q,q,q\nTuerca,0.15,q,q,q,q\n"),
        );
        assert_eq!(report.gate.action, GateAction::Confirm);
        let payload = |confirmed| PromotePayload {
            tenant_id: "t1".to_string(),
            batch_id: report.batch_id,
            confirmed,
        };
        let err = promote(&state, payload(false)).unwrap_err();
        assert_eq!(err.kind, "confirmation_required");
        let summary = promote(&state, payload(true)).unwrap();
        assert_eq!(summary.promoted, 2);
    }

    #[test]
    fn corrected_item_becomes_promotable() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let report = ingest_products(&state, products(&dir, "SKU,Nombre,Precio\nA-1,,0.25\n"));
        let item = &list_items(
            &state,
            ListItemsPayload {
                tenant_id: "t1".to_string(),
                batch_id: report.batch_id,
                status: Some("error_validation".to_string()),
            },
        )
        .unwrap()[0];

        let updated = update_item(
            &state,
            UpdateItemPayload {
                tenant_id: "t1".to_string(),
                item_id: item.id,
                canonical_doc: json!({
                    "doc_type": "product", "country": "EC", "currency": "USD",
                    "product": {"sku": "A-1", "name": "Tornillo", "price": 0.25}
                }),
            },
        )
        .unwrap();
        assert_eq!(updated.status, ItemStatus::Ok);

        let outcome = promote_item(
            &state,
            ItemPayload {
                tenant_id: "t1".to_string(),
                item_id: item.id,
            },
        )
        .unwrap();
        assert!(matches!(outcome, ItemPromotion::Promoted(_)));
    }

    #[test]
    fn non_finite_price_stays_out_of_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let report = ingest_products(
            &state,
            products(&dir, "SKU,Nombre,Precio\nA-1,Tornillo,NaN\nA-2,Tuerca,0.15\nA-3,Arandela,0.05\n"),
        );
        assert_eq!(report.valid, 2);
        let counts = state.db.count_items_by_status("t1", report.batch_id).unwrap();
        assert_eq!(counts.get("ERROR_VALIDATION"), Some(&1));

        let bad = state
            .db
            .list_items("t1", report.batch_id, Some(ItemStatus::ErrorValidation))
            .unwrap();
        let updated = update_item(
            &state,
            UpdateItemPayload {
                tenant_id: "t1".to_string(),
                item_id: bad[0].id,
                canonical_doc: json!({
                    "doc_type": "product", "country": "ec", "currency": "usd",
                    "product": {"sku": "A-1", "name": "Tornillo", "price": "inf"}
                }),
            },
        )
        .unwrap();
        assert_eq!(updated.status, ItemStatus::ErrorValidation);
        assert!(updated.errors.iter().any(|e| e.message == "product.price: must be numeric"));
        assert!(!updated.errors.iter().any(|e| e.message.starts_with("country") || e.message.starts_with("currency")));
    }

    #[test]
    fn background_promotion_reports_its_summary() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let report = ingest_products(
            &state,
            products(&dir, "SKU,Nombre,Precio\nA-1,Tornillo,0.25\nA-2,Tuerca,0.15\nA-3,Arandela,0.05\n"),
        );
        assert_eq!(report.gate.action, GateAction::AutoApprove);

        let job = start_promote(
            &state,
            PromotePayload {
                tenant_id: "t1".to_string(),
                batch_id: report.batch_id,
                confirmed: false,
            },
        )
        .unwrap();
        assert_eq!(job.batch_id(), report.batch_id);
        let summary = job.join().unwrap();
        assert_eq!(summary.promoted, 3);
        assert_eq!(state.db.count_destination_rows("products", "t1").unwrap(), 3);
    }

    #[test]
    fn mapping_feedback_counts_observations() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let response = record_mapping_feedback(
            &state,
            MappingFeedback {
                tenant_id: "t1".to_string(),
                doc_type: crate::models::DocType::Product,
                headers: vec!["Ref".to_string(), "Costo Unit.".to_string(), "Notas".to_string()],
                fields: vec![
                    FieldFeedback {
                        header: "Ref".to_string(),
                        suggested: Some("product.sku".to_string()),
                        corrected: None,
                    },
                    FieldFeedback {
                        header: "Costo Unit.".to_string(),
                        suggested: Some("product.cost".to_string()),
                        corrected: Some("product.price".to_string()),
                    },
                    FieldFeedback {
                        header: "Notas".to_string(),
                        suggested: None,
                        corrected: None,
                    },
                ],
                feedback_type: FeedbackType::Corrected,
            },
        )
        .unwrap();
        assert_eq!(response.updated, 2);
    }

    #[test]
    fn unknown_inputs_are_request_errors() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let err = record_header_feedback(
            &state,
            HeaderFeedbackPayload {
                tenant_id: "t1".to_string(),
                doc_type: "nomina".to_string(),
                header: "Sueldo".to_string(),
                canonical_field: "expense.amount".to_string(),
                correct: true,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, "invalid_request");

        let err = list_items(
            &state,
            ListItemsPayload {
                tenant_id: "t1".to_string(),
                batch_id: 1,
                status: Some("DONE".to_string()),
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, "invalid_request");
    }

    #[test]
    fn retrain_saves_a_model_next_to_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        record_classification_feedback(
            &state,
            ClassificationFeedback {
                tenant_id: "t1".to_string(),
                headers: vec!["Partida".to_string(), "Importe".to_string()],
                predicted: None,
                actual: crate::models::DocType::Expense,
            },
        )
        .unwrap();
        let response = retrain(&state).unwrap();
        assert_eq!(response.feedback_examples, 1);
        assert!(state.config.model_path().exists());
        assert!(NaiveBayesModel::load(&state.config.model_path()).is_ok());
    }

    #[test]
    fn classify_text_picks_from_offered_parsers() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let result = classify(
            &state,
            ClassifyPayload {
                text: "FACTURA 001-001-000000123 RUC 1790012345001 Subtotal IVA Total".to_string(),
                available_parsers: vec!["invoice_parser".to_string(), "bank_parser".to_string()],
            },
        );
        assert!(["invoice_parser", "bank_parser"].contains(&result.suggested_parser.as_str()));
    }
}
