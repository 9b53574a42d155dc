//! Header/document classifier: keyword heuristics, an optional naive Bayes
//! model and optional external assistance.

use crate::error::{PipelineError, Result};
use crate::models::{doc_type_label, DocType};
use crate::provider::AssistedClassifier;
use crate::services::mapping_dictionary::contains_word_sequence;
use crate::services::normalize::{header_tokens, normalize_header};
use crate::services::promotion::resolve_doc_type;
use crate::types::RawRow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

const MAX_HEURISTIC_CONFIDENCE: f64 = 0.95;
/// Heuristic confidence ceiling when the best type has fewer than 2 keyword hits.
const THIN_EVIDENCE_CAP: f64 = 0.5;
const NO_MATCH_CONFIDENCE: f64 = 0.1;
const FALLBACK_CONFIDENCE: f64 = 0.3;
const DEFAULT_ASSIST_THRESHOLD: f64 = 0.6;

/// Per-type header keywords, in normalized form.
const KEYWORDS: &[(DocType, &[&str])] = &[
    (
        DocType::Invoice,
        &[
            "factura", "invoice", "folio", "serie", "ruc", "nit", "rfc", "cif", "cliente",
            "customer", "subtotal", "iva", "vat", "base_imponible", "emision", "vencimiento",
            "due_date", "autorizacion",
        ],
    ),
    (
        DocType::Expense,
        &[
            "gasto", "expense", "categoria", "category", "concepto", "reembolso",
            "centro_costo", "forma_pago", "payment_method", "empleado", "justificante",
        ],
    ),
    (
        DocType::ExpenseReceipt,
        &[
            "ticket", "recibo", "receipt", "comercio", "merchant", "establecimiento", "propina",
            "tip", "caja",
        ],
    ),
    (
        DocType::BankTx,
        &[
            "banco", "bank", "saldo", "balance", "debito", "credito", "debit", "credit", "cargo",
            "abono", "movimiento", "referencia", "reference", "fecha_valor", "value_date",
            "transaccion", "cuenta", "account", "iban",
        ],
    ),
    (
        DocType::Product,
        &[
            "sku", "producto", "product", "precio", "price", "stock", "existencia", "inventario",
            "costo", "cost", "unidad", "unit", "barcode", "ean", "codigo_barras", "marca",
        ],
    ),
];

fn keywords_for(doc_type: DocType) -> &'static [&'static str] {
    KEYWORDS
        .iter()
        .find(|(d, _)| *d == doc_type)
        .map(|(_, k)| *k)
        .unwrap_or(&[])
}

/// How the final classification was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Heuristic,
    Model,
    HeuristicOverride,
    Assisted,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub suggested_parser: String,
    /// `None` when the document type could not be determined ("generic").
    pub doc_type: Option<DocType>,
    pub confidence: f64,
    /// Doc type name → probability.
    pub probabilities: BTreeMap<String, f64>,
    pub method: ClassificationMethod,
}

impl ClassificationResult {
    pub fn doc_type_label(&self) -> &'static str {
        doc_type_label(self.doc_type)
    }
}

/// Result of classifying free text (OCR output) against a parser list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextClassification {
    pub suggested_parser: String,
    pub confidence: f64,
    /// Parser name → probability.
    pub probabilities: BTreeMap<String, f64>,
    pub reasoning: String,
}

/// Human verdict on a classification, consumed only by retraining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationFeedback {
    pub tenant_id: String,
    pub headers: Vec<String>,
    pub predicted: Option<String>,
    pub actual: DocType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicScore {
    pub doc_type: Option<DocType>,
    pub confidence: f64,
    pub scores: BTreeMap<DocType, usize>,
    pub matched: Vec<String>,
}

fn keyword_hits(normalized: &str, keyword: &str) -> bool {
    if normalized == keyword {
        return true;
    }
    let tokens: Vec<&str> = normalized.split('_').collect();
    contains_word_sequence(&tokens, keyword) || (keyword.len() >= 5 && normalized.contains(keyword))
}

/// Keyword scoring over normalized headers. Each keyword counts at most once
/// per header.
pub fn heuristic_scores(headers: &[String]) -> HeuristicScore {
    let normalized: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
    let mut scores = BTreeMap::new();
    let mut matched = Vec::new();
    for doc_type in DocType::ALL {
        let mut score = 0;
        for header in normalized.iter().filter(|h| !h.is_empty()) {
            for keyword in keywords_for(doc_type) {
                if keyword_hits(header, keyword) {
                    score += 1;
                    matched.push(format!("{}:{}", doc_type, keyword));
                }
            }
        }
        scores.insert(doc_type, score);
    }
    let total: usize = scores.values().sum();
    // First type in declaration order wins ties.
    let best = DocType::ALL
        .into_iter()
        .map(|d| (d, scores[&d]))
        .fold(None, |best: Option<(DocType, usize)>, (d, s)| match best {
            Some((_, bs)) if bs >= s => best,
            _ => Some((d, s)),
        });
    match best {
        Some((doc_type, max_score)) if max_score > 0 => {
            let mut confidence =
                (max_score as f64 / (total as f64 * 0.6)).min(MAX_HEURISTIC_CONFIDENCE);
            if max_score < 2 {
                confidence = confidence.min(THIN_EVIDENCE_CAP);
            }
            HeuristicScore {
                doc_type: Some(doc_type),
                confidence,
                scores,
                matched,
            }
        }
        _ => HeuristicScore {
            doc_type: None,
            confidence: NO_MATCH_CONFIDENCE,
            scores,
            matched,
        },
    }
}

/// Multinomial naive Bayes over header tokens, Laplace smoothed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NaiveBayesModel {
    doc_counts: BTreeMap<DocType, u64>,
    token_counts: BTreeMap<DocType, HashMap<String, u64>>,
    token_totals: BTreeMap<DocType, u64>,
    vocabulary: HashSet<String>,
}

impl NaiveBayesModel {
    pub fn train(examples: &[(Vec<String>, DocType)]) -> Self {
        let mut model = Self::default();
        for (headers, doc_type) in examples {
            *model.doc_counts.entry(*doc_type).or_default() += 1;
            let counts = model.token_counts.entry(*doc_type).or_default();
            for token in headers.iter().flat_map(|h| header_tokens(h)) {
                *counts.entry(token.clone()).or_default() += 1;
                *model.token_totals.entry(*doc_type).or_default() += 1;
                model.vocabulary.insert(token);
            }
        }
        model
    }

    pub fn is_empty(&self) -> bool {
        self.doc_counts.is_empty()
    }

    /// Posterior over doc types, or `None` when no header token is in the vocabulary.
    pub fn predict(&self, headers: &[String]) -> Option<BTreeMap<DocType, f64>> {
        let tokens: Vec<String> = headers
            .iter()
            .flat_map(|h| header_tokens(h))
            .filter(|t| self.vocabulary.contains(t))
            .collect();
        if tokens.is_empty() || self.is_empty() {
            return None;
        }
        let total_docs: u64 = self.doc_counts.values().sum();
        let vocab = self.vocabulary.len() as f64;
        let log_posteriors: Vec<(DocType, f64)> = self
            .doc_counts
            .iter()
            .map(|(doc_type, count)| {
                let prior = (*count as f64 / total_docs as f64).ln();
                let counts = self.token_counts.get(doc_type);
                let denom = *self.token_totals.get(doc_type).unwrap_or(&0) as f64 + vocab;
                let likelihood: f64 = tokens
                    .iter()
                    .map(|t| {
                        let c = counts.and_then(|m| m.get(t)).copied().unwrap_or(0) as f64;
                        ((c + 1.0) / denom).ln()
                    })
                    .sum();
                (*doc_type, prior + likelihood)
            })
            .collect();
        let max = log_posteriors
            .iter()
            .map(|(_, lp)| *lp)
            .fold(f64::NEG_INFINITY, f64::max);
        let norm: f64 = log_posteriors.iter().map(|(_, lp)| (lp - max).exp()).sum();
        Some(
            log_posteriors
                .into_iter()
                .map(|(d, lp)| (d, (lp - max).exp() / norm))
                .collect(),
        )
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Fixed seed corpus the model is always trained on.
const SEED_CORPUS: &[(DocType, &[&str])] = &[
    (DocType::Invoice, &["Número de factura", "Fecha de emisión", "RUC", "Cliente", "Subtotal", "IVA", "Total"]),
    (DocType::Invoice, &["Invoice No", "Invoice Date", "Customer", "VAT", "Net Amount", "Total"]),
    (DocType::Invoice, &["Folio", "Serie", "RFC Emisor", "Razón social", "Subtotal", "IVA", "Total"]),
    (DocType::Invoice, &["Nº Factura", "Proveedor", "NIF", "Base imponible", "Cuota IVA", "Total factura"]),
    (DocType::Expense, &["Fecha", "Concepto", "Categoría", "Importe", "Forma de pago"]),
    (DocType::Expense, &["Date", "Description", "Category", "Amount", "Payment method"]),
    (DocType::Expense, &["Fecha gasto", "Descripción", "Monto", "Centro de costo", "Empleado"]),
    (DocType::ExpenseReceipt, &["Ticket", "Comercio", "Fecha", "Total", "Propina"]),
    (DocType::ExpenseReceipt, &["Receipt number", "Merchant", "Date", "Tip", "Total"]),
    (DocType::ExpenseReceipt, &["Nº recibo", "Establecimiento", "Fecha", "Importe total"]),
    (DocType::BankTx, &["Fecha", "Concepto", "Cargo", "Abono", "Saldo"]),
    (DocType::BankTx, &["Value date", "Description", "Debit", "Credit", "Balance"]),
    (DocType::BankTx, &["Fecha valor", "Referencia", "Importe", "Saldo", "Cuenta"]),
    (DocType::BankTx, &["Fecha operación", "Movimiento", "Débito", "Crédito", "Saldo disponible"]),
    (DocType::Product, &["SKU", "Nombre", "Precio", "Stock", "Categoría"]),
    (DocType::Product, &["Code", "Product", "Price", "Cost", "Unit"]),
    (DocType::Product, &["Código", "Producto", "Precio venta", "Existencias", "Código de barras"]),
];

pub fn seed_corpus() -> Vec<(Vec<String>, DocType)> {
    SEED_CORPUS
        .iter()
        .map(|(d, h)| (h.iter().map(|s| s.to_string()).collect(), *d))
        .collect()
}

/// Offline retraining: seed corpus plus accumulated classification feedback.
pub fn retrain(feedback: &[ClassificationFeedback]) -> NaiveBayesModel {
    let mut examples = seed_corpus();
    examples.extend(feedback.iter().map(|f| (f.headers.clone(), f.actual)));
    NaiveBayesModel::train(&examples)
}

/// Coarse source family of a file extension.
fn extension_family(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_lowercase().as_str() {
        "csv" | "tsv" | "txt" => "delimited",
        "xml" => "xml",
        "pdf" | "png" | "jpg" | "jpeg" | "tif" | "tiff" => "scan",
        _ => "spreadsheet",
    }
}

/// `(doc_type, family) → parser`; `None` doc type is generic.
const PARSERS: &[(Option<DocType>, &str, &str)] = &[
    (Some(DocType::Invoice), "xml", "xml_invoice"),
    (Some(DocType::Invoice), "scan", "ocr_invoice"),
    (Some(DocType::Invoice), "delimited", "csv_invoice"),
    (Some(DocType::Expense), "delimited", "csv_expense"),
    (Some(DocType::Expense), "scan", "ocr_receipt"),
    (Some(DocType::ExpenseReceipt), "scan", "ocr_receipt"),
    (Some(DocType::ExpenseReceipt), "spreadsheet", "spreadsheet_expense_receipt"),
    (Some(DocType::BankTx), "delimited", "csv_bank"),
    (Some(DocType::BankTx), "scan", "ocr_bank_statement"),
    (Some(DocType::Product), "delimited", "csv_products"),
    (None, "delimited", "generic_csv"),
    (None, "xml", "generic_xml"),
    (None, "scan", "ocr_document"),
];

const DEFAULT_PARSERS: &[(Option<DocType>, &str)] = &[
    (Some(DocType::Invoice), "spreadsheet_invoice"),
    (Some(DocType::Expense), "spreadsheet_expense"),
    (Some(DocType::ExpenseReceipt), "ocr_receipt"),
    (Some(DocType::BankTx), "spreadsheet_bank"),
    (Some(DocType::Product), "spreadsheet_products"),
    (None, "generic_spreadsheet"),
];

pub fn parser_for(doc_type: Option<DocType>, ext: &str) -> &'static str {
    let family = extension_family(ext);
    PARSERS
        .iter()
        .find(|(d, f, _)| *d == doc_type && *f == family)
        .map(|(_, _, p)| *p)
        .or_else(|| {
            DEFAULT_PARSERS
                .iter()
                .find(|(d, _)| *d == doc_type)
                .map(|(_, p)| *p)
        })
        .unwrap_or("generic_spreadsheet")
}

/// Every parser the classifier may suggest, sorted and deduplicated.
pub fn available_parsers() -> Vec<String> {
    let mut all: Vec<String> = PARSERS
        .iter()
        .map(|(_, _, p)| p.to_string())
        .chain(DEFAULT_PARSERS.iter().map(|(_, p)| p.to_string()))
        .collect();
    all.sort();
    all.dedup();
    all
}

/// Doc type a parser name is meant for, if it names one.
fn parser_doc_type(parser: &str) -> Option<DocType> {
    let p = parser.to_lowercase();
    if p.contains("expense_receipt") || p.contains("receipt") || p.contains("ticket") {
        Some(DocType::ExpenseReceipt)
    } else if p.contains("invoice") || p.contains("factura") {
        Some(DocType::Invoice)
    } else if p.contains("expense") || p.contains("gasto") {
        Some(DocType::Expense)
    } else if p.contains("bank") {
        Some(DocType::BankTx)
    } else if p.contains("product") {
        Some(DocType::Product)
    } else {
        None
    }
}

pub struct DocumentClassifier {
    model: RwLock<Option<Arc<NaiveBayesModel>>>,
    assistant: Option<Arc<dyn AssistedClassifier>>,
    assist_threshold: f64,
}

impl Default for DocumentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentClassifier {
    /// Heuristics only.
    pub fn new() -> Self {
        Self {
            model: RwLock::new(None),
            assistant: None,
            assist_threshold: DEFAULT_ASSIST_THRESHOLD,
        }
    }

    pub fn with_model(self, model: NaiveBayesModel) -> Self {
        if let Ok(mut slot) = self.model.write() {
            *slot = Some(Arc::new(model));
        }
        self
    }

    pub fn with_assistant(mut self, assistant: Arc<dyn AssistedClassifier>, threshold: f64) -> Self {
        self.assistant = Some(assistant);
        self.assist_threshold = threshold;
        self
    }

    /// Swap in a retrained model; in-flight classifications keep the old snapshot.
    pub fn replace_model(&self, model: NaiveBayesModel) {
        match self.model.write() {
            Ok(mut slot) => *slot = Some(Arc::new(model)),
            Err(_) => tracing::error!("classifier model lock poisoned; keeping previous model"),
        }
    }

    fn model_snapshot(&self) -> Result<Option<Arc<NaiveBayesModel>>> {
        self.model
            .read()
            .map(|m| m.clone())
            .map_err(|_| PipelineError::Internal("classifier model lock poisoned".to_string()))
    }

    /// Never fails: internal errors degrade to a generic result.
    pub fn classify(
        &self,
        headers: &[String],
        sample_rows: Option<&[RawRow]>,
        file_extension: &str,
    ) -> ClassificationResult {
        match self.try_classify(headers, sample_rows.unwrap_or(&[]), file_extension) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "classification failed; using generic fallback");
                ClassificationResult {
                    suggested_parser: parser_for(None, file_extension).to_string(),
                    doc_type: None,
                    confidence: FALLBACK_CONFIDENCE,
                    probabilities: BTreeMap::new(),
                    method: ClassificationMethod::Fallback,
                }
            }
        }
    }

    fn try_classify(
        &self,
        headers: &[String],
        sample_rows: &[RawRow],
        ext: &str,
    ) -> Result<ClassificationResult> {
        let mut heuristic = heuristic_scores(headers);
        if heuristic.doc_type.is_none() && !sample_rows.is_empty() {
            // Headerless sheets: the first rows may carry the labels.
            let cells: Vec<String> = sample_rows
                .iter()
                .flat_map(|row| row.values())
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let from_cells = heuristic_scores(&cells);
            if from_cells.doc_type.is_some() {
                heuristic = HeuristicScore {
                    confidence: from_cells.confidence.min(THIN_EVIDENCE_CAP),
                    ..from_cells
                };
            }
        }

        let total: usize = heuristic.scores.values().sum();
        let heuristic_probs: BTreeMap<String, f64> = heuristic
            .scores
            .iter()
            .map(|(d, s)| {
                let p = if total == 0 { 0.0 } else { *s as f64 / total as f64 };
                (d.as_str().to_string(), p)
            })
            .collect();

        let mut result = ClassificationResult {
            suggested_parser: String::new(),
            doc_type: heuristic.doc_type,
            confidence: heuristic.confidence,
            probabilities: heuristic_probs,
            method: ClassificationMethod::Heuristic,
        };

        if let Some(model) = self.model_snapshot()? {
            if let Some(posterior) = model.predict(headers) {
                let (model_type, model_conf) = posterior
                    .iter()
                    .fold((None, 0.0), |(bd, bc), (d, p)| {
                        if *p > bc {
                            (Some(*d), *p)
                        } else {
                            (bd, bc)
                        }
                    });
                // Ties go to the heuristic.
                if heuristic.confidence >= model_conf {
                    result.method = ClassificationMethod::HeuristicOverride;
                } else {
                    result.doc_type = model_type;
                    result.confidence = model_conf;
                    result.probabilities = posterior
                        .iter()
                        .map(|(d, p)| (d.as_str().to_string(), *p))
                        .collect();
                    result.method = ClassificationMethod::Model;
                }
            }
        }

        if result.confidence < self.assist_threshold {
            if let Some(assistant) = &self.assistant {
                match assistant.classify_headers(headers, sample_rows) {
                    Ok(assisted) => match resolve_doc_type(&assisted.doc_type) {
                        Some(doc_type) if assisted.confidence > result.confidence => {
                            result.doc_type = Some(doc_type);
                            result.confidence = assisted.confidence;
                            result.method = ClassificationMethod::Assisted;
                        }
                        _ => tracing::debug!(
                            doc_type = %assisted.doc_type,
                            confidence = assisted.confidence,
                            "assisted classification not better; keeping local result"
                        ),
                    },
                    Err(e) => tracing::warn!(error = %e, "assisted classification unavailable"),
                }
            }
        }

        result.suggested_parser = parser_for(result.doc_type, ext).to_string();
        tracing::debug!(
            doc_type = result.doc_type_label(),
            confidence = result.confidence,
            method = ?result.method,
            "classified headers"
        );
        Ok(result)
    }

    /// Classify free text (e.g. OCR output) and pick from the caller's parsers.
    pub fn classify_text(&self, text: &str, available: &[String]) -> TextClassification {
        let parsers: Vec<String> = if available.is_empty() {
            available_parsers()
        } else {
            available.to_vec()
        };
        let normalized = normalize_header(text);
        let tokens: Vec<&str> = normalized.split('_').collect();

        let mut scores: BTreeMap<DocType, usize> = BTreeMap::new();
        let mut matched: Vec<&str> = Vec::new();
        for doc_type in DocType::ALL {
            let hits: Vec<&str> = keywords_for(doc_type)
                .iter()
                .copied()
                .filter(|k| contains_word_sequence(&tokens, k))
                .collect();
            matched.extend(hits.iter().copied());
            scores.insert(doc_type, hits.len());
        }
        let total: usize = scores.values().sum();

        let mut probabilities = BTreeMap::new();
        for parser in &parsers {
            let p = match parser_doc_type(parser) {
                Some(d) if total > 0 => scores[&d] as f64 / total as f64,
                _ => 0.0,
            };
            probabilities.insert(parser.clone(), p);
        }

        let best = probabilities
            .iter()
            .fold(None, |best: Option<(&String, f64)>, (name, p)| match best {
                Some((_, bp)) if bp >= *p => best,
                _ => Some((name, *p)),
            });

        match best {
            Some((parser, _)) if total > 0 && probabilities[parser] > 0.0 => {
                let doc_type = parser_doc_type(parser);
                let max_score = doc_type.map(|d| scores[&d]).unwrap_or(0);
                let mut confidence =
                    (max_score as f64 / (total as f64 * 0.6)).min(MAX_HEURISTIC_CONFIDENCE);
                if max_score < 2 {
                    confidence = confidence.min(THIN_EVIDENCE_CAP);
                }
                TextClassification {
                    suggested_parser: parser.clone(),
                    confidence,
                    reasoning: format!(
                        "{} matched {} keyword(s): {}",
                        doc_type_label(doc_type),
                        max_score,
                        matched.join(", ")
                    ),
                    probabilities,
                }
            }
            _ => TextClassification {
                suggested_parser: parsers
                    .iter()
                    .find(|p| parser_doc_type(p).is_none())
                    .or_else(|| parsers.first())
                    .cloned()
                    .unwrap_or_else(|| "generic_spreadsheet".to_string()),
                confidence: NO_MATCH_CONFIDENCE,
                probabilities,
                reasoning: "no document keywords found".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AssistedClassification;

    fn h(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn invoice_headers_classify_confidently() {
        let classifier = DocumentClassifier::new();
        let r = classifier.classify(
            &h(&["Número Factura", "RUC Cliente", "Subtotal", "IVA", "Total"]),
            None,
            "xlsx",
        );
        assert_eq!(r.doc_type, Some(DocType::Invoice));
        assert!(r.confidence > 0.8);
        assert_eq!(r.method, ClassificationMethod::Heuristic);
        assert_eq!(r.suggested_parser, "spreadsheet_invoice");
    }

    #[test]
    fn thin_evidence_never_exceeds_half() {
        for headers in [
            h(&["Saldo"]),
            h(&["SKU", "Nombre", "Observaciones"]),
            h(&["Ticket", "Fecha"]),
        ] {
            let score = heuristic_scores(&headers);
            let max = score.scores.values().copied().max().unwrap_or(0);
            assert!(max < 2);
            assert!(score.confidence <= 0.5, "{:?}", headers);
        }
    }

    #[test]
    fn no_matches_is_generic() {
        let r = DocumentClassifier::new().classify(&h(&["foo", "bar"]), None, "csv");
        assert_eq!(r.doc_type, None);
        assert!((r.confidence - 0.1).abs() < f64::EPSILON);
        assert_eq!(r.doc_type_label(), "generic");
        assert_eq!(r.suggested_parser, "generic_csv");
    }

    #[test]
    fn sample_rows_rescue_headerless_sheets() {
        let mut row = RawRow::new();
        row.insert("column_1".into(), "Saldo".into());
        row.insert("column_2".into(), "Cargo".into());
        let rows = vec![row];
        let r = DocumentClassifier::new().classify(&h(&["column_1", "column_2"]), Some(&rows), "xlsx");
        assert_eq!(r.doc_type, Some(DocType::BankTx));
        assert!(r.confidence <= 0.5);
    }

    #[test]
    fn model_used_when_more_confident_than_heuristic() {
        let classifier = DocumentClassifier::new().with_model(retrain(&[]));
        // No keyword hits, but tokens are in the seed vocabulary.
        let r = classifier.classify(&h(&["Nombre", "Existencias", "Código"]), None, "xlsx");
        assert_eq!(r.method, ClassificationMethod::Model);
        assert_eq!(r.doc_type, Some(DocType::Product));
    }

    #[test]
    fn heuristic_overrides_weaker_model() {
        let classifier = DocumentClassifier::new().with_model(retrain(&[]));
        let r = classifier.classify(
            &h(&["Fecha valor", "Referencia", "Cargo", "Abono", "Saldo"]),
            None,
            "csv",
        );
        assert_eq!(r.doc_type, Some(DocType::BankTx));
        assert_eq!(r.suggested_parser, "csv_bank");
        assert!(matches!(
            r.method,
            ClassificationMethod::HeuristicOverride | ClassificationMethod::Model
        ));
    }

    #[test]
    fn replace_model_swaps_snapshot() {
        let classifier = DocumentClassifier::new();
        let headers = h(&["Zorglub", "Quux"]);
        assert_eq!(classifier.classify(&headers, None, "xlsx").doc_type, None);
        let feedback = vec![ClassificationFeedback {
            tenant_id: "t1".into(),
            headers: headers.clone(),
            predicted: None,
            actual: DocType::Expense,
        }];
        classifier.replace_model(retrain(&feedback));
        let r = classifier.classify(&headers, None, "xlsx");
        assert_eq!(r.doc_type, Some(DocType::Expense));
        assert_eq!(r.method, ClassificationMethod::Model);
    }

    struct FailingAssistant;
    impl AssistedClassifier for FailingAssistant {
        fn classify_headers(&self, _: &[String], _: &[RawRow]) -> Result<AssistedClassification> {
            Err(PipelineError::Provider("timeout".into()))
        }
    }

    struct ConfidentAssistant(&'static str);
    impl AssistedClassifier for ConfidentAssistant {
        fn classify_headers(&self, _: &[String], _: &[RawRow]) -> Result<AssistedClassification> {
            Ok(AssistedClassification {
                doc_type: self.0.to_string(),
                confidence: 0.9,
                reasoning: None,
            })
        }
    }

    #[test]
    fn provider_failure_keeps_local_result() {
        let classifier =
            DocumentClassifier::new().with_assistant(Arc::new(FailingAssistant), 0.6);
        let r = classifier.classify(&h(&["foo"]), None, "xlsx");
        assert_eq!(r.doc_type, None);
        assert_eq!(r.method, ClassificationMethod::Heuristic);
    }

    #[test]
    fn assistant_used_below_threshold_with_known_type_only() {
        let classifier =
            DocumentClassifier::new().with_assistant(Arc::new(ConfidentAssistant("factura")), 0.6);
        let r = classifier.classify(&h(&["foo"]), None, "pdf");
        assert_eq!(r.doc_type, Some(DocType::Invoice));
        assert_eq!(r.method, ClassificationMethod::Assisted);
        assert_eq!(r.suggested_parser, "ocr_invoice");

        let classifier =
            DocumentClassifier::new().with_assistant(Arc::new(ConfidentAssistant("payroll")), 0.6);
        let r = classifier.classify(&h(&["foo"]), None, "pdf");
        assert_eq!(r.doc_type, None);
    }

    #[test]
    fn text_classification_restricted_to_available_parsers() {
        let classifier = DocumentClassifier::new();
        let text = "FACTURA 001-001-000000123\nRUC 1790011674001\nSubtotal 100.00\nIVA 15% 15.00";
        let parsers = h(&["ocr_invoice", "ocr_receipt", "ocr_bank_statement"]);
        let r = classifier.classify_text(text, &parsers);
        assert_eq!(r.suggested_parser, "ocr_invoice");
        assert!(r.confidence > 0.5);
        assert_eq!(r.probabilities.len(), 3);
        assert!(r.reasoning.contains("factura"));

        let r = classifier.classify_text("lorem ipsum", &parsers);
        assert!((r.confidence - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn parser_table_defaults() {
        assert_eq!(parser_for(Some(DocType::Product), "xlsx"), "spreadsheet_products");
        assert_eq!(parser_for(Some(DocType::Product), "csv"), "csv_products");
        assert_eq!(parser_for(Some(DocType::Invoice), "xml"), "xml_invoice");
        assert_eq!(parser_for(None, "png"), "ocr_document");
        assert!(available_parsers().contains(&"ocr_bank_statement".to_string()));
    }
}
