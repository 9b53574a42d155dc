//! Ingestion worker: streams a source into import items, committing in
//! fixed-size chunks.

use crate::db::Db;
use crate::error::{PipelineError, Result};
use crate::models::{DocType, MappingSuggestion};
use crate::services::confidence_gate::GateDecision;
use crate::services::learner::DEFAULT_CONFIRM_THRESHOLD;
use crate::services::row_normalizer::{build_canonical, dedupe_hash, idempotency_key, normalize_row};
use crate::services::smart_router::{SmartRouter, SourceSample, SAMPLE_ROWS};
use crate::sources::{file_digest, file_extension};
use crate::types::{BatchStatus, ImportBatch, IngestSummary, ItemStatus, NewImportItem, RawRow};
use crate::validators::validate_document;
use serde::Serialize;
use serde_json::{json, Map};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_BATCH_SIZE: usize = 500;

/// One "ingest file" request.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub tenant_id: String,
    pub path: PathBuf,
    /// Forces the doc type instead of the classifier's answer.
    pub doc_type: Option<DocType>,
    pub country: Option<String>,
    pub currency: Option<String>,
    /// Mapping confirmed by a user; used as-is.
    pub mapping: Option<MappingSuggestion>,
    pub use_ai: bool,
}

impl IngestRequest {
    pub fn new(tenant_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            path: path.into(),
            doc_type: None,
            country: None,
            currency: None,
            mapping: None,
            use_ai: false,
        }
    }

    pub fn with_doc_type(mut self, doc_type: DocType) -> Self {
        self.doc_type = Some(doc_type);
        self
    }

    pub fn with_mapping(mut self, mapping: MappingSuggestion) -> Self {
        self.mapping = Some(mapping);
        self
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub batch_id: i64,
    pub summary: IngestSummary,
    pub doc_type: Option<DocType>,
    /// Items that passed validation.
    pub valid: u64,
    pub gate: GateDecision,
}

pub struct IngestionWorker {
    db: Arc<Db>,
    router: Arc<SmartRouter>,
    batch_size: usize,
    country: String,
    currency: String,
}

impl IngestionWorker {
    pub fn new(db: Arc<Db>, router: Arc<SmartRouter>) -> Self {
        Self {
            db,
            router,
            batch_size: DEFAULT_BATCH_SIZE,
            country: "EC".to_string(),
            currency: "USD".to_string(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_defaults(mut self, country: &str, currency: &str) -> Self {
        self.country = country.to_uppercase();
        self.currency = currency.to_uppercase();
        self
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Batch that receives this file. A file whose content was ingested before
    /// by the same tenant reuses that batch.
    pub fn prepare_batch(&self, request: &IngestRequest) -> Result<i64> {
        let digest = file_digest(&request.path)
            .map_err(|e| PipelineError::Extraction(format!("{}: {}", request.path.display(), e)))?;
        if let Some(batch_id) = self.db.find_batch_by_digest(&request.tenant_id, &digest)? {
            tracing::info!(tenant_id = %request.tenant_id, batch_id, "file seen before; reusing batch");
            return Ok(batch_id);
        }
        let file_name = request
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload");
        self.db.create_batch(
            &request.tenant_id,
            file_name,
            Some(&digest),
            request.doc_type.map(|d| d.as_str()),
        )
    }

    pub fn ingest(&self, request: &IngestRequest) -> Result<IngestReport> {
        let batch_id = self.prepare_batch(request)?;
        self.ingest_batch_with(batch_id, request, |_| true)
    }

    /// Stream `request.path` into `batch_id`. `on_progress` sees the running
    /// counters after every row; returning `false` cancels the run, dropping
    /// rows not yet flushed. Chunks already committed stay.
    pub fn ingest_batch_with<F>(
        &self,
        batch_id: i64,
        request: &IngestRequest,
        mut on_progress: F,
    ) -> Result<IngestReport>
    where
        F: FnMut(&IngestSummary) -> bool,
    {
        let tenant_id = request.tenant_id.as_str();
        let batch = self.db.get_batch(tenant_id, batch_id)?;
        if matches!(batch.status, BatchStatus::Promoting | BatchStatus::Promoted) {
            tracing::info!(tenant_id, batch_id, status = batch.status.as_str(), "batch already promoted; nothing to ingest");
            return Self::recorded_report(&batch);
        }
        self.db
            .set_batch_status(tenant_id, batch_id, BatchStatus::Ingesting)?;
        tracing::info!(tenant_id, batch_id, file = %request.path.display(), "ingesting file");

        let mut summary = IngestSummary::default();
        match self.run(batch_id, request, &mut summary, &mut on_progress) {
            Ok(report) => Ok(report),
            Err(e) => {
                let cancelled = matches!(e, PipelineError::Cancelled);
                if cancelled {
                    tracing::warn!(tenant_id, batch_id, processed = summary.processed, "ingestion cancelled");
                } else {
                    tracing::error!(tenant_id, batch_id, error = %e, "ingestion failed");
                }
                let patch = json!({
                    "ingest": summary,
                    "cancelled": cancelled,
                    "error": { "kind": e.kind(), "message": e.to_string() },
                });
                let recorded = self
                    .db
                    .merge_batch_summary(tenant_id, batch_id, &patch)
                    .and_then(|_| self.db.set_batch_status(tenant_id, batch_id, BatchStatus::Failed));
                if let Err(db_err) = recorded {
                    tracing::error!(tenant_id, batch_id, error = %db_err, "could not mark batch failed");
                }
                Err(e)
            }
        }
    }

    /// Report of the last completed run, read back from the batch summary.
    fn recorded_report(batch: &ImportBatch) -> Result<IngestReport> {
        let summary = batch.summary.as_ref();
        let gate = match summary.and_then(|s| s.get("gate")) {
            Some(gate) => serde_json::from_value::<GateDecision>(gate.clone())?,
            None => {
                return Err(PipelineError::Validation(vec![format!(
                    "batch {} is {} and cannot be ingested again",
                    batch.id,
                    batch.status.as_str()
                )]))
            }
        };
        let processed = summary
            .and_then(|s| s["ingest"]["processed"].as_u64())
            .unwrap_or(0);
        let valid = summary.and_then(|s| s["valid"].as_u64()).unwrap_or(0);
        Ok(IngestReport {
            batch_id: batch.id,
            summary: IngestSummary { processed, created: 0 },
            doc_type: batch.doc_type.as_deref().and_then(DocType::parse),
            valid,
            gate,
        })
    }

    fn run(
        &self,
        batch_id: i64,
        request: &IngestRequest,
        summary: &mut IngestSummary,
        on_progress: &mut dyn FnMut(&IngestSummary) -> bool,
    ) -> Result<IngestReport> {
        let tenant_id = request.tenant_id.as_str();
        let digest = file_digest(&request.path)?;
        let mut source = self.router.open(&request.path)?;
        let sample_rows = source.take_sample(SAMPLE_ROWS)?;
        let headers = source.headers.clone();
        let ext = file_extension(&request.path);
        let parser_confidence = source.parser_confidence;

        let sample = SourceSample {
            kind: source.kind,
            headers: &headers,
            rows: &sample_rows,
            extension: &ext,
            parser_confidence,
            ocr_layout: source.ocr_layout,
        };
        let analysis = self
            .router
            .analyze_sample(&sample, Some(tenant_id), request.use_ai);

        let confirmed_type = request.mapping.as_ref().map(|m| m.doc_type).or(request.doc_type);
        let doc_type = confirmed_type.or(analysis.doc_type);
        let doc_type_confidence = if confirmed_type.is_some() {
            1.0
        } else {
            analysis.confidence
        };
        let mapping = match (&request.mapping, doc_type) {
            (Some(confirmed), _) => Some(confirmed.clone()),
            (None, Some(dt)) if analysis.doc_type == Some(dt) => analysis.mapping_suggestion.clone(),
            (None, Some(dt)) => Some(self.router.mapping_for(&sample, dt, Some(tenant_id), request.use_ai)),
            (None, None) => None,
        };
        let mapping_confidence = match (&mapping, request.mapping.is_some()) {
            (Some(_), true) => 1.0,
            (Some(m), false) => {
                let learned = self
                    .router
                    .learner()
                    .should_confirm_mapping(tenant_id, m.doc_type, &m.mappings, DEFAULT_CONFIRM_THRESHOLD)
                    .unwrap_or(false);
                if learned {
                    1.0
                } else {
                    m.confidence
                }
            }
            (None, _) => 0.0,
        };
        if let Some(dt) = doc_type {
            self.db.set_batch_doc_type(tenant_id, batch_id, dt.as_str())?;
        } else {
            tracing::warn!(tenant_id, batch_id, "document type undetermined; items stay PENDING");
        }

        let country = request.country.as_deref().unwrap_or(&self.country);
        let currency = request.currency.as_deref().unwrap_or(&self.currency);

        let mut buffer: Vec<NewImportItem> = Vec::with_capacity(self.batch_size.min(4096));
        let mut valid = 0u64;
        let rows = sample_rows.iter().cloned().map(Ok).chain(source.by_ref());
        for (idx, row) in rows.enumerate() {
            let item = self.build_item(tenant_id, &digest, idx as i64, row?, mapping.as_ref(), country, currency);
            if item.status == ItemStatus::Ok {
                valid += 1;
            }
            buffer.push(item);
            summary.processed += 1;
            if buffer.len() >= self.batch_size {
                summary.created += self.flush(tenant_id, batch_id, &mut buffer)?;
            }
            if !on_progress(summary) {
                tracing::debug!(tenant_id, batch_id, discarded = buffer.len(), "dropping unflushed rows");
                return Err(PipelineError::Cancelled);
            }
        }
        if !buffer.is_empty() {
            summary.created += self.flush(tenant_id, batch_id, &mut buffer)?;
            on_progress(summary);
        }

        let validation = if summary.processed > 0 {
            valid as f64 / summary.processed as f64
        } else {
            0.0
        };
        let policy = self.router.policy();
        let gate = policy.evaluate(&policy.gate(
            parser_confidence,
            doc_type_confidence,
            mapping_confidence,
            validation,
        ));

        self.db.merge_batch_summary(
            tenant_id,
            batch_id,
            &json!({
                "ingest": summary,
                "valid": valid,
                "cancelled": false,
                "gate": gate,
                "analysis": {
                    "suggested_doc_type": analysis.suggested_doc_type,
                    "confidence": analysis.confidence,
                    "decision_log": analysis.decision_log,
                },
                "mapping": mapping,
            }),
        )?;
        self.db
            .set_batch_status(tenant_id, batch_id, BatchStatus::Ingested)?;
        tracing::info!(
            tenant_id,
            batch_id,
            processed = summary.processed,
            created = summary.created,
            valid,
            gate = gate.action.as_str(),
            "ingestion finished"
        );

        Ok(IngestReport {
            batch_id,
            summary: *summary,
            doc_type,
            valid,
            gate,
        })
    }

    fn flush(&self, tenant_id: &str, batch_id: i64, buffer: &mut Vec<NewImportItem>) -> Result<u64> {
        let created = self.db.insert_items(tenant_id, batch_id, buffer)? as u64;
        tracing::debug!(tenant_id, batch_id, rows = buffer.len(), created, "chunk committed");
        buffer.clear();
        Ok(created)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_item(
        &self,
        tenant_id: &str,
        digest: &str,
        idx: i64,
        raw: RawRow,
        mapping: Option<&MappingSuggestion>,
        country: &str,
        currency: &str,
    ) -> NewImportItem {
        let key = idempotency_key(tenant_id, digest, idx);
        let Some(mapping) = mapping else {
            return NewImportItem {
                idx,
                dedupe_hash: dedupe_hash(&raw),
                raw,
                normalized: Map::new(),
                canonical_doc: None,
                status: ItemStatus::Pending,
                errors: Vec::new(),
                idempotency_key: key,
            };
        };
        let normalized = normalize_row(&raw, mapping);
        let doc = build_canonical(mapping.doc_type, country, currency, &normalized);
        let report = validate_document(&doc);
        let (status, errors) = if report.is_valid() {
            (ItemStatus::Ok, Vec::new())
        } else {
            (ItemStatus::ErrorValidation, report.to_item_errors())
        };
        NewImportItem {
            idx,
            dedupe_hash: dedupe_hash(&normalized),
            raw,
            normalized,
            canonical_doc: Some(doc),
            status,
            errors,
            idempotency_key: key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MappingCache;
    use crate::services::classifier::DocumentClassifier;
    use crate::services::learner::MappingLearner;
    use crate::services::mapping_suggester::MappingSuggester;
    use std::fs;
    use std::time::Duration;

    const PRODUCTS: &str = "SKU,Nombre,Precio\nA-1,Tornillo,0.25\nA-2,,0.10\nA-3,Tuerca,0.15\nA-4,Arandela,0.05\nA-5,Clavo,0.02\n";

    fn worker(db: Arc<Db>, batch_size: usize) -> IngestionWorker {
        let router = SmartRouter::new(
            Arc::new(DocumentClassifier::new()),
            Arc::new(
                MappingSuggester::new(Arc::new(MappingCache::new(Duration::from_secs(60))))
                    .with_defaults("EC", "USD"),
            ),
            Arc::new(MappingLearner::in_memory()),
        );
        IngestionWorker::new(db, Arc::new(router)).with_batch_size(batch_size)
    }

    fn write_products(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("productos.csv");
        fs::write(&path, PRODUCTS).unwrap();
        path
    }

    #[test]
    fn rows_become_items_with_validation_status() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let request = IngestRequest::new("t1", write_products(&dir)).with_doc_type(DocType::Product);

        let report = worker(db.clone(), 2).ingest(&request).unwrap();
        assert_eq!(report.summary, IngestSummary { processed: 5, created: 5 });
        assert_eq!(report.valid, 4);
        assert_eq!(report.doc_type, Some(DocType::Product));

        let counts = db.count_items_by_status("t1", report.batch_id).unwrap();
        assert_eq!(counts.get("OK"), Some(&4));
        assert_eq!(counts.get("ERROR_VALIDATION"), Some(&1));

        let items = db.list_items("t1", report.batch_id, None).unwrap();
        let bad = items.iter().find(|i| i.idx == 1).unwrap();
        assert!(bad.errors.iter().any(|e| e.message.contains("product.name")));
        assert!(bad.canonical_doc.is_some());

        let batch = db.get_batch("t1", report.batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Ingested);
        assert_eq!(batch.doc_type.as_deref(), Some("product"));
        let summary = batch.summary.unwrap();
        assert_eq!(summary["ingest"]["processed"], 5);
        assert!(summary["gate"]["action"].is_string());
    }

    #[test]
    fn same_file_twice_creates_nothing_new() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let request = IngestRequest::new("t1", write_products(&dir)).with_doc_type(DocType::Product);
        let w = worker(db.clone(), 500);

        let first = w.ingest(&request).unwrap();
        let second = w.ingest(&request).unwrap();
        assert_eq!(first.batch_id, second.batch_id);
        assert_eq!(second.summary, IngestSummary { processed: 5, created: 0 });
        assert_eq!(db.list_items("t1", first.batch_id, None).unwrap().len(), 5);

        let other = w.ingest(&IngestRequest::new("t2", request.path.clone()).with_doc_type(DocType::Product)).unwrap();
        assert_ne!(other.batch_id, first.batch_id);
        assert_eq!(other.summary.created, 5);
    }

    #[test]
    fn promoted_batch_is_left_alone() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let request = IngestRequest::new("t1", write_products(&dir)).with_doc_type(DocType::Product);
        let w = worker(db.clone(), 500);

        let first = w.ingest(&request).unwrap();
        db.set_batch_status("t1", first.batch_id, BatchStatus::Promoted).unwrap();
        let before = db.get_batch("t1", first.batch_id).unwrap().summary;

        let again = w.ingest(&request).unwrap();
        assert_eq!(again.batch_id, first.batch_id);
        assert_eq!(again.summary, IngestSummary { processed: 5, created: 0 });
        assert_eq!(again.valid, first.valid);
        assert_eq!(again.gate.action, first.gate.action);
        assert!((again.gate.overall_confidence - first.gate.overall_confidence).abs() < 1e-9);
        assert_eq!(again.doc_type, Some(DocType::Product));

        let batch = db.get_batch("t1", first.batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Promoted);
        assert_eq!(batch.summary, before);
    }

    #[test]
    fn cancelling_keeps_committed_chunks_only() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let request = IngestRequest::new("t1", write_products(&dir)).with_doc_type(DocType::Product);
        let w = worker(db.clone(), 2);
        let batch_id = w.prepare_batch(&request).unwrap();

        let err = w
            .ingest_batch_with(batch_id, &request, |s| s.processed < 3)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(db.list_items("t1", batch_id, None).unwrap().len(), 2);

        let batch = db.get_batch("t1", batch_id).unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.summary.unwrap()["cancelled"], true);
    }

    #[test]
    fn confirmed_mapping_is_used_verbatim() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let mut mapping = MappingSuggestion::empty(DocType::Product, crate::models::MappingProvider::Heuristics);
        mapping.mappings.insert("SKU".to_string(), "product.name".to_string());
        mapping.mappings.insert("Precio".to_string(), "product.price".to_string());
        mapping.derive_transforms();
        mapping
            .defaults
            .insert("currency".to_string(), serde_json::Value::String("USD".to_string()));
        let request = IngestRequest::new("t1", write_products(&dir)).with_mapping(mapping);

        let report = worker(db.clone(), 500).ingest(&request).unwrap();
        assert_eq!(report.valid, 5);
        assert!((report.gate.components.mapping - 1.0).abs() < 1e-9);
        let items = db.list_items("t1", report.batch_id, None).unwrap();
        let doc = items[0].canonical_doc.as_ref().unwrap();
        assert_eq!(doc.get_str("product.name"), Some("A-1"));
        assert_eq!(doc.get_f64("product.price"), Some(0.25));
    }

    #[test]
    fn missing_file_fails_before_a_batch_exists() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let request = IngestRequest::new("t1", "/nonexistent/file.csv");
        let err = worker(db, 500).ingest(&request).unwrap_err();
        assert_eq!(err.kind(), "extraction");
    }
}
