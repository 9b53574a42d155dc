use crate::models::CanonicalDocument;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One source line: header → cell value, in source column order.
pub type RawRow = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    pub confidence: Option<f64>,
}

/// Layout hint returned with OCR text; selects the heuristic extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrLayout {
    Invoice,
    Receipt,
    BankStatement,
    Unknown,
}

/// Output of the OCR collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrDocument {
    pub text: String,
    pub lines: Vec<OcrLine>,
    pub layout: OcrLayout,
    /// Mean line confidence in [0, 1].
    pub confidence: f64,
    /// Detected tables, each as rows of cell strings.
    #[serde(default)]
    pub tables: Vec<Vec<Vec<String>>>,
    pub pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Pending,
    Ok,
    ErrorValidation,
    Promoted,
    ErrorPromotion,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "PENDING",
            ItemStatus::Ok => "OK",
            ItemStatus::ErrorValidation => "ERROR_VALIDATION",
            ItemStatus::Promoted => "PROMOTED",
            ItemStatus::ErrorPromotion => "ERROR_PROMOTION",
        }
    }

    pub fn parse(s: &str) -> Option<ItemStatus> {
        match s {
            "PENDING" => Some(ItemStatus::Pending),
            "OK" => Some(ItemStatus::Ok),
            "ERROR_VALIDATION" => Some(ItemStatus::ErrorValidation),
            "PROMOTED" => Some(ItemStatus::Promoted),
            "ERROR_PROMOTION" => Some(ItemStatus::ErrorPromotion),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Ingesting,
    Ingested,
    Promoting,
    Promoted,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Ingesting => "INGESTING",
            BatchStatus::Ingested => "INGESTED",
            BatchStatus::Promoting => "PROMOTING",
            BatchStatus::Promoted => "PROMOTED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<BatchStatus> {
        match s {
            "PENDING" => Some(BatchStatus::Pending),
            "INGESTING" => Some(BatchStatus::Ingesting),
            "INGESTED" => Some(BatchStatus::Ingested),
            "PROMOTING" => Some(BatchStatus::Promoting),
            "PROMOTED" => Some(BatchStatus::Promoted),
            "FAILED" => Some(BatchStatus::Failed),
            _ => None,
        }
    }
}

/// Structured error entry recorded on an import item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    /// validation | country_rule | promotion
    pub kind: String,
    pub message: String,
    pub at: String,
}

impl ItemError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportItem {
    pub id: i64,
    pub tenant_id: String,
    pub batch_id: i64,
    pub idx: i64,
    pub raw: RawRow,
    pub normalized: Map<String, Value>,
    pub canonical_doc: Option<CanonicalDocument>,
    pub status: ItemStatus,
    pub errors: Vec<ItemError>,
    pub idempotency_key: String,
    pub dedupe_hash: String,
    pub promoted_to: Option<String>,
    pub promoted_id: Option<String>,
    pub promoted_at: Option<String>,
}

/// Item ready to be written by the ingestion worker.
#[derive(Debug, Clone)]
pub struct NewImportItem {
    pub idx: i64,
    pub raw: RawRow,
    pub normalized: Map<String, Value>,
    pub canonical_doc: Option<CanonicalDocument>,
    pub status: ItemStatus,
    pub errors: Vec<ItemError>,
    pub idempotency_key: String,
    pub dedupe_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: i64,
    pub tenant_id: String,
    pub file_name: String,
    pub file_digest: Option<String>,
    pub doc_type: Option<String>,
    pub status: BatchStatus,
    pub created_at: String,
    pub summary: Option<Value>,
}

/// Completion summary of an "ingest file" job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub processed: u64,
    pub created: u64,
}

/// Completion summary of a "promote batch" job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionSummary {
    pub promoted: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::Ok,
            ItemStatus::ErrorValidation,
            ItemStatus::Promoted,
            ItemStatus::ErrorPromotion,
        ] {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse("promoted"), None);
        assert_eq!(
            serde_json::to_string(&ItemStatus::ErrorValidation).unwrap(),
            "\"ERROR_VALIDATION\""
        );
    }
}
