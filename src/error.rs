//! Error types for the import pipeline.

use thiserror::Error;

/// Pipeline error type
#[derive(Debug, Error)]
pub enum PipelineError {
    /// File unreadable or malformed; terminal for that file only
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// File extension or content not handled by any source reader
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Canonical document failed structural or country-rule validation
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Destination handler failed to write the document
    #[error("Promotion to {target} failed: {message}")]
    Promotion { target: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// External assistance provider unavailable or returned garbage
    #[error("Assistance provider error: {0}")]
    Provider(String),

    #[error("OCR error: {0}")]
    Ocr(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    /// Poisoned lock or broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl PipelineError {
    /// Short machine-readable kind, stored on item error entries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Extraction(_) | PipelineError::UnsupportedFormat(_) => "extraction",
            PipelineError::Validation(_) => "validation",
            PipelineError::Promotion { .. } => "promotion",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Provider(_) => "provider",
            PipelineError::Ocr(_) => "ocr",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Config(_) => "config",
            PipelineError::Internal(_)
            | PipelineError::Io(_)
            | PipelineError::Database(_)
            | PipelineError::Serialization(_)
            | PipelineError::Csv(_)
            | PipelineError::Spreadsheet(_)
            | PipelineError::Xml(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
