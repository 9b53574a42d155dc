//! Document import pipeline: turns uploaded spreadsheets, delimited text, XML
//! and scans into validated canonical documents, then promotes them into the
//! destination tables.
//!
//! [`commands::PipelineState`] wires every service from a [`config::PipelineConfig`];
//! the functions in [`commands`] are the request/response surface.

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod ocr;
pub mod provider;
pub mod services;
pub mod sources;
pub mod types;
pub mod validators;

pub use commands::{CommandError, PipelineState};
pub use config::PipelineConfig;
pub use db::Db;
pub use error::{PipelineError, Result};
pub use models::{CanonicalDocument, DocType, MappingSuggestion};
pub use services::confidence_gate::{ConfidenceGatingPolicy, GateAction, GateDecision};
pub use services::ingestion::{IngestReport, IngestRequest, IngestionWorker};
pub use services::promotion::PromotionDispatcher;
pub use services::smart_router::{AnalysisResult, SmartRouter};
pub use types::{BatchStatus, IngestSummary, ItemStatus, PromotionSummary};
