//! Pipeline configuration loaded from the environment (and an optional `.env`).

use crate::error::{PipelineError, Result};
use crate::services::confidence_gate::GateThresholds;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;
const DEFAULT_ASSIST_TIMEOUT_SECS: u64 = 20;
const DEFAULT_ASSIST_THRESHOLD: f64 = 0.6;

/// Azure Document Intelligence credentials.
#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub endpoint: String,
    pub key: String,
}

/// OpenAI-compatible chat-completions endpoint used for assisted classification/mapping.
#[derive(Debug, Clone)]
pub struct AssistConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub db_path: PathBuf,
    pub ocr: Option<OcrConfig>,
    pub assist: Option<AssistConfig>,
    /// Rows buffered per storage commit during ingestion.
    pub ingest_batch_size: usize,
    pub cache_ttl: Duration,
    /// Classifier confidence below which assistance is requested.
    pub assist_threshold: f64,
    pub default_country: String,
    pub default_currency: String,
    pub gate: GateThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ocr: None,
            assist: None,
            ingest_batch_size: DEFAULT_BATCH_SIZE,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            assist_threshold: DEFAULT_ASSIST_THRESHOLD,
            default_country: "EC".to_string(),
            default_currency: "USD".to_string(),
            gate: GateThresholds::default(),
        }
    }
}

fn load_env() {
    let _ = dotenvy::dotenv();
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("import-pipeline")
        .join("pipeline.db")
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match non_empty_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| PipelineError::Config(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(default),
    }
}

impl PipelineConfig {
    /// Build configuration from process environment after loading `.env`.
    pub fn from_env() -> Result<Self> {
        load_env();
        let defaults = Self::default();

        let db_path = non_empty_var("IMPORT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let ocr = match (non_empty_var("AZURE_OCR_ENDPOINT"), non_empty_var("AZURE_OCR_KEY")) {
            (Some(endpoint), Some(key)) => Some(OcrConfig {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                key,
            }),
            _ => None,
        };

        let assist = match (non_empty_var("ASSIST_API_URL"), non_empty_var("ASSIST_API_KEY")) {
            (Some(url), Some(api_key)) => Some(AssistConfig {
                url,
                api_key,
                model: non_empty_var("ASSIST_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                timeout: Duration::from_secs(parsed_var(
                    "ASSIST_TIMEOUT_SECS",
                    DEFAULT_ASSIST_TIMEOUT_SECS,
                )?),
            }),
            _ => None,
        };

        let ingest_batch_size = parsed_var("INGEST_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if ingest_batch_size == 0 {
            return Err(PipelineError::Config(
                "INGEST_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }
        let assist_threshold = parsed_var("ASSIST_THRESHOLD", DEFAULT_ASSIST_THRESHOLD)?;
        if !(0.0..=1.0).contains(&assist_threshold) {
            return Err(PipelineError::Config(
                "ASSIST_THRESHOLD must be within [0, 1]".to_string(),
            ));
        }

        let gate = GateThresholds::new(
            parsed_var("GATE_APPROVE_AT", defaults.gate.approve_at)?,
            parsed_var("GATE_VALIDATION_APPROVE_AT", defaults.gate.validation_approve_at)?,
            parsed_var("GATE_BLOCK_BELOW", defaults.gate.block_below)?,
            parsed_var("GATE_VALIDATION_BLOCK_BELOW", defaults.gate.validation_block_below)?,
        )?;

        Ok(Self {
            db_path,
            ocr,
            assist,
            ingest_batch_size,
            cache_ttl: Duration::from_secs(parsed_var(
                "MAPPING_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )?),
            assist_threshold,
            default_country: non_empty_var("DEFAULT_COUNTRY")
                .map(|c| c.to_uppercase())
                .unwrap_or(defaults.default_country),
            default_currency: non_empty_var("DEFAULT_CURRENCY")
                .map(|c| c.to_uppercase())
                .unwrap_or(defaults.default_currency),
            gate,
        })
    }

    /// Trained classifier model, stored next to the database.
    pub fn model_path(&self) -> PathBuf {
        self.db_path.with_file_name("classifier_model.json")
    }

    /// "configured" / "not_configured", as reported to status endpoints.
    pub fn ocr_status(&self) -> &'static str {
        if self.ocr.is_some() {
            "configured"
        } else {
            "not_configured"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.ingest_batch_size, 500);
        assert_eq!(cfg.default_country, "EC");
        assert!(cfg.ocr.is_none());
        assert_eq!(cfg.ocr_status(), "not_configured");
        assert!(cfg.db_path.ends_with("pipeline.db"));
        assert_eq!(cfg.model_path().parent(), cfg.db_path.parent());
        assert_eq!(cfg.gate, GateThresholds::default());
    }
}
