//! External text-generation assistance for low-confidence classification and mapping.
//!
//! Callers treat every error here as "assistance unavailable" and fall back to
//! the local heuristics; nothing in this module is allowed to abort the pipeline.

use crate::config::AssistConfig;
use crate::error::{PipelineError, Result};
use crate::models::DocType;
use crate::types::RawRow;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Sample rows sent along with a mapping request.
pub const MAX_SAMPLE_ROWS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistedClassification {
    /// Doc type name as returned; may be unknown or an alias.
    pub doc_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistedMapping {
    /// Raw header → proposed canonical field. Unfiltered.
    pub mappings: BTreeMap<String, String>,
}

pub trait AssistedClassifier: Send + Sync {
    fn classify_headers(
        &self,
        headers: &[String],
        sample_rows: &[RawRow],
    ) -> Result<AssistedClassification>;
}

pub trait AssistedMapper: Send + Sync {
    fn suggest_mapping(
        &self,
        headers: &[String],
        sample_rows: &[RawRow],
        doc_type: DocType,
        allowed_fields: &[&str],
    ) -> Result<AssistedMapping>;
}

/// OpenAI-compatible chat-completions client with a bounded timeout.
pub struct HttpAssistant {
    client: Client,
    config: AssistConfig,
}

impl HttpAssistant {
    pub fn new(config: AssistConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Provider(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn complete(&self, system: &str, user: &Value) -> Result<Value> {
        let body = json!({
            "model": self.config.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user.to_string() },
            ],
        });
        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                PipelineError::Provider(if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    e.to_string()
                })
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(PipelineError::Provider(format!("HTTP {}: {}", status, text)));
        }
        let payload: Value = response
            .json()
            .map_err(|e| PipelineError::Provider(format!("Invalid JSON: {}", e)))?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| PipelineError::Provider("No completion content".to_string()))?;
        parse_json_content(content)
    }
}

/// Completion text → JSON object, tolerating a fenced code block.
fn parse_json_content(content: &str) -> Result<Value> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let value: Value = serde_json::from_str(unfenced)
        .map_err(|e| PipelineError::Provider(format!("Unparseable completion: {}", e)))?;
    if !value.is_object() {
        return Err(PipelineError::Provider("Completion is not a JSON object".to_string()));
    }
    Ok(value)
}

impl AssistedClassifier for HttpAssistant {
    fn classify_headers(
        &self,
        headers: &[String],
        sample_rows: &[RawRow],
    ) -> Result<AssistedClassification> {
        let doc_types: Vec<&str> = DocType::ALL.iter().map(|d| d.as_str()).collect();
        let user = json!({
            "headers": headers,
            "sample_rows": &sample_rows[..sample_rows.len().min(MAX_SAMPLE_ROWS)],
            "doc_types": doc_types,
        });
        let value = self.complete(
            "Classify the business document described by these spreadsheet headers. \
             Reply with JSON {\"doc_type\": one of doc_types, \"confidence\": 0..1, \"reasoning\": string}.",
            &user,
        )?;
        let mut parsed: AssistedClassification = serde_json::from_value(value)
            .map_err(|e| PipelineError::Provider(format!("Unexpected classification shape: {}", e)))?;
        parsed.confidence = parsed.confidence.clamp(0.0, 1.0);
        Ok(parsed)
    }
}

impl AssistedMapper for HttpAssistant {
    fn suggest_mapping(
        &self,
        headers: &[String],
        sample_rows: &[RawRow],
        doc_type: DocType,
        allowed_fields: &[&str],
    ) -> Result<AssistedMapping> {
        let user = json!({
            "doc_type": doc_type.as_str(),
            "headers": headers,
            "sample_rows": &sample_rows[..sample_rows.len().min(MAX_SAMPLE_ROWS)],
            "allowed_fields": allowed_fields,
        });
        let value = self.complete(
            "Map each header to at most one of allowed_fields. Use each field once. \
             Reply with JSON {\"mappings\": {header: field}}. Omit headers you cannot map.",
            &user,
        )?;
        let mappings = value
            .get("mappings")
            .and_then(|m| m.as_object())
            .ok_or_else(|| PipelineError::Provider("No mappings object".to_string()))?
            .iter()
            .filter_map(|(h, f)| f.as_str().map(|f| (h.clone(), f.to_string())))
            .collect();
        Ok(AssistedMapping { mappings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_content_parsing() {
        assert!(parse_json_content("{\"a\": 1}").is_ok());
        assert!(parse_json_content("```json\n{\"a\": 1}\n```").is_ok());
        assert!(parse_json_content("[1, 2]").is_err());
        assert!(matches!(
            parse_json_content("sure! here you go"),
            Err(PipelineError::Provider(_))
        ));
    }

    #[test]
    fn unreachable_endpoint_is_a_provider_error() {
        let assistant = HttpAssistant::new(AssistConfig {
            url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            api_key: "test".to_string(),
            model: "test".to_string(),
            timeout: std::time::Duration::from_millis(500),
        })
        .unwrap();
        let err = assistant
            .classify_headers(&["Factura".to_string()], &[])
            .unwrap_err();
        assert_eq!(err.kind(), "provider");
    }
}
