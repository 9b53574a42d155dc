//! Mapping suggestion: cache → assisted mapping → heuristic dictionary.

use crate::cache::{cache_key, MappingCache};
use crate::models::{DocType, MappingProvider, MappingSuggestion};
use crate::provider::{AssistedMapper, AssistedMapping, MAX_SAMPLE_ROWS};
use crate::services::mapping_dictionary::heuristic_mapping;
use crate::types::RawRow;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Assisted results below this confidence fall back to the dictionary.
const MIN_ASSISTED_CONFIDENCE: f64 = 0.5;

/// Keep only pairs whose header was in the input and whose target is allowed;
/// a target already taken by an earlier header (input order) is dropped.
pub fn filter_assisted_mapping(
    headers: &[String],
    allowed_fields: &[&str],
    assisted: &AssistedMapping,
) -> BTreeMap<String, String> {
    let mut used: HashSet<&str> = HashSet::new();
    let mut out = BTreeMap::new();
    for header in headers {
        let Some(target) = assisted.mappings.get(header) else {
            continue;
        };
        let target = target.trim();
        if !allowed_fields.contains(&target) || used.contains(target) {
            continue;
        }
        used.insert(target);
        out.insert(header.clone(), target.to_string());
    }
    out
}

pub struct MappingSuggester {
    cache: Arc<MappingCache>,
    assistant: Option<Arc<dyn AssistedMapper>>,
    defaults: Map<String, Value>,
}

impl MappingSuggester {
    pub fn new(cache: Arc<MappingCache>) -> Self {
        Self {
            cache,
            assistant: None,
            defaults: Map::new(),
        }
    }

    pub fn with_assistant(mut self, assistant: Arc<dyn AssistedMapper>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    /// Caller-level `country` / `currency` defaults applied to non-bank suggestions.
    pub fn with_defaults(mut self, country: &str, currency: &str) -> Self {
        self.defaults
            .insert("country".to_string(), Value::String(country.to_uppercase()));
        self.defaults
            .insert("currency".to_string(), Value::String(currency.to_uppercase()));
        self
    }

    pub fn cache(&self) -> &MappingCache {
        &self.cache
    }

    pub fn suggest(
        &self,
        headers: &[String],
        sample_rows: &[RawRow],
        doc_type: DocType,
        tenant_id: &str,
        use_ai: bool,
    ) -> MappingSuggestion {
        let key = cache_key(headers, doc_type, tenant_id);
        if let Some(mut cached) = self.cache.get(&key) {
            tracing::debug!(tenant_id, doc_type = %doc_type, "mapping cache hit");
            cached.from_cache = true;
            return cached;
        }

        let assisted = if use_ai {
            self.assisted(headers, sample_rows, doc_type)
        } else {
            None
        };

        let mut suggestion = match assisted {
            Some(s) if s.confidence >= MIN_ASSISTED_CONFIDENCE => s,
            _ => heuristic_mapping(headers, doc_type),
        };
        if doc_type != DocType::BankTx {
            suggestion.defaults = self.defaults.clone();
        }
        suggestion.from_cache = false;
        self.cache.set(&key, suggestion.clone());
        suggestion
    }

    fn assisted(
        &self,
        headers: &[String],
        sample_rows: &[RawRow],
        doc_type: DocType,
    ) -> Option<MappingSuggestion> {
        let assistant = self.assistant.as_ref()?;
        let allowed = doc_type.canonical_fields();
        let samples = &sample_rows[..sample_rows.len().min(MAX_SAMPLE_ROWS)];
        match assistant.suggest_mapping(headers, samples, doc_type, allowed) {
            Ok(raw) => {
                let mappings = filter_assisted_mapping(headers, allowed, &raw);
                let dropped = raw.mappings.len() - mappings.len().min(raw.mappings.len());
                if dropped > 0 {
                    tracing::warn!(dropped, doc_type = %doc_type, "discarded unsafe assisted mappings");
                }
                let mut suggestion = MappingSuggestion::empty(doc_type, MappingProvider::External);
                suggestion.mappings = mappings;
                suggestion.confidence = suggestion.coverage(headers);
                suggestion.derive_transforms();
                Some(suggestion)
            }
            Err(e) => {
                tracing::warn!(error = %e, doc_type = %doc_type, "assisted mapping unavailable");
                None
            }
        }
    }
}
