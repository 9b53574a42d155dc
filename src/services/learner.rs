//! Mapping learner: per-tenant accuracy statistics fed by human feedback.

use crate::error::{PipelineError, Result};
use crate::models::{
    DocType, FeedbackType, FieldStats, MappingFeedback, MappingProvider, MappingSuggestion,
    StatsKey,
};
use crate::services::normalize::normalize_header;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Learned mappings override the baseline only above this accuracy.
pub const OVERRIDE_ACCURACY: f64 = 0.7;
pub const DEFAULT_CONFIRM_THRESHOLD: f64 = 0.7;

/// Persistence for mapping statistics and the feedback log.
///
/// Every key carries the tenant id; implementations never read across tenants.
pub trait StatsStore: Send + Sync {
    /// Append the raw feedback record.
    fn append_feedback(&self, feedback: &MappingFeedback) -> Result<()>;

    /// Add one observation to the counter pair at `key`.
    fn increment(&self, key: &StatsKey, correct: bool) -> Result<()>;

    fn get(&self, key: &StatsKey) -> Result<Option<FieldStats>>;

    /// All canonical candidates recorded for a normalized header.
    fn candidates(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        header: &str,
    ) -> Result<Vec<(String, FieldStats)>>;
}

#[derive(Default)]
pub struct InMemoryStatsStore {
    stats: Mutex<HashMap<StatsKey, FieldStats>>,
    feedback: Mutex<Vec<MappingFeedback>>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feedback_len(&self) -> usize {
        self.feedback.lock().map(|f| f.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> PipelineError {
    PipelineError::Internal("statistics store lock poisoned".to_string())
}

impl StatsStore for InMemoryStatsStore {
    fn append_feedback(&self, feedback: &MappingFeedback) -> Result<()> {
        self.feedback.lock().map_err(poisoned)?.push(feedback.clone());
        Ok(())
    }

    fn increment(&self, key: &StatsKey, correct: bool) -> Result<()> {
        let mut stats = self.stats.lock().map_err(poisoned)?;
        let entry = stats.entry(key.clone()).or_default();
        entry.total_count += 1;
        if correct {
            entry.correct_count += 1;
        }
        Ok(())
    }

    fn get(&self, key: &StatsKey) -> Result<Option<FieldStats>> {
        Ok(self.stats.lock().map_err(poisoned)?.get(key).copied())
    }

    fn candidates(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        header: &str,
    ) -> Result<Vec<(String, FieldStats)>> {
        let stats = self.stats.lock().map_err(poisoned)?;
        let mut out: Vec<(String, FieldStats)> = stats
            .iter()
            .filter(|(k, _)| k.tenant_id == tenant_id && k.doc_type == doc_type && k.header == header)
            .map(|(k, v)| (k.canonical_field.clone(), *v))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

pub struct MappingLearner {
    store: Arc<dyn StatsStore>,
}

impl MappingLearner {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStatsStore::new()))
    }

    fn key(tenant_id: &str, doc_type: DocType, header: &str, canonical: &str) -> StatsKey {
        StatsKey {
            tenant_id: tenant_id.to_string(),
            doc_type,
            header: normalize_header(header),
            canonical_field: canonical.to_string(),
        }
    }

    /// Record a feedback submission. Each field entry updates exactly one
    /// counter pair; entries with nothing to count are skipped.
    /// Returns the number of counters updated.
    pub fn record_feedback(&self, feedback: &MappingFeedback) -> Result<usize> {
        self.store.append_feedback(feedback)?;
        let mut updated = 0;
        for field in &feedback.fields {
            let observation = match feedback.feedback_type {
                // A correction-less entry means the suggestion stood.
                FeedbackType::Accepted | FeedbackType::Corrected => field
                    .corrected
                    .as_deref()
                    .or(field.suggested.as_deref())
                    .map(|target| (target, true)),
                FeedbackType::Rejected => field.suggested.as_deref().map(|target| (target, false)),
            };
            let Some((target, correct)) = observation else {
                continue;
            };
            let key = Self::key(&feedback.tenant_id, feedback.doc_type, &field.header, target);
            self.store.increment(&key, correct)?;
            updated += 1;
        }
        tracing::debug!(
            tenant_id = %feedback.tenant_id,
            doc_type = %feedback.doc_type,
            feedback_type = feedback.feedback_type.as_str(),
            updated,
            "recorded mapping feedback"
        );
        Ok(updated)
    }

    /// Single-observation feedback for one header.
    pub fn record_header_feedback(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        header: &str,
        canonical_field: &str,
        correct: bool,
    ) -> Result<()> {
        let key = Self::key(tenant_id, doc_type, header, canonical_field);
        self.store.increment(&key, correct)
    }

    /// Best learned target for a header, if any exceeds the override accuracy.
    pub fn learned_target(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        header: &str,
    ) -> Result<Option<(String, f64)>> {
        let candidates = self
            .store
            .candidates(tenant_id, doc_type, &normalize_header(header))?;
        let best = candidates
            .into_iter()
            .filter(|(field, _)| doc_type.canonical_fields().contains(&field.as_str()))
            .map(|(field, stats)| (field, stats.accuracy(), stats.total_count))
            .filter(|(_, acc, _)| *acc > OVERRIDE_ACCURACY)
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.2.cmp(&b.2))
            });
        Ok(best.map(|(field, acc, _)| (field, acc)))
    }

    /// Baseline mapping with confident learned targets substituted per header.
    pub fn get_suggested_mapping(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        headers: &[String],
        baseline: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut mapping = baseline.clone();
        for header in headers {
            let Some((target, _)) = self.learned_target(tenant_id, doc_type, header)? else {
                continue;
            };
            // The learned header takes the target; whoever held it loses it.
            mapping.retain(|h, t| h == header || *t != target);
            mapping.insert(header.clone(), target);
        }
        Ok(mapping)
    }

    /// Apply learned overrides to a suggestion, marking it `learned` when any applied.
    pub fn apply(
        &self,
        tenant_id: &str,
        headers: &[String],
        suggestion: &MappingSuggestion,
    ) -> Result<MappingSuggestion> {
        let mapping =
            self.get_suggested_mapping(tenant_id, suggestion.doc_type, headers, &suggestion.mappings)?;
        if mapping == suggestion.mappings {
            return Ok(suggestion.clone());
        }
        let mut improved = suggestion.clone();
        improved.mappings = mapping;
        improved.derive_transforms();
        improved.confidence = improved.confidence.max(improved.coverage(headers));
        improved.provider = MappingProvider::Learned;
        Ok(improved)
    }

    /// Accuracy of `header → canonical_field`, 0 when unknown.
    pub fn get_mapping_confidence(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        header: &str,
        canonical_field: &str,
    ) -> Result<f64> {
        let key = Self::key(tenant_id, doc_type, header, canonical_field);
        Ok(self.store.get(&key)?.map(|s| s.accuracy()).unwrap_or(0.0))
    }

    /// True only when every mapped header has known statistics for its target
    /// with accuracy at or above `threshold`. An empty mapping is never confirmed.
    pub fn should_confirm_mapping(
        &self,
        tenant_id: &str,
        doc_type: DocType,
        mapping: &BTreeMap<String, String>,
        threshold: f64,
    ) -> Result<bool> {
        if mapping.is_empty() {
            return Ok(false);
        }
        for (header, target) in mapping {
            let key = Self::key(tenant_id, doc_type, header, target);
            match self.store.get(&key)? {
                Some(stats) if stats.total_count > 0 && stats.accuracy() >= threshold => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
