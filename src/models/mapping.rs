use super::canonical::DocType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Value conversion applied to a source column before it lands on its canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    ParseDate,
    ParseNumber,
}

impl Transform {
    /// Transform implied by a canonical target field name.
    pub fn for_field(canonical_field: &str) -> Option<Transform> {
        let leaf = canonical_field.rsplit('.').next().unwrap_or(canonical_field);
        if leaf.contains("date") {
            return Some(Transform::ParseDate);
        }
        const NUMERIC: &[&str] = &[
            "amount", "total", "subtotal", "tax", "price", "cost", "stock", "balance", "tax_rate",
        ];
        if NUMERIC.contains(&leaf) {
            return Some(Transform::ParseNumber);
        }
        None
    }
}

/// Where a mapping suggestion came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingProvider {
    Heuristics,
    Learned,
    External,
}

/// Proposed header → canonical field assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSuggestion {
    pub doc_type: DocType,
    /// Source header → canonical field (dotted path).
    pub mappings: BTreeMap<String, String>,
    /// Source header → transform.
    pub transforms: BTreeMap<String, Transform>,
    /// Canonical field → value used when the row has none.
    pub defaults: Map<String, Value>,
    pub confidence: f64,
    pub provider: MappingProvider,
    pub from_cache: bool,
}

impl MappingSuggestion {
    pub fn empty(doc_type: DocType, provider: MappingProvider) -> Self {
        Self {
            doc_type,
            mappings: BTreeMap::new(),
            transforms: BTreeMap::new(),
            defaults: Map::new(),
            confidence: 0.0,
            provider,
            from_cache: false,
        }
    }

    /// Recompute transforms from the current mapping targets.
    pub fn derive_transforms(&mut self) {
        self.transforms = self
            .mappings
            .iter()
            .filter_map(|(header, field)| Transform::for_field(field).map(|t| (header.clone(), t)))
            .collect();
    }

    /// Fraction of `headers` that received a mapping.
    pub fn coverage(&self, headers: &[String]) -> f64 {
        if headers.is_empty() {
            return 0.0;
        }
        let mapped = headers.iter().filter(|h| self.mappings.contains_key(*h)).count();
        mapped as f64 / headers.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackType {
    Accepted,
    Corrected,
    Rejected,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Accepted => "ACCEPTED",
            FeedbackType::Corrected => "CORRECTED",
            FeedbackType::Rejected => "REJECTED",
        }
    }
}

/// Before/after mapping of one header in a feedback submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFeedback {
    pub header: String,
    #[serde(default)]
    pub suggested: Option<String>,
    #[serde(default)]
    pub corrected: Option<String>,
}

/// A human verdict on a mapping suggestion. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingFeedback {
    pub tenant_id: String,
    pub doc_type: DocType,
    pub headers: Vec<String>,
    pub fields: Vec<FieldFeedback>,
    pub feedback_type: FeedbackType,
}

/// Accuracy counters for one `(tenant, doc_type, header, canonical_field)` tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldStats {
    pub correct_count: u64,
    pub total_count: u64,
}

impl FieldStats {
    pub fn accuracy(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.correct_count as f64 / self.total_count as f64
        }
    }
}

/// Key of a mapping statistics entry. `header` is already normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatsKey {
    pub tenant_id: String,
    pub doc_type: DocType,
    pub header: String,
    pub canonical_field: String,
}
