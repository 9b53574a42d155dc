//! Confidence gate: combines parser, doc-type, mapping and validation scores
//! into one auto-approve / confirm / block decision.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};

const PARSER_WEIGHT: f64 = 0.15;
const DOC_TYPE_WEIGHT: f64 = 0.25;
const MAPPING_WEIGHT: f64 = 0.30;
const VALIDATION_WEIGHT: f64 = 0.30;

const HIGH_LEVEL: f64 = 0.85;
const MEDIUM_LEVEL: f64 = 0.60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// Gate thresholds. `block_below < approve_at` and
/// `validation_block_below <= validation_approve_at` always hold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    pub approve_at: f64,
    pub validation_approve_at: f64,
    pub block_below: f64,
    pub validation_block_below: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            approve_at: 0.85,
            validation_approve_at: 0.80,
            block_below: 0.50,
            validation_block_below: 0.50,
        }
    }
}

impl GateThresholds {
    pub fn new(
        approve_at: f64,
        validation_approve_at: f64,
        block_below: f64,
        validation_block_below: f64,
    ) -> Result<Self> {
        let t = Self {
            approve_at,
            validation_approve_at,
            block_below,
            validation_block_below,
        };
        let in_range = [approve_at, validation_approve_at, block_below, validation_block_below]
            .iter()
            .all(|v| (0.0..=1.0).contains(v));
        if !in_range {
            return Err(PipelineError::Config(
                "gate thresholds must be within [0, 1]".to_string(),
            ));
        }
        if block_below >= approve_at || validation_block_below > validation_approve_at {
            return Err(PipelineError::Config(format!(
                "gate thresholds out of order: block {} / approve {}, validation block {} / approve {}",
                block_below, approve_at, validation_block_below, validation_approve_at
            )));
        }
        Ok(t)
    }
}

fn clamp_score(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// Four component scores and their aggregate. Computed fresh per document.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceGate {
    pub parser: f64,
    pub doc_type: f64,
    pub mapping: f64,
    pub validation: f64,
    pub overall_confidence: f64,
    pub confidence_level: ConfidenceLevel,
    #[serde(skip)]
    thresholds: GateThresholds,
}

impl ConfidenceGate {
    /// Components are clamped to [0, 1]; NaN counts as 0. The aggregate is
    /// computed immediately.
    pub fn new(parser: f64, doc_type: f64, mapping: f64, validation: f64) -> Self {
        Self::with_thresholds(parser, doc_type, mapping, validation, GateThresholds::default())
    }

    pub fn with_thresholds(
        parser: f64,
        doc_type: f64,
        mapping: f64,
        validation: f64,
        thresholds: GateThresholds,
    ) -> Self {
        let mut gate = Self {
            parser: clamp_score(parser),
            doc_type: clamp_score(doc_type),
            mapping: clamp_score(mapping),
            validation: clamp_score(validation),
            overall_confidence: 0.0,
            confidence_level: ConfidenceLevel::Low,
            thresholds,
        };
        gate.calculate_overall();
        gate
    }

    /// Weighted sum of the components, plus the derived level.
    pub fn calculate_overall(&mut self) -> f64 {
        let overall = self.parser * PARSER_WEIGHT
            + self.doc_type * DOC_TYPE_WEIGHT
            + self.mapping * MAPPING_WEIGHT
            + self.validation * VALIDATION_WEIGHT;
        self.overall_confidence = clamp_score(overall);
        self.confidence_level = if self.overall_confidence >= HIGH_LEVEL {
            ConfidenceLevel::High
        } else if self.overall_confidence >= MEDIUM_LEVEL {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        };
        self.overall_confidence
    }

    pub fn should_auto_approve(&self) -> bool {
        self.overall_confidence >= self.thresholds.approve_at
            && self.validation >= self.thresholds.validation_approve_at
    }

    pub fn should_block_promotion(&self) -> bool {
        self.overall_confidence < self.thresholds.block_below
            || self.validation < self.thresholds.validation_block_below
    }

    pub fn requires_confirmation(&self) -> bool {
        !self.should_auto_approve() && !self.should_block_promotion()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateAction {
    AutoApprove,
    Confirm,
    Block,
}

impl GateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateAction::AutoApprove => "auto_approve",
            GateAction::Confirm => "confirm",
            GateAction::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateComponents {
    pub parser: f64,
    pub doc_type: f64,
    pub mapping: f64,
    pub validation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub action: GateAction,
    pub overall_confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub components: GateComponents,
}

/// The single decision surface consumed by promotion.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceGatingPolicy {
    thresholds: GateThresholds,
}

impl ConfidenceGatingPolicy {
    pub fn new(thresholds: GateThresholds) -> Self {
        Self { thresholds }
    }

    pub fn gate(&self, parser: f64, doc_type: f64, mapping: f64, validation: f64) -> ConfidenceGate {
        ConfidenceGate::with_thresholds(parser, doc_type, mapping, validation, self.thresholds)
    }

    pub fn evaluate(&self, gate: &ConfidenceGate) -> GateDecision {
        let mut gate = *gate;
        gate.thresholds = self.thresholds;
        gate.calculate_overall();
        let action = if gate.should_block_promotion() {
            GateAction::Block
        } else if gate.should_auto_approve() {
            GateAction::AutoApprove
        } else {
            GateAction::Confirm
        };
        GateDecision {
            action,
            overall_confidence: gate.overall_confidence,
            confidence_level: gate.confidence_level,
            components: GateComponents {
                parser: gate.parser,
                doc_type: gate.doc_type,
                mapping: gate.mapping,
                validation: gate.validation,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exactly_one(gate: &ConfidenceGate) -> bool {
        [
            gate.should_auto_approve(),
            gate.requires_confirmation(),
            gate.should_block_promotion(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
            == 1
    }

    #[test]
    fn predicates_partition_the_score_grid() {
        let steps: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        for &p in &steps {
            for &d in &steps {
                for &m in &steps {
                    for &v in &steps {
                        let gate = ConfidenceGate::new(p, d, m, v);
                        assert!(exactly_one(&gate), "p={} d={} m={} v={}", p, d, m, v);
                    }
                }
            }
        }
    }

    #[test]
    fn boundaries() {
        let all_high = ConfidenceGate::new(1.0, 1.0, 1.0, 1.0);
        assert!(all_high.should_auto_approve());
        assert_eq!(all_high.confidence_level, ConfidenceLevel::High);

        // High overall but weak validation must not auto-approve.
        let weak_validation = ConfidenceGate::new(1.0, 1.0, 1.0, 0.6);
        assert!(weak_validation.requires_confirmation());

        let bad_validation = ConfidenceGate::new(1.0, 1.0, 1.0, 0.4);
        assert!(bad_validation.should_block_promotion());

        let all_low = ConfidenceGate::new(0.0, 0.0, 0.0, 0.0);
        assert!(all_low.should_block_promotion());
        assert_eq!(all_low.confidence_level, ConfidenceLevel::Low);
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        let gate = ConfidenceGate::new(f64::NAN, 7.0, -3.0, 1.0);
        assert_eq!(gate.parser, 0.0);
        assert_eq!(gate.doc_type, 1.0);
        assert_eq!(gate.mapping, 0.0);
        assert!(exactly_one(&gate));
    }

    #[test]
    fn overall_is_monotonic_in_each_component() {
        let base = ConfidenceGate::new(0.5, 0.5, 0.5, 0.5).overall_confidence;
        assert!(ConfidenceGate::new(0.6, 0.5, 0.5, 0.5).overall_confidence > base);
        assert!(ConfidenceGate::new(0.5, 0.6, 0.5, 0.5).overall_confidence > base);
        assert!(ConfidenceGate::new(0.5, 0.5, 0.6, 0.5).overall_confidence > base);
        assert!(ConfidenceGate::new(0.5, 0.5, 0.5, 0.6).overall_confidence > base);
    }

    #[test]
    fn policy_actions() {
        let policy = ConfidenceGatingPolicy::default();
        let d = policy.evaluate(&ConfidenceGate::new(0.9, 0.9, 0.9, 0.9));
        assert_eq!(d.action, GateAction::AutoApprove);
        let d = policy.evaluate(&ConfidenceGate::new(0.7, 0.7, 0.7, 0.7));
        assert_eq!(d.action, GateAction::Confirm);
        assert_eq!(d.confidence_level, ConfidenceLevel::Medium);
        let d = policy.evaluate(&ConfidenceGate::new(0.2, 0.2, 0.2, 0.2));
        assert_eq!(d.action, GateAction::Block);
        assert_eq!(d.components.mapping, 0.2);
    }

    #[test]
    fn thresholds_must_be_ordered() {
        assert!(GateThresholds::new(0.9, 0.8, 0.5, 0.5).is_ok());
        assert!(GateThresholds::new(0.5, 0.8, 0.6, 0.5).is_err());
        assert!(GateThresholds::new(0.9, 0.4, 0.5, 0.5).is_err());
        assert!(GateThresholds::new(1.2, 0.8, 0.5, 0.5).is_err());

        let strict = ConfidenceGatingPolicy::new(GateThresholds::new(0.95, 0.95, 0.7, 0.7).unwrap());
        let d = strict.evaluate(&ConfidenceGate::new(0.9, 0.9, 0.9, 0.9));
        assert_eq!(d.action, GateAction::Confirm);
    }
}
