//! Confidence Scorer: aggregates per-factor scores into an overall score
//! and a routing action.

use serde::{Deserialize, Serialize};

pub use crate::envelope::RoutingAction;

/// Weights for the confidence formula, exposed as `confidence.weights.*`
/// config keys so they can be recalibrated without a rebuild (spec.md §9a:
/// "must be calibrated against a labelled set — note, do not guess").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    pub w1_intent_clarity: f64,
    pub w2_schema_match_quality: f64,
    pub w3_sql_complexity_penalty: f64,
    pub w4_retry_penalty: f64,
    pub w5_hallucination_risk: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            w1_intent_clarity: 0.35,
            w2_schema_match_quality: 0.35,
            w3_sql_complexity_penalty: 0.10,
            w4_retry_penalty: 0.15,
            w5_hallucination_risk: 0.05,
        }
    }
}

/// Per-factor inputs to the scoring formula, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    pub intent_clarity: f64,
    pub schema_match_quality: f64,
    pub sql_complexity_penalty: f64,
    pub retry_penalty: f64,
    pub hallucination_risk: f64,
    pub validation_passed: bool,
}

/// The scored, routed result of one query's pipeline run. `routing_action`
/// is the three-way band spec.md §3 defines for this type ("Normal |
/// Warning | Clarify") — distinct from the terminal `RoutingAction` a
/// `QueryResult` carries, which only has room for Answered/Clarify/Reject/
/// Timeout and would otherwise collapse Normal and Warning into the same
/// value. Use [`ConfidenceBand::terminal_action`] to get the latter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub overall: f64,
    pub factors: ConfidenceFactors,
    pub routing_action: ConfidenceBand,
}

/// Computes the overall score per spec.md §4.12's formula and bands it.
pub fn score(factors: ConfidenceFactors, weights: &ConfidenceWeights) -> ConfidenceScore {
    let raw = factors.intent_clarity * weights.w1_intent_clarity
        + factors.schema_match_quality * weights.w2_schema_match_quality
        - factors.sql_complexity_penalty * weights.w3_sql_complexity_penalty
        - factors.retry_penalty * weights.w4_retry_penalty
        - factors.hallucination_risk * weights.w5_hallucination_risk;

    let mut overall = 100.0 * raw.clamp(0.0, 1.0);

    if !factors.validation_passed {
        overall = overall.min(50.0);
    }

    ConfidenceScore {
        overall,
        factors,
        routing_action: band(overall),
    }
}

/// Three-way routing band (spec.md §4.12: "≥70 Normal; 50–69 Warning +
/// queue-for-review; <50 Clarify"). This is `ConfidenceScore`'s own
/// `routing_action`, observable by callers/audit independent of the
/// terminal `RoutingAction` a `QueryResult` settles on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceBand {
    Normal,
    Warning,
    Clarify,
}

impl ConfidenceBand {
    /// Maps this band to the terminal `RoutingAction` a `QueryResult`
    /// carries. Warning still answers the question — it only adds the
    /// queue-for-review signal this band itself carries — so only
    /// `Clarify` maps to a distinct terminal action.
    pub fn terminal_action(self) -> RoutingAction {
        match self {
            ConfidenceBand::Normal | ConfidenceBand::Warning => RoutingAction::Answered,
            ConfidenceBand::Clarify => RoutingAction::Clarify,
        }
    }
}

pub fn band(overall: f64) -> ConfidenceBand {
    if overall >= 70.0 {
        ConfidenceBand::Normal
    } else if overall >= 50.0 {
        ConfidenceBand::Warning
    } else {
        ConfidenceBand::Clarify
    }
}

/// Computes `retry_penalty` from a retry count, stepping per retry and
/// capping at 1.0.
pub fn retry_penalty(retry_count: u32) -> f64 {
    (retry_count as f64 * 0.25).min(1.0)
}

/// Computes `sql_complexity_penalty` from SQL length, join count, and
/// subquery depth.
pub fn sql_complexity_penalty(sql_length: usize, join_count: u32, subquery_depth: u32) -> f64 {
    let length_component = (sql_length as f64 / 2000.0).min(0.4);
    let join_component = (join_count as f64 * 0.1).min(0.4);
    let subquery_component = (subquery_depth as f64 * 0.15).min(0.3);
    (length_component + join_component + subquery_component).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_thresholds_match_spec_bands() {
        assert_eq!(band(70.0), ConfidenceBand::Normal);
        assert_eq!(band(69.9), ConfidenceBand::Warning);
        assert_eq!(band(50.0), ConfidenceBand::Warning);
        assert_eq!(band(49.9), ConfidenceBand::Clarify);
    }

    #[test]
    fn perfect_factors_yield_max_overall_within_positive_weight_budget() {
        let factors = ConfidenceFactors {
            intent_clarity: 1.0,
            schema_match_quality: 1.0,
            sql_complexity_penalty: 0.0,
            retry_penalty: 0.0,
            hallucination_risk: 0.0,
            validation_passed: true,
        };
        let weights = ConfidenceWeights::default();
        let result = score(factors, &weights);
        // w1 + w2 = 0.70 -> overall = 70.
        assert!((result.overall - 70.0).abs() < 0.001);
    }

    #[test]
    fn failed_validation_forces_overall_at_or_below_fifty() {
        let factors = ConfidenceFactors {
            intent_clarity: 1.0,
            schema_match_quality: 1.0,
            sql_complexity_penalty: 0.0,
            retry_penalty: 0.0,
            hallucination_risk: 0.0,
            validation_passed: false,
        };
        let weights = ConfidenceWeights::default();
        let result = score(factors, &weights);
        assert!(result.overall <= 50.0);
    }

    #[test]
    fn retry_penalty_caps_at_one() {
        assert_eq!(retry_penalty(0), 0.0);
        assert!((retry_penalty(2) - 0.5).abs() < 0.001);
        assert_eq!(retry_penalty(10), 1.0);
    }

    #[test]
    fn warning_band_is_observable_but_still_answers() {
        // w1*1.0 + w2*0.6 = 0.35 + 0.21 = 0.56 -> overall 56, in [50, 70).
        let factors = ConfidenceFactors {
            intent_clarity: 1.0,
            schema_match_quality: 0.6,
            sql_complexity_penalty: 0.0,
            retry_penalty: 0.0,
            hallucination_risk: 0.0,
            validation_passed: true,
        };
        let weights = ConfidenceWeights::default();
        let result = score(factors, &weights);
        assert_eq!(result.routing_action, ConfidenceBand::Warning);
        // Warning is distinct from Normal, but both still answer the query.
        assert_eq!(result.routing_action.terminal_action(), RoutingAction::Answered);
        assert_ne!(ConfidenceBand::Normal, result.routing_action);
    }

    #[test]
    fn clarify_band_maps_to_clarify_terminal_action() {
        assert_eq!(
            ConfidenceBand::Clarify.terminal_action(),
            RoutingAction::Clarify
        );
        assert_eq!(
            ConfidenceBand::Normal.terminal_action(),
            RoutingAction::Answered
        );
    }
}
