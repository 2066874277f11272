//! Round aggregation: per-instance evaluation results to one score.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use cs_types::{EvaluationResult, FailureKind, InstanceId, Outcome};

use crate::state::ObjectiveDirection;

/// How per-instance scores combine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    /// `exp(mean(ln(v + shift))) - shift`; robust to a few very large values.
    ShiftedGeometricMean { shift: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub method: Aggregation,
    /// Score of a failed evaluation, and of a configuration whose success
    /// fraction falls below `min_success_fraction`. Applied on the losing
    /// side of the objective direction.
    pub penalty: f64,
    /// Fraction of subset instances that must succeed for the aggregate to
    /// be trusted.
    pub min_success_fraction: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            method: Aggregation::Mean,
            penalty: 10_000.0,
            min_success_fraction: 0.5,
        }
    }
}

impl AggregationConfig {
    pub fn with_method(mut self, method: Aggregation) -> Self {
        self.method = method;
        self
    }

    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_min_success_fraction(mut self, fraction: f64) -> Self {
        self.min_success_fraction = fraction;
        self
    }
}

/// Aggregate of one round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundScore {
    pub score: f64,
    pub penalized: bool,
    pub succeeded: usize,
    pub failed: usize,
    /// Timed-out jobs plus instances with no result by the round deadline.
    pub timed_out: usize,
    pub missing: usize,
    pub instance_scores: BTreeMap<InstanceId, Option<f64>>,
}

/// Aggregate the results of one configuration over `subset`.
///
/// When an instance has several results, the latest one wins. Results for
/// instances outside the subset are ignored. `normalize` maps a raw
/// per-instance score (e.g. to a ratio against a baseline).
pub fn aggregate<F>(
    config: &AggregationConfig,
    direction: ObjectiveDirection,
    subset: &[InstanceId],
    results: &[EvaluationResult],
    normalize: F,
) -> RoundScore
where
    F: Fn(&InstanceId, f64) -> f64,
{
    let penalty = direction.penalty(config.penalty);

    let mut latest: BTreeMap<&InstanceId, &EvaluationResult> = BTreeMap::new();
    for result in results {
        match latest.get(&result.instance_id) {
            Some(existing) if existing.finished_at > result.finished_at => {}
            _ => {
                latest.insert(&result.instance_id, result);
            }
        }
    }

    let mut round = RoundScore {
        score: penalty,
        penalized: true,
        succeeded: 0,
        failed: 0,
        timed_out: 0,
        missing: 0,
        instance_scores: BTreeMap::new(),
    };
    let mut values = Vec::with_capacity(subset.len());

    for id in subset {
        let score = match latest.get(id).map(|r| &r.outcome) {
            Some(Outcome::Score { value }) => {
                let value = normalize(id, *value);
                if value.is_finite() {
                    round.succeeded += 1;
                    Some(value)
                } else {
                    round.failed += 1;
                    None
                }
            }
            Some(Outcome::Failure { kind, .. }) => {
                if *kind == FailureKind::Timeout {
                    round.timed_out += 1;
                } else {
                    round.failed += 1;
                }
                None
            }
            None => {
                round.missing += 1;
                round.timed_out += 1;
                None
            }
        };
        values.push(score.unwrap_or(penalty));
        round.instance_scores.insert(id.clone(), score);
    }

    if subset.is_empty() || round.succeeded == 0 {
        return round;
    }
    let fraction = round.succeeded as f64 / subset.len() as f64;
    if fraction < config.min_success_fraction {
        return round;
    }

    round.score = combine(config.method, &values);
    round.penalized = false;
    round
}

fn combine(method: Aggregation, values: &[f64]) -> f64 {
    let n = values.len() as f64;
    match method {
        Aggregation::Mean => values.iter().sum::<f64>() / n,
        Aggregation::ShiftedGeometricMean { shift } => {
            let log_sum: f64 = values
                .iter()
                .map(|v| (v + shift).max(f64::MIN_POSITIVE).ln())
                .sum();
            (log_sum / n).exp() - shift
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn result(instance: &str, outcome: Outcome, age_secs: i64) -> EvaluationResult {
        EvaluationResult {
            configuration_id: Uuid::nil(),
            instance_id: InstanceId::new(instance),
            outcome,
            wall_clock_secs: 1.0,
            attempts: 1,
            finished_at: Utc::now() - Duration::seconds(age_secs),
            report: None,
        }
    }

    fn score(v: f64) -> Outcome {
        Outcome::Score { value: v }
    }

    fn failure(kind: FailureKind) -> Outcome {
        Outcome::Failure {
            kind,
            message: String::new(),
        }
    }

    fn subset(names: &[&str]) -> Vec<InstanceId> {
        names.iter().map(|n| InstanceId::new(*n)).collect()
    }

    #[test]
    fn all_failed_round_is_exactly_the_penalty() {
        let config = AggregationConfig::default()
            .with_penalty(1234.5)
            .with_min_success_fraction(0.0);
        let ids = subset(&["a", "b", "c"]);
        let results = vec![
            result("a", failure(FailureKind::NonZeroExit), 0),
            result("b", failure(FailureKind::Timeout), 0),
        ];
        let round = aggregate(&config, ObjectiveDirection::Minimize, &ids, &results, |_, v| v);
        assert_eq!(round.score, 1234.5);
        assert!(round.penalized);
        assert_eq!((round.succeeded, round.failed, round.timed_out, round.missing), (0, 1, 2, 1));

        let round = aggregate(&config, ObjectiveDirection::Maximize, &ids, &results, |_, v| v);
        assert_eq!(round.score, -1234.5);
    }

    #[test]
    fn failures_count_as_penalty_in_the_mean() {
        let config = AggregationConfig::default().with_penalty(100.0);
        let ids = subset(&["a", "b", "c", "d"]);
        let results = vec![
            result("a", score(10.0), 0),
            result("b", score(20.0), 0),
            result("c", score(30.0), 0),
            result("d", failure(FailureKind::MalformedOutput), 0),
        ];
        let round = aggregate(&config, ObjectiveDirection::Minimize, &ids, &results, |_, v| v);
        assert!(!round.penalized);
        assert_eq!(round.score, 40.0);
        assert_eq!(round.instance_scores[&InstanceId::new("d")], None);
    }

    #[test]
    fn below_success_fraction_is_a_hard_failure() {
        let config = AggregationConfig::default()
            .with_penalty(100.0)
            .with_min_success_fraction(0.75);
        let ids = subset(&["a", "b", "c", "d"]);
        let results = vec![
            result("a", score(1.0), 0),
            result("b", score(1.0), 0),
            result("c", failure(FailureKind::Timeout), 0),
        ];
        let round = aggregate(&config, ObjectiveDirection::Minimize, &ids, &results, |_, v| v);
        assert!(round.penalized);
        assert_eq!(round.score, 100.0);
    }

    #[test]
    fn latest_result_wins() {
        let config = AggregationConfig::default();
        let ids = subset(&["a"]);
        let results = vec![
            result("a", score(5.0), 0),
            result("a", failure(FailureKind::Timeout), 60),
            result("zz", score(1.0), 0),
        ];
        let round = aggregate(&config, ObjectiveDirection::Minimize, &ids, &results, |_, v| v);
        assert_eq!(round.score, 5.0);
        assert_eq!(round.succeeded, 1);
        assert_eq!(round.instance_scores.len(), 1);
    }

    #[test]
    fn shifted_geometric_mean_and_normalization() {
        let config = AggregationConfig::default()
            .with_method(Aggregation::ShiftedGeometricMean { shift: 1.0 });
        let ids = subset(&["a", "b"]);
        let results = vec![result("a", score(3.0), 0), result("b", score(15.0), 0)];

        let round = aggregate(&config, ObjectiveDirection::Minimize, &ids, &results, |_, v| v);
        // sqrt(4 * 16) - 1
        assert!((round.score - 7.0).abs() < 1e-9);

        let halved = aggregate(
            &AggregationConfig::default(),
            ObjectiveDirection::Minimize,
            &ids,
            &results,
            |_, v| v / 3.0,
        );
        assert!((halved.score - 3.0).abs() < 1e-9);
    }

    #[test]
    fn non_finite_normalized_score_counts_as_failure() {
        let config = AggregationConfig::default()
            .with_penalty(100.0)
            .with_min_success_fraction(0.75);
        let ids = subset(&["a", "b", "c", "d"]);
        let results = vec![
            result("a", score(2.0), 0),
            result("b", score(2.0), 0),
            result("c", score(2.0), 0),
            result("d", score(2.0), 0),
        ];
        let round = aggregate(
            &config,
            ObjectiveDirection::Minimize,
            &ids,
            &results,
            |id, v| if id.as_str() == "d" { f64::NAN } else { v },
        );
        assert_eq!((round.succeeded, round.failed), (3, 1));
        assert!(!round.penalized);
        assert_eq!(round.score, (2.0 * 3.0 + 100.0) / 4.0);
        assert_eq!(round.instance_scores[&InstanceId::new("d")], None);

        let round = aggregate(
            &config,
            ObjectiveDirection::Minimize,
            &ids,
            &results,
            |id, v| if id.as_str() < "c" { f64::INFINITY } else { v },
        );
        assert_eq!((round.succeeded, round.failed), (2, 2));
        assert!(round.penalized);
        assert_eq!(round.score, 100.0);
    }
}
