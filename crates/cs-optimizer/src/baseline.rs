//! Baseline runs of the default configuration, used for per-instance time
//! limits and score normalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use cs_types::{
    Configuration, CsResult, Instance, InstanceId, ScoreMetric, SearchError, SolverReport,
};

use crate::evaluate::{Evaluator, RoundPlan};
use crate::journal::write_atomic;

/// Per-job solver time limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLimitPolicy {
    /// Configured limit, and the limit for instances without a baseline.
    pub time_limit_secs: f64,
    /// Floor for baseline-derived limits.
    pub min_time_limit_secs: f64,
    /// Baseline-derived limit = this multiple × baseline solve time.
    pub baseline_time_multiple: f64,
}

impl Default for TimeLimitPolicy {
    fn default() -> Self {
        Self {
            time_limit_secs: 120.0,
            min_time_limit_secs: 5.0,
            baseline_time_multiple: 2.0,
        }
    }
}

impl TimeLimitPolicy {
    pub fn with_time_limit(mut self, secs: f64) -> Self {
        self.time_limit_secs = secs;
        self
    }

    pub fn with_min_time_limit(mut self, secs: f64) -> Self {
        self.min_time_limit_secs = secs;
        self
    }

    pub fn with_baseline_multiple(mut self, multiple: f64) -> Self {
        self.baseline_time_multiple = multiple;
        self
    }

    /// clamp(multiple × baseline, min, limit); the configured limit when
    /// there is no usable baseline time.
    pub fn limit_for(&self, baseline_solve_time: Option<f64>) -> f64 {
        let ceiling = self.time_limit_secs;
        let floor = self.min_time_limit_secs.min(ceiling);
        match baseline_solve_time {
            Some(t) if t.is_finite() && t >= 0.0 => {
                (self.baseline_time_multiple * t).clamp(floor, ceiling)
            }
            _ => ceiling,
        }
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        let ok = self.time_limit_secs.is_finite()
            && self.time_limit_secs > 0.0
            && self.min_time_limit_secs >= 0.0
            && self.baseline_time_multiple.is_finite()
            && self.baseline_time_multiple > 0.0;
        if ok {
            Ok(())
        } else {
            Err(SearchError::InvalidBudget {
                message: format!("invalid time limit policy {self:?}"),
            })
        }
    }
}

/// Reports of the default configuration on every subset instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub configuration: Configuration,
    pub reports: BTreeMap<InstanceId, SolverReport>,
    pub created_at: DateTime<Utc>,
}

impl Baseline {
    pub fn new(configuration: Configuration, reports: BTreeMap<InstanceId, SolverReport>) -> Self {
        Self {
            configuration,
            reports,
            created_at: Utc::now(),
        }
    }

    pub fn save(&self, path: &Path) -> CsResult<()> {
        write_atomic(path, self)
    }

    pub fn load(path: &Path) -> CsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn solve_time(&self, instance: &InstanceId) -> Option<f64> {
        self.reports.get(instance).map(|r| r.solve_time)
    }

    pub fn time_limit(&self, instance: &InstanceId, policy: &TimeLimitPolicy) -> f64 {
        policy.limit_for(self.solve_time(instance))
    }

    /// `value` as a ratio to the baseline's metric on the same instance;
    /// unchanged when the baseline has no positive value for it.
    pub fn normalize(&self, instance: &InstanceId, metric: ScoreMetric, value: f64) -> f64 {
        match self.reports.get(instance).and_then(|r| metric.extract(r)) {
            Some(base) if base > 0.0 => value / base,
            _ => value,
        }
    }
}

/// Run `configuration` once on every instance with the configured time limit
/// and collect the reports of the successful runs.
pub async fn generate_baseline(
    evaluator: &Evaluator,
    configuration: Configuration,
    instances: &[Instance],
    policy: &TimeLimitPolicy,
    round_timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> CsResult<Baseline> {
    info!(instances = instances.len(), "Generating baseline runs");
    let plan = RoundPlan {
        configuration: &configuration,
        instances,
        time_limits: vec![policy.time_limit_secs; instances.len()],
        metric: ScoreMetric::SolveTime,
        deadline: Instant::now() + round_timeout,
    };
    let evaluation = evaluator.evaluate(&plan, shutdown).await?;
    if evaluation.interrupted {
        warn!("Baseline interrupted, discarding partial runs");
        return Err(SearchError::Interrupted {
            stage: "the baseline".to_string(),
        }
        .into());
    }

    let mut reports = BTreeMap::new();
    for result in evaluation.results {
        match (result.is_success(), result.report) {
            (true, Some(report)) => {
                reports.insert(result.instance_id, report);
            }
            (_, _) => {
                warn!(
                    instance = %result.instance_id,
                    outcome = ?result.outcome,
                    "Baseline run produced no report"
                );
            }
        }
    }
    for id in &evaluation.unfinished {
        warn!(instance = %id, "Baseline run did not finish");
    }

    info!(
        reports = reports.len(),
        missing = instances.len() - reports.len(),
        "Baseline complete"
    );
    Ok(Baseline::new(configuration, reports))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_types::{ParameterMap, SolveStatus};

    #[test]
    fn time_limit_is_clamped_multiple_of_baseline() {
        let policy = TimeLimitPolicy::default();
        assert_eq!(policy.limit_for(Some(20.0)), 40.0);
        assert_eq!(policy.limit_for(Some(1.0)), 5.0);
        assert_eq!(policy.limit_for(Some(100.0)), 120.0);
        assert_eq!(policy.limit_for(None), 120.0);
        assert_eq!(policy.limit_for(Some(f64::NAN)), 120.0);

        let tight = TimeLimitPolicy::default()
            .with_time_limit(3.0)
            .with_min_time_limit(5.0);
        assert_eq!(tight.limit_for(Some(0.1)), 3.0);
        assert!(TimeLimitPolicy::default().with_time_limit(0.0).validate().is_err());
    }

    #[test]
    fn normalization_uses_baseline_metric() {
        let mut reports = BTreeMap::new();
        reports.insert(
            InstanceId::new("a"),
            SolverReport::solved(SolveStatus::Optimal, 8.0),
        );
        reports.insert(
            InstanceId::new("zero"),
            SolverReport::solved(SolveStatus::Optimal, 0.0),
        );
        let baseline = Baseline::new(Configuration::new("default", ParameterMap::new()), reports);

        let a = InstanceId::new("a");
        assert_eq!(baseline.normalize(&a, ScoreMetric::SolveTime, 4.0), 0.5);
        assert_eq!(
            baseline.normalize(&InstanceId::new("zero"), ScoreMetric::SolveTime, 4.0),
            4.0
        );
        assert_eq!(
            baseline.normalize(&InstanceId::new("missing"), ScoreMetric::SolveTime, 4.0),
            4.0
        );
        assert_eq!(baseline.time_limit(&a, &TimeLimitPolicy::default()), 16.0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        baseline.save(&path).unwrap();
        assert_eq!(Baseline::load(&path).unwrap(), baseline);
    }

    #[tokio::test]
    async fn interrupted_baseline_is_an_error() {
        use cs_dispatch::{DispatcherConfig, JobDispatcher, SimulatedBackend, SimulatedOutcome};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Arc::new(JobDispatcher::new(
            Arc::new(SimulatedBackend::new(|_| SimulatedOutcome::Hang)),
            DispatcherConfig::default().with_poll_interval(Duration::from_millis(5)),
        ));
        let evaluator = Evaluator::new(dispatcher, crate::EvaluatorConfig::default(), dir.path());
        let instances = vec![
            Instance::new(InstanceId::new("a"), "/pool/a.mps"),
            Instance::new(InstanceId::new("b"), "/pool/b.mps"),
        ];

        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });
        let result = generate_baseline(
            &evaluator,
            Configuration::new("default", ParameterMap::new()),
            &instances,
            &TimeLimitPolicy::default(),
            Duration::from_secs(60),
            &mut rx,
        )
        .await;

        assert!(matches!(
            result,
            Err(cs_types::CsError::Search(SearchError::Interrupted { .. }))
        ));
    }
}
