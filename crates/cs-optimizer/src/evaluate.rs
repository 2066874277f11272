//! Evaluate one configuration over a set of instances through the dispatcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use cs_dispatch::{
    InvocationContext, JobDispatcher, JobHandle, JobSpec, JobStatus, ResourceRequest,
    SolverInvocation,
};
use cs_types::{Configuration, CsResult, EvaluationResult, Instance, InstanceId, ScoreMetric};

/// How evaluation jobs are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub invocation: SolverInvocation,
    pub resources: ResourceRequest,
    /// Value of the `{seed}` placeholder.
    pub solver_seed: u64,
    /// Job timeout as a multiple of the solver time limit, covering start-up
    /// and result writing.
    pub job_timeout_multiple: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            invocation: SolverInvocation::default(),
            resources: ResourceRequest::default(),
            solver_seed: 1,
            job_timeout_multiple: 2.0,
        }
    }
}

impl EvaluatorConfig {
    pub fn with_invocation(mut self, invocation: SolverInvocation) -> Self {
        self.invocation = invocation;
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_solver_seed(mut self, seed: u64) -> Self {
        self.solver_seed = seed;
        self
    }
}

/// One configuration over a set of instances.
#[derive(Debug, Clone)]
pub struct RoundPlan<'a> {
    pub configuration: &'a Configuration,
    pub instances: &'a [Instance],
    /// Solver time limit per instance, parallel to `instances`.
    pub time_limits: Vec<f64>,
    pub metric: ScoreMetric,
    pub deadline: Instant,
}

/// What came back from a round.
#[derive(Debug, Clone, Default)]
pub struct RoundEvaluation {
    /// Terminal results, in instance order.
    pub results: Vec<EvaluationResult>,
    /// Instances still running at the deadline or interrupt; their jobs were
    /// cancelled.
    pub unfinished: Vec<InstanceId>,
    pub interrupted: bool,
}

/// Submits one job per instance and collects them at a round barrier.
#[derive(Debug)]
pub struct Evaluator {
    dispatcher: Arc<JobDispatcher>,
    config: EvaluatorConfig,
    configs_dir: PathBuf,
}

impl Evaluator {
    /// `configs_dir` receives one JSON file per evaluated configuration; the
    /// solver reads its parameters from there.
    pub fn new(dispatcher: Arc<JobDispatcher>, config: EvaluatorConfig, configs_dir: impl Into<PathBuf>) -> Self {
        Self {
            dispatcher,
            config,
            configs_dir: configs_dir.into(),
        }
    }

    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Write the configuration file handed to the solver.
    pub fn write_configuration(&self, configuration: &Configuration) -> CsResult<PathBuf> {
        std::fs::create_dir_all(&self.configs_dir)?;
        let path = self.configs_dir.join(format!("{}.json", configuration.id));
        configuration.save(&path)?;
        Ok(path)
    }

    fn job_spec(&self, plan: &RoundPlan<'_>, instance: &Instance, time_limit: f64, config_path: &Path) -> JobSpec {
        let command = self.config.invocation.render(&InvocationContext {
            instance,
            config_path,
            time_limit_secs: time_limit,
            seed: self.config.solver_seed,
        });
        let timeout_secs = (time_limit * self.config.job_timeout_multiple.max(1.0)).max(1.0);
        let mut resources = self.config.resources.clone();
        resources.wall_time_secs = Some(timeout_secs.ceil() as u64);

        JobSpec::new(
            plan.configuration.id,
            instance.id.clone(),
            command,
            Duration::from_secs_f64(timeout_secs),
        )
        .with_resources(resources)
        .with_metric(plan.metric)
    }

    /// Run the plan to its barrier: every job terminal, the deadline, or an
    /// interrupt on `shutdown`, whichever comes first. Unfinished jobs are
    /// cancelled and their results discarded.
    pub async fn evaluate(
        &self,
        plan: &RoundPlan<'_>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CsResult<RoundEvaluation> {
        let config_path = self.write_configuration(plan.configuration)?;

        let handles: Vec<(JobHandle, &Instance)> = plan
            .instances
            .iter()
            .zip(&plan.time_limits)
            .map(|(instance, &limit)| {
                let spec = self.job_spec(plan, instance, limit, &config_path);
                (self.dispatcher.submit(spec), instance)
            })
            .collect();
        let ids: Vec<JobHandle> = handles.iter().map(|(h, _)| *h).collect();

        info!(
            configuration = %plan.configuration.id,
            name = %plan.configuration.name,
            jobs = ids.len(),
            "Dispatched evaluation round"
        );

        let (statuses, interrupted) = tokio::select! {
            statuses = self.dispatcher.wait_all(&ids, plan.deadline) => (statuses, false),
            _ = interrupted(shutdown) => {
                let statuses = ids
                    .iter()
                    .map(|&h| (h, self.dispatcher.poll(h).unwrap_or(JobStatus::Pending)))
                    .collect();
                (statuses, true)
            }
        };

        let mut evaluation = RoundEvaluation {
            interrupted,
            ..RoundEvaluation::default()
        };
        let mut unfinished = Vec::new();
        for ((handle, status), (_, instance)) in statuses.into_iter().zip(&handles) {
            match status.into_result() {
                Some(result) if !interrupted => evaluation.results.push(result),
                Some(_) => {}
                None => {
                    unfinished.push(handle);
                    evaluation.unfinished.push(instance.id.clone());
                }
            }
        }

        if !unfinished.is_empty() {
            warn!(
                configuration = %plan.configuration.id,
                unfinished = unfinished.len(),
                interrupted,
                "Cancelling unfinished evaluation jobs"
            );
            self.dispatcher.cancel_all(&unfinished);
            for &handle in &unfinished {
                // Cancellation is prompt; the wait only lets the backend
                // release the job before the next round.
                let _ = tokio::time::timeout(Duration::from_secs(5), self.dispatcher.wait(handle)).await;
            }
        }
        for handle in ids {
            self.dispatcher.forget(handle);
        }

        Ok(evaluation)
    }
}

/// Resolves once an interrupt is requested. A dropped sender never
/// interrupts.
pub async fn interrupted(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_dispatch::{DispatcherConfig, SimulatedBackend, SimulatedOutcome};
    use cs_types::{FailureKind, ParameterMap, SolveStatus, SolverReport};

    fn instances(n: usize) -> Vec<Instance> {
        (0..n)
            .map(|i| Instance::new(InstanceId::new(format!("p{i}")), format!("/pool/p{i}.mps")))
            .collect()
    }

    fn dispatcher(backend: SimulatedBackend) -> Arc<JobDispatcher> {
        Arc::new(JobDispatcher::new(
            Arc::new(backend),
            DispatcherConfig::default()
                .with_max_in_flight(4)
                .with_poll_interval(Duration::from_millis(5)),
        ))
    }

    #[tokio::test]
    async fn evaluates_every_instance_and_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new(|command| {
            assert!(command.args.contains(&"30".to_string()));
            SimulatedOutcome::report(
                &SolverReport::solved(SolveStatus::Optimal, 4.0),
                Duration::from_millis(2),
            )
        });
        let evaluator = Evaluator::new(dispatcher(backend), EvaluatorConfig::default(), dir.path());
        let configuration = Configuration::new("c", ParameterMap::new());
        let instances = instances(5);
        let plan = RoundPlan {
            configuration: &configuration,
            instances: &instances,
            time_limits: vec![30.0; 5],
            metric: ScoreMetric::SolveTime,
            deadline: Instant::now() + Duration::from_secs(5),
        };

        let (_tx, mut rx) = watch::channel(false);
        let evaluation = evaluator.evaluate(&plan, &mut rx).await.unwrap();
        assert_eq!(evaluation.results.len(), 5);
        assert!(evaluation.unfinished.is_empty());
        assert!(!evaluation.interrupted);
        assert!(evaluation.results.iter().all(|r| r.outcome.score() == Some(4.0)));
        assert!(dir.path().join(format!("{}.json", configuration.id)).exists());
    }

    #[tokio::test]
    async fn round_deadline_cancels_stragglers() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new(|command| {
            if command.label == "cs-p0" {
                SimulatedOutcome::Hang
            } else {
                SimulatedOutcome::exit(2, "", Duration::from_millis(2))
            }
        });
        let evaluator = Evaluator::new(dispatcher(backend), EvaluatorConfig::default(), dir.path());
        let configuration = Configuration::new("c", ParameterMap::new());
        let instances = instances(3);
        let plan = RoundPlan {
            configuration: &configuration,
            instances: &instances,
            time_limits: vec![600.0; 3],
            metric: ScoreMetric::SolveTime,
            deadline: Instant::now() + Duration::from_millis(100),
        };

        let (_tx, mut rx) = watch::channel(false);
        let evaluation = evaluator.evaluate(&plan, &mut rx).await.unwrap();
        assert_eq!(evaluation.unfinished, vec![InstanceId::new("p0")]);
        assert_eq!(evaluation.results.len(), 2);
        assert!(evaluation
            .results
            .iter()
            .all(|r| r.outcome.failure_kind() == Some(FailureKind::NonZeroExit)));
        assert_eq!(evaluator.dispatcher().in_flight(), 0);
    }

    #[tokio::test]
    async fn interrupt_discards_the_round() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new(|_| SimulatedOutcome::Hang);
        let evaluator = Evaluator::new(dispatcher(backend), EvaluatorConfig::default(), dir.path());
        let configuration = Configuration::new("c", ParameterMap::new());
        let instances = instances(2);
        let plan = RoundPlan {
            configuration: &configuration,
            instances: &instances,
            time_limits: vec![600.0; 2],
            metric: ScoreMetric::SolveTime,
            deadline: Instant::now() + Duration::from_secs(60),
        };

        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(true);
        });
        let evaluation = evaluator.evaluate(&plan, &mut rx).await.unwrap();
        assert!(evaluation.interrupted);
        assert!(evaluation.results.is_empty());
        assert_eq!(evaluation.unfinished.len(), 2);
    }
}
