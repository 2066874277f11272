//! Bounded, timeout-aware job dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cs_types::{
    DispatchError, EvaluationResult, FailureKind, Outcome, ScoreMetric, SolverReport,
};

use crate::backend::{BackendJobState, ExecutionBackend, ProcessOutput};
use crate::job::{JobHandle, JobSpec, JobStatus};
use crate::journal::ResultLog;

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of jobs submitted to the backend at once; further
    /// submissions queue.
    pub max_in_flight: usize,
    /// Interval between backend status queries (milliseconds).
    pub poll_interval_ms: u64,
    /// Retries per job after a failed attempt (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts (milliseconds).
    pub backoff_base_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            poll_interval_ms: 500,
            max_retries: 0,
            backoff_base_ms: 1_000,
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base_ms = backoff_base.as_millis() as u64;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt - 1)))
    }
}

#[derive(Debug)]
struct JobEntry {
    status: watch::Receiver<JobStatus>,
    cancel: watch::Sender<bool>,
}

/// State shared with the per-job tasks.
struct Shared {
    backend: Arc<dyn ExecutionBackend>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    log: Option<Arc<ResultLog>>,
}

/// Result of one attempt before it is turned into an `EvaluationResult`.
enum Attempt {
    Finished(Outcome, Option<SolverReport>),
    TimedOut,
    Cancelled,
}

/// Submits evaluation jobs to an execution backend and tracks them to a
/// terminal state.
///
/// At most `max_in_flight` jobs are on the backend at any time. Every job
/// runs on its own task, so callers never block on the backend: `poll` is
/// immediate and `wait_all` honours a deadline.
pub struct JobDispatcher {
    shared: Arc<Shared>,
    jobs: DashMap<JobHandle, JobEntry>,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("backend", &self.shared.backend.name())
            .field("config", &self.shared.config)
            .field("jobs", &self.jobs.len())
            .finish()
    }
}

impl JobDispatcher {
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: DispatcherConfig) -> Self {
        Self::build(backend, config, None)
    }

    /// Append every finished evaluation to `log`.
    pub fn with_result_log(
        backend: Arc<dyn ExecutionBackend>,
        config: DispatcherConfig,
        log: ResultLog,
    ) -> Self {
        Self::build(backend, config, Some(Arc::new(log)))
    }

    fn build(
        backend: Arc<dyn ExecutionBackend>,
        config: DispatcherConfig,
        log: Option<Arc<ResultLog>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                permits,
                log,
            }),
            jobs: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn backend_name(&self) -> &str {
        self.shared.backend.name()
    }

    /// Queue a job. Must be called from within a tokio runtime.
    pub fn submit(&self, spec: JobSpec) -> JobHandle {
        let handle = JobHandle::new();
        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.jobs.insert(
            handle,
            JobEntry {
                status: status_rx,
                cancel: cancel_tx,
            },
        );

        debug!(
            job = %handle,
            instance = %spec.instance_id,
            configuration = %spec.configuration_id,
            "Queued evaluation job"
        );

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let status = run_job(&shared, handle, spec, cancel_rx).await;
            let _ = status_tx.send(status);
        });
        handle
    }

    /// Current status without blocking.
    pub fn poll(&self, handle: JobHandle) -> Result<JobStatus, DispatchError> {
        let entry = self.entry(handle)?;
        let status = entry.status.borrow().clone();
        Ok(status)
    }

    /// Wait until the job is terminal.
    pub async fn wait(&self, handle: JobHandle) -> Result<JobStatus, DispatchError> {
        let mut rx = self.entry(handle)?.status.clone();
        let status = rx
            .wait_for(JobStatus::is_terminal)
            .await
            .map(|status| status.clone())
            .map_err(|_| DispatchError::UnknownJob {
                job_id: handle.to_string(),
            })?;
        Ok(status)
    }

    /// Wait for all jobs until `deadline`; jobs still running at the deadline
    /// are reported as `Pending`.
    pub async fn wait_all(
        &self,
        handles: &[JobHandle],
        deadline: Instant,
    ) -> Vec<(JobHandle, JobStatus)> {
        let mut statuses = Vec::with_capacity(handles.len());
        for &handle in handles {
            let status = match tokio::time::timeout_at(deadline, self.wait(handle)).await {
                Ok(Ok(status)) => status,
                Ok(Err(_)) => JobStatus::Pending,
                Err(_) => self.poll(handle).unwrap_or(JobStatus::Pending),
            };
            statuses.push((handle, status));
        }
        statuses
    }

    /// Request cancellation. The job ends as a `Cancelled` failure unless it
    /// finishes first.
    pub fn cancel(&self, handle: JobHandle) -> Result<(), DispatchError> {
        let entry = self.entry(handle)?;
        let _ = entry.cancel.send(true);
        Ok(())
    }

    pub fn cancel_all(&self, handles: &[JobHandle]) {
        for &handle in handles {
            if let Err(e) = self.cancel(handle) {
                debug!(job = %handle, error = %e, "Cancel skipped");
            }
        }
    }

    /// Jobs currently holding a backend slot.
    pub fn in_flight(&self) -> usize {
        self.shared
            .config
            .max_in_flight
            .max(1)
            .saturating_sub(self.shared.permits.available_permits())
    }

    /// Jobs not yet terminal, queued ones included.
    pub fn pending(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| !entry.status.borrow().is_terminal())
            .count()
    }

    /// Drop the bookkeeping of a job; its handle becomes unknown. A job that
    /// is still running is cancelled.
    pub fn forget(&self, handle: JobHandle) {
        self.jobs.remove(&handle);
    }

    fn entry(
        &self,
        handle: JobHandle,
    ) -> Result<dashmap::mapref::one::Ref<'_, JobHandle, JobEntry>, DispatchError> {
        self.jobs.get(&handle).ok_or_else(|| DispatchError::UnknownJob {
            job_id: handle.to_string(),
        })
    }
}

async fn run_job(
    shared: &Shared,
    handle: JobHandle,
    spec: JobSpec,
    mut cancel: watch::Receiver<bool>,
) -> JobStatus {
    let _permit = tokio::select! {
        permit = Arc::clone(&shared.permits).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return finish(shared, &spec, Attempt::Cancelled, 0, Duration::ZERO),
        },
        _ = cancelled(&mut cancel) => {
            return finish(shared, &spec, Attempt::Cancelled, 0, Duration::ZERO);
        }
    };

    let started = Instant::now();
    let max_attempts = spec.max_retries.unwrap_or(shared.config.max_retries) + 1;
    let mut attempt = 1;
    loop {
        let outcome = run_attempt(shared, handle, &spec, &mut cancel).await;

        let retryable = match &outcome {
            Attempt::Finished(Outcome::Score { .. }, _) | Attempt::Cancelled => false,
            Attempt::Finished(Outcome::Failure { kind, .. }, _) => *kind != FailureKind::SolverError,
            Attempt::TimedOut => true,
        };
        if !retryable || attempt >= max_attempts {
            return finish(shared, &spec, outcome, attempt, started.elapsed());
        }

        let delay = shared.config.backoff(attempt);
        warn!(
            job = %handle,
            instance = %spec.instance_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Evaluation attempt failed, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled(&mut cancel) => {
                return finish(shared, &spec, Attempt::Cancelled, attempt, started.elapsed());
            }
        }
        attempt += 1;
    }
}

async fn run_attempt(
    shared: &Shared,
    handle: JobHandle,
    spec: &JobSpec,
    cancel: &mut watch::Receiver<bool>,
) -> Attempt {
    let backend = &shared.backend;
    let job_id = match backend.submit(&spec.command, &spec.resources).await {
        Ok(id) => id,
        Err(e) => {
            return Attempt::Finished(
                Outcome::Failure {
                    kind: FailureKind::BackendUnreachable,
                    message: e.to_string(),
                },
                None,
            )
        }
    };
    debug!(job = %handle, backend_job = %job_id, backend = backend.name(), "Submitted to backend");

    let deadline = Instant::now() + spec.timeout;
    let poll = Duration::from_millis(shared.config.poll_interval_ms.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if let Err(e) = backend.cancel(&job_id).await {
                    debug!(job = %handle, error = %e, "Backend cancel after timeout failed");
                }
                return Attempt::TimedOut;
            }
            _ = cancelled(cancel) => {
                if let Err(e) = backend.cancel(&job_id).await {
                    debug!(job = %handle, error = %e, "Backend cancel failed");
                }
                return Attempt::Cancelled;
            }
            _ = tokio::time::sleep(poll) => {}
        }

        match backend.status(&job_id).await {
            Ok(BackendJobState::Queued) | Ok(BackendJobState::Running) => continue,
            Ok(BackendJobState::Completed(output)) => {
                let (outcome, report) = classify_output(&output, spec.metric);
                return Attempt::Finished(outcome, report);
            }
            Ok(BackendJobState::Lost { reason }) => {
                return Attempt::Finished(
                    Outcome::Failure {
                        kind: FailureKind::BackendUnreachable,
                        message: format!("job lost by backend: {reason}"),
                    },
                    None,
                )
            }
            Err(e) => {
                if let Err(cancel_err) = backend.cancel(&job_id).await {
                    debug!(job = %handle, error = %cancel_err, "Backend cancel failed");
                }
                return Attempt::Finished(
                    Outcome::Failure {
                        kind: FailureKind::BackendUnreachable,
                        message: e.to_string(),
                    },
                    None,
                );
            }
        }
    }
}

/// Resolves once cancellation has been requested or the dispatcher is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|requested| *requested).await;
}

fn finish(
    shared: &Shared,
    spec: &JobSpec,
    attempt: Attempt,
    attempts: u32,
    elapsed: Duration,
) -> JobStatus {
    let (outcome, report, timed_out) = match attempt {
        Attempt::Finished(outcome, report) => (outcome, report, false),
        Attempt::TimedOut => (
            Outcome::Failure {
                kind: FailureKind::Timeout,
                message: format!("no result within {:.1}s", spec.timeout.as_secs_f64()),
            },
            None,
            true,
        ),
        Attempt::Cancelled => (
            Outcome::Failure {
                kind: FailureKind::Cancelled,
                message: "cancelled".to_string(),
            },
            None,
            false,
        ),
    };

    let result = EvaluationResult {
        configuration_id: spec.configuration_id,
        instance_id: spec.instance_id.clone(),
        outcome,
        wall_clock_secs: elapsed.as_secs_f64(),
        attempts,
        finished_at: Utc::now(),
        report,
    };

    match &result.outcome {
        Outcome::Score { value } => {
            debug!(instance = %result.instance_id, score = value, attempts, "Evaluation succeeded")
        }
        Outcome::Failure { kind, message } => {
            warn!(instance = %result.instance_id, kind = %kind, message = %message, attempts, "Evaluation failed")
        }
    }

    // Cancelled work produced no evaluation and is not recorded.
    if result.outcome.failure_kind() != Some(FailureKind::Cancelled) {
        if let Some(log) = &shared.log {
            if let Err(e) = log.append(&result) {
                warn!(path = ?log.path(), error = %e, "Failed to append evaluation result");
            }
        }
    }

    if timed_out {
        JobStatus::TimedOut(result)
    } else if result.is_success() {
        JobStatus::Succeeded(result)
    } else {
        JobStatus::Failed(result)
    }
}

/// Turn captured process output into a score or a classified failure.
pub fn classify_output(output: &ProcessOutput, metric: ScoreMetric) -> (Outcome, Option<SolverReport>) {
    if output.exit_code != Some(0) {
        let tail: String = output
            .stderr
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        let status = match output.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".to_string(),
        };
        return (
            Outcome::Failure {
                kind: FailureKind::NonZeroExit,
                message: if tail.is_empty() { status } else { format!("{status}: {tail}") },
            },
            None,
        );
    }

    let report = match SolverReport::from_stdout(&output.stdout) {
        Ok(report) => report,
        Err(message) => {
            return (
                Outcome::Failure {
                    kind: FailureKind::MalformedOutput,
                    message,
                },
                None,
            )
        }
    };

    if report.is_error() {
        let message = report
            .message
            .clone()
            .unwrap_or_else(|| "solver reported an error".to_string());
        return (
            Outcome::Failure {
                kind: FailureKind::SolverError,
                message,
            },
            Some(report),
        );
    }

    match metric.extract(&report) {
        Some(value) => (Outcome::Score { value }, Some(report)),
        None => (
            Outcome::Failure {
                kind: FailureKind::MalformedOutput,
                message: format!("report has no finite {metric}"),
            },
            Some(report),
        ),
    }
}

/// Summarize terminal statuses as (succeeded, failed, timed out).
pub fn count_statuses<'a>(statuses: impl IntoIterator<Item = &'a JobStatus>) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    for status in statuses {
        match status {
            JobStatus::Succeeded(_) => counts.0 += 1,
            JobStatus::Failed(_) => counts.1 += 1,
            JobStatus::TimedOut(_) => counts.2 += 1,
            JobStatus::Pending => {}
        }
    }
    info!(succeeded = counts.0, failed = counts.1, timed_out = counts.2, "Collected job statuses");
    counts
}
