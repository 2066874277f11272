//! Simulated (in-process) execution backend.
//!
//! Runs no processes: a behaviour closure decides what each submitted
//! command "does". Useful for dry runs and for testing the dispatcher and
//! the search loop without a solver.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;

use cs_types::SolverReport;

use crate::backend::{
    BackendError, BackendJobId, BackendJobState, BackendResult, ExecutionBackend, JobCommand,
    ProcessOutput, ResourceRequest,
};

/// What a simulated job does.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedOutcome {
    /// Exit after `delay` with the given code and output.
    Exit {
        code: i32,
        stdout: String,
        delay: Duration,
    },
    /// Run until cancelled.
    Hang,
    /// Refuse the submission.
    Unreachable { message: String },
}

impl SimulatedOutcome {
    /// A successful run that prints `report` as its last stdout line.
    pub fn report(report: &SolverReport, delay: Duration) -> Self {
        let stdout = match serde_json::to_string(report) {
            Ok(json) => format!("solving\n{json}\n"),
            Err(e) => format!("unserializable report: {e}\n"),
        };
        Self::Exit {
            code: 0,
            stdout,
            delay,
        }
    }

    pub fn exit(code: i32, stdout: impl Into<String>, delay: Duration) -> Self {
        Self::Exit {
            code,
            stdout: stdout.into(),
            delay,
        }
    }
}

type Behaviour = dyn Fn(&JobCommand) -> SimulatedOutcome + Send + Sync;

#[derive(Debug)]
struct SimJob {
    state: BackendJobState,
    cancel: Option<oneshot::Sender<()>>,
}

/// Counters shared between the backend and its job tasks.
#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    max_active: AtomicUsize,
    submissions: AtomicUsize,
    cancellations: AtomicUsize,
}

impl Counters {
    fn start(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend whose jobs are driven by a closure
pub struct SimulatedBackend {
    behaviour: Arc<Behaviour>,
    jobs: Arc<DashMap<BackendJobId, SimJob>>,
    counters: Arc<Counters>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("jobs", &self.jobs.len())
            .field("counters", &self.counters)
            .finish()
    }
}

impl SimulatedBackend {
    pub fn new<F>(behaviour: F) -> Self
    where
        F: Fn(&JobCommand) -> SimulatedOutcome + Send + Sync + 'static,
    {
        Self {
            behaviour: Arc::new(behaviour),
            jobs: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Jobs currently running.
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running jobs observed.
    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    /// Accepted submissions so far.
    pub fn submissions(&self) -> usize {
        self.counters.submissions.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> usize {
        self.counters.cancellations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn submit(
        &self,
        command: &JobCommand,
        _resources: &ResourceRequest,
    ) -> BackendResult<BackendJobId> {
        let (delay, code, stdout) = match (self.behaviour)(command) {
            SimulatedOutcome::Unreachable { message } => {
                return Err(BackendError::Unreachable { message })
            }
            SimulatedOutcome::Hang => (None, 0, String::new()),
            SimulatedOutcome::Exit {
                code,
                stdout,
                delay,
            } => (Some(delay), code, stdout),
        };

        let job_id = format!("sim-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.jobs.insert(
            job_id.clone(),
            SimJob {
                state: BackendJobState::Running,
                cancel: Some(cancel_tx),
            },
        );
        self.counters.submissions.fetch_add(1, Ordering::SeqCst);
        self.counters.start();

        let jobs = Arc::clone(&self.jobs);
        let counters = Arc::clone(&self.counters);
        let id = job_id.clone();
        tokio::spawn(async move {
            let run = async {
                match delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let state = tokio::select! {
                _ = run => BackendJobState::Completed(ProcessOutput {
                    exit_code: Some(code),
                    stdout,
                    stderr: String::new(),
                }),
                _ = cancel_rx => {
                    counters.cancellations.fetch_add(1, Ordering::SeqCst);
                    BackendJobState::Lost { reason: "cancelled".to_string() }
                }
            };
            if let Some(mut job) = jobs.get_mut(&id) {
                job.state = state;
                job.cancel = None;
            }
            counters.finish();
        });

        Ok(job_id)
    }

    async fn status(&self, job_id: &BackendJobId) -> BackendResult<BackendJobState> {
        let state = self
            .jobs
            .get(job_id)
            .map(|job| job.state.clone())
            .ok_or_else(|| BackendError::UnknownJob {
                job_id: job_id.clone(),
            })?;
        if state.is_terminal() {
            self.jobs.remove(job_id);
        }
        Ok(state)
    }

    async fn cancel(&self, job_id: &BackendJobId) -> BackendResult<()> {
        let mut job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BackendError::UnknownJob {
                job_id: job_id.clone(),
            })?;
        if let Some(cancel) = job.cancel.take() {
            let _ = cancel.send(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_types::SolveStatus;

    #[tokio::test]
    async fn exit_after_delay() {
        let backend = SimulatedBackend::new(|_| {
            SimulatedOutcome::report(
                &SolverReport::solved(SolveStatus::Optimal, 2.0),
                Duration::from_millis(20),
            )
        });
        let id = backend
            .submit(&JobCommand::new("solver", vec![]), &ResourceRequest::default())
            .await
            .unwrap();
        assert_eq!(backend.status(&id).await.unwrap(), BackendJobState::Running);
        assert_eq!(backend.active(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        match backend.status(&id).await.unwrap() {
            BackendJobState::Completed(output) => {
                let report = SolverReport::from_stdout(&output.stdout).unwrap();
                assert_eq!(report.solve_time, 2.0);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(backend.active(), 0);
        assert!(backend.status(&id).await.is_err());
    }

    #[tokio::test]
    async fn hang_until_cancelled() {
        let backend = SimulatedBackend::new(|_| SimulatedOutcome::Hang);
        let id = backend
            .submit(&JobCommand::new("solver", vec![]), &ResourceRequest::default())
            .await
            .unwrap();
        backend.cancel(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            backend.status(&id).await.unwrap(),
            BackendJobState::Lost { .. }
        ));
        assert_eq!(backend.cancellations(), 1);
        assert_eq!(backend.active(), 0);
    }

    #[tokio::test]
    async fn unreachable_refuses_submission() {
        let backend = SimulatedBackend::new(|_| SimulatedOutcome::Unreachable {
            message: "scheduler down".into(),
        });
        let err = backend
            .submit(&JobCommand::new("solver", vec![]), &ResourceRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unreachable { .. }));
        assert_eq!(backend.submissions(), 0);
    }
}
