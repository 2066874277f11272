//! Local process backend.
//!
//! Every submitted command runs immediately as a child process; queueing and
//! concurrency limits are left to the dispatcher.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;

use crate::backend::{
    BackendError, BackendJobId, BackendJobState, BackendResult, ExecutionBackend, JobCommand,
    ProcessOutput, ResourceRequest,
};

#[derive(Debug)]
struct LocalJob {
    state: BackendJobState,
    cancel: Option<oneshot::Sender<()>>,
}

/// Runs jobs as local child processes
#[derive(Debug, Default)]
pub struct LocalProcessBackend {
    jobs: Arc<DashMap<BackendJobId, LocalJob>>,
    next_id: AtomicU64,
}

impl LocalProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs whose terminal state has not been collected yet.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl ExecutionBackend for LocalProcessBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(
        &self,
        command: &JobCommand,
        _resources: &ResourceRequest,
    ) -> BackendResult<BackendJobId> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| BackendError::Rejected {
            reason: format!("failed to start {}: {e}", command.program),
        })?;

        let job_id = format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.jobs.insert(
            job_id.clone(),
            LocalJob {
                state: BackendJobState::Running,
                cancel: Some(cancel_tx),
            },
        );
        debug!(job = %job_id, label = %command.label, pid = ?child.id(), "Started local process");

        let jobs = Arc::clone(&self.jobs);
        let id = job_id.clone();
        tokio::spawn(async move {
            // Dropping the wait future on cancellation drops the child, which
            // kills it.
            let state = tokio::select! {
                result = child.wait_with_output() => match result {
                    Ok(output) => BackendJobState::Completed(ProcessOutput {
                        exit_code: output.status.code(),
                        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    }),
                    Err(e) => BackendJobState::Lost {
                        reason: format!("failed to collect process output: {e}"),
                    },
                },
                _ = cancel_rx => BackendJobState::Lost {
                    reason: "cancelled".to_string(),
                },
            };
            if let Some(mut job) = jobs.get_mut(&id) {
                job.state = state;
                job.cancel = None;
            }
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

    /// Kill the process and forget the job; its id becomes unknown.
    async fn cancel(&self, job_id: &BackendJobId) -> BackendResult<()> {
        let (_, mut job) = self
            .jobs
            .remove(job_id)
            .ok_or_else(|| BackendError::UnknownJob {
                job_id: job_id.clone(),
            })?;
        if let Some(cancel) = job.cancel.take() {
            let _ = cancel.send(());
        }
        debug!(job = %job_id, "Cancelled local process");
        Ok(())
    }
}
