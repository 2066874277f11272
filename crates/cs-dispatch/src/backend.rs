//! Execution backend abstraction.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Backend-assigned job identifier.
pub type BackendJobId = String;

/// A fully rendered command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Human-readable job name (scheduler job name, log field).
    pub label: String,
}

impl JobCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            label: program.clone(),
            program,
            args,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Resources requested for a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    /// Number of CPUs per job.
    pub cpus: u32,
    /// Memory in megabytes (0 = backend default).
    pub memory_mb: u64,
    /// Scheduler wall-time limit in seconds.
    pub wall_time_secs: Option<u64>,
    /// Scheduler partition / queue.
    pub partition: Option<String>,
    /// Scheduler account to charge.
    pub account: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 0,
            wall_time_secs: None,
            partition: None,
            account: None,
        }
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Backend view of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendJobState {
    Queued,
    Running,
    Completed(ProcessOutput),
    /// The backend lost track of the job or it ended without an output
    /// (cancelled, node failure, preemption).
    Lost { reason: String },
}

impl BackendJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Lost { .. })
    }
}

/// Errors surfaced by backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unreachable: {message}")]
    Unreachable { message: String },
    #[error("job not found: {job_id}")]
    UnknownJob { job_id: String },
    #[error("job rejected by backend: {reason}")]
    Rejected { reason: String },
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// "Run this command, tell me when it finishes, give me its exit status and
/// captured output."
///
/// Implementations may run processes locally (see
/// [`crate::local::LocalProcessBackend`]), go through a cluster scheduler
/// (see [`crate::slurm::SlurmBackend`]) or simulate execution in-process
/// (see [`crate::sim::SimulatedBackend`]).
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Submit a command. Returns the backend-assigned job id.
    async fn submit(
        &self,
        command: &JobCommand,
        resources: &ResourceRequest,
    ) -> BackendResult<BackendJobId>;

    /// Query the current state of a job.
    ///
    /// Backends may forget a job once a terminal state has been reported.
    async fn status(&self, job_id: &BackendJobId) -> BackendResult<BackendJobState>;

    /// Best-effort cancellation.
    async fn cancel(&self, job_id: &BackendJobId) -> BackendResult<()>;
}
