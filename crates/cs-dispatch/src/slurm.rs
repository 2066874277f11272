//! Slurm scheduler backend (`sbatch`, `sacct`, `scancel`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{
    BackendError, BackendJobId, BackendJobState, BackendResult, ExecutionBackend, JobCommand,
    ProcessOutput, ResourceRequest,
};

/// Configuration for the Slurm backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    pub sbatch: String,
    pub sacct: String,
    pub scancel: String,
    /// Directory for captured job stdout / stderr files. Must be visible to
    /// the compute nodes.
    pub output_dir: PathBuf,
    /// Extra arguments passed verbatim to `sbatch`.
    pub extra_args: Vec<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            sacct: "sacct".to_string(),
            scancel: "scancel".to_string(),
            output_dir: PathBuf::from("slurm-output"),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct OutputFiles {
    stdout: PathBuf,
    stderr: PathBuf,
}

/// Submits jobs to a Slurm cluster
#[derive(Debug)]
pub struct SlurmBackend {
    config: SlurmConfig,
    outputs: DashMap<BackendJobId, OutputFiles>,
}

impl SlurmBackend {
    pub fn new(config: SlurmConfig) -> BackendResult<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        Ok(Self {
            config,
            outputs: DashMap::new(),
        })
    }

    async fn run(&self, program: &str, args: &[String]) -> BackendResult<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::Unreachable {
                message: format!("failed to run {program}: {e}"),
            })?;
        if !output.status.success() {
            return Err(BackendError::Unreachable {
                message: format!(
                    "{program} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ExecutionBackend for SlurmBackend {
    fn name(&self) -> &str {
        "slurm"
    }

    async fn submit(
        &self,
        command: &JobCommand,
        resources: &ResourceRequest,
    ) -> BackendResult<BackendJobId> {
        let stem = Uuid::new_v4();
        let files = OutputFiles {
            stdout: self.config.output_dir.join(format!("{stem}.out")),
            stderr: self.config.output_dir.join(format!("{stem}.err")),
        };

        let mut args = sbatch_args(command, resources, &files.stdout, &files.stderr);
        args.splice(0..0, self.config.extra_args.iter().cloned());

        let stdout = self.run(&self.config.sbatch, &args).await?;
        let job_id = parse_sbatch_id(&stdout).ok_or_else(|| BackendError::Rejected {
            reason: format!("unexpected sbatch output {:?}", stdout.trim()),
        })?;

        debug!(job = %job_id, label = %command.label, "Submitted Slurm job");
        self.outputs.insert(job_id.clone(), files);
        Ok(job_id)
    }

    async fn status(&self, job_id: &BackendJobId) -> BackendResult<BackendJobState> {
        let Some(files) = self.outputs.get(job_id).map(|f| f.value().clone()) else {
            return Err(BackendError::UnknownJob {
                job_id: job_id.clone(),
            });
        };

        let args: Vec<String> = ["-n", "-P", "-X", "-j", job_id.as_str(), "-o", "State,ExitCode"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let stdout = self.run(&self.config.sacct, &args).await?;

        // Freshly submitted jobs may not be visible to accounting yet.
        let Some((state, exit_code)) = parse_sacct(&stdout) else {
            return Ok(BackendJobState::Queued);
        };

        let state = match SlurmState::parse(&state) {
            SlurmState::Pending => BackendJobState::Queued,
            SlurmState::Running => BackendJobState::Running,
            SlurmState::Finished => BackendJobState::Completed(ProcessOutput {
                exit_code,
                stdout: read_lossy(&files.stdout),
                stderr: read_lossy(&files.stderr),
            }),
            SlurmState::Lost => BackendJobState::Lost { reason: state },
        };

        if state.is_terminal() {
            self.outputs.remove(job_id);
            for path in [&files.stdout, &files.stderr] {
                if let Err(e) = std::fs::remove_file(path) {
                    debug!(path = ?path, error = %e, "Could not remove job output file");
                }
            }
        }
        Ok(state)
    }

    async fn cancel(&self, job_id: &BackendJobId) -> BackendResult<()> {
        if let Err(e) = self.run(&self.config.scancel, &[job_id.clone()]).await {
            warn!(job = %job_id, error = %e, "scancel failed");
            return Err(e);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlurmState {
    Pending,
    Running,
    Finished,
    Lost,
}

impl SlurmState {
    fn parse(state: &str) -> Self {
        // sacct reports e.g. "CANCELLED by 1234".
        let head = state.split_whitespace().next().unwrap_or("");
        match head {
            "PENDING" | "REQUEUED" | "CONFIGURING" | "RESIZING" | "SUSPENDED" => Self::Pending,
            "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" => Self::Running,
            "COMPLETED" | "FAILED" | "OUT_OF_MEMORY" => Self::Finished,
            _ => Self::Lost,
        }
    }
}

fn read_lossy(path: &Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Build the `sbatch` argument list for a command.
pub fn sbatch_args(
    command: &JobCommand,
    resources: &ResourceRequest,
    stdout: &Path,
    stderr: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--parsable".to_string(),
        format!("--job-name={}", command.label),
        format!("--cpus-per-task={}", resources.cpus.max(1)),
        format!("--output={}", stdout.display()),
        format!("--error={}", stderr.display()),
    ];
    if resources.memory_mb > 0 {
        args.push(format!("--mem={}M", resources.memory_mb));
    }
    if let Some(secs) = resources.wall_time_secs {
        args.push(format!("--time={}", format_wall_time(secs)));
    }
    if let Some(partition) = &resources.partition {
        args.push(format!("--partition={partition}"));
    }
    if let Some(account) = &resources.account {
        args.push(format!("--account={account}"));
    }
    if let Some(dir) = &command.working_dir {
        args.push(format!("--chdir={}", dir.display()));
    }
    if !command.env.is_empty() {
        let exports: Vec<String> = command.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        args.push(format!("--export=ALL,{}", exports.join(",")));
    }

    let mut words = vec![command.program.clone()];
    words.extend(command.args.iter().cloned());
    args.push(format!("--wrap={}", shell_join(&words)));
    args
}

/// `HH:MM:SS`, rounding up to whole minutes as Slurm schedules per minute.
pub fn format_wall_time(secs: u64) -> String {
    let minutes = secs.div_ceil(60).max(1);
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

/// Quote words for `sh`.
pub fn shell_join(words: &[String]) -> String {
    words
        .iter()
        .map(|w| {
            let safe = !w.is_empty()
                && w.chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
            if safe {
                w.clone()
            } else {
                format!("'{}'", w.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `sbatch --parsable` prints `jobid` or `jobid;cluster`.
pub fn parse_sbatch_id(stdout: &str) -> Option<BackendJobId> {
    let first = stdout.lines().next()?.trim();
    let id = first.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

/// Parse `sacct -n -P -o State,ExitCode` output into the state and the exit
/// code. A non-zero signal in `code:signal` yields no exit code.
pub fn parse_sacct(stdout: &str) -> Option<(String, Option<i32>)> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split('|');
    let state = fields.next()?.trim().to_string();
    let exit = fields.next().unwrap_or("").trim();

    let mut parts = exit.split(':');
    let code = parts.next().and_then(|c| c.parse::<i32>().ok());
    let signal = parts.next().and_then(|s| s.parse::<i32>().ok()).unwrap_or(0);
    let exit_code = if signal != 0 { None } else { code };
    Some((state, exit_code))
}
