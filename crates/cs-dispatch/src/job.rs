use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cs_types::{ConfigurationId, EvaluationResult, Instance, InstanceId, ScoreMetric};

use crate::backend::{JobCommand, ResourceRequest};

/// Dispatcher-assigned job handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(Uuid);

impl JobHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One evaluation job: run the solver on one instance with one configuration.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub configuration_id: ConfigurationId,
    pub instance_id: InstanceId,
    pub command: JobCommand,
    pub resources: ResourceRequest,
    /// Per-attempt timeout, measured from backend submission.
    pub timeout: Duration,
    /// Overrides the dispatcher's retry count.
    pub max_retries: Option<u32>,
    pub metric: ScoreMetric,
}

impl JobSpec {
    pub fn new(
        configuration_id: ConfigurationId,
        instance_id: InstanceId,
        command: JobCommand,
        timeout: Duration,
    ) -> Self {
        Self {
            configuration_id,
            instance_id,
            command,
            resources: ResourceRequest::default(),
            timeout,
            max_retries: None,
            metric: ScoreMetric::default(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_metric(mut self, metric: ScoreMetric) -> Self {
        self.metric = metric;
        self
    }
}

/// Caller view of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Succeeded(EvaluationResult),
    Failed(EvaluationResult),
    TimedOut(EvaluationResult),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn result(&self) -> Option<&EvaluationResult> {
        match self {
            Self::Pending => None,
            Self::Succeeded(r) | Self::Failed(r) | Self::TimedOut(r) => Some(r),
        }
    }

    pub fn into_result(self) -> Option<EvaluationResult> {
        match self {
            Self::Pending => None,
            Self::Succeeded(r) | Self::Failed(r) | Self::TimedOut(r) => Some(r),
        }
    }
}

/// How the solver is invoked.
///
/// `args` is a template; these placeholders are substituted per job:
/// `{instance}`, `{instance_id}`, `{solution}` (empty without a reference
/// solution), `{config}` (path of the configuration JSON file),
/// `{time_limit}` (seconds) and `{seed}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for SolverInvocation {
    fn default() -> Self {
        Self {
            program: "cutsel-solve".to_string(),
            args: [
                "--instance",
                "{instance}",
                "--solution",
                "{solution}",
                "--config",
                "{config}",
                "--time-limit",
                "{time_limit}",
                "--seed",
                "{seed}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            working_dir: None,
        }
    }
}

/// Values substituted into a [`SolverInvocation`] template.
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub instance: &'a Instance,
    pub config_path: &'a Path,
    pub time_limit_secs: f64,
    pub seed: u64,
}

impl SolverInvocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn render(&self, ctx: &InvocationContext<'_>) -> JobCommand {
        let solution = ctx
            .instance
            .solution
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let instance = ctx.instance.path.display().to_string();
        let config = ctx.config_path.display().to_string();
        let time_limit = format_seconds(ctx.time_limit_secs);
        let seed = ctx.seed.to_string();

        let args = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{instance_id}", ctx.instance.id.as_str())
                    .replace("{instance}", &instance)
                    .replace("{solution}", &solution)
                    .replace("{config}", &config)
                    .replace("{time_limit}", &time_limit)
                    .replace("{seed}", &seed)
            })
            .collect();

        let mut command = JobCommand::new(self.program.clone(), args)
            .with_label(format!("cs-{}", ctx.instance.id));
        command.working_dir = self.working_dir.clone();
        command
    }
}

/// Whole seconds print without a fractional part.
fn format_seconds(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as i64)
    } else {
        format!("{secs:.3}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_rendering() {
        let instance =
            Instance::new(InstanceId::new("air04"), "/pool/air04.mps.gz").with_solution("/sol/air04.sol");
        let invocation = SolverInvocation::default();
        let command = invocation.render(&InvocationContext {
            instance: &instance,
            config_path: Path::new("/run/configs/c1.json"),
            time_limit_secs: 120.0,
            seed: 7,
        });

        assert_eq!(command.program, "cutsel-solve");
        assert_eq!(
            command.args,
            vec![
                "--instance",
                "/pool/air04.mps.gz",
                "--solution",
                "/sol/air04.sol",
                "--config",
                "/run/configs/c1.json",
                "--time-limit",
                "120",
                "--seed",
                "7",
            ]
        );
        assert_eq!(command.label, "cs-air04");
    }

    #[test]
    fn instance_id_placeholder_is_not_shadowed() {
        let instance = Instance::new(InstanceId::new("p1"), "/pool/p1.mps");
        let invocation = SolverInvocation::new("solver", vec!["{instance_id}:{solution}".into()]);
        let command = invocation.render(&InvocationContext {
            instance: &instance,
            config_path: Path::new("c.json"),
            time_limit_secs: 12.5,
            seed: 0,
        });
        assert_eq!(command.args, vec!["p1:"]);
    }

    #[test]
    fn status_results() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(JobStatus::Pending.result().is_none());
    }
}
