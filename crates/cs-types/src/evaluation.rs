use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::configuration::ConfigurationId;
use crate::instance::InstanceId;

/// Final status reported by the solver for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolveStatus {
    Optimal,
    Timelimit,
    Nodelimit,
    Memlimit,
    Gaplimit,
    Infeasible,
    Unbounded,
    /// Explicit failure marker emitted by the solver wrapper.
    Error,
    #[serde(other)]
    Unknown,
}

/// Machine-readable result of one solver run.
///
/// The solver prints this as a JSON object on the last non-empty line of its
/// standard output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverReport {
    pub status: SolveStatus,
    pub solve_time: f64,
    #[serde(default)]
    pub presolve_time: f64,
    #[serde(default)]
    pub num_nodes: u64,
    #[serde(default)]
    pub num_cuts: u64,
    #[serde(default)]
    pub num_lp_iterations: u64,
    #[serde(default)]
    pub num_sepa_rounds: u64,
    #[serde(default)]
    pub primal_bound: Option<f64>,
    #[serde(default)]
    pub dual_bound: Option<f64>,
    #[serde(default)]
    pub gap: Option<f64>,
    #[serde(default)]
    pub primal_dual_integral: Option<f64>,
    /// Free-form message, usually set together with `status = "error"`.
    #[serde(default)]
    pub message: Option<String>,
}

impl SolverReport {
    /// Parse the report from captured standard output.
    pub fn from_stdout(stdout: &str) -> Result<Self, String> {
        let line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| "solver produced no output".to_string())?;
        serde_json::from_str(line).map_err(|e| format!("unparseable solver report {line:?}: {e}"))
    }

    pub fn is_error(&self) -> bool {
        self.status == SolveStatus::Error
    }

    /// A minimal report, convenient for simulated solvers and tests.
    pub fn solved(status: SolveStatus, solve_time: f64) -> Self {
        Self {
            status,
            solve_time,
            presolve_time: 0.0,
            num_nodes: 0,
            num_cuts: 0,
            num_lp_iterations: 0,
            num_sepa_rounds: 0,
            primal_bound: None,
            dual_bound: None,
            gap: None,
            primal_dual_integral: None,
            message: None,
        }
    }
}

/// Which report field becomes the per-instance score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMetric {
    #[default]
    SolveTime,
    PrimalDualIntegral,
    Nodes,
    Gap,
}

impl ScoreMetric {
    pub fn extract(&self, report: &SolverReport) -> Option<f64> {
        let value = match self {
            Self::SolveTime => Some(report.solve_time),
            Self::PrimalDualIntegral => report.primal_dual_integral,
            Self::Nodes => Some(report.num_nodes as f64),
            Self::Gap => report.gap,
        };
        value.filter(|v| v.is_finite())
    }
}

impl std::fmt::Display for ScoreMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SolveTime => "solve_time",
            Self::PrimalDualIntegral => "primal_dual_integral",
            Self::Nodes => "nodes",
            Self::Gap => "gap",
        };
        f.write_str(name)
    }
}

/// Classification of a failed evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BackendUnreachable,
    NonZeroExit,
    Timeout,
    MalformedOutput,
    SolverError,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BackendUnreachable => "backend unreachable",
            Self::NonZeroExit => "non-zero exit",
            Self::Timeout => "timeout",
            Self::MalformedOutput => "malformed output",
            Self::SolverError => "solver error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Score or explicit failure marker of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Score { value: f64 },
    Failure { kind: FailureKind, message: String },
}

impl Outcome {
    pub fn score(&self) -> Option<f64> {
        match self {
            Self::Score { value } => Some(*value),
            Self::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Score { .. } => None,
            Self::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Record of one (configuration, instance) evaluation.
///
/// Records are append-only: a re-evaluation produces a new record and the
/// aggregation step trusts the latest one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub configuration_id: ConfigurationId,
    pub instance_id: InstanceId,
    pub outcome: Outcome,
    /// Wall-clock cost in seconds, across all attempts.
    pub wall_clock_secs: f64,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub report: Option<SolverReport>,
}

impl EvaluationResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Score { .. })
    }
}
