use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cs_types::{InstanceId, SolveStatus, SolverReport};

/// Criteria an instance's default-configuration run must meet to stay in the
/// pool: solved to optimality, neither trivial nor hopeless, and not
/// dominated by presolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    pub required_status: SolveStatus,
    pub min_nodes: u64,
    pub max_nodes: u64,
    /// Seconds.
    pub min_solve_time: f64,
    /// Seconds.
    pub max_presolve_time: f64,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self {
            required_status: SolveStatus::Optimal,
            min_nodes: 50,
            max_nodes: 20_000,
            min_solve_time: 5.0,
            max_presolve_time: 10.0,
        }
    }
}

/// Why an instance was dropped
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    NoBaseline,
    Status(SolveStatus),
    Nodes(u64),
    SolveTime(f64),
    PresolveTime(f64),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBaseline => write!(f, "no baseline run"),
            Self::Status(status) => write!(f, "status {status:?}"),
            Self::Nodes(nodes) => write!(f, "{nodes} nodes"),
            Self::SolveTime(t) => write!(f, "solve time {t:.2}s"),
            Self::PresolveTime(t) => write!(f, "presolve time {t:.2}s"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterOutcome {
    pub kept: Vec<InstanceId>,
    pub rejected: Vec<(InstanceId, Rejection)>,
}

impl FilterCriteria {
    pub fn with_node_range(mut self, min_nodes: u64, max_nodes: u64) -> Self {
        self.min_nodes = min_nodes;
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_min_solve_time(mut self, seconds: f64) -> Self {
        self.min_solve_time = seconds;
        self
    }

    pub fn with_max_presolve_time(mut self, seconds: f64) -> Self {
        self.max_presolve_time = seconds;
        self
    }

    pub fn check(&self, report: &SolverReport) -> Result<(), Rejection> {
        if report.status != self.required_status {
            return Err(Rejection::Status(report.status));
        }
        if report.num_nodes < self.min_nodes || report.num_nodes > self.max_nodes {
            return Err(Rejection::Nodes(report.num_nodes));
        }
        if report.solve_time < self.min_solve_time {
            return Err(Rejection::SolveTime(report.solve_time));
        }
        if report.presolve_time > self.max_presolve_time {
            return Err(Rejection::PresolveTime(report.presolve_time));
        }
        Ok(())
    }

    /// Split `ids` by their baseline reports; ids without a report are
    /// rejected.
    pub fn apply(
        &self,
        ids: &[InstanceId],
        reports: &BTreeMap<InstanceId, SolverReport>,
    ) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for id in ids {
            let verdict = match reports.get(id) {
                Some(report) => self.check(report),
                None => Err(Rejection::NoBaseline),
            };
            match verdict {
                Ok(()) => outcome.kept.push(id.clone()),
                Err(reason) => {
                    debug!(instance = %id, reason = %reason, "Filtered out instance");
                    outcome.rejected.push((id.clone(), reason));
                }
            }
        }
        info!(
            kept = outcome.kept.len(),
            rejected = outcome.rejected.len(),
            "Applied instance filter"
        );
        outcome
    }
}
