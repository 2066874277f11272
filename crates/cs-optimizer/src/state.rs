//! Search state: the history of evaluated configurations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use cs_types::{Configuration, InstanceId, ParameterMap};

/// Unique search run identifier.
pub type RunId = Uuid;

/// Whether we are maximizing or minimizing the aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    Maximize,
    #[default]
    Minimize,
}

impl ObjectiveDirection {
    /// Whether `candidate` strictly improves on `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }

    /// The penalty score for a failed evaluation, on the losing side.
    pub fn penalty(self, magnitude: f64) -> f64 {
        match self {
            Self::Maximize => -magnitude.abs(),
            Self::Minimize => magnitude.abs(),
        }
    }
}

/// Why a search ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Round or wall-time budget reached.
    BudgetExhausted,
    /// The strategy had nothing left to propose.
    StrategyExhausted,
    /// Stopped by an external interrupt.
    Interrupted,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BudgetExhausted => "budget exhausted",
            Self::StrategyExhausted => "strategy exhausted",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// One completed round: a configuration and its aggregate score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u32,
    pub configuration: Configuration,
    pub score: f64,
    /// The configuration failed the success threshold and received the
    /// penalty score.
    pub penalized: bool,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Per-instance score used in the aggregate; `None` for failures.
    #[serde(default)]
    pub instance_scores: BTreeMap<InstanceId, Option<f64>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RoundRecord {
    /// A record with a score and no per-instance detail.
    pub fn scored(round: u32, configuration: Configuration, score: f64) -> Self {
        let now = Utc::now();
        Self {
            round,
            configuration,
            score,
            penalized: false,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            instance_scores: BTreeMap::new(),
            started_at: now,
            finished_at: now,
        }
    }
}

/// History of a search run. The search loop is its only writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchState {
    pub run_id: RunId,
    pub direction: ObjectiveDirection,
    pub rounds: Vec<RoundRecord>,
}

impl SearchState {
    pub fn new(run_id: RunId, direction: ObjectiveDirection) -> Self {
        Self {
            run_id,
            direction,
            rounds: Vec::new(),
        }
    }

    /// Index of the next round to run.
    pub fn next_round(&self) -> u32 {
        self.rounds.len() as u32
    }

    pub fn history(&self) -> &[RoundRecord] {
        &self.rounds
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    /// Best round by aggregate score; ties go to the earliest round.
    pub fn best(&self) -> Option<&RoundRecord> {
        self.rounds.iter().fold(None, |best, record| match best {
            Some(current) if !self.direction.is_better(record.score, current.score) => Some(current),
            _ => Some(record),
        })
    }

    /// Append a round; returns whether it is the new best.
    pub fn push(&mut self, record: RoundRecord) -> bool {
        let improves = match self.best() {
            Some(best) => self.direction.is_better(record.score, best.score),
            None => true,
        };
        self.rounds.push(record);
        improves
    }

    pub fn contains(&self, params: &ParameterMap) -> bool {
        self.rounds
            .iter()
            .any(|r| &r.configuration.parameters == params)
    }

    pub fn penalized_rounds(&self) -> usize {
        self.rounds.iter().filter(|r| r.penalized).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_types::ParameterValue;

    fn round(n: u32, score: f64) -> RoundRecord {
        let mut params = ParameterMap::new();
        params.insert("x".into(), ParameterValue::Int(n as i64));
        RoundRecord::scored(n, Configuration::new(format!("round-{n}"), params), score)
    }

    #[test]
    fn best_prefers_earliest_on_ties() {
        let mut state = SearchState::new(Uuid::new_v4(), ObjectiveDirection::Minimize);
        assert!(state.best().is_none());

        assert!(state.push(round(0, 10.0)));
        assert!(state.push(round(1, 5.0)));
        assert!(!state.push(round(2, 5.0)));
        assert!(!state.push(round(3, 7.0)));

        assert_eq!(state.best().unwrap().round, 1);
        assert_eq!(state.next_round(), 4);
    }

    #[test]
    fn maximize_direction() {
        let mut state = SearchState::new(Uuid::new_v4(), ObjectiveDirection::Maximize);
        state.push(round(0, 1.0));
        state.push(round(1, 3.0));
        state.push(round(2, 2.0));
        assert_eq!(state.best().unwrap().round, 1);
        assert_eq!(ObjectiveDirection::Maximize.penalty(100.0), -100.0);
        assert_eq!(ObjectiveDirection::Minimize.penalty(100.0), 100.0);
    }

    #[test]
    fn serialized_state_reproduces_best() {
        let mut state = SearchState::new(Uuid::new_v4(), ObjectiveDirection::Minimize);
        for (n, score) in [(0, 4.0), (1, 2.5), (2, 2.5), (3, 9.0)] {
            state.push(round(n, score));
        }
        let json = serde_json::to_string(&state).unwrap();
        let restored: SearchState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.len(), state.len());
        assert_eq!(
            restored.best().unwrap().configuration.id,
            state.best().unwrap().configuration.id
        );
        assert!(restored.contains(&state.rounds[3].configuration.parameters));
    }
}
