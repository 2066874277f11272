//! On-disk layout of a search run and the persisted search state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use cs_dispatch::AppendLog;
use cs_types::{ConfigurationId, CsResult, InstanceId, ScoreMetric, SearchError};

use crate::state::{ObjectiveDirection, RoundRecord, RunId, SearchState, Termination};

/// File names under a run's output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run(&self) -> PathBuf {
        self.root.join("run.json")
    }

    pub fn rounds(&self) -> PathBuf {
        self.root.join("rounds.jsonl")
    }

    pub fn evaluations(&self) -> PathBuf {
        self.root.join("evaluations.jsonl")
    }

    pub fn configs(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn baseline(&self) -> PathBuf {
        self.root.join("baseline.json")
    }

    pub fn subset(&self) -> PathBuf {
        self.root.join("subset.json")
    }

    pub fn embeddings(&self) -> PathBuf {
        self.root.join("embeddings.json")
    }

    pub fn projection(&self) -> PathBuf {
        self.root.join("projection.csv")
    }
}

/// Lifecycle of a run as recorded in `run.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "termination", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished(Termination),
}

/// Best round summary kept in `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestSummary {
    pub round: u32,
    pub configuration_id: ConfigurationId,
    pub score: f64,
}

/// Run metadata, rewritten atomically after every round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub seed: u64,
    pub direction: ObjectiveDirection,
    pub metric: ScoreMetric,
    pub strategy: String,
    pub subset: Vec<InstanceId>,
    pub status: RunStatus,
    pub completed_rounds: u32,
    pub best: Option<BestSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunMetadata {
    pub fn new(
        seed: u64,
        direction: ObjectiveDirection,
        metric: ScoreMetric,
        strategy: impl Into<String>,
        subset: Vec<InstanceId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            seed,
            direction,
            metric,
            strategy: strategy.into(),
            subset,
            status: RunStatus::Running,
            completed_rounds: 0,
            best: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn load(path: &Path) -> CsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Why a resumed run cannot continue from this metadata, if it cannot.
    fn incompatibility(&self, other: &RunMetadata) -> Option<String> {
        if self.seed != other.seed {
            return Some(format!("seed {} != {}", self.seed, other.seed));
        }
        if self.direction != other.direction {
            return Some("objective direction differs".to_string());
        }
        if self.metric != other.metric {
            return Some(format!("metric {} != {}", self.metric, other.metric));
        }
        if self.subset != other.subset {
            return Some("instance subset differs".to_string());
        }
        None
    }
}

/// Persistence for a search run: `run.json` plus the `rounds.jsonl`
/// append-only log. Rounds are durable once `record_round` returns.
#[derive(Debug)]
pub struct SearchJournal {
    layout: OutputLayout,
    metadata: RunMetadata,
    rounds: AppendLog<RoundRecord>,
}

impl SearchJournal {
    /// Start a new run in `layout`, or resume the one already there.
    ///
    /// Resuming requires the stored seed, direction, metric and subset to
    /// match `template`.
    pub fn open(layout: OutputLayout, template: RunMetadata) -> CsResult<(Self, SearchState)> {
        std::fs::create_dir_all(layout.root())?;
        let run_path = layout.run();

        let (mut metadata, resumed) = if run_path.exists() {
            let stored = RunMetadata::load(&run_path)?;
            if let Some(message) = stored.incompatibility(&template) {
                return Err(SearchError::StateMismatch {
                    path: run_path,
                    message,
                }
                .into());
            }
            (stored, true)
        } else {
            (template, false)
        };

        let rounds = AppendLog::open(layout.rounds())?;
        let records: Vec<RoundRecord> = rounds.read_all()?;
        for (idx, record) in records.iter().enumerate() {
            if record.round as usize != idx {
                return Err(SearchError::StateCorrupted {
                    message: format!("round {} recorded at position {idx}", record.round),
                }
                .into());
            }
        }
        if (records.len() as u32) < metadata.completed_rounds {
            return Err(SearchError::StateCorrupted {
                message: format!(
                    "run.json reports {} rounds but the round log holds {}",
                    metadata.completed_rounds,
                    records.len()
                ),
            }
            .into());
        }
        if !resumed && !records.is_empty() {
            return Err(SearchError::StateCorrupted {
                message: "round log present without run.json".to_string(),
            }
            .into());
        }

        let mut state = SearchState::new(metadata.run_id, metadata.direction);
        state.rounds = records;

        if resumed {
            info!(
                run = %metadata.run_id,
                rounds = state.len(),
                "Resuming search run"
            );
        } else {
            info!(run = %metadata.run_id, "Starting search run");
        }

        metadata.status = RunStatus::Running;
        let mut journal = Self {
            layout,
            metadata,
            rounds,
        };
        journal.sync_metadata(&state)?;
        Ok((journal, state))
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Persist the last round of `state`.
    pub fn record_round(&mut self, state: &SearchState) -> CsResult<()> {
        if let Some(record) = state.rounds.last() {
            self.rounds.append(record)?;
        }
        self.sync_metadata(state)
    }

    pub fn finish(&mut self, termination: Termination, state: &SearchState) -> CsResult<()> {
        self.metadata.status = RunStatus::Finished(termination);
        self.sync_metadata(state)
    }

    fn sync_metadata(&mut self, state: &SearchState) -> CsResult<()> {
        self.metadata.completed_rounds = state.next_round();
        self.metadata.best = state.best().map(|best| BestSummary {
            round: best.round,
            configuration_id: best.configuration.id,
            score: best.score,
        });
        self.metadata.updated_at = Utc::now();
        write_atomic(&self.layout.run(), &self.metadata)
    }
}

/// Replace `path` with the JSON of `value` via a synced temporary file and a
/// rename.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> CsResult<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        warn!(path = ?path, error = %e, "Atomic rename failed");
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cs_types::{Configuration, ParameterMap, ParameterValue};

    fn template(seed: u64) -> RunMetadata {
        RunMetadata::new(
            seed,
            ObjectiveDirection::Minimize,
            ScoreMetric::SolveTime,
            "random",
            vec![InstanceId::new("a"), InstanceId::new("b")],
        )
    }

    fn record(round: u32, score: f64) -> RoundRecord {
        let mut params = ParameterMap::new();
        params.insert("x".into(), ParameterValue::Int(round as i64));
        RoundRecord::scored(round, Configuration::new(format!("round-{round}"), params), score)
    }

    #[test]
    fn rounds_persist_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());

        let (mut journal, mut state) = SearchJournal::open(layout.clone(), template(7)).unwrap();
        let run_id = journal.metadata().run_id;
        for (round, score) in [(0, 3.0), (1, 1.0), (2, 1.0)] {
            state.push(record(round, score));
            journal.record_round(&state).unwrap();
        }
        journal.finish(Termination::BudgetExhausted, &state).unwrap();
        drop(journal);

        let stored = RunMetadata::load(&layout.run()).unwrap();
        assert_eq!(stored.status, RunStatus::Finished(Termination::BudgetExhausted));
        assert_eq!(stored.completed_rounds, 3);
        assert_eq!(stored.best.as_ref().unwrap().round, 1);

        let (journal, resumed) = SearchJournal::open(layout, template(7)).unwrap();
        assert_eq!(journal.metadata().run_id, run_id);
        assert_eq!(journal.metadata().status, RunStatus::Running);
        assert_eq!(resumed.run_id, run_id);
        assert_eq!(resumed.len(), 3);
        assert_eq!(resumed.best().unwrap().configuration.id, state.best().unwrap().configuration.id);
    }

    #[test]
    fn mismatched_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        SearchJournal::open(layout.clone(), template(7)).unwrap();

        let err = SearchJournal::open(layout, template(8)).unwrap_err();
        assert!(matches!(
            err,
            cs_types::CsError::Search(SearchError::StateMismatch { .. })
        ));
    }

    #[test]
    fn out_of_order_rounds_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path());
        let (journal, _) = SearchJournal::open(layout.clone(), template(1)).unwrap();
        drop(journal);

        let log: AppendLog<RoundRecord> = AppendLog::open(layout.rounds()).unwrap();
        log.append(&record(1, 1.0)).unwrap();
        drop(log);

        let err = SearchJournal::open(layout, template(1)).unwrap_err();
        assert!(matches!(
            err,
            cs_types::CsError::Search(SearchError::StateCorrupted { .. })
        ));
    }
}
