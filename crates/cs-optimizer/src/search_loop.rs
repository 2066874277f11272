//! The configuration search loop.
//!
//! Rounds run strictly one after another:
//!
//! ```text
//! INIT -> PROPOSE -> DISPATCH -> COLLECT -> UPDATE -> (PROPOSE | TERMINATE)
//! ```
//!
//! Each round evaluates one configuration on every subset instance through
//! the [`Evaluator`], aggregates the per-instance scores and persists the
//! round before the next proposal. A round cut short by an interrupt or by
//! the wall-time budget is discarded; the state as of the last completed
//! round stays valid and resumable.

use chrono::Utc;
use crossbeam_channel::Sender;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cs_types::{
    Configuration, ConfigurationId, CsResult, Instance, InstanceId, ScoreMetric, SearchError,
};

use crate::aggregate::{aggregate, Aggregation, AggregationConfig};
use crate::baseline::{Baseline, TimeLimitPolicy};
use crate::evaluate::{Evaluator, RoundPlan};
use crate::journal::{OutputLayout, RunMetadata, SearchJournal};
use crate::search::{SearchSpace, SearchStrategy, StrategyConfig};
use crate::state::{ObjectiveDirection, RoundRecord, SearchState, Termination};

/// Search loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Total rounds, counting rounds completed before a resume.
    pub max_rounds: Option<u32>,
    /// Wall-time budget of this invocation, in seconds.
    pub max_wall_time_secs: Option<u64>,
    /// Global timeout for collecting one round's jobs, in seconds.
    pub round_timeout_secs: u64,
    /// Run seed; round `r` proposes with a generator seeded from
    /// `seed + r`.
    pub seed: u64,
    /// Evaluate the space's default configuration as round 0.
    pub evaluate_default_first: bool,
    pub strategy: StrategyConfig,
    pub metric: ScoreMetric,
    pub direction: ObjectiveDirection,
    pub aggregation: AggregationConfig,
    pub time_limits: TimeLimitPolicy,
    /// Score instances as ratios to the baseline when one is loaded.
    pub normalize_to_baseline: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_rounds: Some(50),
            max_wall_time_secs: None,
            round_timeout_secs: 4 * 3600,
            seed: 0,
            evaluate_default_first: true,
            strategy: StrategyConfig::default(),
            metric: ScoreMetric::default(),
            direction: ObjectiveDirection::default(),
            aggregation: AggregationConfig::default(),
            time_limits: TimeLimitPolicy::default(),
            normalize_to_baseline: false,
        }
    }
}

impl SearchConfig {
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    pub fn with_max_wall_time(mut self, wall_time: Duration) -> Self {
        self.max_wall_time_secs = Some(wall_time.as_secs());
        self
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_default_first(mut self, enabled: bool) -> Self {
        self.evaluate_default_first = enabled;
        self
    }

    pub fn with_objective(mut self, metric: ScoreMetric, direction: ObjectiveDirection) -> Self {
        self.metric = metric;
        self.direction = direction;
        self
    }

    pub fn with_aggregation(mut self, aggregation: AggregationConfig) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn with_time_limits(mut self, time_limits: TimeLimitPolicy) -> Self {
        self.time_limits = time_limits;
        self
    }

    pub fn with_baseline_normalization(mut self, enabled: bool) -> Self {
        self.normalize_to_baseline = enabled;
        self
    }

    /// Budget and limit sanity checks done at INIT.
    pub fn validate(&self) -> Result<(), SearchError> {
        let invalid = |message: &str| SearchError::InvalidBudget {
            message: message.to_string(),
        };
        if self.max_rounds.is_none() && self.max_wall_time_secs.is_none() {
            return Err(invalid("either max_rounds or max_wall_time_secs must be set"));
        }
        if self.max_rounds == Some(0) {
            return Err(invalid("max_rounds must be positive"));
        }
        if self.max_wall_time_secs == Some(0) {
            return Err(invalid("max_wall_time_secs must be positive"));
        }
        if self.round_timeout_secs == 0 {
            return Err(invalid("round_timeout_secs must be positive"));
        }
        let fraction = self.aggregation.min_success_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(invalid("min_success_fraction must lie in [0, 1]"));
        }
        if !self.aggregation.penalty.is_finite() {
            return Err(invalid("penalty must be finite"));
        }
        if let Aggregation::ShiftedGeometricMean { shift } = self.aggregation.method {
            // Needs positive `value + shift`; a maximizing penalty is negative.
            if self.direction == ObjectiveDirection::Maximize {
                return Err(invalid("shifted geometric mean only supports minimization"));
            }
            if !(shift.is_finite() && shift >= 0.0) {
                return Err(invalid("geometric mean shift must be finite and non-negative"));
            }
        }
        self.time_limits.validate()
    }
}

/// Progress notifications for observers of a running search.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    RoundCompleted {
        round: u32,
        configuration_id: ConfigurationId,
        score: f64,
        penalized: bool,
        succeeded: usize,
        failed: usize,
        timed_out: usize,
    },
    NewBest {
        round: u32,
        configuration_id: ConfigurationId,
        score: f64,
    },
    Terminated {
        termination: Termination,
        rounds: u32,
    },
}

/// Final report of a search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: Option<RoundRecord>,
    pub state: SearchState,
    pub termination: Termination,
    /// Rounds that received the penalty score.
    pub failed_rounds: usize,
}

/// Orchestrates rounds over a fixed instance subset.
pub struct SearchLoop {
    config: SearchConfig,
    space: SearchSpace,
    strategy: Box<dyn SearchStrategy>,
    evaluator: Evaluator,
    layout: OutputLayout,
    baseline: Option<Baseline>,
    events: Option<Sender<SearchEvent>>,
}

impl std::fmt::Debug for SearchLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchLoop")
            .field("config", &self.config)
            .field("strategy", &self.strategy.name())
            .field("output", &self.layout.root())
            .field("baseline", &self.baseline.is_some())
            .finish()
    }
}

impl SearchLoop {
    pub fn new(
        config: SearchConfig,
        space: SearchSpace,
        evaluator: Evaluator,
        layout: OutputLayout,
    ) -> Self {
        let strategy = config.strategy.build(space.clone(), config.direction);
        Self {
            config,
            space,
            strategy,
            evaluator,
            layout,
            baseline: None,
            events: None,
        }
    }

    /// Replace the strategy built from the configuration.
    pub fn with_strategy(mut self, strategy: Box<dyn SearchStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use baseline reports for time limits and, if enabled, normalization.
    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = Some(baseline);
        self
    }

    pub fn with_events(mut self, events: Sender<SearchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: SearchEvent) {
        if let Some(events) = &self.events {
            // A departed observer does not stop the search.
            let _ = events.send(event);
        }
    }

    fn time_limits(&self, instances: &[Instance]) -> Vec<f64> {
        instances
            .iter()
            .map(|instance| match &self.baseline {
                Some(baseline) => baseline.time_limit(&instance.id, &self.config.time_limits),
                None => self.config.time_limits.limit_for(None),
            })
            .collect()
    }

    fn propose(&mut self, state: &SearchState) -> Option<Configuration> {
        let round = state.next_round();
        if round == 0 && self.config.evaluate_default_first {
            if let Some(defaults) = self.space.defaults() {
                return Some(Configuration::new("default", defaults));
            }
            warn!("Search space has no complete default; skipping the default round");
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(round as u64));
        self.strategy
            .propose(state.history(), &mut rng)
            .map(|params| Configuration::new(format!("round-{round}"), params))
    }

    /// Run the search on `subset` until the budget is exhausted, the
    /// strategy runs dry, or `shutdown` turns true.
    pub async fn run(
        &mut self,
        subset: &[Instance],
        mut shutdown: watch::Receiver<bool>,
    ) -> CsResult<SearchOutcome> {
        // INIT
        self.config.validate()?;
        self.space.check()?;
        if subset.is_empty() {
            return Err(SearchError::EmptySubset.into());
        }
        let subset_ids: Vec<InstanceId> = subset.iter().map(|i| i.id.clone()).collect();
        let template = RunMetadata::new(
            self.config.seed,
            self.config.direction,
            self.config.metric,
            self.strategy.name(),
            subset_ids.clone(),
        );
        let (mut journal, mut state) = SearchJournal::open(self.layout.clone(), template)?;

        let started = Instant::now();
        let wall_deadline = self
            .config
            .max_wall_time_secs
            .map(|secs| started + Duration::from_secs(secs));
        let time_limits = self.time_limits(subset);

        info!(
            run = %state.run_id,
            strategy = self.strategy.name(),
            instances = subset.len(),
            completed_rounds = state.len(),
            max_rounds = ?self.config.max_rounds,
            "Search loop started"
        );

        let termination = loop {
            if *shutdown.borrow() {
                break Termination::Interrupted;
            }
            if let Some(max) = self.config.max_rounds {
                if state.next_round() >= max {
                    break Termination::BudgetExhausted;
                }
            }
            if wall_deadline.is_some_and(|d| Instant::now() >= d) {
                break Termination::BudgetExhausted;
            }

            // PROPOSE
            let round = state.next_round();
            let Some(configuration) = self.propose(&state) else {
                info!(round, "Strategy exhausted");
                break Termination::StrategyExhausted;
            };
            self.space.validate(&configuration.parameters)?;
            debug!(round, configuration = %configuration.id, params = ?configuration.parameters, "Proposed configuration");

            // DISPATCH + COLLECT
            let round_deadline = Instant::now() + Duration::from_secs(self.config.round_timeout_secs);
            let (deadline, budget_cut) = match wall_deadline {
                Some(wall) if wall < round_deadline => (wall, true),
                _ => (round_deadline, false),
            };
            let round_started = Utc::now();
            let plan = RoundPlan {
                configuration: &configuration,
                instances: subset,
                time_limits: time_limits.clone(),
                metric: self.config.metric,
                deadline,
            };
            let evaluation = self.evaluator.evaluate(&plan, &mut shutdown).await?;

            if evaluation.interrupted {
                info!(round, "Round interrupted; results discarded");
                break Termination::Interrupted;
            }
            if budget_cut && !evaluation.unfinished.is_empty() {
                info!(round, "Wall-time budget reached mid-round; results discarded");
                break Termination::BudgetExhausted;
            }

            // UPDATE
            let baseline = self
                .baseline
                .as_ref()
                .filter(|_| self.config.normalize_to_baseline);
            let metric = self.config.metric;
            let score = aggregate(
                &self.config.aggregation,
                self.config.direction,
                &subset_ids,
                &evaluation.results,
                |id, value| match baseline {
                    Some(baseline) => baseline.normalize(id, metric, value),
                    None => value,
                },
            );

            let record = RoundRecord {
                round,
                configuration,
                score: score.score,
                penalized: score.penalized,
                succeeded: score.succeeded,
                failed: score.failed,
                timed_out: score.timed_out,
                instance_scores: score.instance_scores,
                started_at: round_started,
                finished_at: Utc::now(),
            };
            let configuration_id = record.configuration.id;

            if record.penalized {
                warn!(
                    round,
                    configuration = %configuration_id,
                    succeeded = record.succeeded,
                    failed = record.failed,
                    timed_out = record.timed_out,
                    "Round failed; configuration penalized"
                );
            } else {
                info!(
                    round,
                    configuration = %configuration_id,
                    score = record.score,
                    succeeded = record.succeeded,
                    failed = record.failed,
                    timed_out = record.timed_out,
                    "Round completed"
                );
            }
            self.emit(SearchEvent::RoundCompleted {
                round,
                configuration_id,
                score: record.score,
                penalized: record.penalized,
                succeeded: record.succeeded,
                failed: record.failed,
                timed_out: record.timed_out,
            });

            let score = record.score;
            let improved = state.push(record);
            journal.record_round(&state)?;

            if improved {
                info!(round, configuration = %configuration_id, score, "New best configuration");
                self.emit(SearchEvent::NewBest {
                    round,
                    configuration_id,
                    score,
                });
            }
        };

        // TERMINATE
        journal.finish(termination, &state)?;
        let failed_rounds = state.penalized_rounds();
        let best = state.best().cloned();

        match &best {
            Some(best) => info!(
                reason = %termination,
                rounds = state.len(),
                failed_rounds,
                best_round = best.round,
                best_configuration = %best.configuration.id,
                best_score = best.score,
                "Search finished"
            ),
            None => info!(reason = %termination, rounds = 0, "Search finished without completed rounds"),
        }
        if failed_rounds > 0 {
            warn!(failed_rounds, "Some rounds were penalized");
        }
        self.emit(SearchEvent::Terminated {
            termination,
            rounds: state.next_round(),
        });

        Ok(SearchOutcome {
            best,
            state,
            termination,
            failed_rounds,
        })
    }
}
