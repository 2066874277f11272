//! # cs-optimizer
//!
//! Configuration search for CutSearch.
//!
//! Provides the cut-selector search space, proposal strategies (grid, random,
//! model-guided), round aggregation, baseline runs, the resumable search
//! state journal and the search loop that ties them to the job dispatcher.

mod aggregate;
mod baseline;
mod evaluate;
mod journal;
mod search;
mod search_loop;
mod state;

pub use aggregate::{aggregate, Aggregation, AggregationConfig, RoundScore};
pub use baseline::{generate_baseline, Baseline, TimeLimitPolicy};
pub use evaluate::{interrupted, Evaluator, EvaluatorConfig, RoundEvaluation, RoundPlan};
pub use journal::{
    write_atomic, BestSummary, OutputLayout, RunMetadata, RunStatus, SearchJournal,
};
pub use search::{
    BayesianSearch, GridSearch, ParameterDef, ParameterKind, RandomSearch, SearchSpace,
    SearchStrategy, StrategyConfig,
};
pub use search_loop::{SearchConfig, SearchEvent, SearchLoop, SearchOutcome};
pub use state::{ObjectiveDirection, RoundRecord, RunId, SearchState, Termination};
