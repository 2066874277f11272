//! Search space definitions and configuration proposal strategies.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use cs_types::{ParameterMap, ParameterValue, SearchError};

use crate::state::{ObjectiveDirection, RoundRecord};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name as the solver wrapper expects it (e.g. "max_parallel").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
    /// The solver's own default for this parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParameterValue>,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// On / off switch.
    Bool,
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.push(name, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_bool(self, name: impl Into<String>) -> Self {
        self.push(name, ParameterKind::Bool)
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.push(name, ParameterKind::Choice { values })
    }

    /// Set the default of the most recently added parameter.
    pub fn default_value(mut self, value: impl Into<ParameterValue>) -> Self {
        if let Some(last) = self.parameters.last_mut() {
            last.default = Some(value.into());
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// The parameters of the ensemble cut selector with the solver's defaults.
    pub fn cut_selector_default() -> Self {
        Self::new()
            .add_float("isp", 0.0, 1.0)
            .default_value(0.1)
            .add_float("obp", 0.0, 1.0)
            .default_value(0.1)
            .add_float("eff", 0.0, 1.0)
            .default_value(1.0)
            .add_float("exp", 0.0, 1.0)
            .default_value(0.0)
            .add_float("psc", 0.0, 1.0)
            .default_value(0.0)
            .add_float("loc", 0.0, 1.0)
            .default_value(0.0)
            .add_float("sparsity_bonus", 0.0, 1.0)
            .default_value(0.2)
            .add_float("end_sparsity_bonus", 0.0, 1.0)
            .default_value(0.4)
            .add_float("root_budget", 0.5, 8.0)
            .default_value(2.0)
            .add_float("tree_budget", 0.5, 8.0)
            .default_value(2.0)
            .add_float("max_parallel", 0.1, 1.0)
            .default_value(0.9)
            .add_float("parallel_penalty", 0.0, 1.0)
            .default_value(0.2)
            .add_float("max_density", 0.05, 1.0)
            .default_value(0.4)
            .add_bool("filter_dense_cuts")
            .default_value(false)
            .add_bool("filter_parallel_cuts")
            .default_value(true)
            .add_bool("penalise_locks")
            .default_value(false)
            .add_bool("penalise_obp")
            .default_value(false)
    }

    /// The default configuration, if every parameter has a default.
    pub fn defaults(&self) -> Option<ParameterMap> {
        self.parameters
            .iter()
            .map(|p| p.default.clone().map(|v| (p.name.clone(), v)))
            .collect()
    }

    /// Total number of grid points (returns `None` if any parameter is
    /// continuous without a natural grid).
    pub fn grid_size(&self) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.kind {
                ParameterKind::IntRange { low, high } => (high - low + 1).max(0) as usize,
                ParameterKind::Bool => 2,
                ParameterKind::Choice { values } => values.len(),
                _ => return None,
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }

    /// Check that the space itself is well formed: non-empty ranges, positive
    /// log bounds, unique names and valid defaults.
    pub fn check(&self) -> Result<(), SearchError> {
        for (idx, param) in self.parameters.iter().enumerate() {
            let invalid = |message: String| SearchError::InvalidConfiguration {
                parameter: param.name.clone(),
                message,
            };
            if self.parameters[..idx].iter().any(|p| p.name == param.name) {
                return Err(invalid("defined twice".to_string()));
            }
            match &param.kind {
                ParameterKind::FloatRange { low, high } => {
                    if !(low.is_finite() && high.is_finite() && low <= high) {
                        return Err(invalid(format!("empty range [{low}, {high}]")));
                    }
                }
                ParameterKind::LogUniform { low, high } => {
                    if !(low.is_finite() && high.is_finite() && *low > 0.0 && low <= high) {
                        return Err(invalid(format!("invalid log range [{low}, {high}]")));
                    }
                }
                ParameterKind::IntRange { low, high } => {
                    if low > high {
                        return Err(invalid(format!("empty range [{low}, {high}]")));
                    }
                }
                ParameterKind::Bool => {}
                ParameterKind::Choice { values } => {
                    if values.is_empty() {
                        return Err(invalid("no choices".to_string()));
                    }
                }
            }
            if let Some(default) = &param.default {
                check_value(param, default).map_err(|e| invalid(format!("default {e}")))?;
            }
        }
        Ok(())
    }

    /// Validate a proposed parameter map against the space.
    pub fn validate(&self, params: &ParameterMap) -> Result<(), SearchError> {
        if let Some(unknown) = params.keys().find(|name| self.get(name).is_none()) {
            return Err(SearchError::InvalidConfiguration {
                parameter: unknown.clone(),
                message: "not part of the search space".to_string(),
            });
        }
        for param in &self.parameters {
            let value = params
                .get(&param.name)
                .ok_or_else(|| SearchError::InvalidConfiguration {
                    parameter: param.name.clone(),
                    message: "missing".to_string(),
                })?;
            check_value(param, value).map_err(|message| SearchError::InvalidConfiguration {
                parameter: param.name.clone(),
                message,
            })?;
        }
        Ok(())
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn check_value(param: &ParameterDef, value: &ParameterValue) -> Result<(), String> {
    match &param.kind {
        ParameterKind::FloatRange { low, high } | ParameterKind::LogUniform { low, high } => {
            match value.as_f64() {
                Some(v) if v.is_finite() && v >= *low && v <= *high => Ok(()),
                Some(v) => Err(format!("{v} outside [{low}, {high}]")),
                None => Err(format!("expected a number, got {value}")),
            }
        }
        ParameterKind::IntRange { low, high } => match value {
            ParameterValue::Int(v) if v >= low && v <= high => Ok(()),
            ParameterValue::Int(v) => Err(format!("{v} outside [{low}, {high}]")),
            other => Err(format!("expected an integer, got {other}")),
        },
        ParameterKind::Bool => value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| format!("expected a boolean, got {value}")),
        ParameterKind::Choice { values } => {
            let json = to_json(value);
            if values.contains(&json) {
                Ok(())
            } else {
                Err(format!("{value} is not one of the choices"))
            }
        }
    }
}

fn to_json(value: &ParameterValue) -> serde_json::Value {
    match value {
        ParameterValue::Bool(v) => serde_json::Value::Bool(*v),
        ParameterValue::Int(v) => serde_json::Value::from(*v),
        ParameterValue::Float(v) => serde_json::Value::from(*v),
        ParameterValue::Json(v) => v.clone(),
    }
}

/// Map a JSON choice to the value kind it deserializes back into, so
/// proposals compare equal after a save / load cycle.
fn from_json(value: &serde_json::Value) -> ParameterValue {
    match value {
        serde_json::Value::Bool(v) => ParameterValue::Bool(*v),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => ParameterValue::Int(i),
            None => n
                .as_f64()
                .map(ParameterValue::Float)
                .unwrap_or_else(|| ParameterValue::Json(value.clone())),
        },
        other => ParameterValue::Json(other.clone()),
    }
}

fn sample(param: &ParameterDef, rng: &mut dyn RngCore) -> ParameterValue {
    match &param.kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(rng.gen_range(*low..=*high)),
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
        ParameterKind::Bool => ParameterValue::Bool(rng.gen_bool(0.5)),
        ParameterKind::Choice { values } => from_json(&values[rng.gen_range(0..values.len())]),
    }
}

fn sample_space(space: &SearchSpace, rng: &mut dyn RngCore) -> ParameterMap {
    space
        .parameters
        .iter()
        .map(|param| (param.name.clone(), sample(param, rng)))
        .collect()
}

fn already_tried(history: &[RoundRecord], params: &ParameterMap) -> bool {
    history
        .iter()
        .any(|record| &record.configuration.parameters == params)
}

/// Attempts at drawing a not-yet-evaluated configuration before accepting a
/// repeat.
const MAX_DRAWS: usize = 32;

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Common trait for all search strategies.
///
/// Strategies are driven by the full round history and a per-round RNG, so
/// a resumed search proposes what the uninterrupted one would have.
pub trait SearchStrategy: Send {
    /// Propose the next configuration, or `None` when the strategy has
    /// nothing left to try.
    fn propose(&mut self, history: &[RoundRecord], rng: &mut dyn RngCore) -> Option<ParameterMap>;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

/// Strategy selection as it appears in settings files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyConfig {
    Random,
    Grid { float_steps: usize },
    Bayesian { exploration_weight: f64 },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::Bayesian {
            exploration_weight: 0.3,
        }
    }
}

impl StrategyConfig {
    pub fn build(&self, space: SearchSpace, direction: ObjectiveDirection) -> Box<dyn SearchStrategy> {
        match self {
            Self::Random => Box::new(RandomSearch::new(space)),
            Self::Grid { float_steps } => Box::new(GridSearch::new(space, *float_steps)),
            Self::Bayesian { exploration_weight } => {
                Box::new(BayesianSearch::new(space, *exploration_weight, direction))
            }
        }
    }
}

// ---- Grid search ----

/// Exhaustive grid search, enumerated lazily in mixed-radix order with the
/// first parameter varying slowest.
#[derive(Debug, Clone)]
pub struct GridSearch {
    axes: Vec<(String, Vec<ParameterValue>)>,
    size: usize,
    cursor: usize,
}

impl GridSearch {
    pub fn new(space: SearchSpace, float_steps: usize) -> Self {
        let steps = float_steps.max(2);
        let axes: Vec<(String, Vec<ParameterValue>)> = space
            .parameters
            .iter()
            .map(|param| {
                let values: Vec<ParameterValue> = match &param.kind {
                    ParameterKind::FloatRange { low, high } => (0..steps)
                        .map(|i| {
                            let t = i as f64 / (steps - 1) as f64;
                            ParameterValue::Float(low + t * (high - low))
                        })
                        .collect(),
                    ParameterKind::IntRange { low, high } => {
                        (*low..=*high).map(ParameterValue::Int).collect()
                    }
                    ParameterKind::LogUniform { low, high } => {
                        let log_low = low.ln();
                        let log_high = high.ln();
                        (0..steps)
                            .map(|i| {
                                let t = i as f64 / (steps - 1) as f64;
                                ParameterValue::Float((log_low + t * (log_high - log_low)).exp())
                            })
                            .collect()
                    }
                    ParameterKind::Bool => {
                        vec![ParameterValue::Bool(false), ParameterValue::Bool(true)]
                    }
                    ParameterKind::Choice { values } => values.iter().map(from_json).collect(),
                };
                (param.name.clone(), values)
            })
            .collect();

        let size = axes
            .iter()
            .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()))
            .unwrap_or(usize::MAX);

        Self {
            axes,
            size,
            cursor: 0,
        }
    }

    /// Number of grid points.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn point(&self, mut index: usize) -> ParameterMap {
        let mut params = ParameterMap::new();
        for (name, values) in self.axes.iter().rev() {
            let len = values.len();
            params.insert(name.clone(), values[index % len].clone());
            index /= len;
        }
        params
    }
}

impl SearchStrategy for GridSearch {
    fn propose(&mut self, history: &[RoundRecord], _rng: &mut dyn RngCore) -> Option<ParameterMap> {
        while self.cursor < self.size {
            let params = self.point(self.cursor);
            self.cursor += 1;
            if !already_tried(history, &params) {
                return Some(params);
            }
        }
        None
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: SearchSpace,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self { space }
    }
}

impl SearchStrategy for RandomSearch {
    fn propose(&mut self, history: &[RoundRecord], rng: &mut dyn RngCore) -> Option<ParameterMap> {
        let mut params = sample_space(&self.space, rng);
        for _ in 1..MAX_DRAWS {
            if !already_tried(history, &params) {
                break;
            }
            params = sample_space(&self.space, rng);
        }
        Some(params)
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Model-guided search ----

/// Model-guided search with a simple surrogate: explore with probability
/// `exploration_weight`, otherwise perturb the best configuration so far.
///
/// Penalized rounds never serve as the exploitation base.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    space: SearchSpace,
    exploration_weight: f64,
    direction: ObjectiveDirection,
}

impl BayesianSearch {
    pub fn new(space: SearchSpace, exploration_weight: f64, direction: ObjectiveDirection) -> Self {
        Self {
            space,
            exploration_weight: exploration_weight.clamp(0.0, 1.0),
            direction,
        }
    }

    fn best<'a>(&self, history: &'a [RoundRecord]) -> Option<&'a RoundRecord> {
        history
            .iter()
            .filter(|r| !r.penalized)
            .fold(None, |best: Option<&RoundRecord>, record| match best {
                Some(current) if !self.direction.is_better(record.score, current.score) => Some(current),
                _ => Some(record),
            })
    }

    fn exploit(&self, base: &ParameterMap, rng: &mut dyn RngCore) -> ParameterMap {
        let mut perturbed = ParameterMap::new();

        for param in &self.space.parameters {
            let value = match (&param.kind, base.get(&param.name)) {
                (ParameterKind::FloatRange { low, high }, Some(v)) if v.as_f64().is_some() => {
                    let v = v.as_f64().unwrap_or(*low);
                    let noise = rng.gen_range(-0.1..0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = rng.gen_range(-2..=2);
                    ParameterValue::Int((v + delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(v)) if v.as_f64().is_some() => {
                    let log_v = v.as_f64().unwrap_or(*low).ln();
                    let noise = rng.gen_range(-0.1..0.1) * (high.ln() - low.ln());
                    ParameterValue::Float((log_v + noise).exp().clamp(*low, *high))
                }
                (ParameterKind::Bool, Some(v)) if v.as_bool().is_some() => {
                    let current = v.as_bool().unwrap_or(false);
                    ParameterValue::Bool(if rng.gen_bool(0.2) { !current } else { current })
                }
                (ParameterKind::Choice { .. }, Some(v)) if !rng.gen_bool(0.2) => v.clone(),
                // Resample missing or switched dimensions.
                _ => sample(param, rng),
            };
            perturbed.insert(param.name.clone(), value);
        }

        perturbed
    }
}

impl SearchStrategy for BayesianSearch {
    fn propose(&mut self, history: &[RoundRecord], rng: &mut dyn RngCore) -> Option<ParameterMap> {
        let mut params = ParameterMap::new();
        for _ in 0..MAX_DRAWS {
            params = match self.best(history) {
                Some(best) if rng.gen::<f64>() >= self.exploration_weight => {
                    self.exploit(&best.configuration.parameters, rng)
                }
                _ => sample_space(&self.space, rng),
            };
            if !already_tried(history, &params) {
                break;
            }
        }
        Some(params)
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}
