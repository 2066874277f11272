//! The settings document: every component's configuration in one JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cs_dispatch::{
    DispatcherConfig, ExecutionBackend, JobCommand, LocalProcessBackend, SimulatedBackend,
    SimulatedOutcome, SlurmBackend, SlurmConfig,
};
use cs_instances::{ExtractorConfig, FilterCriteria, SelectorConfig};
use cs_optimizer::{EvaluatorConfig, SearchConfig, SearchSpace};
use cs_types::{SolveStatus, SolverReport};

/// Where evaluation jobs run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSettings {
    /// Child processes on this machine.
    #[default]
    Local,
    Slurm(SlurmConfig),
    /// No solver: every job reports an optimal solve with a pseudo-random
    /// time derived from the command. For checking a setup end to end.
    DryRun,
}

impl BackendSettings {
    pub fn build(&self) -> Result<Arc<dyn ExecutionBackend>> {
        let backend: Arc<dyn ExecutionBackend> = match self {
            Self::Local => Arc::new(LocalProcessBackend::new()),
            Self::Slurm(config) => Arc::new(
                SlurmBackend::new(config.clone())
                    .with_context(|| format!("Failed to prepare Slurm output directory {:?}", config.output_dir))?,
            ),
            Self::DryRun => Arc::new(SimulatedBackend::new(dry_run)),
        };
        Ok(backend)
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun)
    }
}

fn dry_run(command: &JobCommand) -> SimulatedOutcome {
    let mut hasher = DefaultHasher::new();
    command.args.hash(&mut hasher);
    let solve_time = 1.0 + (hasher.finish() % 1000) as f64 / 100.0;
    SimulatedOutcome::report(
        &SolverReport::solved(SolveStatus::Optimal, solve_time),
        Duration::from_millis(10),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub extractor: ExtractorConfig,
    /// Embedding cache directory; the platform cache directory when unset.
    pub cache_dir: Option<PathBuf>,
    pub selector: SelectorConfig,
    pub filter: FilterCriteria,
    pub backend: BackendSettings,
    pub dispatcher: DispatcherConfig,
    pub evaluator: EvaluatorConfig,
    pub search: SearchConfig,
    pub space: SearchSpace,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            extractor: ExtractorConfig::default(),
            cache_dir: None,
            selector: SelectorConfig::default(),
            filter: FilterCriteria::default(),
            backend: BackendSettings::default(),
            dispatcher: DispatcherConfig::default(),
            evaluator: EvaluatorConfig::default(),
            search: SearchConfig::default(),
            space: SearchSpace::cut_selector_default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed settings file {}", path.display()))?;
        settings.space.check().context("Malformed search space in settings")?;
        Ok(settings)
    }

    /// Defaults when no file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize settings")
    }
}

/// Locate `program` the way a shell would: as a path when it contains a
/// separator, otherwise on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}
