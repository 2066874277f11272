//! CutSearch - cut-selection tuning for MIP solvers
//!
//! The `cutsearch` command drives the tuning pipeline.
//!
//! ## Commands
//!
//! - `embed`: Turn an instance pool into structural embeddings
//! - `select`: Pick a diverse subset from the embeddings
//! - `baseline`: Solve the subset with the solver's default configuration
//! - `filter`: Drop instances whose baseline runs are too easy or too hard
//! - `search`: Run (or resume) the configuration search
//! - `settings`: Print the default settings document

mod settings;
mod telemetry;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use cs_dispatch::{JobDispatcher, ResultLog};
use cs_instances::{
    project, write_projection_csv, DiversitySelector, EmbeddingCache, FeatureExtractor,
    InstanceCatalog,
};
use cs_optimizer::{
    generate_baseline, write_atomic, Baseline, Evaluator, OutputLayout, SearchEvent, SearchLoop,
    Termination,
};
use cs_types::{Configuration, Embedding, Instance, InstanceSubset};

use settings::{find_program, BackendSettings, Settings};
use telemetry::init_tracing;

#[derive(Parser)]
#[command(name = "cutsearch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tune MIP cut-selection parameters over a diverse instance subset", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Settings document (JSON); defaults apply to anything it omits
    #[arg(long, global = true, env = "CUTSEARCH_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute structural embeddings for every instance in a directory
    Embed {
        /// Directory holding *.mps / *.mps.gz files
        #[arg(short, long)]
        instances: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Only embed the instances listed in this subset file
        #[arg(long)]
        only: Option<PathBuf>,

        /// Skip the on-disk embedding cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Select a diverse subset from previously computed embeddings
    Select {
        /// Output directory holding embeddings.json
        #[arg(short, long)]
        output: PathBuf,

        /// Subset size
        #[arg(short)]
        k: usize,

        /// Also write a 2-D or 3-D projection CSV
        #[arg(long, value_parser = clap::value_parser!(u8).range(2..=3))]
        project: Option<u8>,
    },

    /// Solve the subset (or every instance) with the default configuration
    Baseline {
        #[arg(short, long)]
        instances: PathBuf,

        /// Directory holding reference solutions (<id>.sol[.gz])
        #[arg(long)]
        solutions: Option<PathBuf>,

        #[arg(short, long)]
        output: PathBuf,

        /// Ignore subset.json and solve every instance in the directory
        #[arg(long)]
        all: bool,
    },

    /// Filter baseline instances by solve statistics
    Filter {
        /// Output directory holding baseline.json
        #[arg(short, long)]
        output: PathBuf,

        /// Where to write the kept ids (default: <output>/filtered.json)
        #[arg(long)]
        write: Option<PathBuf>,
    },

    /// Run the configuration search over the selected subset
    Search {
        #[arg(short, long)]
        instances: PathBuf,

        #[arg(long)]
        solutions: Option<PathBuf>,

        /// Output directory; an existing run there is resumed
        #[arg(short, long)]
        output: PathBuf,

        /// Generate baseline runs before searching
        #[arg(long)]
        baseline_first: bool,

        /// Override the round budget
        #[arg(long)]
        rounds: Option<u32>,

        /// Override the run seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the default settings document
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let settings = Settings::load_or_default(cli.settings.as_deref())?;

    match cli.command {
        Commands::Embed {
            instances,
            output,
            only,
            no_cache,
        } => cmd_embed(&settings, &instances, &output, only.as_deref(), no_cache),
        Commands::Select { output, k, project } => cmd_select(&settings, &output, k, project),
        Commands::Baseline {
            instances,
            solutions,
            output,
            all,
        } => cmd_baseline(&settings, &instances, solutions.as_deref(), &output, all).await,
        Commands::Filter { output, write } => cmd_filter(&settings, &output, write),
        Commands::Search {
            instances,
            solutions,
            output,
            baseline_first,
            rounds,
            seed,
        } => {
            let mut settings = settings;
            if let Some(rounds) = rounds {
                settings.search.max_rounds = Some(rounds);
            }
            if let Some(seed) = seed {
                settings.search.seed = seed;
            }
            cmd_search(&settings, &instances, solutions.as_deref(), &output, baseline_first).await
        }
        Commands::Settings => {
            println!("{}", Settings::default().to_pretty_json()?);
            Ok(())
        }
    }
}

fn scan_catalog(instances: &Path, solutions: Option<&Path>) -> Result<InstanceCatalog> {
    let catalog = InstanceCatalog::scan(instances, solutions)
        .with_context(|| format!("Failed to scan instance directory {}", instances.display()))?;
    if catalog.is_empty() {
        bail!("No *.mps or *.mps.gz instances found in {}", instances.display());
    }
    Ok(catalog)
}

fn prepare_output(output: &Path) -> Result<OutputLayout> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create output directory {}", output.display()))?;
    Ok(OutputLayout::new(output))
}

fn cmd_embed(
    settings: &Settings,
    instances: &Path,
    output: &Path,
    only: Option<&Path>,
    no_cache: bool,
) -> Result<()> {
    let catalog = scan_catalog(instances, None)?;
    let layout = prepare_output(output)?;

    let pool: Vec<Instance> = match only {
        Some(path) => {
            let subset = InstanceSubset::load(path)
                .with_context(|| format!("Failed to load subset {}", path.display()))?;
            catalog.resolve(&subset)?
        }
        None => catalog.instances(),
    };

    let cache = if no_cache {
        None
    } else {
        let dir = settings
            .cache_dir
            .clone()
            .unwrap_or_else(EmbeddingCache::default_dir);
        Some(EmbeddingCache::open(&dir).with_context(|| format!("Failed to open embedding cache {}", dir.display()))?)
    };

    let extractor = FeatureExtractor::new(settings.extractor.clone());
    let report = extractor.embed_all(&pool, cache.as_ref());
    for failure in &report.failures {
        warn!(error = %failure, "Instance excluded");
    }
    if report.embeddings.is_empty() {
        bail!("None of the {} instances could be embedded", pool.len());
    }

    write_atomic(&layout.embeddings(), &report.embeddings)?;
    info!(
        embedded = report.embeddings.len(),
        excluded = report.failures.len(),
        cache_hits = report.cache_hits,
        path = ?layout.embeddings(),
        "Embeddings written"
    );
    println!(
        "Embedded {} instances ({} excluded) -> {}",
        report.embeddings.len(),
        report.failures.len(),
        layout.embeddings().display()
    );
    Ok(())
}

fn load_embeddings(path: &Path) -> Result<Vec<Embedding>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read embeddings {}; run `cutsearch embed` first", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Malformed embeddings file {}", path.display()))
}

fn cmd_select(settings: &Settings, output: &Path, k: usize, dims: Option<u8>) -> Result<()> {
    let layout = prepare_output(output)?;
    let embeddings = load_embeddings(&layout.embeddings())?;

    let selector = DiversitySelector::new(settings.selector.clone());
    let subset = selector.select(&embeddings, k)?;
    subset.save(&layout.subset())?;

    if let Some(dims) = dims {
        let points = project(&embeddings, usize::from(dims))?;
        write_projection_csv(&layout.projection(), &points, Some(&subset))?;
        info!(path = ?layout.projection(), dims, "Projection written");
    }

    println!("Selected {} of {} instances:", subset.len(), embeddings.len());
    for id in subset.iter() {
        println!("  {id}");
    }
    Ok(())
}

fn cmd_filter(settings: &Settings, output: &Path, write: Option<PathBuf>) -> Result<()> {
    let layout = prepare_output(output)?;
    let baseline = Baseline::load(&layout.baseline())
        .with_context(|| format!("Failed to load {}; run `cutsearch baseline` first", layout.baseline().display()))?;

    let subset = if layout.subset().exists() {
        InstanceSubset::load(&layout.subset())?
    } else {
        InstanceSubset::new(baseline.reports.keys().cloned().collect())?
    };

    let outcome = settings.filter.apply(subset.ids(), &baseline.reports);
    for (id, reason) in &outcome.rejected {
        info!(instance = %id, reason = ?reason, "Instance filtered out");
    }
    if outcome.kept.is_empty() {
        bail!("Every instance was filtered out");
    }

    let kept = InstanceSubset::new(outcome.kept)?;
    let path = write.unwrap_or_else(|| layout.root().join("filtered.json"));
    kept.save(&path)?;
    println!(
        "Kept {} of {} instances ({} rejected) -> {}",
        kept.len(),
        subset.len(),
        outcome.rejected.len(),
        path.display()
    );
    Ok(())
}

/// Instances of the selected subset, or the whole pool when none is saved
/// (or `all` is set).
fn working_set(catalog: &InstanceCatalog, layout: &OutputLayout, all: bool) -> Result<Vec<Instance>> {
    if all || !layout.subset().exists() {
        return Ok(catalog.instances());
    }
    let subset = InstanceSubset::load(&layout.subset())?;
    if subset.is_empty() {
        bail!("Subset {} is empty", layout.subset().display());
    }
    Ok(catalog.resolve(&subset)?)
}

fn build_evaluator(settings: &Settings, layout: &OutputLayout) -> Result<Evaluator> {
    if settings.backend == BackendSettings::Local {
        let program = &settings.evaluator.invocation.program;
        if find_program(program).is_none() {
            bail!("Solver program `{program}` not found on PATH");
        }
    }

    let backend = settings.backend.build()?;
    let log = ResultLog::open(layout.evaluations())
        .with_context(|| format!("Failed to open result log {}", layout.evaluations().display()))?;
    let dispatcher = Arc::new(JobDispatcher::with_result_log(
        backend,
        settings.dispatcher.clone(),
        log,
    ));
    info!(
        backend = dispatcher.backend_name(),
        max_in_flight = settings.dispatcher.max_in_flight,
        dry_run = settings.backend.is_dry_run(),
        "Job dispatcher ready"
    );
    Ok(Evaluator::new(
        dispatcher,
        settings.evaluator.clone(),
        layout.configs(),
    ))
}

/// A receiver that flips to `true` on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after cleanup");
            let _ = tx.send(true);
            // Keep the sender alive so the flag stays observable.
            std::future::pending::<()>().await;
        }
    });
    rx
}

fn default_configuration(settings: &Settings) -> Result<Configuration> {
    let parameters = settings
        .space
        .defaults()
        .context("Every search-space parameter needs a default to run the baseline")?;
    Ok(Configuration::new("default", parameters))
}

async fn run_baseline(
    settings: &Settings,
    evaluator: &Evaluator,
    layout: &OutputLayout,
    instances: &[Instance],
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Baseline> {
    let baseline = generate_baseline(
        evaluator,
        default_configuration(settings)?,
        instances,
        &settings.search.time_limits,
        Duration::from_secs(settings.search.round_timeout_secs),
        shutdown,
    )
    .await?;
    baseline.save(&layout.baseline())?;
    Ok(baseline)
}

async fn cmd_baseline(
    settings: &Settings,
    instances: &Path,
    solutions: Option<&Path>,
    output: &Path,
    all: bool,
) -> Result<()> {
    let catalog = scan_catalog(instances, solutions)?;
    let layout = prepare_output(output)?;
    let pool = working_set(&catalog, &layout, all)?;
    let evaluator = build_evaluator(settings, &layout)?;
    let mut shutdown = shutdown_on_ctrl_c();

    let baseline = run_baseline(settings, &evaluator, &layout, &pool, &mut shutdown).await?;
    println!(
        "Baseline solved {} of {} instances -> {}",
        baseline.reports.len(),
        pool.len(),
        layout.baseline().display()
    );
    Ok(())
}

fn print_progress(events: crossbeam_channel::Receiver<SearchEvent>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for event in events {
            match event {
                SearchEvent::RoundCompleted {
                    round,
                    score,
                    penalized,
                    succeeded,
                    failed,
                    timed_out,
                    ..
                } => {
                    let note = if penalized { " (penalized)" } else { "" };
                    println!(
                        "round {round:>4}  score {score:>12.4}{note}  ok {succeeded} failed {failed} timed out {timed_out}"
                    );
                }
                SearchEvent::NewBest {
                    round,
                    configuration_id,
                    score,
                } => {
                    println!("           new best {score:.4} from round {round} ({configuration_id})");
                }
                SearchEvent::Terminated { termination, rounds } => {
                    println!("search stopped after {rounds} rounds: {termination}");
                }
            }
        }
    })
}

async fn cmd_search(
    settings: &Settings,
    instances: &Path,
    solutions: Option<&Path>,
    output: &Path,
    baseline_first: bool,
) -> Result<()> {
    settings.search.validate()?;
    let catalog = scan_catalog(instances, solutions)?;
    let layout = prepare_output(output)?;
    let subset = InstanceSubset::load(&layout.subset()).with_context(|| {
        format!(
            "Failed to load {}; run `cutsearch select` first",
            layout.subset().display()
        )
    })?;
    let pool = catalog.resolve(&subset)?;
    if pool.is_empty() {
        bail!("Subset {} is empty", layout.subset().display());
    }

    let evaluator = build_evaluator(settings, &layout)?;
    let mut shutdown = shutdown_on_ctrl_c();

    let baseline = if baseline_first && !layout.baseline().exists() {
        Some(run_baseline(settings, &evaluator, &layout, &pool, &mut shutdown).await?)
    } else if layout.baseline().exists() {
        Some(Baseline::load(&layout.baseline())?)
    } else {
        None
    };
    if settings.search.normalize_to_baseline && baseline.is_none() {
        bail!("Score normalization needs a baseline; pass --baseline-first");
    }

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    let progress = print_progress(events_rx);

    let mut search = SearchLoop::new(
        settings.search.clone(),
        settings.space.clone(),
        evaluator,
        layout.clone(),
    )
    .with_events(events_tx);
    if let Some(baseline) = baseline {
        search = search.with_baseline(baseline);
    }

    let result = search.run(&pool, shutdown).await;
    // Closing the channel ends the progress thread.
    drop(search);
    if progress.join().is_err() {
        warn!("Progress printer panicked");
    }
    let outcome = result?;

    match &outcome.best {
        Some(best) => {
            let path = layout.root().join("best_configuration.json");
            best.configuration.save(&path)?;
            println!(
                "Best configuration {} (round {}, score {:.4}) -> {}",
                best.configuration.id,
                best.round,
                best.score,
                path.display()
            );
        }
        None => println!("No round completed"),
    }
    if outcome.failed_rounds > 0 {
        println!("{} rounds were penalized", outcome.failed_rounds);
    }
    if outcome.termination == Termination::Interrupted {
        println!("Interrupted; rerun the same command to resume");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn search_flags_parse() {
        let cli = Cli::try_parse_from([
            "cutsearch",
            "search",
            "--instances",
            "/pool",
            "--output",
            "/out",
            "--baseline-first",
            "--rounds",
            "12",
        ])
        .unwrap();
        match cli.command {
            Commands::Search {
                baseline_first,
                rounds,
                solutions,
                ..
            } => {
                assert!(baseline_first);
                assert_eq!(rounds, Some(12));
                assert!(solutions.is_none());
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn projection_dims_are_bounded() {
        assert!(Cli::try_parse_from(["cutsearch", "select", "-o", "/out", "-k", "5", "--project", "4"]).is_err());
        assert!(Cli::try_parse_from(["cutsearch", "select", "-o", "/out", "-k", "5", "--project", "3"]).is_ok());
    }

    #[test]
    fn empty_instance_directory_is_a_setup_failure() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not an instance").unwrap();
        assert!(scan_catalog(dir.path(), None).is_err());
    }

    #[test]
    fn missing_solver_is_a_setup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.evaluator.invocation.program = "no-such-solver-on-this-machine".to_string();
        let layout = OutputLayout::new(dir.path());
        assert!(build_evaluator(&settings, &layout).is_err());
    }

    #[tokio::test]
    async fn dry_run_search_end_to_end() {
        let pool = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(
                pool.path().join(format!("{name}.mps")),
                "NAME T\nROWS\n N obj\n L c1\nCOLUMNS\n x obj 1 c1 1\nRHS\n rhs c1 4\nENDATA\n",
            )
            .unwrap();
        }
        let out = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(out.path());
        InstanceSubset::new(vec![cs_types::InstanceId::new("a"), cs_types::InstanceId::new("c")])
            .unwrap()
            .save(&layout.subset())
            .unwrap();

        let mut settings = Settings::default();
        settings.backend = BackendSettings::DryRun;
        settings.dispatcher = settings.dispatcher.with_poll_interval(Duration::from_millis(2));
        settings.search = settings.search.with_max_rounds(3);

        cmd_search(&settings, pool.path(), None, out.path(), true)
            .await
            .unwrap();

        assert!(layout.baseline().exists());
        assert!(out.path().join("best_configuration.json").exists());
        let metadata = cs_optimizer::RunMetadata::load(&layout.run()).unwrap();
        assert_eq!(metadata.completed_rounds, 3);
    }
}
