//! Distill CLI
//!
//! Administrative surface over the distillation engine: capture observations,
//! inspect summaries, run consolidation and query the snapshot archive.

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use distill::archive::Period;
use distill::config::default_data_dir;
use distill::distill::RebuildReport;
use distill::{
    CaptureOutcome, Category, Clock, Comparison, Consolidator, DigestWorker, DistillConfig,
    Distiller, HttpOracle, JsonlObservationLog, Observation, Recall, RebuildScope, Reflection,
    SnapshotArchive, Store, SystemClock, TextOracle,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Distill - living summaries with monthly snapshots
#[derive(Parser, Debug)]
#[command(name = "distill")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory (defaults to $DISTILL_HOME or ~/.distill)
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,

    /// Override the oracle model
    #[arg(long)]
    model: Option<String>,

    /// Never overwrite the snapshot of a closed month once archived
    #[arg(long)]
    protect_closed_months: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record an observation and digest it
    Observe {
        #[arg(trailing_var_arg = true, required = true)]
        text: Vec<String>,
    },
    /// Digest every logged observation the ledger has not seen
    DigestPending,
    /// Print one category's summary, or all of them
    Summary { category: Option<Category> },
    /// Recompute summaries from the observation history
    Rebuild { category: Option<Category> },
    /// Run one consolidation pass
    Consolidate,
    /// Run consolidation periodically until interrupted
    Schedule {
        /// Minutes between runs (defaults to the configured interval)
        #[arg(long)]
        every: Option<u64>,
    },
    /// Capture a snapshot (defaults to the current month)
    Snapshot {
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
    },
    /// List archived snapshots
    Snapshots,
    /// Show a category as of a month (YYYY-MM)
    Recall { category: Category, period: Period },
    /// Describe how a category changed between two months
    Compare {
        category: Category,
        from: Period,
        to: Period,
    },
    /// Reflect on the narrative over recent months
    Reflect {
        #[arg(long, default_value_t = 3)]
        months: u32,
    },
    /// Report count drift between summaries and the ledger
    Audit,
    /// List consolidation runs
    Runs,
}

struct Engine {
    log: Arc<JsonlObservationLog>,
    distiller: Arc<Distiller>,
    archive: Arc<SnapshotArchive>,
    consolidator: Consolidator,
    config: DistillConfig,
}

async fn open_engine(config: DistillConfig) -> anyhow::Result<Engine> {
    let store = Arc::new(
        Store::open(&config.data_dir)
            .await
            .with_context(|| format!("opening store at {:?}", config.data_dir))?,
    );
    let log = Arc::new(JsonlObservationLog::new(config.observations_file()));
    let oracle: Arc<dyn TextOracle> = Arc::new(HttpOracle::new(config.oracle.clone())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let distiller = Arc::new(Distiller::new(
        store.clone(),
        log.clone(),
        oracle.clone(),
        clock.clone(),
    ));
    let archive = Arc::new(SnapshotArchive::new(
        store.clone(),
        log.clone(),
        oracle.clone(),
        clock.clone(),
        config.archive.clone(),
    ));
    let consolidator = Consolidator::new(
        store,
        log.clone(),
        oracle,
        clock,
        archive.clone(),
        config.consolidation.clone(),
    );

    Ok(Engine {
        log,
        distiller,
        archive,
        consolidator,
        config,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let mut config = DistillConfig::load(&data_dir).await?;
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }
    if cli.protect_closed_months {
        config = config.with_protect_closed_months(true);
    }

    let engine = open_engine(config).await?;
    run(engine, cli.command).await
}

async fn run(engine: Engine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Observe { text } => {
            let observation = Observation::new(Uuid::new_v4().to_string(), text.join(" "), Utc::now());
            engine.log.append(&observation).await?;
            println!("{}", observation.id);

            // The observation is captured; digestion failures only leave it pending
            let id = observation.id.clone();
            let worker = DigestWorker::spawn(engine.distiller.clone(), 1);
            if let Err(e) = worker.submit(observation).await {
                warn!("Could not queue digestion: {}", e);
            }
            if let Err(e) = worker.shutdown().await {
                warn!("Digest worker failed: {}", e);
            }
            match engine.distiller.store().ledger_get(&id).await {
                Some(record) if record.categories.is_empty() => println!("  (no categories)"),
                Some(record) => {
                    for category in record.categories {
                        println!("  {category}");
                    }
                }
                None => println!("  (not digested yet; run `distill digest-pending`)"),
            }
        }
        Command::DigestPending => {
            let digested = engine.distiller.digest_pending().await?;
            println!("Digested {digested} observation(s)");
        }
        Command::Summary { category: Some(category) } => {
            let state = engine.distiller.read_summary(category).await;
            println!("{}", state.content);
        }
        Command::Summary { category: None } => {
            for (category, state) in engine.distiller.read_all_summaries().await {
                println!("## {} ({} observations)\n{}\n", category, state.observation_count, state.content);
            }
        }
        Command::Rebuild { category } => {
            let scope = category.map_or(RebuildScope::All, RebuildScope::Category);
            let report: RebuildReport = engine.distiller.rebuild(scope).await?;
            println!(
                "Replayed {} observation(s): {} merge(s) applied, {} failed",
                report.observations_replayed, report.merges_applied, report.merges_failed
            );
        }
        Command::Consolidate => {
            let run = engine.consolidator.run_consolidation().await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Command::Schedule { every } => {
            let minutes = every.unwrap_or(engine.config.consolidation.interval_minutes).max(1);
            info!("Consolidating every {} minute(s); Ctrl-C to stop", minutes);
            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            let runs = engine
                .consolidator
                .run_schedule(std::time::Duration::from_secs(minutes * 60), shutdown)
                .await;
            println!("Completed {runs} run(s)");
        }
        Command::Snapshot { year, month } => match engine.archive.take_snapshot(year, month).await? {
            CaptureOutcome::Captured { rows, replaced } => {
                println!("Captured {rows} row(s), {replaced} replaced");
            }
            CaptureOutcome::Protected => println!("Month is closed and already archived; left untouched"),
        },
        Command::Snapshots => {
            for snapshot in engine.archive.list_snapshots().await {
                println!(
                    "{:04}-{:02} {:<12} {:>4} obs, {} key",
                    snapshot.year,
                    snapshot.month,
                    snapshot.category.as_str(),
                    snapshot.observation_count,
                    snapshot.key_observations.len()
                );
            }
        }
        Command::Recall { category, period } => {
            match engine.archive.recall(category, period.year, period.month).await? {
                Recall::Live(state) => println!("(live)\n{}", state.content),
                Recall::Archived(snapshot) => println!("(archived {})\n{}", period, snapshot.content),
                Recall::NotFound => println!("No {category} summary for {period}"),
            }
        }
        Command::Compare { category, from, to } => {
            match engine.archive.compare(category, from, to).await? {
                Comparison::Delta { narrative, .. } => println!("{narrative}"),
                Comparison::Incomplete { missing } => {
                    let missing: Vec<String> = missing.iter().map(Period::to_string).collect();
                    println!("Nothing to compare for: {}", missing.join(", "));
                }
            }
        }
        Command::Reflect { months } => match engine.archive.reflect(months).await? {
            Reflection::Synthesized { narrative, .. } => println!("{narrative}"),
            Reflection::InsufficientHistory => println!("Not enough narrative history yet"),
        },
        Command::Audit => {
            let drift = engine.distiller.audit().await;
            if drift.is_empty() {
                println!("No drift");
            }
            for d in drift {
                println!(
                    "{}: summary count {}, ledger count {} (run `distill rebuild {}`)",
                    d.category, d.observation_count, d.ledger_count, d.category
                );
            }
        }
        Command::Runs => {
            for run in engine.consolidator.runs().await {
                println!(
                    "{} {} patterns={} strengthened={} faded={} errors={}",
                    run.ran_at.format("%Y-%m-%d %H:%M"),
                    run.id,
                    run.patterns_detected,
                    run.strengthened,
                    run.faded,
                    run.step_errors.len()
                );
            }
        }
    }
    Ok(())
}
