//! nibble-reconcile CLI - reconcile a replica JSON dataset against its master.

use clap::{Parser, Subcommand};
use nibble_reconcile::{
    verify_ids, CheckpointStore, Config, Connector, DatasetConfig, FileCheckpointStore, Key,
    MemoryConnector, Nibbler, NoOpCheckpointStore, ReconcileEngine, ReconcileError,
    RunStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "nibble-reconcile")]
#[command(about = "Reconcile a replica dataset against its master, window by window")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a reconciliation and print the totals
    Run {
        /// Scan from the high end of the key space
        #[arg(long)]
        reverse: bool,

        /// Report extra rows without deleting them
        #[arg(long)]
        no_delete: bool,

        /// Override the initial window size
        #[arg(long)]
        limit: Option<usize>,

        /// Override the smallest window size reachable by splitting
        #[arg(long)]
        max_limit: Option<usize>,

        /// Stop starting new windows after this many seconds
        #[arg(long)]
        max_duration: Option<u64>,
    },

    /// Print the windows a run would scan, cut on the master over both key spaces
    Windows {
        /// Scan from the high end of the key space
        #[arg(long)]
        reverse: bool,

        /// Override the window size
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Classify explicit ids on both datasets
    Sample {
        /// Ids to check (integers or strings)
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ReconcileError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format).map_err(ReconcileError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Run {
            reverse,
            no_delete,
            limit,
            max_limit,
            max_duration,
        } => {
            // Apply overrides
            if reverse {
                config.options.reverse = true;
            }
            if no_delete {
                config.options.should_delete = false;
            }
            if let Some(limit) = limit {
                config.options.limit = limit;
            }
            if let Some(max_limit) = max_limit {
                config.options.max_limit = max_limit;
            }
            if let Some(secs) = max_duration {
                config.options.stop_at = None;
                config.options.max_duration_secs = Some(secs);
            }
            config.validate()?;

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler()?;

            let master = open_dataset("master", &config.master, false);
            let slave = open_dataset("slave", &config.slave, config.options.should_delete);

            let store: Arc<dyn CheckpointStore> = match &config.checkpoint_file {
                Some(path) => Arc::new(FileCheckpointStore::new(path).with_signing_key(config.hash())),
                None => Arc::new(NoOpCheckpointStore::new()),
            };

            let mut engine = ReconcileEngine::new(master, slave, config.options.clone())
                .with_retry(config.retry.clone())
                .with_checkpoint_store(store)
                .with_cancel_token(cancel_token);

            // Print progress as JSON lines to stderr
            let progress_task = if cli.progress {
                let (tx, mut rx) = mpsc::channel(16);
                engine = engine.with_progress(tx);
                Some(tokio::spawn(async move {
                    while let Some(update) = rx.recv().await {
                        if let Ok(line) = serde_json::to_string(&update) {
                            eprintln!("{}", line);
                        }
                    }
                }))
            } else {
                None
            };

            let report = engine.run(&config.job_name, &config.job_id).await?;
            drop(engine);
            if let Some(task) = progress_task {
                let _ = task.await;
            }

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                let status_msg = match report.status {
                    RunStatus::Completed => "Reconciliation completed!",
                    RunStatus::DeadlineReached => "Reconciliation stopped at deadline (partial totals)",
                    RunStatus::Cancelled => "Reconciliation cancelled (partial totals)",
                };
                println!("\n{}", status_msg);
                println!("  Run ID: {}", report.run_id);
                println!("  Job: {} ({})", report.job_name, report.job_id);
                println!("  Duration: {:.2}s", report.duration_ms as f64 / 1000.0);
                println!("  Windows: {}", report.windows);
                if let Some(ref position) = report.resumed_from {
                    println!("  Resumed from: {}", position);
                }
                println!("  Correct: {}", report.totals.correct);
                println!("  Incorrect: {}", report.totals.incorrect);
                println!("  Missing: {}", report.totals.missing);
                println!("  Extra: {}", report.totals.extra);
                println!("  Deleted: {}", report.totals.deleted);
                if report.totals.unresolved > 0 {
                    println!("  Unresolved: {}", report.totals.unresolved);
                }
            }

            if report.status == RunStatus::Cancelled {
                return Err(ReconcileError::Cancelled);
            }
        }

        Commands::Windows { reverse, limit } => {
            if reverse {
                config.options.reverse = true;
            }
            if let Some(limit) = limit {
                config.options.limit = limit;
            }
            config.validate()?;

            let master = open_dataset("master", &config.master, false);
            let slave = open_dataset("slave", &config.slave, false);

            let (master_init, slave_init) = tokio::join!(master.initialize(), slave.initialize());
            let windows = match master_init.and(slave_init) {
                Ok(()) => list_windows(master.clone(), slave.as_ref(), &config).await,
                Err(e) => Err(e),
            };
            let (master_destroy, slave_destroy) = tokio::join!(master.destroy(), slave.destroy());
            let windows = windows?;
            master_destroy.and(slave_destroy)?;

            if cli.output_json {
                let entries: Vec<serde_json::Value> = windows
                    .iter()
                    .map(|w| {
                        serde_json::json!({
                            "index": w.index,
                            "range": w.range.to_string(),
                            "limit": w.limit,
                            "direction": w.direction,
                            "next": w.next,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                println!("{} windows ({} scan, limit {}):", windows.len(), config.options.direction(), config.options.limit);
                for w in &windows {
                    println!("  {:>4}  {}", w.index, w.range);
                }
            }
        }

        Commands::Sample { ids } => {
            let ids: Vec<Key> = ids.iter().map(|s| Key::parse(s)).collect();

            let master = open_dataset("master", &config.master, false);
            let slave = open_dataset("slave", &config.slave, false);

            let (master_init, slave_init) = tokio::join!(master.initialize(), slave.initialize());
            let result = match master_init.and(slave_init) {
                Ok(()) => verify_ids(master.as_ref(), slave.as_ref(), &ids, &config.retry).await,
                Err(e) => Err(e),
            };
            let (master_destroy, slave_destroy) = tokio::join!(master.destroy(), slave.destroy());
            let results = result?;
            master_destroy.and(slave_destroy)?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for r in &results {
                    let class = r
                        .classification
                        .map_or_else(|| "absent".to_string(), |c| c.to_string());
                    println!("  {}: {}", r.id, class);
                }
            }
        }

        Commands::Validate => {
            println!("Configuration is valid");
            println!("  Job: {} ({})", config.job_name, config.job_id);
            println!("  Master: {}", config.master.path.display());
            println!("  Slave: {}", config.slave.path.display());
            println!("  Config hash: {}", config.hash());
        }
    }

    Ok(())
}

fn open_dataset(name: &str, dataset: &DatasetConfig, write_back: bool) -> Arc<dyn Connector> {
    let mut conn = MemoryConnector::from_json_file(name, &dataset.path).with_write_back(write_back);
    if let Some(max_rows) = dataset.max_individual_rows {
        conn = conn.with_max_individual_rows(max_rows);
    }
    Arc::new(conn)
}

/// Windows over the union of both key spaces, as the engine scans them.
async fn list_windows(
    master: Arc<dyn Connector>,
    slave: &dyn Connector,
    config: &Config,
) -> Result<Vec<nibble_reconcile::Window>, ReconcileError> {
    let (master_range, slave_range) = tokio::join!(master.range(None, None), slave.range(None, None));
    let Some(span) = master_range?.union_span(&slave_range?) else {
        return Ok(Vec::new());
    };

    Nibbler::new(
        master,
        span,
        config.options.limit,
        config.options.direction(),
    )
    .with_retry(config.retry.clone())
    .collect_windows()
    .await
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json keeps stdout machine-readable
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Unknown log format: {} (expected text or json)", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received;
/// the run stops at the next window boundary.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, ReconcileError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("\nReceived {}. Stopping after the current window...", name);
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, ReconcileError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping after the current window...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
