//! DbListener - database activity tracker.
//!
//! This binary manages tracked connections, runs tracking sessions against
//! them and prints the stored reports.
//!
//! # Commands
//!
//! - `dblistener connection add`: Register a database to track
//! - `dblistener connection list`: List registered databases
//! - `dblistener track <id>`: Run one tracking session (Ctrl+C stops it)
//! - `dblistener reports <id>`: List the reports of a connection
//! - `dblistener report <report-id>`: Print one report
//! - `dblistener analyze <sql>`: Extract tables and columns from one query
//!
//! # Environment Variables
//!
//! See [`dblistener_tracker::config`] for available configuration options.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use dblistener_tracker::config::{Config, LogFormat};
use dblistener_tracker::extractor::Extractor;
use dblistener_tracker::report::{format_summary, group_by_table, unattributed_columns};
use dblistener_tracker::sampler::PostgresSampler;
use dblistener_tracker::session::{SessionOptions, SessionOutcome, TrackingSession};
use dblistener_tracker::store::Store;
use dblistener_tracker::types::{DbKind, NewConnection, SessionState, TrackingMode};

/// Longest observation window `track --minutes` accepts (one week).
const MAX_TRACK_MINUTES: u64 = 7 * 24 * 60;

/// DbListener - database activity tracker.
///
/// Samples a database's activity view before and after an observation
/// window and reports which tables and columns the new queries touched.
#[derive(Parser, Debug)]
#[command(name = "dblistener")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    DBLISTENER_DATA_DIR             Data directory (default: ~/.dblistener)
    DBLISTENER_STORE_PATH           SQLite store (default: <data>/connections.db)
    DBLISTENER_EXTRACTOR            ast | lexical (default: ast)
    DBLISTENER_DIALECT              SQL dialect (default: postgres)
    DBLISTENER_ACTIVITY_VIEW        activity | statements (default: activity)
    DBLISTENER_RESET_STATS          Reset statement counters first (default: false)
    DBLISTENER_CONNECT_TIMEOUT_SECS Connect timeout per sample (default: 5)
    DBLISTENER_ARTIFACT_DIR         Usage artifact directory, or 'off'
    DBLISTENER_LOG_FORMAT           pretty | json (default: pretty)

EXAMPLES:
    # Register a database
    dblistener connection add --name local --database app --username dev --password dev

    # Capture background noise for 2 minutes, then analyze for 5
    dblistener track 1 --noise --minutes 2
    dblistener track 1 --minutes 5

    # Inspect results
    dblistener reports 1
    dblistener report 3
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Manage tracked connections.
    #[command(subcommand)]
    Connection(ConnectionCommand),

    /// Run one tracking session against a connection.
    ///
    /// Takes a baseline, waits out the observation window and stores a
    /// report of the new queries. Ctrl+C stops the session early without
    /// producing a report.
    Track {
        /// Connection id.
        id: i64,

        /// Record new queries as noise instead of reporting them.
        #[arg(long)]
        noise: bool,

        /// Override the connection's observation window.
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_TRACK_MINUTES))]
        minutes: Option<u64>,
    },

    /// List the reports of a connection, newest first.
    Reports {
        /// Connection id.
        id: i64,
    },

    /// Print one report with its items.
    Report {
        /// Report id.
        id: i64,
    },

    /// Extract tables and columns from a single query.
    Analyze {
        /// SQL text.
        sql: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConnectionCommand {
    /// Register a database to track.
    Add {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "postgres")]
        kind: DbKind,

        #[arg(long, default_value = "localhost")]
        host: String,

        #[arg(long, default_value_t = 5432)]
        port: u16,

        #[arg(long)]
        database: String,

        #[arg(long)]
        username: String,

        #[arg(long, default_value = "")]
        password: String,

        /// Observation window in minutes.
        #[arg(long, default_value_t = 5)]
        work_time: u32,

        /// Seconds between intermediate samples; 0 samples only at the end.
        #[arg(long, default_value_t = 0)]
        wait: u32,
    },

    /// List registered databases.
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_logging(config.log_format);

    match cli.command {
        Command::Connection(command) => run_connection(&config, command),
        Command::Track { id, noise, minutes } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_track(config, id, noise, minutes))
        }
        Command::Reports { id } => run_reports(&config, id),
        Command::Report { id } => run_report(&config, id),
        Command::Analyze { sql } => run_analyze(&config, &sql),
    }
}

fn open_store(config: &Config) -> Result<Store> {
    Store::open(&config.store_path)
        .with_context(|| format!("Failed to open store at {}", config.store_path.display()))
}

fn run_connection(config: &Config, command: ConnectionCommand) -> Result<()> {
    let store = open_store(config)?;

    match command {
        ConnectionCommand::Add {
            name,
            kind,
            host,
            port,
            database,
            username,
            password,
            work_time,
            wait,
        } => {
            if work_time == 0 {
                bail!("--work-time must be at least 1 minute");
            }
            let connection = store
                .add_connection(&NewConnection {
                    name,
                    kind,
                    host,
                    port,
                    database,
                    username,
                    password,
                    work_time_minutes: work_time,
                    wait_secs: wait,
                })
                .context("Failed to save connection")?;
            println!("Added connection {} ({})", connection.id, connection.name);
        }
        ConnectionCommand::List => {
            let connections = store.list_connections().context("Failed to list connections")?;
            if connections.is_empty() {
                println!("No connections. Add one with 'dblistener connection add'.");
            }
            for c in connections {
                println!(
                    "{:>4}  {:<20} {}://{}@{}:{}/{}  window {}m  wait {}s",
                    c.id, c.name, c.kind, c.username, c.host, c.port, c.database,
                    c.work_time_minutes, c.wait_secs
                );
            }
        }
    }
    Ok(())
}

async fn run_track(config: Config, id: i64, noise: bool, minutes: Option<u64>) -> Result<()> {
    let store = open_store(&config)?;
    let connection = store
        .get_connection(id)
        .with_context(|| format!("Failed to load connection {id}"))?;

    let extractor = Extractor::new(&config.extractor_config()).context("Invalid extractor configuration")?;
    let duration = minutes.map_or_else(|| connection.work_time(), window_minutes);
    let mode = if noise {
        TrackingMode::NoiseCapture
    } else {
        TrackingMode::Analyze
    };

    let sampler = PostgresSampler::new(&connection, config.activity_view, config.connect_timeout);
    let session = TrackingSession::new(
        connection,
        sampler,
        store,
        Arc::new(extractor),
        SessionOptions::from_config(&config),
    );

    session
        .start(duration, mode)
        .await
        .context("Failed to start tracking session")?;
    info!(
        session_id = %session.id(),
        minutes = duration.as_secs() / 60,
        "Tracking; press Ctrl+C to stop"
    );

    let interrupted = tokio::select! {
        result = session.wait() => {
            result.context("Tracking session task failed")?;
            false
        }
        () = wait_for_shutdown() => true,
    };
    if interrupted {
        info!("Shutdown signal received, stopping session");
        session.stop().await;
    }

    match (session.state(), session.outcome()) {
        (SessionState::Completed, Some(SessionOutcome::Report { report, artifact })) => {
            println!(
                "Report {} stored with {} queries",
                report.id.unwrap_or_default(),
                report.items.len()
            );
            if let Some(path) = artifact {
                println!("Usage artifact: {}", path.display());
            }
        }
        (SessionState::Completed, Some(SessionOutcome::NoiseCaptured { added })) => {
            println!("Captured {added} new noise queries");
        }
        (SessionState::Cancelled, _) => println!("Session stopped before completion"),
        (state, _) => {
            warn!(?state, "Session did not complete");
            bail!("tracking session ended in state {state:?}");
        }
    }
    Ok(())
}

fn window_minutes(minutes: u64) -> Duration {
    Duration::from_secs(minutes.saturating_mul(60))
}

fn run_reports(config: &Config, id: i64) -> Result<()> {
    let store = open_store(config)?;
    let reports = store
        .list_reports(id)
        .with_context(|| format!("Failed to list reports for connection {id}"))?;
    if reports.is_empty() {
        println!("No reports for connection {id}.");
    }
    for r in reports {
        println!(
            "{:>4}  {}  {} queries",
            r.id,
            r.date_of_log.format("%Y-%m-%d %H:%M:%S UTC"),
            r.item_count
        );
    }
    Ok(())
}

fn run_report(config: &Config, id: i64) -> Result<()> {
    let store = open_store(config)?;
    let report = store
        .get_report(id)
        .with_context(|| format!("Failed to load report {id}"))?;

    println!(
        "Report {} for connection {} at {}",
        id,
        report.connection_id,
        report.date_of_log.format("%Y-%m-%d %H:%M:%S UTC")
    );
    for item in report.items {
        println!();
        println!("-- {}", item.query);
        println!("{}", item.tables_and_columns);
    }
    Ok(())
}

fn run_analyze(config: &Config, sql: &str) -> Result<()> {
    let extractor = Extractor::new(&config.extractor_config()).context("Invalid extractor configuration")?;
    let usage = extractor.try_extract(sql).context("Extraction failed")?;

    println!("type:    {}", usage.query_type);
    println!("tables:  {}", usage.tables.join(", "));
    println!("columns: {}", usage.columns.join(", "));
    println!();
    println!("{}", format_summary(&group_by_table(&usage)));

    let unattributed = unattributed_columns(&usage);
    if !unattributed.is_empty() {
        println!();
        println!("not tied to a table: {}", unattributed.join(", "));
    }
    Ok(())
}

/// Initializes the tracing subscriber on stderr.
///
/// Uses the `RUST_LOG` environment variable for filtering, defaulting to `info`.
fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_level(true)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
