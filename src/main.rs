use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use listenstat::collector::stats::StatsSnapshot;
use listenstat::collector::{Collector, SubmitReport};
use listenstat::config::Config;
use listenstat::maintenance::run_maintenance;
use listenstat::metrics::Metrics;
use listenstat::query::export::{export_events, ExportFormat};
use listenstat::query::{self, EventFilter, NormalizedFilter};
use listenstat::store::{migrate, EventStore};

/// Playback telemetry ingestion, rollup and export.
#[derive(Parser)]
#[command(name = "listenstat", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the configured level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit JSON event batches from files ("-" reads stdin).
    Ingest(IngestArgs),
    /// Materialize completed days and prune expired raw events.
    Maintain(MaintainArgs),
    /// Inspect or step the database schema version.
    Migrate(MigrateArgs),
    /// Write raw events as JSON or CSV to stdout.
    Export(ExportArgs),
    /// Print aggregate statistics as JSON.
    Stats(StatsArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct IngestArgs {
    /// Session identifier (64 lowercase hex characters).
    #[arg(long)]
    session: String,

    /// Print Prometheus metrics after the collector closes.
    #[arg(long)]
    print_metrics: bool,

    /// Batch files, each a JSON array of events.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[derive(Args)]
struct MaintainArgs {
    /// Retention horizon in days; 0 disables pruning. Defaults to config.
    #[arg(long)]
    retention_days: Option<u32>,

    /// Reference time (RFC 3339). Defaults to now.
    #[arg(long)]
    now: Option<DateTime<Utc>>,

    /// Print Prometheus metrics for this pass after the report.
    #[arg(long)]
    print_metrics: bool,
}

#[derive(Args)]
struct MigrateArgs {
    #[command(subcommand)]
    action: MigrateAction,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Show the applied schema version.
    Status,
    /// Apply all pending migrations.
    Up,
    /// Roll back the most recently applied migration.
    Down,
}

#[derive(Serialize)]
struct SchemaStatus {
    version: u32,
    dirty: bool,
    latest: u32,
}

#[derive(Args)]
struct ExportArgs {
    /// Output format: json or csv.
    #[arg(long, default_value = "json")]
    format: ExportFormat,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatsView {
    Summary,
    Tracks,
    Dropouts,
    Rollups,
    Timeline,
}

#[derive(Args)]
struct StatsArgs {
    #[arg(long, value_enum, default_value = "summary")]
    view: StatsView,

    /// Session to show; required for the timeline view.
    #[arg(long, required_if_eq("view", "timeline"))]
    session: Option<String>,

    #[command(flatten)]
    filter: FilterArgs,
}

#[derive(Args)]
struct FilterArgs {
    /// Inclusive lower bound on creation time (RFC 3339).
    #[arg(long)]
    since: Option<DateTime<Utc>>,

    /// Exclusive upper bound on creation time (RFC 3339).
    #[arg(long)]
    until: Option<DateTime<Utc>>,

    /// Track stem to include; repeatable.
    #[arg(long = "track")]
    tracks: Vec<String>,

    /// Event type to include; repeatable.
    #[arg(long = "event-type")]
    event_types: Vec<String>,

    /// Maximum rows returned.
    #[arg(long)]
    limit: Option<usize>,
}

impl FilterArgs {
    fn normalize(&self) -> Result<NormalizedFilter> {
        let filter = EventFilter {
            since: self.since,
            until: self.until,
            track_stems: self.tracks.clone(),
            event_types: self.event_types.clone(),
            limit: self.limit,
        };
        Ok(filter.normalize()?)
    }
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash captured by build.rs, or "unknown".
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Command::Version) {
        println!("listenstat {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    // Logs go to stderr so command output on stdout stays machine-readable.
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(version = version::RELEASE, commit = version::git_commit(), "starting");

    match cli.command {
        Command::Ingest(args) => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;
            rt.block_on(ingest(cfg, args))
        }
        Command::Maintain(args) => maintain(&cfg, &args),
        Command::Migrate(args) => migrate_schema(&cfg, &args),
        Command::Export(args) => export(&cfg, &args),
        Command::Stats(args) => stats(&cfg, &args),
        Command::Version => Ok(()),
    }
}

#[derive(Serialize)]
struct IngestSummary {
    files: usize,
    batches_rejected: usize,
    submitted: SubmitReport,
    collector: StatsSnapshot,
}

async fn ingest(cfg: Config, args: IngestArgs) -> Result<()> {
    let store = Arc::new(EventStore::open_with_config(&cfg.database)?);
    let metrics = Arc::new(Metrics::new().context("creating metrics")?);
    let collector = Collector::spawn(
        cfg.collector.clone(),
        Arc::clone(&store),
        Some(Arc::clone(&metrics)),
    )
    .await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, shutting down");
            signal.cancel();
        }
    });

    let mut summary = IngestSummary {
        files: 0,
        batches_rejected: 0,
        submitted: SubmitReport::default(),
        collector: StatsSnapshot::default(),
    };

    for path in &args.files {
        if shutdown.is_cancelled() {
            tracing::warn!(remaining = args.files.len() - summary.files, "ingest interrupted");
            break;
        }
        summary.files += 1;

        let raw = match read_input(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "skipping unreadable batch");
                summary.batches_rejected += 1;
                continue;
            }
        };
        match collector.submit(&args.session, &raw).await {
            Ok(report) => {
                tracing::info!(
                    file = %path.display(),
                    accepted = report.accepted,
                    rejected = report.rejected,
                    dropped = report.dropped,
                    "batch submitted"
                );
                summary.submitted.accepted += report.accepted;
                summary.submitted.rejected += report.rejected;
                summary.submitted.dropped += report.dropped;
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "batch rejected");
                summary.batches_rejected += 1;
            }
        }
    }

    collector.close().await;
    summary.collector = collector.stats();

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if args.print_metrics {
        print!("{}", metrics.render()?);
    }

    Ok(())
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading batch from stdin")?;
        return Ok(buf);
    }
    std::fs::read(path).with_context(|| format!("reading batch file {}", path.display()))
}

fn maintain(cfg: &Config, args: &MaintainArgs) -> Result<()> {
    let store = EventStore::open_with_config(&cfg.database)?;
    let now = args.now.unwrap_or_else(Utc::now);
    let retention_days = args
        .retention_days
        .unwrap_or(cfg.maintenance.retention_days);

    let report = run_maintenance(&store, now, retention_days)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.print_metrics {
        let metrics = Metrics::new().context("creating metrics")?;
        metrics.observe_maintenance(&report);
        print!("{}", metrics.render()?);
    }
    Ok(())
}

fn migrate_schema(cfg: &Config, args: &MigrateArgs) -> Result<()> {
    // A raw connection: opening an EventStore would apply pending migrations.
    let path = &cfg.database.path;
    let mut conn = rusqlite::Connection::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    conn.busy_timeout(cfg.database.busy_timeout)
        .context("setting busy timeout")?;

    match args.action {
        MigrateAction::Status => {}
        MigrateAction::Up => migrate::up(&mut conn)?,
        MigrateAction::Down => migrate::down(&mut conn)?,
    }

    let (version, dirty) = migrate::status(&conn)?;
    let status = SchemaStatus {
        version,
        dirty,
        latest: migrate::latest_version(),
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn export(cfg: &Config, args: &ExportArgs) -> Result<()> {
    let store = EventStore::open_with_config(&cfg.database)?;
    let filter = args.filter.normalize()?;

    let stdout = std::io::stdout();
    let rows = export_events(&store, &filter, args.format, stdout.lock())?;
    tracing::info!(rows, format = %args.format, "export complete");
    Ok(())
}

fn stats(cfg: &Config, args: &StatsArgs) -> Result<()> {
    let store = EventStore::open_with_config(&cfg.database)?;
    let filter = args.filter.normalize()?;

    let out = match args.view {
        StatsView::Summary => serde_json::to_string_pretty(&query::summary(&store, &filter)?)?,
        StatsView::Tracks => serde_json::to_string_pretty(&query::track_stats(&store, &filter)?)?,
        StatsView::Dropouts => {
            serde_json::to_string_pretty(&query::dropout_histogram(&store, &filter)?)?
        }
        StatsView::Rollups => {
            serde_json::to_string_pretty(&query::daily_rollups(&store, &filter)?)?
        }
        StatsView::Timeline => {
            let session = args
                .session
                .as_deref()
                .context("--session is required for the timeline view")?;
            serde_json::to_string_pretty(&query::session_timeline(&store, session, &filter)?)?
        }
    };
    println!("{out}");
    Ok(())
}
