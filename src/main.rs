//! CLI entry point for the realtime timetable updater.
//!
//! Provides subcommands for polling every configured feed into a shared
//! timetable snapshot, replaying recorded feed files once, and inspecting a
//! single GTFS-RT message.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rt_timetable::config::{Config, FeedConfig, SourceConfig};
use rt_timetable::fetch::{BasicClient, fetch_bytes};
use rt_timetable::model::TransitModel;
use rt_timetable::output::{CsvResultSink, FanoutSink, LoggingResultSink};
use rt_timetable::parser::{FeedMapper, parse_feed};
use rt_timetable::snapshot::{SnapshotReader, TimetableStore};
use rt_timetable::source::{FileReplaySource, GtfsRtHttpSource, UpdateSource};
use rt_timetable::updater::{
    DeltaApplier, PollingUpdater, Readiness, ResultDispatcher, ResultSink, ScheduleTripMatcher,
    UpdateHandler, WriteSerializer,
};
use chrono::FixedOffset;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "rt_timetable")]
#[command(about = "Applies realtime trip updates to a static timetable", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every configured feed until Ctrl+C
    Run {
        /// JSON config file
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
    },
    /// Apply GTFS-RT files once, as the pages of one delivery
    Replay {
        /// Static schedule JSON file
        #[arg(short, long)]
        model: PathBuf,

        /// Feed the files belong to
        #[arg(short, long)]
        feed_id: String,

        /// Offset of the feed's local time from UTC, in minutes
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        utc_offset_minutes: i32,

        /// Match updates without a known trip id against the schedule
        #[arg(long, default_value_t = false)]
        fuzzy: bool,

        /// Feed files, replayed in order
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Decode a GTFS-RT message from a file or URL and log its update records
    Inspect {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// Feed id to scope the records to
        #[arg(short, long, default_value = "inspect")]
        feed_id: String,

        /// Offset of the feed's local time from UTC, in minutes
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        utc_offset_minutes: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/rt_timetable.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("rt_timetable.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config).await?,
        Commands::Replay {
            model,
            feed_id,
            utc_offset_minutes,
            fuzzy,
            files,
        } => replay(&model, &feed_id, utc_offset_minutes, fuzzy, files).await?,
        Commands::Inspect {
            source,
            feed_id,
            utc_offset_minutes,
        } => {
            let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
                .context("utc offset out of range")?;
            let bytes = fetcher(&source).await?;
            let feed = parse_feed(&bytes)?;
            let mapped = FeedMapper::new(feed_id, offset).map(&feed);

            info!(
                version = %feed.header.gtfs_realtime_version,
                timestamp = feed.header.timestamp,
                full_dataset = mapped.delivery.full_dataset,
                entities = feed.entity.len(),
                records = mapped.delivery.records.len(),
                skipped = mapped.skipped,
                "Feed header"
            );
            for record in &mapped.delivery.records {
                info!(
                    trip = %record.trip,
                    service_date = %record.service_date,
                    status = ?record.status,
                    stops = record.stop_times.len(),
                    "Record"
                );
            }
        }
    }

    Ok(())
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(fields(source = %url))]
async fn fetcher(url: &str) -> Result<Vec<u8>> {
    let bytes = if url.starts_with("http") {
        let client = BasicClient::with_timeout(Duration::from_secs(30))?;
        fetch_bytes(&client, url).await?
    } else {
        std::fs::read(url)?
    };
    Ok(bytes)
}

fn result_sink(results_csv: Option<&Path>) -> Arc<dyn ResultSink> {
    match results_csv {
        Some(path) => {
            info!(path = %path.display(), "Appending results to CSV");
            let sinks: Vec<Arc<dyn ResultSink>> = vec![
                Arc::new(LoggingResultSink),
                Arc::new(CsvResultSink::new(path)),
            ];
            Arc::new(FanoutSink::new(sinks))
        }
        None => Arc::new(LoggingResultSink),
    }
}

fn build_updater(
    feed: &FeedConfig,
    model: Arc<TransitModel>,
    lane: WriteSerializer<TimetableStore>,
    results: ResultDispatcher,
    reader: SnapshotReader,
) -> Result<PollingUpdater> {
    let mut applier = DeltaApplier::new(feed.feed_id.clone());
    if feed.fuzzy_trip_matching {
        applier = applier.with_fuzzy_matching(Arc::new(ScheduleTripMatcher::new(model.clone())));
    }

    let mapper = FeedMapper::new(feed.feed_id.clone(), feed.utc_offset()?).with_model(model);
    let source: Box<dyn UpdateSource> = match &feed.source {
        SourceConfig::GtfsRt { url } => {
            Box::new(GtfsRtHttpSource::new(url.clone(), feed.http_client()?, mapper))
        }
        SourceConfig::Files { paths } => Box::new(FileReplaySource::new(paths.clone(), mapper)),
    };

    let handler = UpdateHandler::new(applier, source.source_kind(), lane, results);
    Ok(PollingUpdater::new(source, handler, feed.polling_period(), reader))
}

/// Starts one polling task per feed on a shared write lane and runs until
/// Ctrl+C.
#[tracing::instrument(skip_all, fields(config = %config_path.display()))]
async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let model = Arc::new(TransitModel::load(&config.model_path)?);
    info!(
        trips = model.trip_count(),
        patterns = model.pattern_count(),
        feeds = config.feeds.len(),
        "Loaded static model"
    );

    let mut store = TimetableStore::new(model.clone());
    if let Some(days) = config.retention_days {
        store = store.with_retention_days(days);
    }
    let reader = store.reader();
    let lane = WriteSerializer::spawn("timetable-writer", store)?;
    let results = ResultDispatcher::spawn(result_sink(config.results_csv.as_deref()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut readiness = Readiness::new();
    let mut tasks = vec![];
    for feed in &config.feeds {
        let updater = build_updater(feed, model.clone(), lane.clone(), results.clone(), reader.clone())?;
        if feed.block_readiness_until_initialized {
            readiness.block_on(feed.feed_id.clone(), updater.primed_flag());
        }
        let mut shutdown = shutdown_rx.clone();
        let feed_span = tracing::info_span!("feed", feed_id = %feed.feed_id);

        let task = tokio::spawn(
            updater
                .run(async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                })
                .instrument(feed_span),
        );
        tasks.push((feed.feed_id.clone(), task));
    }

    if readiness.blocking_feeds() > 0 {
        info!(waiting_on = ?readiness.waiting_on(), "Readiness blocked until feeds are primed");
        tokio::spawn(async move {
            readiness.wait(Duration::from_secs(1)).await;
            info!("Service ready, every blocking feed is primed");
        });
    }

    info!("Polling started. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send_replace(true);

    for (feed_id, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(feed_id = %feed_id, error = %e, "Updater stopped with an error"),
            Err(e) => error!(feed_id = %feed_id, error = %e, "Updater task panicked"),
        }
    }

    let snapshot = reader.current();
    info!(
        version = snapshot.version(),
        realtime_trips = snapshot.realtime_trip_count(),
        "Final snapshot"
    );
    Ok(())
}

/// Applies `files` as one delivery of `feed_id` and logs the result and the
/// published snapshot.
#[tracing::instrument(skip(files), fields(files = files.len()))]
async fn replay(
    model_path: &Path,
    feed_id: &str,
    utc_offset_minutes: i32,
    fuzzy: bool,
    files: Vec<PathBuf>,
) -> Result<()> {
    let model = Arc::new(TransitModel::load(model_path)?);
    let feed = FeedConfig {
        feed_id: feed_id.to_string(),
        source: SourceConfig::Files { paths: files },
        polling_period_secs: 1,
        fuzzy_trip_matching: fuzzy,
        timeout_secs: 1,
        utc_offset_minutes,
        auth: None,
        block_readiness_until_initialized: false,
    };

    let store = TimetableStore::new(model.clone());
    let reader = store.reader();
    let lane = WriteSerializer::spawn("timetable-writer", store)?;
    let results = ResultDispatcher::spawn(Arc::new(LoggingResultSink));
    let mut updater = build_updater(&feed, model, lane, results, reader)?;

    let Some(completion) = updater.run_cycle().await? else {
        warn!("Files contained no trip updates");
        return Ok(());
    };
    let result = completion.await?;
    info!("{}", serde_json::to_string_pretty(&result)?);

    let snapshot = updater.current_snapshot();
    let cancelled = snapshot.realtime_trips().filter(|tt| tt.is_cancelled()).count();
    info!(
        version = snapshot.version(),
        realtime_trips = snapshot.realtime_trip_count(),
        added_trips = snapshot.added_trip_count(),
        cancelled,
        primed = updater.is_primed(),
        "Snapshot published"
    );
    Ok(())
}
