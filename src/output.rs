//! Result sinks: structured log lines and CSV rows.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::updater::result::{ResultSink, UpdateResult};

/// Appends one serializable record as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}

/// Logs every delivery result at info level, and its failures at debug.
pub struct LoggingResultSink;

impl ResultSink for LoggingResultSink {
    fn on_result(&self, feed_id: &str, source_kind: &str, result: &UpdateResult) {
        let failures = serde_json::to_string(&result.failures_by_kind()).unwrap_or_default();
        if let Some(failure) = &result.structural_failure {
            warn!(feed_id, source_kind, failure = %failure, aborted = result.aborted, "Delivery failed");
        }
        info!(
            feed_id,
            source_kind,
            successful = result.successful,
            rejected = result.rejected,
            unmatched = result.unmatched,
            total = result.total(),
            failures = %failures,
            "Update result"
        );
        for failure in &result.failures {
            debug!(feed_id, trip = %failure.trip, kind = ?failure.kind, stop_index = failure.stop_index, "Update rejected");
        }
    }
}

#[derive(Debug, Serialize)]
struct ResultRow<'a> {
    timestamp: DateTime<Utc>,
    feed_id: &'a str,
    source_kind: &'a str,
    successful: usize,
    rejected: usize,
    unmatched: usize,
    aborted: usize,
    structural_failure: Option<&'a str>,
    failures: String,
}

impl<'a> ResultRow<'a> {
    fn new(feed_id: &'a str, source_kind: &'a str, result: &'a UpdateResult) -> Self {
        let failures = result
            .failures_by_kind()
            .into_iter()
            .map(|(kind, count)| format!("{kind:?}={count}"))
            .collect::<Vec<_>>()
            .join(";");
        Self {
            timestamp: Utc::now(),
            feed_id,
            source_kind,
            successful: result.successful,
            rejected: result.rejected,
            unmatched: result.unmatched,
            aborted: result.aborted,
            structural_failure: result.structural_failure.as_deref(),
            failures,
        }
    }
}

/// Appends one CSV row per delivery result.
pub struct CsvResultSink {
    path: PathBuf,
    // rows from different feeds must not interleave
    lock: Mutex<()>,
}

impl CsvResultSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl ResultSink for CsvResultSink {
    fn on_result(&self, feed_id: &str, source_kind: &str, result: &UpdateResult) {
        let row = ResultRow::new(feed_id, source_kind, result);
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = append_record(&self.path, &row) {
            error!(path = %self.path.display(), error = %e, "Failed to append result row");
        }
    }
}

/// Forwards every result to each inner sink in order.
pub struct FanoutSink(Vec<Arc<dyn ResultSink>>);

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self(sinks)
    }
}

impl ResultSink for FanoutSink {
    fn on_result(&self, feed_id: &str, source_kind: &str, result: &UpdateResult) {
        for sink in &self.0 {
            sink.on_result(feed_id, source_kind, result);
        }
    }
}
