//! Outcome of applying a delivery, and the sink it is reported to.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateErrorKind {
    #[error("no trip matches the update")]
    UnmatchedTrip,
    #[error("trip does not run on the service date")]
    NoTripForDate,
    #[error("stop list is inconsistent with the trip's stop pattern")]
    InvalidStopSequence,
    #[error("arrival after departure")]
    NegativeDwellTime,
    #[error("arrival before departure from the previous stop")]
    NegativeHopTime,
    #[error("added trip has fewer than two stops")]
    TooFewStops,
    #[error("trip already exists on the service date")]
    AlreadyExists,
    #[error("stop time is out of range")]
    InvalidTime,
}

/// A record that could not be applied. The rest of the delivery continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateError {
    pub trip: String,
    pub kind: UpdateErrorKind,
    pub stop_index: Option<usize>,
}

impl UpdateError {
    pub fn new(trip: impl fmt::Display, kind: UpdateErrorKind) -> Self {
        Self {
            trip: trip.to_string(),
            kind,
            stop_index: None,
        }
    }

    pub fn at_stop(trip: impl fmt::Display, kind: UpdateErrorKind, stop_index: usize) -> Self {
        Self {
            stop_index: Some(stop_index),
            ..Self::new(trip, kind)
        }
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stop_index {
            Some(index) => write!(f, "{} at stop {}: {}", self.trip, index, self.kind),
            None => write!(f, "{}: {}", self.trip, self.kind),
        }
    }
}

impl std::error::Error for UpdateError {}

/// Problems that make a whole page unusable. The page's changes are rolled
/// back and the published snapshot is left as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("record for feed {found} delivered to the updater of feed {expected}")]
    FeedMismatch { expected: String, found: String },
    #[error("trip {0} references a pattern missing from the model")]
    MissingPattern(String),
}

/// Per-delivery counts of applied, rejected and unmatched records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub successful: usize,
    /// Matched to a trip but rejected.
    pub rejected: usize,
    pub unmatched: usize,
    /// Dropped with a page that failed structurally.
    pub aborted: usize,
    pub failures: Vec<UpdateError>,
    pub structural_failure: Option<String>,
}

impl UpdateResult {
    /// A page that failed as a whole.
    pub fn structural(error: &StructuralError, records: usize) -> Self {
        Self {
            aborted: records,
            structural_failure: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn record_success(&mut self) {
        self.successful += 1;
    }

    pub fn record_failure(&mut self, error: UpdateError) {
        match error.kind {
            UpdateErrorKind::UnmatchedTrip => self.unmatched += 1,
            _ => self.rejected += 1,
        }
        self.failures.push(error);
    }

    pub fn merge(&mut self, other: &UpdateResult) {
        self.successful += other.successful;
        self.rejected += other.rejected;
        self.unmatched += other.unmatched;
        self.aborted += other.aborted;
        self.failures.extend(other.failures.iter().cloned());
        if other.structural_failure.is_some() {
            self.structural_failure = other.structural_failure.clone();
        }
    }

    pub fn total(&self) -> usize {
        self.successful + self.rejected + self.unmatched + self.aborted
    }

    pub fn failures_by_kind(&self) -> BTreeMap<UpdateErrorKind, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, kind: UpdateErrorKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }

    pub fn is_structural_failure(&self) -> bool {
        self.structural_failure.is_some()
    }
}

/// Receives the result of every delivery. Called off the write lane.
pub trait ResultSink: Send + Sync {
    fn on_result(&self, feed_id: &str, source_kind: &str, result: &UpdateResult);
}
