//! Versioned, immutable views of realtime trip state.
//!
//! A [`Snapshot`] is published by the write lane and read by any number of
//! routing tasks through a [`SnapshotReader`]. Lookups fall back to the static
//! schedule for trips without realtime data.

mod buffer;
mod store;
mod trip_times;

pub use buffer::{DeliveryView, PendingDelivery, TimetableBuffer};
pub use store::{PageOutcome, TimetableStore};
pub use trip_times::{RealtimeState, StopTime, TimeViolation, Timetable, TripOrigin, TripTimes};

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, NaiveDate, Utc};
use im::HashMap;
use tokio::sync::watch;

use crate::model::{FeedScopedId, Pattern, TransitModel, TripKey};

pub(crate) type TimetableKey = (FeedScopedId, NaiveDate);

/// One published version of the realtime state.
///
/// The maps are persistent: a new version shares every entry a commit did
/// not touch with the version before it.
#[derive(Debug)]
pub struct Snapshot {
    version: u64,
    published_at: DateTime<Utc>,
    model: Arc<TransitModel>,
    trip_times: HashMap<TripKey, Arc<TripTimes>>,
    timetables: HashMap<TimetableKey, Arc<Timetable>>,
    added_patterns: HashMap<FeedScopedId, Arc<Pattern>>,
}

impl Snapshot {
    pub(crate) fn empty(model: Arc<TransitModel>) -> Self {
        Self {
            version: 0,
            published_at: Utc::now(),
            model,
            trip_times: HashMap::new(),
            timetables: HashMap::new(),
            added_patterns: HashMap::new(),
        }
    }

    pub(crate) fn new(
        version: u64,
        model: Arc<TransitModel>,
        trip_times: HashMap<TripKey, Arc<TripTimes>>,
        timetables: HashMap<TimetableKey, Arc<Timetable>>,
        added_patterns: HashMap<FeedScopedId, Arc<Pattern>>,
    ) -> Self {
        Self {
            version,
            published_at: Utc::now(),
            model,
            trip_times,
            timetables,
            added_patterns,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn model(&self) -> &Arc<TransitModel> {
        &self.model
    }

    /// Realtime record for the trip, if any update touched it.
    pub fn realtime_trip_times(&self, key: &TripKey) -> Option<&Arc<TripTimes>> {
        self.trip_times.get(key)
    }

    /// Current times of a trip: the realtime record, or the schedule when the
    /// trip runs on `service_date` and has no realtime data.
    pub fn trip_times(&self, trip_id: &FeedScopedId, service_date: NaiveDate) -> Option<Arc<TripTimes>> {
        let key = TripKey::new(trip_id.clone(), service_date);
        if let Some(tt) = self.trip_times.get(&key) {
            return Some(tt.clone());
        }
        self.model
            .trip(trip_id)
            .filter(|trip| trip.runs_on(service_date))
            .map(|trip| Arc::new(TripTimes::scheduled(trip, service_date)))
    }

    pub fn timetable(&self, pattern_id: &FeedScopedId, service_date: NaiveDate) -> Option<Arc<Timetable>> {
        if let Some(timetable) = self.timetables.get(&(pattern_id.clone(), service_date)) {
            return Some(timetable.clone());
        }
        self.model.timetable_for(pattern_id, service_date).map(Arc::new)
    }

    pub fn pattern(&self, pattern_id: &FeedScopedId) -> Option<&Pattern> {
        self.model
            .pattern(pattern_id)
            .or_else(|| self.added_patterns.get(pattern_id).map(Arc::as_ref))
    }

    pub fn is_cancelled(&self, trip_id: &FeedScopedId, service_date: NaiveDate) -> bool {
        self.trip_times
            .get(&TripKey::new(trip_id.clone(), service_date))
            .is_some_and(|tt| tt.is_cancelled())
    }

    pub fn realtime_trips(&self) -> impl Iterator<Item = &Arc<TripTimes>> {
        self.trip_times.values()
    }

    pub fn realtime_trip_count(&self) -> usize {
        self.trip_times.len()
    }

    pub fn added_trip_count(&self) -> usize {
        self.trip_times.values().filter(|tt| tt.is_added()).count()
    }
}

/// Read handle on the latest published snapshot.
#[derive(Clone)]
pub struct SnapshotReader {
    current: Arc<ArcSwap<Snapshot>>,
    published: watch::Receiver<u64>,
}

impl SnapshotReader {
    pub(crate) fn new(current: Arc<ArcSwap<Snapshot>>, published: watch::Receiver<u64>) -> Self {
        Self { current, published }
    }

    /// The snapshot published last. Safe to retain; later publications never
    /// modify it.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Waits for a version newer than the last one seen by this reader.
    pub async fn changed(&mut self) -> Option<Arc<Snapshot>> {
        self.published.changed().await.ok()?;
        self.published.borrow_and_update();
        Some(self.current())
    }
}

impl std::fmt::Debug for SnapshotReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotReader")
            .field("version", &self.current.load().version())
            .finish()
    }
}
