use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::NaiveDate;

use super::{Snapshot, TimetableKey, Timetable, TripTimes};
use crate::model::{FeedScopedId, Pattern, TransitModel, TripKey};
use crate::updater::result::UpdateResult;

#[derive(Debug, Clone)]
enum Change {
    Put(Arc<TripTimes>),
    Revert,
}

/// Changes of one delivery, accumulated page by page, that have not been
/// merged into the buffer yet.
///
/// Cloning is cheap (maps of `Arc`s) and is how a page takes a savepoint
/// before it starts applying records.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    feed_id: String,
    reset_feed: bool,
    changes: HashMap<TripKey, Change>,
    patterns: HashMap<FeedScopedId, Arc<Pattern>>,
    result: UpdateResult,
    pages: usize,
}

impl PendingDelivery {
    pub fn new(feed_id: impl Into<String>, full_dataset: bool) -> Self {
        Self {
            feed_id: feed_id.into(),
            reset_feed: full_dataset,
            changes: HashMap::new(),
            patterns: HashMap::new(),
            result: UpdateResult::default(),
            pages: 0,
        }
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    pub fn is_full_dataset(&self) -> bool {
        self.reset_feed
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    pub fn result(&self) -> &UpdateResult {
        &self.result
    }

    /// Folds one page's outcome into the delivery result.
    pub fn record_page(&mut self, page: &UpdateResult) {
        self.result.merge(page);
        self.pages += 1;
    }
}

/// The write lane's working copy of all realtime state.
///
/// Only the task currently running on the lane touches it. Committed
/// deliveries are merged in place and a new [`Snapshot`] is cut from it. The
/// committed maps are persistent (`im`), so cutting a snapshot is a cheap
/// clone that shares structure with the buffer and every earlier version.
#[derive(Debug)]
pub struct TimetableBuffer {
    model: Arc<TransitModel>,
    trip_times: im::HashMap<TripKey, Arc<TripTimes>>,
    timetables: im::HashMap<TimetableKey, Arc<Timetable>>,
    added_patterns: im::HashMap<FeedScopedId, Arc<Pattern>>,
    // realtime trips per timetable, so a rebuild only visits its own trips
    members: HashMap<TimetableKey, HashSet<TripKey>>,
    dirty: HashSet<TimetableKey>,
}

impl TimetableBuffer {
    pub fn new(model: Arc<TransitModel>) -> Self {
        Self {
            model,
            trip_times: im::HashMap::new(),
            timetables: im::HashMap::new(),
            added_patterns: im::HashMap::new(),
            members: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    pub fn model(&self) -> &Arc<TransitModel> {
        &self.model
    }

    pub fn get(&self, key: &TripKey) -> Option<&Arc<TripTimes>> {
        self.trip_times.get(key)
    }

    pub fn len(&self) -> usize {
        self.trip_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trip_times.is_empty()
    }

    pub fn view<'a>(&'a self, pending: &'a mut PendingDelivery) -> DeliveryView<'a> {
        DeliveryView {
            buffer: self,
            pending,
        }
    }

    /// Merges a finished delivery and returns its aggregated result. A
    /// full-dataset delivery first drops every realtime entry of its feed.
    pub fn merge(&mut self, pending: PendingDelivery) -> UpdateResult {
        let PendingDelivery {
            feed_id,
            reset_feed,
            changes,
            patterns,
            result,
            ..
        } = pending;

        if reset_feed {
            let stale: Vec<TripKey> = self
                .trip_times
                .keys()
                .filter(|key| key.feed_id() == feed_id)
                .cloned()
                .collect();
            for key in stale {
                self.remove(&key);
            }
            let stale: Vec<FeedScopedId> = self
                .added_patterns
                .keys()
                .filter(|id| id.feed_id == feed_id)
                .cloned()
                .collect();
            for id in stale {
                self.added_patterns.remove(&id);
            }
        }

        for (key, change) in changes {
            match change {
                Change::Put(tt) => self.insert(key, tt),
                Change::Revert => self.remove(&key),
            }
        }

        for (id, pattern) in patterns {
            self.added_patterns.insert(id, pattern);
        }
        result
    }

    /// Drops realtime state for service dates before `cutoff`, together
    /// with added patterns no remaining trip uses. Returns the number of trips
    /// dropped.
    pub fn purge_before(&mut self, cutoff: NaiveDate) -> usize {
        let expired: Vec<TripKey> = self
            .trip_times
            .keys()
            .filter(|key| key.service_date < cutoff)
            .cloned()
            .collect();
        for key in &expired {
            self.remove(key);
        }

        let stale: Vec<TimetableKey> = self
            .timetables
            .keys()
            .filter(|(_, date)| *date < cutoff)
            .cloned()
            .collect();
        for key in stale {
            self.timetables.remove(&key);
        }
        self.dirty.retain(|(_, date)| *date >= cutoff);

        let in_use: HashSet<&FeedScopedId> = self
            .trip_times
            .values()
            .filter(|tt| tt.is_added())
            .map(|tt| tt.pattern_id())
            .collect();
        let unused: Vec<FeedScopedId> = self
            .added_patterns
            .keys()
            .filter(|id| !in_use.contains(id))
            .cloned()
            .collect();
        for id in unused {
            self.added_patterns.remove(&id);
        }

        expired.len()
    }

    /// Rebuilds the timetables touched since the last cut and returns a new
    /// snapshot version.
    pub fn snapshot(&mut self, version: u64) -> Snapshot {
        for key in std::mem::take(&mut self.dirty) {
            let updated: Vec<Arc<TripTimes>> = self
                .members
                .get(&key)
                .into_iter()
                .flatten()
                .filter_map(|trip| self.trip_times.get(trip).cloned())
                .collect();
            if updated.is_empty() {
                self.timetables.remove(&key);
            } else {
                let timetable = self.merged_timetable(&key, updated);
                self.timetables.insert(key, Arc::new(timetable));
            }
        }

        Snapshot::new(
            version,
            self.model.clone(),
            self.trip_times.clone(),
            self.timetables.clone(),
            self.added_patterns.clone(),
        )
    }

    fn merged_timetable(&self, key: &TimetableKey, updated: Vec<Arc<TripTimes>>) -> Timetable {
        let (pattern_id, service_date) = key;
        let updated_ids: HashSet<&FeedScopedId> = updated.iter().map(|tt| tt.trip_id()).collect();
        let mut trip_times: Vec<Arc<TripTimes>> = self
            .model
            .trips_on_pattern(pattern_id)
            .filter(|trip| trip.runs_on(*service_date) && !updated_ids.contains(&trip.id))
            .map(|trip| Arc::new(TripTimes::scheduled(trip, *service_date)))
            .collect();
        trip_times.extend(updated.iter().cloned());
        Timetable::new(pattern_id.clone(), *service_date, trip_times)
    }

    fn insert(&mut self, key: TripKey, tt: Arc<TripTimes>) {
        let timetable = timetable_key(&tt);
        self.members.entry(timetable.clone()).or_default().insert(key.clone());
        self.dirty.insert(timetable);
        if let Some(old) = self.trip_times.insert(key.clone(), tt) {
            self.forget(&key, &old);
        }
    }

    fn remove(&mut self, key: &TripKey) {
        if let Some(old) = self.trip_times.remove(key) {
            self.forget(key, &old);
        }
    }

    // drops `key` from the timetable `old` belonged to, unless the trip is
    // still listed there under its current times
    fn forget(&mut self, key: &TripKey, old: &TripTimes) {
        let timetable = timetable_key(old);
        self.dirty.insert(timetable.clone());
        let still_member = self
            .trip_times
            .get(key)
            .is_some_and(|current| timetable_key(current) == timetable);
        if still_member {
            return;
        }
        if let Some(members) = self.members.get_mut(&timetable) {
            members.remove(key);
            if members.is_empty() {
                self.members.remove(&timetable);
            }
        }
    }
}

fn timetable_key(tt: &TripTimes) -> TimetableKey {
    (tt.pattern_id().clone(), tt.service_date())
}

/// The state a delivery sees while it is being applied: the committed buffer
/// overlaid with the delivery's own pending changes.
#[derive(Debug)]
pub struct DeliveryView<'a> {
    buffer: &'a TimetableBuffer,
    pending: &'a mut PendingDelivery,
}

impl DeliveryView<'_> {
    pub fn feed_id(&self) -> &str {
        &self.pending.feed_id
    }

    pub fn model(&self) -> &TransitModel {
        &self.buffer.model
    }

    pub fn get(&self, key: &TripKey) -> Option<Arc<TripTimes>> {
        match self.pending.changes.get(key) {
            Some(Change::Put(tt)) => Some(tt.clone()),
            Some(Change::Revert) => None,
            None if self.hides(&key.trip_id) => None,
            None => self.buffer.trip_times.get(key).cloned(),
        }
    }

    pub fn pattern(&self, id: &FeedScopedId) -> Option<&Pattern> {
        if let Some(pattern) = self.buffer.model.pattern(id) {
            return Some(pattern);
        }
        if let Some(pattern) = self.pending.patterns.get(id) {
            return Some(pattern);
        }
        if self.hides(id) {
            return None;
        }
        self.buffer.added_patterns.get(id).map(Arc::as_ref)
    }

    pub fn put(&mut self, tt: TripTimes) {
        self.pending
            .changes
            .insert(tt.key().clone(), Change::Put(Arc::new(tt)));
    }

    pub fn revert(&mut self, key: &TripKey) {
        self.pending.changes.insert(key.clone(), Change::Revert);
    }

    pub fn add_pattern(&mut self, pattern: Pattern) {
        self.pending
            .patterns
            .insert(pattern.id.clone(), Arc::new(pattern));
    }

    // committed state of the feed is invisible once a full dataset started
    fn hides(&self, id: &FeedScopedId) -> bool {
        self.pending.reset_feed && id.feed_id == self.pending.feed_id
    }
}
