use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{Days, NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::{DeliveryView, PendingDelivery, Snapshot, SnapshotReader, TimetableBuffer};
use crate::model::TransitModel;
use crate::updater::applier::{ApplyError, DeltaApplier};
use crate::updater::record::Page;
use crate::updater::result::UpdateResult;

/// What applying one page did to the feed's delivery.
#[derive(Debug)]
pub enum PageOutcome {
    /// The page is staged; more pages of the delivery will follow. A page
    /// that failed structurally was rolled back and reports only aborted
    /// records.
    Staged(UpdateResult),
    /// The final page was applied and the delivery published. If that page
    /// failed structurally, only the earlier pages were published and
    /// `result` carries the failure.
    Published {
        snapshot: Arc<Snapshot>,
        result: UpdateResult,
    },
}

/// State owned by the write lane: the working buffer, one pending delivery
/// per feed and the published snapshot pointer.
///
/// Deliveries are staged per feed so that the pages of a multi-page delivery
/// from one feed are never published by another feed's commit.
pub struct TimetableStore {
    buffer: TimetableBuffer,
    pending: HashMap<String, PendingDelivery>,
    current: Arc<ArcSwap<Snapshot>>,
    // wakes readers waiting in `SnapshotReader::changed`
    published: watch::Sender<u64>,
    version: u64,
    retention: Option<Days>,
    purged_before: Option<NaiveDate>,
}

impl TimetableStore {
    pub fn new(model: Arc<TransitModel>) -> Self {
        let (published, _) = watch::channel(0);
        Self {
            current: Arc::new(ArcSwap::from_pointee(Snapshot::empty(model.clone()))),
            buffer: TimetableBuffer::new(model),
            pending: HashMap::new(),
            published,
            version: 0,
            retention: None,
            purged_before: None,
        }
    }

    /// Drops realtime data for service dates more than `days` before today
    /// (UTC) whenever a commit sees the date roll over.
    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention = Some(Days::new(days));
        self
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader::new(self.current.clone(), self.published.subscribe())
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn buffer(&self) -> &TimetableBuffer {
        &self.buffer
    }

    /// Opens a delivery for `feed_id`. An unfinished delivery left behind by
    /// an interrupted poll cycle is dropped.
    pub fn begin_delivery(&mut self, feed_id: &str, full_dataset: bool) {
        let fresh = PendingDelivery::new(feed_id, full_dataset);
        if let Some(stale) = self.pending.insert(feed_id.to_string(), fresh) {
            warn!(
                feed_id,
                pages = stale.pages(),
                changes = stale.change_count(),
                "Discarding unfinished delivery"
            );
        }
    }

    pub fn pending(&self, feed_id: &str) -> Option<&PendingDelivery> {
        self.pending.get(feed_id)
    }

    pub fn view(&mut self, feed_id: &str) -> Option<DeliveryView<'_>> {
        let pending = self.pending.get_mut(feed_id)?;
        Some(self.buffer.view(pending))
    }

    /// Puts back a savepoint taken before a page started.
    pub fn restore(&mut self, savepoint: PendingDelivery) {
        self.pending.insert(savepoint.feed_id().to_string(), savepoint);
    }

    /// Applies one page of `applier`'s feed against the committed buffer
    /// overlaid with the feed's pending changes, and publishes the delivery
    /// when the page is its last.
    ///
    /// A page that fails structurally is rolled back on its own; earlier
    /// pages of the delivery stay staged.
    pub fn apply_page(&mut self, applier: &DeltaApplier, page: Page) -> PageOutcome {
        let feed_id = applier.feed_id();
        if page.first_page {
            self.begin_delivery(feed_id, page.full_dataset);
        }

        let mut pending = self
            .pending
            .remove(feed_id)
            .unwrap_or_else(|| PendingDelivery::new(feed_id, page.full_dataset));
        let savepoint = pending.clone();
        let mut view = self.buffer.view(&mut pending);

        let mut result = UpdateResult::default();
        let mut structural = None;
        for record in &page.records {
            match applier.apply(&mut view, record) {
                Ok(change) => {
                    trace!(feed_id, trip = %record.trip, ?change, "Applied update");
                    result.record_success();
                }
                Err(ApplyError::Record(error)) => {
                    debug!(feed_id, %error, "Rejected update");
                    result.record_failure(error);
                }
                Err(ApplyError::Structural(error)) => {
                    structural = Some(error);
                    break;
                }
            }
        }

        let page_result = match structural {
            Some(error) => {
                warn!(feed_id, %error, records = page.records.len(), "Page failed, rolling it back");
                pending = savepoint;
                UpdateResult::structural(&error, page.records.len())
            }
            None => result,
        };
        pending.record_page(&page_result);

        if page.more_data {
            self.pending.insert(feed_id.to_string(), pending);
            return PageOutcome::Staged(page_result);
        }
        let (snapshot, result) = self.publish(pending);
        PageOutcome::Published { snapshot, result }
    }

    /// Merges the feed's pending delivery into the buffer and publishes the
    /// result as the next snapshot version in one swap.
    pub fn commit(&mut self, feed_id: &str) -> Option<(Arc<Snapshot>, UpdateResult)> {
        let pending = self.pending.remove(feed_id)?;
        Some(self.publish(pending))
    }

    fn publish(&mut self, pending: PendingDelivery) -> (Arc<Snapshot>, UpdateResult) {
        let feed_id = pending.feed_id().to_string();
        let pages = pending.pages();
        let result = self.buffer.merge(pending);
        self.purge_expired();

        self.version += 1;
        let snapshot = Arc::new(self.buffer.snapshot(self.version));
        self.current.store(snapshot.clone());
        self.published.send_replace(self.version);

        debug!(
            feed_id = %feed_id,
            version = self.version,
            pages,
            realtime_trips = snapshot.realtime_trip_count(),
            "Published timetable snapshot"
        );
        (snapshot, result)
    }

    fn purge_expired(&mut self) {
        let Some(retention) = self.retention else {
            return;
        };
        let Some(cutoff) = Utc::now().date_naive().checked_sub_days(retention) else {
            return;
        };
        if self.purged_before.is_some_and(|done| done >= cutoff) {
            return;
        }
        let purged = self.buffer.purge_before(cutoff);
        self.purged_before = Some(cutoff);
        if purged > 0 {
            info!(%cutoff, purged, "Purged expired realtime data");
        }
    }
}
