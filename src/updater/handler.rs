use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use super::applier::DeltaApplier;
use super::record::Page;
use super::result::{ResultSink, UpdateResult};
use super::serializer::{Completion, WriteSerializer};
use crate::snapshot::{PageOutcome, TimetableStore};

struct ResultEvent {
    feed_id: String,
    source_kind: String,
    result: UpdateResult,
}

/// Hands delivery results to a [`ResultSink`] from its own task so that slow
/// sinks never hold up the write lane.
#[derive(Clone)]
pub struct ResultDispatcher {
    tx: mpsc::UnboundedSender<ResultEvent>,
}

impl ResultDispatcher {
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn ResultSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ResultEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.on_result(&event.feed_id, &event.source_kind, &event.result);
            }
        });
        Self { tx }
    }

    pub fn dispatch(&self, feed_id: &str, source_kind: &str, result: UpdateResult) {
        let event = ResultEvent {
            feed_id: feed_id.to_string(),
            source_kind: source_kind.to_string(),
            result,
        };
        if self.tx.send(event).is_err() {
            warn!(feed_id, "Result dispatcher is gone, dropping result");
        }
    }
}

/// Applies the pages of one feed on the shared write lane.
pub struct UpdateHandler {
    applier: Arc<DeltaApplier>,
    source_kind: String,
    lane: WriteSerializer<TimetableStore>,
    results: ResultDispatcher,
}

impl UpdateHandler {
    pub fn new(
        applier: DeltaApplier,
        source_kind: impl Into<String>,
        lane: WriteSerializer<TimetableStore>,
        results: ResultDispatcher,
    ) -> Self {
        Self {
            applier: Arc::new(applier),
            source_kind: source_kind.into(),
            lane,
            results,
        }
    }

    pub fn feed_id(&self) -> &str {
        self.applier.feed_id()
    }

    pub fn source_kind(&self) -> &str {
        &self.source_kind
    }

    pub fn lane(&self) -> &WriteSerializer<TimetableStore> {
        &self.lane
    }

    /// Queues `page` on the write lane.
    ///
    /// When the page ends its delivery and the delivery is published,
    /// `on_fully_applied` runs on the lane right after the new snapshot
    /// becomes visible, and the delivery's result goes to the result sink.
    /// The completion resolves to the page's own result, or to the whole
    /// delivery's result for a final page.
    pub fn apply_update<F>(&self, page: Page, on_fully_applied: F) -> Completion<UpdateResult>
    where
        F: FnOnce() + Send + 'static,
    {
        let applier = self.applier.clone();
        let source_kind = self.source_kind.clone();
        let results = self.results.clone();

        self.lane.submit(move |store: &mut TimetableStore| {
            let feed_id = applier.feed_id();
            match store.apply_page(&applier, page) {
                PageOutcome::Staged(result) => Ok(result),
                PageOutcome::Published { snapshot, result } => {
                    on_fully_applied();
                    if let Some(failure) = &result.structural_failure {
                        warn!(feed_id, failure = %failure, aborted = result.aborted, "Delivery published without a rolled-back page");
                    }
                    info!(
                        feed_id,
                        version = snapshot.version(),
                        successful = result.successful,
                        rejected = result.rejected,
                        unmatched = result.unmatched,
                        "Applied delivery"
                    );
                    results.dispatch(feed_id, &source_kind, result.clone());
                    Ok(result)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::model::fixtures::*;
    use crate::updater::record::{StopTimeRevision, TimeRevision, TripReference, UpdateRecord};
    use crate::updater::result::UpdateErrorKind;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(String, String, UpdateResult)>>);

    impl ResultSink for Recording {
        fn on_result(&self, feed_id: &str, source_kind: &str, result: &UpdateResult) {
            self.0
                .lock()
                .unwrap()
                .push((feed_id.to_string(), source_kind.to_string(), result.clone()));
        }
    }

    fn handler(sink: Arc<Recording>) -> (UpdateHandler, crate::snapshot::SnapshotReader) {
        let store = TimetableStore::new(Arc::new(model()));
        let reader = store.reader();
        let lane = WriteSerializer::spawn("test-writer", store).unwrap();
        let handler = UpdateHandler::new(
            DeltaApplier::new(FEED),
            "gtfs-rt",
            lane,
            ResultDispatcher::spawn(sink),
        );
        (handler, reader)
    }

    fn cancel(trip: &str) -> UpdateRecord {
        UpdateRecord::cancellation(TripReference::exact(FEED, trip), service_date())
    }

    #[tokio::test]
    async fn test_callback_runs_after_publication() {
        let sink = Arc::new(Recording::default());
        let (handler, reader) = handler(sink.clone());
        let called = Arc::new(AtomicBool::new(false));

        let flag = called.clone();
        let check = reader.clone();
        let result = handler
            .apply_update(Page::single(vec![cancel("A")], false), move || {
                assert_eq!(check.current().version(), 1);
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(result.successful, 1);
        assert!(called.load(Ordering::SeqCst));
        assert!(reader.current().is_cancelled(&id("A"), service_date()));
    }

    #[tokio::test]
    async fn test_results_reach_the_sink() {
        let sink = Arc::new(Recording::default());
        let (handler, mut reader) = handler(sink.clone());

        let first = Page {
            records: vec![cancel("A")],
            full_dataset: false,
            more_data: true,
            first_page: true,
        };
        let second = Page {
            records: vec![cancel("nope")],
            full_dataset: false,
            more_data: false,
            first_page: false,
        };
        handler.apply_update(first, || {}).await.unwrap();
        handler.apply_update(second, || {}).await.unwrap();
        reader.changed().await.unwrap();

        // the dispatcher runs on its own task
        for _ in 0..100 {
            if !sink.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let seen = sink.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (feed_id, source_kind, result) = &seen[0];
        assert_eq!(feed_id, FEED);
        assert_eq!(source_kind, "gtfs-rt");
        assert_eq!(result.successful, 1);
        assert_eq!(result.unmatched, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_delay_keeps_lane_running() {
        let sink = Arc::new(Recording::default());
        let (handler, reader) = handler(sink);
        let overflowing = UpdateRecord::revision(
            TripReference::exact(FEED, "B"),
            service_date(),
            vec![
                StopTimeRevision::at_stop("A1").departure(TimeRevision::Delay(i32::MAX)),
                StopTimeRevision::at_stop("B1"),
            ],
        );

        let result = handler
            .apply_update(Page::single(vec![cancel("A"), overflowing], false), || {})
            .await
            .unwrap();
        assert_eq!(result.successful, 1);
        assert_eq!(result.count(UpdateErrorKind::InvalidTime), 1);
        assert!(!handler.lane().is_stopped());

        let next = handler
            .apply_update(Page::single(vec![cancel("B")], false), || {})
            .await
            .unwrap();
        assert_eq!(next.successful, 1);
        assert!(reader.current().is_cancelled(&id("B"), service_date()));
    }
}
