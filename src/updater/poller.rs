use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tracing::{Instrument, debug, error, info, info_span};

use super::handler::UpdateHandler;
use super::record::Page;
use super::result::UpdateResult;
use super::serializer::{Completion, LaneError};
use crate::snapshot::{Snapshot, SnapshotReader};
use crate::source::UpdateSource;

/// Read-only handle on a poller's primed flag.
#[derive(Debug, Clone)]
pub struct PrimedFlag(Arc<AtomicBool>);

impl PrimedFlag {
    pub(crate) fn new(inner: Arc<AtomicBool>) -> Self {
        Self(inner)
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Pulls one feed's source on a fixed period and hands every page to its
/// [`UpdateHandler`].
pub struct PollingUpdater {
    source: Box<dyn UpdateSource>,
    handler: UpdateHandler,
    primed: Arc<AtomicBool>,
    polling_period: Duration,
    snapshots: SnapshotReader,
}

impl PollingUpdater {
    pub fn new(
        source: Box<dyn UpdateSource>,
        handler: UpdateHandler,
        polling_period: Duration,
        snapshots: SnapshotReader,
    ) -> Self {
        Self {
            source,
            handler,
            primed: Arc::new(AtomicBool::new(false)),
            polling_period,
            snapshots,
        }
    }

    pub fn feed_id(&self) -> &str {
        self.handler.feed_id()
    }

    /// True once a complete delivery from this feed has been published.
    pub fn is_primed(&self) -> bool {
        self.primed.load(Ordering::Acquire)
    }

    /// A handle that stays valid while the updater runs on another task.
    pub fn primed_flag(&self) -> PrimedFlag {
        PrimedFlag::new(self.primed.clone())
    }

    pub fn current_snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.current()
    }

    /// Pulls pages until the source reports no more data, submitting each
    /// without waiting for it to be applied.
    ///
    /// Returns the completion of the page that closed the delivery, if one
    /// was submitted. Pull errors end the cycle; pages already submitted
    /// stay queued and are applied.
    #[tracing::instrument(skip(self), fields(feed_id = %self.handler.feed_id()))]
    pub async fn run_cycle(&mut self) -> anyhow::Result<Option<Completion<UpdateResult>>> {
        let mut submitted = 0usize;
        let mut full_dataset = false;

        loop {
            let Some(delivery) = self.source.pull().await? else {
                debug!(pages = submitted, "Source has no new data");
                return Ok(None);
            };
            full_dataset |= delivery.full_dataset;
            let more_data = delivery.more_data;

            // empty pages are skipped unless they close a started delivery
            if delivery.records.is_empty() && (more_data || submitted == 0) {
                if more_data {
                    continue;
                }
                debug!("Skipping empty delivery");
                return Ok(None);
            }

            let page = Page {
                records: delivery.records,
                full_dataset,
                more_data,
                first_page: submitted == 0,
            };
            debug!(records = page.records.len(), more_data, "Submitting page");

            let primed = self.primed.clone();
            let completion = self.handler.apply_update(page, move || {
                if !more_data {
                    primed.store(true, Ordering::Release);
                }
            });
            submitted += 1;

            if !more_data {
                return Ok(Some(completion));
            }
            self.watch(completion);
        }
    }

    /// Polls until `shutdown` resolves or the write lane stops. Failed cycles
    /// are logged and retried on the next tick.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let mut ticker = interval(self.polling_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            feed_id = self.feed_id(),
            source = self.source.source_kind(),
            period_secs = self.polling_period.as_secs(),
            "Starting polling updater"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(feed_id = self.feed_id(), "Stopping polling updater");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if self.handler.lane().is_stopped() {
                error!(feed_id = self.feed_id(), "Write lane stopped, giving up");
                return Err(LaneError::Stopped.into());
            }

            match self.run_cycle().await {
                Ok(Some(completion)) => self.watch(completion),
                Ok(None) => {}
                Err(e) => {
                    let message = format!("{e:#}");
                    error!(feed_id = self.feed_id(), error = %message, "Polling cycle failed");
                }
            }
        }
    }

    fn watch(&self, completion: Completion<UpdateResult>) {
        let span = info_span!("delivery", feed_id = self.feed_id());
        tokio::spawn(
            async move {
                if let Err(error) = completion.await {
                    error!(%error, "Page was not applied");
                }
            }
            .instrument(span),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use crate::model::fixtures::*;
    use crate::snapshot::TimetableStore;
    use crate::updater::applier::DeltaApplier;
    use crate::updater::handler::ResultDispatcher;
    use crate::updater::record::{Delivery, TripReference, UpdateRecord};
    use crate::updater::result::ResultSink;
    use crate::updater::serializer::WriteSerializer;

    struct Queue(VecDeque<anyhow::Result<Option<Delivery>>>);

    #[async_trait]
    impl UpdateSource for Queue {
        async fn pull(&mut self) -> anyhow::Result<Option<Delivery>> {
            self.0.pop_front().unwrap_or(Ok(None))
        }

        fn source_kind(&self) -> &'static str {
            "queue"
        }
    }

    struct Discard;

    impl ResultSink for Discard {
        fn on_result(&self, _: &str, _: &str, _: &UpdateResult) {}
    }

    fn updater(pulls: Vec<anyhow::Result<Option<Delivery>>>) -> PollingUpdater {
        let store = TimetableStore::new(Arc::new(model()));
        let reader = store.reader();
        let lane = WriteSerializer::spawn("test-writer", store).unwrap();
        let handler = UpdateHandler::new(
            DeltaApplier::new(FEED),
            "queue",
            lane,
            ResultDispatcher::spawn(Arc::new(Discard)),
        );
        PollingUpdater::new(
            Box::new(Queue(pulls.into())),
            handler,
            Duration::from_secs(30),
            reader,
        )
    }

    fn delivery(trips: &[&str], more_data: bool) -> Delivery {
        Delivery {
            records: trips
                .iter()
                .map(|trip| UpdateRecord::cancellation(TripReference::exact(FEED, *trip), service_date()))
                .collect(),
            full_dataset: false,
            more_data,
        }
    }

    #[tokio::test]
    async fn test_primed_after_final_page() {
        let mut updater = updater(vec![Ok(Some(delivery(&["A"], true))), Ok(Some(delivery(&["B"], false)))]);
        assert!(!updater.is_primed());

        let completion = updater.run_cycle().await.unwrap().unwrap();
        let result = completion.await.unwrap();

        assert_eq!(result.successful, 2);
        assert!(updater.is_primed());
        let snapshot = updater.current_snapshot();
        assert_eq!(snapshot.version(), 1);
        assert!(snapshot.is_cancelled(&id("A"), service_date()));
    }

    #[tokio::test]
    async fn test_empty_delivery_is_skipped() {
        let mut updater = updater(vec![Ok(Some(delivery(&[], false)))]);
        assert!(updater.run_cycle().await.unwrap().is_none());
        assert!(!updater.is_primed());
        assert_eq!(updater.current_snapshot().version(), 0);
    }

    #[tokio::test]
    async fn test_empty_final_page_closes_delivery() {
        let mut updater = updater(vec![Ok(Some(delivery(&["A"], true))), Ok(Some(delivery(&[], false)))]);
        let completion = updater.run_cycle().await.unwrap().unwrap();
        completion.await.unwrap();
        assert!(updater.is_primed());
        assert_eq!(updater.current_snapshot().version(), 1);
    }

    #[tokio::test]
    async fn test_pull_error_ends_cycle() {
        let mut updater = updater(vec![Err(anyhow::anyhow!("connection reset"))]);
        let err = updater.run_cycle().await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
        assert!(!updater.is_primed());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let updater = updater(vec![Ok(Some(delivery(&["A"], false)))]);
        let reader = updater.snapshots.clone();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn(updater.run(async move {
            let _ = rx.await;
        }));
        let mut changes = reader.clone();
        let snapshot = changes.changed().await.unwrap();
        assert!(snapshot.is_cancelled(&id("A"), service_date()));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
