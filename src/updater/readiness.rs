use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};

use super::poller::PrimedFlag;

/// Service readiness gated on the feeds configured to block it until their
/// first complete delivery has been published.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    feeds: Vec<(String, PrimedFlag)>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes readiness wait for `feed_id` to be primed.
    pub fn block_on(&mut self, feed_id: impl Into<String>, primed: PrimedFlag) {
        self.feeds.push((feed_id.into(), primed));
    }

    pub fn blocking_feeds(&self) -> usize {
        self.feeds.len()
    }

    /// True once every blocking feed is primed. Trivially true with none.
    pub fn is_ready(&self) -> bool {
        self.feeds.iter().all(|(_, primed)| primed.get())
    }

    /// Blocking feeds that are not primed yet.
    pub fn waiting_on(&self) -> Vec<&str> {
        self.feeds
            .iter()
            .filter(|(_, primed)| !primed.get())
            .map(|(feed_id, _)| feed_id.as_str())
            .collect()
    }

    /// Resolves once [`is_ready`](Self::is_ready), checking every `period`.
    pub async fn wait(&self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.is_ready() {
            ticker.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn flag() -> (Arc<AtomicBool>, PrimedFlag) {
        let inner = Arc::new(AtomicBool::new(false));
        (inner.clone(), PrimedFlag::new(inner))
    }

    #[test]
    fn test_ready_without_blocking_feeds() {
        let readiness = Readiness::new();
        assert!(readiness.is_ready());
        assert!(readiness.waiting_on().is_empty());
    }

    #[test]
    fn test_waits_for_every_blocking_feed() {
        let (a_set, a) = flag();
        let (b_set, b) = flag();
        let mut readiness = Readiness::new();
        readiness.block_on("A", a);
        readiness.block_on("B", b);

        assert!(!readiness.is_ready());
        a_set.store(true, Ordering::Release);
        assert_eq!(readiness.waiting_on(), vec!["B"]);
        b_set.store(true, Ordering::Release);
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_wait_resolves_once_primed() {
        let (set, primed) = flag();
        let mut readiness = Readiness::new();
        readiness.block_on("A", primed);

        let waiter = tokio::spawn(async move { readiness.wait(Duration::from_millis(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        set.store(true, Ordering::Release);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
