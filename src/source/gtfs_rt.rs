use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use super::UpdateSource;
use crate::fetch::{HttpClient, fetch_bytes};
use crate::gtfs_rt::FeedMessage;
use crate::parser::{FeedMapper, parse_feed};
use crate::updater::record::Delivery;

/// Polls a GTFS-RT trip-updates endpoint. Every response is a complete,
/// single-page delivery.
pub struct GtfsRtHttpSource {
    url: String,
    client: Box<dyn HttpClient>,
    mapper: FeedMapper,
    last_timestamp: Option<u64>,
}

impl GtfsRtHttpSource {
    pub fn new(url: impl Into<String>, client: Box<dyn HttpClient>, mapper: FeedMapper) -> Self {
        Self {
            url: url.into(),
            client,
            mapper,
            last_timestamp: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Maps a decoded message, or returns `None` when its header timestamp
    /// matches the previous message.
    fn accept(&mut self, feed: &FeedMessage) -> Option<Delivery> {
        if feed.header.timestamp.is_some() && feed.header.timestamp == self.last_timestamp {
            debug!(url = %self.url, timestamp = feed.header.timestamp, "Feed unchanged");
            return None;
        }

        let mapped = self.mapper.map(feed);
        if mapped.skipped > 0 {
            debug!(
                feed_id = self.mapper.feed_id(),
                skipped = mapped.skipped,
                "Trip updates not mapped"
            );
        }
        self.last_timestamp = mapped.timestamp;
        Some(mapped.delivery)
    }
}

#[async_trait]
impl UpdateSource for GtfsRtHttpSource {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn pull(&mut self) -> anyhow::Result<Option<Delivery>> {
        let bytes = fetch_bytes(self.client.as_ref(), &self.url).await?;
        let feed = parse_feed(&bytes).with_context(|| format!("decoding feed from {}", self.url))?;
        Ok(self.accept(&feed))
    }

    fn source_kind(&self) -> &'static str {
        "gtfs-rt"
    }
}
