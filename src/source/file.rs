use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use super::UpdateSource;
use crate::parser::{FeedMapper, parse_feed};
use crate::updater::record::Delivery;

/// Replays local GTFS-RT files as the pages of a single delivery, one file
/// per page, in the given order.
pub struct FileReplaySource {
    files: VecDeque<PathBuf>,
    mapper: FeedMapper,
}

impl FileReplaySource {
    pub fn new(files: impl IntoIterator<Item = PathBuf>, mapper: FeedMapper) -> Self {
        Self {
            files: files.into_iter().collect(),
            mapper,
        }
    }

    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

#[async_trait]
impl UpdateSource for FileReplaySource {
    async fn pull(&mut self) -> anyhow::Result<Option<Delivery>> {
        let Some(path) = self.files.pop_front() else {
            return Ok(None);
        };

        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let feed = parse_feed(&bytes).with_context(|| format!("decoding {}", path.display()))?;
        let mapped = self.mapper.map(&feed);
        debug!(
            path = %path.display(),
            records = mapped.delivery.records.len(),
            skipped = mapped.skipped,
            remaining = self.files.len(),
            "Replaying feed file"
        );

        Ok(Some(Delivery {
            more_data: !self.files.is_empty(),
            ..mapped.delivery
        }))
    }

    fn source_kind(&self) -> &'static str {
        "file-replay"
    }
}
