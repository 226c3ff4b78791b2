//! Where update pages come from.

mod file;
mod gtfs_rt;

pub use file::FileReplaySource;
pub use gtfs_rt::GtfsRtHttpSource;

use async_trait::async_trait;

use crate::updater::record::Delivery;

/// A pull-based producer of update pages for one feed.
///
/// `pull` returns `None` when there is nothing new. A page with
/// `more_data` set promises that the next pull continues the same delivery.
#[async_trait]
pub trait UpdateSource: Send {
    async fn pull(&mut self) -> anyhow::Result<Option<Delivery>>;

    /// Label used when reporting results, e.g. `gtfs-rt`.
    fn source_kind(&self) -> &'static str;
}
