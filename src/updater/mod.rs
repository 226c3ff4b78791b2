//! The update pipeline: pull pages from a source, apply them on the write
//! lane, publish snapshots and report results.

pub mod applier;
pub mod handler;
pub mod matcher;
pub mod poller;
pub mod readiness;
pub mod record;
pub mod result;
pub mod serializer;

pub use applier::{AppliedChange, ApplyError, DeltaApplier};
pub use handler::{ResultDispatcher, UpdateHandler};
pub use matcher::{ScheduleTripMatcher, TripMatcher};
pub use poller::{PollingUpdater, PrimedFlag};
pub use readiness::Readiness;
pub use record::{
    Delivery, Page, StopTimeRevision, TimeRevision, TripDescriptor, TripReference, UpdateRecord,
    UpdateStatus,
};
pub use result::{ResultSink, StructuralError, UpdateError, UpdateErrorKind, UpdateResult};
pub use serializer::{Completion, LaneError, WriteSerializer};
