//! Typed update records, as produced by an [`UpdateSource`](crate::source::UpdateSource).

use std::fmt;

use chrono::NaiveDate;

use crate::model::FeedScopedId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    ScheduledRevision,
    Cancellation,
    AddedTrip,
    NoData,
}

/// Hints for fuzzy matching when no exact trip id is available.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripDescriptor {
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    /// First scheduled departure, seconds after service-day midnight.
    pub start_time: Option<i32>,
    pub first_stop_id: Option<String>,
    pub last_stop_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripReference {
    pub feed_id: String,
    pub trip_id: Option<String>,
    pub descriptor: TripDescriptor,
}

impl TripReference {
    pub fn exact(feed_id: impl Into<String>, trip_id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            trip_id: Some(trip_id.into()),
            descriptor: TripDescriptor::default(),
        }
    }

    pub fn fuzzy(feed_id: impl Into<String>, descriptor: TripDescriptor) -> Self {
        Self {
            feed_id: feed_id.into(),
            trip_id: None,
            descriptor,
        }
    }

    pub fn scoped_id(&self) -> Option<FeedScopedId> {
        self.trip_id
            .as_ref()
            .map(|id| FeedScopedId::new(self.feed_id.clone(), id.clone()))
    }
}

impl fmt::Display for TripReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trip_id {
            Some(id) => write!(f, "{}:{}", self.feed_id, id),
            None => write!(
                f,
                "{}:route={} start={}",
                self.feed_id,
                self.descriptor.route_id.as_deref().unwrap_or("?"),
                self.descriptor
                    .start_time
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "?".into())
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRevision {
    /// Offset from the scheduled time, in seconds.
    Delay(i32),
    /// Seconds after service-day midnight.
    Absolute(i32),
}

impl TimeRevision {
    /// The revised time, or `None` when a delay pushes it out of range.
    pub fn resolve(self, scheduled: i32) -> Option<i32> {
        match self {
            TimeRevision::Delay(delay) => scheduled.checked_add(delay),
            TimeRevision::Absolute(time) => Some(time),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopTimeRevision {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub arrival: Option<TimeRevision>,
    pub departure: Option<TimeRevision>,
    /// `true` for a realtime prediction, `false` when the producer only
    /// restates the schedule.
    pub predicted: bool,
}

impl StopTimeRevision {
    pub fn at_stop(stop_id: impl Into<String>) -> Self {
        Self {
            stop_id: Some(stop_id.into()),
            ..Default::default()
        }
    }

    pub fn arrival(mut self, revision: TimeRevision) -> Self {
        self.arrival = Some(revision);
        self.predicted = true;
        self
    }

    pub fn departure(mut self, revision: TimeRevision) -> Self {
        self.departure = Some(revision);
        self.predicted = true;
        self
    }

    pub fn sequence(mut self, stop_sequence: u32) -> Self {
        self.stop_sequence = Some(stop_sequence);
        self
    }
}

/// One reported change to one trip on one service date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub trip: TripReference,
    pub service_date: NaiveDate,
    pub stop_times: Vec<StopTimeRevision>,
    pub status: UpdateStatus,
}

impl UpdateRecord {
    pub fn revision(trip: TripReference, service_date: NaiveDate, stop_times: Vec<StopTimeRevision>) -> Self {
        Self {
            trip,
            service_date,
            stop_times,
            status: UpdateStatus::ScheduledRevision,
        }
    }

    pub fn cancellation(trip: TripReference, service_date: NaiveDate) -> Self {
        Self {
            trip,
            service_date,
            stop_times: Vec::new(),
            status: UpdateStatus::Cancellation,
        }
    }

    pub fn added(trip: TripReference, service_date: NaiveDate, stop_times: Vec<StopTimeRevision>) -> Self {
        Self {
            trip,
            service_date,
            stop_times,
            status: UpdateStatus::AddedTrip,
        }
    }

    pub fn no_data(trip: TripReference, service_date: NaiveDate) -> Self {
        Self {
            trip,
            service_date,
            stop_times: Vec::new(),
            status: UpdateStatus::NoData,
        }
    }
}

/// One pulled page of a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub records: Vec<UpdateRecord>,
    /// The delivery replaces all realtime state of the feed.
    pub full_dataset: bool,
    /// More pages of the same delivery are waiting upstream.
    pub more_data: bool,
}

/// A page handed to the [`UpdateHandler`](super::UpdateHandler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub records: Vec<UpdateRecord>,
    pub full_dataset: bool,
    pub more_data: bool,
    pub first_page: bool,
}

impl Page {
    /// A complete, single-page delivery.
    pub fn single(records: Vec<UpdateRecord>, full_dataset: bool) -> Self {
        Self {
            records,
            full_dataset,
            more_data: false,
            first_page: true,
        }
    }
}
