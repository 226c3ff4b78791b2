//! Turns one update record into a change of the pending delivery.

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use super::matcher::TripMatcher;
use super::record::{StopTimeRevision, TimeRevision, UpdateRecord, UpdateStatus};
use super::result::{StructuralError, UpdateError, UpdateErrorKind};
use crate::model::{FeedScopedId, Pattern, TripKey};
use crate::snapshot::{DeliveryView, StopTime, TripTimes};

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Record(#[from] UpdateError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
}

/// What a successfully applied record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedChange {
    Updated,
    Cancelled,
    Added,
    Reverted,
}

pub struct DeltaApplier {
    feed_id: String,
    fuzzy_matching: bool,
    matcher: Option<Arc<dyn TripMatcher>>,
}

impl DeltaApplier {
    pub fn new(feed_id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            fuzzy_matching: false,
            matcher: None,
        }
    }

    /// Enables fuzzy resolution of records without a known trip id.
    pub fn with_fuzzy_matching(mut self, matcher: Arc<dyn TripMatcher>) -> Self {
        self.fuzzy_matching = true;
        self.matcher = Some(matcher);
        self
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    pub fn fuzzy_matching(&self) -> bool {
        self.fuzzy_matching
    }

    pub fn apply(&self, view: &mut DeliveryView<'_>, record: &UpdateRecord) -> Result<AppliedChange, ApplyError> {
        if record.trip.feed_id != self.feed_id {
            return Err(StructuralError::FeedMismatch {
                expected: self.feed_id.clone(),
                found: record.trip.feed_id.clone(),
            }
            .into());
        }

        match record.status {
            UpdateStatus::AddedTrip => self.add_trip(view, record),
            UpdateStatus::Cancellation => {
                let current = self.locate(view, record)?;
                view.put(current.cancelled());
                Ok(AppliedChange::Cancelled)
            }
            UpdateStatus::ScheduledRevision => {
                let current = self.locate(view, record)?;
                let revised = revise(&current, &record.stop_times)?;
                view.put(revised);
                Ok(AppliedChange::Updated)
            }
            UpdateStatus::NoData => {
                let current = self.locate(view, record)?;
                if current.is_added() {
                    view.put(current.reset_to_scheduled());
                } else {
                    view.revert(current.key());
                }
                Ok(AppliedChange::Reverted)
            }
        }
    }

    fn resolve(&self, view: &DeliveryView<'_>, record: &UpdateRecord) -> Result<FeedScopedId, UpdateError> {
        if let Some(trip_id) = record.trip.scoped_id() {
            if view.model().trip(&trip_id).is_some() {
                return Ok(trip_id);
            }
            let key = TripKey::new(trip_id.clone(), record.service_date);
            if view.get(&key).is_some_and(|tt| tt.is_added()) {
                return Ok(trip_id);
            }
        }

        if !self.fuzzy_matching {
            return Err(UpdateError::new(&record.trip, UpdateErrorKind::UnmatchedTrip));
        }
        let matched = self
            .matcher
            .as_ref()
            .and_then(|matcher| matcher.resolve(&record.trip, record.service_date));
        match matched {
            Some(trip_id) => {
                trace!(reference = %record.trip, %trip_id, "Fuzzy matched trip");
                Ok(trip_id)
            }
            None => Err(UpdateError::new(&record.trip, UpdateErrorKind::UnmatchedTrip)),
        }
    }

    /// Resolves the record's trip and returns its current times on the
    /// record's service date.
    fn locate(&self, view: &DeliveryView<'_>, record: &UpdateRecord) -> Result<Arc<TripTimes>, ApplyError> {
        let trip_id = self.resolve(view, record)?;
        let key = TripKey::new(trip_id, record.service_date);

        if let Some(current) = view.get(&key) {
            return Ok(current);
        }

        let Some(trip) = view.model().trip(&key.trip_id) else {
            // an added trip on another service date
            return Err(UpdateError::new(&key, UpdateErrorKind::NoTripForDate).into());
        };
        if view.pattern(&trip.pattern_id).is_none() {
            return Err(StructuralError::MissingPattern(key.trip_id.to_string()).into());
        }
        if !trip.runs_on(record.service_date) {
            return Err(UpdateError::new(&key, UpdateErrorKind::NoTripForDate).into());
        }
        Ok(Arc::new(TripTimes::scheduled(trip, record.service_date)))
    }

    fn add_trip(&self, view: &mut DeliveryView<'_>, record: &UpdateRecord) -> Result<AppliedChange, ApplyError> {
        let Some(trip_id) = record.trip.scoped_id() else {
            return Err(UpdateError::new(&record.trip, UpdateErrorKind::UnmatchedTrip).into());
        };
        let key = TripKey::new(trip_id, record.service_date);

        let exists = view.model().trip(&key.trip_id).is_some()
            || view.get(&key).is_some_and(|tt| tt.is_added());
        if exists {
            return Err(UpdateError::new(&key, UpdateErrorKind::AlreadyExists).into());
        }
        if record.stop_times.len() < 2 {
            return Err(UpdateError::new(&key, UpdateErrorKind::TooFewStops).into());
        }

        let mut stop_times = Vec::with_capacity(record.stop_times.len());
        let mut previous_sequence = None;
        for (index, revision) in record.stop_times.iter().enumerate() {
            let invalid = || UpdateError::at_stop(&key, UpdateErrorKind::InvalidStopSequence, index);
            if !advance_sequence(&mut previous_sequence, revision) {
                return Err(invalid().into());
            }

            let stop_id = revision.stop_id.clone().ok_or_else(invalid)?;
            let arrival = revision.arrival.and_then(|r| r.resolve(0));
            let departure = revision.departure.and_then(|r| r.resolve(0));
            let (Some(arrival), Some(departure)) = (arrival.or(departure), departure.or(arrival)) else {
                return Err(invalid().into());
            };

            stop_times.push(StopTime {
                stop_id,
                arrival,
                departure,
                scheduled_arrival: arrival,
                scheduled_departure: departure,
                predicted: revision.predicted,
            });
        }

        let pattern = Pattern {
            id: FeedScopedId::new(self.feed_id.clone(), format!("{}:added", key.trip_id.id)),
            route_id: record.trip.descriptor.route_id.clone().unwrap_or_default(),
            direction_id: record.trip.descriptor.direction_id,
            stops: stop_times.iter().map(|st| st.stop_id.clone()).collect(),
        };

        let added = TripTimes::added(key.clone(), pattern.id.clone(), stop_times);
        added
            .validate()
            .map_err(|v| UpdateError::at_stop(&key, v.kind, v.stop_index))?;

        view.add_pattern(pattern);
        view.put(added);
        Ok(AppliedChange::Added)
    }
}

/// Applies a full list of stop revisions, one per stop of the trip, to the
/// trip's scheduled times.
fn revise(current: &TripTimes, revisions: &[StopTimeRevision]) -> Result<TripTimes, UpdateError> {
    let key = current.key();
    let stops = current.stop_times();
    if revisions.len() != stops.len() {
        return Err(UpdateError::new(key, UpdateErrorKind::InvalidStopSequence));
    }

    let mut previous_sequence = None;
    let mut revised = Vec::with_capacity(stops.len());
    for (index, (revision, stop)) in revisions.iter().zip(stops).enumerate() {
        let invalid = || UpdateError::at_stop(key, UpdateErrorKind::InvalidStopSequence, index);
        if !advance_sequence(&mut previous_sequence, revision) {
            return Err(invalid());
        }
        if revision.stop_id.as_ref().is_some_and(|id| *id != stop.stop_id) {
            return Err(invalid());
        }

        let out_of_range = || UpdateError::at_stop(key, UpdateErrorKind::InvalidTime, index);
        let arrival = match revision.arrival {
            Some(r) => r.resolve(stop.scheduled_arrival).ok_or_else(out_of_range)?,
            None => stop.scheduled_arrival,
        };
        let departure = match revision.departure {
            Some(r) => r.resolve(stop.scheduled_departure),
            // departure follows the reported arrival delay
            None if revision.arrival.is_some() => arrival
                .checked_sub(stop.scheduled_arrival)
                .and_then(|delay| stop.scheduled_departure.checked_add(delay)),
            None => Some(stop.scheduled_departure),
        }
        .ok_or_else(out_of_range)?;

        revised.push(StopTime {
            arrival,
            departure,
            predicted: revision.predicted && (revision.arrival.is_some() || revision.departure.is_some()),
            ..stop.clone()
        });
    }

    current
        .with_updated_times(revised)
        .map_err(|v| UpdateError::at_stop(key, v.kind, v.stop_index))
}

// stop sequences, where given, must strictly increase
fn advance_sequence(previous: &mut Option<u32>, revision: &StopTimeRevision) -> bool {
    if let Some(sequence) = revision.stop_sequence {
        if previous.is_some_and(|p| sequence <= p) {
            return false;
        }
        *previous = Some(sequence);
    }
    true
}
