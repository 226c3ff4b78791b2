use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;

use crate::model::{FeedScopedId, ScheduledTrip, TripKey};
use crate::updater::result::UpdateErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RealtimeState {
    Scheduled,
    Updated,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripOrigin {
    /// Trip comes from the static schedule.
    Scheduled,
    /// Trip was synthesized from an added-trip update.
    Added,
}

/// Times at one stop, in seconds after service-day midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopTime {
    pub stop_id: String,
    pub arrival: i32,
    pub departure: i32,
    pub scheduled_arrival: i32,
    pub scheduled_departure: i32,
    pub predicted: bool,
}

impl StopTime {
    pub fn arrival_delay(&self) -> i32 {
        self.arrival - self.scheduled_arrival
    }

    pub fn departure_delay(&self) -> i32 {
        self.departure - self.scheduled_departure
    }
}

/// The times of one trip on one service date.
///
/// Records are immutable once built: every realtime change produces a new
/// `TripTimes` that replaces the previous `Arc` in the working buffer, so
/// snapshots holding the old record are never affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripTimes {
    key: TripKey,
    pattern_id: FeedScopedId,
    stop_times: Vec<StopTime>,
    state: RealtimeState,
    origin: TripOrigin,
}

impl TripTimes {
    pub fn scheduled(trip: &ScheduledTrip, service_date: NaiveDate) -> Self {
        let stop_times = trip
            .stop_times
            .iter()
            .map(|st| StopTime {
                stop_id: st.stop_id.clone(),
                arrival: st.arrival,
                departure: st.departure,
                scheduled_arrival: st.arrival,
                scheduled_departure: st.departure,
                predicted: false,
            })
            .collect();

        Self {
            key: TripKey::new(trip.id.clone(), service_date),
            pattern_id: trip.pattern_id.clone(),
            stop_times,
            state: RealtimeState::Scheduled,
            origin: TripOrigin::Scheduled,
        }
    }

    /// Builds an added trip; the reported times double as its schedule.
    pub fn added(key: TripKey, pattern_id: FeedScopedId, stop_times: Vec<StopTime>) -> Self {
        let stop_times = stop_times
            .into_iter()
            .map(|st| StopTime {
                scheduled_arrival: st.arrival,
                scheduled_departure: st.departure,
                ..st
            })
            .collect();

        Self {
            key,
            pattern_id,
            stop_times,
            state: RealtimeState::Updated,
            origin: TripOrigin::Added,
        }
    }

    /// Copy with new stop times, validated for dwell and hop consistency.
    pub fn with_updated_times(&self, stop_times: Vec<StopTime>) -> Result<Self, TimeViolation> {
        let updated = Self {
            key: self.key.clone(),
            pattern_id: self.pattern_id.clone(),
            stop_times,
            state: RealtimeState::Updated,
            origin: self.origin,
        };
        updated.validate()?;
        Ok(updated)
    }

    /// Copy marked cancelled. Scheduled times are kept for display.
    pub fn cancelled(&self) -> Self {
        let mut cancelled = self.reset_to_scheduled();
        cancelled.state = RealtimeState::Cancelled;
        cancelled
    }

    pub fn reset_to_scheduled(&self) -> Self {
        let stop_times = self
            .stop_times
            .iter()
            .map(|st| StopTime {
                arrival: st.scheduled_arrival,
                departure: st.scheduled_departure,
                predicted: false,
                ..st.clone()
            })
            .collect();

        Self {
            key: self.key.clone(),
            pattern_id: self.pattern_id.clone(),
            stop_times,
            state: match self.origin {
                TripOrigin::Scheduled => RealtimeState::Scheduled,
                TripOrigin::Added => RealtimeState::Updated,
            },
            origin: self.origin,
        }
    }

    pub fn validate(&self) -> Result<(), TimeViolation> {
        let mut previous_departure: Option<i32> = None;
        for (stop_index, st) in self.stop_times.iter().enumerate() {
            if st.arrival > st.departure {
                return Err(TimeViolation {
                    kind: UpdateErrorKind::NegativeDwellTime,
                    stop_index,
                });
            }
            if previous_departure.is_some_and(|departure| st.arrival < departure) {
                return Err(TimeViolation {
                    kind: UpdateErrorKind::NegativeHopTime,
                    stop_index,
                });
            }
            previous_departure = Some(st.departure);
        }
        Ok(())
    }

    pub fn key(&self) -> &TripKey {
        &self.key
    }

    pub fn trip_id(&self) -> &FeedScopedId {
        &self.key.trip_id
    }

    pub fn service_date(&self) -> NaiveDate {
        self.key.service_date
    }

    pub fn pattern_id(&self) -> &FeedScopedId {
        &self.pattern_id
    }

    pub fn stop_times(&self) -> &[StopTime] {
        &self.stop_times
    }

    pub fn state(&self) -> RealtimeState {
        self.state
    }

    pub fn origin(&self) -> TripOrigin {
        self.origin
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == RealtimeState::Cancelled
    }

    pub fn is_added(&self) -> bool {
        self.origin == TripOrigin::Added
    }

    pub fn first_departure(&self) -> Option<i32> {
        self.stop_times.first().map(|st| st.departure)
    }
}

/// First stop at which a trip-times record breaks time ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeViolation {
    pub kind: UpdateErrorKind,
    pub stop_index: usize,
}

/// All trips of one pattern on one service date, ordered by first departure.
#[derive(Debug, Clone)]
pub struct Timetable {
    pattern_id: FeedScopedId,
    service_date: NaiveDate,
    trip_times: Vec<Arc<TripTimes>>,
}

impl Timetable {
    pub fn new(
        pattern_id: FeedScopedId,
        service_date: NaiveDate,
        mut trip_times: Vec<Arc<TripTimes>>,
    ) -> Self {
        trip_times.sort_by(|a, b| {
            a.first_departure()
                .cmp(&b.first_departure())
                .then_with(|| a.trip_id().cmp(b.trip_id()))
        });
        Self {
            pattern_id,
            service_date,
            trip_times,
        }
    }

    pub fn pattern_id(&self) -> &FeedScopedId {
        &self.pattern_id
    }

    pub fn service_date(&self) -> NaiveDate {
        self.service_date
    }

    pub fn trip_times(&self, trip_id: &FeedScopedId) -> Option<&Arc<TripTimes>> {
        self.trip_times.iter().find(|tt| tt.trip_id() == trip_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TripTimes>> {
        self.trip_times.iter()
    }

    pub fn len(&self) -> usize {
        self.trip_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trip_times.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;

    fn trip_a() -> TripTimes {
        let model = model();
        TripTimes::scheduled(model.trip(&id("A")).unwrap(), service_date())
    }

    #[test]
    fn test_scheduled_trip_times() {
        let tt = trip_a();
        assert_eq!(tt.state(), RealtimeState::Scheduled);
        assert_eq!(tt.stop_times().len(), 3);
        assert_eq!(tt.first_departure(), Some(660));
        assert!(tt.validate().is_ok());
    }

    #[test]
    fn test_cancelled_keeps_scheduled_times() {
        let tt = trip_a();
        let mut delayed: Vec<_> = tt.stop_times().to_vec();
        delayed[1].arrival += 300;
        delayed[1].departure += 300;
        let updated = tt.with_updated_times(delayed).unwrap();

        let cancelled = updated.cancelled();
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.stop_times()[1].arrival, 1200);
        // the source record is untouched
        assert_eq!(updated.stop_times()[1].arrival, 1500);
    }

    #[test]
    fn test_negative_dwell_time() {
        let tt = trip_a();
        let mut times: Vec<_> = tt.stop_times().to_vec();
        times[1].arrival = times[1].departure + 1;
        let err = tt.with_updated_times(times).unwrap_err();
        assert_eq!(err.kind, UpdateErrorKind::NegativeDwellTime);
        assert_eq!(err.stop_index, 1);
    }

    #[test]
    fn test_negative_hop_time() {
        let tt = trip_a();
        let mut times: Vec<_> = tt.stop_times().to_vec();
        times[0].departure = 1250;
        let err = tt.with_updated_times(times).unwrap_err();
        assert_eq!(err.kind, UpdateErrorKind::NegativeHopTime);
        assert_eq!(err.stop_index, 1);
    }

    #[test]
    fn test_added_trip_reset_keeps_added_times() {
        let key = TripKey::new(id("X"), service_date());
        let stop = |stop_id: &str, t: i32| StopTime {
            stop_id: stop_id.into(),
            arrival: t,
            departure: t,
            scheduled_arrival: 0,
            scheduled_departure: 0,
            predicted: true,
        };
        let added = TripTimes::added(key, id("X:added"), vec![stop("A1", 100), stop("B1", 200)]);
        assert!(added.is_added());
        assert_eq!(added.stop_times()[1].scheduled_arrival, 200);

        let reset = added.reset_to_scheduled();
        assert_eq!(reset.state(), RealtimeState::Updated);
        assert_eq!(reset.stop_times()[1].arrival, 200);
    }

    #[test]
    fn test_timetable_orders_by_departure() {
        let model = model();
        let date = service_date();
        let c = Arc::new(TripTimes::scheduled(model.trip(&id("C")).unwrap(), date));
        let a = Arc::new(TripTimes::scheduled(model.trip(&id("A")).unwrap(), date));
        let timetable = Timetable::new(id("P3"), date, vec![c, a]);
        let order: Vec<_> = timetable.iter().map(|tt| tt.trip_id().id.clone()).collect();
        assert_eq!(order, vec!["A", "C"]);
        assert!(timetable.trip_times(&id("C")).is_some());
    }
}
