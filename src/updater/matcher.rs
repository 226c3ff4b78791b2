use std::sync::Arc;

use chrono::NaiveDate;
use tracing::trace;

use super::record::TripReference;
use crate::model::{FeedScopedId, ScheduledTrip, TransitModel};

/// Resolves an update without a usable trip id to a scheduled trip.
///
/// Implementations must be side-effect free and return `None` unless they
/// are confident in a single trip.
pub trait TripMatcher: Send + Sync {
    fn resolve(&self, reference: &TripReference, service_date: NaiveDate) -> Option<FeedScopedId>;
}

/// Matches on route, direction, first departure and first/last stop, and
/// only answers when exactly one scheduled trip fits every given hint.
pub struct ScheduleTripMatcher {
    model: Arc<TransitModel>,
}

impl ScheduleTripMatcher {
    pub fn new(model: Arc<TransitModel>) -> Self {
        Self { model }
    }

    fn fits(trip: &ScheduledTrip, reference: &TripReference, service_date: NaiveDate) -> bool {
        let hints = &reference.descriptor;
        trip.runs_on(service_date)
            && hints.direction_id.is_none_or(|d| trip.direction_id == Some(d))
            && hints.start_time.is_none_or(|t| trip.first_departure() == Some(t))
            && hints
                .first_stop_id
                .as_ref()
                .is_none_or(|s| trip.stop_times.first().is_some_and(|st| st.stop_id == *s))
            && hints
                .last_stop_id
                .as_ref()
                .is_none_or(|s| trip.stop_times.last().is_some_and(|st| st.stop_id == *s))
    }
}

impl TripMatcher for ScheduleTripMatcher {
    fn resolve(&self, reference: &TripReference, service_date: NaiveDate) -> Option<FeedScopedId> {
        let route_id = reference.descriptor.route_id.as_deref()?;

        let mut candidates = self
            .model
            .trips_for_route(&reference.feed_id, route_id)
            .filter(|trip| Self::fits(trip, reference, service_date));

        let first = candidates.next()?;
        if candidates.next().is_some() {
            trace!(%reference, "Fuzzy match is ambiguous");
            return None;
        }
        Some(first.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::updater::record::TripDescriptor;

    fn matcher() -> ScheduleTripMatcher {
        ScheduleTripMatcher::new(Arc::new(model()))
    }

    fn reference(descriptor: TripDescriptor) -> TripReference {
        TripReference::fuzzy(FEED, descriptor)
    }

    #[test]
    fn test_matches_on_start_time() {
        let reference = reference(TripDescriptor {
            route_id: Some("R1".into()),
            start_time: Some(7260),
            ..Default::default()
        });
        assert_eq!(matcher().resolve(&reference, service_date()), Some(id("C")));
    }

    #[test]
    fn test_ambiguous_match_returns_none() {
        let reference = reference(TripDescriptor {
            route_id: Some("R1".into()),
            last_stop_id: Some("C1".into()),
            ..Default::default()
        });
        assert_eq!(matcher().resolve(&reference, service_date()), None);
    }

    #[test]
    fn test_last_stop_narrows_candidates() {
        let reference = reference(TripDescriptor {
            route_id: Some("R1".into()),
            last_stop_id: Some("B1".into()),
            ..Default::default()
        });
        assert_eq!(matcher().resolve(&reference, service_date()), Some(id("B")));
    }

    #[test]
    fn test_requires_route() {
        let reference = reference(TripDescriptor {
            start_time: Some(660),
            ..Default::default()
        });
        assert_eq!(matcher().resolve(&reference, service_date()), None);
    }

    #[test]
    fn test_respects_service_date() {
        let reference = reference(TripDescriptor {
            route_id: Some("R1".into()),
            start_time: Some(660),
            ..Default::default()
        });
        let other_day = service_date().succ_opt().unwrap();
        assert_eq!(matcher().resolve(&reference, other_day), None);
    }
}
