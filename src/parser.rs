//! Protobuf parser for GTFS Realtime feeds, and the mapping from trip
//! updates to [`UpdateRecord`]s.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use prost::Message;
use tracing::{debug, warn};

use crate::gtfs_rt::feed_header::Incrementality;
use crate::gtfs_rt::trip_descriptor::ScheduleRelationship as TripRelationship;
use crate::gtfs_rt::trip_update::stop_time_update::ScheduleRelationship as StopRelationship;
use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate};
use crate::gtfs_rt::{FeedEntity, FeedMessage, TripUpdate};
use crate::model::{FeedScopedId, TransitModel};
use crate::updater::record::{
    Delivery, StopTimeRevision, TimeRevision, TripDescriptor, TripReference, UpdateRecord,
    UpdateStatus,
};

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

/// A feed message turned into one delivery page.
#[derive(Debug, Clone)]
pub struct MappedFeed {
    pub delivery: Delivery,
    pub timestamp: Option<u64>,
    /// Entities that carried a trip update but could not be mapped.
    pub skipped: usize,
}

/// Maps GTFS-RT trip updates of one feed to update records.
///
/// Absolute event times are converted to seconds after service-day midnight
/// in the feed's local offset. When the static model knows the trip, partial
/// stop lists are completed: stops before the first update keep their
/// schedule, and later stops without an update inherit the last reported
/// delay.
pub struct FeedMapper {
    feed_id: String,
    utc_offset: FixedOffset,
    model: Option<Arc<TransitModel>>,
}

impl FeedMapper {
    pub fn new(feed_id: impl Into<String>, utc_offset: FixedOffset) -> Self {
        Self {
            feed_id: feed_id.into(),
            utc_offset,
            model: None,
        }
    }

    pub fn with_model(mut self, model: Arc<TransitModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn feed_id(&self) -> &str {
        &self.feed_id
    }

    pub fn map(&self, feed: &FeedMessage) -> MappedFeed {
        let timestamp = feed.header.timestamp;
        let today = timestamp
            .and_then(|t| DateTime::from_timestamp(t as i64, 0))
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.utc_offset)
            .date_naive();

        let mut records = Vec::with_capacity(feed.entity.len());
        let mut skipped = 0;
        for entity in feed.entity.iter().filter(|e| e.trip_update.is_some()) {
            match self.map_entity(entity, today) {
                Some(record) => records.push(record),
                None => skipped += 1,
            }
        }

        MappedFeed {
            delivery: Delivery {
                records,
                full_dataset: feed.header.incrementality() == Incrementality::FullDataset,
                more_data: false,
            },
            timestamp,
            skipped,
        }
    }

    fn map_entity(&self, entity: &FeedEntity, today: NaiveDate) -> Option<UpdateRecord> {
        let update = entity.trip_update.as_ref()?;
        let trip = &update.trip;

        let service_date = match trip.start_date.as_deref() {
            Some(date) => match NaiveDate::parse_from_str(date, "%Y%m%d") {
                Ok(date) => date,
                Err(_) => {
                    warn!(entity = %entity.id, start_date = date, "Unparseable start date");
                    return None;
                }
            },
            None => today,
        };
        let start_time = match trip.start_time.as_deref().map(parse_time) {
            Some(None) => {
                warn!(entity = %entity.id, start_time = trip.start_time(), "Unparseable start time");
                return None;
            }
            Some(Some(seconds)) => Some(seconds),
            None => None,
        };

        let stop_times: Vec<StopTimeRevision> = update
            .stop_time_update
            .iter()
            .map(|stu| self.stop_revision(stu, service_date))
            .collect();
        let no_data = !update.stop_time_update.is_empty()
            && update
                .stop_time_update
                .iter()
                .all(|stu| stu.schedule_relationship() == StopRelationship::NoData);

        let status = match trip.schedule_relationship() {
            _ if entity.is_deleted() => UpdateStatus::NoData,
            TripRelationship::Canceled | TripRelationship::Deleted => UpdateStatus::Cancellation,
            TripRelationship::Added => UpdateStatus::AddedTrip,
            TripRelationship::Scheduled if no_data => UpdateStatus::NoData,
            TripRelationship::Scheduled => UpdateStatus::ScheduledRevision,
            other => {
                debug!(entity = %entity.id, relationship = other.as_str_name(), "Unsupported trip relationship");
                return None;
            }
        };

        let reference = TripReference {
            feed_id: self.feed_id.clone(),
            trip_id: trip.trip_id.clone(),
            descriptor: TripDescriptor {
                route_id: trip.route_id.clone(),
                direction_id: trip.direction_id,
                start_time,
                first_stop_id: update.stop_time_update.first().and_then(|stu| stu.stop_id.clone()),
                last_stop_id: None,
            },
        };

        let stop_times = match status {
            UpdateStatus::ScheduledRevision => self.complete(&reference, update, stop_times),
            UpdateStatus::AddedTrip => stop_times,
            UpdateStatus::Cancellation | UpdateStatus::NoData => Vec::new(),
        };

        Some(UpdateRecord {
            trip: reference,
            service_date,
            stop_times,
            status,
        })
    }

    fn stop_revision(&self, stu: &StopTimeUpdate, service_date: NaiveDate) -> StopTimeRevision {
        let mut revision = StopTimeRevision {
            stop_sequence: stu.stop_sequence,
            stop_id: stu.stop_id.clone(),
            ..Default::default()
        };
        if stu.schedule_relationship() != StopRelationship::Scheduled {
            return revision;
        }
        revision.arrival = stu.arrival.as_ref().and_then(|e| self.event(e, service_date));
        revision.departure = stu.departure.as_ref().and_then(|e| self.event(e, service_date));
        revision.predicted = revision.arrival.is_some() || revision.departure.is_some();
        revision
    }

    fn event(&self, event: &StopTimeEvent, service_date: NaiveDate) -> Option<TimeRevision> {
        if let Some(time) = event.time {
            let midnight = service_date
                .and_hms_opt(0, 0, 0)?
                .and_local_timezone(self.utc_offset)
                .single()?
                .timestamp();
            return i32::try_from(time - midnight).ok().map(TimeRevision::Absolute);
        }
        event.delay.map(TimeRevision::Delay)
    }

    /// Expands a partial revision to one entry per scheduled stop when the
    /// trip is known and every update names its stop.
    fn complete(
        &self,
        reference: &TripReference,
        update: &TripUpdate,
        revisions: Vec<StopTimeRevision>,
    ) -> Vec<StopTimeRevision> {
        let Some(model) = &self.model else {
            return revisions;
        };
        let Some(trip) = reference
            .trip_id
            .as_ref()
            .and_then(|id| model.trip(&FeedScopedId::new(self.feed_id.clone(), id.clone())))
        else {
            return revisions;
        };
        if revisions.len() == trip.stop_times.len() || revisions.iter().any(|r| r.stop_id.is_none()) {
            return revisions;
        }

        let mut pending = revisions.iter().peekable();
        let mut delay = if revisions.is_empty() { update.delay } else { None };
        let mut completed = Vec::with_capacity(trip.stop_times.len());
        for scheduled in &trip.stop_times {
            if let Some(revision) = pending.next_if(|r| r.stop_id.as_deref() == Some(scheduled.stop_id.as_str())) {
                let delay_of = |r: TimeRevision, scheduled: i32| -> Option<i32> {
                    r.resolve(scheduled)?.checked_sub(scheduled)
                };
                let reported = revision
                    .departure
                    .and_then(|d| delay_of(d, scheduled.departure))
                    .or_else(|| revision.arrival.and_then(|a| delay_of(a, scheduled.arrival)));
                if reported.is_some() {
                    delay = reported;
                }
                completed.push(revision.clone());
                continue;
            }

            let mut filled = StopTimeRevision::at_stop(scheduled.stop_id.clone());
            if let Some(delay) = delay {
                filled = filled
                    .arrival(TimeRevision::Delay(delay))
                    .departure(TimeRevision::Delay(delay));
            }
            completed.push(filled);
        }

        if pending.peek().is_some() {
            // updates for stops the trip does not serve, or out of order
            return revisions;
        }
        completed
    }
}

/// Parses `HH:MM:SS`, where hours may exceed 23 for trips past midnight.
fn parse_time(value: &str) -> Option<i32> {
    let mut parts = value.split(':').map(|p| p.parse::<i32>().ok());
    let (Some(Some(h)), Some(Some(m)), Some(Some(s)), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    if !(0..60).contains(&m) || !(0..60).contains(&s) || h < 0 {
        return None;
    }
    h.checked_mul(3600)?.checked_add(m * 60 + s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{FeedHeader, TripDescriptor as RtTripDescriptor};
    use crate::model::fixtures::{self, FEED};

    fn header(incrementality: Option<Incrementality>) -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            incrementality: incrementality.map(|i| i as i32),
            timestamp: Some(1_715_160_000),
            feed_version: None,
        }
    }

    fn rt_trip(trip_id: &str, relationship: TripRelationship) -> RtTripDescriptor {
        RtTripDescriptor {
            trip_id: Some(trip_id.to_string()),
            route_id: None,
            direction_id: None,
            start_time: None,
            start_date: Some("20240508".to_string()),
            schedule_relationship: Some(relationship as i32),
        }
    }

    fn stop_update(stop_id: &str, delay: Option<i32>) -> StopTimeUpdate {
        StopTimeUpdate {
            stop_sequence: None,
            stop_id: Some(stop_id.to_string()),
            arrival: delay.map(|d| StopTimeEvent {
                delay: Some(d),
                time: None,
                uncertainty: None,
            }),
            departure: None,
            schedule_relationship: None,
        }
    }

    fn entity(id: &str, trip: RtTripDescriptor, stop_time_update: Vec<StopTimeUpdate>) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            is_deleted: None,
            trip_update: Some(TripUpdate {
                trip,
                stop_time_update,
                timestamp: None,
                delay: None,
            }),
        }
    }

    fn mapper() -> FeedMapper {
        FeedMapper::new(FEED, FixedOffset::east_opt(0).unwrap())
    }

    #[test]
    fn test_parse_empty_bytes_returns_default_feed() {
        // An empty byte array decodes to a FeedMessage with default values
        let feed = parse_feed(&[]).unwrap();
        assert_eq!(feed.header.gtfs_realtime_version, "");
        assert!(feed.entity.is_empty());
    }

    #[test]
    fn test_parse_invalid_bytes() {
        let invalid_bytes = vec![0xFF, 0xFE, 0x00, 0x01];
        assert!(parse_feed(&invalid_bytes).is_err());
    }

    #[test]
    fn test_parse_valid_minimal_feed() {
        let feed = FeedMessage {
            header: header(None),
            entity: vec![],
        };
        let parsed = parse_feed(&feed.encode_to_vec()).unwrap();
        assert_eq!(parsed.header.gtfs_realtime_version, "2.0");
        assert_eq!(parsed.header.timestamp, Some(1_715_160_000));
    }

    #[test]
    fn test_incrementality() {
        let full = FeedMessage {
            header: header(None),
            entity: vec![],
        };
        let differential = FeedMessage {
            header: header(Some(Incrementality::Differential)),
            entity: vec![],
        };
        assert!(mapper().map(&full).delivery.full_dataset);
        assert!(!mapper().map(&differential).delivery.full_dataset);
    }

    #[test]
    fn test_maps_relationships() {
        let deleted = FeedEntity {
            is_deleted: Some(true),
            ..entity("3", rt_trip("C", TripRelationship::Scheduled), vec![])
        };
        let feed = FeedMessage {
            header: header(None),
            entity: vec![
                entity("1", rt_trip("A", TripRelationship::Canceled), vec![]),
                entity("2", rt_trip("X", TripRelationship::Added), vec![stop_update("A1", None)]),
                deleted,
                entity("4", rt_trip("B", TripRelationship::Duplicated), vec![]),
            ],
        };

        let mapped = mapper().map(&feed);
        let statuses: Vec<_> = mapped.delivery.records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![UpdateStatus::Cancellation, UpdateStatus::AddedTrip, UpdateStatus::NoData]
        );
        assert_eq!(mapped.skipped, 1);
        assert_eq!(mapped.delivery.records[0].service_date, fixtures::service_date());
    }

    #[test]
    fn test_all_no_data_stops_map_to_no_data() {
        let mut stop = stop_update("A1", Some(30));
        stop.schedule_relationship = Some(StopRelationship::NoData as i32);
        let feed = FeedMessage {
            header: header(None),
            entity: vec![entity("1", rt_trip("A", TripRelationship::Scheduled), vec![stop])],
        };
        assert_eq!(mapper().map(&feed).delivery.records[0].status, UpdateStatus::NoData);
    }

    #[test]
    fn test_absolute_time_is_relative_to_service_day() {
        // 2024-05-08T00:20:00+02:00
        let midnight_plus_20m = 1_715_120_400;
        let mut stop = stop_update("A1", None);
        stop.departure = Some(StopTimeEvent {
            delay: Some(99),
            time: Some(midnight_plus_20m),
            uncertainty: None,
        });
        let feed = FeedMessage {
            header: header(None),
            entity: vec![entity("1", rt_trip("A", TripRelationship::Scheduled), vec![stop])],
        };

        let mapper = FeedMapper::new(FEED, FixedOffset::east_opt(2 * 3600).unwrap());
        let record = &mapper.map(&feed).delivery.records[0];
        assert_eq!(record.stop_times[0].departure, Some(TimeRevision::Absolute(1200)));
    }

    #[test]
    fn test_partial_update_is_completed_from_schedule() {
        let feed = FeedMessage {
            header: header(None),
            entity: vec![entity(
                "1",
                rt_trip("A", TripRelationship::Scheduled),
                vec![stop_update("B1", Some(120))],
            )],
        };

        let mapper = mapper().with_model(Arc::new(fixtures::model()));
        let record = &mapper.map(&feed).delivery.records[0];
        assert_eq!(record.stop_times.len(), 3);
        assert_eq!(record.stop_times[0].arrival, None);
        assert_eq!(record.stop_times[1].arrival, Some(TimeRevision::Delay(120)));
        assert_eq!(record.stop_times[2].arrival, Some(TimeRevision::Delay(120)));
        assert_eq!(record.stop_times[2].departure, Some(TimeRevision::Delay(120)));
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("08:15:30"), Some(29_730));
        assert_eq!(parse_time("25:00:00"), Some(90_000));
        assert_eq!(parse_time("8:15"), None);
        assert_eq!(parse_time("08:61:00"), None);
        assert_eq!(parse_time("999999:00:00"), None);
    }

    #[test]
    fn test_overflowing_delay_is_not_carried_forward() {
        let feed = FeedMessage {
            header: header(None),
            entity: vec![entity(
                "1",
                rt_trip("A", TripRelationship::Scheduled),
                vec![stop_update("B1", Some(i32::MAX))],
            )],
        };

        let mapper = mapper().with_model(Arc::new(fixtures::model()));
        let record = &mapper.map(&feed).delivery.records[0];
        assert_eq!(record.stop_times.len(), 3);
        assert_eq!(record.stop_times[1].arrival, Some(TimeRevision::Delay(i32::MAX)));
        assert_eq!(record.stop_times[2].arrival, None);
    }
}
