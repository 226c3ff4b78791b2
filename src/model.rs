//! Static transit schedule that realtime updates are applied against.
//!
//! The model is built once at startup (from a JSON schedule file or with
//! [`TransitModelBuilder`]) and shared read-only as `Arc<TransitModel>` by the
//! write lane, the matcher and every published snapshot.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::snapshot::{Timetable, TripTimes};

/// An identifier scoped to the feed that published it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedScopedId {
    pub feed_id: String,
    pub id: String,
}

impl FeedScopedId {
    pub fn new(feed_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            feed_id: feed_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for FeedScopedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.feed_id, self.id)
    }
}

/// Key of all realtime state: one trip on one service date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TripKey {
    pub trip_id: FeedScopedId,
    pub service_date: NaiveDate,
}

impl TripKey {
    pub fn new(trip_id: FeedScopedId, service_date: NaiveDate) -> Self {
        Self {
            trip_id,
            service_date,
        }
    }

    pub fn feed_id(&self) -> &str {
        &self.trip_id.feed_id
    }
}

impl fmt::Display for TripKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.trip_id, self.service_date)
    }
}

/// Ordered list of stops shared by every trip of the pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: FeedScopedId,
    pub route_id: String,
    #[serde(default)]
    pub direction_id: Option<u32>,
    pub stops: Vec<String>,
}

/// Scheduled arrival and departure, in seconds after service-day midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledStopTime {
    pub stop_id: String,
    pub arrival: i32,
    pub departure: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTrip {
    pub id: FeedScopedId,
    pub route_id: String,
    #[serde(default)]
    pub direction_id: Option<u32>,
    pub pattern_id: FeedScopedId,
    pub service_dates: BTreeSet<NaiveDate>,
    pub stop_times: Vec<ScheduledStopTime>,
}

impl ScheduledTrip {
    pub fn runs_on(&self, date: NaiveDate) -> bool {
        self.service_dates.contains(&date)
    }

    pub fn first_departure(&self) -> Option<i32> {
        self.stop_times.first().map(|st| st.departure)
    }
}

/// On-disk layout of a schedule file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ScheduleFile {
    pub patterns: Vec<Pattern>,
    pub trips: Vec<ScheduledTrip>,
}

#[derive(Debug, Default)]
pub struct TransitModel {
    patterns: HashMap<FeedScopedId, Pattern>,
    trips: HashMap<FeedScopedId, ScheduledTrip>,
    trips_by_pattern: HashMap<FeedScopedId, Vec<FeedScopedId>>,
    trips_by_route: HashMap<(String, String), Vec<FeedScopedId>>,
}

impl TransitModel {
    pub fn builder() -> TransitModelBuilder {
        TransitModelBuilder::default()
    }

    /// Loads a [`ScheduleFile`] serialized as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schedule {}", path.display()))?;
        let file: ScheduleFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse schedule {}", path.display()))?;

        let mut builder = Self::builder();
        for pattern in file.patterns {
            builder = builder.pattern(pattern);
        }
        for trip in file.trips {
            builder = builder.trip(trip);
        }
        builder.build()
    }

    pub fn trip(&self, id: &FeedScopedId) -> Option<&ScheduledTrip> {
        self.trips.get(id)
    }

    pub fn pattern(&self, id: &FeedScopedId) -> Option<&Pattern> {
        self.patterns.get(id)
    }

    pub fn pattern_for(&self, trip_id: &FeedScopedId) -> Option<&Pattern> {
        self.trip(trip_id).and_then(|t| self.pattern(&t.pattern_id))
    }

    /// Scheduled timetable of `pattern_id` on `date`, or `None` when no trip of
    /// the pattern runs that day.
    pub fn timetable_for(&self, pattern_id: &FeedScopedId, date: NaiveDate) -> Option<Timetable> {
        let trip_times: Vec<Arc<TripTimes>> = self
            .trips_on_pattern(pattern_id)
            .filter(|trip| trip.runs_on(date))
            .map(|trip| Arc::new(TripTimes::scheduled(trip, date)))
            .collect();

        if trip_times.is_empty() {
            return None;
        }
        Some(Timetable::new(pattern_id.clone(), date, trip_times))
    }

    pub fn trips_on_pattern<'a>(
        &'a self,
        pattern_id: &FeedScopedId,
    ) -> impl Iterator<Item = &'a ScheduledTrip> + 'a {
        self.trips_by_pattern
            .get(pattern_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.trips.get(id))
    }

    pub fn trips_for_route<'a>(
        &'a self,
        feed_id: &str,
        route_id: &str,
    ) -> impl Iterator<Item = &'a ScheduledTrip> + 'a {
        self.trips_by_route
            .get(&(feed_id.to_string(), route_id.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| self.trips.get(id))
    }

    pub fn trip_count(&self) -> usize {
        self.trips.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

#[derive(Debug, Default)]
pub struct TransitModelBuilder {
    patterns: Vec<Pattern>,
    trips: Vec<ScheduledTrip>,
}

impl TransitModelBuilder {
    pub fn pattern(mut self, pattern: Pattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn trip(mut self, trip: ScheduledTrip) -> Self {
        self.trips.push(trip);
        self
    }

    /// Indexes the catalog, checking that every trip follows a known pattern
    /// stop for stop.
    pub fn build(self) -> Result<TransitModel> {
        let mut model = TransitModel::default();

        for pattern in self.patterns {
            if model.patterns.contains_key(&pattern.id) {
                bail!("duplicate pattern {}", pattern.id);
            }
            model.patterns.insert(pattern.id.clone(), pattern);
        }

        for trip in self.trips {
            let Some(pattern) = model.patterns.get(&trip.pattern_id) else {
                bail!("trip {} references unknown pattern {}", trip.id, trip.pattern_id);
            };
            let follows_pattern = pattern.stops.len() == trip.stop_times.len()
                && pattern
                    .stops
                    .iter()
                    .zip(&trip.stop_times)
                    .all(|(stop, st)| *stop == st.stop_id);
            if !follows_pattern {
                bail!("trip {} does not follow the stops of pattern {}", trip.id, pattern.id);
            }
            if model.trips.contains_key(&trip.id) {
                bail!("duplicate trip {}", trip.id);
            }

            model
                .trips_by_pattern
                .entry(trip.pattern_id.clone())
                .or_default()
                .push(trip.id.clone());
            model
                .trips_by_route
                .entry((trip.id.feed_id.clone(), trip.route_id.clone()))
                .or_default()
                .push(trip.id.clone());
            model.trips.insert(trip.id.clone(), trip);
        }

        Ok(model)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Small schedule shared by the unit tests: feed `F`, route `R1`, three
    //! trips on two patterns running on [`SERVICE_DATE`].

    use super::*;

    pub const FEED: &str = "F";

    pub fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 8).unwrap()
    }

    pub fn id(id: &str) -> FeedScopedId {
        FeedScopedId::new(FEED, id)
    }

    pub fn stop_times(times: &[(&str, i32, i32)]) -> Vec<ScheduledStopTime> {
        times
            .iter()
            .map(|(stop, arrival, departure)| ScheduledStopTime {
                stop_id: stop.to_string(),
                arrival: *arrival,
                departure: *departure,
            })
            .collect()
    }

    fn trip(trip_id: &str, pattern: &str, times: &[(&str, i32, i32)]) -> ScheduledTrip {
        ScheduledTrip {
            id: id(trip_id),
            route_id: "R1".into(),
            direction_id: Some(0),
            pattern_id: id(pattern),
            service_dates: [service_date()].into_iter().collect(),
            stop_times: stop_times(times),
        }
    }

    /// `A` and `C` run A1 → B1 → C1, `B` runs A1 → B1.
    pub fn model() -> TransitModel {
        TransitModel::builder()
            .pattern(Pattern {
                id: id("P3"),
                route_id: "R1".into(),
                direction_id: Some(0),
                stops: vec!["A1".into(), "B1".into(), "C1".into()],
            })
            .pattern(Pattern {
                id: id("P2"),
                route_id: "R1".into(),
                direction_id: Some(0),
                stops: vec!["A1".into(), "B1".into()],
            })
            .trip(trip("A", "P3", &[("A1", 600, 660), ("B1", 1200, 1260), ("C1", 1800, 1800)]))
            .trip(trip("B", "P2", &[("A1", 3600, 3660), ("B1", 4200, 4200)]))
            .trip(trip("C", "P3", &[("A1", 7200, 7260), ("B1", 7800, 7860), ("C1", 8400, 8400)]))
            .build()
            .unwrap()
    }
}
