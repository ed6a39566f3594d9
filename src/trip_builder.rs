use chrono::{DateTime, Utc};
use geo::{Coord, LineString, Rect};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::error::ConflationError;
use crate::projection::{is_valid_lonlat, lonlat_to_web_mercator};

pub type TripId = String;

/// One row of the survey location table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub trip_id: TripId,
    #[serde(default)]
    pub collect_time: Option<DateTime<Utc>>,
    #[serde(alias = "lon")]
    pub longitude: f64,
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub mode_type: Option<i32>,
}

/// Trip-level attributes from the survey trip table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub trip_id: TripId,
    #[serde(default)]
    pub mode_type: Option<i32>,
    #[serde(default)]
    pub o_in_region: Option<u8>,
    #[serde(default)]
    pub d_in_region: Option<u8>,
}

/// Default survey mode codes for motorised road travel.
pub const DEFAULT_MODE_TYPES: [i32; 5] = [5, 6, 8, 9, 11];

/// Selects trips made by one of the allowed modes that start or end inside the region.
#[derive(Debug, Clone)]
pub struct TripFilter {
    modes: BTreeSet<i32>,
}

impl Default for TripFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MODE_TYPES)
    }
}

impl TripFilter {
    pub fn new(modes: impl IntoIterator<Item = i32>) -> Self {
        Self {
            modes: modes.into_iter().collect(),
        }
    }

    pub fn accepts(&self, trip: &TripRecord) -> bool {
        let mode_ok = trip.mode_type.is_some_and(|m| self.modes.contains(&m));
        let region_ok = trip.o_in_region == Some(1) || trip.d_in_region == Some(1);
        mode_ok && region_ok
    }

    pub fn select<'a>(&self, trips: impl IntoIterator<Item = &'a TripRecord>) -> BTreeSet<TripId> {
        trips
            .into_iter()
            .filter(|t| self.accepts(t))
            .map(|t| t.trip_id.clone())
            .collect()
    }
}

/// A single sample of a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TracePoint {
    /// Web Mercator metres
    pub position: Coord<f64>,
    pub lonlat: Coord<f64>,
    pub collect_time: Option<DateTime<Utc>>,
    pub accuracy: Option<f64>,
    pub mode_type: Option<i32>,
}

impl TracePoint {
    pub fn from_lonlat(lonlat: Coord<f64>) -> Self {
        Self {
            position: lonlat_to_web_mercator(lonlat),
            lonlat,
            collect_time: None,
            accuracy: None,
            mode_type: None,
        }
    }
}

/// Ordered samples of one trip. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    trip_id: TripId,
    points: Vec<TracePoint>,
}

impl Trace {
    pub fn new(trip_id: impl Into<TripId>, points: Vec<TracePoint>) -> Result<Self, ConflationError> {
        let trip_id = trip_id.into();
        if points.is_empty() {
            return Err(ConflationError::MalformedGeometry(format!(
                "trip {} has no points",
                trip_id
            )));
        }
        if let Some(p) = points
            .iter()
            .find(|p| !p.position.x.is_finite() || !p.position.y.is_finite())
        {
            return Err(ConflationError::MalformedGeometry(format!(
                "trip {} has a non-finite position {:?}",
                trip_id, p.position
            )));
        }
        Ok(Self { trip_id, points })
    }

    /// A trace from lon/lat coordinates, without timestamps.
    pub fn from_lonlat(
        trip_id: impl Into<TripId>,
        coords: impl IntoIterator<Item = Coord<f64>>,
    ) -> Result<Self, ConflationError> {
        Self::new(trip_id, coords.into_iter().map(TracePoint::from_lonlat).collect())
    }

    /// A trace from coordinates already in Web Mercator metres.
    pub fn from_projected(
        trip_id: impl Into<TripId>,
        coords: impl IntoIterator<Item = Coord<f64>>,
    ) -> Result<Self, ConflationError> {
        let points = coords
            .into_iter()
            .map(|position| TracePoint {
                position,
                lonlat: crate::projection::web_mercator_to_lonlat(position),
                collect_time: None,
                accuracy: None,
                mode_type: None,
            })
            .collect();
        Self::new(trip_id, points)
    }

    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }

    pub fn points(&self) -> &[TracePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn positions(&self) -> Vec<Coord<f64>> {
        self.points.iter().map(|p| p.position).collect()
    }

    /// Polyline through the projected positions.
    pub fn polyline(&self) -> LineString<f64> {
        LineString::from(self.positions())
    }

    pub fn envelope(&self) -> Rect<f64> {
        let first = self.points[0].position;
        self.points.iter().fold(Rect::new(first, first), |r, p| {
            Rect::new(
                Coord {
                    x: r.min().x.min(p.position.x),
                    y: r.min().y.min(p.position.y),
                },
                Coord {
                    x: r.max().x.max(p.position.x),
                    y: r.max().y.max(p.position.y),
                },
            )
        })
    }
}

/// Traces built from a location table, plus the trips that could not be built.
#[derive(Debug, Default)]
pub struct BuiltTraces {
    pub traces: Vec<Trace>,
    pub rejected: Vec<(TripId, ConflationError)>,
    pub dropped_records: usize,
}

/// Groups raw location records into ordered, deduplicated traces.
#[derive(Debug, Clone, Default)]
pub struct TraceBuilder {
    max_traces: Option<usize>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only the first `max_traces` trips (by trip id), for test runs.
    pub fn with_max_traces(mut self, max_traces: Option<usize>) -> Self {
        self.max_traces = max_traces;
        self
    }

    pub fn build(&self, records: impl IntoIterator<Item = LocationRecord>) -> BuiltTraces {
        let start = Instant::now();
        let mut by_trip: BTreeMap<TripId, Vec<LocationRecord>> = BTreeMap::new();
        for record in records {
            by_trip.entry(record.trip_id.clone()).or_default().push(record);
        }

        let mut built = BuiltTraces::default();
        for (trip_id, mut records) in by_trip {
            if self.max_traces.is_some_and(|max| built.traces.len() >= max) {
                break;
            }

            order_by_collect_time(&mut records);
            let before = records.len();
            records.dedup_by(|b, a| {
                a.collect_time == b.collect_time
                    && a.longitude == b.longitude
                    && a.latitude == b.latitude
            });

            let mut points = Vec::with_capacity(records.len());
            for r in &records {
                let lonlat = Coord {
                    x: r.longitude,
                    y: r.latitude,
                };
                if !is_valid_lonlat(lonlat) {
                    warn!(
                        "Dropping invalid coordinate ({}, {}) in trip {}",
                        r.longitude, r.latitude, trip_id
                    );
                    built.dropped_records += 1;
                    continue;
                }
                points.push(TracePoint {
                    position: lonlat_to_web_mercator(lonlat),
                    lonlat,
                    collect_time: r.collect_time,
                    accuracy: r.accuracy,
                    mode_type: r.mode_type,
                });
            }
            built.dropped_records += before - records.len();

            match Trace::new(trip_id.clone(), points) {
                Ok(trace) => built.traces.push(trace),
                Err(e) => built.rejected.push((trip_id, e)),
            }
        }

        info!(
            "Built {} traces ({} rejected) in {:?}",
            built.traces.len(),
            built.rejected.len(),
            start.elapsed()
        );
        debug!("Dropped {} duplicate or invalid records", built.dropped_records);
        built
    }
}

/// Sort the timed records by collection time within the slots they occupy.
/// Untimed records keep their input position and equal times keep input order.
fn order_by_collect_time(records: &mut [LocationRecord]) {
    let slots: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.collect_time.is_some())
        .map(|(i, _)| i)
        .collect();
    let mut timed: Vec<LocationRecord> = slots.iter().map(|&i| records[i].clone()).collect();
    timed.sort_by_key(|r| r.collect_time);
    for (slot, record) in slots.into_iter().zip(timed) {
        records[slot] = record;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(trip: &str, secs: i64, lon: f64, lat: f64) -> LocationRecord {
        LocationRecord {
            trip_id: trip.to_string(),
            collect_time: Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()),
            longitude: lon,
            latitude: lat,
            accuracy: Some(5.0),
            mode_type: Some(6),
        }
    }

    #[test]
    fn points_are_ordered_by_collection_time() {
        let built = TraceBuilder::new().build(vec![
            record("a", 20, -97.70, 30.27),
            record("a", 0, -97.72, 30.27),
            record("a", 10, -97.71, 30.27),
        ]);
        assert_eq!(built.traces.len(), 1);
        let lons: Vec<f64> = built.traces[0].points().iter().map(|p| p.lonlat.x).collect();
        assert_eq!(lons, vec![-97.72, -97.71, -97.70]);
    }

    fn untimed(trip: &str, lon: f64, lat: f64) -> LocationRecord {
        LocationRecord {
            collect_time: None,
            ..record(trip, 0, lon, lat)
        }
    }

    fn lons(built: &BuiltTraces) -> Vec<f64> {
        built.traces[0].points().iter().map(|p| p.lonlat.x).collect()
    }

    #[test]
    fn untimed_records_keep_their_input_position() {
        let built = TraceBuilder::new().build(vec![
            record("a", 10, -122.0, 37.3),
            record("a", 20, -122.001, 37.3),
            untimed("a", -122.002, 37.3),
        ]);
        assert_eq!(lons(&built), vec![-122.0, -122.001, -122.002]);

        let built = TraceBuilder::new().build(vec![
            record("a", 20, -122.0, 37.3),
            untimed("a", -122.001, 37.3),
            record("a", 10, -122.002, 37.3),
        ]);
        assert_eq!(lons(&built), vec![-122.002, -122.001, -122.0]);
    }

    #[test]
    fn equal_timestamps_keep_input_order() {
        let built = TraceBuilder::new().build(vec![
            record("a", 10, -122.0, 37.3),
            record("a", 0, -122.1, 37.3),
            record("a", 10, -122.2, 37.3),
        ]);
        assert_eq!(lons(&built), vec![-122.1, -122.0, -122.2]);
    }

    #[test]
    fn exact_duplicates_are_removed() {
        let built = TraceBuilder::new().build(vec![
            record("a", 0, -97.72, 30.27),
            record("a", 0, -97.72, 30.27),
            record("a", 10, -97.71, 30.27),
        ]);
        assert_eq!(built.traces[0].len(), 2);
        assert_eq!(built.dropped_records, 1);
    }

    #[test]
    fn trips_with_only_invalid_points_are_rejected() {
        let built = TraceBuilder::new().build(vec![
            record("bad", 0, 500.0, 30.27),
            record("good", 0, -97.72, 30.27),
        ]);
        assert_eq!(built.traces.len(), 1);
        assert_eq!(built.traces[0].trip_id(), "good");
        assert_eq!(built.rejected.len(), 1);
        assert!(matches!(
            built.rejected[0].1,
            ConflationError::MalformedGeometry(_)
        ));
    }

    #[test]
    fn max_traces_limits_the_subset() {
        let records = (0..5).map(|i| record(&format!("t{}", i), 0, -97.7, 30.27));
        let built = TraceBuilder::new().with_max_traces(Some(2)).build(records);
        let ids: Vec<&str> = built.traces.iter().map(|t| t.trip_id()).collect();
        assert_eq!(ids, vec!["t0", "t1"]);
    }

    #[test]
    fn empty_trace_is_malformed() {
        assert!(matches!(
            Trace::new("x", vec![]),
            Err(ConflationError::MalformedGeometry(_))
        ));
    }

    #[test]
    fn filter_requires_mode_and_region() {
        let filter = TripFilter::default();
        let trip = |mode, o, d| TripRecord {
            trip_id: "t".to_string(),
            mode_type: Some(mode),
            o_in_region: Some(o),
            d_in_region: Some(d),
        };
        assert!(filter.accepts(&trip(6, 1, 0)));
        assert!(filter.accepts(&trip(11, 0, 1)));
        assert!(!filter.accepts(&trip(1, 1, 1)));
        assert!(!filter.accepts(&trip(6, 0, 0)));
    }

    #[test]
    fn envelope_spans_all_points() {
        let trace = Trace::from_projected(
            "e",
            vec![Coord { x: 0.0, y: 5.0 }, Coord { x: 10.0, y: -5.0 }],
        )
        .unwrap();
        let env = trace.envelope();
        assert_eq!(env.min(), Coord { x: 0.0, y: -5.0 });
        assert_eq!(env.max(), Coord { x: 10.0, y: 5.0 });
    }
}
