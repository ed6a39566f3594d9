use chrono::{DateTime, Utc};
use geo::{Coord, LineString, Point};
use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use wkt::ToWkt;

use crate::conflation::{ConflationReport, FeatureMatchReport};
use crate::mapmatcher::{MatchOutcome, MatchedTrace};
use crate::projection::{unproject_geometry, web_mercator_to_lonlat};
use crate::road_network::{EdgeAttributes, EdgeId};
use crate::trip_builder::{Trace, TripId};

/// Renders a possibly composite or sequence-valued cell as one string.
pub trait ScalarColumn {
    fn to_scalar(&self) -> String;
}

impl ScalarColumn for EdgeId {
    fn to_scalar(&self) -> String {
        self.to_string()
    }
}

impl ScalarColumn for u64 {
    fn to_scalar(&self) -> String {
        self.to_string()
    }
}

impl ScalarColumn for String {
    fn to_scalar(&self) -> String {
        self.clone()
    }
}

impl<T: ScalarColumn> ScalarColumn for Option<T> {
    fn to_scalar(&self) -> String {
        self.as_ref().map(ScalarColumn::to_scalar).unwrap_or_default()
    }
}

impl<T: ScalarColumn> ScalarColumn for [T] {
    fn to_scalar(&self) -> String {
        match self {
            [] => String::new(),
            [single] => single.to_scalar(),
            many => format!(
                "[{}]",
                many.iter().map(ScalarColumn::to_scalar).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

impl<T: ScalarColumn> ScalarColumn for Vec<T> {
    fn to_scalar(&self) -> String {
        self.as_slice().to_scalar()
    }
}

/// Edge metadata as flat output columns.
#[derive(Debug, Clone, Default, PartialEq)]
struct AttributeColumns {
    osm_id: String,
    name: String,
    highway: String,
    max_speed: String,
    bridge: String,
    tunnel: String,
    reference: String,
}

impl From<&EdgeAttributes> for AttributeColumns {
    fn from(a: &EdgeAttributes) -> Self {
        Self {
            osm_id: a.osm_ids.to_scalar(),
            name: a.name.to_scalar(),
            highway: a.highway.to_scalar(),
            max_speed: a.max_speed.to_scalar(),
            bridge: a.bridge.to_scalar(),
            tunnel: a.tunnel.to_scalar(),
            reference: a.reference.to_scalar(),
        }
    }
}

fn lonlat_wkt(position: Coord<f64>) -> String {
    Point::from(web_mercator_to_lonlat(position)).wkt_string()
}

fn line_wkt(line: &LineString<f64>) -> String {
    unproject_geometry(line).wkt_string()
}

/// A one-sample trace has no line to draw and is written as its point.
fn trace_wkt(trace: &Trace) -> String {
    match trace.points() {
        [single] => Point::from(single.lonlat).wkt_string(),
        _ => line_wkt(&trace.polyline()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracePointRow {
    pub trip_id: TripId,
    pub rownum: usize,
    pub x: f64,
    pub y: f64,
    pub lon: f64,
    pub lat: f64,
    pub collect_time: Option<DateTime<Utc>>,
    pub accuracy: Option<f64>,
    pub mode_type: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceLineRow {
    pub trip_id: TripId,
    pub rownum: usize,
    pub point_count: usize,
    pub geometry: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedPointRow {
    pub trip_id: TripId,
    pub rownum: usize,
    pub coordinate_index: usize,
    pub distance_m: f64,
    pub road_id: String,
    pub origin: u64,
    pub destination: u64,
    pub osm_id: String,
    pub name: String,
    pub highway: String,
    pub max_speed: String,
    pub bridge: String,
    pub tunnel: String,
    pub reference: String,
    pub geometry: String,
    #[serde(skip)]
    pub edge_id: EdgeId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedPathRow {
    pub trip_id: TripId,
    pub rownum: usize,
    pub road_id: String,
    pub origin: u64,
    pub destination: u64,
    pub length_km: f64,
    pub osm_id: String,
    pub name: String,
    pub highway: String,
    pub max_speed: String,
    pub bridge: String,
    pub tunnel: String,
    pub reference: String,
    pub entry: String,
    pub exit: String,
    pub geometry: String,
    #[serde(skip)]
    pub edge_id: EdgeId,
    #[serde(skip)]
    pub osm_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmatchedRow {
    pub trip_id: TripId,
    pub kind: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflatedLinkRow {
    pub feature_id: String,
    pub road_id: String,
    pub origin: u64,
    pub destination: u64,
    pub distance_m: f64,
    pub osm_id: String,
    pub name: String,
    pub highway: String,
    pub max_speed: String,
    pub bridge: String,
    pub tunnel: String,
    pub reference: String,
    pub geometry: String,
    #[serde(skip)]
    pub edge_id: EdgeId,
}

/// One edge of a line feature's matched path, tagged with the feature it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeaturePathRow {
    pub original_id: String,
    pub rownum: usize,
    pub road_id: String,
    pub origin: u64,
    pub destination: u64,
    pub length_km: f64,
    pub osm_id: String,
    pub name: String,
    pub highway: String,
    pub max_speed: String,
    pub bridge: String,
    pub tunnel: String,
    pub reference: String,
    pub geometry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlaggedTripRow {
    pub trip_id: TripId,
}

/// The unified output tables of a batch, each ordered by trip id then rownum.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedOutput {
    pub trace_points: Vec<TracePointRow>,
    pub trace_lines: Vec<TraceLineRow>,
    pub matched_points: Vec<MatchedPointRow>,
    pub matched_paths: Vec<MatchedPathRow>,
    pub unmatched: Vec<UnmatchedRow>,
}

impl AggregatedOutput {
    pub fn from_outcomes(traces: &[Trace], outcomes: &[MatchOutcome]) -> Self {
        let mut output = AggregatedOutput::default();

        let traces: BTreeMap<&str, &Trace> = traces.iter().map(|t| (t.trip_id(), t)).collect();
        for trace in traces.values() {
            output.push_trace(trace);
        }

        let outcomes: BTreeMap<&str, &MatchOutcome> = outcomes.iter().map(|o| (o.trip_id(), o)).collect();
        for outcome in outcomes.values() {
            match outcome {
                MatchOutcome::Matched(matched) => output.push_match(matched),
                MatchOutcome::Unmatched { trip_id, reason } => output.unmatched.push(UnmatchedRow {
                    trip_id: trip_id.clone(),
                    kind: reason.kind().to_string(),
                    reason: reason.to_string(),
                }),
            }
        }

        info!(
            "Aggregated {} traces: {} matched path rows, {} unmatched trips",
            output.trace_lines.len(),
            output.matched_paths.len(),
            output.unmatched.len()
        );
        output
    }

    fn push_trace(&mut self, trace: &Trace) {
        let trip_id = trace.trip_id().to_string();
        for (rownum, p) in trace.points().iter().enumerate() {
            self.trace_points.push(TracePointRow {
                trip_id: trip_id.clone(),
                rownum,
                x: p.position.x,
                y: p.position.y,
                lon: p.lonlat.x,
                lat: p.lonlat.y,
                collect_time: p.collect_time,
                accuracy: p.accuracy,
                mode_type: p.mode_type,
            });
        }
        self.trace_lines.push(TraceLineRow {
            trip_id,
            rownum: 0,
            point_count: trace.len(),
            geometry: trace_wkt(trace),
        });
    }

    fn push_match(&mut self, matched: &MatchedTrace) {
        let attributes = matched.edge_attributes();

        for (rownum, a) in matched.assignments.iter().enumerate() {
            let columns = attributes
                .get(&a.edge_id)
                .map(|attrs| AttributeColumns::from(*attrs))
                .unwrap_or_default();
            self.matched_points.push(MatchedPointRow {
                trip_id: matched.trip_id.clone(),
                rownum,
                coordinate_index: a.coordinate_index,
                distance_m: a.distance,
                road_id: a.edge_id.to_scalar(),
                origin: a.edge_id.origin,
                destination: a.edge_id.destination,
                osm_id: columns.osm_id,
                name: columns.name,
                highway: columns.highway,
                max_speed: columns.max_speed,
                bridge: columns.bridge,
                tunnel: columns.tunnel,
                reference: columns.reference,
                geometry: lonlat_wkt(a.position),
                edge_id: a.edge_id,
            });
        }

        for (rownum, e) in matched.path.iter().enumerate() {
            let columns = AttributeColumns::from(&e.attributes);
            self.matched_paths.push(MatchedPathRow {
                trip_id: matched.trip_id.clone(),
                rownum,
                road_id: e.edge_id.to_scalar(),
                origin: e.edge_id.origin,
                destination: e.edge_id.destination,
                length_km: e.attributes.length_m / 1000.0,
                osm_id: columns.osm_id,
                name: columns.name,
                highway: columns.highway,
                max_speed: columns.max_speed,
                bridge: columns.bridge,
                tunnel: columns.tunnel,
                reference: columns.reference,
                entry: lonlat_wkt(e.entry),
                exit: lonlat_wkt(e.exit),
                geometry: line_wkt(&e.geometry),
                edge_id: e.edge_id,
                osm_ids: e.attributes.osm_ids.clone(),
            });
        }
    }

    pub fn matched_trip_ids(&self) -> BTreeSet<TripId> {
        self.matched_paths.iter().map(|r| r.trip_id.clone()).collect()
    }
}

/// Tabulate conflation results, one row per matched feature.
pub fn conflated_links(report: &ConflationReport) -> Vec<ConflatedLinkRow> {
    report
        .matched
        .iter()
        .map(|r| {
            let columns = AttributeColumns::from(&r.attributes);
            ConflatedLinkRow {
                feature_id: r.feature_id.clone(),
                road_id: r.edge_id.to_scalar(),
                origin: r.edge_id.origin,
                destination: r.edge_id.destination,
                distance_m: r.distance,
                osm_id: columns.osm_id,
                name: columns.name,
                highway: columns.highway,
                max_speed: columns.max_speed,
                bridge: columns.bridge,
                tunnel: columns.tunnel,
                reference: columns.reference,
                geometry: line_wkt(&r.edge_geometry),
                edge_id: r.edge_id,
            }
        })
        .collect()
}

/// Matched paths of the line features, numbered per feature. Unmatched
/// features contribute no rows.
pub fn feature_paths(report: &FeatureMatchReport) -> Vec<FeaturePathRow> {
    let mut rows = Vec::new();
    for outcome in &report.outcomes {
        let MatchOutcome::Matched(matched) = outcome else {
            continue;
        };
        for (rownum, e) in matched.path.iter().enumerate() {
            let columns = AttributeColumns::from(&e.attributes);
            rows.push(FeaturePathRow {
                original_id: matched.trip_id.clone(),
                rownum,
                road_id: e.edge_id.to_scalar(),
                origin: e.edge_id.origin,
                destination: e.edge_id.destination,
                length_km: e.attributes.length_m / 1000.0,
                osm_id: columns.osm_id,
                name: columns.name,
                highway: columns.highway,
                max_speed: columns.max_speed,
                bridge: columns.bridge,
                tunnel: columns.tunnel,
                reference: columns.reference,
                geometry: line_wkt(&e.geometry),
            });
        }
    }
    rows
}

/// Trips whose matched path touches any edge in `edges`.
pub fn flag_by_edge_membership(matched_paths: &[MatchedPathRow], edges: &BTreeSet<EdgeId>) -> BTreeSet<TripId> {
    let flagged: BTreeSet<TripId> = matched_paths
        .iter()
        .filter(|r| edges.contains(&r.edge_id))
        .map(|r| r.trip_id.clone())
        .collect();
    debug!("{} trips touch {} facility edges", flagged.len(), edges.len());
    flagged
}

/// Trips whose matched path touches any of the given OSM ways.
pub fn flag_by_way_membership(matched_paths: &[MatchedPathRow], way_ids: &BTreeSet<u64>) -> BTreeSet<TripId> {
    matched_paths
        .iter()
        .filter(|r| r.osm_ids.iter().any(|id| way_ids.contains(id)))
        .map(|r| r.trip_id.clone())
        .collect()
}

pub fn flagged_rows(trips: &BTreeSet<TripId>) -> Vec<FlaggedTripRow> {
    trips
        .iter()
        .map(|t| FlaggedTripRow { trip_id: t.clone() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConflationError;
    use crate::mapmatcher::{MatchedEdge, PointAssignment};
    use geo::line_string;

    fn path_row(trip: &str, rownum: usize, edge: EdgeId, osm_ids: Vec<u64>) -> MatchedPathRow {
        MatchedPathRow {
            trip_id: trip.to_string(),
            rownum,
            road_id: edge.to_scalar(),
            origin: edge.origin,
            destination: edge.destination,
            length_km: 0.1,
            osm_id: osm_ids.to_scalar(),
            name: String::new(),
            highway: String::new(),
            max_speed: String::new(),
            bridge: String::new(),
            tunnel: String::new(),
            reference: String::new(),
            entry: String::new(),
            exit: String::new(),
            geometry: String::new(),
            edge_id: edge,
            osm_ids,
        }
    }

    fn matched(trip: &str) -> MatchedTrace {
        let edge = EdgeId::new(1, 2, 0);
        MatchedTrace {
            trip_id: trip.to_string(),
            path: vec![MatchedEdge {
                edge_id: edge,
                entry: Coord { x: 10.0, y: 0.0 },
                exit: Coord { x: 90.0, y: 0.0 },
                geometry: line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)],
                attributes: EdgeAttributes {
                    osm_ids: vec![7, 8],
                    name: Some("Main".to_string()),
                    highway: Some("primary".to_string()),
                    length_m: 100.0,
                    ..Default::default()
                },
            }],
            assignments: (0..3)
                .map(|i| PointAssignment {
                    coordinate_index: i,
                    position: Coord { x: 10.0 + 40.0 * i as f64, y: 2.0 },
                    edge_id: edge,
                    distance: 2.0,
                })
                .collect(),
            score: 0.96,
        }
    }

    #[test]
    fn scalar_rendering() {
        assert_eq!(vec![5u64].to_scalar(), "5");
        assert_eq!(vec![5u64, 6].to_scalar(), "[5, 6]");
        assert_eq!(Vec::<u64>::new().to_scalar(), "");
        assert_eq!(None::<String>.to_scalar(), "");
        assert_eq!(EdgeId::new(1, 2, 0).to_scalar(), "(1, 2, 0)");
    }

    #[test]
    fn flags_trips_touching_edges() {
        let (e1, e2, e3) = (EdgeId::new(1, 2, 0), EdgeId::new(2, 3, 0), EdgeId::new(3, 4, 0));
        let rows = vec![path_row("T1", 0, e1, vec![]), path_row("T1", 1, e2, vec![]), path_row("T1", 2, e3, vec![])];

        let hit = flag_by_edge_membership(&rows, &BTreeSet::from([e2]));
        assert_eq!(hit, BTreeSet::from(["T1".to_string()]));

        let miss = flag_by_edge_membership(&rows, &BTreeSet::from([EdgeId::new(9, 9, 0)]));
        assert!(miss.is_empty());
    }

    #[test]
    fn single_sample_trace_line_is_a_point() {
        let traces = vec![Trace::from_lonlat("solo", vec![Coord { x: -121.89, y: 37.33 }]).unwrap()];
        let output = AggregatedOutput::from_outcomes(&traces, &[]);
        assert_eq!(output.trace_lines.len(), 1);
        assert_eq!(output.trace_lines[0].point_count, 1);
        let geometry = &output.trace_lines[0].geometry;
        assert!(geometry.starts_with("POINT"), "{}", geometry);
        assert!(geometry.contains("-121.89 37.33"));
    }

    #[test]
    fn feature_paths_carry_the_original_id() {
        let report = FeatureMatchReport {
            outcomes: vec![
                MatchOutcome::Matched(matched("L7")),
                MatchOutcome::unmatched("L8", ConflationError::UnmatchableTrace("far".to_string())),
            ],
            skipped: vec!["P1".to_string()],
        };
        let rows = feature_paths(&report);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].original_id, "L7");
        assert_eq!(rows[0].rownum, 0);
        assert_eq!(rows[0].road_id, "(1, 2, 0)");
        assert_eq!(rows[0].osm_id, "[7, 8]");
        assert!(rows[0].geometry.starts_with("LINESTRING"));
    }

    #[test]
    fn flags_trips_by_osm_way() {
        let rows = vec![
            path_row("a", 0, EdgeId::new(1, 2, 0), vec![10, 11]),
            path_row("b", 0, EdgeId::new(2, 3, 0), vec![12]),
        ];
        assert_eq!(
            flag_by_way_membership(&rows, &BTreeSet::from([11])),
            BTreeSet::from(["a".to_string()])
        );
    }

    #[test]
    fn rows_are_numbered_per_trip_and_attributes_joined() {
        let traces = vec![
            Trace::from_projected("t2", vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 5.0, y: 0.0 }]).unwrap(),
            Trace::from_projected(
                "t1",
                (0..3).map(|i| Coord { x: 10.0 + 40.0 * i as f64, y: 2.0 }),
            )
            .unwrap(),
        ];
        let outcomes = vec![
            MatchOutcome::unmatched("t2", ConflationError::UnmatchableTrace("too far".to_string())),
            MatchOutcome::Matched(matched("t1")),
        ];
        let output = AggregatedOutput::from_outcomes(&traces, &outcomes);

        assert_eq!(output.trace_points.len(), 5);
        assert_eq!(output.trace_points[0].trip_id, "t1");
        assert_eq!(
            output.trace_points.iter().filter(|r| r.trip_id == "t1").map(|r| r.rownum).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(output.trace_lines.len(), 2);
        assert!(output.trace_lines[0].geometry.starts_with("LINESTRING"));

        assert_eq!(output.matched_points.len(), 3);
        assert!(output.matched_points.iter().all(|r| r.name == "Main" && r.osm_id == "[7, 8]"));
        assert_eq!(output.matched_paths.len(), 1);
        assert_eq!(output.matched_paths[0].road_id, "(1, 2, 0)");
        assert!((output.matched_paths[0].length_km - 0.1).abs() < 1e-12);
        assert!(output.matched_paths[0].entry.starts_with("POINT"));

        assert_eq!(output.unmatched.len(), 1);
        assert_eq!(output.unmatched[0].trip_id, "t2");
        assert_eq!(output.unmatched[0].kind, "unmatchable_trace");
        assert_eq!(output.matched_trip_ids(), BTreeSet::from(["t1".to_string()]));
    }
}
