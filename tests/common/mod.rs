#![allow(dead_code)]

use geo::{Coord, LineString};
use trip_trace_conflation::geofence::Geofence;
use trip_trace_conflation::osm_preprocessing::NetworkKind;
use trip_trace_conflation::projection::{lonlat_to_web_mercator, web_mercator_to_lonlat};
use trip_trace_conflation::road_network::{EdgeAttributes, EdgeId, Junction, RoadEdge, RoadNetwork};
use trip_trace_conflation::trip_builder::Trace;

/// Junction spacing of the test grid, in metres.
pub const SPACING: f64 = 200.0;

/// South-west corner of the grid, in San Jose.
pub fn origin() -> Coord<f64> {
    lonlat_to_web_mercator(Coord { x: -121.89, y: 37.33 })
}

/// Projected position `dx`, `dy` metres from the grid origin.
pub fn at(dx: f64, dy: f64) -> Coord<f64> {
    let o = origin();
    Coord { x: o.x + dx, y: o.y + dy }
}

/// Junction id at `row`, `col` of the 3x3 grid.
pub fn junction(row: u64, col: u64) -> u64 {
    row * 3 + col + 1
}

pub fn edge(origin: u64, destination: u64) -> EdgeId {
    EdgeId::new(origin, destination, 0)
}

/// A 3x3 grid of two-way streets 200 m apart. The southern row is a motorway.
pub fn city_grid() -> RoadNetwork {
    let junctions: Vec<Junction> = (0..3u64)
        .flat_map(|row| (0..3u64).map(move |col| (row, col)))
        .map(|(row, col)| {
            let position = at(col as f64 * SPACING, row as f64 * SPACING);
            Junction {
                id: junction(row, col),
                lonlat: web_mercator_to_lonlat(position),
                position,
            }
        })
        .collect();

    let position = |id: u64| junctions[(id - 1) as usize].position;
    let mut edges = Vec::new();
    let mut link = |a: u64, b: u64, highway: &str| {
        for (o, d) in [(a, b), (b, a)] {
            edges.push(RoadEdge {
                id: edge(o, d),
                geometry: LineString::from(vec![position(o), position(d)]),
                attributes: EdgeAttributes {
                    osm_ids: vec![500 + a.min(b) * 10 + a.max(b)],
                    name: Some(format!("{} {}-{}", highway, a.min(b), a.max(b))),
                    highway: Some(highway.to_string()),
                    length_m: SPACING,
                    ..Default::default()
                },
            });
        }
    };
    for row in 0..3u64 {
        for col in 0..3u64 {
            let id = junction(row, col);
            if col < 2 {
                link(id, id + 1, if row == 0 { "motorway" } else { "residential" });
            }
            if row < 2 {
                link(id, id + 3, "residential");
            }
        }
    }
    RoadNetwork::from_parts(NetworkKind::Drive, junctions, edges).expect("valid grid")
}

/// A region comfortably enclosing the grid.
pub fn region() -> Geofence {
    Geofence::from_projected_points(&[at(0.0, 0.0), at(2.0 * SPACING, 2.0 * SPACING)], 500.0)
        .expect("valid region")
}

/// A trace through projected offsets from the grid origin.
pub fn trace(id: &str, offsets: &[(f64, f64)]) -> Trace {
    Trace::from_projected(id, offsets.iter().map(|&(dx, dy)| at(dx, dy))).expect("valid trace")
}

/// Points every 20 m along the southern row, 3 m north of it.
pub fn motorway_trip(id: &str) -> Trace {
    let offsets: Vec<(f64, f64)> = (0..20).map(|i| (10.0 + 20.0 * i as f64, 3.0)).collect();
    trace(id, &offsets)
}

/// Points every 20 m along the northern row, 3 m south of it.
pub fn northern_trip(id: &str) -> Trace {
    let offsets: Vec<(f64, f64)> = (0..20).map(|i| (10.0 + 20.0 * i as f64, 2.0 * SPACING - 3.0)).collect();
    trace(id, &offsets)
}

/// A trip far outside the grid.
pub fn distant_trip(id: &str) -> Trace {
    trace(id, &[(40_000.0, 40_000.0), (40_020.0, 40_000.0), (40_040.0, 40_000.0)])
}
