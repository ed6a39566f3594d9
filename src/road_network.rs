use geo::{Closest, ClosestPoint, Coord, Distance, Euclidean, Intersects, LineString, Point};
use log::debug;
use ordered_float::OrderedFloat;
use petgraph::graphmap::DiGraphMap;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use crate::error::ConflationError;
use crate::geofence::Geofence;
use crate::osm_preprocessing::NetworkKind;
use crate::projection::lonlat_to_web_mercator;

/// Identifier of a directed road segment: origin junction, destination junction
/// and a key distinguishing parallel segments between the same junctions.
///
/// Ordered lexicographically; "smallest edge" always refers to this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId {
    pub origin: u64,
    pub destination: u64,
    pub key: u32,
}

impl EdgeId {
    pub fn new(origin: u64, destination: u64, key: u32) -> Self {
        Self {
            origin,
            destination,
            key,
        }
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.origin, self.destination, self.key)
    }
}

/// A graph vertex, stored in both lon/lat and projected metres.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Junction {
    pub id: u64,
    pub lonlat: Coord<f64>,
    pub position: Coord<f64>,
}

impl Junction {
    pub fn from_lonlat(id: u64, lonlat: Coord<f64>) -> Self {
        Self {
            id,
            lonlat,
            position: lonlat_to_web_mercator(lonlat),
        }
    }
}

/// OSM-derived metadata carried by every road segment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttributes {
    /// OSM way ids that contributed to this segment
    pub osm_ids: Vec<u64>,
    pub name: Option<String>,
    /// Road class (`highway` tag)
    pub highway: Option<String>,
    /// Speed limit as tagged, e.g. "65 mph"
    pub max_speed: Option<String>,
    pub bridge: Option<String>,
    pub tunnel: Option<String>,
    /// Route reference code (`ref` tag), e.g. "I 35"
    pub reference: Option<String>,
    /// Great-circle length in metres
    pub length_m: f64,
}

impl EdgeAttributes {
    /// Speed limit in km/h, converting from mph where tagged.
    pub fn max_speed_kph(&self) -> Option<f64> {
        let v = self.max_speed.as_deref()?.trim();
        if let Some(mph) = v.strip_suffix("mph") {
            mph.trim().parse::<f64>().ok().map(|mph| mph * 1.60934)
        } else if let Some(kph) = v.strip_suffix("km/h") {
            kph.trim().parse::<f64>().ok()
        } else {
            v.parse::<f64>().ok()
        }
    }
}

/// A directed road segment with its projected geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoadEdge {
    pub id: EdgeId,
    /// Web Mercator polyline running from origin to destination
    pub geometry: LineString<f64>,
    pub attributes: EdgeAttributes,
}

type IndexedEdge = GeomWithData<Rectangle<[f64; 2]>, EdgeId>;

/// On-disk form of a network; indexes are rebuilt after loading.
#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub format_version: u32,
    pub kind: NetworkKind,
    pub junctions: Vec<Junction>,
    pub edges: Vec<RoadEdge>,
}

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A read-only, directed road graph with a spatial index over its edges.
///
/// Each worker owns its own instance; nothing in here is shared.
#[derive(Debug, Clone)]
pub struct RoadNetwork {
    kind: NetworkKind,
    junctions: BTreeMap<u64, Junction>,
    edges: BTreeMap<EdgeId, RoadEdge>,
    graph: DiGraphMap<u64, f64>,
    index: RTree<IndexedEdge>,
}

impl RoadNetwork {
    /// Assemble a network from junctions and edges, validating that every edge
    /// references known junctions and has a usable geometry.
    pub fn from_parts(
        kind: NetworkKind,
        junctions: impl IntoIterator<Item = Junction>,
        edges: impl IntoIterator<Item = RoadEdge>,
    ) -> Result<Self, ConflationError> {
        let junctions: BTreeMap<u64, Junction> =
            junctions.into_iter().map(|j| (j.id, j)).collect();

        let mut edge_map = BTreeMap::new();
        for edge in edges {
            if !junctions.contains_key(&edge.id.origin)
                || !junctions.contains_key(&edge.id.destination)
            {
                return Err(ConflationError::MalformedGeometry(format!(
                    "edge {} references an unknown junction",
                    edge.id
                )));
            }
            if edge.geometry.0.len() < 2
                || edge
                    .geometry
                    .0
                    .iter()
                    .any(|c| !c.x.is_finite() || !c.y.is_finite())
            {
                return Err(ConflationError::MalformedGeometry(format!(
                    "edge {} has a degenerate geometry",
                    edge.id
                )));
            }
            edge_map.insert(edge.id, edge);
        }

        Ok(Self::index(kind, junctions, edge_map))
    }

    fn index(
        kind: NetworkKind,
        junctions: BTreeMap<u64, Junction>,
        edges: BTreeMap<EdgeId, RoadEdge>,
    ) -> Self {
        let mut graph = DiGraphMap::new();
        for id in junctions.keys() {
            graph.add_node(*id);
        }
        for edge in edges.values() {
            let weight = edge.attributes.length_m;
            // Parallel edges collapse onto one graph arc carrying the shortest length
            match graph.edge_weight_mut(edge.id.origin, edge.id.destination) {
                Some(w) if *w <= weight => {}
                Some(w) => *w = weight,
                None => {
                    graph.add_edge(edge.id.origin, edge.id.destination, weight);
                }
            }
        }

        let entries: Vec<IndexedEdge> = edges
            .values()
            .map(|edge| {
                let (lower, upper) = envelope_corners(&edge.geometry);
                GeomWithData::new(Rectangle::from_corners(lower, upper), edge.id)
            })
            .collect();

        Self {
            kind,
            junctions,
            edges,
            graph,
            index: RTree::bulk_load(entries),
        }
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn junction_count(&self) -> usize {
        self.junctions.len()
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&RoadEdge> {
        self.edges.get(id)
    }

    pub fn junction(&self, id: u64) -> Option<&Junction> {
        self.junctions.get(&id)
    }

    /// Edges in ascending identifier order.
    pub fn edges(&self) -> impl Iterator<Item = &RoadEdge> {
        self.edges.values()
    }

    pub fn edge_ids(&self) -> BTreeSet<EdgeId> {
        self.edges.keys().copied().collect()
    }

    pub(crate) fn graph(&self) -> &DiGraphMap<u64, f64> {
        &self.graph
    }

    /// All parallel edges running from `origin` to `destination`.
    pub fn edges_between(&self, origin: u64, destination: u64) -> impl Iterator<Item = &RoadEdge> {
        self.edges
            .range(EdgeId::new(origin, destination, 0)..=EdgeId::new(origin, destination, u32::MAX))
            .map(|(_, e)| e)
    }

    /// Planar distance from a projected point to an edge, infinite if the edge is unknown.
    pub fn distance_to_edge(&self, point: Point<f64>, id: &EdgeId) -> f64 {
        match self.edges.get(id) {
            Some(edge) => distance_to_line(point, &edge.geometry),
            None => f64::INFINITY,
        }
    }

    /// Edges within `radius` metres of `point`, nearest first, ties by identifier.
    pub fn candidates_within(&self, point: Point<f64>, radius: f64) -> Vec<(EdgeId, f64)> {
        if !radius.is_finite() || radius < 0.0 {
            return Vec::new();
        }
        let envelope = AABB::from_corners(
            [point.x() - radius, point.y() - radius],
            [point.x() + radius, point.y() + radius],
        );
        let mut candidates: Vec<(EdgeId, f64)> = self
            .index
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|entry| {
                let d = self.distance_to_edge(point, &entry.data);
                (d <= radius).then_some((entry.data, d))
            })
            .collect();
        candidates.sort_by_key(|(id, d)| (OrderedFloat(*d), *id));
        candidates
    }

    /// Nearest edge to `point` with its distance; ties go to the smallest identifier.
    pub fn nearest_edge(&self, point: Point<f64>) -> Option<(EdgeId, f64)> {
        self.nearest_edges(point, 0.0).into_iter().next()
    }

    /// Every edge whose distance is within `tolerance` of the nearest one, nearest first.
    pub fn nearest_edges(&self, point: Point<f64>, tolerance: f64) -> Vec<(EdgeId, f64)> {
        let mut best = f64::INFINITY;
        let mut found: Vec<(EdgeId, f64)> = Vec::new();
        let query = [point.x(), point.y()];
        for (entry, envelope_d2) in self.index.nearest_neighbor_iter_with_distance_2(&query) {
            // Envelope distance is a lower bound on the exact distance
            if envelope_d2.sqrt() > best + tolerance {
                break;
            }
            let d = self.distance_to_edge(point, &entry.data);
            if d < best {
                best = d;
            }
            found.push((entry.data, d));
        }
        found.retain(|(_, d)| *d <= best + tolerance);
        found.sort_by_key(|(id, d)| (OrderedFloat(*d), *id));
        found
    }

    /// Edges whose envelope intersects the given projected rectangle.
    pub fn edges_in_envelope(&self, lower: [f64; 2], upper: [f64; 2]) -> Vec<EdgeId> {
        let envelope = AABB::from_corners(lower, upper);
        let mut ids: Vec<EdgeId> = self
            .index
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.data)
            .collect();
        ids.sort();
        ids
    }

    /// Restrict the network to edges intersecting `fence`.
    ///
    /// The fence is in lon/lat and is projected before the intersection test.
    /// Identifiers are preserved, so extracting twice with the same fence is a no-op.
    pub fn extract_subgraph(&self, fence: &Geofence) -> RoadNetwork {
        let start = Instant::now();
        let projected = fence.projected();

        let mut keep: BTreeSet<EdgeId> = BTreeSet::new();
        for polygon in &projected.0 {
            let Some((lower, upper)) = polygon_corners(polygon) else {
                continue;
            };
            for id in self.edges_in_envelope(lower, upper) {
                if keep.contains(&id) {
                    continue;
                }
                if let Some(edge) = self.edges.get(&id) {
                    if polygon.intersects(&edge.geometry) {
                        keep.insert(id);
                    }
                }
            }
        }

        let edges: BTreeMap<EdgeId, RoadEdge> = keep
            .iter()
            .filter_map(|id| self.edges.get(id).map(|e| (*id, e.clone())))
            .collect();
        let junctions: BTreeMap<u64, Junction> = edges
            .keys()
            .flat_map(|id| [id.origin, id.destination])
            .filter_map(|j| self.junctions.get(&j).map(|junction| (j, junction.clone())))
            .collect();

        debug!(
            "Extracted subgraph with {} of {} edges in {:?}",
            edges.len(),
            self.edges.len(),
            start.elapsed()
        );
        Self::index(self.kind, junctions, edges)
    }

    pub fn to_snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            kind: self.kind,
            junctions: self.junctions.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: NetworkSnapshot) -> Result<Self, ConflationError> {
        Self::from_parts(snapshot.kind, snapshot.junctions, snapshot.edges)
    }
}

pub(crate) fn distance_to_line(point: Point<f64>, line: &LineString<f64>) -> f64 {
    match line.closest_point(&point) {
        Closest::SinglePoint(p) | Closest::Intersection(p) => Euclidean.distance(point, p),
        Closest::Indeterminate => f64::INFINITY,
    }
}

/// Projection of `point` onto `line`, falling back to the point itself.
pub(crate) fn project_onto_line(point: Point<f64>, line: &LineString<f64>) -> Coord<f64> {
    match line.closest_point(&point) {
        Closest::SinglePoint(p) | Closest::Intersection(p) => p.0,
        Closest::Indeterminate => point.0,
    }
}

fn envelope_corners(line: &LineString<f64>) -> ([f64; 2], [f64; 2]) {
    let mut lower = [f64::MAX, f64::MAX];
    let mut upper = [f64::MIN, f64::MIN];
    for c in &line.0 {
        lower[0] = lower[0].min(c.x);
        lower[1] = lower[1].min(c.y);
        upper[0] = upper[0].max(c.x);
        upper[1] = upper[1].max(c.y);
    }
    (lower, upper)
}

fn polygon_corners(polygon: &geo::Polygon<f64>) -> Option<([f64; 2], [f64; 2])> {
    if polygon.exterior().0.is_empty() {
        return None;
    }
    Some(envelope_corners(polygon.exterior()))
}
