use geo::{Coord, Distance, Haversine, LineString, Point};
use log::{debug, info, warn};
use osmpbf::{Element, ElementReader};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use crate::error::ConflationError;
use crate::geofence::Geofence;
use crate::projection::{is_valid_lonlat, lonlat_to_web_mercator};
use crate::road_network::{EdgeAttributes, EdgeId, Junction, RoadEdge, RoadNetwork};

/// Which class of ways make up a network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    /// Public drivable roads, excluding service roads
    #[default]
    Drive,
    /// Drivable roads including service roads
    DriveService,
    /// Everything pedestrians may use; always two-way
    Walk,
    /// Every non-area highway
    All,
}

// Road classes excluded for each network kind, mirroring the usual OSM extract filters
const DRIVE_EXCLUDED: &[&str] = &[
    "abandoned",
    "bridleway",
    "bus_guideway",
    "construction",
    "corridor",
    "cycleway",
    "elevator",
    "escalator",
    "footway",
    "no",
    "path",
    "pedestrian",
    "planned",
    "platform",
    "proposed",
    "raceway",
    "razed",
    "service",
    "steps",
    "track",
];
const WALK_EXCLUDED: &[&str] = &[
    "abandoned",
    "bus_guideway",
    "construction",
    "cycleway",
    "motor",
    "motorway",
    "motorway_link",
    "no",
    "planned",
    "platform",
    "proposed",
    "raceway",
    "razed",
];
const ALL_EXCLUDED: &[&str] = &[
    "abandoned",
    "construction",
    "no",
    "planned",
    "platform",
    "proposed",
    "raceway",
    "razed",
];
const EXCLUDED_SERVICES: &[&str] = &[
    "alley",
    "driveway",
    "emergency_access",
    "parking",
    "parking_aisle",
    "private",
];

impl NetworkKind {
    /// Whether a way with these tags belongs to this kind of network.
    pub fn accepts(&self, tags: &BTreeMap<String, String>) -> bool {
        let Some(highway) = tags.get("highway") else {
            return false;
        };
        if tags.get("area").map(String::as_str) == Some("yes") {
            return false;
        }
        let tag = |k: &str| tags.get(k).map(String::as_str);
        match self {
            NetworkKind::Drive | NetworkKind::DriveService => {
                let excluded = DRIVE_EXCLUDED
                    .iter()
                    .filter(|h| !(matches!(self, NetworkKind::DriveService) && **h == "service"))
                    .any(|h| *h == highway.as_str());
                !excluded
                    && tag("access") != Some("private")
                    && tag("motor_vehicle") != Some("no")
                    && tag("motorcar") != Some("no")
                    && !tag("service").is_some_and(|s| EXCLUDED_SERVICES.contains(&s))
            }
            NetworkKind::Walk => {
                !WALK_EXCLUDED.contains(&highway.as_str())
                    && tag("foot") != Some("no")
                    && tag("service") != Some("private")
            }
            NetworkKind::All => !ALL_EXCLUDED.contains(&highway.as_str()),
        }
    }

    /// Walk networks ignore one-way restrictions.
    pub fn ignores_oneway(&self) -> bool {
        matches!(self, NetworkKind::Walk)
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkKind::Drive => "drive",
            NetworkKind::DriveService => "drive_service",
            NetworkKind::Walk => "walk",
            NetworkKind::All => "all",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for NetworkKind {
    type Err = ConflationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drive" => Ok(NetworkKind::Drive),
            "drive_service" => Ok(NetworkKind::DriveService),
            "walk" => Ok(NetworkKind::Walk),
            "all" => Ok(NetworkKind::All),
            other => Err(ConflationError::Config(format!(
                "unknown network kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
    Both,
}

fn travel_direction(tags: &BTreeMap<String, String>, kind: NetworkKind) -> Direction {
    if kind.ignores_oneway() {
        return Direction::Both;
    }
    match tags.get("oneway").map(String::as_str) {
        Some("yes") | Some("true") | Some("1") => return Direction::Forward,
        Some("-1") | Some("reverse") => return Direction::Reverse,
        Some("no") | Some("false") | Some("0") => return Direction::Both,
        _ => {}
    }
    let highway = tags.get("highway").map(String::as_str);
    let junction = tags.get("junction").map(String::as_str);
    if highway == Some("motorway") || junction == Some("roundabout") {
        Direction::Forward
    } else {
        Direction::Both
    }
}

/// A highway way as read from OSM.
#[derive(Debug, Clone)]
pub struct OsmWay {
    pub id: u64,
    pub nodes: Vec<u64>,
    pub tags: BTreeMap<String, String>,
}

/// Accumulates OSM nodes and ways and turns them into a routable [`RoadNetwork`].
///
/// Ways are split at junctions (way endpoints and nodes shared between ways);
/// two-way roads get a reverse edge, and parallel edges between the same
/// junctions receive increasing keys.
pub struct NetworkBuilder {
    kind: NetworkKind,
    nodes: HashMap<u64, Coord<f64>>,
    ways: Vec<OsmWay>,
}

impl NetworkBuilder {
    pub fn new(kind: NetworkKind) -> Self {
        Self {
            kind,
            nodes: HashMap::new(),
            ways: Vec::new(),
        }
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn add_node(&mut self, id: u64, lon: f64, lat: f64) {
        let c = Coord { x: lon, y: lat };
        if is_valid_lonlat(c) {
            self.nodes.insert(id, c);
        }
    }

    /// Add a way; returns false when the way is not part of this network kind.
    pub fn add_way(&mut self, id: u64, nodes: Vec<u64>, tags: BTreeMap<String, String>) -> bool {
        if nodes.len() < 2 || !self.kind.accepts(&tags) {
            return false;
        }
        self.ways.push(OsmWay { id, nodes, tags });
        true
    }

    /// Node ids referenced by accepted ways.
    pub fn referenced_nodes(&self) -> HashSet<u64> {
        self.ways.iter().flat_map(|w| w.nodes.iter().copied()).collect()
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    pub fn build(mut self) -> Result<RoadNetwork, ConflationError> {
        let start = Instant::now();
        self.ways.sort_by_key(|w| w.id);

        // Drop references to nodes we never saw coordinates for
        for way in &mut self.ways {
            way.nodes.retain(|n| self.nodes.contains_key(n));
        }
        self.ways.retain(|w| w.nodes.len() >= 2);

        let mut usage: HashMap<u64, usize> = HashMap::new();
        let mut endpoints: HashSet<u64> = HashSet::new();
        for way in &self.ways {
            for n in &way.nodes {
                *usage.entry(*n).or_default() += 1;
            }
            if let (Some(first), Some(last)) = (way.nodes.first(), way.nodes.last()) {
                endpoints.insert(*first);
                endpoints.insert(*last);
            }
        }
        let is_junction = |n: &u64| endpoints.contains(n) || usage.get(n).copied().unwrap_or(0) > 1;

        let mut junctions: BTreeMap<u64, Junction> = BTreeMap::new();
        let mut keys: BTreeMap<(u64, u64), u32> = BTreeMap::new();
        let mut edges: Vec<RoadEdge> = Vec::new();

        for way in &self.ways {
            let direction = travel_direction(&way.tags, self.kind);
            let attributes = way_attributes(way);

            let mut piece_start = 0;
            for i in 1..way.nodes.len() {
                if !is_junction(&way.nodes[i]) && i != way.nodes.len() - 1 {
                    continue;
                }
                let piece = &way.nodes[piece_start..=i];
                piece_start = i;

                let lonlat: Vec<Coord<f64>> = piece.iter().map(|n| self.nodes[n]).collect();
                let length_m = lonlat
                    .windows(2)
                    .map(|w| Haversine.distance(Point::from(w[0]), Point::from(w[1])))
                    .sum::<f64>();
                let projected: LineString<f64> =
                    lonlat.iter().map(|c| lonlat_to_web_mercator(*c)).collect();

                let (first, last) = (piece[0], piece[piece.len() - 1]);
                for n in [first, last] {
                    junctions
                        .entry(n)
                        .or_insert_with(|| Junction::from_lonlat(n, self.nodes[&n]));
                }

                let mut push = |o: u64, d: u64, geometry: LineString<f64>| {
                    let key = keys.entry((o, d)).or_insert(0);
                    edges.push(RoadEdge {
                        id: EdgeId::new(o, d, *key),
                        geometry,
                        attributes: EdgeAttributes {
                            length_m,
                            ..attributes.clone()
                        },
                    });
                    *key += 1;
                };
                if matches!(direction, Direction::Forward | Direction::Both) {
                    push(first, last, projected.clone());
                }
                if matches!(direction, Direction::Reverse | Direction::Both) {
                    let mut reversed = projected.clone();
                    reversed.0.reverse();
                    push(last, first, reversed);
                }
            }
        }

        debug!(
            "Built {} edges between {} junctions from {} ways in {:?}",
            edges.len(),
            junctions.len(),
            self.ways.len(),
            start.elapsed()
        );
        RoadNetwork::from_parts(self.kind, junctions.into_values(), edges)
    }
}

fn way_attributes(way: &OsmWay) -> EdgeAttributes {
    let tag = |k: &str| way.tags.get(k).cloned();
    EdgeAttributes {
        osm_ids: vec![way.id],
        name: tag("name"),
        highway: tag("highway"),
        max_speed: tag("maxspeed"),
        bridge: tag("bridge"),
        tunnel: tag("tunnel"),
        reference: tag("ref"),
        length_m: 0.0,
    }
}

/// Read the highway network of a region from a local OSM PBF extract.
///
/// Two passes over the file: the first collects accepted ways, the second the
/// coordinates of the nodes they reference. The result is clipped to `region`.
pub fn read_pbf(path: &Path, region: &Geofence, kind: NetworkKind) -> Result<RoadNetwork, ConflationError> {
    let start = Instant::now();
    info!("Step 1: Reading {} ways from {}", kind, path.display());

    let mut builder = NetworkBuilder::new(kind);
    let mut skipped = 0usize;
    ElementReader::from_path(path)?.for_each(|element| {
        if let Element::Way(way) = element {
            let tags: BTreeMap<String, String> = way
                .tags()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let nodes = way.refs().map(|id| id as u64).collect();
            if !builder.add_way(way.id() as u64, nodes, tags) {
                skipped += 1;
            }
        }
    })?;
    debug!(
        "Kept {} ways, skipped {} in {:?}",
        builder.way_count(),
        skipped,
        start.elapsed()
    );

    info!("Step 2: Resolving node coordinates");
    let wanted = builder.referenced_nodes();
    let mut coords: Vec<(u64, f64, f64)> = Vec::with_capacity(wanted.len());
    ElementReader::from_path(path)?.for_each(|element| match element {
        Element::Node(node) if wanted.contains(&(node.id() as u64)) => {
            coords.push((node.id() as u64, node.lon(), node.lat()));
        }
        Element::DenseNode(node) if wanted.contains(&(node.id() as u64)) => {
            coords.push((node.id() as u64, node.lon(), node.lat()));
        }
        _ => {}
    })?;
    for (id, lon, lat) in coords {
        builder.add_node(id, lon, lat);
    }

    info!("Step 3: Building and clipping the road graph");
    let network = builder.build()?;
    let clipped = network.extract_subgraph(region);
    if clipped.is_empty() {
        warn!("No {} roads found inside the region in {}", kind, path.display());
    }
    info!(
        "Read {} edges from {} in {:?}",
        clipped.edge_count(),
        path.display(),
        start.elapsed()
    );
    Ok(clipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn drive_filter_excludes_footways_and_parking_aisles() {
        let drive = NetworkKind::Drive;
        assert!(drive.accepts(&tags(&[("highway", "primary")])));
        assert!(!drive.accepts(&tags(&[("highway", "footway")])));
        assert!(!drive.accepts(&tags(&[("highway", "service")])));
        assert!(!drive.accepts(&tags(&[("highway", "residential"), ("access", "private")])));
        assert!(NetworkKind::DriveService.accepts(&tags(&[("highway", "service")])));
        assert!(
            !NetworkKind::DriveService
                .accepts(&tags(&[("highway", "service"), ("service", "parking_aisle")]))
        );
        assert!(!drive.accepts(&tags(&[("building", "yes")])));
    }

    #[test]
    fn walk_filter_keeps_footways() {
        assert!(NetworkKind::Walk.accepts(&tags(&[("highway", "footway")])));
        assert!(!NetworkKind::Walk.accepts(&tags(&[("highway", "motorway")])));
    }

    #[test]
    fn kind_parses_from_config_strings() {
        assert_eq!("drive".parse::<NetworkKind>().unwrap(), NetworkKind::Drive);
        assert_eq!(NetworkKind::DriveService.to_string(), "drive_service");
        assert!("bike".parse::<NetworkKind>().is_err());
    }

    /// Two ways crossing at node 3:
    ///
    /// ```text
    ///        4
    ///        |
    ///  1 --- 3 --- 2      (way 10, two-way, nodes 1-3-2)
    ///        |
    ///        5            (way 20, oneway, nodes 5-3-4)
    /// ```
    fn crossing_builder() -> NetworkBuilder {
        let mut b = NetworkBuilder::new(NetworkKind::Drive);
        b.add_node(1, -97.7020, 30.2700);
        b.add_node(2, -97.6980, 30.2700);
        b.add_node(3, -97.7000, 30.2700);
        b.add_node(4, -97.7000, 30.2720);
        b.add_node(5, -97.7000, 30.2680);
        b.add_way(
            10,
            vec![1, 3, 2],
            tags(&[("highway", "residential"), ("name", "Main St")]),
        );
        b.add_way(
            20,
            vec![5, 3, 4],
            tags(&[("highway", "primary"), ("oneway", "yes"), ("ref", "TX 1")]),
        );
        b
    }

    #[test]
    fn ways_split_at_shared_nodes() {
        let network = crossing_builder().build().unwrap();
        // Way 10 becomes 1-3 and 3-2 in both directions, way 20 becomes 5-3 and 3-4 forward only
        assert_eq!(network.edge_count(), 6);
        assert_eq!(network.junction_count(), 5);
        assert!(network.edge(&EdgeId::new(1, 3, 0)).is_some());
        assert!(network.edge(&EdgeId::new(3, 1, 0)).is_some());
        assert!(network.edge(&EdgeId::new(5, 3, 0)).is_some());
        assert!(network.edge(&EdgeId::new(3, 5, 0)).is_none());
    }

    #[test]
    fn edge_attributes_come_from_tags() {
        let network = crossing_builder().build().unwrap();
        let edge = network.edge(&EdgeId::new(3, 4, 0)).unwrap();
        assert_eq!(edge.attributes.osm_ids, vec![20]);
        assert_eq!(edge.attributes.reference.as_deref(), Some("TX 1"));
        assert_eq!(edge.attributes.highway.as_deref(), Some("primary"));
        // Roughly 0.002 degrees of latitude
        assert!((edge.attributes.length_m - 222.4).abs() < 1.0);
    }

    #[test]
    fn reverse_oneway_flips_direction() {
        let mut b = NetworkBuilder::new(NetworkKind::Drive);
        b.add_node(1, 0.0, 0.0);
        b.add_node(2, 0.001, 0.0);
        b.add_way(1, vec![1, 2], tags(&[("highway", "primary"), ("oneway", "-1")]));
        let network = b.build().unwrap();
        assert!(network.edge(&EdgeId::new(2, 1, 0)).is_some());
        assert!(network.edge(&EdgeId::new(1, 2, 0)).is_none());
    }

    #[test]
    fn parallel_ways_get_distinct_keys() {
        let mut b = NetworkBuilder::new(NetworkKind::Drive);
        b.add_node(1, 0.0, 0.0);
        b.add_node(2, 0.001, 0.0);
        b.add_node(3, 0.0005, 0.0002);
        b.add_way(1, vec![1, 2], tags(&[("highway", "primary"), ("oneway", "yes")]));
        b.add_way(2, vec![1, 3, 2], tags(&[("highway", "primary"), ("oneway", "yes")]));
        let network = b.build().unwrap();
        assert!(network.edge(&EdgeId::new(1, 2, 0)).is_some());
        assert!(network.edge(&EdgeId::new(1, 2, 1)).is_some());
    }

    #[test]
    fn ways_with_missing_nodes_are_trimmed() {
        let mut b = NetworkBuilder::new(NetworkKind::Drive);
        b.add_node(1, 0.0, 0.0);
        b.add_way(1, vec![1, 99], tags(&[("highway", "primary")]));
        let network = b.build().unwrap();
        assert!(network.is_empty());
    }
}
