use geo::{Distance as _, Haversine, Point};
use ordered_float::OrderedFloat;
use petgraph::algo::astar;
use petgraph::visit::EdgeRef;

use crate::road_network::{EdgeId, RoadNetwork};

/// Shortest edge sequence from junction `from` to junction `to`, by length.
///
/// A* over the junction graph with a great-circle heuristic, which never
/// exceeds the summed segment lengths. Returns an empty path when `from == to`
/// and `None` when `to` is unreachable.
pub fn shortest_path(network: &RoadNetwork, from: u64, to: u64) -> Option<Vec<EdgeId>> {
    if from == to {
        return Some(Vec::new());
    }
    let graph = network.graph();
    if !graph.contains_node(from) || !graph.contains_node(to) {
        return None;
    }
    let goal = Point::from(network.junction(to)?.lonlat);

    let (_, nodes) = astar(
        graph,
        from,
        |n| n == to,
        |e| *e.weight(),
        |n| {
            network
                .junction(n)
                .map(|j| Haversine.distance(Point::from(j.lonlat), goal))
                .unwrap_or(0.0)
        },
    )?;
    resolve_node_path(network, &nodes)
}

/// Turn a junction sequence into edges, taking the shortest of any parallel
/// edges and then the smallest identifier.
pub fn resolve_node_path(network: &RoadNetwork, nodes: &[u64]) -> Option<Vec<EdgeId>> {
    nodes
        .windows(2)
        .map(|w| {
            network
                .edges_between(w[0], w[1])
                .min_by_key(|e| (OrderedFloat(e.attributes.length_m), e.id))
                .map(|e| e.id)
        })
        .collect()
}

/// Total length in metres of a path; unknown edges count as zero.
pub fn path_length(network: &RoadNetwork, path: &[EdgeId]) -> f64 {
    path.iter()
        .filter_map(|id| network.edge(id))
        .map(|e| e.attributes.length_m)
        .sum()
}

/// Whether each edge of `path` starts where the previous one ends.
pub fn is_connected(path: &[EdgeId]) -> bool {
    path.windows(2).all(|w| w[0].destination == w[1].origin)
}
