use geo::{Coord, Distance, Euclidean, Point};
use ordered_float::OrderedFloat;
use std::collections::BTreeSet;

use super::PointMatch;
use crate::error::ConflationError;
use crate::road_network::{EdgeId, RoadNetwork};
use crate::routing;

/// Points closer than this (m) to their predecessor are treated as stationary.
const STATIONARY_DISTANCE: f64 = 0.001;

/// Distance difference (m) under which two nearest edges count as tied.
const TIE_TOLERANCE: f64 = 1e-6;

/// A run of consecutive indices that share the same position.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StationaryIndex {
    pub(crate) i_index: Vec<usize>,
}

pub(crate) fn find_stationary_points(points: &[Coord<f64>]) -> Vec<StationaryIndex> {
    let mut collections = Vec::new();
    let mut current: Vec<usize> = Vec::new();

    for i in 1..points.len() {
        let d = Euclidean.distance(Point::from(points[i - 1]), Point::from(points[i]));
        if d < STATIONARY_DISTANCE {
            if current.is_empty() {
                current.push(i - 1);
            }
            current.push(i);
        } else if !current.is_empty() {
            collections.push(StationaryIndex {
                i_index: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        collections.push(StationaryIndex { i_index: current });
    }
    collections
}

/// Indices removed before matching: every member of a stationary run but its first.
pub(crate) fn skipped_indices(stationary: &[StationaryIndex]) -> BTreeSet<usize> {
    stationary
        .iter()
        .flat_map(|s| s.i_index[1..].iter().copied())
        .collect()
}

/// Re-insert matches for the removed stationary points, each repeating the
/// match of the point it duplicates.
pub(crate) fn add_matches_for_stationary_points(
    matches: Vec<PointMatch>,
    stationary: &[StationaryIndex],
) -> Vec<PointMatch> {
    let skipped = skipped_indices(stationary);
    let original_len = matches.len() + skipped.len();

    let mut result: Vec<PointMatch> = Vec::with_capacity(original_len);
    let mut moving = matches.into_iter();
    for i in 0..original_len {
        if skipped.contains(&i) {
            if let Some(last) = result.last().copied() {
                result.push(last);
            }
        } else if let Some(m) = moving.next() {
            result.push(m);
        }
    }
    result
}

/// Candidate path for a run of points: the edge nearest the first point, a
/// shortest route, and the edge nearest the last point.
///
/// When several edges tie for nearest (e.g. both directions of a two-way
/// street), every combination is routed and the shortest path wins, then the
/// smallest origin and destination identifiers.
pub(crate) fn new_path_for_points(
    points: &[Coord<f64>],
    network: &RoadNetwork,
) -> Result<Vec<EdgeId>, ConflationError> {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return Err(ConflationError::MalformedGeometry(
            "cannot route an empty run of points".to_string(),
        ));
    };
    let origins = network.nearest_edges(Point::from(*first), TIE_TOLERANCE);
    let destinations = network.nearest_edges(Point::from(*last), TIE_TOLERANCE);
    if origins.is_empty() || destinations.is_empty() {
        return Err(ConflationError::UnmatchableTrace(
            "network has no edges".to_string(),
        ));
    }

    let mut best: Option<((OrderedFloat<f64>, EdgeId, EdgeId), Vec<EdgeId>)> = None;
    for (o, _) in &origins {
        for (d, _) in &destinations {
            let Some(path) = path_between(network, *o, *d) else {
                continue;
            };
            let key = (OrderedFloat(routing::path_length(network, &path)), *o, *d);
            if best.as_ref().is_none_or(|(k, _)| key < *k) {
                best = Some((key, path));
            }
        }
    }

    best.map(|(_, path)| path).ok_or_else(|| {
        ConflationError::UnmatchableTrace(format!(
            "no route from edge {} to edge {}",
            origins[0].0, destinations[0].0
        ))
    })
}

fn path_between(network: &RoadNetwork, origin: EdgeId, destination: EdgeId) -> Option<Vec<EdgeId>> {
    if origin == destination {
        return Some(vec![origin]);
    }
    let mut path = vec![origin];
    path.extend(routing::shortest_path(
        network,
        origin.destination,
        destination.origin,
    )?);
    path.push(destination);
    path.dedup();
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road_network::tests::grid_network;

    #[test]
    fn stationary_runs_are_detected() {
        let p = |x: f64| Coord { x, y: 0.0 };
        let points = vec![p(0.0), p(10.0), p(10.0), p(10.0), p(20.0), p(20.0)];
        let runs = find_stationary_points(&points);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].i_index, vec![1, 2, 3]);
        assert_eq!(runs[1].i_index, vec![4, 5]);
        assert_eq!(
            skipped_indices(&runs).into_iter().collect::<Vec<_>>(),
            vec![2, 3, 5]
        );
    }

    #[test]
    fn stationary_matches_repeat_their_anchor() {
        let runs = vec![StationaryIndex {
            i_index: vec![1, 2],
        }];
        let a = PointMatch {
            edge: Some(EdgeId::new(1, 2, 0)),
            distance: 1.0,
        };
        let b = PointMatch {
            edge: Some(EdgeId::new(2, 3, 0)),
            distance: 2.0,
        };
        let c = PointMatch {
            edge: Some(EdgeId::new(3, 6, 0)),
            distance: 3.0,
        };
        let expanded = add_matches_for_stationary_points(vec![a, b, c], &runs);
        assert_eq!(expanded, vec![a, b, b, c]);
    }

    #[test]
    fn single_edge_trace_gets_single_edge_path() {
        let network = grid_network();
        let points = vec![Coord { x: 20.0, y: 3.0 }, Coord { x: 80.0, y: 3.0 }];
        let path = new_path_for_points(&points, &network).unwrap();
        assert_eq!(path, vec![EdgeId::new(1, 2, 0)]);
    }

    #[test]
    fn travel_direction_is_chosen_from_tied_edges() {
        let network = grid_network();
        // Heading west along the bottom row, then north up the left column
        let points = vec![Coord { x: 150.0, y: 2.0 }, Coord { x: 2.0, y: 50.0 }];
        let path = new_path_for_points(&points, &network).unwrap();
        assert_eq!(
            path,
            vec![
                EdgeId::new(3, 2, 0),
                EdgeId::new(2, 1, 0),
                EdgeId::new(1, 4, 0)
            ]
        );
    }
}
