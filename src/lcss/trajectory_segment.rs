use geo::{Coord, Point};
use rand::Rng;
use rand::rngs::StdRng;
use std::collections::BTreeSet;

use super::{LcssConfig, PointMatch, lcss_ops};
use crate::error::ConflationError;
use crate::road_network::{EdgeId, RoadNetwork};
use crate::routing;

/// A stretch of the trace together with the candidate path it is scored against.
#[derive(Debug, Clone)]
pub(crate) struct TrajectorySegment {
    pub(crate) points: Vec<Coord<f64>>,
    pub(crate) path: Vec<EdgeId>,
    pub(crate) matches: Vec<PointMatch>,
    pub(crate) score: f64,
    pub(crate) cutting_points: Vec<usize>,
}

impl TrajectorySegment {
    pub(crate) fn new(points: Vec<Coord<f64>>, path: Vec<EdgeId>) -> Self {
        Self {
            points,
            path,
            matches: Vec::new(),
            score: 0.0,
            cutting_points: Vec::new(),
        }
    }

    /// Score the segment by LCSS similarity against its path and assign every
    /// point to its nearest path edge.
    ///
    /// Similarity of a point/edge pair is `1 - d / epsilon` inside epsilon and
    /// zero outside; the LCSS total is normalised by the shorter of the two
    /// sequences. Segments whose first or last point sits beyond epsilon are
    /// penalised so the path has to cover the ends of the trace.
    pub(crate) fn score_and_match(&mut self, config: &LcssConfig, network: &RoadNetwork) {
        let m = self.points.len();
        let n = self.path.len();

        if m == 0 || n == 0 {
            self.score = 0.0;
            self.matches = vec![PointMatch::unmatched(); m];
            return;
        }

        let mut distances = vec![vec![0.0; m]; n];
        for (j, edge) in self.path.iter().enumerate() {
            for (i, point) in self.points.iter().enumerate() {
                distances[j][i] = network.distance_to_edge(Point::from(*point), edge);
            }
        }

        let mut c = vec![vec![0.0; n + 1]; m + 1];
        let mut matches = Vec::with_capacity(m);

        for i in 1..=m {
            let mut min_dist = f64::INFINITY;
            let mut nearest: Option<EdgeId> = None;

            for j in 1..=n {
                let dt = distances[j - 1][i - 1];
                let edge = self.path[j - 1];
                if dt < min_dist || (dt == min_dist && nearest.is_some_and(|e| edge < e)) {
                    min_dist = dt;
                    nearest = Some(edge);
                }

                let similarity = if dt < config.distance_epsilon {
                    1.0 - dt / config.distance_epsilon
                } else {
                    0.0
                };
                c[i][j] = f64::max(c[i - 1][j - 1] + similarity, f64::max(c[i][j - 1], c[i - 1][j]));
            }

            if min_dist > config.distance_threshold || nearest.is_none() {
                matches.push(PointMatch::unmatched());
            } else {
                matches.push(PointMatch {
                    edge: nearest,
                    distance: min_dist,
                });
            }
        }

        self.score = c[m][n] / m.min(n) as f64;
        self.matches = matches;

        let first = self.matches[0].distance;
        let last = self.matches[m - 1].distance;
        if first > config.distance_epsilon || last > config.distance_epsilon {
            let first_ratio = (first / config.distance_epsilon).max(1.0);
            let last_ratio = (last / config.distance_epsilon).max(1.0);
            let penalty = (first_ratio + last_ratio) / 2.0;
            // Unmatched endpoints carry an infinite ratio and zero the score
            self.score = if penalty.is_finite() { self.score / penalty } else { 0.0 };
        }
    }

    /// Pick the indices where this segment may be split: the worst-matched
    /// point, points sitting right at the epsilon boundary and any random cuts.
    /// Consecutive candidates collapse to their middle and points next to
    /// either end are discarded.
    pub(crate) fn compute_cutting_points(&mut self, config: &LcssConfig, rng: &mut StdRng) {
        let n = self.points.len();
        let mut cutting_points = Vec::new();

        let no_match = self.matches.iter().all(|m| m.edge.is_none());
        if self.path.is_empty() || no_match {
            cutting_points.push(n / 2);
        } else {
            let furthest = self
                .matches
                .iter()
                .enumerate()
                .filter(|(_, m)| m.edge.is_some())
                .fold(None::<(usize, f64)>, |best, (i, m)| match best {
                    Some((_, d)) if d >= m.distance => best,
                    _ => Some((i, m.distance)),
                });
            if let Some((idx, _)) = furthest {
                cutting_points.push(idx);
            }

            for (i, m) in self.matches.iter().enumerate() {
                if m.edge.is_some()
                    && (m.distance - config.distance_epsilon).abs() < config.cutting_threshold
                {
                    cutting_points.push(i);
                }
            }
        }

        if n > 0 {
            for _ in 0..config.random_cuts {
                cutting_points.push(rng.random_range(0..n));
            }
        }

        let unique: BTreeSet<usize> = compress(cutting_points)
            .into_iter()
            .filter(|&idx| idx > 1 && idx + 2 < n)
            .collect();
        self.cutting_points = unique.into_iter().collect();
    }

    /// Split at the cutting points and route each piece afresh. A piece with
    /// no route gets an empty path rather than failing the whole split.
    pub(crate) fn split_segment(&self, network: &RoadNetwork) -> Vec<TrajectorySegment> {
        if self.points.len() < 2 || self.cutting_points.is_empty() {
            return vec![self.clone()];
        }

        let mut bounds = Vec::with_capacity(self.cutting_points.len() + 2);
        bounds.push(0);
        bounds.extend(self.cutting_points.iter().copied());
        bounds.push(self.points.len());

        bounds
            .windows(2)
            .filter(|w| w[1] > w[0])
            .map(|w| {
                let points = self.points[w[0]..w[1]].to_vec();
                let path = lcss_ops::new_path_for_points(&points, network).unwrap_or_default();
                TrajectorySegment::new(points, path)
            })
            .collect()
    }
}

/// Concatenate segments, bridging any gap between consecutive paths with a
/// shortest route, and rescore the result against the combined points.
pub(crate) fn join_segments(
    config: &LcssConfig,
    segments: Vec<TrajectorySegment>,
    network: &RoadNetwork,
) -> Result<TrajectorySegment, ConflationError> {
    if segments.is_empty() {
        return Err(ConflationError::UnmatchableTrace(
            "no segments to join".to_string(),
        ));
    }

    let mut points = Vec::new();
    let mut path: Vec<EdgeId> = Vec::new();

    for segment in segments {
        points.extend(segment.points);
        let Some(first) = segment.path.first() else {
            continue;
        };
        if let Some(last) = path.last() {
            if last != first && last.destination != first.origin {
                let gap = routing::shortest_path(network, last.destination, first.origin)
                    .ok_or_else(|| {
                        ConflationError::UnmatchableTrace(format!(
                            "cannot connect edge {} to edge {}",
                            last, first
                        ))
                    })?;
                path.extend(gap);
            }
        }
        path.extend(segment.path);
    }

    path.dedup();

    let mut joined = TrajectorySegment::new(points, path);
    joined.score_and_match(config, network);
    Ok(joined)
}

/// Collapse runs of consecutive indices to their middle element.
pub fn compress(mut cutting_points: Vec<usize>) -> Vec<usize> {
    cutting_points.sort_unstable();
    cutting_points.dedup();

    let mut result = Vec::new();
    let mut group: Vec<usize> = Vec::new();
    for point in cutting_points {
        if group.last().is_some_and(|&last| point != last + 1) {
            result.push(group[group.len() / 2]);
            group.clear();
        }
        group.push(point);
    }
    if !group.is_empty() {
        result.push(group[group.len() / 2]);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road_network::tests::grid_network;
    use rand::SeedableRng;

    #[test]
    fn compress_no_consecutive() {
        assert_eq!(compress(vec![1, 3, 5, 7]), vec![1, 3, 5, 7]);
    }

    #[test]
    fn compress_all_consecutive() {
        assert_eq!(compress(vec![1, 2, 3, 4, 5]), vec![3]);
    }

    #[test]
    fn compress_mixed() {
        assert_eq!(compress(vec![1, 2, 3, 6, 7, 8, 10]), vec![2, 7, 10]);
    }

    #[test]
    fn compress_unsorted_with_duplicates() {
        assert_eq!(compress(vec![5, 4, 4, 1, 2]), vec![2, 5]);
    }

    #[test]
    fn compress_empty() {
        assert!(compress(vec![]).is_empty());
    }

    #[test]
    fn perfect_alignment_scores_one() {
        let network = grid_network();
        let points: Vec<Coord<f64>> = (0..5).map(|i| Coord { x: 10.0 + 20.0 * i as f64, y: 0.0 }).collect();
        let mut segment = TrajectorySegment::new(points, vec![EdgeId::new(1, 2, 0)]);
        segment.score_and_match(&LcssConfig::default(), &network);
        assert!((segment.score - 1.0).abs() < 1e-9);
        assert!(segment.matches.iter().all(|m| m.edge == Some(EdgeId::new(1, 2, 0))));
    }

    #[test]
    fn equidistant_edges_resolve_to_the_smallest_identifier() {
        let network = grid_network();
        // Halfway between the parallel streets 1-2 and 4-5
        let points = vec![Coord { x: 50.0, y: 50.0 }, Coord { x: 60.0, y: 50.0 }];
        let mut segment = TrajectorySegment::new(points, vec![EdgeId::new(4, 5, 0), EdgeId::new(1, 2, 0)]);
        segment.score_and_match(&LcssConfig::default(), &network);
        assert!(segment.matches.iter().all(|m| m.edge == Some(EdgeId::new(1, 2, 0))));
        assert!(segment.matches.iter().all(|m| (m.distance - 50.0).abs() < 1e-9));

        let mut reversed = TrajectorySegment::new(vec![Coord { x: 50.0, y: 50.0 }], vec![EdgeId::new(1, 2, 0), EdgeId::new(4, 5, 0)]);
        reversed.score_and_match(&LcssConfig::default(), &network);
        assert_eq!(reversed.matches[0].edge, Some(EdgeId::new(1, 2, 0)));
    }

    #[test]
    fn empty_path_scores_zero_and_matches_nothing() {
        let network = grid_network();
        let mut segment = TrajectorySegment::new(vec![Coord { x: 0.0, y: 0.0 }; 3], vec![]);
        segment.score_and_match(&LcssConfig::default(), &network);
        assert_eq!(segment.score, 0.0);
        assert!(segment.matches.iter().all(|m| m.edge.is_none()));
    }

    #[test]
    fn cutting_points_skip_the_ends() {
        let network = grid_network();
        let mut points: Vec<Coord<f64>> = (0..7).map(|i| Coord { x: 10.0 + 10.0 * i as f64, y: 0.0 }).collect();
        points[3].y = 45.0;
        let mut segment = TrajectorySegment::new(points, vec![EdgeId::new(1, 2, 0)]);
        let config = LcssConfig::default();
        segment.score_and_match(&config, &network);
        segment.compute_cutting_points(&config, &mut StdRng::seed_from_u64(0));
        assert_eq!(segment.cutting_points, vec![3]);

        let pieces = segment.split_segment(&network);
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].points.len(), 3);
        assert_eq!(pieces[1].points.len(), 4);
    }

    #[test]
    fn join_bridges_gaps_with_shortest_paths() {
        let network = grid_network();
        let a = TrajectorySegment::new(vec![Coord { x: 50.0, y: 0.0 }], vec![EdgeId::new(1, 2, 0)]);
        let b = TrajectorySegment::new(vec![Coord { x: 200.0, y: 50.0 }], vec![EdgeId::new(3, 6, 0)]);
        let joined = join_segments(&LcssConfig::default(), vec![a, b], &network).unwrap();
        assert_eq!(
            joined.path,
            vec![
                EdgeId::new(1, 2, 0),
                EdgeId::new(2, 3, 0),
                EdgeId::new(3, 6, 0)
            ]
        );
        assert_eq!(joined.matches.len(), 2);
    }
}
