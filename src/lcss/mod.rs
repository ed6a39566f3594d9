//! Longest-common-subsequence map matching.
//!
//! The trace is scored against a candidate path; poorly matching stretches are
//! cut at their worst points, re-routed independently and joined back together
//! until the score stops improving.

mod lcss_ops;
mod trajectory_segment;

use geo::Coord;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::ConflationError;
use crate::road_network::{EdgeId, RoadNetwork};

pub use trajectory_segment::compress;
use trajectory_segment::{TrajectorySegment, join_segments};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LcssConfig {
    /// Distance (m) at which a point stops contributing to the similarity score
    #[serde(default = "LcssConfig::default_distance_epsilon")]
    pub distance_epsilon: f64,
    /// Segment score at or above which a segment is left alone
    #[serde(default = "LcssConfig::default_similarity_cutoff")]
    pub similarity_cutoff: f64,
    /// Band (m) around `distance_epsilon` in which points become cutting points
    #[serde(default = "LcssConfig::default_cutting_threshold")]
    pub cutting_threshold: f64,
    #[serde(default = "LcssConfig::default_random_cuts")]
    pub random_cuts: usize,
    /// Points further than this (m) from every path edge get no edge
    #[serde(default = "LcssConfig::default_distance_threshold")]
    pub distance_threshold: f64,
    #[serde(default = "LcssConfig::default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub random_seed: u64,
}

impl LcssConfig {
    pub fn default_distance_epsilon() -> f64 {
        50.0
    }
    pub fn default_similarity_cutoff() -> f64 {
        0.9
    }
    pub fn default_cutting_threshold() -> f64 {
        10.0
    }
    pub fn default_random_cuts() -> usize {
        0
    }
    pub fn default_distance_threshold() -> f64 {
        10000.0
    }
    pub fn default_max_iterations() -> usize {
        10
    }

    pub fn validate(&self) -> Result<(), ConflationError> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(ConflationError::Config(format!(
                    "{} must be positive, got {}",
                    name, v
                )))
            }
        };
        positive("distance_epsilon", self.distance_epsilon)?;
        positive("distance_threshold", self.distance_threshold)?;
        if !(0.0..=1.0).contains(&self.similarity_cutoff) {
            return Err(ConflationError::Config(format!(
                "similarity_cutoff must lie in [0, 1], got {}",
                self.similarity_cutoff
            )));
        }
        if !self.cutting_threshold.is_finite() || self.cutting_threshold < 0.0 {
            return Err(ConflationError::Config(format!(
                "cutting_threshold must be non-negative, got {}",
                self.cutting_threshold
            )));
        }
        Ok(())
    }
}

impl Default for LcssConfig {
    fn default() -> Self {
        Self {
            distance_epsilon: Self::default_distance_epsilon(),
            similarity_cutoff: Self::default_similarity_cutoff(),
            cutting_threshold: Self::default_cutting_threshold(),
            random_cuts: Self::default_random_cuts(),
            distance_threshold: Self::default_distance_threshold(),
            max_iterations: Self::default_max_iterations(),
            random_seed: 0,
        }
    }
}

/// Assignment of one trace point to an edge of the matched path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointMatch {
    /// None when no path edge lies within the distance threshold
    pub edge: Option<EdgeId>,
    pub distance: f64,
}

impl PointMatch {
    pub fn unmatched() -> Self {
        Self {
            edge: None,
            distance: f64::INFINITY,
        }
    }
}

/// Raw output of the LCSS matcher: one match per input point and the joined path.
#[derive(Debug, Clone, PartialEq)]
pub struct LcssMatch {
    pub matches: Vec<PointMatch>,
    pub path: Vec<EdgeId>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct LcssMatcher {
    config: LcssConfig,
}

impl LcssMatcher {
    pub fn new(config: LcssConfig) -> Result<Self, ConflationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LcssConfig {
        &self.config
    }

    /// Match projected points to `network`.
    ///
    /// Fails with `UnmatchableTrace` when no initial path exists or when
    /// segments cannot be stitched back together.
    pub fn match_points(
        &self,
        points: &[Coord<f64>],
        network: &RoadNetwork,
    ) -> Result<LcssMatch, ConflationError> {
        if points.is_empty() {
            return Err(ConflationError::MalformedGeometry(
                "cannot match an empty trace".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(self.config.random_seed);

        let stationary = lcss_ops::find_stationary_points(points);
        let skipped = lcss_ops::skipped_indices(&stationary);
        let moving: Vec<Coord<f64>> = points
            .iter()
            .enumerate()
            .filter(|(i, _)| !skipped.contains(i))
            .map(|(_, p)| *p)
            .collect();

        let initial_path = lcss_ops::new_path_for_points(&moving, network)?;
        let mut initial = TrajectorySegment::new(moving, initial_path);
        initial.score_and_match(&self.config, network);
        initial.compute_cutting_points(&self.config, &mut rng);

        let mut scheme = initial.split_segment(network);

        for _ in 0..self.config.max_iterations {
            let mut next_scheme = Vec::with_capacity(scheme.len());
            let mut changed = false;

            for mut segment in scheme.iter().cloned() {
                segment.score_and_match(&self.config, network);
                segment.compute_cutting_points(&self.config, &mut rng);

                if segment.score >= self.config.similarity_cutoff {
                    next_scheme.push(segment);
                    continue;
                }
                let split = segment.split_segment(network);
                if split.len() < 2 {
                    next_scheme.push(segment);
                    continue;
                }
                match join_segments(&self.config, split.clone(), network) {
                    Ok(joined) if joined.score > segment.score => {
                        next_scheme.extend(split);
                        changed = true;
                    }
                    _ => next_scheme.push(segment),
                }
            }

            if !changed {
                break;
            }
            scheme = next_scheme;
        }

        let joined = join_segments(&self.config, scheme, network)?;
        let matches = lcss_ops::add_matches_for_stationary_points(joined.matches, &stationary);

        Ok(LcssMatch {
            matches,
            path: joined.path,
            score: joined.score,
        })
    }
}
