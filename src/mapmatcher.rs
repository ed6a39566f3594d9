use geo::{Coord, LineString, Point};
use log::{debug, trace};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use crate::error::ConflationError;
use crate::geofence::Geofence;
use crate::lcss::{LcssConfig, LcssMatcher};
use crate::network_provider::RoadNetworkProvider;
use crate::osm_preprocessing::NetworkKind;
use crate::road_network::{EdgeAttributes, EdgeId, RoadNetwork, project_onto_line};
use crate::routing;
use crate::trip_builder::{Trace, TripId};

/// Default padding (m) of the fence drawn around each trace.
pub const DEFAULT_GEOFENCE_PADDING: f64 = 1000.0;

/// One edge of a matched path with where the trip entered and left it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedEdge {
    pub edge_id: EdgeId,
    pub entry: Coord<f64>,
    pub exit: Coord<f64>,
    pub geometry: LineString<f64>,
    pub attributes: EdgeAttributes,
}

/// Nearest-edge assignment of one trace point.
#[derive(Debug, Clone, PartialEq)]
pub struct PointAssignment {
    pub coordinate_index: usize,
    pub position: Coord<f64>,
    pub edge_id: EdgeId,
    pub distance: f64,
}

/// A successful match: an ordered, connected path and one assignment per point.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedTrace {
    pub trip_id: TripId,
    pub path: Vec<MatchedEdge>,
    pub assignments: Vec<PointAssignment>,
    pub score: f64,
}

impl MatchedTrace {
    pub fn path_ids(&self) -> Vec<EdgeId> {
        self.path.iter().map(|e| e.edge_id).collect()
    }

    /// Attributes of every edge the trip touched, by identifier.
    pub fn edge_attributes(&self) -> BTreeMap<EdgeId, &EdgeAttributes> {
        self.path
            .iter()
            .map(|e| (e.edge_id, &e.attributes))
            .collect()
    }
}

/// Result of matching one trip: exactly one of matched or unmatched.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched(MatchedTrace),
    Unmatched {
        trip_id: TripId,
        reason: ConflationError,
    },
}

impl MatchOutcome {
    pub fn trip_id(&self) -> &str {
        match self {
            MatchOutcome::Matched(m) => &m.trip_id,
            MatchOutcome::Unmatched { trip_id, .. } => trip_id,
        }
    }

    pub fn is_matched(&self) -> bool {
        matches!(self, MatchOutcome::Matched(_))
    }

    pub fn unmatched(trip_id: impl Into<TripId>, reason: ConflationError) -> Self {
        MatchOutcome::Unmatched {
            trip_id: trip_id.into(),
            reason,
        }
    }
}

/// Matches traces to a road network with LCSS inside a per-trace geofence.
#[derive(Debug, Clone)]
pub struct MapMatcher {
    lcss: LcssMatcher,
    geofence_padding: f64,
}

impl MapMatcher {
    pub fn new(config: LcssConfig, geofence_padding: f64) -> Result<Self, ConflationError> {
        if !geofence_padding.is_finite() || geofence_padding <= 0.0 {
            return Err(ConflationError::Config(format!(
                "geofence padding must be positive, got {}",
                geofence_padding
            )));
        }
        Ok(Self {
            lcss: LcssMatcher::new(config)?,
            geofence_padding,
        })
    }

    pub fn geofence_padding(&self) -> f64 {
        self.geofence_padding
    }

    /// Match a trace against a network, converting every failure (including
    /// panics inside the matcher) into an unmatched outcome.
    pub fn match_trace(&self, trace: &Trace, network: &RoadNetwork) -> MatchOutcome {
        self.guarded(trace, || self.try_match(trace, network))
    }

    /// Match a trace against a fresh network fetched for its own geofence.
    pub fn match_with_provider(
        &self,
        trace: &Trace,
        provider: &RoadNetworkProvider,
        kind: NetworkKind,
    ) -> MatchOutcome {
        self.guarded(trace, || {
            let fence = Geofence::from_trace(trace, self.geofence_padding)?;
            let network = provider.fetch_bounded(&fence, kind)?;
            self.try_match_bounded(trace, &network)
        })
    }

    /// Typed form of [`MapMatcher::match_trace`]: clip the network to the
    /// trace's geofence and match inside it.
    pub fn try_match(&self, trace: &Trace, network: &RoadNetwork) -> Result<MatchedTrace, ConflationError> {
        let fence = Geofence::from_trace(trace, self.geofence_padding)?;
        let bounded = network.extract_subgraph(&fence);
        self.try_match_bounded(trace, &bounded)
    }

    /// Match a trace against a network that is already bounded to its area.
    pub fn try_match_bounded(
        &self,
        trace: &Trace,
        network: &RoadNetwork,
    ) -> Result<MatchedTrace, ConflationError> {
        let start = Instant::now();
        if network.is_empty() {
            return Err(ConflationError::UnmatchableTrace(
                "no road edges inside the geofence".to_string(),
            ));
        }

        let threshold = self.lcss.config().distance_threshold;
        let positions = trace.positions();
        let has_candidates = positions.iter().any(|p| {
            network
                .nearest_edge(Point::from(*p))
                .is_some_and(|(_, d)| d <= threshold)
        });
        if !has_candidates {
            return Err(ConflationError::UnmatchableTrace(format!(
                "no candidate edges within {} m of any point",
                threshold
            )));
        }

        let result = self.lcss.match_points(&positions, network)?;
        trace!(
            "LCSS matched trip {} with score {:.3} over {} edges",
            trace.trip_id(),
            result.score,
            result.path.len()
        );

        if result.path.is_empty() {
            return Err(ConflationError::UnmatchableTrace(
                "alignment produced an empty path".to_string(),
            ));
        }
        if result.matches.len() != positions.len() {
            return Err(ConflationError::UnmatchableTrace(format!(
                "alignment covered {} of {} points",
                result.matches.len(),
                positions.len()
            )));
        }
        if !routing::is_connected(&result.path) {
            return Err(ConflationError::UnmatchableTrace(
                "alignment produced a disconnected path".to_string(),
            ));
        }

        let mut assignments = Vec::with_capacity(positions.len());
        for (i, (m, position)) in result.matches.iter().zip(&positions).enumerate() {
            let Some(edge_id) = m.edge else {
                return Err(ConflationError::UnmatchableTrace(format!(
                    "point {} has no edge within {} m",
                    i, threshold
                )));
            };
            assignments.push(PointAssignment {
                coordinate_index: i,
                position: *position,
                edge_id,
                distance: m.distance,
            });
        }

        let path = resolve_path(&result.path, &assignments, network)?;
        debug!(
            "Matched trip {} ({} points, {} edges) in {:?}",
            trace.trip_id(),
            positions.len(),
            path.len(),
            start.elapsed()
        );

        Ok(MatchedTrace {
            trip_id: trace.trip_id().to_string(),
            path,
            assignments,
            score: result.score,
        })
    }

    fn guarded<F>(&self, trace: &Trace, f: F) -> MatchOutcome
    where
        F: FnOnce() -> Result<MatchedTrace, ConflationError>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(matched)) => MatchOutcome::Matched(matched),
            Ok(Err(reason)) => MatchOutcome::unmatched(trace.trip_id(), reason),
            Err(panic) => MatchOutcome::unmatched(
                trace.trip_id(),
                ConflationError::UnmatchableTrace(format!("matcher panicked: {}", panic_message(&*panic))),
            ),
        }
    }
}

/// Text carried by a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Attach geometry, attributes and entry/exit points to every path edge.
///
/// Entry and exit are the projections of the first and last points assigned
/// to the edge, or the edge's own ends when no point was assigned to it.
fn resolve_path(
    path: &[EdgeId],
    assignments: &[PointAssignment],
    network: &RoadNetwork,
) -> Result<Vec<MatchedEdge>, ConflationError> {
    let mut assigned: BTreeMap<EdgeId, (Coord<f64>, Coord<f64>)> = BTreeMap::new();
    for a in assignments {
        assigned
            .entry(a.edge_id)
            .and_modify(|(_, last)| *last = a.position)
            .or_insert((a.position, a.position));
    }

    path.iter()
        .map(|id| {
            let edge = network.edge(id).ok_or_else(|| {
                ConflationError::UnmatchableTrace(format!("matched edge {} is not in the network", id))
            })?;
            let (entry, exit) = match assigned.get(id) {
                Some((first, last)) => (
                    project_onto_line(Point::from(*first), &edge.geometry),
                    project_onto_line(Point::from(*last), &edge.geometry),
                ),
                None => (edge.geometry.0[0], edge.geometry.0[edge.geometry.0.len() - 1]),
            };
            Ok(MatchedEdge {
                edge_id: *id,
                entry,
                exit,
                geometry: edge.geometry.clone(),
                attributes: edge.attributes.clone(),
            })
        })
        .collect()
}
