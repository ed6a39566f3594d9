use geo::{BoundingRect, Coord, CoordsIter, Distance, Euclidean, Geometry, Intersects, LineString, Point};
use log::{debug, info, warn};
use rayon::prelude::*;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::error::ConflationError;
use crate::geofence::Geofence;
use crate::lcss::LcssConfig;
use crate::map_source::InMemorySource;
use crate::mapmatcher::MatchOutcome;
use crate::network_provider::RoadNetworkProvider;
use crate::osm_preprocessing::NetworkKind;
use crate::projection::{is_valid_lonlat, project_geometry};
use crate::road_network::{EdgeAttributes, EdgeId, RoadNetwork, distance_to_line};
use crate::trip_builder::Trace;
use crate::trip_processor::{BatchSettings, MatchOrchestrator, NetworkMode};

pub type FeatureId = String;

/// Distances closer than this (m) are treated as equal when picking the nearest edge.
const DISTANCE_TIE: f64 = 1e-9;

/// A static point or line feature, held in Web Mercator metres.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticFeature {
    pub id: FeatureId,
    pub geometry: Geometry<f64>,
}

impl StaticFeature {
    pub fn from_projected(id: impl Into<FeatureId>, geometry: Geometry<f64>) -> Self {
        Self {
            id: id.into(),
            geometry,
        }
    }

    pub fn from_lonlat(id: impl Into<FeatureId>, geometry: &Geometry<f64>) -> Result<Self, ConflationError> {
        let id = id.into();
        if let Some(c) = geometry.coords_iter().find(|c| !is_valid_lonlat(*c)) {
            return Err(ConflationError::MalformedGeometry(format!(
                "feature {} has invalid coordinate ({}, {})",
                id, c.x, c.y
            )));
        }
        Ok(Self {
            id,
            geometry: project_geometry(geometry),
        })
    }
}

/// The edge a feature was assigned to.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflationResult {
    pub feature_id: FeatureId,
    pub edge_id: EdgeId,
    pub distance: f64,
    pub edge_geometry: LineString<f64>,
    pub attributes: EdgeAttributes,
}

/// A feature that produced no result, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedFeature {
    pub feature_id: FeatureId,
    pub reason: ConflationError,
}

#[derive(Debug, Clone, Default)]
pub struct ConflationReport {
    /// One entry per matched feature, ordered by feature id
    pub matched: Vec<ConflationResult>,
    pub dropped: Vec<DroppedFeature>,
}

impl ConflationReport {
    /// Edges that some feature was assigned to; the facility edge set.
    pub fn edge_ids(&self) -> BTreeSet<EdgeId> {
        self.matched.iter().map(|r| r.edge_id).collect()
    }

    pub fn osm_way_ids(&self) -> BTreeSet<u64> {
        self.matched
            .iter()
            .flat_map(|r| r.attributes.osm_ids.iter().copied())
            .collect()
    }
}

/// Restricts candidate edges to a set of road classes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoadClassFilter {
    classes: BTreeSet<String>,
}

impl RoadClassFilter {
    pub fn new<S: Into<String>>(classes: impl IntoIterator<Item = S>) -> Self {
        Self {
            classes: classes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn accepts(&self, attributes: &EdgeAttributes) -> bool {
        attributes
            .highway
            .as_ref()
            .is_some_and(|h| self.classes.contains(h))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflatorSettings {
    /// Buffer (m) around each feature when drawing the conflation region
    #[serde(default = "ConflatorSettings::default_buffer")]
    pub buffer: f64,
    /// Slack (m) added around each feature's envelope when querying candidates
    #[serde(default = "ConflatorSettings::default_search_tolerance")]
    pub search_tolerance: f64,
    #[serde(default = "ConflatorSettings::default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub network_kind: NetworkKind,
}

impl ConflatorSettings {
    pub fn default_buffer() -> f64 {
        10.0
    }
    pub fn default_search_tolerance() -> f64 {
        25.0
    }
    pub fn default_worker_count() -> usize {
        8
    }
}

impl Default for ConflatorSettings {
    fn default() -> Self {
        Self {
            buffer: Self::default_buffer(),
            search_tolerance: Self::default_search_tolerance(),
            worker_count: Self::default_worker_count(),
            network_kind: NetworkKind::Drive,
        }
    }
}

type CandidateEdge = GeomWithData<Rectangle<[f64; 2]>, EdgeId>;

/// Assigns static features to their single nearest network edge.
pub struct LinkConflator {
    settings: ConflatorSettings,
}

impl LinkConflator {
    pub fn new(settings: ConflatorSettings) -> Self {
        Self { settings }
    }

    /// Convex hull of the buffered features, in lon/lat.
    pub fn conflation_region(&self, features: &[StaticFeature]) -> Result<Geofence, ConflationError> {
        let geometries: Vec<Geometry<f64>> = features.iter().map(|f| f.geometry.clone()).collect();
        Geofence::convex_hull_of(&geometries, self.settings.buffer)
    }

    /// The network covering the buffered features, fetched without touching
    /// the regional cache.
    pub fn fetch_network(
        &self,
        features: &[StaticFeature],
        provider: &RoadNetworkProvider,
    ) -> Result<RoadNetwork, ConflationError> {
        info!("Step 1: Fetching the network around {} features", features.len());
        let region = self.conflation_region(features)?;
        provider.fetch_bounded(&region, self.settings.network_kind)
    }

    /// Fetch the network covering the features and conflate against it.
    pub fn conflate_with_provider(
        &self,
        features: &[StaticFeature],
        provider: &RoadNetworkProvider,
        filter: Option<&RoadClassFilter>,
    ) -> Result<ConflationReport, ConflationError> {
        let network = self.fetch_network(features, provider)?;
        self.conflate(features, &network, filter)
    }

    /// Map-match every line feature along the network the way survey trips are
    /// matched, so a feature resolves to the whole run of edges it follows
    /// rather than to one nearest edge. Point and polygon features are skipped.
    pub fn match_features(
        &self,
        features: &[StaticFeature],
        network: RoadNetwork,
        lcss: LcssConfig,
        geofence_padding: f64,
    ) -> Result<FeatureMatchReport, ConflationError> {
        let (traces, skipped) = feature_traces(features);
        if traces.is_empty() {
            info!("No line features to map-match");
            return Ok(FeatureMatchReport {
                outcomes: Vec::new(),
                skipped,
            });
        }

        let region = self.conflation_region(features)?;
        let kind = network.kind();
        let provider = RoadNetworkProvider::new(Arc::new(InMemorySource::new(network)));
        let orchestrator = MatchOrchestrator::new(
            provider,
            BatchSettings {
                region,
                network_kind: kind,
                network_mode: NetworkMode::SharedRegional,
                geofence_padding,
                lcss,
            },
        );
        let batch = orchestrator.run_batch(
            traces,
            self.settings.worker_count,
            NetworkMode::SharedRegional,
            geofence_padding,
        )?;

        let mut outcomes = batch.outcomes;
        outcomes.sort_by(|a, b| a.trip_id().cmp(b.trip_id()));
        let report = FeatureMatchReport { outcomes, skipped };
        info!(
            "Map-matched {} of {} line features ({} skipped)",
            report.matched_count(),
            report.outcomes.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Nearest-edge assignment for every feature. Features with no candidate
    /// edge, or with unusable geometry, are reported as dropped.
    pub fn conflate(
        &self,
        features: &[StaticFeature],
        network: &RoadNetwork,
        filter: Option<&RoadClassFilter>,
    ) -> Result<ConflationReport, ConflationError> {
        let start = Instant::now();

        let candidates: Vec<CandidateEdge> = network
            .edges()
            .filter(|e| filter.is_none_or(|f| f.accepts(&e.attributes)))
            .filter_map(|e| {
                let rect = e.geometry.bounding_rect()?;
                Some(GeomWithData::new(
                    Rectangle::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                    e.id,
                ))
            })
            .collect();
        debug!(
            "Indexed {} of {} edges for conflation",
            candidates.len(),
            network.edge_count()
        );
        let index = RTree::bulk_load(candidates);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.worker_count.max(1))
            .build()
            .map_err(|e| ConflationError::Config(format!("cannot start conflation pool: {}", e)))?;
        let outcomes: Vec<Result<ConflationResult, DroppedFeature>> = pool.install(|| {
            features
                .par_iter()
                .map(|feature| {
                    self.nearest_edge(feature, &index, network)
                        .map_err(|reason| DroppedFeature {
                            feature_id: feature.id.clone(),
                            reason,
                        })
                })
                .collect()
        });

        let mut report = ConflationReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(result) => report.matched.push(result),
                Err(dropped) => {
                    warn!("Feature {} not conflated: {}", dropped.feature_id, dropped.reason);
                    report.dropped.push(dropped);
                }
            }
        }
        report.matched.sort_by(|a, b| a.feature_id.cmp(&b.feature_id));
        report.dropped.sort_by(|a, b| a.feature_id.cmp(&b.feature_id));

        info!(
            "Conflated {} of {} features in {:?}",
            report.matched.len(),
            features.len(),
            start.elapsed()
        );
        Ok(report)
    }

    fn nearest_edge(
        &self,
        feature: &StaticFeature,
        index: &RTree<CandidateEdge>,
        network: &RoadNetwork,
    ) -> Result<ConflationResult, ConflationError> {
        let shape = FeatureShape::new(&feature.geometry)?;
        let rect = feature.geometry.bounding_rect().ok_or_else(|| {
            ConflationError::MalformedGeometry(format!("feature {} is empty", feature.id))
        })?;
        let tol = self.settings.search_tolerance;
        let envelope = AABB::from_corners(
            [rect.min().x - tol, rect.min().y - tol],
            [rect.max().x + tol, rect.max().y + tol],
        );

        let mut best: Option<(f64, EdgeId)> = None;
        for candidate in index.locate_in_envelope_intersecting(&envelope) {
            let Some(edge) = network.edge(&candidate.data) else {
                continue;
            };
            let d = if feature.geometry.intersects(&edge.geometry) {
                0.0
            } else {
                shape.distance_to(&edge.geometry)
            };
            let better = match best {
                None => true,
                Some((bd, bid)) => d < bd - DISTANCE_TIE || ((d - bd).abs() <= DISTANCE_TIE && edge.id < bid),
            };
            if better {
                best = Some((d, edge.id));
            }
        }

        let (distance, edge_id) = best.ok_or_else(|| {
            ConflationError::UnmatchableTrace(format!(
                "no candidate edge within {} m of feature {}",
                tol, feature.id
            ))
        })?;
        let edge = network.edge(&edge_id).ok_or_else(|| {
            ConflationError::UnmatchableTrace(format!("edge {} vanished from the network", edge_id))
        })?;
        Ok(ConflationResult {
            feature_id: feature.id.clone(),
            edge_id,
            distance,
            edge_geometry: edge.geometry.clone(),
            attributes: edge.attributes.clone(),
        })
    }
}

/// A feature broken into isolated points and polylines (polygon rings included).
struct FeatureShape {
    points: Vec<Point<f64>>,
    lines: Vec<LineString<f64>>,
}

impl FeatureShape {
    fn new(geometry: &Geometry<f64>) -> Result<Self, ConflationError> {
        let mut shape = FeatureShape {
            points: Vec::new(),
            lines: Vec::new(),
        };
        shape.add(geometry)?;
        let coords = shape
            .points
            .iter()
            .map(|p| p.0)
            .chain(shape.lines.iter().flat_map(|l| l.0.iter().copied()));
        if coords.clone().next().is_none() {
            return Err(ConflationError::MalformedGeometry("feature has no coordinates".to_string()));
        }
        if coords.into_iter().any(|c: Coord<f64>| !c.x.is_finite() || !c.y.is_finite()) {
            return Err(ConflationError::MalformedGeometry(
                "feature has a non-finite coordinate".to_string(),
            ));
        }
        Ok(shape)
    }

    fn add(&mut self, geometry: &Geometry<f64>) -> Result<(), ConflationError> {
        match geometry {
            Geometry::Point(p) => self.points.push(*p),
            Geometry::MultiPoint(mp) => self.points.extend(mp.0.iter().copied()),
            Geometry::Line(l) => self.lines.push(LineString::from(vec![l.start, l.end])),
            Geometry::LineString(ls) => self.lines.push(ls.clone()),
            Geometry::MultiLineString(mls) => self.lines.extend(mls.0.iter().cloned()),
            Geometry::Polygon(p) => {
                self.lines.push(p.exterior().clone());
                self.lines.extend(p.interiors().iter().cloned());
            }
            Geometry::MultiPolygon(mp) => {
                for p in &mp.0 {
                    self.add(&Geometry::Polygon(p.clone()))?;
                }
            }
            Geometry::GeometryCollection(gc) => {
                for g in &gc.0 {
                    self.add(g)?;
                }
            }
            Geometry::Rect(_) | Geometry::Triangle(_) => {
                return Err(ConflationError::MalformedGeometry(
                    "unsupported feature geometry type".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn distance_from(&self, c: Coord<f64>) -> f64 {
        let p = Point::from(c);
        let to_points = self
            .points
            .iter()
            .map(|q| Euclidean.distance(p, *q))
            .fold(f64::INFINITY, f64::min);
        let to_lines = self
            .lines
            .iter()
            .map(|l| distance_to_line(p, l))
            .fold(f64::INFINITY, f64::min);
        to_points.min(to_lines)
    }

    /// Exact distance to a polyline it does not intersect: the minimum over
    /// the vertices of each side measured against the other.
    fn distance_to(&self, edge: &LineString<f64>) -> f64 {
        let from_feature = self
            .points
            .iter()
            .map(|p| p.0)
            .chain(self.lines.iter().flat_map(|l| l.0.iter().copied()))
            .map(|c| distance_to_line(Point::from(c), edge))
            .fold(f64::INFINITY, f64::min);
        let from_edge = edge
            .0
            .iter()
            .map(|c| self.distance_from(*c))
            .fold(f64::INFINITY, f64::min);
        from_feature.min(from_edge)
    }
}

/// Outcome of map-matching line features, keyed by feature id through each
/// outcome's trip id.
#[derive(Debug, Default)]
pub struct FeatureMatchReport {
    pub outcomes: Vec<MatchOutcome>,
    /// Features that are not a single line and were never matched
    pub skipped: Vec<FeatureId>,
}

impl FeatureMatchReport {
    pub fn matched_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_matched()).count()
    }

    /// Edges on any feature's matched path.
    pub fn edge_ids(&self) -> BTreeSet<EdgeId> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                MatchOutcome::Matched(m) => Some(m.path_ids()),
                MatchOutcome::Unmatched { .. } => None,
            })
            .flatten()
            .collect()
    }
}

/// Synthetic traces for the line features, one per feature with the feature id
/// as trip id and the line's vertices as samples. Other geometry types are
/// returned as skipped.
pub fn feature_traces(features: &[StaticFeature]) -> (Vec<Trace>, Vec<FeatureId>) {
    let mut traces = Vec::new();
    let mut skipped = Vec::new();
    for feature in features {
        let Geometry::LineString(line) = &feature.geometry else {
            debug!("Feature {} is not a line; not map-matched", feature.id);
            skipped.push(feature.id.clone());
            continue;
        };
        match Trace::from_projected(feature.id.clone(), line.coords().copied()) {
            Ok(trace) => traces.push(trace),
            Err(e) => {
                warn!("Feature {} cannot be traced: {}", feature.id, e);
                skipped.push(feature.id.clone());
            }
        }
    }
    (traces, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road_network::tests::grid_network;
    use geo::line_string;

    fn conflator() -> LinkConflator {
        LinkConflator::new(ConflatorSettings {
            worker_count: 2,
            ..Default::default()
        })
    }

    #[test]
    fn point_feature_snaps_to_nearest_edge() {
        let network = grid_network();
        let feature = StaticFeature::from_projected("p", Point::new(150.0, 8.0).into());
        let report = conflator().conflate(&[feature], &network, None).unwrap();
        assert_eq!(report.matched.len(), 1);
        assert_eq!(report.matched[0].edge_id, EdgeId::new(2, 3, 0));
        assert!((report.matched[0].distance - 8.0).abs() < 1e-9);
    }

    #[test]
    fn road_class_filter_excludes_other_classes() {
        let network = grid_network();
        let feature = StaticFeature::from_projected(
            "l",
            line_string![(x: 10.0, y: 0.0), (x: 90.0, y: 0.0)].into(),
        );
        let filter = RoadClassFilter::new(["motorway"]);
        let report = conflator().conflate(&[feature], &network, Some(&filter)).unwrap();
        assert!(report.matched.is_empty());
        assert_eq!(report.dropped.len(), 1);
    }

    #[test]
    fn parallel_line_distance_is_exact() {
        let network = grid_network();
        let feature = StaticFeature::from_projected(
            "l",
            line_string![(x: 120.0, y: 12.0), (x: 180.0, y: 12.0)].into(),
        );
        let report = conflator().conflate(&[feature], &network, None).unwrap();
        assert_eq!(report.matched[0].edge_id, EdgeId::new(2, 3, 0));
        assert!((report.matched[0].distance - 12.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_lonlat_is_rejected() {
        let result = StaticFeature::from_lonlat("bad", &Point::new(300.0, 10.0).into());
        assert!(matches!(result, Err(ConflationError::MalformedGeometry(_))));
    }

    #[test]
    fn region_covers_all_features() {
        let features = vec![
            StaticFeature::from_projected("a", Point::new(0.0, 0.0).into()),
            StaticFeature::from_projected("b", Point::new(1000.0, 500.0).into()),
        ];
        let region = conflator().conflation_region(&features).unwrap();
        let projected = region.projected();
        use geo::Contains;
        assert!(projected.contains(&Point::new(500.0, 250.0)));
    }

    #[test]
    fn only_line_features_become_traces() {
        let features = vec![
            StaticFeature::from_projected(
                "f",
                line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 0.0), (x: 100.0, y: 0.0)].into(),
            ),
            StaticFeature::from_projected("p", Point::new(150.0, 8.0).into()),
        ];
        let (traces, skipped) = feature_traces(&features);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].trip_id(), "f");
        assert_eq!(traces[0].len(), 3);
        assert_eq!(skipped, vec!["p".to_string()]);
    }

    #[test]
    fn line_feature_is_matched_along_the_streets_it_follows() {
        let network = grid_network();
        let features = vec![
            StaticFeature::from_projected(
                "corridor",
                line_string![(x: 10.0, y: 3.0), (x: 60.0, y: 3.0), (x: 140.0, y: 3.0), (x: 190.0, y: 3.0)].into(),
            ),
            StaticFeature::from_projected("p", Point::new(150.0, 8.0).into()),
        ];
        let report = conflator()
            .match_features(&features, network, LcssConfig::default(), 200.0)
            .unwrap();
        assert_eq!(report.skipped, vec!["p".to_string()]);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].trip_id(), "corridor");
        assert_eq!(
            report.edge_ids(),
            BTreeSet::from([EdgeId::new(1, 2, 0), EdgeId::new(2, 3, 0)])
        );
    }

    #[test]
    fn no_line_features_means_nothing_to_match() {
        let features = vec![StaticFeature::from_projected("p", Point::new(150.0, 8.0).into())];
        let report = conflator()
            .match_features(&features, grid_network(), LcssConfig::default(), 200.0)
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert_eq!(report.skipped.len(), 1);
    }
}
