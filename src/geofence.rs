use geo::{ConvexHull, Coord, Geometry, MultiPoint, MultiPolygon, Point, Polygon, unary_union};
use geo::{Contains, CoordsIter};

use crate::error::ConflationError;
use crate::projection::{project_geometry, unproject_geometry};

/// Number of vertices used to approximate a circle around each sample.
const CIRCLE_SEGMENTS: usize = 16;

/// Padded bounding region in lon/lat, used to scope network construction and
/// subgraph extraction.
///
/// A trace fence is the union of a chain of capsules, each the convex hull of
/// two padded consecutive samples, so long curved trips do not drag in the
/// whole convex region between their endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct Geofence {
    lonlat: MultiPolygon<f64>,
}

impl Geofence {
    pub fn from_polygon(polygon: Polygon<f64>) -> Self {
        Self {
            lonlat: MultiPolygon::new(vec![polygon]),
        }
    }

    pub fn from_multi_polygon(lonlat: MultiPolygon<f64>) -> Self {
        Self { lonlat }
    }

    /// Build a fence from a polygon expressed in Web Mercator metres.
    pub fn from_projected_polygon(polygon: &Polygon<f64>) -> Self {
        Self::from_polygon(unproject_geometry(polygon))
    }

    /// Fence around an ordered run of projected points, padded by `padding` metres.
    pub fn from_projected_points(points: &[Coord<f64>], padding: f64) -> Result<Self, ConflationError> {
        validate_padding(padding)?;
        if points.is_empty() {
            return Err(ConflationError::MalformedGeometry(
                "cannot build a geofence around zero points".to_string(),
            ));
        }
        if points.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
            return Err(ConflationError::MalformedGeometry(
                "non-finite coordinate in geofence input".to_string(),
            ));
        }

        let mut polygons = Vec::new();
        if points.len() == 1 {
            polygons.push(padded_hull(&points[..1], padding));
        } else {
            for pair in points.windows(2) {
                if pair[0] == pair[1] {
                    continue;
                }
                polygons.push(padded_hull(pair, padding));
            }
            if polygons.is_empty() {
                polygons.push(padded_hull(&points[..1], padding));
            }
        }

        // One polygon per connected stretch instead of one per sample pair
        let merged = unary_union(&polygons);
        let projected = if merged.0.is_empty() {
            MultiPolygon::new(polygons)
        } else {
            merged
        };
        Ok(Self {
            lonlat: unproject_geometry(&projected),
        })
    }

    /// Fence around a trace, padded by `padding` metres.
    pub fn from_trace(trace: &crate::trip_builder::Trace, padding: f64) -> Result<Self, ConflationError> {
        Self::from_projected_points(&trace.positions(), padding)
    }

    /// Convex hull of the union of all geometries buffered by `buffer` metres.
    pub fn convex_hull_of(geometries: &[Geometry<f64>], buffer: f64) -> Result<Self, ConflationError> {
        validate_padding(buffer)?;
        let coords: Vec<Coord<f64>> = geometries
            .iter()
            .flat_map(|g| g.coords_iter())
            .filter(|c| c.x.is_finite() && c.y.is_finite())
            .collect();
        if coords.is_empty() {
            return Err(ConflationError::MalformedGeometry(
                "no usable coordinates to bound".to_string(),
            ));
        }
        Ok(Self::from_projected_polygon(&padded_hull(&coords, buffer)))
    }

    pub fn lonlat(&self) -> &MultiPolygon<f64> {
        &self.lonlat
    }

    /// The fence reprojected to Web Mercator metres.
    pub fn projected(&self) -> MultiPolygon<f64> {
        project_geometry(&self.lonlat)
    }

    pub fn contains_lonlat(&self, c: Coord<f64>) -> bool {
        self.lonlat.contains(&Point::from(c))
    }

    /// Outer rings as `lat lon` pairs, in the form Overpass `poly:` filters expect.
    pub fn overpass_polygons(&self) -> Vec<String> {
        self.lonlat
            .0
            .iter()
            .map(|p| {
                p.exterior()
                    .0
                    .iter()
                    .map(|c| format!("{:.7} {:.7}", c.y, c.x))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }
}

fn validate_padding(padding: f64) -> Result<(), ConflationError> {
    if padding.is_finite() && padding > 0.0 {
        Ok(())
    } else {
        Err(ConflationError::Config(format!(
            "geofence padding must be a positive distance, got {}",
            padding
        )))
    }
}

fn padded_hull(centres: &[Coord<f64>], padding: f64) -> Polygon<f64> {
    let mut ring = Vec::with_capacity(centres.len() * CIRCLE_SEGMENTS);
    for c in centres {
        for i in 0..CIRCLE_SEGMENTS {
            let theta = i as f64 * std::f64::consts::TAU / CIRCLE_SEGMENTS as f64;
            ring.push(Point::new(
                c.x + padding * theta.cos(),
                c.y + padding * theta.sin(),
            ));
        }
    }
    MultiPoint::new(ring).convex_hull()
}
