//! Spherical Web Mercator (EPSG:3857) conversions.
//!
//! Network, trace and feature geometry live in projected metres; geofences and
//! region boundaries are kept in lon/lat and projected on demand.

use geo::{Coord, MapCoords};

pub const EARTH_RADIUS: f64 = 6378137.0;

/// Latitude beyond which Web Mercator diverges.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Convert lon/lat degrees (EPSG:4326) to Web Mercator metres (EPSG:3857).
pub fn lonlat_to_web_mercator(c: Coord<f64>) -> Coord<f64> {
    let lat = c.y.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    Coord {
        x: EARTH_RADIUS * c.x.to_radians(),
        y: EARTH_RADIUS * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln(),
    }
}

/// Convert Web Mercator metres back to lon/lat degrees.
pub fn web_mercator_to_lonlat(c: Coord<f64>) -> Coord<f64> {
    Coord {
        x: (c.x / EARTH_RADIUS).to_degrees(),
        y: (2.0 * (c.y / EARTH_RADIUS).exp().atan() - std::f64::consts::FRAC_PI_2).to_degrees(),
    }
}

pub fn project_geometry<G>(geometry: &G) -> G::Output
where
    G: MapCoords<f64, f64>,
{
    geometry.map_coords(lonlat_to_web_mercator)
}

pub fn unproject_geometry<G>(geometry: &G) -> G::Output
where
    G: MapCoords<f64, f64>,
{
    geometry.map_coords(web_mercator_to_lonlat)
}

/// True when the coordinate is a finite, in-range lon/lat pair.
pub fn is_valid_lonlat(c: Coord<f64>) -> bool {
    c.x.is_finite()
        && c.y.is_finite()
        && (-180.0..=180.0).contains(&c.x)
        && (-90.0..=90.0).contains(&c.y)
}
