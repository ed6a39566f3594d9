use anyhow::{Context, Result, bail};
use geo::{Geometry, GeometryCollection, MultiPolygon};
use geojson::GeoJson;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::aggregate::{AggregatedOutput, ConflatedLinkRow, FeaturePathRow, FlaggedTripRow};
use crate::conflation::{DroppedFeature, StaticFeature};
use crate::error::ConflationError;
use crate::geofence::Geofence;
use crate::trip_builder::{LocationRecord, TripFilter, TripRecord};

pub const TRACE_POINTS_FILE: &str = "trace_points.csv";
pub const TRACE_LINES_FILE: &str = "trace_lines.csv";
pub const MATCHED_POINTS_FILE: &str = "matched_points.csv";
pub const MATCHED_PATHS_FILE: &str = "matched_paths.csv";
pub const UNMATCHED_FILE: &str = "unmatched_trips.csv";
pub const CONFLATED_LINKS_FILE: &str = "conflated_links.csv";
pub const FLAGGED_TRIPS_FILE: &str = "flagged_trips.csv";
pub const FEATURE_PATHS_FILE: &str = "feature_paths.csv";

/// Read every row of a CSV table, skipping rows that fail to deserialize.
fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Unable to open {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_reader(file);

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for result in rdr.deserialize() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => {
                if skipped == 0 {
                    warn!("Skipping unreadable row in {}: {}", path.display(), e);
                }
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!("Skipped {} unreadable rows in {}", skipped, path.display());
    }
    debug!("Read {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

pub fn read_locations(path: &Path) -> Result<Vec<LocationRecord>> {
    read_csv(path)
}

pub fn read_trips(path: &Path) -> Result<Vec<TripRecord>> {
    read_csv(path)
}

/// Keep the location records of trips the filter accepts, carrying the trip's
/// mode onto each record.
pub fn select_locations(
    locations: Vec<LocationRecord>,
    trips: &[TripRecord],
    filter: &TripFilter,
) -> Vec<LocationRecord> {
    let selected = filter.select(trips);
    let modes: BTreeMap<&str, Option<i32>> = trips
        .iter()
        .filter(|t| selected.contains(&t.trip_id))
        .map(|t| (t.trip_id.as_str(), t.mode_type))
        .collect();

    let total = locations.len();
    let kept: Vec<LocationRecord> = locations
        .into_iter()
        .filter_map(|mut r| {
            let mode = *modes.get(r.trip_id.as_str())?;
            r.mode_type = r.mode_type.or(mode);
            Some(r)
        })
        .collect();
    info!(
        "Selected {} trips ({} of {} location records)",
        selected.len(),
        kept.len(),
        total
    );
    kept
}

fn read_geojson(path: &Path) -> Result<GeoJson> {
    let text = fs::read_to_string(path).with_context(|| format!("Unable to read {}", path.display()))?;
    text.parse::<GeoJson>()
        .with_context(|| format!("{} is not valid GeoJSON", path.display()))
}

/// The region boundary: every polygon in the file, in lon/lat.
pub fn read_region(path: &Path) -> Result<Geofence> {
    let collection = GeometryCollection::<f64>::try_from(&read_geojson(path)?)
        .with_context(|| format!("Unsupported geometry in {}", path.display()))?;

    let mut polygons = Vec::new();
    for geometry in collection.0 {
        match geometry {
            Geometry::Polygon(p) => polygons.push(p),
            Geometry::MultiPolygon(mp) => polygons.extend(mp.0),
            other => debug!("Ignoring non-polygon region geometry {:?}", other),
        }
    }
    if polygons.is_empty() {
        bail!("{} contains no polygon", path.display());
    }
    Ok(Geofence::from_multi_polygon(MultiPolygon::new(polygons)))
}

/// Static features from a GeoJSON feature collection. The feature id is taken
/// from `id_property` when present, then the GeoJSON id, then the position
/// in the file.
pub fn read_features(path: &Path, id_property: Option<&str>) -> Result<(Vec<StaticFeature>, Vec<DroppedFeature>)> {
    let features = match read_geojson(path)? {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(g) => vec![geojson::Feature {
            geometry: Some(g),
            ..Default::default()
        }],
    };

    let mut parsed = Vec::with_capacity(features.len());
    let mut dropped = Vec::new();
    for (index, feature) in features.into_iter().enumerate() {
        let id = id_property
            .and_then(|name| feature.property(name))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .or_else(|| {
                feature.id.as_ref().map(|id| match id {
                    geojson::feature::Id::String(s) => s.clone(),
                    geojson::feature::Id::Number(n) => n.to_string(),
                })
            })
            .unwrap_or_else(|| index.to_string());

        let geometry = feature
            .geometry
            .ok_or_else(|| ConflationError::MalformedGeometry(format!("feature {} has no geometry", id)))
            .and_then(|g| {
                Geometry::<f64>::try_from(g).map_err(|e| ConflationError::MalformedGeometry(e.to_string()))
            })
            .and_then(|g| StaticFeature::from_lonlat(id.clone(), &g));
        match geometry {
            Ok(f) => parsed.push(f),
            Err(reason) => {
                warn!("Skipping feature {}: {}", id, reason);
                dropped.push(DroppedFeature { feature_id: id, reason });
            }
        }
    }
    info!("Read {} features from {}", parsed.len(), path.display());
    Ok((parsed, dropped))
}

/// Write rows as CSV, publishing the file only once it is complete.
pub fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("Unable to create {}", dir.display()))?;

    let tmp = NamedTempFile::new_in(dir)?;
    let mut writer = csv::Writer::from_writer(tmp);
    for row in rows {
        writer.serialize(row)?;
    }
    let mut tmp = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Unable to flush {}: {}", path.display(), e.error()))?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("Unable to publish {}", path.display()))?;
    debug!("Wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

/// Write all match tables into `dir`.
pub fn write_match_tables(dir: &Path, output: &AggregatedOutput) -> Result<()> {
    write_table(&dir.join(TRACE_POINTS_FILE), &output.trace_points)?;
    write_table(&dir.join(TRACE_LINES_FILE), &output.trace_lines)?;
    write_table(&dir.join(MATCHED_POINTS_FILE), &output.matched_points)?;
    write_table(&dir.join(MATCHED_PATHS_FILE), &output.matched_paths)?;
    write_table(&dir.join(UNMATCHED_FILE), &output.unmatched)?;
    info!("Wrote match tables to {}", dir.display());
    Ok(())
}

pub fn write_conflation_tables(
    dir: &Path,
    links: &[ConflatedLinkRow],
    feature_paths: &[FeaturePathRow],
    flagged: &[FlaggedTripRow],
) -> Result<()> {
    write_table(&dir.join(CONFLATED_LINKS_FILE), links)?;
    write_table(&dir.join(FEATURE_PATHS_FILE), feature_paths)?;
    write_table(&dir.join(FLAGGED_TRIPS_FILE), flagged)?;
    info!(
        "Wrote {} conflated links, {} feature path rows and {} flagged trips to {}",
        links.len(),
        feature_paths.len(),
        flagged.len(),
        dir.display()
    );
    Ok(())
}
