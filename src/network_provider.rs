use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;

use crate::error::ConflationError;
use crate::geofence::Geofence;
use crate::map_source::MapSource;
use crate::osm_preprocessing::NetworkKind;
use crate::road_network::{NetworkSnapshot, RoadNetwork, SNAPSHOT_FORMAT_VERSION};

/// Builds or loads routable networks for a region.
///
/// Cheap to clone; every worker holds its own provider handle and obtains its
/// own network from it.
#[derive(Clone)]
pub struct RoadNetworkProvider {
    source: Arc<dyn MapSource>,
    cache_path: Option<PathBuf>,
}

impl RoadNetworkProvider {
    pub fn new(source: Arc<dyn MapSource>) -> Self {
        Self {
            source,
            cache_path: None,
        }
    }

    pub fn with_cache(mut self, cache_path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(cache_path.into());
        self
    }

    pub fn cache_path(&self) -> Option<&Path> {
        self.cache_path.as_deref()
    }

    /// Load the cached regional network, or build it from the map source and
    /// publish it to the cache.
    pub fn obtain_network(
        &self,
        region: &Geofence,
        kind: NetworkKind,
    ) -> Result<RoadNetwork, ConflationError> {
        if let Some(path) = &self.cache_path {
            if path.exists() {
                match load_network(path) {
                    Ok(network) if network.kind() == kind => {
                        info!(
                            "Loaded cached {} network with {} edges from {}",
                            kind,
                            network.edge_count(),
                            path.display()
                        );
                        return Ok(network);
                    }
                    Ok(network) => warn!(
                        "Cached network at {} is {}, wanted {}; rebuilding",
                        path.display(),
                        network.kind(),
                        kind
                    ),
                    Err(e) => warn!("Ignoring unreadable network cache: {}", e),
                }
            }
        }

        let network = self.fetch_bounded(region, kind)?;

        if let Some(path) = &self.cache_path {
            if let Err(e) = save_network(path, &network) {
                warn!("Could not publish network cache: {}", e);
            }
        }
        Ok(network)
    }

    /// Build a fresh network bounded by `region`, bypassing the cache.
    pub fn fetch_bounded(
        &self,
        region: &Geofence,
        kind: NetworkKind,
    ) -> Result<RoadNetwork, ConflationError> {
        let start = Instant::now();
        let network = self.source.fetch(region, kind)?;
        if network.is_empty() {
            return Err(ConflationError::NetworkUnavailable(format!(
                "{} source has no {} roads for the region",
                self.source.name(),
                kind
            )));
        }
        debug!(
            "Fetched {} edges from {} in {:?}",
            network.edge_count(),
            self.source.name(),
            start.elapsed()
        );
        Ok(network)
    }
}

/// Restrict `network` to the elements intersecting `bounding`.
pub fn extract_subgraph(network: &RoadNetwork, bounding: &Geofence) -> RoadNetwork {
    network.extract_subgraph(bounding)
}

fn cache_error(path: &Path, reason: impl ToString) -> ConflationError {
    ConflationError::Cache {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

pub fn load_network(path: &Path) -> Result<RoadNetwork, ConflationError> {
    let start = Instant::now();
    let file = File::open(path).map_err(|e| cache_error(path, e))?;
    let mut reader = BufReader::new(file);
    let snapshot: NetworkSnapshot =
        bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| cache_error(path, e))?;
    if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
        return Err(cache_error(
            path,
            format!("unsupported snapshot version {}", snapshot.format_version),
        ));
    }
    let network = RoadNetwork::from_snapshot(snapshot)?;
    debug!("Decoded network cache in {:?}", start.elapsed());
    Ok(network)
}

/// Write the network next to `path` and atomically rename it into place, so
/// concurrent readers never observe a partial file.
pub fn save_network(path: &Path, network: &RoadNetwork) -> Result<(), ConflationError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| cache_error(path, e))?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| cache_error(path, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        bincode::serde::encode_into_std_write(
            network.to_snapshot(),
            &mut writer,
            bincode::config::standard(),
        )
        .map_err(|e| cache_error(path, e))?;
        writer.flush().map_err(|e| cache_error(path, e))?;
    }
    tmp.persist(path).map_err(|e| cache_error(path, e.error))?;
    info!("Published network cache to {}", path.display());
    Ok(())
}
