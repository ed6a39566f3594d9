use log::{debug, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::ConflationError;
use crate::geofence::Geofence;
use crate::osm_preprocessing::{NetworkBuilder, NetworkKind, read_pbf};
use crate::road_network::RoadNetwork;

/// An external supplier of road data for a region.
pub trait MapSource: Send + Sync {
    fn name(&self) -> &str;

    /// Build the network of `kind` bounded by `region`.
    fn fetch(&self, region: &Geofence, kind: NetworkKind) -> Result<RoadNetwork, ConflationError>;
}

/// Reads roads from a local OpenStreetMap PBF extract.
pub struct PbfSource {
    path: PathBuf,
}

impl PbfSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MapSource for PbfSource {
    fn name(&self) -> &str {
        "pbf"
    }

    fn fetch(&self, region: &Geofence, kind: NetworkKind) -> Result<RoadNetwork, ConflationError> {
        if !self.path.exists() {
            return Err(ConflationError::NetworkUnavailable(format!(
                "OSM extract {} does not exist",
                self.path.display()
            )));
        }
        read_pbf(&self.path, region, kind)
    }
}

pub const DEFAULT_OVERPASS_ENDPOINT: &str = "https://overpass-api.de/api/interpreter";

/// Queries an Overpass API endpoint for highway ways inside the region.
///
/// Requests are bounded by `timeout`; a timeout surfaces as `NetworkUnavailable`.
pub struct OverpassSource {
    endpoint: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OverpassElement {
    Node {
        id: u64,
        lat: f64,
        lon: f64,
    },
    Way {
        id: u64,
        #[serde(default)]
        nodes: Vec<u64>,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    #[serde(other)]
    Other,
}

impl OverpassSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }

    /// Overpass QL selecting highways inside every ring of the fence, with their nodes.
    pub fn build_query(&self, region: &Geofence) -> String {
        let selectors: String = region
            .overpass_polygons()
            .iter()
            .map(|poly| format!("way[\"highway\"](poly:\"{}\");", poly))
            .collect();
        format!(
            "[out:json][timeout:{}];({});(._;>;);out;",
            self.timeout.as_secs().max(1),
            selectors
        )
    }
}

impl MapSource for OverpassSource {
    fn name(&self) -> &str {
        "overpass"
    }

    fn fetch(&self, region: &Geofence, kind: NetworkKind) -> Result<RoadNetwork, ConflationError> {
        let start = Instant::now();
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let response: OverpassResponse = client
            .post(&self.endpoint)
            .form(&[("data", self.build_query(region))])
            .send()?
            .error_for_status()?
            .json()?;
        debug!(
            "Overpass returned {} elements in {:?}",
            response.elements.len(),
            start.elapsed()
        );

        let network = network_from_elements(response.elements, kind)?.extract_subgraph(region);
        if network.is_empty() {
            return Err(ConflationError::NetworkUnavailable(
                "Overpass returned no roads for the region".to_string(),
            ));
        }
        info!(
            "Fetched {} {} edges from Overpass in {:?}",
            network.edge_count(),
            kind,
            start.elapsed()
        );
        Ok(network)
    }
}

fn network_from_elements(
    elements: Vec<OverpassElement>,
    kind: NetworkKind,
) -> Result<RoadNetwork, ConflationError> {
    let mut builder = NetworkBuilder::new(kind);
    for element in elements {
        match element {
            OverpassElement::Node { id, lat, lon } => builder.add_node(id, lon, lat),
            OverpassElement::Way { id, nodes, tags } => {
                builder.add_way(id, nodes, tags);
            }
            OverpassElement::Other => {}
        }
    }
    builder.build()
}

/// Serves a fixed, already-built network, clipped to each requested region.
pub struct InMemorySource {
    network: RoadNetwork,
}

impl InMemorySource {
    pub fn new(network: RoadNetwork) -> Self {
        Self { network }
    }
}

impl MapSource for InMemorySource {
    fn name(&self) -> &str {
        "in_memory"
    }

    fn fetch(&self, region: &Geofence, kind: NetworkKind) -> Result<RoadNetwork, ConflationError> {
        if kind != self.network.kind() {
            return Err(ConflationError::NetworkUnavailable(format!(
                "in-memory network is {}, not {}",
                self.network.kind(),
                kind
            )));
        }
        Ok(self.network.extract_subgraph(region))
    }
}
