use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::conflation::{ConflatorSettings, RoadClassFilter};
use crate::error::ConflationError;
use crate::lcss::LcssConfig;
use crate::map_source::{DEFAULT_OVERPASS_ENDPOINT, MapSource, OverpassSource, PbfSource};
use crate::mapmatcher::DEFAULT_GEOFENCE_PADDING;
use crate::network_provider::RoadNetworkProvider;
use crate::osm_preprocessing::NetworkKind;
use crate::trip_builder::{DEFAULT_MODE_TYPES, TripFilter};
use crate::trip_processor::NetworkMode;

/// Prefix of environment variables overriding the file, e.g. `TTC__MATCHING__WORKER_COUNT`.
pub const ENV_PREFIX: &str = "TTC";

/// Trace budget used by `--test` runs.
pub const TEST_RUN_TRACES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflationConfig {
    #[serde(default)]
    pub survey: SurveyConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub conflation: ConflationSection,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyConfig {
    #[serde(default = "SurveyConfig::default_location_path")]
    pub location_path: PathBuf,
    #[serde(default = "SurveyConfig::default_trip_path")]
    pub trip_path: PathBuf,
    #[serde(default = "SurveyConfig::default_modes")]
    pub modes: Vec<i32>,
}

impl SurveyConfig {
    fn default_location_path() -> PathBuf {
        PathBuf::from("location.csv")
    }
    fn default_trip_path() -> PathBuf {
        PathBuf::from("trip.csv")
    }
    fn default_modes() -> Vec<i32> {
        DEFAULT_MODE_TYPES.to_vec()
    }

    pub fn trip_filter(&self) -> TripFilter {
        TripFilter::new(self.modes.iter().copied())
    }
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            location_path: Self::default_location_path(),
            trip_path: Self::default_trip_path(),
            modes: Self::default_modes(),
        }
    }
}

/// Where the road network comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapSourceConfig {
    Pbf {
        path: PathBuf,
    },
    Overpass {
        #[serde(default = "MapSourceConfig::default_endpoint")]
        endpoint: String,
        #[serde(default = "MapSourceConfig::default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl MapSourceConfig {
    fn default_endpoint() -> String {
        DEFAULT_OVERPASS_ENDPOINT.to_string()
    }
    fn default_timeout_secs() -> u64 {
        180
    }

    pub fn build(&self) -> Arc<dyn MapSource> {
        match self {
            MapSourceConfig::Pbf { path } => Arc::new(PbfSource::new(path)),
            MapSourceConfig::Overpass {
                endpoint,
                timeout_secs,
            } => Arc::new(OverpassSource::new(
                endpoint.clone(),
                Duration::from_secs(*timeout_secs),
            )),
        }
    }
}

impl Default for MapSourceConfig {
    fn default() -> Self {
        MapSourceConfig::Overpass {
            endpoint: Self::default_endpoint(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// GeoJSON polygon(s) bounding the study region, in lon/lat
    pub region_path: PathBuf,
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default)]
    pub source: MapSourceConfig,
    #[serde(default)]
    pub kind: NetworkKind,
}

impl NetworkConfig {
    pub fn provider(&self) -> RoadNetworkProvider {
        let provider = RoadNetworkProvider::new(self.source.build());
        match &self.cache_path {
            Some(path) => provider.with_cache(path),
            None => provider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "MatchingConfig::default_worker_count")]
    pub worker_count: usize,
    /// Metres of padding around each trace
    #[serde(default = "MatchingConfig::default_geofence_padding")]
    pub geofence_padding: f64,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub max_traces: Option<usize>,
    #[serde(default)]
    pub lcss: LcssConfig,
}

impl MatchingConfig {
    fn default_worker_count() -> usize {
        8
    }
    fn default_geofence_padding() -> f64 {
        DEFAULT_GEOFENCE_PADDING
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            worker_count: Self::default_worker_count(),
            geofence_padding: Self::default_geofence_padding(),
            network_mode: NetworkMode::default(),
            max_traces: None,
            lcss: LcssConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflationSection {
    /// GeoJSON of the static features; conflation is skipped without it
    #[serde(default)]
    pub features_path: Option<PathBuf>,
    /// Property holding each feature's identifier
    #[serde(default)]
    pub id_property: Option<String>,
    #[serde(default = "ConflationSection::default_road_classes")]
    pub road_classes: Vec<String>,
    #[serde(flatten)]
    pub settings: ConflatorSettings,
}

impl ConflationSection {
    fn default_road_classes() -> Vec<String> {
        vec!["motorway".to_string()]
    }

    /// No filter when the class list is empty.
    pub fn road_class_filter(&self) -> Option<RoadClassFilter> {
        if self.road_classes.is_empty() {
            None
        } else {
            Some(RoadClassFilter::new(self.road_classes.iter().cloned()))
        }
    }
}

impl Default for ConflationSection {
    fn default() -> Self {
        Self {
            features_path: None,
            id_property: None,
            road_classes: Self::default_road_classes(),
            settings: ConflatorSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "OutputConfig::default_directory")]
    pub directory: PathBuf,
}

impl OutputConfig {
    fn default_directory() -> PathBuf {
        PathBuf::from("output")
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: Self::default_directory(),
        }
    }
}

impl ConflationConfig {
    /// Load a TOML file, overridden by `TTC__`-prefixed environment variables.
    pub fn load(path: &Path) -> Result<Self, ConflationError> {
        Self::load_with_env(path, None)
    }

    fn load_with_env(path: &Path, env: Option<config::Map<String, String>>) -> Result<Self, ConflationError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .map_err(|e| {
                ConflationError::Config(format!("failed to read config file '{}': {}", path.display(), e))
            })?;
        let config: ConflationConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConflationError> {
        if self.matching.worker_count == 0 {
            return Err(ConflationError::Config("matching.worker_count must be at least 1".to_string()));
        }
        if !(self.matching.geofence_padding > 0.0) {
            return Err(ConflationError::Config(format!(
                "matching.geofence_padding must be positive, got {}",
                self.matching.geofence_padding
            )));
        }
        if !(self.conflation.settings.buffer > 0.0) || self.conflation.settings.search_tolerance < 0.0 {
            return Err(ConflationError::Config(
                "conflation.buffer must be positive and conflation.search_tolerance non-negative".to_string(),
            ));
        }
        self.matching.lcss.validate()
    }
}
