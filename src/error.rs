use thiserror::Error;

/// Errors raised while provisioning networks, matching traces or conflating features.
///
/// Per-trace and per-feature failures are converted into typed "no result"
/// outcomes at the matcher and conflator boundaries. Only setup failures
/// (network construction, worker startup) reach the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConflationError {
    #[error("road network unavailable: {0}")]
    NetworkUnavailable(String),
    #[error("trace cannot be matched: {0}")]
    UnmatchableTrace(String),
    #[error("malformed geometry: {0}")]
    MalformedGeometry(String),
    #[error("worker {worker} failed to start: {reason}")]
    WorkerStartup { worker: usize, reason: String },
    #[error("network cache error at {path}: {reason}")]
    Cache { path: String, reason: String },
    #[error("i/o error: {0}")]
    Io(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ConflationError {
    /// Short machine-readable name of the error kind, used in output tables.
    pub fn kind(&self) -> &'static str {
        match self {
            ConflationError::NetworkUnavailable(_) => "network_unavailable",
            ConflationError::UnmatchableTrace(_) => "unmatchable_trace",
            ConflationError::MalformedGeometry(_) => "malformed_geometry",
            ConflationError::WorkerStartup { .. } => "worker_startup",
            ConflationError::Cache { .. } => "cache",
            ConflationError::Io(_) => "io",
            ConflationError::Config(_) => "config",
        }
    }

    /// Whether the error is scoped to one trace or feature rather than the whole run.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ConflationError::UnmatchableTrace(_) | ConflationError::MalformedGeometry(_)
        )
    }
}

impl From<std::io::Error> for ConflationError {
    fn from(e: std::io::Error) -> Self {
        ConflationError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for ConflationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ConflationError::NetworkUnavailable(format!("map source timed out: {}", e))
        } else {
            ConflationError::NetworkUnavailable(e.to_string())
        }
    }
}

impl From<osmpbf::Error> for ConflationError {
    fn from(e: osmpbf::Error) -> Self {
        ConflationError::NetworkUnavailable(format!("failed to read OSM extract: {}", e))
    }
}

impl From<config::ConfigError> for ConflationError {
    fn from(e: config::ConfigError) -> Self {
        ConflationError::Config(e.to_string())
    }
}
