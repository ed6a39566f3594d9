//! Map matching of survey trip traces against an OpenStreetMap road network,
//! and conflation of static features onto the same network.

pub mod aggregate;
pub mod config;
pub mod conflation;
pub mod error;
pub mod geofence;
pub mod io;
pub mod lcss;
pub mod map_source;
pub mod mapmatcher;
pub mod network_provider;
pub mod osm_preprocessing;
pub mod projection;
pub mod road_network;
pub mod routing;
pub mod trip_builder;
pub mod trip_processor;

pub use error::ConflationError;
