mod common;

use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::tempdir;
use trip_trace_conflation::ConflationError;
use trip_trace_conflation::geofence::Geofence;
use trip_trace_conflation::lcss::LcssConfig;
use trip_trace_conflation::map_source::{InMemorySource, MapSource};
use trip_trace_conflation::network_provider::RoadNetworkProvider;
use trip_trace_conflation::osm_preprocessing::NetworkKind;
use trip_trace_conflation::road_network::RoadNetwork;
use trip_trace_conflation::trip_builder::Trace;
use trip_trace_conflation::trip_processor::{BatchSettings, MatchOrchestrator, NetworkMode};

/// Counts fetches made against an in-memory network.
struct CountingSource {
    inner: InMemorySource,
    fetches: AtomicUsize,
}

impl MapSource for CountingSource {
    fn name(&self) -> &str {
        "counting"
    }

    fn fetch(&self, region: &Geofence, kind: NetworkKind) -> Result<RoadNetwork, ConflationError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(region, kind)
    }
}

fn counting_source() -> Arc<CountingSource> {
    Arc::new(CountingSource {
        inner: InMemorySource::new(city_grid()),
        fetches: AtomicUsize::new(0),
    })
}

fn orchestrator(provider: RoadNetworkProvider) -> MatchOrchestrator {
    MatchOrchestrator::new(
        provider,
        BatchSettings {
            region: region(),
            network_kind: NetworkKind::Drive,
            network_mode: NetworkMode::SharedRegional,
            geofence_padding: 300.0,
            lcss: LcssConfig::default(),
        },
    )
}

fn traces() -> Vec<Trace> {
    vec![
        motorway_trip("t1"),
        northern_trip("t2"),
        distant_trip("t3"),
        motorway_trip("t4"),
        trace("t5", &[(197.0, 20.0), (197.0, 60.0), (197.0, 100.0), (197.0, 140.0), (197.0, 180.0)]),
        distant_trip("t6"),
    ]
}

#[test]
fn worker_count_does_not_change_outcomes() {
    let provider = RoadNetworkProvider::new(Arc::new(InMemorySource::new(city_grid())));
    let orchestrator = orchestrator(provider);

    let sequential = orchestrator
        .run_batch(traces(), 1, NetworkMode::SharedRegional, 300.0)
        .unwrap();
    let parallel = orchestrator
        .run_batch(traces(), 4, NetworkMode::SharedRegional, 300.0)
        .unwrap();

    assert_eq!(sequential.outcomes.len(), 6);
    assert_eq!(parallel.outcomes.len(), 6);
    assert_eq!(sequential.matched_trip_ids(), parallel.matched_trip_ids());
    assert_eq!(
        sequential.matched_trip_ids().into_iter().collect::<Vec<_>>(),
        vec!["t1", "t2", "t4", "t5"]
    );
    assert_eq!(sequential.into_keyed(), parallel.into_keyed());
}

#[test]
fn per_trace_networks_match_the_same_trips() {
    let provider = RoadNetworkProvider::new(Arc::new(InMemorySource::new(city_grid())));
    let orchestrator = orchestrator(provider);

    let shared = orchestrator
        .run_batch(traces(), 3, NetworkMode::SharedRegional, 300.0)
        .unwrap();
    let per_trace = orchestrator
        .run_batch(traces(), 3, NetworkMode::PerTrace, 300.0)
        .unwrap();
    assert_eq!(shared.matched_trip_ids(), per_trace.matched_trip_ids());
    assert_eq!(per_trace.unmatched_count(), 2);
}

#[test]
fn regional_network_is_cached_between_batches() {
    let dir = tempdir().unwrap();
    let cache = dir.path().join("network.bin");
    let source = counting_source();
    let provider = RoadNetworkProvider::new(source.clone()).with_cache(&cache);
    let orchestrator = orchestrator(provider);

    let first = orchestrator
        .run_batch(vec![motorway_trip("t1")], 1, NetworkMode::SharedRegional, 300.0)
        .unwrap();
    assert!(cache.exists());
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    let second = orchestrator
        .run_batch(vec![motorway_trip("t1")], 2, NetworkMode::SharedRegional, 300.0)
        .unwrap();
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(first.into_keyed(), second.into_keyed());
}

#[test]
fn empty_region_aborts_the_batch() {
    let provider = RoadNetworkProvider::new(Arc::new(InMemorySource::new(city_grid())));
    let far_region = Geofence::from_projected_points(&[at(90_000.0, 90_000.0)], 100.0).unwrap();
    let orchestrator = MatchOrchestrator::new(
        provider,
        BatchSettings {
            region: far_region,
            network_kind: NetworkKind::Drive,
            network_mode: NetworkMode::SharedRegional,
            geofence_padding: 300.0,
            lcss: LcssConfig::default(),
        },
    );
    let err = orchestrator
        .run_batch(traces(), 2, NetworkMode::SharedRegional, 300.0)
        .unwrap_err();
    assert!(matches!(err, ConflationError::WorkerStartup { .. }));
}
