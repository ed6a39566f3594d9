mod common;

use common::*;
use geo::{Geometry, LineString, Point};
use std::collections::BTreeSet;
use std::sync::Arc;
use trip_trace_conflation::aggregate::{AggregatedOutput, conflated_links, feature_paths, flag_by_edge_membership};
use trip_trace_conflation::conflation::{ConflatorSettings, LinkConflator, RoadClassFilter, StaticFeature};
use trip_trace_conflation::lcss::LcssConfig;
use trip_trace_conflation::map_source::InMemorySource;
use trip_trace_conflation::mapmatcher::MapMatcher;
use trip_trace_conflation::network_provider::RoadNetworkProvider;
use trip_trace_conflation::projection::unproject_geometry;

fn line(from: (f64, f64), to: (f64, f64)) -> Geometry<f64> {
    LineString::from(vec![at(from.0, from.1), at(to.0, to.1)]).into()
}

fn conflator() -> LinkConflator {
    LinkConflator::new(ConflatorSettings {
        worker_count: 3,
        ..Default::default()
    })
}

#[test]
fn features_snap_to_nearest_edges_and_distant_ones_are_dropped() {
    let network = city_grid();
    let features = vec![
        // Lies on the motorway between junctions 1 and 2
        StaticFeature::from_projected("overlap", line((40.0, 0.0), (160.0, 0.0))),
        // 5 m east of the avenue between junctions 5 and 8
        StaticFeature::from_projected("beside", line((205.0, 250.0), (205.0, 350.0))),
        StaticFeature::from_projected("outside", line((50_000.0, 0.0), (50_100.0, 0.0))),
    ];

    let report = conflator().conflate(&features, &network, None).unwrap();
    assert_eq!(report.matched.len(), 2);
    let by_feature: Vec<(&str, _)> = report
        .matched
        .iter()
        .map(|r| (r.feature_id.as_str(), r.edge_id))
        .collect();
    assert_eq!(by_feature, vec![("beside", edge(5, 8)), ("overlap", edge(1, 2))]);
    assert!(report.matched[1].distance < 1e-6);
    assert!((report.matched[0].distance - 5.0).abs() < 1e-6);

    assert_eq!(report.dropped.len(), 1);
    assert_eq!(report.dropped[0].feature_id, "outside");
    assert_eq!(report.edge_ids(), BTreeSet::from([edge(1, 2), edge(5, 8)]));
}

#[test]
fn conflation_fetches_only_the_feature_hull() {
    let provider = RoadNetworkProvider::new(Arc::new(InMemorySource::new(city_grid())));
    let feature = StaticFeature::from_lonlat("lane", &unproject_geometry(&line((250.0, -4.0), (350.0, -4.0)))).unwrap();
    let filter = RoadClassFilter::new(["motorway"]);

    let report = conflator()
        .conflate_with_provider(&[feature], &provider, Some(&filter))
        .unwrap();
    assert_eq!(report.matched.len(), 1);
    assert_eq!(report.matched[0].edge_id, edge(2, 3));
    assert_eq!(report.matched[0].attributes.highway.as_deref(), Some("motorway"));

    let rows = conflated_links(&report);
    assert_eq!(rows[0].road_id, "(2, 3, 0)");
    assert!(rows[0].geometry.starts_with("LINESTRING"));
}

#[test]
fn trips_on_a_conflated_facility_are_flagged() {
    let network = city_grid();
    let matcher = MapMatcher::new(LcssConfig::default(), 300.0).unwrap();
    let traces = vec![motorway_trip("T1"), northern_trip("T2")];
    let outcomes: Vec<_> = traces.iter().map(|t| matcher.match_trace(t, &network)).collect();
    let output = AggregatedOutput::from_outcomes(&traces, &outcomes);
    assert_eq!(output.matched_trip_ids().len(), 2);

    let facility = StaticFeature::from_projected("express", line((250.0, -4.0), (350.0, -4.0)));
    let report = conflator()
        .conflate(&[facility], &network, Some(&RoadClassFilter::new(["motorway"])))
        .unwrap();

    let flagged = flag_by_edge_membership(&output.matched_paths, &report.edge_ids());
    assert_eq!(flagged, BTreeSet::from(["T1".to_string()]));

    let none = flag_by_edge_membership(&output.matched_paths, &BTreeSet::from([edge(4, 7)]));
    assert!(none.is_empty());
}

#[test]
fn line_features_are_map_matched_and_tagged_with_their_id() {
    let provider = RoadNetworkProvider::new(Arc::new(InMemorySource::new(city_grid())));
    let lane: LineString<f64> = motorway_trip("express").positions().into();
    let features = vec![
        StaticFeature::from_lonlat("express", &unproject_geometry(&Geometry::from(lane))).unwrap(),
        StaticFeature::from_lonlat("sign", &unproject_geometry(&Geometry::from(Point::from(at(200.0, 8.0))))).unwrap(),
    ];

    let conflator = conflator();
    let network = conflator.fetch_network(&features, &provider).unwrap();
    let report = conflator
        .match_features(&features, network, LcssConfig::default(), 300.0)
        .unwrap();
    assert_eq!(report.skipped, vec!["sign".to_string()]);
    assert_eq!(report.matched_count(), 1);

    let rows = feature_paths(&report);
    assert!(rows.iter().all(|r| r.original_id == "express"));
    let roads: Vec<&str> = rows.iter().map(|r| r.road_id.as_str()).collect();
    assert_eq!(roads, vec!["(1, 2, 0)", "(2, 3, 0)"]);
    assert_eq!(rows.iter().map(|r| r.rownum).collect::<Vec<_>>(), vec![0, 1]);
    assert!(rows.iter().all(|r| r.highway == "motorway"));
}
