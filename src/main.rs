use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use trip_trace_conflation::aggregate::{
    AggregatedOutput, conflated_links, feature_paths, flag_by_edge_membership, flag_by_way_membership,
    flagged_rows,
};
use trip_trace_conflation::config::{ConflationConfig, TEST_RUN_TRACES};
use trip_trace_conflation::conflation::LinkConflator;
use trip_trace_conflation::io;
use trip_trace_conflation::trip_builder::TraceBuilder;
use trip_trace_conflation::trip_processor::{BatchSettings, MatchOrchestrator, NetworkMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Map-match survey trip traces and conflate facility links", long_about = None)]
struct Args {
    /// TOML run configuration
    #[arg(short, long, default_value = "trip_trace_conflation.toml")]
    config: PathBuf,
    /// Only process the first few traces
    #[arg(long)]
    test: bool,
    #[arg(long)]
    max_traces: Option<usize>,
    #[arg(short, long)]
    workers: Option<usize>,
    /// Fetch a fresh network around every trace instead of sharing the regional one
    #[arg(long)]
    per_trace_network: bool,
    /// Metres of padding around each trace
    #[arg(long)]
    geofence_padding: Option<f64>,
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_target(false)
        .format_timestamp(None)
        .target(env_logger::Target::Stderr)
        .init();
    info!("Starting trip trace conflation");
    let start = Instant::now();

    info!("Step 1: Loading configuration from {}", args.config.display());
    let mut config = ConflationConfig::load(&args.config)?;
    if let Some(workers) = args.workers {
        config.matching.worker_count = workers;
    }
    if let Some(padding) = args.geofence_padding {
        config.matching.geofence_padding = padding;
    }
    if args.per_trace_network {
        config.matching.network_mode = NetworkMode::PerTrace;
    }
    if args.max_traces.is_some() {
        config.matching.max_traces = args.max_traces;
    } else if args.test {
        config.matching.max_traces = Some(TEST_RUN_TRACES);
    }
    config.validate()?;

    info!("Step 2: Preparing the regional road network");
    let region = io::read_region(&config.network.region_path)?;
    let provider = config.network.provider();
    if config.matching.network_mode == NetworkMode::SharedRegional && provider.cache_path().is_some() {
        // Populate the cache once so workers only ever read it
        let network = provider.obtain_network(&region, config.network.kind)?;
        info!(
            "Regional network ready: {} junctions, {} edges",
            network.junction_count(),
            network.edge_count()
        );
    }

    info!("Step 3: Building traces from survey locations");
    let locations = io::read_locations(&config.survey.location_path)?;
    let trips = io::read_trips(&config.survey.trip_path)?;
    let selected = io::select_locations(locations, &trips, &config.survey.trip_filter());
    let built = TraceBuilder::new()
        .with_max_traces(config.matching.max_traces)
        .build(selected);
    for (trip_id, reason) in &built.rejected {
        warn!("Trip {} has no usable trace: {}", trip_id, reason);
    }

    info!("Step 4: Matching {} traces", built.traces.len());
    let orchestrator = MatchOrchestrator::new(
        provider.clone(),
        BatchSettings {
            region,
            network_kind: config.network.kind,
            network_mode: config.matching.network_mode,
            geofence_padding: config.matching.geofence_padding,
            lcss: config.matching.lcss.clone(),
        },
    );
    let report = orchestrator.run_batch(
        built.traces.clone(),
        config.matching.worker_count,
        config.matching.network_mode,
        config.matching.geofence_padding,
    )?;

    info!("Step 5: Writing match tables");
    let mut output = AggregatedOutput::from_outcomes(&built.traces, &report.outcomes);
    for (trip_id, reason) in built.rejected {
        output.unmatched.push(trip_trace_conflation::aggregate::UnmatchedRow {
            trip_id,
            kind: reason.kind().to_string(),
            reason: reason.to_string(),
        });
    }
    io::write_match_tables(&config.output.directory, &output)?;

    if let Some(features_path) = &config.conflation.features_path {
        info!("Step 6: Conflating features from {}", features_path.display());
        let (features, unreadable) = io::read_features(features_path, config.conflation.id_property.as_deref())?;
        let conflator = LinkConflator::new(config.conflation.settings.clone());
        let filter = config.conflation.road_class_filter();
        let network = conflator.fetch_network(&features, &provider)?;
        let conflation = conflator.conflate(&features, &network, filter.as_ref())?;
        info!(
            "{} features conflated, {} dropped",
            conflation.matched.len(),
            conflation.dropped.len() + unreadable.len()
        );

        info!("Step 7: Map-matching line features");
        let feature_matches = conflator.match_features(
            &features,
            network,
            config.matching.lcss.clone(),
            config.matching.geofence_padding,
        )?;

        let mut flagged: BTreeSet<String> = flag_by_edge_membership(&output.matched_paths, &conflation.edge_ids());
        flagged.extend(flag_by_way_membership(&output.matched_paths, &conflation.osm_way_ids()));
        info!("{} trips used the conflated facility", flagged.len());
        io::write_conflation_tables(
            &config.output.directory,
            &conflated_links(&conflation),
            &feature_paths(&feature_matches),
            &flagged_rows(&flagged),
        )?;
    }

    info!(
        "Finished: {} matched, {} unmatched in {:?}",
        report.matched_count(),
        output.unmatched.len(),
        start.elapsed()
    );
    Ok(())
}
