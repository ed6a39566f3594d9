use crossbeam::channel::{self, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{Level, debug, info, log, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

use crate::error::ConflationError;
use crate::geofence::Geofence;
use crate::lcss::LcssConfig;
use crate::mapmatcher::{MapMatcher, MatchOutcome, panic_message};
use crate::network_provider::RoadNetworkProvider;
use crate::osm_preprocessing::NetworkKind;
use crate::road_network::RoadNetwork;
use crate::trip_builder::{Trace, TripId};

/// Successful matches between progress messages, per worker.
pub const PROGRESS_INTERVAL: usize = 100;

/// Where each match gets its road network from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Each worker builds or loads the regional network once and reuses it
    #[default]
    SharedRegional,
    /// A fresh bounded network is fetched for every trace
    PerTrace,
}

/// A log line produced inside a worker, forwarded to the single listener.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub worker: usize,
    pub level: Level,
    pub message: String,
}

/// Sink for worker log output: straight to `log` when sequential, over a
/// channel to the listener thread when parallel.
#[derive(Clone)]
pub enum LogSink {
    Direct,
    Channel(Sender<LogEvent>),
}

impl LogSink {
    fn emit(&self, worker: usize, level: Level, message: String) {
        match self {
            LogSink::Direct => log!(level, "[worker {}] {}", worker, message),
            LogSink::Channel(tx) => {
                // The listener only goes away once every worker has finished
                let _ = tx.send(LogEvent {
                    worker,
                    level,
                    message,
                });
            }
        }
    }
}

/// Per-worker state, built once at worker startup and threaded through every task.
pub struct WorkerContext {
    worker_id: usize,
    network: Option<RoadNetwork>,
    provider: RoadNetworkProvider,
    kind: NetworkKind,
    matcher: MapMatcher,
    matched: usize,
    processed: usize,
    log: LogSink,
}

impl WorkerContext {
    /// Prepare a worker. In shared-regional mode this obtains the worker's own
    /// copy of the regional network, which is the only step allowed to fail.
    pub fn start(
        worker_id: usize,
        settings: &BatchSettings,
        provider: RoadNetworkProvider,
        log: LogSink,
    ) -> Result<Self, ConflationError> {
        let start = Instant::now();
        let matcher = MapMatcher::new(settings.lcss.clone(), settings.geofence_padding)?;
        let network = match settings.network_mode {
            NetworkMode::SharedRegional => {
                let network = provider
                    .obtain_network(&settings.region, settings.network_kind)
                    .map_err(|e| ConflationError::WorkerStartup {
                        worker: worker_id,
                        reason: e.to_string(),
                    })?;
                log.emit(
                    worker_id,
                    Level::Info,
                    format!(
                        "regional network ready with {} edges in {:?}",
                        network.edge_count(),
                        start.elapsed()
                    ),
                );
                Some(network)
            }
            NetworkMode::PerTrace => None,
        };
        Ok(Self {
            worker_id,
            network,
            provider,
            kind: settings.network_kind,
            matcher,
            matched: 0,
            processed: 0,
            log,
        })
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn matched_count(&self) -> usize {
        self.matched
    }

    pub fn process(&mut self, trace: &Trace) -> MatchOutcome {
        let outcome = match &self.network {
            Some(network) => self.matcher.match_trace(trace, network),
            None => self.matcher.match_with_provider(trace, &self.provider, self.kind),
        };
        self.processed += 1;

        match &outcome {
            MatchOutcome::Matched(_) => {
                self.matched += 1;
                if self.matched % PROGRESS_INTERVAL == 0 {
                    self.log.emit(
                        self.worker_id,
                        Level::Info,
                        format!("matched {} of {} traces", self.matched, self.processed),
                    );
                }
            }
            MatchOutcome::Unmatched { trip_id, reason } => self.log.emit(
                self.worker_id,
                Level::Debug,
                format!("trip {} unmatched: {}", trip_id, reason),
            ),
        }
        outcome
    }
}

/// Everything a batch needs besides the traces.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Region the shared network is built for
    pub region: Geofence,
    pub network_kind: NetworkKind,
    pub network_mode: NetworkMode,
    pub geofence_padding: f64,
    pub lcss: LcssConfig,
}

/// Outcomes of a batch in completion order, with one entry per submitted trip.
#[derive(Debug)]
pub struct BatchReport {
    pub outcomes: Vec<MatchOutcome>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn matched_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_matched()).count()
    }

    pub fn unmatched_count(&self) -> usize {
        self.outcomes.len() - self.matched_count()
    }

    pub fn matched_trip_ids(&self) -> BTreeSet<TripId> {
        self.outcomes
            .iter()
            .filter(|o| o.is_matched())
            .map(|o| o.trip_id().to_string())
            .collect()
    }

    /// Re-key the outcomes by trip; completion order carries no meaning.
    pub fn into_keyed(self) -> BTreeMap<TripId, MatchOutcome> {
        self.outcomes
            .into_iter()
            .map(|o| (o.trip_id().to_string(), o))
            .collect()
    }
}

enum WorkerMessage {
    Ready(usize),
    StartupFailed(ConflationError),
    Outcome(MatchOutcome),
}

/// Fans traces out over worker threads, each owning its own network, and
/// collects their outcomes.
pub struct MatchOrchestrator {
    provider: RoadNetworkProvider,
    settings: BatchSettings,
}

impl MatchOrchestrator {
    pub fn new(provider: RoadNetworkProvider, settings: BatchSettings) -> Self {
        Self { provider, settings }
    }

    /// Match every trace. Per-trace failures come back as unmatched outcomes;
    /// only network or worker setup failures abort the batch.
    pub fn run_batch(
        &self,
        traces: Vec<Trace>,
        worker_count: usize,
        network_mode: NetworkMode,
        geofence_padding: f64,
    ) -> Result<BatchReport, ConflationError> {
        let settings = BatchSettings {
            network_mode,
            geofence_padding,
            ..self.settings.clone()
        };
        let start = Instant::now();
        info!(
            "Matching {} traces with {} worker(s) in {:?} mode",
            traces.len(),
            worker_count.max(1),
            network_mode
        );

        let outcomes = if worker_count <= 1 {
            self.run_sequential(traces, &settings)?
        } else {
            self.run_parallel(traces, worker_count, &settings)?
        };

        let report = BatchReport {
            outcomes,
            elapsed: start.elapsed(),
        };
        info!(
            "Batch finished: {} matched, {} unmatched in {:?}",
            report.matched_count(),
            report.unmatched_count(),
            report.elapsed
        );
        Ok(report)
    }

    fn run_sequential(
        &self,
        traces: Vec<Trace>,
        settings: &BatchSettings,
    ) -> Result<Vec<MatchOutcome>, ConflationError> {
        let started = catch_unwind(AssertUnwindSafe(|| {
            WorkerContext::start(0, settings, self.provider.clone(), LogSink::Direct)
        }));
        let mut context = match started {
            Ok(context) => context?,
            Err(panic) => {
                return Err(ConflationError::WorkerStartup {
                    worker: 0,
                    reason: format!("panicked: {}", panic_message(&*panic)),
                });
            }
        };
        Ok(traces.iter().map(|t| context.process(t)).collect())
    }

    fn run_parallel(
        &self,
        traces: Vec<Trace>,
        worker_count: usize,
        settings: &BatchSettings,
    ) -> Result<Vec<MatchOutcome>, ConflationError> {
        let submitted: Vec<TripId> = traces.iter().map(|t| t.trip_id().to_string()).collect();
        let total = traces.len();

        let (job_tx, job_rx) = channel::unbounded::<Trace>();
        let (result_tx, result_rx) = channel::unbounded::<WorkerMessage>();
        let (log_tx, log_rx) = channel::unbounded::<LogEvent>();
        let abort = AtomicBool::new(false);

        for trace in traces {
            // The receiver lives until the scope below ends
            let _ = job_tx.send(trace);
        }
        drop(job_tx);

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) - Matching traces")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );

        let (collected, fatal) = thread::scope(|scope| {
            let listener = scope.spawn(move || listen(log_rx));

            let workers: Vec<_> = (0..worker_count)
                .map(|worker_id| {
                    let jobs = job_rx.clone();
                    let results = result_tx.clone();
                    let log = LogSink::Channel(log_tx.clone());
                    let provider = self.provider.clone();
                    let abort = &abort;
                    let handle =
                        scope.spawn(move || worker_loop(worker_id, settings, provider, log, jobs, results, abort));
                    (worker_id, handle)
                })
                .collect();
            drop(result_tx);
            drop(log_tx);

            let collected = collect(result_rx, total, worker_count, &abort, &pb);
            // Joined here so a panicked worker cannot take the collected outcomes down with the scope
            let fatal = join_workers(workers, &collected.ready);
            if listener.join().is_err() {
                warn!("Worker log listener panicked");
            }
            (collected, fatal)
        });
        pb.finish_and_clear();

        if let Some(e) = collected.startup_failure.or(fatal) {
            return Err(e);
        }
        Ok(account_for_missing(collected.outcomes, &submitted))
    }
}

fn worker_loop(
    worker_id: usize,
    settings: &BatchSettings,
    provider: RoadNetworkProvider,
    log: LogSink,
    jobs: Receiver<Trace>,
    results: Sender<WorkerMessage>,
    abort: &AtomicBool,
) {
    let mut context = match WorkerContext::start(worker_id, settings, provider, log) {
        Ok(context) => context,
        Err(e) => {
            let _ = results.send(WorkerMessage::StartupFailed(e));
            return;
        }
    };
    let _ = results.send(WorkerMessage::Ready(worker_id));

    while let Ok(trace) = jobs.recv() {
        if abort.load(Ordering::Relaxed) {
            break;
        }
        if results.send(WorkerMessage::Outcome(context.process(&trace))).is_err() {
            break;
        }
    }
    context.log.emit(
        worker_id,
        Level::Debug,
        format!(
            "worker done after {} traces ({} matched)",
            context.processed, context.matched
        ),
    );
}

/// What the collector saw before the result channel closed.
struct Collected {
    outcomes: Vec<MatchOutcome>,
    ready: BTreeSet<usize>,
    startup_failure: Option<ConflationError>,
}

/// Gather outcomes in arrival order; the first startup failure aborts the batch.
fn collect(
    results: Receiver<WorkerMessage>,
    total: usize,
    worker_count: usize,
    abort: &AtomicBool,
    pb: &ProgressBar,
) -> Collected {
    let mut collected = Collected {
        outcomes: Vec::with_capacity(total),
        ready: BTreeSet::new(),
        startup_failure: None,
    };
    while let Ok(message) = results.recv() {
        match message {
            WorkerMessage::Ready(worker) => {
                collected.ready.insert(worker);
                debug!("Worker {} ready ({}/{})", worker, collected.ready.len(), worker_count);
            }
            WorkerMessage::StartupFailed(e) => {
                abort.store(true, Ordering::Relaxed);
                collected.startup_failure = Some(e);
                break;
            }
            WorkerMessage::Outcome(outcome) => {
                collected.outcomes.push(outcome);
                pb.inc(1);
                if collected.outcomes.len() % 1000 == 0 {
                    debug!("Collected {} of {} outcomes", collected.outcomes.len(), total);
                }
            }
        }
    }
    collected
}

/// Join every worker. A worker that panicked before reporting ready is a
/// startup failure; one that panicked later only loses its in-flight trace,
/// which is accounted for as unmatched afterwards.
fn join_workers(
    workers: Vec<(usize, ScopedJoinHandle<'_, ()>)>,
    ready: &BTreeSet<usize>,
) -> Option<ConflationError> {
    let mut fatal = None;
    for (worker_id, handle) in workers {
        let Err(panic) = handle.join() else {
            continue;
        };
        let message = panic_message(&*panic);
        if ready.contains(&worker_id) {
            warn!("Worker {} panicked mid-batch: {}", worker_id, message);
        } else if fatal.is_none() {
            fatal = Some(ConflationError::WorkerStartup {
                worker: worker_id,
                reason: format!("panicked: {}", message),
            });
        }
    }
    fatal
}

/// The single consumer of worker log events.
fn listen(events: Receiver<LogEvent>) {
    for event in events {
        log!(event.level, "[worker {}] {}", event.worker, event.message);
    }
}

/// Record any submitted trip that never reported back as unmatched.
fn account_for_missing(mut outcomes: Vec<MatchOutcome>, submitted: &[TripId]) -> Vec<MatchOutcome> {
    let reported: BTreeSet<&str> = outcomes.iter().map(|o| o.trip_id()).collect();
    let missing: Vec<TripId> = submitted
        .iter()
        .filter(|id| !reported.contains(id.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        warn!("{} trips were lost by their workers", missing.len());
    }
    outcomes.extend(missing.into_iter().map(|trip_id| {
        MatchOutcome::unmatched(
            trip_id,
            ConflationError::UnmatchableTrace("worker stopped before reporting".to_string()),
        )
    }));
    outcomes
}
