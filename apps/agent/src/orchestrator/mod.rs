/// Orchestrator module - the dispatch loop and everything around it
///
/// The orchestrator:
/// - Refreshes the check queue from the hub or an input file
/// - Gates every round on the health of the local network
/// - Runs queued checks as independent workers
/// - Drains in-flight workers on shutdown
///
/// ## Node forwarding
/// The `nodes` submodule asks peer agents to confirm local failures.
///
/// ## Delivery
/// The `delivery` submodule batches results to the hub or an output file.
pub mod delivery;
pub mod nodes;


pub use delivery::{FileSink, HubSink, ResultDeliverer, ResultSink};
pub use nodes::NodeForwarder;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, secs_to_duration};
use crate::error::FetchError;
use crate::hub::{Backoff, CheckSource};
use crate::monitoring::ping::Pinger;
use crate::monitoring::{
    Check, CheckQueue, CheckResult, Checker, HealthGate, InProgressChecks, InProgressGuard,
    MonitoringExecutor,
};
use crate::stats::Stats;

/// Sleep for `pause` unless shutdown is requested first. Returns true on shutdown.
async fn pause_or_shutdown(shutdown: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(pause) => *shutdown.borrow(),
    }
}

/// Main orchestrator for the picket agent
pub struct Orchestrator {
    config: Arc<Config>,
    queue: Arc<CheckQueue>,
    executor: Arc<MonitoringExecutor>,
    health: HealthGate,
    source: Arc<CheckSource>,
    stats: Arc<Stats>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        source: CheckSource,
        checker: Arc<dyn Checker>,
        pinger: Arc<dyn Pinger>,
        stats: Arc<Stats>,
    ) -> Result<Self> {
        let forwarder = if config.nodes.is_empty() {
            None
        } else {
            let forwarder = NodeForwarder::new(&config)?;
            if forwarder.has_nodes() {
                info!("Forwarding failed checks to {} nodes", config.nodes.len());
                Some(Arc::new(forwarder))
            } else {
                warn!("No usable node url in config, failed checks stay local");
                None
            }
        };

        Ok(Self {
            queue: Arc::new(CheckQueue::new(Arc::new(InProgressChecks::default()))),
            executor: Arc::new(MonitoringExecutor::new(&config, checker, forwarder)),
            health: HealthGate::new(&config.health_checks, pinger, stats.clone()),
            source: Arc::new(source),
            stats,
            config,
        })
    }

    pub fn queue(&self) -> &Arc<CheckQueue> {
        &self.queue
    }

    pub fn executor(&self) -> &Arc<MonitoringExecutor> {
        &self.executor
    }

    /// Start a background refresh of the queue. The flag stays set while the
    /// fetch, and any backoff it asks for, is in progress.
    fn spawn_fetch(&self, in_flight: Arc<AtomicBool>, fatal: mpsc::Sender<FetchError>) -> tokio::task::JoinHandle<()> {
        let source = self.source.clone();
        let queue = self.queue.clone();
        let round = self.config.round_interval();

        in_flight.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            match source.fetch().await {
                Ok(checks) => {
                    let fetched = checks.len();
                    let added = queue.enqueue_unique(checks);
                    debug!("Queue refreshed: {} fetched, {} new, {} queued", fetched, added, queue.len());
                }
                Err(e) => match Backoff::for_error(&e, round) {
                    Backoff::Continue => error!("{}", e),
                    Backoff::Sleep(delay) => {
                        warn!("{}, pausing fetches for {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                    Backoff::Exit(delay) => {
                        tokio::time::sleep(delay).await;
                        let _ = fatal.send(e).await;
                    }
                },
            }
            in_flight.store(false, Ordering::SeqCst);
        })
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<()>,
        check: Check,
        guard: InProgressGuard,
        results: mpsc::Sender<CheckResult>,
    ) {
        let executor = self.executor.clone();
        let stats = self.stats.clone();
        workers.spawn(async move {
            let result = executor.execute_check(&check, true).await;
            if results.send(result).await.is_err() {
                error!("Result channel closed, dropping result of {}", guard.id());
            }
            stats.update(|s| s.checks_performed_total += 1);
            // only now may the check be queued again
            drop(guard);
        });
    }

    /// Run the dispatch loop until shutdown. In-flight checks always finish
    /// and send their result before this returns.
    pub async fn run(&self, results: mpsc::Sender<CheckResult>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let round = self.config.round_interval();
        let after_check = secs_to_duration(self.config.sleep_duration_after_check);
        let empty_queue = secs_to_duration(self.config.sleep_duration_empty_queue);

        let mut workers = JoinSet::new();
        let fetch_in_flight = Arc::new(AtomicBool::new(false));
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<FetchError>(1);
        let mut fetch_task: Option<tokio::task::JoinHandle<()>> = None;
        let mut last_fetch: Option<Instant> = None;
        let mut outcome = Ok(());

        info!("Dispatch loop started, fetching every {:?}", round);
        loop {
            let gate = self.health.check().await;
            // an interrupt during the reference pings must not dispatch anything
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = gate {
                error!("Skipping round: {}", e);
                if pause_or_shutdown(&mut shutdown, round).await {
                    break;
                }
                continue;
            }

            let fetch_due = last_fetch.is_none_or(|at| at.elapsed() >= round);
            if fetch_due && !fetch_in_flight.load(Ordering::SeqCst) {
                last_fetch = Some(Instant::now());
                fetch_task = Some(self.spawn_fetch(fetch_in_flight.clone(), fatal_tx.clone()));
            }

            let pause = match self.queue.take_next() {
                Some((check, guard)) => {
                    self.spawn_worker(&mut workers, check, guard, results.clone());
                    after_check
                }
                None => {
                    debug!("Check queue is empty");
                    empty_queue
                }
            };

            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!("Check worker failed: {}", e);
                }
            }

            tokio::select! {
                Some(err) = fatal_rx.recv() => {
                    outcome = Err(err.into());
                    break;
                }
                stop = pause_or_shutdown(&mut shutdown, pause) => {
                    if stop {
                        break;
                    }
                }
            }
        }

        if let Some(task) = fetch_task {
            task.abort();
        }
        info!("Stopping, waiting for {} in-flight checks", workers.len());
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Check worker failed: {}", e);
            }
        }
        info!("All in-flight checks finished");
        outcome
    }

    /// Fetch once, run every check concurrently and wait for all results.
    /// Returns the number of checks that succeeded.
    pub async fn run_once(&self, results: mpsc::Sender<CheckResult>) -> Result<usize> {
        let started = Instant::now();
        let checks = self.source.fetch().await?;
        self.queue.enqueue_unique(checks);

        let mut workers = JoinSet::new();
        while let Some((check, guard)) = self.queue.take_next() {
            let executor = self.executor.clone();
            let results = results.clone();
            workers.spawn(async move {
                let result = executor.execute_check(&check, true).await;
                let success = result.is_success();
                if results.send(result).await.is_err() {
                    error!("Result channel closed, dropping result of {}", guard.id());
                }
                success
            });
        }

        let total = workers.len();
        let mut succeeded = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => error!("Check worker failed: {}", e),
            }
        }

        self.stats.update(|s| s.checks_performed_total += total as u64);
        info!("{}/{} checks succeeded in {:.1} sec", succeeded, total, started.elapsed().as_secs_f64());
        Ok(succeeded)
    }
}
