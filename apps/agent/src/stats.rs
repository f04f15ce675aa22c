use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::monitoring::queue::CheckQueue;

pub const STATS_WRITE_INTERVAL: Duration = Duration::from_secs(5);

/// Process-wide counters, reset only on restart
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub bytes_sent_total: u64,
    pub bytes_fetched_total: u64,
    pub checks_fetched_total: u64,
    pub checks_performed_total: u64,
    pub results_sent_total: u64,
    pub results_discarded_total: u64,

    pub hub_errors_total: u64,
    pub hub_last_error_message: String,
    pub hub_last_error_timestamp: Option<DateTime<Utc>>,

    pub internal_errors_total: u64,
    pub internal_last_error_message: String,
    pub internal_last_error_timestamp: Option<DateTime<Utc>>,

    pub health_checks_performed_total: u64,
    pub health_checks_failed_total: u64,

    pub results_buffered: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
}

/// Shared stats block. One lock, held only for counter updates.
pub struct Stats {
    inner: Mutex<AgentStats>,
    started: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        let inner = AgentStats { started_at: Some(Utc::now()), ..AgentStats::default() };
        Self { inner: Mutex::new(inner), started: Instant::now() }
    }

    pub fn update(&self, f: impl FnOnce(&mut AgentStats)) {
        f(&mut self.inner.lock());
    }

    pub fn hub_error(&self, message: impl Into<String>) {
        let mut stats = self.inner.lock();
        stats.hub_errors_total += 1;
        stats.hub_last_error_message = message.into();
        stats.hub_last_error_timestamp = Some(Utc::now());
    }

    pub fn internal_error(&self, message: impl Into<String>) {
        let mut stats = self.inner.lock();
        stats.internal_errors_total += 1;
        stats.internal_last_error_message = message.into();
        stats.internal_last_error_timestamp = Some(Utc::now());
    }

    pub fn snapshot(&self) -> AgentStats {
        let mut stats = self.inner.lock().clone();
        stats.uptime_seconds = self.started.elapsed().as_secs();
        stats
    }
}

/// Queue gauges persisted next to the stats snapshot
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub checks_queued: usize,
    pub checks_in_progress: usize,
    pub results_buffered: usize,
    pub updated_at: DateTime<Utc>,
}

impl QueueStats {
    pub fn collect(queue: &CheckQueue, stats: &Stats) -> Self {
        Self {
            checks_queued: queue.len(),
            checks_in_progress: queue.in_progress().len(),
            results_buffered: stats.inner.lock().results_buffered,
            updated_at: Utc::now(),
        }
    }
}

/// Replace `path` atomically so readers never see a half-written snapshot.
pub fn write_snapshot<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

fn persist(stats: &Stats, queue: &CheckQueue, stats_file: Option<&Path>, queue_file: Option<&Path>) {
    if let Some(path) = stats_file {
        if let Err(e) = write_snapshot(path, &stats.snapshot()) {
            warn!("Failed to write stats to {}: {}", path.display(), e);
        }
    }
    if let Some(path) = queue_file {
        if let Err(e) = write_snapshot(path, &QueueStats::collect(queue, stats)) {
            warn!("Failed to write queue stats to {}: {}", path.display(), e);
        }
    }
}

/// Rewrite the snapshot files every [`STATS_WRITE_INTERVAL`] until shutdown,
/// then once more so the final counters are on disk.
pub fn spawn_stats_writer(
    stats: Arc<Stats>,
    queue: Arc<CheckQueue>,
    stats_file: Option<PathBuf>,
    queue_stats_file: Option<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if stats_file.is_none() && queue_stats_file.is_none() {
            debug!("No stats files configured, stats writer disabled");
            return;
        }

        let mut timer = tokio::time::interval(STATS_WRITE_INTERVAL);
        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.changed() => break,
            }
            persist(&stats, &queue, stats_file.as_deref(), queue_stats_file.as_deref());
        }
        persist(&stats, &queue, stats_file.as_deref(), queue_stats_file.as_deref());
    })
}
