use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, SenderMode, secs_to_duration};
use crate::error::DeliveryError;
use crate::hub::HubClient;
use crate::monitoring::types::CheckResult;
use crate::stats::Stats;

/// How long a kept batch waits before it is retried when no new results arrive
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Destination for finished results
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    /// Deliver one batch, returning the number of bytes written
    async fn send(&self, batch: &[CheckResult]) -> Result<usize, DeliveryError>;

    /// Failures of hub sinks count as hub errors, all others as internal errors
    fn is_hub(&self) -> bool {
        false
    }
}

pub struct HubSink(pub Arc<HubClient>);

#[async_trait::async_trait]
impl ResultSink for HubSink {
    async fn send(&self, batch: &[CheckResult]) -> Result<usize, DeliveryError> {
        self.0.push(batch).await
    }

    fn is_hub(&self) -> bool {
        true
    }
}

/// Writes results as JSON lines
pub struct FileSink {
    file: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FileSink {
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self { file: Mutex::new(Box::new(file)) })
    }

    /// Results on standard output, for runs with neither a hub nor an output file
    pub fn stdout() -> Self {
        Self { file: Mutex::new(Box::new(tokio::io::stdout())) }
    }
}

#[async_trait::async_trait]
impl ResultSink for FileSink {
    async fn send(&self, batch: &[CheckResult]) -> Result<usize, DeliveryError> {
        let mut lines = Vec::new();
        for result in batch {
            serde_json::to_writer(&mut lines, result)?;
            lines.push(b'\n');
        }
        let mut file = self.file.lock().await;
        file.write_all(&lines).await?;
        file.flush().await?;
        Ok(lines.len())
    }
}

/// Drains the result channel into a sink.
///
/// Exactly one deliverer runs per agent. Results wait in an in-memory buffer
/// until they are sent, discarded by policy, or older than the TTL.
pub struct ResultDeliverer {
    sink: Arc<dyn ResultSink>,
    stats: Arc<Stats>,
    mode: SenderMode,
    mode_interval: Duration,
    batch_size: usize,
    batch_pause: Duration,
    ttl: Option<Duration>,
    discard_on_response_error: bool,
    discard_on_connect_error: bool,
    buffer: VecDeque<(CheckResult, Instant)>,
}

impl ResultDeliverer {
    pub fn new(config: &Config, sink: Arc<dyn ResultSink>, stats: Arc<Stats>) -> Self {
        let mut mode = config.sender_mode;
        let mode_interval = secs_to_duration(config.sender_mode_interval);
        if mode == SenderMode::Interval && mode_interval.is_zero() {
            warn!("sender_mode 'interval' needs sender_mode_interval > 0, using 'wait'");
            mode = SenderMode::Wait;
        }

        Self {
            sink,
            stats,
            mode,
            mode_interval,
            batch_size: config.sender_batch_size.max(1),
            batch_pause: secs_to_duration(config.sender_interval),
            ttl: config.results_ttl(),
            discard_on_response_error: config.discard_on_http_response_error,
            discard_on_connect_error: config.discard_on_http_connect_error,
            buffer: VecDeque::new(),
        }
    }

    /// Run until every sender is gone, then flush what is left once.
    pub async fn run(mut self, mut results: mpsc::Receiver<CheckResult>) {
        info!("Result delivery started in '{}' mode", self.mode);
        let mut ticker = (self.mode == SenderMode::Interval).then(|| {
            let mut ticker = tokio::time::interval(self.mode_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker
        });

        loop {
            match ticker.as_mut() {
                Some(ticker) => {
                    tokio::select! {
                        received = results.recv() => match received {
                            Some(result) => self.push(result),
                            None => break,
                        },
                        _ = ticker.tick() => self.deliver().await,
                    }
                }
                None => {
                    let received = if self.buffer.is_empty() {
                        results.recv().await
                    } else {
                        // a kept batch is retried when the next result arrives or after a pause
                        match tokio::time::timeout(RETRY_DELAY, results.recv()).await {
                            Ok(received) => received,
                            Err(_) => {
                                self.deliver().await;
                                continue;
                            }
                        }
                    };
                    let Some(result) = received else { break };
                    self.push(result);
                    while let Ok(result) = results.try_recv() {
                        self.push(result);
                    }
                    self.deliver().await;
                }
            }
        }

        debug!("Result channel closed, flushing {} buffered results", self.buffer.len());
        self.deliver().await;
        if !self.buffer.is_empty() {
            warn!("{} results could not be delivered before shutdown", self.buffer.len());
        }
    }

    fn push(&mut self, result: CheckResult) {
        self.buffer.push_back((result, Instant::now()));
        let buffered = self.buffer.len();
        self.stats.update(|s| s.results_buffered = buffered);
    }

    fn evict_expired(&mut self) {
        let Some(ttl) = self.ttl else {
            return;
        };
        let before = self.buffer.len();
        self.buffer.retain(|(_, queued_at)| queued_at.elapsed() <= ttl);
        let expired = before - self.buffer.len();
        if expired == 0 {
            return;
        }

        warn!("Dropped {} results older than {}s", expired, ttl.as_secs_f64());
        for _ in 0..expired {
            self.stats.internal_error("result expired before it could be sent");
        }
        self.stats.update(|s| s.results_discarded_total += expired as u64);
    }

    /// Send the buffer in batches. Stops at the first failed batch.
    async fn deliver(&mut self) {
        loop {
            self.evict_expired();
            if self.buffer.is_empty() {
                break;
            }

            let count = self.batch_size.min(self.buffer.len());
            let batch: Vec<CheckResult> =
                self.buffer.iter().take(count).map(|(result, _)| result.clone()).collect();

            match self.sink.send(&batch).await {
                Ok(bytes) => {
                    self.buffer.drain(..count);
                    debug!("Delivered {} results ({} bytes)", count, bytes);
                    self.stats.update(|s| {
                        s.bytes_sent_total += bytes as u64;
                        s.results_sent_total += count as u64;
                    });
                }
                Err(e) => {
                    if self.sink.is_hub() {
                        self.stats.hub_error(e.to_string());
                    } else {
                        self.stats.internal_error(e.to_string());
                    }
                    if e.should_discard(self.discard_on_response_error, self.discard_on_connect_error) {
                        warn!("Discarding {} results: {}", count, e);
                        self.buffer.drain(..count);
                        self.stats.update(|s| s.results_discarded_total += count as u64);
                    } else {
                        warn!("Failed to deliver {} results, will retry: {}", count, e);
                    }
                    break;
                }
            }

            if self.buffer.is_empty() {
                break;
            }
            tokio::time::sleep(self.batch_pause).await;
        }

        let buffered = self.buffer.len();
        self.stats.update(|s| s.results_buffered = buffered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::executor::tests::tcp_check;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: SyncMutex<Vec<Vec<String>>>,
        failures: SyncMutex<VecDeque<DeliveryError>>,
        hub: bool,
    }

    #[async_trait::async_trait]
    impl ResultSink for RecordingSink {
        async fn send(&self, batch: &[CheckResult]) -> Result<usize, DeliveryError> {
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.batches.lock().push(batch.iter().map(|r| r.check_uuid.clone()).collect());
            Ok(batch.len() * 10)
        }

        fn is_hub(&self) -> bool {
            self.hub
        }
    }

    fn result(uuid: &str) -> CheckResult {
        CheckResult::new(&tcp_check(uuid), None)
    }

    fn deliverer(config: Config, sink: Arc<RecordingSink>) -> (ResultDeliverer, Arc<Stats>) {
        let stats = Arc::new(Stats::new());
        (ResultDeliverer::new(&config, sink, stats.clone()), stats)
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_capped() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config { sender_batch_size: 100, ..Config::default() };
        let (deliverer, stats) = deliverer(config, sink.clone());

        let (tx, rx) = mpsc::channel(300);
        for i in 0..250 {
            tx.send(result(&format!("r{i}"))).await.unwrap();
        }
        drop(tx);
        deliverer.run(rx).await;

        let sizes: Vec<usize> = sink.batches.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        let snap = stats.snapshot();
        assert_eq!(snap.results_sent_total, 250);
        assert_eq!(snap.bytes_sent_total, 2500);
        assert_eq!(snap.results_buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_results_are_never_sent() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config { check_results_ttl: 30.0, ..Config::default() };
        let (mut deliverer, stats) = deliverer(config, sink.clone());

        deliverer.push(result("old"));
        tokio::time::advance(Duration::from_secs(31)).await;
        deliverer.push(result("fresh"));

        deliverer.deliver().await;
        deliverer.deliver().await;

        assert_eq!(*sink.batches.lock(), vec![vec!["fresh".to_string()]]);
        let snap = stats.snapshot();
        assert_eq!(snap.internal_errors_total, 1);
        assert_eq!(snap.results_discarded_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_zero_keeps_everything() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config { check_results_ttl: 0.0, ..Config::default() };
        let (mut deliverer, stats) = deliverer(config, sink.clone());

        deliverer.push(result("old"));
        tokio::time::advance(Duration::from_secs(3600)).await;
        deliverer.deliver().await;

        assert_eq!(sink.batches.lock().len(), 1);
        assert_eq!(stats.snapshot().internal_errors_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_keeps_batch_by_default() {
        let sink = Arc::new(RecordingSink { hub: true, ..RecordingSink::default() });
        sink.failures.lock().push_back(DeliveryError::Connect("refused".into()));
        let (mut deliverer, stats) = deliverer(Config::default(), sink.clone());

        deliverer.push(result("a"));
        deliverer.deliver().await;
        assert!(sink.batches.lock().is_empty());
        assert_eq!(deliverer.buffer.len(), 1);
        assert_eq!(stats.snapshot().hub_errors_total, 1);

        deliverer.deliver().await;
        assert_eq!(*sink.batches.lock(), vec![vec!["a".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_errors_are_internal_errors() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures.lock().push_back(DeliveryError::Io(std::io::Error::other("disk full")));
        let (mut deliverer, stats) = deliverer(Config::default(), sink.clone());

        deliverer.push(result("a"));
        deliverer.deliver().await;

        let snap = stats.snapshot();
        assert_eq!(snap.hub_errors_total, 0);
        assert_eq!(snap.internal_errors_total, 1);
        assert_eq!(snap.internal_last_error_message, "failed to write results: disk full");
        assert_eq!(deliverer.buffer.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_kept_batch_is_retried_without_new_results() {
        let sink = Arc::new(RecordingSink { hub: true, ..RecordingSink::default() });
        sink.failures.lock().push_back(DeliveryError::Connect("refused".into()));
        let (deliverer, stats) = deliverer(Config::default(), sink.clone());

        let (tx, rx) = mpsc::channel(10);
        let task = tokio::spawn(deliverer.run(rx));

        tx.send(result("a")).await.unwrap();
        tokio::time::sleep(RETRY_DELAY / 2).await;
        assert!(sink.batches.lock().is_empty());
        assert_eq!(stats.snapshot().hub_errors_total, 1);

        tokio::time::sleep(RETRY_DELAY).await;
        assert_eq!(*sink.batches.lock(), vec![vec!["a".to_string()]]);
        assert_eq!(stats.snapshot().results_buffered, 0);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_error_discard_policy() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures
            .lock()
            .push_back(DeliveryError::Response { status: 500, body: "oops".into() });
        let config = Config { discard_on_http_response_error: true, ..Config::default() };
        let (mut deliverer, stats) = deliverer(config, sink.clone());

        deliverer.push(result("a"));
        deliverer.deliver().await;
        assert!(deliverer.buffer.is_empty());
        assert_eq!(stats.snapshot().results_discarded_total, 1);

        deliverer.deliver().await;
        assert!(sink.batches.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_mode_waits_for_tick() {
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            sender_mode: SenderMode::Interval,
            sender_mode_interval: 10.0,
            ..Config::default()
        };
        let (deliverer, _) = deliverer(config, sink.clone());

        let (tx, rx) = mpsc::channel(10);
        let task = tokio::spawn(deliverer.run(rx));

        // let the first immediate tick pass
        tokio::time::sleep(Duration::from_millis(1)).await;
        tx.send(result("a")).await.unwrap();
        tx.send(result("b")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sink.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(*sink.batches.lock(), vec![vec!["a".to_string(), "b".to_string()]]);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let sink = FileSink::create(&path).await.unwrap();

        sink.send(&[result("a"), result("b")]).await.unwrap();
        sink.send(&[result("c")]).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let uuids: Vec<String> = written
            .lines()
            .map(|line| serde_json::from_str::<CheckResult>(line).unwrap().check_uuid)
            .collect();
        assert_eq!(uuids, vec!["a", "b", "c"]);
    }
}
