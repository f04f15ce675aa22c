use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::checker::{Checker, ProbeError};
use super::types::{Check, CheckResult, MeasurementsMap};
use crate::config::{Config, secs_to_duration};
use crate::orchestrator::nodes::NodeForwarder;

/// Upper bound for a single probe attempt, whatever its own timeouts say
pub const EMERGENCY_TIMEOUT: Duration = Duration::from_secs(30);

/// Monitoring executor - runs one check to its final result
pub struct MonitoringExecutor {
    checker: Arc<dyn Checker>,
    forwarder: Option<Arc<NodeForwarder>>,
    node_name: String,
    failure_confirmation: u32,
    confirmation_delay: Duration,
    emergency_timeout: Duration,
}

impl MonitoringExecutor {
    pub fn new(config: &Config, checker: Arc<dyn Checker>, forwarder: Option<Arc<NodeForwarder>>) -> Self {
        Self {
            checker,
            forwarder,
            node_name: config.node_name.clone(),
            failure_confirmation: config.failure_confirmation,
            confirmation_delay: secs_to_duration(config.failure_confirmation_delay),
            emergency_timeout: EMERGENCY_TIMEOUT,
        }
    }

    pub fn with_emergency_timeout(mut self, timeout: Duration) -> Self {
        self.emergency_timeout = timeout;
        self
    }

    /// Execute a check, confirming failures before accepting them.
    ///
    /// `local` is false for checks a peer node asked us to run; those are
    /// tagged with our node name and never forwarded again.
    pub async fn execute_check(&self, check: &Check, local: bool) -> CheckResult {
        let result = CheckResult::new(check, (!local).then(|| self.node_name.clone()));

        let mut outcome = self.attempt(check).await;
        if let Err(e) = &outcome {
            if self.failure_confirmation > 0 {
                debug!(
                    "Check {} failed, retrying up to {} times: {}",
                    check.unique_id(),
                    self.failure_confirmation,
                    e
                );
            }
        }

        let mut retry = 0;
        while outcome.is_err() && retry < self.failure_confirmation {
            retry += 1;
            tokio::time::sleep(self.confirmation_delay).await;
            debug!("Retry {} for failed check {}", retry, check.unique_id());
            outcome = self.attempt(check).await;
        }

        match outcome {
            Ok(measurements) => result.success(measurements),
            Err(ProbeError { message, measurements }) => {
                debug!("Check {} failed: {}", check.unique_id(), message);
                let failed = result.failure(message, measurements);
                match &self.forwarder {
                    Some(forwarder) if local => forwarder.ask_nodes(check, failed).await,
                    _ => failed,
                }
            }
        }
    }

    /// One probe run on its own task, bounded by the emergency timeout.
    ///
    /// On timeout the task is aborted, which only takes effect at its next
    /// await point. A probe stuck in blocking code keeps its thread until it
    /// returns.
    async fn attempt(&self, check: &Check) -> Result<MeasurementsMap, ProbeError> {
        let checker = self.checker.clone();
        let owned = check.clone();
        let mut handle = tokio::spawn(async move { checker.run(&owned).await });

        match tokio::time::timeout(self.emergency_timeout, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(ProbeError::new(format!("probe task failed: {e}"))),
            Err(_) => {
                handle.abort();
                warn!(
                    "Check {} exceeded the emergency timeout of {}s, abandoning it",
                    check.unique_id(),
                    self.emergency_timeout.as_secs()
                );
                Err(ProbeError::new(format!(
                    "emergency timeout of {}s exceeded",
                    self.emergency_timeout.as_secs()
                )))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::monitoring::types::{ServiceCheck, ServiceCheckData};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back a fixed sequence of outcomes, then keeps failing
    pub(crate) struct ScriptedChecker {
        outcomes: Mutex<VecDeque<Result<MeasurementsMap, ProbeError>>>,
        pub(crate) runs: AtomicUsize,
        pub(crate) delay: Duration,
    }

    impl ScriptedChecker {
        pub(crate) fn new(outcomes: Vec<Result<MeasurementsMap, ProbeError>>) -> Self {
            Self { outcomes: Mutex::new(outcomes.into()), runs: AtomicUsize::new(0), delay: Duration::ZERO }
        }

        pub(crate) fn failing_then_ok(failures: usize) -> Self {
            let mut outcomes: Vec<_> = (0..failures).map(|_| Err(fail("connection timed out"))).collect();
            outcomes.push(Ok(ok()));
            Self::new(outcomes)
        }
    }

    #[async_trait::async_trait]
    impl Checker for ScriptedChecker {
        async fn run(&self, _check: &Check) -> Result<MeasurementsMap, ProbeError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcomes.lock().pop_front().unwrap_or_else(|| Err(fail("connection timed out")))
        }
    }

    pub(crate) fn ok() -> MeasurementsMap {
        let mut m = MeasurementsMap::new();
        m.insert("net.tcp.22.success".into(), json!(1));
        m
    }

    pub(crate) fn fail(message: &str) -> ProbeError {
        let mut m = MeasurementsMap::new();
        m.insert("net.tcp.22.success".into(), json!(0));
        ProbeError::with_measurements(message, m)
    }

    pub(crate) fn tcp_check(uuid: &str) -> Check {
        Check::Service(ServiceCheck {
            uuid: uuid.into(),
            check: ServiceCheckData {
                connect: "192.0.2.1".into(),
                port: Some(22),
                protocol: "tcp".into(),
                service: String::new(),
            },
        })
    }

    fn executor(checker: Arc<ScriptedChecker>, confirmations: u32) -> MonitoringExecutor {
        let config = Config {
            failure_confirmation: confirmations,
            failure_confirmation_delay: 1.0,
            ..Config::default()
        };
        MonitoringExecutor::new(&config, checker, None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_masks_failure() {
        let checker = Arc::new(ScriptedChecker::failing_then_ok(2));
        let result = executor(checker.clone(), 3).execute_check(&tcp_check("a"), true).await;

        assert!(result.is_success());
        assert_eq!(result.measurements["net.tcp.22.success"], json!(1));
        assert_eq!(checker.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_failure() {
        let checker = Arc::new(ScriptedChecker::failing_then_ok(5));
        let result = executor(checker.clone(), 2).execute_check(&tcp_check("a"), true).await;

        assert_eq!(result.message.as_deref(), Some("connection timed out"));
        assert_eq!(result.measurements["net.tcp.22.success"], json!(0));
        assert_eq!(checker.runs.load(Ordering::SeqCst), 3);
        assert_eq!(result.node, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_confirmation_runs_once() {
        let checker = Arc::new(ScriptedChecker::failing_then_ok(1));
        let result = executor(checker.clone(), 0).execute_check(&tcp_check("a"), false).await;

        assert!(!result.is_success());
        assert_eq!(result.node.as_deref(), Some("Picket"));
        assert_eq!(checker.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_timeout_abandons_probe() {
        let mut checker = ScriptedChecker::new(vec![Ok(ok())]);
        checker.delay = Duration::from_secs(120);
        let exec = executor(Arc::new(checker), 0).with_emergency_timeout(Duration::from_secs(30));

        let result = exec.execute_check(&tcp_check("a"), true).await;
        assert_eq!(result.message.as_deref(), Some("emergency timeout of 30s exceeded"));
    }
}
