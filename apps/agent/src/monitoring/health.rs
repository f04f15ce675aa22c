use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ping::Pinger;
use crate::config::{HealthCheckConfig, secs_to_duration};
use crate::stats::Stats;

#[derive(Debug, Clone, Error)]
#[error("Health check failed for reference hosts: {}", failed_hosts.join(", "))]
pub struct HealthCheckError {
    pub failed_hosts: Vec<String>,
}

/// Network reachability check run before every dispatch round
pub struct HealthGate {
    hosts: Vec<String>,
    timeout: Duration,
    count: u32,
    pinger: Arc<dyn Pinger>,
    stats: Arc<Stats>,
    passed_previously: AtomicBool,
}

impl HealthGate {
    pub fn new(config: &HealthCheckConfig, pinger: Arc<dyn Pinger>, stats: Arc<Stats>) -> Self {
        Self {
            hosts: config.reference_ping_hosts.clone(),
            timeout: secs_to_duration(config.reference_ping_timeout),
            count: config.reference_ping_count,
            pinger,
            stats,
            passed_previously: AtomicBool::new(false),
        }
    }

    /// Passes when every reference host answers with 0% packet loss.
    /// Without reference hosts, or with a ping count of 0, this is a no-op.
    pub async fn check(&self) -> Result<(), HealthCheckError> {
        if self.hosts.is_empty() || self.count == 0 {
            return Ok(());
        }

        let pings = self.hosts.iter().map(|host| async move {
            let passed = match self.pinger.ping(host, self.count, self.timeout).await {
                Ok(stats) => {
                    debug!("Reference host {}: {}% packet loss", host, stats.packet_loss());
                    stats.packet_loss() == 0.0
                }
                Err(e) => {
                    debug!("Reference host {} ping error: {}", host, e);
                    false
                }
            };
            (host, passed)
        });

        let failed_hosts: Vec<String> = join_all(pings)
            .await
            .into_iter()
            .filter(|(_, passed)| !passed)
            .map(|(host, _)| host.clone())
            .collect();

        let failed = !failed_hosts.is_empty();
        self.stats.update(|s| {
            s.health_checks_performed_total += 1;
            if failed {
                s.health_checks_failed_total += 1;
            }
        });

        if failed {
            self.passed_previously.store(false, Ordering::SeqCst);
            let err = HealthCheckError { failed_hosts };
            warn!("{}", err);
            return Err(err);
        }

        if !self.passed_previously.swap(true, Ordering::SeqCst) {
            info!("Health checks passed");
        }
        Ok(())
    }
}
