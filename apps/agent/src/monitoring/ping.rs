use anyhow::{Context, Result, anyhow};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

/// Summary of one ping run against a single host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    pub avg_rtt: Option<Duration>,
}

impl PingStats {
    /// Packet loss in percent; nothing sent counts as total loss
    pub fn packet_loss(&self) -> f64 {
        if self.transmitted == 0 {
            return 100.0;
        }
        let lost = self.transmitted.saturating_sub(self.received);
        f64::from(lost) * 100.0 / f64::from(self.transmitted)
    }
}

/// Sends ICMP echo requests to a host
#[async_trait::async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, host: &str, count: u32, per_packet_timeout: Duration) -> Result<PingStats>;
}

/// Uses the system `ping` binary, which carries the raw-socket privileges.
pub struct SystemPinger;

#[async_trait::async_trait]
impl Pinger for SystemPinger {
    async fn ping(&self, host: &str, count: u32, per_packet_timeout: Duration) -> Result<PingStats> {
        let count = count.max(1);
        // iputils only accepts whole seconds on older releases
        let wait_secs = per_packet_timeout.as_secs_f64().ceil().max(1.0) as u64;

        let mut command = Command::new("ping");
        command
            .arg("-n")
            .arg("-c")
            .arg(count.to_string())
            .arg("-W")
            .arg(wait_secs.to_string())
            .arg(host)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let overall = Duration::from_secs(wait_secs * u64::from(count) + 1);
        let output = timeout(overall, command.output())
            .await
            .map_err(|_| anyhow!("ping {host} did not finish within {}s", overall.as_secs()))?
            .context("failed to execute ping")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ping_output(&stdout).ok_or_else(|| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow!("unexpected ping output for {host}: {}", stderr.trim())
        })
    }
}

/// Parses the summary lines of Linux (iputils, busybox) and BSD ping.
pub fn parse_ping_output(output: &str) -> Option<PingStats> {
    let summary = output.lines().find(|line| line.contains("transmitted"))?;

    let mut transmitted = None;
    let mut received = None;
    for part in summary.split(',') {
        let part = part.trim();
        let number = part.split_whitespace().next().and_then(|n| n.parse::<u32>().ok());
        if part.contains("transmitted") {
            transmitted = number;
        } else if part.contains("received") {
            received = number;
        }
    }

    // "rtt min/avg/max/mdev = 0.041/0.052/0.064/0.011 ms"
    let avg_rtt = output
        .lines()
        .find(|line| line.contains("min/avg/max"))
        .and_then(|line| line.split('=').nth(1))
        .and_then(|values| values.trim().split('/').nth(1))
        .and_then(|avg| avg.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0));

    Some(PingStats { transmitted: transmitted?, received: received?, avg_rtt })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iputils_output() {
        let out = "PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.\n\
                   64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=11.2 ms\n\
                   \n\
                   --- 1.1.1.1 ping statistics ---\n\
                   2 packets transmitted, 2 received, 0% packet loss, time 1001ms\n\
                   rtt min/avg/max/mdev = 11.183/11.500/11.817/0.317 ms\n";
        let stats = parse_ping_output(out).unwrap();
        assert_eq!(stats.transmitted, 2);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.packet_loss(), 0.0);
        let avg = stats.avg_rtt.unwrap().as_secs_f64();
        assert!((avg - 0.0115).abs() < 1e-6);
    }

    #[test]
    fn test_parse_total_loss() {
        let out = "--- 10.255.255.1 ping statistics ---\n\
                   3 packets transmitted, 0 received, 100% packet loss, time 2035ms\n";
        let stats = parse_ping_output(out).unwrap();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.packet_loss(), 100.0);
        assert_eq!(stats.avg_rtt, None);
    }

    #[test]
    fn test_parse_bsd_output() {
        let out = "--- example.com ping statistics ---\n\
                   4 packets transmitted, 3 packets received, 25.0% packet loss\n\
                   round-trip min/avg/max/stddev = 9.1/10.0/11.2/0.8 ms\n";
        let stats = parse_ping_output(out).unwrap();
        assert_eq!(stats.transmitted, 4);
        assert_eq!(stats.received, 3);
        assert_eq!(stats.packet_loss(), 25.0);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_ping_output("ping: unknown host nope").is_none());
    }
}
