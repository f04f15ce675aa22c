//! Peer node forwarding.
//!
//! When a check fails locally after all confirmation retries, every configured
//! peer agent is asked to run the same check through its `/check` endpoint.
//! The fastest successful peer answer replaces the local result and the
//! remaining answers are attached as `nodeMeasurements`. If no peer succeeds
//! the local result is returned untouched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Config, Node, secs_to_duration};
use crate::monitoring::types::{Check, CheckResult, Input, MeasurementsMap};

const DURATION_SUFFIXES: [&str; 3] = ["roundTripTime_s", "totalTimeSpent_s", "connectTime_s"];

/// What we know about a peer's latest failed attempt
#[derive(Debug, Clone)]
struct FailedNode {
    failed_at: Instant,
    response: Option<Vec<u8>>,
}

struct PeerNode {
    name: String,
    url: String,
    check_url: Url,
    node: Node,
    client: reqwest::Client,
}

/// Outcome of asking one peer
#[derive(Debug, Clone)]
enum PeerAnswer {
    Replied { name: String, results: Vec<Value> },
    Failed { name: String, message: String },
}

/// The parts of a peer reply that decide the winner
#[derive(Debug, Clone, PartialEq)]
pub struct PeerVerdict {
    pub success: bool,
    pub duration: Option<f64>,
    pub message: String,
    pub node: Option<String>,
}

impl PeerVerdict {
    /// Decode the first result of a peer reply. `None` when the reply carries
    /// no `*.success` measurement at all.
    pub fn from_result(result: &Value) -> Option<Self> {
        let measurements = result.get("measurements")?.as_object()?;

        // serde_json maps iterate in key order, so the first match is stable
        let success = measurements
            .iter()
            .find(|(key, _)| key.ends_with(".success"))
            .map(|(_, value)| value.as_f64() == Some(1.0))?;

        let duration = DURATION_SUFFIXES.iter().find_map(|suffix| find_duration(measurements, suffix));

        Some(Self {
            success,
            duration,
            message: result.get("message").and_then(Value::as_str).unwrap_or_default().to_string(),
            node: result.get("node").and_then(Value::as_str).map(str::to_string),
        })
    }
}

fn find_duration(measurements: &MeasurementsMap, suffix: &str) -> Option<f64> {
    measurements
        .iter()
        .filter(|(key, _)| key.rsplit_once('.').is_some_and(|(_, last)| last == suffix))
        .find_map(|(_, value)| value.as_f64())
}

/// Asks peer agents to confirm a local failure
pub struct NodeForwarder {
    node_name: String,
    nodes: Vec<PeerNode>,
    forward_except: Vec<Regex>,
    cache_ttl: Duration,
    failed_nodes: Mutex<HashMap<String, FailedNode>>,
    forward_log: Option<PathBuf>,
}

impl NodeForwarder {
    pub fn new(config: &Config) -> Result<Self> {
        let forward_except = config
            .node
            .forward_except
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("invalid forward_except pattern '{pattern}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        let timeout = secs_to_duration(config.node.node_timeout);
        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (name, node) in &config.nodes {
            let check_url = match check_url(&node.url) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Invalid node url in config: '{}': {}", node.url, e);
                    continue;
                }
            };
            let client = reqwest::Client::builder()
                .user_agent(Config::user_agent())
                .timeout(timeout)
                .danger_accept_invalid_certs(!node.verify_ssl)
                .build()
                .with_context(|| format!("failed to build HTTP client for node '{name}'"))?;

            nodes.push(PeerNode {
                name: name.clone(),
                url: node.url.clone(),
                check_url,
                node: node.clone(),
                client,
            });
        }

        Ok(Self {
            node_name: config.node_name.clone(),
            nodes,
            forward_except,
            cache_ttl: secs_to_duration(config.node.node_cache_errors),
            failed_nodes: Mutex::new(HashMap::new()),
            forward_log: config.node.forward_log.clone(),
        })
    }

    pub fn has_nodes(&self) -> bool {
        !self.nodes.is_empty()
    }

    /// Reconcile a locally confirmed failure with the peers' view.
    pub async fn ask_nodes(&self, check: &Check, result: CheckResult) -> CheckResult {
        if self.nodes.is_empty() || !check.is_forwardable() {
            return result;
        }
        let Some(message) = result.message.clone() else {
            return result;
        };

        if let Some(pattern) = self.forward_except.iter().find(|re| re.is_match(&message)) {
            info!("forward_except matched on '{}', won't forward {}", pattern.as_str(), message);
            return result;
        }

        let body = Input::single(check);
        let answers = join_all(self.nodes.iter().map(|peer| self.ask_node(peer, check, &message, &body))).await;

        match self.reconcile(answers, &result) {
            Some(combined) => combined,
            None => {
                debug!("No peer confirmed check {}, keeping local result", check.unique_id());
                result
            }
        }
    }

    async fn ask_node(&self, peer: &PeerNode, check: &Check, message: &str, body: &Input) -> PeerAnswer {
        if let Some(cached) = self.recent_failure(&peer.url) {
            warn!("Skipping recently failed node {}", peer.url);
            return match cached.response.as_deref().and_then(|b| serde_json::from_slice(b).ok()) {
                Some(results) => PeerAnswer::Replied { name: peer.name.clone(), results },
                None => PeerAnswer::Failed {
                    name: peer.name.clone(),
                    message: "node failed recently".into(),
                },
            };
        }

        self.log_forward(&format!(
            "Forwarding check {}, type {}, msg '{}' to {}",
            check.uuid(),
            check.kind(),
            message,
            peer.url
        ))
        .await;
        debug!("Asking node {} to run {}", peer.url, check.unique_id());

        let mut request = peer.client.post(peer.check_url.clone()).json(body);
        if !peer.node.username.is_empty() {
            request = request.basic_auth(&peer.node.username, Some(&peer.node.password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Node request failed: {} ({})", e, check.unique_id());
                self.mark_failure(&peer.url, None);
                return PeerAnswer::Failed { name: peer.name.clone(), message: e.to_string() };
            }
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                self.mark_failure(&peer.url, None);
                return PeerAnswer::Failed { name: peer.name.clone(), message: e.to_string() };
            }
        };

        if !status.is_success() {
            error!("Node {} replied with HTTP {}", peer.url, status.as_u16());
            self.mark_failure(&peer.url, Some(bytes));
            return PeerAnswer::Failed {
                name: peer.name.clone(),
                message: format!("HTTP {}", status.as_u16()),
            };
        }

        match serde_json::from_slice::<Vec<Value>>(&bytes) {
            Ok(results) => PeerAnswer::Replied { name: peer.name.clone(), results },
            Err(e) => {
                error!("Invalid result from node {}: {}", peer.url, e);
                PeerAnswer::Failed { name: peer.name.clone(), message: format!("invalid reply: {e}") }
            }
        }
    }

    fn reconcile(&self, answers: Vec<PeerAnswer>, local: &CheckResult) -> Option<CheckResult> {
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut succeeded: Vec<String> = Vec::new();
        let mut winner: Option<(usize, Option<f64>)> = None;

        for (idx, answer) in answers.iter().enumerate() {
            let (name, results) = match answer {
                PeerAnswer::Failed { name, message } => {
                    failed.push((name.clone(), message.clone()));
                    continue;
                }
                PeerAnswer::Replied { name, results } => (name, results),
            };
            let Some(verdict) = results.first().and_then(PeerVerdict::from_result) else {
                continue;
            };
            let name = verdict.node.clone().unwrap_or_else(|| name.clone());
            if !verdict.success {
                failed.push((name, verdict.message));
                continue;
            }
            succeeded.push(name);

            let faster = match winner {
                None => true,
                Some((_, best)) => {
                    verdict.duration.unwrap_or(f64::INFINITY) < best.unwrap_or(f64::INFINITY)
                }
            };
            if faster {
                winner = Some((idx, verdict.duration));
            }
        }

        let (winner_idx, _) = winner?;
        let PeerAnswer::Replied { results, .. } = &answers[winner_idx] else {
            return None;
        };
        let mut combined: CheckResult = match serde_json::from_value(results[0].clone()) {
            Ok(result) => result,
            Err(e) => {
                error!("Fastest node result is not a valid result: {}", e);
                return None;
            }
        };

        let mut message =
            format!("{}: {}\n", self.node_name, combined.message.as_deref().unwrap_or_default());
        for (name, msg) in &failed {
            message.push_str(&format!("{name}: {msg}\n"));
        }
        for name in &succeeded {
            message.push_str(&format!("{name}: check succeeded\n"));
        }
        debug!("Peers overrode local failure: {}", message);
        combined.message = Some(message);

        for (idx, answer) in answers.into_iter().enumerate() {
            if let PeerAnswer::Replied { results, .. } = answer {
                if idx != winner_idx {
                    combined.node_measurements.extend(results);
                }
            }
        }
        match serde_json::to_value(local) {
            Ok(local) => combined.node_measurements.push(local),
            Err(e) => error!("failed to encode local measurement: {}", e),
        }

        Some(combined)
    }

    fn recent_failure(&self, url: &str) -> Option<FailedNode> {
        let failed = self.failed_nodes.lock();
        failed.get(url).filter(|f| f.failed_at.elapsed() < self.cache_ttl).cloned()
    }

    fn mark_failure(&self, url: &str, response: Option<Vec<u8>>) {
        self.failed_nodes
            .lock()
            .insert(url.to_string(), FailedNode { failed_at: Instant::now(), response });
    }

    async fn log_forward(&self, line: &str) {
        let Some(path) = &self.forward_log else {
            return;
        };
        let entry = format!("{} {}\n", chrono::Local::now().to_rfc3339(), line);
        let written = async {
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(entry.as_bytes()).await
        };
        if let Err(e) = written.await {
            debug!("failed to write forward log {}: {}", path.display(), e);
        }
    }
}

fn check_url(base: &str) -> Result<Url> {
    let mut url = Url::parse(base)?;
    let path = format!("{}/check", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}
