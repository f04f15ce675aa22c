use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Dotted metric key → numeric or string value, e.g. `net.tcp.443.success = 1`
pub type MeasurementsMap = Map<String, Value>;

pub const PROTOCOL_ICMP: &str = "icmp";
pub const PROTOCOL_TCP: &str = "tcp";
pub const PROTOCOL_SSL: &str = "ssl";

/// Kind of check, as named on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Service,
    Web,
    Snmp,
}

impl CheckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Service => "serviceCheck",
            CheckKind::Web => "webCheck",
            CheckKind::Snmp => "snmpCheck",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCheck {
    #[serde(rename = "checkUuid", default)]
    pub uuid: String,
    #[serde(rename = "data", default)]
    pub check: ServiceCheckData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCheckData {
    pub connect: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub protocol: String,
    pub service: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebCheck {
    #[serde(rename = "checkUuid", default)]
    pub uuid: String,
    #[serde(rename = "data", default)]
    pub check: WebCheckData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebCheckData {
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    pub dont_follow_redirects: bool,
    pub ignore_ssl_errors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnmpCheck {
    #[serde(rename = "checkUuid", default)]
    pub uuid: String,
    #[serde(rename = "data", default)]
    pub check: SnmpCheckData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnmpCheckData {
    pub connect: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub protocol: String,
    pub community: String,
    pub preset: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single configured probe. Immutable once dequeued.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    Service(ServiceCheck),
    Web(WebCheck),
    Snmp(SnmpCheck),
}

impl Check {
    pub fn uuid(&self) -> &str {
        match self {
            Check::Service(c) => &c.uuid,
            Check::Web(c) => &c.uuid,
            Check::Snmp(c) => &c.uuid,
        }
    }

    pub fn kind(&self) -> CheckKind {
        match self {
            Check::Service(_) => CheckKind::Service,
            Check::Web(_) => CheckKind::Web,
            Check::Snmp(_) => CheckKind::Snmp,
        }
    }

    /// Stable identity used for queue dedup and the in-progress tracker.
    ///
    /// Two checks with the same UUID but different parameters are distinct.
    pub fn unique_id(&self) -> String {
        let params = match self {
            Check::Service(c) => serde_json::to_vec(&c.check),
            Check::Web(c) => serde_json::to_vec(&c.check),
            Check::Snmp(c) => serde_json::to_vec(&c.check),
        }
        .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(self.kind().as_str().as_bytes());
        hasher.update(&params);
        let digest = hasher.finalize();
        format!("{}-{}", self.uuid(), hex::encode(&digest[..8]))
    }

    /// SSL service checks fail identically everywhere and are never forwarded.
    pub fn is_forwardable(&self) -> bool {
        match self {
            Check::Service(c) => !c.check.protocol.eq_ignore_ascii_case(PROTOCOL_SSL),
            Check::Web(_) | Check::Snmp(_) => true,
        }
    }

    /// Check parameters as attached to the result
    pub fn params(&self) -> Value {
        match self {
            Check::Service(c) => serde_json::to_value(&c.check),
            Check::Web(c) => serde_json::to_value(&c.check),
            Check::Snmp(c) => serde_json::to_value(&c.check),
        }
        .unwrap_or(Value::Null)
    }
}

/// A batch of checks grouped by kind, as served by the hub or an input file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Input {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_checks: Vec<ServiceCheck>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub web_checks: Vec<WebCheck>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub snmp_checks: Vec<SnmpCheck>,
}

impl Input {
    /// Wrap a single check, as forwarded to a peer node
    pub fn single(check: &Check) -> Self {
        let mut input = Input::default();
        match check {
            Check::Service(c) => input.service_checks.push(c.clone()),
            Check::Web(c) => input.web_checks.push(c.clone()),
            Check::Snmp(c) => input.snmp_checks.push(c.clone()),
        }
        input
    }

    pub fn len(&self) -> usize {
        self.service_checks.len() + self.web_checks.len() + self.snmp_checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_checks(self) -> Vec<Check> {
        self.service_checks
            .into_iter()
            .map(Check::Service)
            .chain(self.web_checks.into_iter().map(Check::Web))
            .chain(self.snmp_checks.into_iter().map(Check::Snmp))
            .collect()
    }
}

/// Outcome of executing one check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    #[serde(default)]
    pub check_type: String,

    #[serde(default)]
    pub check_uuid: String,

    /// Unix seconds when the check started
    #[serde(default)]
    pub timestamp: i64,

    #[serde(default, rename = "check", skip_serializing_if = "Value::is_null")]
    pub params: Value,

    #[serde(default)]
    pub measurements: MeasurementsMap,

    /// `None` on success, otherwise the failure text
    #[serde(default)]
    pub message: Option<String>,

    /// Name of the agent that produced this result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    /// Peer and local snapshots attached during node reconciliation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_measurements: Vec<Value>,
}

impl CheckResult {
    /// Create a new, successful result for `check`
    pub fn new(check: &Check, node: Option<String>) -> Self {
        Self {
            check_type: check.kind().as_str().to_string(),
            check_uuid: check.uuid().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            params: check.params(),
            measurements: MeasurementsMap::new(),
            message: None,
            node,
            node_measurements: Vec::new(),
        }
    }

    /// Mark the check as successful with its measurements
    pub fn success(mut self, measurements: MeasurementsMap) -> Self {
        self.measurements = measurements;
        self.message = None;
        self
    }

    /// Mark the check as failed, keeping whatever was measured
    pub fn failure(mut self, message: String, measurements: MeasurementsMap) -> Self {
        self.measurements = measurements;
        self.message = Some(message);
        self
    }

    pub fn is_success(&self) -> bool {
        self.message.is_none()
    }
}
