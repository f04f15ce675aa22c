use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use x509_parser::x509::X509Name;

use super::ping::Pinger;
use super::types::{
    Check, MeasurementsMap, PROTOCOL_ICMP, PROTOCOL_SSL, PROTOCOL_TCP, ServiceCheckData,
    WebCheckData,
};
use crate::config::{Config, secs_to_duration};

const DNS_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);
const ICMP_PACKET_COUNT: u32 = 1;

/// A failed probe: the failure text plus whatever was measured before it failed
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProbeError {
    pub message: String,
    pub measurements: MeasurementsMap,
}

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), measurements: MeasurementsMap::new() }
    }

    pub fn with_measurements(message: impl Into<String>, measurements: MeasurementsMap) -> Self {
        Self { message: message.into(), measurements }
    }
}

/// Executes one check and produces its measurements
#[async_trait::async_trait]
pub trait Checker: Send + Sync {
    async fn run(&self, check: &Check) -> Result<MeasurementsMap, ProbeError>;
}

fn default_port(service: &str) -> Option<u16> {
    let port = match service.to_ascii_lowercase().as_str() {
        "ftp" => 21,
        "ssh" => 22,
        "smtp" => 25,
        "dns" => 53,
        "http" => 80,
        "pop3" => 110,
        "imap" => 143,
        "https" => 443,
        "smtps" => 465,
        "submission" => 587,
        "imaps" => 993,
        "pop3s" => 995,
        "mysql" => 3306,
        "rdp" => 3389,
        "postgresql" => 5432,
        _ => return None,
    };
    Some(port)
}

fn resolve_port(data: &ServiceCheckData) -> Result<u16, ProbeError> {
    match data.port {
        Some(port) if port > 0 => Ok(port),
        _ => default_port(&data.service).ok_or_else(|| {
            ProbeError::new(format!("failed to auto-determine port for '{}'", data.service))
        }),
    }
}

/// Validity of the certificate presented by an SSL service
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateValidity {
    /// `'<subject CN>' issued by <issuer CN>`
    pub name: String,
    pub not_after: DateTime<Utc>,
}

impl CertificateValidity {
    pub fn from_der(der: &[u8]) -> Result<Self, ProbeError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| ProbeError::new(format!("failed to parse peer certificate: {e}")))?;
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| ProbeError::new("peer certificate has an invalid expiry date"))?;

        Ok(Self {
            name: format!("'{}' issued by {}", common_name(cert.subject()), common_name(cert.issuer())),
            not_after,
        })
    }

    /// Fractional days left at `now`, negative once expired
    pub fn days_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.not_after - now).num_seconds() as f64 / 86_400.0
    }
}

fn common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Records `expiryDaysRemaining` and fails at or below `threshold_days`.
fn expiry_verdict(
    prefix: &str,
    mut m: MeasurementsMap,
    cert: &CertificateValidity,
    threshold_days: u32,
    now: DateTime<Utc>,
) -> Result<MeasurementsMap, ProbeError> {
    let remaining = cert.days_remaining(now);
    m.insert(format!("{prefix}expiryDaysRemaining"), json!(remaining));
    if remaining <= f64::from(threshold_days) {
        return Err(ProbeError::with_measurements(
            format!("certificate will expire soon: {}", cert.name),
            m,
        ));
    }
    m.insert(format!("{prefix}success"), json!(1));
    Ok(m)
}

async fn resolve_host(host: &str, port: u16) -> Result<std::net::SocketAddr, ProbeError> {
    let mut addrs = timeout(DNS_RESOLVE_TIMEOUT, lookup_host((host, port)))
        .await
        .map_err(|_| ProbeError::new("resolve ip error: timeout"))?
        .map_err(|e| ProbeError::new(format!("resolve ip error: {e}")))?;
    addrs.next().ok_or_else(|| ProbeError::new("resolve ip error: can't resolve host"))
}

/// HTTP checker for web checks and SSL service checks
pub struct HttpChecker {
    following: reqwest::Client,
    following_insecure: reqwest::Client,
    direct: reqwest::Client,
    direct_insecure: reqwest::Client,
    default_timeout: Duration,
    ignore_ssl_errors: bool,
    cert_expiry_threshold: u32,
}

impl HttpChecker {
    pub fn new(
        default_timeout: Duration,
        max_redirects: usize,
        ignore_ssl_errors: bool,
        cert_expiry_threshold: u32,
    ) -> Result<Self> {
        let build = |follow: bool, insecure: bool| {
            let policy = if follow {
                reqwest::redirect::Policy::limited(max_redirects)
            } else {
                reqwest::redirect::Policy::none()
            };
            reqwest::Client::builder()
                .user_agent(Config::user_agent())
                .redirect(policy)
                .danger_accept_invalid_certs(insecure)
                .tls_info(true)
                .build()
        };

        Ok(Self {
            following: build(true, false)?,
            following_insecure: build(true, true)?,
            direct: build(false, false)?,
            direct_insecure: build(false, true)?,
            default_timeout,
            ignore_ssl_errors,
            cert_expiry_threshold,
        })
    }

    fn client(&self, follow: bool, insecure: bool) -> &reqwest::Client {
        match (follow, insecure) {
            (true, false) => &self.following,
            (true, true) => &self.following_insecure,
            (false, false) => &self.direct,
            (false, true) => &self.direct_insecure,
        }
    }

    /// Fetch a page and verify status and content
    pub async fn web(&self, data: &WebCheckData) -> Result<MeasurementsMap, ProbeError> {
        if data.url.is_empty() {
            return Err(ProbeError::new("Missing data.url key"));
        }
        let method_name =
            if data.method.is_empty() { "GET".to_string() } else { data.method.to_ascii_uppercase() };
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| ProbeError::new(format!("Unsupported method '{method_name}'")))?;

        let prefix = format!("http.{}.{}.", method_name.to_ascii_lowercase(), data.url);
        let mut m = MeasurementsMap::new();
        m.insert(format!("{prefix}success"), json!(0));

        let timeout_duration = data.timeout.map(secs_to_duration).unwrap_or(self.default_timeout);
        let client =
            self.client(!data.dont_follow_redirects, self.ignore_ssl_errors || data.ignore_ssl_errors);
        let mut request = client.request(method, &data.url).timeout(timeout_duration);
        for (name, value) in &data.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &data.post_data {
            request = request.body(body.clone());
        }

        let start = Instant::now();
        let response = request.send().await.map_err(|e| {
            ProbeError::with_measurements(format!("HTTP request failed: {e}"), m.clone())
        })?;
        let status = response.status();
        m.insert(format!("{prefix}httpStatusCode"), json!(status.as_u16()));

        let body = response.text().await.map_err(|e| {
            ProbeError::with_measurements(format!("failed to read response body: {e}"), m.clone())
        })?;
        m.insert(format!("{prefix}totalTimeSpent_s"), json!(start.elapsed().as_secs_f64()));
        m.insert(format!("{prefix}bytesReceived"), json!(body.len()));

        let status_ok = match data.expected_http_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success() || status.is_redirection(),
        };
        if !status_ok {
            return Err(ProbeError::with_measurements(
                format!("bad status code: {}", status.as_u16()),
                m,
            ));
        }

        if let Some(pattern) = data.expected_pattern.as_deref().filter(|p| !p.is_empty()) {
            if !body.contains(pattern) {
                return Err(ProbeError::with_measurements(
                    format!("pattern '{pattern}' not found in extracted text"),
                    m,
                ));
            }
        }

        m.insert(format!("{prefix}success"), json!(1));
        Ok(m)
    }

    /// Complete a verified TLS handshake by issuing a HEAD request, then
    /// check how long the peer certificate stays valid.
    pub async fn ssl(&self, host: &str, port: u16) -> Result<MeasurementsMap, ProbeError> {
        let prefix = format!("net.tcp.ssl.{port}.");
        let mut m = MeasurementsMap::new();
        m.insert(format!("{prefix}success"), json!(0));

        let url = format!("https://{host}:{port}/");
        let start = Instant::now();
        let response = self
            .client(false, false)
            .head(&url)
            .timeout(self.default_timeout)
            .send()
            .await
            .map_err(|e| {
                let message = if e.is_connect() {
                    format!("service doesn't support SSL: {e}")
                } else {
                    format!("SSL check failed: {e}")
                };
                ProbeError::with_measurements(message, m.clone())
            })?;

        m.insert(format!("{prefix}connectTime_s"), json!(start.elapsed().as_secs_f64()));

        let Some(der) = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
        else {
            return Err(ProbeError::with_measurements("no peer certificate received", m));
        };
        let cert = CertificateValidity::from_der(der)
            .map_err(|e| ProbeError::with_measurements(e.message, m.clone()))?;

        expiry_verdict(&prefix, m, &cert, self.cert_expiry_threshold, Utc::now())
    }
}

/// TCP port checker
pub struct TcpChecker {
    timeout_duration: Duration,
}

impl TcpChecker {
    pub fn new(timeout_duration: Duration) -> Self {
        Self { timeout_duration }
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<MeasurementsMap, ProbeError> {
        let prefix = format!("net.tcp.{port}.");
        let mut m = MeasurementsMap::new();
        m.insert(format!("{prefix}success"), json!(0));

        let addr = resolve_host(host, port).await.map_err(|e| {
            ProbeError::with_measurements(e.message, m.clone())
        })?;

        let start = Instant::now();
        timeout(self.timeout_duration, TcpStream::connect(addr))
            .await
            .map_err(|_| ProbeError::with_measurements("TCP connection timeout", m.clone()))?
            .map_err(|e| {
                ProbeError::with_measurements(format!("TCP connection failed: {e}"), m.clone())
            })?;

        m.insert(format!("{prefix}connectTime_s"), json!(start.elapsed().as_secs_f64()));
        m.insert(format!("{prefix}success"), json!(1));
        Ok(m)
    }
}

/// ICMP echo checker
pub struct IcmpChecker {
    pinger: Arc<dyn Pinger>,
    timeout_duration: Duration,
}

impl IcmpChecker {
    pub fn new(pinger: Arc<dyn Pinger>, timeout_duration: Duration) -> Self {
        Self { pinger, timeout_duration }
    }

    pub async fn ping(&self, host: &str) -> Result<MeasurementsMap, ProbeError> {
        let mut m = MeasurementsMap::new();
        m.insert("net.icmp.ping.success".into(), json!(0));

        let stats = self
            .pinger
            .ping(host, ICMP_PACKET_COUNT, self.timeout_duration)
            .await
            .map_err(|e| ProbeError::with_measurements(format!("ICMP ping failed: {e}"), m.clone()))?;

        let loss = stats.packet_loss();
        m.insert("net.icmp.ping.packetLoss_percent".into(), json!(loss));
        if let Some(rtt) = stats.avg_rtt {
            m.insert("net.icmp.ping.roundTripTime_s".into(), json!(rtt.as_secs_f64()));
        }
        if stats.received == 0 {
            return Err(ProbeError::with_measurements(
                format!("ICMP ping failed: {loss}% packet loss"),
                m,
            ));
        }

        m.insert("net.icmp.ping.success".into(), json!(1));
        Ok(m)
    }
}

/// Runs every check kind this agent supports
pub struct StandardChecker {
    http_checker: HttpChecker,
    tcp_checker: TcpChecker,
    icmp_checker: IcmpChecker,
}

impl StandardChecker {
    pub fn new(config: &Config, pinger: Arc<dyn Pinger>) -> Result<Self> {
        Ok(Self {
            http_checker: HttpChecker::new(
                secs_to_duration(config.http_check_timeout),
                config.max_redirects,
                config.ignore_ssl_errors,
                config.ssl_cert_expiry_threshold,
            )?,
            tcp_checker: TcpChecker::new(secs_to_duration(config.net_tcp_timeout)),
            icmp_checker: IcmpChecker::new(pinger, secs_to_duration(config.icmp_timeout)),
        })
    }

    async fn service(&self, data: &ServiceCheckData) -> Result<MeasurementsMap, ProbeError> {
        if data.connect.is_empty() {
            return Err(ProbeError::new("Missing data.connect key"));
        }

        match data.protocol.to_ascii_lowercase().as_str() {
            PROTOCOL_ICMP => self.icmp_checker.ping(&data.connect).await,
            PROTOCOL_TCP => self.tcp_checker.connect(&data.connect, resolve_port(data)?).await,
            PROTOCOL_SSL => self.http_checker.ssl(&data.connect, resolve_port(data)?).await,
            "" => Err(ProbeError::new("Missing check.protocol")),
            other => {
                tracing::error!("serviceCheck: unknown check.protocol: '{}'", other);
                Err(ProbeError::new("Unknown check.protocol"))
            }
        }
    }
}

#[async_trait::async_trait]
impl Checker for StandardChecker {
    async fn run(&self, check: &Check) -> Result<MeasurementsMap, ProbeError> {
        match check {
            Check::Service(c) => self.service(&c.check).await,
            Check::Web(c) => self.http_checker.web(&c.check).await,
            Check::Snmp(_) => Err(ProbeError::new("SNMP checks are not supported by this agent")),
        }
    }
}
