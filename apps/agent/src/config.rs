use std::collections::BTreeMap;
use std::time::Duration;
use std::{env, fmt, fs, path};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

pub const MIN_HUB_REQUEST_TIMEOUT: u64 = 1;
pub const MAX_HUB_REQUEST_TIMEOUT: u64 = 600;
pub const DEFAULT_HUB_REQUEST_TIMEOUT: u64 = 30;

const ENV_HUB_URL: &str = "PICKET_HUB_URL";
const ENV_HUB_USER: &str = "PICKET_HUB_USER";
const ENV_HUB_PASSWORD: &str = "PICKET_HUB_PASSWORD";

/// How the delivery task drains the result buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderMode {
    /// Post as soon as results are available.
    Wait,
    /// Post on a fixed timer (`sender_mode_interval`).
    Interval,
}

impl fmt::Display for SenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SenderMode::Wait => write!(f, "wait"),
            SenderMode::Interval => write!(f, "interval"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identifies this agent in combined node reports
    pub node_name: String,
    /// Seconds between hub fetches, also the pause after a failed health gate
    pub sleep: f64,
    pub log_level: String,
    pub stats_file: Option<path::PathBuf>,
    pub queue_stats_file: Option<path::PathBuf>,

    pub hub_url: String,
    pub hub_user: String,
    pub hub_password: String,
    pub hub_proxy: String,
    pub hub_proxy_user: String,
    pub hub_proxy_password: String,
    pub hub_gzip: bool,
    /// Bounds connect, redirects and body read of every hub request
    pub hub_request_timeout: u64,
    /// PEM bundle replacing the system roots for hub connections
    pub root_certs_path: Option<path::PathBuf>,

    pub icmp_timeout: f64,
    pub net_tcp_timeout: f64,
    pub http_check_timeout: f64,
    pub max_redirects: usize,
    pub ignore_ssl_errors: bool,
    /// SSL checks fail when the peer certificate expires within this many days
    pub ssl_cert_expiry_threshold: u32,

    pub sender_mode: SenderMode,
    pub sender_mode_interval: f64,
    pub sender_batch_size: usize,
    pub sender_interval: f64,
    pub discard_on_http_response_error: bool,
    pub discard_on_http_connect_error: bool,
    pub check_results_ttl: f64,

    pub sleep_duration_after_check: f64,
    pub sleep_duration_empty_queue: f64,

    pub failure_confirmation: u32,
    pub failure_confirmation_delay: f64,

    pub health_checks: HealthCheckConfig,
    pub http_listener: HttpListenerConfig,
    pub node: NodeConfig,
    pub nodes: BTreeMap<String, Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub reference_ping_hosts: Vec<String>,
    pub reference_ping_timeout: f64,
    pub reference_ping_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpListenerConfig {
    /// e.g. "http://0.0.0.0:9955", empty disables the listener
    pub http_listen: String,
    pub http_auth_user: String,
    pub http_auth_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_timeout: f64,
    pub node_cache_errors: f64,
    /// Case-insensitive regular expressions; a matching failure is not forwarded
    pub forward_except: Vec<String>,
    pub forward_log: Option<path::PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub url: String,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { reference_ping_hosts: Vec::new(), reference_ping_timeout: 1.0, reference_ping_count: 1 }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_timeout: 3.0,
            node_cache_errors: 10.0,
            forward_except: [
                "bad status code",
                "certificate.*(expire|unknown)",
                "(tls|ssl) (error|failed|handshake)",
                "service.*support (ssl|tls)",
                "failed to verify .* service",
                "connection.*refused",
                "no such host",
                "x509",
                "pattern.*extracted text",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            forward_log: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "Picket".into(),
            sleep: 30.0,
            log_level: "error".into(),
            stats_file: Some(env::temp_dir().join("picket.stats")),
            queue_stats_file: Some(env::temp_dir().join("picket.queuestats")),
            hub_url: String::new(),
            hub_user: String::new(),
            hub_password: String::new(),
            hub_proxy: String::new(),
            hub_proxy_user: String::new(),
            hub_proxy_password: String::new(),
            hub_gzip: false,
            hub_request_timeout: DEFAULT_HUB_REQUEST_TIMEOUT,
            root_certs_path: None,
            icmp_timeout: 0.1,
            net_tcp_timeout: 3.0,
            http_check_timeout: 15.0,
            max_redirects: 10,
            ignore_ssl_errors: false,
            ssl_cert_expiry_threshold: 7,
            sender_mode: SenderMode::Wait,
            sender_mode_interval: 0.0,
            sender_batch_size: 100,
            sender_interval: 2.0,
            discard_on_http_response_error: false,
            discard_on_http_connect_error: false,
            check_results_ttl: 30.0,
            sleep_duration_after_check: 0.005,
            sleep_duration_empty_queue: 0.2,
            failure_confirmation: 0,
            failure_confirmation_delay: 1.0,
            health_checks: HealthCheckConfig::default(),
            http_listener: HttpListenerConfig::default(),
            node: NodeConfig::default(),
            nodes: BTreeMap::new(),
        }
    }
}

/// Fractional seconds from the config file; negative or NaN become zero.
pub fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 { Duration::from_secs_f64(secs) } else { Duration::ZERO }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/picket/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("picket/config.toml"))
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "***" }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_title_2 = write_title_indented(2);
        let write_1 = write_indented(1);
        let write_2 = write_indented(2);
        let path_or_none = |p: &Option<path::PathBuf>| {
            p.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into())
        };

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Agent")?;
        write_1(f, "Node Name", &self.node_name)?;
        write_1(f, "Round Interval (s)", &self.sleep)?;
        write_1(f, "Log Level", &self.log_level)?;
        write_1(f, "Stats File", &path_or_none(&self.stats_file))?;
        write_1(f, "Queue Stats File", &path_or_none(&self.queue_stats_file))?;

        write_title_1(f, "Hub")?;
        write_1(f, "URL", &self.hub_url)?;
        write_1(f, "User", &self.hub_user)?;
        write_1(f, "Password", &mask(&self.hub_password))?;
        write_1(f, "Proxy", &self.hub_proxy)?;
        write_1(f, "Gzip", &self.hub_gzip)?;
        write_1(f, "Request Timeout (s)", &self.hub_request_timeout)?;

        write_title_1(f, "Sender")?;
        write_1(f, "Mode", &self.sender_mode)?;
        write_1(f, "Batch Size", &self.sender_batch_size)?;
        write_1(f, "Pause Between Batches (s)", &self.sender_interval)?;
        write_1(f, "Results TTL (s)", &self.check_results_ttl)?;
        write_1(f, "Discard On Response Error", &self.discard_on_http_response_error)?;
        write_1(f, "Discard On Connect Error", &self.discard_on_http_connect_error)?;

        write_title_1(f, "Checks")?;
        write_1(f, "Failure Confirmation", &self.failure_confirmation)?;
        write_1(f, "Failure Confirmation Delay (s)", &self.failure_confirmation_delay)?;
        write_1(f, "SSL Cert Expiry Threshold (days)", &self.ssl_cert_expiry_threshold)?;
        write_1(f, "Reference Ping Hosts", &self.health_checks.reference_ping_hosts.join(", "))?;

        write_title_1(f, "Nodes")?;
        write_1(f, "Timeout (s)", &self.node.node_timeout)?;
        write_1(f, "Cache Errors (s)", &self.node.node_cache_errors)?;
        for (name, node) in &self.nodes {
            write_title_2(f, name)?;
            write_2(f, "URL", &node.url)?;
            write_2(f, "Verify SSL", &node.verify_ssl)?;
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/picket/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let mut config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::Read { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())
                .map_err(|source| ConfigError::Parse { path: config_path.clone(), source })?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.apply_env(|name| env::var(name).ok(), false);
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::Write { path: path.to_path_buf(), source })
    }

    /// Fill hub credentials from the environment. Without `force` only empty
    /// fields are touched.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>, force: bool) {
        let fields = [
            (ENV_HUB_URL, &mut self.hub_url),
            (ENV_HUB_USER, &mut self.hub_user),
            (ENV_HUB_PASSWORD, &mut self.hub_password),
        ];
        for (name, field) in fields {
            if let Some(value) = lookup(name) {
                if field.is_empty() || force {
                    *field = value;
                }
            }
        }
    }

    /// Auto-corrects what it can and rejects what it cannot.
    pub fn sanitize(&mut self) -> Result<(), ConfigError> {
        if !self.hub_proxy.is_empty() {
            if !self.hub_proxy.starts_with("http") {
                self.hub_proxy = format!("http://{}", self.hub_proxy);
            }
            Url::parse(&self.hub_proxy).map_err(|e| ConfigError::Invalid {
                field: "hub_proxy",
                reason: format!("failed to parse URL: {e}"),
            })?;
        }

        if !(MIN_HUB_REQUEST_TIMEOUT..=MAX_HUB_REQUEST_TIMEOUT).contains(&self.hub_request_timeout) {
            self.hub_request_timeout = DEFAULT_HUB_REQUEST_TIMEOUT;
            return Err(ConfigError::Invalid {
                field: "hub_request_timeout",
                reason: format!(
                    "must be between {MIN_HUB_REQUEST_TIMEOUT} and {MAX_HUB_REQUEST_TIMEOUT}"
                ),
            });
        }

        if self.sender_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "sender_batch_size",
                reason: "must be at least 1".into(),
            });
        }

        if self.log_level.parse::<logger::LogLevel>().is_err() {
            return Err(ConfigError::Invalid {
                field: "log_level",
                reason: format!("'{}' is not one of debug, info, error", self.log_level),
            });
        }

        for (name, node) in &self.nodes {
            Url::parse(&node.url).map_err(|e| ConfigError::Invalid {
                field: "nodes",
                reason: format!("node '{name}' has an invalid url '{}': {e}", node.url),
            })?;
        }

        Ok(())
    }

    pub fn round_interval(&self) -> Duration {
        secs_to_duration(self.sleep)
    }

    /// `None` disables TTL eviction.
    pub fn results_ttl(&self) -> Option<Duration> {
        let ttl = secs_to_duration(self.check_results_ttl);
        (!ttl.is_zero()).then_some(ttl)
    }

    pub fn user_agent() -> String {
        format!("picket/{}", env!("CARGO_PKG_VERSION"))
    }
}
