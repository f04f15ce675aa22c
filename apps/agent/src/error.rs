use std::io::Error as IoError;
use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("failed to write config '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: IoError,
    },
    #[error("config load '{}' error: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("no config directory available, set $XDG_CONFIG_HOME or $HOME")]
    ConfigPathUnavailable,
    #[error("invalid '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Why a refresh of the check queue failed.
///
/// The variants drive the dispatch loop's backoff, see [`crate::hub::Backoff`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Missing input file flag (-i) or hub_url param in config")]
    MissingHubOrInput,
    #[error("Hub replied with a general error code ({0})")]
    HubGeneral(StatusCode),
    #[error("Hub replied with a 429 error code")]
    HubTooManyRequests,
    #[error("{context}: hub replied with unexpected status {status}")]
    UnexpectedStatus { context: String, status: StatusCode },
    #[error("{context}: hub request timeout of {timeout_secs} seconds exceeded")]
    Timeout { context: String, timeout_secs: u64 },
    #[error("{context}: {source}")]
    Request {
        context: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid hub_url: {0}")]
    InvalidHubUrl(String),
    #[error("{context}: hub reply is not a valid check list: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("input file '{}': {reason}", path.display())]
    InputFile { path: PathBuf, reason: String },
}

/// Failure to hand a batch of results to the hub or the output file.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("hub connection failed: {0}")]
    Connect(String),
    #[error("hub replied with HTTP {status}: {body}")]
    Response { status: u16, body: String },
    #[error("failed to write results: {0}")]
    Io(#[from] IoError),
    #[error("failed to encode results: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Whether the unsent batch should be dropped instead of retried.
    pub fn should_discard(&self, on_response_error: bool, on_connect_error: bool) -> bool {
        match self {
            DeliveryError::Connect(_) | DeliveryError::Io(_) => on_connect_error,
            DeliveryError::Response { .. } => on_response_error,
            // Re-encoding the same results fails the same way.
            DeliveryError::Encode(_) => true,
        }
    }
}
