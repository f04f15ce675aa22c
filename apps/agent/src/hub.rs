//! Conversation with the hub: fetching checks and pushing results.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{DeliveryError, FetchError};
use crate::monitoring::Check;
use crate::monitoring::types::{CheckResult, Input};
use crate::monitoring::validation::valid_checks;
use crate::stats::Stats;

pub const TOO_MANY_REQUESTS_DELAY: Duration = Duration::from_secs(10);
pub const MISSING_INPUT_EXIT_DELAY: Duration = Duration::from_secs(10);

/// What the dispatch loop does after a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Log and keep the normal schedule
    Continue,
    /// Pause fetching for a while
    Sleep(Duration),
    /// Configuration problem: wait, then stop the agent
    Exit(Duration),
}

impl Backoff {
    pub fn for_error(err: &FetchError, round_interval: Duration) -> Self {
        match err {
            FetchError::MissingHubOrInput => Backoff::Exit(MISSING_INPUT_EXIT_DELAY),
            FetchError::HubGeneral(_) => Backoff::Sleep(round_interval),
            FetchError::HubTooManyRequests => Backoff::Sleep(TOO_MANY_REQUESTS_DELAY),
            _ => Backoff::Continue,
        }
    }
}

#[derive(Serialize)]
struct ResultsEnvelope<'a> {
    results: &'a [CheckResult],
}

/// HTTP client for the hub
pub struct HubClient {
    client: reqwest::Client,
    url: Url,
    user: String,
    password: String,
    gzip: bool,
    timeout_secs: u64,
    stats: Arc<Stats>,
}

impl HubClient {
    pub fn new(config: &Config, stats: Arc<Stats>) -> Result<Self> {
        let url = Url::parse(&config.hub_url)
            .map_err(|e| FetchError::InvalidHubUrl(format!("'{}': {e}", config.hub_url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidHubUrl(format!(
                "wrong scheme '{}', URL must start with http:// or https://",
                url.scheme()
            ))
            .into());
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(Config::user_agent())
            .timeout(Duration::from_secs(config.hub_request_timeout));

        if !config.hub_proxy.is_empty() {
            let mut proxy = reqwest::Proxy::all(&config.hub_proxy)
                .with_context(|| format!("invalid hub_proxy '{}'", config.hub_proxy))?;
            if !config.hub_proxy_user.is_empty() {
                proxy = proxy.basic_auth(&config.hub_proxy_user, &config.hub_proxy_password);
            }
            builder = builder.proxy(proxy);
        }

        if let Some(path) = &config.root_certs_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read root certificates '{}'", path.display()))?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .with_context(|| format!("invalid root certificates in '{}'", path.display()))?;
            builder = builder.tls_built_in_root_certs(false);
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }

        Ok(Self {
            client: builder.build().context("failed to build hub HTTP client")?,
            url,
            user: config.hub_user.clone(),
            password: config.hub_password.clone(),
            gzip: config.hub_gzip,
            timeout_secs: config.hub_request_timeout,
            stats,
        })
    }

    fn context(&self) -> String {
        if self.user.is_empty() {
            "fetch from hub".to_string()
        } else {
            format!("fetch from hub({}:***)", self.user)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.user.is_empty() {
            request
        } else {
            request.basic_auth(&self.user, Some(&self.password))
        }
    }

    fn transport_error(&self, source: reqwest::Error) -> FetchError {
        if source.is_timeout() {
            FetchError::Timeout { context: self.context(), timeout_secs: self.timeout_secs }
        } else {
            FetchError::Request { context: self.context(), source }
        }
    }

    /// GET the current check list
    pub async fn fetch(&self) -> Result<Input, FetchError> {
        let outcome = self.fetch_input().await;
        if let Err(e) = &outcome {
            self.stats.hub_error(e.to_string());
        }
        outcome
    }

    async fn fetch_input(&self) -> Result<Input, FetchError> {
        let response = self
            .authorize(self.client.get(self.url.clone()))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            debug!("Hub fetch failed: hub replied with {}", status);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => FetchError::HubTooManyRequests,
                s if s.is_client_error() || s.is_server_error() => FetchError::HubGeneral(s),
                s => FetchError::UnexpectedStatus { context: self.context(), status: s },
            });
        }

        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let input: Input = serde_json::from_slice(&body)
            .map_err(|source| FetchError::Decode { context: self.context(), source })?;

        self.stats.update(|s| {
            s.bytes_fetched_total += body.len() as u64;
            s.checks_fetched_total += input.len() as u64;
        });
        Ok(input)
    }

    /// POST one batch of results. Returns the number of body bytes sent.
    pub async fn push(&self, results: &[CheckResult]) -> Result<usize, DeliveryError> {
        let json = serde_json::to_vec(&ResultsEnvelope { results })?;
        let body = if self.gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&json)?;
            encoder.finish()?
        } else {
            json
        };
        let sent = body.len();

        let mut request =
            self.authorize(self.client.post(self.url.clone())).header(CONTENT_TYPE, "application/json");
        if self.gzip {
            request = request.header(CONTENT_ENCODING, "gzip");
        }

        let response = request.body(body).send().await.map_err(|e| DeliveryError::Connect(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Response { status: status.as_u16(), body });
        }
        Ok(sent)
    }
}

/// Where checks come from
pub enum CheckSource {
    /// A JSON file, re-read on every fetch
    File(PathBuf),
    Hub(Arc<HubClient>),
    /// Neither an input file nor a hub URL was given
    Unconfigured,
}

impl CheckSource {
    pub async fn fetch(&self) -> Result<Vec<Check>, FetchError> {
        let input = match self {
            CheckSource::File(path) => {
                let raw = tokio::fs::read(path).await.map_err(|e| FetchError::InputFile {
                    path: path.clone(),
                    reason: format!("failed to read the file: {e}"),
                })?;
                serde_json::from_slice::<Input>(&raw).map_err(|e| FetchError::InputFile {
                    path: path.clone(),
                    reason: format!("JSON unmarshal error: {e}"),
                })?
            }
            CheckSource::Hub(hub) => {
                let input = hub.fetch().await?;
                if input.is_empty() {
                    debug!("Fetched 0 checks from hub");
                } else {
                    info!("Fetched {} checks from hub", input.len());
                }
                input
            }
            CheckSource::Unconfigured => {
                warn!("{}", FetchError::MissingHubOrInput);
                return Err(FetchError::MissingHubOrInput);
            }
        };
        Ok(valid_checks(input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Bytes;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use flate2::read::GzDecoder;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::io::Read;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/checks")
    }

    async fn hub_replying(status: AxumStatus, body: Value) -> String {
        serve(Router::new().route(
            "/checks",
            get(move || {
                let body = body.clone();
                async move { (status, axum::Json(body)) }
            }),
        ))
        .await
    }

    fn client(url: &str, user: &str) -> (HubClient, Arc<Stats>) {
        let stats = Arc::new(Stats::new());
        let config = Config {
            hub_url: url.into(),
            hub_user: user.into(),
            hub_password: "secret".into(),
            hub_request_timeout: 1,
            ..Config::default()
        };
        (HubClient::new(&config, stats.clone()).unwrap(), stats)
    }

    #[tokio::test]
    async fn test_fetch_parses_checks() {
        let url = hub_replying(
            AxumStatus::OK,
            json!({
                "serviceChecks": [{"checkUuid": "s1", "data": {"connect": "1.1.1.1", "protocol": "icmp"}}],
                "webChecks": [{"checkUuid": "w1", "data": {"url": "https://example.com", "method": "get"}}]
            }),
        )
        .await;
        let (hub, stats) = client(&url, "");

        let checks = CheckSource::Hub(Arc::new(hub)).fetch().await.unwrap();
        assert_eq!(checks.len(), 2);
        let snap = stats.snapshot();
        assert_eq!(snap.checks_fetched_total, 2);
        assert!(snap.bytes_fetched_total > 0);
    }

    #[tokio::test]
    async fn test_fetch_classifies_status() {
        let url = hub_replying(AxumStatus::TOO_MANY_REQUESTS, json!({})).await;
        let (hub, stats) = client(&url, "");
        assert!(matches!(hub.fetch().await, Err(FetchError::HubTooManyRequests)));
        assert_eq!(stats.snapshot().hub_errors_total, 1);

        let url = hub_replying(AxumStatus::SERVICE_UNAVAILABLE, json!({})).await;
        let (hub, _) = client(&url, "");
        assert!(matches!(hub.fetch().await, Err(FetchError::HubGeneral(s)) if s.as_u16() == 503));

        let url = hub_replying(AxumStatus::OK, json!("not an input")).await;
        let (hub, _) = client(&url, "picket");
        let err = hub.fetch().await.unwrap_err();
        assert!(err.to_string().starts_with("fetch from hub(picket:***): "));
    }

    #[tokio::test]
    async fn test_fetch_timeout_names_limit() {
        let url = serve(Router::new().route(
            "/checks",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "{}"
            }),
        ))
        .await;
        let (hub, stats) = client(&url, "");

        let err = hub.fetch().await.unwrap_err();
        assert_eq!(err.to_string(), "fetch from hub: hub request timeout of 1 seconds exceeded");
        assert_eq!(stats.snapshot().hub_last_error_message, err.to_string());
    }

    #[tokio::test]
    async fn test_push_gzip_with_auth() {
        let captured: Arc<Mutex<Option<(HeaderMap, Bytes)>>> = Arc::new(Mutex::new(None));
        let sink = captured.clone();
        let url = serve(Router::new().route(
            "/checks",
            axum::routing::post(move |headers: HeaderMap, body: Bytes| {
                let sink = sink.clone();
                async move {
                    *sink.lock() = Some((headers, body));
                    AxumStatus::OK
                }
            }),
        ))
        .await;

        let stats = Arc::new(Stats::new());
        let config = Config {
            hub_url: url,
            hub_user: "user".into(),
            hub_password: "pass".into(),
            hub_gzip: true,
            ..Config::default()
        };
        let hub = HubClient::new(&config, stats).unwrap();

        let check = crate::monitoring::executor::tests::tcp_check("a");
        let results = vec![CheckResult::new(&check, None)];
        let sent = hub.push(&results).await.unwrap();

        let (headers, body) = captured.lock().take().unwrap();
        assert_eq!(sent, body.len());
        assert_eq!(headers["content-encoding"], "gzip");
        assert!(headers["authorization"].to_str().unwrap().starts_with("Basic "));
        assert!(headers["user-agent"].to_str().unwrap().starts_with("picket/"));

        let mut json = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut json).unwrap();
        let decoded: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded["results"][0]["checkUuid"], "a");
    }

    #[tokio::test]
    async fn test_push_error_classes() {
        let url = serve(Router::new().route(
            "/checks",
            axum::routing::post(|| async { (AxumStatus::BAD_REQUEST, "rejected") }),
        ))
        .await;
        let (hub, _) = client(&url, "");
        match hub.push(&[]).await {
            Err(DeliveryError::Response { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "rejected");
            }
            other => panic!("unexpected {other:?}"),
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (hub, _) = client(&format!("http://{addr}/"), "");
        assert!(matches!(hub.push(&[]).await, Err(DeliveryError::Connect(_))));
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checks.json");
        std::fs::write(
            &path,
            r#"{"serviceChecks":[{"checkUuid":"","data":{}},{"checkUuid":"x","data":{"connect":"a","protocol":"tcp","port":1}}]}"#,
        )
        .unwrap();
        let checks = CheckSource::File(path.clone()).fetch().await.unwrap();
        assert_eq!(checks.len(), 1);

        std::fs::write(&path, "nope").unwrap();
        assert!(matches!(CheckSource::File(path).fetch().await, Err(FetchError::InputFile { .. })));
        assert!(matches!(CheckSource::Unconfigured.fetch().await, Err(FetchError::MissingHubOrInput)));
    }

    #[test]
    fn test_backoff_policy() {
        let round = Duration::from_secs(30);
        assert_eq!(
            Backoff::for_error(&FetchError::MissingHubOrInput, round),
            Backoff::Exit(MISSING_INPUT_EXIT_DELAY)
        );
        assert_eq!(Backoff::for_error(&FetchError::HubGeneral(StatusCode::BAD_GATEWAY), round), Backoff::Sleep(round));
        assert_eq!(
            Backoff::for_error(&FetchError::HubTooManyRequests, round),
            Backoff::Sleep(TOO_MANY_REQUESTS_DELAY)
        );
        assert_eq!(
            Backoff::for_error(&FetchError::InvalidHubUrl("x".into()), round),
            Backoff::Continue
        );
    }

    #[test]
    fn test_rejects_non_http_url() {
        let config = Config { hub_url: "ftp://hub".into(), ..Config::default() };
        assert!(HubClient::new(&config, Arc::new(Stats::new())).is_err());
    }
}
