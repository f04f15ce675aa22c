/// HTTP listener - lets peer nodes run checks on this agent
///
/// `GET /` answers with an empty 200, `POST /check` runs an `Input` body
/// through the executor and replies with the results.
mod error;
mod routes;

pub use error::ListenerError;

use std::sync::Arc;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpRequest, HttpServer, http::header, web};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{info, warn};
use url::Url;

use crate::config::HttpListenerConfig;
use crate::monitoring::MonitoringExecutor;

pub struct ListenerState {
    executor: Arc<MonitoringExecutor>,
    node_name: String,
    credentials: Option<(String, String)>,
}

impl ListenerState {
    pub fn new(config: &HttpListenerConfig, executor: Arc<MonitoringExecutor>, node_name: String) -> Self {
        let credentials = (!config.http_auth_user.is_empty())
            .then(|| (config.http_auth_user.clone(), config.http_auth_password.clone()));
        Self { executor, node_name, credentials }
    }

    fn authorize(&self, req: &HttpRequest) -> Result<(), ListenerError> {
        let Some((user, password)) = &self.credentials else {
            return Ok(());
        };

        let supplied = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok());

        match supplied.as_deref().and_then(|s| s.split_once(':')) {
            Some((u, p)) if u == user && p == password => Ok(()),
            _ => {
                warn!("Rejected unauthorized check request from {:?}", req.peer_addr());
                Err(ListenerError::Unauthorized)
            }
        }
    }
}

/// Host and port to bind from an `http://host:port` listen address.
pub fn bind_address(listen: &str) -> Result<(String, u16), ListenerError> {
    let invalid = |reason: String| ListenerError::InvalidAddress { address: listen.to_string(), reason };

    let url = Url::parse(listen).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" => {}
        "https" => return Err(ListenerError::TlsUnsupported),
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host".into()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((host, url.port_or_known_default().unwrap_or(80)))
}

/// Start the listener when `http_listen` is configured.
///
/// The server runs on its own task; stop it through the returned handle.
pub fn start(
    config: &HttpListenerConfig,
    executor: Arc<MonitoringExecutor>,
    node_name: String,
) -> Result<Option<ServerHandle>, ListenerError> {
    if config.http_listen.is_empty() {
        return Ok(None);
    }

    let addr = bind_address(&config.http_listen)?;
    let state = web::Data::new(ListenerState::new(config, executor, node_name));

    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(routes::routes))
        .bind((addr.0.as_str(), addr.1))?
        .disable_signals()
        .run();
    let handle = server.handle();

    info!("HTTP listener on {}:{}", addr.0, addr.1);
    tokio::spawn(server);
    Ok(Some(handle))
}
