use actix_web::{HttpRequest, HttpResponse, post, web};
use futures::future::join_all;
use tracing::{debug, info};

use crate::listener::{ListenerError, ListenerState};
use crate::monitoring::validation::valid_checks;
use crate::monitoring::{Check, CheckResult, Input};

macros_utils::routes! {
    route check_route,
}

/// Run checks on behalf of a peer node.
///
/// Checks run with `local = false`, so they are tagged with our node name and
/// never forwarded again. The reply keeps the order of the request.
#[post("/check")]
pub async fn check_route(
    req: HttpRequest,
    state: web::Data<ListenerState>,
    body: web::Json<Input>,
) -> Result<HttpResponse, ListenerError> {
    state.authorize(&req)?;

    let checks = valid_checks(body.into_inner());
    info!("Running {} checks for {}", checks.len(), peer_addr(&req));

    let results: Vec<CheckResult> = join_all(checks.iter().map(|check| state.run(check))).await;
    Ok(HttpResponse::Ok().json(results))
}

fn peer_addr(req: &HttpRequest) -> String {
    req.peer_addr().map(|addr| addr.to_string()).unwrap_or_else(|| "unknown peer".into())
}

impl ListenerState {
    async fn run(&self, check: &Check) -> CheckResult {
        if let Check::Snmp(_) = check {
            debug!("Refusing SNMP check {} from a peer", check.uuid());
            return CheckResult::new(check, Some(self.node_name.clone()))
                .failure("SNMP checks are not accepted from peer nodes".into(), Default::default());
        }
        self.executor.execute_check(check, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::monitoring::MonitoringExecutor;
    use crate::monitoring::executor::tests::{ScriptedChecker, ok};
    use actix_web::http::StatusCode;
    use actix_web::{App, test};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn state(checker: Arc<ScriptedChecker>, credentials: Option<(&str, &str)>) -> web::Data<ListenerState> {
        let config = Config { node_name: "berlin".into(), ..Config::default() };
        web::Data::new(ListenerState {
            executor: Arc::new(MonitoringExecutor::new(&config, checker, None)),
            node_name: config.node_name.clone(),
            credentials: credentials.map(|(u, p)| (u.to_string(), p.to_string())),
        })
    }

    fn input() -> Value {
        json!({
            "serviceChecks": [
                {"checkUuid": "a", "data": {"connect": "192.0.2.1", "protocol": "tcp", "port": 22}}
            ]
        })
    }

    fn basic(user: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
    }

    #[actix_web::test]
    async fn test_runs_checks_tagged_with_node_name() {
        let checker = Arc::new(ScriptedChecker::new(vec![Ok(ok())]));
        let app = test::init_service(App::new().app_data(state(checker.clone(), None)).configure(routes)).await;

        let request = test::TestRequest::post().uri("/check").set_json(input()).to_request();
        let results: Vec<Value> = test::call_and_read_body_json(&app, request).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["checkUuid"], "a");
        assert_eq!(results[0]["node"], "berlin");
        assert_eq!(results[0]["measurements"]["net.tcp.22.success"], 1);
        assert_eq!(checker.runs.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn test_rejects_missing_or_wrong_credentials() {
        let checker = Arc::new(ScriptedChecker::new(vec![Ok(ok())]));
        let app = test::init_service(
            App::new().app_data(state(checker.clone(), Some(("peer", "secret")))).configure(routes),
        )
        .await;

        let anonymous = test::TestRequest::post().uri("/check").set_json(input()).to_request();
        assert_eq!(test::call_service(&app, anonymous).await.status(), StatusCode::UNAUTHORIZED);

        let wrong = test::TestRequest::post()
            .uri("/check")
            .insert_header(("Authorization", basic("peer", "guess")))
            .set_json(input())
            .to_request();
        assert_eq!(test::call_service(&app, wrong).await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(checker.runs.load(Ordering::SeqCst), 0);

        let right = test::TestRequest::post()
            .uri("/check")
            .insert_header(("Authorization", basic("peer", "secret")))
            .set_json(input())
            .to_request();
        assert_eq!(test::call_service(&app, right).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_snmp_is_refused_per_check() {
        let checker = Arc::new(ScriptedChecker::new(vec![Ok(ok())]));
        let app = test::init_service(App::new().app_data(state(checker.clone(), None)).configure(routes)).await;

        let body = json!({
            "serviceChecks": [
                {"checkUuid": "a", "data": {"connect": "192.0.2.1", "protocol": "tcp", "port": 22}}
            ],
            "snmpChecks": [
                {"checkUuid": "s", "data": {"connect": "192.0.2.2", "protocol": "snmp", "community": "public", "preset": "bandwidth"}}
            ]
        });
        let request = test::TestRequest::post().uri("/check").set_json(body).to_request();
        let results: Vec<Value> = test::call_and_read_body_json(&app, request).await;

        assert_eq!(results.len(), 2);
        let snmp = results.iter().find(|r| r["checkUuid"] == "s").unwrap();
        assert_eq!(snmp["message"], "SNMP checks are not accepted from peer nodes");
        assert_eq!(checker.runs.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn test_checks_without_uuid_are_dropped() {
        let checker = Arc::new(ScriptedChecker::new(vec![]));
        let app = test::init_service(App::new().app_data(state(checker, None)).configure(routes)).await;

        let body = json!({"webChecks": [{"checkUuid": "", "data": {"url": "http://example.com", "method": "GET"}}]});
        let request = test::TestRequest::post().uri("/check").set_json(body).to_request();
        let results: Vec<Value> = test::call_and_read_body_json(&app, request).await;
        assert!(results.is_empty());
    }
}
