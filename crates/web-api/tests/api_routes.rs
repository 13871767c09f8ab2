use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use botfleet_core::FleetConfig;
use botfleet_orchestrator::{BotState, FleetController, SimulatedBot, SimulatedBroker, Topics};
use botfleet_web_api::ApiServer;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

struct Harness {
    broker: SimulatedBroker,
    topics: Topics,
    controller: Arc<FleetController>,
}

impl Harness {
    async fn new() -> Self {
        let broker = SimulatedBroker::new();
        let topics = Topics::default();
        let config = FleetConfig {
            ack_timeout_ms: 150,
            ..FleetConfig::default()
        };
        let controller = FleetController::with_transport(broker.transport(), topics.clone(), &config)
            .await
            .expect("simulated broker connects");
        Self {
            broker,
            topics,
            controller: Arc::new(controller),
        }
    }

    async fn with_bots(bots: &[(&str, BotState)]) -> (Self, Vec<SimulatedBot>) {
        let harness = Self::new().await;
        let handles: Vec<_> = bots
            .iter()
            .map(|(name, status)| {
                let bot = SimulatedBot::attach(&harness.broker, &harness.topics, name, *status);
                bot.heartbeat();
                bot
            })
            .collect();
        harness.broker.flush().await;
        harness.controller.tick().await;
        (harness, handles)
    }

    fn router(&self) -> Router {
        ApiServer::new(Arc::clone(&self.controller)).router()
    }
}

async fn get(router: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(router, request).await
}

async fn post(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(router, request).await
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_empty_fleet_is_not_found() {
    let harness = Harness::new().await;
    let (status, body) = get(harness.router(), "/get-active-bots-status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["detail"], "No active bots found");
}

#[tokio::test]
async fn test_active_bots_status_lists_fleet() {
    let (harness, _bots) =
        Harness::with_bots(&[("alpha", BotState::Running), ("beta", BotState::Stopped)]).await;

    let (status, body) = get(harness.router(), "/get-active-bots-status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["alpha"]["status"], "running");
    assert_eq!(body["data"]["beta"]["status"], "stopped");
}

#[tokio::test]
async fn test_bot_status_unknown_is_not_found() {
    let (harness, _bots) = Harness::with_bots(&[("alpha", BotState::Running)]).await;

    let (status, body) = get(harness.router(), "/get-bot-status/alpha").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "alpha");

    let (status, body) = get(harness.router(), "/get-bot-status/gamma").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].as_str().unwrap().contains("gamma"));
}

#[tokio::test]
async fn test_history_for_unknown_bot_is_empty() {
    let harness = Harness::new().await;
    let (status, body) = get(harness.router(), "/get-bot-history/ghost").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "success", "response": [] }));
}

#[tokio::test]
async fn test_history_limit_returns_newest_entries() {
    let (harness, _bots) = Harness::with_bots(&[("alpha", BotState::Running)]).await;
    let (status, _) = post(
        harness.router(),
        "/import-strategy",
        json!({ "bot_name": "alpha", "strategy": "grid" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, full) = get(harness.router(), "/get-bot-history/alpha").await;
    let full = full["response"].as_array().unwrap().clone();
    assert_eq!(full.len(), 3);

    let (_, recent) = get(harness.router(), "/get-bot-history/alpha?limit=2").await;
    let recent = recent["response"].as_array().unwrap();
    assert_eq!(recent.as_slice(), &full[1..]);
    assert_eq!(recent[1]["event"]["event_type"], "command_acked");
}

#[tokio::test]
async fn test_history_ignores_malformed_limit() {
    let (harness, _bots) = Harness::with_bots(&[("alpha", BotState::Running)]).await;

    for uri in ["/get-bot-history/alpha?limit=abc", "/get-bot-history/alpha?limit=-1"] {
        let (status, body) = get(harness.router(), uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body["response"].as_array().unwrap().len(), 1, "{uri}");
    }
}

#[tokio::test]
async fn test_stop_bot_returns_ack() {
    let (harness, bots) = Harness::with_bots(&[("alpha", BotState::Running)]).await;

    let (status, body) = post(
        harness.router(),
        "/stop-bot",
        json!({ "bot_name": "alpha", "skip_order_cancellation": true, "async_backend": false }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["response"]["outcome"], "acked");
    assert_eq!(body["response"]["kind"], "stop");
    assert_eq!(bots[0].status(), BotState::Stopped);

    let sent = &bots[0].received()[0];
    assert_eq!(
        serde_json::to_value(&sent.command).unwrap()["payload"]["skip_order_cancellation"],
        true
    );
}

#[tokio::test]
async fn test_start_bot_without_ack_reports_timeout() {
    let (harness, bots) = Harness::with_bots(&[("alpha", BotState::Stopped)]).await;
    bots[0].set_auto_ack(false);

    let (status, body) = post(
        harness.router(),
        "/start-bot",
        json!({
            "bot_name": "alpha",
            "log_level": "INFO",
            "script": "v2_with_controllers.py",
            "conf": "conf_v2.yml",
            "async_backend": true
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"]["outcome"], "timed_out");
}

#[tokio::test]
async fn test_command_to_unknown_bot_is_not_found() {
    let harness = Harness::new().await;
    let (status, _) = post(
        harness.router(),
        "/stop-bot",
        json!({ "bot_name": "ghost" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_broker_outage_is_service_unavailable() {
    let (harness, _bots) = Harness::with_bots(&[("alpha", BotState::Running)]).await;
    harness.broker.set_reachable(false);

    let (status, body) = post(
        harness.router(),
        "/import-strategy",
        json!({ "bot_name": "alpha", "strategy": "grid" }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["detail"].as_str().unwrap().starts_with("Broker unavailable"));

    // Cached status stays readable.
    let (status, _) = get(harness.router(), "/get-bot-status/alpha").await;
    assert_eq!(status, StatusCode::OK);
}
