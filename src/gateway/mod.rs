//! Gateway HTTP surface: `spec.md` §6 / `SPEC_FULL.md` §4.14. Grounded on
//! the teacher's `gateway/mod.rs` (axum router shape, `apply_template`,
//! constant-time webhook/bearer auth), narrowed to the endpoint list this
//! crate actually needs — no HMAC-signed generic webhooks or synchronous
//! `/api/chat`, since inbound traffic here always flows through a channel
//! adapter's own session, not a one-shot request/response pair.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::bus::InboundMessage;
use crate::channels::{session_id, ChannelManager};
use crate::config::Config;
use crate::cron::{CronJob, CronStore};
use crate::queue::QueueStore;
use crate::trust::PairingStore;

const WEBHOOK_CHANNELS: &[&str] = &["whatsapp", "googlechat", "irc", "signal", "imessage"];
const LOG_BROADCAST_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct GatewayState {
    config: Arc<Config>,
    channels: Arc<ChannelManager>,
    cron: Arc<CronStore>,
    pairing: Arc<PairingStore>,
    queue: Arc<QueueStore>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    log_tx: broadcast::Sender<String>,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, channels: Arc<ChannelManager>, cron: Arc<CronStore>, pairing: Arc<PairingStore>, queue: Arc<QueueStore>, inbound_tx: mpsc::Sender<InboundMessage>) -> Self {
        let (log_tx, _) = broadcast::channel(LOG_BROADCAST_CAPACITY);
        GatewayState { config, channels, cron, pairing, queue, inbound_tx, log_tx, started_at: Instant::now() }
    }

    /// Handed to a `tracing_subscriber::Layer` so formatted log lines reach
    /// `/ws/logs` subscribers without the gateway depending on how logging
    /// is wired up.
    pub fn log_sender(&self) -> broadcast::Sender<String> {
        self.log_tx.clone()
    }
}

fn bearer_token_ok(config: &Config, headers: &HeaderMap) -> bool {
    let Some(presented) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()).and_then(|v| v.strip_prefix("Bearer ")) else {
        return false;
    };
    let candidates = std::iter::once(config.gateway.token.as_str()).chain(config.security.rbac.viewer_tokens.iter().map(String::as_str));
    for candidate in candidates {
        if candidate.is_empty() {
            continue;
        }
        if candidate.as_bytes().ct_eq(presented.as_bytes()).into() {
            return true;
        }
    }
    false
}

/// Substitutes `{{key}}` with JSON payload values and `{{body}}` with the
/// raw body string; keys with no match are left untouched.
pub fn apply_template(template: &str, body_str: &str, json: Option<&serde_json::Value>) -> String {
    let mut result = template.replace("{{body}}", body_str);
    if let Some(serde_json::Value::Object(map)) = json {
        for (key, value) in map {
            let placeholder = format!("{{{{{key}}}}}");
            let replacement = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            result = result.replace(&placeholder, &replacement);
        }
    }
    result
}

fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/webhooks/{name}", post(webhook_handler))
        .route("/api/pairing/approve", post(pairing_approve_handler))
        .route("/api/pairing/reject", post(pairing_reject_handler))
        .route("/api/cron", get(cron_list_handler).post(cron_add_handler))
        .route("/ws/logs", get(ws_logs_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "version": crate::VERSION}))
}

#[derive(Serialize)]
struct InstanceStatus {
    instance_key: String,
    channel: String,
    running: bool,
    detail: String,
}

async fn status_handler(State(state): State<GatewayState>, headers: HeaderMap) -> impl IntoResponse {
    if !bearer_token_ok(&state.config, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let instances: Vec<InstanceStatus> = state
        .channels
        .describe_instances()
        .await
        .into_iter()
        .map(|(instance_key, channel, running, health)| InstanceStatus { instance_key, channel, running, detail: health.detail })
        .collect();
    Json(serde_json::json!({
        "instances": instances,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

async fn metrics_handler(State(state): State<GatewayState>, headers: HeaderMap) -> impl IntoResponse {
    if !bearer_token_ok(&state.config, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let channel_names: std::collections::HashSet<String> = state.channels.describe_instances().await.into_iter().map(|(_, channel, _, _)| channel).collect();
    let mut per_channel = serde_json::Map::new();
    for name in channel_names {
        let (metrics, circuit) = state.channels.outbound_metrics(&name).await;
        per_channel.insert(name, serde_json::json!({"metrics": metrics, "circuit_state": format!("{circuit:?}")}));
    }

    let queue_counts = match state.queue.list_tasks(1000) {
        Ok(tasks) => serde_json::json!({"total": tasks.len()}),
        Err(err) => serde_json::json!({"error": err.to_string()}),
    };
    let cron_counts = match state.cron.list_jobs() {
        Ok(jobs) => serde_json::json!({"total": jobs.len(), "enabled": jobs.iter().filter(|j| j.enabled).count()}),
        Err(err) => serde_json::json!({"error": err.to_string()}),
    };

    Json(serde_json::json!({"channels": per_channel, "queue": queue_counts, "cron": cron_counts})).into_response()
}

fn session_id_for(channel: &str, chat_id: &str, is_dm: bool) -> String {
    match channel {
        "whatsapp" => session_id::whatsapp(chat_id),
        "googlechat" => session_id::googlechat("spaces", chat_id),
        "irc" => session_id::irc(is_dm, chat_id),
        "signal" => session_id::signal(is_dm, chat_id),
        "imessage" => session_id::imessage(is_dm, chat_id),
        other => format!("{other}_{}", crate::utils::safe_slug(chat_id)),
    }
}

async fn webhook_handler(State(state): State<GatewayState>, Path(name): Path<String>, Json(payload): Json<serde_json::Value>) -> impl IntoResponse {
    if !WEBHOOK_CHANNELS.contains(&name.as_str()) {
        debug!(channel = %name, "webhook: unknown channel");
        return StatusCode::NOT_FOUND.into_response();
    }

    let envelope = match state.channels.process_webhook(&name, payload).await {
        Ok(Some(envelope)) => envelope,
        Ok(None) => {
            return Json(serde_json::json!({"status": "ignored"})).into_response();
        }
        Err(err) => {
            warn!(channel = %name, error = %err, "webhook: adapter rejected payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let sid = session_id_for(&name, &envelope.chat_id, envelope.is_dm);
    state.channels.bind_session(&name, &sid).await;

    let inbound = InboundMessage {
        session_id: sid,
        channel: name.clone(),
        sender_id: envelope.sender,
        text: envelope.text,
        thread_id: envelope.thread_id,
        is_dm: envelope.is_dm,
        metadata: serde_json::json!({"chat_id": envelope.chat_id}),
    };
    if let Err(err) = state.inbound_tx.send(inbound).await {
        warn!(channel = %name, error = %err, "webhook: agent bus unavailable");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    Json(serde_json::json!({"status": "ok"})).into_response()
}

#[derive(Deserialize)]
struct PairingDecisionRequest {
    channel: String,
    code: String,
    #[serde(default)]
    client_key: String,
}

async fn pairing_approve_handler(State(state): State<GatewayState>, headers: HeaderMap, Json(body): Json<PairingDecisionRequest>) -> impl IntoResponse {
    if !bearer_token_ok(&state.config, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.pairing.approve(&body.channel, &body.code, &body.client_key) {
        Ok(Some(req)) => {
            info!(channel = %body.channel, peer = %req.peer_id, "pairing approved");
            Json(serde_json::json!({"status": "approved", "peer_id": req.peer_id})).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": err.to_string()}))).into_response(),
    }
}

async fn pairing_reject_handler(State(state): State<GatewayState>, headers: HeaderMap, Json(body): Json<PairingDecisionRequest>) -> impl IntoResponse {
    if !bearer_token_ok(&state.config, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.pairing.reject(&body.channel, &body.code) {
        Ok(true) => Json(serde_json::json!({"status": "rejected"})).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": err.to_string()}))).into_response(),
    }
}

async fn cron_list_handler(State(state): State<GatewayState>, headers: HeaderMap) -> impl IntoResponse {
    if !bearer_token_ok(&state.config, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.cron.list_jobs() {
        Ok(jobs) => Json(jobs_as_json(&jobs)).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({"error": err.to_string()}))).into_response(),
    }
}

fn jobs_as_json(jobs: &[CronJob]) -> serde_json::Value {
    serde_json::json!(jobs
        .iter()
        .map(|j| serde_json::json!({
            "id": j.id, "channel": j.channel, "chat_id": j.chat_id, "thread_id": j.thread_id,
            "label": j.label, "name": j.name, "interval_seconds": j.interval_seconds,
            "enabled": j.enabled, "next_run_at": j.next_run_at, "last_result": j.last_result,
        }))
        .collect::<Vec<_>>())
}

#[derive(Deserialize)]
struct CronAddRequest {
    channel: String,
    chat_id: String,
    #[serde(default)]
    thread_id: String,
    label: String,
    name: String,
    text: String,
    interval_seconds: i64,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn cron_add_handler(State(state): State<GatewayState>, headers: HeaderMap, Json(body): Json<CronAddRequest>) -> impl IntoResponse {
    if !bearer_token_ok(&state.config, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.cron.add_job(&body.channel, &body.chat_id, &body.thread_id, &body.label, &body.name, &body.text, body.interval_seconds, body.enabled) {
        Ok(id) => Json(serde_json::json!({"id": id})).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": err.to_string()}))).into_response(),
    }
}

async fn ws_logs_handler(State(state): State<GatewayState>, headers: HeaderMap, ws: WebSocketUpgrade) -> impl IntoResponse {
    if !bearer_token_ok(&state.config, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let rx = state.log_tx.subscribe();
    ws.on_upgrade(move |socket| ws_logs_stream(socket, rx)).into_response()
}

async fn ws_logs_stream(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    loop {
        tokio::select! {
            line = rx.recv() => {
                match line {
                    Ok(line) => {
                        if socket.send(WsMessage::Text(line.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                // Only used to detect client disconnects; this channel is read-only.
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}

/// Starts the HTTP server as a background task, returning its handle and
/// the shared state (the caller wires `state.log_sender()` into the
/// tracing subscriber before or after this call).
pub async fn start(host: &str, port: u16, state: GatewayState) -> anyhow::Result<(tokio::task::JoinHandle<()>, GatewayState)> {
    let app = build_router(state.clone());
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway HTTP server listening");

    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "gateway HTTP server error");
        }
    });
    Ok((handle, state))
}

/// A `tracing_subscriber::Layer` that fans formatted event lines out to
/// `/ws/logs` subscribers, reusing the crate's own `fmt` line format rather
/// than inventing a second log representation.
pub struct BroadcastLogLayer {
    sender: broadcast::Sender<String>,
}

impl BroadcastLogLayer {
    pub fn new(sender: broadcast::Sender<String>) -> Self {
        BroadcastLogLayer { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format!("{} {} {}", event.metadata().level(), event.metadata().target(), visitor.message);
        let _ = self.sender.send(line);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{GatewayConfig, RbacConfig, SecurityConfig};

    fn test_config(token: &str, viewer_tokens: Vec<String>) -> Config {
        Config { gateway: GatewayConfig { token: token.to_string(), ..GatewayConfig::default() }, security: SecurityConfig { rbac: RbacConfig { viewer_tokens }, ..SecurityConfig::default() }, ..Config::default() }
    }

    fn make_state(config: Config) -> GatewayState {
        let dir = tempfile::tempdir().unwrap();
        let channels = Arc::new(ChannelManager::new());
        let cron = Arc::new(CronStore::new(dir.path()).unwrap());
        let pairing = Arc::new(PairingStore::new(dir.path().join("pairing.json")));
        let queue = Arc::new(QueueStore::new(dir.path()).unwrap());
        let (inbound_tx, _rx) = mpsc::channel(16);
        GatewayState::new(Arc::new(config), channels, cron, pairing, queue, inbound_tx)
    }

    #[test]
    fn bearer_accepts_gateway_token_or_viewer_token() {
        let config = test_config("gw-secret", vec!["viewer-1".to_string()]);
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer gw-secret".parse().unwrap());
        assert!(bearer_token_ok(&config, &headers));

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer viewer-1".parse().unwrap());
        assert!(bearer_token_ok(&config, &headers));

        headers.insert(axum::http::header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(!bearer_token_ok(&config, &headers));
    }

    #[test]
    fn bearer_rejects_missing_header() {
        let config = test_config("gw-secret", vec![]);
        assert!(!bearer_token_ok(&config, &HeaderMap::new()));
    }

    #[test]
    fn apply_template_substitutes_json_keys_and_body() {
        let json = serde_json::json!({"action": "push", "repo": "clawlite"});
        let out = apply_template("{{action}} -> {{repo}}: {{body}}", "raw", Some(&json));
        assert_eq!(out, "push -> clawlite: raw");
    }

    #[test]
    fn apply_template_leaves_unmatched_keys() {
        let json = serde_json::json!({"name": "test"});
        assert_eq!(apply_template("{{name}} {{missing}}", "", Some(&json)), "test {{missing}}");
    }

    #[tokio::test]
    async fn health_endpoint_has_no_auth() {
        use axum::http::Request;
        use tower::ServiceExt;

        let state = make_state(test_config("secret", vec![]));
        let app = build_router(state);
        let req = Request::builder().method("GET").uri("/health").body(axum::body::Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_requires_bearer_token() {
        use axum::http::Request;
        use tower::ServiceExt;

        let state = make_state(test_config("secret", vec![]));
        let app = build_router(state);
        let req = Request::builder().method("GET").uri("/api/status").body(axum::body::Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_webhook_channel_returns_404() {
        use axum::http::Request;
        use tower::ServiceExt;

        let state = make_state(test_config("secret", vec![]));
        let app = build_router(state);
        let req = Request::builder()
            .method("POST")
            .uri("/api/webhooks/telegram")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{}"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
