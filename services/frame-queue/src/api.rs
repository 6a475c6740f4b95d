use crate::active_tables::{ActiveTables, ActiveTablesDoc};
use crate::auth::{require_agent_key, AgentAuth};
use crate::clock::EpochMillis;
use crate::config::ApiConfig;
use crate::persist::StateError;
use crate::queue::{ClaimRequest, FrameQueue, MAX_ACK_IDS, MAX_PUSH_ITEMS};
use crate::refresh_command::{CommandStatus, RefreshCommands, StatusPatch};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<FrameQueue>,
    pub active_tables: Arc<ActiveTables>,
    pub refresh: Arc<RefreshCommands>,
}

/// Errors surfaced to HTTP callers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing or invalid agent key")]
    Unauthorized,

    #[error("Request must include a non-empty items array")]
    ItemsRequired,

    #[error("At most {max} items may be pushed per request")]
    TooManyItems { max: usize },

    #[error("Request must include a non-empty ids array")]
    IdsRequired,

    #[error("At most {max} ids may be acknowledged per request")]
    TooManyIds { max: usize },

    #[error("Command ack needs an id and one of started, completed, failed, skipped")]
    InvalidCommandPayload,

    #[error("Refresh command not found")]
    CommandNotFound,

    #[error("Malformed request body: {0}")]
    InvalidBody(String),

    #[error("Failed to persist state: {0}")]
    State(#[from] StateError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::CommandNotFound => StatusCode::NOT_FOUND,
            ApiError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::ItemsRequired => "items_required",
            ApiError::TooManyItems { .. } => "too_many_items",
            ApiError::IdsRequired => "ids_required",
            ApiError::TooManyIds { .. } => "too_many_ids",
            ApiError::InvalidCommandPayload => "invalid_command_payload",
            ApiError::CommandNotFound => "command_not_found",
            ApiError::InvalidBody(_) => "invalid_body",
            ApiError::State(_) => "state_write_failed",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidBody(rejection.body_text())
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::State(e) = &self {
            error!(error = %e, "State persistence failed");
        }
        let body = ErrorResponse {
            ok: false,
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Success wrapper adding `ok` and `ts` to an operation result
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub ok: bool,
    pub ts: EpochMillis,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    fn new(ts: EpochMillis, body: T) -> Self {
        Self { ok: true, ts, body }
    }
}

/// Push request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub recent_ttl_ms: Option<u64>,
}

/// Claim request body; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaimBody {
    #[serde(deserialize_with = "lenient_u64")]
    pub limit: Option<u64>,
    pub consumer: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    pub claim_ms: Option<u64>,
}

/// Ack request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRequest {
    #[serde(default)]
    pub ids: Vec<String>,
    pub consumer: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefreshRequestBody {
    pub requested_by: Option<String>,
}

/// Agent status report for the refresh command
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandAckRequest {
    pub id: Option<String>,
    pub status: Option<String>,
    pub agent_id: Option<String>,
    pub note: Option<String>,
    pub error: Option<String>,
    pub last_run_id: Option<String>,
    pub online_count: Option<Value>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let agent_gate =
        middleware::from_fn_with_state(AgentAuth::new(config.agent_key.clone()), require_agent_key);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/v1/active",
            get(get_active_tables).merge(post(set_active_tables).route_layer(agent_gate.clone())),
        )
        .route(
            "/api/v1/refresh-request",
            get(request_refresh).post(request_refresh),
        )
        .route("/api/v1/refresh-status", get(refresh_status))
        .route(
            "/api/v1/refresh-command",
            get(get_refresh_command).route_layer(agent_gate.clone()),
        )
        .route(
            "/api/v1/refresh-command/ack",
            post(ack_refresh_command).route_layer(agent_gate.clone()),
        )
        .route(
            "/api/v1/raw-frame/stats",
            get(raw_frame_stats).route_layer(agent_gate.clone()),
        )
        .route(
            "/api/v1/raw-frame/push",
            post(push_frames).route_layer(agent_gate.clone()),
        )
        .route(
            "/api/v1/raw-frame/claim",
            post(claim_frames).route_layer(agent_gate.clone()),
        )
        .route(
            "/api/v1/raw-frame/ack",
            post(ack_frames).route_layer(agent_gate),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn peer_ip(connect: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    connect.map(|ConnectInfo(addr)| addr.ip().to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse a body whose fields are all optional. A missing, blank or `null`
/// body means "use the defaults"; anything else must deserialize.
fn optional_body<T: DeserializeOwned + Default>(bytes: &Bytes) -> Result<T, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Null) => Ok(T::default()),
        Ok(value) => {
            serde_json::from_value(value).map_err(|e| ApiError::InvalidBody(e.to_string()))
        }
        Err(e) => Err(ApiError::InvalidBody(e.to_string())),
    }
}

/// Read a count or duration the way agents send it: an integer, a float
/// (truncated) or a numeric string.
fn loose_number(value: &Value) -> Option<i64> {
    let truncate = |f: f64| f.is_finite().then(|| f.trunc() as i64);
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(truncate))
        }
        _ => None,
    }
}

/// Non-numeric and negative values read as unset so the queue default applies.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(loose_number)
        .and_then(|n| u64::try_from(n).ok()))
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let tables = state.active_tables.snapshot();
    let queue = state.queue.stats();

    Json(json!({
        "ok": true,
        "ts": state.queue.now_ms(),
        "tablesOnline": tables.urls.len(),
        "lastSyncTs": tables.meta.ts,
        "lastError": tables.meta.reported_error(),
        "rawFrameQueue": {
            "queueCount": queue.queue_count,
            "claimedCount": queue.claimed_count,
            "unclaimedCount": queue.unclaimed_count,
            "lastPushAt": queue.stats.last_push_at,
            "lastClaimAt": queue.stats.last_claim_at,
            "lastAckAt": queue.stats.last_ack_at,
        }
    }))
}

async fn get_active_tables(State(state): State<AppState>) -> Json<ActiveTablesDoc> {
    Json(state.active_tables.snapshot())
}

/// Replace the active table list from an agent post
#[instrument(skip(state, body))]
async fn set_active_tables(
    State(state): State<AppState>,
    body: Option<Json<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let payload = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let doc = state.active_tables.set_from_incoming(&payload)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "ok": true,
            "acceptedAt": state.queue.now_ms(),
            "count": doc.urls.len(),
            "statePath": state.active_tables.path().display().to_string(),
        })),
    ))
}

/// Ask the agent to refresh its table list, reusing a pending request
#[instrument(skip(state, connect, body))]
async fn request_refresh(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: RefreshRequestBody = optional_body(&body)?;
    let requested_by = non_blank(body.requested_by)
        .or_else(|| peer_ip(connect))
        .unwrap_or_else(|| "frontend".to_string());

    let (command, reused) = state.refresh.pending_or_create(&requested_by)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "ok": true,
            "reused": reused,
            "command": command,
        })),
    ))
}

async fn refresh_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.refresh.snapshot();
    Json(json!({
        "ok": true,
        "command": snapshot.command,
        "updatedAt": snapshot.updated_at,
    }))
}

async fn get_refresh_command(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "command": state.refresh.pending(),
        "current": state.refresh.current(),
    }))
}

/// Record an agent status report for the refresh command
#[instrument(skip(state, connect, body))]
async fn ack_refresh_command(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<CommandAckRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;

    let id = request
        .id
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let status = request
        .status
        .as_deref()
        .and_then(|s| s.parse::<CommandStatus>().ok());
    let Some(status) = status.filter(|_| !id.is_empty()) else {
        return Err(ApiError::InvalidCommandPayload);
    };

    let patch = StatusPatch {
        agent_id: non_blank(request.agent_id)
            .or_else(|| peer_ip(connect))
            .or_else(|| Some("agent".to_string())),
        note: request.note,
        error: request.error,
        last_run_id: request.last_run_id,
        online_count: request.online_count.as_ref().and_then(loose_number),
    };

    let command = state
        .refresh
        .update_status(&id, status, patch)?
        .ok_or(ApiError::CommandNotFound)?;

    Ok(Json(json!({
        "ok": true,
        "command": command,
    })))
}

async fn raw_frame_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.queue.stats();
    Json(Envelope::new(state.queue.now_ms(), stats))
}

/// Admit a batch of raw frames
#[instrument(skip(state, body))]
async fn push_frames(
    State(state): State<AppState>,
    body: Result<Json<PushRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;

    if request.items.is_empty() {
        return Err(ApiError::ItemsRequired);
    }
    if request.items.len() > MAX_PUSH_ITEMS {
        return Err(ApiError::TooManyItems {
            max: MAX_PUSH_ITEMS,
        });
    }

    let outcome = state.queue.push(&request.items, request.recent_ttl_ms);

    Ok((
        StatusCode::ACCEPTED,
        Json(Envelope::new(state.queue.now_ms(), outcome)),
    ))
}

/// Lease frames to a consumer
#[instrument(skip(state, connect, body))]
async fn claim_frames(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: ClaimBody = optional_body(&body)?;

    let outcome = state.queue.claim(ClaimRequest {
        limit: body.limit,
        consumer: non_blank(body.consumer).or_else(|| peer_ip(connect)),
        claim_ms: body.claim_ms,
    });

    Ok(Json(Envelope::new(state.queue.now_ms(), outcome)))
}

/// Acknowledge processed frames
#[instrument(skip(state, connect, body))]
async fn ack_frames(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<AckRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;

    if request.ids.is_empty() {
        return Err(ApiError::IdsRequired);
    }
    if request.ids.len() > MAX_ACK_IDS {
        return Err(ApiError::TooManyIds { max: MAX_ACK_IDS });
    }

    let consumer = non_blank(request.consumer).or_else(|| peer_ip(connect));
    let summary = state.queue.ack(&request.ids, consumer.as_deref());

    Ok(Json(Envelope::new(state.queue.now_ms(), summary)))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting frame queue API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::queue::QueueSettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const KEY: &str = "agent-secret";

    struct Harness {
        router: Router,
        _dir: TempDir,
    }

    fn harness(agent_key: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_700_000_000_000));
        let state = AppState {
            queue: Arc::new(FrameQueue::with_clock(QueueSettings::default(), clock.clone())),
            active_tables: Arc::new(
                ActiveTables::load(dir.path().join("active_tables.json"), clock.clone()).unwrap(),
            ),
            refresh: Arc::new(
                RefreshCommands::load(dir.path().join("refresh_command.json"), clock).unwrap(),
            ),
        };
        let config = ApiConfig {
            agent_key: agent_key.map(str::to_string),
            ..ApiConfig::default()
        };
        Harness {
            router: create_router(state, &config),
            _dir: dir,
        }
    }

    impl Harness {
        async fn get(&self, uri: &str, key: Option<&str>) -> (StatusCode, Value) {
            self.send("GET", uri, key, None).await
        }

        async fn post(&self, uri: &str, key: Option<&str>, body: Value) -> (StatusCode, Value) {
            self.send("POST", uri, key, Some(body)).await
        }

        async fn send(
            &self,
            method: &str,
            uri: &str,
            key: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(key) = key {
                builder = builder.header("x-agent-key", key);
            }
            let request = match body {
                Some(body) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }
    }

    fn frame_item() -> Value {
        json!({
            "url": "https://tables.example/t/1",
            "frame": {"data": {"idTable": "T1", "idDeck": 3, "idRound": 7, "logs": [{"m": "x"}]}}
        })
    }

    #[tokio::test]
    async fn test_agent_routes_require_key() {
        let h = harness(Some(KEY));

        let (status, body) = h
            .post("/api/v1/raw-frame/push", None, json!({"items": [frame_item()]}))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = h.get("/api/v1/raw-frame/stats", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = h.get("/api/v1/raw-frame/stats", Some(KEY)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = h.get("/api/v1/active", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = h.post("/api/v1/active", None, json!({"urls": []})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_open_gate_without_configured_key() {
        let h = harness(None);
        let (status, body) = h.get("/api/v1/raw-frame/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queueCount"], 0);
    }

    #[tokio::test]
    async fn test_push_claim_ack_over_http() {
        let h = harness(Some(KEY));

        let (status, pushed) = h
            .post("/api/v1/raw-frame/push", Some(KEY), json!({"items": [frame_item()]}))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(pushed["ok"], true);
        assert_eq!(pushed["acceptedCount"], 1);
        assert_eq!(pushed["accepted"][0]["frameKey"], "T1|3|7|1|x||");
        let id = pushed["accepted"][0]["id"].as_str().unwrap().to_string();

        let (_, again) = h
            .post("/api/v1/raw-frame/push", Some(KEY), json!({"items": [frame_item()]}))
            .await;
        assert_eq!(again["acceptedCount"], 0);
        assert_eq!(again["dedupedCount"], 1);

        let (status, claimed) = h
            .post(
                "/api/v1/raw-frame/claim",
                Some(KEY),
                json!({"limit": 10, "consumer": "c1", "claimMs": 60000}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(claimed["count"], 1);
        assert_eq!(claimed["claimMs"], 60000);
        assert_eq!(claimed["items"][0]["claim"]["consumer"], "c1");
        assert_eq!(claimed["items"][0]["payload"]["tableUrl"], "https://tables.example/t/1");

        let (_, denied) = h
            .post("/api/v1/raw-frame/ack", Some(KEY), json!({"ids": [id], "consumer": "c2"}))
            .await;
        assert_eq!(denied["denied"], 1);

        let (_, acked) = h
            .post("/api/v1/raw-frame/ack", Some(KEY), json!({"ids": [id], "consumer": "c1"}))
            .await;
        assert_eq!(acked["acked"], 1);
        assert_eq!(acked["requested"], 1);

        let (_, stats) = h.get("/api/v1/raw-frame/stats", Some(KEY)).await;
        assert_eq!(stats["queueCount"], 0);
        assert_eq!(stats["stats"]["accepted"], 1);
        assert_eq!(stats["stats"]["acked"], 1);

        let (_, health) = h.get("/health", None).await;
        assert_eq!(health["rawFrameQueue"]["queueCount"], 0);
        assert!(health["rawFrameQueue"]["lastAckAt"].is_u64());
    }

    #[tokio::test]
    async fn test_claim_without_body_uses_defaults() {
        let h = harness(None);
        h.post("/api/v1/raw-frame/push", None, json!({"items": [frame_item()]})).await;

        let (status, claimed) = h.send("POST", "/api/v1/raw-frame/claim", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(claimed["consumer"], "be");
        assert_eq!(claimed["claimMs"], 60000);
        assert_eq!(claimed["count"], 1);
    }

    #[tokio::test]
    async fn test_claim_accepts_loose_numbers() {
        let h = harness(None);
        let (_, pushed) = h
            .post("/api/v1/raw-frame/push", None, json!({"items": [frame_item()]}))
            .await;
        let id = pushed["accepted"][0]["id"].as_str().unwrap().to_string();

        let (status, claimed) = h
            .post(
                "/api/v1/raw-frame/claim",
                None,
                json!({"consumer": "c1", "limit": "10", "claimMs": 60000.0}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(claimed["consumer"], "c1");
        assert_eq!(claimed["claimMs"], 60000);
        assert_eq!(claimed["items"][0]["claim"]["consumer"], "c1");

        let (_, acked) = h
            .post("/api/v1/raw-frame/ack", None, json!({"ids": [id], "consumer": "c1"}))
            .await;
        assert_eq!(acked["acked"], 1);
        assert_eq!(acked["denied"], 0);
    }

    #[tokio::test]
    async fn test_malformed_claim_body_is_rejected() {
        let h = harness(None);
        h.post("/api/v1/raw-frame/push", None, json!({"items": [frame_item()]})).await;

        let (status, body) = h
            .post("/api/v1/raw-frame/claim", None, json!({"consumer": ["c1"]}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_body");

        let (status, body) = h.post("/api/v1/raw-frame/claim", None, json!("c1")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_body");

        let (_, stats) = h.get("/api/v1/raw-frame/stats", None).await;
        assert_eq!(stats["claimedCount"], 0);
    }

    #[tokio::test]
    async fn test_push_and_ack_validation() {
        let h = harness(None);

        let (status, body) = h.post("/api/v1/raw-frame/push", None, json!({"items": []})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "items_required");

        let items: Vec<Value> = (0..=MAX_PUSH_ITEMS).map(|_| frame_item()).collect();
        let (status, body) = h.post("/api/v1/raw-frame/push", None, json!({"items": items})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "too_many_items");

        let (status, body) = h.post("/api/v1/raw-frame/push", None, json!({"items": "x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_body");

        let (status, body) = h.post("/api/v1/raw-frame/ack", None, json!({"ids": []})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ids_required");

        let (_, body) = h
            .post("/api/v1/raw-frame/push", None, json!({"items": [{"idTable": "T1"}]}))
            .await;
        assert_eq!(body["rejectedCount"], 1);
        assert_eq!(body["rejected"][0]["reason"], "invalid_frame");
    }

    #[tokio::test]
    async fn test_active_tables_round_trip() {
        let h = harness(Some(KEY));

        let (status, body) = h
            .post(
                "/api/v1/active",
                Some(KEY),
                json!({
                    "urls": ["https://t/1", " https://t/2 ", "https://t/1"],
                    "meta": {"lastMs": 900}
                }),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["count"], 2);

        let (_, active) = h.get("/api/v1/active", None).await;
        assert_eq!(active["urls"], json!(["https://t/1", "https://t/2"]));
        assert_eq!(active["meta"]["lastMs"], 900);
        assert_eq!(active["meta"]["source"], "remote_agent");

        let (_, health) = h.get("/health", None).await;
        assert_eq!(health["tablesOnline"], 2);
        assert!(health["lastError"].is_null());

        h.post(
            "/api/v1/active",
            Some(KEY),
            json!({
                "urls": ["https://t/1"],
                "meta": {"lastError": "timeout", "lastMs": 1234.5, "lastErrorCode": 503}
            }),
        )
        .await;

        let (_, active) = h.get("/api/v1/active", None).await;
        assert_eq!(active["meta"]["lastError"], "timeout");
        assert_eq!(active["meta"]["lastMs"], 1234.5);
        assert_eq!(active["meta"]["lastErrorCode"], 503);

        let (_, health) = h.get("/health", None).await;
        assert_eq!(health["lastError"], "timeout");
    }

    #[tokio::test]
    async fn test_refresh_command_flow() {
        let h = harness(Some(KEY));

        let (status, first) = h
            .post("/api/v1/refresh-request", None, json!({"requestedBy": "dash"}))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["reused"], false);
        assert_eq!(first["command"]["requestedBy"], "dash");
        let id = first["command"]["id"].as_str().unwrap().to_string();

        let (_, again) = h.get("/api/v1/refresh-request", None).await;
        assert_eq!(again["reused"], true);
        assert_eq!(again["command"]["id"], id.as_str());

        let (_, polled) = h.get("/api/v1/refresh-command", Some(KEY)).await;
        assert_eq!(polled["command"]["id"], id.as_str());

        let (status, body) = h
            .post("/api/v1/refresh-command/ack", Some(KEY), json!({"id": id, "status": "done"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_command_payload");

        let (status, body) = h
            .post(
                "/api/v1/refresh-command/ack",
                Some(KEY),
                json!({"id": "cmd-nope", "status": "started"}),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "command_not_found");

        let (status, body) = h
            .post(
                "/api/v1/refresh-command/ack",
                Some(KEY),
                json!({"id": id, "status": "Completed", "onlineCount": "14"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["command"]["status"], "completed");
        assert_eq!(body["command"]["agentId"], "agent");
        assert_eq!(body["command"]["onlineCount"], 14);

        let (_, status_body) = h.get("/api/v1/refresh-status", None).await;
        assert_eq!(status_body["command"]["status"], "completed");

        let (_, polled) = h.get("/api/v1/refresh-command", Some(KEY)).await;
        assert!(polled["command"].is_null());
        assert_eq!(polled["current"]["id"], id.as_str());
    }
}
