use crate::config::Settings;
use crate::db;
use crate::dispatch::{WorkerHealth, WorkerTransport};
use crate::missions::{
    self, CrawlRecord, LaunchMissionInput, LaunchScoutInput, LaunchedMission, RunDetail, RunRecord,
};
use crate::realtime::{LogBus, LogProjection};
use crate::registry::{self, SavedTestRecord};
use crate::reports::{self, RiskItem};
use crate::schema::ProviderKind;
use crate::telemetry::{self, TelemetryPayload};
use crate::vault::{self, SaveVaultInput, VaultCipher, VaultStatus};
use crate::verifier;
use crate::webhook::{self, IdentityEvent, WebhookHeaders};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

const DEFAULT_RUNS_LIMIT: usize = 50;

/// Shared per-process context. The store itself is not shared: every
/// request opens its own connection from the configured path.
#[derive(Clone)]
pub struct AppState {
    pub db_path: PathBuf,
    pub settings: Settings,
    pub cipher: VaultCipher,
    pub bus: LogBus,
    pub transport: Arc<dyn WorkerTransport>,
}

impl AppState {
    pub fn open_connection(&self) -> Result<Connection, String> {
        db::open_connection(&self.db_path)
    }
}

/// Uniform result envelope for the action-style endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ActionResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            run_id: None,
        }
    }

    fn launched(launched: LaunchedMission) -> Self {
        Self {
            success: true,
            message: launched.message,
            run_id: Some(launched.run_id),
        }
    }

    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            run_id: None,
        }
    }
}

/// Authenticated caller, resolved from the header the out-of-scope session
/// layer sets. Absence short-circuits to a generic unauthorized result
/// before any store access; every query downstream filters by this id.
pub struct AuthedUser(pub String);

impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ActionResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-argus-user")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| AuthedUser(value.to_string()))
            .ok_or((
                StatusCode::UNAUTHORIZED,
                Json(ActionResponse::failure("Unauthorized")),
            ))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/missions", post(launch_mission_handler))
        .route("/api/missions/scout", post(launch_scout_handler))
        .route("/api/missions/replay", post(launch_replay_handler))
        .route("/api/runs", get(list_runs_handler))
        .route("/api/runs/scout/history", get(scout_history_handler))
        .route(
            "/api/runs/{id}",
            get(run_detail_handler).delete(delete_run_handler),
        )
        .route("/api/runs/{id}/logs/stream", get(stream_logs_handler))
        .route(
            "/api/vault",
            get(vault_status_handler).post(save_vault_handler),
        )
        .route("/api/vault/test", post(test_key_handler))
        .route(
            "/api/registry",
            get(list_registry_handler).post(promote_run_handler),
        )
        .route("/api/registry/{id}", delete(delete_saved_test_handler))
        .route("/api/reports/heatmap", get(heatmap_handler))
        .route("/api/worker/health", get(worker_health_handler))
        .route("/api/telemetry", post(telemetry_handler))
        .route("/api/webhooks/identity", post(identity_webhook_handler))
        .with_state(state)
}

/// The synchronous core (rusqlite + blocking HTTP) runs on the blocking
/// pool so handlers never stall the async executor.
async fn run_blocking<T: Send + 'static>(
    task: impl FnOnce() -> Result<T, String> + Send + 'static,
) -> Result<T, String> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| format!("Background task failed: {e}"))?
}

async fn healthz() -> &'static str {
    "ok"
}

async fn launch_mission_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(input): Json<LaunchMissionInput>,
) -> Json<ActionResponse> {
    let result = run_blocking(move || {
        let conn = state.open_connection()?;
        missions::launch_mission(&conn, state.transport.as_ref(), &user.0, &input)
    })
    .await;
    Json(match result {
        Ok(launched) => ActionResponse::launched(launched),
        Err(message) => ActionResponse::failure(message),
    })
}

async fn launch_scout_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(input): Json<LaunchScoutInput>,
) -> Json<ActionResponse> {
    let result = run_blocking(move || {
        let conn = state.open_connection()?;
        missions::launch_scout(&conn, state.transport.as_ref(), &user.0, &input)
    })
    .await;
    Json(match result {
        Ok(launched) => ActionResponse::launched(launched),
        Err(message) => ActionResponse::failure(message),
    })
}

#[derive(Debug, Deserialize)]
struct ReplayInput {
    test_id: i64,
}

async fn launch_replay_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(input): Json<ReplayInput>,
) -> Json<ActionResponse> {
    let result = run_blocking(move || {
        let conn = state.open_connection()?;
        registry::launch_replay(&conn, state.transport.as_ref(), &user.0, input.test_id)
    })
    .await;
    Json(match result {
        Ok(launched) => ActionResponse::launched(launched),
        Err(message) => ActionResponse::failure(message),
    })
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_runs_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RunRecord>>, (StatusCode, Json<ActionResponse>)> {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT);
    run_blocking(move || {
        let conn = state.open_connection()?;
        missions::list_runs(&conn, &user.0, limit)
    })
    .await
    .map(Json)
    .map_err(internal_error)
}

async fn run_detail_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(run_id): Path<String>,
) -> Result<Json<RunDetail>, (StatusCode, Json<ActionResponse>)> {
    let detail = run_blocking(move || {
        let conn = state.open_connection()?;
        missions::get_run_detail(&conn, &user.0, &run_id)
    })
    .await
    .map_err(internal_error)?;
    detail.map(Json).ok_or((
        StatusCode::NOT_FOUND,
        Json(ActionResponse::failure("Run not found")),
    ))
}

async fn delete_run_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(run_id): Path<String>,
) -> Result<Json<ActionResponse>, (StatusCode, Json<ActionResponse>)> {
    let deleted = run_blocking(move || {
        let conn = state.open_connection()?;
        missions::delete_run(&conn, &user.0, &run_id)
    })
    .await
    .map_err(internal_error)?;
    if deleted {
        Ok(Json(ActionResponse::ok("Mission purged.")))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(ActionResponse::failure("Run not found")),
        ))
    }
}

async fn scout_history_handler(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<Vec<CrawlRecord>>, (StatusCode, Json<ActionResponse>)> {
    run_blocking(move || {
        let conn = state.open_connection()?;
        missions::list_scout_history(&conn, &user.0)
    })
    .await
    .map(Json)
    .map_err(internal_error)
}

/// Initial rows in step order, then live inserts for this run until the
/// client disconnects; the broadcast subscription dies with the stream.
async fn stream_logs_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ActionResponse>)> {
    let fetch_state = state.clone();
    let fetch_run_id = run_id.clone();
    let projection = run_blocking(move || {
        let conn = fetch_state.open_connection()?;
        let Some(_) = missions::get_run(&conn, &user.0, &fetch_run_id)? else {
            return Ok(None);
        };
        LogProjection::open(&conn, &fetch_state.bus, &fetch_run_id).map(Some)
    })
    .await
    .map_err(internal_error)?;
    let projection = projection.ok_or((
        StatusCode::NOT_FOUND,
        Json(ActionResponse::failure("Run not found")),
    ))?;
    let (initial, rx) = projection.into_parts();

    let initial_events: Vec<Result<Event, axum::Error>> = initial
        .iter()
        .map(|row| Event::default().json_data(row))
        .collect();
    let live = BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(row) if row.run_id == run_id => Some(Event::default().json_data(&row)),
        _ => None,
    });
    let stream = tokio_stream::iter(initial_events).chain(live);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn vault_status_handler(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<VaultStatus>, (StatusCode, Json<ActionResponse>)> {
    run_blocking(move || {
        let conn = state.open_connection()?;
        vault::vault_status(&conn, &user.0)
    })
    .await
    .map(Json)
    .map_err(internal_error)
}

async fn save_vault_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(input): Json<SaveVaultInput>,
) -> Json<ActionResponse> {
    let result = run_blocking(move || {
        let conn = state.open_connection()?;
        vault::save_vault(&conn, &state.cipher, &user.0, &input)
    })
    .await;
    Json(match result {
        Ok(()) => ActionResponse::ok("Vault secured successfully."),
        Err(message) => {
            tracing::error!("vault save failed: {message}");
            ActionResponse::failure("Error saving vault")
        }
    })
}

#[derive(Debug, Deserialize)]
struct TestKeyInput {
    provider: String,
    key: Option<String>,
}

async fn test_key_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(input): Json<TestKeyInput>,
) -> Json<verifier::ProbeResult> {
    let provider = match ProviderKind::parse(&input.provider) {
        Ok(provider) => provider,
        Err(message) => {
            return Json(verifier::ProbeResult {
                success: false,
                message,
            })
        }
    };
    let result = run_blocking(move || {
        let conn = state.open_connection()?;
        Ok(verifier::test_provider_key(
            &conn,
            &state.cipher,
            &user.0,
            provider,
            input.key.as_deref(),
        ))
    })
    .await;
    Json(result.unwrap_or_else(|message| {
        tracing::error!("key probe task failed: {message}");
        verifier::ProbeResult {
            success: false,
            message: "System Network Error".to_string(),
        }
    }))
}

#[derive(Debug, Deserialize)]
struct PromoteInput {
    run_id: String,
    name: String,
}

async fn promote_run_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Json(input): Json<PromoteInput>,
) -> Json<ActionResponse> {
    let result = run_blocking(move || {
        let conn = state.open_connection()?;
        registry::promote_run(&conn, &user.0, &input.run_id, &input.name)
    })
    .await;
    Json(match result {
        Ok(_) => ActionResponse::ok("Promoted to Golden Path."),
        Err(message) => ActionResponse::failure(message),
    })
}

async fn list_registry_handler(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<Vec<SavedTestRecord>>, (StatusCode, Json<ActionResponse>)> {
    run_blocking(move || {
        let conn = state.open_connection()?;
        registry::list_saved_tests(&conn, &user.0)
    })
    .await
    .map(Json)
    .map_err(internal_error)
}

async fn delete_saved_test_handler(
    State(state): State<AppState>,
    user: AuthedUser,
    Path(test_id): Path<i64>,
) -> Result<Json<ActionResponse>, (StatusCode, Json<ActionResponse>)> {
    let deleted = run_blocking(move || {
        let conn = state.open_connection()?;
        registry::delete_saved_test(&conn, &user.0, test_id)
    })
    .await
    .map_err(internal_error)?;
    if deleted {
        Ok(Json(ActionResponse::ok("Test removed from registry.")))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(ActionResponse::failure("Saved test not found")),
        ))
    }
}

async fn heatmap_handler(
    State(state): State<AppState>,
    user: AuthedUser,
) -> Result<Json<Vec<RiskItem>>, (StatusCode, Json<ActionResponse>)> {
    run_blocking(move || {
        let conn = state.open_connection()?;
        reports::risk_heatmap(&conn, &user.0)
    })
    .await
    .map(Json)
    .map_err(internal_error)
}

async fn worker_health_handler(
    State(state): State<AppState>,
    _user: AuthedUser,
) -> Result<Json<WorkerHealth>, (StatusCode, Json<ActionResponse>)> {
    run_blocking(move || Ok(state.transport.health_check()))
        .await
        .map(Json)
        .map_err(internal_error)
}

/// Worker callback: 200 on append, 400 when run_id is missing, 500 on
/// store failure. The worker sits outside the session layer, so this route
/// takes no user header.
async fn telemetry_handler(
    State(state): State<AppState>,
    Json(payload): Json<TelemetryPayload>,
) -> Response {
    if payload.run_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing run_id" })),
        )
            .into_response();
    }
    let result = run_blocking(move || {
        let conn = state.open_connection()?;
        telemetry::ingest(&conn, &state.bus, &payload)
    })
    .await;
    match result {
        Ok(_) => (StatusCode::OK, "Telemetry Received").into_response(),
        Err(message) => {
            tracing::error!("telemetry ingest failed: {message}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal Server Error" })),
            )
                .into_response()
        }
    }
}

/// Identity-provider callback. Signature verification happens before any
/// store access; provisioning failures return 500 so the provider retries.
async fn identity_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(secret) = state.settings.webhook_secret.clone() else {
        tracing::error!("ARGUS_WEBHOOK_SECRET not configured");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error").into_response();
    };

    let (Some(id), Some(timestamp), Some(signature)) = (
        header_str(&headers, "svix-id"),
        header_str(&headers, "svix-timestamp"),
        header_str(&headers, "svix-signature"),
    ) else {
        tracing::warn!("webhook delivery missing required headers");
        return (StatusCode::BAD_REQUEST, "Missing headers").into_response();
    };

    let webhook_headers = WebhookHeaders {
        id,
        timestamp,
        signature,
    };
    let now_secs = db::now_ms() / 1000;
    if let Err(verify_err) = webhook::verify_signature(&secret, &webhook_headers, &body, now_secs) {
        tracing::warn!("webhook signature verification failed: {verify_err}");
        return (StatusCode::BAD_REQUEST, "Verification failed").into_response();
    }

    let event: IdentityEvent = match serde_json::from_str(&body) {
        Ok(event) => event,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid event data").into_response(),
    };
    if event
        .data
        .id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .is_none()
    {
        return (StatusCode::BAD_REQUEST, "Invalid event data").into_response();
    }

    let result = run_blocking(move || {
        let conn = state.open_connection()?;
        webhook::handle_identity_event(&conn, &event)
    })
    .await;
    match result {
        Ok(_) => (StatusCode::OK, "Webhook processed").into_response(),
        Err(message) => {
            tracing::error!("webhook provisioning failed: {message}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Database sync error").into_response()
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn internal_error(message: String) -> (StatusCode, Json<ActionResponse>) {
    tracing::error!("request failed: {message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ActionResponse::failure("Internal Server Error")),
    )
}
