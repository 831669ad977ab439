/**
 * HTTP READ SURFACE - Thin axum router over the kernel state
 *
 * ROLE:
 * Query and operator endpoints for dashboards, scripts and the control UI.
 * Every handler is a snapshot read or a single store/gateway call.
 *
 * OPERATION:
 * - /health, /system/health: liveness and kernel vitals
 * - /api/...: machines, process data, status, alarms, advisories, commands
 * - /ws: live push channel (see ws.rs)
 * - Unknown machine -> 404, bad input -> 400, bus down -> 503
 * - CORS from `http.cors_origins` so a browser dashboard can call in
 */

use crate::aggregator::system_status;
use crate::config::HttpConf;
use crate::contracts::DecodeError;
use crate::fanout::{BroadcastFanout, ConnectionStats};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{
    Advisory, Alarm, Command, MachineDetails, MachineId, MachineOverview, StatusSnapshot, SystemStatus,
    TelemetrySample,
};
use crate::mqtt::{BusError, CommandRequest, IngestGateway};
use crate::state::StateStore;
use crate::ws::ws_handler;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub fanout: Arc<BroadcastFanout>,
    pub health: HealthTracker,
    pub gateway: Arc<IngestGateway>,
    pub client_send_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn machine(machine_id: &str) -> Self {
        ApiError::NotFound(format!("machine '{machine_id}' not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::NotConnected | BusError::Timeout(_) => ApiError::Unavailable(err.to_string()),
            BusError::Publish(_) | BusError::Encode(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DecodeError> for ApiError {
    fn from(err: DecodeError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ActorParams {
    user: Option<String>,
}

impl ActorParams {
    fn actor(self) -> String {
        self.user.filter(|u| !u.is_empty()).unwrap_or_else(|| "operator".to_string())
    }
}

pub fn build_router(app_state: AppState, http: &HttpConf) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/system/health", get(get_system_health))
        .route("/api/status", get(get_system_status))
        .route("/api/machines", get(list_machines))
        .route("/api/machines/{id}", get(get_machine))
        .route("/api/machines/{id}/status", get(get_machine_status))
        .route("/api/machines/{id}/status/history", get(get_status_history))
        .route("/api/process", get(list_process))
        .route("/api/process/{id}", get(get_process))
        .route("/api/process/{id}/history", get(get_process_history))
        .route("/api/alarms", get(list_alarms))
        .route("/api/alarms/{id}", get(get_alarms))
        .route("/api/alarms/{id}/history", get(get_alarm_history))
        .route("/api/alarms/{id}/{alarm_id}/acknowledge", post(acknowledge_alarm))
        .route("/api/alarms/{id}/{alarm_id}/resolve", post(resolve_alarm))
        .route("/api/advisories", get(list_advisories).post(submit_advisory))
        .route("/api/advisories/{id}", get(get_advisories))
        .route("/api/control", post(send_control_command))
        .route("/api/commands/{id}", get(get_commands))
        .route("/api/connections", get(get_connections))
        .route("/ws", get(ws_handler))
        .layer(build_cors_layer(&http.cors_origins))
        .with_state(app_state)
}

/// `"*"` anywhere in `origins` allows every origin (without credentials);
/// otherwise only the listed origins, with credentials. Origins that are not
/// valid header values are skipped.
pub fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%origin, error = %e, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        "mqtt_connected": app.health.is_connected(),
        "active_websockets": app.fanout.client_count(),
    }))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app.store, &app.fanout))
}

// GET /api/status (fleet rollup)
async fn get_system_status(State(app): State<AppState>) -> Json<SystemStatus> {
    let mut status = system_status(&app.store.fleet_snapshot(), OffsetDateTime::now_utc());
    status.bus_status = Some(app.health.mqtt_status());
    Json(status)
}

async fn list_machines(State(app): State<AppState>) -> Json<Vec<MachineOverview>> {
    Json(app.store.machines_overview(OffsetDateTime::now_utc()))
}

async fn get_machine(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<MachineDetails> {
    app.store
        .machine_details(&id, OffsetDateTime::now_utc())
        .map(Json)
        .ok_or_else(|| ApiError::machine(&id))
}

async fn get_machine_status(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusSnapshot> {
    app.store.latest_status(&id).map(Json).ok_or_else(|| ApiError::machine(&id))
}

async fn get_status_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<StatusSnapshot>> {
    app.store.status_history(&id, params.limit).map(Json).ok_or_else(|| ApiError::machine(&id))
}

async fn list_process(State(app): State<AppState>) -> Json<BTreeMap<MachineId, TelemetrySample>> {
    Json(app.store.latest_all())
}

async fn get_process(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<TelemetrySample> {
    app.store.latest(&id).map(Json).ok_or_else(|| ApiError::machine(&id))
}

async fn get_process_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<TelemetrySample>> {
    app.store.history(&id, params.limit).map(Json).ok_or_else(|| ApiError::machine(&id))
}

// GET /api/alarms (active, per machine)
async fn list_alarms(State(app): State<AppState>) -> Json<BTreeMap<MachineId, Vec<Alarm>>> {
    Json(app.store.active_alarms_all())
}

async fn get_alarms(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<Alarm>> {
    if !app.store.contains(&id) {
        return Err(ApiError::machine(&id));
    }
    Ok(Json(app.store.active_alarms(&id)))
}

async fn get_alarm_history(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<Alarm>> {
    app.store.alarm_history(&id, params.limit).map(Json).ok_or_else(|| ApiError::machine(&id))
}

// POST /api/alarms/{id}/{alarm_id}/acknowledge?user=
async fn acknowledge_alarm(
    State(app): State<AppState>,
    Path((id, alarm_id)): Path<(String, String)>,
    Query(params): Query<ActorParams>,
) -> ApiResult<Value> {
    let actor = params.actor();
    if !app.store.acknowledge(&id, &alarm_id, &actor) {
        return Err(ApiError::NotFound(format!("no active alarm '{alarm_id}' on '{id}'")));
    }
    Ok(Json(json!({ "machine_id": id, "alarm_id": alarm_id, "acknowledged_by": actor })))
}

// POST /api/alarms/{id}/{alarm_id}/resolve?user=
async fn resolve_alarm(
    State(app): State<AppState>,
    Path((id, alarm_id)): Path<(String, String)>,
    Query(params): Query<ActorParams>,
) -> ApiResult<Value> {
    let actor = params.actor();
    if !app.store.resolve(&id, &alarm_id, &actor) {
        return Err(ApiError::NotFound(format!("no active alarm '{alarm_id}' on '{id}'")));
    }
    app.fanout.notify_system(
        "alarm_resolved",
        &format!("alarm {alarm_id} on {id} resolved by {actor}"),
        "info",
    );
    Ok(Json(json!({ "machine_id": id, "alarm_id": alarm_id, "resolved_by": actor })))
}

async fn list_advisories(State(app): State<AppState>) -> Json<BTreeMap<MachineId, Vec<Advisory>>> {
    Json(app.store.advisories_all(OffsetDateTime::now_utc()))
}

async fn get_advisories(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<Advisory>> {
    if !app.store.contains(&id) {
        return Err(ApiError::machine(&id));
    }
    Ok(Json(app.store.advisories(&id, OffsetDateTime::now_utc())))
}

// POST /api/advisories (from the external scoring service)
async fn submit_advisory(
    State(app): State<AppState>,
    Json(advisory): Json<Advisory>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let delivered = app.gateway.submit_advisory(advisory)?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "accepted", "delivered": delivered }))))
}

// POST /api/control
async fn send_control_command(
    State(app): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<Command> {
    if request.machine_id.is_empty() || request.command.is_empty() {
        return Err(ApiError::BadRequest("machine_id and command are required".into()));
    }
    let command = app.gateway.dispatch_command(request).await?;
    Ok(Json(command))
}

async fn get_commands(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<Command>> {
    app.store.commands(&id, params.limit).map(Json).ok_or_else(|| ApiError::machine(&id))
}

async fn get_connections(State(app): State<AppState>) -> Json<ConnectionStats> {
    Json(app.fanout.connection_stats())
}
