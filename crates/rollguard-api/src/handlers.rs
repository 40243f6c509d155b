//! REST API handlers.
//!
//! Each handler calls into the shared `Guard` and returns JSON responses.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use rollguard_health::ProbeResult;
use rollguard_rollout::{GateDecision, GuardError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Contention is worth retrying (503); everything else maps by kind.
fn guard_error(e: &GuardError) -> Response {
    let status = match e {
        e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        GuardError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
        GuardError::NoOpenEpisode(_) => StatusCode::NOT_FOUND,
        GuardError::EpisodeInFlight { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "api request failed");
    }
    error_response(&e.to_string(), status)
}

// ── Probes ─────────────────────────────────────────────────────

/// Probe result body; `timestamp` defaults to the server's clock.
#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    pub target: String,
    pub passed: bool,
    pub timestamp: Option<u64>,
    pub latency_ms: Option<u64>,
}

/// POST /api/v1/probes
pub async fn record_probe(
    State(state): State<ApiState>,
    Json(req): Json<ProbeRequest>,
) -> Response {
    let probe = ProbeResult {
        target: req.target,
        timestamp: req.timestamp.unwrap_or_else(|| state.guard.now()),
        passed: req.passed,
        latency_ms: req.latency_ms,
    };
    match state.guard.record(&probe).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => guard_error(&e),
    }
}

// ── Targets ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub version: String,
}

/// POST /api/v1/targets/:target/deployments
pub async fn record_deploy(
    State(state): State<ApiState>,
    Path(target): Path<String>,
    Json(req): Json<DeployRequest>,
) -> Response {
    if req.version.trim().is_empty() {
        return error_response("version must not be empty", StatusCode::BAD_REQUEST);
    }
    match state.guard.record_deploy(&target, &req.version).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "target": target,
            "version": req.version,
        }))
        .into_response(),
        Err(e) => guard_error(&e),
    }
}

/// GET /api/v1/targets/:target/authorize
///
/// 200 when allowed, 423 Locked when blocked; the body carries the reason.
pub async fn authorize(State(state): State<ApiState>, Path(target): Path<String>) -> Response {
    let decision = state.guard.authorize(&target);
    match &decision {
        GateDecision::Allowed => ApiResponse::ok(decision).into_response(),
        GateDecision::Blocked { reason, .. } => {
            let error = Some(reason.to_string());
            (
                StatusCode::LOCKED,
                Json(ApiResponse {
                    success: false,
                    data: Some(decision),
                    error,
                }),
            )
                .into_response()
        }
    }
}

/// GET /api/v1/targets/:target/health
pub async fn target_health(State(state): State<ApiState>, Path(target): Path<String>) -> Response {
    match state.guard.health(&target) {
        Ok(health) => ApiResponse::ok(health).into_response(),
        Err(e) => guard_error(&e),
    }
}

/// GET /api/v1/targets/:target/episodes
pub async fn list_episodes(State(state): State<ApiState>, Path(target): Path<String>) -> Response {
    match state.guard.episodes(&target) {
        Ok(episodes) => ApiResponse::ok(episodes).into_response(),
        Err(e) => guard_error(&e),
    }
}

/// POST /api/v1/targets/:target/episodes/acknowledge
pub async fn acknowledge_episode(
    State(state): State<ApiState>,
    Path(target): Path<String>,
) -> Response {
    match state.guard.acknowledge_episode(&target).await {
        Ok(episode) => ApiResponse::ok(episode).into_response(),
        Err(e) => guard_error(&e),
    }
}

// ── Cooldown ───────────────────────────────────────────────────

/// GET /api/v1/cooldown
pub async fn get_cooldown(State(state): State<ApiState>) -> Response {
    let now = state.guard.now();
    match state.guard.cooldown() {
        Ok(window) => ApiResponse::ok(serde_json::json!({
            "active": window.as_ref().is_some_and(|w| w.is_active(now)),
            "window": window,
        }))
        .into_response(),
        Err(e) => guard_error(&e),
    }
}

/// POST /api/v1/cooldown/clear
pub async fn clear_cooldown(State(state): State<ApiState>) -> Response {
    match state.guard.clear_cooldown().await {
        Ok(cleared) => ApiResponse::ok(serde_json::json!({
            "cleared": cleared.is_some(),
            "window": cleared,
        }))
        .into_response(),
        Err(e) => guard_error(&e),
    }
}

// ── Flags ──────────────────────────────────────────────────────

/// GET /api/v1/flags/*key
pub async fn get_flag(State(state): State<ApiState>, Path(key): Path<String>) -> Response {
    match state.guard.flag(&key) {
        Ok(Some(flag)) => ApiResponse::ok(flag).into_response(),
        Ok(None) => error_response("flag not found", StatusCode::NOT_FOUND),
        Err(e) => guard_error(&e),
    }
}
