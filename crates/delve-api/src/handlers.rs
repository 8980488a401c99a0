//! REST API handlers.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::warn;

use delve_reactor::ReactorError;
use delve_state::NewEvent;

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

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn reactor_status(err: &ReactorError) -> StatusCode {
    match err {
        ReactorError::MissingField(_) => StatusCode::BAD_REQUEST,
        ReactorError::PlayerNotFound(_)
        | ReactorError::InstanceNotFound(_)
        | ReactorError::NoActiveClaim(_) => StatusCode::NOT_FOUND,
        ReactorError::NotAllowed(_) => StatusCode::PRECONDITION_FAILED,
        ReactorError::Conflict(_) => StatusCode::CONFLICT,
        ReactorError::State(_) | ReactorError::Lock(_) | ReactorError::Scheduler(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ── Events ─────────────────────────────────────────────────────

/// POST /api/v1/events
pub async fn submit_event(
    State(state): State<ApiState>,
    Json(event): Json<NewEvent>,
) -> impl IntoResponse {
    match state.reactor.handle(event).await {
        Ok(record) => (StatusCode::CREATED, ApiResponse::ok(record)).into_response(),
        Err(e) => {
            let status = reactor_status(&e);
            if status.is_server_error() {
                warn!(error = %e, "event rejected");
            }
            error_response(&e.to_string(), status).into_response()
        }
    }
}

// ── Read-only state ────────────────────────────────────────────

/// GET /api/v1/instances
pub async fn list_instances(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_instances() {
        Ok(instances) => ApiResponse::ok(instances).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct ClaimQuery {
    #[serde(default)]
    pub active: bool,
}

/// GET /api/v1/claims
pub async fn list_claims(
    State(state): State<ApiState>,
    Query(query): Query<ClaimQuery>,
) -> impl IntoResponse {
    let claims = if query.active {
        state.store.list_active_claims()
    } else {
        state.store.list_claims()
    };
    match claims {
        Ok(claims) => ApiResponse::ok(claims).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/players/:name
pub async fn get_player(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.get_player(&name) {
        Ok(Some(player)) => ApiResponse::ok(player).into_response(),
        Ok(None) => error_response("player not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
