//! HTTP request handlers.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::audit::AuditRecord;
use crate::auth::{CurrentUser, RequireAdmin};
use crate::desktop::{AdminSessionView, CreateOutcome, SessionView, parse_user_id};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Default and maximum page size for the audit listing.
const DEFAULT_EVENT_LIMIT: u32 = 100;
const MAX_EVENT_LIMIT: u32 = 1000;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.desktops.active_count(),
    })
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub success: bool,
    pub session: SessionView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_warnings: Vec<String>,
}

/// Provision (or return) the caller's desktop.
///
/// Responds 201 when a container was started and 200 when an existing
/// session was reused. Blocks until the readiness poll finishes.
#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn create_desktop_session(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let user_id = parse_user_id(user.id())?;

    let outcome = state.desktops.create_session(user_id).await?;
    let status = match outcome {
        CreateOutcome::Created(ref session) => {
            info!(session_id = %session.session_id, port = session.port, "Desktop session created");
            StatusCode::CREATED
        }
        CreateOutcome::Reused(_) => StatusCode::OK,
    };

    Ok((
        status,
        Json(SessionResponse {
            success: true,
            session: SessionView::from(outcome.session()),
        }),
    ))
}

/// The caller's live desktop.
#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn get_current_session(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<SessionResponse>> {
    let user_id = parse_user_id(user.id())?;

    let session = state
        .desktops
        .get_session(user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("No active desktop session"))?;

    Ok(Json(SessionResponse {
        success: true,
        session: SessionView::from(&session),
    }))
}

/// Tear down the caller's desktop.
#[instrument(skip(state, user), fields(user = %user.id()))]
pub async fn terminate_current_session(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<(StatusCode, Json<TerminateResponse>)> {
    let user_id = parse_user_id(user.id())?;

    let outcome = state.desktops.terminate_session(user_id).await;
    if let Some(reason) = outcome.reason {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(TerminateResponse {
                success: false,
                message: reason.to_string(),
                cleanup_warnings: Vec::new(),
            }),
        ));
    }

    info!("Desktop session terminated");
    Ok((
        StatusCode::OK,
        Json(TerminateResponse {
            success: true,
            message: "Desktop session terminated".to_string(),
            cleanup_warnings: outcome.cleanup_warnings,
        }),
    ))
}

#[derive(Debug, Serialize)]
pub struct AdminSessionsResponse {
    pub success: bool,
    pub count: usize,
    pub sessions: Vec<AdminSessionView>,
}

/// Every registered desktop (admin only).
#[instrument(skip(state, _admin))]
pub async fn list_desktop_sessions(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> Json<AdminSessionsResponse> {
    let sessions: Vec<AdminSessionView> = state
        .desktops
        .list_sessions()
        .iter()
        .map(AdminSessionView::from)
        .collect();

    Json(AdminSessionsResponse {
        success: true,
        count: sessions.len(),
        sessions,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub user_id: Option<u64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub success: bool,
    pub events: Vec<AuditRecord>,
}

/// Recent audit events, newest first (admin only).
#[instrument(skip(state, _admin))]
pub async fn list_session_events(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<EventsResponse>> {
    let store = state
        .audit
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("audit trail is disabled"))?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    let events = store.recent(query.user_id, limit).await?;

    Ok(Json(EventsResponse {
        success: true,
        events,
    }))
}
