//! Admin status of the signed-in user.
//!
//! The answer is fail-closed: an unavailable privilege directory reports
//! `is_admin: false` rather than an error.

use axum::{
    extract::State,
    http::{header::CACHE_CONTROL, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;

use super::caller_session;
use crate::gateway::{admin::AdminResolution, middleware::GateContext, state::GatewayState};

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct AdminStatusBody {
    user_id: String,
    is_admin: bool,
    is_master_admin: bool,
}

fn respond(user_id: &str, resolution: &AdminResolution) -> Response {
    debug!(
        "admin status for {user_id}: {} ({})",
        resolution.tier,
        resolution.reason.as_str()
    );
    (
        [(CACHE_CONTROL, "no-store")],
        Json(AdminStatusBody {
            user_id: user_id.to_string(),
            is_admin: resolution.is_admin(),
            is_master_admin: resolution.is_master_admin(),
        }),
    )
        .into_response()
}

#[utoipa::path(
    get,
    path= "/gateway/admin-status",
    responses (
        (status = 200, description = "Admin tier of the current session", body = AdminStatusBody),
        (status = 401, description = "No session"),
    ),
    tag = "gateway",
)]
#[instrument(skip_all)]
pub async fn admin_status(
    State(state): State<Arc<GatewayState>>,
    context: Option<Extension<GateContext>>,
) -> Response {
    let Some(session) = caller_session(context.as_ref()) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let resolution = state.admin().resolve(Some(session), &session.user_id).await;
    respond(&session.user_id, &resolution)
}

#[utoipa::path(
    post,
    path= "/gateway/admin-status/refresh",
    params(
        ("x-csrf-token" = String, Header, description = "CSRF token"),
    ),
    responses (
        (status = 200, description = "Re-verified admin tier", body = AdminStatusBody),
        (status = 401, description = "No session"),
        (status = 403, description = "Missing or invalid CSRF token"),
    ),
    tag = "gateway",
)]
/// Drop the cached status and verify again. A verification already running
/// for the same user is superseded.
#[instrument(skip_all)]
pub async fn refresh(
    State(state): State<Arc<GatewayState>>,
    context: Option<Extension<GateContext>>,
) -> Response {
    let Some(session) = caller_session(context.as_ref()) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let resolution = state.tracker().verify(session.clone(), true).await;
    respond(&session.user_id, &resolution)
}
