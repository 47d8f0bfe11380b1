use axum::{
    extract::State,
    http::header::CACHE_CONTROL,
    response::{IntoResponse, Json},
    Extension,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;

use super::caller_session;
use crate::gateway::{middleware::GateContext, state::GatewayState};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CsrfToken {
    token: String,
}

#[utoipa::path(
    get,
    path= "/gateway/csrf-token",
    responses (
        (status = 200, description = "Token bound to the signed-in user, or to anonymous callers", body = CsrfToken),
    ),
    tag = "gateway",
)]
/// Issue a CSRF token for the next state-changing request.
#[instrument(skip_all)]
pub async fn csrf_token(
    State(state): State<Arc<GatewayState>>,
    context: Option<Extension<GateContext>>,
) -> impl IntoResponse {
    let user_id = caller_session(context.as_ref()).map(|session| session.user_id.as_str());
    let token = state.csrf().generate_token(user_id);
    ([(CACHE_CONTROL, "no-store")], Json(CsrfToken { token }))
}
