//! Upstream pass-through for requests the gateway let through.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header::SET_COOKIE, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use secrecy::SecretString;
use std::sync::Arc;
use tracing::{error, instrument};

use super::{
    access::GateError,
    middleware::GateContext,
    session::{
        cookies::ACCESS_COOKIE_NAME, AuthEvent, SessionCredentials,
    },
    state::GatewayState,
};

pub const USER_ID_HEADER: &str = "x-gateway-user-id";
pub const ADMIN_TIER_HEADER: &str = "x-gateway-admin-tier";

const REQUEST_BODY_LIMIT: usize = 16 * 1024 * 1024;
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Request headers for the upstream: hop-by-hop headers dropped, client
/// supplied annotations replaced by the gateway's own.
fn upstream_headers(headers: &HeaderMap, context: Option<&GateContext>) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len() + 2);
    for (name, value) in headers {
        if is_hop_by_hop(name) || name.as_str().starts_with("x-gateway-") {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    let Some(context) = context else {
        return forwarded;
    };
    if let Some(value) = context
        .user_id()
        .and_then(|user_id| HeaderValue::from_str(user_id).ok())
    {
        forwarded.insert(USER_ID_HEADER, value);
    }
    if let Some(admin) = &context.outcome.admin {
        forwarded.insert(ADMIN_TIER_HEADER, HeaderValue::from_static(admin.tier.as_str()));
    }
    forwarded
}

/// Access token set by a successful login response.
fn issued_access_token(headers: &HeaderMap) -> Option<SecretString> {
    let prefix = format!("{ACCESS_COOKIE_NAME}=");
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| {
            let value = cookie.strip_prefix(&prefix)?.split(';').next()?.trim();
            (!value.is_empty()).then(|| SecretString::from(value.to_string()))
        })
}

async fn account_login(state: &GatewayState, context: &GateContext, status: StatusCode, headers: &HeaderMap) {
    if status.is_server_error() || status.is_informational() {
        return;
    }
    let success = status.is_success() || status.is_redirection();
    state
        .access()
        .record_login_result(&context.outcome, success, context.masked_email.clone())
        .await;
    if !success {
        return;
    }
    if let Some(access_token) = issued_access_token(headers) {
        let credentials = SessionCredentials {
            access_token: Some(access_token),
            refresh_token: None,
        };
        let check = state.sessions().validate_session(&credentials).await;
        if let Some(user_id) = check.user_id() {
            state.sessions().publish(AuthEvent::SignedIn {
                user_id: user_id.to_string(),
            });
        }
    }
}

async fn send(
    state: &GatewayState,
    context: Option<&GateContext>,
    request: Request,
) -> Result<Response, GateError> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
    let url = format!(
        "{}{path_and_query}",
        state.config().upstream_url().as_str().trim_end_matches('/')
    );
    let body = to_bytes(body, REQUEST_BODY_LIMIT)
        .await
        .map_err(|err| GateError::Body(err.to_string()))?;

    let upstream = state
        .upstream()
        .request(parts.method.clone(), url)
        .headers(upstream_headers(&parts.headers, context))
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut headers = HeaderMap::with_capacity(upstream.headers().len());
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Some(context) = context.filter(|context| context.login_attempt) {
        account_login(state, context, status, &headers).await;
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Fallback handler: forward to the storefront.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn forward(
    State(state): State<Arc<GatewayState>>,
    context: Option<Extension<GateContext>>,
    request: Request,
) -> Response {
    let context = context.map(|Extension(context)| context);
    match send(&state, context.as_ref(), request).await {
        Ok(response) => response,
        Err(GateError::Body(err)) => {
            error!("Rejected request body: {err}");
            StatusCode::PAYLOAD_TOO_LARGE.into_response()
        }
        Err(err) => {
            error!("Upstream pass-through failed: {err}");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
