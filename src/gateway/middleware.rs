//! axum middleware running the access controller and decorating responses.

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{
        header::CONTENT_TYPE, header::SET_COOKIE, request::Parts, uri, HeaderMap, Method,
        StatusCode, Uri,
    },
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tracing::{debug, error};

use super::{
    access::{AccessOutcome, AccessRequest, CookieUpdate, Decision, GateError},
    headers::is_tls,
    logger::mask_email,
    routes::canonical_path,
    session::cookies::{cleared_cookies, session_cookies},
    state::GatewayState,
};

const LOGIN_BODY_LIMIT: usize = 64 * 1024;
const FORWARDED_FOR: &str = "x-forwarded-for";

/// Access result handed to handlers of requests that were let through.
#[derive(Clone, Debug)]
pub struct GateContext {
    pub outcome: AccessOutcome,
    /// Set for POSTs to a login endpoint.
    pub login_attempt: bool,
    pub masked_email: Option<String>,
}

impl GateContext {
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.outcome.user_id()
    }
}

/// Caller address. `X-Forwarded-For` is only honored behind a trusted proxy.
#[must_use]
pub fn client_ip(parts: &Parts, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = parts
            .headers
            .get(FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

/// Request URI with its path in canonical form, query untouched. `None`
/// when the path cannot be canonicalized.
#[must_use]
pub fn canonical_uri(original: &Uri) -> Option<Uri> {
    let path = canonical_path(original.path())?;
    if path == original.path() {
        return Some(original.clone());
    }
    let path_and_query = match original.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let mut parts = uri::Parts::from(original.clone());
    parts.path_and_query = Some(path_and_query.parse().ok()?);
    Uri::from_parts(parts).ok()
}

/// Account named in a login form or JSON body.
fn account_from_body(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?.to_ascii_lowercase();
    let account = if content_type.starts_with("application/json") {
        serde_json::from_slice::<Value>(body)
            .ok()?
            .get("email")?
            .as_str()?
            .to_string()
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        url::form_urlencoded::parse(body)
            .find(|(key, _)| key == "email")?
            .1
            .into_owned()
    } else {
        return None;
    };
    let account = account.trim().to_string();
    (!account.is_empty()).then_some(account)
}

fn apply_cookies(
    state: &GatewayState,
    update: &CookieUpdate,
    headers: &mut HeaderMap,
) -> Result<(), GateError> {
    let secure = state.config().secure_cookies();
    let cookies = match update {
        CookieUpdate::Keep => return Ok(()),
        CookieUpdate::Set(session) => session_cookies(session, state.clock().now_ms(), secure)?,
        CookieUpdate::Clear => cleared_cookies(secure)?,
    };
    for cookie in cookies {
        headers.append(SET_COOKIE, cookie);
    }
    Ok(())
}

pub async fn gate(State(state): State<Arc<GatewayState>>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    // Classified and forwarded path are the same string from here on.
    match canonical_uri(&parts.uri) {
        Some(canonical) => parts.uri = canonical,
        None => {
            debug!("rejecting non-canonical path {}", parts.uri.path());
            return StatusCode::BAD_REQUEST.into_response();
        }
    }
    let ip = client_ip(&parts, state.config().trust_forwarded_for());
    let login_attempt =
        parts.method == Method::POST && state.config().is_login_endpoint(parts.uri.path());

    let (body, account) = if login_attempt {
        match to_bytes(body, LOGIN_BODY_LIMIT).await {
            Ok(bytes) => {
                let account = account_from_body(&parts.headers, &bytes);
                (Body::from(bytes), account)
            }
            Err(err) => {
                error!("{}", GateError::Body(err.to_string()));
                return StatusCode::BAD_REQUEST.into_response();
            }
        }
    } else {
        (body, None)
    };

    let outcome = state
        .access()
        .evaluate(&AccessRequest {
            method: &parts.method,
            uri: &parts.uri,
            headers: &parts.headers,
            client_ip: &ip,
            account: account.as_deref(),
        })
        .await;
    debug!(
        "access decision for {} {}: {:?}",
        parts.method,
        parts.uri.path(),
        outcome.decision
    );

    let cookies = outcome.cookies.clone();
    let mut response = match outcome.decision.clone() {
        Decision::Continue => {
            let mut request = Request::from_parts(parts, body);
            request.extensions_mut().insert(GateContext {
                outcome,
                login_attempt,
                masked_email: account.as_deref().map(mask_email),
            });
            next.run(request).await
        }
        Decision::Redirect(location) => Redirect::to(&location).into_response(),
        Decision::TooManyRequests => StatusCode::TOO_MANY_REQUESTS.into_response(),
        Decision::Forbidden => StatusCode::FORBIDDEN.into_response(),
    };

    if let Err(err) = apply_cookies(&state, &cookies, response.headers_mut()) {
        error!("Failed to write session cookies: {err}");
    }
    response
}

/// Attach the security headers to every response, error paths included.
pub async fn security_headers(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let tls = is_tls(request.headers(), request.uri());
    let mut response = next.run(request).await;
    state.security_headers().apply(response.headers_mut(), tls);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/login");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, ()) = builder.body(()).unwrap_or_default().into_parts();
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 4], 5555))));
        parts
    }

    #[test]
    fn canonical_uri_keeps_the_query() {
        let original = Uri::from_static("/x/%2e%2e//admin/products?page=2&q=a%2Fb");
        let canonical = canonical_uri(&original).map(|uri| uri.to_string());
        assert_eq!(canonical.as_deref(), Some("/admin/products?page=2&q=a%2Fb"));

        let absolute = Uri::from_static("http://shop.tld/./account");
        let canonical = canonical_uri(&absolute).map(|uri| uri.to_string());
        assert_eq!(canonical.as_deref(), Some("http://shop.tld/account"));

        assert_eq!(canonical_uri(&Uri::from_static("/admin%2fproducts")), None);
    }

    #[test]
    fn forwarded_for_only_when_trusted() {
        let parts = parts(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        assert_eq!(client_ip(&parts, true), "203.0.113.9");
        assert_eq!(client_ip(&parts, false), "198.51.100.4");
    }

    #[test]
    fn unknown_without_connect_info() {
        let (parts, ()) = Request::builder()
            .body(())
            .unwrap_or_default()
            .into_parts();
        assert_eq!(client_ip(&parts, false), "unknown");
    }

    #[test]
    fn reads_account_from_form_and_json() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        assert_eq!(
            account_from_body(&headers, b"email=shopper%40example.com&password=x"),
            Some("shopper@example.com".to_string())
        );

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        assert_eq!(
            account_from_body(&headers, br#"{"email":" a@b.co ","password":"x"}"#),
            Some("a@b.co".to_string())
        );
        assert_eq!(account_from_body(&headers, b"not json"), None);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert_eq!(account_from_body(&headers, b"email=a@b.co"), None);
    }
}
