//! Session credential transport: cookies and bearer headers.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{AUTHORIZATION, COOKIE, InvalidHeaderValue},
};
use secrecy::{ExposeSecret, SecretString};

use super::{Session, SessionCredentials};

pub const ACCESS_COOKIE_NAME: &str = "sg-access-token";
pub const REFRESH_COOKIE_NAME: &str = "sg-refresh-token";

/// Refresh cookies outlive access cookies so a stale session can still renew.
const REFRESH_COOKIE_MAX_AGE_SECONDS: i64 = 30 * 24 * 60 * 60;

/// Read credentials from the request. A bearer header wins over the access
/// cookie; the refresh token only travels as a cookie.
#[must_use]
pub fn credentials_from_headers(headers: &HeaderMap) -> SessionCredentials {
    let access_token =
        extract_bearer_token(headers).or_else(|| cookie_value(headers, ACCESS_COOKIE_NAME));
    let refresh_token = cookie_value(headers, REFRESH_COOKIE_NAME);
    SessionCredentials {
        access_token: access_token.map(SecretString::from),
        refresh_token: refresh_token.map(SecretString::from),
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|header| header.to_str().ok())
        .flat_map(|value| value.split(';'))
        .find_map(|pair| {
            let (key, val) = pair.trim().split_once('=')?;
            let val = val.trim();
            (key.trim() == name && !val.is_empty()).then(|| val.to_string())
        })
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn cookie(name: &str, value: &str, max_age: i64, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age}");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

/// `Set-Cookie` values for a freshly issued or refreshed session.
///
/// # Errors
/// Returns an error when a token contains bytes not allowed in a header.
pub fn session_cookies(
    session: &Session,
    now_ms: i64,
    secure: bool,
) -> Result<Vec<HeaderValue>, InvalidHeaderValue> {
    let ttl_seconds = ((session.expires_at_ms - now_ms) / 1000).max(0);
    let mut cookies = vec![cookie(
        ACCESS_COOKIE_NAME,
        session.access_token.expose_secret(),
        ttl_seconds,
        secure,
    )?];
    if let Some(refresh_token) = &session.refresh_token {
        cookies.push(cookie(
            REFRESH_COOKIE_NAME,
            refresh_token.expose_secret(),
            REFRESH_COOKIE_MAX_AGE_SECONDS,
            secure,
        )?);
    }
    Ok(cookies)
}

/// Expired cookies that remove both session tokens from the browser.
///
/// # Errors
/// Never in practice; the values are static.
pub fn cleared_cookies(secure: bool) -> Result<Vec<HeaderValue>, InvalidHeaderValue> {
    Ok(vec![
        cookie(ACCESS_COOKIE_NAME, "", 0, secure)?,
        cookie(REFRESH_COOKIE_NAME, "", 0, secure)?,
    ])
}
