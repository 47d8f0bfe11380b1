//! Stateless CSRF tokens.
//!
//! A token is `base64url("{issued_at_ms}-{nonce}-{bound_user}") "." hex(hmac)`,
//! signed with HMAC-SHA256 under a server secret. Nothing is stored: validity
//! is computed from the token, the clock and the caller's user id, so every
//! gateway instance sharing the secret accepts the same tokens.

use axum::http::{HeaderMap, Method, Uri};
use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::{sync::Arc, time::Duration};
use subtle::ConstantTimeEq;

use super::{
    clock::Clock,
    logger::{SecureLogger, ViolationKind},
};

type HmacSha256 = Hmac<Sha256>;

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_QUERY_PARAM: &str = "csrf_token";
pub const ANONYMOUS: &str = "anonymous";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

const CLOCK_SKEW_MS: i64 = 5_000;

/// Only state-changing methods carry CSRF risk.
#[must_use]
pub fn is_state_changing(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Token from the `X-CSRF-Token` header, falling back to the `csrf_token`
/// query parameter.
#[must_use]
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_string());
    }
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == CSRF_QUERY_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

struct Claims<'a> {
    issued_at_ms: i64,
    bound_user: &'a str,
}

fn parse_payload(payload: &str) -> Option<Claims<'_>> {
    // Issued-at and nonce never contain '-', user ids may.
    let mut parts = payload.splitn(3, '-');
    let issued_at_ms = parts.next()?.parse::<i64>().ok()?;
    let nonce = parts.next()?;
    let bound_user = parts.next()?;
    if nonce.is_empty() || !nonce.chars().all(|c| c.is_ascii_hexdigit()) || bound_user.is_empty() {
        return None;
    }
    Some(Claims {
        issued_at_ms,
        bound_user,
    })
}

pub struct CsrfService {
    secret: SecretString,
    clock: Arc<dyn Clock>,
    logger: Arc<SecureLogger>,
    max_age: Duration,
}

impl std::fmt::Debug for CsrfService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfService")
            .field("secret", &"***")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl CsrfService {
    pub fn new(secret: SecretString, clock: Arc<dyn Clock>, logger: Arc<SecureLogger>) -> Self {
        Self {
            secret,
            clock,
            logger,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn sign(&self, payload: &[u8]) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes()).ok()?;
        mac.update(payload);
        Some(mac)
    }

    /// Issue a token bound to `user_id`, or to `"anonymous"` for
    /// unauthenticated forms.
    #[must_use]
    pub fn generate_token(&self, user_id: Option<&str>) -> String {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let bound_user = user_id.filter(|id| !id.is_empty()).unwrap_or(ANONYMOUS);
        let payload = format!(
            "{}-{}-{}",
            self.clock.now_ms(),
            hex::encode(nonce),
            bound_user
        );
        let signature = self
            .sign(payload.as_bytes())
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default();
        format!(
            "{}.{signature}",
            Base64UrlUnpadded::encode_string(payload.as_bytes())
        )
    }

    /// Check signature, age and user binding. Malformed input is simply
    /// invalid.
    #[must_use]
    pub fn validate_token(&self, token: &str, user_id: Option<&str>, max_age: Duration) -> bool {
        let Some((encoded, signature)) = token.trim().split_once('.') else {
            return false;
        };
        let Ok(payload) = Base64UrlUnpadded::decode_vec(encoded) else {
            return false;
        };
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        let Some(mac) = self.sign(&payload) else {
            return false;
        };
        let expected = mac.finalize().into_bytes();
        if !bool::from(expected.as_slice().ct_eq(signature.as_slice())) {
            return false;
        }

        let Ok(payload) = std::str::from_utf8(&payload) else {
            return false;
        };
        let Some(claims) = parse_payload(payload) else {
            return false;
        };

        let age_ms = self.clock.now_ms() - claims.issued_at_ms;
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        if age_ms > max_age_ms || age_ms < -CLOCK_SKEW_MS {
            return false;
        }

        claims.bound_user == ANONYMOUS || Some(claims.bound_user) == user_id
    }

    /// Validate the token carried by a request. Safe methods always pass.
    /// A missing or invalid token on a state-changing request is recorded as a
    /// CSRF violation against `identifier`.
    pub async fn validate_request(
        &self,
        method: &Method,
        headers: &HeaderMap,
        uri: &Uri,
        expected_user_id: Option<&str>,
        identifier: &str,
    ) -> bool {
        if !is_state_changing(method) {
            return true;
        }
        let Some(token) = extract_token(headers, uri) else {
            self.logger
                .security_violation(
                    ViolationKind::CsrfViolation,
                    identifier,
                    &format!("missing CSRF token on {method} {}", uri.path()),
                )
                .await;
            return false;
        };
        if self.validate_token(&token, expected_user_id, self.max_age) {
            return true;
        }
        self.logger
            .security_violation(
                ViolationKind::CsrfViolation,
                identifier,
                &format!("invalid CSRF token on {method} {}", uri.path()),
            )
            .await;
        false
    }
}
