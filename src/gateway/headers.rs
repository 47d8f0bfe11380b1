//! Security response headers attached to every gateway response.

use axum::http::{
    header::{
        CONTENT_SECURITY_POLICY, REFERRER_POLICY, STRICT_TRANSPORT_SECURITY,
        X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
    },
    HeaderMap, HeaderValue, Uri,
};

use super::config::ConfigError;

pub const DEFAULT_CONTENT_SECURITY_POLICY: &str = "default-src 'self'; \
script-src 'self' 'unsafe-inline'; style-src 'self' 'unsafe-inline'; \
img-src 'self' data: https:; font-src 'self' data:; connect-src 'self' https:; \
frame-ancestors 'none'; base-uri 'self'; form-action 'self'";

const HSTS: &str = "max-age=31536000; includeSubDomains";
const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Whether the request reached the edge over TLS.
#[must_use]
pub fn is_tls(headers: &HeaderMap, uri: &Uri) -> bool {
    if uri.scheme_str() == Some("https") {
        return true;
    }
    headers
        .get(FORWARDED_PROTO)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

#[derive(Clone, Debug)]
pub struct SecurityHeaders {
    content_security_policy: HeaderValue,
    hsts: bool,
}

impl SecurityHeaders {
    /// `hsts` enables `Strict-Transport-Security` on TLS requests.
    ///
    /// # Errors
    /// Returns an error if the policy is not a valid header value.
    pub fn new(content_security_policy: &str, hsts: bool) -> Result<Self, ConfigError> {
        let content_security_policy = HeaderValue::from_str(content_security_policy)
            .map_err(|err| ConfigError::Invalid(format!("content security policy: {err}")))?;
        Ok(Self {
            content_security_policy,
            hsts,
        })
    }

    #[must_use]
    pub fn hsts(&self) -> bool {
        self.hsts
    }

    /// Overwrite the security headers on `headers`.
    pub fn apply(&self, headers: &mut HeaderMap, tls: bool) {
        headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(
            REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        );
        headers.insert(CONTENT_SECURITY_POLICY, self.content_security_policy.clone());
        if self.hsts && tls {
            headers.insert(STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS));
        }
    }
}

impl Default for SecurityHeaders {
    fn default() -> Self {
        Self {
            content_security_policy: HeaderValue::from_static(DEFAULT_CONTENT_SECURITY_POLICY),
            hsts: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_baseline_headers() {
        let mut headers = HeaderMap::new();
        SecurityHeaders::default().apply(&mut headers, true);
        assert_eq!(headers.get(X_FRAME_OPTIONS), Some(&HeaderValue::from_static("DENY")));
        assert_eq!(
            headers.get(X_CONTENT_TYPE_OPTIONS),
            Some(&HeaderValue::from_static("nosniff"))
        );
        assert!(headers.contains_key(CONTENT_SECURITY_POLICY));
        assert!(headers.contains_key(REFERRER_POLICY));
        assert!(!headers.contains_key(STRICT_TRANSPORT_SECURITY));
    }

    #[test]
    fn hsts_only_over_tls() -> Result<(), ConfigError> {
        let headers = SecurityHeaders::new(DEFAULT_CONTENT_SECURITY_POLICY, true)?;
        let mut plain = HeaderMap::new();
        headers.apply(&mut plain, false);
        assert!(!plain.contains_key(STRICT_TRANSPORT_SECURITY));

        let mut secure = HeaderMap::new();
        headers.apply(&mut secure, true);
        assert!(secure.contains_key(STRICT_TRANSPORT_SECURITY));
        Ok(())
    }

    #[test]
    fn detects_forwarded_tls() {
        let mut headers = HeaderMap::new();
        let uri = Uri::from_static("/admin");
        assert!(!is_tls(&headers, &uri));
        headers.insert(FORWARDED_PROTO, HeaderValue::from_static("HTTPS, http"));
        assert!(is_tls(&headers, &uri));
        assert!(is_tls(&HeaderMap::new(), &Uri::from_static("https://shop.example/")));
    }

    #[test]
    fn invalid_policy_is_rejected() {
        assert!(SecurityHeaders::new("bad\npolicy", false).is_err());
    }
}
