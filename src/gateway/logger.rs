//! Redacting log sink and security violation log.
//!
//! Every line goes through `tracing`. Before anything is emitted, bearer
//! tokens, JWTs, passwords and token-like fields are replaced with
//! `[REDACTED]`, e-mail addresses are masked (`jo**@example.com`) and IP
//! addresses anywhere in the line are truncated unless the deployment allows
//! them.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, str::FromStr, sync::Arc, sync::LazyLock};
use tracing::{debug, error, info, warn};

use super::{clock::Clock, store::Store};

pub const REDACTED: &str = "[REDACTED]";

const SECURITY_TARGET: &str = "storegate::security";
const MAX_VIOLATIONS_PER_IDENTIFIER: usize = 50;

static TOKEN_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)(bearer\s+)[A-Za-z0-9\-._~+/]+=*", "${1}[REDACTED]"),
        (
            r#"(?i)("(?:password|access_token|refresh_token|token|csrf_token|api_key|apikey|secret)"\s*:\s*")[^"]*""#,
            "${1}[REDACTED]\"",
        ),
        (
            r"(?i)\b(password|access_token|refresh_token|token|csrf_token|api_key|apikey|secret)=[^&\s;]+",
            "${1}=[REDACTED]",
        ),
        (r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*", REDACTED),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

// IPv6 first so the IPv4 pattern never sees half of a mapped address.
static IP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:[0-9a-f]{1,4}:){7}[0-9a-f]{1,4}\b|\b(?:[0-9a-f]{1,4}:){1,6}:(?:[0-9a-f]{1,4}(?::[0-9a-f]{1,4}){0,5})?",
        r"\b(?:\d{1,3}\.){3}\d{1,3}\b",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static EMAIL_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").ok());

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogVerbosity {
    /// Warnings, errors and violations only, without context.
    Minimal,
    #[default]
    Standard,
    /// Standard plus debug entries.
    Detailed,
}

impl FromStr for LogVerbosity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "minimal" => Ok(Self::Minimal),
            "standard" => Ok(Self::Standard),
            "detailed" => Ok(Self::Detailed),
            other => Err(format!("invalid log detail: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    SecurityViolation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    RateLimit,
    CsrfViolation,
    SuspiciousActivity,
    InvalidSession,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateLimit => "rate_limit",
            Self::CsrfViolation => "csrf_violation",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::InvalidSession => "invalid_session",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub identifier: String,
    pub timestamp_ms: i64,
    pub details: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoggerSettings {
    pub verbosity: LogVerbosity,
    pub include_ip: bool,
    /// Allows raw e-mail addresses in log lines. Tokens and passwords are
    /// always redacted.
    pub include_sensitive: bool,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            verbosity: LogVerbosity::Standard,
            include_ip: false,
            include_sensitive: false,
        }
    }
}

/// Mask the local part of an e-mail address: `john@example.com` becomes
/// `jo**@example.com`.
#[must_use]
pub fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.trim().split_once('@') else {
        return "***".to_string();
    };
    let keep = if local.chars().count() > 2 { 2 } else { 1 };
    let prefix: String = local.chars().take(keep).collect();
    format!("{prefix}**@{domain}")
}

/// Keep the network part of an address: `203.0.113.7` becomes `203.0.113.x`.
#[must_use]
pub fn mask_ip(ip: &str) -> String {
    if let Some((network, _)) = ip.rsplit_once('.') {
        if !ip.contains(':') {
            return format!("{network}.x");
        }
    }
    if ip.contains(':') {
        let head = ip.split("::").next().unwrap_or_default();
        let groups: Vec<&str> = head
            .split(':')
            .filter(|group| !group.is_empty())
            .take(3)
            .collect();
        return format!("{}::x", groups.join(":"));
    }
    "x".to_string()
}

/// Strip tokens, passwords and JWTs.
#[must_use]
pub fn redact(text: &str) -> Cow<'_, str> {
    let mut output = Cow::Borrowed(text);
    for (pattern, replacement) in TOKEN_PATTERNS.iter() {
        if pattern.is_match(&output) {
            output = Cow::Owned(pattern.replace_all(&output, *replacement).into_owned());
        }
    }
    output
}

fn mask_ips(text: &str) -> Cow<'_, str> {
    let mut output = Cow::Borrowed(text);
    for pattern in IP_PATTERNS.iter() {
        if pattern.is_match(&output) {
            output = Cow::Owned(
                pattern
                    .replace_all(&output, |caps: &Captures| mask_ip(&caps[0]))
                    .into_owned(),
            );
        }
    }
    output
}

fn mask_emails(text: &str) -> Cow<'_, str> {
    match EMAIL_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(text, |caps: &Captures| mask_email(&caps[0])),
        None => Cow::Borrowed(text),
    }
}

pub struct SecureLogger {
    settings: LoggerSettings,
    violations: Arc<dyn Store<Vec<SecurityViolation>>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SecureLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureLogger")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SecureLogger {
    pub fn new(
        settings: LoggerSettings,
        violations: Arc<dyn Store<Vec<SecurityViolation>>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            violations,
            clock,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &LoggerSettings {
        &self.settings
    }

    /// Apply every redaction rule allowed by the settings.
    #[must_use]
    pub fn sanitize(&self, text: &str) -> String {
        let mut output = redact(text);
        if !self.settings.include_sensitive {
            output = Cow::Owned(mask_emails(&output).into_owned());
        }
        if !self.settings.include_ip {
            output = Cow::Owned(mask_ips(&output).into_owned());
        }
        output.into_owned()
    }

    #[must_use]
    pub fn display_ip(&self, ip: &str) -> String {
        if self.settings.include_ip {
            ip.to_string()
        } else {
            mask_ip(ip)
        }
    }

    fn render_context(&self, context: &[(&str, &str)]) -> String {
        if self.settings.verbosity == LogVerbosity::Minimal {
            return String::new();
        }
        context
            .iter()
            .map(|(key, value)| {
                let value = match *key {
                    "ip" => self.display_ip(value),
                    _ => self.sanitize(value),
                };
                format!("{key}={value}")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn log(&self, level: LogLevel, message: &str, context: &[(&str, &str)]) {
        if level == LogLevel::Info && self.settings.verbosity == LogVerbosity::Minimal {
            return;
        }
        let message = self.sanitize(message);
        let context = self.render_context(context);
        match level {
            LogLevel::Info => info!(context = %context, "{message}"),
            LogLevel::Warning => warn!(context = %context, "{message}"),
            LogLevel::Error => error!(context = %context, "{message}"),
            LogLevel::SecurityViolation => {
                warn!(target: SECURITY_TARGET, context = %context, "{message}");
            }
        }
    }

    pub fn debug(&self, message: &str, context: &[(&str, &str)]) {
        if self.settings.verbosity == LogVerbosity::Detailed {
            let message = self.sanitize(message);
            let context = self.render_context(context);
            debug!(context = %context, "{message}");
        }
    }

    pub fn info(&self, message: &str, context: &[(&str, &str)]) {
        self.log(LogLevel::Info, message, context);
    }

    pub fn warning(&self, message: &str, context: &[(&str, &str)]) {
        self.log(LogLevel::Warning, message, context);
    }

    pub fn error(&self, message: &str, context: &[(&str, &str)]) {
        self.log(LogLevel::Error, message, context);
    }

    /// Emit a violation on the security channel and append it to the bounded
    /// per-identifier history. Never fails; store errors are logged.
    pub async fn security_violation(&self, kind: ViolationKind, identifier: &str, details: &str) {
        let violation = SecurityViolation {
            kind,
            identifier: identifier.to_string(),
            timestamp_ms: self.clock.now_ms(),
            details: self.sanitize(details),
        };

        self.log(
            LogLevel::SecurityViolation,
            &format!("security violation: {kind}"),
            &[("identifier", identifier), ("details", violation.details.as_str())],
        );

        let result = self
            .violations
            .update(
                identifier,
                Box::new(move |current| {
                    let mut history = current.unwrap_or_default();
                    history.push(violation);
                    if history.len() > MAX_VIOLATIONS_PER_IDENTIFIER {
                        let excess = history.len() - MAX_VIOLATIONS_PER_IDENTIFIER;
                        history.drain(..excess);
                    }
                    Some(history)
                }),
            )
            .await;
        if let Err(err) = result {
            error!("Failed to record security violation: {err}");
        }
    }

    /// Violations recorded for `identifier`, oldest first.
    pub async fn violations(&self, identifier: &str) -> Vec<SecurityViolation> {
        match self.violations.get(identifier).await {
            Ok(history) => history.unwrap_or_default(),
            Err(err) => {
                error!("Failed to read security violations: {err}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{clock::ManualClock, store::MemoryStore};

    fn logger(settings: LoggerSettings) -> SecureLogger {
        SecureLogger::new(
            settings,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    #[test]
    fn mask_email_keeps_two_chars() {
        assert_eq!(mask_email("john@example.com"), "jo**@example.com");
        assert_eq!(mask_email("al@example.com"), "a**@example.com");
        assert_eq!(mask_email("not-an-email"), "***");
    }

    #[test]
    fn mask_ip_truncates() {
        assert_eq!(mask_ip("203.0.113.7"), "203.0.113.x");
        assert_eq!(mask_ip("2001:db8:85a3::8a2e:370:7334"), "2001:db8:85a3::x");
        assert_eq!(mask_ip("2001:db8::1"), "2001:db8::x");
        assert_eq!(mask_ip("::1"), "::x");
    }

    #[test]
    fn sanitize_masks_ips_inside_text() {
        let strict = logger(LoggerSettings::default());
        assert_eq!(
            strict.sanitize("blocked ip:203.0.113.7 and login:198.51.100.4:jo**@example.com"),
            "blocked ip:203.0.113.x and login:198.51.100.x:jo**@example.com"
        );
        assert_eq!(
            strict.sanitize("blocked ip:2001:db8::1 at 12:30:45"),
            "blocked ip:2001:db8::x at 12:30:45"
        );

        let permissive = logger(LoggerSettings {
            include_ip: true,
            ..LoggerSettings::default()
        });
        assert_eq!(permissive.sanitize("ip:203.0.113.7"), "ip:203.0.113.7");
    }

    #[test]
    fn redact_strips_tokens() {
        let line = r#"Authorization: Bearer abc.def-123 {"password":"hunter2","access_token":"xyz"} refresh_token=r1&x=1"#;
        let redacted = redact(line);
        assert!(!redacted.contains("abc.def-123"));
        assert!(!redacted.contains("hunter2"));
        assert!(!redacted.contains("xyz"));
        assert!(!redacted.contains("r1&"));
        assert!(redacted.contains("x=1"));
    }

    #[test]
    fn redact_strips_jwts() {
        let line = "token eyJhbGciOiJIUzI1NiJ9.eyJzdWIiOiIxIn0.sig rest";
        assert_eq!(redact(line), "token [REDACTED] rest");
    }

    #[test]
    fn sanitize_masks_emails_unless_allowed() {
        let strict = logger(LoggerSettings::default());
        assert_eq!(
            strict.sanitize("login failed for john@example.com"),
            "login failed for jo**@example.com"
        );

        let permissive = logger(LoggerSettings {
            include_sensitive: true,
            ..LoggerSettings::default()
        });
        assert_eq!(
            permissive.sanitize("login failed for john@example.com password=x"),
            "login failed for john@example.com password=[REDACTED]"
        );
    }

    #[test]
    fn display_ip_respects_setting() {
        let strict = logger(LoggerSettings::default());
        assert_eq!(strict.display_ip("10.1.2.3"), "10.1.2.x");
        let permissive = logger(LoggerSettings {
            include_ip: true,
            ..LoggerSettings::default()
        });
        assert_eq!(permissive.display_ip("10.1.2.3"), "10.1.2.3");
    }

    #[test]
    fn verbosity_parses() {
        assert_eq!("Minimal".parse::<LogVerbosity>(), Ok(LogVerbosity::Minimal));
        assert_eq!(
            "detailed".parse::<LogVerbosity>(),
            Ok(LogVerbosity::Detailed)
        );
        assert!("loud".parse::<LogVerbosity>().is_err());
    }

    #[tokio::test]
    async fn violations_are_bounded_and_redacted() {
        let logger = logger(LoggerSettings::default());
        for i in 0..(MAX_VIOLATIONS_PER_IDENTIFIER + 5) {
            logger
                .security_violation(
                    ViolationKind::CsrfViolation,
                    "1.2.3.4",
                    &format!("attempt {i} token=secret"),
                )
                .await;
        }
        let history = logger.violations("1.2.3.4").await;
        assert_eq!(history.len(), MAX_VIOLATIONS_PER_IDENTIFIER);
        assert_eq!(history[0].details, "attempt 5 token=[REDACTED]");
        assert!(history.iter().all(|v| v.kind == ViolationKind::CsrfViolation));
        assert!(logger.violations("other").await.is_empty());
    }
}
