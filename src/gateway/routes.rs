//! Path classification into route classes.
//!
//! Classification only holds if it sees the same path the upstream serves.
//! [`canonical_path`] resolves dot segments, empty segments and percent
//! escapes the way an URL parser would, and the gateway classifies and
//! forwards that form only.

use std::borrow::Cow;

use super::config::ConfigError;

const STATIC_PREFIXES: &[&str] = &["/_next", "/static", "/assets", "/images", "/fonts"];
const STATIC_EXTENSIONS: &[&str] = &[
    "css", "js", "mjs", "map", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "avif", "woff",
    "woff2", "ttf", "otf", "txt", "xml", "webmanifest",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteClassification {
    pub protected: bool,
    pub admin_only: bool,
    pub public_only: bool,
}

impl RouteClassification {
    /// Any session is required to continue.
    #[must_use]
    pub fn requires_session(&self) -> bool {
        self.protected || self.admin_only
    }
}

/// Segment-aware, ASCII case-insensitive prefix match: `/admin` matches
/// `/admin`, `/Admin/x`, not `/administrator`.
#[must_use]
pub fn matches_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    match path.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => {
            let rest = &path[prefix.len()..];
            rest.is_empty() || rest.starts_with('/')
        }
        _ => false,
    }
}

/// Canonical, percent-encoded form of a request path.
///
/// Segments are split on `/` and `\`, decoded, and `.`/`..`/empty segments
/// resolved. `None` when a segment decodes to a separator, a control
/// character or invalid UTF-8; such paths are rejected.
#[must_use]
pub fn canonical_path(raw: &str) -> Option<String> {
    let mut segments: Vec<Cow<'_, str>> = Vec::new();
    for segment in raw.split(['/', '\\']) {
        let decoded = urlencoding::decode(segment).ok()?;
        if decoded.contains(['/', '\\']) || decoded.chars().any(char::is_control) {
            return None;
        }
        match decoded.as_ref() {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(decoded),
        }
    }
    let mut path = String::with_capacity(raw.len());
    for segment in &segments {
        path.push('/');
        path.push_str(&urlencoding::encode(segment));
    }
    if path.is_empty() || (raw.len() > 1 && raw.ends_with(['/', '\\'])) {
        path.push('/');
    }
    Some(path)
}

#[must_use]
pub fn is_static_asset(path: &str) -> bool {
    if STATIC_PREFIXES.iter().any(|prefix| matches_prefix(path, prefix)) {
        return true;
    }
    let last = path.rsplit('/').next().unwrap_or_default();
    last.rsplit_once('.').is_some_and(|(stem, ext)| {
        !stem.is_empty() && STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
    })
}

fn normalize(kind: &str, prefixes: Vec<String>) -> Result<Vec<String>, ConfigError> {
    prefixes
        .into_iter()
        .map(|prefix| {
            let prefix = prefix.trim();
            if !prefix.starts_with('/') {
                return Err(ConfigError::InvalidRoute(format!(
                    "{kind} prefix must start with '/': {prefix}"
                )));
            }
            if prefix == "/" {
                return Ok(prefix.to_string());
            }
            Ok(prefix.trim_end_matches('/').to_string())
        })
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteTable {
    protected: Vec<String>,
    admin_only: Vec<String>,
    public_only: Vec<String>,
}

impl RouteTable {
    /// # Errors
    /// Returns an error when a prefix is not absolute, or when an admin-only
    /// prefix overlaps a public-only one.
    pub fn new(
        protected: Vec<String>,
        admin_only: Vec<String>,
        public_only: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let table = Self {
            protected: normalize("protected", protected)?,
            admin_only: normalize("admin-only", admin_only)?,
            public_only: normalize("public-only", public_only)?,
        };
        for admin in &table.admin_only {
            if let Some(public) = table
                .public_only
                .iter()
                .find(|public| matches_prefix(admin, public) || matches_prefix(public, admin))
            {
                return Err(ConfigError::InvalidRoute(format!(
                    "admin-only prefix {admin} overlaps public-only prefix {public}"
                )));
            }
        }
        Ok(table)
    }

    #[must_use]
    pub fn protected(&self) -> &[String] {
        &self.protected
    }

    #[must_use]
    pub fn admin_only(&self) -> &[String] {
        &self.admin_only
    }

    #[must_use]
    pub fn public_only(&self) -> &[String] {
        &self.public_only
    }

    /// Classify a canonical request path. Admin-only wins over public-only.
    #[must_use]
    pub fn classify(&self, path: &str) -> RouteClassification {
        let decoded = urlencoding::decode(path).unwrap_or(Cow::Borrowed(path));
        let path = decoded.as_ref();
        let any = |set: &[String]| set.iter().any(|prefix| matches_prefix(path, prefix));
        let admin_only = any(&self.admin_only);
        RouteClassification {
            protected: any(&self.protected),
            admin_only,
            public_only: !admin_only && any(&self.public_only),
        }
    }
}
