//! # Storegate
//!
//! `storegate` is the authorization gateway that sits in front of a storefront
//! and its back office. Each request is classified by path and checked before
//! it is passed upstream:
//!
//! - **Rate limits:** failed logins are counted per client IP and per
//!   IP/account pair; a tripped limit answers `429` for the block duration.
//! - **Sessions:** access tokens are validated against the identity provider
//!   and refreshed shortly before they expire. A rejected refresh token signs
//!   the user out.
//! - **Admin routes:** the admin tier is resolved through the privilege
//!   directory and cached for a few minutes. Any failure denies access.
//! - **CSRF:** state-changing requests carry an HMAC token bound to the user.
//!
//! Shared state (attempt history, admin cache, violation log) lives behind a
//! store abstraction: in memory for a single instance, `PostgreSQL` when
//! several gateway instances must agree.

pub mod cli;
pub mod gateway;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
