//! Keyed state shared between concurrent requests.
//!
//! The rate limiter history, the admin status cache and the security violation
//! log all sit behind [`Store`]. [`MemoryStore`] keeps everything in the current
//! process and is only correct for single-instance deployments; [`PgStore`]
//! shares state through PostgreSQL so limits and revocations hold across
//! instances.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgStore, ensure_schema};

use async_trait::async_trait;
use std::time::Duration;

/// Read-modify-write step applied atomically by [`Store::update`].
/// Returning `None` removes the entry.
pub type Updater<V> = Box<dyn FnOnce(Option<V>) -> Option<V> + Send>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[async_trait]
pub trait Store<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, StoreError>;

    async fn set(&self, key: &str, value: V) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Drop entries not written for longer than `max_idle` and return how
    /// many were removed.
    async fn purge_idle(&self, max_idle: Duration) -> Result<u64, StoreError>;

    /// Atomically replace the value for `key` and return the new value.
    ///
    /// No other update for the same key can interleave between the read and
    /// the write.
    async fn update(&self, key: &str, f: Updater<V>) -> Result<Option<V>, StoreError>;
}
