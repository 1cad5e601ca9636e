//! Caching layer — the data server capability and its in-memory backends.
//!
//! Every backend implements [`DataServer`], so a host holds a
//! [`SharedDataServer`] and never cares which one it got. The implementation is
//! picked explicitly with a [`Backend`] when the store is built:
//!
//! | Backend                 | Implementation             | Records live in              |
//! |-------------------------|----------------------------|------------------------------|
//! | [`Backend::Memory`]     | [`MemoryDataServer`]       | nested hash maps             |
//! | [`Backend::Map`]        | [`MapDataServer`]          | ordered maps + expiry index  |
//! | [`Backend::Filesystem`] | [`FilesystemDataServer`](crate::filesystem::FilesystemDataServer) | a worker process |
//!
//! ```rust,no_run
//! use dataserver::cache::{Backend, DataServerConfig, SetOptions, build};
//! use serde_json::json;
//!
//! # async fn example() -> dataserver::cache::Result<()> {
//! let cache = build(Backend::Memory, DataServerConfig::new().ttl(300)).await?;
//!
//! cache.set("sessions", "abc", json!({ "user": 7 }), None, SetOptions::default()).await?;
//! let hits = cache.increment("stats", "hits", 1, None).await?;
//! assert_eq!(hits, json!(1));
//!
//! cache.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod config;
pub mod error;
pub mod local;
pub mod lock;
pub mod record;
pub mod snapshot;
pub mod store;

pub use config::{DataServerConfig, LockMode, NamespaceOptions, SetOptions};
pub use error::{DataServerError, ErrorKind, Result};
pub use local::{LocalDataServer, MapDataServer, MemoryDataServer};
pub use lock::LockToken;
pub use record::Record;

/// The capability a host framework attaches to each request.
///
/// Operation errors (bad arguments, contention, type mismatches) are returned
/// from the call that caused them. "Not found" is usually not an error:
/// [`get`](Self::get) answers `None` and [`touch`](Self::touch) answers `false`.
#[async_trait]
pub trait DataServer: Send + Sync {
    /// Returns the live value at `namespace/key`.
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    /// Stores `value`, replacing any existing record and restarting its lifetime.
    ///
    /// `ttl` is in seconds; `Some(0)` never expires and `None` uses the
    /// configured default.
    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<u64>,
        options: SetOptions,
    ) -> Result<()>;

    /// Removes the record. Deleting a missing key succeeds.
    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// Takes the exclusive lock on `namespace/key`.
    ///
    /// `timeout` bounds the wait; `None` uses the configured `lockTimeoutMs`.
    async fn lock(&self, namespace: &str, key: &str, timeout: Option<Duration>)
    -> Result<LockToken>;

    /// Releases a lock taken with [`lock`](Self::lock).
    async fn unlock(&self, namespace: &str, key: &str, token: &LockToken) -> Result<()>;

    /// Atomically adds `amount` to the number at `namespace/key` and returns the new value.
    ///
    /// The record keeps its expiry unless `ttl` overrides it.
    async fn increment(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
        ttl: Option<u64>,
    ) -> Result<Value>;

    /// Atomically subtracts `amount`; the additive inverse of [`increment`](Self::increment).
    async fn decrement(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
        ttl: Option<u64>,
    ) -> Result<Value>;

    /// Restarts the record's lifetime (optionally with a new ttl) without changing its value.
    /// Returns `false` when there is no live record.
    async fn touch(&self, namespace: &str, key: &str, ttl: Option<u64>) -> Result<bool>;

    async fn create_namespace(&self, namespace: &str, options: NamespaceOptions) -> Result<()>;

    async fn exists_namespace(&self, namespace: &str) -> Result<bool>;

    /// Stops background work and persists when configured to. Later calls fail
    /// with [`DataServerError::BackendUnavailable`]; stopping twice is harmless.
    async fn stop(&self) -> Result<()>;

    /// The configuration this server was built with.
    fn config(&self) -> &DataServerConfig;

    /// The error met while loading persisted data at start, if any.
    ///
    /// A server whose snapshot could not be read still starts, empty; this is
    /// how the caller finds out.
    fn startup_error(&self) -> Option<&DataServerError> {
        None
    }
}

/// A data server handle shared across tasks.
pub type SharedDataServer = Arc<dyn DataServer>;

/// Selects a data server implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Backend {
    #[default]
    Memory,
    Map,
    Filesystem,
}

/// Builds and configures the data server selected by `backend`.
///
/// # Errors
///
/// Whatever the backend's constructor reports: invalid configuration, or for
/// [`Backend::Filesystem`] a worker that could not be started. The filesystem
/// backend is only available on Unix; elsewhere it reports
/// [`DataServerError::BackendUnavailable`].
pub async fn build(backend: Backend, config: DataServerConfig) -> Result<SharedDataServer> {
    match backend {
        Backend::Memory => Ok(Arc::new(MemoryDataServer::configure(config).await?)),
        Backend::Map => Ok(Arc::new(MapDataServer::configure(config).await?)),
        #[cfg(unix)]
        Backend::Filesystem => Ok(Arc::new(
            crate::filesystem::FilesystemDataServer::set_up(config).await?,
        )),
        #[cfg(not(unix))]
        Backend::Filesystem => Err(DataServerError::BackendUnavailable(
            "the filesystem backend needs Unix domain sockets".into(),
        )),
    }
}
