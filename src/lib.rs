//! # dataserver
//!
//! A pluggable caching key-value store for HTTP middleware pipelines:
//! namespaced records with per-record expiry, exclusive key locks, atomic
//! counters and optional snapshot persistence, behind one async capability
//! trait with in-process and out-of-process backends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dataserver::cache::{Backend, DataServerConfig, SetOptions, build};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DataServerConfig::new().ttl(60).persist(true).persist_path("/tmp/app-cache");
//!     let cache = build(Backend::Memory, config).await?;
//!
//!     cache.set("sessions", "abc", json!({ "user": 1 }), None, SetOptions::default()).await?;
//!     let token = cache.lock("sessions", "abc", None).await?;
//!     cache.unlock("sessions", "abc", &token).await?;
//!
//!     cache.stop().await?;
//!     Ok(())
//! }
//! ```

// ── Core ──────────────────────────────────────────────────────────────────────
pub mod background;
pub mod cache;

// ── Backends and host integration ─────────────────────────────────────────────
pub mod context;
#[cfg(unix)]
pub mod filesystem;
pub mod plugin;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{
    Backend, DataServer, DataServerConfig, DataServerError, LockToken, Result, SetOptions,
    SharedDataServer,
};
pub use plugin::{DataServerHandle, DataServerPlugin};
