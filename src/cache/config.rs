//! Data server configuration.
//!
//! A [`DataServerConfig`] is fixed once a backend has been configured. It can be
//! assembled with the chained builder methods or deserialized from the
//! JSON-compatible option object a host framework passes around:
//!
//! ```
//! use dataserver::cache::DataServerConfig;
//!
//! let from_builder = DataServerConfig::new().ttl(60).persist(true);
//! let from_json: DataServerConfig =
//!     serde_json::from_str(r#"{ "ttl": 60, "persist": true }"#).unwrap();
//!
//! assert_eq!(from_builder.default_ttl(), from_json.default_ttl());
//! assert!(from_json.persists());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DataServerError, Result};

/// Snapshot file name used when none is configured.
pub const DEFAULT_SNAPSHOT_FILE: &str = "dataserver.snapshot.json";

/// Name of the worker executable looked up next to the current executable.
pub const WORKER_PROGRAM: &str = "dataserver-worker";

/// What `lock` does when the key is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LockMode {
    /// Queue behind the holder (FIFO) until the wait timeout elapses.
    #[default]
    Wait,
    /// Fail immediately with `Locked`.
    FailFast,
}

/// Options recognized by every data server backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataServerConfig {
    ttl: u64,
    persist: bool,
    #[serde(alias = "cachingFolder")]
    persist_path: PathBuf,
    snapshot_file: String,
    persist_interval_ms: u64,
    lock_timeout_ms: u64,
    lock_ttl_ms: u64,
    lock_mode: LockMode,
    sweep_interval_ms: u64,
    implicit_namespaces: bool,
    idempotent_namespaces: bool,
    create_missing_counters: bool,
    request_timeout_ms: u64,
    worker_program: Option<PathBuf>,
}

impl Default for DataServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DataServerConfig {
    /// Creates a configuration with the default values:
    ///
    /// | Option                  | Default                    |
    /// |-------------------------|----------------------------|
    /// | `ttl`                   | `0` (records never expire) |
    /// | `persist`               | `false`                    |
    /// | `persistPath`           | platform temp directory    |
    /// | `persistIntervalMs`     | `10000`                    |
    /// | `lockTimeoutMs`         | `5000`                     |
    /// | `lockTtlMs`             | `10000`                    |
    /// | `lockMode`              | `wait`                     |
    /// | `sweepIntervalMs`       | `5000`                     |
    /// | `implicitNamespaces`    | `true`                     |
    /// | `idempotentNamespaces`  | `true`                     |
    /// | `createMissingCounters` | `true`                     |
    /// | `requestTimeoutMs`      | `5000`                     |
    pub fn new() -> Self {
        Self {
            ttl: 0,
            persist: false,
            persist_path: std::env::temp_dir(),
            snapshot_file: DEFAULT_SNAPSHOT_FILE.to_owned(),
            persist_interval_ms: 10_000,
            lock_timeout_ms: 5_000,
            lock_ttl_ms: 10_000,
            lock_mode: LockMode::Wait,
            sweep_interval_ms: 5_000,
            implicit_namespaces: true,
            idempotent_namespaces: true,
            create_missing_counters: true,
            request_timeout_ms: 5_000,
            worker_program: None,
        }
    }

    /// Default record lifetime in seconds, used when `set` receives no ttl.
    pub fn ttl(mut self, seconds: u64) -> Self {
        self.ttl = seconds;
        self
    }

    /// Enables snapshot loading at start and snapshot writing on interval and stop.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Directory holding the snapshot (and, for the filesystem backend, the worker socket).
    pub fn persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = path.into();
        self
    }

    pub fn snapshot_file(mut self, name: impl Into<String>) -> Self {
        self.snapshot_file = name.into();
        self
    }

    /// Periodic snapshot interval; `Duration::ZERO` writes only on stop.
    pub fn persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval_ms = millis(interval);
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = millis(timeout);
        self
    }

    /// How long a granted lock stays valid without being released.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_ms = millis(ttl);
        self
    }

    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Expiry sweeper period; `Duration::ZERO` disables the sweeper.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = millis(interval);
        self
    }

    pub fn implicit_namespaces(mut self, enabled: bool) -> Self {
        self.implicit_namespaces = enabled;
        self
    }

    pub fn idempotent_namespaces(mut self, enabled: bool) -> Self {
        self.idempotent_namespaces = enabled;
        self
    }

    pub fn create_missing_counters(mut self, enabled: bool) -> Self {
        self.create_missing_counters = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = millis(timeout);
        self
    }

    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn default_ttl(&self) -> u64 {
        self.ttl
    }

    pub fn persists(&self) -> bool {
        self.persist
    }

    pub fn path(&self) -> &Path {
        &self.persist_path
    }

    /// Full path of the snapshot artifact.
    pub fn snapshot_path(&self) -> PathBuf {
        self.persist_path.join(&self.snapshot_file)
    }

    pub fn persist_every(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_lifetime(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn locking(&self) -> LockMode {
        self.lock_mode
    }

    pub fn sweep_every(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn creates_namespaces_implicitly(&self) -> bool {
        self.implicit_namespaces
    }

    pub fn namespaces_idempotent(&self) -> bool {
        self.idempotent_namespaces
    }

    pub fn creates_missing_counters(&self) -> bool {
        self.create_missing_counters
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The worker executable: the configured program, or `dataserver-worker`
    /// next to the running executable.
    pub fn worker_executable(&self) -> Result<PathBuf> {
        if let Some(program) = &self.worker_program {
            return Ok(program.clone());
        }

        let current = std::env::current_exe()?;
        let dir = current.parent().ok_or_else(|| {
            DataServerError::InvalidArgument(format!(
                "cannot locate {WORKER_PROGRAM}: {} has no parent directory",
                current.display()
            ))
        })?;
        Ok(dir.join(WORKER_PROGRAM))
    }

    /// Checks the options that cannot be corrected silently.
    ///
    /// # Errors
    ///
    /// Returns [`DataServerError::InvalidArgument`] for an empty snapshot file
    /// name or a zero lock lifetime.
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_file.trim().is_empty() {
            return Err(DataServerError::InvalidArgument(
                "snapshotFile must not be empty".into(),
            ));
        }
        if self.lock_ttl_ms == 0 {
            return Err(DataServerError::InvalidArgument(
                "lockTtlMs must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Per-call options for `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SetOptions {
    /// Whether the record is included in snapshots.
    pub persist: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

/// Per-call options for `create_namespace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceOptions {
    /// Overrides `idempotentNamespaces` for this call.
    pub idempotent: Option<bool>,
}

impl NamespaceOptions {
    pub fn idempotent(idempotent: bool) -> Self {
        Self {
            idempotent: Some(idempotent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let config = DataServerConfig::new();
        assert_eq!(config.default_ttl(), 0);
        assert!(!config.persists());
        assert_eq!(config.path(), std::env::temp_dir());
        assert_eq!(config.lock_wait(), Duration::from_secs(5));
        assert_eq!(config.locking(), LockMode::Wait);
        assert!(config.creates_namespaces_implicitly());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn caching_folder_is_an_alias_of_persist_path() {
        let config: DataServerConfig =
            serde_json::from_str(r#"{ "cachingFolder": "/var/cache/app" }"#).unwrap();
        assert_eq!(config.path(), Path::new("/var/cache/app"));
        assert_eq!(
            config.snapshot_path(),
            Path::new("/var/cache/app").join(DEFAULT_SNAPSHOT_FILE)
        );
    }

    #[test]
    fn json_options_override_defaults() {
        let config: DataServerConfig = serde_json::from_str(
            r#"{ "ttl": 100, "lockTimeoutMs": 50, "lockMode": "failFast", "sweepIntervalMs": 0 }"#,
        )
        .unwrap();
        assert_eq!(config.default_ttl(), 100);
        assert_eq!(config.lock_wait(), Duration::from_millis(50));
        assert_eq!(config.locking(), LockMode::FailFast);
        assert_eq!(config.sweep_every(), Duration::ZERO);
        // untouched keys keep their defaults
        assert!(config.namespaces_idempotent());
    }

    #[test]
    fn unknown_options_are_ignored() {
        let config: DataServerConfig =
            serde_json::from_str(r#"{ "persist": false, "somethingElse": 1 }"#).unwrap();
        assert!(!config.persists());
    }

    #[test]
    fn validate_rejects_zero_lock_ttl() {
        let config = DataServerConfig::new().lock_ttl(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(DataServerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn configured_worker_program_wins() {
        let config = DataServerConfig::new().worker_program("/opt/bin/worker");
        assert_eq!(
            config.worker_executable().unwrap(),
            PathBuf::from("/opt/bin/worker")
        );
    }

    #[test]
    fn set_options_persist_by_default() {
        assert!(SetOptions::default().persist);
        let opts: SetOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.persist);
    }
}
