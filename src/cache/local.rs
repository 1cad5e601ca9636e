//! In-process data servers built on a [`RecordStore`].
//!
//! [`LocalDataServer`] owns one record store, one lock table and the
//! background jobs that keep them tidy (the expiry sweeper and, when
//! persistence is on, the periodic snapshot writer). It answers every call from
//! local memory; the only suspension points are lock waits and snapshot I/O.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Number, Value};
use tracing::{debug, info, warn};

use super::config::{DataServerConfig, NamespaceOptions, SetOptions};
use super::error::{DataServerError, Result, key_label};
use super::lock::{LockTable, LockToken};
use super::record::{Record, validate_key, validate_namespace};
use super::snapshot::{self, Snapshot};
use super::store::{HashRecordStore, IndexedRecordStore, RecordStore};
use super::DataServer;
use crate::background::{self, TaskSet};

/// Data server over the plain nested hash map store.
pub type MemoryDataServer = LocalDataServer<HashRecordStore>;

/// Data server over the ordered store with an expiry index.
pub type MapDataServer = LocalDataServer<IndexedRecordStore>;

// State shared with the background jobs.
struct Shared<S> {
    config: DataServerConfig,
    store: Mutex<S>,
    locks: LockTable,
    stopped: AtomicBool,
}

impl<S: RecordStore> Shared<S> {
    fn sweep(&self) -> usize {
        let removed = self.store.lock().sweep(Utc::now());
        self.locks.purge();
        removed
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let store = self.store.lock();
            Snapshot::capture(&*store, Utc::now())
        };
        snapshot::write(&self.config.snapshot_path(), &snapshot).await
    }

    // The read-modify-write half of increment/decrement; the caller holds the key lock.
    fn apply_delta(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
        ttl: Option<u64>,
    ) -> Result<Value> {
        let now = Utc::now();
        let mut store = self.store.lock();

        let mut record = match store.get(namespace, key, now) {
            Some(existing) => {
                let mut record = existing.clone();
                if let Some(ttl) = ttl {
                    record.refresh(Some(ttl), now);
                }
                record
            }
            None if self.config.creates_missing_counters() => Record::new(
                Value::from(0),
                ttl.unwrap_or(self.config.default_ttl()),
                true,
                now,
            ),
            None => return Err(DataServerError::NotFound(key_label(namespace, key))),
        };

        let next = add(&record.value, amount, namespace, key)?;
        record.value = next.clone();
        record.updated_at = now;
        store.set(
            namespace,
            key,
            record,
            self.config.creates_namespaces_implicitly(),
        )?;
        Ok(next)
    }
}

// Adds `amount` to a stored number. Integers stay integers, floats stay floats.
fn add(value: &Value, amount: i64, namespace: &str, key: &str) -> Result<Value> {
    let Value::Number(number) = value else {
        return Err(DataServerError::NotANumber(key_label(namespace, key)));
    };

    if number.is_f64() {
        let sum = number.as_f64().unwrap_or_default() + amount as f64;
        return Number::from_f64(sum).map(Value::Number).ok_or_else(|| {
            DataServerError::InvalidArgument(format!(
                "counter {} is no longer finite",
                key_label(namespace, key)
            ))
        });
    }

    let base = number
        .as_i64()
        .map(i128::from)
        .or_else(|| number.as_u64().map(i128::from))
        .ok_or_else(|| DataServerError::NotANumber(key_label(namespace, key)))?;
    let sum = base + i128::from(amount);

    if let Ok(sum) = i64::try_from(sum) {
        Ok(Value::from(sum))
    } else if let Ok(sum) = u64::try_from(sum) {
        Ok(Value::from(sum))
    } else {
        Err(DataServerError::InvalidArgument(format!(
            "counter {} would overflow",
            key_label(namespace, key)
        )))
    }
}

/// A data server answering from an in-process [`RecordStore`].
pub struct LocalDataServer<S: RecordStore> {
    shared: Arc<Shared<S>>,
    tasks: TaskSet,
    startup_error: Option<DataServerError>,
}

impl<S: RecordStore> LocalDataServer<S> {
    /// Builds a running data server from `config`.
    ///
    /// When persistence is on, the snapshot is loaded before this returns, so
    /// the first call already sees the restored records. A snapshot that cannot
    /// be read does not stop the server from starting: the file is moved to
    /// `<snapshot>.corrupt`, the server starts empty and the failure is kept in
    /// [`DataServer::startup_error`].
    ///
    /// Must be called from within a Tokio runtime: the sweeper and the snapshot
    /// writer are spawned here.
    ///
    /// # Errors
    ///
    /// [`DataServerError::InvalidArgument`] when the configuration fails validation,
    /// [`DataServerError::Io`] when an unreadable snapshot cannot be moved aside.
    pub async fn configure(config: DataServerConfig) -> Result<Self> {
        config.validate()?;

        let mut store = S::default();
        let mut startup_error = None;

        if config.persists() {
            let path = config.snapshot_path();
            match snapshot::read(&path).await {
                Ok(Some(snapshot)) => {
                    let restored = snapshot.restore_into(&mut store, Utc::now());
                    info!(path = %path.display(), restored, "snapshot loaded");
                }
                Ok(None) => debug!(path = %path.display(), "no snapshot to load"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "starting empty: snapshot unusable");
                    // later snapshot writes must not replace the unreadable file
                    snapshot::quarantine(&path).await?;
                    startup_error = Some(e);
                }
            }
        }

        let shared = Arc::new(Shared {
            locks: LockTable::new(config.locking(), config.lock_lifetime()),
            store: Mutex::new(store),
            stopped: AtomicBool::new(false),
            config,
        });

        let tasks = TaskSet::new();
        tasks.push(background::every(
            "sweeper",
            shared.config.sweep_every(),
            Arc::downgrade(&shared),
            |shared: Arc<Shared<S>>| async move {
                let removed = shared.sweep();
                if removed > 0 {
                    debug!(removed, "expired records swept");
                }
            },
        ));
        if shared.config.persists() {
            tasks.push(background::every(
                "snapshot",
                shared.config.persist_every(),
                Arc::downgrade(&shared),
                |shared: Arc<Shared<S>>| async move {
                    if let Err(e) = shared.persist().await {
                        warn!(error = %e, "periodic snapshot failed");
                    }
                },
            ));
        }

        info!(
            persist = shared.config.persists(),
            path = %shared.config.path().display(),
            default_ttl = shared.config.default_ttl(),
            "data server configured"
        );

        Ok(Self {
            shared,
            tasks,
            startup_error,
        })
    }

    /// Drops a namespace and all of its records.
    pub fn delete_namespace(&self, namespace: &str) -> Result<bool> {
        self.ensure_running()?;
        validate_namespace(namespace)?;
        Ok(self.shared.store.lock().remove_namespace(namespace))
    }

    /// Runs one sweeper pass immediately, returning the number of records removed.
    pub fn sweep_now(&self) -> usize {
        self.shared.sweep()
    }

    /// Writes a snapshot immediately, regardless of the `persist` option.
    pub async fn persist_now(&self) -> Result<()> {
        self.shared.persist().await
    }

    /// Records physically held, including expired ones not yet swept.
    pub fn stored_len(&self) -> usize {
        self.shared.store.lock().len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(DataServerError::BackendUnavailable(
                "data server has been stopped".into(),
            ));
        }
        Ok(())
    }

    fn lock_wait(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.shared.config.lock_wait())
    }

    async fn adjust(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
        ttl: Option<u64>,
    ) -> Result<Value> {
        self.ensure_running()?;
        validate_key(namespace, key)?;

        let token = self
            .shared
            .locks
            .acquire(namespace, key, self.lock_wait(None))
            .await?;
        let result = self.shared.apply_delta(namespace, key, amount, ttl);

        if let Err(e) = self.shared.locks.release(namespace, key, &token) {
            // the grant lapsed mid-update; the write itself already happened
            warn!(namespace, key, error = %e, "counter lock expired before release");
        }
        result
    }
}

#[async_trait]
impl<S: RecordStore> DataServer for LocalDataServer<S> {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        self.ensure_running()?;
        validate_key(namespace, key)?;
        let store = self.shared.store.lock();
        Ok(store
            .get(namespace, key, Utc::now())
            .map(|record| record.value.clone()))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<u64>,
        options: SetOptions,
    ) -> Result<()> {
        self.ensure_running()?;
        validate_key(namespace, key)?;

        let ttl = ttl.unwrap_or(self.shared.config.default_ttl());
        let record = Record::new(value, ttl, options.persist, Utc::now());
        self.shared.store.lock().set(
            namespace,
            key,
            record,
            self.shared.config.creates_namespaces_implicitly(),
        )
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.ensure_running()?;
        validate_key(namespace, key)?;
        self.shared.store.lock().delete(namespace, key);
        Ok(())
    }

    async fn lock(
        &self,
        namespace: &str,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<LockToken> {
        self.ensure_running()?;
        validate_key(namespace, key)?;
        self.shared
            .locks
            .acquire(namespace, key, self.lock_wait(timeout))
            .await
    }

    async fn unlock(&self, namespace: &str, key: &str, token: &LockToken) -> Result<()> {
        self.ensure_running()?;
        validate_key(namespace, key)?;
        self.shared.locks.release(namespace, key, token)
    }

    async fn increment(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
        ttl: Option<u64>,
    ) -> Result<Value> {
        self.adjust(namespace, key, amount, ttl).await
    }

    async fn decrement(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
        ttl: Option<u64>,
    ) -> Result<Value> {
        let amount = amount.checked_neg().ok_or_else(|| {
            DataServerError::InvalidArgument(format!("cannot decrement by {amount}"))
        })?;
        self.adjust(namespace, key, amount, ttl).await
    }

    async fn touch(&self, namespace: &str, key: &str, ttl: Option<u64>) -> Result<bool> {
        self.ensure_running()?;
        validate_key(namespace, key)?;
        Ok(self
            .shared
            .store
            .lock()
            .touch(namespace, key, ttl, Utc::now()))
    }

    async fn create_namespace(&self, namespace: &str, options: NamespaceOptions) -> Result<()> {
        self.ensure_running()?;
        validate_namespace(namespace)?;
        let idempotent = options
            .idempotent
            .unwrap_or(self.shared.config.namespaces_idempotent());
        self.shared
            .store
            .lock()
            .create_namespace(namespace, idempotent)
    }

    async fn exists_namespace(&self, namespace: &str) -> Result<bool> {
        self.ensure_running()?;
        validate_namespace(namespace)?;
        Ok(self.shared.store.lock().exists_namespace(namespace))
    }

    async fn stop(&self) -> Result<()> {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.tasks.abort_all();

        if self.shared.config.persists() {
            self.shared.persist().await?;
        }
        info!(persist = self.shared.config.persists(), "data server stopped");
        Ok(())
    }

    fn config(&self) -> &DataServerConfig {
        &self.shared.config
    }

    fn startup_error(&self) -> Option<&DataServerError> {
        self.startup_error.as_ref()
    }
}
