//! The host side of the filesystem backend.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command as Process};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{self, Command, Lookup, Status};
use super::worker::is_listening;
use super::{READY_LINE, SOCKET_FILE};
use crate::cache::{
    DataServer, DataServerConfig, DataServerError, LockToken, NamespaceOptions, Result,
    SetOptions,
};

/// A data server whose records live in a worker process.
///
/// Every call opens a fresh connection to the worker's socket and is bounded
/// by `requestTimeoutMs` (plus the lock wait for `lock`, `increment` and
/// `decrement`). A worker that cannot be reached, answers late, or answers
/// with garbage surfaces as [`DataServerError::BackendUnavailable`]; the
/// coordinator never falls back to an empty store.
pub struct FilesystemDataServer {
    config: DataServerConfig,
    socket_path: PathBuf,
    child: Mutex<Option<Child>>,
    stopped: AtomicBool,
    /// Whether [`stop`](DataServer::stop) asks the worker to exit.
    shuts_down_worker: bool,
    startup_error: Option<DataServerError>,
}

impl FilesystemDataServer {
    /// The socket a worker for `config` listens on.
    pub fn socket_path_for(config: &DataServerConfig) -> PathBuf {
        config.path().join(SOCKET_FILE)
    }

    /// Spawns the worker program and waits until it reports ready.
    ///
    /// When a worker already answers on the folder's socket it is reused
    /// instead, and [`stop`](DataServer::stop) leaves it running.
    ///
    /// # Errors
    ///
    /// [`DataServerError::InvalidArgument`] for an invalid configuration,
    /// [`DataServerError::BackendUnavailable`] when the worker cannot be
    /// started or does not become ready within `requestTimeoutMs`.
    pub async fn set_up(config: DataServerConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(config.path()).await?;

        let socket_path = Self::socket_path_for(&config);
        if is_listening(&socket_path).await {
            info!(socket = %socket_path.display(), "reusing running data server worker");
            return Self::attach(socket_path, config).await;
        }

        let program = config.worker_executable()?;
        let encoded = serde_json::to_string(&config)
            .map_err(|e| DataServerError::InvalidArgument(e.to_string()))?;

        let mut child = Process::new(&program)
            .arg("--socket")
            .arg(&socket_path)
            .arg("--config")
            .arg(&encoded)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DataServerError::BackendUnavailable(format!(
                    "cannot start {}: {e}",
                    program.display()
                ))
            })?;

        if let Err(e) = wait_ready(&mut child, config.request_deadline()).await {
            warn!(program = %program.display(), error = %e, "worker failed to start");
            child.start_kill().ok();
            return Err(e);
        }

        info!(
            pid = child.id(),
            socket = %socket_path.display(),
            "data server worker started"
        );

        let mut server = Self::connect(socket_path, config);
        *server.child.get_mut() = Some(child);
        server.startup_error = server.status().await?.startup_error.map(|e| e.into_error());
        if let Some(e) = &server.startup_error {
            warn!(error = %e, "data server worker started with an empty store");
        }
        Ok(server)
    }

    /// Talks to a worker that is already listening on `socket`.
    ///
    /// The returned server does not own the worker; [`stop`](DataServer::stop)
    /// still asks it to shut down.
    pub fn connect(socket: impl Into<PathBuf>, config: DataServerConfig) -> Self {
        Self {
            config,
            socket_path: socket.into(),
            child: Mutex::new(None),
            stopped: AtomicBool::new(false),
            shuts_down_worker: true,
            startup_error: None,
        }
    }

    /// Joins a worker another host started on `socket`.
    ///
    /// Picks up the worker's startup error, and [`stop`](DataServer::stop)
    /// only detaches from it.
    ///
    /// # Errors
    ///
    /// [`DataServerError::BackendUnavailable`] when the worker does not answer.
    pub async fn attach(socket: impl Into<PathBuf>, config: DataServerConfig) -> Result<Self> {
        let mut server = Self::connect(socket, config);
        server.shuts_down_worker = false;
        server.startup_error = server.status().await?.startup_error.map(|e| e.into_error());
        Ok(server)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Asks the worker about the health of its store.
    pub async fn status(&self) -> Result<Status> {
        self.call(Command::Status {}).await
    }

    async fn call<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DataServerError::BackendUnavailable(
                "data server has been stopped".into(),
            ));
        }
        let name = command.name();
        let value = self.exchange(command).await?;
        protocol::payload(value, name)
    }

    /// Sends one command and waits for its reply.
    async fn exchange(&self, command: Command) -> Result<Value> {
        let name = command.name();
        let deadline = self.config.request_deadline() + command.lock_wait(self.config.lock_wait());
        let payload = protocol::encode(&command)?;

        let round_trip = async {
            let mut stream = UnixStream::connect(&self.socket_path).await?;
            stream.write_all(&payload).await?;
            stream.shutdown().await?;
            protocol::read_to_close(&mut stream).await
        };

        let bytes = match tokio::time::timeout(deadline, round_trip).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(command = name, socket = %self.socket_path.display(), error = %e, "worker unreachable");
                return Err(DataServerError::BackendUnavailable(format!("{name}: {e}")));
            }
            Err(_) => {
                warn!(command = name, timeout = ?deadline, "worker did not answer in time");
                return Err(DataServerError::BackendUnavailable(format!(
                    "{name}: no reply within {deadline:?}"
                )));
            }
        };

        debug!(command = name, bytes = bytes.len(), "reply received");
        protocol::decode_reply(&bytes)?.into_result()
    }
}

/// Reads the worker's stdout until its readiness line.
async fn wait_ready(child: &mut Child, deadline: Duration) -> Result<()> {
    let stdout = child.stdout.take().ok_or_else(|| {
        DataServerError::BackendUnavailable("worker stdout is not captured".into())
    })?;
    let mut lines = BufReader::new(stdout).lines();

    match tokio::time::timeout(deadline, lines.next_line()).await {
        Ok(Ok(Some(line))) if line.trim() == READY_LINE => Ok(()),
        Ok(Ok(Some(line))) => Err(DataServerError::BackendUnavailable(format!(
            "unexpected worker output: {line}"
        ))),
        Ok(Ok(None)) => Err(DataServerError::BackendUnavailable(
            "worker exited before becoming ready".into(),
        )),
        Ok(Err(e)) => Err(DataServerError::BackendUnavailable(e.to_string())),
        Err(_) => Err(DataServerError::BackendUnavailable(format!(
            "worker not ready within {deadline:?}"
        ))),
    }
}

#[async_trait]
impl DataServer for FilesystemDataServer {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let lookup: Lookup = self
            .call(Command::Get {
                namespace: namespace.to_owned(),
                key: key.to_owned(),
            })
            .await?;
        Ok(lookup.found.then_some(lookup.value))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<u64>,
        options: SetOptions,
    ) -> Result<()> {
        self.call(Command::Set {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            value,
            ttl,
            options,
        })
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.call(Command::Delete {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
        })
        .await
    }

    async fn lock(
        &self,
        namespace: &str,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<LockToken> {
        self.call(Command::Lock {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        })
        .await
    }

    async fn unlock(&self, namespace: &str, key: &str, token: &LockToken) -> Result<()> {
        self.call(Command::Unlock {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            token: token.clone(),
        })
        .await
    }

    async fn increment(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
        ttl: Option<u64>,
    ) -> Result<Value> {
        self.call(Command::Increment {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            amount,
            ttl,
        })
        .await
    }

    async fn decrement(
        &self,
        namespace: &str,
        key: &str,
        amount: i64,
        ttl: Option<u64>,
    ) -> Result<Value> {
        self.call(Command::Decrement {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            amount,
            ttl,
        })
        .await
    }

    async fn touch(&self, namespace: &str, key: &str, ttl: Option<u64>) -> Result<bool> {
        self.call(Command::Touch {
            namespace: namespace.to_owned(),
            key: key.to_owned(),
            ttl,
        })
        .await
    }

    async fn create_namespace(&self, namespace: &str, options: NamespaceOptions) -> Result<()> {
        self.call(Command::CreateNamespace {
            namespace: namespace.to_owned(),
            options,
        })
        .await
    }

    async fn exists_namespace(&self, namespace: &str) -> Result<bool> {
        self.call(Command::ExistsNamespace {
            namespace: namespace.to_owned(),
        })
        .await
    }

    async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.shuts_down_worker {
            debug!(socket = %self.socket_path.display(), "detached from shared worker");
            return Ok(());
        }

        let outcome = self.exchange(Command::Stop {}).await.map(|_| ());
        if let Err(e) = &outcome {
            warn!(error = %e, "worker did not acknowledge stop");
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return outcome;
        };
        match tokio::time::timeout(self.config.request_deadline(), child.wait()).await {
            Ok(Ok(status)) => info!(%status, "data server worker exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to reap worker"),
            Err(_) => {
                warn!("worker still running after stop, killing it");
                child.kill().await.ok();
            }
        }
        outcome
    }

    fn config(&self) -> &DataServerConfig {
        &self.config
    }

    fn startup_error(&self) -> Option<&DataServerError> {
        self.startup_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;
    use tokio::net::UnixListener;

    use super::*;
    use crate::cache::config::DEFAULT_SNAPSHOT_FILE;
    use crate::filesystem::Worker;

    async fn served(dir: &Path) -> (FilesystemDataServer, tokio::task::JoinHandle<()>) {
        let config = DataServerConfig::new()
            .persist_path(dir)
            .lock_timeout(Duration::from_millis(50));
        let socket = FilesystemDataServer::socket_path_for(&config);
        let worker = Worker::bind(&socket, config.clone()).await.unwrap();
        let serving = tokio::spawn(async move {
            worker.serve().await.unwrap();
        });
        (FilesystemDataServer::connect(socket, config), serving)
    }

    // ── Operations ──────────────────────────────────────────────

    #[tokio::test]
    async fn operations_round_trip_through_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, serving) = served(dir.path()).await;

        assert_eq!(cache.get("ns", "k").await.unwrap(), None);
        cache
            .set("ns", "k", json!({ "a": 1 }), None, SetOptions::default())
            .await
            .unwrap();
        assert_eq!(cache.get("ns", "k").await.unwrap(), Some(json!({ "a": 1 })));
        assert!(cache.touch("ns", "k", Some(60)).await.unwrap());
        assert!(cache.exists_namespace("ns").await.unwrap());

        cache.delete("ns", "k").await.unwrap();
        assert_eq!(cache.get("ns", "k").await.unwrap(), None);
        assert!(!cache.touch("ns", "k", None).await.unwrap());

        cache.stop().await.unwrap();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn stored_null_is_not_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, serving) = served(dir.path()).await;

        cache
            .set("ns", "null", Value::Null, None, SetOptions::default())
            .await
            .unwrap();
        assert_eq!(cache.get("ns", "null").await.unwrap(), Some(Value::Null));

        cache.stop().await.unwrap();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn counters_and_locks_keep_their_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, serving) = served(dir.path()).await;

        assert_eq!(cache.increment("ns", "c", 5, None).await.unwrap(), json!(5));
        assert_eq!(cache.increment("ns", "c", 3, None).await.unwrap(), json!(8));
        assert_eq!(cache.decrement("ns", "c", 10, None).await.unwrap(), json!(-2));

        let token = cache.lock("ns", "a", None).await.unwrap();
        let err = cache
            .lock("ns", "a", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, DataServerError::LockTimeout(_)));

        let wrong = LockToken::from("not-the-token".to_owned());
        let err = cache.unlock("ns", "a", &wrong).await.unwrap_err();
        assert!(matches!(err, DataServerError::InvalidToken(_)));
        cache.unlock("ns", "a", &token).await.unwrap();

        cache.stop().await.unwrap();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn argument_errors_cross_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, serving) = served(dir.path()).await;

        cache
            .set("ns", "text", json!("abc"), None, SetOptions::default())
            .await
            .unwrap();
        let err = cache.increment("ns", "text", 1, None).await.unwrap_err();
        assert!(matches!(err, DataServerError::NotANumber(_)));

        let err = cache.get("", "k").await.unwrap_err();
        assert!(matches!(err, DataServerError::InvalidArgument(_)));

        cache.stop().await.unwrap();
        serving.await.unwrap();
    }

    // ── Failure surfacing ───────────────────────────────────────

    #[tokio::test]
    async fn missing_worker_is_backend_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = DataServerConfig::new()
            .persist_path(dir.path())
            .request_timeout(Duration::from_millis(200));
        let cache = FilesystemDataServer::connect(dir.path().join("nobody.sock"), config);

        let err = cache.get("ns", "k").await.unwrap_err();
        assert!(matches!(err, DataServerError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        // accepts and holds every connection without ever answering
        let holding = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = DataServerConfig::new()
            .persist_path(dir.path())
            .request_timeout(Duration::from_millis(100));
        let cache = FilesystemDataServer::connect(&socket, config);

        let started = Instant::now();
        let err = cache.get("ns", "k").await.unwrap_err();
        assert!(matches!(err, DataServerError::BackendUnavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(2));

        holding.abort();
    }

    #[tokio::test]
    async fn unreadable_snapshot_is_reported_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join(DEFAULT_SNAPSHOT_FILE);
        std::fs::write(&snapshot, b"{ not json").unwrap();

        let (owner, serving) = served(dir.path()).await;
        let cache = FilesystemDataServer::attach(owner.socket_path(), owner.config().clone())
            .await
            .unwrap();
        assert!(matches!(
            cache.startup_error(),
            Some(DataServerError::PersistenceCorrupt(_))
        ));

        cache
            .set("ns", "k", json!(1), None, SetOptions::default())
            .await
            .unwrap();
        cache.stop().await.unwrap();
        owner.stop().await.unwrap();
        serving.await.unwrap();

        let aside = dir.path().join(format!("{DEFAULT_SNAPSHOT_FILE}.corrupt"));
        assert_eq!(std::fs::read(aside).unwrap(), b"{ not json");
        assert!(snapshot.exists());
    }

    #[tokio::test]
    async fn set_up_reuses_a_running_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (owner, serving) = served(dir.path()).await;
        owner
            .set("ns", "k", json!("kept"), None, SetOptions::default())
            .await
            .unwrap();

        // no worker program exists, so this can only succeed by reusing the socket
        let config = owner
            .config()
            .clone()
            .worker_program(dir.path().join("no-such-worker"));
        let second = FilesystemDataServer::set_up(config).await.unwrap();
        assert!(second.startup_error().is_none());
        assert_eq!(second.get("ns", "k").await.unwrap(), Some(json!("kept")));

        second.stop().await.unwrap();
        assert_eq!(owner.get("ns", "k").await.unwrap(), Some(json!("kept")));

        owner.stop().await.unwrap();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn calls_after_stop_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, serving) = served(dir.path()).await;

        cache.stop().await.unwrap();
        serving.await.unwrap();
        cache.stop().await.unwrap();

        let err = cache.get("ns", "k").await.unwrap_err();
        assert!(matches!(err, DataServerError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn set_up_fails_cleanly_without_a_worker_program() {
        let dir = tempfile::tempdir().unwrap();
        let config = DataServerConfig::new()
            .persist_path(dir.path())
            .worker_program(dir.path().join("no-such-worker"));

        let err = FilesystemDataServer::set_up(config).await.err().unwrap();
        assert!(matches!(err, DataServerError::BackendUnavailable(_)));
    }
}
