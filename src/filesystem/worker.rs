//! The worker side of the filesystem backend.
//!
//! A [`Worker`] owns a persistent [`MemoryDataServer`] rooted at the caching
//! folder and answers commands on a Unix domain socket, one command per
//! connection. Each connection runs on its own task so a `lock` that is
//! waiting never holds up the `unlock` that would release it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{self, Command, Reply};
use crate::cache::{DataServer, DataServerConfig, DataServerError, MemoryDataServer};

/// Errors that end a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("another worker is already listening on {path}")]
    InUse { path: String },

    #[error(transparent)]
    DataServer(#[from] DataServerError),
}

/// Pause after a failed `accept` so persistent failures (e.g. EMFILE) do not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// `true` when something accepts connections on `socket`.
pub async fn is_listening(socket: &Path) -> bool {
    UnixStream::connect(socket).await.is_ok()
}

/// A data server process answering on a Unix domain socket.
///
/// # Examples
///
/// ```rust,no_run
/// use dataserver::cache::DataServerConfig;
/// use dataserver::filesystem::Worker;
///
/// # async fn example() -> Result<(), dataserver::filesystem::WorkerError> {
/// let config = DataServerConfig::new().persist_path("/var/cache/app");
/// let worker = Worker::bind("/var/cache/app/dataserver.sock", config).await?;
/// worker.serve().await?;
/// # Ok(())
/// # }
/// ```
pub struct Worker {
    listener: UnixListener,
    socket_path: PathBuf,
    server: Arc<MemoryDataServer>,
}

impl Worker {
    /// Loads the store from `config`'s folder and binds `socket`.
    ///
    /// Persistence is always on for a worker. A socket file left behind by a
    /// dead worker is removed first; a socket a live worker still answers on is
    /// left alone and the store files are not touched.
    ///
    /// # Errors
    ///
    /// [`WorkerError::InUse`] when another worker owns `socket`,
    /// [`WorkerError::DataServer`] for an invalid configuration or an
    /// unreadable snapshot that cannot be moved aside,
    /// [`WorkerError::Bind`] when the socket cannot be bound.
    pub async fn bind(
        socket: impl AsRef<Path>,
        config: DataServerConfig,
    ) -> Result<Self, WorkerError> {
        let socket_path = socket.as_ref().to_path_buf();

        if is_listening(&socket_path).await {
            return Err(WorkerError::InUse {
                path: socket_path.display().to_string(),
            });
        }
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!(socket = %socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let server = MemoryDataServer::configure(config.persist(true)).await?;

        let listener = UnixListener::bind(&socket_path).map_err(|e| WorkerError::Bind {
            path: socket_path.display().to_string(),
            source: e,
        })?;

        Ok(Self {
            listener,
            socket_path,
            server: Arc::new(server),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The store this worker serves.
    pub fn data_server(&self) -> &Arc<MemoryDataServer> {
        &self.server
    }

    /// Accepts connections until a `stop` command has been answered.
    ///
    /// The socket file is removed on the way out.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Io`] if the socket file cannot be removed.
    pub async fn serve(self) -> Result<(), WorkerError> {
        let shutdown = Arc::new(Notify::new());
        let mut connections = JoinSet::new();
        info!(socket = %self.socket_path.display(), "data server worker listening");

        loop {
            let stream = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                _ = shutdown.notified() => break,
            };

            let server = Arc::clone(&self.server);
            let shutdown = Arc::clone(&shutdown);
            connections.spawn(async move {
                if let Err(e) = handle_connection(stream, server, shutdown).await {
                    warn!(error = %e, "connection closed with error");
                }
            });

            // reap finished connections so the set does not grow without bound
            while connections.try_join_next().is_some() {}
        }

        connections.shutdown().await;
        // a stop always goes through the store, but serve may also end otherwise
        self.server.stop().await.ok();
        match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(socket = %self.socket_path.display(), "data server worker stopped");
        Ok(())
    }
}

/// Reads one command, answers it and closes the connection.
async fn handle_connection(
    mut stream: UnixStream,
    server: Arc<MemoryDataServer>,
    shutdown: Arc<Notify>,
) -> Result<(), std::io::Error> {
    let bytes = protocol::read_to_close(&mut stream).await?;
    if bytes.is_empty() {
        trace!("liveness check");
        return Ok(());
    }

    let mut stopping = false;
    let reply = match protocol::decode_command(&bytes) {
        Ok(command) => {
            debug!(command = command.name(), "dispatching command");
            stopping = matches!(command, Command::Stop {});
            protocol::dispatch(&*server, command).await
        }
        Err(e) => {
            warn!(error = %e, bytes = bytes.len(), "rejecting malformed command");
            Reply::from_error(&e)
        }
    };

    let encoded = protocol::encode(&reply)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    stream.write_all(&encoded).await?;
    stream.shutdown().await?;

    if stopping {
        shutdown.notify_one();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::*;
    use crate::filesystem::SOCKET_FILE;

    async fn send(socket: &Path, command: &Command) -> Value {
        let mut stream = UnixStream::connect(socket).await.unwrap();
        stream
            .write_all(&protocol::encode(command).unwrap())
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        let bytes = protocol::read_to_close(&mut stream).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn start(dir: &Path) -> (PathBuf, tokio::task::JoinHandle<Result<(), WorkerError>>) {
        let socket = dir.join(SOCKET_FILE);
        let config = DataServerConfig::new().persist_path(dir);
        let worker = Worker::bind(&socket, config).await.unwrap();
        (socket, tokio::spawn(worker.serve()))
    }

    // ── Commands ────────────────────────────────────────────────

    #[tokio::test]
    async fn answers_one_command_per_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, serving) = start(dir.path()).await;

        let set = Command::Set {
            namespace: "ns".into(),
            key: "k".into(),
            value: json!({ "n": 1 }),
            ttl: None,
            options: Default::default(),
        };
        assert_eq!(send(&socket, &set).await, json!({ "ok": null }));

        let get = Command::Get {
            namespace: "ns".into(),
            key: "k".into(),
        };
        assert_eq!(
            send(&socket, &get).await,
            json!({ "ok": { "found": true, "value": { "n": 1 } } })
        );

        send(&socket, &Command::Stop {}).await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_command_gets_an_error_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, serving) = start(dir.path()).await;

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream.write_all(b"{ nope").await.unwrap();
        stream.shutdown().await.unwrap();
        let bytes = protocol::read_to_close(&mut stream).await.unwrap();
        let reply: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply["error"]["kind"], json!("invalidArgument"));

        send(&socket, &Command::Stop {}).await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unlock_is_served_while_a_lock_waits() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, serving) = start(dir.path()).await;

        let lock = Command::Lock {
            namespace: "ns".into(),
            key: "a".into(),
            timeout_ms: Some(2_000),
        };
        let first = send(&socket, &lock).await;
        let token = first["ok"].as_str().unwrap().to_owned();

        let waiter = {
            let socket = socket.clone();
            let lock = lock.clone();
            tokio::spawn(async move { send(&socket, &lock).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let unlock = Command::Unlock {
            namespace: "ns".into(),
            key: "a".into(),
            token: token.into(),
        };
        assert_eq!(send(&socket, &unlock).await, json!({ "ok": null }));

        let second = waiter.await.unwrap();
        assert!(second["ok"].is_string());

        send(&socket, &Command::Stop {}).await;
        serving.await.unwrap().unwrap();
    }

    // ── Lifecycle ───────────────────────────────────────────────

    #[tokio::test]
    async fn stop_persists_and_removes_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, serving) = start(dir.path()).await;

        let set = Command::Set {
            namespace: "ns".into(),
            key: "kept".into(),
            value: json!("yes"),
            ttl: Some(0),
            options: Default::default(),
        };
        send(&socket, &set).await;
        assert_eq!(send(&socket, &Command::Stop {}).await, json!({ "ok": null }));
        serving.await.unwrap().unwrap();

        assert!(!socket.exists());
        assert!(dir.path().join(crate::cache::config::DEFAULT_SNAPSHOT_FILE).exists());

        // a fresh worker on the same folder sees the record again
        let (socket, serving) = start(dir.path()).await;
        let get = Command::Get {
            namespace: "ns".into(),
            key: "kept".into(),
        };
        assert_eq!(
            send(&socket, &get).await,
            json!({ "ok": { "found": true, "value": "yes" } })
        );
        send(&socket, &Command::Stop {}).await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn live_socket_is_never_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, serving) = start(dir.path()).await;

        let set = Command::Set {
            namespace: "ns".into(),
            key: "k".into(),
            value: json!(1),
            ttl: Some(0),
            options: Default::default(),
        };
        send(&socket, &set).await;

        let second = Worker::bind(&socket, DataServerConfig::new().persist_path(dir.path())).await;
        assert!(matches!(second, Err(WorkerError::InUse { .. })));

        // the first worker still owns the endpoint and its records
        let get = Command::Get {
            namespace: "ns".into(),
            key: "k".into(),
        };
        assert_eq!(
            send(&socket, &get).await,
            json!({ "ok": { "found": true, "value": 1 } })
        );

        send(&socket, &Command::Stop {}).await;
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn liveness_checks_get_no_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, serving) = start(dir.path()).await;

        assert!(is_listening(&socket).await);
        let mut stream = UnixStream::connect(&socket).await.unwrap();
        stream.shutdown().await.unwrap();
        let bytes = protocol::read_to_close(&mut stream).await.unwrap();
        assert!(bytes.is_empty());

        send(&socket, &Command::Stop {}).await;
        serving.await.unwrap().unwrap();
        assert!(!is_listening(&socket).await);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_moved_aside_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join(crate::cache::config::DEFAULT_SNAPSHOT_FILE);
        std::fs::write(&snapshot, b"garbage").unwrap();

        let (socket, serving) = start(dir.path()).await;
        let status = send(&socket, &Command::Status {}).await;
        assert_eq!(status["ok"]["startupError"]["kind"], json!("persistenceCorrupt"));

        send(&socket, &Command::Stop {}).await;
        serving.await.unwrap().unwrap();

        let aside = dir.path().join(format!(
            "{}.corrupt",
            crate::cache::config::DEFAULT_SNAPSHOT_FILE
        ));
        assert_eq!(std::fs::read(aside).unwrap(), b"garbage");
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join(SOCKET_FILE);
        std::fs::write(&socket, b"left over").unwrap();

        let worker = Worker::bind(&socket, DataServerConfig::new().persist_path(dir.path()))
            .await
            .unwrap();
        assert_eq!(worker.socket_path(), socket.as_path());
        assert!(worker.data_server().config().persists());
    }
}
