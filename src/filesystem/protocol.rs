//! Wire protocol between the coordinator and the worker.
//!
//! One connection carries exactly one request and one response:
//!
//! 1. the coordinator connects and writes a UTF-8 JSON command,
//!    `{"command": "<operation>", "args": {...}}`;
//! 2. it half-closes its write side to say "no more input";
//! 3. the worker reads until end-of-stream, runs the command, writes a UTF-8
//!    JSON reply (`{"ok": <value>}` or `{"error": {"kind": ..., "message": ...}}`)
//!    and closes the connection;
//! 4. the coordinator reads until end-of-stream and decodes the reply.
//!
//! There is no length prefix: end-of-stream is the frame boundary, which is
//! why a connection is never reused for a second request. A connection that
//! closes without sending anything is a liveness check and gets no reply.

use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cache::{
    DataServer, DataServerError, ErrorKind, LockToken, NamespaceOptions, Result, SetOptions,
};

/// Largest message either side will buffer (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// A capability call as sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "command",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    Get {
        namespace: String,
        key: String,
    },
    Set {
        namespace: String,
        key: String,
        value: Value,
        ttl: Option<u64>,
        #[serde(default)]
        options: SetOptions,
    },
    Delete {
        namespace: String,
        key: String,
    },
    Lock {
        namespace: String,
        key: String,
        timeout_ms: Option<u64>,
    },
    Unlock {
        namespace: String,
        key: String,
        token: LockToken,
    },
    Increment {
        namespace: String,
        key: String,
        amount: i64,
        ttl: Option<u64>,
    },
    Decrement {
        namespace: String,
        key: String,
        amount: i64,
        ttl: Option<u64>,
    },
    Touch {
        namespace: String,
        key: String,
        ttl: Option<u64>,
    },
    CreateNamespace {
        namespace: String,
        #[serde(default)]
        options: NamespaceOptions,
    },
    ExistsNamespace {
        namespace: String,
    },
    Status {},
    Stop {},
}

impl Command {
    /// The operation name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::Delete { .. } => "delete",
            Self::Lock { .. } => "lock",
            Self::Unlock { .. } => "unlock",
            Self::Increment { .. } => "increment",
            Self::Decrement { .. } => "decrement",
            Self::Touch { .. } => "touch",
            Self::CreateNamespace { .. } => "createNamespace",
            Self::ExistsNamespace { .. } => "existsNamespace",
            Self::Status {} => "status",
            Self::Stop {} => "stop",
        }
    }

    /// How long this command may legitimately wait on a key lock inside the
    /// worker, so the caller can extend its own deadline by as much.
    pub fn lock_wait(&self, default: Duration) -> Duration {
        match self {
            Self::Lock { timeout_ms, .. } => timeout_ms.map_or(default, Duration::from_millis),
            Self::Increment { .. } | Self::Decrement { .. } => default,
            _ => Duration::ZERO,
        }
    }
}

/// Result of a `get`, distinguishing a stored `null` from a missing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    pub found: bool,
    pub value: Value,
}

/// An error as sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn into_error(self) -> DataServerError {
        DataServerError::from_parts(self.kind, self.message)
    }
}

impl From<&DataServerError> for WireError {
    fn from(error: &DataServerError) -> Self {
        Self {
            kind: error.kind(),
            message: error.detail(),
        }
    }
}

/// Health of the worker's store, answered to `status`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Why the worker started with an empty store, if it had to.
    pub startup_error: Option<WireError>,
}

/// The worker's answer to one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reply {
    Ok(Value),
    Error(WireError),
}

impl Reply {
    pub fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| {
            serde_json::to_value(value)
                .map_err(|e| DataServerError::InvalidArgument(e.to_string()))
        }) {
            Ok(value) => Self::Ok(value),
            Err(e) => Self::from_error(&e),
        }
    }

    pub fn from_error(error: &DataServerError) -> Self {
        Self::Error(WireError::from(error))
    }

    /// Turns the reply back into the caller-side result.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error(error) => Err(error.into_error()),
        }
    }
}

/// Runs `command` against `server` and packages the outcome.
pub async fn dispatch(server: &dyn DataServer, command: Command) -> Reply {
    match command {
        Command::Get { namespace, key } => {
            Reply::from_result(server.get(&namespace, &key).await.map(|value| Lookup {
                found: value.is_some(),
                value: value.unwrap_or(Value::Null),
            }))
        }
        Command::Set {
            namespace,
            key,
            value,
            ttl,
            options,
        } => Reply::from_result(server.set(&namespace, &key, value, ttl, options).await),
        Command::Delete { namespace, key } => {
            Reply::from_result(server.delete(&namespace, &key).await)
        }
        Command::Lock {
            namespace,
            key,
            timeout_ms,
        } => Reply::from_result(
            server
                .lock(&namespace, &key, timeout_ms.map(Duration::from_millis))
                .await,
        ),
        Command::Unlock {
            namespace,
            key,
            token,
        } => Reply::from_result(server.unlock(&namespace, &key, &token).await),
        Command::Increment {
            namespace,
            key,
            amount,
            ttl,
        } => Reply::from_result(server.increment(&namespace, &key, amount, ttl).await),
        Command::Decrement {
            namespace,
            key,
            amount,
            ttl,
        } => Reply::from_result(server.decrement(&namespace, &key, amount, ttl).await),
        Command::Touch {
            namespace,
            key,
            ttl,
        } => Reply::from_result(server.touch(&namespace, &key, ttl).await),
        Command::CreateNamespace { namespace, options } => {
            Reply::from_result(server.create_namespace(&namespace, options).await)
        }
        Command::ExistsNamespace { namespace } => {
            Reply::from_result(server.exists_namespace(&namespace).await)
        }
        Command::Status {} => Reply::from_result::<Status>(Ok(Status {
            startup_error: server.startup_error().map(WireError::from),
        })),
        Command::Stop {} => Reply::from_result(server.stop().await),
    }
}

/// Reads from `reader` until the peer closes its write side.
///
/// # Errors
///
/// Propagates read errors; fails with `InvalidData` once more than
/// [`MAX_MESSAGE_SIZE`] bytes have arrived.
pub async fn read_to_close<R>(reader: &mut R) -> std::io::Result<BytesMut>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    loop {
        let bytes_read = reader.read_buf(&mut buf).await?;
        if bytes_read == 0 {
            return Ok(buf);
        }
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message exceeds {MAX_MESSAGE_SIZE} bytes"),
            ));
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| DataServerError::InvalidArgument(e.to_string()))
}

/// Decodes a command received by the worker. Malformed input is the caller's fault.
pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    serde_json::from_slice(bytes)
        .map_err(|e| DataServerError::InvalidArgument(format!("malformed command: {e}")))
}

/// Decodes a reply received by the coordinator. Malformed output means the
/// worker is not behaving, so it is reported as an unavailable backend.
pub fn decode_reply(bytes: &[u8]) -> Result<Reply> {
    if bytes.is_empty() {
        return Err(DataServerError::BackendUnavailable(
            "worker closed the connection without replying".into(),
        ));
    }
    serde_json::from_slice(bytes)
        .map_err(|e| DataServerError::BackendUnavailable(format!("malformed reply: {e}")))
}

/// Converts a reply payload into the type an operation returns.
pub fn payload<T: DeserializeOwned>(value: Value, command: &str) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        DataServerError::BackendUnavailable(format!("unexpected {command} reply: {e}"))
    })
}
