//! Filesystem backend: a data server living in a separate worker process.
//!
//! The host keeps a [`FilesystemDataServer`] (the coordinator). It spawns the
//! `dataserver-worker` program, which runs a [`Worker`]: a persistent
//! in-memory store rooted at the caching folder, answering one JSON command per
//! Unix socket connection (see [`protocol`]). Records therefore survive host
//! restarts through the worker's snapshot file, and several hosts on one
//! machine can share a worker with [`FilesystemDataServer::connect`].

pub mod coordinator;
pub mod protocol;
pub mod worker;

pub use coordinator::FilesystemDataServer;
pub use protocol::{Command, Reply, Status};
pub use worker::{Worker, WorkerError};

/// Socket file name inside the caching folder.
pub const SOCKET_FILE: &str = "dataserver.sock";

/// Line the worker prints on stdout once it accepts connections.
pub const READY_LINE: &str = "ready";
