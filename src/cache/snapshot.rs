//! On-disk form of a record store.
//!
//! A snapshot is a versioned JSON document listing every namespace and every
//! live, persistable record with the metadata needed to rebuild it exactly:
//!
//! ```json
//! {
//!   "version": 1,
//!   "writtenAt": "2024-05-01T10:00:00Z",
//!   "namespaces": ["sessions"],
//!   "records": [
//!     { "namespace": "sessions", "key": "abc", "value": {"user": 1},
//!       "ttl": 60, "expiresAt": "2024-05-01T10:01:00Z",
//!       "createdAt": "2024-05-01T10:00:00Z", "updatedAt": "2024-05-01T10:00:00Z" }
//!   ]
//! }
//! ```
//!
//! Files are replaced atomically: the encoded bytes go to a sibling temporary
//! file which is then renamed over the target.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::error::{DataServerError, Result};
use super::record::Record;
use super::store::RecordStore;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A serialized record with its location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub namespace: String,
    pub key: String,
    pub value: Value,
    pub ttl: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The full namespace and record set at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub written_at: DateTime<Utc>,
    pub namespaces: Vec<String>,
    pub records: Vec<SnapshotRecord>,
}

impl Snapshot {
    /// Captures every live record of `store` that was written with `persist`.
    pub fn capture<S: RecordStore>(store: &S, now: DateTime<Utc>) -> Self {
        let records = store
            .entries(now)
            .into_iter()
            .filter(|entry| entry.record.persist)
            .map(|entry| SnapshotRecord {
                namespace: entry.namespace.to_owned(),
                key: entry.key.to_owned(),
                value: entry.record.value.clone(),
                ttl: entry.record.ttl,
                expires_at: entry.record.expires_at,
                created_at: entry.record.created_at,
                updated_at: entry.record.updated_at,
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            written_at: now,
            namespaces: store.namespaces(),
            records,
        }
    }

    /// Loads the snapshot into `store`, skipping records that expired before `now`.
    ///
    /// Returns the number of records restored.
    pub fn restore_into<S: RecordStore>(self, store: &mut S, now: DateTime<Utc>) -> usize {
        for namespace in &self.namespaces {
            // idempotent creation cannot fail
            let _ = store.create_namespace(namespace, true);
        }

        let mut restored = 0;
        for entry in self.records {
            let record = Record {
                value: entry.value,
                ttl: entry.ttl,
                expires_at: entry.expires_at,
                created_at: entry.created_at,
                updated_at: entry.updated_at,
                persist: true,
            };
            if record.is_expired(now) {
                continue;
            }
            if store.set(&entry.namespace, &entry.key, record, true).is_ok() {
                restored += 1;
            }
        }
        restored
    }
}

/// Serializes a snapshot to bytes.
pub fn encode(snapshot: &Snapshot) -> Result<Vec<u8>> {
    serde_json::to_vec(snapshot).map_err(|e| DataServerError::PersistenceCorrupt(e.to_string()))
}

/// Parses snapshot bytes.
///
/// # Errors
///
/// [`DataServerError::PersistenceCorrupt`] when the bytes are not a snapshot
/// or carry an unknown version.
pub fn decode(bytes: &[u8]) -> Result<Snapshot> {
    let snapshot: Snapshot = serde_json::from_slice(bytes)
        .map_err(|e| DataServerError::PersistenceCorrupt(e.to_string()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(DataServerError::PersistenceCorrupt(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    Ok(snapshot)
}

/// Atomically writes `snapshot` to `path`, creating the parent directory.
pub async fn write(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let bytes = encode(snapshot)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    tokio::fs::write(&staging, &bytes).await?;
    tokio::fs::rename(&staging, path).await?;

    debug!(
        path = %path.display(),
        records = snapshot.records.len(),
        bytes = bytes.len(),
        "snapshot written"
    );
    Ok(())
}

/// Moves an unreadable snapshot to `<path>.corrupt` so later writes cannot
/// replace it, returning the new location. An older `.corrupt` file is replaced.
pub async fn quarantine(path: &Path) -> Result<PathBuf> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    let aside = PathBuf::from(aside);
    tokio::fs::rename(path, &aside).await?;
    warn!(from = %path.display(), to = %aside.display(), "unreadable snapshot moved aside");
    Ok(aside)
}

/// Reads the snapshot at `path`. A missing file is `Ok(None)`.
///
/// # Errors
///
/// [`DataServerError::PersistenceCorrupt`] when the file exists but cannot be
/// decoded, [`DataServerError::Io`] when it cannot be read.
pub async fn read(path: &Path) -> Result<Option<Snapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => decode(&bytes)
            .map(Some)
            .map_err(|e| DataServerError::PersistenceCorrupt(format!("{}: {}", path.display(), e.detail()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
