//! Record stores — the in-memory namespaced maps behind every backend.
//!
//! A [`RecordStore`] is plain synchronous state. Time is passed in explicitly
//! so expiry is a pure function of the arguments; the owning data server
//! supplies `Utc::now()` and guards the store with a mutex.
//!
//! Two implementations share the contract:
//!
//! | Store                  | Layout                                   | Sweep cost            |
//! |------------------------|------------------------------------------|-----------------------|
//! | [`HashRecordStore`]    | `HashMap<namespace, HashMap<key, _>>`    | scans every record    |
//! | [`IndexedRecordStore`] | `HashMap<namespace, BTreeMap<key, _>>` + expiry index | visits due records only |

use chrono::{DateTime, Utc};

use super::error::Result;
use super::record::Record;

mod hash;
mod indexed;

pub use hash::HashRecordStore;
pub use indexed::IndexedRecordStore;

/// A live record borrowed out of a store, used when building snapshots.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    pub namespace: &'a str,
    pub key: &'a str,
    pub record: &'a Record,
}

/// Namespaced key → record map with TTL semantics.
///
/// Implementations must never hand out a record whose expiry has passed,
/// whether or not [`sweep`](Self::sweep) has physically removed it.
pub trait RecordStore: Default + Send + 'static {
    /// Returns the live record at `namespace/key`.
    fn get(&self, namespace: &str, key: &str, now: DateTime<Utc>) -> Option<&Record>;

    /// Stores `record`, replacing whatever was there.
    ///
    /// # Errors
    ///
    /// `NotFound` when the namespace does not exist and `create_namespace` is `false`.
    fn set(
        &mut self,
        namespace: &str,
        key: &str,
        record: Record,
        create_namespace: bool,
    ) -> Result<()>;

    /// Removes the record; returns whether anything was stored there.
    fn delete(&mut self, namespace: &str, key: &str) -> bool;

    /// Restarts the record's lifetime without touching its value.
    /// Returns `false` when there is no live record.
    fn touch(&mut self, namespace: &str, key: &str, ttl: Option<u64>, now: DateTime<Utc>) -> bool;

    /// # Errors
    ///
    /// `AlreadyExists` when the namespace exists and `idempotent` is `false`.
    fn create_namespace(&mut self, namespace: &str, idempotent: bool) -> Result<()>;

    fn exists_namespace(&self, namespace: &str) -> bool;

    /// Drops a namespace and every record in it.
    fn remove_namespace(&mut self, namespace: &str) -> bool;

    /// Physically removes expired records and returns how many were dropped.
    fn sweep(&mut self, now: DateTime<Utc>) -> usize;

    /// Every live record, for snapshotting.
    fn entries(&self, now: DateTime<Utc>) -> Vec<Entry<'_>>;

    fn namespaces(&self) -> Vec<String>;

    /// Number of records physically held, expired or not.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
