//! Stored records and argument validation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{DataServerError, Result};

/// A value together with its TTL metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub value: Value,
    /// Lifetime in seconds as requested by the writer; `0` never expires.
    pub ttl: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Whether the record is written to snapshots.
    #[serde(default = "persist_default")]
    pub persist: bool,
}

fn persist_default() -> bool {
    true
}

impl Record {
    pub fn new(value: Value, ttl: u64, persist: bool, now: DateTime<Utc>) -> Self {
        Self {
            value,
            ttl,
            expires_at: expiry_from(ttl, now),
            created_at: now,
            updated_at: now,
            persist,
        }
    }

    /// `true` once `expires_at` is at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Restarts the lifetime from `now`, optionally with a new ttl.
    pub fn refresh(&mut self, ttl: Option<u64>, now: DateTime<Utc>) {
        if let Some(ttl) = ttl {
            self.ttl = ttl;
        }
        self.expires_at = expiry_from(self.ttl, now);
        self.updated_at = now;
    }
}

/// Absolute expiry for a ttl in seconds; `0` means no expiry.
pub fn expiry_from(ttl: u64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if ttl == 0 {
        return None;
    }
    let seconds = i64::try_from(ttl).unwrap_or(i64::MAX);
    ChronoDuration::try_seconds(seconds).and_then(|d| now.checked_add_signed(d))
}

pub(crate) fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() {
        return Err(DataServerError::InvalidArgument(
            "namespace must be a non-empty string".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_key(namespace: &str, key: &str) -> Result<()> {
    validate_namespace(namespace)?;
    if key.is_empty() {
        return Err(DataServerError::InvalidArgument(
            "key must be a non-empty string".into(),
        ));
    }
    Ok(())
}
