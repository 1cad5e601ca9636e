//! Straightforward nested hash map store.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;

use chrono::{DateTime, Utc};

use super::{Entry, RecordStore};
use crate::cache::error::{DataServerError, Result};
use crate::cache::record::Record;

/// Namespace → key → record, with expiry checked on read and swept by scan.
#[derive(Debug, Default)]
pub struct HashRecordStore {
    namespaces: HashMap<String, HashMap<String, Record>>,
}

impl HashRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for HashRecordStore {
    fn get(&self, namespace: &str, key: &str, now: DateTime<Utc>) -> Option<&Record> {
        self.namespaces
            .get(namespace)?
            .get(key)
            .filter(|record| !record.is_expired(now))
    }

    fn set(
        &mut self,
        namespace: &str,
        key: &str,
        record: Record,
        create_namespace: bool,
    ) -> Result<()> {
        if !create_namespace && !self.namespaces.contains_key(namespace) {
            return Err(DataServerError::NotFound(format!("namespace {namespace}")));
        }
        self.namespaces
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), record);
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> bool {
        self.namespaces
            .get_mut(namespace)
            .is_some_and(|records| records.remove(key).is_some())
    }

    fn touch(&mut self, namespace: &str, key: &str, ttl: Option<u64>, now: DateTime<Utc>) -> bool {
        let Some(records) = self.namespaces.get_mut(namespace) else {
            return false;
        };
        let expired = match records.get(key) {
            Some(record) => record.is_expired(now),
            None => return false,
        };
        if expired {
            records.remove(key);
            return false;
        }
        if let Some(record) = records.get_mut(key) {
            record.refresh(ttl, now);
        }
        true
    }

    fn create_namespace(&mut self, namespace: &str, idempotent: bool) -> Result<()> {
        match self.namespaces.entry(namespace.to_owned()) {
            MapEntry::Occupied(_) if !idempotent => {
                Err(DataServerError::AlreadyExists(namespace.to_owned()))
            }
            MapEntry::Occupied(_) => Ok(()),
            MapEntry::Vacant(slot) => {
                slot.insert(HashMap::new());
                Ok(())
            }
        }
    }

    fn exists_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    fn remove_namespace(&mut self, namespace: &str) -> bool {
        self.namespaces.remove(namespace).is_some()
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for records in self.namespaces.values_mut() {
            let before = records.len();
            records.retain(|_, record| !record.is_expired(now));
            removed += before - records.len();
        }
        removed
    }

    fn entries(&self, now: DateTime<Utc>) -> Vec<Entry<'_>> {
        self.namespaces
            .iter()
            .flat_map(|(namespace, records)| {
                records.iter().map(move |(key, record)| Entry {
                    namespace,
                    key,
                    record,
                })
            })
            .filter(|entry| !entry.record.is_expired(now))
            .collect()
    }

    fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.keys().cloned().collect();
        names.sort();
        names
    }

    fn len(&self) -> usize {
        self.namespaces.values().map(HashMap::len).sum()
    }
}
