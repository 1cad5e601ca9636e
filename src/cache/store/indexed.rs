//! Ordered map store with an expiry index.
//!
//! Keys within a namespace are kept in a `BTreeMap` so snapshots come out in a
//! stable order, and every record with a deadline also appears in a
//! `BTreeSet` ordered by that deadline. The sweeper pops from the front of the
//! index until it reaches a deadline in the future, so a tick costs time
//! proportional to the number of records that actually expired.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use super::{Entry, RecordStore};
use crate::cache::error::{DataServerError, Result};
use crate::cache::record::Record;

type Deadline = (DateTime<Utc>, String, String);

#[derive(Debug, Default)]
pub struct IndexedRecordStore {
    namespaces: HashMap<String, BTreeMap<String, Record>>,
    expiries: BTreeSet<Deadline>,
}

impl IndexedRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn unindex(&mut self, namespace: &str, key: &str, record: &Record) {
        if let Some(at) = record.expires_at {
            self.expiries
                .remove(&(at, namespace.to_owned(), key.to_owned()));
        }
    }

    fn index(&mut self, namespace: &str, key: &str, record: &Record) {
        if let Some(at) = record.expires_at {
            self.expiries
                .insert((at, namespace.to_owned(), key.to_owned()));
        }
    }
}

impl RecordStore for IndexedRecordStore {
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

        let deadline = record.expires_at;
        self.index(namespace, key, &record);
        let previous = self
            .namespaces
            .entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), record);

        // an unchanged deadline shares its index entry with the new record
        if let Some(previous) = previous.filter(|p| p.expires_at != deadline) {
            self.unindex(namespace, key, &previous);
        }
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> bool {
        let removed = self
            .namespaces
            .get_mut(namespace)
            .and_then(|records| records.remove(key));
        match removed {
            Some(record) => {
                self.unindex(namespace, key, &record);
                true
            }
            None => false,
        }
    }

    fn touch(&mut self, namespace: &str, key: &str, ttl: Option<u64>, now: DateTime<Utc>) -> bool {
        let Some(record) = self
            .namespaces
            .get_mut(namespace)
            .and_then(|records| records.get_mut(key))
        else {
            return false;
        };

        let before = record.clone();
        if before.is_expired(now) {
            self.delete(namespace, key);
            return false;
        }

        record.refresh(ttl, now);
        let after = record.clone();
        self.unindex(namespace, key, &before);
        self.index(namespace, key, &after);
        true
    }

    fn create_namespace(&mut self, namespace: &str, idempotent: bool) -> Result<()> {
        if self.namespaces.contains_key(namespace) {
            return if idempotent {
                Ok(())
            } else {
                Err(DataServerError::AlreadyExists(namespace.to_owned()))
            };
        }
        self.namespaces
            .insert(namespace.to_owned(), BTreeMap::new());
        Ok(())
    }

    fn exists_namespace(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    fn remove_namespace(&mut self, namespace: &str) -> bool {
        let Some(records) = self.namespaces.remove(namespace) else {
            return false;
        };
        for (key, record) in &records {
            self.unindex(namespace, key, record);
        }
        true
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some((at, _, _)) = self.expiries.first() {
            if *at > now {
                break;
            }
            let Some((_, namespace, key)) = self.expiries.pop_first() else {
                break;
            };
            if let Some(records) = self.namespaces.get_mut(&namespace) {
                if records.remove(&key).is_some() {
                    removed += 1;
                }
            }
        }
        removed
    }

    fn entries(&self, now: DateTime<Utc>) -> Vec<Entry<'_>> {
        let mut names: Vec<&String> = self.namespaces.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|namespace| {
                self.namespaces[namespace]
                    .iter()
                    .map(move |(key, record)| Entry {
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
        self.namespaces.values().map(BTreeMap::len).sum()
    }
}
