// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Record, RecordKey};
use std::collections::BTreeMap;

/// A `Store` is responsible for durable storage of the records a partition
/// owns. Clients of the library provide an implementation and pass it to
/// [crate::Database::new].
///
/// The store is only ever touched in two places: the [crate::RecordCache]
/// reads through it the first time a transaction touches a local key, and a
/// committing transaction applies its staged writes with `put`, where `None`
/// removes the record. Rollback never reaches the store at all, since writes
/// are staged in the cache until commit.
pub trait Store: Send + Sync + 'static {
    fn get(&self, key: &RecordKey) -> Option<Record>;
    fn put(&mut self, key: &RecordKey, rec: Option<Record>);
}

/// An in-memory [Store], ordered by key. Useful for tests and for embedding
/// the executor over state that's made durable elsewhere.
#[derive(Clone, Debug, Default)]
pub struct MemStore {
    map: BTreeMap<RecordKey, Record>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore {
            map: BTreeMap::new(),
        }
    }

    pub fn with_record(mut self, key: RecordKey, rec: Record) -> Self {
        self.map.insert(key, rec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Store for MemStore {
    fn get(&self, key: &RecordKey) -> Option<Record> {
        self.map.get(key).cloned()
    }

    fn put(&mut self, key: &RecordKey, rec: Option<Record>) {
        match rec {
            Some(r) => {
                self.map.insert(key.clone(), r);
            }
            None => {
                self.map.remove(key);
            }
        }
    }
}
