// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The record cache holds, per executing transaction, every record that
//! transaction has touched: local records read through from the [Store] on
//! first access, and remote records pushed to it in [TupleBatch]es. Business
//! logic can't tell the two apart.
//!
//! Entries are keyed by transaction first. The only way a record crosses from
//! one transaction's entries into another's is a batch addressed to the
//! receiver, which is what lets each transaction observe a snapshot assembled
//! deterministically from local storage plus exactly the reads sent to it.

use crate::{
    Error, PartitionId, Partitioner, RecVal, RecordKey, Store, TupleBatch, TupleEnvelope, TxnNum,
};
use async_std::sync::{Arc, Condvar, Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument, trace};

/// A record as a transaction sees it, plus whether the transaction has
/// written it. Dirty records are what commit applies to the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CachedRecord {
    pub value: RecVal,
    pub dirty: bool,
}

impl CachedRecord {
    pub fn clean(value: RecVal) -> Self {
        CachedRecord {
            value,
            dirty: false,
        }
    }

    pub fn dirty(value: RecVal) -> Self {
        CachedRecord { value, dirty: true }
    }
}

#[derive(Debug, Default)]
struct TxnEntries {
    records: HashMap<RecordKey, CachedRecord>,
    // Partitions whose batch for this txn has arrived.
    delivered_from: BTreeSet<PartitionId>,
}

#[derive(Default)]
struct CacheState {
    txns: HashMap<TxnNum, TxnEntries>,
    // One Condvar per txn waiting for remote reads; absorbing a batch wakes
    // only the txns it's addressed to.
    waiters: HashMap<TxnNum, Arc<Condvar>>,
}

pub struct RecordCache<S: Store> {
    self_id: PartitionId,
    partitioner: Arc<dyn Partitioner>,
    store: Arc<RwLock<S>>,
    state: Arc<Mutex<CacheState>>,
}

impl<S: Store> Clone for RecordCache<S> {
    fn clone(&self) -> Self {
        RecordCache {
            self_id: self.self_id,
            partitioner: self.partitioner.clone(),
            store: self.store.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: Store> RecordCache<S> {
    pub fn new(
        self_id: PartitionId,
        partitioner: Arc<dyn Partitioner>,
        store: Arc<RwLock<S>>,
    ) -> Self {
        RecordCache {
            self_id,
            partitioner,
            store,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    fn is_local(&self, key: &RecordKey) -> bool {
        self.partitioner.partition_of(key) == self.self_id
    }

    /// Returns `txn`'s copy of `key`. A local key missing from the cache is
    /// fetched from the store once and remembered; a remote key has to have
    /// been absorbed from a batch, otherwise it's [Error::MissingRecord].
    #[instrument(skip(self))]
    pub async fn read(&self, key: &RecordKey, txn: TxnNum) -> Result<CachedRecord, Error> {
        if self.is_local(key) {
            return Ok(self.read_through(key, txn).await);
        }
        self.state
            .lock()
            .await
            .txns
            .get(&txn)
            .and_then(|t| t.records.get(key))
            .cloned()
            .ok_or_else(|| Error::MissingRecord(key.clone()))
    }

    /// `txn`'s copy of a key this partition owns, fetched from the store on
    /// first access. The caller guarantees `key` is local.
    pub async fn read_through(&self, key: &RecordKey, txn: TxnNum) -> CachedRecord {
        debug_assert!(self.is_local(key));
        if let Some(rec) = self
            .state
            .lock()
            .await
            .txns
            .get(&txn)
            .and_then(|t| t.records.get(key))
        {
            return rec.clone();
        }

        // Don't hold the cache lock across the store read. Only this txn
        // reads this key on its behalf, so nobody can race us to fill it.
        let fetched = RecVal::from(self.store.read().await.get(key));
        trace!("fetched {:?} from store", key);
        let mut guard = self.state.lock().await;
        let rec = guard
            .txns
            .entry(txn)
            .or_default()
            .records
            .entry(key.clone())
            .or_insert(CachedRecord::clean(fetched))
            .clone();
        rec
    }

    /// Stages `value` as `txn`'s new version of `key`.
    pub async fn write(&self, key: &RecordKey, txn: TxnNum, value: RecVal) {
        self.state
            .lock()
            .await
            .txns
            .entry(txn)
            .or_default()
            .records
            .insert(key.clone(), CachedRecord::dirty(value));
    }

    /// Installs every tuple of `batch` under its destination transaction and
    /// marks the batch's source as delivered for each destination. Batches
    /// may arrive in any order across sources, even before the destination
    /// starts executing; a pushed tuple never replaces a record the
    /// destination has already written.
    #[instrument(skip(self, batch))]
    pub async fn absorb(&self, batch: TupleBatch) {
        trace!("absorbing {} tuples from {:?}", batch.len(), batch.source);
        let dests = batch.destinations();
        let mut guard = self.state.lock().await;
        for dest in dests.iter() {
            guard
                .txns
                .entry(*dest)
                .or_default()
                .delivered_from
                .insert(batch.source);
        }
        for t in batch.tuples {
            let TupleEnvelope {
                key,
                record,
                dest_txn,
                ..
            } = t;
            guard
                .txns
                .entry(dest_txn)
                .or_default()
                .records
                .entry(key)
                .or_insert(CachedRecord::clean(record));
        }
        for dest in dests.iter() {
            if let Some(cvar) = guard.waiters.get(dest) {
                cvar.notify_all();
            }
        }
    }

    /// Waits until every partition in `sources` has delivered its batch for
    /// `txn`. Returns immediately for an empty set.
    #[instrument(skip(self))]
    pub async fn wait_for_sources(&self, txn: TxnNum, sources: &BTreeSet<PartitionId>) {
        if sources.is_empty() {
            return;
        }
        let mut guard = self.state.lock().await;
        let cvar = guard
            .waiters
            .entry(txn)
            .or_insert_with(|| Arc::new(Condvar::new()))
            .clone();
        debug!("waiting on remote reads");
        let _guard = cvar
            .wait_until(guard, |st| match st.txns.get(&txn) {
                None => false,
                Some(t) => sources.is_subset(&t.delivered_from),
            })
            .await;
        debug!("remote reads arrived");
    }

    /// The records `txn` wrote that this partition owns, in key order.
    /// Writes to remote keys stay behind; their owners apply them.
    pub async fn dirty_records(&self, txn: TxnNum) -> Vec<(RecordKey, RecVal)> {
        let guard = self.state.lock().await;
        let mut out: Vec<(RecordKey, RecVal)> = match guard.txns.get(&txn) {
            None => Vec::new(),
            Some(t) => t
                .records
                .iter()
                .filter(|(k, r)| r.dirty && self.is_local(k))
                .map(|(k, r)| (k.clone(), r.value.clone()))
                .collect(),
        };
        out.sort();
        out
    }

    /// Forgets everything cached for `txn`. Idempotent.
    pub async fn cleanup(&self, txn: TxnNum) {
        let mut guard = self.state.lock().await;
        guard.waiters.remove(&txn);
        if let Some(t) = guard.txns.remove(&txn) {
            trace!("dropped {} cached records of {:?}", t.records.len(), txn);
        }
    }

    pub async fn contains(&self, txn: TxnNum) -> bool {
        self.state.lock().await.txns.contains_key(&txn)
    }

    /// Transactions with anything cached, ascending.
    pub async fn cached_txns(&self) -> Vec<TxnNum> {
        let mut ts: Vec<TxnNum> = self.state.lock().await.txns.keys().cloned().collect();
        ts.sort();
        ts
    }
}
