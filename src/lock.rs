// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Conservative locking, as in Calvin: a transaction reserves every lock it
//! will ever need before it runs, in global delivery order, and only then
//! waits for them.
//!
//! Each key has a FIFO queue of requests. A shared request is grantable when
//! everything ahead of it is also shared; an exclusive request only at the
//! head. Since every node enqueues transactions in the same total order and no
//! transaction waits on a lock it didn't reserve, every waits-for edge points
//! from a later transaction to an earlier one. There can't be a cycle, so
//! there's no deadlock detector and no lock timeout.
//!
//! Every reservation carries its own wakeup. A release wakes only the
//! transactions queued on the keys it released.

use crate::{Error, RecordKey, TxnNum};
use async_std::sync::{Arc, Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::{debug, instrument, trace};

#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct LockRequest {
    txn: TxnNum,
    mode: LockMode,
}

struct Reservation {
    entries: Vec<(RecordKey, LockMode)>,
    // Notified when a release touches one of `entries`' queues.
    wakeup: Arc<Condvar>,
}

#[derive(Default)]
struct LockTable {
    queues: HashMap<RecordKey, VecDeque<LockRequest>>,
    reserved: HashMap<TxnNum, Reservation>,
}

impl LockTable {
    fn is_granted(&self, key: &RecordKey, txn: TxnNum, mode: LockMode) -> bool {
        let queue = match self.queues.get(key) {
            // Entries only leave a queue on release.
            None => return false,
            Some(q) => q,
        };
        for req in queue.iter() {
            if req.txn == txn {
                return true;
            }
            if mode == LockMode::Exclusive || req.mode == LockMode::Exclusive {
                return false;
            }
        }
        false
    }

    // None when `txn` has no reservation at all.
    fn all_granted(&self, txn: TxnNum) -> Option<bool> {
        let res = self.reserved.get(&txn)?;
        Some(
            res.entries
                .iter()
                .all(|(k, mode)| self.is_granted(k, txn, *mode)),
        )
    }
}

/// The lock manager shared by every transaction on a node. Cloning shares
/// the same table.
#[derive(Clone)]
pub struct ConservativeLockMgr {
    table: Arc<Mutex<LockTable>>,
}

impl Default for ConservativeLockMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl ConservativeLockMgr {
    pub fn new() -> Self {
        ConservativeLockMgr {
            table: Arc::new(Mutex::new(LockTable::default())),
        }
    }

    /// Enqueues `txn` behind everything already reserved on each key. Never
    /// blocks on other transactions. A key appearing in both sets, or more
    /// than once, is reserved once, exclusively if it's written at all.
    ///
    /// Calls must be made in global transaction order.
    #[instrument(skip(self, read_keys, write_keys))]
    pub async fn reserve(
        &self,
        txn: TxnNum,
        read_keys: &[RecordKey],
        write_keys: &[RecordKey],
    ) -> Result<(), Error> {
        let mut modes: BTreeMap<&RecordKey, LockMode> = BTreeMap::new();
        for k in read_keys {
            modes.entry(k).or_insert(LockMode::Shared);
        }
        for k in write_keys {
            modes.insert(k, LockMode::Exclusive);
        }

        let mut table = self.table.lock().await;
        if table.reserved.contains_key(&txn) {
            return Err(Error::DuplicateReservation(txn));
        }
        let mut entries = Vec::with_capacity(modes.len());
        for (k, mode) in modes {
            table
                .queues
                .entry(k.clone())
                .or_insert_with(VecDeque::new)
                .push_back(LockRequest { txn, mode });
            entries.push((k.clone(), mode));
        }
        debug!("reserved {} locks", entries.len());
        table.reserved.insert(
            txn,
            Reservation {
                entries,
                wakeup: Arc::new(Condvar::new()),
            },
        );
        Ok(())
    }

    /// Waits until every lock `txn` reserved is granted. This is the only
    /// place a transaction blocks on another.
    #[instrument(skip(self))]
    pub async fn acquire(&self, txn: TxnNum) -> Result<(), Error> {
        let table = self.table.lock().await;
        let wakeup = match table.reserved.get(&txn) {
            None => return Err(Error::LocksNotReserved(txn)),
            Some(res) => res.wakeup.clone(),
        };
        // A concurrent release of `txn` itself ends the wait too.
        let _table = wakeup
            .wait_until(table, |t| t.all_granted(txn).unwrap_or(true))
            .await;
        debug!("all locks granted");
        Ok(())
    }

    /// Drops every lock `txn` holds or is queued for, and wakes the
    /// transactions queued on the same keys. Releasing twice, or releasing a
    /// transaction that never reserved, does nothing.
    #[instrument(skip(self))]
    pub async fn release(&self, txn: TxnNum) {
        let mut table = self.table.lock().await;
        let res = match table.reserved.remove(&txn) {
            None => return,
            Some(r) => r,
        };
        let mut affected = BTreeSet::new();
        for (k, _) in res.entries.iter() {
            let now_empty = match table.queues.get_mut(k) {
                None => false,
                Some(q) => {
                    q.retain(|r| r.txn != txn);
                    affected.extend(q.iter().map(|r| r.txn));
                    q.is_empty()
                }
            };
            if now_empty {
                table.queues.remove(k);
            }
        }
        trace!(
            "released {} locks, waking {} txns",
            res.entries.len(),
            affected.len()
        );
        for t in affected {
            if let Some(other) = table.reserved.get(&t) {
                other.wakeup.notify_all();
            }
        }
        res.wakeup.notify_all();
    }

    /// Transactions queued on `key`, in admission order.
    pub async fn queued_txns(&self, key: &RecordKey) -> Vec<TxnNum> {
        let table = self.table.lock().await;
        match table.queues.get(key) {
            None => Vec::new(),
            Some(q) => q.iter().map(|r| r.txn).collect(),
        }
    }

    /// True when no transaction holds or waits for any lock.
    pub async fn is_idle(&self) -> bool {
        let table = self.table.lock().await;
        table.reserved.is_empty() && table.queues.is_empty()
    }
}
