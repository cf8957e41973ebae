// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A transaction is identified by the [TxnNum] the total-order broadcast gave
//! it; that number is also its position in every lock queue on every node.
//!
//! A transaction declares read and write sets (of keys) up front. From those
//! alone each node derives the same [TxnContext]: who participates, who has to
//! run the business logic, and who the master is.

use crate::{Error, PartitionId, Partitioner, RecVal, RecordKey, Store};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, sync::Arc};
use tracing::trace;

#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnNum(pub u64);

impl std::fmt::Debug for TxnNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("T{}", self.0))
    }
}

/// The read/write-set analysis of one transaction as seen from one partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnContext {
    pub txn: TxnNum,
    pub read_only: bool,
    pub self_id: PartitionId,

    /// Declared keys, in declaration order.
    pub read_keys: Vec<RecordKey>,
    pub write_keys: Vec<RecordKey>,

    /// Every partition owning a declared key.
    pub participants: BTreeSet<PartitionId>,

    /// Partitions that run the business logic: write-key owners plus master.
    pub active_participants: BTreeSet<PartitionId>,

    pub master: PartitionId,

    /// Read keys owned by `self_id`, in declaration order. These get pushed.
    pub local_read_keys: Vec<RecordKey>,

    /// Partitions other than `self_id` owning a read key. If we're active,
    /// each of them pushes us exactly one batch for this txn.
    pub remote_read_sources: BTreeSet<PartitionId>,
}

impl TxnContext {
    /// Pure function of its arguments: two nodes calling this with the same
    /// keys and an equivalent partitioner get the same participants, active
    /// participants and master. Only `local_read_keys` and
    /// `remote_read_sources` depend on `self_id`.
    pub fn analyze(
        txn: TxnNum,
        read_only: bool,
        self_id: PartitionId,
        read_keys: Vec<RecordKey>,
        write_keys: Vec<RecordKey>,
        partitioner: &dyn Partitioner,
    ) -> Self {
        let mut participants = BTreeSet::new();
        let mut active_participants = BTreeSet::new();
        let mut local_read_keys = Vec::new();
        let mut remote_read_sources = BTreeSet::new();
        let mut master = None;

        for k in write_keys.iter() {
            let p = partitioner.partition_of(k);
            participants.insert(p);
            active_participants.insert(p);
            master.get_or_insert(p);
        }
        for k in read_keys.iter() {
            let p = partitioner.partition_of(k);
            participants.insert(p);
            if p == self_id {
                local_read_keys.push(k.clone());
            } else {
                remote_read_sources.insert(p);
            }
            master.get_or_insert(p);
        }

        // No keys at all: nobody else can possibly be involved, so every node
        // runs the txn itself as its own master.
        let master = master.unwrap_or(self_id);
        participants.insert(master);
        active_participants.insert(master);

        trace!(
            "analyzed {:?}: participants={:?} active={:?} master={:?}",
            txn,
            participants,
            active_participants,
            master
        );
        TxnContext {
            txn,
            read_only,
            self_id,
            read_keys,
            write_keys,
            participants,
            active_participants,
            master,
            local_read_keys,
            remote_read_sources,
        }
    }

    pub fn is_master(&self) -> bool {
        self.master == self.self_id
    }

    pub fn is_participant(&self) -> bool {
        self.participants.contains(&self.self_id)
    }

    pub fn is_active(&self) -> bool {
        self.active_participants.contains(&self.self_id)
    }

    pub fn is_declared(&self, key: &RecordKey) -> bool {
        self.read_keys.contains(key) || self.write_keys.contains(key)
    }

    pub fn is_write_key(&self, key: &RecordKey) -> bool {
        self.write_keys.contains(key)
    }

    /// Active participants other than ourselves: where our local reads go.
    pub fn push_targets(&self) -> impl Iterator<Item = PartitionId> + '_ {
        let me = self.self_id;
        self.active_participants
            .iter()
            .cloned()
            .filter(move |p| *p != me)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isolation {
    Serializable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Committed,
    RolledBack,
}

/// Lifecycle hooks a recovery manager attaches to each transaction when it
/// begins. The executor only guarantees the calls happen, in order, once each.
pub trait TxnLifecycle: Send + Sync + 'static {
    fn on_begin(&self, _txn: TxnNum) {}
    fn on_commit(&self, _txn: TxnNum) {}
    fn on_rollback(&self, _txn: TxnNum) {}
}

/// The storage-level side of a transaction: what it's allowed to do, who's
/// listening, and whether it finished. Writes don't pass through here until
/// commit; the [crate::RecordCache] stages them.
pub struct Transaction {
    num: TxnNum,
    isolation: Isolation,
    read_only: bool,
    state: TxnState,
    listeners: Vec<Arc<dyn TxnLifecycle>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("num", &self.num)
            .field("isolation", &self.isolation)
            .field("read_only", &self.read_only)
            .field("state", &self.state)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Transaction {
    pub fn begin(isolation: Isolation, read_only: bool, num: TxnNum) -> Self {
        Transaction {
            num,
            isolation,
            read_only,
            state: TxnState::Active,
            listeners: Vec::new(),
        }
    }

    pub fn add_lifecycle_listener(&mut self, l: Arc<dyn TxnLifecycle>) {
        l.on_begin(self.num);
        self.listeners.push(l);
    }

    pub fn num(&self) -> TxnNum {
        self.num
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Applies `writes` to `store` and marks the txn committed. A read-only
    /// txn carrying writes is refused before anything is applied.
    pub fn commit<S: Store>(
        &mut self,
        store: &mut S,
        writes: Vec<(RecordKey, RecVal)>,
    ) -> Result<(), Error> {
        debug_assert_eq!(self.state, TxnState::Active);
        if self.read_only {
            if let Some((k, _)) = writes.first() {
                return Err(Error::ReadOnlyWrite(k.clone()));
            }
        }
        for (k, v) in writes {
            match v {
                RecVal::Present(r) => store.put(&k, Some(r)),
                RecVal::Deleted => store.put(&k, None),
                // Nothing was there and nothing was written.
                RecVal::Absent => (),
            }
        }
        self.state = TxnState::Committed;
        for l in self.listeners.iter() {
            l.on_commit(self.num);
        }
        Ok(())
    }

    pub fn rollback(&mut self) {
        debug_assert_eq!(self.state, TxnState::Active);
        self.state = TxnState::RolledBack;
        for l in self.listeners.iter() {
            l.on_rollback(self.num);
        }
    }
}
