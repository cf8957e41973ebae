// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    network, Config, ConservativeLockMgr, PartitionId, Partitioner, ProcedureRegistry,
    RecordCache, Store, TxnLifecycle,
};
use async_std::sync::{Arc, RwLock};
use std::collections::HashMap;

/// Main object that clients instantiate, once per node. Encapsulates
/// everything transactions on this partition share: the partitioner, lock
/// manager, record cache, store, procedure registry and connections to the
/// other partitions. Clones are cheap and share all of it; every runner holds
/// one.
pub struct Database<S: Store> {
    pub self_id: PartitionId,

    pub(crate) config: Config,

    pub(crate) partitioner: Arc<dyn Partitioner>,

    /// Conservative locks on record keys, granted in admission order.
    pub(crate) lock_mgr: ConservativeLockMgr,

    /// Per-transaction records: local read-through plus remote pushes.
    pub(crate) cache: RecordCache<S>,

    /// The stored-procedure implementations requests can name.
    pub(crate) procedures: Arc<ProcedureRegistry>,

    /// Attached to every transaction at prepare, if set.
    pub(crate) lifecycle: Option<Arc<dyn TxnLifecycle>>,

    /// The map of network connections, served by network service loops.
    pub(crate) connections: Arc<RwLock<HashMap<PartitionId, network::Connection>>>,

    // Finally the store itself, where committed records live.
    pub(crate) store: Arc<RwLock<S>>,
}

impl<S: Store> Clone for Database<S> {
    fn clone(&self) -> Self {
        Database {
            self_id: self.self_id,
            config: self.config.clone(),
            partitioner: self.partitioner.clone(),
            lock_mgr: self.lock_mgr.clone(),
            cache: self.cache.clone(),
            procedures: self.procedures.clone(),
            lifecycle: self.lifecycle.clone(),
            connections: self.connections.clone(),
            store: self.store.clone(),
        }
    }
}

impl<S: Store> Database<S> {
    /// Construct a new Database serving `config.partition`. Every node in the
    /// cluster must use an equivalent [Partitioner] and register the same
    /// procedures under the same names.
    pub fn new<P: Partitioner>(
        config: Config,
        partitioner: P,
        store: S,
        procedures: ProcedureRegistry,
    ) -> Self {
        let self_id = config.partition;
        let partitioner: Arc<dyn Partitioner> = Arc::new(partitioner);
        let store = Arc::new(RwLock::new(store));
        Database {
            self_id,
            config,
            cache: RecordCache::new(self_id, partitioner.clone(), store.clone()),
            partitioner,
            lock_mgr: ConservativeLockMgr::new(),
            procedures: Arc::new(procedures),
            lifecycle: None,
            connections: Arc::new(RwLock::new(HashMap::new())),
            store,
        }
    }

    /// Registers `l` with every transaction this node begins from now on.
    pub fn with_lifecycle<L: TxnLifecycle>(mut self, l: L) -> Self {
        self.lifecycle = Some(Arc::new(l));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn partitioner(&self) -> &dyn Partitioner {
        &*self.partitioner
    }

    pub fn lock_mgr(&self) -> &ConservativeLockMgr {
        &self.lock_mgr
    }

    pub fn cache(&self) -> &RecordCache<S> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<RwLock<S>> {
        &self.store
    }
}
