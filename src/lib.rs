// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This crate is the transaction-execution core of a partitioned,
//! deterministically-scheduled database in the style of Calvin. Every node
//! owns one partition of the keyspace and receives the same totally-ordered
//! stream of transaction requests as every other node. Each node executes that
//! stream such that all replicas of a partition produce identical results, with
//! exactly one round of communication between partitions: a one-way push of
//! local reads.
//!
//! ## Summary
//!
//! The protocol for a single transaction is:
//!
//!   - Transactions are stored procedures with deterministic _read and write
//!     sets_, declared from their parameters alone before any data is read.
//!
//!   - From the declared keys, every node computes the same participant set,
//!     active-participant set and master partition (see [TxnContext]).
//!
//!   - Locks on the full key set are _reserved_ in global delivery order.
//!     Because admission order is the same total order everywhere and nobody
//!     acquires a lock it didn't reserve, waits-for edges only ever point to
//!     earlier transactions: no deadlock detection is needed. This is
//!     "conservative locking".
//!
//!   - Once its locks are granted, a transaction reads the keys its partition
//!     owns and pushes them as a [TupleBatch] to every other active
//!     participant.
//!
//!   - Active participants wait for the batches addressed to them, then run
//!     the business logic against a [RecordCache] that holds local and pushed
//!     records indistinguishably, and commit or roll back.
//!
//!   - Cache entries are purged and locks released on every exit path.
//!
//! ## Caveats
//!
//!   - Your transactions must be deterministic, and so must their key sets. If
//!     the key set depends on the data, split the work into a "reconnaissance"
//!     read-only transaction followed by the real one.
//!
//!   - A read-only transaction with no write keys is mastered at the partition
//!     of its _first declared_ read key. Declaration order is therefore part of
//!     the procedure's contract: two nodes declaring the same keys in different
//!     orders would disagree about the master.
//!
//!   - Durability, total-order broadcast and key placement are supplied from
//!     outside, through [Store], a request [futures::Stream] and [Partitioner].

use futures::Future;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Txn was aborted: {0}")]
    TxnAbort(String),
    #[error("Key declaration failed: {0}")]
    Declaration(String),
    #[error("Bad stored-procedure parameters: {0}")]
    BadParameters(String),
    #[error("No stored procedure registered as {0:?}")]
    UnknownProcedure(String),
    #[error("Stored procedure panicked: {0}")]
    ProcedurePanicked(String),
    #[error("Key {0:?} was neither declared as read nor written")]
    UndeclaredKey(RecordKey),
    #[error("Record {0:?} is neither local nor pushed to this txn")]
    MissingRecord(RecordKey),
    #[error("Read-only txn tried to write {0:?}")]
    ReadOnlyWrite(RecordKey),
    #[error("Txn {0:?} already reserved its locks")]
    DuplicateReservation(TxnNum),
    #[error("Txn {0:?} acquired locks it never reserved")]
    LocksNotReserved(TxnNum),
    #[error("Txn {got:?} delivered after {prev:?}")]
    OutOfOrderTxn { prev: TxnNum, got: TxnNum },
    #[error("No connection to partition {0:?}")]
    UnknownPartition(PartitionId),
    #[error("Networking error")]
    NetworkingError,
}

impl From<edelcrantz::Error> for Error {
    fn from(_: edelcrantz::Error) -> Self {
        Error::NetworkingError
    }
}

mod cache;
mod config;
mod database;
mod lock;
mod network;
mod partition;
mod procedure;
mod runner;
mod scheduler;
mod storage;
mod transaction;
mod tuples;
mod value;

// As with most nontrivial async fns here, we box the futures returned from
// public entrypoints: one extra allocation per call buys faster compiles and
// recursion-friendly types. The standard BoxFuture isn't Sync, which our
// spawned tasks want, so we define our own.
type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;

pub use cache::{CachedRecord, RecordCache};
pub use config::Config;
pub use database::Database;
pub use lock::{ConservativeLockMgr, LockMode};
pub use partition::{ModuloPartitioner, PartitionId, Partitioner};
pub use procedure::{ExecContext, KeyDecl, Outcome, Procedure, ProcedureRegistry, Schema};
pub use runner::{ResultSet, Runner};
pub use scheduler::{Scheduler, TxnRequest};
pub use storage::{MemStore, Store};
pub use transaction::{Isolation, Transaction, TxnContext, TxnLifecycle, TxnNum, TxnState};
pub use tuples::{BatchTag, TupleBatch, TupleEnvelope};
pub use value::{RecVal, Record, RecordKey, Value};
