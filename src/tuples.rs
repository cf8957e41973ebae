// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The unit of cross-partition read transfer. After its locks are granted, a
//! transaction reads the keys its own partition owns and ships them, one
//! [TupleBatch] per destination, to every other partition that has to run the
//! transaction's business logic.

use crate::{PartitionId, RecVal, RecordKey, TxnNum};
use serde::{Deserialize, Serialize};

/// One record read on behalf of `src_txn`, addressed to `dest_txn` on the
/// receiving partition. The two are the same transaction in everything this
/// crate sends, but the receiver keys cache entries by `dest_txn` only.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleEnvelope {
    pub key: RecordKey,
    pub record: RecVal,
    pub src_txn: TxnNum,
    pub dest_txn: TxnNum,
}

/// What a batch carries. Today that's only the ad hoc push of one
/// transaction's local reads, sent outside any numbered stream.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchTag {
    AdHoc,
}

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleBatch {
    pub tag: BatchTag,
    pub source: PartitionId,
    pub tuples: Vec<TupleEnvelope>,
}

impl TupleBatch {
    pub fn new(tag: BatchTag, source: PartitionId) -> Self {
        TupleBatch {
            tag,
            source,
            tuples: Vec::new(),
        }
    }

    pub fn add_tuple(&mut self, key: RecordKey, src_txn: TxnNum, dest_txn: TxnNum, record: RecVal) {
        self.tuples.push(TupleEnvelope {
            key,
            record,
            src_txn,
            dest_txn,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    /// Every distinct destination transaction in the batch, ascending.
    pub fn destinations(&self) -> Vec<TxnNum> {
        let mut ds: Vec<TxnNum> = self.tuples.iter().map(|t| t.dest_txn).collect();
        ds.sort();
        ds.dedup();
        ds
    }
}
