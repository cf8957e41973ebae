// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Key placement. Every node must agree on which partition owns every key, so
//! a [Partitioner] has to be a pure function of the key: no clocks, no
//! per-process random state (in particular, not `std`'s randomly-seeded
//! `HashMap` hasher).

use crate::{RecordKey, Value};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Identifies one partition of the keyspace, and equally the node serving it.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl std::fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}

/// Maps a [RecordKey] to the partition owning it. Must be total, side-effect
/// free and identical on every node for the lifetime of a partitioning scheme.
/// An unplaceable key is a configuration defect, so there's no error path.
pub trait Partitioner: Send + Sync + 'static {
    fn partition_of(&self, key: &RecordKey) -> PartitionId;
}

impl<F> Partitioner for F
where
    F: Fn(&RecordKey) -> PartitionId + Send + Sync + 'static,
{
    fn partition_of(&self, key: &RecordKey) -> PartitionId {
        self(key)
    }
}

/// Spreads keys over `partitions` partitions. Integer ids are placed by
/// euclidean remainder, so consecutive ids round-robin across partitions;
/// anything else goes through FNV-1a over the table name and id.
///
/// Serialized as the bare partition count; deserializing zero is an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ModuloPartitioner {
    partitions: u32,
}

impl ModuloPartitioner {
    pub fn new(partitions: u32) -> Self {
        assert!(partitions > 0, "ModuloPartitioner needs at least one partition");
        ModuloPartitioner { partitions }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }
}

impl TryFrom<u32> for ModuloPartitioner {
    type Error = String;

    fn try_from(partitions: u32) -> Result<Self, String> {
        if partitions == 0 {
            return Err("ModuloPartitioner needs at least one partition".to_string());
        }
        Ok(ModuloPartitioner { partitions })
    }
}

impl From<ModuloPartitioner> for u32 {
    fn from(p: ModuloPartitioner) -> u32 {
        p.partitions
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(mut h: u64, bytes: &[u8]) -> u64 {
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

impl Partitioner for ModuloPartitioner {
    fn partition_of(&self, key: &RecordKey) -> PartitionId {
        let n = self.partitions as u64;
        let slot = match &key.id {
            Value::Int(i) => i.rem_euclid(self.partitions as i64) as u64,
            other => {
                let h = fnv1a(FNV_OFFSET, key.table.as_bytes());
                let h = match other {
                    Value::Text(s) => fnv1a(h, s.as_bytes()),
                    Value::Bool(b) => fnv1a(h, &[*b as u8]),
                    Value::Null | Value::Int(_) => h,
                };
                h % n
            }
        };
        PartitionId(slot as u32)
    }
}
