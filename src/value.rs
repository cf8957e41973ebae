// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A scalar datum: stored-procedure parameters, primary-key values and
/// record fields are all `Value`s. There is deliberately no float variant, so
/// that values (and therefore keys) have total equality, order and hashing.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// A `RecordKey` names one logical record: a table and the primary-key value
/// within it. Keys are the unit of locking, caching and partitioning.
#[derive(Clone, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: String,
    pub id: Value,
}

impl RecordKey {
    pub fn new(table: impl Into<String>, id: impl Into<Value>) -> Self {
        RecordKey {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Value::Int(i) => f.write_fmt(format_args!("{}/{}", self.table, i)),
            Value::Text(s) => f.write_fmt(format_args!("{}/{:?}", self.table, s)),
            other => f.write_fmt(format_args!("{}/{:?}", self.table, other)),
        }
    }
}

/// A materialized row: field names to values.
#[derive(Clone, Debug, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record(pub BTreeMap<String, Value>);

impl Record {
    pub fn new() -> Self {
        Record(BTreeMap::new())
    }

    pub fn with(mut self, field: impl Into<String>, val: impl Into<Value>) -> Self {
        self.set(field, val);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, val: impl Into<Value>) {
        self.0.insert(field.into(), val.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The state of a key as seen by a transaction. `Absent` means the store had
/// nothing for the key; `Deleted` is a tombstone staged by business logic that
/// becomes a removal when the transaction commits.
#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecVal {
    Absent,
    Present(Record),
    Deleted,
}

impl RecVal {
    pub fn record(&self) -> Option<&Record> {
        match self {
            RecVal::Present(r) => Some(r),
            RecVal::Absent | RecVal::Deleted => None,
        }
    }
}

impl From<Option<Record>> for RecVal {
    fn from(r: Option<Record>) -> Self {
        match r {
            Some(r) => RecVal::Present(r),
            None => RecVal::Absent,
        }
    }
}
