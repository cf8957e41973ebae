// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{CachedRecord, Error, RecVal, Record, RecordKey, TxnContext, Value};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// A `Procedure` is the interface between the executor and one kind of
/// stored procedure. Clients register an implementation per procedure name in
/// a [ProcedureRegistry]; the executor calls back into it to extract the key
/// sets and then to run the (deterministic) business logic.
///
/// Both calls happen on every active node with identical parameters, so both
/// must be pure functions of what they're given. `declare_keys` in particular
/// sees only the parameters: no store, no clock, nothing mutable.
pub trait Procedure: Send + Sync + 'static {
    /// Validates `params` and declares every key the business logic may
    /// touch. Declaration order matters: the first write key (or, failing
    /// that, the first read key) picks the master partition.
    fn declare_keys(&self, params: &[Value], keys: &mut KeyDecl) -> Result<(), Error>;

    /// The business logic. Runs only on active participants, after every
    /// remote read addressed to this partition has arrived.
    fn run(&self, params: &[Value], cx: &mut ExecContext<'_>) -> Outcome;

    fn is_read_only(&self, _params: &[Value]) -> bool {
        false
    }

    fn result_schema(&self) -> Schema {
        Schema::default()
    }
}

/// Collects a procedure's read and write keys in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyDecl {
    pub(crate) read_keys: Vec<RecordKey>,
    pub(crate) write_keys: Vec<RecordKey>,
}

impl KeyDecl {
    pub fn new() -> Self {
        KeyDecl::default()
    }

    pub fn add_read_key(&mut self, key: RecordKey) -> &mut Self {
        self.read_keys.push(key);
        self
    }

    pub fn add_write_key(&mut self, key: RecordKey) -> &mut Self {
        self.write_keys.push(key);
        self
    }

    pub fn read_keys(&self) -> &[RecordKey] {
        &self.read_keys
    }

    pub fn write_keys(&self) -> &[RecordKey] {
        &self.write_keys
    }
}

/// Field names of a procedure's result record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema(pub Vec<String>);

impl Schema {
    pub fn new<I, T>(fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Schema(fields.into_iter().map(Into::into).collect())
    }
}

/// What business logic decided. `Aborted` is an expected, voluntary
/// rollback; `Failed` is anything else that went wrong. Both roll back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Committed(Record),
    Aborted(String),
    Failed(Error),
}

impl From<Result<Record, Error>> for Outcome {
    fn from(r: Result<Record, Error>) -> Self {
        match r {
            Ok(rec) => Outcome::Committed(rec),
            Err(Error::TxnAbort(msg)) => Outcome::Aborted(msg),
            Err(e) => Outcome::Failed(e),
        }
    }
}

/// The view business logic gets of its transaction's records. Everything it
/// can read was put in the record cache beforehand, by read-through or by a
/// remote push, so every call is synchronous; writes are staged here and
/// handed back to the cache when the logic returns.
pub struct ExecContext<'a> {
    ctx: &'a TxnContext,
    records: BTreeMap<RecordKey, CachedRecord>,
}

impl<'a> ExecContext<'a> {
    pub(crate) fn new(ctx: &'a TxnContext, records: BTreeMap<RecordKey, CachedRecord>) -> Self {
        ExecContext { ctx, records }
    }

    pub fn txn_context(&self) -> &TxnContext {
        self.ctx
    }

    fn check_declared(&self, key: &RecordKey) -> Result<(), Error> {
        if self.ctx.is_declared(key) {
            Ok(())
        } else {
            Err(Error::UndeclaredKey(key.clone()))
        }
    }

    pub fn read(&self, key: &RecordKey) -> Result<&RecVal, Error> {
        self.check_declared(key)?;
        match self.records.get(key) {
            Some(r) => Ok(&r.value),
            // Declared, but a write key owned by some other partition: we
            // never see its current value.
            None => Err(Error::MissingRecord(key.clone())),
        }
    }

    /// Like `read`, but an absent or deleted record is [Error::MissingRecord].
    pub fn read_record(&self, key: &RecordKey) -> Result<&Record, Error> {
        self.read(key)?
            .record()
            .ok_or_else(|| Error::MissingRecord(key.clone()))
    }

    pub fn write(&mut self, key: &RecordKey, rec: Record) -> Result<(), Error> {
        self.stage(key, RecVal::Present(rec))
    }

    pub fn delete(&mut self, key: &RecordKey) -> Result<(), Error> {
        self.stage(key, RecVal::Deleted)
    }

    fn stage(&mut self, key: &RecordKey, value: RecVal) -> Result<(), Error> {
        self.check_declared(key)?;
        if self.ctx.read_only {
            return Err(Error::ReadOnlyWrite(key.clone()));
        }
        self.records.insert(key.clone(), CachedRecord::dirty(value));
        Ok(())
    }

    /// Voluntary rollback: `return cx.abort("...").into()` from `run`, or
    /// use it with `?` inside a helper returning `Result<Record, Error>`.
    pub fn abort<T>(&self, msg: impl Into<String>) -> Result<T, Error> {
        Err(Error::TxnAbort(msg.into()))
    }

    pub(crate) fn into_writes(self) -> Vec<(RecordKey, RecVal)> {
        self.records
            .into_iter()
            .filter(|(_, r)| r.dirty)
            .map(|(k, r)| (k, r.value))
            .collect()
    }
}

/// Maps procedure names to implementations. Built once at startup, then
/// shared read-only by every runner.
#[derive(Clone, Default)]
pub struct ProcedureRegistry {
    procs: HashMap<String, Arc<dyn Procedure>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        ProcedureRegistry::default()
    }

    pub fn register<P: Procedure>(&mut self, name: impl Into<String>, p: P) -> &mut Self {
        self.procs.insert(name.into(), Arc::new(p));
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Procedure>, Error> {
        self.procs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProcedure(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut ns: Vec<&str> = self.procs.keys().map(|s| s.as_str()).collect();
        ns.sort();
        ns
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ModuloPartitioner, PartitionId, TxnNum};

    fn key(i: i64) -> RecordKey {
        RecordKey::new("t", i)
    }

    fn ctx(read_only: bool) -> TxnContext {
        TxnContext::analyze(
            TxnNum(1),
            read_only,
            PartitionId(0),
            vec![key(0)],
            vec![key(2)],
            &ModuloPartitioner::new(2),
        )
    }

    #[test]
    fn exec_context_guards_declared_keys() {
        let ctx = ctx(false);
        let mut records = BTreeMap::new();
        records.insert(
            key(0),
            CachedRecord::clean(RecVal::Present(Record::new().with("v", 1))),
        );
        records.insert(key(2), CachedRecord::clean(RecVal::Absent));
        let mut cx = ExecContext::new(&ctx, records);

        assert_eq!(
            cx.read_record(&key(0)).unwrap().get("v"),
            Some(&Value::Int(1))
        );
        assert_eq!(cx.read(&key(4)), Err(Error::UndeclaredKey(key(4))));
        assert_eq!(cx.read_record(&key(2)), Err(Error::MissingRecord(key(2))));
        assert_eq!(
            cx.write(&key(6), Record::new()),
            Err(Error::UndeclaredKey(key(6)))
        );
        cx.write(&key(2), Record::new().with("v", 2)).unwrap();
        assert_eq!(
            cx.into_writes(),
            vec![(key(2), RecVal::Present(Record::new().with("v", 2)))]
        );
    }

    #[test]
    fn read_only_context_refuses_writes() {
        let ctx = ctx(true);
        let mut cx = ExecContext::new(&ctx, BTreeMap::new());
        assert_eq!(cx.delete(&key(2)), Err(Error::ReadOnlyWrite(key(2))));
        assert!(cx.into_writes().is_empty());
    }

    #[test]
    fn abort_is_distinguished_from_failure() {
        let ctx = ctx(false);
        let cx = ExecContext::new(&ctx, BTreeMap::new());
        let aborted: Result<Record, Error> = cx.abort("insufficient funds");
        assert_eq!(
            Outcome::from(aborted),
            Outcome::Aborted("insufficient funds".to_string())
        );
        let failed: Result<Record, Error> = cx.read_record(&key(0)).map(|r| r.clone());
        assert_eq!(
            Outcome::from(failed),
            Outcome::Failed(Error::MissingRecord(key(0)))
        );
    }

    struct Nop;
    impl Procedure for Nop {
        fn declare_keys(&self, _: &[Value], _: &mut KeyDecl) -> Result<(), Error> {
            Ok(())
        }
        fn run(&self, _: &[Value], _: &mut ExecContext<'_>) -> Outcome {
            Outcome::Committed(Record::new())
        }
    }

    #[test]
    fn registry_lookup() {
        let mut reg = ProcedureRegistry::new();
        reg.register("nop", Nop).register("also-nop", Nop);
        assert_eq!(reg.names(), vec!["also-nop", "nop"]);
        assert!(reg.get("nop").is_ok());
        assert_eq!(
            reg.get("missing").err(),
            Some(Error::UnknownProcedure("missing".to_string()))
        );
    }
}
