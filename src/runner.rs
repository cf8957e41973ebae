// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The per-transaction protocol. A [Runner] is driven through three phases by
//! the [crate::Scheduler]:
//!
//!   1. [Runner::prepare] declares keys and analyzes the read/write sets.
//!
//!   2. [Runner::request_conservative_locks] reserves the locks. This has to
//!      happen in global transaction order, and never blocks.
//!
//!   3. [Runner::execute] waits for the locks, pushes local reads to the other
//!      active participants, waits for theirs, runs the business logic if this
//!      partition is active, commits or rolls back, and cleans up.
//!
//! Execute never fails: every error ends as a rolled-back [ResultSet].

use crate::{
    BatchTag, Database, Error, ExecContext, Isolation, KeyDecl, Outcome, Procedure, Record,
    RecordKey, Schema, Store, SyncBoxFuture, Transaction, TupleBatch, TxnContext, TxnNum,
    TxnRequest, Value,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, debug_span, instrument, trace, warn, Instrument};

/// What a transaction produced on one partition. `committed` is false on
/// any rollback, voluntary or not, with the cause in `error`. A partition
/// that didn't have to run the business logic reports a committed, empty
/// record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub committed: bool,
    pub schema: Schema,
    pub record: Record,
    pub error: Option<Error>,
}

impl ResultSet {
    pub(crate) fn failed(schema: Schema, error: Error) -> Self {
        ResultSet {
            committed: false,
            schema,
            record: Record::new(),
            error: Some(error),
        }
    }
}

pub struct Runner<S: Store> {
    db: Database<S>,
    procedure: Arc<dyn Procedure>,
    params: Vec<Value>,
    ctx: TxnContext,
    tx: Transaction,
}

impl<S: Store> Runner<S> {
    /// Phase 1. Finds the procedure, has it declare its keys, begins the
    /// storage transaction and works out who does what. An error here means
    /// the transaction never reaches lock admission.
    #[instrument(skip(db, req))]
    pub fn prepare(db: &Database<S>, req: TxnRequest) -> Result<Self, Error> {
        let TxnRequest {
            txn,
            procedure,
            params,
        } = req;
        let procedure = db.procedures.get(&procedure)?;

        let mut keys = KeyDecl::new();
        contain_panic(|| procedure.declare_keys(&params, &mut keys))??;
        let read_only = procedure.is_read_only(&params);

        let mut tx = Transaction::begin(Isolation::Serializable, read_only, txn);
        if let Some(l) = &db.lifecycle {
            tx.add_lifecycle_listener(l.clone());
        }

        let KeyDecl {
            read_keys,
            write_keys,
        } = keys;
        let ctx = TxnContext::analyze(
            txn,
            read_only,
            db.self_id,
            read_keys,
            write_keys,
            db.partitioner(),
        );
        debug!(
            "prepared: master={:?} participant={} active={}",
            ctx.master,
            ctx.is_participant(),
            ctx.is_active()
        );
        Ok(Runner {
            db: db.clone(),
            procedure,
            params,
            ctx,
            tx,
        })
    }

    /// Phase 2. Reserves this transaction's place in every key's lock queue.
    pub async fn request_conservative_locks(&self) -> Result<(), Error> {
        self.db
            .lock_mgr
            .reserve(self.ctx.txn, &self.ctx.read_keys, &self.ctx.write_keys)
            .await
    }

    /// Phase 3. Resolves once the transaction has committed or rolled back
    /// here, its cache entries are gone and its locks are released.
    pub fn execute(self) -> SyncBoxFuture<ResultSet> {
        let span = debug_span!("execute", peer=?self.db.self_id, txn=?self.ctx.txn);
        Box::pin(self.execute_().instrument(span))
    }

    async fn execute_(mut self) -> ResultSet {
        let txn = self.ctx.txn;
        debug!("begin execute");
        let outcome = self.run_protocol().await;
        let result = self.finish(outcome).await;

        // Both of these happen on every path, after the outcome is settled.
        self.db.cache.cleanup(txn).await;
        self.db.lock_mgr.release(txn).await;
        debug!("end execute, committed={}", result.committed);
        result
    }

    async fn run_protocol(&self) -> Outcome {
        let txn = self.ctx.txn;
        if let Err(e) = self.db.lock_mgr.acquire(txn).await {
            return Outcome::Failed(e);
        }

        self.push_local_reads().await;

        if !self.ctx.is_active() {
            trace!("not an active participant, skipping business logic");
            return Outcome::Committed(Record::new());
        }

        self.db
            .cache
            .wait_for_sources(txn, &self.ctx.remote_read_sources)
            .await;

        let records = match self.gather_records().await {
            Ok(r) => r,
            Err(e) => return Outcome::Failed(e),
        };
        let mut cx = ExecContext::new(&self.ctx, records);
        debug!("running business logic");
        let outcome = match contain_panic(|| self.procedure.run(&self.params, &mut cx)) {
            Ok(outcome) => outcome,
            Err(e) => return Outcome::Failed(e),
        };
        if let Outcome::Committed(_) = outcome {
            for (k, v) in cx.into_writes() {
                self.db.cache.write(&k, txn, v).await;
            }
        }
        outcome
    }

    // Reads every local read key through the cache and ships the lot to the
    // other active participants. Runs on every participant, active or not.
    async fn push_local_reads(&self) {
        let txn = self.ctx.txn;
        let mut batch = TupleBatch::new(BatchTag::AdHoc, self.db.self_id);
        for k in self.ctx.local_read_keys.iter() {
            let rec = self.db.cache.read_through(k, txn).await;
            batch.add_tuple(k.clone(), txn, txn, rec.value);
        }
        if batch.is_empty() {
            return;
        }
        for p in self.ctx.push_targets() {
            if let Err(e) = self.db.push_batch(p, batch.clone()).await {
                warn!("could not push local reads to {:?}: {}", p, e);
            }
        }
    }

    // Everything business logic may read: declared keys that are either local
    // or were pushed to us. A remote write key that nobody pushed is left out;
    // reading it is a MissingRecord.
    async fn gather_records(&self) -> Result<BTreeMap<RecordKey, crate::CachedRecord>, Error> {
        let txn = self.ctx.txn;
        let mut records = BTreeMap::new();
        for k in self.ctx.read_keys.iter().chain(self.ctx.write_keys.iter()) {
            if records.contains_key(k) {
                continue;
            }
            match self.db.cache.read(k, txn).await {
                Ok(rec) => {
                    records.insert(k.clone(), rec);
                }
                Err(Error::MissingRecord(_)) if !self.ctx.read_keys.contains(k) => (),
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn finish(&mut self, outcome: Outcome) -> ResultSet {
        let schema = self.procedure.result_schema();
        match outcome {
            Outcome::Committed(record) => {
                let writes = self.db.cache.dirty_records(self.ctx.txn).await;
                let res = {
                    let mut store = self.db.store.write().await;
                    self.tx.commit(&mut *store, writes)
                };
                match res {
                    Ok(()) => {
                        debug!("committed");
                        ResultSet {
                            committed: true,
                            schema,
                            record,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!("commit refused: {}", e);
                        self.tx.rollback();
                        ResultSet::failed(schema, e)
                    }
                }
            }
            Outcome::Aborted(msg) => {
                debug!("aborted by business logic: {}", msg);
                self.tx.rollback();
                ResultSet::failed(schema, Error::TxnAbort(msg))
            }
            Outcome::Failed(e) => {
                warn!("failed, rolling back: {}", e);
                self.tx.rollback();
                ResultSet::failed(schema, e)
            }
        }
    }

    pub fn txn_num(&self) -> TxnNum {
        self.ctx.txn
    }

    pub fn context(&self) -> &TxnContext {
        &self.ctx
    }

    pub fn is_read_only(&self) -> bool {
        self.ctx.read_only
    }

    pub fn is_master(&self) -> bool {
        self.ctx.is_master()
    }

    pub fn is_participant(&self) -> bool {
        self.ctx.is_participant()
    }

    pub fn is_active(&self) -> bool {
        self.ctx.is_active()
    }

    pub fn read_set(&self) -> &[RecordKey] {
        &self.ctx.read_keys
    }

    pub fn write_set(&self) -> &[RecordKey] {
        &self.ctx.write_keys
    }
}

// Procedures are user code. A panic in one becomes an ordinary failure, so
// the usual rollback, cleanup and release still happen.
fn contain_panic<T>(f: impl FnOnce() -> T) -> Result<T, Error> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        warn!("procedure panicked: {}", msg);
        Error::ProcedurePanicked(msg)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Config, MemStore, ModuloPartitioner, PartitionId, ProcedureRegistry, TxnLifecycle,
    };
    use async_std::{future, task};
    use std::{sync::Mutex, time::Duration};

    fn acct(i: i64) -> RecordKey {
        RecordKey::new("acct", i)
    }

    fn bal(r: &Record) -> i64 {
        r.get("bal").and_then(Value::as_int).unwrap_or(0)
    }

    fn param_int(params: &[Value], i: usize) -> Result<i64, Error> {
        params
            .get(i)
            .and_then(Value::as_int)
            .ok_or_else(|| Error::BadParameters(format!("param {} must be an int", i)))
    }

    // params: [from, to, amount]. Reads both, writes both.
    struct Transfer;
    impl Procedure for Transfer {
        fn declare_keys(&self, params: &[Value], keys: &mut KeyDecl) -> Result<(), Error> {
            let from = acct(param_int(params, 0)?);
            let to = acct(param_int(params, 1)?);
            keys.add_read_key(from.clone())
                .add_read_key(to.clone())
                .add_write_key(from)
                .add_write_key(to);
            Ok(())
        }

        fn run(&self, params: &[Value], cx: &mut ExecContext<'_>) -> Outcome {
            transfer_logic(params, cx).into()
        }

        fn result_schema(&self) -> Schema {
            Schema::new(vec!["from_bal"])
        }
    }

    fn transfer_logic(params: &[Value], cx: &mut ExecContext<'_>) -> Result<Record, Error> {
        let (from, to) = (acct(param_int(params, 0)?), acct(param_int(params, 1)?));
        let amount = param_int(params, 2)?;
        let from_bal = bal(cx.read_record(&from)?);
        let to_bal = bal(cx.read_record(&to)?);
        if from_bal < amount {
            return cx.abort("insufficient funds");
        }
        cx.write(&from, Record::new().with("bal", from_bal - amount))?;
        cx.write(&to, Record::new().with("bal", to_bal + amount))?;
        Ok(Record::new().with("from_bal", from_bal - amount))
    }

    // Reads a key it never declared.
    struct Sneaky;
    impl Procedure for Sneaky {
        fn declare_keys(&self, _: &[Value], keys: &mut KeyDecl) -> Result<(), Error> {
            keys.add_write_key(acct(0));
            Ok(())
        }
        fn run(&self, _: &[Value], cx: &mut ExecContext<'_>) -> Outcome {
            match cx.read(&acct(2)) {
                Ok(_) => Outcome::Committed(Record::new()),
                Err(e) => Outcome::Failed(e),
            }
        }
    }

    // params: [id]. Indexes past its parameters in both steps: with no
    // params it panics while declaring, otherwise while running.
    struct Boom;
    impl Procedure for Boom {
        fn declare_keys(&self, params: &[Value], keys: &mut KeyDecl) -> Result<(), Error> {
            keys.add_write_key(acct(params[0].as_int().unwrap_or(0)));
            Ok(())
        }
        fn run(&self, params: &[Value], _: &mut ExecContext<'_>) -> Outcome {
            Outcome::Committed(Record::new().with("v", params[5].clone()))
        }
    }

    #[derive(Default, Clone)]
    struct Log(Arc<Mutex<Vec<String>>>);
    impl TxnLifecycle for Log {
        fn on_commit(&self, txn: TxnNum) {
            self.0.lock().unwrap().push(format!("commit {:?}", txn));
        }
        fn on_rollback(&self, txn: TxnNum) {
            self.0.lock().unwrap().push(format!("rollback {:?}", txn));
        }
    }

    // One partition owns everything.
    fn mk_db(log: Log) -> Database<MemStore> {
        let store = MemStore::new()
            .with_record(acct(0), Record::new().with("bal", 100))
            .with_record(acct(2), Record::new().with("bal", 5));
        let mut procs = ProcedureRegistry::new();
        procs
            .register("transfer", Transfer)
            .register("sneaky", Sneaky)
            .register("boom", Boom);
        Database::new(
            Config::for_partition(PartitionId(0)),
            ModuloPartitioner::new(1),
            store,
            procs,
        )
        .with_lifecycle(log)
    }

    fn transfer(txn: u64, from: i64, to: i64, amount: i64) -> TxnRequest {
        TxnRequest {
            txn: TxnNum(txn),
            procedure: "transfer".to_string(),
            params: vec![from.into(), to.into(), amount.into()],
        }
    }

    async fn run(db: &Database<MemStore>, req: TxnRequest) -> ResultSet {
        let r = Runner::prepare(db, req).unwrap();
        r.request_conservative_locks().await.unwrap();
        r.execute().await
    }

    async fn balance(db: &Database<MemStore>, i: i64) -> i64 {
        db.store().read().await.get(&acct(i)).map(|r| bal(&r)).unwrap_or(0)
    }

    #[test]
    fn single_partition_commit() {
        task::block_on(async {
            let log = Log::default();
            let db = mk_db(log.clone());
            let r = Runner::prepare(&db, transfer(1, 0, 2, 30)).unwrap();
            assert!(r.is_master() && r.is_participant() && r.is_active());
            assert!(!r.is_read_only());
            assert_eq!(r.read_set(), &[acct(0), acct(2)]);
            r.request_conservative_locks().await.unwrap();
            let res = r.execute().await;
            assert!(res.committed);
            assert_eq!(res.schema, Schema::new(vec!["from_bal"]));
            assert_eq!(res.record, Record::new().with("from_bal", 70));
            assert_eq!(balance(&db, 0).await, 70);
            assert_eq!(balance(&db, 2).await, 35);
            assert!(db.cache().cached_txns().await.is_empty());
            assert!(db.lock_mgr().is_idle().await);
            assert_eq!(*log.0.lock().unwrap(), vec!["commit T1".to_string()]);
        });
    }

    #[test]
    fn voluntary_abort_rolls_back_and_cleans_up() {
        task::block_on(async {
            let log = Log::default();
            let db = mk_db(log.clone());
            let res = run(&db, transfer(1, 2, 0, 500)).await;
            assert!(!res.committed);
            assert_eq!(res.error, Some(Error::TxnAbort("insufficient funds".into())));
            assert_eq!(res.record, Record::new());
            assert_eq!(balance(&db, 0).await, 100);
            assert_eq!(balance(&db, 2).await, 5);
            assert!(db.cache().cached_txns().await.is_empty());
            assert!(db.lock_mgr().is_idle().await);
            assert_eq!(*log.0.lock().unwrap(), vec!["rollback T1".to_string()]);
        });
    }

    #[test]
    fn undeclared_access_fails() {
        task::block_on(async {
            let db = mk_db(Log::default());
            let req = TxnRequest {
                txn: TxnNum(3),
                procedure: "sneaky".into(),
                params: vec![],
            };
            let res = run(&db, req).await;
            assert!(!res.committed);
            assert_eq!(res.error, Some(Error::UndeclaredKey(acct(2))));
            assert!(db.cache().cached_txns().await.is_empty());
        });
    }

    #[test]
    fn declaration_errors_stop_at_prepare() {
        let db = mk_db(Log::default());
        let bad = TxnRequest {
            txn: TxnNum(1),
            procedure: "transfer".into(),
            params: vec![Value::from("zero"), 2.into(), 1.into()],
        };
        assert!(matches!(
            Runner::prepare(&db, bad),
            Err(Error::BadParameters(_))
        ));
        let unknown = TxnRequest {
            txn: TxnNum(2),
            procedure: "nope".into(),
            params: vec![],
        };
        assert!(matches!(
            Runner::prepare(&db, unknown),
            Err(Error::UnknownProcedure(_))
        ));
    }

    #[test]
    fn second_writer_waits_for_first_commit() {
        task::block_on(async {
            let db = mk_db(Log::default());
            let t1 = Runner::prepare(&db, transfer(1, 0, 2, 10)).unwrap();
            let t2 = Runner::prepare(&db, transfer(2, 0, 2, 20)).unwrap();
            t1.request_conservative_locks().await.unwrap();
            t2.request_conservative_locks().await.unwrap();

            // Start T2 first; it can't get past acquire while T1 is queued
            // ahead of it.
            let h2 = task::spawn(t2.execute());
            assert!(future::timeout(Duration::from_millis(50), db.lock_mgr().acquire(TxnNum(2)))
                .await
                .is_err());
            assert_eq!(balance(&db, 0).await, 100);

            let r1 = t1.execute().await;
            assert!(r1.committed);
            let r2 = h2.await;
            assert!(r2.committed);
            // T2 saw T1's write.
            assert_eq!(r2.record, Record::new().with("from_bal", 70));
            assert_eq!(balance(&db, 2).await, 35);
            assert!(db.lock_mgr().is_idle().await);
        });
    }

    #[test]
    fn staged_writes_never_reach_store_on_failure() {
        task::block_on(async {
            let db = mk_db(Log::default());
            let r = Runner::prepare(&db, transfer(4, 0, 2, 1)).unwrap();
            // Skip reservation: acquire refuses, execute still cleans up.
            let res = r.execute().await;
            assert!(!res.committed);
            assert_eq!(res.error, Some(Error::LocksNotReserved(TxnNum(4))));
            assert_eq!(
                db.store().read().await.get(&acct(0)),
                Some(Record::new().with("bal", 100))
            );
            assert!(!db.cache().contains(TxnNum(4)).await);
        });
    }

    #[test]
    fn panicking_logic_still_releases_locks() {
        task::block_on(async {
            let log = Log::default();
            let db = mk_db(log.clone());
            let boom = TxnRequest {
                txn: TxnNum(1),
                procedure: "boom".into(),
                params: vec![0.into()],
            };
            let t1 = Runner::prepare(&db, boom).unwrap();
            let t2 = Runner::prepare(&db, transfer(2, 0, 2, 10)).unwrap();
            t1.request_conservative_locks().await.unwrap();
            t2.request_conservative_locks().await.unwrap();

            let h2 = task::spawn(t2.execute());
            let r1 = t1.execute().await;
            assert!(!r1.committed);
            assert!(matches!(r1.error, Some(Error::ProcedurePanicked(_))));

            let r2 = future::timeout(Duration::from_secs(5), h2)
                .await
                .expect("T2 never got T1's lock");
            assert!(r2.committed);
            assert_eq!(balance(&db, 0).await, 90);
            assert!(db.lock_mgr().is_idle().await);
            assert!(db.cache().cached_txns().await.is_empty());
            assert_eq!(
                *log.0.lock().unwrap(),
                vec!["rollback T1".to_string(), "commit T2".to_string()]
            );
        });
    }

    #[test]
    fn panicking_declaration_is_a_prepare_error() {
        let db = mk_db(Log::default());
        let boom = TxnRequest {
            txn: TxnNum(1),
            procedure: "boom".into(),
            params: vec![],
        };
        assert!(matches!(
            Runner::prepare(&db, boom),
            Err(Error::ProcedurePanicked(_))
        ));
    }
}
