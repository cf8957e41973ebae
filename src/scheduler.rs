// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Database, Error, ResultSet, Runner, Schema, Store, TxnNum, Value};
use async_std::task;
use futures::{
    channel::mpsc::UnboundedSender,
    stream::{FuturesUnordered, Stream},
    StreamExt,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// One entry of the globally ordered request log: which procedure to run as
/// transaction `txn`, with what parameters. Every node sees the same log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRequest {
    pub txn: TxnNum,
    pub procedure: String,
    pub params: Vec<Value>,
}

/// Drives a node's share of the request log. Preparation and lock
/// reservation happen here, strictly one request at a time in log order;
/// execution happens on spawned tasks, as many at once as the config allows.
pub struct Scheduler<S: Store> {
    db: Database<S>,
    last: Option<TxnNum>,
}

impl<S: Store> Scheduler<S> {
    pub fn new(db: Database<S>) -> Self {
        Scheduler { db, last: None }
    }

    /// The last transaction admitted, if any.
    pub fn last_admitted(&self) -> Option<TxnNum> {
        self.last
    }

    fn check_order(&self, got: TxnNum) -> Result<(), Error> {
        match self.last {
            Some(prev) if got <= prev => Err(Error::OutOfOrderTxn { prev, got }),
            _ => Ok(()),
        }
    }

    // Unknown procedures have no schema to report.
    fn schema_of(&self, procedure: &str) -> Schema {
        self.db
            .procedures
            .get(procedure)
            .map(|p| p.result_schema())
            .unwrap_or_default()
    }

    // Prepare and reserve. Nothing here waits on other transactions.
    async fn admit(&mut self, req: TxnRequest) -> Result<Runner<S>, Error> {
        self.check_order(req.txn)?;
        let runner = Runner::prepare(&self.db, req)?;
        runner.request_conservative_locks().await?;
        self.last = Some(runner.txn_num());
        Ok(runner)
    }

    /// Consumes `requests` until it ends, then waits for every execution it
    /// started. Each transaction's result is sent on `results` as it
    /// finishes, so results for independent transactions may arrive out of
    /// log order. A request that can't be admitted is reported there as a
    /// failed result and otherwise skipped.
    pub async fn run<R>(&mut self, mut requests: R, results: UnboundedSender<(TxnNum, ResultSet)>)
    where
        R: Stream<Item = TxnRequest> + Unpin,
    {
        let limit = self.db.config.max_in_flight.max(1);
        let report = |txn: TxnNum, res: ResultSet| {
            if results.unbounded_send((txn, res)).is_err() {
                trace!("result receiver gone, dropping result for {:?}", txn);
            }
        };
        let mut in_flight = FuturesUnordered::new();
        while let Some(req) = requests.next().await {
            while in_flight.len() >= limit {
                if let Some((txn, res)) = in_flight.next().await {
                    report(txn, res);
                }
            }
            let txn = req.txn;
            let procedure = req.procedure.clone();
            match self.admit(req).await {
                Err(e) => {
                    warn!("could not admit {:?}: {}", txn, e);
                    report(txn, ResultSet::failed(self.schema_of(&procedure), e));
                }
                Ok(runner) => {
                    debug!("admitted {:?}", txn);
                    let handle = task::spawn(runner.execute());
                    in_flight.push(async move { (txn, handle.await) });
                }
            }
        }
        debug!("request stream ended, draining {} executions", in_flight.len());
        while let Some((txn, res)) = in_flight.next().await {
            report(txn, res);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Config, ExecContext, KeyDecl, MemStore, ModuloPartitioner, Outcome, PartitionId,
        Procedure, ProcedureRegistry, Record, RecordKey,
    };
    use futures::{channel::mpsc, stream};

    fn ctr() -> RecordKey {
        RecordKey::new("counter", 0)
    }

    // Adds params[0] to the counter and returns the new value.
    struct Incr;
    impl Procedure for Incr {
        fn declare_keys(&self, params: &[Value], keys: &mut KeyDecl) -> Result<(), Error> {
            if params.get(0).and_then(Value::as_int).is_none() {
                return Err(Error::BadParameters("increment must be an int".into()));
            }
            keys.add_read_key(ctr()).add_write_key(ctr());
            Ok(())
        }

        fn run(&self, params: &[Value], cx: &mut ExecContext<'_>) -> Outcome {
            let by = params[0].as_int().unwrap_or(0);
            let cur = match cx.read(&ctr()) {
                Ok(v) => v.record().and_then(|r| r.get("n")).and_then(Value::as_int),
                Err(e) => return Outcome::Failed(e),
            };
            let next = cur.unwrap_or(0) + by;
            match cx.write(&ctr(), Record::new().with("n", next)) {
                Ok(()) => Outcome::Committed(Record::new().with("n", next)),
                Err(e) => Outcome::Failed(e),
            }
        }

        fn result_schema(&self) -> Schema {
            Schema::new(vec!["n"])
        }
    }

    fn mk_db(max_in_flight: usize) -> Database<MemStore> {
        let mut procs = ProcedureRegistry::new();
        procs.register("incr", Incr);
        let config = Config {
            partition: PartitionId(0),
            max_in_flight,
        };
        Database::new(config, ModuloPartitioner::new(1), MemStore::new(), procs)
    }

    fn incr(txn: u64, by: Value) -> TxnRequest {
        TxnRequest {
            txn: TxnNum(txn),
            procedure: "incr".into(),
            params: vec![by],
        }
    }

    async fn run_all(
        db: &Database<MemStore>,
        reqs: Vec<TxnRequest>,
    ) -> Vec<(TxnNum, ResultSet)> {
        let (send, recv) = mpsc::unbounded();
        let mut sched = Scheduler::new(db.clone());
        sched.run(stream::iter(reqs), send).await;
        let mut out: Vec<_> = recv.collect().await;
        out.sort_by_key(|(t, _)| *t);
        out
    }

    #[test]
    fn conflicting_txns_apply_in_log_order() {
        task::block_on(async {
            for &limit in &[1, 4] {
                let db = mk_db(limit);
                let reqs = (1..=20).map(|i| incr(i, Value::Int(i as i64))).collect();
                let out = run_all(&db, reqs).await;
                assert_eq!(out.len(), 20);
                let mut expect = 0;
                for (i, (txn, res)) in out.iter().enumerate() {
                    let i = (i + 1) as i64;
                    expect += i;
                    assert_eq!(*txn, TxnNum(i as u64));
                    assert!(res.committed);
                    // Each txn saw exactly the writes of its predecessors.
                    assert_eq!(res.record, Record::new().with("n", expect));
                }
                let stored = db.store().read().await.get(&ctr());
                assert_eq!(stored, Some(Record::new().with("n", 210)));
                assert!(db.lock_mgr().is_idle().await);
                assert!(db.cache().cached_txns().await.is_empty());
            }
        });
    }

    #[test]
    fn rejected_requests_are_reported_and_skipped() {
        task::block_on(async {
            let db = mk_db(8);
            let reqs = vec![
                incr(1, Value::Int(1)),
                incr(2, Value::from("two")),
                incr(3, Value::Int(3)),
                incr(3, Value::Int(100)),
                TxnRequest {
                    txn: TxnNum(4),
                    procedure: "decr".into(),
                    params: vec![],
                },
                incr(5, Value::Int(5)),
            ];
            let out = run_all(&db, reqs).await;
            let failures: Vec<_> = out
                .iter()
                .filter(|(_, r)| !r.committed)
                .map(|(t, r)| (*t, r.error.clone()))
                .collect();
            let schemas: Vec<_> = out
                .iter()
                .filter(|(_, r)| !r.committed)
                .map(|(_, r)| r.schema.clone())
                .collect();
            assert_eq!(failures.len(), 3);
            // Known procedures report their own schema even when refused.
            assert_eq!(
                schemas,
                vec![Schema::new(vec!["n"]), Schema::new(vec!["n"]), Schema::default()]
            );
            assert!(matches!(failures[0], (TxnNum(2), Some(Error::BadParameters(_)))));
            assert_eq!(
                failures[1],
                (
                    TxnNum(3),
                    Some(Error::OutOfOrderTxn {
                        prev: TxnNum(3),
                        got: TxnNum(3)
                    })
                )
            );
            assert_eq!(
                failures[2],
                (TxnNum(4), Some(Error::UnknownProcedure("decr".into())))
            );
            let stored = db.store().read().await.get(&ctr());
            assert_eq!(stored, Some(Record::new().with("n", 9)));
        });
    }
}
