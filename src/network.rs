// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! This module glues together a set of partition connections and their IO
//! service loops provided by edelcrantz with the record cache. The only
//! traffic between partitions is the one-way push of a transaction's local
//! reads, so there are no requests or responses, just [OneWay] messages.

use crate::{Database, Error, PartitionId, Store, SyncBoxFuture, TupleBatch};
use async_std::{
    sync::{Arc, Mutex},
    task,
};
use futures::{
    channel::mpsc::{self, UnboundedSender},
    future, StreamExt,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, trace, warn, Instrument};

type Conn = edelcrantz::Connection<OneWay, (), ()>;
type Queue = edelcrantz::Queue<OneWay, (), ()>;

pub(crate) type Connection = (Arc<Mutex<Conn>>, Queue);

#[derive(Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum OneWay {
    Tuples(TupleBatch),
}

impl<S: Store> Database<S> {
    /// Adds a connection to a remote partition. The `io` handle should be a
    /// full-duplex `AsyncRead+AsyncWrite` type.
    pub async fn connect<IO: edelcrantz::AsyncReadWrite>(&self, peer: PartitionId, io: IO) {
        debug!(
            "connecting partitions self={:?} to other={:?}",
            self.self_id, peer
        );
        let conn = edelcrantz::Connection::new(io);
        let queue = conn.queue.clone();
        let pair = (Arc::new(Mutex::new(conn)), queue);
        let mut net_guard = self.connections.write().await;
        net_guard.insert(peer, pair);
    }

    pub(crate) fn serve_oneway(
        &self,
        remote: PartitionId,
        tuples_send: UnboundedSender<(PartitionId, TupleBatch)>,
        ow: OneWay,
    ) {
        match ow {
            OneWay::Tuples(batch) => {
                trace!("tuple batch {:?} from {:?}", batch.tag, remote);
                if tuples_send.unbounded_send((remote, batch)).is_err() {
                    warn!("tuple absorber gone, dropping batch from {:?}", remote);
                }
            }
        }
    }

    /// Start network-service worker tasks on this database. Should be called
    /// after every [Database::connect] and before any transaction executes.
    pub fn launch_workers(&self) -> SyncBoxFuture<()> {
        let this: Database<S> = self.clone();
        let fut = async move {
            let (tuples_send, mut tuples_recv) = mpsc::unbounded();
            task::spawn({
                let this = this.clone();
                let span = debug_span!("absorb", peer=?this.self_id);
                (async move {
                    while let Some((remote, batch)) = tuples_recv.next().await {
                        trace!("absorbing batch from {:?}", remote);
                        this.cache.absorb(batch).await;
                    }
                })
                .instrument(span)
            });
            for (id, conn) in this.connections.read().await.iter() {
                let id = *id;
                let conn = conn.0.clone();
                let t_send = tuples_send.clone();
                task::spawn({
                    let this = this.clone();
                    async move {
                        let mut n: usize = 0;
                        loop {
                            n += 1;
                            // Nobody sends requests; the handler exists to
                            // satisfy the connection's interface.
                            let sreq = |()| future::ready(());
                            let sow = {
                                let this = this.clone();
                                let t_send = t_send.clone();
                                move |ow| this.serve_oneway(id, t_send, ow)
                            };
                            let mut guard = conn.lock().await;
                            trace!(
                                "service worker task on {:?} talking to {:?} advancing (step {:?})",
                                this.self_id,
                                id,
                                n
                            );
                            let span = debug_span!("service", peer=?this.self_id, remote=?id);
                            let res = guard.advance(sreq, sow).instrument(span).await;
                            match res {
                                Ok(()) => (),
                                Err(e) => {
                                    debug!("connection to {:?} ended: {:?}", id, e);
                                    break;
                                }
                            }
                        }
                        warn!(
                            "service worker task on {:?} talking to {:?} exited",
                            this.self_id, id
                        );
                    }
                });
            }
        };
        Box::pin(fut)
    }

    /// Fire-and-forget delivery of `batch` to partition `dest`. A batch for
    /// ourselves goes straight into the cache. Delivery to a remote partition
    /// happens on its own task; failures there are only logged.
    pub(crate) async fn push_batch(&self, dest: PartitionId, batch: TupleBatch) -> Result<(), Error> {
        if dest == self.self_id {
            self.cache.absorb(batch).await;
            return Ok(());
        }
        let queue = match self.connections.read().await.get(&dest) {
            None => return Err(Error::UnknownPartition(dest)),
            Some((_, queue)) => queue.clone(),
        };
        trace!("pushing {} tuples to {:?}", batch.len(), dest);
        let span = debug_span!("push", peer=?self.self_id, ?dest);
        task::spawn(
            async move {
                if let Err(e) = queue.enqueue_oneway(OneWay::Tuples(batch)).await {
                    warn!("push to {:?} failed: {:?}", dest, Error::from(e));
                }
            }
            .instrument(span),
        );
        Ok(())
    }
}
