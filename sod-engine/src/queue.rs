// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-entity FIFO queue.
//!
//! An unbounded backlog bridged by exactly two one-slot channels: the
//! producer side feeds `inbound`, any number of workers receive from
//! `outbound`, and an internal fibre in between always offers the current
//! head while appending arrivals to the tail. Insertion order is preserved
//! up to worker hand-off; the workers themselves run in parallel, so
//! per-point completion order is not guaranteed.
//!
//! Dropping the [`EntityQueue`] closes the inbound side; the fibre then
//! drains the backlog to the workers and closes the outbound side, so a
//! graceful shutdown processes every pending point.

use crate::metric::Metric;
use std::collections::VecDeque;
use std::future::Future;

/// Producer handle for one entity's queue.
pub struct EntityQueue {
    sender: flume::Sender<Metric>,
    receiver: flume::Receiver<Metric>,
}

impl EntityQueue {
    /// Build the queue, returning the internal fibre for the caller to
    /// spawn.
    pub fn new() -> (Self, impl Future<Output = ()> + Send + 'static) {
        let (in_tx, in_rx) = flume::bounded(1);
        let (out_tx, out_rx) = flume::bounded(1);
        let fibre = run_fibre(in_rx, out_tx);
        (
            Self {
                sender: in_tx,
                receiver: out_rx,
            },
            fibre,
        )
    }

    /// Enqueue one metric. Waits while the inbound slot is occupied;
    /// fails once the fibre is gone.
    pub async fn send(&self, metric: Metric) -> Result<(), ()> {
        self.sender.send_async(metric).await.map_err(|_| ())
    }

    /// A worker-side receive handle. Clones share the queue: any one
    /// worker takes each point.
    pub fn receiver(&self) -> flume::Receiver<Metric> {
        self.receiver.clone()
    }
}

async fn run_fibre(in_rx: flume::Receiver<Metric>, out_tx: flume::Sender<Metric>) {
    let mut backlog: VecDeque<Metric> = VecDeque::new();
    loop {
        if let Some(front) = backlog.front().cloned() {
            tokio::select! {
                res = out_tx.send_async(front) => {
                    if res.is_err() {
                        return;
                    }
                    backlog.pop_front();
                }
                res = in_rx.recv_async() => {
                    match res {
                        Ok(metric) => backlog.push_back(metric),
                        Err(_) => break,
                    }
                }
            }
        } else {
            match in_rx.recv_async().await {
                Ok(metric) => backlog.push_back(metric),
                Err(_) => return,
            }
        }
    }

    // Inbound closed with points pending: hand the rest to the workers.
    while let Some(front) = backlog.pop_front() {
        if out_tx.send_async(front).await.is_err() {
            return;
        }
    }
}
