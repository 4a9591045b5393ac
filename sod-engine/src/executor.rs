// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Write-back executor.
//!
//! Metric persistence is amortised through an in-memory buffer: workers
//! append under a mutex, and the buffer reaches the store as one batch
//! transaction — either when it grows past `flush_size` or on the
//! `flush_time` ticker. A metric may be written more than once over its
//! lifecycle (NEW, then PROCESSED); the store overwrites by id, so the
//! last write wins.

use crate::error::{EngineError, Result};
use crate::metric::Metric;
use crate::store::{MetricStore, MetricWriter};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

struct Inner {
    store: MetricStore,
    flush_size: usize,
    buf: Mutex<Vec<Metric>>,
    /// Serialises drain-and-commit so concurrent flushes cannot reorder a
    /// metric's NEW write after its PROCESSED write.
    flush_lock: Mutex<()>,
}

impl Inner {
    /// Swap the buffer out and persist it as one batch. Errors are logged,
    /// never fatal: the pipeline keeps running.
    fn flush(&self) {
        let _ordering = self.flush_lock.lock();
        let batch = {
            let mut buf = self.buf.lock();
            if buf.is_empty() {
                return;
            }
            std::mem::take(&mut *buf)
        };
        debug!(count = batch.len(), "flushing write-back buffer");
        if let Err(e) = self.store.append_many(&batch) {
            error!(error = %e, "write-back flush failed");
        }
    }
}

/// Coalescing write buffer in front of the metric store. Cheap to clone;
/// clones share the buffer.
#[derive(Clone)]
pub struct TxExecutor {
    inner: Arc<Inner>,
    flush_time: Duration,
}

impl TxExecutor {
    pub fn new(store: MetricStore, flush_size: usize, flush_time: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                flush_size,
                buf: Mutex::new(Vec::new()),
                flush_lock: Mutex::new(()),
            }),
            flush_time,
        }
    }

    /// Buffer one metric, scheduling a background flush once the buffer
    /// reaches the configured size.
    pub fn write(&self, metric: Metric) {
        let len = {
            let mut buf = self.inner.buf.lock();
            buf.push(metric);
            buf.len()
        };
        if len >= self.inner.flush_size {
            let inner = Arc::clone(&self.inner);
            spawn_blocking(move || inner.flush());
        }
    }

    /// Flush the buffer synchronously.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Periodic flush loop; exits on cancellation without flushing — the
    /// shutdown path owns the final flush once the queues have drained.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_time);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let inner = Arc::clone(&self.inner);
                    let _ = spawn_blocking(move || inner.flush()).await;
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Final synchronous flush of whatever is left in the buffer.
    pub fn shutdown(&self) -> Result<()> {
        let _ordering = self.inner.flush_lock.lock();
        let batch = std::mem::take(&mut *self.inner.buf.lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.inner
            .store
            .append_many(&batch)
            .map_err(EngineError::Store)
    }

    /// Current buffer length.
    pub fn buffered(&self) -> usize {
        self.inner.buf.lock().len()
    }
}
