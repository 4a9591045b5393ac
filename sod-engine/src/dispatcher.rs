// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Dispatcher manager.
//!
//! The dispatcher owns all per-entity state — predictor, norm vector and
//! FIFO queue — and drives the full process lifecycle: startup recovery
//! from the store, per-point processing across per-entity worker pools,
//! background maintenance (write-back flushing, retention sweeps, index
//! rebuilds) and the graceful shutdown protocol.
//!
//! Shutdown order matters: ingest closes first, then the queues drain
//! through their workers, then the write-back buffer flushes, and only
//! then is the alert manager told to persist whatever it could not send.
//! Each stage reports completion on the shutdown channel; the binary
//! waits for all of them.

use crate::alert::AlertManager;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::TxExecutor;
use crate::metric::{Metric, Status};
use crate::queue::EntityQueue;
use crate::retention::RetentionScheduler;
use crate::store::{MetricReader, MetricRemover, MetricStore, Store};
use parking_lot::{Mutex, RwLock};
use sod::knn::DataPoint;
use sod::{Conclusion, LofConfig, LofPredictor, Point, RebuildPolicy};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Completion/fatal-error reporting channel for the shutdown barrier.
pub type ShutdownTx = UnboundedSender<Result<()>>;

/// Index maintenance cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

struct EntityState {
    predictor: LofPredictor,
    /// Most recent non-outlier point seen for this entity.
    norm_vec: Mutex<Option<Vec<f64>>>,
}

/// Routes ingested points to per-entity workers and owns their state.
pub struct Dispatcher {
    opts: EngineConfig,
    predictor_config: LofConfig,
    policy: RebuildPolicy,

    store: MetricStore,
    executor: TxExecutor,
    notifier: Arc<AlertManager>,

    entities: RwLock<HashMap<String, Arc<EntityState>>>,

    collect_tx: flume::Sender<Metric>,
    collect_rx: Mutex<Option<flume::Receiver<Metric>>>,

    closed: AtomicBool,
    alert_cancel: CancellationToken,
    tracker: TaskTracker,
    shutdown_tx: ShutdownTx,
}

impl Dispatcher {
    pub fn new(
        store: &Store,
        predictor_config: LofConfig,
        notifier: Arc<AlertManager>,
        shutdown_tx: ShutdownTx,
        opts: EngineConfig,
    ) -> Result<Arc<Self>> {
        let metrics = store.metrics();
        let executor = TxExecutor::new(metrics.clone(), opts.flush_size, opts.flush_time);
        let (collect_tx, collect_rx) = flume::bounded(1);
        Ok(Arc::new(Self {
            predictor_config,
            policy: RebuildPolicy::default(),
            store: metrics,
            executor,
            notifier,
            entities: RwLock::new(HashMap::new()),
            collect_tx,
            collect_rx: Mutex::new(Some(collect_rx)),
            closed: AtomicBool::new(false),
            alert_cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            shutdown_tx,
            opts,
        }))
    }

    /// Start every background loop and recover state from the store.
    ///
    /// Errors here are fatal: a dispatcher that cannot rebuild its
    /// predictors must not serve traffic.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        tokio::spawn(Arc::clone(&self).collector(cancel.clone()));
        tokio::spawn(self.executor.clone().run(cancel.clone()));

        let retention = RetentionScheduler::new(self.store.clone(), &self.opts);
        tokio::spawn(retention.run(cancel.clone()));
        tokio::spawn(Arc::clone(&self).maintenance_loop(cancel.clone()));

        self.bulk_load().await?;

        self.notifier.recover().await?;
        tokio::spawn(Arc::clone(&self.notifier).run(
            self.alert_cancel.clone(),
            self.shutdown_tx.clone(),
        ));

        tokio::spawn(Arc::clone(&self).coordinator(cancel));
        Ok(())
    }

    /// Accept metrics for processing, in submission order per entity.
    pub async fn collect(&self, metrics: Vec<Metric>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        for metric in metrics {
            self.collect_tx
                .send_async(metric)
                .await
                .map_err(|_| EngineError::ShuttingDown)?;
        }
        Ok(())
    }

    /// Pure query path: scores a point without touching the store, the
    /// dataset or the alert buffer.
    pub fn predict(&self, entity_id: &str, point: &Point) -> Result<Conclusion> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        let state = self.entity_state(entity_id)?;
        state.predictor.predict(point).map_err(EngineError::Predictor)
    }

    /// Number of points an entity's predictor currently holds.
    pub fn predictor_len(&self, entity_id: &str) -> usize {
        self.entities
            .read()
            .get(entity_id)
            .map_or(0, |state| state.predictor.len())
    }

    fn entity_state(&self, entity_id: &str) -> Result<Arc<EntityState>> {
        if let Some(state) = self.entities.read().get(entity_id) {
            return Ok(Arc::clone(state));
        }
        let mut entities = self.entities.write();
        if let Some(state) = entities.get(entity_id) {
            return Ok(Arc::clone(state));
        }
        let predictor = LofPredictor::new(self.predictor_config.clone())?;
        let state = Arc::new(EntityState {
            predictor,
            norm_vec: Mutex::new(None),
        });
        entities.insert(entity_id.to_string(), Arc::clone(&state));
        Ok(state)
    }

    /// Score and persist one point. Runs on a worker; errors are logged
    /// there and never abort the worker.
    pub async fn process(&self, mut metric: Metric) -> Result<()> {
        let state = self.entity_state(&metric.entity_id)?;

        // Warm-up: learn the point without scoring it.
        if state.predictor.len() < self.opts.skip_items.max(3) {
            metric.status = Status::Processed;
            self.executor.write(metric.clone());
            state.predictor.append(metric.data_point());
            return Ok(());
        }

        metric.status = Status::New;
        self.executor.write(metric.clone());

        let conclusion = match state.predictor.predict(&metric.point()) {
            Ok(conclusion) => conclusion,
            Err(predict_err) => {
                // A point the predictor cannot score would fail again on
                // restart; drop it from the store instead of replaying it.
                self.delete_metric(metric).await?;
                return Err(EngineError::Predictor(predict_err));
            }
        };

        metric.outlier = conclusion.outlier;

        if metric.outlier {
            info!(entity = %metric.entity_id, "outlier detected");
            if let Some(norm) = state.norm_vec.lock().clone() {
                metric.norm_vec = Some(norm);
            }
            self.alert(metric.clone());
        } else {
            *state.norm_vec.lock() = Some(metric.checked_vec.clone());
        }

        if !self.opts.allow_append_data {
            self.delete_metric(metric).await?;
            return Ok(());
        }

        if !metric.outlier || self.opts.allow_append_outlier {
            state.predictor.append(metric.data_point());
        }

        metric.status = Status::Processed;
        self.executor.write(metric);
        Ok(())
    }

    fn alert(&self, metric: Metric) {
        if self.closed.load(Ordering::Acquire) || !self.notifier.alerts_allowed() {
            return;
        }
        self.notifier.notify(vec![metric]);
    }

    async fn delete_metric(&self, metric: Metric) -> Result<()> {
        let store = self.store.clone();
        spawn_blocking(move || store.delete(&metric))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        Ok(())
    }

    /// Startup recovery: rebuild predictors from PROCESSED metrics and
    /// re-enqueue NEW ones whose first prediction never completed.
    async fn bulk_load(&self) -> Result<()> {
        let store = self.store.clone();
        let all = spawn_blocking(move || store.find_all(None))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;

        let mut processed: HashMap<String, Vec<DataPoint>> = HashMap::new();
        let mut pending = Vec::new();
        for metric in all {
            if metric.is_processed() {
                processed
                    .entry(metric.entity_id.clone())
                    .or_default()
                    .push(metric.data_point());
            } else {
                pending.push(metric);
            }
        }

        let entity_count = processed.len();
        for (entity_id, points) in processed {
            let state = self.entity_state(&entity_id)?;
            state.predictor.build(points);
        }
        if entity_count > 0 || !pending.is_empty() {
            info!(
                entities = entity_count,
                reenqueued = pending.len(),
                "recovered state from store"
            );
        }

        for metric in pending {
            self.collect_tx
                .send_async(metric)
                .await
                .map_err(|_| EngineError::ShuttingDown)?;
        }
        Ok(())
    }

    /// Routes ingested metrics onto per-entity queues, creating the queue
    /// and its worker pool on first sight of an entity.
    async fn collector(self: Arc<Self>, cancel: CancellationToken) {
        let receiver = self
            .collect_rx
            .lock()
            .take()
            .expect("collector started exactly once");
        let mut queues: HashMap<String, EntityQueue> = HashMap::new();

        loop {
            tokio::select! {
                received = receiver.recv_async() => {
                    let Ok(metric) = received else { break };
                    let queue = queues
                        .entry(metric.entity_id.clone())
                        .or_insert_with(|| Self::spawn_entity_queue(&self));
                    if queue.send(metric).await.is_err() {
                        warn!("entity queue fibre is gone; dropping point");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        self.closed.store(true, Ordering::Release);
        // Dropping the queues closes their inbound sides; each fibre
        // drains its backlog to the workers and then hangs up.
        drop(queues);
    }

    fn spawn_entity_queue(this: &Arc<Self>) -> EntityQueue {
        let (queue, fibre) = EntityQueue::new();
        this.tracker.spawn(fibre);

        for _ in 0..this.opts.workers_per_entity() {
            let receiver = queue.receiver();
            let worker = Arc::clone(this);
            this.tracker.spawn(async move {
                while let Ok(metric) = receiver.recv_async().await {
                    if let Err(e) = worker.process(metric).await {
                        error!(error = %e, "unable to process metric");
                    }
                }
            });
        }
        queue
    }

    /// Drives in-memory retention plus green/blue rebuilds and rebalances
    /// across all predictors. The size check runs on a 5s cadence and the
    /// age check on a 60s cadence; both feed the removal counter, so the
    /// next rebuild makes the eviction visible to queries.
    async fn maintenance_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick += 1;
                    let this = Arc::clone(&self);
                    let shrink = this.opts.max_items_stored > 0 && tick % 5 == 0;
                    let expire = !this.opts.max_storage_time.is_zero() && tick % 60 == 0;
                    let _ = spawn_blocking(move || this.maintain_predictors(shrink, expire)).await;
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    fn maintain_predictors(&self, shrink: bool, expire: bool) {
        let states: Vec<Arc<EntityState>> = self.entities.read().values().cloned().collect();
        let horizon = chrono::Duration::from_std(self.opts.max_storage_time).ok();
        for state in states {
            if shrink {
                state.predictor.shrink_to(self.opts.max_items_stored);
            }
            if expire {
                if let Some(horizon) = horizon {
                    state
                        .predictor
                        .remove_older_than(chrono::Utc::now() - horizon);
                }
            }
            state.predictor.maintain(&self.policy);
        }
    }

    /// Orchestrates the drain: queues first, then the final flush, then
    /// the alert manager. Reports the worker-pool and flusher completions.
    async fn coordinator(self: Arc<Self>, cancel: CancellationToken) {
        cancel.cancelled().await;
        self.closed.store(true, Ordering::Release);

        self.tracker.close();
        self.tracker.wait().await;
        let _ = self.shutdown_tx.send(Ok(()));

        let executor = self.executor.clone();
        let flush_result = spawn_blocking(move || executor.shutdown())
            .await
            .map_err(|e| EngineError::Task(e.to_string()))
            .and_then(|r| r);
        let _ = self.shutdown_tx.send(flush_result);

        self.alert_cancel.cancel();
    }
}
