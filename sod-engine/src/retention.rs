// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Retention scheduler.
//!
//! Periodically walks every entity bucket and enforces the configured
//! size and age bounds, each in one batch deletion. Only PROCESSED
//! metrics are eligible: a NEW metric is in flight and must survive until
//! its prediction completes. Failures are logged and retried implicitly
//! by the next sweep.

use crate::config::EngineConfig;
use crate::metric::Metric;
use crate::store::{EntityLister, MetricReader, MetricRemover, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Periodic size/TTL enforcement over the metric store.
pub struct RetentionScheduler<S> {
    store: S,
    max_items_stored: usize,
    max_storage_time: Duration,
    interval: Duration,
}

impl<S> RetentionScheduler<S>
where
    S: EntityLister + MetricReader + MetricRemover + Send + Sync + 'static,
{
    pub fn new(store: S, config: &EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            max_items_stored: config.max_items_stored,
            max_storage_time: config.max_storage_time,
            interval: config.rebuild_db_time,
        })
    }

    /// Sweep loop; runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    let _ = spawn_blocking(move || this.sweep()).await;
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// One full pass: the size sweep, then the age sweep.
    pub fn sweep(&self) {
        if self.max_items_stored > 0 {
            self.sweep_size();
        }
        if !self.max_storage_time.is_zero() {
            self.sweep_age();
        }
    }

    fn sweep_size(&self) {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "size sweep: listing entities failed");
                return;
            }
        };
        for entity_id in &keys {
            if let Err(e) = self.shrink_entity(entity_id) {
                warn!(entity = %entity_id, error = %e, "size sweep failed");
            }
        }
    }

    /// Delete the oldest PROCESSED metrics beyond the per-entity cap.
    fn shrink_entity(&self, entity_id: &str) -> Result<(), StoreError> {
        let count = self.store.count(entity_id)?;
        if count <= self.max_items_stored {
            return Ok(());
        }

        let mut metrics = self
            .store
            .find_by_entity(entity_id, Some(&|m: &Metric| m.is_processed()))?;
        metrics.sort_by_key(|m| m.created_at);

        let surplus = (count - self.max_items_stored).min(metrics.len());
        if surplus == 0 {
            return Ok(());
        }
        self.store.delete_many(&metrics[..surplus])?;
        debug!(entity = %entity_id, removed = surplus, "size sweep pruned entity");
        Ok(())
    }

    fn sweep_age(&self) {
        let Ok(horizon) = chrono::Duration::from_std(self.max_storage_time) else {
            warn!("age sweep: retention period out of range");
            return;
        };
        let cutoff = Utc::now() - horizon;

        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "age sweep: listing entities failed");
                return;
            }
        };
        for entity_id in &keys {
            let result = self
                .store
                .find_by_entity(
                    entity_id,
                    Some(&|m: &Metric| m.is_processed() && m.created_at < cutoff),
                )
                .and_then(|expired| {
                    let n = expired.len();
                    self.store.delete_many(&expired)?;
                    Ok(n)
                });
            match result {
                Ok(0) => {}
                Ok(n) => debug!(entity = %entity_id, removed = n, "age sweep pruned entity"),
                Err(e) => warn!(entity = %entity_id, error = %e, "age sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Status;
    use crate::store::{MetricWriter, Store};
    use chrono::TimeZone;

    fn scheduler(
        max_items: usize,
        max_age: Duration,
    ) -> (tempfile::TempDir, Store, Arc<RetentionScheduler<crate::store::MetricStore>>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("sod.redb")).unwrap();
        let config = EngineConfig {
            max_items_stored: max_items,
            max_storage_time: max_age,
            ..EngineConfig::default()
        };
        let scheduler = RetentionScheduler::new(store.metrics(), &config);
        (dir, store, scheduler)
    }

    fn processed(entity: &str, secs: i64) -> Metric {
        let mut m = Metric::new(
            entity,
            vec![secs as f64],
            Utc.timestamp_opt(secs, 0).unwrap(),
            serde_json::Value::Null,
        );
        m.status = Status::Processed;
        m
    }

    #[test]
    fn test_size_sweep_keeps_newest() {
        let (_dir, store, scheduler) = scheduler(3, Duration::ZERO);
        let batch: Vec<Metric> = (0..10).map(|i| processed("cpu", i)).collect();
        store.metrics().append_many(&batch).unwrap();

        scheduler.sweep();

        let left = store.metrics().find_by_entity("cpu", None).unwrap();
        assert_eq!(left.len(), 3);
        let mut secs: Vec<i64> = left.iter().map(|m| m.created_at.timestamp()).collect();
        secs.sort();
        assert_eq!(secs, vec![7, 8, 9]);
    }

    #[test]
    fn test_size_sweep_spares_new_metrics() {
        let (_dir, store, scheduler) = scheduler(1, Duration::ZERO);
        let mut batch: Vec<Metric> = (0..3).map(|i| processed("cpu", i)).collect();
        batch.push(Metric::new(
            "cpu",
            vec![99.0],
            Utc.timestamp_opt(99, 0).unwrap(),
            serde_json::Value::Null,
        ));
        store.metrics().append_many(&batch).unwrap();

        scheduler.sweep();

        let left = store.metrics().find_by_entity("cpu", None).unwrap();
        // The NEW metric survives; enough PROCESSED ones are pruned to
        // bring the bucket back to the cap.
        assert!(left.iter().any(|m| m.is_new()));
        assert!(left.len() <= 2);
    }

    #[test]
    fn test_age_sweep_removes_expired() {
        let (_dir, store, scheduler) = scheduler(0, Duration::from_secs(60));
        let old = processed("cpu", 1);
        let mut fresh = processed("cpu", 0);
        fresh.created_at = Utc::now();
        store
            .metrics()
            .append_many(&[old, fresh.clone()])
            .unwrap();

        scheduler.sweep();

        let left = store.metrics().find_by_entity("cpu", None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, fresh.id);
    }

    #[test]
    fn test_disabled_sweeps_do_nothing() {
        let (_dir, store, scheduler) = scheduler(0, Duration::ZERO);
        let batch: Vec<Metric> = (0..5).map(|i| processed("cpu", i)).collect();
        store.metrics().append_many(&batch).unwrap();

        scheduler.sweep();
        assert_eq!(store.metrics().count("cpu").unwrap(), 5);
    }
}
