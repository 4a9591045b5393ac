// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Alert manager: batching, persistence and delivery of outlier
//! notifications.
//!
//! Outliers accumulate in a per-entity buffer. On every tick, each
//! configured target with pending metrics gets one [`Alert`]: persisted
//! first, then POSTed, then deleted on a 2xx. A failed delivery leaves
//! the persisted copy in place, and startup recovery folds persisted
//! alerts back into the buffer — at-least-once, never silently dropped.
//! In-flight concurrency is capped globally by a semaphore.

use crate::config::{AlertConfig, Target};
use crate::error::{EngineError, Result};
use crate::metric::{Alert, Metric};
use crate::store::AlertStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::{spawn_blocking, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// User-Agent header on every outbound alert request.
pub const USER_AGENT: &str = "SOD/0.1";

/// Wire format of one delivered metric.
#[derive(Debug, Serialize)]
struct AlertData<'a> {
    norm: &'a Option<Vec<f64>>,
    outlier: &'a [f64],
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
    extra: &'a serde_json::Value,
}

/// Wire format of one alert batch.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertRequest<'a> {
    entity_id: &'a str,
    data: Vec<AlertData<'a>>,
}

/// Buffers outliers and ships them to per-entity HTTP sinks.
pub struct AlertManager {
    opts: AlertConfig,
    store: AlertStore,
    buffer: Mutex<HashMap<String, Vec<Metric>>>,
    clients: HashMap<String, reqwest::Client>,
    semaphore: Arc<Semaphore>,
}

impl AlertManager {
    pub fn new(store: AlertStore, opts: AlertConfig) -> Result<Arc<Self>> {
        let mut clients = HashMap::new();
        for target in &opts.targets {
            target.http_config.validate()?;
            if !clients.contains_key(&target.entity_id) {
                let client = target.http_config.build_client(opts.request_timeout)?;
                clients.insert(target.entity_id.clone(), client);
            }
        }
        Ok(Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(opts.max_concurrent_request.max(1))),
            store,
            buffer: Mutex::new(HashMap::new()),
            clients,
            opts,
        }))
    }

    /// Whether the dispatcher should route outliers here at all.
    pub fn alerts_allowed(&self) -> bool {
        self.opts.allow_alerts
    }

    /// Buffer outliers for the next dispatch tick.
    pub fn notify(&self, metrics: Vec<Metric>) {
        let mut buffer = self.buffer.lock();
        for metric in metrics {
            buffer
                .entry(metric.entity_id.clone())
                .or_default()
                .push(metric);
        }
    }

    /// Pending metrics for one entity.
    pub fn pending(&self, entity_id: &str) -> usize {
        self.buffer.lock().get(entity_id).map_or(0, Vec::len)
    }

    /// Re-load persisted alerts into the buffer and drop their stored
    /// copies; the normal loop re-persists and re-sends them.
    pub async fn recover(&self) -> Result<()> {
        let store = self.store.clone();
        let alerts = spawn_blocking(move || store.find_all())
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
        if !alerts.is_empty() {
            info!(count = alerts.len(), "recovered undispatched alerts");
        }
        for alert in alerts {
            self.notify(alert.metrics.clone());
            let store = self.store.clone();
            spawn_blocking(move || store.delete(&alert))
                .await
                .map_err(|e| EngineError::Task(e.to_string()))??;
        }
        Ok(())
    }

    /// Dispatch loop: ticks until cancelled, then persists any
    /// undispatched buffers and reports on the shutdown channel.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        shutdown_tx: UnboundedSender<Result<()>>,
    ) {
        let mut ticker = tokio::time::interval(self.opts.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.dispatch_all().await,
                _ = cancel.cancelled() => break,
            }
        }
        let result = self.persist_all().await;
        let _ = shutdown_tx.send(result);
    }

    /// One tick: ship every target's pending batch, bounded by the
    /// concurrency cap, and wait for all of them.
    async fn dispatch_all(&self) {
        let mut set = JoinSet::new();
        for target in &self.opts.targets {
            let metrics = {
                let buffer = self.buffer.lock();
                match buffer.get(&target.entity_id) {
                    Some(pending) if !pending.is_empty() => pending.clone(),
                    _ => continue,
                }
            };
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                return;
            };
            let target = target.clone();
            // Tasks borrow self only through Arc-cloned handles.
            let store = self.store.clone();
            let client = self.clients.get(&target.entity_id).cloned();
            set.spawn(dispatch_one(store, client, target, metrics, permit));
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(entity_id)) => {
                    if let Some(pending) = self.buffer.lock().get_mut(&entity_id) {
                        pending.clear();
                    }
                }
                Ok(Err(e)) => error!(error = %e, "alert dispatch failed"),
                Err(e) => error!(error = %e, "alert dispatch panicked"),
            }
        }
    }

    /// Persist every non-empty buffer so a restart can replay it.
    async fn persist_all(&self) -> Result<()> {
        let batches: Vec<(String, Vec<Metric>)> = {
            let buffer = self.buffer.lock();
            buffer
                .iter()
                .filter(|(_, metrics)| !metrics.is_empty())
                .map(|(entity_id, metrics)| (entity_id.clone(), metrics.clone()))
                .collect()
        };
        for (entity_id, metrics) in batches {
            let alert = Alert::new(entity_id, metrics);
            let store = self.store.clone();
            spawn_blocking(move || store.store(&alert))
                .await
                .map_err(|e| EngineError::Task(e.to_string()))??;
        }
        Ok(())
    }
}

/// Persist, POST and clean up one alert. Returns the entity id so the
/// caller can clear the matching buffer on success.
async fn dispatch_one(
    store: AlertStore,
    client: Option<reqwest::Client>,
    target: Target,
    metrics: Vec<Metric>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) -> Result<String> {
    let client = client.ok_or_else(|| {
        EngineError::Config(format!("no client for entity {}", target.entity_id))
    })?;

    let alert = Alert::new(target.entity_id.clone(), metrics.clone());
    {
        let store = store.clone();
        let alert = alert.clone();
        spawn_blocking(move || store.store(&alert))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;
    }

    let body = AlertRequest {
        entity_id: &target.entity_id,
        data: metrics
            .iter()
            .map(|m| AlertData {
                norm: &m.norm_vec,
                outlier: &m.checked_vec,
                created_at: m.created_at,
                extra: &m.extra,
            })
            .collect(),
    };

    let request = client
        .post(&target.url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .json(&body);
    let response = target
        .http_config
        .apply_auth(request)
        .send()
        .await
        .map_err(|e| EngineError::Http(e.to_string()))?;

    let status = response.status();
    let _ = response.bytes().await;
    if !status.is_success() {
        // The persisted alert stays behind; the next start replays it.
        return Err(EngineError::Http(format!(
            "alert target {} answered {}",
            target.url, status
        )));
    }

    spawn_blocking(move || store.delete(&alert))
        .await
        .map_err(|e| EngineError::Task(e.to_string()))??;
    Ok(target.entity_id)
}
