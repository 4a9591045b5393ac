// SOD Server - HTTP ingest/predict API
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Scrape mode: instead of exposing `/collect`, poll configured targets
//! for batches and feed them into the dispatcher.
//!
//! Every tick, each target is fetched with bounded concurrency; the
//! response uses the same envelope the predict endpoint answers with.
//! Batches are sorted by `createdAt` before ingest, matching the push
//! path. Failures are logged and retried on the next tick.

use crate::config::{ScrapeConfig, ScrapeTarget};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sod_engine::error::{EngineError, Result};
use sod_engine::metric::Metric;
use sod_engine::Dispatcher;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// User-Agent header on scrape requests.
const USER_AGENT: &str = "SOD/0.1";

/// Response envelope expected from scrape targets.
#[derive(Debug, Deserialize)]
struct ScrapeResponse {
    entity: String,
    data: Vec<ScrapeItem>,
}

#[derive(Debug, Deserialize)]
struct ScrapeItem {
    vector: Vec<f64>,
    #[serde(default)]
    extra: serde_json::Value,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

/// Polls targets and forwards their batches to the dispatcher.
pub struct ScrapeManager {
    config: ScrapeConfig,
    dispatcher: Arc<Dispatcher>,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl ScrapeManager {
    pub fn new(config: ScrapeConfig, dispatcher: Arc<Dispatcher>) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .gzip(true)
            .build()
            .map_err(|e| EngineError::Http(e.to_string()))?;
        Ok(Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_request.max(1))),
            dispatcher,
            client,
            config,
        }))
    }

    /// Poll loop; reports completion on the shutdown channel when
    /// cancelled.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        shutdown_tx: UnboundedSender<Result<()>>,
    ) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.scrape_all().await,
                _ = cancel.cancelled() => break,
            }
        }
        let _ = shutdown_tx.send(Ok(()));
    }

    /// One tick: fetch every target, bounded by the concurrency cap.
    async fn scrape_all(&self) {
        let mut set = JoinSet::new();
        for target in &self.config.targets {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                return;
            };
            let target = target.clone();
            let client = self.client.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            set.spawn(async move {
                let _permit = permit;
                if let Err(e) = scrape_one(&client, &dispatcher, &target).await {
                    error!(url = %target.url, error = %e, "scrape failed");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }
}

async fn scrape_one(
    client: &reqwest::Client,
    dispatcher: &Dispatcher,
    target: &ScrapeTarget,
) -> Result<()> {
    let response = client
        .get(&target.url)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .send()
        .await
        .map_err(|e| EngineError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Http(format!(
            "scrape target {} answered {}",
            target.url, status
        )));
    }

    let body: ScrapeResponse = response
        .json()
        .await
        .map_err(|e| EngineError::Http(e.to_string()))?;

    let mut items = body.data;
    items.sort_by_key(|item| item.created_at);
    let count = items.len();
    let metrics: Vec<Metric> = items
        .into_iter()
        .map(|item| Metric::new(body.entity.clone(), item.vector, item.created_at, item.extra))
        .collect();

    dispatcher.collect(metrics).await?;
    debug!(entity = %body.entity, count, "scraped batch");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_decodes() {
        let raw = r#"{
            "entity": "cpu",
            "data": [
                {"vector": [1.0, 2.0], "createdAt": "2024-05-01T12:00:00Z"},
                {"vector": [1.5, 2.5], "createdAt": "2024-05-01T12:00:01Z", "extra": 7}
            ]
        }"#;
        let parsed: ScrapeResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.entity, "cpu");
        assert_eq!(parsed.data.len(), 2);
        assert_eq!(parsed.data[1].extra, serde_json::json!(7));
    }
}
