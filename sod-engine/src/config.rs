// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Engine configuration types.

use crate::http::HttpClientConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Dispatcher and storage tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Warm-up: the first n points per entity are stored and learned from
    /// but never scored.
    pub skip_items: usize,
    /// Per-entity cap on stored metrics; 0 disables the size sweep.
    pub max_items_stored: usize,
    /// Per-entity retention horizon; zero disables the age sweep.
    pub max_storage_time: Duration,
    /// Keep scored points in the dataset.
    pub allow_append_data: bool,
    /// Keep outliers in the dataset too.
    pub allow_append_outlier: bool,
    /// Write-back buffer size that forces a flush.
    pub flush_size: usize,
    /// Write-back flush cadence.
    pub flush_time: Duration,
    /// Retention sweep cadence.
    pub rebuild_db_time: Duration,
    /// Workers per entity = multiplier x available parallelism.
    pub worker_multiplier: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            skip_items: 0,
            max_items_stored: 1_000_000,
            max_storage_time: Duration::ZERO,
            allow_append_data: true,
            allow_append_outlier: true,
            flush_size: 10,
            flush_time: Duration::from_secs(5),
            rebuild_db_time: Duration::from_secs(15),
            worker_multiplier: 2,
        }
    }
}

impl EngineConfig {
    /// Worker pool size for one entity.
    pub fn workers_per_entity(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (self.worker_multiplier * cpus).max(1)
    }
}

/// One alert sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub url: String,
    pub entity_id: String,
    #[serde(default)]
    pub http_config: HttpClientConfig,
}

/// Alert manager configuration.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub allow_alerts: bool,
    pub targets: Vec<Target>,
    /// Dispatch cadence.
    pub interval: Duration,
    /// Global cap on in-flight alert requests.
    pub max_concurrent_request: usize,
    /// Per-request timeout for alert delivery.
    pub request_timeout: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            allow_alerts: true,
            targets: Vec::new(),
            interval: Duration::from_secs(5),
            max_concurrent_request: 64,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_items_stored, 1_000_000);
        assert_eq!(cfg.flush_size, 10);
        assert_eq!(cfg.flush_time, Duration::from_secs(5));
        assert_eq!(cfg.rebuild_db_time, Duration::from_secs(15));
        assert!(cfg.allow_append_data);
        assert!(cfg.allow_append_outlier);

        let alert = AlertConfig::default();
        assert_eq!(alert.interval, Duration::from_secs(5));
        assert_eq!(alert.max_concurrent_request, 64);
    }

    #[test]
    fn test_target_decodes_json() {
        let raw = r#"[{"url": "http://sink:9000/alerts", "entityId": "cpu",
                       "httpConfig": {"bearerToken": "secret"}}]"#;
        let targets: Vec<Target> = serde_json::from_str(raw).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].entity_id, "cpu");
        assert_eq!(
            targets[0].http_config.bearer_token.as_deref(),
            Some("secret")
        );
    }
}
