// SOD Server - HTTP ingest/predict API
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Environment-driven configuration.
//!
//! Every knob is an environment variable with a documented default;
//! durations use the compact `300ms` / `15s` / `1m` / `2h` notation.
//! [`Config::from_env`] reads the process environment; the lookup
//! function is injected so tests can feed a map instead.

use serde::Deserialize;
use sod::{Algorithm, Distance, LofConfig};
use sod_engine::config::{AlertConfig, EngineConfig, Target};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

impl ConfigError {
    fn invalid(var: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var: var.to_string(),
            reason: reason.into(),
        }
    }
}

/// Service mode: accept pushes or poll targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcMode {
    Collect,
    Scrape,
}

/// One polled source in scrape mode.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeTarget {
    pub url: String,
    pub entity_id: String,
}

/// Scrape-mode settings.
#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub targets: Vec<ScrapeTarget>,
    pub interval: Duration,
    pub max_concurrent_request: usize,
    pub request_timeout: Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            interval: Duration::from_secs(1),
            max_concurrent_request: 64,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub svc_mode: SvcMode,
    pub addr: String,
    pub db_file: PathBuf,
    pub engine: EngineConfig,
    pub predictor: LofConfig,
    pub alert: AlertConfig,
    pub scrape: ScrapeConfig,
    pub collect_request_timeout: Duration,
    pub predict_request_timeout: Duration,
    pub predict_max_data_items: usize,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an explicit lookup function.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let svc_mode = match get("SOD_SVC_MODE").as_deref() {
            None | Some("COLLECT") => SvcMode::Collect,
            Some("SCRAPE") => SvcMode::Scrape,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "SOD_SVC_MODE",
                    format!("unknown mode {other}"),
                ))
            }
        };

        let engine = EngineConfig {
            skip_items: parse_usize(&get, "SOD_OUTLIER_SKIP_ITEMS", 0)?,
            max_items_stored: parse_usize(&get, "SOD_OUTLIER_MAX_ITEMS_STORED", 1_000_000)?,
            max_storage_time: parse_duration_var(&get, "SOD_OUTLIER_MAX_STORAGE_TIME", Duration::ZERO)?,
            allow_append_data: parse_bool(&get, "SOD_OUTLIER_ALLOW_APPEND_DATA", true)?,
            allow_append_outlier: parse_bool(&get, "SOD_OUTLIER_ALLOW_APPEND_OUTLIER", true)?,
            flush_size: parse_usize(&get, "SOD_DB_FLUSH_SIZE", 10)?,
            flush_time: parse_duration_var(&get, "SOD_DB_FLUSH_TIME", Duration::from_secs(5))?,
            rebuild_db_time: parse_duration_var(
                &get,
                "SOD_OUTLIER_REBUILD_DB_TIME",
                Duration::from_secs(15),
            )?,
            worker_multiplier: 2,
        };

        match get("SOD_PREDICTOR_TYPE").as_deref() {
            None | Some("LOF") => {}
            Some(other) => {
                return Err(ConfigError::invalid(
                    "SOD_PREDICTOR_TYPE",
                    format!("unknown predictor type {other}"),
                ))
            }
        }

        let predictor = LofConfig {
            k: parse_usize(&get, "LOF_K_NUM", 3)?,
            skip_items: engine.skip_items,
            distance: parse_enum::<Distance>(&get, "LOF_DISTANCE_FUNC")?.unwrap_or_default(),
            algorithm: parse_enum::<Algorithm>(&get, "LOF_ALG_TYPE")?.unwrap_or_default(),
        };

        let alert = AlertConfig {
            allow_alerts: parse_bool(&get, "SOD_ALLOW_ALERTS", true)?,
            targets: parse_json(&get, "SOD_ALERT_TARGETS")?.unwrap_or_default(),
            interval: parse_duration_var(&get, "SOD_ALERT_INTERVAL", Duration::from_secs(5))?,
            max_concurrent_request: parse_usize(&get, "SOD_ALERT_MAX_CONCURRENT_REQUEST", 64)?,
            request_timeout: Duration::from_secs(30),
        };
        validate_targets(&alert.targets)?;

        let scrape = ScrapeConfig {
            targets: parse_json(&get, "SOD_SCRAPE_TARGET_URLS")?.unwrap_or_default(),
            interval: parse_duration_var(&get, "SOD_SCRAPE_INTERVAL", Duration::from_secs(1))?,
            max_concurrent_request: parse_usize(&get, "SOD_SCRAPE_MAX_CONCURRENT_REQUEST", 64)?,
            request_timeout: Duration::from_secs(30),
        };

        Ok(Self {
            svc_mode,
            addr: get("SOD_ADDR").unwrap_or_else(|| ":8787".to_string()),
            db_file: PathBuf::from(get("SOD_DB_FILE").unwrap_or_else(|| "sod.db".to_string())),
            engine,
            predictor,
            alert,
            scrape,
            collect_request_timeout: parse_duration_var(
                &get,
                "SOD_COLLECT_REQUEST_TIMEOUT",
                Duration::from_secs(60),
            )?,
            predict_request_timeout: parse_duration_var(
                &get,
                "SOD_PREDICT_REQUEST_TIMEOUT",
                Duration::from_secs(30),
            )?,
            predict_max_data_items: parse_usize(&get, "SOD_PREDICT_MAX_DATA_ITEMS_LEN", 10)?,
        })
    }

    /// The listen address with the Go-style bare-port form normalised.
    pub fn listen_addr(&self) -> String {
        if let Some(port) = self.addr.strip_prefix(':') {
            format!("0.0.0.0:{port}")
        } else {
            self.addr.clone()
        }
    }
}

fn validate_targets(targets: &[Target]) -> Result<(), ConfigError> {
    for target in targets {
        if target.entity_id.is_empty() {
            return Err(ConfigError::invalid(
                "SOD_ALERT_TARGETS",
                "target with empty entityId",
            ));
        }
        target
            .http_config
            .validate()
            .map_err(|e| ConfigError::invalid("SOD_ALERT_TARGETS", e.to_string()))?;
    }
    Ok(())
}

fn parse_usize(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::invalid(var, format!("not an integer: {raw}"))),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(var).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") => Ok(true),
        Some("false") | Some("0") => Ok(false),
        Some(raw) => Err(ConfigError::invalid(var, format!("not a boolean: {raw}"))),
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: String| ConfigError::invalid(var, e)),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ConfigError::invalid(var, e.to_string())),
    }
}

fn parse_duration_var(
    get: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(raw) => {
            parse_duration(&raw).ok_or_else(|| ConfigError::invalid(var, format!("bad duration: {raw}")))
        }
    }
}

/// Compact duration notation: `500ms`, `15s`, `1m`, `2h`, or a bare
/// number of seconds. `0` disables the timer it configures.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_map<'a>(map: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.svc_mode, SvcMode::Collect);
        assert_eq!(config.addr, ":8787");
        assert_eq!(config.listen_addr(), "0.0.0.0:8787");
        assert_eq!(config.engine.max_items_stored, 1_000_000);
        assert_eq!(config.engine.flush_size, 10);
        assert_eq!(config.engine.rebuild_db_time, Duration::from_secs(15));
        assert_eq!(config.predictor.k, 3);
        assert_eq!(config.predictor.distance, Distance::Euclidean);
        assert_eq!(config.predictor.algorithm, Algorithm::KdTree);
        assert_eq!(config.alert.interval, Duration::from_secs(5));
        assert_eq!(config.predict_max_data_items, 10);
        assert_eq!(config.collect_request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_full_environment() {
        let vars = HashMap::from([
            ("SOD_SVC_MODE", "SCRAPE"),
            ("SOD_ADDR", "127.0.0.1:9999"),
            ("SOD_OUTLIER_SKIP_ITEMS", "5"),
            ("SOD_OUTLIER_MAX_ITEMS_STORED", "100"),
            ("SOD_OUTLIER_MAX_STORAGE_TIME", "1m"),
            ("SOD_DB_FLUSH_SIZE", "20"),
            ("SOD_DB_FLUSH_TIME", "500ms"),
            ("SOD_OUTLIER_ALLOW_APPEND_OUTLIER", "false"),
            ("LOF_K_NUM", "5"),
            ("LOF_DISTANCE_FUNC", "CHEBYSHEV"),
            ("LOF_ALG_TYPE", "BRUTE"),
            ("SOD_ALERT_INTERVAL", "10s"),
            (
                "SOD_ALERT_TARGETS",
                r#"[{"url": "http://sink/a", "entityId": "cpu"}]"#,
            ),
            (
                "SOD_SCRAPE_TARGET_URLS",
                r#"[{"url": "http://app/metrics", "entityId": "cpu"}]"#,
            ),
        ]);
        let config = Config::from_lookup(lookup_map(&vars)).unwrap();
        assert_eq!(config.svc_mode, SvcMode::Scrape);
        assert_eq!(config.listen_addr(), "127.0.0.1:9999");
        assert_eq!(config.engine.skip_items, 5);
        assert_eq!(config.engine.max_storage_time, Duration::from_secs(60));
        assert_eq!(config.engine.flush_time, Duration::from_millis(500));
        assert!(!config.engine.allow_append_outlier);
        assert_eq!(config.predictor.k, 5);
        assert_eq!(config.predictor.skip_items, 5);
        assert_eq!(config.predictor.distance, Distance::Chebyshev);
        assert_eq!(config.predictor.algorithm, Algorithm::Brute);
        assert_eq!(config.alert.interval, Duration::from_secs(10));
        assert_eq!(config.alert.targets.len(), 1);
        assert_eq!(config.scrape.targets[0].entity_id, "cpu");
    }

    #[test]
    fn test_rejects_unknown_mode() {
        let vars = HashMap::from([("SOD_SVC_MODE", "PUSH")]);
        assert!(Config::from_lookup(lookup_map(&vars)).is_err());
    }

    #[test]
    fn test_rejects_unknown_predictor() {
        let vars = HashMap::from([("SOD_PREDICTOR_TYPE", "ISOLATION_FOREST")]);
        assert!(Config::from_lookup(lookup_map(&vars)).is_err());
    }

    #[test]
    fn test_rejects_bad_duration() {
        let vars = HashMap::from([("SOD_DB_FLUSH_TIME", "five seconds")]);
        assert!(Config::from_lookup(lookup_map(&vars)).is_err());
    }

    #[test]
    fn test_rejects_bad_targets_json() {
        let vars = HashMap::from([("SOD_ALERT_TARGETS", "not-json")]);
        assert!(Config::from_lookup(lookup_map(&vars)).is_err());
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("1d"), None);
    }
}
