// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Outbound HTTP client configuration.
//!
//! Per-target clients carry their own auth scheme (bearer token or basic
//! auth, never both) and the connection-pool settings the alert path
//! relies on. Gzip response decoding is transparent.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Auth and transport settings for one sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpClientConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl HttpClientConfig {
    /// Reject configurations carrying more than one auth scheme.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.basic_auth.is_some() && self.bearer_token.is_some() {
            return Err(EngineError::Config(
                "at most one of basicAuth and bearerToken may be configured".into(),
            ));
        }
        Ok(())
    }

    /// Build a pooled client for this configuration.
    pub fn build_client(&self, timeout: Duration) -> Result<reqwest::Client, EngineError> {
        self.validate()?;
        reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .pool_idle_timeout(Duration::from_secs(300))
            .pool_max_idle_per_host(1000)
            .build()
            .map_err(|e| EngineError::Http(e.to_string()))
    }

    /// Attach the configured auth scheme to a request.
    pub fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.bearer_token {
            return req.bearer_auth(token);
        }
        if let Some(basic) = &self.basic_auth {
            return req.basic_auth(&basic.username, Some(basic.password.trim()));
        }
        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_both_schemes() {
        let cfg = HttpClientConfig {
            basic_auth: Some(BasicAuth {
                username: "u".into(),
                password: "p".into(),
            }),
            bearer_token: Some("token".into()),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_single_scheme() {
        let bearer = HttpClientConfig {
            basic_auth: None,
            bearer_token: Some("token".into()),
        };
        assert!(bearer.validate().is_ok());
        assert!(HttpClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_decodes_basic_auth() {
        let raw = r#"{"basicAuth": {"username": "svc", "password": "pw"}}"#;
        let cfg: HttpClientConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.basic_auth.unwrap().username, "svc");
        assert!(cfg.bearer_token.is_none());
    }
}
