// SOD Engine - Ingest pipeline and durable storage
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for the engine

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Durable store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Predictor failure (warm-up, dimensions, scoring)
    #[error("predictor error: {0}")]
    Predictor(#[from] sod::Error),

    /// Ingest attempted after the dispatcher was closed
    #[error("shutting down")]
    ShuttingDown,

    /// Outbound HTTP failure
    #[error("http error: {0}")]
    Http(String),

    /// Invalid engine or target configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A background task died before reporting a result
    #[error("task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", EngineError::ShuttingDown), "shutting down");
        let err = EngineError::Config("two auth schemes".into());
        assert!(format!("{}", err).contains("two auth schemes"));
    }
}
