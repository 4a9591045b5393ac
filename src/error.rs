//! Error types for the SOD core
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for core operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Query and stored points have different arity
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A k-NN query asked for more neighbours than the index holds
    #[error("Insufficient data: need {needed} points, have {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The predictor has not accumulated enough points yet
    #[error("Predictor not ready: {len} points stored, {required} required")]
    NotReady { len: usize, required: usize },

    /// Configured neighbour count is below the algorithm minimum
    #[error("k is too small: {k} (minimum {min})")]
    KTooSmall { k: usize, min: usize },

    /// Algorithmic failure downstream of the k-NN search
    #[error("Predict failed: {0}")]
    PredictFailed(String),
}
