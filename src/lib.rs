//! # SOD - Streaming outlier detection core
//!
//! Per-entity streaming outlier scoring built from four layers:
//!
//! - [`point`] / [`distance`]: d-dimensional points and the Euclidean,
//!   Manhattan and Chebyshev metrics.
//! - [`pqueue`] / [`timetree`] / [`kdtree`]: the containers behind the
//!   search — a bounded priority queue, an AVL tree ordered by
//!   `(created_at, id)`, and a KD-tree with bounded best-first k-NN.
//! - [`knn`]: dynamic indices; a brute-force scan and the green/blue
//!   double-buffered KD index that stays readable while it rebuilds.
//! - [`lof`]: the Local Outlier Factor predictor on top.
//!
//! ## Quick start
//!
//! ```rust
//! use sod::knn::DataPoint;
//! use sod::lof::{LofConfig, LofPredictor};
//! use sod::Point;
//! use chrono::Utc;
//!
//! let predictor = LofPredictor::new(LofConfig::default()).unwrap();
//! for vec in [[1.0, 1.0], [1.0, 2.0], [2.0, 1.0], [2.0, 2.0], [1.5, 1.5]] {
//!     predictor.append(DataPoint::new(Point::new(vec.to_vec()), Utc::now()));
//! }
//!
//! let verdict = predictor.predict(&Point::new(vec![100.0, 100.0])).unwrap();
//! assert!(verdict.outlier);
//! ```
//!
//! The crate is synchronous; the serving layer drives index maintenance by
//! calling [`lof::LofPredictor::maintain`] on its own cadence.

pub mod distance;
pub mod error;
pub mod kdtree;
pub mod knn;
pub mod lof;
pub mod point;
pub mod pqueue;
pub mod timetree;

// Re-exports for convenient access
pub use distance::Distance;
pub use error::{Error, Result};
pub use kdtree::KdTree;
pub use knn::{Algorithm, DataPoint, KnnIndex, RebuildPolicy};
pub use lof::{Conclusion, LofConfig, LofPredictor};
pub use point::Point;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
