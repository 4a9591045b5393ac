// SOD - Streaming outlier detection core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Dynamic k-nearest-neighbour indices.
//!
//! Two interchangeable backends sit behind [`KnnIndex`]:
//!
//! - [`Brute`]: linear scan, exact, no maintenance. The right choice for
//!   small datasets.
//! - [`GreenBlueKd`]: double-buffered KD-trees with an atomic epoch so
//!   reads stay lock-free with respect to rebuilds.
//!
//! Queries go through a [`KnnSearcher`] obtained from
//! [`KnnIndex::searcher`]: the searcher pins one consistent view of the
//! index for its lifetime, which lets the LOF predictor issue the several
//! dependent k-NN queries of one score against a single epoch.

mod brute;
mod green_blue;

pub use brute::Brute;
pub use green_blue::GreenBlueKd;

use crate::distance::Distance;
use crate::error::Result;
use crate::point::Point;
use crate::timetree::TimeKey;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// A point in time context, the unit the index stores.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub id: Uuid,
    pub point: Point,
    pub time: DateTime<Utc>,
}

impl DataPoint {
    /// New data point with a fresh identity.
    pub fn new(point: Point, time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            point,
            time,
        }
    }

    /// New data point carrying an existing identity (e.g. a stored metric).
    pub fn with_id(id: Uuid, point: Point, time: DateTime<Utc>) -> Self {
        Self { id, point, time }
    }

    pub(crate) fn key(&self) -> TimeKey {
        TimeKey::new(self.time, self.id)
    }
}

/// Rebuild and rebalance cadence for maintained indices.
#[derive(Debug, Clone)]
pub struct RebuildPolicy {
    /// Rebuild once pending appends exceed this fraction of the index size.
    pub append_ratio: f64,
    /// Rebuild once pending removals exceed this fraction of the index size.
    pub remove_ratio: f64,
    /// Rebuild after this long with any pending change.
    pub rebuild_interval: Duration,
    /// In-place rebalance cadence for the active tree.
    pub balance_interval: Duration,
}

impl Default for RebuildPolicy {
    fn default() -> Self {
        Self {
            append_ratio: 0.001,
            remove_ratio: 0.01,
            rebuild_interval: Duration::from_secs(10),
            balance_interval: Duration::from_secs(60),
        }
    }
}

/// A pinned, consistent view of an index for one batch of queries.
pub trait KnnSearcher {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The k nearest stored points to `query`, closest first.
    fn knn(&self, query: &Point, k: usize) -> Result<Vec<Point>>;
}

/// A dynamic k-NN index shared across threads.
pub trait KnnIndex: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live population, excluding tombstones a query might still see.
    /// Retention decisions compare against this, not [`KnnIndex::len`].
    fn stored_len(&self) -> usize {
        self.len()
    }

    /// Bulk-load, replacing previous contents.
    fn build(&self, data: Vec<DataPoint>);

    /// Add one point to the index.
    fn append(&self, data: DataPoint);

    /// Pin a consistent view for querying.
    fn searcher(&self) -> Box<dyn KnnSearcher + '_>;

    /// Drop points created at or before `cutoff`. Returns how many were
    /// dropped from the age-ordered view; tree-backed indices may keep
    /// serving tombstoned points until the next rebuild.
    fn remove_older_than(&self, cutoff: DateTime<Utc>) -> usize;

    /// Drop the `n` oldest points. Same tombstone caveat as
    /// [`KnnIndex::remove_older_than`].
    fn remove_oldest(&self, n: usize) -> usize;

    /// Apply the rebuild/rebalance policy. Called periodically by the owner.
    fn maintain(&self, policy: &RebuildPolicy);

    fn reset(&self);
}

/// Index backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    Brute,
    #[default]
    KdTree,
}

impl Algorithm {
    /// Instantiate the selected backend over the given metric.
    pub fn create(self, distance: Distance) -> Box<dyn KnnIndex> {
        match self {
            Algorithm::Brute => Box::new(Brute::new(distance.func())),
            Algorithm::KdTree => Box::new(GreenBlueKd::new(distance.func())),
        }
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "BRUTE" => Ok(Algorithm::Brute),
            "KD_TREE" => Ok(Algorithm::KdTree),
            other => Err(format!("unknown knn algorithm: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parse() {
        assert_eq!("BRUTE".parse::<Algorithm>().unwrap(), Algorithm::Brute);
        assert_eq!("KD_TREE".parse::<Algorithm>().unwrap(), Algorithm::KdTree);
        assert!("BALL_TREE".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_default_policy() {
        let policy = RebuildPolicy::default();
        assert_eq!(policy.append_ratio, 0.001);
        assert_eq!(policy.remove_ratio, 0.01);
        assert_eq!(policy.rebuild_interval, Duration::from_secs(10));
        assert_eq!(policy.balance_interval, Duration::from_secs(60));
    }
}
