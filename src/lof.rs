// SOD - Streaming outlier detection core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Local Outlier Factor predictor.
//!
//! LOF compares the local reachability density of a query point to the
//! densities of its k nearest neighbours; a ratio above 1.0 flags the
//! point as an outlier. All queries of one prediction run against a single
//! pinned view of the index, so a concurrent rebuild can not split the
//! neighbourhood across epochs.

use crate::distance::{Distance, DistanceFn};
use crate::error::{Error, Result};
use crate::knn::{Algorithm, DataPoint, KnnIndex, KnnSearcher, RebuildPolicy};
use crate::point::Point;

/// Scores strictly above this are outliers.
const LOF_THRESHOLD: f64 = 1.0;

/// Smallest neighbourhood LOF is defined over.
pub const MIN_K: usize = 3;

/// Neighbour count used for the k-distance term.
///
/// Kept at the historical fixed value rather than the configured k; scores
/// are calibrated against this behaviour.
const K_DISTANCE_NEIGHBOURS: usize = 3;

/// Predictor configuration.
#[derive(Debug, Clone)]
pub struct LofConfig {
    /// Neighbourhood size, at least [`MIN_K`].
    pub k: usize,
    /// Warm-up: predictions refuse to run below this population.
    pub skip_items: usize,
    pub distance: Distance,
    pub algorithm: Algorithm,
}

impl Default for LofConfig {
    fn default() -> Self {
        Self {
            k: MIN_K,
            skip_items: 0,
            distance: Distance::Euclidean,
            algorithm: Algorithm::KdTree,
        }
    }
}

/// The verdict for a single point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conclusion {
    pub outlier: bool,
}

/// Streaming LOF predictor over a k-NN index.
pub struct LofPredictor {
    k: usize,
    skip_items: usize,
    dist: DistanceFn,
    alg: Box<dyn KnnIndex>,
}

impl std::fmt::Debug for LofPredictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LofPredictor")
            .field("k", &self.k)
            .field("skip_items", &self.skip_items)
            .finish_non_exhaustive()
    }
}

impl LofPredictor {
    pub fn new(config: LofConfig) -> Result<Self> {
        if config.k < MIN_K {
            return Err(Error::KTooSmall {
                k: config.k,
                min: MIN_K,
            });
        }
        Ok(Self {
            k: config.k,
            skip_items: config.skip_items,
            dist: config.distance.func(),
            alg: config.algorithm.create(config.distance),
        })
    }

    pub fn len(&self) -> usize {
        self.alg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alg.is_empty()
    }

    /// Number of points required before [`LofPredictor::predict`] runs.
    pub fn required_len(&self) -> usize {
        self.k.max(MIN_K).max(self.skip_items)
    }

    /// Bulk-load the dataset, replacing previous contents.
    pub fn build(&self, data: Vec<DataPoint>) {
        self.alg.build(data);
    }

    /// Add one point to the dataset.
    pub fn append(&self, data: DataPoint) {
        self.alg.append(data);
    }

    /// Drive the index's rebuild/rebalance cadence.
    pub fn maintain(&self, policy: &RebuildPolicy) {
        self.alg.maintain(policy);
    }

    /// Drop points created at or before `cutoff` from the dataset.
    pub fn remove_older_than(&self, cutoff: chrono::DateTime<chrono::Utc>) -> usize {
        self.alg.remove_older_than(cutoff)
    }

    /// Keep the dataset at or below `max` points by dropping the oldest.
    pub fn shrink_to(&self, max: usize) -> usize {
        let len = self.alg.stored_len();
        if len > max {
            self.alg.remove_oldest(len - max)
        } else {
            0
        }
    }

    pub fn reset(&self) {
        self.alg.reset();
    }

    /// Score a point against the current dataset.
    ///
    /// Fails with [`Error::NotReady`] during warm-up. A neighbourhood of
    /// identical points yields an indeterminate density ratio, which
    /// resolves to `outlier = false`.
    pub fn predict(&self, point: &Point) -> Result<Conclusion> {
        let searcher = self.alg.searcher();
        let len = searcher.len();
        let required = self.required_len();
        if len < required {
            return Err(Error::NotReady { len, required });
        }

        let lof = self.lof_score(searcher.as_ref(), point)?;
        // NaN (identical-point neighbourhoods divide infinity by infinity)
        // compares false here.
        Ok(Conclusion {
            outlier: lof > LOF_THRESHOLD,
        })
    }

    /// The raw LOF score for a point.
    pub fn lof_score(&self, searcher: &dyn KnnSearcher, point: &Point) -> Result<f64> {
        let neighbours = self.neighbours(searcher, point, self.k)?;
        let mut lrd_sum = 0.0;
        for o in &neighbours {
            lrd_sum += self.lrd(searcher, o)?;
        }
        let avg_lrd = lrd_sum / self.k as f64;
        let own_lrd = self.lrd(searcher, point)?;
        Ok(avg_lrd / own_lrd)
    }

    /// Local reachability density: inverse mean reachability distance of
    /// the point's neighbourhood.
    fn lrd(&self, searcher: &dyn KnnSearcher, point: &Point) -> Result<f64> {
        let neighbours = self.neighbours(searcher, point, self.k)?;
        let mut reach_sum = 0.0;
        for o in &neighbours {
            reach_sum += self.reach_dist(searcher, point, o)?;
        }
        Ok(1.0 / (reach_sum / self.k as f64))
    }

    fn reach_dist(&self, searcher: &dyn KnnSearcher, a: &Point, b: &Point) -> Result<f64> {
        let k_dist = self.k_distance(searcher, a)?;
        let dist = (self.dist)(a.as_slice(), b.as_slice())?;
        Ok(k_dist.max(dist))
    }

    fn k_distance(&self, searcher: &dyn KnnSearcher, point: &Point) -> Result<f64> {
        let neighbours = self.neighbours(searcher, point, K_DISTANCE_NEIGHBOURS)?;
        (self.dist)(point.as_slice(), neighbours[0].as_slice())
    }

    fn neighbours(
        &self,
        searcher: &dyn KnnSearcher,
        point: &Point,
        k: usize,
    ) -> Result<Vec<Point>> {
        searcher.knn(point, k).map_err(|err| match err {
            Error::DimensionMismatch { .. } => err,
            other => Error::PredictFailed(other.to_string()),
        })
    }
}
