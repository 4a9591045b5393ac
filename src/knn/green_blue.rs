// SOD - Streaming outlier detection core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Green/blue double-buffered KD index.
//!
//! Two KD-trees sit behind an atomic epoch word: readers pin whichever
//! tree the epoch names, while a rebuild re-materialises the other tree
//! from the age-ordered companion and flips the epoch when done. Readers
//! therefore never wait on a rebuild; the tree they pinned stays intact
//! until the *following* rebuild overwrites it.
//!
//! Removals only touch the time tree and leave tombstones in the KD-trees;
//! a query may keep returning a removed point until the next rebuild. That
//! window is bounded by the [`RebuildPolicy`] thresholds driven through
//! [`KnnIndex::maintain`].

use super::{DataPoint, KnnIndex, KnnSearcher, RebuildPolicy};
use crate::distance::DistanceFn;
use crate::error::Result;
use crate::kdtree::KdTree;
use crate::point::Point;
use crate::timetree::{TimeKey, TimeTree};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

/// Double-buffered KD-tree index with an age-ordered companion.
pub struct GreenBlueKd {
    trees: [RwLock<KdTree>; 2],
    epoch: AtomicUsize,
    times: RwLock<TimeTree<DataPoint>>,
    appended: AtomicU64,
    removed: AtomicU64,
    last_rebuild: Mutex<Instant>,
    last_balance: Mutex<Instant>,
}

impl GreenBlueKd {
    pub fn new(dist: DistanceFn) -> Self {
        Self {
            trees: [RwLock::new(KdTree::new(dist)), RwLock::new(KdTree::new(dist))],
            epoch: AtomicUsize::new(0),
            times: RwLock::new(TimeTree::new()),
            appended: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            last_rebuild: Mutex::new(Instant::now()),
            last_balance: Mutex::new(Instant::now()),
        }
    }

    fn active(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Rebuild the inactive tree from the time tree and flip the epoch.
    ///
    /// After this returns, queries observe exactly the time tree's current
    /// population: tombstones are gone and stray appends that raced a
    /// previous flip are restored.
    pub fn rebuild(&self) {
        let points: Vec<Point> = {
            let times = self.times.read();
            times.iter().map(|(_, dp)| dp.point.clone()).collect()
        };
        let count = points.len();
        let inactive = 1 - self.active();
        self.trees[inactive].write().build(points);
        self.epoch.store(inactive, Ordering::Release);
        self.appended.store(0, Ordering::Relaxed);
        self.removed.store(0, Ordering::Relaxed);
        *self.last_rebuild.lock() = Instant::now();
        debug!(points = count, epoch = inactive, "kd index rebuilt");
    }

    /// Rebalance the active tree in place. Blocks queries for the duration,
    /// unlike [`GreenBlueKd::rebuild`].
    fn balance(&self) {
        self.trees[self.active()].write().balance();
        self.appended.store(0, Ordering::Relaxed);
        *self.last_balance.lock() = Instant::now();
    }
}

impl KnnIndex for GreenBlueKd {
    fn len(&self) -> usize {
        self.trees[self.active()].read().len()
    }

    fn stored_len(&self) -> usize {
        self.times.read().len()
    }

    fn build(&self, data: Vec<DataPoint>) {
        {
            let mut times = self.times.write();
            times.clear();
            for dp in data {
                times.add(dp.key(), dp);
            }
        }
        self.rebuild();
    }

    fn append(&self, data: DataPoint) {
        self.trees[self.active()].write().insert(data.point.clone());
        self.times.write().add(data.key(), data);
        self.appended.fetch_add(1, Ordering::Relaxed);
    }

    fn searcher(&self) -> Box<dyn KnnSearcher + '_> {
        Box::new(GreenBlueSearcher {
            guard: self.trees[self.active()].read(),
        })
    }

    fn remove_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut times = self.times.write();
        let victims: Vec<TimeKey> = times
            .filter(|key, _| key.time <= cutoff)
            .map(|(key, _)| *key)
            .collect();
        for key in &victims {
            times.remove(key);
        }
        self.removed.fetch_add(victims.len() as u64, Ordering::Relaxed);
        victims.len()
    }

    fn remove_oldest(&self, n: usize) -> usize {
        let mut times = self.times.write();
        let victims: Vec<TimeKey> = times.iter().take(n).map(|(key, _)| *key).collect();
        for key in &victims {
            times.remove(key);
        }
        self.removed.fetch_add(victims.len() as u64, Ordering::Relaxed);
        victims.len()
    }

    fn maintain(&self, policy: &RebuildPolicy) {
        let len = self.len();
        if len == 0 {
            return;
        }

        let appended = self.appended.load(Ordering::Relaxed);
        let removed = self.removed.load(Ordering::Relaxed);
        let append_ratio = appended as f64 / len as f64;
        let remove_ratio = removed as f64 / len as f64;
        let since_rebuild = self.last_rebuild.lock().elapsed();

        if append_ratio > policy.append_ratio
            || remove_ratio > policy.remove_ratio
            || ((appended > 0 || removed > 0) && since_rebuild > policy.rebuild_interval)
        {
            self.rebuild();
        }

        // Appends between rebuilds degrade the active tree's shape; a
        // rebuild resets the counter so a fresh tree is never rebalanced.
        if self.appended.load(Ordering::Relaxed) > 0
            && self.last_balance.lock().elapsed() > policy.balance_interval
        {
            self.balance();
        }
    }

    fn reset(&self) {
        self.times.write().clear();
        self.trees[0].write().build(Vec::new());
        self.trees[1].write().build(Vec::new());
        self.appended.store(0, Ordering::Relaxed);
        self.removed.store(0, Ordering::Relaxed);
    }
}

struct GreenBlueSearcher<'a> {
    guard: RwLockReadGuard<'a, KdTree>,
}

impl KnnSearcher for GreenBlueSearcher<'_> {
    fn len(&self) -> usize {
        self.guard.len()
    }

    fn knn(&self, query: &Point, k: usize) -> Result<Vec<Point>> {
        self.guard.knn(query, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::euclidean;
    use chrono::TimeZone;
    use std::time::Duration;

    fn dp(components: &[f64], secs: i64) -> DataPoint {
        DataPoint::new(
            Point::from(components),
            Utc.timestamp_opt(secs, 0).unwrap(),
        )
    }

    fn instant_policy() -> RebuildPolicy {
        RebuildPolicy {
            append_ratio: 0.0,
            remove_ratio: 0.0,
            rebuild_interval: Duration::from_millis(0),
            balance_interval: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_build_and_query() {
        let index = GreenBlueKd::new(euclidean);
        index.build(vec![
            dp(&[1.0, 1.0], 1),
            dp(&[2.0, 2.0], 2),
            dp(&[8.0, 8.0], 3),
        ]);
        assert_eq!(index.len(), 3);
        let s = index.searcher();
        let nn = s.knn(&Point::new(vec![1.2, 1.2]), 1).unwrap();
        assert_eq!(nn[0], Point::new(vec![1.0, 1.0]));
    }

    #[test]
    fn test_append_visible_before_rebuild() {
        let index = GreenBlueKd::new(euclidean);
        index.build(vec![dp(&[1.0], 1), dp(&[2.0], 2)]);
        index.append(dp(&[3.0], 3));
        assert_eq!(index.len(), 3);
        let s = index.searcher();
        let nn = s.knn(&Point::new(vec![3.1]), 1).unwrap();
        assert_eq!(nn[0], Point::new(vec![3.0]));
    }

    #[test]
    fn test_tombstones_cleared_by_rebuild() {
        let index = GreenBlueKd::new(euclidean);
        index.build((0..10).map(|i| dp(&[i as f64], i)).collect());

        let removed = index.remove_older_than(Utc.timestamp_opt(4, 0).unwrap());
        assert_eq!(removed, 5);
        // KD view still serves the tombstoned points.
        assert_eq!(index.len(), 10);

        index.rebuild();
        assert_eq!(index.len(), 5);
        let s = index.searcher();
        let nn = s.knn(&Point::new(vec![0.0]), 1).unwrap();
        assert_eq!(nn[0], Point::new(vec![5.0]));
    }

    #[test]
    fn test_maintain_triggers_rebuild_after_removal() {
        let index = GreenBlueKd::new(euclidean);
        index.build((0..10).map(|i| dp(&[i as f64], i)).collect());
        index.remove_oldest(4);
        assert_eq!(index.len(), 10);

        index.maintain(&instant_policy());
        assert_eq!(index.len(), 6);
    }

    #[test]
    fn test_readers_pin_a_consistent_tree() {
        let index = GreenBlueKd::new(euclidean);
        index.build((0..8).map(|i| dp(&[i as f64], i)).collect());

        let searcher = index.searcher();
        index.remove_oldest(8);
        index.rebuild();

        // The pinned view still answers from the pre-rebuild epoch.
        assert_eq!(searcher.len(), 8);
        drop(searcher);
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_reset() {
        let index = GreenBlueKd::new(euclidean);
        index.build(vec![dp(&[1.0], 1)]);
        index.reset();
        assert!(index.is_empty());
    }
}
