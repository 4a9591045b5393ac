// SOD - Streaming outlier detection core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Linear-scan k-NN backend.
//!
//! Exact and maintenance-free; every query walks the full population
//! through a bounded priority queue. Points live in the age-ordered tree
//! only, so retention removals take effect immediately.

use super::{DataPoint, KnnIndex, KnnSearcher, RebuildPolicy};
use crate::distance::DistanceFn;
use crate::error::{Error, Result};
use crate::point::Point;
use crate::pqueue::BoundedQueue;
use crate::timetree::{TimeKey, TimeTree};
use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};

/// Brute-force index: a time-ordered set scanned in full per query.
pub struct Brute {
    dist: DistanceFn,
    times: RwLock<TimeTree<DataPoint>>,
}

impl Brute {
    pub fn new(dist: DistanceFn) -> Self {
        Self {
            dist,
            times: RwLock::new(TimeTree::new()),
        }
    }
}

impl KnnIndex for Brute {
    fn len(&self) -> usize {
        self.times.read().len()
    }

    fn build(&self, data: Vec<DataPoint>) {
        let mut times = self.times.write();
        times.clear();
        for dp in data {
            times.add(dp.key(), dp);
        }
    }

    fn append(&self, data: DataPoint) {
        self.times.write().add(data.key(), data);
    }

    fn searcher(&self) -> Box<dyn KnnSearcher + '_> {
        Box::new(BruteSearcher {
            dist: self.dist,
            guard: self.times.read(),
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
        victims.len()
    }

    fn remove_oldest(&self, n: usize) -> usize {
        let mut times = self.times.write();
        let victims: Vec<TimeKey> = times.iter().take(n).map(|(key, _)| *key).collect();
        for key in &victims {
            times.remove(key);
        }
        victims.len()
    }

    fn maintain(&self, _policy: &RebuildPolicy) {
        // Nothing to rebuild: queries always see the live set.
    }

    fn reset(&self) {
        self.times.write().clear();
    }
}

struct BruteSearcher<'a> {
    dist: DistanceFn,
    guard: RwLockReadGuard<'a, TimeTree<DataPoint>>,
}

impl KnnSearcher for BruteSearcher<'_> {
    fn len(&self) -> usize {
        self.guard.len()
    }

    fn knn(&self, query: &Point, k: usize) -> Result<Vec<Point>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if self.guard.len() < k {
            return Err(Error::InsufficientData {
                needed: k,
                available: self.guard.len(),
            });
        }

        let mut queue = BoundedQueue::with_cap(k);
        for (_, dp) in self.guard.iter() {
            let d = (self.dist)(query.as_slice(), dp.point.as_slice())?;
            queue.push(&dp.point, d);
        }
        Ok(queue.pop_all().into_iter().cloned().collect())
    }
}
