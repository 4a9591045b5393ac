// SOD - Streaming outlier detection core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Static KD-tree with leaf insertion and bounded k-NN search.
//!
//! The tree splits on one coordinate per level, cycling axes with depth
//! (`axis = depth mod d`). [`KdTree::build`] median-splits the input for a
//! balanced tree; [`KdTree::insert`] descends to a leaf without
//! rebalancing, so a long append run degrades the shape until
//! [`KdTree::balance`] rebuilds in place. The k-NN search walks the path
//! to the query's leaf, then unwinds it, pruning any sibling subtree whose
//! axis-wise distance already exceeds the current worst-of-best held in a
//! [`BoundedQueue`].

use crate::distance::DistanceFn;
use crate::error::{Error, Result};
use crate::point::Point;
use crate::pqueue::BoundedQueue;

struct KdNode {
    point: Point,
    left: Option<Box<KdNode>>,
    right: Option<Box<KdNode>>,
}

impl KdNode {
    fn leaf(point: Point) -> Box<Self> {
        Box::new(Self {
            point,
            left: None,
            right: None,
        })
    }

    fn collect_points(&self, out: &mut Vec<Point>) {
        if let Some(left) = &self.left {
            left.collect_points(out);
        }
        out.push(self.point.clone());
        if let Some(right) = &self.right {
            right.collect_points(out);
        }
    }
}

/// KD-tree over [`Point`]s with an injected distance function.
pub struct KdTree {
    root: Option<Box<KdNode>>,
    len: usize,
    dist: DistanceFn,
}

impl KdTree {
    pub fn new(dist: DistanceFn) -> Self {
        Self {
            root: None,
            len: 0,
            dist,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bulk-build the tree from scratch, replacing any previous contents.
    pub fn build(&mut self, points: Vec<Point>) {
        self.len = points.len();
        self.root = build_recursive(points, 0);
    }

    /// Insert a single point at a leaf along the axis cycle.
    pub fn insert(&mut self, point: Point) {
        match &mut self.root {
            None => self.root = Some(KdNode::leaf(point)),
            Some(root) => insert_recursive(root, point, 0),
        }
        self.len += 1;
    }

    /// Rebuild the tree in place from its own points.
    pub fn balance(&mut self) {
        let points = self.points();
        self.root = build_recursive(points, 0);
    }

    /// In-order enumeration of all stored points.
    pub fn points(&self) -> Vec<Point> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(root) = &self.root {
            root.collect_points(&mut out);
        }
        out
    }

    /// The k nearest stored points to `query` under the configured metric,
    /// closest first. Ties are broken deterministically for a fixed tree
    /// (first-encountered point wins).
    pub fn knn(&self, query: &Point, k: usize) -> Result<Vec<Point>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        if self.len < k {
            return Err(Error::InsufficientData {
                needed: k,
                available: self.len,
            });
        }
        if let Some(root) = &self.root {
            if root.point.dims() != query.dims() {
                return Err(Error::DimensionMismatch {
                    expected: root.point.dims(),
                    got: query.dims(),
                });
            }
        }

        let mut queue = BoundedQueue::with_cap(k);
        self.knn_search(query, k, self.root.as_deref(), 0, &mut queue)?;
        Ok(queue.pop_all().into_iter().cloned().collect())
    }

    fn knn_search<'a>(
        &'a self,
        query: &Point,
        k: usize,
        first: Option<&'a KdNode>,
        mut axis: usize,
        queue: &mut BoundedQueue<&'a Point>,
    ) -> Result<()> {
        if first.is_none() {
            return Ok(());
        }
        let dims = query.dims().max(1);

        // Descend to the leaf the query would occupy, recording the path.
        let mut path: Vec<&KdNode> = Vec::new();
        let mut current = first;
        while let Some(node) = current {
            path.push(node);
            current = if query.dim(axis) < node.point.dim(axis) {
                node.left.as_deref()
            } else {
                node.right.as_deref()
            };
            axis = (axis + 1) % dims;
        }

        // Unwind, offering each node and probing the far side when the
        // splitting plane is closer than the current worst-of-best.
        axis = (axis + dims - 1) % dims;
        while let Some(node) = path.pop() {
            let d = (self.dist)(query.as_slice(), node.point.as_slice())?;
            let mut worst = kth_or_max(queue, k - 1);
            if d < worst {
                queue.push(&node.point, d);
                worst = kth_or_max(queue, k - 1);
            }

            let plane = (query.dim(axis) - node.point.dim(axis)).abs();
            if plane < worst {
                let far = if query.dim(axis) < node.point.dim(axis) {
                    node.right.as_deref()
                } else {
                    node.left.as_deref()
                };
                self.knn_search(query, k, far, (axis + 1) % dims, queue)?;
            }
            axis = (axis + dims - 1) % dims;
        }
        Ok(())
    }
}

fn kth_or_max(queue: &BoundedQueue<&Point>, idx: usize) -> f64 {
    queue.seek(idx).map_or(f64::MAX, |(_, priority)| priority)
}

fn build_recursive(mut points: Vec<Point>, axis: usize) -> Option<Box<KdNode>> {
    if points.is_empty() {
        return None;
    }
    if points.len() == 1 {
        return Some(KdNode::leaf(points.pop().expect("length checked above")));
    }

    points.sort_unstable_by(|a, b| a.dim(axis).total_cmp(&b.dim(axis)));
    let mid = points.len() / 2;
    let right = points.split_off(mid + 1);
    let point = points.pop().expect("median element exists");
    let next = (axis + 1) % point.dims().max(1);
    Some(Box::new(KdNode {
        point,
        left: build_recursive(points, next),
        right: build_recursive(right, next),
    }))
}

fn insert_recursive(node: &mut KdNode, point: Point, axis: usize) {
    let next = (axis + 1) % node.point.dims().max(1);
    if point.dim(axis) < node.point.dim(axis) {
        match &mut node.left {
            None => node.left = Some(KdNode::leaf(point)),
            Some(left) => insert_recursive(left, point, next),
        }
    } else {
        match &mut node.right {
            None => node.right = Some(KdNode::leaf(point)),
            Some(right) => insert_recursive(right, point, next),
        }
    }
}
