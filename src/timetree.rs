// SOD - Streaming outlier detection core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Age-ordered index over stored points.
//!
//! [`TimeTree`] is an AVL tree keyed on the strict total order
//! `(created_at, id)`; the UUID component disambiguates points that share a
//! timestamp, so removal always hits the intended entry. The tree carries
//! arbitrary values and stays height-balanced under millions of entries,
//! which keeps the retention sweeps and green/blue rebuilds predictable.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Composite ordering key: timestamp first, UUID as tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeKey {
    pub time: DateTime<Utc>,
    pub id: Uuid,
}

impl TimeKey {
    pub fn new(time: DateTime<Utc>, id: Uuid) -> Self {
        Self { time, id }
    }
}

struct Node<V> {
    key: TimeKey,
    value: V,
    height: i32,
    left: Option<Box<Node<V>>>,
    right: Option<Box<Node<V>>>,
}

impl<V> Node<V> {
    fn new(key: TimeKey, value: V) -> Box<Self> {
        Box::new(Self {
            key,
            value,
            height: 1,
            left: None,
            right: None,
        })
    }
}

fn height<V>(node: &Option<Box<Node<V>>>) -> i32 {
    node.as_ref().map_or(0, |n| n.height)
}

fn update_height<V>(node: &mut Node<V>) {
    node.height = 1 + height(&node.left).max(height(&node.right));
}

fn balance_factor<V>(node: &Node<V>) -> i32 {
    height(&node.left) - height(&node.right)
}

fn rotate_right<V>(mut root: Box<Node<V>>) -> Box<Node<V>> {
    let mut pivot = root.left.take().expect("rotate_right requires a left child");
    root.left = pivot.right.take();
    update_height(&mut root);
    pivot.right = Some(root);
    update_height(&mut pivot);
    pivot
}

fn rotate_left<V>(mut root: Box<Node<V>>) -> Box<Node<V>> {
    let mut pivot = root.right.take().expect("rotate_left requires a right child");
    root.right = pivot.left.take();
    update_height(&mut root);
    pivot.left = Some(root);
    update_height(&mut pivot);
    pivot
}

fn rebalance<V>(mut node: Box<Node<V>>) -> Box<Node<V>> {
    update_height(&mut node);
    let bf = balance_factor(&node);
    if bf > 1 {
        if balance_factor(node.left.as_ref().expect("left-heavy node has a left child")) < 0 {
            node.left = Some(rotate_left(node.left.take().expect("checked above")));
        }
        return rotate_right(node);
    }
    if bf < -1 {
        if balance_factor(node.right.as_ref().expect("right-heavy node has a right child")) > 0 {
            node.right = Some(rotate_right(node.right.take().expect("checked above")));
        }
        return rotate_left(node);
    }
    node
}

fn insert<V>(node: Option<Box<Node<V>>>, key: TimeKey, value: V) -> (Box<Node<V>>, bool) {
    match node {
        None => (Node::new(key, value), true),
        Some(mut n) => {
            let added = match key.cmp(&n.key) {
                std::cmp::Ordering::Less => {
                    let (child, added) = insert(n.left.take(), key, value);
                    n.left = Some(child);
                    added
                }
                std::cmp::Ordering::Greater => {
                    let (child, added) = insert(n.right.take(), key, value);
                    n.right = Some(child);
                    added
                }
                std::cmp::Ordering::Equal => {
                    n.value = value;
                    false
                }
            };
            (rebalance(n), added)
        }
    }
}

fn extract_min<V>(mut node: Box<Node<V>>) -> (Option<Box<Node<V>>>, Box<Node<V>>) {
    match node.left.take() {
        None => {
            let right = node.right.take();
            (right, node)
        }
        Some(left) => {
            let (rest, min) = extract_min(left);
            node.left = rest;
            (Some(rebalance(node)), min)
        }
    }
}

fn remove<V>(node: Option<Box<Node<V>>>, key: &TimeKey) -> (Option<Box<Node<V>>>, Option<V>) {
    let Some(mut n) = node else {
        return (None, None);
    };
    match key.cmp(&n.key) {
        std::cmp::Ordering::Less => {
            let (child, removed) = remove(n.left.take(), key);
            n.left = child;
            (Some(rebalance(n)), removed)
        }
        std::cmp::Ordering::Greater => {
            let (child, removed) = remove(n.right.take(), key);
            n.right = child;
            (Some(rebalance(n)), removed)
        }
        std::cmp::Ordering::Equal => match (n.left.take(), n.right.take()) {
            (None, right) => (right, Some(n.value)),
            (left, None) => (left, Some(n.value)),
            (left, Some(right)) => {
                let (rest, mut successor) = extract_min(right);
                successor.left = left;
                successor.right = rest;
                (Some(rebalance(successor)), Some(n.value))
            }
        },
    }
}

/// Height-balanced tree ordered by `(created_at, id)`.
pub struct TimeTree<V> {
    root: Option<Box<Node<V>>>,
    len: usize,
}

impl<V> TimeTree<V> {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value under its key. A value already present under the same
    /// key is replaced.
    pub fn add(&mut self, key: TimeKey, value: V) {
        let (root, added) = insert(self.root.take(), key, value);
        self.root = Some(root);
        if added {
            self.len += 1;
        }
    }

    /// Remove and return the value stored under `key`, if any.
    pub fn remove(&mut self, key: &TimeKey) -> Option<V> {
        let (root, removed) = remove(self.root.take(), key);
        self.root = root;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    pub fn contains(&self, key: &TimeKey) -> bool {
        let mut node = self.root.as_deref();
        while let Some(n) = node {
            node = match key.cmp(&n.key) {
                std::cmp::Ordering::Less => n.left.as_deref(),
                std::cmp::Ordering::Greater => n.right.as_deref(),
                std::cmp::Ordering::Equal => return true,
            };
        }
        false
    }

    /// Lazy in-order (oldest-first) enumeration.
    pub fn iter(&self) -> Iter<'_, V> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left(self.root.as_deref());
        iter
    }

    /// Lazy in-order enumeration of entries matching the predicate.
    pub fn filter<'a, F>(&'a self, pred: F) -> impl Iterator<Item = (&'a TimeKey, &'a V)>
    where
        F: Fn(&TimeKey, &V) -> bool + 'a,
    {
        self.iter().filter(move |(k, v)| pred(k, v))
    }

    pub fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }

    #[cfg(test)]
    fn max_height(&self) -> i32 {
        height(&self.root)
    }
}

impl<V> Default for TimeTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-order iterator over a [`TimeTree`].
pub struct Iter<'a, V> {
    stack: Vec<&'a Node<V>>,
}

impl<'a, V> Iter<'a, V> {
    fn push_left(&mut self, mut node: Option<&'a Node<V>>) {
        while let Some(n) = node {
            self.stack.push(n);
            node = n.left.as_deref();
        }
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a TimeKey, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((&node.key, &node.value))
    }
}
