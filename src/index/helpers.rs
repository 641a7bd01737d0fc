//! Shared distance and top-k helpers for the index backends

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::{Result, SearchError};

/// Squared Euclidean distance. Identical inputs give exactly 0.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Fail with `DimensionMismatch` unless `query` has `dim` components
#[inline]
pub fn check_dim(query: &[f32], dim: usize) -> Result<()> {
    if query.len() != dim {
        return Err(SearchError::DimensionMismatch {
            expected: dim,
            got: query.len(),
        });
    }
    Ok(())
}

// ============================================================
// NEIGHBORS
// ============================================================

/// Query result: corpus positions with their Euclidean distances, nearest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Neighbors {
    pub indices: Vec<usize>,
    pub distances: Vec<f32>,
}

impl Neighbors {
    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = (usize, f32)> + '_ {
        self.indices.iter().copied().zip(self.distances.iter().copied())
    }

    /// Drop the first `n` results
    pub fn skip(mut self, n: usize) -> Self {
        let n = n.min(self.len());
        self.indices.drain(..n);
        self.distances.drain(..n);
        self
    }
}

// ============================================================
// TOP-K COLLECTOR
// ============================================================

/// Candidate ordered by (squared distance, index)
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub dist2: f32,
    pub index: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist2
            .total_cmp(&other.dist2)
            .then_with(|| self.index.cmp(&other.index))
    }
}

/// Keeps the `k` smallest candidates seen so far
#[derive(Debug)]
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(4096)),
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Current k-th best squared distance, or +inf while not full
    #[inline]
    pub fn worst(&self) -> f32 {
        if self.is_full() {
            self.heap.peek().map_or(f32::INFINITY, |c| c.dist2)
        } else {
            f32::INFINITY
        }
    }

    #[inline]
    pub fn push(&mut self, dist2: f32, index: usize) {
        if self.k == 0 {
            return;
        }
        let candidate = Candidate { dist2, index };
        if !self.is_full() {
            self.heap.push(candidate);
        } else if let Some(top) = self.heap.peek() {
            if candidate < *top {
                self.heap.pop();
                self.heap.push(candidate);
            }
        }
    }

    /// Ascending by distance then index; distances converted to Euclidean
    pub fn into_neighbors(self) -> Neighbors {
        let sorted = self.heap.into_sorted_vec();
        Neighbors {
            indices: sorted.iter().map(|c| c.index).collect(),
            distances: sorted.iter().map(|c| c.dist2.max(0.0).sqrt()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squared_l2() {
        assert_eq!(squared_l2(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
        assert_eq!(squared_l2(&[0.25, 0.5], &[0.25, 0.5]), 0.0);
    }

    #[test]
    fn test_topk_keeps_smallest_with_index_tiebreak() {
        let mut top = TopK::new(3);
        for (d, i) in [(4.0, 0), (1.0, 5), (1.0, 2), (9.0, 1), (0.0, 7)] {
            top.push(d, i);
        }
        let n = top.into_neighbors();
        assert_eq!(n.indices, vec![7, 2, 5]);
        assert_eq!(n.distances, vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_topk_zero() {
        let mut top = TopK::new(0);
        top.push(1.0, 0);
        assert!(top.into_neighbors().is_empty());
    }

    #[test]
    fn test_neighbors_skip() {
        let n = Neighbors {
            indices: vec![3, 1, 2],
            distances: vec![0.0, 0.5, 0.7],
        };
        let rest = n.skip(1);
        assert_eq!(rest.indices, vec![1, 2]);
        assert_eq!(rest.distances, vec![0.5, 0.7]);
    }
}
