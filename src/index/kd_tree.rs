//! Exact k-d tree backend
//!
//! Balanced tree over the corpus rows: each split uses the dimension with the
//! widest spread and the median row on it. Subtrees are pruned only when the
//! splitting plane is strictly farther than the current k-th best distance, so
//! results (ties included) are identical to a linear scan.

use serde::{Deserialize, Serialize};

use super::helpers::{check_dim, squared_l2, Neighbors, TopK};
use super::{BackendKind, SimilarityIndex};
use crate::window::Matrix;
use crate::{Result, SearchError};

/// Default number of rows per leaf
pub const DEFAULT_LEAF_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Node {
    /// Rows `order[start..end]`
    Leaf { start: usize, end: usize },
    Split {
        dim: usize,
        value: f32,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tree {
    data: Matrix,
    order: Vec<usize>,
    nodes: Vec<Node>,
}

/// Balanced spatial tree with exact k-nearest search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KdTreeIndex {
    leaf_size: usize,
    tree: Option<Tree>,
}

impl Default for KdTreeIndex {
    fn default() -> Self {
        Self::new(DEFAULT_LEAF_SIZE)
    }
}

impl KdTreeIndex {
    pub fn new(leaf_size: usize) -> Self {
        Self {
            leaf_size: leaf_size.max(1),
            tree: None,
        }
    }

    #[inline]
    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// Every node, row id and child link must stay in bounds, and children
    /// come after their parent so a walk always terminates.
    pub(crate) fn check_integrity(&self) -> Result<()> {
        let Some(tree) = &self.tree else {
            return Ok(());
        };
        let corrupt = |what: &str| SearchError::CorruptIndex(format!("kd-tree {what}"));

        let rows = tree.data.rows();
        if !tree.data.is_well_formed() || tree.order.len() != rows || tree.nodes.is_empty() {
            return Err(corrupt("shape is inconsistent"));
        }
        let mut seen = vec![false; rows];
        for &i in &tree.order {
            if i >= rows || std::mem::replace(&mut seen[i], true) {
                return Err(corrupt("row order is not a permutation"));
            }
        }

        for (id, node) in tree.nodes.iter().enumerate() {
            let ok = match *node {
                Node::Leaf { start, end } => start <= end && end <= rows,
                Node::Split { dim, left, right, .. } => {
                    dim < tree.data.dim()
                        && left > id
                        && right > id
                        && left < tree.nodes.len()
                        && right < tree.nodes.len()
                }
            };
            if !ok {
                return Err(corrupt(&format!("node {id} is out of bounds")));
            }
        }
        Ok(())
    }
}

impl SimilarityIndex for KdTreeIndex {
    fn kind(&self) -> BackendKind {
        BackendKind::KdTree {
            leaf_size: self.leaf_size,
        }
    }

    fn build(&mut self, matrix: &Matrix) -> Result<()> {
        if self.tree.is_some() {
            return Err(SearchError::AlreadyBuilt);
        }
        if matrix.is_empty() {
            return Err(SearchError::EmptyCorpus);
        }

        let mut tree = Tree {
            data: matrix.clone(),
            order: (0..matrix.rows()).collect(),
            nodes: Vec::new(),
        };
        tree.split(0, matrix.rows(), self.leaf_size);
        self.tree = Some(tree);
        Ok(())
    }

    fn is_built(&self) -> bool {
        self.tree.is_some()
    }

    fn len(&self) -> usize {
        self.tree.as_ref().map_or(0, |t| t.data.rows())
    }

    fn dim(&self) -> usize {
        self.tree.as_ref().map_or(0, |t| t.data.dim())
    }

    fn query(&self, query: &[f32], k: usize) -> Result<Neighbors> {
        let tree = self.tree.as_ref().ok_or(SearchError::NotBuilt)?;
        check_dim(query, tree.data.dim())?;

        let mut top = TopK::new(k.min(tree.data.rows()));
        if k > 0 {
            tree.search(0, query, &mut top);
        }
        Ok(top.into_neighbors())
    }
}

impl Tree {
    /// Build the subtree for `order[start..end]`, returning its node id
    fn split(&mut self, start: usize, end: usize, leaf_size: usize) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { start, end });
        if end - start <= leaf_size {
            return id;
        }

        let Some(dim) = self.widest_dim(start, end) else {
            return id;
        };

        let mid = start + (end - start) / 2;
        let data = &self.data;
        self.order[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            data.row(a)[dim].total_cmp(&data.row(b)[dim])
        });
        let value = self.data.row(self.order[mid])[dim];

        let left = self.split(start, mid, leaf_size);
        let right = self.split(mid, end, leaf_size);
        self.nodes[id] = Node::Split {
            dim,
            value,
            left,
            right,
        };
        id
    }

    /// Dimension with the largest value range, `None` if all rows coincide
    fn widest_dim(&self, start: usize, end: usize) -> Option<usize> {
        let dim = self.data.dim();
        let mut lo = vec![f32::INFINITY; dim];
        let mut hi = vec![f32::NEG_INFINITY; dim];
        for &i in &self.order[start..end] {
            for (d, &v) in self.data.row(i).iter().enumerate() {
                lo[d] = lo[d].min(v);
                hi[d] = hi[d].max(v);
            }
        }

        let (best, spread) = (0..dim)
            .map(|d| (d, hi[d] - lo[d]))
            .fold((0, 0.0f32), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
        (spread > 0.0).then_some(best)
    }

    fn search(&self, id: usize, query: &[f32], top: &mut TopK) {
        match self.nodes[id] {
            Node::Leaf { start, end } => {
                for &i in &self.order[start..end] {
                    top.push(squared_l2(query, self.data.row(i)), i);
                }
            }
            Node::Split {
                dim,
                value,
                left,
                right,
            } => {
                let diff = query[dim] - value;
                let (near, far) = if diff <= 0.0 { (left, right) } else { (right, left) };
                self.search(near, query, top);
                if diff * diff <= top.worst() {
                    self.search(far, query, top);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{BruteForceIndex, IndexBackend};

    fn depth(index: &KdTreeIndex) -> usize {
        fn walk(nodes: &[Node], id: usize) -> usize {
            match nodes[id] {
                Node::Leaf { .. } => 1,
                Node::Split { left, right, .. } => 1 + walk(nodes, left).max(walk(nodes, right)),
            }
        }
        index.tree.as_ref().map_or(0, |t| walk(&t.nodes, 0))
    }

    fn wave_matrix(rows: usize, dim: usize) -> Matrix {
        let mut m = Matrix::with_capacity(dim, rows);
        for r in 0..rows {
            let row: Vec<f32> = (0..dim)
                .map(|d| (((r * 31 + d * 17) % 97) as f32 / 96.0))
                .collect();
            m.push_row(&row).unwrap();
        }
        m
    }

    #[test]
    fn test_matches_brute_force() {
        let data = wave_matrix(500, 6);
        let mut tree = KdTreeIndex::new(8);
        let mut brute = BruteForceIndex::new();
        tree.build(&data).unwrap();
        brute.build(&data).unwrap();

        for q in [0usize, 17, 250, 499] {
            let query = data.row(q);
            assert_eq!(tree.query(query, 7).unwrap(), brute.query(query, 7).unwrap());
        }
        let off_grid = [0.33, 0.1, 0.9, 0.5, 0.5, 0.0];
        assert_eq!(tree.query(&off_grid, 25).unwrap(), brute.query(&off_grid, 25).unwrap());
    }

    #[test]
    fn test_self_match_is_exact() {
        let data = wave_matrix(200, 5);
        let mut tree = KdTreeIndex::default();
        tree.build(&data).unwrap();
        let n = tree.query(data.row(42), 1).unwrap();
        assert_eq!(n.distances[0], 0.0);
    }

    #[test]
    fn test_duplicate_rows_do_not_recurse_forever() {
        let data = Matrix::from_flat(2, vec![0.5; 2 * 100]).unwrap();
        let mut tree = KdTreeIndex::new(4);
        tree.build(&data).unwrap();
        assert_eq!(depth(&tree), 1);
        let n = tree.query(&[0.5, 0.5], 3).unwrap();
        assert_eq!(n.indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_balanced_depth() {
        let data = wave_matrix(1024, 4);
        let mut tree = KdTreeIndex::new(16);
        tree.build(&data).unwrap();
        assert!(depth(&tree) <= 8);
    }

    #[test]
    fn test_restored_tree_is_checked() {
        let data = wave_matrix(100, 4);
        let mut tree = KdTreeIndex::new(4);
        tree.build(&data).unwrap();
        assert!(tree.check_integrity().is_ok());

        let mut bad_order = tree.clone();
        if let Some(t) = bad_order.tree.as_mut() {
            t.order[0] = 100;
        }
        let mut self_loop = tree.clone();
        if let Some(t) = self_loop.tree.as_mut() {
            t.nodes[0] = Node::Split {
                dim: 0,
                value: 0.5,
                left: 0,
                right: 1,
            };
        }
        let mut bad_leaf = tree.clone();
        if let Some(t) = bad_leaf.tree.as_mut() {
            let last = t.nodes.len() - 1;
            t.nodes[last] = Node::Leaf { start: 90, end: 101 };
        }

        for bad in [bad_order, self_loop, bad_leaf] {
            let blob = crate::snapshot::encode(crate::snapshot::PayloadKind::Index, &IndexBackend::KdTree(bad)).unwrap();
            assert!(matches!(
                IndexBackend::from_bytes(&blob),
                Err(SearchError::CorruptIndex(_))
            ));
        }
    }

    #[test]
    fn test_k_exceeds_len() {
        let data = wave_matrix(10, 3);
        let mut tree = KdTreeIndex::new(2);
        tree.build(&data).unwrap();
        let n = tree.query(data.row(0), 50).unwrap();
        let mut seen = n.indices.clone();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 10);
    }
}
