//! Nearest-neighbor backends over a window corpus
//!
//! All backends implement [`SimilarityIndex`]. [`IndexBackend`] wraps the
//! builtin ones for enum dispatch and persistence; which one is used is
//! decided by [`BackendKind`] in the engine configuration.
//!
//! - **BruteForce**: exact linear scan, the reference for correctness
//! - **KdTree**: exact, faster on low and moderate dimensions
//! - **Quantized**: approximate IVF-PQ with a recorded error bound

pub mod helpers;

pub mod brute_force;
pub mod kd_tree;
pub mod quantized;

pub use brute_force::*;
pub use helpers::{Neighbors, TopK};
pub use kd_tree::*;
pub use quantized::*;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::snapshot::{self, PayloadKind};
use crate::window::Matrix;
use crate::{Result, SearchError};

// ============================================================
// CAPABILITY TRAIT
// ============================================================

/// Build-once, query-many nearest-neighbor index.
///
/// Distances are Euclidean; results are ordered by ascending distance with
/// ties broken by the smaller corpus position. Building an instance twice is
/// rejected: a rebuild always starts from a fresh instance.
pub trait SimilarityIndex: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn build(&mut self, matrix: &Matrix) -> Result<()>;

    fn is_built(&self) -> bool;

    /// Number of indexed rows (0 before build)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row dimensionality (0 before build)
    fn dim(&self) -> usize;

    /// The `k` nearest rows to `query`; all rows when `k` exceeds the corpus
    fn query(&self, query: &[f32], k: usize) -> Result<Neighbors>;

    /// Answer one query per matrix row, in parallel
    fn query_batch(&self, queries: &Matrix, k: usize) -> Result<Vec<Neighbors>> {
        if !self.is_built() {
            return Err(SearchError::NotBuilt);
        }
        queries
            .iter_rows()
            .collect::<Vec<_>>()
            .par_iter()
            .map(|q| self.query(q, k))
            .collect()
    }
}

// ============================================================
// BACKEND SELECTION
// ============================================================

/// Which backend to build, with its tuning parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    BruteForce,
    KdTree { leaf_size: usize },
    Quantized(QuantizerConfig),
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::KdTree {
            leaf_size: DEFAULT_LEAF_SIZE,
        }
    }
}

impl BackendKind {
    pub fn validate(&self) -> Result<()> {
        match self {
            BackendKind::BruteForce => Ok(()),
            BackendKind::KdTree { leaf_size } => {
                if *leaf_size == 0 {
                    return Err(SearchError::Config("leaf_size must be > 0".to_string()));
                }
                Ok(())
            }
            BackendKind::Quantized(config) => config.validate(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::BruteForce => "brute_force",
            BackendKind::KdTree { .. } => "kd_tree",
            BackendKind::Quantized(_) => "quantized",
        }
    }

    /// Fresh, unbuilt backend of this kind
    pub fn instantiate(&self) -> IndexBackend {
        match *self {
            BackendKind::BruteForce => IndexBackend::BruteForce(BruteForceIndex::new()),
            BackendKind::KdTree { leaf_size } => IndexBackend::KdTree(KdTreeIndex::new(leaf_size)),
            BackendKind::Quantized(config) => IndexBackend::Quantized(QuantizedIndex::new(config)),
        }
    }
}

/// Macro to generate the IndexBackend enum and its trait dispatch
macro_rules! define_index_backends {
    (
        $(
            $variant:ident($backend:ty)
        ),* $(,)?
    ) => {
        /// All builtin backends - dispatch through a match, no vtable
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum IndexBackend {
            $($variant($backend)),*
        }

        impl SimilarityIndex for IndexBackend {
            #[inline]
            fn kind(&self) -> BackendKind {
                match self {
                    $(Self::$variant(b) => b.kind()),*
                }
            }

            fn build(&mut self, matrix: &Matrix) -> Result<()> {
                match self {
                    $(Self::$variant(b) => b.build(matrix)),*
                }
            }

            #[inline]
            fn is_built(&self) -> bool {
                match self {
                    $(Self::$variant(b) => b.is_built()),*
                }
            }

            #[inline]
            fn len(&self) -> usize {
                match self {
                    $(Self::$variant(b) => b.len()),*
                }
            }

            #[inline]
            fn dim(&self) -> usize {
                match self {
                    $(Self::$variant(b) => b.dim()),*
                }
            }

            #[inline]
            fn query(&self, query: &[f32], k: usize) -> Result<Neighbors> {
                match self {
                    $(Self::$variant(b) => b.query(query, k)),*
                }
            }
        }
    };
}

define_index_backends! {
    BruteForce(BruteForceIndex),
    KdTree(KdTreeIndex),
    Quantized(QuantizedIndex),
}

impl IndexBackend {
    /// Persist a built backend as an opaque blob
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if !self.is_built() {
            return Err(SearchError::NotBuilt);
        }
        snapshot::encode(PayloadKind::Index, self)
    }

    /// Load a blob written by [`to_bytes`](Self::to_bytes)
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        let backend: Self = snapshot::decode(PayloadKind::Index, blob)
            .map_err(|e| SearchError::CorruptIndex(e.to_string()))?;
        if !backend.is_built() {
            return Err(SearchError::CorruptIndex("backend was saved unbuilt".to_string()));
        }
        backend.check_integrity()?;
        Ok(backend)
    }

    /// Reject deserialized internals that a query would index out of bounds
    pub(crate) fn check_integrity(&self) -> Result<()> {
        match self {
            IndexBackend::BruteForce(b) => b.check_integrity(),
            IndexBackend::KdTree(b) => b.check_integrity(),
            IndexBackend::Quantized(b) => b.check_integrity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(rows: usize, dim: usize) -> Matrix {
        let mut m = Matrix::with_capacity(dim, rows);
        for r in 0..rows {
            let row: Vec<f32> = (0..dim).map(|d| ((r * 7 + d * 3) % 50) as f32 / 49.0).collect();
            m.push_row(&row).unwrap();
        }
        m
    }

    fn all_kinds() -> Vec<BackendKind> {
        vec![
            BackendKind::BruteForce,
            BackendKind::KdTree { leaf_size: 4 },
            BackendKind::Quantized(QuantizerConfig {
                nlist: 2,
                nprobe: 1,
                ..QuantizerConfig::default()
            }),
        ]
    }

    #[test]
    fn test_instantiate_matches_kind() {
        for kind in all_kinds() {
            let backend = kind.instantiate();
            assert_eq!(backend.kind(), kind);
            assert!(!backend.is_built());
            assert_eq!(backend.len(), 0);
        }
    }

    #[test]
    fn test_every_backend_rejects_query_before_build() {
        for kind in all_kinds() {
            let backend = kind.instantiate();
            assert!(matches!(backend.query(&[0.0; 4], 1), Err(SearchError::NotBuilt)));
            assert!(matches!(backend.to_bytes(), Err(SearchError::NotBuilt)));
        }
    }

    #[test]
    fn test_persistence_round_trip_keeps_answers() {
        let data = ramp(40, 4);
        for kind in all_kinds() {
            let mut backend = kind.instantiate();
            backend.build(&data).unwrap();

            let restored = IndexBackend::from_bytes(&backend.to_bytes().unwrap()).unwrap();
            assert_eq!(restored, backend);
            let q = data.row(11);
            assert_eq!(restored.query(q, 5).unwrap(), backend.query(q, 5).unwrap());
        }
    }

    #[test]
    fn test_corrupt_blob() {
        let mut backend = BackendKind::BruteForce.instantiate();
        backend.build(&ramp(10, 4)).unwrap();
        let mut blob = backend.to_bytes().unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(matches!(
            IndexBackend::from_bytes(&blob),
            Err(SearchError::CorruptIndex(_))
        ));
        assert!(matches!(
            IndexBackend::from_bytes(&[]),
            Err(SearchError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_query_batch() {
        let data = ramp(30, 4);
        let mut backend = BackendKind::KdTree { leaf_size: 3 }.instantiate();
        backend.build(&data).unwrap();
        let results = backend.query_batch(&data, 1).unwrap();
        assert_eq!(results.len(), 30);
        assert!(results.iter().all(|n| n.distances[0] == 0.0));
    }

    #[test]
    fn test_kind_validation() {
        assert!(BackendKind::KdTree { leaf_size: 0 }.validate().is_err());
        assert!(BackendKind::default().validate().is_ok());
        assert_eq!(BackendKind::BruteForce.name(), "brute_force");
    }
}
