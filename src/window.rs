//! Sliding-window corpus construction
//!
//! Turns every populated store row into overlapping windows of a fixed length
//! (step 1), min-max normalizes each window on its own values and records
//! where it came from. The matrix row `i` and `provenance[i]` always describe
//! the same window.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::TimeSeriesStore;
use crate::{Result, SearchError};

/// Smallest window size accepted by default
pub const MIN_WINDOW_SIZE: usize = 5;

// ============================================================
// MATRIX
// ============================================================

/// Row-major `rows x dim` matrix of `f32`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    dim: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(dim: usize, rows: usize) -> Self {
        Self {
            dim,
            data: Vec::with_capacity(dim * rows),
        }
    }

    /// Wrap a flat buffer; its length must be a multiple of `dim`
    pub fn from_flat(dim: usize, data: Vec<f32>) -> Result<Self> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(SearchError::DimensionMismatch {
                expected: dim,
                got: data.len(),
            });
        }
        Ok(Self { dim, data })
    }

    pub fn push_row(&mut self, row: &[f32]) -> Result<()> {
        if row.len() != self.dim {
            return Err(SearchError::DimensionMismatch {
                expected: self.dim,
                got: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn rows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    pub fn iter_rows(&self) -> impl ExactSizeIterator<Item = &[f32]> + '_ {
        self.data.chunks_exact(self.dim.max(1))
    }

    #[inline]
    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }

    /// Buffer length agrees with the dimension (deserialized data skips `from_flat`)
    pub(crate) fn is_well_formed(&self) -> bool {
        if self.dim == 0 {
            self.data.is_empty()
        } else {
            self.data.len() % self.dim == 0
        }
    }
}

// ============================================================
// NORMALIZATION
// ============================================================

/// Min-max scale `values` into `[0, 1]`.
///
/// A constant input maps to all zeros, and any non-finite result is
/// replaced with 0.
pub fn normalize(values: &[f64]) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let span = max - min;

    values
        .iter()
        .map(|&v| {
            let scaled = if span > 0.0 { (v - min) / span } else { 0.0 };
            if scaled.is_finite() {
                (scaled as f32).clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

// ============================================================
// PROVENANCE & CORPUS
// ============================================================

/// Where a window came from: store label plus inclusive offset range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub label: usize,
    pub start: usize,
    /// Inclusive: the window covers `start..=end`
    pub end: usize,
}

/// All normalized windows of one size, across every symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCorpus {
    window_size: usize,
    matrix: Matrix,
    provenance: Vec<Provenance>,
}

impl WindowCorpus {
    /// Assemble a corpus from already-aligned parts
    pub fn from_parts(window_size: usize, matrix: Matrix, provenance: Vec<Provenance>) -> Result<Self> {
        if matrix.dim() != window_size {
            return Err(SearchError::DimensionMismatch {
                expected: window_size,
                got: matrix.dim(),
            });
        }
        if matrix.rows() != provenance.len() {
            return Err(SearchError::Config(format!(
                "corpus has {} windows but {} provenance entries",
                matrix.rows(),
                provenance.len()
            )));
        }
        Ok(Self {
            window_size,
            matrix,
            provenance,
        })
    }

    /// Slide a window of `window_size` over every populated store row.
    ///
    /// Symbols with fewer than `window_size` values contribute nothing.
    pub fn build(store: &TimeSeriesStore, window_size: usize, min_window_size: usize) -> Result<Self> {
        if window_size == 0 || window_size < min_window_size {
            return Err(SearchError::WindowTooSmall {
                size: window_size,
                min: min_window_size.max(1),
            });
        }
        if !store.is_filled() {
            return Err(SearchError::NotReady("store has not been filled"));
        }

        let total: usize = (0..store.symbols().len())
            .map(|label| windows_for(store.valid_length(label), window_size))
            .sum();
        let mut matrix = Matrix::with_capacity(window_size, total);
        let mut provenance = Vec::with_capacity(total);

        for label in 0..store.symbols().len() {
            let values = store.values(label);
            let count = windows_for(values.len(), window_size);
            for start in 0..count {
                let end = start + window_size - 1;
                matrix.push_row(&normalize(&values[start..=end]))?;
                provenance.push(Provenance { label, start, end });
            }
            debug!(symbol = store.symbol_of(label).unwrap_or("?"), windows = count, "windows built");
        }

        Self::from_parts(window_size, matrix, provenance)
    }

    #[inline]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.provenance.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.provenance.is_empty()
    }

    #[inline]
    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    pub fn provenance(&self, index: usize) -> Option<Provenance> {
        self.provenance.get(index).copied()
    }

    /// Normalized window at corpus position `index`
    pub fn window(&self, index: usize) -> Option<&[f32]> {
        (index < self.len()).then(|| self.matrix.row(index))
    }

    /// Reject a deserialized corpus whose rows and provenance disagree
    pub(crate) fn check_integrity(&self) -> Result<()> {
        let window_size = self.window_size;
        let aligned = window_size > 0
            && self.matrix.is_well_formed()
            && self.matrix.dim() == window_size
            && self.matrix.rows() == self.provenance.len()
            && self
                .provenance
                .iter()
                .all(|p| p.start.checked_add(window_size) == p.end.checked_add(1));
        if !aligned {
            return Err(SearchError::CorruptIndex("corpus windows are misaligned".to_string()));
        }
        Ok(())
    }

    /// Corpus positions belonging to `label`, in offset order
    pub fn positions_for(&self, label: usize) -> impl Iterator<Item = usize> + '_ {
        self.provenance
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.label == label)
            .map(|(i, _)| i)
    }
}

/// `len - window_size + 1`, or 0 when the row is too short
#[inline]
fn windows_for(len: usize, window_size: usize) -> usize {
    (len + 1).saturating_sub(window_size)
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryFetcher, Series};

    fn filled_store(rows: &[(&str, &[f64])]) -> TimeSeriesStore {
        let mut fetcher = MemoryFetcher::new();
        for (symbol, values) in rows {
            let dates = (0..values.len()).map(|i| 1_000_000 - i as i64 * 86_400).collect();
            fetcher.insert(*symbol, Series::new(values.to_vec(), dates));
        }
        let symbols: Vec<&str> = rows.iter().map(|(s, _)| *s).collect();
        let mut store = TimeSeriesStore::create(&symbols, 1, 1).unwrap();
        store.fill(&fetcher).unwrap();
        store
    }

    #[test]
    fn test_normalize_basic() {
        let n = normalize(&[10.0, 12.0, 11.0]);
        assert_eq!(n, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_normalize_constant_is_zero() {
        assert_eq!(normalize(&[7.0, 7.0, 7.0, 7.0]), vec![0.0; 4]);
    }

    #[test]
    fn test_normalize_non_finite_is_zero() {
        let n = normalize(&[1.0, f64::NAN, 3.0]);
        assert!(n.iter().all(|v| v.is_finite()));
        assert_eq!(n[1], 0.0);
    }

    #[test]
    fn test_window_counts_and_provenance() {
        let store = filled_store(&[
            ("A", &[10.0, 12.0, 11.0, 9.0, 10.0, 13.0]),
            ("B", &[1.0, 2.0]),
        ]);
        let corpus = WindowCorpus::build(&store, 3, 3).unwrap();

        assert_eq!(corpus.len(), 4);
        assert_eq!(corpus.provenance(0), Some(Provenance { label: 0, start: 0, end: 2 }));
        assert_eq!(corpus.provenance(3), Some(Provenance { label: 0, start: 3, end: 5 }));
        assert_eq!(corpus.window(0).unwrap(), &[0.0, 1.0, 0.5]);
        assert_eq!(corpus.positions_for(1).count(), 0);
    }

    #[test]
    fn test_exact_length_gives_one_window() {
        let store = filled_store(&[("A", &[1.0, 2.0, 3.0, 4.0, 5.0])]);
        let corpus = WindowCorpus::build(&store, 5, MIN_WINDOW_SIZE).unwrap();
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn test_short_symbol_contributes_nothing() {
        let store = filled_store(&[("A", &[1.0, 2.0]), ("B", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])]);
        let corpus = WindowCorpus::build(&store, 5, MIN_WINDOW_SIZE).unwrap();
        assert_eq!(corpus.len(), 2);
        assert!(corpus.positions_for(0).next().is_none());
    }

    #[test]
    fn test_window_too_small() {
        let store = filled_store(&[("A", &[1.0, 2.0, 3.0])]);
        assert!(matches!(
            WindowCorpus::build(&store, 3, MIN_WINDOW_SIZE),
            Err(SearchError::WindowTooSmall { size: 3, min: 5 })
        ));
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let store = filled_store(&[("A", &[1.0, 2.0, 3.0])]);
        assert!(matches!(
            WindowCorpus::build(&store, 0, 0),
            Err(SearchError::WindowTooSmall { size: 0, min: 1 })
        ));
    }

    #[test]
    fn test_unfilled_store_is_not_ready() {
        let store = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
        assert!(matches!(
            WindowCorpus::build(&store, 5, MIN_WINDOW_SIZE),
            Err(SearchError::NotReady(_))
        ));
    }

    #[test]
    fn test_from_parts_checks_alignment() {
        let matrix = Matrix::from_flat(2, vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        let one = vec![Provenance { label: 0, start: 0, end: 1 }];
        assert!(WindowCorpus::from_parts(2, matrix, one).is_err());
    }

    #[test]
    fn test_matrix_from_flat_rejects_ragged() {
        assert!(Matrix::from_flat(3, vec![0.0; 7]).is_err());
        assert_eq!(Matrix::from_flat(3, vec![0.0; 6]).unwrap().rows(), 2);
    }
}
