//! Dense per-symbol time-series storage
//!
//! Every symbol owns one fixed-capacity row in two preallocated buffers
//! (close values and Unix-second dates). Rows are ordered most-recent-first:
//! offset 0 is the latest observation. Only the first `valid_length[label]`
//! offsets of a row are meaningful.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::snapshot::{self, Fnv1a64, PayloadKind};
use crate::{Result, SearchError};

/// Days per year used by the capacity formula
pub const DAYS_PER_YEAR: usize = 365;

// ============================================================
// FETCH COLLABORATOR
// ============================================================

/// A symbol's series as delivered by a [`Fetcher`], most-recent-first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub closes: Vec<f64>,
    /// Unix timestamps (seconds, UTC) aligned with `closes`
    pub dates: Vec<i64>,
}

impl Series {
    pub fn new(closes: Vec<f64>, dates: Vec<i64>) -> Self {
        Self { closes, dates }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.closes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }
}

/// Source of raw price history.
///
/// Implementations may block on I/O; the store calls them from its worker
/// pool, one call per symbol.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, symbol: &str, period_years: u32, interval_days: u32) -> Result<Series>;
}

/// In-memory fetcher backed by a symbol → series map
#[derive(Debug, Clone, Default)]
pub struct MemoryFetcher {
    series: HashMap<String, Series>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a series for a symbol, replacing any previous one
    pub fn with_series(mut self, symbol: impl Into<String>, series: Series) -> Self {
        self.series.insert(symbol.into(), series);
        self
    }

    pub fn insert(&mut self, symbol: impl Into<String>, series: Series) {
        self.series.insert(symbol.into(), series);
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, symbol: &str, _period_years: u32, _interval_days: u32) -> Result<Series> {
        self.series
            .get(symbol)
            .cloned()
            .ok_or_else(|| SearchError::DataUnavailable {
                symbol: symbol.to_string(),
                reason: "no series registered".to_string(),
            })
    }
}

// ============================================================
// FILL REPORT
// ============================================================

/// A symbol that could not be loaded during [`TimeSeriesStore::fill`]
#[derive(Debug)]
pub struct FillFailure {
    pub symbol: String,
    pub error: SearchError,
}

/// Outcome of a fill: loaded symbols and isolated per-symbol failures
#[derive(Debug, Default)]
pub struct FillReport {
    pub filled: Vec<String>,
    pub failed: Vec<FillFailure>,
}

impl FillReport {
    pub fn failed_symbols(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.symbol.as_str()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================
// STORE
// ============================================================

/// Fixed-capacity price store for a set of symbols
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesStore {
    symbols: Vec<String>,
    period_years: u32,
    interval_days: u32,
    capacity: usize,
    values: Vec<f64>,
    dates: Vec<i64>,
    valid_length: Vec<usize>,
    is_filled: bool,
    #[serde(skip)]
    labels: HashMap<String, usize>,
    #[serde(skip)]
    fingerprint: u64,
}

impl TimeSeriesStore {
    /// Allocate an empty, zero-filled store.
    ///
    /// Capacity per symbol is `period_years * interval_days * 365`.
    pub fn create(symbols: &[impl AsRef<str>], period_years: u32, interval_days: u32) -> Result<Self> {
        if symbols.is_empty() {
            return Err(SearchError::Config("symbol list is empty".to_string()));
        }

        let capacity = (period_years as usize)
            .checked_mul(interval_days as usize)
            .and_then(|c| c.checked_mul(DAYS_PER_YEAR))
            .ok_or_else(|| SearchError::Config("store capacity overflows".to_string()))?;
        if capacity == 0 {
            return Err(SearchError::Config(format!(
                "capacity must be > 0 (period_years = {period_years}, interval_days = {interval_days})"
            )));
        }

        let symbols: Vec<String> = symbols.iter().map(|s| s.as_ref().to_string()).collect();
        let labels = label_map(&symbols)?;
        let total = symbols
            .len()
            .checked_mul(capacity)
            .ok_or_else(|| SearchError::Config("store capacity overflows".to_string()))?;

        let mut store = Self {
            period_years,
            interval_days,
            capacity,
            values: vec![0.0; total],
            dates: vec![0; total],
            valid_length: vec![0; symbols.len()],
            is_filled: false,
            labels,
            symbols,
            fingerprint: 0,
        };
        store.fingerprint = store.compute_fingerprint();
        Ok(store)
    }

    /// Load every symbol through `fetcher`, one task per symbol.
    ///
    /// A failing symbol is logged, reported and left empty; it never aborts
    /// the other symbols.
    pub fn fill<F: Fetcher + ?Sized>(&mut self, fetcher: &F) -> Result<FillReport> {
        let progress = AtomicUsize::new(0);
        self.fill_with_progress(fetcher, &progress)
    }

    /// Same as [`fill`](Self::fill), counting finished symbols in `progress`
    pub fn fill_with_progress<F: Fetcher + ?Sized>(
        &mut self,
        fetcher: &F,
        progress: &AtomicUsize,
    ) -> Result<FillReport> {
        if self.is_filled {
            return Err(SearchError::AlreadyFilled);
        }

        let started = Instant::now();
        let capacity = self.capacity;
        let period_years = self.period_years;
        let interval_days = self.interval_days;
        let total = self.symbols.len();
        let symbols = &self.symbols;

        let outcomes: Vec<std::result::Result<String, FillFailure>> = self
            .values
            .par_chunks_mut(capacity)
            .zip(self.dates.par_chunks_mut(capacity))
            .zip(self.valid_length.par_iter_mut())
            .zip(symbols.par_iter())
            .map(|(((value_row, date_row), valid), symbol)| {
                let outcome = fetcher
                    .fetch(symbol, period_years, interval_days)
                    .and_then(|series| write_row(symbol, series, value_row, date_row, capacity))
                    .map(|len| {
                        *valid = len;
                        symbol.clone()
                    })
                    .map_err(|error| FillFailure {
                        symbol: symbol.clone(),
                        error,
                    });

                let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(symbol = %symbol, done, total, "symbol fetch finished");
                outcome
            })
            .collect();

        let mut report = FillReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(symbol) => report.filled.push(symbol),
                Err(failure) => {
                    warn!(symbol = %failure.symbol, error = %failure.error, "skipping symbol");
                    report.failed.push(failure);
                }
            }
        }

        self.is_filled = true;
        self.fingerprint = self.compute_fingerprint();
        info!(
            filled = report.filled.len(),
            failed = report.failed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "store filled"
        );
        Ok(report)
    }

    // ===========================================
    // Accessors
    // ===========================================

    #[inline]
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn period_years(&self) -> u32 {
        self.period_years
    }

    #[inline]
    pub fn interval_days(&self) -> u32 {
        self.interval_days
    }

    #[inline]
    pub fn is_filled(&self) -> bool {
        self.is_filled
    }

    pub fn label_of(&self, symbol: &str) -> Option<usize> {
        self.labels.get(symbol).copied()
    }

    pub fn symbol_of(&self, label: usize) -> Option<&str> {
        self.symbols.get(label).map(String::as_str)
    }

    /// Digest of the populated contents.
    ///
    /// Two stores with the same symbols, lengths, values and dates share a
    /// fingerprint. Indexes record it to detect being paired with another store.
    #[inline]
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Number of populated offsets for `label` (0 for unknown labels)
    pub fn valid_length(&self, label: usize) -> usize {
        self.valid_length.get(label).copied().unwrap_or(0)
    }

    /// Populated values of a symbol row, most-recent-first
    pub fn values(&self, label: usize) -> &[f64] {
        match self.row_range(label) {
            Some(range) => &self.values[range],
            None => &[],
        }
    }

    /// Populated dates of a symbol row, aligned with [`values`](Self::values)
    pub fn dates(&self, label: usize) -> &[i64] {
        match self.row_range(label) {
            Some(range) => &self.dates[range],
            None => &[],
        }
    }

    /// The `size` most recent values of `symbol`
    pub fn recent_window(&self, symbol: &str, size: usize) -> Result<&[f64]> {
        let label = self
            .label_of(symbol)
            .ok_or_else(|| SearchError::UnknownSymbol(symbol.to_string()))?;
        let values = self.values(label);
        if values.len() < size {
            return Err(SearchError::InsufficientData {
                need: size,
                got: values.len(),
            });
        }
        Ok(&values[..size])
    }

    // ===========================================
    // Persistence
    // ===========================================

    /// Serialize the whole store into an opaque snapshot blob
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        if !self.is_filled {
            return Err(SearchError::NotReady("store has not been filled"));
        }
        snapshot::encode(PayloadKind::Store, self)
    }

    /// Rebuild a store from a [`snapshot`](Self::snapshot) blob
    pub fn restore(blob: &[u8]) -> Result<Self> {
        let mut store: Self = snapshot::decode(PayloadKind::Store, blob)
            .map_err(|e| SearchError::CorruptSnapshot(e.to_string()))?;
        store.check_layout()?;
        store.labels = label_map(&store.symbols)
            .map_err(|e| SearchError::CorruptSnapshot(e.to_string()))?;
        store.fingerprint = store.compute_fingerprint();
        Ok(store)
    }

    fn row_range(&self, label: usize) -> Option<std::ops::Range<usize>> {
        let len = *self.valid_length.get(label)?;
        let start = label * self.capacity;
        Some(start..start + len)
    }

    fn check_layout(&self) -> Result<()> {
        let total = self
            .symbols
            .len()
            .checked_mul(self.capacity)
            .ok_or_else(|| SearchError::CorruptSnapshot("declared store size overflows".to_string()))?;
        if self.symbols.is_empty()
            || self.capacity == 0
            || self.values.len() != total
            || self.dates.len() != total
            || self.valid_length.len() != self.symbols.len()
            || self.valid_length.iter().any(|&len| len > self.capacity)
        {
            return Err(SearchError::CorruptSnapshot(
                "store buffers do not match declared layout".to_string(),
            ));
        }
        Ok(())
    }

    fn compute_fingerprint(&self) -> u64 {
        let mut hasher = Fnv1a64::new();
        for label in 0..self.symbols.len() {
            hasher.write(self.symbols[label].as_bytes());
            hasher.write(&[0]);
            hasher.write(&(self.valid_length(label) as u64).to_le_bytes());
            for v in self.values(label) {
                hasher.write(&v.to_bits().to_le_bytes());
            }
            for d in self.dates(label) {
                hasher.write(&d.to_le_bytes());
            }
        }
        hasher.finish()
    }
}

fn label_map(symbols: &[String]) -> Result<HashMap<String, usize>> {
    let mut labels = HashMap::with_capacity(symbols.len());
    for (label, symbol) in symbols.iter().enumerate() {
        if labels.insert(symbol.clone(), label).is_some() {
            return Err(SearchError::Config(format!("duplicate symbol: {symbol}")));
        }
    }
    Ok(labels)
}

/// Copy a fetched series into its row, returning the number of offsets written
fn write_row(
    symbol: &str,
    series: Series,
    value_row: &mut [f64],
    date_row: &mut [i64],
    capacity: usize,
) -> Result<usize> {
    if series.is_empty() {
        return Err(SearchError::DataUnavailable {
            symbol: symbol.to_string(),
            reason: "empty series".to_string(),
        });
    }
    if series.closes.len() != series.dates.len() {
        return Err(SearchError::DataUnavailable {
            symbol: symbol.to_string(),
            reason: format!(
                "{} values but {} dates",
                series.closes.len(),
                series.dates.len()
            ),
        });
    }

    let len = series.len().min(capacity);
    if series.len() > capacity {
        warn!(symbol, got = series.len(), capacity, "series truncated to store capacity");
    }
    value_row[..len].copy_from_slice(&series.closes[..len]);
    date_row[..len].copy_from_slice(&series.dates[..len]);
    Ok(len)
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400;

    fn series(values: &[f64]) -> Series {
        let dates = (0..values.len()).map(|i| 1_700_000_000 - i as i64 * DAY).collect();
        Series::new(values.to_vec(), dates)
    }

    struct FailingFetcher;

    impl Fetcher for FailingFetcher {
        fn fetch(&self, symbol: &str, _: u32, _: u32) -> Result<Series> {
            if symbol == "BAD" {
                return Err(SearchError::DataUnavailable {
                    symbol: symbol.to_string(),
                    reason: "upstream 404".to_string(),
                });
            }
            Ok(series(&[1.0, 2.0, 3.0]))
        }
    }

    #[test]
    fn test_create_capacity() {
        let store = TimeSeriesStore::create(&["A", "B"], 2, 1).unwrap();
        assert_eq!(store.capacity(), 730);
        assert_eq!(store.label_of("B"), Some(1));
        assert_eq!(store.symbol_of(0), Some("A"));
        assert!(!store.is_filled());
        assert!(store.values(0).is_empty());
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let empty: [&str; 0] = [];
        assert!(matches!(
            TimeSeriesStore::create(&empty, 1, 1),
            Err(SearchError::Config(_))
        ));
        assert!(matches!(
            TimeSeriesStore::create(&["A"], 0, 1),
            Err(SearchError::Config(_))
        ));
        assert!(matches!(
            TimeSeriesStore::create(&["A", "A"], 1, 1),
            Err(SearchError::Config(_))
        ));
    }

    #[test]
    fn test_fill_isolates_failures() {
        let mut store = TimeSeriesStore::create(&["A", "BAD", "C"], 1, 1).unwrap();
        let progress = AtomicUsize::new(0);
        let report = store.fill_with_progress(&FailingFetcher, &progress).unwrap();

        assert!(store.is_filled());
        assert_eq!(progress.load(Ordering::Relaxed), 3);
        assert_eq!(report.filled, vec!["A".to_string(), "C".to_string()]);
        assert_eq!(report.failed_symbols(), vec!["BAD"]);
        assert_eq!(store.valid_length(1), 0);
        assert_eq!(store.values(2), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_fill_skips_empty_and_mismatched_series() {
        let fetcher = MemoryFetcher::new()
            .with_series("EMPTY", Series::default())
            .with_series("SKEW", Series::new(vec![1.0, 2.0], vec![0]))
            .with_series("OK", series(&[5.0, 6.0]));
        let mut store = TimeSeriesStore::create(&["EMPTY", "SKEW", "OK", "MISSING"], 1, 1).unwrap();
        let report = store.fill(&fetcher).unwrap();

        assert_eq!(report.filled, vec!["OK".to_string()]);
        assert_eq!(report.failed.len(), 3);
        assert!(report
            .failed
            .iter()
            .all(|f| matches!(f.error, SearchError::DataUnavailable { .. })));
    }

    #[test]
    fn test_fill_truncates_to_capacity() {
        let long: Vec<f64> = (0..400).map(|i| i as f64).collect();
        let fetcher = MemoryFetcher::new().with_series("A", series(&long));
        let mut store = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
        store.fill(&fetcher).unwrap();

        assert_eq!(store.valid_length(0), 365);
        assert_eq!(store.values(0)[0], 0.0);
        assert_eq!(store.values(0)[364], 364.0);
    }

    #[test]
    fn test_fill_twice_is_rejected() {
        let fetcher = MemoryFetcher::new().with_series("A", series(&[1.0]));
        let mut store = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
        store.fill(&fetcher).unwrap();
        assert!(matches!(store.fill(&fetcher), Err(SearchError::AlreadyFilled)));
    }

    #[test]
    fn test_recent_window() {
        let fetcher = MemoryFetcher::new().with_series("A", series(&[10.0, 12.0, 11.0, 9.0]));
        let mut store = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
        store.fill(&fetcher).unwrap();

        assert_eq!(store.recent_window("A", 3).unwrap(), &[10.0, 12.0, 11.0]);
        assert!(matches!(
            store.recent_window("A", 5),
            Err(SearchError::InsufficientData { need: 5, got: 4 })
        ));
        assert!(matches!(
            store.recent_window("Z", 1),
            Err(SearchError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_snapshot_requires_fill() {
        let store = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
        assert!(matches!(store.snapshot(), Err(SearchError::NotReady(_))));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let fetcher = MemoryFetcher::new()
            .with_series("A", series(&[10.0, 12.0, 11.0]))
            .with_series("B", series(&[3.0, 4.0]));
        let mut store = TimeSeriesStore::create(&["A", "B"], 1, 1).unwrap();
        store.fill(&fetcher).unwrap();

        let restored = TimeSeriesStore::restore(&store.snapshot().unwrap()).unwrap();
        assert_eq!(restored.symbols(), store.symbols());
        assert_eq!(restored.values(0), store.values(0));
        assert_eq!(restored.dates(1), store.dates(1));
        assert_eq!(restored.valid_length(1), 2);
        assert_eq!(restored.label_of("B"), Some(1));
        assert!(restored.is_filled());
        assert_eq!(restored, store);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        assert!(matches!(
            TimeSeriesStore::restore(b"not a snapshot"),
            Err(SearchError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn test_restore_rejects_overflowing_layout() {
        let mut store = TimeSeriesStore::create(&["A", "B"], 1, 1).unwrap();
        store.capacity = usize::MAX / 2 + 1;
        store.values.clear();
        store.dates.clear();
        store.is_filled = true;

        let blob = snapshot::encode(PayloadKind::Store, &store).unwrap();
        assert!(matches!(
            TimeSeriesStore::restore(&blob),
            Err(SearchError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn test_restore_rejects_inconsistent_rows() {
        let fetcher = MemoryFetcher::new().with_series("A", series(&[1.0, 2.0]));
        let mut store = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
        store.fill(&fetcher).unwrap();

        let mut long_row = store.clone();
        long_row.valid_length[0] = 366;
        let mut duplicate = store.clone();
        duplicate.symbols = vec!["A".into(), "A".into()];
        duplicate.valid_length = vec![2, 2];
        duplicate.values.extend(vec![0.0; 365]);
        duplicate.dates.extend(vec![0; 365]);

        for bad in [long_row, duplicate] {
            let blob = snapshot::encode(PayloadKind::Store, &bad).unwrap();
            assert!(matches!(
                TimeSeriesStore::restore(&blob),
                Err(SearchError::CorruptSnapshot(_))
            ));
        }
    }

    #[test]
    fn test_fingerprint_tracks_contents() {
        let build = |head: f64| {
            let fetcher = MemoryFetcher::new().with_series("A", series(&[head, 2.0, 3.0]));
            let mut store = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
            store.fill(&fetcher).unwrap();
            store
        };
        let store = build(1.0);
        assert_eq!(store.fingerprint(), build(1.0).fingerprint());
        assert_ne!(store.fingerprint(), build(1.5).fingerprint());

        let restored = TimeSeriesStore::restore(&store.snapshot().unwrap()).unwrap();
        assert_eq!(restored.fingerprint(), store.fingerprint());

        let empty = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
        assert_ne!(empty.fingerprint(), store.fingerprint());
    }
}
