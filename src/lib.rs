//! # patternsearch - windowed price-pattern similarity search
//!
//! Finds historical windows of price series that look like a symbol's most
//! recent window, and turns what happened after them into a directional
//! forecast.
//!
//! Pipeline: [`TimeSeriesStore`] → [`WindowCorpus`] → [`SimilarityIndex`]
//! backend → [`resolve`] / [`forecast`].
//!
//! ## Quick Start
//!
//! ```rust
//! use patternsearch::prelude::*;
//!
//! let closes: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
//! let dates: Vec<i64> = (0..60).map(|i| 1_706_659_200 - i * 86_400).collect();
//! let fetcher = MemoryFetcher::new().with_series("AAPL", Series::new(closes, dates));
//!
//! let engine = EngineBuilder::new()
//!     .fetcher(fetcher)
//!     .period_years(1)
//!     .build()
//!     .unwrap();
//!
//! let (store, report) = engine.build_store(&["AAPL"]).unwrap();
//! assert!(report.is_complete());
//!
//! let index = engine.build_index(&store, 10).unwrap();
//! let response = engine.search(&store, &index, "AAPL", 10, 5, 3).unwrap();
//! assert_eq!(response.matches.len(), 5);
//! ```

pub mod index;
pub mod resolver;
pub mod snapshot;
pub mod store;
pub mod window;

pub use index::{
    BackendKind, BruteForceIndex, IndexBackend, KdTreeIndex, Neighbors, QuantizedIndex, QuantizerConfig,
    SimilarityIndex,
};
pub use resolver::{forecast, resolve, Direction, Forecast, Match};
pub use store::{Fetcher, FillFailure, FillReport, MemoryFetcher, Series, TimeSeriesStore};
pub use window::{normalize, Matrix, Provenance, WindowCorpus, MIN_WINDOW_SIZE};

pub mod prelude {
    pub use crate::{
        // Index backends
        index::{BackendKind, IndexBackend, QuantizerConfig, SimilarityIndex},
        // Resolution
        resolver::{Direction, Forecast, Match},
        // Storage
        store::{Fetcher, FillReport, MemoryFetcher, Series, TimeSeriesStore},
        // Windows
        window::{Matrix, WindowCorpus},
        BuildFailure,
        EngineBuilder,
        EngineConfig,
        IndexHandle,
        IndexSet,
        PatternIndex,
        Result,
        SearchEngine,
        // Errors
        SearchError,
        SearchResponse,
        StoreHandle,
    };
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::snapshot::{PayloadKind, SnapshotKey};

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, SearchError>;

/// Errors that can occur while building or querying the engine
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("Insufficient data: need {need} values, got {got}")]
    InsufficientData { need: usize, got: usize },

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Window size {size} below minimum {min}")]
    WindowTooSmall { size: usize, min: usize },

    #[error("Corpus has no windows")]
    EmptyCorpus,

    #[error("No sub-quantizer count divides dimension {0}")]
    UnsupportedDimension(usize),

    #[error("Insufficient training data: need {need} rows, got {got}")]
    InsufficientTrainingData { need: usize, got: usize },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Index has not been built")]
    NotBuilt,

    #[error("Index is already built")]
    AlreadyBuilt,

    #[error("Not ready: {0}")]
    NotReady(&'static str),

    #[error("Store is already filled")]
    AlreadyFilled,

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("No matches to forecast from")]
    EmptyMatchSet,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SearchError {
    /// The request itself was bad (unknown symbol, too little history, ...)
    pub fn is_rejected_request(&self) -> bool {
        matches!(
            self,
            SearchError::InsufficientData { .. }
                | SearchError::UnknownSymbol(_)
                | SearchError::WindowTooSmall { .. }
                | SearchError::DimensionMismatch { .. }
        )
    }

    /// The request was fine but something has not been built or filled yet
    pub fn is_not_ready(&self) -> bool {
        matches!(self, SearchError::NotBuilt | SearchError::NotReady(_))
    }
}

// ============================================================
// CONFIG
// ============================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub period_years: u32,
    pub interval_days: u32,
    pub min_window_size: usize,
    pub backend: BackendKind,
    /// Worker threads for fills and builds; `None` uses every core
    pub threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            period_years: 2,
            interval_days: 1,
            min_window_size: MIN_WINDOW_SIZE,
            backend: BackendKind::default(),
            threads: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.period_years == 0 {
            return Err(SearchError::Config("period_years must be > 0".to_string()));
        }
        if self.interval_days == 0 {
            return Err(SearchError::Config("interval_days must be > 0".to_string()));
        }
        if self.min_window_size == 0 {
            return Err(SearchError::Config("min_window_size must be > 0".to_string()));
        }
        if self.threads == Some(0) {
            return Err(SearchError::Config("threads must be > 0".to_string()));
        }
        self.backend.validate()
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get)
    }
}

// ============================================================
// PATTERN INDEX - corpus + backend for one window size
// ============================================================

/// Shared, immutable store
pub type StoreHandle = Arc<TimeSeriesStore>;

/// Shared, immutable index for one window size
pub type IndexHandle = Arc<PatternIndex>;

/// A window corpus together with the backend built over it.
///
/// Corpus positions are offsets into one particular store, so the index
/// remembers that store's [`fingerprint`](TimeSeriesStore::fingerprint) and
/// refuses to resolve against any other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternIndex {
    corpus: WindowCorpus,
    backend: IndexBackend,
    store_fingerprint: u64,
}

impl PatternIndex {
    /// Window the store and build a fresh backend over the corpus
    pub fn build(
        store: &TimeSeriesStore,
        window_size: usize,
        min_window_size: usize,
        kind: BackendKind,
    ) -> Result<Self> {
        let started = Instant::now();
        let corpus = WindowCorpus::build(store, window_size, min_window_size)?;
        let mut backend = kind.instantiate();
        backend.build(corpus.matrix())?;

        info!(
            window_size,
            windows = corpus.len(),
            backend = kind.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index built"
        );
        Ok(Self {
            corpus,
            backend,
            store_fingerprint: store.fingerprint(),
        })
    }

    #[inline]
    pub fn window_size(&self) -> usize {
        self.corpus.window_size()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.corpus.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.corpus.is_empty()
    }

    #[inline]
    pub fn corpus(&self) -> &WindowCorpus {
        &self.corpus
    }

    #[inline]
    pub fn backend(&self) -> &IndexBackend {
        &self.backend
    }

    /// Fingerprint of the store this index was built from
    #[inline]
    pub fn store_fingerprint(&self) -> u64 {
        self.store_fingerprint
    }

    /// Fail with `NotReady` unless `store` is the one this index was built from
    pub fn check_store(&self, store: &TimeSeriesStore) -> Result<()> {
        if store.fingerprint() != self.store_fingerprint {
            return Err(SearchError::NotReady("index was built from a different store"));
        }
        Ok(())
    }

    /// Nearest windows to an arbitrary series, normalized like the corpus.
    ///
    /// Nothing is excluded: a query taken from the corpus finds itself first.
    pub fn search_values(
        &self,
        store: &TimeSeriesStore,
        values: &[f64],
        k: usize,
        future_size: usize,
    ) -> Result<Vec<Match>> {
        self.check_store(store)?;
        if values.len() != self.window_size() {
            return Err(SearchError::DimensionMismatch {
                expected: self.window_size(),
                got: values.len(),
            });
        }
        let neighbors = self.backend.query(&normalize(values), k)?;
        self.resolve_all(store, neighbors, future_size)
    }

    /// Nearest windows to `symbol`'s most recent window, minus the self-match.
    ///
    /// Queries `k + 1` neighbors and drops the first one.
    pub fn search_recent(
        &self,
        store: &TimeSeriesStore,
        symbol: &str,
        k: usize,
        future_size: usize,
    ) -> Result<Vec<Match>> {
        self.check_store(store)?;
        let anchor = store.recent_window(symbol, self.window_size())?;
        let neighbors = self.backend.query(&normalize(anchor), k.saturating_add(1))?;
        self.resolve_all(store, neighbors.skip(1), future_size)
    }

    fn resolve_all(&self, store: &TimeSeriesStore, neighbors: Neighbors, future_size: usize) -> Result<Vec<Match>> {
        neighbors
            .iter()
            .map(|(i, distance)| resolve(&self.corpus, store, i, distance, future_size))
            .collect()
    }

    /// Serialize corpus and backend as one blob
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        snapshot::encode(PayloadKind::Index, self)
    }

    /// Load a blob written by [`snapshot`](Self::snapshot)
    pub fn restore(blob: &[u8]) -> Result<Self> {
        let index: Self = snapshot::decode(PayloadKind::Index, blob)
            .map_err(|e| SearchError::CorruptIndex(e.to_string()))?;
        index.corpus.check_integrity()?;
        index.backend.check_integrity()?;
        if !index.backend.is_built()
            || index.backend.len() != index.corpus.len()
            || index.backend.dim() != index.corpus.window_size()
        {
            return Err(SearchError::CorruptIndex(
                "backend does not match its corpus".to_string(),
            ));
        }
        Ok(index)
    }
}

// ============================================================
// INDEX SET - live indexes by window size
// ============================================================

/// Registry of built indexes keyed by window size.
///
/// Readers clone an `Arc` and never see a half-built index: rebuilds happen
/// outside the lock and are swapped in whole.
#[derive(Debug, Default)]
pub struct IndexSet {
    indexes: RwLock<HashMap<usize, IndexHandle>>,
    last_refreshed: RwLock<Option<DateTime<Utc>>>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `index` under its window size, returning the one it replaces
    pub fn install(&self, index: IndexHandle) -> Option<IndexHandle> {
        let previous = self
            .indexes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(index.window_size(), index);
        *self.last_refreshed.write().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        previous
    }

    pub fn get(&self, window_size: usize) -> Option<IndexHandle> {
        self.indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&window_size)
            .cloned()
    }

    /// Installed window sizes, ascending
    pub fn window_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self
            .indexes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        sizes.sort_unstable();
        sizes
    }

    pub fn len(&self) -> usize {
        self.indexes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When an index was last installed
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        *self.last_refreshed.read().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================
// SEARCH ENGINE
// ============================================================

/// Result of [`SearchEngine::search`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub anchor_symbol: String,
    /// The queried window, most-recent-first
    pub anchor_values: Vec<f64>,
    pub window_size: usize,
    pub top_k: usize,
    pub future_size: usize,
    pub matches: Vec<Match>,
    pub forecast_direction: Direction,
    pub forecast_confidence: f64,
}

/// Index build that failed for one window size
#[derive(Debug)]
pub struct BuildFailure {
    pub window_size: usize,
    pub error: SearchError,
}

/// Builds stores and indexes on a bounded worker pool and answers searches
#[derive(Debug)]
pub struct SearchEngine<F: Fetcher = MemoryFetcher> {
    fetcher: F,
    config: EngineConfig,
    pool: rayon::ThreadPool,
}

impl<F: Fetcher> SearchEngine<F> {
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    // ===========================================
    // Builds
    // ===========================================

    /// Create and fill a store for `symbols`.
    ///
    /// Per-symbol fetch failures land in the report; only configuration
    /// problems fail the call.
    pub fn build_store(&self, symbols: &[impl AsRef<str>]) -> Result<(StoreHandle, FillReport)> {
        let mut store = TimeSeriesStore::create(symbols, self.config.period_years, self.config.interval_days)?;
        let report = self.pool.install(|| store.fill(&self.fetcher))?;
        Ok((Arc::new(store), report))
    }

    /// Build the index for one window size with the configured backend
    pub fn build_index(&self, store: &TimeSeriesStore, window_size: usize) -> Result<IndexHandle> {
        self.pool
            .install(|| PatternIndex::build(store, window_size, self.config.min_window_size, self.config.backend))
            .map(Arc::new)
    }

    /// Build several window sizes in parallel; failures are isolated per size
    pub fn build_indexes(&self, store: &TimeSeriesStore, window_sizes: &[usize]) -> (Vec<IndexHandle>, Vec<BuildFailure>) {
        let results: Vec<std::result::Result<IndexHandle, BuildFailure>> = self.pool.install(|| {
            window_sizes
                .par_iter()
                .map(|&window_size| {
                    PatternIndex::build(store, window_size, self.config.min_window_size, self.config.backend)
                        .map(Arc::new)
                        .map_err(|error| BuildFailure { window_size, error })
                })
                .collect()
        });

        let mut successes = Vec::new();
        let mut errors = Vec::new();

        for result in results {
            match result {
                Ok(index) => successes.push(index),
                Err(failure) => {
                    warn!(window_size = failure.window_size, error = %failure.error, "index build failed");
                    errors.push(failure)
                }
            }
        }

        (successes, errors)
    }

    // ===========================================
    // Query
    // ===========================================

    /// Find the `k` windows most similar to `symbol`'s latest `window_size`
    /// values and forecast from their next `future_size` values.
    pub fn search(
        &self,
        store: &TimeSeriesStore,
        index: &PatternIndex,
        symbol: &str,
        window_size: usize,
        k: usize,
        future_size: usize,
    ) -> Result<SearchResponse> {
        if index.window_size() != window_size {
            return Err(SearchError::DimensionMismatch {
                expected: index.window_size(),
                got: window_size,
            });
        }
        index.check_store(store)?;

        let anchor_values = store.recent_window(symbol, window_size)?.to_vec();
        let matches = index.search_recent(store, symbol, k, future_size)?;
        let Forecast {
            direction,
            confidence,
            ..
        } = forecast(&matches, window_size)?;

        Ok(SearchResponse {
            anchor_symbol: symbol.to_string(),
            anchor_values,
            window_size,
            top_k: k,
            future_size,
            matches,
            forecast_direction: direction,
            forecast_confidence: confidence,
        })
    }

    // ===========================================
    // Snapshots
    // ===========================================

    /// Restore today's store snapshot from `dir`, or build and save one.
    ///
    /// The report is `None` when the store came from disk. An unreadable
    /// snapshot is logged and rebuilt.
    pub fn load_or_build_store(
        &self,
        dir: &Path,
        symbols: &[impl AsRef<str>],
        force_update: bool,
    ) -> Result<(StoreHandle, Option<FillReport>)> {
        self.load_or_build_store_on(dir, symbols, Utc::now().date_naive(), force_update)
    }

    /// [`load_or_build_store`](Self::load_or_build_store) for a given day
    pub fn load_or_build_store_on(
        &self,
        dir: &Path,
        symbols: &[impl AsRef<str>],
        date: NaiveDate,
        force_update: bool,
    ) -> Result<(StoreHandle, Option<FillReport>)> {
        let names: Vec<String> = symbols.iter().map(|s| s.as_ref().to_string()).collect();
        let key = SnapshotKey::store(&names, self.config.period_years, self.config.interval_days, date);
        let path = key.path_in(dir);

        if !force_update {
            if let Some(blob) = snapshot::load(&path)? {
                match TimeSeriesStore::restore(&blob) {
                    Ok(store)
                        if store.symbols() == names.as_slice()
                            && store.period_years() == self.config.period_years
                            && store.interval_days() == self.config.interval_days =>
                    {
                        info!(path = %path.display(), "store loaded from snapshot");
                        return Ok((Arc::new(store), None));
                    }
                    Ok(_) => warn!(path = %path.display(), "store snapshot layout differs, rebuilding"),
                    Err(e) => warn!(path = %path.display(), error = %e, "store snapshot unreadable, rebuilding"),
                }
            }
        }

        let (store, report) = self.build_store(&names)?;
        snapshot::save(&path, &store.snapshot()?)?;
        info!(path = %path.display(), "store snapshot saved");
        Ok((store, Some(report)))
    }

    /// Restore today's index snapshot for `window_size`, or build and save one.
    ///
    /// A snapshot built from a different store (for example before a
    /// same-day store refresh) is rebuilt.
    pub fn load_or_build_index(
        &self,
        dir: &Path,
        store: &TimeSeriesStore,
        window_size: usize,
        force_update: bool,
    ) -> Result<IndexHandle> {
        self.load_or_build_index_on(dir, store, window_size, Utc::now().date_naive(), force_update)
    }

    /// [`load_or_build_index`](Self::load_or_build_index) for a given day
    pub fn load_or_build_index_on(
        &self,
        dir: &Path,
        store: &TimeSeriesStore,
        window_size: usize,
        date: NaiveDate,
        force_update: bool,
    ) -> Result<IndexHandle> {
        let key = SnapshotKey::index(
            store.symbols(),
            store.period_years(),
            store.interval_days(),
            window_size,
            date,
        );
        let path = key.path_in(dir);

        if !force_update {
            if let Some(blob) = snapshot::load(&path)? {
                match PatternIndex::restore(&blob) {
                    Ok(index) if index.window_size() != window_size || index.backend().kind() != self.config.backend => {
                        warn!(path = %path.display(), "index snapshot settings differ, rebuilding")
                    }
                    Ok(index) if index.check_store(store).is_err() => {
                        warn!(path = %path.display(), "index snapshot belongs to another store, rebuilding")
                    }
                    Ok(index) => {
                        info!(path = %path.display(), "index loaded from snapshot");
                        return Ok(Arc::new(index));
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "index snapshot unreadable, rebuilding"),
                }
            }
        }

        let index = self.build_index(store, window_size)?;
        snapshot::save(&path, &index.snapshot()?)?;
        info!(path = %path.display(), "index snapshot saved");
        Ok(index)
    }
}

// ============================================================
// BUILDER
// ============================================================

/// Builder for creating SearchEngine instances
#[derive(Debug)]
pub struct EngineBuilder<F: Fetcher = MemoryFetcher> {
    fetcher: F,
    config: EngineConfig,
}

impl Default for EngineBuilder<MemoryFetcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder<MemoryFetcher> {
    pub fn new() -> Self {
        Self {
            fetcher: MemoryFetcher::new(),
            config: EngineConfig::default(),
        }
    }
}

impl<F: Fetcher> EngineBuilder<F> {
    /// Change data source
    pub fn fetcher<F2: Fetcher>(self, fetcher: F2) -> EngineBuilder<F2> {
        EngineBuilder {
            fetcher,
            config: self.config,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn period_years(mut self, years: u32) -> Self {
        self.config.period_years = years;
        self
    }

    pub fn interval_days(mut self, days: u32) -> Self {
        self.config.interval_days = days;
        self
    }

    pub fn min_window_size(mut self, size: usize) -> Self {
        self.config.min_window_size = size;
        self
    }

    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.config.backend = kind;
        self
    }

    /// Size of the worker pool
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = Some(threads);
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<SearchEngine<F>> {
        self.config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.thread_count())
            .build()
            .map_err(|e| SearchError::Config(format!("worker pool: {e}")))?;

        Ok(SearchEngine {
            fetcher: self.fetcher,
            config: self.config,
            pool,
        })
    }
}

// ============================================================
// TESTS
// ============================================================
