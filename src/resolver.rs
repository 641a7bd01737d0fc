//! Query results back to symbols, dates and outcomes
//!
//! A corpus position is traced through its [`Provenance`] to the store row it
//! came from. The row is read from `start - future_length` (clamped at the
//! most recent offset) through the window's last offset, so every match also
//! carries what happened *after* the window. The gap between the window's
//! boundary value and the series head drives the forecast.
//!
//! [`Provenance`]: crate::window::Provenance

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::snapshot::format_date;
use crate::store::TimeSeriesStore;
use crate::window::WindowCorpus;
use crate::{Result, SearchError};

/// One historical window similar to the query, with its outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub window_index: usize,
    pub distance: f32,
    pub symbol: String,
    /// Date at the window's start offset (its most recent day)
    pub start_date: String,
    /// Date at the window's end offset (its oldest day)
    pub end_date: String,
    /// Value at the window boundary
    pub anchor_value: f64,
    /// Value at the head of the extended series
    pub future_value: f64,
    /// `anchor_value - future_value`
    pub value_delta: f64,
    /// Extended series, most-recent-first
    pub values: Vec<f64>,
    pub dates: Vec<String>,
}

/// Map a corpus position to its symbol, dates and extended value series
pub fn resolve(
    corpus: &WindowCorpus,
    store: &TimeSeriesStore,
    window_index: usize,
    distance: f32,
    future_length: usize,
) -> Result<Match> {
    let prov = corpus.provenance(window_index).ok_or_else(|| {
        SearchError::CorruptIndex(format!(
            "window index {window_index} outside corpus of {}",
            corpus.len()
        ))
    })?;
    let symbol = store
        .symbol_of(prov.label)
        .ok_or_else(|| SearchError::CorruptIndex(format!("unknown label {}", prov.label)))?;

    let row_values = store.values(prov.label);
    let row_dates = store.dates(prov.label);
    if prov.end >= row_values.len() {
        return Err(SearchError::CorruptIndex(format!(
            "window {window_index} ends at offset {} but {symbol} has {} values",
            prov.end,
            row_values.len()
        )));
    }

    let clamped = prov.start.saturating_sub(future_length);
    let values = row_values[clamped..=prov.end].to_vec();
    let dates = row_dates[clamped..=prov.end].iter().map(|&ts| date_string(ts)).collect();

    let anchor_value = row_values[prov.start];
    let future_value = row_values[clamped];

    Ok(Match {
        window_index,
        distance,
        symbol: symbol.to_string(),
        start_date: date_string(row_dates[prov.start]),
        end_date: date_string(row_dates[prov.end]),
        anchor_value,
        future_value,
        value_delta: anchor_value - future_value,
        values,
        dates,
    })
}

/// Unix seconds to `%Y_%m_%d`; out-of-range stamps are kept as raw seconds
fn date_string(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| format_date(dt.date_naive()))
        .unwrap_or_else(|| ts.to_string())
}

// ============================================================
// FORECAST
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Gain,
    Loss,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Gain => write!(f, "gain"),
            Direction::Loss => write!(f, "loss"),
        }
    }
}

/// Majority direction over a match set and the fraction agreeing with it
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Forecast {
    pub direction: Direction,
    pub confidence: f64,
    pub gains: usize,
    pub losses: usize,
}

/// Vote over the matches' [`value_delta`](Match::value_delta)s.
///
/// `delta >= 0` counts as a gain. An even split reports `Loss` at 0.5.
/// Every match must carry at least `window_size` values; a shorter one was
/// resolved from an index of another window size.
pub fn forecast(matches: &[Match], window_size: usize) -> Result<Forecast> {
    if matches.is_empty() {
        return Err(SearchError::EmptyMatchSet);
    }
    if let Some(short) = matches.iter().find(|m| m.values.len() < window_size) {
        return Err(SearchError::DimensionMismatch {
            expected: window_size,
            got: short.values.len(),
        });
    }

    let gains = matches.iter().filter(|m| m.value_delta >= 0.0).count();
    let losses = matches.len() - gains;
    let gain_share = gains as f64 / matches.len() as f64;

    let (direction, confidence) = if gain_share > 0.5 {
        (Direction::Gain, gain_share)
    } else {
        (Direction::Loss, 1.0 - gain_share)
    };
    Ok(Forecast {
        direction,
        confidence,
        gains,
        losses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryFetcher, Series};

    const DAY: i64 = 86_400;
    // 2024-01-31 00:00:00 UTC
    const LATEST: i64 = 1_706_659_200;

    fn store_with(values: &[f64]) -> TimeSeriesStore {
        let dates = (0..values.len()).map(|i| LATEST - i as i64 * DAY).collect();
        let fetcher = MemoryFetcher::new().with_series("A", Series::new(values.to_vec(), dates));
        let mut store = TimeSeriesStore::create(&["A"], 1, 1).unwrap();
        store.fill(&fetcher).unwrap();
        store
    }

    fn with_delta(delta: f64) -> Match {
        Match {
            window_index: 0,
            distance: 0.0,
            symbol: "A".into(),
            start_date: String::new(),
            end_date: String::new(),
            anchor_value: 10.0 + delta,
            future_value: 10.0,
            value_delta: delta,
            values: vec![10.0, 10.0 + delta, 9.0],
            dates: Vec::new(),
        }
    }

    #[test]
    fn test_resolve_extends_into_future() {
        let store = store_with(&[10.0, 12.0, 11.0, 9.0, 10.0, 13.0]);
        let corpus = WindowCorpus::build(&store, 3, 3).unwrap();

        // window at offsets 2..=4 is [11, 9, 10]
        let m = resolve(&corpus, &store, 2, 0.25, 2).unwrap();
        assert_eq!(m.symbol, "A");
        assert_eq!(m.values, vec![10.0, 12.0, 11.0, 9.0, 10.0]);
        assert_eq!(m.anchor_value, 11.0);
        assert_eq!(m.future_value, 10.0);
        assert_eq!(m.value_delta, 1.0);
        assert_eq!(m.start_date, "2024_01_29");
        assert_eq!(m.end_date, "2024_01_27");
        assert_eq!(m.dates.first().map(String::as_str), Some("2024_01_31"));
        assert_eq!(m.distance, 0.25);
    }

    #[test]
    fn test_resolve_clamps_at_head() {
        let store = store_with(&[10.0, 12.0, 11.0, 9.0, 10.0, 13.0]);
        let corpus = WindowCorpus::build(&store, 3, 3).unwrap();

        let m = resolve(&corpus, &store, 1, 0.0, 10).unwrap();
        assert_eq!(m.values, vec![10.0, 12.0, 11.0, 9.0]);
        assert_eq!(m.future_value, 10.0);

        let m = resolve(&corpus, &store, 0, 0.0, 0).unwrap();
        assert_eq!(m.values, vec![10.0, 12.0, 11.0]);
        assert_eq!(m.value_delta, 0.0);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let store = store_with(&[1.0, 2.0, 3.0]);
        let corpus = WindowCorpus::build(&store, 3, 3).unwrap();
        assert!(matches!(
            resolve(&corpus, &store, 5, 0.0, 1),
            Err(SearchError::CorruptIndex(_))
        ));
    }

    #[test]
    fn test_forecast_majority() {
        let matches: Vec<Match> = [-1.0, 2.0, 3.0, -0.5, 1.0].into_iter().map(with_delta).collect();
        let f = forecast(&matches, 2).unwrap();
        assert_eq!(f.direction, Direction::Gain);
        assert!((f.confidence - 0.6).abs() < 1e-12);
        assert_eq!((f.gains, f.losses), (3, 2));
    }

    #[test]
    fn test_forecast_zero_delta_is_gain() {
        let f = forecast(&[with_delta(0.0)], 2).unwrap();
        assert_eq!(f.direction, Direction::Gain);
        assert_eq!(f.confidence, 1.0);
    }

    #[test]
    fn test_forecast_even_split_is_loss() {
        let f = forecast(&[with_delta(1.0), with_delta(-1.0)], 2).unwrap();
        assert_eq!(f.direction, Direction::Loss);
        assert_eq!(f.confidence, 0.5);
    }

    #[test]
    fn test_forecast_empty() {
        assert!(matches!(forecast(&[], 5), Err(SearchError::EmptyMatchSet)));
    }

    #[test]
    fn test_forecast_rejects_matches_shorter_than_window() {
        let mut hollow = with_delta(1.0);
        hollow.values.clear();
        assert!(matches!(
            forecast(&[with_delta(1.0), hollow], 2),
            Err(SearchError::DimensionMismatch { expected: 2, got: 0 })
        ));
        assert!(matches!(
            forecast(&[with_delta(-1.0)], 4),
            Err(SearchError::DimensionMismatch { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn test_forecast_votes_on_resolved_delta() {
        // values disagree with value_delta; the recorded delta wins
        let mut m = with_delta(-2.0);
        m.values = vec![10.0, 30.0, 9.0];
        assert_eq!(forecast(&[m], 2).unwrap().direction, Direction::Loss);
    }

    #[test]
    fn test_forecast_agrees_with_resolved_delta() {
        let store = store_with(&[10.0, 12.0, 11.0, 9.0, 10.0, 13.0]);
        let corpus = WindowCorpus::build(&store, 3, 3).unwrap();
        let m = resolve(&corpus, &store, 3, 0.0, 1).unwrap();
        // boundary 9 minus head 11
        assert_eq!(m.value_delta, -2.0);
        assert_eq!(forecast(&[m], 3).unwrap().direction, Direction::Loss);
    }
}
