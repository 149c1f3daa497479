//! Bounded, ordered per-(instrument, timeframe) candle store.
//!
//! A [`CandleSeries`] owns the mutation invariants: candles are strictly
//! increasing by bucket start, bucket-aligned for the series timeframe, and
//! capped at a fixed capacity with strict FIFO eviction. Exactly one candle
//! (the last one) is open for mutation; everything before it is history.

use crate::{error::BarError, timeframe::Timeframe};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::VecDeque;
use tracing::error;

/// Default maximum number of candles retained per series.
pub const DEFAULT_SERIES_CAPACITY: usize = 500;

/// A single OHLC bar covering one aligned time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    /// Bucket start in epoch seconds, a multiple of the timeframe width.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    /// Seed a fresh candle from the first price of a bucket.
    pub fn seed(bucket_start: i64, price: f64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    /// Fold another in-bucket price into the candle. Open never changes.
    pub fn apply_price(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    /// OHLC relation check: `low <= open,close <= high`, all finite.
    pub fn is_valid(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
    }
}

/// Validate a candle sequence for a given timeframe width: strictly
/// increasing, bucket-aligned, OHLC-valid.
pub fn validate_candles(candles: &[Candle], timeframe_seconds: i64) -> Result<(), BarError> {
    let mut prev: Option<i64> = None;
    for candle in candles {
        if candle.bucket_start % timeframe_seconds != 0 {
            return Err(BarError::InvalidSeries(format!(
                "bucket {} not aligned to {}s",
                candle.bucket_start, timeframe_seconds
            )));
        }
        if !candle.is_valid() {
            return Err(BarError::InvalidSeries(format!(
                "candle at {} violates OHLC relation",
                candle.bucket_start
            )));
        }
        if let Some(prev) = prev
            && candle.bucket_start <= prev
        {
            return Err(BarError::InvalidSeries(format!(
                "bucket {} does not follow {}",
                candle.bucket_start, prev
            )));
        }
        prev = Some(candle.bucket_start);
    }
    Ok(())
}

/// Immutable point-in-time copy of a series, safe to hand to any consumer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SeriesSnapshot {
    pub instrument: SmolStr,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
}

impl SeriesSnapshot {
    /// Last candle in the snapshot, the open one at capture time.
    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// The bounded, ordered candle store for one (instrument, timeframe) pair.
#[derive(Debug)]
pub struct CandleSeries {
    instrument: SmolStr,
    timeframe: Timeframe,
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl CandleSeries {
    pub fn new(instrument: SmolStr, timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            instrument,
            timeframe,
            candles: VecDeque::with_capacity(capacity.min(DEFAULT_SERIES_CAPACITY)),
            capacity,
        }
    }

    pub fn instrument(&self) -> &SmolStr {
        &self.instrument
    }

    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// The current open (mutable) candle, or `None` for an empty series.
    pub fn latest_open(&self) -> Option<&Candle> {
        self.candles.back()
    }

    /// Mutable access to the open candle. Only the open candle is ever
    /// exposed for mutation; closed candles stay immutable.
    pub fn latest_open_mut(&mut self) -> Option<&mut Candle> {
        self.candles.back_mut()
    }

    /// Append a new open candle, closing the previous one and evicting the
    /// oldest entry once past capacity. Eviction is strict FIFO by time.
    pub fn append(&mut self, candle: Candle) -> Result<(), BarError> {
        self.candles.push_back(candle);
        if self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
        self.check_capacity()
    }

    /// Atomically swap in an authoritative candle sequence.
    ///
    /// Used exclusively by backfill reconciliation. The input must already
    /// satisfy the ordering/alignment invariants; no merge is performed.
    /// Sequences longer than the capacity keep only the most recent candles.
    pub fn replace_all(&mut self, candles: Vec<Candle>) -> Result<(), BarError> {
        validate_candles(&candles, self.timeframe.seconds)?;
        let skip = candles.len().saturating_sub(self.capacity);
        self.candles = candles.into_iter().skip(skip).collect();
        Ok(())
    }

    /// Immutable point-in-time copy. Never shares mutable state with callers.
    pub fn snapshot(&self) -> SeriesSnapshot {
        SeriesSnapshot {
            instrument: self.instrument.clone(),
            timeframe: self.timeframe.clone(),
            candles: self.candles.iter().copied().collect(),
        }
    }

    /// Internal bug guard: a series observed beyond capacity is reset to
    /// empty rather than allowed to grow without bound.
    fn check_capacity(&mut self) -> Result<(), BarError> {
        if self.candles.len() > self.capacity {
            let len = self.candles.len();
            error!(
                instrument = %self.instrument,
                timeframe = %self.timeframe,
                len,
                capacity = self.capacity,
                "series capacity invariant violated, resetting series"
            );
            self.candles.clear();
            return Err(BarError::CapacityInvariant {
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(capacity: usize) -> CandleSeries {
        CandleSeries::new(
            SmolStr::new("EURUSD"),
            Timeframe {
                label: SmolStr::new("M1"),
                seconds: 60,
            },
            capacity,
        )
    }

    #[test]
    fn test_append_bounded_fifo_eviction() {
        let mut s = series(3);
        for i in 0..5 {
            s.append(Candle::seed(i * 60, 100.0 + i as f64)).unwrap();
        }

        assert_eq!(s.len(), 3);
        let snapshot = s.snapshot();
        // Oldest two evicted, order preserved
        assert_eq!(
            snapshot
                .candles
                .iter()
                .map(|c| c.bucket_start)
                .collect::<Vec<_>>(),
            vec![120, 180, 240]
        );
        assert_eq!(s.latest_open().unwrap().bucket_start, 240);
    }

    #[test]
    fn test_replace_all_atomic_swap() {
        let mut s = series(10);
        for i in 0..5 {
            s.append(Candle::seed(i * 60, 50.0)).unwrap();
        }

        let authoritative = vec![
            Candle::seed(600, 10.0),
            Candle::seed(660, 11.0),
            Candle::seed(720, 12.0),
        ];
        s.replace_all(authoritative.clone()).unwrap();

        assert_eq!(s.snapshot().candles, authoritative);
        assert_eq!(s.latest_open().unwrap().bucket_start, 720);
    }

    #[test]
    fn test_replace_all_rejects_unordered() {
        let mut s = series(10);
        let unordered = vec![Candle::seed(120, 10.0), Candle::seed(60, 11.0)];
        assert!(matches!(
            s.replace_all(unordered),
            Err(BarError::InvalidSeries(_))
        ));
        // Rejected call leaves the series untouched
        assert!(s.is_empty());
    }

    #[test]
    fn test_replace_all_rejects_misaligned() {
        let mut s = series(10);
        let misaligned = vec![Candle::seed(61, 10.0)];
        assert!(s.replace_all(misaligned).is_err());
    }

    #[test]
    fn test_replace_all_rejects_invalid_ohlc() {
        let mut s = series(10);
        let bad = vec![Candle {
            bucket_start: 60,
            open: 10.0,
            high: 9.0, // high below open
            low: 8.0,
            close: 8.5,
        }];
        assert!(s.replace_all(bad).is_err());
    }

    #[test]
    fn test_replace_all_trims_to_capacity() {
        let mut s = series(2);
        let long = (0..4).map(|i| Candle::seed(i * 60, 10.0)).collect();
        s.replace_all(long).unwrap();

        assert_eq!(s.len(), 2);
        // Most recent candles retained
        assert_eq!(s.snapshot().candles[0].bucket_start, 120);
        assert_eq!(s.latest_open().unwrap().bucket_start, 180);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut s = series(10);
        s.append(Candle::seed(0, 10.0)).unwrap();
        let snapshot = s.snapshot();

        if let Some(open) = s.latest_open_mut() {
            open.apply_price(99.0);
        }

        // Earlier snapshot is unaffected by later mutation
        assert_eq!(snapshot.candles[0].close, 10.0);
        assert_eq!(s.latest_open().unwrap().close, 99.0);
    }

    #[test]
    fn test_candle_validity() {
        let mut candle = Candle::seed(60, 10.0);
        assert!(candle.is_valid());

        candle.apply_price(12.0);
        candle.apply_price(9.0);
        assert_eq!(candle.open, 10.0);
        assert_eq!(candle.high, 12.0);
        assert_eq!(candle.low, 9.0);
        assert_eq!(candle.close, 9.0);
        assert!(candle.is_valid());

        let broken = Candle {
            bucket_start: 0,
            open: 1.0,
            high: 2.0,
            low: 1.5, // low above open
            close: 1.8,
        };
        assert!(!broken.is_valid());
    }
}
