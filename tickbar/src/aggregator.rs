//! The tick -> candle state machine.
//!
//! Per series the aggregator is a two-state machine: Empty (no candle yet)
//! and Building (an open candle exists). Ticks either seed a new bucket,
//! fold into the open bucket, or are rejected as late/invalid. Gaps between
//! buckets are left as real gaps - no synthetic fill candles - mirroring the
//! absence of trades in that interval.

use crate::{
    error::BarError,
    series::{Candle, CandleSeries},
    tick::Tick,
    timeframe::{Timeframe, bucket_start},
};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Change notification emitted for every successfully applied tick.
///
/// `is_new_bucket` is true when the tick opened a fresh candle (and thereby
/// closed the previous one); the persistence gateway uses it to force an
/// immediate save.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BarUpdate {
    pub instrument: SmolStr,
    pub timeframe: Timeframe,
    pub candle: Candle,
    pub is_new_bucket: bool,
}

/// Apply one tick to a series, returning the resulting update.
///
/// Rejections ([`BarError::InvalidTick`], [`BarError::LateTick`]) leave the
/// series untouched; closed candles are never reopened or mutated.
pub fn apply(series: &mut CandleSeries, tick: &Tick) -> Result<BarUpdate, BarError> {
    tick.validate()?;

    let price = tick.mid();
    let bucket = bucket_start(tick.time_millis, series.timeframe().seconds);

    let (candle, is_new_bucket) = match series.latest_open_mut() {
        Some(open) if bucket == open.bucket_start => {
            open.apply_price(price);
            (*open, false)
        }
        Some(open) if bucket < open.bucket_start => {
            return Err(BarError::LateTick {
                instrument: tick.instrument.clone(),
                tick_bucket: bucket,
                open_bucket: open.bucket_start,
            });
        }
        // Empty series, or a later bucket: appending closes the previous
        // open candle and starts a fresh one.
        _ => {
            let seed = Candle::seed(bucket, price);
            series.append(seed)?;
            (seed, true)
        }
    };

    Ok(BarUpdate {
        instrument: series.instrument().clone(),
        timeframe: series.timeframe().clone(),
        candle,
        is_new_bucket,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::DEFAULT_SERIES_CAPACITY;

    fn m1_series() -> CandleSeries {
        CandleSeries::new(
            SmolStr::new("EURUSD"),
            Timeframe {
                label: SmolStr::new("M1"),
                seconds: 60,
            },
            DEFAULT_SERIES_CAPACITY,
        )
    }

    fn tick_at(seconds: i64, bid: f64, ask: f64) -> Tick {
        Tick::new(SmolStr::new("EURUSD"), bid, ask, seconds * 1000)
    }

    #[test]
    fn test_two_candle_scenario() {
        // Ticks at t=0s, t=20s, t=90s on a 60s timeframe produce two candles
        let mut series = m1_series();

        let update = apply(&mut series, &tick_at(0, 10.0, 10.2)).unwrap();
        assert!(update.is_new_bucket);
        assert_eq!(update.candle, Candle::seed(0, 10.1));

        let update = apply(&mut series, &tick_at(20, 10.5, 10.7)).unwrap();
        assert!(!update.is_new_bucket);
        assert_eq!(
            update.candle,
            Candle {
                bucket_start: 0,
                open: 10.1,
                high: 10.6,
                low: 10.1,
                close: 10.6,
            }
        );

        let update = apply(&mut series, &tick_at(90, 9.0, 9.2)).unwrap();
        assert!(update.is_new_bucket);
        assert_eq!(update.candle, Candle::seed(60, 9.1));

        let snapshot = series.snapshot();
        assert_eq!(snapshot.candles.len(), 2);
        assert_eq!(
            snapshot.candles[0],
            Candle {
                bucket_start: 0,
                open: 10.1,
                high: 10.6,
                low: 10.1,
                close: 10.6,
            }
        );
        assert_eq!(snapshot.candles[1], Candle::seed(60, 9.1));
    }

    #[test]
    fn test_late_tick_dropped_series_unchanged() {
        let mut series = m1_series();
        apply(&mut series, &tick_at(0, 10.0, 10.2)).unwrap();
        apply(&mut series, &tick_at(20, 10.5, 10.7)).unwrap();
        apply(&mut series, &tick_at(90, 9.0, 9.2)).unwrap();
        let before = series.snapshot();

        // Late tick for the already-closed first bucket
        let result = apply(&mut series, &tick_at(10, 50.0, 50.2));
        assert!(matches!(
            result,
            Err(BarError::LateTick {
                tick_bucket: 0,
                open_bucket: 60,
                ..
            })
        ));
        assert_eq!(series.snapshot(), before);
    }

    #[test]
    fn test_invalid_tick_no_state_change() {
        let mut series = m1_series();
        apply(&mut series, &tick_at(0, 10.0, 10.2)).unwrap();
        let before = series.snapshot();

        let result = apply(&mut series, &tick_at(30, f64::NAN, 10.2));
        assert!(matches!(result, Err(BarError::InvalidTick { .. })));
        assert_eq!(series.snapshot(), before);
    }

    #[test]
    fn test_gap_leaves_no_synthetic_candles() {
        let mut series = m1_series();
        apply(&mut series, &tick_at(0, 10.0, 10.2)).unwrap();
        // Next tick three buckets later - nothing traded in between
        apply(&mut series, &tick_at(185, 11.0, 11.2)).unwrap();

        let snapshot = series.snapshot();
        assert_eq!(snapshot.candles.len(), 2);
        assert_eq!(snapshot.candles[0].bucket_start, 0);
        assert_eq!(snapshot.candles[1].bucket_start, 180);
    }

    #[test]
    fn test_monotonic_alignment_property() {
        // Pseudo-random walk of valid ticks, timestamps only move forward
        let mut series = m1_series();
        let mut ts = 0i64;
        let mut price = 100.0f64;
        for i in 0..5_000u64 {
            ts += (i % 17_000) as i64; // irregular forward steps in millis
            price += ((i % 7) as f64 - 3.0) * 0.25;
            let bid = price.max(0.01);
            let tick = Tick::new(SmolStr::new("EURUSD"), bid, bid + 0.02, ts);
            apply(&mut series, &tick).unwrap();
        }

        let snapshot = series.snapshot();
        assert!(snapshot.candles.len() <= DEFAULT_SERIES_CAPACITY);
        for pair in snapshot.candles.windows(2) {
            assert!(pair[0].bucket_start < pair[1].bucket_start);
        }
        for candle in &snapshot.candles {
            assert_eq!(candle.bucket_start % 60, 0);
            assert!(candle.is_valid());
        }
    }

    #[test]
    fn test_bounded_size_property() {
        let mut series = CandleSeries::new(
            SmolStr::new("EURUSD"),
            Timeframe {
                label: SmolStr::new("M1"),
                seconds: 60,
            },
            5,
        );
        for i in 0..50 {
            apply(&mut series, &tick_at(i * 60, 10.0, 10.2)).unwrap();
            assert!(series.len() <= 5);
        }
        assert_eq!(series.len(), 5);
    }
}
