use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

/// All errors generated in `tickbar`.
///
/// Nothing here is fatal to the process: every failure degrades to a
/// temporarily-incomplete series while ingestion of other instruments and
/// timeframes continues.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum BarError {
    #[error("invalid tick for {instrument}: bid {bid} / ask {ask} is not a usable quote")]
    InvalidTick {
        instrument: SmolStr,
        bid: f64,
        ask: f64,
    },

    #[error(
        "late tick for {instrument}: bucket {tick_bucket} behind open bucket {open_bucket}, dropped"
    )]
    LateTick {
        instrument: SmolStr,
        tick_bucket: i64,
        open_bucket: i64,
    },

    #[error("historical bars unavailable: {0}")]
    BackfillUnavailable(String),

    #[error("persisted snapshot rejected: {0}")]
    CorruptSnapshot(String),

    #[error("series capacity invariant violated: len {len} exceeds capacity {capacity}")]
    CapacityInvariant { len: usize, capacity: usize },

    #[error("candle sequence rejected: {0}")]
    InvalidSeries(String),

    #[error("unknown timeframe: {0}")]
    UnknownTimeframe(SmolStr),

    #[error("invalid timeframe {label}: {seconds}s is not a positive bucket width")]
    InvalidTimeframe { label: SmolStr, seconds: i64 },

    #[error("snapshot store error: {0}")]
    Store(String),
}

impl BarError {
    /// Determine if an error is a per-tick data rejection (dropped and counted)
    /// rather than a subsystem failure.
    pub fn is_tick_rejection(&self) -> bool {
        matches!(self, BarError::InvalidTick { .. } | BarError::LateTick { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_error_is_tick_rejection() {
        struct TestCase {
            input: BarError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: invalid tick is a rejection
                input: BarError::InvalidTick {
                    instrument: SmolStr::new("EURUSD"),
                    bid: f64::NAN,
                    ask: 1.1,
                },
                expected: true,
            },
            TestCase {
                // TC1: late tick is a rejection
                input: BarError::LateTick {
                    instrument: SmolStr::new("EURUSD"),
                    tick_bucket: 0,
                    open_bucket: 60,
                },
                expected: true,
            },
            TestCase {
                // TC2: backfill failure is not a tick rejection
                input: BarError::BackfillUnavailable("timeout".to_string()),
                expected: false,
            },
            TestCase {
                // TC3: corrupt snapshot is not a tick rejection
                input: BarError::CorruptSnapshot("unordered".to_string()),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(
                test.input.is_tick_rejection(),
                test.expected,
                "TC{index} failed"
            );
        }
    }
}
