//! Timeframe catalog and the bucket clock.
//!
//! Bucket math stays in integer epoch arithmetic: a candle's bucket start is
//! the tick's epoch second floored to a multiple of the timeframe width.
//! Timeframe widths are validated once, at registry construction - the bucket
//! clock itself is pure and total.

use crate::error::BarError;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Default catalog of supported bucket widths, MetaTrader-style labels.
pub const DEFAULT_TIMEFRAMES: [(&str, i64); 11] = [
    ("M1", 60),
    ("M5", 300),
    ("M15", 900),
    ("M30", 1800),
    ("H1", 3600),
    ("H2", 7200),
    ("H3", 10800),
    ("H4", 14400),
    ("D1", 86400),
    ("W1", 604800),
    ("MN1", 2592000),
];

/// A bucket granularity drawn from the [`TimeframeRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize, derive_more::Display)]
#[display("{label}")]
pub struct Timeframe {
    pub label: SmolStr,
    /// Bucket width in seconds, always > 0 for registry-issued values.
    pub seconds: i64,
}

/// Immutable catalog of supported timeframes.
///
/// Construction rejects non-positive widths and duplicate labels so the
/// bucket clock never has to re-check them.
#[derive(Debug, Clone)]
pub struct TimeframeRegistry {
    entries: Vec<Timeframe>,
}

impl TimeframeRegistry {
    /// Build a registry from custom entries, validating each one.
    pub fn new(entries: impl IntoIterator<Item = (SmolStr, i64)>) -> Result<Self, BarError> {
        let mut validated = Vec::new();
        for (label, seconds) in entries {
            if seconds <= 0 {
                return Err(BarError::InvalidTimeframe { label, seconds });
            }
            if validated.iter().any(|tf: &Timeframe| tf.label == label) {
                return Err(BarError::InvalidTimeframe { label, seconds });
            }
            validated.push(Timeframe { label, seconds });
        }
        Ok(Self { entries: validated })
    }

    /// Registry holding the [`DEFAULT_TIMEFRAMES`] catalog.
    pub fn with_defaults() -> Self {
        Self {
            entries: DEFAULT_TIMEFRAMES
                .iter()
                .map(|(label, seconds)| Timeframe {
                    label: SmolStr::new(label),
                    seconds: *seconds,
                })
                .collect(),
        }
    }

    /// Look a timeframe up by label, e.g. "M5".
    pub fn by_label(&self, label: &str) -> Result<&Timeframe, BarError> {
        self.entries
            .iter()
            .find(|tf| tf.label == label)
            .ok_or_else(|| BarError::UnknownTimeframe(SmolStr::new(label)))
    }

    /// Look a timeframe up by bucket width in seconds.
    pub fn by_seconds(&self, seconds: i64) -> Option<&Timeframe> {
        self.entries.iter().find(|tf| tf.seconds == seconds)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Timeframe> {
        self.entries.iter()
    }
}

impl Default for TimeframeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// The bucket clock: map a tick timestamp to its aligned bucket start.
///
/// Euclidean division floors toward negative infinity, so pre-epoch
/// timestamps still land on the correct bucket boundary.
#[inline]
pub fn bucket_start(time_millis: i64, timeframe_seconds: i64) -> i64 {
    time_millis.div_euclid(1000).div_euclid(timeframe_seconds) * timeframe_seconds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_start_alignment() {
        struct TestCase {
            time_millis: i64,
            seconds: i64,
            expected: i64,
        }

        let tests = vec![
            TestCase {
                // TC0: epoch start
                time_millis: 0,
                seconds: 60,
                expected: 0,
            },
            TestCase {
                // TC1: mid-bucket
                time_millis: 20_000,
                seconds: 60,
                expected: 0,
            },
            TestCase {
                // TC2: second bucket
                time_millis: 90_000,
                seconds: 60,
                expected: 60,
            },
            TestCase {
                // TC3: exact boundary
                time_millis: 60_000,
                seconds: 60,
                expected: 60,
            },
            TestCase {
                // TC4: hourly bucket
                time_millis: 1_700_003_456_789,
                seconds: 3600,
                expected: 1_700_002_800,
            },
            TestCase {
                // TC5: pre-epoch timestamp floors toward -inf, not zero
                time_millis: -500,
                seconds: 60,
                expected: -60,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = bucket_start(test.time_millis, test.seconds);
            assert_eq!(actual, test.expected, "TC{index} failed");
            assert_eq!(actual % test.seconds, 0, "TC{index} not aligned");
        }
    }

    #[test]
    fn test_registry_defaults() {
        let registry = TimeframeRegistry::with_defaults();
        assert_eq!(registry.by_label("M1").unwrap().seconds, 60);
        assert_eq!(registry.by_label("D1").unwrap().seconds, 86400);
        assert_eq!(registry.by_seconds(300).unwrap().label, "M5");
        assert!(registry.by_label("M7").is_err());
    }

    #[test]
    fn test_registry_rejects_non_positive_width() {
        let result = TimeframeRegistry::new([(SmolStr::new("BAD"), 0)]);
        assert!(matches!(
            result,
            Err(BarError::InvalidTimeframe { seconds: 0, .. })
        ));

        let result = TimeframeRegistry::new([(SmolStr::new("BAD"), -60)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_rejects_duplicate_label() {
        let result = TimeframeRegistry::new([(SmolStr::new("M1"), 60), (SmolStr::new("M1"), 120)]);
        assert!(result.is_err());
    }
}
