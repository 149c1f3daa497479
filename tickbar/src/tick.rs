use crate::error::BarError;
use derive_more::Constructor;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// A single bid/ask price observation from the upstream feed.
///
/// The aggregation price is the mid-point of the quote. A `Tick` is only
/// usable once [`validate`](Tick::validate) has passed; the engine rejects
/// invalid ticks before they reach the aggregator.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Tick {
    pub instrument: SmolStr,
    pub bid: f64,
    pub ask: f64,
    /// Exchange timestamp in epoch milliseconds.
    pub time_millis: i64,
}

impl Tick {
    /// Mid price derived from the quote.
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Reject quotes with non-finite or non-positive legs.
    pub fn validate(&self) -> Result<(), BarError> {
        if !self.bid.is_finite() || !self.ask.is_finite() || self.bid <= 0.0 || self.ask <= 0.0 {
            return Err(BarError::InvalidTick {
                instrument: self.instrument.clone(),
                bid: self.bid,
                ask: self.ask,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(bid: f64, ask: f64) -> Tick {
        Tick::new(SmolStr::new("EURUSD"), bid, ask, 1_700_000_000_000)
    }

    #[test]
    fn test_mid_price() {
        assert_eq!(tick(10.0, 10.2).mid(), 10.1);
    }

    #[test]
    fn test_validate() {
        struct TestCase {
            input: Tick,
            expected_ok: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: normal quote
                input: tick(1.0921, 1.0923),
                expected_ok: true,
            },
            TestCase {
                // TC1: NaN bid
                input: tick(f64::NAN, 1.1),
                expected_ok: false,
            },
            TestCase {
                // TC2: infinite ask
                input: tick(1.1, f64::INFINITY),
                expected_ok: false,
            },
            TestCase {
                // TC3: zero bid
                input: tick(0.0, 1.1),
                expected_ok: false,
            },
            TestCase {
                // TC4: negative ask
                input: tick(1.1, -0.5),
                expected_ok: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(
                test.input.validate().is_ok(),
                test.expected_ok,
                "TC{index} failed"
            );
        }
    }
}
