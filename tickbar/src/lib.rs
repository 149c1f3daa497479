//! Tickbar: streaming candle aggregation & cache.
//!
//! Turns an unordered, possibly-interrupted stream of bid/ask ticks into
//! bounded, multi-timeframe OHLC candle series that can be queried, streamed
//! to subscribers, persisted across restarts, and reconciled against an
//! authoritative historical-bar source - without producing duplicate,
//! out-of-order, or malformed bars.
//!
//! Data flow: tick feed -> [`engine::Engine`] -> [`series::CandleSeries`]
//! (in memory) -> [`persistence`] (durable) and subscribers (via
//! [`aggregator::BarUpdate`] notifications). [`backfill`] sits between the
//! series and the authoritative source, invoked on series (re)initialisation.

pub mod aggregator;
pub mod backfill;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod series;
pub mod tick;
pub mod timeframe;

// Re-export the main public surface for convenience
pub use aggregator::BarUpdate;
pub use backfill::{BackfillOutcome, HistoricalSource, RestHistoricalSource};
pub use engine::{Engine, EngineConfig, SeriesSubscription};
pub use error::BarError;
pub use metrics::MetricsSnapshot;
pub use persistence::{FileSnapshotStore, MemorySnapshotStore, PersistedSnapshot, SnapshotStore};
pub use series::{Candle, CandleSeries, SeriesSnapshot};
pub use tick::Tick;
pub use timeframe::{Timeframe, TimeframeRegistry, bucket_start};
