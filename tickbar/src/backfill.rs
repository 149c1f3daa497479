//! Backfill reconciliation against an authoritative historical-bar source.
//!
//! Runs when a series is created or the instrument/timeframe selection
//! changes. The authoritative source fully supersedes local state for closed
//! bars; on failure, timeout, or an empty result the reconciler falls back
//! to the persisted snapshot, and failing that the series stays empty and
//! fills organically from ticks.

use crate::{
    error::BarError,
    metrics::Metrics,
    persistence::{SnapshotStore, restore_snapshot},
    series::{Candle, CandleSeries},
    timeframe::Timeframe,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default bound on the historical-fetch call.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Authoritative source of closed/latest historical bars.
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Fetch up to `limit` bars, ordered oldest-first. May fail or time out;
    /// both are treated as [`BarError::BackfillUnavailable`].
    async fn fetch(
        &self,
        instrument: &str,
        timeframe: &Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, BarError>;
}

/// How a reconciliation resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// Authoritative bars replaced local state.
    Authoritative(usize),
    /// Fetch unavailable; persisted snapshot restored instead.
    Restored(usize),
    /// Neither source yielded bars; series fills organically from ticks.
    Empty,
}

/// Reconcile one series against the historical source, falling back to the
/// snapshot store. The series lock is only held for the swap itself, never
/// across I/O; queuing of concurrent ticks is the caller's concern.
pub async fn reconcile(
    source: &dyn HistoricalSource,
    store: &dyn SnapshotStore,
    series: &RwLock<CandleSeries>,
    metrics: &Metrics,
    fetch_timeout: Duration,
) -> BackfillOutcome {
    let (instrument, timeframe, capacity) = {
        let guard = series.read();
        (
            guard.instrument().clone(),
            guard.timeframe().clone(),
            guard.capacity(),
        )
    };

    match tokio::time::timeout(
        fetch_timeout,
        source.fetch(&instrument, &timeframe, capacity),
    )
    .await
    {
        Ok(Ok(bars)) if !bars.is_empty() => {
            let count = bars.len();
            match series.write().replace_all(bars) {
                Ok(()) => {
                    info!(
                        %instrument,
                        timeframe = %timeframe,
                        bars = count,
                        "backfilled from authoritative source"
                    );
                    return BackfillOutcome::Authoritative(count);
                }
                Err(error) => {
                    let error = BarError::BackfillUnavailable(error.to_string());
                    metrics.record(&error);
                    warn!(
                        %instrument,
                        timeframe = %timeframe,
                        %error,
                        "authoritative bars rejected, falling back to snapshot"
                    );
                }
            }
        }
        Ok(Ok(_)) => {
            debug!(%instrument, timeframe = %timeframe, "historical source returned no bars");
        }
        Ok(Err(error)) => {
            metrics.record(&error);
            warn!(%instrument, timeframe = %timeframe, %error, "historical fetch failed");
        }
        Err(_) => {
            let error = BarError::BackfillUnavailable(format!(
                "fetch timed out after {fetch_timeout:?}"
            ));
            metrics.record(&error);
            warn!(%instrument, timeframe = %timeframe, %error, "historical fetch timed out");
        }
    }

    match restore_snapshot(store, &instrument, &timeframe, capacity).await {
        Ok(Some(candles)) => {
            let count = candles.len();
            match series.write().replace_all(candles) {
                Ok(()) => {
                    info!(
                        %instrument,
                        timeframe = %timeframe,
                        bars = count,
                        "restored series from persisted snapshot"
                    );
                    return BackfillOutcome::Restored(count);
                }
                Err(error) => {
                    let error = BarError::CorruptSnapshot(error.to_string());
                    metrics.record(&error);
                    warn!(%instrument, timeframe = %timeframe, %error, "restored snapshot rejected");
                }
            }
        }
        Ok(None) => {
            debug!(%instrument, timeframe = %timeframe, "no persisted snapshot");
        }
        Err(error) => {
            metrics.record(&error);
            warn!(%instrument, timeframe = %timeframe, %error, "snapshot restore failed");
        }
    }

    BackfillOutcome::Empty
}

/// One bar in the REST history payload.
#[derive(Debug, Deserialize)]
struct HistoryBar {
    /// Bucket start in epoch seconds.
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

/// [`HistoricalSource`] backed by a REST endpoint serving
/// `GET {base}/bars?instrument=..&timeframe=..&limit=..` as a JSON array.
#[derive(Debug, Clone)]
pub struct RestHistoricalSource {
    client: reqwest::Client,
    base_url: String,
}

impl RestHistoricalSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl HistoricalSource for RestHistoricalSource {
    async fn fetch(
        &self,
        instrument: &str,
        timeframe: &Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, BarError> {
        let url = format!(
            "{}/bars?instrument={}&timeframe={}&limit={}",
            self.base_url.trim_end_matches('/'),
            instrument,
            timeframe.label,
            limit
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| BarError::BackfillUnavailable(format!("request failed: {error}")))?;

        if let Err(status) = response.error_for_status_ref() {
            return Err(BarError::BackfillUnavailable(format!(
                "history endpoint returned {status}"
            )));
        }

        let bars: Vec<HistoryBar> = response
            .json()
            .await
            .map_err(|error| BarError::BackfillUnavailable(format!("payload decode: {error}")))?;

        Ok(bars
            .into_iter()
            .map(|bar| Candle {
                bucket_start: bar.time,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
            })
            .collect())
    }
}
