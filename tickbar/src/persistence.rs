//! Write-behind persistence of candle series snapshots.
//!
//! Saves are throttled per series (default one per 5s) except that the first
//! tick of a new bucket always forces an immediate save, so a crash loses at
//! most one in-progress candle's updates. Restores validate every invariant
//! before accepting a snapshot; a corrupt snapshot is discarded, never loaded.

use crate::{
    error::BarError,
    series::{Candle, SeriesSnapshot, validate_candles},
    timeframe::Timeframe,
};
use async_trait::async_trait;
use chrono::Utc;
use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default minimum interval between throttled saves of one series.
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Durable key-value store consumed by the persistence gateway.
///
/// Any backend satisfies the contract as long as it supports per-key
/// put/get; keys are derived from (instrument, timeframe).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BarError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarError>;
}

/// Store key for one (instrument, timeframe) series.
///
/// Instrument symbols may carry separators ("EUR/USD"); anything outside
/// `[A-Za-z0-9_-]` is folded to `-` so keys stay filesystem-safe.
pub fn snapshot_key(instrument: &str, timeframe: &Timeframe) -> String {
    let sanitized: String = instrument
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}_{}", sanitized, timeframe.label)
}

/// Durable serialization of one series, tagged with its identity and save time.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PersistedSnapshot {
    pub instrument: SmolStr,
    pub timeframe_label: SmolStr,
    pub timeframe_seconds: i64,
    pub saved_at_millis: i64,
    pub candles: Vec<Candle>,
}

impl From<SeriesSnapshot> for PersistedSnapshot {
    fn from(snapshot: SeriesSnapshot) -> Self {
        Self {
            instrument: snapshot.instrument,
            timeframe_label: snapshot.timeframe.label,
            timeframe_seconds: snapshot.timeframe.seconds,
            saved_at_millis: Utc::now().timestamp_millis(),
            candles: snapshot.candles,
        }
    }
}

/// Per-series save throttle.
///
/// `due` mutates the throttle state: a `true` return means the caller is
/// expected to perform the save.
#[derive(Debug)]
pub struct SaveThrottle {
    min_interval: Duration,
    last_save: Option<Instant>,
}

impl SaveThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_save: None,
        }
    }

    /// Whether a save should run now. Forced saves (new bucket) always pass;
    /// otherwise at most one save per `min_interval` is allowed.
    pub fn due(&mut self, force: bool) -> bool {
        let now = Instant::now();
        let due = force
            || match self.last_save {
                None => true,
                Some(last) => now.duration_since(last) >= self.min_interval,
            };
        if due {
            self.last_save = Some(now);
        }
        due
    }
}

/// Serialize and persist one snapshot. Runs off the tick path: the series
/// writer spawns this and carries on aggregating.
pub async fn save_snapshot(
    store: Arc<dyn SnapshotStore>,
    snapshot: SeriesSnapshot,
) -> Result<(), BarError> {
    let key = snapshot_key(&snapshot.instrument, &snapshot.timeframe);
    let persisted = PersistedSnapshot::from(snapshot);
    let bytes = serde_json::to_vec(&persisted)
        .map_err(|error| BarError::Store(format!("snapshot encode failed: {error}")))?;
    store.put(&key, bytes).await?;
    debug!(%key, candles = persisted.candles.len(), "snapshot saved");
    Ok(())
}

/// Load and validate the most recent snapshot for a (instrument, timeframe).
///
/// Returns `Ok(None)` when no snapshot exists. A snapshot that fails
/// decoding, identity, ordering, alignment, or OHLC checks is rejected with
/// [`BarError::CorruptSnapshot`].
pub async fn restore_snapshot(
    store: &dyn SnapshotStore,
    instrument: &str,
    timeframe: &Timeframe,
    capacity: usize,
) -> Result<Option<Vec<Candle>>, BarError> {
    let key = snapshot_key(instrument, timeframe);
    let Some(bytes) = store.get(&key).await? else {
        return Ok(None);
    };

    let persisted: PersistedSnapshot = serde_json::from_slice(&bytes)
        .map_err(|error| BarError::CorruptSnapshot(format!("decode failed: {error}")))?;

    if persisted.instrument != instrument || persisted.timeframe_seconds != timeframe.seconds {
        return Err(BarError::CorruptSnapshot(format!(
            "identity mismatch: stored {}/{}s, expected {}/{}s",
            persisted.instrument, persisted.timeframe_seconds, instrument, timeframe.seconds
        )));
    }

    validate_candles(&persisted.candles, timeframe.seconds)
        .map_err(|error| BarError::CorruptSnapshot(error.to_string()))?;

    let mut candles = persisted.candles;
    if candles.len() > capacity {
        candles.drain(..candles.len() - capacity);
    }
    Ok(Some(candles))
}

/// In-memory [`SnapshotStore`], used in tests and as a null durable layer.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: RwLock<FnvHashMap<String, Vec<u8>>>,
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BarError> {
        self.entries.write().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarError> {
        Ok(self.entries.read().get(key).cloned())
    }
}

/// File-backed [`SnapshotStore`]: one JSON file per key under a data directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BarError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|error| BarError::Store(error.to_string()))?;

        // Write-then-rename so readers never observe a half-written snapshot
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|error| BarError::Store(error.to_string()))?;
        tokio::fs::rename(&tmp, self.path(key))
            .await
            .map_err(|error| BarError::Store(error.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarError> {
        match tokio::fs::read(self.path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                warn!(key, %error, "snapshot read failed");
                Err(BarError::Store(error.to_string()))
            }
        }
    }
}
