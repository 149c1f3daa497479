//! The aggregation engine: tick demultiplexing, per-series writer tasks, and
//! the consumer query/subscribe API.
//!
//! One engine consumes one interleaved tick stream. Each actively-subscribed
//! (instrument, timeframe) pair runs as a dedicated writer task that owns all
//! mutation of its series - the single-writer discipline. The series data
//! sits behind a `parking_lot::RwLock` held only for the duration of a single
//! append/replace, never across I/O; readers take snapshots and never block
//! the writer across a network call.
//!
//! On startup a writer task reconciles against the authoritative historical
//! source while buffering inbound ticks (bounded, oldest-drop), then replays
//! them in arrival order. Unsubscribing the last consumer tears the task down,
//! cancelling any in-flight backfill and dropping its queue.

use crate::{
    aggregator::{self, BarUpdate},
    backfill::{self, DEFAULT_FETCH_TIMEOUT, HistoricalSource},
    error::BarError,
    metrics::{Metrics, MetricsSnapshot},
    persistence::{self, DEFAULT_SAVE_INTERVAL, SaveThrottle, SnapshotStore},
    series::{CandleSeries, DEFAULT_SERIES_CAPACITY, SeriesSnapshot},
    tick::Tick,
    timeframe::{Timeframe, TimeframeRegistry},
};
use fnv::FnvHashMap;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use std::{
    collections::{VecDeque, hash_map::Entry},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// Default bound on ticks buffered per series while reconciliation is in
/// flight; overflow drops the oldest queued tick.
pub const DEFAULT_TICK_QUEUE_CAPACITY: usize = 1000;

/// Default capacity of each series' update broadcast channel.
pub const DEFAULT_NOTIFY_BUFFER: usize = 256;

/// Engine tuning knobs; the defaults match the documented contract.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub series_capacity: usize,
    pub save_interval: Duration,
    pub fetch_timeout: Duration,
    pub tick_queue_capacity: usize,
    pub notify_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            series_capacity: DEFAULT_SERIES_CAPACITY,
            save_interval: DEFAULT_SAVE_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            tick_queue_capacity: DEFAULT_TICK_QUEUE_CAPACITY,
            notify_buffer: DEFAULT_NOTIFY_BUFFER,
        }
    }
}

type SeriesKey = (SmolStr, Timeframe);

struct SeriesHandle {
    series: Arc<RwLock<CandleSeries>>,
    updates: broadcast::Sender<BarUpdate>,
    ticks: mpsc::Sender<Tick>,
    task: tokio::task::JoinHandle<()>,
    subscribers: usize,
}

/// A live subscription to one (instrument, timeframe) series.
///
/// `updates` is a lazy, restartable notification stream; `snapshot` reads
/// the current series state without blocking the writer.
pub struct SeriesSubscription {
    pub instrument: SmolStr,
    pub timeframe: Timeframe,
    pub updates: BroadcastStream<BarUpdate>,
    series: Arc<RwLock<CandleSeries>>,
}

impl SeriesSubscription {
    pub fn snapshot(&self) -> SeriesSnapshot {
        self.series.read().snapshot()
    }
}

/// Streaming candle aggregation engine.
pub struct Engine {
    config: EngineConfig,
    registry: TimeframeRegistry,
    source: Arc<dyn HistoricalSource>,
    store: Arc<dyn SnapshotStore>,
    metrics: Arc<Metrics>,
    series: Mutex<FnvHashMap<SeriesKey, SeriesHandle>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: TimeframeRegistry,
        source: Arc<dyn HistoricalSource>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            registry,
            source,
            store,
            metrics: Arc::new(Metrics::default()),
            series: Mutex::new(FnvHashMap::default()),
        }
    }

    pub fn registry(&self) -> &TimeframeRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Subscribe to a series, creating its writer task on first interest.
    /// Series creation triggers backfill reconciliation.
    pub fn subscribe(
        &self,
        instrument: &str,
        timeframe_label: &str,
    ) -> Result<SeriesSubscription, BarError> {
        let timeframe = self.registry.by_label(timeframe_label)?.clone();
        let key = (SmolStr::new(instrument), timeframe.clone());

        let mut map = self.series.lock();
        let handle = match map.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().subscribers += 1;
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(self.spawn_series(key.clone())),
        };

        Ok(SeriesSubscription {
            instrument: key.0,
            timeframe,
            updates: BroadcastStream::new(handle.updates.subscribe()),
            series: Arc::clone(&handle.series),
        })
    }

    /// Drop one subscriber's interest. At zero subscribers the writer task is
    /// torn down: an in-flight backfill is cancelled (its result discarded)
    /// and the queued-tick buffer dropped.
    pub fn unsubscribe(&self, instrument: &str, timeframe_label: &str) -> Result<(), BarError> {
        let timeframe = self.registry.by_label(timeframe_label)?.clone();
        let key = (SmolStr::new(instrument), timeframe);

        let mut map = self.series.lock();
        let drained = match map.get_mut(&key) {
            Some(handle) => {
                handle.subscribers = handle.subscribers.saturating_sub(1);
                handle.subscribers == 0
            }
            None => false,
        };
        if drained && let Some(handle) = map.remove(&key) {
            handle.task.abort();
            info!(
                instrument = %key.0,
                timeframe = %key.1,
                "series torn down, no remaining subscribers"
            );
        }
        Ok(())
    }

    /// Current snapshot of a series, or `None` when nothing is subscribed to
    /// that (instrument, timeframe).
    pub fn get_series(
        &self,
        instrument: &str,
        timeframe_label: &str,
    ) -> Result<Option<SeriesSnapshot>, BarError> {
        let timeframe = self.registry.by_label(timeframe_label)?.clone();
        let key = (SmolStr::new(instrument), timeframe);
        Ok(self
            .series
            .lock()
            .get(&key)
            .map(|handle| handle.series.read().snapshot()))
    }

    /// Route one tick to every actively-subscribed timeframe of its
    /// instrument. Invalid ticks are rejected here, before any series.
    ///
    /// A full series mailbox drops the incoming tick and counts it. The
    /// oldest-drop policy applies only to the bounded pending queue held
    /// during reconciliation, where the newest market state must survive.
    pub fn handle_tick(&self, tick: Tick) {
        if let Err(error) = tick.validate() {
            self.metrics.record(&error);
            debug!(%error, "tick rejected");
            return;
        }

        let map = self.series.lock();
        for ((instrument, _), handle) in map.iter() {
            if *instrument == tick.instrument && handle.ticks.try_send(tick.clone()).is_err() {
                self.metrics.record_dropped_queued_tick();
                debug!(%instrument, "series mailbox full, tick dropped");
            }
        }
    }

    /// The logical tick-consumer loop: drain a tick stream into the engine.
    pub async fn run(&self, ticks: impl Stream<Item = Tick>) {
        futures::pin_mut!(ticks);
        while let Some(tick) = ticks.next().await {
            self.handle_tick(tick);
        }
        info!("tick stream ended");
    }

    fn spawn_series(&self, key: SeriesKey) -> SeriesHandle {
        let (instrument, timeframe) = key;
        let series = Arc::new(RwLock::new(CandleSeries::new(
            instrument.clone(),
            timeframe.clone(),
            self.config.series_capacity,
        )));
        let (updates_tx, _) = broadcast::channel(self.config.notify_buffer);
        let (ticks_tx, ticks_rx) = mpsc::channel(self.config.tick_queue_capacity);

        info!(%instrument, %timeframe, "series created");

        let (saves_tx, saves_rx) = watch::channel(None);
        let saver = tokio::spawn(run_saver(Arc::clone(&self.store), saves_rx));

        let worker = SeriesWorker {
            series: Arc::clone(&series),
            updates: updates_tx.clone(),
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            throttle: SaveThrottle::new(self.config.save_interval),
            fetch_timeout: self.config.fetch_timeout,
            queue_capacity: self.config.tick_queue_capacity,
            saves: saves_tx,
            saver,
        };
        let task = tokio::spawn(worker.run(ticks_rx));

        SeriesHandle {
            series,
            updates: updates_tx,
            ticks: ticks_tx,
            task,
            subscribers: 1,
        }
    }
}

/// The single writer for one series: reconciles, then applies ticks in
/// arrival order until its channel closes.
///
/// Saves go through `saves` to a dedicated saver task rather than being
/// spawned individually: per series, saves run one at a time and always
/// persist the most recent snapshot, so an older save finishing late can
/// never overwrite a newer one and a closed candle cannot be lost from
/// the persisted state.
struct SeriesWorker {
    series: Arc<RwLock<CandleSeries>>,
    updates: broadcast::Sender<BarUpdate>,
    source: Arc<dyn HistoricalSource>,
    store: Arc<dyn SnapshotStore>,
    metrics: Arc<Metrics>,
    throttle: SaveThrottle,
    fetch_timeout: Duration,
    queue_capacity: usize,
    saves: watch::Sender<Option<SeriesSnapshot>>,
    saver: tokio::task::JoinHandle<()>,
}

impl SeriesWorker {
    async fn run(mut self, mut ticks: mpsc::Receiver<Tick>) {
        // Reconciliation must not race tick application: buffer inbound
        // ticks (bounded, oldest-drop) until the swap has happened, then
        // replay them in arrival order.
        let mut pending: VecDeque<Tick> = VecDeque::new();
        {
            let reconcile = backfill::reconcile(
                self.source.as_ref(),
                self.store.as_ref(),
                &self.series,
                &self.metrics,
                self.fetch_timeout,
            );
            tokio::pin!(reconcile);
            loop {
                tokio::select! {
                    outcome = &mut reconcile => {
                        debug!(?outcome, queued = pending.len(), "reconciliation complete");
                        break;
                    }
                    maybe_tick = ticks.recv() => match maybe_tick {
                        Some(tick) => {
                            if pending.len() >= self.queue_capacity {
                                pending.pop_front();
                                self.metrics.record_dropped_queued_tick();
                            }
                            pending.push_back(tick);
                        }
                        // Engine dropped the series mid-reconciliation
                        None => return,
                    },
                }
            }
        }

        for tick in pending {
            self.apply(&tick);
        }

        while let Some(tick) = ticks.recv().await {
            self.apply(&tick);
        }

        // Channel closed: engine shutdown. Flush a final snapshot and wait
        // for the saver to drain it, so at most the unsaved tail of one
        // candle is lost.
        let snapshot = self.series.read().snapshot();
        if !snapshot.candles.is_empty() {
            let _ = self.saves.send(Some(snapshot));
        }
        drop(self.saves);
        let _ = self.saver.await;
    }

    fn apply(&mut self, tick: &Tick) {
        // Write lock covers exactly one state-machine step
        let result = {
            let mut guard = self.series.write();
            aggregator::apply(&mut guard, tick)
        };

        match result {
            Ok(update) => {
                let force = update.is_new_bucket;
                // A send error only means nobody is listening right now
                let _ = self.updates.send(update);

                if self.throttle.due(force) {
                    // Latest wins: a busy saver picks this up on its next pass
                    let _ = self.saves.send(Some(self.series.read().snapshot()));
                }
            }
            Err(error) if error.is_tick_rejection() => {
                self.metrics.record(&error);
                debug!(%error, "tick dropped");
            }
            Err(error) => {
                // Capacity guard tripped: the series reset itself, keep
                // ingesting rather than crash the process
                self.metrics.record(&error);
                warn!(%error, "series error");
            }
        }
    }
}

/// Dedicated saver for one series. The watch channel coalesces bursts of
/// snapshots while a save is in flight; each pass persists whatever is
/// newest at that moment. Exits once the worker drops its sender, after
/// draining any unseen snapshot.
async fn run_saver(
    store: Arc<dyn SnapshotStore>,
    mut snapshots: watch::Receiver<Option<SeriesSnapshot>>,
) {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Some(snapshot) = snapshot {
            if let Err(error) = persistence::save_snapshot(Arc::clone(&store), snapshot).await {
                warn!(%error, "snapshot save failed");
            }
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}
