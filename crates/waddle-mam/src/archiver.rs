//! Asynchronous batching archivers.
//!
//! Message delivery only ever appends to an in-memory queue. A worker per
//! archiver drains the queue into the store on a fixed interval, or as soon as
//! a full batch is waiting. A batch the store rejects is logged and dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ArchiverConfig;
use crate::metrics;
use crate::store::{
    ArchiveStore, ConversationRecord, ParticipationUpdate, RoomLogRecord, StoreError,
};
use crate::types::MessageRecord;

/// Destination of an archiver's batches.
#[async_trait]
pub trait BatchStore<T>: Send + Sync {
    async fn store_batch(&self, batch: &[T]) -> Result<(), StoreError>;
}

/// Anything that can tell how long until data enqueued before an instant is durable.
pub trait EtaSource: Send + Sync {
    fn availability_eta(&self, at: Instant) -> Duration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiverSettings {
    /// Batch size that triggers an early flush, and the largest batch written at once
    pub max_work_queue_size: usize,
    /// Interval of the scheduled flush
    pub max_purge_interval: Duration,
    /// Slack added to every non-zero availability estimate
    pub grace_period: Duration,
}

impl From<&ArchiverConfig> for ArchiverSettings {
    fn from(config: &ArchiverConfig) -> Self {
        Self {
            max_work_queue_size: config.max_work_queue_size.max(1),
            max_purge_interval: config.purge_interval(),
            grace_period: config.grace_period(),
        }
    }
}

impl Default for ArchiverSettings {
    fn default() -> Self {
        Self::from(&ArchiverConfig::default())
    }
}

struct Queued<T> {
    item: T,
    queued_at: Instant,
}

struct State<T> {
    queue: VecDeque<Queued<T>>,
    /// Enqueue instant of the oldest item in the batch being written
    in_flight: Option<Instant>,
    next_flush: Instant,
}

/// A queue of items of one kind and the worker that persists them.
pub struct Archiver<T> {
    name: String,
    settings: ArchiverSettings,
    state: Mutex<State<T>>,
    notify: Notify,
    store: Arc<dyn BatchStore<T>>,
}

impl<T: Send + Sync + 'static> Archiver<T> {
    pub fn new(
        name: impl Into<String>,
        settings: ArchiverSettings,
        store: Arc<dyn BatchStore<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                in_flight: None,
                next_flush: Instant::now() + settings.max_purge_interval,
            }),
            notify: Notify::new(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &ArchiverSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an item. Never waits on the store.
    pub fn archive(&self, item: T) {
        let depth = {
            let mut state = self.lock();
            state.queue.push_back(Queued {
                item,
                queued_at: Instant::now(),
            });
            state.queue.len()
        };

        metrics::record_queue_depth(&self.name, depth);
        if depth >= self.settings.max_work_queue_size {
            self.notify.notify_one();
        }
    }

    pub fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Time until everything enqueued at or before `at` has been written.
    ///
    /// Zero when no such item is queued or being written. Otherwise the wait
    /// for the next scheduled flush plus the grace period, plus one interval
    /// for every further full batch ahead of the newest such item.
    pub fn availability_eta(&self, at: Instant) -> Duration {
        let state = self.lock();
        let pending = state
            .queue
            .iter()
            .take_while(|queued| queued.queued_at <= at)
            .count();
        let writing = state.in_flight.is_some_and(|oldest| oldest <= at);

        if pending == 0 {
            return if writing {
                self.settings.grace_period
            } else {
                Duration::ZERO
            };
        }

        let until_flush = state.next_flush.saturating_duration_since(Instant::now());
        let extra_batches = (pending - 1) / self.settings.max_work_queue_size;
        until_flush
            + self.settings.grace_period
            + self.settings.max_purge_interval * extra_batches as u32
    }

    /// Start the worker. It stops on cancellation after a final drain.
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let archiver = Arc::clone(self);
        tokio::spawn(async move { archiver.run(token).await })
    }

    async fn run(&self, token: CancellationToken) {
        let interval = self.settings.max_purge_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.lock().next_flush = Instant::now() + interval;

        info!(archiver = %self.name, interval_ms = interval.as_millis() as u64, "Archiver started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.lock().next_flush = Instant::now() + interval;
                    self.flush_now().await;
                }
                _ = self.notify.notified() => {
                    while self.queue_len() >= self.settings.max_work_queue_size {
                        if self.flush_batch().await == 0 {
                            break;
                        }
                    }
                }
            }
        }

        let flushed = self.flush_now().await;
        info!(archiver = %self.name, flushed, "Archiver stopped");
    }

    /// Write everything currently queued. Returns the number of items taken.
    pub async fn flush_now(&self) -> usize {
        let mut total = 0;
        loop {
            let flushed = self.flush_batch().await;
            if flushed == 0 {
                return total;
            }
            total += flushed;
        }
    }

    async fn flush_batch(&self) -> usize {
        let batch: Vec<T> = {
            let mut state = self.lock();
            let size = state.queue.len().min(self.settings.max_work_queue_size);
            if size == 0 {
                return 0;
            }
            let drained: Vec<Queued<T>> = state.queue.drain(..size).collect();
            state.in_flight = drained.first().map(|queued| queued.queued_at);
            drained.into_iter().map(|queued| queued.item).collect()
        };

        let count = batch.len();
        match self.store.store_batch(&batch).await {
            Ok(()) => {
                debug!(archiver = %self.name, count, "Stored batch");
                metrics::record_archived(&self.name, count);
            }
            Err(e) => {
                error!(archiver = %self.name, count, error = %e, "Failed to store batch, dropping it");
                metrics::record_dropped_batch(&self.name);
            }
        }

        let depth = {
            let mut state = self.lock();
            state.in_flight = None;
            state.queue.len()
        };
        metrics::record_queue_depth(&self.name, depth);
        count
    }
}

impl<T: Send + Sync + 'static> EtaSource for Archiver<T> {
    fn availability_eta(&self, at: Instant) -> Duration {
        Archiver::availability_eta(self, at)
    }
}

/// One room-log archiver per room, created on first use.
pub struct RoomArchivers {
    settings: ArchiverSettings,
    store: Arc<dyn BatchStore<RoomLogRecord>>,
    archivers: DashMap<BareJid, Arc<Archiver<RoomLogRecord>>>,
    token: Mutex<Option<CancellationToken>>,
}

impl RoomArchivers {
    pub fn new(settings: ArchiverSettings, store: Arc<dyn BatchStore<RoomLogRecord>>) -> Self {
        Self {
            settings,
            store,
            archivers: DashMap::new(),
            token: Mutex::new(None),
        }
    }

    fn started(&self) -> Option<CancellationToken> {
        self.token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn archive(&self, record: RoomLogRecord) {
        let archiver = self.archiver_for(&record.room);
        archiver.archive(record);
    }

    /// The room's archiver, spawning its worker when the registry is running.
    pub fn archiver_for(&self, room: &BareJid) -> Arc<Archiver<RoomLogRecord>> {
        let token = self.started();
        self.archivers
            .entry(room.clone())
            .or_insert_with(|| {
                let archiver = Arc::new(Archiver::new(
                    format!("room-log:{room}"),
                    self.settings,
                    Arc::clone(&self.store),
                ));
                if let Some(token) = token {
                    archiver.spawn(token.child_token());
                }
                archiver
            })
            .clone()
    }

    /// Spawn workers for existing rooms and for every room added later.
    pub fn start(&self, token: &CancellationToken) {
        *self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token.clone());
        for entry in self.archivers.iter() {
            entry.value().spawn(token.child_token());
        }
    }

    pub async fn flush_all(&self) -> usize {
        let archivers: Vec<_> = self.archivers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut total = 0;
        for archiver in archivers {
            total += archiver.flush_now().await;
        }
        total
    }

    pub fn len(&self) -> usize {
        self.archivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archivers.is_empty()
    }
}

impl EtaSource for RoomArchivers {
    fn availability_eta(&self, at: Instant) -> Duration {
        self.archivers
            .iter()
            .map(|entry| entry.value().availability_eta(at))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Adapts an [`ArchiveStore`] to every batch kind the archivers produce.
#[derive(Clone)]
pub struct ArchiveWriter {
    store: Arc<dyn ArchiveStore>,
}

impl ArchiveWriter {
    pub fn new(store: Arc<dyn ArchiveStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchStore<MessageRecord> for ArchiveWriter {
    async fn store_batch(&self, batch: &[MessageRecord]) -> Result<(), StoreError> {
        self.store.insert_messages(batch).await
    }
}

#[async_trait]
impl BatchStore<ConversationRecord> for ArchiveWriter {
    async fn store_batch(&self, batch: &[ConversationRecord]) -> Result<(), StoreError> {
        self.store.upsert_conversations(batch).await
    }
}

#[async_trait]
impl BatchStore<ParticipationUpdate> for ArchiveWriter {
    async fn store_batch(&self, batch: &[ParticipationUpdate]) -> Result<(), StoreError> {
        self.store.store_participations(batch).await
    }
}

#[async_trait]
impl BatchStore<RoomLogRecord> for ArchiveWriter {
    async fn store_batch(&self, batch: &[RoomLogRecord]) -> Result<(), StoreError> {
        self.store.insert_room_log(batch).await
    }
}
