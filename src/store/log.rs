//! The durable append-only log and the store built on top of it.
//!
//! [`CommitLog`] is the minimal capability the store needs from its log:
//! fenced appends, ordered fetch, end offset. [`MemoryLog`] is the in-process
//! single-partition implementation; a replicated log with equivalent fencing
//! drops in behind the same trait.
//!
//! [`LogStore`] owns one consumer (always running, applies records in log
//! order to the [`LookupCache`]) and one producer epoch (held only while this
//! node is leader). A `put` is acknowledged only after the local consumer has
//! observed the write; the noop read barrier gives read-then-write sequences
//! a consistent view.

use super::{
    LookupCache, RecordSerializer, RegistryKey, RegistryValue, StoreUpdateHandler,
};
use crate::error::{RegistryError, RegistryResult};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One durable record
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub offset: u64,
    pub key: Bytes,
    /// `None` is a tombstone
    pub value: Option<Bytes>,
}

/// Minimal log capability: ordered, fenced, replayable.
///
/// `epoch` tokens fence stale producers: an append with an epoch older than
/// the latest `begin_epoch` is rejected, which is what upholds
/// at-most-one-leader from the log's perspective. Barrier records carry no
/// epoch, so any node may write them.
#[async_trait::async_trait]
pub trait CommitLog: Send + Sync {
    /// Start a new producer epoch, fencing all previous ones
    async fn begin_epoch(&self) -> RegistryResult<u64>;

    /// Append a record; returns its offset
    async fn append(
        &self,
        epoch: Option<u64>,
        key: Bytes,
        value: Option<Bytes>,
    ) -> RegistryResult<u64>;

    /// Records starting at `from`, at most `max`
    async fn fetch(&self, from: u64, max: usize) -> RegistryResult<Vec<LogEntry>>;

    /// Offset one past the last record
    async fn end_offset(&self) -> RegistryResult<u64>;
}

/// In-process, single-partition log with epoch fencing.
///
/// Shared between several [`LogStore`]s it models a multi-node cluster over
/// one replicated log.
#[derive(Default)]
pub struct MemoryLog {
    records: parking_lot::Mutex<Vec<(Bytes, Option<Bytes>)>>,
    epoch: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CommitLog for MemoryLog {
    async fn begin_epoch(&self) -> RegistryResult<u64> {
        Ok(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn append(
        &self,
        epoch: Option<u64>,
        key: Bytes,
        value: Option<Bytes>,
    ) -> RegistryResult<u64> {
        if let Some(e) = epoch {
            if e != self.epoch.load(Ordering::SeqCst) {
                return Err(RegistryError::NotLeader);
            }
        }
        let mut records = self.records.lock();
        records.push((key, value));
        Ok((records.len() - 1) as u64)
    }

    async fn fetch(&self, from: u64, max: usize) -> RegistryResult<Vec<LogEntry>> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .enumerate()
            .skip(from as usize)
            .take(max)
            .map(|(offset, (key, value))| LogEntry {
                offset: offset as u64,
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn end_offset(&self) -> RegistryResult<u64> {
        Ok(self.records.lock().len() as u64)
    }
}

const CONSUMER_BATCH: usize = 256;
const CONSUMER_IDLE: Duration = Duration::from_millis(5);

/// The replicated store: single source of truth for all writable state
pub struct LogStore {
    log: Arc<dyn CommitLog>,
    serializer: RecordSerializer,
    cache: Arc<LookupCache>,
    handlers: Arc<Vec<Arc<dyn StoreUpdateHandler>>>,
    timeout: Duration,
    /// Producer epoch; `Some` only while this node is leader
    producer_epoch: parking_lot::Mutex<Option<u64>>,
    applied_tx: Arc<watch::Sender<u64>>,
    applied_rx: watch::Receiver<u64>,
    /// Offset of our most recent write, if still trustworthy; invalidated on
    /// leader transitions so the next barrier re-queries the log end
    last_written: Mutex<Option<u64>>,
    subject_locks: DashMap<String, Arc<Mutex<()>>>,
    leader_lock: Arc<Mutex<()>>,
    initialized: AtomicBool,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LogStore {
    pub fn new(
        log: Arc<dyn CommitLog>,
        serializer: RecordSerializer,
        cache: Arc<LookupCache>,
        handlers: Vec<Arc<dyn StoreUpdateHandler>>,
        timeout: Duration,
    ) -> Self {
        let (applied_tx, applied_rx) = watch::channel(0u64);
        Self {
            log,
            serializer,
            cache,
            handlers: Arc::new(handlers),
            timeout,
            producer_epoch: parking_lot::Mutex::new(None),
            applied_tx: Arc::new(applied_tx),
            applied_rx,
            last_written: Mutex::new(None),
            subject_locks: DashMap::new(),
            leader_lock: Arc::new(Mutex::new(())),
            initialized: AtomicBool::new(false),
            consumer: parking_lot::Mutex::new(None),
        }
    }

    /// Start the consumer and block until it has caught up with the log tail
    pub async fn init(&self, init_timeout: Duration) -> RegistryResult<()> {
        {
            let mut consumer = self.consumer.lock();
            if consumer.is_some() {
                return Err(RegistryError::Initialization(
                    "Store already initialized".to_string(),
                ));
            }
            *consumer = Some(self.spawn_consumer());
        }

        let tail = self.log.end_offset().await?;
        self.wait_until_applied(tail, init_timeout)
            .await
            .map_err(|e| {
                RegistryError::Initialization(format!("Failed to catch up with the log: {}", e))
            })?;
        self.initialized.store(true, Ordering::SeqCst);
        info!(tail = tail, "Store caught up with the log tail");
        Ok(())
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn spawn_consumer(&self) -> JoinHandle<()> {
        let log = Arc::clone(&self.log);
        let serializer = self.serializer.clone();
        let cache = Arc::clone(&self.cache);
        let handlers = Arc::clone(&self.handlers);
        let applied_tx = Arc::clone(&self.applied_tx);

        tokio::spawn(async move {
            let mut next: u64 = 0;
            loop {
                let batch = match log.fetch(next, CONSUMER_BATCH).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "Log fetch failed; retrying");
                        tokio::time::sleep(CONSUMER_IDLE).await;
                        continue;
                    }
                };

                if batch.is_empty() {
                    tokio::time::sleep(CONSUMER_IDLE).await;
                    continue;
                }

                for entry in batch {
                    let key = match serializer.deserialize_key(&entry.key) {
                        Ok(key) => key,
                        Err(e) => {
                            warn!(offset = entry.offset, error = %e, "Skipping undecodable record key");
                            next = entry.offset + 1;
                            let _ = applied_tx.send(next);
                            continue;
                        }
                    };
                    let value = match &entry.value {
                        Some(bytes) => match serializer.deserialize_value(bytes) {
                            Ok(v) => Some(v),
                            Err(e) => {
                                warn!(offset = entry.offset, error = %e, "Skipping undecodable record value");
                                next = entry.offset + 1;
                                let _ = applied_tx.send(next);
                                continue;
                            }
                        },
                        None => None,
                    };

                    let old = cache.apply(&key, value.as_ref());
                    for handler in handlers.iter() {
                        handler.handle_update(&key, value.as_ref(), old.as_ref(), entry.offset);
                    }
                    debug!(offset = entry.offset, "Applied record");

                    next = entry.offset + 1;
                    let _ = applied_tx.send(next);
                }
            }
        })
    }

    /// Take the producer epoch; called when this node becomes leader
    pub async fn assume_leadership(&self) -> RegistryResult<()> {
        let epoch = self.log.begin_epoch().await?;
        *self.producer_epoch.lock() = Some(epoch);
        info!(epoch = epoch, "Producer epoch acquired");
        Ok(())
    }

    /// Drop the producer epoch; called when leadership moves elsewhere
    pub fn resign_leadership(&self) {
        *self.producer_epoch.lock() = None;
    }

    async fn append_typed(
        &self,
        key: &RegistryKey,
        value: Option<&RegistryValue>,
    ) -> RegistryResult<u64> {
        let epoch = (*self.producer_epoch.lock()).ok_or(RegistryError::NotLeader)?;
        let key_bytes = self.serializer.serialize_key(key)?;
        let value_bytes = match value {
            Some(v) => Some(self.serializer.serialize_value(key, v)?),
            None => None,
        };
        let offset = self.log.append(Some(epoch), key_bytes, value_bytes).await?;
        *self.last_written.lock().await = Some(offset);
        Ok(offset)
    }

    /// Write a record and block until the local consumer has observed it.
    ///
    /// Fails with `NotLeader` on a follower, and with `NotLeader` too when a
    /// leader transition fences our epoch between the leadership check and
    /// the append; callers treat both as retriable.
    pub async fn put(&self, key: &RegistryKey, value: &RegistryValue) -> RegistryResult<()> {
        let offset = self.append_typed(key, Some(value)).await?;
        self.wait_until_applied(offset + 1, self.timeout).await
    }

    /// Tombstone a key
    pub async fn delete(&self, key: &RegistryKey) -> RegistryResult<()> {
        let offset = self.append_typed(key, None).await?;
        self.wait_until_applied(offset + 1, self.timeout).await
    }

    /// Latest materialized value
    pub fn get(&self, key: &RegistryKey) -> Option<RegistryValue> {
        self.cache.get(key)
    }

    /// All records in the inclusive key range, in key order
    pub fn get_all(
        &self,
        start: &RegistryKey,
        end: &RegistryKey,
    ) -> Vec<(RegistryKey, RegistryValue)> {
        self.cache.range(start, end)
    }

    /// Read barrier: make sure the local reader has consumed everything
    /// produced so far. Writes a noop keyed by the subject when the last
    /// written offset is unknown.
    pub async fn wait_until_reader_reaches_last_offset(
        &self,
        subject: Option<&str>,
        timeout: Duration,
    ) -> RegistryResult<()> {
        let target = {
            let mut last_written = self.last_written.lock().await;
            match *last_written {
                Some(offset) => offset,
                None => {
                    let key = RegistryKey::Noop {
                        subject: subject.map(str::to_string),
                    };
                    let key_bytes = self.serializer.serialize_key(&key)?;
                    // Barriers are epoch-less: followers fence their reads
                    // the same way the leader does
                    let offset = self.log.append(None, key_bytes, None).await?;
                    *last_written = Some(offset);
                    offset
                }
            }
        };
        self.wait_until_applied(target + 1, timeout).await
    }

    /// Forget the cached last-written offset. Called on leader transitions:
    /// the new leader cannot trust an offset observed under the old epoch.
    pub async fn mark_last_written_offset_invalid(&self) {
        *self.last_written.lock().await = None;
    }

    async fn wait_until_applied(&self, target: u64, timeout: Duration) -> RegistryResult<()> {
        let mut rx = self.applied_rx.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                if *rx.borrow() >= target {
                    return Ok(());
                }
                rx.changed()
                    .await
                    .map_err(|_| RegistryError::Store("Log consumer stopped".to_string()))?;
            }
        })
        .await
        .map_err(|_| {
            RegistryError::Timeout(format!(
                "Reader failed to reach offset {} within {:?}",
                target, timeout
            ))
        })?
    }

    /// Per-subject mutex serializing writer-side orchestration
    pub fn lock_for(&self, subject: &str) -> Arc<Mutex<()>> {
        self.subject_locks
            .entry(subject.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Coarse lock guarding leader-identity state. Nests inside
    /// `lock_for(subject)`, never the other way around.
    pub fn leader_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.leader_lock)
    }

    pub fn cache(&self) -> &Arc<LookupCache> {
        &self.cache
    }

    pub fn close(&self) {
        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }
        info!("Store closed");
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        self.close();
    }
}
