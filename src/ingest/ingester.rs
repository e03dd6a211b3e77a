//! Ingester - owns the chunk ring and drives flushing
//!
//! Write path: [`Ingester::ingest`] -> [`Chunk::put`] on the write head; on
//! overflow the head is advanced to the chunk that accepted the entry. A
//! background maintenance task walks the flush head, handing ready chunks to
//! the storage and enforcing the age / size / retry / dirty-chunk policies.
//!
//! Thread-safe: callers may ingest concurrently with no global lock; the
//! write head is only written while advancing, guarded by the id observed
//! before the put so exactly one caller wins each transition.

use crate::ingest::chunk::{Chunk, Entry, MAX_CHUNK_CAP};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Errors surfaced by the ingester.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    /// The ingester was already closed.
    #[error("the ingester was already closed")]
    Closed,
}

/// Configuration for the ingester. All fields have conservative defaults;
/// zero values are normalized to them on construction.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Pre-materialized lookahead depth of the ring.
    pub chunks: u32,
    /// Slots per chunk, at most [`MAX_CHUNK_CAP`].
    pub chunk_size: u32,
    /// Force-lock a chunk whose content bytes exceed this. Zero disables.
    pub max_chunk_size_bytes: u64,
    /// Drop the oldest un-flushed chunks beyond this depth.
    pub max_dirty_chunks: u32,
    /// Flush retries per chunk before the chunk is abandoned.
    pub max_flush_retry: u32,
    /// Age after which a filling chunk is locked for flushing.
    pub flush_after_sec: i64,
    /// Maintenance tick interval.
    pub interval_check_ms: u64,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            chunks: 3,
            chunk_size: MAX_CHUNK_CAP,
            max_chunk_size_bytes: 0,
            max_dirty_chunks: 50,
            max_flush_retry: 3,
            flush_after_sec: 3,
            interval_check_ms: 100,
        }
    }
}

impl IngesterConfig {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.chunks == 0 {
            self.chunks = defaults.chunks;
        }
        self.chunk_size = match self.chunk_size {
            0 => defaults.chunk_size,
            n => n.min(MAX_CHUNK_CAP),
        };
        if self.max_dirty_chunks == 0 {
            self.max_dirty_chunks = defaults.max_dirty_chunks;
        }
        if self.max_flush_retry == 0 {
            self.max_flush_retry = defaults.max_flush_retry;
        }
        if self.flush_after_sec <= 0 {
            self.flush_after_sec = defaults.flush_after_sec;
        }
        if self.interval_check_ms == 0 {
            self.interval_check_ms = defaults.interval_check_ms;
        }
        self
    }
}

/// Accepts log records on a low-latency path and batches them into chunks
/// that a [`Storage`] persists.
pub struct Ingester {
    config: IngesterConfig,
    storage: Arc<dyn Storage>,
    /// Write head. Read-shared on the hot path; the write lock is taken
    /// only to advance.
    write: RwLock<Arc<Chunk>>,
    /// Id of the chunk the flush head currently points at.
    flush_id: AtomicI32,
    closed: AtomicBool,
    quit: watch::Sender<bool>,
    shutdown: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Ingester {
    /// Creates the ingester and spawns its maintenance task. Must be called
    /// within a tokio runtime.
    pub fn new(config: IngesterConfig, storage: Arc<dyn Storage>) -> Arc<Self> {
        let config = config.normalized();

        let root = Arc::new(Chunk::new(0, config.chunk_size));
        root.init(config.chunks);

        let (quit_tx, quit_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();

        let ingester = Arc::new(Self {
            config,
            storage,
            write: RwLock::new(Arc::clone(&root)),
            flush_id: AtomicI32::new(root.id()),
            closed: AtomicBool::new(false),
            quit: quit_tx,
            shutdown: Mutex::new(Some(done_rx)),
        });

        tokio::spawn(Self::run(Arc::clone(&ingester), root, quit_rx, done_tx));

        ingester
    }

    /// Appends one record. Non-blocking on the happy path; brief contention
    /// is possible only while a successor chunk is being materialized.
    pub fn ingest(
        &self,
        time: DateTime<Utc>,
        level: i8,
        content: Vec<u8>,
    ) -> Result<(), IngestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestError::Closed);
        }

        let current = {
            let guard = self.write.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };
        let observed_id = current.id();

        let (into, forwarded) = current.put(Entry::new(time, level, content));
        if forwarded {
            // Advance the head, but only if nobody advanced it past the id
            // we started from.
            let mut head = self.write.write().unwrap_or_else(|e| e.into_inner());
            if head.id() == observed_id {
                *head = into;
            }
        }

        Ok(())
    }

    /// Id of the chunk the flush head points at. Mostly useful for
    /// observability.
    pub fn flush_chunk_id(&self) -> i32 {
        self.flush_id.load(Ordering::Acquire)
    }

    /// Signals the maintenance task to drain the ring, then waits for it to
    /// flush everything it can and close the storage. A second call returns
    /// [`IngestError::Closed`].
    pub async fn close(&self) -> Result<(), IngestError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(IngestError::Closed);
        }

        let _ = self.quit.send(true);

        let rx = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }

        Ok(())
    }

    async fn run(
        this: Arc<Self>,
        mut flush: Arc<Chunk>,
        mut quit: watch::Receiver<bool>,
        done: oneshot::Sender<()>,
    ) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(this.config.interval_check_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    flush = this.maintain(flush);
                }
                _ = quit.changed() => {
                    this.drain(flush).await;
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    /// One maintenance tick: flush ready chunks, lock aged or oversized
    /// ones, enforce the dirty-chunk cap. Returns the new flush head.
    fn maintain(&self, mut flush: Arc<Chunk>) -> Arc<Chunk> {
        loop {
            if flush.is_empty() {
                break;
            }

            if flush.is_ready() {
                match self.storage.flush(&flush) {
                    Ok(()) => {
                        flush.init(self.config.chunks + 1);
                        flush = flush.next_or_init();
                    }
                    Err(err) => {
                        let retries = flush.fail();
                        tracing::warn!(
                            chunk = flush.id(),
                            retries,
                            error = %err,
                            "error flushing chunk"
                        );
                        if retries > self.config.max_flush_retry {
                            tracing::warn!(
                                chunk = flush.id(),
                                "abandoning chunk after repeated flush failures"
                            );
                            flush.init(self.config.chunks + 1);
                            flush = flush.next_or_init();
                        } else {
                            break;
                        }
                    }
                }
                continue;
            }

            let oversized = self.config.max_chunk_size_bytes > 0
                && flush.size() > self.config.max_chunk_size_bytes;
            if oversized
                || flush.ttl().num_milliseconds() > self.config.flush_after_sec * 1000
            {
                // Stop accepting writes so the chunk becomes ready on one of
                // the next ticks.
                flush.lock();
                flush.init(self.config.chunks);
            }
            break;
        }

        while flush.depth() > self.config.max_dirty_chunks {
            tracing::warn!(chunk = flush.id(), "dirty chunk cap exceeded, dropping chunk");
            flush = flush.next_or_init();
            flush.init(self.config.chunks);
        }

        self.flush_id.store(flush.id(), Ordering::Release);
        flush
    }

    /// Drain mode: lock the head, flush every non-empty chunk as it becomes
    /// ready, skip chunks whose retry budget is exhausted, then close the
    /// storage.
    async fn drain(&self, mut chunk: Arc<Chunk>) {
        chunk.lock();

        loop {
            self.flush_id.store(chunk.id(), Ordering::Release);

            if chunk.is_empty() {
                break;
            }

            if chunk.is_ready() {
                match self.storage.flush(&chunk) {
                    Ok(()) => {
                        chunk.init(1);
                        chunk = chunk.next_or_init();
                        chunk.lock();
                    }
                    Err(err) => {
                        let retries = chunk.fail();
                        if retries > self.config.max_flush_retry {
                            tracing::warn!(
                                chunk = chunk.id(),
                                error = %err,
                                "abandoning chunk during shutdown"
                            );
                            chunk.init(1);
                            chunk = chunk.next_or_init();
                            chunk.lock();
                        }
                    }
                }
            } else {
                // Booked writers are still publishing.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        if let Err(err) = self.storage.close() {
            tracing::warn!(error = %err, "error closing storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockStorage {
        fail_flush: AtomicBool,
        flushes: AtomicUsize,
        entries: StdMutex<Vec<(i64, i8, Vec<u8>)>>,
        closed: AtomicBool,
    }

    impl MockStorage {
        fn failing() -> Self {
            let s = Self::default();
            s.fail_flush.store(true, Ordering::Relaxed);
            s
        }
    }

    impl Storage for MockStorage {
        fn flush(&self, chunk: &Chunk) -> Result<(), StorageError> {
            if self.fail_flush.load(Ordering::Relaxed) {
                return Err(StorageError::Closed);
            }
            self.flushes.fetch_add(1, Ordering::Relaxed);
            let mut entries = self.entries.lock().unwrap();
            for e in chunk.list() {
                entries.push((e.time.timestamp(), e.level, e.content.clone()));
            }
            Ok(())
        }

        fn close(&self) -> Result<(), StorageError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    async fn wait_for(max: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + max;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_flush_after_sec() {
        let storage = Arc::new(MockStorage::default());
        let config = IngesterConfig {
            chunks: 3,
            flush_after_sec: 1,
            ..Default::default()
        };
        let ingester = Ingester::new(config, Arc::clone(&storage) as Arc<dyn Storage>);

        ingester
            .ingest(Utc::now(), 0, b"{\"msg\":\"test\"}".to_vec())
            .unwrap();

        assert!(
            wait_for(Duration::from_secs(3), || {
                storage.flushes.load(Ordering::Relaxed) == 1
            })
            .await,
            "storage flush was not called"
        );
        assert_eq!(storage.entries.lock().unwrap().len(), 1);

        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_chunk_size_bytes() {
        let storage = Arc::new(MockStorage::default());
        let config = IngesterConfig {
            chunks: 3,
            flush_after_sec: 50,
            max_chunk_size_bytes: 2,
            ..Default::default()
        };
        let ingester = Ingester::new(config, Arc::clone(&storage) as Arc<dyn Storage>);

        ingester
            .ingest(Utc::now(), 0, b"{\"msg\":\"test\"}".to_vec())
            .unwrap();

        assert!(
            wait_for(Duration::from_secs(3), || {
                storage.flushes.load(Ordering::Relaxed) == 1
            })
            .await,
            "oversized chunk was not flushed"
        );

        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_chunk_flushes_and_head_advances() {
        let storage = Arc::new(MockStorage::default());
        let config = IngesterConfig {
            chunks: 3,
            chunk_size: 4,
            flush_after_sec: 50,
            ..Default::default()
        };
        let ingester = Ingester::new(config, Arc::clone(&storage) as Arc<dyn Storage>);

        let base = Utc::now();
        for i in 0..4 {
            ingester
                .ingest(base + chrono::Duration::seconds(i), 0, b"{}".to_vec())
                .unwrap();
        }

        assert!(
            wait_for(Duration::from_secs(3), || {
                storage.flushes.load(Ordering::Relaxed) == 1
            })
            .await
        );

        let entries = storage.entries.lock().unwrap();
        assert_eq!(entries.len(), 4);
        let times: Vec<i64> = entries.iter().map(|(t, _, _)| *t).collect();
        let mut sorted = times.clone();
        sorted.sort_unstable();
        assert_eq!(times, sorted, "entries should arrive in insertion order");
        drop(entries);

        assert!(
            wait_for(Duration::from_secs(1), || ingester.flush_chunk_id() == 1).await,
            "flush head should advance past the flushed chunk"
        );

        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_flush_retry_abandons_chunk() {
        let storage = Arc::new(MockStorage::failing());
        let config = IngesterConfig {
            chunks: 3,
            flush_after_sec: 1,
            max_flush_retry: 1,
            ..Default::default()
        };
        let ingester = Ingester::new(config, Arc::clone(&storage) as Arc<dyn Storage>);

        ingester
            .ingest(Utc::now(), 0, b"{\"msg\":\"test\"}".to_vec())
            .unwrap();

        assert!(
            wait_for(Duration::from_secs(5), || ingester.flush_chunk_id() == 1).await,
            "flush head should advance past the abandoned chunk"
        );

        ingester.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_dirty_chunks_collapses_ring() {
        let storage = Arc::new(MockStorage::failing());
        let config = IngesterConfig {
            chunks: 3,
            chunk_size: 4,
            flush_after_sec: 50,
            max_dirty_chunks: 5,
            max_flush_retry: 50, // misconfigured on purpose: forces retention
            ..Default::default()
        };
        let ingester = Ingester::new(config, Arc::clone(&storage) as Arc<dyn Storage>);

        for _ in 0..40 {
            ingester
                .ingest(Utc::now(), 0, b"{\"msg\":\"test\"}".to_vec())
                .unwrap();
        }

        // The close drain burns through every dirty chunk's retry budget and
        // must terminate, leaving the flush head on the first empty chunk.
        ingester.close().await.unwrap();
        assert_eq!(ingester.flush_chunk_id(), 10);
    }

    #[tokio::test]
    async fn test_close_twice() {
        let storage = Arc::new(MockStorage::default());
        let ingester =
            Ingester::new(IngesterConfig::default(), storage as Arc<dyn Storage>);

        assert!(ingester.close().await.is_ok());
        assert_eq!(ingester.close().await, Err(IngestError::Closed));
    }

    #[tokio::test]
    async fn test_close_flushes_pending_and_closes_storage() {
        let storage = Arc::new(MockStorage::default());
        let config = IngesterConfig {
            chunks: 3,
            flush_after_sec: 1,
            ..Default::default()
        };
        let ingester = Ingester::new(config, Arc::clone(&storage) as Arc<dyn Storage>);

        ingester
            .ingest(Utc::now(), 0, b"{\"msg\":\"test\"}".to_vec())
            .unwrap();

        ingester.close().await.unwrap();

        assert_eq!(storage.flushes.load(Ordering::Relaxed), 1);
        assert!(storage.closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_ingest_after_close() {
        let storage = Arc::new(MockStorage::default());
        let ingester =
            Ingester::new(IngesterConfig::default(), storage as Arc<dyn Storage>);

        ingester.close().await.unwrap();
        assert_eq!(
            ingester.ingest(Utc::now(), 0, b"{}".to_vec()),
            Err(IngestError::Closed)
        );
    }
}
