//! Logbook engine facade
//!
//! Wires an [`Ingester`] to a [`QueryStorage`] and exposes the whole
//! surface: `ingest` on the hot path, the four query operations, and a
//! cooperative `close`.

use crate::ingest::{IngestError, Ingester, IngesterConfig};
use crate::query::{EntriesInput, Output, TicksInput};
use crate::storage::{NoopStorage, QueryStorage, StorageResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Invoked right before the engine stops accepting records. Gives the host
/// a chance to re-point any logging pipeline that feeds this engine back to
/// a plain sink, so shutdown messages are not silently dropped.
pub type FallbackLog = Arc<dyn Fn() + Send + Sync>;

/// Engine configuration.
#[derive(Default)]
pub struct Config {
    pub ingester: IngesterConfig,
    /// Storage backend; a no-op storage when absent.
    pub storage: Option<Arc<dyn QueryStorage>>,
    pub fallback_log: Option<FallbackLog>,
}

/// The embeddable structured-log engine.
pub struct Logbook {
    storage: Arc<dyn QueryStorage>,
    ingester: Arc<Ingester>,
    fallback_log: Option<FallbackLog>,
    closed: std::sync::atomic::AtomicBool,
}

impl Logbook {
    /// Builds the engine and starts its background maintenance. Must be
    /// called within a tokio runtime.
    pub fn new(config: Config) -> Self {
        let storage: Arc<dyn QueryStorage> = config
            .storage
            .unwrap_or_else(|| Arc::new(NoopStorage));

        let ingester = Ingester::new(config.ingester, Arc::clone(&storage) as _);

        Self {
            storage,
            ingester,
            fallback_log: config.fallback_log,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Appends one record: instant, severity and an opaque encoded payload.
    /// For the in-memory expression builder to work, the payload must be an
    /// object-shaped encoding such as JSON.
    pub fn ingest(
        &self,
        time: DateTime<Utc>,
        level: i8,
        content: Vec<u8>,
    ) -> Result<(), IngestError> {
        self.ingester.ingest(time, level, content)
    }

    /// Bucketed severity counts over a time range.
    pub fn ticks(&self, input: &TicksInput) -> StorageResult<Output> {
        self.storage.ticks(input)
    }

    /// Keyset-paginated log entries.
    pub fn entries(&self, input: &EntriesInput) -> StorageResult<Output> {
        self.storage.entries(input)
    }

    /// Output of a scheduled task, `None` when the id is unknown.
    pub fn result(&self, task_id: i32) -> StorageResult<Option<Output>> {
        self.storage.result(task_id)
    }

    /// Cancels a scheduled task.
    pub fn cancel(&self, task_id: i32) -> StorageResult<()> {
        self.storage.cancel(task_id)
    }

    /// Drains the ring, closes the storage and stops the maintenance task.
    /// A second call returns [`IngestError::Closed`].
    pub async fn close(&self) -> Result<(), IngestError> {
        if !self.closed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            if let Some(fallback) = &self.fallback_log {
                fallback();
            }
        }
        self.ingester.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_defaults_to_noop_storage() {
        let log = Logbook::new(Config::default());

        log.ingest(Utc::now(), 0, br#"{"msg":"x"}"#.to_vec()).unwrap();
        let out = log.ticks(&TicksInput::default()).unwrap();
        assert!(out.ticks.is_empty());
        let out = log.entries(&EntriesInput::default()).unwrap();
        assert!(out.entries.is_empty());
        assert!(log.result(1).unwrap().is_none());
        log.cancel(1).unwrap();

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_invokes_fallback_once_and_is_idempotent() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let log = Logbook::new(Config {
            fallback_log: Some(Arc::new(move || {
                flag.store(true, Ordering::Relaxed);
            })),
            ..Default::default()
        });

        log.close().await.unwrap();
        assert!(called.load(Ordering::Relaxed));
        assert_eq!(log.close().await, Err(IngestError::Closed));
    }
}
