//! Storage layer
//!
//! [`Storage`] is the persistence contract the ingester drives; a
//! [`QueryStorage`] additionally answers the query surface. The concrete
//! implementation is [`SqliteStorage`]: a fleet of time-sliced SQLite
//! databases (one per time window) with a fair scheduler for queries
//! against closed windows.

pub mod db;
pub mod entries;
pub mod error;
pub mod expr;
pub mod pool;
pub mod scheduler;
pub mod ticks;

pub use error::{StorageError, StorageResult};
pub use expr::{SqlExpr, SqlExprBuilder};
pub use pool::{SqliteStorage, SqliteStorageConfig, WalCheckpointMode};

use crate::ingest::Chunk;
use crate::query::{EntriesInput, Output, TicksInput};

/// Persistence contract driven by the ingester.
pub trait Storage: Send + Sync {
    /// Persists the published entries of one chunk. Must be transactional:
    /// either every entry lands or none does.
    fn flush(&self, chunk: &Chunk) -> StorageResult<()>;

    /// Releases resources. Called once, at the end of the ingester drain.
    fn close(&self) -> StorageResult<()>;
}

/// A storage that can also answer the query surface.
pub trait QueryStorage: Storage {
    fn ticks(&self, input: &TicksInput) -> StorageResult<Output>;
    fn entries(&self, input: &EntriesInput) -> StorageResult<Output>;
    /// Output of a finished or canceled task; `None` when the id is
    /// unknown.
    fn result(&self, task_id: i32) -> StorageResult<Option<Output>>;
    fn cancel(&self, task_id: i32) -> StorageResult<()>;
}

/// Storage that drops everything. Useful for tests and for running the
/// ingest path without persistence.
#[derive(Debug, Default)]
pub struct NoopStorage;

impl Storage for NoopStorage {
    fn flush(&self, _chunk: &Chunk) -> StorageResult<()> {
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl QueryStorage for NoopStorage {
    fn ticks(&self, _input: &TicksInput) -> StorageResult<Output> {
        Ok(Output::default())
    }

    fn entries(&self, _input: &EntriesInput) -> StorageResult<Output> {
        Ok(Output::default())
    }

    fn result(&self, _task_id: i32) -> StorageResult<Option<Output>> {
        Ok(None)
    }

    fn cancel(&self, _task_id: i32) -> StorageResult<()> {
        Ok(())
    }
}
