//! # Logbook
//!
//! An embeddable, queryable structured-log engine. Application code emits
//! records; the engine ingests them on a low-latency hot path, batches them
//! into fixed-capacity chunks, and persists them in a fleet of time-sliced
//! SQLite databases (one per time window) that can be queried by time
//! bucket and by a compact search expression.
//!
//! ## Modules
//!
//! - [`ingest`]: chunk ring and ingester (the write hot path)
//! - [`expr`]: search-expression compiler over pluggable builders
//! - [`storage`]: storage contract, per-window SQLite databases, pool and
//!   scheduler
//! - [`query`]: query surface types (ticks, entries, task outputs)
//! - [`api`]: HTTP mapping of the query surface, built with Axum
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use logbook::{Config, Logbook};
//! use logbook::storage::{SqliteStorage, SqliteStorageConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = SqliteStorage::new(SqliteStorageConfig::new("./logs"))?;
//!     let log = Logbook::new(Config {
//!         storage: Some(storage as Arc<dyn logbook::QueryStorage>),
//!         ..Default::default()
//!     });
//!
//!     log.ingest(chrono::Utc::now(), 0, br#"{"msg":"hello"}"#.to_vec())?;
//!
//!     let out = log.entries(&logbook::EntriesInput {
//!         direction: "before".into(),
//!         ..Default::default()
//!     })?;
//!     println!("{} entries", out.entries.len());
//!
//!     log.close().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod engine;
pub mod expr;
pub mod ingest;
pub mod query;
pub mod storage;

pub use engine::{Config, FallbackLog, Logbook};
pub use expr::{ExprBuilder, ExprError};
pub use ingest::{Entry, IngestError, IngesterConfig};
pub use query::{EntriesInput, EntryRow, Output, Tick, TicksInput};
pub use storage::{
    NoopStorage, QueryStorage, SqliteStorage, SqliteStorageConfig, Storage, StorageError,
};
