//! Ingest path: chunk ring and ingester
//!
//! Records enter through [`Ingester::ingest`], land in the current write
//! chunk, and are handed to the storage in whole chunks by the ingester's
//! background maintenance task.

pub mod chunk;
pub mod ingester;

pub use chunk::{Chunk, Entry, MAX_CHUNK_CAP};
pub use ingester::{Ingester, IngesterConfig, IngestError};
