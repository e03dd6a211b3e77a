//! Application configuration
//!
//! Plain JSON file loaded by the demo binary and mapped onto the core
//! configuration records. The core itself never reads the environment or
//! any ambient state; everything flows through these structs.

use crate::ingest::IngesterConfig;
use crate::storage::SqliteStorageConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address the HTTP API binds to.
    pub http_addr: String,
    /// Directory holding the window databases.
    pub data_dir: PathBuf,
    /// Database file name prefix.
    pub prefix: String,
    pub ingester: IngesterSettings,
    pub storage: StorageSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("./logs"),
            prefix: "logbook".to_string(),
            ingester: IngesterSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads the configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn ingester_config(&self) -> IngesterConfig {
        IngesterConfig {
            chunks: self.ingester.chunks,
            chunk_size: self.ingester.chunk_size,
            max_chunk_size_bytes: self.ingester.max_chunk_size_bytes,
            max_dirty_chunks: self.ingester.max_dirty_chunks,
            max_flush_retry: self.ingester.max_flush_retry,
            flush_after_sec: self.ingester.flush_after_sec,
            interval_check_ms: self.ingester.interval_check_ms,
        }
    }

    pub fn storage_config(&self) -> SqliteStorageConfig {
        SqliteStorageConfig {
            dir: self.data_dir.clone(),
            prefix: self.prefix.clone(),
            max_filesize_mb: self.storage.max_filesize_mb,
            total_size_cap_mb: self.storage.total_size_cap_mb,
            max_opened_db: self.storage.max_opened_db,
            max_running_tasks: self.storage.max_running_tasks,
            close_idle_sec: self.storage.close_idle_sec,
            max_chunk_age_sec: self.storage.max_chunk_age_sec,
            interval_size_check_sec: self.storage.interval_size_check_sec,
            interval_scheduled_tasks_ms: self.storage.interval_scheduled_tasks_ms,
            interval_wal_checkpoint_sec: self.storage.interval_wal_checkpoint_sec,
            ..Default::default()
        }
    }
}

/// Ingester section, mirroring [`IngesterConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngesterSettings {
    pub chunks: u32,
    pub chunk_size: u32,
    pub max_chunk_size_bytes: u64,
    pub max_dirty_chunks: u32,
    pub max_flush_retry: u32,
    pub flush_after_sec: i64,
    pub interval_check_ms: u64,
}

impl Default for IngesterSettings {
    fn default() -> Self {
        let defaults = IngesterConfig::default();
        Self {
            chunks: defaults.chunks,
            chunk_size: defaults.chunk_size,
            max_chunk_size_bytes: defaults.max_chunk_size_bytes,
            max_dirty_chunks: defaults.max_dirty_chunks,
            max_flush_retry: defaults.max_flush_retry,
            flush_after_sec: defaults.flush_after_sec,
            interval_check_ms: defaults.interval_check_ms,
        }
    }
}

/// Storage section, mirroring [`SqliteStorageConfig`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub max_filesize_mb: i64,
    pub total_size_cap_mb: i64,
    pub max_opened_db: i32,
    pub max_running_tasks: i32,
    pub close_idle_sec: i64,
    pub max_chunk_age_sec: i64,
    pub interval_size_check_sec: i64,
    pub interval_scheduled_tasks_ms: u64,
    pub interval_wal_checkpoint_sec: i64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let defaults = SqliteStorageConfig::default();
        Self {
            max_filesize_mb: defaults.max_filesize_mb,
            total_size_cap_mb: defaults.total_size_cap_mb,
            max_opened_db: defaults.max_opened_db,
            max_running_tasks: defaults.max_running_tasks,
            close_idle_sec: defaults.close_idle_sec,
            max_chunk_age_sec: defaults.max_chunk_age_sec,
            interval_size_check_sec: defaults.interval_size_check_sec,
            interval_scheduled_tasks_ms: defaults.interval_scheduled_tasks_ms,
            interval_wal_checkpoint_sec: defaults.interval_wal_checkpoint_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.http_addr, "127.0.0.1:8080");
        assert_eq!(config.ingester_config().chunk_size, 900);
        assert_eq!(config.storage_config().max_filesize_mb, 20);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "http_addr": "0.0.0.0:9000",
                "ingester": { "flush_after_sec": 1 },
                "storage": { "max_filesize_mb": 5 }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:9000");
        assert_eq!(config.ingester_config().flush_after_sec, 1);
        assert_eq!(config.storage_config().max_filesize_mb, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.storage_config().total_size_cap_mb, 1000);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load("/definitely/not/here.json").is_err());
    }
}
