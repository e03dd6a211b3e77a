//! Per-window database
//!
//! One SQLite file per time window. The file name encodes the window's
//! coverage: `<prefix>_<epochStart>.db` while live, renamed to
//! `<prefix>_<epochStart>_<epochEnd>.db` when the window closes, so the
//! whole pool can be reconstructed from a directory scan on startup.
//!
//! Lifecycle: Closed -> Loading -> Open -> Closing -> Closed, plus the
//! terminal Closed -> Removing. Transitions are CAS'd on an atomic status,
//! so exactly one thread performs each one.

use crate::ingest::Chunk;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::scheduler::DbTask;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

// SQLite tuning follows the usual write-heavy recipe: WAL journaling,
// relaxed synchronous, a larger page cache.
const SQL_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = 409600;
    PRAGMA temp_store = MEMORY;
";

const SQL_CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS entries (
    epoch_secs LONG,
    nanos INTEGER,
    level INTEGER,
    content BLOB
)";

const SQL_CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS entries_epoch_desc ON entries(epoch_secs DESC)";

const SQL_INSERT: &str = "INSERT INTO entries(epoch_secs, nanos, level, content) VALUES ";

const DB_CLOSED: u8 = 0;
const DB_LOADING: u8 = 1;
const DB_OPEN: u8 = 2;
const DB_CLOSING: u8 = 3;
const DB_REMOVING: u8 = 4;

/// WAL checkpoint modes, see <https://www.sqlite.org/wal.html#ckpt>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalCheckpointMode {
    Passive,
    Full,
    Restart,
    #[default]
    Truncate,
}

impl WalCheckpointMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalCheckpointMode::Passive => "PASSIVE",
            WalCheckpointMode::Full => "FULL",
            WalCheckpointMode::Restart => "RESTART",
            WalCheckpointMode::Truncate => "TRUNCATE",
        }
    }
}

/// A single time-window SQLite database.
pub struct WindowDb {
    status: AtomicU8,
    /// Still accepting flushes.
    live: AtomicBool,
    /// File size in bytes, freelist excluded.
    size: AtomicI64,
    /// Epoch (seconds) of the window start.
    epoch_start: AtomicI64,
    /// Lowered when a flush carries entries older than `epoch_start`; the
    /// file is renamed on close to reflect it.
    new_epoch_start: AtomicI64,
    /// Epoch (seconds) of the newest flushed entry; 0 while unknown.
    epoch_end: AtomicI64,
    /// Last flush/connect instant. Queries deliberately do not refresh
    /// this, so external query traffic cannot keep a window live.
    last_used_epoch: AtomicI64,
    /// Flushed entries older than `epoch_start - max_chunk_age_sec` are
    /// discarded as too late.
    max_chunk_age_sec: i64,
    file_dir: PathBuf,
    file_prefix: String,
    file_path: Mutex<PathBuf>,
    conn: Mutex<Option<Connection>>,
    task_count: AtomicI32,
    tasks: Mutex<HashMap<i32, Arc<DbTask>>>,
}

impl WindowDb {
    /// A fresh live-window candidate starting at `epoch_start`.
    pub fn create(
        dir: impl Into<PathBuf>,
        prefix: &str,
        epoch_start: i64,
        max_chunk_age_sec: i64,
    ) -> Self {
        let dir = dir.into();
        let path = dir.join(format!("{prefix}_{epoch_start}.db"));
        Self {
            status: AtomicU8::new(DB_CLOSED),
            live: AtomicBool::new(false),
            size: AtomicI64::new(0),
            epoch_start: AtomicI64::new(epoch_start),
            new_epoch_start: AtomicI64::new(epoch_start),
            epoch_end: AtomicI64::new(0),
            last_used_epoch: AtomicI64::new(0),
            max_chunk_age_sec,
            file_dir: dir,
            file_prefix: prefix.to_string(),
            file_path: Mutex::new(path),
            conn: Mutex::new(None),
            task_count: AtomicI32::new(0),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Reconstructs a window from an existing file name.
    pub fn open_existing(
        dir: &Path,
        prefix: &str,
        file_name: &str,
        size: i64,
        max_chunk_age_sec: i64,
    ) -> StorageResult<Self> {
        let (epoch_start, epoch_end) = parse_window_name(prefix, file_name)
            .ok_or_else(|| StorageError::InvalidFileName(file_name.to_string()))?;
        let db = Self::create(dir, prefix, epoch_start, max_chunk_age_sec);
        db.epoch_end.store(epoch_end, Ordering::Release);
        db.size.store(size, Ordering::Release);
        *db.file_path.lock().unwrap_or_else(|e| e.into_inner()) = dir.join(file_name);
        Ok(db)
    }

    pub fn is_open(&self) -> bool {
        self.status.load(Ordering::Acquire) == DB_OPEN
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn epoch_start(&self) -> i64 {
        self.epoch_start.load(Ordering::Acquire)
    }

    /// 0 while the window has not flushed anything.
    pub fn epoch_end(&self) -> i64 {
        self.epoch_end.load(Ordering::Acquire)
    }

    pub fn size(&self) -> i64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn file_path(&self) -> PathBuf {
        self.file_path
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Seconds since this window was last flushed into (or connected).
    pub fn last_used_sec(&self) -> i64 {
        Utc::now().timestamp() - self.last_used_epoch.load(Ordering::Acquire)
    }

    /// Establishes the connection, ensuring the schema. Requires `Closed`;
    /// any other status is a no-op.
    pub fn connect(&self) -> StorageResult<()> {
        if self
            .status
            .compare_exchange(DB_CLOSED, DB_LOADING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let open = || -> StorageResult<Connection> {
            let conn = Connection::open(self.file_path())?;
            conn.execute_batch(SQL_PRAGMAS)?;
            conn.execute(SQL_CREATE_TABLE, [])?;
            conn.execute(SQL_CREATE_INDEX, [])?;
            Ok(conn)
        };

        match open() {
            Ok(conn) => {
                *self.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(conn);
                self.last_used_epoch
                    .store(Utc::now().timestamp(), Ordering::Release);
                self.status.store(DB_OPEN, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                self.status.store(DB_CLOSED, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Persists the chunk's published entries in one transaction, dropping
    /// entries that arrive later than the window tolerates.
    pub fn flush(&self, chunk: &Chunk) -> StorageResult<()> {
        let oldest_accepted = self.epoch_start() - self.max_chunk_age_sec;

        let mut sql = String::with_capacity(2048);
        sql.push_str(SQL_INSERT);

        let mut values: Vec<Value> = Vec::new();
        let mut rows = 0usize;
        for entry in chunk.list() {
            let epoch = entry.time.timestamp();
            if epoch < oldest_accepted {
                continue;
            }
            if rows > 0 {
                sql.push(',');
            }
            sql.push_str("(?,?,?,?)");
            values.push(Value::Integer(epoch));
            values.push(Value::Integer(entry.time.timestamp_subsec_nanos() as i64));
            values.push(Value::Integer(entry.level as i64));
            values.push(Value::Blob(entry.content.clone()));
            rows += 1;
        }

        if rows == 0 {
            tracing::warn!("trying to flush a chunk with no persistable entries");
            return Ok(());
        }

        {
            let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let conn = guard.as_mut().ok_or(StorageError::Closed)?;
            let tx = conn.transaction()?;
            tx.execute(&sql, params_from_iter(values))?;
            tx.commit()?;
        }

        if let Some(last) = chunk.last_epoch() {
            self.epoch_end.fetch_max(last, Ordering::AcqRel);
        }
        if let Some(first) = chunk.first_epoch() {
            self.new_epoch_start.fetch_min(first, Ordering::AcqRel);
        }
        self.last_used_epoch
            .store(Utc::now().timestamp(), Ordering::Release);

        Ok(())
    }

    /// Prepares and runs a query, mapping each row. Does not refresh
    /// `last_used_epoch`.
    pub fn query_rows<T>(
        &self,
        sql: &str,
        params: &[Value],
        mut map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    ) -> StorageResult<Vec<T>> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let conn = guard.as_ref().ok_or(StorageError::Closed)?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter().cloned()), |row| map(row))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Collapses the WAL back into the main file.
    pub fn checkpoint(&self, mode: WalCheckpointMode) {
        if !self.is_open() {
            return;
        }
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = guard.as_ref() {
            if let Err(err) =
                conn.execute_batch(&format!("PRAGMA wal_checkpoint({})", mode.as_str()))
            {
                tracing::warn!(db = %self.file_path().display(), error = %err, "wal checkpoint failed");
            }
        }
    }

    /// Recomputes the database size from the page and freelist counts.
    pub fn update_size(&self) -> StorageResult<()> {
        let sizes = self.query_rows(
            "SELECT page_count * page_size AS total_size,
                    freelist_count * page_size AS freelist_size
             FROM pragma_page_count(), pragma_freelist_count(), pragma_page_size()",
            &[],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        if let Some((total, freelist)) = sizes.first() {
            self.size.store(total - freelist, Ordering::Release);
        }
        Ok(())
    }

    /// Refuses to close a window that was used within the last 2 seconds.
    pub fn close_safe(&self) -> bool {
        if self.last_used_sec() < 2 {
            return false;
        }
        self.close()
    }

    /// Closes the connection. A live window is vacuumed first, and the file
    /// is renamed to carry its observed coverage. Returns whether the
    /// window is closed afterwards.
    pub fn close(&self) -> bool {
        if self
            .status
            .compare_exchange(DB_OPEN, DB_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            {
                let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(conn) = guard.take() {
                    if self.is_live() {
                        if let Err(err) = conn.execute_batch("VACUUM") {
                            tracing::warn!(
                                db = %self.file_path().display(),
                                error = %err,
                                "vacuum failed while closing"
                            );
                        }
                    }
                }
            }

            self.rename_to_coverage();
            self.status.store(DB_CLOSED, Ordering::Release);
        }
        self.status.load(Ordering::Acquire) == DB_CLOSED
    }

    /// Renames the file so its name reflects the window's true coverage.
    /// A failure is logged; the close proceeds regardless.
    fn rename_to_coverage(&self) {
        let start = self
            .new_epoch_start
            .load(Ordering::Acquire)
            .min(self.epoch_start());
        let end = self.epoch_end();

        let name = if end > 0 {
            format!("{}_{}_{}.db", self.file_prefix, start, end)
        } else {
            format!("{}_{}.db", self.file_prefix, start)
        };
        let new_path = self.file_dir.join(name);

        let mut path = self.file_path.lock().unwrap_or_else(|e| e.into_inner());
        if *path == new_path {
            return;
        }
        match std::fs::rename(&*path, &new_path) {
            Ok(()) => {
                self.epoch_start.store(start, Ordering::Release);
                *path = new_path;
            }
            Err(err) => {
                tracing::warn!(
                    from = %path.display(),
                    to = %new_path.display(),
                    error = %err,
                    "error renaming database"
                );
            }
        }
    }

    /// Closes and deletes the database file. Terminal.
    pub fn remove(&self) {
        if self.close()
            && self
                .status
                .compare_exchange(DB_CLOSED, DB_REMOVING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let path = self.file_path();
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(db = %path.display(), error = %err, "error removing database");
            }
        }
    }

    // ---- scheduled-task bookkeeping -------------------------------------

    pub fn schedule_task(&self, id: i32, task: Arc<DbTask>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, task);
        self.task_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn cancel_task(&self, id: i32) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            self.task_count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn task_count(&self) -> i32 {
        self.task_count.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn epoch_end_store_for_test(&self, epoch_end: i64) {
        self.epoch_end.store(epoch_end, Ordering::Release);
    }

    /// Removes and returns up to `max` scheduled tasks for execution.
    pub fn take_tasks(&self, max: i32) -> Vec<(i32, Arc<DbTask>)> {
        if max <= 0 {
            return Vec::new();
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<i32> = tasks.keys().take(max as usize).copied().collect();
        let taken: Vec<(i32, Arc<DbTask>)> = ids
            .into_iter()
            .filter_map(|id| tasks.remove(&id).map(|t| (id, t)))
            .collect();
        self.task_count
            .fetch_sub(taken.len() as i32, Ordering::AcqRel);
        taken
    }
}

impl std::fmt::Debug for WindowDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowDb")
            .field("file", &self.file_path())
            .field("status", &self.status.load(Ordering::Relaxed))
            .field("live", &self.is_live())
            .field("epoch_start", &self.epoch_start())
            .field("epoch_end", &self.epoch_end())
            .finish()
    }
}

/// Parses `<prefix>_<epochStart>[_<epochEnd>].db`; `epoch_end` is 0 for the
/// single-epoch live form.
pub fn parse_window_name(prefix: &str, file_name: &str) -> Option<(i64, i64)> {
    let epochs = file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(".db")?;

    match epochs.split_once('_') {
        Some((start, end)) => Some((start.parse().ok()?, end.parse().ok()?)),
        None => Some((epochs.parse().ok()?, 0)),
    }
}

/// Scans `dir` and reconstructs every window whose file name matches the
/// prefix. Unparseable names are skipped with a warning.
pub fn scan_windows(
    dir: &Path,
    prefix: &str,
    max_chunk_age_sec: i64,
) -> StorageResult<Vec<Arc<WindowDb>>> {
    std::fs::create_dir_all(dir)?;

    let mut dbs = Vec::new();
    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) || !name.ends_with(".db") {
            continue;
        }

        let size = dir_entry.metadata().map(|m| m.len() as i64).unwrap_or(0);
        match WindowDb::open_existing(dir, prefix, &name, size, max_chunk_age_sec) {
            Ok(db) => dbs.push(Arc::new(db)),
            Err(err) => {
                tracing::warn!(file = %name, error = %err, "skipping invalid database name");
            }
        }
    }

    Ok(dbs)
}
