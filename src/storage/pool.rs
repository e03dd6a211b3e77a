//! Time-sliced storage pool
//!
//! [`SqliteStorage`] manages the fleet of per-window databases: flush
//! routing into the live windows, rotation when the live window outgrows
//! its size limit, demotion of stale live windows, removal of the oldest
//! archive when the pool exceeds its total size cap, and the periodic WAL
//! checkpoint. Scheduled-task processing lives in
//! [`scheduler`](crate::storage::scheduler).

use crate::expr::ExprCache;
use crate::ingest::Chunk;
use crate::query::{EntriesInput, Output, TicksInput};
use crate::storage::db::{scan_windows, WindowDb};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::expr::SqlExpr;
use crate::storage::scheduler::DbTask;
use crate::storage::{QueryStorage, Storage};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub use crate::storage::db::WalCheckpointMode;

/// Configuration for the SQLite storage pool. Zero values fall back to the
/// defaults on construction (except `interval_wal_checkpoint_sec`, where
/// zero disables the checkpoint loop).
#[derive(Debug, Clone)]
pub struct SqliteStorageConfig {
    /// Database folder.
    pub dir: PathBuf,
    /// Database file name prefix.
    pub prefix: String,
    /// A live window exceeding this is archived and a new one is started.
    pub max_filesize_mb: i64,
    /// Oldest archives are deleted once the pool exceeds this.
    pub total_size_cap_mb: i64,
    /// Maximum number of simultaneously open windows.
    pub max_opened_db: i32,
    /// Maximum concurrent scheduled-task executions.
    pub max_running_tasks: i32,
    /// Close windows idle for longer than this.
    pub close_idle_sec: i64,
    /// Entries older than this relative to a window's start are dropped on
    /// flush; live windows whose end falls this far behind are demoted.
    pub max_chunk_age_sec: i64,
    /// Size-check loop interval.
    pub interval_size_check_sec: i64,
    /// Scheduled-tasks loop interval.
    pub interval_scheduled_tasks_ms: u64,
    /// WAL checkpoint loop interval; zero disables the loop.
    pub interval_wal_checkpoint_sec: i64,
    pub wal_checkpoint_mode: WalCheckpointMode,
}

impl Default for SqliteStorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./logs"),
            prefix: "logbook".to_string(),
            max_filesize_mb: 20,
            total_size_cap_mb: 1000,
            max_opened_db: 8,
            max_running_tasks: 500,
            close_idle_sec: 30,
            max_chunk_age_sec: 3600,
            interval_size_check_sec: 5,
            interval_scheduled_tasks_ms: 100,
            interval_wal_checkpoint_sec: 9,
            wal_checkpoint_mode: WalCheckpointMode::Truncate,
        }
    }
}

impl SqliteStorageConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        let prefix = self.prefix.trim();
        self.prefix = if prefix.is_empty() {
            defaults.prefix
        } else {
            prefix
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("_")
                .to_lowercase()
        };
        if self.max_filesize_mb <= 0 {
            self.max_filesize_mb = defaults.max_filesize_mb;
        }
        if self.total_size_cap_mb <= 0 {
            self.total_size_cap_mb = defaults.total_size_cap_mb;
        }
        if self.max_opened_db <= 0 {
            self.max_opened_db = defaults.max_opened_db;
        }
        if self.max_running_tasks <= 0 {
            self.max_running_tasks = defaults.max_running_tasks;
        }
        if self.close_idle_sec <= 0 {
            self.close_idle_sec = defaults.close_idle_sec;
        }
        if self.max_chunk_age_sec <= 0 {
            self.max_chunk_age_sec = defaults.max_chunk_age_sec;
        }
        if self.interval_size_check_sec <= 0 {
            self.interval_size_check_sec = defaults.interval_size_check_sec;
        }
        if self.interval_scheduled_tasks_ms == 0 {
            self.interval_scheduled_tasks_ms = defaults.interval_scheduled_tasks_ms;
        }
        self
    }
}

struct PoolState {
    /// All known windows, live first, then archives newest first.
    dbs: Vec<Arc<WindowDb>>,
    /// Windows still accepting flushes.
    live: Vec<Arc<WindowDb>>,
}

/// Time-sliced SQLite storage: one database per time window.
pub struct SqliteStorage {
    pub(crate) config: SqliteStorageConfig,
    state: Mutex<PoolState>,
    pub(crate) tasks: Mutex<HashMap<i32, Arc<DbTask>>>,
    pub(crate) task_seq: AtomicI32,
    pub(crate) active_tasks: AtomicI32,
    pub(crate) expr_cache: ExprCache<Arc<SqlExpr>>,
    quit: watch::Sender<bool>,
}

impl SqliteStorage {
    /// Reconstructs the pool from the data directory (creating it and a
    /// first live window if needed) and spawns the maintenance loops. Must
    /// be called within a tokio runtime.
    pub fn new(config: SqliteStorageConfig) -> StorageResult<Arc<Self>> {
        let config = config.normalized();

        let mut dbs = scan_windows(&config.dir, &config.prefix, config.max_chunk_age_sec)?;

        // The highest-start window is re-opened live; an empty directory
        // starts with a fresh one.
        let live = match dbs.iter().max_by_key(|d| d.epoch_start()) {
            Some(db) => Arc::clone(db),
            None => {
                let db = Arc::new(WindowDb::create(
                    &config.dir,
                    &config.prefix,
                    Utc::now().timestamp(),
                    config.max_chunk_age_sec,
                ));
                dbs.push(Arc::clone(&db));
                db
            }
        };
        live.connect()?;
        live.set_live(true);

        sort_windows(&mut dbs);

        let (quit_tx, quit_rx) = watch::channel(false);
        let storage = Arc::new(Self {
            config,
            state: Mutex::new(PoolState {
                dbs,
                live: vec![live],
            }),
            tasks: Mutex::new(HashMap::new()),
            task_seq: AtomicI32::new(0),
            active_tasks: AtomicI32::new(0),
            expr_cache: ExprCache::new(),
            quit: quit_tx,
        });

        tokio::spawn(Self::routine_size_check(
            Arc::clone(&storage),
            quit_rx.clone(),
        ));
        tokio::spawn(Self::routine_scheduled_tasks(
            Arc::clone(&storage),
            quit_rx.clone(),
        ));
        if storage.config.interval_wal_checkpoint_sec > 0 {
            tokio::spawn(Self::routine_wal_checkpoint(Arc::clone(&storage), quit_rx));
        }

        Ok(storage)
    }

    /// Snapshot of every known window.
    pub(crate) fn windows(&self) -> Vec<Arc<WindowDb>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dbs
            .clone()
    }

    /// Snapshot of the live windows.
    pub(crate) fn live_windows(&self) -> Vec<Arc<WindowDb>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .live
            .clone()
    }

    pub(crate) fn sort_pool(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        sort_windows(&mut state.dbs);
        sort_windows(&mut state.live);
    }

    /// Compiles the search expression with the relational builder, through
    /// the cache.
    pub(crate) fn compile_expr(&self, expression: &str) -> StorageResult<Arc<SqlExpr>> {
        Ok(self.expr_cache.get_or_compile(expression, || {
            ArcSqlBuilder(crate::storage::expr::SqlExprBuilder::new())
        })?)
    }

    async fn routine_size_check(storage: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            storage.config.interval_size_check_sec as u64,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => storage.run_size_check(),
                _ = quit.changed() => return,
            }
        }
    }

    async fn routine_scheduled_tasks(storage: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(
            storage.config.interval_scheduled_tasks_ms,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => storage.run_scheduled_tick(),
                _ = quit.changed() => return,
            }
        }
    }

    async fn routine_wal_checkpoint(storage: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            storage.config.interval_wal_checkpoint_sec as u64,
        ));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    for db in storage.live_windows() {
                        db.checkpoint(storage.config.wal_checkpoint_mode);
                    }
                }
                _ = quit.changed() => return,
            }
        }
    }

    /// One size-check pass: rotate an oversized live window, demote live
    /// windows that fell too far behind, enforce the total size cap.
    pub(crate) fn run_size_check(self: &Arc<Self>) {
        let live = self.live_windows();

        for db in &live {
            if let Err(err) = db.update_size() {
                tracing::warn!(db = %db.file_path().display(), error = %err, "error reading database size");
            }
        }

        // Rotate the newest live window once it outgrows the limit. The new
        // window starts slightly in the future so in-flight flushes keep
        // landing in the old one.
        if let Some(current) = live.last() {
            if current.size() > self.config.max_filesize_mb * 1_000_000 {
                let next_start =
                    Utc::now().timestamp() + self.config.interval_size_check_sec * 2;
                let next = Arc::new(WindowDb::create(
                    &self.config.dir,
                    &self.config.prefix,
                    next_start,
                    self.config.max_chunk_age_sec,
                ));
                next.set_live(true);
                match next.connect() {
                    Ok(()) => {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.dbs.push(Arc::clone(&next));
                        state.live.push(next);
                        sort_windows(&mut state.dbs);
                    }
                    Err(err) => {
                        tracing::warn!(
                            db = %next.file_path().display(),
                            error = %err,
                            "error creating live database"
                        );
                    }
                }
            }
        }

        // Demote live windows whose newest entry is too old to receive
        // flushes anymore; the scheduler may then close them.
        let live = self.live_windows();
        let stale_end = Utc::now().timestamp() - self.config.max_chunk_age_sec;
        let (fresh, stale): (Vec<_>, Vec<_>) = live
            .iter()
            .cloned()
            .partition(|d| d.epoch_end() == 0 || d.epoch_end() >= stale_end);
        if !fresh.is_empty() && !stale.is_empty() && live.len() > 1 {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.live = fresh;
            for db in &stale {
                db.set_live(false);
            }
        }

        // Total size cap: drop the oldest archived window.
        let dbs = self.windows();
        let total: i64 = dbs.iter().map(|d| d.size()).sum();
        if total > self.config.total_size_cap_mb * 1_000_000 {
            let oldest = dbs
                .iter()
                .filter(|d| !d.is_live())
                .min_by_key(|d| match d.epoch_end() {
                    0 => d.epoch_start(),
                    end => end,
                })
                .cloned();
            if let Some(oldest) = oldest {
                tracing::warn!(
                    db = %oldest.file_path().display(),
                    "total size cap exceeded, removing oldest archive"
                );
                oldest.remove();
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.dbs.retain(|d| !Arc::ptr_eq(d, &oldest));
            }
        }
    }
}

impl Storage for SqliteStorage {
    /// Routes the chunk to the first live window covering its time range,
    /// falling back to the newest live window.
    fn flush(&self, chunk: &Chunk) -> StorageResult<()> {
        let (Some(first), Some(last)) = (chunk.first_epoch(), chunk.last_epoch()) else {
            return Ok(());
        };

        let live = self.live_windows();
        let db = live
            .iter()
            .find(|d| {
                d.epoch_start() <= first && (d.epoch_end() == 0 || d.epoch_end() >= last)
            })
            .or_else(|| live.last())
            .ok_or(StorageError::Closed)?;

        if !db.is_open() {
            return Err(StorageError::Closed);
        }

        db.flush(chunk)
    }

    fn close(&self) -> StorageResult<()> {
        let _ = self.quit.send(true);
        for db in self.windows() {
            db.close();
        }
        Ok(())
    }
}

impl QueryStorage for SqliteStorage {
    fn ticks(&self, input: &TicksInput) -> StorageResult<Output> {
        self.query_ticks(input)
    }

    fn entries(&self, input: &EntriesInput) -> StorageResult<Output> {
        self.query_entries(input)
    }

    fn result(&self, task_id: i32) -> StorageResult<Option<Output>> {
        Ok(self.task_result(task_id))
    }

    fn cancel(&self, task_id: i32) -> StorageResult<()> {
        self.task_cancel(task_id);
        Ok(())
    }
}

/// Pool order: live windows first (start ascending), then archives by end
/// descending.
fn sort_windows(dbs: &mut [Arc<WindowDb>]) {
    dbs.sort_by(|a, b| match (a.epoch_end(), b.epoch_end()) {
        (0, 0) => a.epoch_start().cmp(&b.epoch_start()),
        (0, _) => std::cmp::Ordering::Less,
        (_, 0) => std::cmp::Ordering::Greater,
        (ae, be) => be.cmp(&ae),
    });
}

/// Adapter so the cache can hand out `Arc<SqlExpr>` clones.
struct ArcSqlBuilder(crate::storage::expr::SqlExprBuilder);

impl crate::expr::ExprBuilder for ArcSqlBuilder {
    type Expr = Arc<SqlExpr>;

    fn group_start(&mut self) {
        self.0.group_start();
    }

    fn group_end(&mut self) {
        self.0.group_end();
    }

    fn operator(&mut self, op: crate::expr::LogicalOp) {
        self.0.operator(op);
    }

    fn text(&mut self, field: &str, term: &str, sequence: bool, wildcard: bool) {
        self.0.text(field, term, sequence, wildcard);
    }

    fn number(&mut self, field: &str, cmp: crate::expr::NumberCmp, value: f64) {
        self.0.number(field, cmp, value);
    }

    fn between(&mut self, field: &str, low: f64, high: f64) {
        self.0.between(field, low, high);
    }

    fn text_in(&mut self, field: &str, values: Vec<String>) {
        self.0.text_in(field, values);
    }

    fn number_in(&mut self, field: &str, values: Vec<f64>) {
        self.0.number_in(field, values);
    }

    fn build(self) -> Arc<SqlExpr> {
        Arc::new(self.0.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Entry;
    use tempfile::tempdir;

    fn chunk_of(contents: &[&str]) -> Arc<Chunk> {
        let chunk = Arc::new(Chunk::new(0, contents.len() as u32));
        for c in contents {
            chunk.put(Entry::new(Utc::now(), 0, c.as_bytes().to_vec()));
        }
        chunk
    }

    #[tokio::test]
    async fn test_new_creates_live_window() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();

        let live = storage.live_windows();
        assert_eq!(live.len(), 1);
        assert!(live[0].is_open());
        assert!(live[0].is_live());
    }

    #[tokio::test]
    async fn test_flush_lands_in_live_window() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();

        let chunk = chunk_of(&[r#"{"msg":"a"}"#, r#"{"msg":"b"}"#]);
        storage.flush(&chunk).unwrap();

        let live = storage.live_windows();
        let count = live[0]
            .query_rows("SELECT COUNT(*) FROM entries", &[], |row| {
                row.get::<_, i64>(0)
            })
            .unwrap();
        assert_eq!(count, vec![2]);

        storage.close().unwrap();
    }

    #[tokio::test]
    async fn test_pool_reconstructed_from_directory() {
        let dir = tempdir().unwrap();
        {
            let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();
            storage.flush(&chunk_of(&[r#"{"msg":"persisted"}"#])).unwrap();
            storage.close().unwrap();
        }

        let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();
        let dbs = storage.windows();
        assert_eq!(dbs.len(), 1);
        assert!(storage.live_windows()[0].is_open());
        storage.close().unwrap();
    }

    #[tokio::test]
    async fn test_size_check_rotates_oversized_live_window() {
        let dir = tempdir().unwrap();
        let mut config = SqliteStorageConfig::new(dir.path());
        config.max_filesize_mb = 1;
        // Keep the loops quiet; ticks are driven manually below.
        config.interval_size_check_sec = 3600;
        let storage = SqliteStorage::new(config).unwrap();

        // ~2MB of content.
        let payload = format!(r#"{{"msg":"{}"}}"#, "x".repeat(2048));
        for _ in 0..1024 {
            storage.flush(&chunk_of(&[payload.as_str()])).unwrap();
        }

        storage.run_size_check();

        let live = storage.live_windows();
        assert_eq!(live.len(), 2, "an oversized live window should rotate");
        assert_eq!(storage.windows().len(), 2);

        storage.close().unwrap();
    }

    fn chunk_at(entries: Vec<Entry>) -> Arc<Chunk> {
        let chunk = Arc::new(Chunk::new(0, entries.len() as u32));
        for e in entries {
            chunk.put(e);
        }
        chunk
    }

    async fn wait_for_output(
        storage: &Arc<SqliteStorage>,
        task_id: i32,
        max: Duration,
    ) -> Option<Output> {
        let deadline = tokio::time::Instant::now() + max;
        while tokio::time::Instant::now() < deadline {
            match storage.task_result(task_id) {
                Some(out) if !out.scheduled => return Some(out),
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        None
    }

    /// Lays an already-archived window with three old entries plus an empty
    /// live-form file on disk, then reconstructs the pool from it.
    fn seed_archived_window(dir: &std::path::Path) -> (i64, i64) {
        let old_start = Utc::now().timestamp() - 10_000;

        let archived = WindowDb::create(dir, "logbook", old_start, 3600);
        archived.connect().unwrap();
        let entries: Vec<Entry> = (0..3)
            .map(|i| {
                Entry::new(
                    chrono::DateTime::from_timestamp(old_start + 1 + i, 0).unwrap(),
                    if i == 2 { 8 } else { 0 },
                    format!(r#"{{"msg":"archived {i}"}}"#).into_bytes(),
                )
            })
            .collect();
        archived.flush(&chunk_at(entries)).unwrap();
        let old_end = archived.epoch_end();
        assert!(archived.close());

        let live = WindowDb::create(dir, "logbook", Utc::now().timestamp(), 3600);
        live.connect().unwrap();
        assert!(live.close());

        (old_start, old_end)
    }

    #[tokio::test]
    async fn test_entries_pagination_across_directions() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();

        let now = Utc::now();
        let entries: Vec<Entry> = (0..3)
            .map(|i| {
                Entry::new(
                    now - chrono::Duration::seconds(3 - i),
                    0,
                    format!(r#"{{"msg":"row {i}"}}"#).into_bytes(),
                )
            })
            .collect();
        storage.flush(&chunk_at(entries)).unwrap();

        // Newest first when paging into the past.
        let out = storage
            .query_entries(&EntriesInput {
                direction: "before".into(),
                epoch_start: now.timestamp() + 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(out.entries.len(), 3);
        let epochs: Vec<i64> = out.entries.iter().map(|e| e.0).collect();
        assert!(epochs.windows(2).all(|w| w[0] >= w[1]));
        assert!(out.entries[0].3.contains("row 2"));

        // Oldest first when paging forward.
        let out = storage
            .query_entries(&EntriesInput {
                direction: "after".into(),
                epoch_start: now.timestamp() - 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(out.entries.len(), 3);
        let epochs: Vec<i64> = out.entries.iter().map(|e| e.0).collect();
        assert!(epochs.windows(2).all(|w| w[0] <= w[1]));

        // An expression narrows the page.
        let out = storage
            .query_entries(&EntriesInput {
                expr: r#""row 1""#.into(),
                direction: "before".into(),
                epoch_start: now.timestamp() + 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(out.entries.len(), 1);

        storage.close().unwrap();
    }

    #[tokio::test]
    async fn test_entries_on_closed_window_schedules_task() {
        let dir = tempdir().unwrap();
        let (old_start, _) = seed_archived_window(dir.path());

        let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();
        assert_eq!(storage.windows().len(), 2);

        let out = storage
            .query_entries(&EntriesInput {
                direction: "before".into(),
                epoch_start: Utc::now().timestamp() + 10,
                ..Default::default()
            })
            .unwrap();
        assert!(out.scheduled, "closed window should schedule a task");
        assert_eq!(out.task_ids.len(), 1);
        assert!(out.entries.is_empty());

        // While the task is pending, result keeps reporting it scheduled.
        let task_id = out.task_ids[0];
        let resolved = wait_for_output(&storage, task_id, Duration::from_secs(5))
            .await
            .expect("scheduled task should finish");
        assert_eq!(resolved.entries.len(), 3);
        assert!(resolved.entries.iter().all(|e| e.0 >= old_start));

        // The task is gone once its output was retrieved.
        assert!(storage.task_result(task_id).is_none());

        storage.close().unwrap();
    }

    #[tokio::test]
    async fn test_ticks_counts_by_severity() {
        let dir = tempdir().unwrap();
        let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();

        let now = Utc::now();
        let entries: Vec<Entry> = [-1i8, 0, 4, 8]
            .into_iter()
            .map(|level| Entry::new(now, level, br#"{"msg":"tick"}"#.to_vec()))
            .collect();
        storage.flush(&chunk_at(entries)).unwrap();

        let out = storage
            .query_ticks(&TicksInput {
                epoch_end: now.timestamp() + 5,
                interval_sec: 60,
                max_result: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(!out.scheduled);
        assert_eq!(out.ticks.len(), 1);
        let tick = &out.ticks[0];
        assert_eq!(tick.count, 4);
        assert_eq!(
            (tick.debug, tick.info, tick.warn, tick.error),
            (1, 1, 1, 1)
        );

        // Restricting to errors drops the other severities from the count.
        let out = storage
            .query_ticks(&TicksInput {
                level: vec!["error".into()],
                epoch_end: now.timestamp() + 5,
                interval_sec: 60,
                max_result: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(out.ticks[0].count, 1);

        storage.close().unwrap();
    }

    #[tokio::test]
    async fn test_ticks_schedules_closed_windows() {
        let dir = tempdir().unwrap();
        let (old_start, _) = seed_archived_window(dir.path());

        let storage = SqliteStorage::new(SqliteStorageConfig::new(dir.path())).unwrap();

        let out = storage
            .query_ticks(&TicksInput {
                epoch_end: old_start + 600,
                interval_sec: 60,
                max_result: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(out.scheduled);
        assert_eq!(out.task_ids.len(), 1);

        let resolved = wait_for_output(&storage, out.task_ids[0], Duration::from_secs(5))
            .await
            .expect("scheduled ticks task should finish");
        let total: i64 = resolved.ticks.iter().map(|t| t.count).sum();
        assert_eq!(total, 3);

        storage.close().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_drops_scheduled_task() {
        let dir = tempdir().unwrap();
        seed_archived_window(dir.path());

        let mut config = SqliteStorageConfig::new(dir.path());
        // Freeze the scheduler so the cancel always wins the race.
        config.interval_scheduled_tasks_ms = 3_600_000;
        let storage = SqliteStorage::new(config).unwrap();

        let out = storage
            .query_entries(&EntriesInput {
                direction: "before".into(),
                epoch_start: Utc::now().timestamp() + 10,
                ..Default::default()
            })
            .unwrap();
        assert!(out.scheduled);
        let task_id = out.task_ids[0];

        let pending = storage.task_result(task_id).unwrap();
        assert!(pending.scheduled);

        storage.task_cancel(task_id);
        assert!(storage.task_result(task_id).is_none());

        storage.close().unwrap();
    }

    #[tokio::test]
    async fn test_sort_windows_orders_live_first_then_newest_archive() {
        let a = Arc::new(WindowDb::create("/tmp", "logbook", 100, 3600));
        let b = Arc::new(WindowDb::create("/tmp", "logbook", 50, 3600));
        let c = Arc::new(WindowDb::create("/tmp", "logbook", 10, 3600));
        // b and c are archived.
        b.epoch_end_store_for_test(90);
        c.epoch_end_store_for_test(40);

        let mut dbs = vec![c.clone(), a.clone(), b.clone()];
        sort_windows(&mut dbs);

        assert_eq!(dbs[0].epoch_start(), 100); // live
        assert_eq!(dbs[1].epoch_start(), 50); // newest archive
        assert_eq!(dbs[2].epoch_start(), 10); // oldest archive
    }
}
