//! Scheduled query tasks
//!
//! Queries that hit a closed window are not answered synchronously; they
//! become [`DbTask`]s attached to that window. A background loop shares an
//! execution budget across open windows, opens closed windows that have
//! pending work, and closes idle or over-budget ones.
//!
//! Task states move Created -> Processing -> Finished; Canceled is
//! reachable from Created or Processing. A task whose window closes
//! mid-flight reverts to Created and is rescheduled.

use crate::query::Output;
use crate::storage::db::WindowDb;
use crate::storage::error::StorageResult;
use crate::storage::pool::SqliteStorage;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const TASK_CREATED: u8 = 0;
const TASK_PROCESSING: u8 = 1;
const TASK_FINISHED: u8 = 2;
const TASK_CANCELED: u8 = 3;

/// Work a task runs against its window once the window is open.
pub type TaskCallback = Arc<dyn Fn(&WindowDb) -> StorageResult<Output> + Send + Sync>;

/// One scheduled query against one window.
pub struct DbTask {
    pub(crate) db: Arc<WindowDb>,
    state: AtomicU8,
    output: Mutex<Output>,
    pub(crate) callback: TaskCallback,
}

impl DbTask {
    pub fn new(db: Arc<WindowDb>, callback: TaskCallback) -> Self {
        Self {
            db,
            state: AtomicU8::new(TASK_CREATED),
            output: Mutex::new(Output::default()),
            callback,
        }
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cancel(&self) {
        self.state.store(TASK_CANCELED, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.state.load(Ordering::Acquire),
            TASK_FINISHED | TASK_CANCELED
        )
    }

    pub fn output(&self) -> Output {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_output(&self, output: Output) {
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = output;
    }

    fn set_error(&self, message: String) {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .error = Some(message);
    }
}

impl SqliteStorage {
    /// Creates one task per window, registering it both globally (for
    /// result/cancel lookup) and on the window (for execution).
    pub(crate) fn schedule(&self, dbs: &[Arc<WindowDb>], callback: TaskCallback) -> Vec<i32> {
        let mut ids = Vec::with_capacity(dbs.len());
        for db in dbs {
            let id = self.task_seq.fetch_add(1, Ordering::AcqRel) + 1;
            let task = Arc::new(DbTask::new(Arc::clone(db), Arc::clone(&callback)));
            self.tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, Arc::clone(&task));
            db.schedule_task(id, task);
            ids.push(id);
        }
        ids
    }

    /// Output of a finished or canceled task, removing it from the
    /// registry. A known-but-pending task reports itself as scheduled.
    pub(crate) fn task_result(&self, task_id: i32) -> Option<Output> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let done = tasks.get(&task_id)?.is_done();
        if done {
            let task = tasks.remove(&task_id)?;
            Some(task.output())
        } else {
            Some(Output {
                scheduled: true,
                task_ids: vec![task_id],
                ..Default::default()
            })
        }
    }

    /// Cancels a task, dropping its future execution.
    pub(crate) fn task_cancel(&self, task_id: i32) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
        if let Some(task) = task {
            task.cancel();
            task.db.cancel_task(task_id);
        }
    }

    /// One scheduler tick: run pending tasks on open windows within the
    /// budget, close idle windows, enforce the open-set cap, open closed
    /// windows that have pending tasks.
    pub(crate) fn run_scheduled_tick(self: &Arc<Self>) {
        let dbs = self.windows();

        let mut total_tasks = 0i32;
        let mut total_open = 0i32;
        let mut open_with_tasks: Vec<Arc<WindowDb>> = Vec::new();
        let mut open_without_tasks: Vec<Arc<WindowDb>> = Vec::new();
        let mut closed_with_tasks: Vec<Arc<WindowDb>> = Vec::new();

        for db in &dbs {
            let tasks = db.task_count();
            total_tasks += tasks;
            if db.is_open() {
                total_open += 1;
                if tasks > 0 {
                    open_with_tasks.push(Arc::clone(db));
                } else {
                    open_without_tasks.push(Arc::clone(db));
                }
            } else if tasks > 0 {
                closed_with_tasks.push(Arc::clone(db));
            }
        }

        let mut closed_any = false;

        // Execute tasks on open windows, sharing the budget proportionally
        // to each window's backlog, at least one each.
        if total_tasks > 0 {
            let budget =
                self.config.max_running_tasks - self.active_tasks.load(Ordering::Acquire);
            if budget > 0 {
                for db in &open_with_tasks {
                    let pending = db.task_count();
                    if pending == 0 {
                        continue;
                    }
                    let max_for_db = ((pending / total_tasks) * budget).max(1);
                    for (id, task) in db.take_tasks(max_for_db) {
                        self.spawn_task(id, task);
                    }
                }
            }
        }

        // Close idle non-live windows.
        for db in &dbs {
            if db.is_open()
                && !db.is_live()
                && db.last_used_sec() > self.config.close_idle_sec
                && db.close_safe()
            {
                total_open -= 1;
                closed_any = true;
            }
        }

        // Enforce the open-set cap: taskless windows first, then fewest
        // tasks first. Live windows are never closed here.
        if total_open > self.config.max_opened_db {
            for db in &open_without_tasks {
                if total_open <= self.config.max_opened_db {
                    break;
                }
                if !db.is_live() && db.close_safe() {
                    total_open -= 1;
                    closed_any = true;
                }
            }

            if total_open > self.config.max_opened_db {
                open_with_tasks.sort_by_key(|db| db.task_count());
                for db in &open_with_tasks {
                    if total_open <= self.config.max_opened_db {
                        break;
                    }
                    if !db.is_live() && db.close_safe() {
                        total_open -= 1;
                        closed_any = true;
                    }
                }
            }
        }

        // Open closed windows with pending tasks, fewest tasks first.
        if !closed_with_tasks.is_empty() {
            closed_with_tasks.sort_by_key(|db| db.task_count());

            if total_open > self.config.max_opened_db {
                // Over budget already: open a single window so its tasks can
                // make progress.
                for db in &closed_with_tasks {
                    match db.connect() {
                        Ok(()) => break,
                        Err(err) => {
                            tracing::warn!(
                                db = %db.file_path().display(),
                                error = %err,
                                "error opening database for scheduled tasks"
                            );
                        }
                    }
                }
            } else {
                for db in &closed_with_tasks {
                    if total_open > self.config.max_opened_db {
                        break;
                    }
                    match db.connect() {
                        Ok(()) => total_open += 1,
                        Err(err) => {
                            tracing::warn!(
                                db = %db.file_path().display(),
                                error = %err,
                                "error opening database for scheduled tasks"
                            );
                        }
                    }
                }
            }
        }

        if closed_any {
            self.sort_pool();
        }
    }

    fn spawn_task(self: &Arc<Self>, id: i32, task: Arc<DbTask>) {
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            storage.execute_task(id, task).await;
            storage.active_tasks.fetch_sub(1, Ordering::AcqRel);
        });
    }

    async fn execute_task(&self, id: i32, task: Arc<DbTask>) {
        if !task.transition(TASK_CREATED, TASK_PROCESSING) {
            // Canceled before it started.
            return;
        }

        let mut retries = 0;
        loop {
            if !task.db.is_open() {
                // The window closed under us; hand the task back.
                if task.transition(TASK_PROCESSING, TASK_CREATED) {
                    task.db.schedule_task(id, Arc::clone(&task));
                }
                return;
            }

            let db = Arc::clone(&task.db);
            let callback = Arc::clone(&task.callback);
            let result = tokio::task::spawn_blocking(move || callback(&db)).await;

            match result {
                Ok(Ok(output)) => {
                    task.set_output(output);
                    task.transition(TASK_PROCESSING, TASK_FINISHED);
                    return;
                }
                Ok(Err(err)) => {
                    if !task.db.is_open() {
                        if task.transition(TASK_PROCESSING, TASK_CREATED) {
                            task.db.schedule_task(id, Arc::clone(&task));
                        }
                        return;
                    }
                    if retries < 3 {
                        retries += 1;
                        continue;
                    }
                    task.set_error(err.to_string());
                    task.transition(TASK_PROCESSING, TASK_FINISHED);
                    return;
                }
                Err(join_err) => {
                    task.set_error(join_err.to_string());
                    task.transition(TASK_PROCESSING, TASK_FINISHED);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_transitions() {
        let db = Arc::new(WindowDb::create("/tmp", "logbook", 0, 3600));
        let task = DbTask::new(db, Arc::new(|_| Ok(Output::default())));

        assert!(!task.is_done());
        assert!(task.transition(TASK_CREATED, TASK_PROCESSING));
        assert!(!task.transition(TASK_CREATED, TASK_PROCESSING));
        assert!(task.transition(TASK_PROCESSING, TASK_FINISHED));
        assert!(task.is_done());
    }

    #[test]
    fn test_cancel_reaches_done_from_any_state() {
        let db = Arc::new(WindowDb::create("/tmp", "logbook", 0, 3600));
        let task = DbTask::new(db, Arc::new(|_| Ok(Output::default())));

        task.cancel();
        assert!(task.is_done());
        // A canceled task cannot start processing.
        assert!(!task.transition(TASK_CREATED, TASK_PROCESSING));
    }
}
