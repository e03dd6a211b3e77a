//! Ticks query - bucketed severity counts across windows
//!
//! Partitions `[epochEnd - maxResult*intervalSec, epochEnd]` into equal
//! buckets with a recursive series CTE, counting entries per severity band
//! in each bucket. Results from overlapping windows merge by bucket index;
//! closed windows become scheduled tasks.

use crate::query::{Output, Tick, TicksInput};
use crate::storage::db::WindowDb;
use crate::storage::entries::level_clause;
use crate::storage::error::StorageResult;
use crate::storage::pool::SqliteStorage;
use crate::storage::scheduler::TaskCallback;
use chrono::Utc;
use rusqlite::types::Value;
use std::collections::HashMap;
use std::sync::Arc;

const SQL_TICKS_SERIES: &str = "
    WITH RECURSIVE series(idx, epoch_start, epoch_end) AS (
        SELECT ?-1, ? - ?, ?
        UNION ALL
        SELECT idx-1, epoch_start - ?, epoch_end - ? FROM series LIMIT ?
    )
    SELECT
        c.idx,
        c.epoch_start,
        c.epoch_end,
        COUNT(e.epoch_secs) AS count,
        COUNT(CASE WHEN e.level < 0 THEN 1 END) AS count_debug,
        COUNT(CASE WHEN e.level >= 0 AND e.level < 4 THEN 1 END) AS count_info,
        COUNT(CASE WHEN e.level >= 4 AND e.level < 8 THEN 1 END) AS count_warn,
        COUNT(CASE WHEN e.level >= 8 THEN 1 END) AS count_error
    FROM series c
    JOIN entries e ON e.epoch_secs >= c.epoch_start AND e.epoch_secs < c.epoch_end
";
const SQL_TICKS_GROUP: &str = " GROUP BY c.epoch_start, c.epoch_end";

fn map_tick(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tick> {
    Ok(Tick {
        index: row.get(0)?,
        start: row.get(1)?,
        end: row.get(2)?,
        count: row.get(3)?,
        debug: row.get(4)?,
        info: row.get(5)?,
        warn: row.get(6)?,
        error: row.get(7)?,
    })
}

impl SqliteStorage {
    pub(crate) fn query_ticks(&self, input: &TicksInput) -> StorageResult<Output> {
        let epoch_end = if input.epoch_end == 0 {
            Utc::now().timestamp()
        } else {
            input.epoch_end
        };
        let interval = input.interval_sec.max(1);
        let max_result = input.max_result.max(1);

        let mut sql = String::with_capacity(1024);
        sql.push_str(SQL_TICKS_SERIES);
        let mut args: Vec<Value> = vec![
            Value::Integer(max_result),
            Value::Integer(epoch_end),
            Value::Integer(interval),
            Value::Integer(epoch_end),
            Value::Integer(interval),
            Value::Integer(interval),
            Value::Integer(max_result),
        ];

        let mut connective = " WHERE ";
        if let Some(clause) = level_clause(&input.level) {
            sql.push_str(connective);
            sql.push_str(&clause);
            sql.push(' ');
            connective = " AND ";
        }

        let expr = input.expr.trim();
        if !expr.is_empty() {
            let compiled = self.compile_expr(expr)?;
            if !compiled.is_empty() {
                sql.push_str(connective);
                sql.push_str(&compiled.sql);
                sql.push(' ');
                args.extend(compiled.args.iter().cloned());
            }
        }
        sql.push_str(SQL_TICKS_GROUP);

        // Windows overlapping the bucketed range.
        let epoch_start = epoch_end - interval * max_result;
        let candidates: Vec<_> = self
            .windows()
            .into_iter()
            .filter(|d| {
                !(epoch_end < d.epoch_start()
                    || (d.epoch_end() != 0 && d.epoch_end() < epoch_start))
            })
            .collect();

        let mut merged: HashMap<i64, Tick> = HashMap::new();
        let mut closed: Vec<Arc<WindowDb>> = Vec::new();

        for db in candidates {
            if db.is_open() {
                for tick in db.query_rows(&sql, &args, map_tick)? {
                    match merged.get_mut(&tick.index) {
                        Some(existing) => {
                            existing.count += tick.count;
                            existing.debug += tick.debug;
                            existing.info += tick.info;
                            existing.warn += tick.warn;
                            existing.error += tick.error;
                        }
                        None => {
                            merged.insert(tick.index, tick);
                        }
                    }
                }
            } else {
                closed.push(db);
            }
        }

        let mut ticks: Vec<Tick> = merged.into_values().collect();
        ticks.sort_by_key(|t| t.index);

        let mut out = Output {
            ticks,
            ..Default::default()
        };

        if !closed.is_empty() {
            let callback: TaskCallback = Arc::new(move |db: &WindowDb| {
                Ok(Output {
                    ticks: db.query_rows(&sql, &args, map_tick)?,
                    ..Default::default()
                })
            });
            out.scheduled = true;
            out.task_ids = self.schedule(&closed, callback);
        }

        Ok(out)
    }
}
