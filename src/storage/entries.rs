//! Entries query - keyset pagination across windows
//!
//! `direction = "before"` pages into the past (epoch desc, nanos desc),
//! anything else pages forward. Dispatch walks the candidate windows in
//! cursor order and short-circuits once a page is full; relevant windows
//! that are closed become scheduled tasks instead.

use crate::query::{EntriesInput, EntryRow, Output, LEVELS};
use crate::storage::db::WindowDb;
use crate::storage::error::StorageResult;
use crate::storage::pool::SqliteStorage;
use crate::storage::scheduler::TaskCallback;
use chrono::Utc;
use rusqlite::types::Value;
use std::sync::Arc;

const SQL_SEEK_AFTER: &str = "SELECT e.epoch_secs, e.nanos, e.level, e.content FROM entries e \
     WHERE (e.epoch_secs > ? OR (e.epoch_secs = ? AND e.nanos > ?)) ";
const SQL_SEEK_BEFORE: &str = "SELECT e.epoch_secs, e.nanos, e.level, e.content FROM entries e \
     WHERE (e.epoch_secs < ? OR (e.epoch_secs = ? AND e.nanos < ?)) ";
const SQL_ORDER_AFTER: &str = " ORDER BY e.epoch_secs ASC, e.nanos ASC LIMIT ?";
const SQL_ORDER_BEFORE: &str = " ORDER BY e.epoch_secs DESC, e.nanos DESC LIMIT ?";

/// Maps the requested severity names to a disjunction of `level` ranges.
/// Returns `None` when the filter is absent or covers every severity (in
/// which case no clause is needed at all). Adjacent ranges collapse.
pub(crate) fn level_clause(levels: &[String]) -> Option<String> {
    let mut debug = false;
    let mut info = false;
    let mut warn = false;
    let mut error = false;
    for level in levels {
        match level.as_str() {
            "debug" => debug = true,
            "info" => info = true,
            "warn" => warn = true,
            "error" => error = true,
            other => tracing::debug!(level = other, "ignoring unknown level filter"),
        }
    }

    let count = [debug, info, warn, error].iter().filter(|b| **b).count();
    if count == 0 || count == LEVELS.len() {
        return None;
    }

    let mut sql = String::from("(");
    if error && warn && info {
        sql.push_str(" e.level >= 0 ");
    } else {
        let mut connective = "";
        if error && warn {
            sql.push_str(" e.level >= 4 ");
            connective = " OR ";
        } else if error {
            sql.push_str(" e.level >= 8 ");
            connective = " OR ";
        } else if warn {
            sql.push_str(" (e.level BETWEEN 4 AND 7) ");
            connective = " OR ";
        }

        if info {
            sql.push_str(connective);
            sql.push_str(" (e.level BETWEEN 0 AND 3) ");
            connective = " OR ";
        }

        if debug {
            sql.push_str(connective);
            sql.push_str(" e.level < 0 ");
        }
    }
    sql.push(')');
    Some(sql)
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
    let content: Vec<u8> = row.get(3)?;
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        String::from_utf8_lossy(&content).into_owned(),
    ))
}

impl SqliteStorage {
    pub(crate) fn query_entries(&self, input: &EntriesInput) -> StorageResult<Output> {
        let before = input.is_before();
        let epoch_start = if input.epoch_start == 0 {
            Utc::now().timestamp()
        } else {
            input.epoch_start
        };
        let max_result = input.max_result.clamp(10, 100);

        let mut sql = String::with_capacity(256);
        sql.push_str(if before { SQL_SEEK_BEFORE } else { SQL_SEEK_AFTER });
        let mut args: Vec<Value> = vec![
            Value::Integer(epoch_start),
            Value::Integer(epoch_start),
            Value::Integer(input.nanos_start),
        ];

        if let Some(clause) = level_clause(&input.level) {
            sql.push_str(" AND ");
            sql.push_str(&clause);
            sql.push(' ');
        }

        let expr = input.expr.trim();
        if !expr.is_empty() {
            let compiled = self.compile_expr(expr)?;
            if !compiled.is_empty() {
                sql.push_str(" AND (");
                sql.push_str(&compiled.sql);
                sql.push(')');
                args.extend(compiled.args.iter().cloned());
            }
        }

        sql.push_str(if before { SQL_ORDER_BEFORE } else { SQL_ORDER_AFTER });
        args.push(Value::Integer(max_result));

        // Candidate windows, walked in cursor order.
        let mut dbs: Vec<_> = self
            .windows()
            .into_iter()
            .filter(|d| {
                if before {
                    d.epoch_start() <= epoch_start
                } else {
                    d.epoch_end() == 0 || d.epoch_end() >= epoch_start
                }
            })
            .collect();
        if before {
            dbs.sort_by_key(|d| std::cmp::Reverse(d.epoch_start()));
        } else {
            dbs.sort_by_key(|d| d.epoch_start());
        }

        let mut out = Output::default();
        for db in dbs {
            if db.is_open() {
                out.entries
                    .extend(db.query_rows(&sql, &args, map_entry_row)?);
                if out.entries.len() as i64 >= max_result {
                    break;
                }
            } else {
                // The rest of the page comes from a closed window; schedule
                // it and return what is already in hand.
                let sql = sql.clone();
                let args = args.clone();
                let callback: TaskCallback = Arc::new(move |db: &WindowDb| {
                    Ok(Output {
                        entries: db.query_rows(&sql, &args, map_entry_row)?,
                        ..Default::default()
                    })
                });
                out.scheduled = true;
                out.task_ids = self.schedule(&[db], callback);
                break;
            }
        }

        Ok(out)
    }
}
