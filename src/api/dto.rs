//! Query-string parameter types
//!
//! The wire encoding keeps the short names the UI sends (`epoch`, `dir`,
//! `limit`, comma-separated `level`); conversion into the core input
//! records fills in interactive-friendly defaults.

use crate::query::{EntriesInput, TicksInput};
use serde::Deserialize;

fn split_levels(level: Option<String>) -> Vec<String> {
    level
        .map(|l| {
            l.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// `GET /api/ticks` parameters.
#[derive(Debug, Deserialize)]
pub struct TicksParams {
    #[serde(default)]
    pub expr: String,
    pub level: Option<String>,
    pub epoch: Option<i64>,
    pub interval: Option<i64>,
    pub limit: Option<i64>,
}

impl TicksParams {
    pub fn into_input(self) -> TicksInput {
        TicksInput {
            expr: self.expr,
            level: split_levels(self.level),
            epoch_end: self.epoch.unwrap_or(0),
            interval_sec: self.interval.unwrap_or(60),
            max_result: self.limit.unwrap_or(60),
        }
    }
}

/// `GET /api/entries` parameters.
#[derive(Debug, Deserialize)]
pub struct EntriesParams {
    #[serde(default)]
    pub expr: String,
    pub level: Option<String>,
    #[serde(default)]
    pub dir: String,
    pub epoch: Option<i64>,
    pub nanos: Option<i64>,
    pub limit: Option<i64>,
}

impl EntriesParams {
    pub fn into_input(self) -> EntriesInput {
        EntriesInput {
            expr: self.expr,
            level: split_levels(self.level),
            direction: self.dir,
            epoch_start: self.epoch.unwrap_or(0),
            nanos_start: self.nanos.unwrap_or(0),
            max_result: self.limit.unwrap_or(0),
        }
    }
}

/// `GET /api/result` and `GET /api/cancel` parameters.
#[derive(Debug, Deserialize)]
pub struct TaskParams {
    pub id: i32,
}
