//! Query surface types
//!
//! Language-agnostic request/response records shared by the storage
//! backends and the HTTP layer. Serde names follow the wire contract of
//! the query APIs (`epoch`, `dir`, `limit`, ...).

use serde::{Deserialize, Serialize};

/// Severity names accepted by the level filter.
pub const LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

/// Input for the bucketed tick counts query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TicksInput {
    /// Search expression, empty for all records.
    #[serde(default)]
    pub expr: String,
    /// Subset of ["debug", "info", "warn", "error"]; empty means all.
    #[serde(default)]
    pub level: Vec<String>,
    /// End of the bucketed range, seconds since epoch. Zero means now.
    #[serde(rename = "epoch", default)]
    pub epoch_end: i64,
    /// Width of one bucket, in seconds.
    #[serde(rename = "interval", default)]
    pub interval_sec: i64,
    /// Number of buckets.
    #[serde(rename = "limit", default)]
    pub max_result: i64,
}

/// Input for the keyset-paginated entries query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntriesInput {
    /// Search expression, empty for all records.
    #[serde(default)]
    pub expr: String,
    /// Subset of ["debug", "info", "warn", "error"]; empty means all.
    #[serde(default)]
    pub level: Vec<String>,
    /// "before" pages into the past, anything else pages forward.
    #[serde(rename = "dir", default)]
    pub direction: String,
    /// Cursor: seconds since epoch. Zero means now.
    #[serde(rename = "epoch", default)]
    pub epoch_start: i64,
    /// Cursor: nanoseconds within the cursor second.
    #[serde(rename = "nanos", default)]
    pub nanos_start: i64,
    /// Page size, clamped to [10, 100].
    #[serde(rename = "limit", default)]
    pub max_result: i64,
}

impl EntriesInput {
    pub fn is_before(&self) -> bool {
        self.direction == "before"
    }
}

/// One time bucket with per-severity counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tick {
    pub index: i64,
    #[serde(rename = "epoch_start")]
    pub start: i64,
    #[serde(rename = "epoch_end")]
    pub end: i64,
    pub count: i64,
    pub debug: i64,
    pub info: i64,
    pub warn: i64,
    pub error: i64,
}

/// One persisted entry on the wire: `[epoch_secs, nanos, level, content]`.
pub type EntryRow = (i64, i64, i64, String);

/// Result of a query-surface call. Partial results reference the scheduled
/// tasks that will produce the rest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Output {
    /// This is a partial result; poll the task ids for the remainder.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub scheduled: bool,
    /// Ids for future `result` calls.
    #[serde(rename = "tasks", skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<i32>,
    /// Last error hit while producing this output. Never serialized.
    #[serde(skip)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ticks: Vec<Tick>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<EntryRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_serialization_skips_empty_fields() {
        let out = Output::default();
        assert_eq!(serde_json::to_string(&out).unwrap(), "{}");

        let out = Output {
            scheduled: true,
            task_ids: vec![3],
            error: Some("hidden".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&out).unwrap();
        assert_eq!(json, r#"{"scheduled":true,"tasks":[3]}"#);
    }

    #[test]
    fn test_tick_wire_names() {
        let tick = Tick {
            index: 1,
            start: 10,
            end: 20,
            count: 5,
            debug: 1,
            info: 2,
            warn: 1,
            error: 1,
        };
        let json = serde_json::to_value(&tick).unwrap();
        assert_eq!(json["epoch_start"], 10);
        assert_eq!(json["epoch_end"], 20);
        assert_eq!(json["count"], 5);
    }

    #[test]
    fn test_entries_direction() {
        let mut input = EntriesInput::default();
        assert!(!input.is_before());
        input.direction = "before".into();
        assert!(input.is_before());
    }
}
