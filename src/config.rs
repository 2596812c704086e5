//! Runtime settings for the assignment workflow.
//!
//! Defaults can be overridden per process with environment variables and per
//! workspace through the `setup.assignments` settings row:
//!   ASSIGNMENTD_DRAFT_TTL_SECS           : draft validity window (default 86400)
//!   ASSIGNMENTD_COMPLETION_CHECK_DELAY_MS : delayed status check after submit (default 1000)
//!   ASSIGNMENTD_EXECUTOR_CHUNK_SIZE      : actions applied per executor step (default 25)
//!   ASSIGNMENTD_DELIVER_PUSH_EVENTS      : "0"/"false" drops executor push events
//!   ASSIGNMENTD_SOURCE_LIST_CAP          : max rows fetched per source list (default 1000)

use crate::db;
use chrono::Duration;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

pub const SETTINGS_KEY: &str = "setup.assignments";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentSettings {
    pub draft_ttl_secs: i64,
    pub completion_check_delay_ms: i64,
    pub executor_chunk_size: i64,
    pub deliver_push_events: bool,
    pub source_list_cap: i64,
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            draft_ttl_secs: 24 * 60 * 60,
            completion_check_delay_ms: 1000,
            executor_chunk_size: 25,
            deliver_push_events: true,
            source_list_cap: 1000,
        }
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

impl AssignmentSettings {
    /// Defaults with any `ASSIGNMENTD_*` overrides applied. Malformed values are
    /// logged and skipped.
    pub fn from_env() -> Self {
        let mut s = Self::default();
        let mut patch = Map::new();
        for (var, key) in [
            ("ASSIGNMENTD_DRAFT_TTL_SECS", "draftTtlSecs"),
            ("ASSIGNMENTD_COMPLETION_CHECK_DELAY_MS", "completionCheckDelayMs"),
            ("ASSIGNMENTD_EXECUTOR_CHUNK_SIZE", "executorChunkSize"),
            ("ASSIGNMENTD_SOURCE_LIST_CAP", "sourceListCap"),
        ] {
            if let Ok(raw) = std::env::var(var) {
                match raw.trim().parse::<i64>() {
                    Ok(n) => {
                        patch.insert(key.to_string(), Value::from(n));
                    }
                    Err(e) => warn!(target: "assignmentd", %var, %raw, error = %e, "ignoring env override"),
                }
            }
        }
        if let Ok(raw) = std::env::var("ASSIGNMENTD_DELIVER_PUSH_EVENTS") {
            let on = !matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off");
            patch.insert("deliverPushEvents".to_string(), Value::Bool(on));
        }
        for (k, v) in &patch {
            let mut single = Map::new();
            single.insert(k.clone(), v.clone());
            if let Err(msg) = s.apply_patch(&single) {
                warn!(target: "assignmentd", error = %msg, "ignoring env override");
            }
        }
        s
    }

    /// Workspace-saved values merged over `base`. Malformed historical values
    /// must not block opening the workspace.
    pub fn load(conn: &Connection, base: &Self) -> anyhow::Result<Self> {
        let mut current = base.clone();
        if let Some(saved) = db::settings_get_json(conn, SETTINGS_KEY)? {
            if let Some(obj) = saved.as_object() {
                for (k, v) in obj {
                    let mut single = Map::new();
                    single.insert(k.clone(), v.clone());
                    if let Err(msg) = current.apply_patch(&single) {
                        warn!(target: "assignmentd", key = %k, error = %msg, "skipping saved setting");
                    }
                }
            }
        }
        info!(target: "assignmentd", settings = ?current, "assignment settings loaded");
        Ok(current)
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(self)?)
    }

    /// Validate and apply a partial update. Nothing is applied when any field
    /// is rejected.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = self.clone();
        for (k, v) in patch {
            match k.as_str() {
                "draftTtlSecs" => next.draft_ttl_secs = parse_i64_range(v, k, 1, 7 * 24 * 60 * 60)?,
                "completionCheckDelayMs" => {
                    next.completion_check_delay_ms = parse_i64_range(v, k, 0, 60_000)?
                }
                "executorChunkSize" => next.executor_chunk_size = parse_i64_range(v, k, 1, 5000)?,
                "deliverPushEvents" => next.deliver_push_events = parse_bool(v, k)?,
                "sourceListCap" => next.source_list_cap = parse_i64_range(v, k, 1, 5000)?,
                _ => return Err(format!("unknown assignments field: {}", k)),
            }
        }
        *self = next;
        Ok(())
    }

    pub fn draft_ttl(&self) -> Duration {
        Duration::seconds(self.draft_ttl_secs)
    }

    pub fn completion_check_delay(&self) -> Duration {
        Duration::milliseconds(self.completion_check_delay_ms)
    }

    pub fn chunk_size(&self) -> usize {
        self.executor_chunk_size.max(1) as usize
    }

    pub fn list_cap(&self) -> usize {
        self.source_list_cap.max(1) as usize
    }
}
