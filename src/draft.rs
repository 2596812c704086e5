use crate::matrix::Matrix;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DRAFT_KEY: &str = "assignment_draft";
pub const TASK_ID_KEY: &str = "assignment_task_id";

/// Bump when the persisted draft shape changes. Blobs with any other version
/// are ignored on load.
pub const DRAFT_VERSION: u32 = 1;

/// Durable string key/value slot. Backed by the workspace database in the
/// sidecar and by an in-memory map in tests.
pub trait KvStore {
    fn kv_get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn kv_set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn kv_remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub version: u32,
    pub matrix: Matrix,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct DraftPersister {
    ttl: Duration,
}

impl DraftPersister {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Writes the draft when the matrix has edits. Storage errors are logged
    /// and swallowed so editing is never blocked.
    pub fn save(&self, kv: &dyn KvStore, matrix: &Matrix, now: DateTime<Utc>) {
        if !matrix.has_any_dirty() {
            return;
        }
        let draft = Draft {
            version: DRAFT_VERSION,
            matrix: matrix.clone(),
            saved_at: now,
        };
        let blob = match serde_json::to_string(&draft) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "assignmentd", error = %e, "draft serialize failed");
                return;
            }
        };
        if let Err(e) = kv.kv_set(DRAFT_KEY, &blob) {
            warn!(target: "assignmentd", error = %e, "draft save failed");
        }
    }

    /// Returns the stored draft while it is younger than the TTL. Expired,
    /// unreadable or foreign-version blobs read as absent and are left in place.
    pub fn load(&self, kv: &dyn KvStore, now: DateTime<Utc>) -> Option<Draft> {
        let blob = match kv.kv_get(DRAFT_KEY) {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                warn!(target: "assignmentd", error = %e, "draft read failed");
                return None;
            }
        };
        let draft: Draft = match serde_json::from_str(&blob) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "assignmentd", error = %e, "draft blob unreadable; ignoring");
                return None;
            }
        };
        if draft.version != DRAFT_VERSION {
            debug!(target: "assignmentd", version = draft.version, "draft version mismatch; ignoring");
            return None;
        }
        if now - draft.saved_at >= self.ttl {
            debug!(target: "assignmentd", saved_at = %draft.saved_at, "draft expired; ignoring");
            return None;
        }
        Some(draft)
    }

    pub fn clear(&self, kv: &dyn KvStore) {
        if let Err(e) = kv.kv_remove(DRAFT_KEY) {
            warn!(target: "assignmentd", error = %e, "draft clear failed");
        }
    }
}

impl Default for DraftPersister {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}
