//! Local bulk task executor: the server side of `submit_bulk`.
//!
//! Submitted batches are queued in `bulk_tasks` and applied a chunk at a time
//! by [`run_pending`]. Each step publishes the push events a remote server
//! would send: one `bulk_update_progress`, plus `bulk_update_complete` when the
//! task reaches a terminal status. Every action is applied on its own; one
//! failing action never rolls back the others.

use crate::actions::Action;
use crate::bulk::{PushEvent, TaskStatus, STATUS_FAILED, STATUS_PENDING, STATUS_RUNNING};
use crate::db;
use crate::source::{ActionError, SubmitReceipt, TaskStatusReport, UnknownTask};
use anyhow::{anyhow, Context};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BULK_MAX_ACTIONS: usize = 5000;

struct ActionErr {
    code: &'static str,
    message: String,
}

pub fn enqueue(conn: &Connection, actions: &[Action]) -> anyhow::Result<SubmitReceipt> {
    if actions.is_empty() {
        return Err(anyhow!("bulk request has no actions"));
    }
    if actions.len() > BULK_MAX_ACTIONS {
        return Err(anyhow!(
            "bulk payload exceeds max actions: {} > {}",
            actions.len(),
            BULK_MAX_ACTIONS
        ));
    }
    let task_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO bulk_tasks(id, status, total, actions_json, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &task_id,
            STATUS_PENDING,
            actions.len() as i64,
            serde_json::to_string(actions)?,
            &now,
            &now,
        ),
    )
    .context("failed to queue bulk task")?;
    info!(target: "assignmentd", %task_id, actions = actions.len(), "bulk task queued");
    Ok(SubmitReceipt {
        task_id,
        status: TaskStatus::pending(),
    })
}

struct TaskRow {
    id: String,
    total: usize,
    processed: usize,
    success: usize,
    failed: usize,
    errors: Vec<ActionError>,
    actions: Vec<Action>,
}

enum OpenTask {
    Ready(TaskRow),
    Unreadable { id: String, reason: String },
}

fn next_open_task(conn: &Connection) -> anyhow::Result<Option<OpenTask>> {
    let raw = conn
        .query_row(
            "SELECT id, total, processed, success, failed, errors_json, actions_json
             FROM bulk_tasks
             WHERE status IN (?, ?)
             ORDER BY created_at, rowid
             LIMIT 1",
            (STATUS_PENDING, STATUS_RUNNING),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((id, total, processed, success, failed, errors_json, actions_json)) = raw else {
        return Ok(None);
    };
    let actions: Vec<Action> = match serde_json::from_str(&actions_json) {
        Ok(v) => v,
        Err(e) => {
            return Ok(Some(OpenTask::Unreadable {
                id,
                reason: format!("unreadable actions: {}", e),
            }))
        }
    };
    // Error history is informational; a damaged list restarts empty.
    let errors: Vec<ActionError> = serde_json::from_str(&errors_json).unwrap_or_default();
    Ok(Some(OpenTask::Ready(TaskRow {
        id,
        total: total.max(0) as usize,
        processed: processed.max(0) as usize,
        success: success.max(0) as usize,
        failed: failed.max(0) as usize,
        errors,
        actions,
    })))
}

/// Closes a task whose stored batch cannot be read so it stops holding the
/// head of the queue.
fn fail_unreadable(conn: &Connection, id: String, reason: String) -> anyhow::Result<Vec<PushEvent>> {
    conn.execute(
        "UPDATE bulk_tasks SET status = ?, details = ?, updated_at = ? WHERE id = ?",
        (STATUS_FAILED, &reason, Utc::now().to_rfc3339(), &id),
    )
    .with_context(|| format!("failed to close bulk task {}", id))?;
    warn!(target: "assignmentd", task_id = %id, %reason, "bulk task marked failed");
    Ok(vec![PushEvent::BulkUpdateComplete {
        task_id: id,
        status: TaskStatus::Failed,
        details: Some(reason),
    }])
}

fn terminal_status(success: usize, failed: usize) -> TaskStatus {
    if failed == 0 {
        TaskStatus::Success
    } else if success == 0 {
        TaskStatus::Failed
    } else {
        TaskStatus::PartialSuccess
    }
}

/// Apply up to `chunk_size` actions of the oldest open task. Returns the push
/// events for that step; empty when nothing is queued.
pub fn run_pending(conn: &Connection, chunk_size: usize) -> anyhow::Result<Vec<PushEvent>> {
    let mut task = match next_open_task(conn)? {
        None => return Ok(Vec::new()),
        Some(OpenTask::Unreadable { id, reason }) => return fail_unreadable(conn, id, reason),
        Some(OpenTask::Ready(task)) => task,
    };

    let tx = conn.unchecked_transaction()?;
    let end = (task.processed + chunk_size.max(1)).min(task.actions.len());
    for index in task.processed..end {
        match apply_action(&tx, &task.actions[index]) {
            Ok(()) => task.success += 1,
            Err(e) => {
                debug!(
                    target: "assignmentd",
                    task_id = %task.id,
                    index,
                    kind = task.actions[index].kind(),
                    code = e.code,
                    "bulk action failed"
                );
                task.failed += 1;
                task.errors.push(ActionError {
                    index,
                    code: e.code.to_string(),
                    message: e.message,
                });
            }
        }
    }
    task.processed = end;

    let finished = task.processed >= task.actions.len();
    let status = if finished {
        terminal_status(task.success, task.failed)
    } else {
        TaskStatus::running()
    };
    let details = finished.then(|| format!("{} succeeded, {} failed", task.success, task.failed));
    tx.execute(
        "UPDATE bulk_tasks
         SET status = ?, processed = ?, success = ?, failed = ?, errors_json = ?, details = ?, updated_at = ?
         WHERE id = ?",
        (
            status.as_str(),
            task.processed as i64,
            task.success as i64,
            task.failed as i64,
            serde_json::to_string(&task.errors)?,
            details.as_deref(),
            Utc::now().to_rfc3339(),
            &task.id,
        ),
    )?;
    tx.commit()?;

    let mut events = vec![PushEvent::BulkUpdateProgress {
        task_id: task.id.clone(),
        processed: task.processed,
        total: task.total,
        success: task.success,
        failed: task.failed,
        errors: task.errors.clone(),
    }];
    if finished {
        info!(target: "assignmentd", task_id = %task.id, %status, success = task.success, failed = task.failed, "bulk task finished");
        events.push(PushEvent::BulkUpdateComplete {
            task_id: task.id,
            status,
            details,
        });
    }
    Ok(events)
}

fn apply_action(conn: &Connection, action: &Action) -> Result<(), ActionErr> {
    let db_err = |e: anyhow::Error| ActionErr {
        code: "db_error",
        message: format!("{e:#}"),
    };
    let sql_err = |e: rusqlite::Error| ActionErr {
        code: "db_error",
        message: e.to_string(),
    };

    match action {
        Action::Create {
            class_id,
            subject_id,
            teacher_id,
        } => {
            if !db::teacher_exists(conn, teacher_id).map_err(db_err)? {
                return Err(ActionErr {
                    code: "not_found",
                    message: format!("teacher {} not found", teacher_id),
                });
            }
            if let Some(existing) =
                db::find_assignment_for_cell(conn, class_id, subject_id).map_err(db_err)?
            {
                return Err(ActionErr {
                    code: "conflict",
                    message: format!(
                        "class {} / subject {} already assigned ({})",
                        class_id, subject_id, existing
                    ),
                });
            }
            conn.execute(
                "INSERT INTO teaching_assignments(id, class_id, subject_id, teacher_id, updated_at)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    class_id,
                    subject_id,
                    teacher_id,
                    Utc::now().to_rfc3339(),
                ),
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    ActionErr {
                        code: "not_found",
                        message: format!("class {} or subject {} not found", class_id, subject_id),
                    }
                }
                other => sql_err(other),
            })?;
            Ok(())
        }
        Action::Update {
            assignment_id,
            class_id,
            subject_id,
            teacher_id,
        } => {
            if !db::teacher_exists(conn, teacher_id).map_err(db_err)? {
                return Err(ActionErr {
                    code: "not_found",
                    message: format!("teacher {} not found", teacher_id),
                });
            }
            let changed = conn
                .execute(
                    "UPDATE teaching_assignments SET teacher_id = ?, updated_at = ?
                     WHERE id = ? AND class_id = ? AND subject_id = ?",
                    (
                        teacher_id,
                        Utc::now().to_rfc3339(),
                        assignment_id,
                        class_id,
                        subject_id,
                    ),
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(ActionErr {
                    code: "not_found",
                    message: format!("assignment {} not found", assignment_id),
                });
            }
            Ok(())
        }
        Action::Delete { assignment_id } => {
            let changed = conn
                .execute(
                    "DELETE FROM teaching_assignments WHERE id = ?",
                    [assignment_id],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(ActionErr {
                    code: "not_found",
                    message: format!("assignment {} not found", assignment_id),
                });
            }
            Ok(())
        }
    }
}

pub fn task_status(conn: &Connection, task_id: &str) -> anyhow::Result<TaskStatusReport> {
    let row = conn
        .query_row(
            "SELECT status, processed, total, success, failed, errors_json, details
             FROM bulk_tasks WHERE id = ?",
            [task_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((status, processed, total, success, failed, errors_json, details)) = row else {
        return Err(UnknownTask(task_id.to_string()).into());
    };
    Ok(TaskStatusReport {
        status: TaskStatus::from(status),
        processed: processed.max(0) as usize,
        total: total.max(0) as usize,
        success: success.max(0) as usize,
        failed: failed.max(0) as usize,
        errors: serde_json::from_str(&errors_json).unwrap_or_default(),
        details,
    })
}
