//! Bulk submission coordinator.
//!
//! One batch of actions is submitted as a server-side task. Completion is
//! observed through two channels that may race: push events and polled status
//! checks. Both funnel into [`BulkCoordinator::complete_task`], which runs at
//! most once per task id. Only the tracked task can complete, so the guard
//! holds just the last completed id.

use crate::actions::Action;
use crate::draft::{DraftPersister, KvStore, TASK_ID_KEY};
use crate::source::{ActionError, AssignmentSource, SubmitReceipt, TaskStatusReport, UnknownTask};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const STATUS_SUCCESS: &str = "SUCCESS";
pub const STATUS_PARTIAL_SUCCESS: &str = "PARTIAL_SUCCESS";
pub const STATUS_FAILED: &str = "FAILED";
pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_RUNNING: &str = "RUNNING";

/// Server task status. Anything outside the three terminal values is kept
/// verbatim and treated as still running.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Success,
    PartialSuccess,
    Failed,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Success => STATUS_SUCCESS,
            TaskStatus::PartialSuccess => STATUS_PARTIAL_SUCCESS,
            TaskStatus::Failed => STATUS_FAILED,
            TaskStatus::Other(s) => s.as_str(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Other(_))
    }

    pub fn pending() -> Self {
        TaskStatus::Other(STATUS_PENDING.to_string())
    }

    pub fn running() -> Self {
        TaskStatus::Other(STATUS_RUNNING.to_string())
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            STATUS_SUCCESS => TaskStatus::Success,
            STATUS_PARTIAL_SUCCESS => TaskStatus::PartialSuccess,
            STATUS_FAILED => TaskStatus::Failed,
            _ => TaskStatus::Other(s),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(s: TaskStatus) -> Self {
        match s {
            TaskStatus::Other(v) => v,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events delivered by the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    BulkUpdateProgress {
        task_id: String,
        processed: usize,
        total: usize,
        success: usize,
        failed: usize,
        #[serde(default)]
        errors: Vec<ActionError>,
    },
    BulkUpdateComplete {
        task_id: String,
        status: TaskStatus,
        #[serde(default)]
        details: Option<String>,
    },
}

impl PushEvent {
    pub fn task_id(&self) -> &str {
        match self {
            PushEvent::BulkUpdateProgress { task_id, .. } => task_id,
            PushEvent::BulkUpdateComplete { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkTask {
    pub task_id: String,
    pub status: TaskStatus,
    pub processed_count: usize,
    pub total_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub errors: Vec<ActionError>,
}

impl BulkTask {
    fn started(task_id: String, status: TaskStatus, total: usize) -> Self {
        Self {
            task_id,
            status,
            processed_count: 0,
            total_count: total,
            success_count: 0,
            failed_count: 0,
            errors: Vec::new(),
        }
    }

    fn apply_report(&mut self, r: &TaskStatusReport) {
        self.status = r.status.clone();
        self.processed_count = r.processed;
        self.total_count = r.total;
        self.success_count = r.success;
        self.failed_count = r.failed;
        self.errors = r.errors.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Submitted,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Success,
    Warning,
    Error,
}

/// User-facing message chosen by terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub level: NoticeLevel,
    pub message: String,
}

impl Outcome {
    fn for_task(task: &BulkTask, details: Option<&str>) -> Self {
        match task.status {
            TaskStatus::Success => Outcome {
                level: NoticeLevel::Success,
                message: format!(
                    "Saved {} teaching assignment change(s).",
                    task.success_count.max(task.processed_count)
                ),
            },
            TaskStatus::PartialSuccess => {
                // A re-attached task completed by push alone never learns its total.
                let total = task
                    .total_count
                    .max(task.processed_count)
                    .max(task.success_count + task.failed_count);
                let message = if total == 0 {
                    "Some changes were saved; others failed.".to_string()
                } else {
                    format!(
                        "Saved {} of {} change(s); {} failed.",
                        task.success_count, total, task.failed_count
                    )
                };
                Outcome {
                    level: NoticeLevel::Warning,
                    message,
                }
            }
            _ => Outcome {
                level: NoticeLevel::Error,
                message: match details {
                    Some(d) if !d.trim().is_empty() => format!("Bulk update failed: {}", d.trim()),
                    _ => "Bulk update failed; no changes were saved.".to_string(),
                },
            },
        }
    }
}

/// Terminal result as seen by whichever channel noticed it first.
#[derive(Debug, Clone)]
pub struct TerminalResult {
    pub status: TaskStatus,
    pub details: Option<String>,
    pub report: Option<TaskStatusReport>,
}

impl TerminalResult {
    pub fn from_report(report: TaskStatusReport) -> Self {
        Self {
            status: report.status.clone(),
            details: report.details.clone(),
            report: Some(report),
        }
    }
}

/// Returned exactly once per task when it reaches a terminal status. The owner
/// reloads data from the source of truth when it sees one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub task_id: String,
    pub status: TaskStatus,
    pub outcome: Outcome,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("nothing to save")]
    NothingToSave,
    #[error("bulk task {task_id} is still running")]
    TaskInFlight { task_id: String },
    #[error("bulk submit failed: {0}")]
    Network(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkView {
    pub phase: Phase,
    pub task: Option<BulkTask>,
    pub check_due_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
}

pub struct BulkCoordinator {
    phase: Phase,
    task: Option<BulkTask>,
    last_completed: Option<String>,
    check_due_at: Option<DateTime<Utc>>,
    check_delay: Duration,
    drafts: DraftPersister,
    last_outcome: Option<Outcome>,
}

impl BulkCoordinator {
    pub fn new(drafts: DraftPersister, check_delay: Duration) -> Self {
        Self {
            phase: Phase::Idle,
            task: None,
            last_completed: None,
            check_due_at: None,
            check_delay,
            drafts,
            last_outcome: None,
        }
    }

    pub fn configure(&mut self, drafts: DraftPersister, check_delay: Duration) {
        self.drafts = drafts;
        self.check_delay = check_delay;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn task(&self) -> Option<&BulkTask> {
        self.task.as_ref()
    }

    pub fn view(&self) -> BulkView {
        BulkView {
            phase: self.phase,
            task: self.task.clone(),
            check_due_at: self.check_due_at,
            last_outcome: self.last_outcome.clone(),
        }
    }

    /// Idle/Completed -> Submitted. On failure nothing is persisted and the
    /// phase is left as it was.
    pub fn submit(
        &mut self,
        kv: &dyn KvStore,
        source: &dyn AssignmentSource,
        actions: &[Action],
        now: DateTime<Utc>,
    ) -> Result<SubmitReceipt, SubmitError> {
        if self.phase == Phase::Submitted {
            if let Some(t) = &self.task {
                return Err(SubmitError::TaskInFlight {
                    task_id: t.task_id.clone(),
                });
            }
        }
        if actions.is_empty() {
            return Err(SubmitError::NothingToSave);
        }

        let receipt = source.submit_bulk(actions).map_err(|e| {
            warn!(target: "assignmentd", error = %format!("{e:#}"), "bulk submit failed");
            SubmitError::Network(format!("{e:#}"))
        })?;

        if let Err(e) = kv.kv_set(TASK_ID_KEY, &receipt.task_id) {
            warn!(target: "assignmentd", task_id = %receipt.task_id, error = %e, "persisting task id failed");
        }
        self.task = Some(BulkTask::started(
            receipt.task_id.clone(),
            receipt.status.clone(),
            actions.len(),
        ));
        self.phase = Phase::Submitted;
        self.last_outcome = None;
        self.check_due_at = Some(now + self.check_delay);
        info!(target: "assignmentd", task_id = %receipt.task_id, actions = actions.len(), "bulk task submitted");
        Ok(receipt)
    }

    /// Push channel entry point. Events for any task other than the tracked
    /// one are ignored.
    pub fn on_push(&mut self, kv: &dyn KvStore, event: PushEvent) -> Option<Completion> {
        if !self.tracks(event.task_id()) {
            debug!(target: "assignmentd", task_id = %event.task_id(), "push event for untracked task ignored");
            return None;
        }
        match event {
            PushEvent::BulkUpdateProgress {
                task_id: _,
                processed,
                total,
                success,
                failed,
                errors,
            } => {
                if self.phase != Phase::Submitted {
                    return None;
                }
                if let Some(t) = self.task.as_mut() {
                    t.processed_count = processed;
                    t.total_count = total;
                    t.success_count = success;
                    t.failed_count = failed;
                    t.errors = errors;
                }
                None
            }
            PushEvent::BulkUpdateComplete {
                task_id,
                status,
                details,
            } => {
                if !status.is_terminal() {
                    debug!(target: "assignmentd", %task_id, %status, "non-terminal complete event ignored");
                    return None;
                }
                self.complete_task(
                    kv,
                    &task_id,
                    TerminalResult {
                        status,
                        details,
                        report: None,
                    },
                )
            }
        }
    }

    /// Runs the scheduled status check once it is due.
    pub fn tick(
        &mut self,
        kv: &dyn KvStore,
        source: &dyn AssignmentSource,
        now: DateTime<Utc>,
    ) -> Option<Completion> {
        let due = self.check_due_at?;
        if now < due {
            return None;
        }
        self.check_due_at = None;
        self.poll(kv, source)
    }

    /// One polled status check. Errors are logged and leave the state alone,
    /// except an unknown task id, which is dropped.
    pub fn poll(&mut self, kv: &dyn KvStore, source: &dyn AssignmentSource) -> Option<Completion> {
        if self.phase != Phase::Submitted {
            return None;
        }
        let task_id = self.task.as_ref()?.task_id.clone();
        match source.task_status(&task_id) {
            Ok(report) if report.status.is_terminal() => {
                self.complete_task(kv, &task_id, TerminalResult::from_report(report))
            }
            Ok(report) => {
                if let Some(t) = self.task.as_mut() {
                    t.apply_report(&report);
                }
                None
            }
            Err(e) if e.downcast_ref::<UnknownTask>().is_some() => {
                self.abandon(kv, &task_id);
                None
            }
            Err(e) => {
                warn!(target: "assignmentd", %task_id, error = %format!("{e:#}"), "task status check failed");
                None
            }
        }
    }

    /// Re-attach to a task persisted by an earlier session.
    pub fn resume(&mut self, kv: &dyn KvStore, source: &dyn AssignmentSource) -> Option<Completion> {
        let task_id = match kv.kv_get(TASK_ID_KEY) {
            Ok(Some(v)) if !v.trim().is_empty() => v,
            Ok(_) => return None,
            Err(e) => {
                warn!(target: "assignmentd", error = %e, "reading persisted task id failed");
                return None;
            }
        };
        if self.is_completed(&task_id) {
            self.forget_task_id(kv, &task_id);
            return None;
        }
        if self.phase == Phase::Submitted && self.tracks(&task_id) {
            return self.poll(kv, source);
        }

        info!(target: "assignmentd", %task_id, "re-attaching to persisted bulk task");
        self.task = Some(BulkTask::started(task_id.clone(), TaskStatus::pending(), 0));
        self.phase = Phase::Submitted;
        self.check_due_at = None;
        self.last_outcome = None;

        match source.task_status(&task_id) {
            Ok(report) if report.status.is_terminal() => {
                self.complete_task(kv, &task_id, TerminalResult::from_report(report))
            }
            Ok(report) => {
                // Progress is only taken from later events/polls.
                if let Some(t) = self.task.as_mut() {
                    t.status = report.status;
                }
                None
            }
            Err(e) if e.downcast_ref::<UnknownTask>().is_some() => {
                self.abandon(kv, &task_id);
                None
            }
            Err(e) => {
                warn!(target: "assignmentd", %task_id, error = %format!("{e:#}"), "task status check on resume failed");
                None
            }
        }
    }

    /// Single terminal transition shared by both channels. Returns `None` when
    /// the task was already completed or is not the tracked one.
    pub fn complete_task(
        &mut self,
        kv: &dyn KvStore,
        task_id: &str,
        result: TerminalResult,
    ) -> Option<Completion> {
        if self.is_completed(task_id) {
            debug!(target: "assignmentd", %task_id, "task already completed");
            return None;
        }
        if !self.tracks(task_id) {
            return None;
        }
        let task = self.task.as_mut()?;
        if let Some(report) = &result.report {
            task.apply_report(report);
        }
        task.status = result.status.clone();

        let outcome = Outcome::for_task(task, result.details.as_deref());
        self.last_completed = Some(task_id.to_string());
        self.phase = Phase::Completed;
        self.check_due_at = None;
        self.drafts.clear(kv);
        self.forget_task_id(kv, task_id);
        self.last_outcome = Some(outcome.clone());

        info!(target: "assignmentd", %task_id, status = %result.status, "bulk task completed");
        Some(Completion {
            task_id: task_id.to_string(),
            status: result.status,
            outcome,
        })
    }

    fn is_completed(&self, task_id: &str) -> bool {
        self.last_completed.as_deref() == Some(task_id)
    }

    /// The status service does not know the task. Stop tracking it so a new
    /// save is possible. The draft is left untouched.
    fn abandon(&mut self, kv: &dyn KvStore, task_id: &str) {
        warn!(target: "assignmentd", %task_id, "bulk task unknown to status service; no longer tracked");
        self.forget_task_id(kv, task_id);
        self.task = None;
        self.phase = Phase::Idle;
        self.check_due_at = None;
    }

    fn tracks(&self, task_id: &str) -> bool {
        self.task.as_ref().is_some_and(|t| t.task_id == task_id)
    }

    fn forget_task_id(&self, kv: &dyn KvStore, task_id: &str) {
        if let Err(e) = kv.kv_remove(TASK_ID_KEY) {
            warn!(target: "assignmentd", %task_id, error = %e, "clearing persisted task id failed");
        }
    }
}
