//! Single owner of the editing workflow: matrix + baseline, draft slot,
//! confirmation gate and bulk coordinator.

use crate::actions::{self, Action};
use crate::bulk::{BulkCoordinator, BulkView, Completion, Phase, PushEvent, SubmitError};
use crate::config::AssignmentSettings;
use crate::draft::{DraftPersister, KvStore};
use crate::gate::{classify, Classification, ConfirmationGate, GateError, HeldSave};
use crate::matrix::{Matrix, MatrixError};
use crate::source::{AssignmentSource, ClassRow, SourceSnapshot, SubjectRow, SubmitReceipt, TeacherRow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("matrix is not loaded")]
    NotLoaded,
    #[error("data source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("bulk task finished but reload failed: {message}")]
    ReloadAfterCompletion {
        message: String,
        completion: Completion,
    },
    #[error("matrix is stale; load it again before saving")]
    Stale,
    #[error(transparent)]
    Cell(#[from] MatrixError),
    #[error("unknown teacher: {0}")]
    UnknownTeacher(String),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotLoaded => "not_loaded",
            SessionError::SourceUnavailable(_)
            | SessionError::ReloadAfterCompletion { .. }
            | SessionError::Stale => "source_unavailable",
            SessionError::Cell(_) => "not_found",
            SessionError::UnknownTeacher(_) => "bad_params",
            SessionError::Gate(GateError::NothingToSave) => "nothing_to_save",
            SessionError::Gate(GateError::ConfirmationRequired) => "confirmation_required",
            SessionError::Submit(SubmitError::NothingToSave) => "nothing_to_save",
            SessionError::Submit(SubmitError::TaskInFlight { .. }) => "task_in_flight",
            SessionError::Submit(SubmitError::Network(_)) => "submit_failed",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            SessionError::ReloadAfterCompletion { completion, .. } => {
                serde_json::to_value(completion)
                    .ok()
                    .map(|c| serde_json::json!({ "completion": c }))
            }
            SessionError::Submit(SubmitError::TaskInFlight { task_id }) => {
                Some(serde_json::json!({ "taskId": task_id }))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub classes: usize,
    pub subjects: usize,
    pub teachers: usize,
    pub assignments: usize,
    pub restored_edits: usize,
    pub completion: Option<Completion>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftInfo {
    pub saved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixView<'a> {
    pub classes: &'a [ClassRow],
    pub subjects: &'a [SubjectRow],
    pub teachers: &'a [TeacherRow],
    pub cells: &'a Matrix,
    pub dirty_count: usize,
    pub restored_edits: usize,
    pub stale: bool,
    pub draft: Option<DraftInfo>,
    pub pending_confirmation: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPreview {
    pub actions: Vec<Action>,
    pub classification: Classification,
}

struct Loaded {
    snapshot: SourceSnapshot,
    baseline: Matrix,
    current: Matrix,
}

pub struct AssignmentSession {
    loaded: Option<Loaded>,
    drafts: DraftPersister,
    gate: ConfirmationGate,
    bulk: BulkCoordinator,
    restored: usize,
    stale: bool,
}

impl AssignmentSession {
    pub fn new(settings: &AssignmentSettings) -> Self {
        let drafts = DraftPersister::new(settings.draft_ttl());
        Self {
            loaded: None,
            drafts,
            gate: ConfirmationGate::default(),
            bulk: BulkCoordinator::new(drafts, settings.completion_check_delay()),
            restored: 0,
            stale: false,
        }
    }

    pub fn configure(&mut self, settings: &AssignmentSettings) {
        self.drafts = DraftPersister::new(settings.draft_ttl());
        self.bulk
            .configure(self.drafts, settings.completion_check_delay());
    }

    /// Mount: re-attach to a persisted task, build matrix and baseline from a
    /// fresh snapshot, then re-apply a still-valid draft.
    pub fn load(
        &mut self,
        kv: &dyn KvStore,
        source: &dyn AssignmentSource,
        now: DateTime<Utc>,
    ) -> Result<LoadSummary, SessionError> {
        let completion = self.bulk.resume(kv, source);

        let snapshot = match source.load_snapshot() {
            Ok(v) => v,
            Err(e) => {
                let message = format!("{e:#}");
                warn!(target: "assignmentd", error = %message, "matrix load failed");
                return Err(match completion {
                    Some(completion) => {
                        self.mark_stale();
                        SessionError::ReloadAfterCompletion { message, completion }
                    }
                    None => SessionError::SourceUnavailable(message),
                });
            }
        };
        self.install(snapshot);

        self.restored = match self.drafts.load(kv, now) {
            Some(draft) => self
                .loaded
                .as_mut()
                .map(|l| l.current.restore_draft(&draft.matrix))
                .unwrap_or(0),
            None => 0,
        };

        let Some(l) = self.loaded.as_ref() else {
            return Err(SessionError::NotLoaded);
        };
        info!(
            target: "assignmentd",
            classes = l.snapshot.classes.len(),
            subjects = l.snapshot.subjects.len(),
            restored = self.restored,
            "matrix loaded"
        );
        Ok(LoadSummary {
            classes: l.snapshot.classes.len(),
            subjects: l.snapshot.subjects.len(),
            teachers: l.snapshot.teachers.len(),
            assignments: l.snapshot.assignments.len(),
            restored_edits: self.restored,
            completion,
        })
    }

    fn install(&mut self, snapshot: SourceSnapshot) {
        let baseline = Matrix::build(&snapshot.classes, &snapshot.subjects, &snapshot.assignments);
        let current = baseline.snapshot();
        self.loaded = Some(Loaded {
            snapshot,
            baseline,
            current,
        });
        self.gate.cancel();
        self.stale = false;
    }

    pub fn set_cell(
        &mut self,
        kv: &dyn KvStore,
        class_id: &str,
        subject_id: &str,
        teacher_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        let l = self.loaded.as_mut().ok_or(SessionError::NotLoaded)?;
        if let Some(t) = &teacher_id {
            if !l.snapshot.teachers.iter().any(|row| &row.id == t) {
                return Err(SessionError::UnknownTeacher(t.clone()));
            }
        }
        l.current.set_cell(class_id, subject_id, teacher_id)?;
        self.gate.cancel();
        self.drafts.save(kv, &l.current, now);
        Ok(())
    }

    pub fn reset(&mut self, kv: &dyn KvStore) -> Result<(), SessionError> {
        let l = self.loaded.as_mut().ok_or(SessionError::NotLoaded)?;
        l.current = Matrix::reset(&l.baseline);
        self.gate.cancel();
        self.drafts.clear(kv);
        self.restored = 0;
        Ok(())
    }

    pub fn actions(&self) -> Result<ActionPreview, SessionError> {
        let l = self.loaded.as_ref().ok_or(SessionError::NotLoaded)?;
        let actions = actions::generate(&l.current, &l.baseline);
        let classification = classify(&actions);
        Ok(ActionPreview {
            actions,
            classification,
        })
    }

    /// Holds the current diff behind the gate. `Ok(None)` means there is
    /// nothing to save.
    pub fn request_save(&mut self) -> Result<Option<HeldSave>, SessionError> {
        let preview = self.actions()?;
        if self.stale {
            return Err(SessionError::Stale);
        }
        match self.gate.hold(preview.actions) {
            Ok(held) => Ok(Some(held.clone())),
            Err(GateError::NothingToSave) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn cancel_save(&mut self) -> bool {
        self.gate.cancel()
    }

    /// Releases the held list for `token` and submits it. A task that is still
    /// running is refused before the hold is consumed.
    pub fn confirm_save(
        &mut self,
        kv: &dyn KvStore,
        source: &dyn AssignmentSource,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<SubmitReceipt, SessionError> {
        if self.stale {
            return Err(SessionError::Stale);
        }
        if let Some(task) = self.bulk.task() {
            if self.bulk.phase() == Phase::Submitted {
                return Err(SubmitError::TaskInFlight {
                    task_id: task.task_id.clone(),
                }
                .into());
            }
        }
        let actions = self.gate.confirm(token)?;
        Ok(self.bulk.submit(kv, source, &actions, now)?)
    }

    pub fn on_push(
        &mut self,
        kv: &dyn KvStore,
        source: &dyn AssignmentSource,
        event: PushEvent,
    ) -> Option<Completion> {
        let done = self.bulk.on_push(kv, event)?;
        self.after_completion(source);
        Some(done)
    }

    pub fn tick(
        &mut self,
        kv: &dyn KvStore,
        source: &dyn AssignmentSource,
        now: DateTime<Utc>,
    ) -> Option<Completion> {
        let done = self.bulk.tick(kv, source, now)?;
        self.after_completion(source);
        Some(done)
    }

    /// Explicit status check outside the scheduled one.
    pub fn refresh(&mut self, kv: &dyn KvStore, source: &dyn AssignmentSource) -> Option<Completion> {
        let done = self.bulk.poll(kv, source)?;
        self.after_completion(source);
        Some(done)
    }

    fn after_completion(&mut self, source: &dyn AssignmentSource) {
        self.restored = 0;
        if self.loaded.is_none() {
            return;
        }
        match source.load_snapshot() {
            Ok(snapshot) => self.install(snapshot),
            Err(e) => {
                warn!(target: "assignmentd", error = %format!("{e:#}"), "reload after bulk completion failed");
                self.mark_stale();
            }
        }
    }

    /// The submitted edits are applied server-side but the baseline could not
    /// be refreshed. Drop them so they are not diffed and sent a second time.
    fn mark_stale(&mut self) {
        if let Some(l) = self.loaded.as_mut() {
            l.current = Matrix::reset(&l.baseline);
            self.gate.cancel();
            self.stale = true;
        }
    }

    pub fn view(&self, kv: &dyn KvStore, now: DateTime<Utc>) -> Result<MatrixView<'_>, SessionError> {
        let l = self.loaded.as_ref().ok_or(SessionError::NotLoaded)?;
        let draft = self.drafts.load(kv, now).map(|d| DraftInfo {
            saved_at: d.saved_at,
            expires_at: d.saved_at + self.drafts.ttl(),
        });
        Ok(MatrixView {
            classes: &l.snapshot.classes,
            subjects: &l.snapshot.subjects,
            teachers: &l.snapshot.teachers,
            cells: &l.current,
            dirty_count: l.current.dirty_count(),
            restored_edits: self.restored,
            stale: self.stale,
            draft,
            pending_confirmation: self.gate.held().is_some(),
        })
    }

    pub fn bulk_view(&self) -> BulkView {
        self.bulk.view()
    }
}
