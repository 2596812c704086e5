//! Boundary types for the data source and task status services.

use crate::actions::Action;
use crate::bulk::TaskStatus;
use crate::{db, executor};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRow {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRow {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRow {
    pub id: String,
    pub class_id: String,
    pub subject_id: String,
    pub teacher_id: String,
}

/// Everything the matrix is built from, fetched in one go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSnapshot {
    pub classes: Vec<ClassRow>,
    pub subjects: Vec<SubjectRow>,
    pub teachers: Vec<TeacherRow>,
    pub assignments: Vec<AssignmentRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionError {
    pub index: usize,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusReport {
    pub status: TaskStatus,
    pub processed: usize,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<ActionError>,
    pub details: Option<String>,
}

/// The task status service has no record of the task id. Unlike a failed
/// request this is final: retrying will not make the task appear.
#[derive(Debug, thiserror::Error)]
#[error("bulk task not found: {0}")]
pub struct UnknownTask(pub String);

pub trait AssignmentSource {
    fn load_snapshot(&self) -> anyhow::Result<SourceSnapshot>;
    fn submit_bulk(&self, actions: &[Action]) -> anyhow::Result<SubmitReceipt>;
    fn task_status(&self, task_id: &str) -> anyhow::Result<TaskStatusReport>;
}

/// Source backed by the workspace database and the local task executor.
pub struct SqliteSource<'a> {
    conn: &'a Connection,
    list_cap: usize,
}

impl<'a> SqliteSource<'a> {
    pub fn new(conn: &'a Connection, list_cap: usize) -> Self {
        Self { conn, list_cap }
    }
}

impl AssignmentSource for SqliteSource<'_> {
    fn load_snapshot(&self) -> anyhow::Result<SourceSnapshot> {
        let snapshot = SourceSnapshot {
            classes: db::list_classes(self.conn, self.list_cap)?,
            subjects: db::list_subjects(self.conn, self.list_cap)?,
            teachers: db::list_teachers(self.conn, self.list_cap)?,
            assignments: db::list_assignments(self.conn, self.list_cap)?,
        };
        debug!(
            target: "assignmentd",
            classes = snapshot.classes.len(),
            subjects = snapshot.subjects.len(),
            teachers = snapshot.teachers.len(),
            assignments = snapshot.assignments.len(),
            "source snapshot loaded"
        );
        Ok(snapshot)
    }

    fn submit_bulk(&self, actions: &[Action]) -> anyhow::Result<SubmitReceipt> {
        executor::enqueue(self.conn, actions)
    }

    fn task_status(&self, task_id: &str) -> anyhow::Result<TaskStatusReport> {
        executor::task_status(self.conn, task_id)
    }
}
