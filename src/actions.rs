use crate::matrix::{Cell, Matrix};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Create {
        class_id: String,
        subject_id: String,
        teacher_id: String,
    },
    Update {
        assignment_id: String,
        class_id: String,
        subject_id: String,
        teacher_id: String,
    },
    Delete {
        assignment_id: String,
    },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Create { .. } => "create",
            Action::Update { .. } => "update",
            Action::Delete { .. } => "delete",
        }
    }
}

/// Diff the edited matrix against the baseline snapshot.
///
/// Only dirty cells are considered. "Had an assignment" and "same teacher" are
/// judged against the baseline cell, so flipping a cell away and back again
/// yields nothing. Output order is class order, then subject order.
pub fn generate(current: &Matrix, baseline: &Matrix) -> Vec<Action> {
    let mut out = Vec::new();
    for (class_id, subject_id, cell) in current.cells() {
        if !cell.is_dirty {
            continue;
        }
        let base = baseline.cell(class_id, subject_id).unwrap_or(cell);
        if let Some(action) = diff_cell(class_id, subject_id, base, cell) {
            out.push(action);
        }
    }
    out
}

fn diff_cell(class_id: &str, subject_id: &str, base: &Cell, cell: &Cell) -> Option<Action> {
    let original = base.assignment.as_ref();
    match (original, cell.selected_teacher_id.as_ref()) {
        (Some(a), Some(teacher_id)) if *teacher_id == a.teacher_id => None,
        (Some(a), Some(teacher_id)) => Some(Action::Update {
            assignment_id: a.id.clone(),
            class_id: class_id.to_string(),
            subject_id: subject_id.to_string(),
            teacher_id: teacher_id.clone(),
        }),
        (Some(a), None) => Some(Action::Delete {
            assignment_id: a.id.clone(),
        }),
        (None, Some(teacher_id)) => Some(Action::Create {
            class_id: class_id.to_string(),
            subject_id: subject_id.to_string(),
            teacher_id: teacher_id.clone(),
        }),
        (None, None) => None,
    }
}
