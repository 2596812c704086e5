use crate::source::{AssignmentRow, ClassRow, SubjectRow};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("cell not found: class {class_id} / subject {subject_id}")]
    CellNotFound {
        class_id: String,
        subject_id: String,
    },
}

/// The existing server-side assignment a cell was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRef {
    pub id: String,
    pub teacher_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    #[serde(default)]
    pub assignment: Option<AssignmentRef>,
    #[serde(default)]
    pub selected_teacher_id: Option<String>,
    #[serde(default)]
    pub is_dirty: bool,
    #[serde(default)]
    pub original_assignment_id: Option<String>,
}

/// Class-major grid of cells. Iteration order is construction order: classes in
/// source order, then subjects in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Matrix {
    rows: IndexMap<String, IndexMap<String, Cell>>,
}

impl Matrix {
    pub fn build(
        classes: &[ClassRow],
        subjects: &[SubjectRow],
        assignments: &[AssignmentRow],
    ) -> Matrix {
        let mut rows: IndexMap<String, IndexMap<String, Cell>> =
            IndexMap::with_capacity(classes.len());
        for class in classes {
            let row = subjects
                .iter()
                .map(|s| (s.id.clone(), Cell::default()))
                .collect::<IndexMap<_, _>>();
            rows.insert(class.id.clone(), row);
        }

        for a in assignments {
            // Assignments for classes/subjects outside the grid are dropped.
            let Some(cell) = rows
                .get_mut(&a.class_id)
                .and_then(|row| row.get_mut(&a.subject_id))
            else {
                continue;
            };
            *cell = Cell {
                assignment: Some(AssignmentRef {
                    id: a.id.clone(),
                    teacher_id: a.teacher_id.clone(),
                }),
                selected_teacher_id: Some(a.teacher_id.clone()),
                is_dirty: false,
                original_assignment_id: Some(a.id.clone()),
            };
        }

        Matrix { rows }
    }

    /// Typed deep copy. Cells own all of their data, so the copy shares nothing
    /// with `self` and later edits on either side stay isolated.
    pub fn snapshot(&self) -> Matrix {
        Matrix {
            rows: self
                .rows
                .iter()
                .map(|(class_id, row)| {
                    let row = row
                        .iter()
                        .map(|(subject_id, cell)| (subject_id.clone(), cell.clone()))
                        .collect::<IndexMap<_, _>>();
                    (class_id.clone(), row)
                })
                .collect(),
        }
    }

    pub fn reset(baseline: &Matrix) -> Matrix {
        baseline.snapshot()
    }

    /// Replaces the selection and marks the cell dirty, even when the value is
    /// unchanged. No-op suppression happens when actions are generated.
    pub fn set_cell(
        &mut self,
        class_id: &str,
        subject_id: &str,
        teacher_id: Option<String>,
    ) -> Result<(), MatrixError> {
        let cell = self
            .rows
            .get_mut(class_id)
            .and_then(|row| row.get_mut(subject_id))
            .ok_or_else(|| MatrixError::CellNotFound {
                class_id: class_id.to_string(),
                subject_id: subject_id.to_string(),
            })?;
        cell.selected_teacher_id = teacher_id;
        cell.is_dirty = true;
        Ok(())
    }

    pub fn cell(&self, class_id: &str, subject_id: &str) -> Option<&Cell> {
        self.rows.get(class_id).and_then(|row| row.get(subject_id))
    }

    pub fn has_any_dirty(&self) -> bool {
        self.cells().any(|(_, _, c)| c.is_dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.cells().filter(|(_, _, c)| c.is_dirty).count()
    }

    pub fn cells(&self) -> impl Iterator<Item = (&str, &str, &Cell)> {
        self.rows.iter().flat_map(|(class_id, row)| {
            row.iter()
                .map(move |(subject_id, cell)| (class_id.as_str(), subject_id.as_str(), cell))
        })
    }

    /// Re-applies the dirty selections of a saved draft onto a freshly built
    /// grid. Cells that no longer exist are skipped. Returns how many edits were
    /// restored.
    pub fn restore_draft(&mut self, draft: &Matrix) -> usize {
        let mut restored = 0usize;
        for (class_id, subject_id, saved) in draft.cells() {
            if !saved.is_dirty {
                continue;
            }
            if self
                .set_cell(class_id, subject_id, saved.selected_teacher_id.clone())
                .is_ok()
            {
                restored += 1;
            }
        }
        restored
    }
}
