use crate::actions::Action;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub has_deletes: bool,
    pub counts: ActionCounts,
}

pub fn classify(actions: &[Action]) -> Classification {
    let mut counts = ActionCounts::default();
    for a in actions {
        match a {
            Action::Create { .. } => counts.create += 1,
            Action::Update { .. } => counts.update += 1,
            Action::Delete { .. } => counts.delete += 1,
        }
    }
    Classification {
        has_deletes: counts.delete > 0,
        counts,
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("nothing to save")]
    NothingToSave,
    #[error("save must be confirmed before it is submitted")]
    ConfirmationRequired,
}

#[derive(Debug, Clone)]
pub struct HeldSave {
    pub token: String,
    pub actions: Vec<Action>,
    pub classification: Classification,
}

/// Holds a computed action list until the user confirms it. The list is
/// released unchanged.
#[derive(Debug, Default)]
pub struct ConfirmationGate {
    held: Option<HeldSave>,
}

impl ConfirmationGate {
    pub fn hold(&mut self, actions: Vec<Action>) -> Result<&HeldSave, GateError> {
        if actions.is_empty() {
            self.held = None;
            return Err(GateError::NothingToSave);
        }
        let classification = classify(&actions);
        let held = self.held.insert(HeldSave {
            token: Uuid::new_v4().to_string(),
            actions,
            classification,
        });
        Ok(&*held)
    }

    pub fn confirm(&mut self, token: &str) -> Result<Vec<Action>, GateError> {
        match self.held.take() {
            Some(h) if h.token == token => Ok(h.actions),
            other => {
                // A wrong token leaves the existing hold in place.
                self.held = other;
                Err(GateError::ConfirmationRequired)
            }
        }
    }

    pub fn cancel(&mut self) -> bool {
        self.held.take().is_some()
    }

    pub fn held(&self) -> Option<&HeldSave> {
        self.held.as_ref()
    }
}
