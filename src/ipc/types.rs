use std::path::PathBuf;
use std::sync::mpsc::{Receiver, Sender};

use crate::bulk::PushEvent;
use crate::config::AssignmentSettings;
use crate::session::AssignmentSession;
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    /// Process-level defaults (env overrides applied); workspace settings are
    /// merged over these on `workspace.select`.
    pub base_settings: AssignmentSettings,
    pub settings: AssignmentSettings,
    pub session: AssignmentSession,
    pub push_tx: Sender<PushEvent>,
    pub push_rx: Receiver<PushEvent>,
}

impl AppState {
    pub fn new(base_settings: AssignmentSettings) -> Self {
        let (push_tx, push_rx) = std::sync::mpsc::channel();
        Self {
            workspace: None,
            db: None,
            session: AssignmentSession::new(&base_settings),
            settings: base_settings.clone(),
            base_settings,
            push_tx,
            push_rx,
        }
    }
}
