use super::types::AppState;
use crate::executor;
use crate::source::SqliteSource;
use chrono::Utc;
use tracing::{debug, warn};

/// Background step run after every request.
///
/// Push events published by the previous step are delivered first, so the
/// push channel always trails the executor by one step and the scheduled
/// status check can win the race. Then the executor applies one chunk and the
/// coordinator timer is ticked.
///
/// There is no timer thread: a due status check fires on the first request
/// after its due time.
pub fn pump(state: &mut AppState) {
    let Some(conn) = state.db.as_ref() else {
        return;
    };
    let source = SqliteSource::new(conn, state.settings.list_cap());

    while let Ok(event) = state.push_rx.try_recv() {
        state.session.on_push(conn, &source, event);
    }

    match executor::run_pending(conn, state.settings.chunk_size()) {
        Ok(events) if state.settings.deliver_push_events => {
            for event in events {
                if state.push_tx.send(event).is_err() {
                    warn!(target: "assignmentd", "push channel closed");
                    break;
                }
            }
        }
        Ok(events) => {
            if !events.is_empty() {
                debug!(target: "assignmentd", dropped = events.len(), "push delivery disabled; events dropped");
            }
        }
        Err(e) => warn!(target: "assignmentd", error = %format!("{e:#}"), "bulk executor step failed"),
    }

    state.session.tick(conn, &source, Utc::now());
}
