use crate::bulk::PushEvent;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::source::SqliteSource;
use serde_json::json;

fn handle_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    match serde_json::to_value(state.session.bulk_view()) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn handle_refresh(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let source = SqliteSource::new(conn, state.settings.list_cap());
    let completion = state.session.refresh(conn, &source);
    ok(
        &req.id,
        json!({
            "completion": completion,
            "status": state.session.bulk_view(),
        }),
    )
}

/// Push event delivered by the host instead of the local executor.
fn handle_push_event(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let event: PushEvent = match serde_json::from_value(req.params.clone()) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", format!("invalid push event: {}", e), None),
    };
    let source = SqliteSource::new(conn, state.settings.list_cap());
    let completion = state.session.on_push(conn, &source, event);
    ok(
        &req.id,
        json!({
            "completion": completion,
            "status": state.session.bulk_view(),
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "bulk.status" => Some(handle_status(state, req)),
        "bulk.refresh" => Some(handle_refresh(state, req)),
        "bulk.pushEvent" => Some(handle_push_event(state, req)),
        _ => None,
    }
}
