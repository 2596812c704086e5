use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::source::SqliteSource;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

fn to_ok<T: Serialize>(id: &str, value: &T) -> serde_json::Value {
    match serde_json::to_value(value) {
        Ok(v) => ok(id, v),
        Err(e) => err(id, "internal", e.to_string(), None),
    }
}

fn required_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn handle_load(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let source = SqliteSource::new(conn, state.settings.list_cap());
    match state.session.load(conn, &source, Utc::now()) {
        Ok(summary) => to_ok(&req.id, &summary),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match state.session.view(conn, Utc::now()) {
        Ok(view) => to_ok(&req.id, &view),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

type CellEdit<'a> = (&'a str, &'a str, Option<String>);

fn parse_set_cell(params: &serde_json::Value) -> Result<CellEdit<'_>, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let subject_id = required_str(params, "subjectId")?;
    let teacher_id = match params.get("teacherId") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(_) => {
            return Err(HandlerErr::new(
                "bad_params",
                "teacherId must be a non-empty string or null",
            ))
        }
    };
    Ok((class_id, subject_id, teacher_id))
}

fn handle_set_cell(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let parsed = parse_set_cell(&req.params);
    let (class_id, subject_id, teacher_id) = match parsed {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = state
        .session
        .set_cell(conn, class_id, subject_id, teacher_id, Utc::now())
    {
        return HandlerErr::from(e).response(&req.id);
    }
    match state.session.view(conn, Utc::now()) {
        Ok(view) => ok(
            &req.id,
            json!({ "dirtyCount": view.dirty_count, "draftSaved": view.draft.is_some() }),
        ),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn handle_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match state.session.reset(conn) {
        Ok(()) => ok(&req.id, json!({ "dirtyCount": 0 })),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn handle_actions(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.session.actions() {
        Ok(preview) => to_ok(&req.id, &preview),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn handle_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.session.request_save() {
        Ok(None) => ok(
            &req.id,
            json!({ "notice": "nothing_to_save", "actions": [] }),
        ),
        Ok(Some(held)) => ok(
            &req.id,
            json!({
                "requiresConfirmation": true,
                "token": held.token,
                "actions": held.actions,
                "classification": held.classification,
            }),
        ),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn handle_confirm_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let token = match required_str(&req.params, "token") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let source = SqliteSource::new(conn, state.settings.list_cap());
    match state.session.confirm_save(conn, &source, token, Utc::now()) {
        Ok(receipt) => to_ok(&req.id, &receipt),
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn handle_cancel_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, json!({ "cancelled": state.session.cancel_save() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "matrix.load" => Some(handle_load(state, req)),
        "matrix.get" => Some(handle_get(state, req)),
        "matrix.setCell" => Some(handle_set_cell(state, req)),
        "matrix.reset" => Some(handle_reset(state, req)),
        "matrix.actions" => Some(handle_actions(state, req)),
        "matrix.save" => Some(handle_save(state, req)),
        "matrix.confirmSave" => Some(handle_confirm_save(state, req)),
        "matrix.cancelSave" => Some(handle_cancel_save(state, req)),
        _ => None,
    }
}
