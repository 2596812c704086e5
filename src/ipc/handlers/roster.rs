use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::source::AssignmentRow;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must not be empty", key),
        ));
    }
    Ok(s)
}

/// Caller-supplied id, or a fresh one.
fn id_param(params: &serde_json::Value) -> Result<String, HandlerErr> {
    match params.get("id") {
        None | Some(serde_json::Value::Null) => Ok(Uuid::new_v4().to_string()),
        Some(_) => get_required_str(params, "id"),
    }
}

fn insert_failed(e: anyhow::Error, table: &str) -> HandlerErr {
    let constraint = matches!(
        e.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(f, _))
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    );
    HandlerErr {
        code: if constraint { "conflict" } else { "db_insert_failed" },
        message: format!("{e:#}"),
        details: Some(json!({ "table": table })),
    }
}

fn query_failed(e: anyhow::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", format!("{e:#}"))
}

fn list_limit(state: &AppState, params: &serde_json::Value) -> usize {
    let cap = state.settings.list_cap();
    params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|n| (n as usize).clamp(1, cap))
        .unwrap_or(cap)
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = id_param(params)?;
    let name = get_required_str(params, "name")?;
    db::insert_class(conn, &id, &name).map_err(|e| insert_failed(e, "classes"))?;
    Ok(json!({ "classId": id, "name": name }))
}

fn subjects_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = id_param(params)?;
    let name = get_required_str(params, "name")?;
    let code = params
        .get("code")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    db::insert_subject(conn, &id, &name, code.as_deref())
        .map_err(|e| insert_failed(e, "subjects"))?;
    Ok(json!({ "subjectId": id, "name": name, "code": code }))
}

fn teachers_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = id_param(params)?;
    let first_name = get_required_str(params, "firstName")?;
    let last_name = get_required_str(params, "lastName")?;
    let active = match params.get("active") {
        None | Some(serde_json::Value::Null) => true,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| HandlerErr::new("bad_params", "active must be boolean"))?,
    };
    db::insert_teacher(conn, &id, &first_name, &last_name, active)
        .map_err(|e| insert_failed(e, "teachers"))?;
    Ok(json!({ "teacherId": id, "firstName": first_name, "lastName": last_name, "active": active }))
}

fn assignments_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let row = AssignmentRow {
        id: id_param(params)?,
        class_id: get_required_str(params, "classId")?,
        subject_id: get_required_str(params, "subjectId")?,
        teacher_id: get_required_str(params, "teacherId")?,
    };
    if !db::teacher_exists(conn, &row.teacher_id).map_err(query_failed)? {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    }
    if let Some(existing) =
        db::find_assignment_for_cell(conn, &row.class_id, &row.subject_id).map_err(query_failed)?
    {
        return Err(HandlerErr {
            code: "conflict",
            message: "class/subject already has a teacher".into(),
            details: Some(json!({ "assignmentId": existing })),
        });
    }
    db::insert_assignment(conn, &row).map_err(|e| {
        let mut he = insert_failed(e, "teaching_assignments");
        // Remaining constraint here is the class/subject foreign key.
        if he.code == "conflict" {
            he.code = "not_found";
            he.message = "class or subject not found".into();
        }
        he
    })?;
    Ok(json!({ "assignmentId": row.id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let limit = list_limit(state, &req.params);
    let result = match req.method.as_str() {
        "classes.list" => db::list_classes(conn, limit)
            .map(|rows| json!({ "classes": rows })),
        "subjects.list" => db::list_subjects(conn, limit)
            .map(|rows| json!({ "subjects": rows })),
        "teachers.list" => db::list_teachers(conn, limit)
            .map(|rows| json!({ "teachers": rows })),
        _ => db::list_assignments(conn, limit)
            .map(|rows| json!({ "assignments": rows })),
    };
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:#}"), None),
    }
}

fn handle_create(
    state: &mut AppState,
    req: &Request,
    create: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match create(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" | "subjects.list" | "teachers.list" | "assignments.list" => {
            Some(handle_list(state, req))
        }
        "classes.create" => Some(handle_create(state, req, classes_create)),
        "subjects.create" => Some(handle_create(state, req, subjects_create)),
        "teachers.create" => Some(handle_create(state, req, teachers_create)),
        "assignments.create" => Some(handle_create(state, req, assignments_create)),
        _ => None,
    }
}
