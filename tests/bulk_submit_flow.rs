use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_assignmentd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn assignmentd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value.pointer("/error/code").and_then(|v| v.as_str())
}

// classes=[C1], subjects=[S1,S2], teachers=[T1,T2,T3], (C1,S1) -> T1 as A1
fn seed_roster(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) {
    let _ = request_ok(stdin, reader, "seed-c1", "classes.create", json!({ "id": "C1", "name": "7A" }));
    let _ = request_ok(stdin, reader, "seed-s1", "subjects.create", json!({ "id": "S1", "name": "Math", "code": "MTH" }));
    let _ = request_ok(stdin, reader, "seed-s2", "subjects.create", json!({ "id": "S2", "name": "Science" }));
    for (id, first, last) in [("T1", "Ada", "Lovelace"), ("T2", "Alan", "Turing"), ("T3", "Grace", "Hopper")] {
        let _ = request_ok(
            stdin,
            reader,
            &format!("seed-{}", id),
            "teachers.create",
            json!({ "id": id, "firstName": first, "lastName": last }),
        );
    }
    let _ = request_ok(
        stdin,
        reader,
        "seed-a1",
        "assignments.create",
        json!({ "id": "A1", "classId": "C1", "subjectId": "S1", "teacherId": "T1" }),
    );
}

fn open_loaded(
    prefix: &str,
    settings: serde_json::Value,
) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "settings",
        "setup.update",
        json!({ "section": "assignments", "patch": settings }),
    );
    seed_roster(&mut stdin, &mut reader);
    let _ = request_ok(&mut stdin, &mut reader, "load", "matrix.load", json!({}));
    (child, stdin, reader)
}

fn set_cell(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    subject_id: &str,
    teacher_id: Option<&str>,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "matrix.setCell",
        json!({ "classId": class_id, "subjectId": subject_id, "teacherId": teacher_id }),
    );
}

fn save_and_confirm(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let held = request_ok(stdin, reader, "save", "matrix.save", json!({}));
    let token = held.get("token").and_then(|v| v.as_str()).expect("token");
    let receipt = request_ok(
        stdin,
        reader,
        "confirm",
        "matrix.confirmSave",
        json!({ "token": token }),
    );
    receipt
        .get("taskId")
        .and_then(|v| v.as_str())
        .expect("taskId")
        .to_string()
}

fn phase(status: &serde_json::Value) -> &str {
    status.get("phase").and_then(|v| v.as_str()).unwrap_or("")
}

/// Each request gives the sidecar one background step; keep asking until the
/// task is done.
fn wait_completed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    for i in 0..20 {
        let status = request_ok(stdin, reader, &format!("wait-{}", i), "bulk.status", json!({}));
        if phase(&status) == "completed" {
            return status;
        }
    }
    panic!("bulk task never completed");
}

#[test]
fn push_channel_completes_task_and_reloads_matrix() {
    let (mut child, mut stdin, mut reader) = open_loaded(
        "assignmentd-bulk-push",
        json!({ "completionCheckDelayMs": 60000 }),
    );
    set_cell(&mut stdin, &mut reader, "1", "C1", "S2", Some("T2"));
    set_cell(&mut stdin, &mut reader, "2", "C1", "S1", Some("T3"));
    let task_id = save_and_confirm(&mut stdin, &mut reader);

    let status = wait_completed(&mut stdin, &mut reader);
    assert_eq!(status.pointer("/task/taskId").and_then(|v| v.as_str()), Some(task_id.as_str()));
    assert_eq!(status.pointer("/task/status").and_then(|v| v.as_str()), Some("SUCCESS"));
    assert_eq!(status.pointer("/task/successCount").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(status.pointer("/task/totalCount").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(status.pointer("/lastOutcome/level").and_then(|v| v.as_str()), Some("success"));
    assert!(status.get("checkDueAt").map(|v| v.is_null()).unwrap_or(false));

    let view = request_ok(&mut stdin, &mut reader, "3", "matrix.get", json!({}));
    assert_eq!(view.get("dirtyCount").and_then(|v| v.as_u64()), Some(0));
    assert!(view.get("draft").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        view.pointer("/cells/C1/S1/selectedTeacherId").and_then(|v| v.as_str()),
        Some("T3")
    );
    assert_eq!(
        view.pointer("/cells/C1/S2/selectedTeacherId").and_then(|v| v.as_str()),
        Some("T2")
    );
    assert!(view.pointer("/cells/C1/S2/assignment/id").and_then(|v| v.as_str()).is_some());

    let saved = request_ok(&mut stdin, &mut reader, "4", "matrix.save", json!({}));
    assert_eq!(saved.get("notice").and_then(|v| v.as_str()), Some("nothing_to_save"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn scheduled_poll_completes_task_when_push_is_dropped() {
    let (mut child, mut stdin, mut reader) = open_loaded(
        "assignmentd-bulk-poll",
        json!({ "deliverPushEvents": false, "completionCheckDelayMs": 0 }),
    );
    set_cell(&mut stdin, &mut reader, "1", "C1", "S1", None);
    let task_id = save_and_confirm(&mut stdin, &mut reader);

    let status = wait_completed(&mut stdin, &mut reader);
    assert_eq!(status.pointer("/task/taskId").and_then(|v| v.as_str()), Some(task_id.as_str()));
    assert_eq!(status.pointer("/task/processedCount").and_then(|v| v.as_u64()), Some(1));

    let assignments = request_ok(&mut stdin, &mut reader, "2", "assignments.list", json!({}));
    assert_eq!(
        assignments.get("assignments").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn poll_wins_race_and_late_push_is_ignored() {
    let (mut child, mut stdin, mut reader) = open_loaded(
        "assignmentd-bulk-race",
        json!({ "completionCheckDelayMs": 0 }),
    );
    set_cell(&mut stdin, &mut reader, "1", "C1", "S2", Some("T2"));
    set_cell(&mut stdin, &mut reader, "2", "C1", "S1", Some("T3"));
    set_cell(&mut stdin, &mut reader, "3", "C1", "S1", None);
    let task_id = save_and_confirm(&mut stdin, &mut reader);

    // The executor and the zero-delay check both ran right after confirm; the
    // executor's push events are still queued.
    let first = request_ok(&mut stdin, &mut reader, "4", "bulk.status", json!({}));
    assert_eq!(phase(&first), "completed");

    // Queued progress/complete events were drained after the previous request.
    let second = request_ok(&mut stdin, &mut reader, "5", "bulk.status", json!({}));
    assert_eq!(second.get("task"), first.get("task"));
    assert_eq!(second.get("lastOutcome"), first.get("lastOutcome"));

    let late = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "bulk.pushEvent",
        json!({ "type": "bulk_update_complete", "task_id": task_id, "status": "SUCCESS" }),
    );
    assert!(late.get("completion").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(late.pointer("/status/lastOutcome"), first.get("lastOutcome"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn conflicting_action_yields_partial_success_warning() {
    let (mut child, mut stdin, mut reader) = open_loaded("assignmentd-bulk-partial", json!({}));

    // Someone else fills (C1,S2) after the matrix was loaded.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assignments.create",
        json!({ "classId": "C1", "subjectId": "S2", "teacherId": "T3" }),
    );
    set_cell(&mut stdin, &mut reader, "2", "C1", "S2", Some("T2"));
    set_cell(&mut stdin, &mut reader, "3", "C1", "S1", Some("T3"));
    let _ = save_and_confirm(&mut stdin, &mut reader);

    let status = wait_completed(&mut stdin, &mut reader);
    assert_eq!(
        status.pointer("/task/status").and_then(|v| v.as_str()),
        Some("PARTIAL_SUCCESS")
    );
    assert_eq!(status.pointer("/lastOutcome/level").and_then(|v| v.as_str()), Some("warning"));
    assert_eq!(
        status.pointer("/lastOutcome/message").and_then(|v| v.as_str()),
        Some("Saved 1 of 2 change(s); 1 failed.")
    );
    assert_eq!(status.pointer("/task/errors/0/code").and_then(|v| v.as_str()), Some("conflict"));
    assert_eq!(status.pointer("/task/errors/0/index").and_then(|v| v.as_u64()), Some(1));

    // Reloaded from the workspace, so the competing assignment is visible.
    let view = request_ok(&mut stdin, &mut reader, "4", "matrix.get", json!({}));
    assert_eq!(
        view.pointer("/cells/C1/S2/selectedTeacherId").and_then(|v| v.as_str()),
        Some("T3")
    );
    assert_eq!(view.get("dirtyCount").and_then(|v| v.as_u64()), Some(0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn progress_events_update_counters_chunk_by_chunk() {
    let workspace = temp_dir("assignmentd-bulk-progress");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "settings",
        "setup.update",
        json!({
            "section": "assignments",
            "patch": { "executorChunkSize": 1, "completionCheckDelayMs": 60000 }
        }),
    );
    seed_roster(&mut stdin, &mut reader);
    let _ = request_ok(&mut stdin, &mut reader, "c2", "classes.create", json!({ "id": "C2", "name": "8B" }));
    let _ = request_ok(&mut stdin, &mut reader, "load", "matrix.load", json!({}));

    set_cell(&mut stdin, &mut reader, "1", "C1", "S2", Some("T2"));
    set_cell(&mut stdin, &mut reader, "2", "C2", "S1", Some("T1"));
    set_cell(&mut stdin, &mut reader, "3", "C2", "S2", Some("T3"));
    let _ = save_and_confirm(&mut stdin, &mut reader);

    let mut seen = Vec::new();
    let mut done = None;
    for i in 0..20 {
        let status = request_ok(&mut stdin, &mut reader, &format!("p{}", i), "bulk.status", json!({}));
        if phase(&status) == "completed" {
            done = Some(status);
            break;
        }
        assert_eq!(phase(&status), "submitted");
        seen.push(
            status
                .pointer("/task/processedCount")
                .and_then(|v| v.as_u64())
                .expect("processedCount"),
        );
    }
    let done = done.expect("completed");

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "counters went backwards: {:?}", seen);
    assert!(seen.iter().any(|&n| n > 0 && n < 3), "no intermediate progress: {:?}", seen);
    assert_eq!(done.pointer("/task/processedCount").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(done.pointer("/task/status").and_then(|v| v.as_str()), Some("SUCCESS"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn host_push_events_for_other_tasks_are_ignored() {
    let (mut child, mut stdin, mut reader) = open_loaded(
        "assignmentd-bulk-foreign",
        json!({ "completionCheckDelayMs": 60000, "deliverPushEvents": false }),
    );
    set_cell(&mut stdin, &mut reader, "1", "C1", "S2", Some("T2"));
    let task_id = save_and_confirm(&mut stdin, &mut reader);

    let foreign = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "bulk.pushEvent",
        json!({
            "type": "bulk_update_progress",
            "task_id": "someone-else",
            "processed": 7,
            "total": 9,
            "success": 7,
            "failed": 0
        }),
    );
    assert!(foreign.get("completion").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(
        foreign.pointer("/status/task/processedCount").and_then(|v| v.as_u64()),
        Some(0)
    );

    let bad = request(
        &mut stdin,
        &mut reader,
        "3",
        "bulk.pushEvent",
        json!({ "type": "bulk_update_teleport", "task_id": task_id }),
    );
    assert_eq!(error_code(&bad), Some("bad_params"));

    // Push is disabled and the check is far off, so the host event completes it.
    let done = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "bulk.pushEvent",
        json!({ "type": "bulk_update_complete", "task_id": task_id, "status": "SUCCESS" }),
    );
    assert_eq!(done.pointer("/completion/status").and_then(|v| v.as_str()), Some("SUCCESS"));
    assert_eq!(done.pointer("/status/phase").and_then(|v| v.as_str()), Some("completed"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn explicit_refresh_polls_task_status() {
    let (mut child, mut stdin, mut reader) = open_loaded(
        "assignmentd-bulk-refresh",
        json!({ "completionCheckDelayMs": 60000, "deliverPushEvents": false }),
    );
    set_cell(&mut stdin, &mut reader, "1", "C1", "S1", Some("T2"));
    let _ = save_and_confirm(&mut stdin, &mut reader);

    let pending = request_ok(&mut stdin, &mut reader, "2", "bulk.status", json!({}));
    assert_eq!(phase(&pending), "submitted");

    let refreshed = request_ok(&mut stdin, &mut reader, "3", "bulk.refresh", json!({}));
    assert_eq!(
        refreshed.pointer("/completion/status").and_then(|v| v.as_str()),
        Some("SUCCESS")
    );
    assert_eq!(
        refreshed.pointer("/status/phase").and_then(|v| v.as_str()),
        Some("completed")
    );

    let again = request_ok(&mut stdin, &mut reader, "4", "bulk.refresh", json!({}));
    assert!(again.get("completion").map(|v| v.is_null()).unwrap_or(false));

    drop(stdin);
    let _ = child.wait();
}
