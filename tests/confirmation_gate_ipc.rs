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

fn open_loaded(prefix: &str) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    seed_roster(&mut stdin, &mut reader);
    let _ = request_ok(&mut stdin, &mut reader, "load", "matrix.load", json!({}));
    (child, stdin, reader)
}

#[test]
fn save_with_no_edits_is_a_notice_not_an_error() {
    let (mut child, mut stdin, mut reader) = open_loaded("assignmentd-gate-empty");

    let saved = request_ok(&mut stdin, &mut reader, "1", "matrix.save", json!({}));
    assert_eq!(saved.get("notice").and_then(|v| v.as_str()), Some("nothing_to_save"));
    assert!(saved.get("token").is_none());

    // Touched but reverted is still nothing to save.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "matrix.setCell",
        json!({ "classId": "C1", "subjectId": "S1", "teacherId": "T1" }),
    );
    let saved = request_ok(&mut stdin, &mut reader, "3", "matrix.save", json!({}));
    assert_eq!(saved.get("notice").and_then(|v| v.as_str()), Some("nothing_to_save"));

    let status = request_ok(&mut stdin, &mut reader, "4", "bulk.status", json!({}));
    assert_eq!(status.get("phase").and_then(|v| v.as_str()), Some("idle"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn deletes_are_flagged_and_submission_needs_the_token() {
    let (mut child, mut stdin, mut reader) = open_loaded("assignmentd-gate-deletes");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "matrix.setCell",
        json!({ "classId": "C1", "subjectId": "S1", "teacherId": null }),
    );

    let held = request_ok(&mut stdin, &mut reader, "2", "matrix.save", json!({}));
    assert_eq!(held.get("requiresConfirmation").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        held.pointer("/classification/hasDeletes").and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        held.pointer("/actions/0"),
        Some(&json!({ "type": "delete", "assignment_id": "A1" }))
    );
    let token = held.get("token").and_then(|v| v.as_str()).expect("token").to_string();

    let missing = request(&mut stdin, &mut reader, "3", "matrix.confirmSave", json!({}));
    assert_eq!(error_code(&missing), Some("bad_params"));

    let wrong = request(
        &mut stdin,
        &mut reader,
        "4",
        "matrix.confirmSave",
        json!({ "token": "not-the-token" }),
    );
    assert_eq!(error_code(&wrong), Some("confirmation_required"));
    let status = request_ok(&mut stdin, &mut reader, "5", "bulk.status", json!({}));
    assert_eq!(status.get("phase").and_then(|v| v.as_str()), Some("idle"));

    // A wrong token leaves the hold in place.
    let view = request_ok(&mut stdin, &mut reader, "6", "matrix.get", json!({}));
    assert_eq!(view.get("pendingConfirmation").and_then(|v| v.as_bool()), Some(true));

    let receipt = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "matrix.confirmSave",
        json!({ "token": token }),
    );
    assert!(receipt.get("taskId").and_then(|v| v.as_str()).is_some());
    assert_eq!(receipt.get("status").and_then(|v| v.as_str()), Some("PENDING"));

    // Token is single use.
    let replay = request(
        &mut stdin,
        &mut reader,
        "8",
        "matrix.confirmSave",
        json!({ "token": token }),
    );
    assert!(matches!(
        error_code(&replay),
        Some("confirmation_required") | Some("task_in_flight")
    ));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn editing_or_cancelling_drops_the_hold() {
    let (mut child, mut stdin, mut reader) = open_loaded("assignmentd-gate-cancel");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "matrix.setCell",
        json!({ "classId": "C1", "subjectId": "S2", "teacherId": "T2" }),
    );
    let held = request_ok(&mut stdin, &mut reader, "2", "matrix.save", json!({}));
    assert_eq!(
        held.pointer("/classification/hasDeletes").and_then(|v| v.as_bool()),
        Some(false)
    );
    let token = held.get("token").and_then(|v| v.as_str()).expect("token").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "matrix.setCell",
        json!({ "classId": "C1", "subjectId": "S1", "teacherId": "T3" }),
    );
    let stale = request(
        &mut stdin,
        &mut reader,
        "4",
        "matrix.confirmSave",
        json!({ "token": token }),
    );
    assert_eq!(error_code(&stale), Some("confirmation_required"));

    let _ = request_ok(&mut stdin, &mut reader, "5", "matrix.save", json!({}));
    let cancelled = request_ok(&mut stdin, &mut reader, "6", "matrix.cancelSave", json!({}));
    assert_eq!(cancelled.get("cancelled").and_then(|v| v.as_bool()), Some(true));
    let again = request_ok(&mut stdin, &mut reader, "7", "matrix.cancelSave", json!({}));
    assert_eq!(again.get("cancelled").and_then(|v| v.as_bool()), Some(false));

    let view = request_ok(&mut stdin, &mut reader, "8", "matrix.get", json!({}));
    assert_eq!(view.get("pendingConfirmation").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(view.get("dirtyCount").and_then(|v| v.as_u64()), Some(2));

    drop(stdin);
    let _ = child.wait();
}
