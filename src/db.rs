use crate::draft::KvStore;
use crate::source::{AssignmentRow, ClassRow, SubjectRow, TeacherRow};
use anyhow::Context;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "assignmentd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT,
            sort_order INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teaching_assignments(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            UNIQUE(class_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teaching_assignments_teacher ON teaching_assignments(teacher_id)",
        [],
    )?;

    // Server side of the bulk workflow: one row per submitted batch.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bulk_tasks(
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            total INTEGER NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            success INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            errors_json TEXT NOT NULL DEFAULT '[]',
            actions_json TEXT NOT NULL,
            details TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bulk_tasks_status ON bulk_tasks(status)",
        [],
    )?;
    ensure_bulk_tasks_columns(conn)?;
    ensure_teaching_assignments_updated_at(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// Workspaces created before per-action errors and completion details existed.
fn ensure_bulk_tasks_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "bulk_tasks", "errors_json")? {
        conn.execute(
            "ALTER TABLE bulk_tasks ADD COLUMN errors_json TEXT NOT NULL DEFAULT '[]'",
            [],
        )?;
    }
    if !table_has_column(conn, "bulk_tasks", "details")? {
        conn.execute("ALTER TABLE bulk_tasks ADD COLUMN details TEXT", [])?;
    }
    Ok(())
}

fn ensure_teaching_assignments_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "teaching_assignments", "updated_at")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE teaching_assignments ADD COLUMN updated_at TEXT",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s).with_context(|| {
            format!("settings value for {} is not valid json", key)
        })?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

impl KvStore for Connection {
    fn kv_get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |r| r.get(0))
            .optional()?)
    }

    fn kv_set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.execute(
            "INSERT INTO kv(key, value, updated_at) VALUES(?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            (key, value, Utc::now().to_rfc3339()),
        )?;
        Ok(())
    }

    fn kv_remove(&self, key: &str) -> anyhow::Result<()> {
        self.execute("DELETE FROM kv WHERE key = ?", [key])?;
        Ok(())
    }
}

fn next_sort_order(conn: &Connection, table: &str) -> anyhow::Result<i64> {
    let sql = format!("SELECT COALESCE(MAX(sort_order) + 1, 0) FROM {}", table);
    Ok(conn.query_row(&sql, [], |r| r.get(0))?)
}

pub fn list_classes(conn: &Connection, limit: usize) -> anyhow::Result<Vec<ClassRow>> {
    let mut stmt = conn.prepare("SELECT id, name FROM classes ORDER BY sort_order, rowid LIMIT ?")?;
    let rows = stmt
        .query_map([limit as i64], |r| {
            Ok(ClassRow {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_class(conn: &Connection, id: &str, name: &str) -> anyhow::Result<()> {
    let sort_order = next_sort_order(conn, "classes")?;
    conn.execute(
        "INSERT INTO classes(id, name, sort_order) VALUES(?, ?, ?)",
        (id, name, sort_order),
    )?;
    Ok(())
}

pub fn list_subjects(conn: &Connection, limit: usize) -> anyhow::Result<Vec<SubjectRow>> {
    let mut stmt =
        conn.prepare("SELECT id, name, code FROM subjects ORDER BY sort_order, rowid LIMIT ?")?;
    let rows = stmt
        .query_map([limit as i64], |r| {
            Ok(SubjectRow {
                id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_subject(
    conn: &Connection,
    id: &str,
    name: &str,
    code: Option<&str>,
) -> anyhow::Result<()> {
    let sort_order = next_sort_order(conn, "subjects")?;
    conn.execute(
        "INSERT INTO subjects(id, name, code, sort_order) VALUES(?, ?, ?, ?)",
        (id, name, code, sort_order),
    )?;
    Ok(())
}

pub fn list_teachers(conn: &Connection, limit: usize) -> anyhow::Result<Vec<TeacherRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, active FROM teachers
         ORDER BY last_name, first_name, rowid LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit as i64], |r| {
            let active: i64 = r.get(3)?;
            Ok(TeacherRow {
                id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                active: active != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_teacher(
    conn: &Connection,
    id: &str,
    first_name: &str,
    last_name: &str,
    active: bool,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO teachers(id, first_name, last_name, active) VALUES(?, ?, ?, ?)",
        (id, first_name, last_name, active as i64),
    )?;
    Ok(())
}

pub fn teacher_exists(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let v: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    Ok(v.is_some())
}

pub fn list_assignments(conn: &Connection, limit: usize) -> anyhow::Result<Vec<AssignmentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, class_id, subject_id, teacher_id FROM teaching_assignments
         ORDER BY rowid LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit as i64], |r| {
            Ok(AssignmentRow {
                id: r.get(0)?,
                class_id: r.get(1)?,
                subject_id: r.get(2)?,
                teacher_id: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_assignment_for_cell(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
) -> anyhow::Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM teaching_assignments WHERE class_id = ? AND subject_id = ?",
            (class_id, subject_id),
            |r| r.get(0),
        )
        .optional()?)
}

pub fn insert_assignment(conn: &Connection, row: &AssignmentRow) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO teaching_assignments(id, class_id, subject_id, teacher_id, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &row.id,
            &row.class_id,
            &row.subject_id,
            &row.teacher_id,
            Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}
