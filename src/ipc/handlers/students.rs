use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, get_trimmed_str, require_student, require_teacher};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, full_name, class_name FROM students
         ORDER BY class_name, full_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let full_name: String = r.get(1)?;
            let class_name: String = r.get(2)?;
            Ok(json!({
                "id": id,
                "fullName": full_name,
                "className": class_name
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let students = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Per-class counts so the roster view can render its group headers.
    let mut class_stmt = match conn.prepare(
        "SELECT class_name, COUNT(*) FROM students
         GROUP BY class_name ORDER BY class_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classes = class_stmt
        .query_map([], |r| {
            let class_name: String = r.get(0)?;
            let count: i64 = r.get(1)?;
            Ok(json!({ "className": class_name, "studentCount": count }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match classes {
        Ok(classes) => ok(&req.id, json!({ "students": students, "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let full_name = match get_trimmed_str(&req.params, "fullName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_name = match get_trimmed_str(&req.params, "className") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, full_name, class_name) VALUES(?, ?, ?)",
        (&student_id, &full_name, &class_name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "fullName": full_name, "className": class_name }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    if let Some(name_raw) = req.params.get("fullName").and_then(|v| v.as_str()) {
        let name = name_raw.trim();
        if name.is_empty() {
            return err(&req.id, "bad_params", "fullName must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE students SET full_name = ? WHERE id = ?",
            (name, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(class_raw) = req.params.get("className").and_then(|v| v.as_str()) {
        let class_name = class_raw.trim();
        if class_name.is_empty() {
            return err(&req.id, "bad_params", "className must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE students SET class_name = ? WHERE id = ?",
            (class_name, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM student_responses WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "student_responses" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM quiz_progress WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "quiz_progress" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_update_name(state: &mut AppState, req: &Request) -> serde_json::Value {
    // The one field a student may edit, and only on their own row.
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let full_name = match get_trimmed_str(&req.params, "fullName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let updated = match conn.execute(
        "UPDATE students SET full_name = ? WHERE id = ?",
        (&full_name, &session.user_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "fullName": full_name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.updateName" => Some(handle_students_update_name(state, req)),
        _ => None,
    }
}
