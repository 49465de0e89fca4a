use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, get_trimmed_str, require_teacher, HandlerErr};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    // Students only ever see active subjects; the flag is visibility, not
    // retention.
    let student_view = matches!(state.session.as_ref().map(|s| s.role), Some(Role::Student));
    let include_inactive = !student_view
        && req
            .params
            .get("includeInactive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

    let sql = if include_inactive {
        "SELECT
           s.id,
           s.name,
           s.active,
           (SELECT COUNT(*) FROM topics t WHERE t.subject_id = s.id) AS topic_count,
           (SELECT COUNT(*) FROM practice_questions q WHERE q.subject_id = s.id) AS question_count
         FROM subjects s
         ORDER BY s.name"
    } else {
        "SELECT
           s.id,
           s.name,
           s.active,
           (SELECT COUNT(*) FROM topics t WHERE t.subject_id = s.id) AS topic_count,
           (SELECT COUNT(*) FROM practice_questions q WHERE q.subject_id = s.id) AS question_count
         FROM subjects s
         WHERE s.active = 1
         ORDER BY s.name"
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let active: i64 = row.get(2)?;
            let topic_count: i64 = row.get(3)?;
            let question_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "active": active != 0,
                "topicCount": topic_count,
                "questionCount": question_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match get_trimmed_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, active) VALUES(?, ?, 1)",
        (&subject_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match get_required_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }

    if let Some(name_raw) = req.params.get("name").and_then(|v| v.as_str()) {
        let name = name_raw.trim();
        if name.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE subjects SET name = ? WHERE id = ?",
            (name, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) {
        if let Err(e) = conn.execute(
            "UPDATE subjects SET active = ? WHERE id = ?",
            (active as i64, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_topics_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match get_required_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }

    let student_view = matches!(state.session.as_ref().map(|s| s.role), Some(Role::Student));
    let include_inactive = !student_view
        && req
            .params
            .get("includeInactive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

    let sql = if include_inactive {
        "SELECT id, name, active, sort_order FROM topics
         WHERE subject_id = ? ORDER BY sort_order"
    } else {
        "SELECT id, name, active, sort_order FROM topics
         WHERE subject_id = ? AND active = 1 ORDER BY sort_order"
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&subject_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let active: i64 = row.get(2)?;
            let sort_order: i64 = row.get(3)?;
            Ok(json!({
                "id": id,
                "name": name,
                "active": active != 0,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(topics) => ok(&req.id, json!({ "topics": topics })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_topics_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match get_required_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_trimmed_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM topics WHERE subject_id = ?",
        [&subject_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let topic_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO topics(id, subject_id, name, active, sort_order) VALUES(?, ?, ?, 1, ?)",
        (&topic_id, &subject_id, &name, sort_order),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "topics" })),
        );
    }

    ok(
        &req.id,
        json!({ "topicId": topic_id, "name": name, "sortOrder": sort_order }),
    )
}

fn handle_topics_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let topic_id = match get_required_str(&req.params, "topicId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM topics WHERE id = ?", [&topic_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "topic not found", None);
    }

    if let Some(name_raw) = req.params.get("name").and_then(|v| v.as_str()) {
        let name = name_raw.trim();
        if name.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE topics SET name = ? WHERE id = ?",
            (name, &topic_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) {
        if let Err(e) = conn.execute(
            "UPDATE topics SET active = ? WHERE id = ?",
            (active as i64, &topic_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_topics_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match get_required_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(ids) = req.params.get("topicIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing topicIds[]", None);
    };
    let topic_ids: Vec<String> = ids
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();
    if topic_ids.len() != ids.len() {
        return err(&req.id, "bad_params", "topicIds must be strings", None);
    }

    let existing_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM topics WHERE subject_id = ?",
        [&subject_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing_count != topic_ids.len() as i64 {
        return err(
            &req.id,
            "bad_params",
            "topicIds must list every topic of the subject exactly once",
            Some(json!({ "expected": existing_count, "got": topic_ids.len() })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (i, tid) in topic_ids.iter().enumerate() {
        let updated = match tx.execute(
            "UPDATE topics SET sort_order = ? WHERE id = ? AND subject_id = ?",
            (i as i64, tid, &subject_id),
        ) {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        };
        if updated == 0 {
            let _ = tx.rollback();
            return err(
                &req.id,
                "not_found",
                "topic not in subject",
                Some(json!({ "topicId": tid })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "topics.list" => Some(handle_topics_list(state, req)),
        "topics.create" => Some(handle_topics_create(state, req)),
        "topics.update" => Some(handle_topics_update(state, req)),
        "topics.reorder" => Some(handle_topics_reorder(state, req)),
        _ => None,
    }
}
