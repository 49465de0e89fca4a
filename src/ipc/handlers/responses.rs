use crate::gate;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, now_iso, require_student, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn quiz_progress_row(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
) -> Result<(bool, Option<String>), HandlerErr> {
    let row: Option<(i64, Option<String>)> = conn
        .query_row(
            "SELECT is_submitted, submitted_at FROM quiz_progress
             WHERE student_id = ? AND subject_id = ?",
            (student_id, subject_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    // No row and a row with is_submitted=0 are the same state: Idle.
    Ok(match row {
        Some((flag, at)) => (flag != 0, at),
        None => (false, None),
    })
}

fn question_subject(conn: &Connection, question_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT subject_id FROM practice_questions WHERE id = ?",
        [question_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_responses_load(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
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

    // One batch for the whole practice set: the student's saved drafts for
    // every question of the subject, plus the lock state.
    let mut stmt = match conn.prepare(
        "SELECT q.id, q.number, r.answer_text, r.additional_answer, r.updated_at
         FROM practice_questions q
         LEFT JOIN student_responses r
           ON r.question_id = q.id AND r.student_id = ?
         WHERE q.subject_id = ?
         ORDER BY q.number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&session.user_id, &subject_id), |r| {
            let question_id: String = r.get(0)?;
            let number: i64 = r.get(1)?;
            let answer_text: Option<String> = r.get(2)?;
            let additional: Option<String> = r.get(3)?;
            let updated_at: Option<String> = r.get(4)?;
            Ok(json!({
                "questionId": question_id,
                "number": number,
                "answerText": answer_text,
                "additionalAnswer": additional,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let responses = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let (is_submitted, submitted_at) =
        match quiz_progress_row(conn, &session.user_id, &subject_id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };

    ok(
        &req.id,
        json!({
            "responses": responses,
            "progress": { "isSubmitted": is_submitted, "submittedAt": submitted_at }
        }),
    )
}

fn handle_responses_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let question_id = match get_required_str(&req.params, "questionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let answer_text = match get_required_str(&req.params, "answerText") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let subject_id = match question_subject(conn, &question_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "question not found", None),
        Err(e) => return e.response(&req.id),
    };

    // The editor goes read-only once submitted; refuse here as well in case
    // a stale client still tries.
    let (is_submitted, _) = match quiz_progress_row(conn, &session.user_id, &subject_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if is_submitted {
        return err(
            &req.id,
            "locked",
            "answers are locked after submission",
            Some(json!({ "subjectId": subject_id })),
        );
    }

    let trimmed = answer_text.trim();
    if trimmed.is_empty() {
        // Blank drafts are never persisted; the caller moves on regardless.
        return ok(&req.id, json!({ "saved": false, "reason": "empty" }));
    }

    let updated_at = now_iso();
    let row_id = Uuid::new_v4().to_string();
    // Last write wins; the self-review column is never touched here.
    if let Err(e) = conn.execute(
        "INSERT INTO student_responses(id, student_id, question_id, answer_text, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(student_id, question_id) DO UPDATE SET
           answer_text = excluded.answer_text,
           updated_at = excluded.updated_at",
        (&row_id, &session.user_id, &question_id, trimmed, &updated_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "student_responses" })),
        );
    }

    ok(&req.id, json!({ "saved": true, "updatedAt": updated_at }))
}

fn handle_quiz_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
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

    // Submitting must never happen on a single accidental tap: the caller
    // has to carry the confirmation through.
    let confirmed = req
        .params
        .get("confirm")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !confirmed {
        return err(
            &req.id,
            "bad_params",
            "submission requires confirm: true",
            None,
        );
    }

    let submitted_at = now_iso();
    // Idempotent by key: a second submit lands on the same row.
    if let Err(e) = conn.execute(
        "INSERT INTO quiz_progress(student_id, subject_id, is_submitted, submitted_at)
         VALUES(?, ?, 1, ?)
         ON CONFLICT(student_id, subject_id) DO UPDATE SET
           is_submitted = 1,
           submitted_at = excluded.submitted_at",
        (&session.user_id, &subject_id, &submitted_at),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "quiz_progress" })),
        );
    }

    ok(
        &req.id,
        json!({ "isSubmitted": true, "submittedAt": submitted_at }),
    )
}

fn handle_quiz_progress(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
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

    match quiz_progress_row(conn, &session.user_id, &subject_id) {
        Ok((is_submitted, submitted_at)) => ok(
            &req.id,
            json!({ "isSubmitted": is_submitted, "submittedAt": submitted_at }),
        ),
        Err(e) => e.response(&req.id),
    }
}

fn handle_responses_annotate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let question_id = match get_required_str(&req.params, "questionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let additional = match get_required_str(&req.params, "additionalAnswer") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match question_subject(conn, &question_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "question not found", None),
        Err(e) => return e.response(&req.id),
    }

    // Deliberately no lock check: the self-review note stays editable after
    // submission. There is also no creation path — without a saved answer
    // this touches zero rows.
    let updated = match conn.execute(
        "UPDATE student_responses SET additional_answer = ?, updated_at = ?
         WHERE student_id = ? AND question_id = ?",
        (&additional, now_iso(), &session.user_id, &question_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "student_responses" })),
            )
        }
    };

    if updated == 0 {
        return ok(
            &req.id,
            json!({
                "updated": false,
                "warning": "no saved answer for this question; nothing to annotate"
            }),
        );
    }

    ok(&req.id, json!({ "updated": true }))
}

fn handle_review_answers(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
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

    let (is_submitted, submitted_at) =
        match quiz_progress_row(conn, &session.user_id, &subject_id) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
    if !gate::review_unlocked(is_submitted) {
        return err(
            &req.id,
            "locked",
            "submit your answers before reviewing them",
            None,
        );
    }

    let mut stmt = match conn.prepare(
        "SELECT q.id, q.number, q.question_text, r.answer_text, r.additional_answer
         FROM practice_questions q
         LEFT JOIN student_responses r
           ON r.question_id = q.id AND r.student_id = ?
         WHERE q.subject_id = ?
         ORDER BY q.number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&session.user_id, &subject_id), |r| {
            let question_id: String = r.get(0)?;
            let number: i64 = r.get(1)?;
            let question_text: String = r.get(2)?;
            let answer_text: Option<String> = r.get(3)?;
            let additional: Option<String> = r.get(4)?;
            Ok(json!({
                "questionId": question_id,
                "number": number,
                "questionText": question_text,
                "answerText": answer_text,
                "additionalAnswer": additional
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(answers) => ok(
            &req.id,
            json!({ "submittedAt": submitted_at, "answers": answers }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "responses.load" => Some(handle_responses_load(state, req)),
        "responses.save" => Some(handle_responses_save(state, req)),
        "responses.annotate" => Some(handle_responses_annotate(state, req)),
        "quiz.submit" => Some(handle_quiz_submit(state, req)),
        "quiz.progress" => Some(handle_quiz_progress(state, req)),
        "review.answers" => Some(handle_review_answers(state, req)),
        _ => None,
    }
}
