use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_session, require_teacher, HandlerErr};
use crate::ipc::types::{AppState, Request, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const MAX_RUBRIC_ROWS: usize = 4;
pub const RUBRIC_SCORE_MIN: i64 = 1;
pub const RUBRIC_SCORE_MAX: i64 = 4;

#[derive(Debug, Clone)]
struct RubricInput {
    rubric_id: Option<String>,
    score: i64,
    description: String,
}

fn validation_err(section: &'static str, message: impl Into<String>) -> HandlerErr {
    HandlerErr::with_details(
        "validation_failed",
        message,
        json!({ "section": section }),
    )
}

fn parse_rubric_rows(params: &serde_json::Value) -> Result<Vec<RubricInput>, HandlerErr> {
    let Some(rows) = params.get("rubric").and_then(|v| v.as_array()) else {
        return Err(validation_err("rubric", "missing rubric rows"));
    };
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            return Err(validation_err(
                "rubric",
                format!("rubric row at index {} must be an object", i),
            ));
        };
        let score = obj
            .get("score")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| validation_err("rubric", format!("rubric row {} missing score", i)))?;
        let description = obj
            .get("description")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let rubric_id = obj
            .get("rubricId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        out.push(RubricInput {
            rubric_id,
            score,
            description,
        });
    }
    Ok(out)
}

/// All-or-nothing validation, run before any write. Each failure names the
/// editor section it belongs to so the UI can route the user there.
fn validate_composite(
    question_text: &str,
    answer_key: &str,
    rubric: &[RubricInput],
) -> Result<(), HandlerErr> {
    if question_text.trim().is_empty() {
        return Err(validation_err("question", "question text must not be empty"));
    }
    if answer_key.trim().is_empty() {
        return Err(validation_err("answerKey", "answer key must not be empty"));
    }
    if rubric.is_empty() {
        return Err(validation_err("rubric", "at least one rubric row is required"));
    }
    if rubric.len() > MAX_RUBRIC_ROWS {
        return Err(validation_err(
            "rubric",
            format!("at most {} rubric rows are allowed", MAX_RUBRIC_ROWS),
        ));
    }
    let mut seen_scores: Vec<i64> = Vec::with_capacity(rubric.len());
    for row in rubric {
        if row.description.is_empty() {
            return Err(validation_err(
                "rubric",
                "every rubric row needs a description",
            ));
        }
        if !(RUBRIC_SCORE_MIN..=RUBRIC_SCORE_MAX).contains(&row.score) {
            return Err(validation_err(
                "rubric",
                format!(
                    "rubric scores must be {}..={}",
                    RUBRIC_SCORE_MIN, RUBRIC_SCORE_MAX
                ),
            ));
        }
        if seen_scores.contains(&row.score) {
            return Err(validation_err(
                "rubric",
                format!("duplicate rubric score {}", row.score),
            ));
        }
        seen_scores.push(row.score);
    }
    Ok(())
}

fn question_exists(conn: &Connection, question_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM practice_questions WHERE id = ?",
        [question_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn step_failed(
    id: &str,
    step: &'static str,
    steps: Vec<serde_json::Value>,
    e: impl ToString,
) -> serde_json::Value {
    // The steps are independent calls, not one transaction: report exactly
    // how far the save got so the editor can say what is already persisted.
    err(
        id,
        "db_insert_failed",
        e.to_string(),
        Some(json!({ "failedStep": step, "steps": steps })),
    )
}

fn handle_questions_save(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let question_text = match get_required_str(&req.params, "questionText") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let answer_key = match get_required_str(&req.params, "answerKey") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let rubric = match parse_rubric_rows(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = validate_composite(&question_text, &answer_key, &rubric) {
        return e.response(&req.id);
    }

    let exists_row: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM subjects WHERE id = ?",
            [&subject_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists_row.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let flip_front = req
        .params
        .get("flipImageFront")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let flip_back = req
        .params
        .get("flipImageBack")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut steps: Vec<serde_json::Value> = Vec::new();

    // Step 1: the question row. An insert takes the next display number;
    // an update never renumbers.
    let question_id = req
        .params
        .get("questionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let (question_id, number) = match question_id {
        Some(qid) => {
            let existing: Option<i64> = match conn
                .query_row(
                    "SELECT number FROM practice_questions WHERE id = ? AND subject_id = ?",
                    (&qid, &subject_id),
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let Some(number) = existing else {
                return err(&req.id, "not_found", "question not found", None);
            };
            if let Err(e) = conn.execute(
                "UPDATE practice_questions
                 SET question_text = ?, flip_image_front = ?, flip_image_back = ?
                 WHERE id = ?",
                (&question_text, &flip_front, &flip_back, &qid),
            ) {
                return step_failed(&req.id, "question", steps, e);
            }
            (qid, number)
        }
        None => {
            let count: i64 = match conn.query_row(
                "SELECT COUNT(*) FROM practice_questions WHERE subject_id = ?",
                [&subject_id],
                |r| r.get(0),
            ) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let qid = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO practice_questions(id, subject_id, number, question_text, flip_image_front, flip_image_back)
                 VALUES(?, ?, ?, ?, ?, ?)",
                (&qid, &subject_id, count + 1, &question_text, &flip_front, &flip_back),
            ) {
                return step_failed(&req.id, "question", steps, e);
            }
            (qid, count + 1)
        }
    };
    steps.push(json!({ "step": "question", "ok": true }));

    // Step 2: the secret answer key, keyed by question.
    if let Err(e) = conn.execute(
        "INSERT INTO answer_keys(question_id, answer_text)
         VALUES(?, ?)
         ON CONFLICT(question_id) DO UPDATE SET
           answer_text = excluded.answer_text",
        (&question_id, &answer_key),
    ) {
        return step_failed(&req.id, "answerKey", steps, e);
    }
    steps.push(json!({ "step": "answerKey", "ok": true }));

    // Step 3: rubric rows. Persisted rows update in place, new rows insert.
    let mut rubric_out: Vec<serde_json::Value> = Vec::with_capacity(rubric.len());
    for row in &rubric {
        match &row.rubric_id {
            Some(rid) => {
                let updated = match conn.execute(
                    "UPDATE scoring_rubrics SET score = ?, description = ?
                     WHERE id = ? AND question_id = ?",
                    (row.score, &row.description, rid, &question_id),
                ) {
                    Ok(n) => n,
                    Err(e) => return step_failed(&req.id, "rubric", steps, e),
                };
                if updated == 0 {
                    return err(
                        &req.id,
                        "not_found",
                        "rubric row not found",
                        Some(json!({ "rubricId": rid, "steps": steps })),
                    );
                }
                rubric_out.push(json!({ "rubricId": rid, "score": row.score }));
            }
            None => {
                let rid = Uuid::new_v4().to_string();
                if let Err(e) = conn.execute(
                    "INSERT INTO scoring_rubrics(id, question_id, score, description)
                     VALUES(?, ?, ?, ?)",
                    (&rid, &question_id, row.score, &row.description),
                ) {
                    return step_failed(&req.id, "rubric", steps, e);
                }
                rubric_out.push(json!({ "rubricId": rid, "score": row.score }));
            }
        }
    }
    steps.push(json!({ "step": "rubric", "ok": true }));

    ok(
        &req.id,
        json!({
            "questionId": question_id,
            "number": number,
            "steps": steps,
            "rubric": rubric_out
        }),
    )
}

fn load_rubric(conn: &Connection, question_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, score, description FROM scoring_rubrics
             WHERE question_id = ? ORDER BY score",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([question_id], |r| {
        let id: String = r.get(0)?;
        let score: i64 = r.get(1)?;
        let description: String = r.get(2)?;
        Ok(json!({ "rubricId": id, "score": score, "description": description }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn load_answer_key(conn: &Connection, question_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT answer_text FROM answer_keys WHERE question_id = ?",
        [question_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn question_json(
    conn: &Connection,
    id: &str,
    number: i64,
    text: &str,
    flip_front: Option<String>,
    flip_back: Option<String>,
    teacher_view: bool,
) -> Result<serde_json::Value, HandlerErr> {
    let mut out = json!({
        "id": id,
        "number": number,
        "questionText": text,
        "flipImageFront": flip_front,
        "flipImageBack": flip_back,
    });
    if teacher_view {
        // The key never leaves the teacher path; student listings are built
        // without ever querying the answer_keys relation.
        out["answerKey"] = json!(load_answer_key(conn, id)?);
        out["rubric"] = json!(load_rubric(conn, id)?);
    }
    Ok(out)
}

fn handle_questions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
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

    let mut stmt = match conn.prepare(
        "SELECT id, number, question_text, flip_image_front, flip_image_back
         FROM practice_questions
         WHERE subject_id = ?
         ORDER BY number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let base_rows = stmt
        .query_map([&subject_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let base_rows = match base_rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let teacher_view = session.role == Role::Teacher;
    let mut questions = Vec::with_capacity(base_rows.len());
    for (id, number, text, ff, fb) in base_rows {
        match question_json(conn, &id, number, &text, ff, fb, teacher_view) {
            Ok(q) => questions.push(q),
            Err(e) => return e.response(&req.id),
        }
    }

    ok(&req.id, json!({ "questions": questions }))
}

fn handle_questions_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(state) {
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
    let row = match conn
        .query_row(
            "SELECT number, question_text, flip_image_front, flip_image_back
             FROM practice_questions WHERE id = ?",
            [&question_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((number, text, ff, fb)) = row else {
        return err(&req.id, "not_found", "question not found", None);
    };

    let teacher_view = session.role == Role::Teacher;
    match question_json(conn, &question_id, number, &text, ff, fb, teacher_view) {
        Ok(q) => ok(&req.id, json!({ "question": q })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_questions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let question_id = match get_required_str(&req.params, "questionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match question_exists(conn, &question_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "question not found", None),
        Err(e) => return e.response(&req.id),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Hard delete in dependency order. Sibling question numbers keep their
    // gaps; number is display order, re-derivable by sorting.
    if let Err(e) = tx.execute(
        "DELETE FROM scoring_rubrics WHERE question_id = ?",
        [&question_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "scoring_rubrics" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM answer_keys WHERE question_id = ?",
        [&question_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "answer_keys" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM student_responses WHERE question_id = ?",
        [&question_id],
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
        "DELETE FROM practice_questions WHERE id = ?",
        [&question_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "practice_questions" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_rubrics_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let rubric_id = match get_required_str(&req.params, "rubricId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let deleted = match conn.execute("DELETE FROM scoring_rubrics WHERE id = ?", [&rubric_id]) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "scoring_rubrics" })),
            )
        }
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "rubric row not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "questions.save" => Some(handle_questions_save(state, req)),
        "questions.list" => Some(handle_questions_list(state, req)),
        "questions.get" => Some(handle_questions_get(state, req)),
        "questions.delete" => Some(handle_questions_delete(state, req)),
        "rubrics.delete" => Some(handle_rubrics_delete(state, req)),
        _ => None,
    }
}
