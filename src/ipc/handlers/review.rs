use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_teacher, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_review_list_students(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    // Answered counts are restricted to this subject's questions: a join,
    // not a bare count over the student's responses.
    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.full_name,
           s.class_name,
           (SELECT COUNT(*)
              FROM student_responses r
              JOIN practice_questions q ON q.id = r.question_id
             WHERE r.student_id = s.id AND q.subject_id = ?1) AS answered,
           COALESCE(p.is_submitted, 0),
           p.submitted_at
         FROM students s
         LEFT JOIN quiz_progress p
           ON p.student_id = s.id AND p.subject_id = ?1
         ORDER BY s.class_name, s.full_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&subject_id], |r| {
            let id: String = r.get(0)?;
            let full_name: String = r.get(1)?;
            let class_name: String = r.get(2)?;
            let answered: i64 = r.get(3)?;
            let is_submitted: i64 = r.get(4)?;
            let submitted_at: Option<String> = r.get(5)?;
            Ok(json!({
                "studentId": id,
                "fullName": full_name,
                "className": class_name,
                "answeredCount": answered,
                "isSubmitted": is_submitted != 0,
                "submittedAt": submitted_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_review_student_answers(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }
    let student: Option<String> = match conn
        .query_row(
            "SELECT full_name FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(full_name) = student else {
        return err(&req.id, "not_found", "student not found", None);
    };

    // The grading view puts the key and rubric next to each answer.
    let mut stmt = match conn.prepare(
        "SELECT q.id, q.number, q.question_text, k.answer_text,
                r.answer_text, r.additional_answer, r.updated_at
         FROM practice_questions q
         LEFT JOIN answer_keys k ON k.question_id = q.id
         LEFT JOIN student_responses r
           ON r.question_id = q.id AND r.student_id = ?
         WHERE q.subject_id = ?
         ORDER BY q.number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let base_rows = stmt
        .query_map((&student_id, &subject_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let base_rows = match base_rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut rubric_stmt = match conn.prepare(
        "SELECT score, description FROM scoring_rubrics
         WHERE question_id = ? ORDER BY score",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut answers = Vec::with_capacity(base_rows.len());
    for (qid, number, question_text, key, answer, additional, updated_at) in base_rows {
        let rubric = rubric_stmt
            .query_map([&qid], |r| {
                let score: i64 = r.get(0)?;
                let description: String = r.get(1)?;
                Ok(json!({ "score": score, "description": description }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        let rubric = match rubric {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        answers.push(json!({
            "questionId": qid,
            "number": number,
            "questionText": question_text,
            "answerKey": key,
            "answerText": answer,
            "additionalAnswer": additional,
            "updatedAt": updated_at,
            "rubric": rubric
        }));
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "fullName": full_name,
            "answers": answers
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "review.listStudents" => Some(handle_review_list_students(state, req)),
        "review.studentAnswers" => Some(handle_review_student_answers(state, req)),
        _ => None,
    }
}
