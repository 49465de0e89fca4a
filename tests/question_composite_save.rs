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
    let exe = env!("CARGO_BIN_EXE_biolearnd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn biolearnd");
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

fn error_code(value: &serde_json::Value) -> String {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn error_section(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("section"))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing section in {}", value))
        .to_string()
}

struct Ctx {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    subject_id: String,
}

impl Ctx {
    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        request(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }

    fn call_ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        request_ok(
            &mut self.stdin,
            &mut self.reader,
            &self.next_id.to_string(),
            method,
            params,
        )
    }

    fn save_question(&mut self, text: &str) -> serde_json::Value {
        let subject_id = self.subject_id.clone();
        self.call_ok(
            "questions.save",
            json!({
                "subjectId": subject_id,
                "questionText": text,
                "answerKey": "model answer",
                "rubric": [
                    { "score": 1, "description": "attempted" },
                    { "score": 4, "description": "complete" }
                ]
            }),
        )
    }

    fn list_questions(&mut self) -> Vec<serde_json::Value> {
        let subject_id = self.subject_id.clone();
        self.call_ok("questions.list", json!({ "subjectId": subject_id }))
            .get("questions")
            .and_then(|v| v.as_array())
            .cloned()
            .expect("questions array")
    }
}

fn setup(prefix: &str) -> (Child, Ctx) {
    let workspace = temp_dir(prefix);
    let (child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "session.signIn",
        json!({ "userId": "teacher-1", "role": "TEACHER" }),
    );
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "s3",
        "subjects.create",
        json!({ "name": "Biology XII" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    (
        child,
        Ctx {
            stdin,
            reader,
            next_id: 100,
            subject_id,
        },
    )
}

#[test]
fn save_assigns_dense_numbers_and_reports_steps() {
    let (_child, mut ctx) = setup("biolearn-composite-numbers");

    let first = ctx.save_question("What is osmosis?");
    assert_eq!(first.get("number"), Some(&json!(1)));
    let second = ctx.save_question("What is diffusion?");
    assert_eq!(second.get("number"), Some(&json!(2)));

    let steps: Vec<String> = first
        .get("steps")
        .and_then(|v| v.as_array())
        .expect("steps")
        .iter()
        .map(|s| s.get("step").and_then(|v| v.as_str()).unwrap().to_string())
        .collect();
    assert_eq!(steps, ["question", "answerKey", "rubric"]);
    assert!(first
        .get("steps")
        .and_then(|v| v.as_array())
        .unwrap()
        .iter()
        .all(|s| s.get("ok") == Some(&json!(true))));
}

#[test]
fn duplicate_rubric_scores_are_rejected_before_any_write() {
    let (_child, mut ctx) = setup("biolearn-composite-dupscore");

    let subject_id = ctx.subject_id.clone();
    let resp = ctx.call(
        "questions.save",
        json!({
            "subjectId": subject_id,
            "questionText": "What is osmosis?",
            "answerKey": "model answer",
            "rubric": [
                { "score": 3, "description": "good" },
                { "score": 3, "description": "also good" }
            ]
        }),
    );
    assert_eq!(error_code(&resp), "validation_failed");
    assert_eq!(error_section(&resp), "rubric");

    // Nothing was written: the subject still has no questions.
    assert!(ctx.list_questions().is_empty());
}

#[test]
fn validation_failures_name_their_editor_section() {
    let (_child, mut ctx) = setup("biolearn-composite-sections");
    let subject_id = ctx.subject_id.clone();

    let resp = ctx.call(
        "questions.save",
        json!({
            "subjectId": subject_id.clone(),
            "questionText": "   ",
            "answerKey": "model answer",
            "rubric": [{ "score": 1, "description": "attempted" }]
        }),
    );
    assert_eq!(error_section(&resp), "question");

    let resp = ctx.call(
        "questions.save",
        json!({
            "subjectId": subject_id.clone(),
            "questionText": "What is osmosis?",
            "answerKey": "",
            "rubric": [{ "score": 1, "description": "attempted" }]
        }),
    );
    assert_eq!(error_section(&resp), "answerKey");

    let resp = ctx.call(
        "questions.save",
        json!({
            "subjectId": subject_id.clone(),
            "questionText": "What is osmosis?",
            "answerKey": "model answer",
            "rubric": []
        }),
    );
    assert_eq!(error_section(&resp), "rubric");

    let resp = ctx.call(
        "questions.save",
        json!({
            "subjectId": subject_id.clone(),
            "questionText": "What is osmosis?",
            "answerKey": "model answer",
            "rubric": [
                { "score": 1, "description": "a" },
                { "score": 2, "description": "b" },
                { "score": 3, "description": "c" },
                { "score": 4, "description": "d" },
                { "score": 1, "description": "e" }
            ]
        }),
    );
    assert_eq!(error_section(&resp), "rubric");

    let resp = ctx.call(
        "questions.save",
        json!({
            "subjectId": subject_id.clone(),
            "questionText": "What is osmosis?",
            "answerKey": "model answer",
            "rubric": [{ "score": 5, "description": "out of range" }]
        }),
    );
    assert_eq!(error_section(&resp), "rubric");

    let resp = ctx.call(
        "questions.save",
        json!({
            "subjectId": subject_id,
            "questionText": "What is osmosis?",
            "answerKey": "model answer",
            "rubric": [{ "score": 2, "description": "  " }]
        }),
    );
    assert_eq!(error_section(&resp), "rubric");
}

#[test]
fn update_preserves_number_and_rubric_rows() {
    let (_child, mut ctx) = setup("biolearn-composite-update");

    let _ = ctx.save_question("What is osmosis?");
    let second = ctx.save_question("What is diffusion?");
    let question_id = second
        .get("questionId")
        .and_then(|v| v.as_str())
        .expect("questionId")
        .to_string();
    let rubric_ids: Vec<String> = second
        .get("rubric")
        .and_then(|v| v.as_array())
        .expect("rubric")
        .iter()
        .map(|r| {
            r.get("rubricId")
                .and_then(|v| v.as_str())
                .expect("rubricId")
                .to_string()
        })
        .collect();

    // Removing a row from the form deletes it right away; the later save
    // only updates and inserts.
    let _ = ctx.call_ok("rubrics.delete", json!({ "rubricId": rubric_ids[1] }));

    let subject_id = ctx.subject_id.clone();
    let updated = ctx.call_ok(
        "questions.save",
        json!({
            "questionId": question_id.clone(),
            "subjectId": subject_id,
            "questionText": "Explain diffusion with an example.",
            "answerKey": "revised model answer",
            "rubric": [
                { "rubricId": rubric_ids[0], "score": 2, "description": "attempted with detail" },
                { "score": 3, "description": "mostly correct" }
            ]
        }),
    );
    assert_eq!(updated.get("number"), Some(&json!(2)));

    let q = ctx.call_ok("questions.get", json!({ "questionId": question_id }));
    let q = q.get("question").expect("question");
    assert_eq!(
        q.get("questionText").and_then(|v| v.as_str()),
        Some("Explain diffusion with an example.")
    );
    assert_eq!(
        q.get("answerKey").and_then(|v| v.as_str()),
        Some("revised model answer")
    );
    let scores: Vec<i64> = q
        .get("rubric")
        .and_then(|v| v.as_array())
        .expect("rubric")
        .iter()
        .map(|r| r.get("score").and_then(|v| v.as_i64()).unwrap())
        .collect();
    assert_eq!(scores, [2, 3]);
}

#[test]
fn removing_a_rubric_row_is_individual() {
    let (_child, mut ctx) = setup("biolearn-composite-rubricdelete");

    let saved = ctx.save_question("What is osmosis?");
    let question_id = saved
        .get("questionId")
        .and_then(|v| v.as_str())
        .expect("questionId")
        .to_string();
    let rubric_id = saved
        .get("rubric")
        .and_then(|v| v.as_array())
        .and_then(|rows| rows.first())
        .and_then(|r| r.get("rubricId"))
        .and_then(|v| v.as_str())
        .expect("rubricId")
        .to_string();

    let _ = ctx.call_ok("rubrics.delete", json!({ "rubricId": rubric_id.clone() }));
    let resp = ctx.call("rubrics.delete", json!({ "rubricId": rubric_id }));
    assert_eq!(error_code(&resp), "not_found");

    let q = ctx.call_ok("questions.get", json!({ "questionId": question_id }));
    let rubric_len = q
        .get("question")
        .and_then(|q| q.get("rubric"))
        .and_then(|v| v.as_array())
        .map(|a| a.len());
    assert_eq!(rubric_len, Some(1));
}

#[test]
fn deleting_a_question_leaves_number_gaps() {
    let (_child, mut ctx) = setup("biolearn-composite-gaps");

    let _ = ctx.save_question("Q one");
    let second = ctx.save_question("Q two");
    let _ = ctx.save_question("Q three");

    let second_id = second
        .get("questionId")
        .and_then(|v| v.as_str())
        .expect("questionId")
        .to_string();
    let _ = ctx.call_ok("questions.delete", json!({ "questionId": second_id }));

    let numbers: Vec<i64> = ctx
        .list_questions()
        .iter()
        .map(|q| q.get("number").and_then(|v| v.as_i64()).unwrap())
        .collect();
    // No renumbering on delete: the gap is permanent.
    assert_eq!(numbers, [1, 3]);
}

#[test]
fn students_never_see_the_answer_key() {
    let (_child, mut ctx) = setup("biolearn-composite-secrecy");

    let saved = ctx.save_question("What is osmosis?");
    let question_id = saved
        .get("questionId")
        .and_then(|v| v.as_str())
        .expect("questionId")
        .to_string();

    let student = ctx.call_ok(
        "students.create",
        json!({ "fullName": "Ayu Lestari", "className": "XII IPA 1" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = ctx.call_ok(
        "session.signIn",
        json!({ "userId": student_id, "role": "STUDENT" }),
    );

    let listed = ctx.list_questions();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].get("answerKey").is_none());
    assert!(listed[0].get("rubric").is_none());

    let got = ctx.call_ok("questions.get", json!({ "questionId": question_id }));
    assert!(got
        .get("question")
        .map(|q| q.get("answerKey").is_none())
        .unwrap_or(false));

    // Authoring is teacher-only.
    let subject_id = ctx.subject_id.clone();
    let resp = ctx.call(
        "questions.save",
        json!({
            "subjectId": subject_id,
            "questionText": "smuggled",
            "answerKey": "smuggled",
            "rubric": [{ "score": 1, "description": "x" }]
        }),
    );
    assert_eq!(error_code(&resp), "forbidden");
}
