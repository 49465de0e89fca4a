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

struct Ctx {
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
    subject_id: String,
    topic_id: String,
    student_id: String,
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
        json!({ "name": "Biology XI" }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let topic = request_ok(
        &mut stdin,
        &mut reader,
        "s4",
        "topics.create",
        json!({ "subjectId": subject_id, "name": "Cell Division" }),
    );
    let topic_id = topic
        .get("topicId")
        .and_then(|v| v.as_str())
        .expect("topicId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s5",
        "students.create",
        json!({ "fullName": "Siti Rahma", "className": "XI IPA 1" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    (
        child,
        Ctx {
            stdin,
            reader,
            next_id: 100,
            subject_id,
            topic_id,
            student_id,
        },
    )
}

fn save_full_deck(ctx: &mut Ctx) {
    for n in 1..=3 {
        let _ = ctx.call_ok(
            "flashcards.save",
            json!({
                "topicId": ctx.topic_id.clone(),
                "orderNumber": n,
                "frontImage": format!("media/front-{}.png", n),
                "backImage": format!("media/back-{}.png", n)
            }),
        );
    }
}

fn sign_in_student(ctx: &mut Ctx) {
    let student_id = ctx.student_id.clone();
    let _ = ctx.call_ok(
        "session.signIn",
        json!({ "userId": student_id, "role": "STUDENT" }),
    );
}

fn card(progress: &serde_json::Value, order_number: i64) -> serde_json::Value {
    progress
        .get("cards")
        .and_then(|v| v.as_array())
        .and_then(|cards| {
            cards
                .iter()
                .find(|c| c.get("orderNumber").and_then(|v| v.as_i64()) == Some(order_number))
        })
        .cloned()
        .unwrap_or_else(|| panic!("card {} missing: {}", order_number, progress))
}

#[test]
fn cards_unlock_strictly_in_order() {
    let (_child, mut ctx) = setup("biolearn-gating-order");
    save_full_deck(&mut ctx);
    sign_in_student(&mut ctx);

    let topic_id = ctx.topic_id.clone();
    let progress = ctx.call_ok("progress.get", json!({ "topicId": topic_id.clone() }));
    assert_eq!(card(&progress, 1).get("openable"), Some(&json!(true)));
    assert_eq!(card(&progress, 2).get("openable"), Some(&json!(false)));
    assert_eq!(card(&progress, 3).get("openable"), Some(&json!(false)));
    assert_eq!(progress.get("materialUnlocked"), Some(&json!(false)));

    // Skipping ahead is rejected and records nothing.
    let resp = ctx.call(
        "flashcards.open",
        json!({ "topicId": topic_id.clone(), "orderNumber": 3 }),
    );
    assert_eq!(error_code(&resp), "card_locked");
    let progress = ctx.call_ok("progress.get", json!({ "topicId": topic_id.clone() }));
    assert_eq!(card(&progress, 3).get("opened"), Some(&json!(false)));

    let after = ctx.call_ok(
        "flashcards.open",
        json!({ "topicId": topic_id.clone(), "orderNumber": 1 }),
    );
    assert_eq!(card(&after, 2).get("openable"), Some(&json!(true)));
    assert_eq!(card(&after, 3).get("openable"), Some(&json!(false)));

    let _ = ctx.call_ok(
        "flashcards.open",
        json!({ "topicId": topic_id.clone(), "orderNumber": 2 }),
    );
    let after = ctx.call_ok(
        "flashcards.open",
        json!({ "topicId": topic_id.clone(), "orderNumber": 3 }),
    );
    assert_eq!(after.get("materialUnlocked"), Some(&json!(true)));

    // The reading view opens once the whole deck has been opened.
    let study = ctx.call_ok("materials.study", json!({ "topicId": topic_id }));
    assert_eq!(
        study.get("subjectId").and_then(|v| v.as_str()),
        Some(ctx.subject_id.as_str())
    );
    assert!(study.get("materials").and_then(|v| v.as_array()).is_some());
}

#[test]
fn empty_deck_has_no_gate() {
    let (_child, mut ctx) = setup("biolearn-gating-empty");
    sign_in_student(&mut ctx);

    let topic_id = ctx.topic_id.clone();
    let progress = ctx.call_ok("progress.get", json!({ "topicId": topic_id.clone() }));
    assert_eq!(
        progress.get("cards").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    assert_eq!(progress.get("materialUnlocked"), Some(&json!(true)));

    let study = ctx.call(
        "materials.study",
        json!({ "topicId": topic_id }),
    );
    assert_eq!(study.get("ok").and_then(|v| v.as_bool()), Some(true));
}

#[test]
fn half_filled_slot_invalidates_study_deck() {
    let (_child, mut ctx) = setup("biolearn-gating-halffilled");
    let topic_id = ctx.topic_id.clone();
    let _ = ctx.call_ok(
        "flashcards.save",
        json!({
            "topicId": topic_id.clone(),
            "orderNumber": 1,
            "frontImage": "media/front-1.png",
            "backImage": "media/back-1.png"
        }),
    );
    // Slot 2 gets only a front image: fine for editing, not for studying.
    let _ = ctx.call_ok(
        "flashcards.save",
        json!({
            "topicId": topic_id.clone(),
            "orderNumber": 2,
            "frontImage": "media/front-2.png"
        }),
    );
    sign_in_student(&mut ctx);

    let resp = ctx.call("progress.get", json!({ "topicId": topic_id.clone() }));
    assert_eq!(error_code(&resp), "deck_incomplete");
    let slots = resp
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("orderNumbers"))
        .cloned();
    assert_eq!(slots, Some(json!([2])));
}

#[test]
fn material_gate_stays_locked_until_deck_done() {
    let (_child, mut ctx) = setup("biolearn-gating-locked");
    save_full_deck(&mut ctx);
    sign_in_student(&mut ctx);

    let topic_id = ctx.topic_id.clone();
    let _ = ctx.call_ok(
        "flashcards.open",
        json!({ "topicId": topic_id.clone(), "orderNumber": 1 }),
    );
    let resp = ctx.call("materials.study", json!({ "topicId": topic_id }));
    assert_eq!(error_code(&resp), "locked");
}

#[test]
fn fresh_sign_in_resets_opened_cards() {
    let (_child, mut ctx) = setup("biolearn-gating-reset");
    save_full_deck(&mut ctx);
    sign_in_student(&mut ctx);

    let topic_id = ctx.topic_id.clone();
    for n in 1..=3 {
        let _ = ctx.call_ok(
            "flashcards.open",
            json!({ "topicId": topic_id.clone(), "orderNumber": n }),
        );
    }
    let progress = ctx.call_ok("progress.get", json!({ "topicId": topic_id.clone() }));
    assert_eq!(progress.get("materialUnlocked"), Some(&json!(true)));

    // Signing in again is the daemon's page reload: progress is gone.
    sign_in_student(&mut ctx);
    let progress = ctx.call_ok("progress.get", json!({ "topicId": topic_id }));
    assert_eq!(progress.get("materialUnlocked"), Some(&json!(false)));
    assert_eq!(card(&progress, 1).get("opened"), Some(&json!(false)));
}
