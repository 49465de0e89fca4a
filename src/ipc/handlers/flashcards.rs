use crate::gate;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_student, require_teacher, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

// A topic's deck is a fixed small set of image-pair slots.
pub const DECK_SLOTS: i64 = 3;

pub fn topic_exists(conn: &Connection, topic_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM topics WHERE id = ?", [topic_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

pub fn topic_subject(conn: &Connection, topic_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT subject_id FROM topics WHERE id = ?",
        [topic_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

#[derive(Debug, Clone)]
struct SlotRow {
    order_number: i64,
    front_image: Option<String>,
    back_image: Option<String>,
}

fn load_slots(conn: &Connection, topic_id: &str) -> Result<Vec<SlotRow>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT order_number, front_image, back_image
             FROM flashcards
             WHERE topic_id = ?
             ORDER BY order_number",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([topic_id], |r| {
        Ok(SlotRow {
            order_number: r.get(0)?,
            front_image: r.get(1)?,
            back_image: r.get(2)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

#[derive(Debug, Clone)]
pub struct DeckCard {
    pub order_number: i64,
    pub front_image: String,
    pub back_image: String,
}

fn has_image(v: &Option<String>) -> bool {
    v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
}

/// Assembles the study deck: slots with both images, in order. A slot with
/// exactly one image is legal while the teacher edits but makes the deck
/// invalid for students.
pub fn load_study_deck(conn: &Connection, topic_id: &str) -> Result<Vec<DeckCard>, HandlerErr> {
    let slots = load_slots(conn, topic_id)?;
    let mut incomplete: Vec<i64> = Vec::new();
    let mut deck: Vec<DeckCard> = Vec::new();
    for s in slots {
        match (has_image(&s.front_image), has_image(&s.back_image)) {
            (true, true) => deck.push(DeckCard {
                order_number: s.order_number,
                front_image: s.front_image.unwrap_or_default(),
                back_image: s.back_image.unwrap_or_default(),
            }),
            (false, false) => {}
            _ => incomplete.push(s.order_number),
        }
    }
    if !incomplete.is_empty() {
        return Err(HandlerErr::with_details(
            "deck_incomplete",
            "topic has half-filled flashcard slots",
            json!({ "orderNumbers": incomplete }),
        ));
    }
    Ok(deck)
}

pub fn opened_set<'a>(
    state: &'a AppState,
    student_id: &str,
    topic_id: &str,
) -> Option<&'a BTreeSet<usize>> {
    state
        .opened_cards
        .get(&(student_id.to_string(), topic_id.to_string()))
}

fn deck_view(deck: &[DeckCard], opened: &BTreeSet<usize>) -> Vec<serde_json::Value> {
    deck.iter()
        .enumerate()
        .map(|(i, card)| {
            let g = gate::card_gate(opened, i);
            json!({
                "orderNumber": card.order_number,
                "frontImage": card.front_image,
                "backImage": card.back_image,
                "opened": g == gate::CardGate::Opened,
                "openable": g != gate::CardGate::Locked
            })
        })
        .collect()
}

fn handle_flashcards_save(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let order_number = match req.params.get("orderNumber").and_then(|v| v.as_i64()) {
        Some(v) if (1..=DECK_SLOTS).contains(&v) => v,
        _ => {
            return err(
                &req.id,
                "bad_params",
                format!("orderNumber must be 1..={}", DECK_SLOTS),
                None,
            )
        }
    };
    match topic_exists(conn, &topic_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "topic not found", None),
        Err(e) => return e.response(&req.id),
    }

    let front = req
        .params
        .get("frontImage")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let back = req
        .params
        .get("backImage")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let card_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO flashcards(id, topic_id, order_number, front_image, back_image)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(topic_id, order_number) DO UPDATE SET
           front_image = excluded.front_image,
           back_image = excluded.back_image",
        (&card_id, &topic_id, order_number, &front, &back),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "flashcards" })),
        );
    }

    ok(&req.id, json!({ "ok": true, "orderNumber": order_number }))
}

fn handle_flashcards_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    match topic_exists(conn, &topic_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "topic not found", None),
        Err(e) => return e.response(&req.id),
    }

    let rows = match load_slots(conn, &topic_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // The editor always shows every slot, filled or not.
    let slots: Vec<serde_json::Value> = (1..=DECK_SLOTS)
        .map(|n| {
            let row = rows.iter().find(|s| s.order_number == n);
            json!({
                "orderNumber": n,
                "frontImage": row.and_then(|s| s.front_image.clone()),
                "backImage": row.and_then(|s| s.back_image.clone())
            })
        })
        .collect();

    ok(&req.id, json!({ "slots": slots }))
}

fn handle_progress_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let topic_id = match get_required_str(&req.params, "topicId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match topic_exists(conn, &topic_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "topic not found", None),
        Err(e) => return e.response(&req.id),
    }

    let deck = match load_study_deck(conn, &topic_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let empty = BTreeSet::new();
    let opened = opened_set(state, &session.user_id, &topic_id).unwrap_or(&empty);

    ok(
        &req.id,
        json!({
            "cards": deck_view(&deck, opened),
            "materialUnlocked": gate::material_unlocked(deck.len(), opened)
        }),
    )
}

fn handle_flashcards_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_student(state) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let topic_id = match get_required_str(&req.params, "topicId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let order_number = match req.params.get("orderNumber").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing orderNumber", None),
    };
    match topic_exists(conn, &topic_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "topic not found", None),
        Err(e) => return e.response(&req.id),
    }

    let deck = match load_study_deck(conn, &topic_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(index) = deck.iter().position(|c| c.order_number == order_number) else {
        return err(
            &req.id,
            "not_found",
            "no such card in the study deck",
            Some(json!({ "orderNumber": order_number })),
        );
    };

    let opened = state
        .opened_cards
        .entry((session.user_id.clone(), topic_id.clone()))
        .or_default();

    match gate::open_card(opened, deck.len(), index) {
        Ok(()) => {}
        Err(gate::OpenError::Locked) => {
            return err(
                &req.id,
                "card_locked",
                "open the previous card first",
                Some(json!({ "orderNumber": order_number })),
            )
        }
        Err(gate::OpenError::OutOfRange) => {
            return err(&req.id, "not_found", "no such card in the study deck", None)
        }
    }

    let opened_snapshot = opened.clone();
    ok(
        &req.id,
        json!({
            "cards": deck_view(&deck, &opened_snapshot),
            "materialUnlocked": gate::material_unlocked(deck.len(), &opened_snapshot)
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "flashcards.save" => Some(handle_flashcards_save(state, req)),
        "flashcards.list" => Some(handle_flashcards_list(state, req)),
        "flashcards.open" => Some(handle_flashcards_open(state, req)),
        "progress.get" => Some(handle_progress_get(state, req)),
        _ => None,
    }
}
