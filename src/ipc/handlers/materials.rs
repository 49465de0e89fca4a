use crate::gate;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::flashcards::{load_study_deck, opened_set, topic_subject};
use crate::ipc::handlers::subjects::subject_exists;
use crate::ipc::helpers::{get_required_str, get_trimmed_str, require_student, require_teacher, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use uuid::Uuid;

/// One slide is an ordered list of these. Order is significant and
/// user-editable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    SubHeader { text: String },
    Paragraph { text: String },
    Image { path: String, caption: Option<String> },
    Video { path: String, caption: Option<String> },
    BulletList { items: Vec<String> },
    SmartList { items: Vec<String> },
    GreenList { items: Vec<String> },
}

fn parse_blocks(value: &serde_json::Value) -> Result<Vec<ContentBlock>, HandlerErr> {
    serde_json::from_value::<Vec<ContentBlock>>(value.clone()).map_err(|e| {
        HandlerErr::new("bad_params", format!("invalid content blocks: {}", e))
    })
}

fn blocks_to_json(blocks: &[ContentBlock]) -> Result<String, HandlerErr> {
    serde_json::to_string(blocks)
        .map_err(|e| HandlerErr::new("bad_params", format!("failed to encode blocks: {}", e)))
}

fn material_row(conn: &Connection, material_id: &str) -> Result<Option<(String, String, i64, String)>, HandlerErr> {
    conn.query_row(
        "SELECT subject_id, title, order_number, blocks FROM reading_materials WHERE id = ?",
        [material_id],
        |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
            ))
        },
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn decode_blocks(raw: &str) -> serde_json::Value {
    // Stored blocks were validated on the way in; a decode failure here
    // means a hand-edited database, surfaced as an empty slide rather than
    // a dead page.
    serde_json::from_str::<serde_json::Value>(raw).unwrap_or_else(|_| json!([]))
}

fn list_materials(conn: &Connection, subject_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, order_number, blocks
             FROM reading_materials
             WHERE subject_id = ?
             ORDER BY order_number",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    stmt.query_map([subject_id], |r| {
        let id: String = r.get(0)?;
        let title: String = r.get(1)?;
        let order_number: i64 = r.get(2)?;
        let blocks_raw: String = r.get(3)?;
        Ok(json!({
            "id": id,
            "title": title,
            "orderNumber": order_number,
            "blocks": decode_blocks(&blocks_raw)
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_materials_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let title = match get_trimmed_str(&req.params, "title") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }

    let blocks = match req.params.get("blocks") {
        Some(v) => match parse_blocks(v) {
            Ok(b) => b,
            Err(e) => return e.response(&req.id),
        },
        None => Vec::new(),
    };
    let blocks_json = match blocks_to_json(&blocks) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let order_number: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM reading_materials WHERE subject_id = ?",
        [&subject_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let material_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO reading_materials(id, subject_id, title, order_number, blocks)
         VALUES(?, ?, ?, ?, ?)",
        (&material_id, &subject_id, &title, order_number + 1, &blocks_json),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "reading_materials" })),
        );
    }

    ok(
        &req.id,
        json!({ "materialId": material_id, "orderNumber": order_number + 1 }),
    )
}

fn handle_materials_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let material_id = match get_required_str(&req.params, "materialId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match material_row(conn, &material_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "material not found", None),
        Err(e) => return e.response(&req.id),
    }

    if let Some(title_raw) = req.params.get("title").and_then(|v| v.as_str()) {
        let title = title_raw.trim();
        if title.is_empty() {
            return err(&req.id, "bad_params", "title must not be empty", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE reading_materials SET title = ? WHERE id = ?",
            (title, &material_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(blocks_value) = req.params.get("blocks") {
        let blocks = match parse_blocks(blocks_value) {
            Ok(b) => b,
            Err(e) => return e.response(&req.id),
        };
        let blocks_json = match blocks_to_json(&blocks) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        if let Err(e) = conn.execute(
            "UPDATE reading_materials SET blocks = ? WHERE id = ?",
            (&blocks_json, &material_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_materials_move_block(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let material_id = match get_required_str(&req.params, "materialId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let index = match req.params.get("index").and_then(|v| v.as_i64()) {
        Some(v) if v >= 0 => v as usize,
        _ => return err(&req.id, "bad_params", "missing/invalid index", None),
    };
    let direction = match req.params.get("direction").and_then(|v| v.as_str()) {
        Some("up") => -1i64,
        Some("down") => 1i64,
        _ => return err(&req.id, "bad_params", "direction must be up or down", None),
    };

    let (_, _, _, blocks_raw) = match material_row(conn, &material_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "material not found", None),
        Err(e) => return e.response(&req.id),
    };
    let mut blocks: Vec<ContentBlock> = match serde_json::from_str(&blocks_raw) {
        Ok(b) => b,
        Err(e) => {
            return err(
                &req.id,
                "db_query_failed",
                format!("stored blocks are unreadable: {}", e),
                None,
            )
        }
    };

    if index >= blocks.len() {
        return err(
            &req.id,
            "bad_params",
            "index out of range",
            Some(json!({ "index": index, "len": blocks.len() })),
        );
    }
    let target = index as i64 + direction;
    if target < 0 || target as usize >= blocks.len() {
        // Moving past either end is a no-op, not an error; the UI keeps the
        // buttons enabled.
        return ok(&req.id, json!({ "moved": false }));
    }
    blocks.swap(index, target as usize);

    let blocks_json = match blocks_to_json(&blocks) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = conn.execute(
        "UPDATE reading_materials SET blocks = ? WHERE id = ?",
        (&blocks_json, &material_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "moved": true }))
}

fn handle_materials_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let material_id = match get_required_str(&req.params, "materialId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let deleted = match conn.execute("DELETE FROM reading_materials WHERE id = ?", [&material_id]) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "reading_materials" })),
            )
        }
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "material not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_materials_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    match list_materials(conn, &subject_id) {
        Ok(materials) => ok(&req.id, json!({ "materials": materials })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_materials_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let material_id = match get_required_str(&req.params, "materialId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match material_row(conn, &material_id) {
        Ok(Some((subject_id, title, order_number, blocks_raw))) => ok(
            &req.id,
            json!({
                "id": material_id,
                "subjectId": subject_id,
                "title": title,
                "orderNumber": order_number,
                "blocks": decode_blocks(&blocks_raw)
            }),
        ),
        Ok(None) => err(&req.id, "not_found", "material not found", None),
        Err(e) => e.response(&req.id),
    }
}

fn handle_materials_study(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match topic_subject(conn, &topic_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "topic not found", None),
        Err(e) => return e.response(&req.id),
    };

    // The UI hides the entry point while the gate is closed; the gate is
    // still re-checked here.
    let deck = match load_study_deck(conn, &topic_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let empty = BTreeSet::new();
    let opened = opened_set(state, &session.user_id, &topic_id).unwrap_or(&empty);
    if !gate::material_unlocked(deck.len(), opened) {
        return err(
            &req.id,
            "locked",
            "open every flashcard in this topic first",
            Some(json!({ "opened": opened.len(), "deckSize": deck.len() })),
        );
    }

    match list_materials(conn, &subject_id) {
        Ok(materials) => ok(
            &req.id,
            json!({ "subjectId": subject_id, "materials": materials }),
        ),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "materials.create" => Some(handle_materials_create(state, req)),
        "materials.update" => Some(handle_materials_update(state, req)),
        "materials.moveBlock" => Some(handle_materials_move_block(state, req)),
        "materials.delete" => Some(handle_materials_delete(state, req)),
        "materials.list" => Some(handle_materials_list(state, req)),
        "materials.get" => Some(handle_materials_get(state, req)),
        "materials.study" => Some(handle_materials_study(state, req)),
        _ => None,
    }
}
