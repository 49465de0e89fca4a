use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request, Role, Session};
use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            state.db = Some(conn);
            // Switching workspaces invalidates any in-flight study state.
            state.session = None;
            state.opened_cards.clear();
            ok(&req.id, json!({ "workspacePath": path.to_string_lossy() }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_session_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match get_required_str(&req.params, "userId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let role_raw = match get_required_str(&req.params, "role") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(role) = Role::parse(&role_raw) else {
        return err(
            &req.id,
            "bad_params",
            "role must be TEACHER or STUDENT",
            Some(json!({ "role": role_raw })),
        );
    };

    if role == Role::Student {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [&user_id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "student not found in roster", None);
        }
    }

    // A fresh session starts from the locked state: drop any opened-card
    // progress this user accumulated earlier.
    state
        .opened_cards
        .retain(|(student_id, _), _| student_id != &user_id);

    state.session = Some(Session {
        user_id: user_id.clone(),
        role,
    });
    ok(
        &req.id,
        json!({ "userId": user_id, "role": role.as_str() }),
    )
}

fn handle_session_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    match state.session.as_ref() {
        Some(s) => ok(
            &req.id,
            json!({ "userId": s.user_id, "role": s.role.as_str() }),
        ),
        None => ok(&req.id, json!({ "session": null })),
    }
}

fn handle_session_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    state.session = None;
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "session.signIn" => Some(handle_session_sign_in(state, req)),
        "session.current" => Some(handle_session_current(state, req)),
        "session.signOut" => Some(handle_session_sign_out(state, req)),
        _ => None,
    }
}
