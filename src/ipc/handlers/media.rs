use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_required_str, require_teacher};
use crate::ipc::types::{AppState, Request};
use crate::media::{self, MediaKind};
use serde_json::json;
use std::path::PathBuf;

fn handle_media_store(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = require_teacher(state) {
        return e.response(&req.id);
    }
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let source = match get_required_str(&req.params, "sourcePath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };
    let kind_raw = match get_required_str(&req.params, "kind") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(kind) = MediaKind::parse(&kind_raw) else {
        return err(
            &req.id,
            "bad_params",
            "kind must be image or video",
            Some(json!({ "kind": kind_raw })),
        );
    };

    let stored = match media::store_media(workspace, &source, kind) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "media_store_failed",
                e.to_string(),
                Some(json!({ "maxBytes": kind.max_bytes() })),
            )
        }
    };
    let url = match media::public_url(workspace, &stored.rel_path) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "media_store_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "path": stored.rel_path,
            "publicUrl": url,
            "sizeBytes": stored.size_bytes
        }),
    )
}

fn handle_media_url(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let path = match get_required_str(&req.params, "path") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match media::public_url(workspace, &path) {
        Ok(url) => ok(&req.id, json!({ "publicUrl": url })),
        Err(e) => err(&req.id, "bad_params", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "media.store" => Some(handle_media_store(state, req)),
        "media.url" => Some(handle_media_url(state, req)),
        _ => None,
    }
}
