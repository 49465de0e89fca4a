use chrono::{SecondsFormat, Utc};
use serde_json::json;

use super::error::err;
use super::types::{AppState, Role, Session};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_trimmed_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = get_required_str(params, key)?;
    let s = s.trim().to_string();
    if s.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must not be empty", key),
        ));
    }
    Ok(s)
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn require_session(state: &AppState) -> Result<Session, HandlerErr> {
    state
        .session
        .clone()
        .ok_or_else(|| HandlerErr::new("not_signed_in", "sign in first"))
}

pub fn require_role(state: &AppState, role: Role) -> Result<Session, HandlerErr> {
    let session = require_session(state)?;
    if session.role != role {
        return Err(HandlerErr::with_details(
            "forbidden",
            format!("requires {} role", role.as_str()),
            json!({ "role": session.role.as_str() }),
        ));
    }
    Ok(session)
}

pub fn require_teacher(state: &AppState) -> Result<Session, HandlerErr> {
    require_role(state, Role::Teacher)
}

pub fn require_student(state: &AppState) -> Result<Session, HandlerErr> {
    require_role(state, Role::Student)
}
