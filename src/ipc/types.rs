use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// Closed role set forwarded by the session layer. Anything outside these
/// variants fails to deserialize and the request is rejected up front.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    SubjectTeacher,
    ClassTeacher,
    SuperAdmin,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Actor {
    pub role: Role,
    #[serde(default, rename = "teacherId")]
    pub teacher_id: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub actor: Option<Actor>,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn conn(&self) -> Result<&Connection, super::error::HandlerErr> {
        self.db.as_ref().ok_or(super::error::HandlerErr {
            code: "no_workspace",
            message: "select a workspace first".to_string(),
            details: None,
        })
    }
}
