use serde_json::json;

use crate::calc::CalcError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Error taxonomy at the IPC boundary. Codes are the wire contract:
/// `bad_params` (rejected before persistence), `not_found`,
/// `token_exhausted` (distinct so the caller can explain why access was
/// denied), `unauthorized`, and the `db_*` internal kinds whose messages
/// pass through without further detail.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            code: "unauthorized",
            message: message.into(),
            details: None,
        }
    }

    pub fn exhausted() -> Self {
        Self {
            code: "token_exhausted",
            message: "token usage limit exceeded".to_string(),
            details: None,
        }
    }

    pub fn db_query(e: rusqlite::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }

    pub fn db_insert(e: rusqlite::Error, table: &str) -> Self {
        Self {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": table })),
        }
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        // CalcError codes are a closed set; anything unrecognized surfaces
        // as the generic internal query kind.
        let code = match e.code.as_str() {
            "bad_params" => "bad_params",
            "not_found" => "not_found",
            "db_insert_failed" => "db_insert_failed",
            _ => "db_query_failed",
        };
        Self {
            code,
            message: e.message,
            details: e.details,
        }
    }
}
