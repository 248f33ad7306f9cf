use serde_json::json;

pub fn ok(message: impl Into<String>, data: serde_json::Value) -> serde_json::Value {
    json!({
        "status": "success",
        "message": message.into(),
        "data": data
    })
}

pub fn ok_list(
    message: impl Into<String>,
    rows: Vec<serde_json::Value>,
    count: i64,
) -> serde_json::Value {
    json!({
        "status": "success",
        "message": message.into(),
        "data": rows,
        "count": count
    })
}

pub fn err(
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut out = json!({
        "status": "error",
        "message": message.into(),
        "code": code,
        "data": null,
    });
    if let Some(d) = details {
        out["details"] = d;
    }
    out
}

/// HTTP status for an envelope error code.
pub fn http_status(code: &str) -> u16 {
    match code {
        "bad_params" | "bad_json" => 400,
        "unauthorized" => 401,
        "forbidden" => 403,
        "not_found" | "not_implemented" => 404,
        "method_not_allowed" => 405,
        "conflict" => 409,
        "payload_too_large" => 413,
        "rate_limited" => 429,
        _ => 500,
    }
}

#[derive(Debug)]
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

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn forbidden() -> Self {
        Self::new("forbidden", "not allowed for this account")
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self) -> serde_json::Value {
        err(self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref f, _) = e {
            match f.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return HandlerErr::conflict("a record with the same key already exists");
                }
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                    return HandlerErr::conflict("record is referenced by other records");
                }
                _ => {}
            }
        }
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        HandlerErr::new("internal", e.to_string())
    }
}
