use chrono::{NaiveDate, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use crate::api::error::HandlerErr;
use crate::api::types::{Principal, Request, Role};

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 500;

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn principal(req: &Request) -> Result<&Principal, HandlerErr> {
    req.principal
        .as_ref()
        .ok_or_else(|| HandlerErr::unauthorized("authentication required"))
}

pub fn require_role<'a>(req: &'a Request, roles: &[Role]) -> Result<&'a Principal, HandlerErr> {
    let p = principal(req)?;
    if roles.contains(&p.role) {
        Ok(p)
    } else {
        Err(HandlerErr::forbidden())
    }
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match get_opt_str(params, key)? {
        Some(v) => Ok(v),
        None => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

/// Trimmed string param; blank and null read as absent.
pub fn get_opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| HandlerErr::bad_params(format!("{} must be an integer", key))),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn get_opt_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
        },
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn parse_date(key: &str, raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)))
}

pub fn parse_time(key: &str, raw: &str) -> Result<NaiveTime, HandlerErr> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be HH:MM", key)))
}

/// Monday = 1 .. Sunday = 7. Accepts numbers or English day names.
pub fn parse_weekday(key: &str, raw: &str) -> Result<i64, HandlerErr> {
    let t = raw.trim().to_ascii_lowercase();
    if let Ok(n) = t.parse::<i64>() {
        if (1..=7).contains(&n) {
            return Ok(n);
        }
        return Err(HandlerErr::bad_params(format!("{} must be between 1 and 7", key)));
    }
    let n = match t.as_str() {
        "mon" | "monday" => 1,
        "tue" | "tues" | "tuesday" => 2,
        "wed" | "wednesday" => 3,
        "thu" | "thur" | "thurs" | "thursday" => 4,
        "fri" | "friday" => 5,
        "sat" | "saturday" => 6,
        "sun" | "sunday" => 7,
        _ => {
            return Err(HandlerErr::bad_params(format!(
                "{} must be a weekday name or 1-7",
                key
            )))
        }
    };
    Ok(n)
}

pub fn paging(params: &Value) -> Result<(i64, i64), HandlerErr> {
    let limit = get_opt_i64(params, "limit")?.unwrap_or(DEFAULT_LIMIT);
    let offset = get_opt_i64(params, "offset")?.unwrap_or(0);
    if limit < 1 {
        return Err(HandlerErr::bad_params("limit must be positive"));
    }
    if offset < 0 {
        return Err(HandlerErr::bad_params("offset must not be negative"));
    }
    Ok((limit.min(MAX_LIMIT), offset))
}

/// `table` is always a static name from the caller.
pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

pub fn ensure_exists(
    conn: &Connection,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(what))
    }
}

/// `LIKE` pattern matching `needle` anywhere, with wildcards escaped.
pub fn like_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}
