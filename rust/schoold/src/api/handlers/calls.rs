//! Call log and its ringing/ongoing/ended lifecycle. Media is not carried here.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::info;

use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::helpers::{
    ensure_exists, get_opt_str, get_required_str, new_id, now_rfc3339, paging, principal,
};
use crate::api::types::{AppState, Request};

pub const CALL_TYPES: &[&str] = &["audio", "video"];
pub const CALL_STATUSES: &[&str] = &["ringing", "ongoing", "rejected", "missed", "ended"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Accept,
    Reject,
    Cancel,
    End,
}

impl Action {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(Self::Accept),
            "reject" => Some(Self::Reject),
            "cancel" => Some(Self::Cancel),
            "end" => Some(Self::End),
            _ => None,
        }
    }
}

/// Next status for `action` taken by `side` on a call in `status`.
fn transition(status: &str, action: Action, side: Side) -> Option<&'static str> {
    match (status, action, side) {
        ("ringing", Action::Accept, Side::Callee) => Some("ongoing"),
        ("ringing", Action::Reject, Side::Callee) => Some("rejected"),
        ("ringing", Action::Cancel, Side::Caller) => Some("missed"),
        ("ongoing", Action::End, _) => Some("ended"),
        _ => None,
    }
}

const SELECT: &str = "SELECT k.id, k.caller_id, a.username, k.callee_id, b.username, k.call_type, k.status,
        k.created_at, k.started_at, k.ended_at, k.duration_secs
 FROM calls k
 LEFT JOIN users a ON a.id = k.caller_id
 LEFT JOIN users b ON b.id = k.callee_id";

fn call_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "callerId": r.get::<_, String>(1)?,
        "callerName": r.get::<_, Option<String>>(2)?,
        "calleeId": r.get::<_, String>(3)?,
        "calleeName": r.get::<_, Option<String>>(4)?,
        "callType": r.get::<_, String>(5)?,
        "status": r.get::<_, String>(6)?,
        "createdAt": r.get::<_, String>(7)?,
        "startedAt": r.get::<_, Option<String>>(8)?,
        "endedAt": r.get::<_, Option<String>>(9)?,
        "durationSecs": r.get::<_, Option<i64>>(10)?
    }))
}

fn load(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE k.id = ?", SELECT), [id], call_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("call"))
}

fn handle_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = &principal(req)?.user_id;
    let (limit, offset) = paging(&req.params)?;

    let mut where_sql = String::from("WHERE (k.caller_id = ? OR k.callee_id = ?)");
    let mut args = vec![SqlValue::Text(me.clone()), SqlValue::Text(me.clone())];
    if let Some(status) = get_opt_str(&req.params, "status")? {
        if !CALL_STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr::bad_params("unknown status"));
        }
        where_sql.push_str(" AND k.status = ?");
        args.push(SqlValue::Text(status));
    }

    let count: i64 = state.db.query_row(
        &format!("SELECT COUNT(*) FROM calls k {}", where_sql),
        params_from_iter(args.iter()),
        |r| r.get(0),
    )?;
    args.push(SqlValue::Integer(limit));
    args.push(SqlValue::Integer(offset));
    let mut stmt = state.db.prepare(&format!(
        "{} {} ORDER BY k.created_at DESC, k.rowid DESC LIMIT ? OFFSET ?",
        SELECT, where_sql
    ))?;
    let rows = stmt
        .query_map(params_from_iter(args), call_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ok_list("calls", rows, count))
}

fn handle_start(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = principal(req)?.user_id.clone();
    let callee = get_required_str(&req.params, "calleeId")?;
    if callee == me {
        return Err(HandlerErr::bad_params("cannot call yourself"));
    }
    let call_type = get_opt_str(&req.params, "callType")?
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_else(|| "audio".to_string());
    if !CALL_TYPES.contains(&call_type.as_str()) {
        return Err(HandlerErr::bad_params("callType must be audio or video"));
    }
    ensure_exists(&state.db, "users", &callee, "callee")?;

    let id = new_id();
    state.db.execute(
        "INSERT INTO calls(id, caller_id, callee_id, call_type, status, created_at)
         VALUES(?, ?, ?, ?, 'ringing', ?)",
        (&id, &me, &callee, &call_type, now_rfc3339()),
    )?;
    info!(call_id = %id, caller = %me, callee = %callee, "call started");
    Ok(ok("call started", load(&state.db, &id)?))
}

fn duration_secs(started_at: Option<&str>, ended: DateTime<Utc>) -> Option<i64> {
    let started = DateTime::parse_from_rfc3339(started_at?).ok()?;
    Some((ended - started.with_timezone(&Utc)).num_seconds().max(0))
}

fn handle_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = &principal(req)?.user_id;
    let id = get_required_str(&req.params, "id")?;
    let raw_action = get_required_str(&req.params, "action")?.to_ascii_lowercase();
    let action = Action::parse(&raw_action)
        .ok_or_else(|| HandlerErr::bad_params("action must be accept, reject, cancel or end"))?;

    let row: Option<(String, String, String, Option<String>)> = state
        .db
        .query_row(
            "SELECT caller_id, callee_id, status, started_at FROM calls WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((caller, callee, status, started_at)) = row else {
        return Err(HandlerErr::not_found("call"));
    };
    let side = if *me == caller {
        Side::Caller
    } else if *me == callee {
        Side::Callee
    } else {
        return Err(HandlerErr::forbidden());
    };
    let Some(next) = transition(&status, action, side) else {
        return Err(HandlerErr::conflict(format!(
            "cannot {} a {} call as the {}",
            raw_action,
            status,
            if side == Side::Caller { "caller" } else { "callee" }
        )));
    };

    let now = Utc::now();
    let stamp = now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    // Guard on the observed status so concurrent updates cannot both apply.
    let n = match action {
        Action::Accept => state.db.execute(
            "UPDATE calls SET status = ?, started_at = ? WHERE id = ? AND status = ?",
            (next, &stamp, &id, &status),
        )?,
        Action::End => state.db.execute(
            "UPDATE calls SET status = ?, ended_at = ?, duration_secs = ? WHERE id = ? AND status = ?",
            (next, &stamp, duration_secs(started_at.as_deref(), now), &id, &status),
        )?,
        Action::Reject | Action::Cancel => state.db.execute(
            "UPDATE calls SET status = ?, ended_at = ? WHERE id = ? AND status = ?",
            (next, &stamp, &id, &status),
        )?,
    };
    if n == 0 {
        return Err(HandlerErr::conflict("call changed concurrently"));
    }
    info!(call_id = %id, from = %status, to = next, "call updated");
    Ok(ok(format!("call {}", next), load(&state.db, &id)?))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "calls.list" => handle_list(state, req),
        "calls.start" => handle_start(state, req),
        "calls.update" => handle_update(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listed_transitions_apply() {
        assert_eq!(transition("ringing", Action::Accept, Side::Callee), Some("ongoing"));
        assert_eq!(transition("ringing", Action::Accept, Side::Caller), None);
        assert_eq!(transition("ringing", Action::Cancel, Side::Caller), Some("missed"));
        assert_eq!(transition("ongoing", Action::End, Side::Caller), Some("ended"));
        assert_eq!(transition("ended", Action::End, Side::Callee), None);
        assert_eq!(transition("rejected", Action::Accept, Side::Callee), None);
    }

    #[test]
    fn duration_is_whole_seconds() {
        let end = DateTime::parse_from_rfc3339("2024-05-01T10:01:30Z")
            .expect("ts")
            .with_timezone(&Utc);
        assert_eq!(duration_secs(Some("2024-05-01T10:00:00Z"), end), Some(90));
        assert_eq!(duration_secs(None, end), None);
    }
}
