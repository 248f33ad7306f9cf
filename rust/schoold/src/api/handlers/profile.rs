use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::api::crud::{self, Table};
use crate::api::error::{ok, HandlerErr};
use crate::api::handlers::accounts::load_user;
use crate::api::handlers::family::{GUARDIANS, PARENTS};
use crate::api::handlers::personnel::{STAFF, TEACHERS};
use crate::api::handlers::students::STUDENTS;
use crate::api::helpers::principal;
use crate::api::types::{AppState, Principal, Request, Role};
use crate::identity::{self, RecordKind};

/// Staff and teacher rows are linked by `user_id`, falling back to email.
fn personnel_record(
    conn: &Connection,
    table: &Table,
    p: &Principal,
) -> Result<Option<(String, &'static str)>, HandlerErr> {
    let by_user: Option<String> = conn
        .query_row(
            &format!(
                "SELECT id FROM {} WHERE user_id = ? ORDER BY created_at, id LIMIT 1",
                table.name
            ),
            [&p.user_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = by_user {
        return Ok(Some((id, "userId")));
    }
    let Some(email) = p.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) else {
        return Ok(None);
    };
    let by_email: Option<String> = conn
        .query_row(
            &format!(
                "SELECT id FROM {} WHERE lower(trim(email)) = lower(?) ORDER BY created_at, id LIMIT 1",
                table.name
            ),
            [email],
            |r| r.get(0),
        )
        .optional()?;
    Ok(by_email.map(|id| (id, "email")))
}

fn handle_me(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let user = load_user(&state.db, &p.user_id)?.ok_or_else(|| HandlerErr::not_found("user"))?;

    let (table, found): (&Table, Option<(String, &'static str)>) = match p.role {
        Role::Parent | Role::Guardian | Role::Student => {
            let (kind, table) = match p.role {
                Role::Parent => (RecordKind::Parent, &PARENTS),
                Role::Guardian => (RecordKind::Guardian, &GUARDIANS),
                _ => (RecordKind::Student, &STUDENTS),
            };
            let m = identity::resolve(&state.db, kind, p, &state.email_domain)?;
            (table, m.map(|m| (m.record_id, m.matched_by.as_str())))
        }
        Role::Teacher => (&TEACHERS, personnel_record(&state.db, &TEACHERS, p)?),
        Role::Admin | Role::Staff => (&STAFF, personnel_record(&state.db, &STAFF, p)?),
    };

    let (record, matched_by) = match found {
        Some((id, how)) => (
            crud::fetch(&state.db, table, &id)?.map(Value::Object),
            Some(how),
        ),
        None => (None, None),
    };
    Ok(ok(
        "profile",
        json!({
            "user": user,
            "recordType": table.label,
            "record": record,
            "matchedBy": matched_by
        }),
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "profile.me" => handle_me(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
