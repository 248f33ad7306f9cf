use rusqlite::types::Value as SqlValue;
use serde_json::{json, Value};
use tracing::info;

use crate::api::crud::{self, Field, Filter, Kind, Table};
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::helpers::{
    get_opt_bool, get_opt_str, get_required_str, new_id, paging, principal, require_role, today,
};
use crate::api::types::{AppState, Request, Role};

pub const AUDIENCES: &[&str] = &["all", "students", "parents", "staff", "teachers"];
pub const PRIORITIES: &[&str] = &["low", "normal", "high"];

pub const NOTICES: Table = Table {
    name: "notices",
    label: "notice",
    fields: &[
        Field::required("title", "title", Kind::Text),
        Field::required("body", "body", Kind::Text),
        Field::new("audience", "audience", Kind::OneOf(AUDIENCES)),
        Field::new("priority", "priority", Kind::OneOf(PRIORITIES)),
        Field::new("published", "published", Kind::Bool),
        Field::new("publishDate", "publish_date", Kind::Date),
        Field::new("expiresAt", "expires_at", Kind::Date),
        Field::new("createdBy", "created_by", Kind::Text),
    ],
};

const ORDER: &str =
    "CASE t.priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END, t.publish_date DESC, t.created_at DESC";

fn audience_of(role: Role) -> &'static str {
    match role {
        Role::Admin | Role::Staff => "staff",
        Role::Teacher => "teachers",
        Role::Parent | Role::Guardian => "parents",
        Role::Student => "students",
    }
}

/// Published, already live, not yet expired, and addressed to `role`.
fn push_visible(filter: &mut Filter, role: Role) {
    let now = today();
    filter.push(
        "t.published = 1 AND t.publish_date <= ? AND (t.expires_at IS NULL OR t.expires_at >= ?)
         AND t.audience IN ('all', ?)",
        [
            SqlValue::Text(now.clone()),
            SqlValue::Text(now),
            SqlValue::Text(audience_of(role).to_string()),
        ],
    );
}

fn handle_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let (limit, offset) = paging(&req.params)?;
    let mut filter = Filter::new();

    if Role::OFFICE.contains(&p.role) {
        if let Some(audience) = get_opt_str(&req.params, "audience")? {
            if !AUDIENCES.contains(&audience.as_str()) {
                return Err(HandlerErr::bad_params("unknown audience"));
            }
            filter.eq_text("audience", Some(audience));
        }
        if !get_opt_bool(&req.params, "includeUnpublished")?.unwrap_or(true) {
            filter.push("t.published = 1", std::iter::empty::<SqlValue>());
        }
    } else {
        push_visible(&mut filter, p.role);
    }

    let (rows, count) = crud::list(
        &state.db,
        &NOTICES,
        "",
        &[],
        &filter,
        ORDER,
        limit,
        offset,
        crud::no_extras,
    )?;
    Ok(ok_list("notices", rows, count))
}

fn handle_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let id = get_required_str(&req.params, "id")?;
    let mut filter = Filter::new();
    filter.eq_text("id", Some(id));
    if !Role::OFFICE.contains(&p.role) {
        push_visible(&mut filter, p.role);
    }
    let (rows, _) = crud::list(
        &state.db,
        &NOTICES,
        "",
        &[],
        &filter,
        ORDER,
        1,
        0,
        crud::no_extras,
    )?;
    rows.into_iter()
        .next()
        .map(|row| ok("notice", row))
        .ok_or_else(|| HandlerErr::not_found("notice"))
}

fn handle_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = require_role(req, Role::PERSONNEL)?;
    let mut params = req.params.clone();
    params["createdBy"] = json!(p.user_id);
    if get_opt_str(&params, "publishDate")?.is_none() {
        params["publishDate"] = json!(today());
    }
    let values = crud::collect_create(&NOTICES, &params)?;
    check_window(&values)?;

    let id = new_id();
    crud::insert(&state.db, &NOTICES, &id, &values)?;
    info!(notice_id = %id, author = %p.user_id, "notice created");
    let obj = crud::fetch_required(&state.db, &NOTICES, &id)?;
    Ok(ok("notice created", Value::Object(obj)))
}

fn check_window(values: &crud::Assignments) -> Result<(), HandlerErr> {
    if let (Some(from), Some(until)) = (
        crud::assigned_text(values, "publish_date"),
        crud::assigned_text(values, "expires_at"),
    ) {
        if until < from {
            return Err(HandlerErr::bad_params("expiresAt must not be before publishDate"));
        }
    }
    Ok(())
}

fn handle_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::PERSONNEL)?;
    let id = get_required_str(&req.params, "id")?;
    let current = crud::fetch_required(&state.db, &NOTICES, &id)?;
    let mut values = crud::collect_patch(&NOTICES, &req.params)?;
    values.retain(|(c, _)| *c != "created_by");
    if let Some(SqlValue::Null) = crud::assigned(&values, "publish_date") {
        return Err(HandlerErr::bad_params("publishDate must not be empty"));
    }

    // Check the window the row will have after the patch.
    let mut window: crud::Assignments = Vec::new();
    for (column, key) in [("publish_date", "publishDate"), ("expires_at", "expiresAt")] {
        let v = match crud::assigned(&values, column) {
            Some(v) => v.clone(),
            None => current
                .get(key)
                .and_then(Value::as_str)
                .map(|s| SqlValue::Text(s.to_string()))
                .unwrap_or(SqlValue::Null),
        };
        window.push((column, v));
    }
    check_window(&window)?;

    crud::update(&state.db, &NOTICES, &id, &values)?;
    let obj = crud::fetch_required(&state.db, &NOTICES, &id)?;
    Ok(ok("notice updated", Value::Object(obj)))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::PERSONNEL)?;
    let id = get_required_str(&req.params, "id")?;
    if !crud::delete(&state.db, &NOTICES, &id)? {
        return Err(HandlerErr::not_found("notice"));
    }
    Ok(ok("notice deleted", json!({ "id": id })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "notices.list" => handle_list(state, req),
        "notices.get" => handle_get(state, req),
        "notices.create" => handle_create(state, req),
        "notices.update" => handle_update(state, req),
        "notices.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
