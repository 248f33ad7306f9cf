use rusqlite::types::Value as SqlValue;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};

use crate::api::crud::{self, Field, Filter, Kind, Table};
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::helpers::{get_opt_bool, get_required_str, new_id, paging, principal};
use crate::api::types::{AppState, Request};

pub const TODOS: Table = Table {
    name: "todos",
    label: "todo",
    fields: &[
        Field::required("userId", "user_id", Kind::Text),
        Field::required("title", "title", Kind::Text),
        Field::new("notes", "notes", Kind::Text),
        Field::new("dueDate", "due_date", Kind::Date),
        Field::new("done", "done", Kind::Bool),
    ],
};

/// Other users' todos read as missing.
fn ensure_owner(state: &AppState, id: &str, user_id: &str) -> Result<(), HandlerErr> {
    let owner: Option<String> = state
        .db
        .query_row("SELECT user_id FROM todos WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    match owner {
        Some(o) if o == user_id => Ok(()),
        _ => Err(HandlerErr::not_found("todo")),
    }
}

fn handle_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let (limit, offset) = paging(&req.params)?;
    let mut filter = Filter::new();
    filter.eq_text("user_id", Some(p.user_id.clone()));
    if let Some(done) = get_opt_bool(&req.params, "done")? {
        filter.push("t.done = ?", [SqlValue::Integer(i64::from(done))]);
    }
    let (rows, count) = crud::list(
        &state.db,
        &TODOS,
        "",
        &[],
        &filter,
        "t.done, t.due_date IS NULL, t.due_date, t.created_at",
        limit,
        offset,
        crud::no_extras,
    )?;
    Ok(ok_list("todos", rows, count))
}

fn handle_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let mut params = req.params.clone();
    params["userId"] = json!(p.user_id);
    let values = crud::collect_create(&TODOS, &params)?;
    let id = new_id();
    crud::insert(&state.db, &TODOS, &id, &values)?;
    let obj = crud::fetch_required(&state.db, &TODOS, &id)?;
    Ok(ok("todo created", Value::Object(obj)))
}

fn handle_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_owner(state, &id, &p.user_id)?;
    let mut values = crud::collect_patch(&TODOS, &req.params)?;
    values.retain(|(c, _)| *c != "user_id");
    crud::update(&state.db, &TODOS, &id, &values)?;
    let obj = crud::fetch_required(&state.db, &TODOS, &id)?;
    Ok(ok("todo updated", Value::Object(obj)))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_owner(state, &id, &p.user_id)?;
    crud::delete(&state.db, &TODOS, &id)?;
    Ok(ok("todo deleted", json!({ "id": id })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "todos.list" => handle_list(state, req),
        "todos.create" => handle_create(state, req),
        "todos.update" => handle_update(state, req),
        "todos.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
