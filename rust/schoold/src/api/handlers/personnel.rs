//! Staff and teachers.

use rusqlite::types::Value as SqlValue;
use serde_json::{json, Value};
use tracing::info;

use crate::api::crud::{self, Field, Filter, Kind, Table};
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::handlers::schedules;
use crate::api::helpers::{
    ensure_exists, get_opt_str, get_required_str, like_pattern, new_id, paging, principal,
    require_role, MAX_LIMIT,
};
use crate::api::types::{AppState, Request, Role};

pub const EMPLOYMENT_STATUSES: &[&str] = &["active", "on_leave", "inactive"];

pub const STAFF: Table = Table {
    name: "staff",
    label: "staff member",
    fields: &[
        Field::new("userId", "user_id", Kind::Text),
        Field::required("employeeNo", "employee_no", Kind::Text),
        Field::required("firstName", "first_name", Kind::Text),
        Field::required("lastName", "last_name", Kind::Text),
        Field::new("email", "email", Kind::Text),
        Field::new("phone", "phone", Kind::Text),
        Field::new("department", "department", Kind::Text),
        Field::new("designation", "designation", Kind::Text),
        Field::new("joinDate", "join_date", Kind::Date),
        Field::new("status", "status", Kind::OneOf(EMPLOYMENT_STATUSES)),
    ],
};

pub const TEACHERS: Table = Table {
    name: "teachers",
    label: "teacher",
    fields: &[
        Field::new("userId", "user_id", Kind::Text),
        Field::required("employeeNo", "employee_no", Kind::Text),
        Field::required("firstName", "first_name", Kind::Text),
        Field::required("lastName", "last_name", Kind::Text),
        Field::new("email", "email", Kind::Text),
        Field::new("phone", "phone", Kind::Text),
        Field::new("subject", "subject", Kind::Text),
        Field::new("qualification", "qualification", Kind::Text),
        Field::new("joinDate", "join_date", Kind::Date),
        Field::new("status", "status", Kind::OneOf(EMPLOYMENT_STATUSES)),
    ],
};

struct Directory {
    table: &'static Table,
    /// Extra equality filter beyond status/search (`department` or `subject`).
    facet: (&'static str, &'static str),
    readers: &'static [Role],
}

const STAFF_DIR: Directory = Directory {
    table: &STAFF,
    facet: ("department", "department"),
    readers: Role::PERSONNEL,
};

const TEACHER_DIR: Directory = Directory {
    table: &TEACHERS,
    facet: ("subject", "subject"),
    readers: &[
        Role::Admin,
        Role::Staff,
        Role::Teacher,
        Role::Parent,
        Role::Guardian,
        Role::Student,
    ],
};

fn handle_list(state: &AppState, req: &Request, dir: &Directory) -> Result<Value, HandlerErr> {
    require_role(req, dir.readers)?;
    let (limit, offset) = paging(&req.params)?;

    let mut filter = Filter::new();
    let (param, column) = dir.facet;
    filter.eq_text(column, get_opt_str(&req.params, param)?);
    if let Some(status) = get_opt_str(&req.params, "status")? {
        if !EMPLOYMENT_STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr::bad_params("unknown status"));
        }
        filter.eq_text("status", Some(status));
    }
    if let Some(search) = get_opt_str(&req.params, "search")? {
        let p = like_pattern(&search);
        filter.push(
            "(t.first_name || ' ' || t.last_name LIKE ? ESCAPE '\\'
              OR t.employee_no LIKE ? ESCAPE '\\'
              OR t.email LIKE ? ESCAPE '\\')",
            [
                SqlValue::Text(p.clone()),
                SqlValue::Text(p.clone()),
                SqlValue::Text(p),
            ],
        );
    }

    let (rows, count) = crud::list(
        &state.db,
        dir.table,
        "",
        &[],
        &filter,
        "t.last_name, t.first_name",
        limit,
        offset,
        crud::no_extras,
    )?;
    Ok(ok_list(format!("{} list", dir.table.label), rows, count))
}

fn handle_get(state: &AppState, req: &Request, dir: &Directory) -> Result<Value, HandlerErr> {
    require_role(req, dir.readers)?;
    let id = get_required_str(&req.params, "id")?;
    let obj = crud::fetch_required(&state.db, dir.table, &id)?;
    Ok(ok(dir.table.label, Value::Object(obj)))
}

fn handle_create(state: &AppState, req: &Request, dir: &Directory) -> Result<Value, HandlerErr> {
    require_role(req, &[Role::Admin])?;
    let values = crud::collect_create(dir.table, &req.params)?;
    if let Some(uid) = crud::assigned_text(&values, "user_id") {
        ensure_exists(&state.db, "users", &uid, "user")?;
    }
    let id = new_id();
    crud::insert(&state.db, dir.table, &id, &values)?;
    info!(record_id = %id, table = dir.table.name, "personnel record created");
    let obj = crud::fetch_required(&state.db, dir.table, &id)?;
    Ok(ok(format!("{} created", dir.table.label), Value::Object(obj)))
}

fn handle_update(state: &AppState, req: &Request, dir: &Directory) -> Result<Value, HandlerErr> {
    require_role(req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, dir.table.name, &id, dir.table.label)?;
    let values = crud::collect_patch(dir.table, &req.params)?;
    if let Some(uid) = crud::assigned_text(&values, "user_id") {
        ensure_exists(&state.db, "users", &uid, "user")?;
    }
    crud::update(&state.db, dir.table, &id, &values)?;
    let obj = crud::fetch_required(&state.db, dir.table, &id)?;
    Ok(ok(format!("{} updated", dir.table.label), Value::Object(obj)))
}

fn handle_staff_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "id")?;
    if !crud::delete(&state.db, &STAFF, &id)? {
        return Err(HandlerErr::not_found("staff member"));
    }
    Ok(ok("staff member deleted", json!({ "id": id })))
}

fn handle_teacher_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, "teachers", &id, "teacher")?;

    // Classes and timetable slots outlive the teacher; they just lose the link.
    let tx = state.db.unchecked_transaction()?;
    tx.execute(
        "UPDATE classes SET class_teacher_id = NULL WHERE class_teacher_id = ?",
        [&id],
    )?;
    tx.execute(
        "UPDATE schedules SET teacher_id = NULL WHERE teacher_id = ?",
        [&id],
    )?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&id])?;
    tx.commit()?;
    info!(teacher_id = %id, "teacher deleted");
    Ok(ok("teacher deleted", json!({ "id": id })))
}

fn handle_teacher_schedule(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    principal(req)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, "teachers", &id, "teacher")?;
    let mut filter = Filter::new();
    filter.eq_text("teacher_id", Some(id));
    let (rows, count) = schedules::list_slots(&state.db, &filter, MAX_LIMIT, 0)?;
    Ok(ok_list("teacher schedule", rows, count))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "staff.list" => handle_list(state, req, &STAFF_DIR),
        "staff.get" => handle_get(state, req, &STAFF_DIR),
        "staff.create" => handle_create(state, req, &STAFF_DIR),
        "staff.update" => handle_update(state, req, &STAFF_DIR),
        "staff.delete" => handle_staff_delete(state, req),
        "teachers.list" => handle_list(state, req, &TEACHER_DIR),
        "teachers.get" => handle_get(state, req, &TEACHER_DIR),
        "teachers.create" => handle_create(state, req, &TEACHER_DIR),
        "teachers.update" => handle_update(state, req, &TEACHER_DIR),
        "teachers.delete" => handle_teacher_delete(state, req),
        "teachers.schedule" => handle_teacher_schedule(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
