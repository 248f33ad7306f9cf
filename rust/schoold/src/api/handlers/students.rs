use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::api::crud::{self, Field, Filter, Kind, Table};
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::handlers::family;
use crate::api::helpers::{
    ensure_exists, get_opt_str, get_required_str, like_pattern, new_id, paging, principal,
    require_role,
};
use crate::api::types::{AppState, Request, Role};

pub const STUDENT_STATUSES: &[&str] = &["active", "inactive", "graduated", "transferred"];

pub const STUDENTS: Table = Table {
    name: "students",
    label: "student",
    fields: &[
        Field::new("userId", "user_id", Kind::Text),
        Field::required("admissionNo", "admission_no", Kind::Text),
        Field::required("firstName", "first_name", Kind::Text),
        Field::required("lastName", "last_name", Kind::Text),
        Field::new("gender", "gender", Kind::Text),
        Field::new("dateOfBirth", "date_of_birth", Kind::Date),
        Field::new("email", "email", Kind::Text),
        Field::new("phone", "phone", Kind::Text),
        Field::new("address", "address", Kind::Text),
        Field::new("classId", "class_id", Kind::Text),
        Field::new("sectionId", "section_id", Kind::Text),
        Field::new("rollNo", "roll_no", Kind::Text),
        Field::new("admissionDate", "admission_date", Kind::Date),
        Field::new("status", "status", Kind::OneOf(STUDENT_STATUSES)),
    ],
};

/// Compact student rows for embedding in parent, guardian and leave views.
pub(crate) fn student_summaries(
    conn: &Connection,
    ids: &[String],
) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.admission_no, s.first_name, s.last_name, s.class_id, c.name, s.section_id, sec.name, s.status
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id
         LEFT JOIN sections sec ON sec.id = s.section_id
         WHERE s.id = ?",
    )?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let row = stmt
            .query_row([id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "admissionNo": r.get::<_, String>(1)?,
                    "firstName": r.get::<_, String>(2)?,
                    "lastName": r.get::<_, String>(3)?,
                    "classId": r.get::<_, Option<String>>(4)?,
                    "className": r.get::<_, Option<String>>(5)?,
                    "sectionId": r.get::<_, Option<String>>(6)?,
                    "sectionName": r.get::<_, Option<String>>(7)?,
                    "status": r.get::<_, String>(8)?
                }))
            })
            .optional()?;
        if let Some(v) = row {
            out.push(v);
        }
    }
    Ok(out)
}

/// The section, when given, must belong to the class the student ends up in.
fn check_placement(
    conn: &Connection,
    class_id: Option<&str>,
    section_id: Option<&str>,
) -> Result<(), HandlerErr> {
    if let Some(cid) = class_id {
        ensure_exists(conn, "classes", cid, "class")?;
    }
    let Some(sid) = section_id else {
        return Ok(());
    };
    let owner: Option<String> = conn
        .query_row("SELECT class_id FROM sections WHERE id = ?", [sid], |r| r.get(0))
        .optional()?;
    let Some(owner) = owner else {
        return Err(HandlerErr::not_found("section"));
    };
    match class_id {
        Some(cid) if cid == owner => Ok(()),
        Some(_) => Err(HandlerErr::bad_params("section does not belong to class")),
        None => Err(HandlerErr::bad_params("sectionId requires classId")),
    }
}

fn check_user_link(conn: &Connection, user_id: Option<&str>) -> Result<(), HandlerErr> {
    if let Some(uid) = user_id {
        ensure_exists(conn, "users", uid, "user")?;
    }
    Ok(())
}

fn handle_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::PERSONNEL)?;
    let (limit, offset) = paging(&req.params)?;

    let mut filter = Filter::new();
    filter.eq_text("class_id", get_opt_str(&req.params, "classId")?);
    filter.eq_text("section_id", get_opt_str(&req.params, "sectionId")?);
    if let Some(status) = get_opt_str(&req.params, "status")? {
        if !STUDENT_STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr::bad_params("unknown status"));
        }
        filter.eq_text("status", Some(status));
    }
    if let Some(search) = get_opt_str(&req.params, "search")? {
        let p = like_pattern(&search);
        filter.push(
            "(t.first_name || ' ' || t.last_name LIKE ? ESCAPE '\\'
              OR t.admission_no LIKE ? ESCAPE '\\'
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
        &STUDENTS,
        "LEFT JOIN classes c ON c.id = t.class_id LEFT JOIN sections sec ON sec.id = t.section_id",
        &["c.name", "sec.name"],
        &filter,
        "t.last_name, t.first_name, t.admission_no",
        limit,
        offset,
        |r, base, obj| {
            obj.insert("className".into(), json!(r.get::<_, Option<String>>(base)?));
            obj.insert("sectionName".into(), json!(r.get::<_, Option<String>>(base + 1)?));
            Ok(())
        },
    )?;
    Ok(ok_list("students", rows, count))
}

fn may_view(state: &AppState, req: &Request, student_id: &str) -> Result<bool, HandlerErr> {
    let p = principal(req)?;
    if p.role.is_personnel() {
        return Ok(true);
    }
    let ids = family::student_ids_for(state, p)?;
    Ok(ids.iter().any(|id| id == student_id))
}

fn linked_people(
    conn: &Connection,
    sql: &str,
    student_id: &str,
) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "firstName": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "email": r.get::<_, Option<String>>(3)?,
                "phone": r.get::<_, Option<String>>(4)?,
                "relation": r.get::<_, Option<String>>(5)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let id = get_required_str(&req.params, "id")?;
    // Students outside a family's links read as missing, not forbidden.
    if !may_view(state, req, &id)? {
        return Err(HandlerErr::not_found(STUDENTS.label));
    }
    let mut obj = crud::fetch_required(&state.db, &STUDENTS, &id)?;

    let class_name: Option<String> = state
        .db
        .query_row(
            "SELECT c.name FROM students s JOIN classes c ON c.id = s.class_id WHERE s.id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()?;
    let section_name: Option<String> = state
        .db
        .query_row(
            "SELECT sec.name FROM students s JOIN sections sec ON sec.id = s.section_id WHERE s.id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()?;
    obj.insert("className".into(), json!(class_name));
    obj.insert("sectionName".into(), json!(section_name));
    obj.insert(
        "parents".into(),
        Value::Array(linked_people(
            &state.db,
            "SELECT p.id, p.first_name, p.last_name, p.email, p.phone, ps.relation
             FROM parent_students ps JOIN parents p ON p.id = ps.parent_id
             WHERE ps.student_id = ?
             ORDER BY p.last_name, p.first_name",
            &id,
        )?),
    );
    obj.insert(
        "guardians".into(),
        Value::Array(linked_people(
            &state.db,
            "SELECT g.id, g.first_name, g.last_name, g.email, g.phone, g.relation
             FROM guardian_students gs JOIN guardians g ON g.id = gs.guardian_id
             WHERE gs.student_id = ?
             ORDER BY g.last_name, g.first_name",
            &id,
        )?),
    );
    Ok(ok("student", Value::Object(obj)))
}

fn handle_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let values = crud::collect_create(&STUDENTS, &req.params)?;
    check_placement(
        &state.db,
        crud::assigned_text(&values, "class_id").as_deref(),
        crud::assigned_text(&values, "section_id").as_deref(),
    )?;
    check_user_link(&state.db, crud::assigned_text(&values, "user_id").as_deref())?;

    let id = new_id();
    crud::insert(&state.db, &STUDENTS, &id, &values)?;
    info!(student_id = %id, "student created");
    let obj = crud::fetch_required(&state.db, &STUDENTS, &id)?;
    Ok(ok("student created", Value::Object(obj)))
}

fn text_of(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn handle_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    let current = crud::fetch_required(&state.db, &STUDENTS, &id)?;
    let values = crud::collect_patch(&STUDENTS, &req.params)?;

    // Validate the placement the row will have after the patch.
    let class_id = match crud::assigned(&values, "class_id") {
        Some(SqlValue::Text(s)) => Some(s.clone()),
        Some(_) => None,
        None => text_of(&current, "classId"),
    };
    let section_id = match crud::assigned(&values, "section_id") {
        Some(SqlValue::Text(s)) => Some(s.clone()),
        Some(_) => None,
        // Moving class without naming a section drops the old section.
        None if crud::assigned(&values, "class_id").is_some() => None,
        None => text_of(&current, "sectionId"),
    };
    check_placement(&state.db, class_id.as_deref(), section_id.as_deref())?;
    check_user_link(&state.db, crud::assigned_text(&values, "user_id").as_deref())?;

    let mut values = values;
    if crud::assigned(&values, "class_id").is_some() && crud::assigned(&values, "section_id").is_none() {
        values.push((
            "section_id",
            section_id.map(SqlValue::Text).unwrap_or(SqlValue::Null),
        ));
    }
    crud::update(&state.db, &STUDENTS, &id, &values)?;
    let obj = crud::fetch_required(&state.db, &STUDENTS, &id)?;
    Ok(ok("student updated", Value::Object(obj)))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, "students", &id, "student")?;

    let tx = state.db.unchecked_transaction()?;
    tx.execute("DELETE FROM parent_students WHERE student_id = ?", [&id])?;
    tx.execute("DELETE FROM guardian_students WHERE student_id = ?", [&id])?;
    tx.execute("DELETE FROM leave_applications WHERE student_id = ?", [&id])?;
    tx.execute("DELETE FROM students WHERE id = ?", [&id])?;
    tx.commit()?;

    info!(student_id = %id, "student deleted");
    Ok(ok("student deleted", json!({ "id": id })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_list(state, req),
        "students.get" => handle_get(state, req),
        "students.create" => handle_create(state, req),
        "students.update" => handle_update(state, req),
        "students.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
