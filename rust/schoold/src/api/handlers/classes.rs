use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{json, Value};
use tracing::info;

use crate::api::crud::{self, Field, Filter, Kind, Table};
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::helpers::{
    ensure_exists, get_opt_i64, get_required_str, new_id, paging, principal, require_role, MAX_LIMIT,
};
use crate::api::types::{AppState, Request, Role};

pub const CLASSES: Table = Table {
    name: "classes",
    label: "class",
    fields: &[
        Field::required("name", "name", Kind::Text),
        Field::new("gradeLevel", "grade_level", Kind::Int),
        Field::new("description", "description", Kind::Text),
        Field::new("classTeacherId", "class_teacher_id", Kind::Text),
    ],
};

pub const SECTIONS: Table = Table {
    name: "sections",
    label: "section",
    fields: &[
        Field::required("classId", "class_id", Kind::Text),
        Field::required("name", "name", Kind::Text),
        Field::new("capacity", "capacity", Kind::Int),
        Field::new("room", "room", Kind::Text),
    ],
};

fn check_class_teacher(conn: &Connection, values: &crud::Assignments) -> Result<(), HandlerErr> {
    if let Some(tid) = crud::assigned_text(values, "class_teacher_id") {
        ensure_exists(conn, "teachers", &tid, "teacher")?;
    }
    Ok(())
}

fn check_capacity(values: &crud::Assignments) -> Result<(), HandlerErr> {
    if let Some(SqlValue::Integer(n)) = crud::assigned(values, "capacity") {
        if *n < 0 {
            return Err(HandlerErr::bad_params("capacity must not be negative"));
        }
    }
    Ok(())
}

fn sections_of(conn: &Connection, class_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut filter = Filter::new();
    filter.eq_text("class_id", Some(class_id.to_string()));
    let (rows, _) = crud::list(
        conn,
        &SECTIONS,
        "",
        &["(SELECT COUNT(*) FROM students s WHERE s.section_id = t.id)"],
        &filter,
        "t.name",
        MAX_LIMIT,
        0,
        |r, base, obj| {
            obj.insert("studentCount".into(), json!(r.get::<_, i64>(base)?));
            Ok(())
        },
    )?;
    Ok(rows)
}

fn handle_classes_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    principal(req)?;
    let (limit, offset) = paging(&req.params)?;
    let mut filter = Filter::new();
    if let Some(grade) = get_opt_i64(&req.params, "gradeLevel")? {
        filter.push("t.grade_level = ?", [SqlValue::Integer(grade)]);
    }

    // Correlated subqueries avoid double-counting from joins.
    let (rows, count) = crud::list(
        &state.db,
        &CLASSES,
        "LEFT JOIN teachers tc ON tc.id = t.class_teacher_id",
        &[
            "(SELECT COUNT(*) FROM students s WHERE s.class_id = t.id)",
            "(SELECT COUNT(*) FROM sections sec WHERE sec.class_id = t.id)",
            "tc.first_name || ' ' || tc.last_name",
        ],
        &filter,
        "t.grade_level IS NULL, t.grade_level, t.name",
        limit,
        offset,
        |r, base, obj| {
            obj.insert("studentCount".into(), json!(r.get::<_, i64>(base)?));
            obj.insert("sectionCount".into(), json!(r.get::<_, i64>(base + 1)?));
            obj.insert(
                "classTeacherName".into(),
                json!(r.get::<_, Option<String>>(base + 2)?),
            );
            Ok(())
        },
    )?;
    Ok(ok_list("classes", rows, count))
}

fn handle_classes_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    principal(req)?;
    let id = get_required_str(&req.params, "id")?;
    let mut obj = crud::fetch_required(&state.db, &CLASSES, &id)?;
    obj.insert("sections".into(), Value::Array(sections_of(&state.db, &id)?));
    Ok(ok("class", Value::Object(obj)))
}

fn handle_classes_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let values = crud::collect_create(&CLASSES, &req.params)?;
    check_class_teacher(&state.db, &values)?;
    let id = new_id();
    crud::insert(&state.db, &CLASSES, &id, &values)?;
    info!(class_id = %id, "class created");
    let obj = crud::fetch_required(&state.db, &CLASSES, &id)?;
    Ok(ok("class created", Value::Object(obj)))
}

fn handle_classes_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, "classes", &id, "class")?;
    let values = crud::collect_patch(&CLASSES, &req.params)?;
    check_class_teacher(&state.db, &values)?;
    crud::update(&state.db, &CLASSES, &id, &values)?;
    let obj = crud::fetch_required(&state.db, &CLASSES, &id)?;
    Ok(ok("class updated", Value::Object(obj)))
}

fn handle_classes_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, "classes", &id, "class")?;

    // Explicit dependency order; students stay on roll without a class.
    let tx = state.db.unchecked_transaction()?;
    tx.execute("DELETE FROM schedules WHERE class_id = ?", [&id])?;
    let detached = tx.execute(
        "UPDATE students SET class_id = NULL, section_id = NULL WHERE class_id = ?",
        [&id],
    )?;
    tx.execute("DELETE FROM sections WHERE class_id = ?", [&id])?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&id])?;
    tx.commit()?;

    info!(class_id = %id, detached, "class deleted");
    Ok(ok(
        "class deleted",
        json!({ "id": id, "detachedStudents": detached }),
    ))
}

fn handle_sections_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    principal(req)?;
    let class_id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, "classes", &class_id, "class")?;
    let rows = sections_of(&state.db, &class_id)?;
    let count = rows.len() as i64;
    Ok(ok_list("sections", rows, count))
}

fn handle_sections_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    // Routed as /classes/{id}/sections; the class comes from the path.
    let mut params = req.params.clone();
    if let Some(class_id) = req.params.get("id").cloned() {
        params["classId"] = class_id;
    }
    let values = crud::collect_create(&SECTIONS, &params)?;
    check_capacity(&values)?;
    if let Some(cid) = crud::assigned_text(&values, "class_id") {
        ensure_exists(&state.db, "classes", &cid, "class")?;
    }
    let id = new_id();
    crud::insert(&state.db, &SECTIONS, &id, &values)?;
    let obj = crud::fetch_required(&state.db, &SECTIONS, &id)?;
    Ok(ok("section created", Value::Object(obj)))
}

fn handle_sections_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, "sections", &id, "section")?;
    let values = crud::collect_patch(&SECTIONS, &req.params)?;
    if crud::assigned(&values, "class_id").is_some() {
        return Err(HandlerErr::bad_params("a section cannot move to another class"));
    }
    check_capacity(&values)?;
    crud::update(&state.db, &SECTIONS, &id, &values)?;
    let obj = crud::fetch_required(&state.db, &SECTIONS, &id)?;
    Ok(ok("section updated", Value::Object(obj)))
}

fn handle_sections_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, "sections", &id, "section")?;

    let tx = state.db.unchecked_transaction()?;
    tx.execute("DELETE FROM schedules WHERE section_id = ?", [&id])?;
    let detached = tx.execute(
        "UPDATE students SET section_id = NULL WHERE section_id = ?",
        [&id],
    )?;
    tx.execute("DELETE FROM sections WHERE id = ?", [&id])?;
    tx.commit()?;
    Ok(ok(
        "section deleted",
        json!({ "id": id, "detachedStudents": detached }),
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "classes.list" => handle_classes_list(state, req),
        "classes.get" => handle_classes_get(state, req),
        "classes.create" => handle_classes_create(state, req),
        "classes.update" => handle_classes_update(state, req),
        "classes.delete" => handle_classes_delete(state, req),
        "sections.list" => handle_sections_list(state, req),
        "sections.create" => handle_sections_create(state, req),
        "sections.update" => handle_sections_update(state, req),
        "sections.delete" => handle_sections_delete(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
