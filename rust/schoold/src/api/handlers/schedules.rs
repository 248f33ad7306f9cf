//! Weekly timetable slots.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::api::crud::{self, Field, Filter, Kind, Table};
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::helpers::{
    ensure_exists, get_opt_str, get_required_str, new_id, paging, parse_weekday, principal,
    require_role,
};
use crate::api::types::{AppState, Request, Role};

pub const SCHEDULES: Table = Table {
    name: "schedules",
    label: "schedule",
    fields: &[
        Field::required("classId", "class_id", Kind::Text),
        Field::new("sectionId", "section_id", Kind::Text),
        Field::new("teacherId", "teacher_id", Kind::Text),
        Field::required("subject", "subject", Kind::Text),
        Field::required("dayOfWeek", "day_of_week", Kind::Weekday),
        Field::required("startTime", "start_time", Kind::Time),
        Field::required("endTime", "end_time", Kind::Time),
        Field::new("room", "room", Kind::Text),
    ],
};

/// The slot as it will be stored, used for validation before writing.
struct Slot {
    class_id: String,
    section_id: Option<String>,
    teacher_id: Option<String>,
    day: i64,
    start: String,
    end: String,
}

/// Slots joined with class, section and teacher names, ordered by day and time.
pub(crate) fn list_slots(
    conn: &Connection,
    filter: &Filter,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Value>, i64), HandlerErr> {
    crud::list(
        conn,
        &SCHEDULES,
        "LEFT JOIN classes c ON c.id = t.class_id
         LEFT JOIN sections sec ON sec.id = t.section_id
         LEFT JOIN teachers tc ON tc.id = t.teacher_id",
        &["c.name", "sec.name", "tc.first_name || ' ' || tc.last_name"],
        filter,
        "t.day_of_week, t.start_time, t.end_time",
        limit,
        offset,
        |r, base, obj| {
            obj.insert("className".into(), json!(r.get::<_, Option<String>>(base)?));
            obj.insert("sectionName".into(), json!(r.get::<_, Option<String>>(base + 1)?));
            obj.insert("teacherName".into(), json!(r.get::<_, Option<String>>(base + 2)?));
            Ok(())
        },
    )
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Overlay patched columns on the stored row.
fn merged(current: &Map<String, Value>, values: &crud::Assignments) -> Result<Slot, HandlerErr> {
    let pick = |column: &str, key: &str| match crud::assigned(values, column) {
        Some(SqlValue::Text(s)) => Some(s.clone()),
        Some(_) => None,
        None => text(current, key),
    };
    let day = match crud::assigned(values, "day_of_week") {
        Some(SqlValue::Integer(n)) => *n,
        _ => current
            .get("dayOfWeek")
            .and_then(Value::as_i64)
            .ok_or_else(|| HandlerErr::bad_params("missing dayOfWeek"))?,
    };
    Ok(Slot {
        class_id: pick("class_id", "classId").ok_or_else(|| HandlerErr::bad_params("missing classId"))?,
        section_id: pick("section_id", "sectionId"),
        teacher_id: pick("teacher_id", "teacherId"),
        day,
        start: pick("start_time", "startTime").ok_or_else(|| HandlerErr::bad_params("missing startTime"))?,
        end: pick("end_time", "endTime").ok_or_else(|| HandlerErr::bad_params("missing endTime"))?,
    })
}

fn validate(conn: &Connection, slot: &Slot, exclude_id: Option<&str>) -> Result<(), HandlerErr> {
    // Zero-padded HH:MM compares correctly as text.
    if slot.start >= slot.end {
        return Err(HandlerErr::bad_params("startTime must be before endTime"));
    }
    ensure_exists(conn, "classes", &slot.class_id, "class")?;
    if let Some(sid) = &slot.section_id {
        let owner: Option<String> = conn
            .query_row("SELECT class_id FROM sections WHERE id = ?", [sid], |r| r.get(0))
            .optional()?;
        match owner {
            None => return Err(HandlerErr::not_found("section")),
            Some(cid) if cid != slot.class_id => {
                return Err(HandlerErr::bad_params("section does not belong to class"))
            }
            Some(_) => {}
        }
    }
    if let Some(tid) = &slot.teacher_id {
        ensure_exists(conn, "teachers", tid, "teacher")?;
    }

    if let Some(other) = find_conflict(conn, slot, exclude_id)? {
        return Err(HandlerErr::conflict("slot overlaps an existing schedule")
            .with_details(json!({ "conflictingScheduleId": other })));
    }
    Ok(())
}

/// Another slot on the same day whose interval overlaps, for the same teacher
/// or the same class and section. A class-wide slot clashes with every section.
fn find_conflict(
    conn: &Connection,
    slot: &Slot,
    exclude_id: Option<&str>,
) -> Result<Option<String>, HandlerErr> {
    let mut sql = String::from(
        "SELECT id FROM schedules
         WHERE day_of_week = ? AND start_time < ? AND ? < end_time AND id <> ?
           AND ((class_id = ? AND (section_id IS NULL OR ? IS NULL OR section_id = ?))",
    );
    let mut args: Vec<SqlValue> = vec![
        SqlValue::Integer(slot.day),
        SqlValue::Text(slot.end.clone()),
        SqlValue::Text(slot.start.clone()),
        SqlValue::Text(exclude_id.unwrap_or_default().to_string()),
        SqlValue::Text(slot.class_id.clone()),
    ];
    let section = slot
        .section_id
        .clone()
        .map(SqlValue::Text)
        .unwrap_or(SqlValue::Null);
    args.push(section.clone());
    args.push(section);
    if let Some(tid) = &slot.teacher_id {
        sql.push_str(" OR teacher_id = ?");
        args.push(SqlValue::Text(tid.clone()));
    }
    sql.push_str(") ORDER BY start_time LIMIT 1");
    Ok(conn
        .query_row(&sql, params_from_iter(args), |r| r.get(0))
        .optional()?)
}

fn handle_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    principal(req)?;
    let (limit, offset) = paging(&req.params)?;
    let mut filter = Filter::new();
    filter.eq_text("class_id", get_opt_str(&req.params, "classId")?);
    filter.eq_text("section_id", get_opt_str(&req.params, "sectionId")?);
    filter.eq_text("teacher_id", get_opt_str(&req.params, "teacherId")?);
    if let Some(day) = get_opt_str(&req.params, "day")? {
        filter.push("t.day_of_week = ?", [SqlValue::Integer(parse_weekday("day", &day)?)]);
    }
    let (rows, count) = list_slots(&state.db, &filter, limit, offset)?;
    Ok(ok_list("schedules", rows, count))
}

fn handle_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let values = crud::collect_create(&SCHEDULES, &req.params)?;
    let slot = merged(&Map::new(), &values)?;
    validate(&state.db, &slot, None)?;

    let id = new_id();
    crud::insert(&state.db, &SCHEDULES, &id, &values)?;
    info!(schedule_id = %id, class_id = %slot.class_id, day = slot.day, "schedule created");
    let obj = crud::fetch_required(&state.db, &SCHEDULES, &id)?;
    Ok(ok("schedule created", Value::Object(obj)))
}

fn handle_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    let current = crud::fetch_required(&state.db, &SCHEDULES, &id)?;
    let values = crud::collect_patch(&SCHEDULES, &req.params)?;
    let slot = merged(&current, &values)?;
    validate(&state.db, &slot, Some(&id))?;

    crud::update(&state.db, &SCHEDULES, &id, &values)?;
    let obj = crud::fetch_required(&state.db, &SCHEDULES, &id)?;
    Ok(ok("schedule updated", Value::Object(obj)))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    if !crud::delete(&state.db, &SCHEDULES, &id)? {
        return Err(HandlerErr::not_found("schedule"));
    }
    Ok(ok("schedule deleted", json!({ "id": id })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "schedules.list" => handle_list(state, req),
        "schedules.create" => handle_create(state, req),
        "schedules.update" => handle_update(state, req),
        "schedules.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
