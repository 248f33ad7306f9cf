//! Leave applications filed by families and reviewed by school personnel.

use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::api::crud::{self, Field, Filter, Kind, Table};
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::handlers::family;
use crate::api::helpers::{
    get_opt_str, get_required_str, new_id, now_rfc3339, paging, parse_date, principal,
    require_role,
};
use crate::api::types::{AppState, Principal, Request, Role};

pub const LEAVE_TYPES: &[&str] = &["sick", "casual", "family", "other"];
pub const LEAVE_STATUSES: &[&str] = &["pending", "approved", "rejected", "cancelled"];

pub const LEAVES: Table = Table {
    name: "leave_applications",
    label: "leave application",
    fields: &[
        Field::required("studentId", "student_id", Kind::Text),
        Field::required("applicantUserId", "applicant_user_id", Kind::Text),
        Field::required("applicantRole", "applicant_role", Kind::Text),
        Field::required("leaveType", "leave_type", Kind::OneOf(LEAVE_TYPES)),
        Field::required("fromDate", "from_date", Kind::Date),
        Field::required("toDate", "to_date", Kind::Date),
        Field::required("reason", "reason", Kind::Text),
        Field::new("status", "status", Kind::OneOf(LEAVE_STATUSES)),
        Field::new("reviewerUserId", "reviewer_user_id", Kind::Text),
        Field::new("reviewRemarks", "review_remarks", Kind::Text),
        Field::new("reviewedAt", "reviewed_at", Kind::Text),
    ],
};

const JOINS: &str = "LEFT JOIN students s ON s.id = t.student_id";

/// Inclusive calendar days between two stored dates.
fn leave_days(from: &str, to: &str) -> Option<i64> {
    let from = NaiveDate::parse_from_str(from, "%Y-%m-%d").ok()?;
    let to = NaiveDate::parse_from_str(to, "%Y-%m-%d").ok()?;
    Some((to - from).num_days() + 1)
}

fn query(
    conn: &Connection,
    filter: &Filter,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Value>, i64), HandlerErr> {
    crud::list(
        conn,
        &LEAVES,
        JOINS,
        &["s.first_name || ' ' || s.last_name", "s.class_id"],
        filter,
        "t.created_at DESC, t.id",
        limit,
        offset,
        |r, base, obj| {
            obj.insert("studentName".into(), json!(r.get::<_, Option<String>>(base)?));
            obj.insert("classId".into(), json!(r.get::<_, Option<String>>(base + 1)?));
            let days = match (obj.get("fromDate"), obj.get("toDate")) {
                (Some(Value::String(f)), Some(Value::String(t))) => leave_days(f, t),
                _ => None,
            };
            obj.insert("days".into(), json!(days));
            Ok(())
        },
    )
}

fn load(conn: &Connection, id: &str) -> Result<Map<String, Value>, HandlerErr> {
    let mut filter = Filter::new();
    filter.eq_text("id", Some(id.to_string()));
    let (rows, _) = query(conn, &filter, 1, 0)?;
    match rows.into_iter().next() {
        Some(Value::Object(obj)) => Ok(obj),
        _ => Err(HandlerErr::not_found(LEAVES.label)),
    }
}

/// Restrict `filter` to what `p` may see. Returns false when nothing is visible.
fn scope(state: &AppState, p: &Principal, filter: &mut Filter) -> Result<bool, HandlerErr> {
    if p.role.is_personnel() {
        return Ok(true);
    }
    let ids = family::student_ids_for(state, p)?;
    if ids.is_empty() {
        return Ok(false);
    }
    let marks = vec!["?"; ids.len()].join(", ");
    filter.push(
        format!("t.student_id IN ({})", marks),
        ids.into_iter().map(SqlValue::Text),
    );
    Ok(true)
}

fn handle_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let (limit, offset) = paging(&req.params)?;

    let mut filter = Filter::new();
    if let Some(status) = get_opt_str(&req.params, "status")? {
        if !LEAVE_STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr::bad_params("unknown status"));
        }
        filter.eq_text("status", Some(status));
    }
    filter.eq_text("student_id", get_opt_str(&req.params, "studentId")?);
    if let Some(class_id) = get_opt_str(&req.params, "classId")? {
        filter.push("s.class_id = ?", [SqlValue::Text(class_id)]);
    }
    if !scope(state, p, &mut filter)? {
        return Ok(ok_list("leave applications", Vec::new(), 0));
    }

    let (rows, count) = query(&state.db, &filter, limit, offset)?;
    Ok(ok_list("leave applications", rows, count))
}

fn handle_get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let id = get_required_str(&req.params, "id")?;
    let obj = load(&state.db, &id)?;
    if !p.role.is_personnel() {
        let ids = family::student_ids_for(state, p)?;
        let student = obj.get("studentId").and_then(Value::as_str).unwrap_or_default();
        if !ids.iter().any(|s| s == student) {
            return Err(HandlerErr::forbidden());
        }
    }
    Ok(ok(LEAVES.label, Value::Object(obj)))
}

/// The student a family account is applying for.
fn target_student(
    state: &AppState,
    p: &Principal,
    requested: Option<String>,
) -> Result<String, HandlerErr> {
    let ids = family::student_ids_for(state, p)?;
    if ids.is_empty() {
        return Err(HandlerErr::not_found("linked student").with_details(
            json!({ "hint": "no student record matches this account's username, email or phone" }),
        ));
    }
    match requested {
        Some(sid) if ids.contains(&sid) => Ok(sid),
        Some(_) => Err(HandlerErr::forbidden()),
        None if ids.len() == 1 => Ok(ids[0].clone()),
        None => Err(HandlerErr::bad_params(
            "studentId is required when more than one child is linked",
        )),
    }
}

fn handle_create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = require_role(req, Role::FAMILY)?;
    let student_id = target_student(state, p, get_opt_str(&req.params, "studentId")?)?;

    let from = parse_date("fromDate", &get_required_str(&req.params, "fromDate")?)?;
    let to = parse_date("toDate", &get_required_str(&req.params, "toDate")?)?;
    if from > to {
        return Err(HandlerErr::bad_params("fromDate must not be after toDate"));
    }

    let leave_type = get_opt_str(&req.params, "leaveType")?.unwrap_or_else(|| "casual".into());

    // Applicant and status are server-assigned; the client only picks the rest.
    let mut params = json!({
        "leaveType": leave_type,
        "fromDate": from.format("%Y-%m-%d").to_string(),
        "toDate": to.format("%Y-%m-%d").to_string(),
        "reason": req.params.get("reason").cloned().unwrap_or(Value::Null),
    });
    params["studentId"] = json!(student_id);
    params["applicantUserId"] = json!(p.user_id);
    params["applicantRole"] = json!(p.role.as_str());
    params["status"] = json!("pending");
    let values = crud::collect_create(&LEAVES, &params)?;

    let id = new_id();
    crud::insert(&state.db, &LEAVES, &id, &values)?;
    info!(leave_id = %id, student_id = %student_id, applicant = %p.user_id, "leave application filed");
    Ok(ok("leave application submitted", Value::Object(load(&state.db, &id)?)))
}

fn current_status(conn: &Connection, id: &str) -> Result<(String, String), HandlerErr> {
    conn.query_row(
        "SELECT status, applicant_user_id FROM leave_applications WHERE id = ?",
        [id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found(LEAVES.label))
}

fn handle_review(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = require_role(req, Role::PERSONNEL)?;
    let id = get_required_str(&req.params, "id")?;
    let status = get_required_str(&req.params, "status")?.to_ascii_lowercase();
    if status != "approved" && status != "rejected" {
        return Err(HandlerErr::bad_params("status must be approved or rejected"));
    }
    let remarks = get_opt_str(&req.params, "remarks")?;

    let (from, _) = current_status(&state.db, &id)?;
    let now = now_rfc3339();
    let n = state.db.execute(
        "UPDATE leave_applications
         SET status = ?, reviewer_user_id = ?, review_remarks = ?, reviewed_at = ?, updated_at = ?
         WHERE id = ? AND status = 'pending'",
        params_from_iter([
            SqlValue::Text(status.clone()),
            SqlValue::Text(p.user_id.clone()),
            remarks.map(SqlValue::Text).unwrap_or(SqlValue::Null),
            SqlValue::Text(now.clone()),
            SqlValue::Text(now),
            SqlValue::Text(id.clone()),
        ]),
    )?;
    if n == 0 {
        return Err(HandlerErr::conflict(format!(
            "leave application is already {}",
            from
        )));
    }
    info!(leave_id = %id, status = %status, reviewer = %p.user_id, "leave application reviewed");
    Ok(ok(
        format!("leave application {}", status),
        Value::Object(load(&state.db, &id)?),
    ))
}

fn handle_cancel(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let id = get_required_str(&req.params, "id")?;
    let (from, applicant) = current_status(&state.db, &id)?;
    if applicant != p.user_id {
        return Err(HandlerErr::forbidden());
    }
    let n = state.db.execute(
        "UPDATE leave_applications SET status = 'cancelled', updated_at = ?
         WHERE id = ? AND status = 'pending'",
        (now_rfc3339(), &id),
    )?;
    if n == 0 {
        return Err(HandlerErr::conflict(format!(
            "leave application is already {}",
            from
        )));
    }
    Ok(ok(
        "leave application cancelled",
        Value::Object(load(&state.db, &id)?),
    ))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "id")?;
    if !crud::delete(&state.db, &LEAVES, &id)? {
        return Err(HandlerErr::not_found(LEAVES.label));
    }
    Ok(ok("leave application deleted", json!({ "id": id })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "leaves.list" => handle_list(state, req),
        "leaves.get" => handle_get(state, req),
        "leaves.create" => handle_create(state, req),
        "leaves.review" => handle_review(state, req),
        "leaves.cancel" => handle_cancel(state, req),
        "leaves.delete" => handle_delete(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
