use crate::api::error::{ok, HandlerErr};
use crate::api::helpers::{now_rfc3339, require_role};
use crate::api::types::{AppState, Request, Role};
use crate::db;
use serde_json::{json, Map, Value};

const SCHOOL_PROFILE_KEY: &str = "school.profile";

fn default_school_profile() -> Value {
    json!({
        "name": "",
        "academicYear": "",
        "address": "",
        "phone": "",
        "email": "",
        "website": "",
        "timezone": "UTC"
    })
}

fn handle_health(state: &AppState) -> Result<Value, HandlerErr> {
    let db_ok = state
        .db
        .query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
        .is_ok();
    Ok(ok(
        "service is up",
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "ok" } else { "unavailable" },
            "time": now_rfc3339()
        }),
    ))
}

fn count(state: &AppState, sql: &str) -> Result<i64, HandlerErr> {
    Ok(state.db.query_row(sql, [], |r| r.get(0))?)
}

fn handle_dashboard_summary(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, Role::PERSONNEL)?;
    let today = crate::api::helpers::today();

    let visible_notices: i64 = state.db.query_row(
        "SELECT COUNT(*) FROM notices
         WHERE published = 1
           AND publish_date <= ?
           AND (expires_at IS NULL OR expires_at >= ?)",
        (&today, &today),
        |r| r.get(0),
    )?;

    Ok(ok(
        "dashboard summary",
        json!({
            "students": count(state, "SELECT COUNT(*) FROM students WHERE status = 'active'")?,
            "teachers": count(state, "SELECT COUNT(*) FROM teachers WHERE status = 'active'")?,
            "staff": count(state, "SELECT COUNT(*) FROM staff WHERE status = 'active'")?,
            "parents": count(state, "SELECT COUNT(*) FROM parents")?,
            "guardians": count(state, "SELECT COUNT(*) FROM guardians")?,
            "classes": count(state, "SELECT COUNT(*) FROM classes")?,
            "pendingLeaveApplications": count(
                state,
                "SELECT COUNT(*) FROM leave_applications WHERE status = 'pending'"
            )?,
            "activeNotices": visible_notices
        }),
    ))
}

fn load_school_profile(state: &AppState) -> Result<Value, HandlerErr> {
    let mut current = default_school_profile();
    if let Some(saved) = db::settings_get_json(&state.db, SCHOOL_PROFILE_KEY)? {
        if let (Some(dst), Some(src)) = (current.as_object_mut(), saved.as_object()) {
            for (k, v) in src {
                if dst.contains_key(k) {
                    dst.insert(k.clone(), v.clone());
                }
            }
        }
    }
    Ok(current)
}

fn merge_school_patch(current: &mut Value, patch: &Map<String, Value>) -> Result<(), HandlerErr> {
    let Some(dst) = current.as_object_mut() else {
        return Err(HandlerErr::new("internal", "school profile must be an object"));
    };
    for (k, v) in patch {
        // Path and auth plumbing keys are not profile fields.
        if k == "id" {
            continue;
        }
        if !dst.contains_key(k) {
            return Err(HandlerErr::bad_params(format!("unknown school field: {}", k)));
        }
        match v {
            Value::String(s) => {
                dst.insert(k.clone(), Value::String(s.trim().to_string()));
            }
            Value::Null => {
                dst.insert(k.clone(), Value::String(String::new()));
            }
            _ => return Err(HandlerErr::bad_params(format!("{} must be a string", k))),
        }
    }
    Ok(())
}

fn handle_school_get(state: &AppState) -> Result<Value, HandlerErr> {
    Ok(ok("school profile", load_school_profile(state)?))
}

fn handle_school_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, &[Role::Admin])?;
    let Some(patch) = req.params.as_object() else {
        return Err(HandlerErr::bad_params("body must be an object"));
    };
    let mut current = load_school_profile(state)?;
    merge_school_patch(&mut current, patch)?;
    db::settings_set_json(&state.db, SCHOOL_PROFILE_KEY, &current)?;
    Ok(ok("school profile updated", current))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "health" => handle_health(state),
        "dashboard.summary" => handle_dashboard_summary(state, req),
        "settings.school.get" => handle_school_get(state),
        "settings.school.update" => handle_school_update(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
