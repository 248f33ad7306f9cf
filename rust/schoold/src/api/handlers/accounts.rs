use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tracing::info;

use crate::api::crud::Filter;
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::helpers::{
    get_opt_bool, get_opt_str, get_required_str, like_pattern, new_id, now_rfc3339, paging,
    principal, require_role,
};
use crate::api::types::{AppState, Request, Role};
use crate::auth::{hash_password, verify_password, MIN_PASSWORD_LEN};

const USER_COLUMNS: &str = "id, username, email, phone, role, active, created_at, updated_at";

fn user_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "username": r.get::<_, String>(1)?,
        "email": r.get::<_, Option<String>>(2)?,
        "phone": r.get::<_, Option<String>>(3)?,
        "role": r.get::<_, String>(4)?,
        "active": r.get::<_, i64>(5)? != 0,
        "createdAt": r.get::<_, String>(6)?,
        "updatedAt": r.get::<_, String>(7)?
    }))
}

pub(crate) fn load_user(conn: &Connection, user_id: &str) -> Result<Option<Value>, HandlerErr> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
    Ok(conn.query_row(&sql, [user_id], user_json).optional()?)
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(&raw.to_ascii_lowercase())
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", raw)))
}

fn check_password(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn handle_register(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let existing: i64 = state
        .db
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    let bootstrap = existing == 0;
    if !bootstrap {
        match req.principal.as_ref() {
            Some(p) if p.role == Role::Admin => {}
            Some(_) => return Err(HandlerErr::forbidden()),
            None => {
                return Err(HandlerErr::new(
                    "forbidden",
                    "registration is closed; ask an administrator for an account",
                ))
            }
        }
    }

    let username = get_required_str(&req.params, "username")?;
    if username.chars().any(char::is_whitespace) {
        return Err(HandlerErr::bad_params("username must not contain spaces"));
    }
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(p) => p.to_string(),
        None => return Err(HandlerErr::bad_params("missing password")),
    };
    check_password(&password)?;

    // The first account always administers the school.
    let role = if bootstrap {
        Role::Admin
    } else {
        match get_opt_str(&req.params, "role")? {
            Some(r) => parse_role(&r)?,
            None => return Err(HandlerErr::bad_params("missing role")),
        }
    };
    let email = get_opt_str(&req.params, "email")?.map(|e| e.to_ascii_lowercase());
    let phone = get_opt_str(&req.params, "phone")?;

    let taken: Option<i64> = state
        .db
        .query_row(
            "SELECT 1 FROM users WHERE lower(username) = lower(?)",
            [&username],
            |r| r.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(HandlerErr::conflict("username is already taken"));
    }

    let id = new_id();
    let now = now_rfc3339();
    state.db.execute(
        "INSERT INTO users(id, username, email, phone, password_hash, role, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &id,
            &username,
            &email,
            &phone,
            hash_password(&password, state.password_rounds),
            role.as_str(),
            &now,
            &now,
        ),
    )?;
    info!(user_id = %id, role = role.as_str(), bootstrap, "user registered");

    let user = load_user(&state.db, &id)?.ok_or_else(|| HandlerErr::not_found("user"))?;
    Ok(ok("user registered", user))
}

fn handle_login(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let login = match get_opt_str(&req.params, "username")? {
        Some(u) => u,
        None => get_required_str(&req.params, "email")?,
    };
    let Some(password) = req.params.get("password").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing password"));
    };

    let row = state
        .db
        .query_row(
            "SELECT id, username, password_hash, role, active FROM users
             WHERE lower(username) = lower(?1) OR lower(email) = lower(?1)
             ORDER BY CASE WHEN lower(username) = lower(?1) THEN 0 ELSE 1 END
             LIMIT 1",
            [&login],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;

    let invalid = || HandlerErr::unauthorized("invalid username or password");
    let Some((id, username, hash, role, active)) = row else {
        return Err(invalid());
    };
    if !verify_password(password, &hash).unwrap_or(false) {
        return Err(invalid());
    }
    if active == 0 {
        return Err(HandlerErr::unauthorized("account is deactivated"));
    }

    let token = state
        .keys
        .issue(&id, &username, &role, Utc::now().timestamp())
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    let user = load_user(&state.db, &id)?.ok_or_else(|| HandlerErr::not_found("user"))?;
    info!(user_id = %id, "login");
    Ok(ok(
        "login successful",
        json!({
            "token": token,
            "tokenType": "Bearer",
            "expiresIn": state.keys.ttl_secs(),
            "user": user
        }),
    ))
}

fn handle_me(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let user = load_user(&state.db, &p.user_id)?.ok_or_else(|| HandlerErr::not_found("user"))?;
    Ok(ok("current user", user))
}

fn handle_change_password(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let p = principal(req)?;
    let (Some(current), Some(next)) = (
        req.params.get("currentPassword").and_then(|v| v.as_str()),
        req.params.get("newPassword").and_then(|v| v.as_str()),
    ) else {
        return Err(HandlerErr::bad_params("missing currentPassword or newPassword"));
    };
    check_password(next)?;

    let hash: String = state.db.query_row(
        "SELECT password_hash FROM users WHERE id = ?",
        [&p.user_id],
        |r| r.get(0),
    )?;
    if !verify_password(current, &hash).unwrap_or(false) {
        return Err(HandlerErr::unauthorized("current password is incorrect"));
    }
    state.db.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
        (hash_password(next, state.password_rounds), now_rfc3339(), &p.user_id),
    )?;
    Ok(ok("password changed", json!({ "ok": true })))
}

fn handle_users_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    require_role(req, &[Role::Admin])?;
    let (limit, offset) = paging(&req.params)?;

    let mut filter = Filter::new();
    if let Some(role) = get_opt_str(&req.params, "role")? {
        let role = parse_role(&role)?;
        filter.push("role = ?", [SqlValue::Text(role.as_str().to_string())]);
    }
    if let Some(search) = get_opt_str(&req.params, "search")? {
        let pattern = like_pattern(&search);
        filter.push(
            "(username LIKE ? ESCAPE '\\' OR email LIKE ? ESCAPE '\\')",
            [SqlValue::Text(pattern.clone()), SqlValue::Text(pattern)],
        );
    }
    let where_sql = filter.where_sql();

    let count: i64 = state.db.query_row(
        &format!("SELECT COUNT(*) FROM users {}", where_sql),
        params_from_iter(filter.args()),
        |r| r.get(0),
    )?;
    let mut args: Vec<SqlValue> = filter.args().to_vec();
    args.push(SqlValue::Integer(limit));
    args.push(SqlValue::Integer(offset));
    let mut stmt = state.db.prepare(&format!(
        "SELECT {} FROM users {} ORDER BY username LIMIT ? OFFSET ?",
        USER_COLUMNS, where_sql
    ))?;
    let rows = stmt
        .query_map(params_from_iter(args), user_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ok_list("users", rows, count))
}

fn handle_users_update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = require_role(req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "id")?;
    if load_user(&state.db, &id)?.is_none() {
        return Err(HandlerErr::not_found("user"));
    }

    let mut sets: Vec<&str> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(role) = get_opt_str(&req.params, "role")? {
        let role = parse_role(&role)?;
        if id == me.user_id && role != Role::Admin {
            return Err(HandlerErr::conflict("administrators cannot demote themselves"));
        }
        sets.push("role = ?");
        args.push(SqlValue::Text(role.as_str().to_string()));
    }
    if req.params.get("email").is_some() {
        sets.push("email = ?");
        args.push(match get_opt_str(&req.params, "email")? {
            Some(e) => SqlValue::Text(e.to_ascii_lowercase()),
            None => SqlValue::Null,
        });
    }
    if req.params.get("phone").is_some() {
        sets.push("phone = ?");
        args.push(match get_opt_str(&req.params, "phone")? {
            Some(p) => SqlValue::Text(p),
            None => SqlValue::Null,
        });
    }
    if let Some(active) = get_opt_bool(&req.params, "active")? {
        if id == me.user_id && !active {
            return Err(HandlerErr::conflict("administrators cannot deactivate themselves"));
        }
        sets.push("active = ?");
        args.push(SqlValue::Integer(i64::from(active)));
    }
    if sets.is_empty() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }
    sets.push("updated_at = ?");
    args.push(SqlValue::Text(now_rfc3339()));
    args.push(SqlValue::Text(id.clone()));
    state.db.execute(
        &format!("UPDATE users SET {} WHERE id = ?", sets.join(", ")),
        params_from_iter(args),
    )?;

    let user = load_user(&state.db, &id)?.ok_or_else(|| HandlerErr::not_found("user"))?;
    Ok(ok("user updated", user))
}

fn handle_users_delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = require_role(req, &[Role::Admin])?;
    let id = get_required_str(&req.params, "id")?;
    if id == me.user_id {
        return Err(HandlerErr::conflict("administrators cannot delete themselves"));
    }
    if load_user(&state.db, &id)?.is_none() {
        return Err(HandlerErr::not_found("user"));
    }

    // Personal data goes with the account; directory records only lose the link.
    let tx = state.db.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM chat_messages WHERE conversation_id IN (
           SELECT id FROM chat_conversations WHERE user_a = ?1 OR user_b = ?1
         )",
        [&id],
    )?;
    tx.execute(
        "DELETE FROM chat_conversations WHERE user_a = ?1 OR user_b = ?1",
        [&id],
    )?;
    tx.execute(
        "DELETE FROM calls WHERE caller_id = ?1 OR callee_id = ?1",
        [&id],
    )?;
    tx.execute("DELETE FROM todos WHERE user_id = ?", [&id])?;
    tx.execute("DELETE FROM users WHERE id = ?", [&id])?;
    tx.commit()?;

    info!(user_id = %id, "user deleted");
    Ok(ok("user deleted", json!({ "id": id })))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "auth.register" => handle_register(state, req),
        "auth.login" => handle_login(state, req),
        "auth.me" => handle_me(state, req),
        "auth.changePassword" => handle_change_password(state, req),
        "users.list" => handle_users_list(state, req),
        "users.update" => handle_users_update(state, req),
        "users.delete" => handle_users_delete(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
