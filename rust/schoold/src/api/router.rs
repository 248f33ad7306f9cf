use rusqlite::OptionalExtension;
use tracing::{debug, warn};

use super::error::{err, HandlerErr};
use super::handlers;
use super::types::{AppState, Principal, Request, Role};

/// Methods callable without a bearer token.
pub fn is_public(method: &str) -> bool {
    matches!(method, "health" | "auth.login" | "auth.register")
}

fn authenticate(state: &AppState, token: &str) -> Result<Principal, HandlerErr> {
    let claims = state
        .keys
        .verify(token)
        .map_err(|e| HandlerErr::unauthorized(format!("invalid or expired token: {}", e)))?;

    // Re-read the account so deactivation takes effect before the token expires.
    let row = state
        .db
        .query_row(
            "SELECT username, email, phone, role, active FROM users WHERE id = ?",
            [&claims.sub],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((username, email, phone, role, active)) = row else {
        return Err(HandlerErr::unauthorized("account no longer exists"));
    };
    if active == 0 {
        return Err(HandlerErr::unauthorized("account is deactivated"));
    }
    let role = Role::parse(&role)
        .ok_or_else(|| HandlerErr::unauthorized(format!("unknown role: {}", role)))?;
    Ok(Principal {
        user_id: claims.sub,
        username,
        email,
        phone,
        role,
    })
}

pub fn handle_request(state: &mut AppState, mut req: Request) -> serde_json::Value {
    debug!(request_id = %req.id, method = %req.method, "dispatch");

    let public = is_public(&req.method);
    match req.bearer.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => match authenticate(state, token) {
            Ok(p) => req.principal = Some(p),
            // Public routes ignore stale tokens.
            Err(_) if public => {}
            Err(e) => {
                warn!(request_id = %req.id, method = %req.method, reason = %e.message, "rejected token");
                return e.response();
            }
        },
        None if !public => {
            return err("unauthorized", "authentication required", None);
        }
        None => {}
    }

    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::accounts::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::profile::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::classes::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::students::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::personnel::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::family::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::schedules::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::leaves::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::notices::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::chats::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::calls::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::todos::try_handle(state, &req) {
        return resp;
    }

    err(
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
