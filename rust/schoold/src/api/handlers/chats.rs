//! One-to-one conversations between user accounts.

use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::debug;

use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::helpers::{
    ensure_exists, get_required_str, new_id, now_rfc3339, paging, principal,
};
use crate::api::types::{AppState, Request};

pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Participants are stored in sorted order so each pair has one row.
fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn conversation_for(conn: &Connection, me: &str, other: &str) -> Result<String, HandlerErr> {
    let (a, b) = ordered(me, other);
    conn.execute(
        "INSERT OR IGNORE INTO chat_conversations(id, user_a, user_b, created_at) VALUES(?, ?, ?, ?)",
        (new_id(), a, b, now_rfc3339()),
    )?;
    Ok(conn.query_row(
        "SELECT id FROM chat_conversations WHERE user_a = ? AND user_b = ?",
        (a, b),
        |r| r.get(0),
    )?)
}

/// Fails unless `user_id` is one side of conversation `id`.
fn ensure_participant(conn: &Connection, id: &str, user_id: &str) -> Result<(), HandlerErr> {
    let pair: Option<(String, String)> = conn
        .query_row(
            "SELECT user_a, user_b FROM chat_conversations WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match pair {
        None => Err(HandlerErr::not_found("conversation")),
        Some((a, b)) if a == user_id || b == user_id => Ok(()),
        Some(_) => Err(HandlerErr::forbidden()),
    }
}

fn message_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "conversationId": r.get::<_, String>(1)?,
        "senderId": r.get::<_, String>(2)?,
        "body": r.get::<_, String>(3)?,
        "sentAt": r.get::<_, String>(4)?,
        "readAt": r.get::<_, Option<String>>(5)?
    }))
}

fn handle_list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = &principal(req)?.user_id;
    let mut stmt = state.db.prepare(
        "SELECT c.id,
                u.id, u.username, u.role,
                c.created_at, c.last_message_at,
                (SELECT m.body FROM chat_messages m WHERE m.conversation_id = c.id
                 ORDER BY m.sent_at DESC, m.rowid DESC LIMIT 1),
                (SELECT m.sender_id FROM chat_messages m WHERE m.conversation_id = c.id
                 ORDER BY m.sent_at DESC, m.rowid DESC LIMIT 1),
                (SELECT COUNT(*) FROM chat_messages m
                 WHERE m.conversation_id = c.id AND m.sender_id <> ?1 AND m.read_at IS NULL)
         FROM chat_conversations c
         JOIN users u ON u.id = CASE WHEN c.user_a = ?1 THEN c.user_b ELSE c.user_a END
         WHERE c.user_a = ?1 OR c.user_b = ?1
         ORDER BY COALESCE(c.last_message_at, c.created_at) DESC, c.id",
    )?;
    let rows = stmt
        .query_map([me], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "participant": {
                    "id": r.get::<_, String>(1)?,
                    "username": r.get::<_, String>(2)?,
                    "role": r.get::<_, String>(3)?
                },
                "createdAt": r.get::<_, String>(4)?,
                "lastMessageAt": r.get::<_, Option<String>>(5)?,
                "lastMessage": r.get::<_, Option<String>>(6)?,
                "lastSenderId": r.get::<_, Option<String>>(7)?,
                "unreadCount": r.get::<_, i64>(8)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let count = rows.len() as i64;
    Ok(ok_list("conversations", rows, count))
}

fn handle_send(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = principal(req)?.user_id.clone();
    let recipient = get_required_str(&req.params, "recipientId")?;
    if recipient == me {
        return Err(HandlerErr::bad_params("cannot send a message to yourself"));
    }
    // Stored verbatim; only the emptiness check looks at trimmed text.
    let body = match req.params.get("body") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        None | Some(Value::Null) | Some(Value::String(_)) => {
            return Err(HandlerErr::bad_params("missing body"))
        }
        Some(_) => return Err(HandlerErr::bad_params("body must be a string")),
    };
    if body.chars().count() > MAX_MESSAGE_CHARS {
        return Err(HandlerErr::bad_params(format!(
            "body must be at most {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    ensure_exists(&state.db, "users", &recipient, "recipient")?;

    let tx = state.db.unchecked_transaction()?;
    let conversation_id = conversation_for(&tx, &me, &recipient)?;
    let id = new_id();
    let now = now_rfc3339();
    tx.execute(
        "INSERT INTO chat_messages(id, conversation_id, sender_id, body, sent_at) VALUES(?, ?, ?, ?, ?)",
        (&id, &conversation_id, &me, &body, &now),
    )?;
    tx.execute(
        "UPDATE chat_conversations SET last_message_at = ? WHERE id = ?",
        (&now, &conversation_id),
    )?;
    tx.commit()?;

    debug!(conversation_id = %conversation_id, sender = %me, "message sent");
    Ok(ok(
        "message sent",
        json!({
            "id": id,
            "conversationId": conversation_id,
            "senderId": me,
            "recipientId": recipient,
            "body": body,
            "sentAt": now,
            "readAt": null
        }),
    ))
}

fn handle_messages(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = &principal(req)?.user_id;
    let id = get_required_str(&req.params, "id")?;
    ensure_participant(&state.db, &id, me)?;
    let (limit, offset) = paging(&req.params)?;

    let count: i64 = state.db.query_row(
        "SELECT COUNT(*) FROM chat_messages WHERE conversation_id = ?",
        [&id],
        |r| r.get(0),
    )?;
    let mut stmt = state.db.prepare(
        "SELECT id, conversation_id, sender_id, body, sent_at, read_at
         FROM chat_messages
         WHERE conversation_id = ?
         ORDER BY sent_at, rowid
         LIMIT ? OFFSET ?",
    )?;
    let rows = stmt
        .query_map((&id, limit, offset), message_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ok_list("messages", rows, count))
}

fn handle_mark_read(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let me = &principal(req)?.user_id;
    let id = get_required_str(&req.params, "id")?;
    ensure_participant(&state.db, &id, me)?;
    let marked = state.db.execute(
        "UPDATE chat_messages SET read_at = ?
         WHERE conversation_id = ? AND sender_id <> ? AND read_at IS NULL",
        (now_rfc3339(), &id, me),
    )?;
    Ok(ok(
        "messages marked read",
        json!({ "conversationId": id, "marked": marked }),
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "chats.list" => handle_list(state, req),
        "chats.send" => handle_send(state, req),
        "chats.messages" => handle_messages(state, req),
        "chats.markRead" => handle_mark_read(state, req),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}

#[cfg(test)]
mod tests {
    use super::ordered;

    #[test]
    fn pair_order_is_stable() {
        assert_eq!(ordered("b", "a"), ("a", "b"));
        assert_eq!(ordered("a", "b"), ("a", "b"));
    }
}
