//! Linking a logged-in user to the parent, guardian or student record that
//! describes them.
//!
//! Family records are often entered by the office before the person has an
//! account, so the `user_id` column is frequently empty. The match falls back
//! through progressively weaker keys; the first step that finds a row wins.

use rusqlite::{Connection, OptionalExtension};

use crate::api::types::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Parent,
    Guardian,
    Student,
}

impl RecordKind {
    fn table(self) -> &'static str {
        match self {
            Self::Parent => "parents",
            Self::Guardian => "guardians",
            Self::Student => "students",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    UserId,
    DerivedEmail,
    Email,
    Phone,
}

impl MatchedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserId => "userId",
            Self::DerivedEmail => "derivedEmail",
            Self::Email => "email",
            Self::Phone => "phone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityMatch {
    pub record_id: String,
    pub matched_by: MatchedBy,
}

/// `username` when it already looks like an address, else `username@domain`.
pub fn derived_email(username: &str, email_domain: &str) -> Option<String> {
    let u = username.trim().to_ascii_lowercase();
    if u.is_empty() {
        return None;
    }
    if u.contains('@') {
        return Some(u);
    }
    let domain = email_domain.trim().trim_start_matches('@');
    if domain.is_empty() {
        return None;
    }
    Some(format!("{}@{}", u, domain.to_ascii_lowercase()))
}

pub fn phone_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn by_user_id(conn: &Connection, table: &str, user_id: &str) -> rusqlite::Result<Option<String>> {
    let sql = format!(
        "SELECT id FROM {} WHERE user_id = ? ORDER BY created_at, id LIMIT 1",
        table
    );
    conn.query_row(&sql, [user_id], |r| r.get(0)).optional()
}

fn by_email(conn: &Connection, table: &str, email: &str) -> rusqlite::Result<Option<String>> {
    let sql = format!(
        "SELECT id FROM {} WHERE lower(trim(email)) = ? ORDER BY created_at, id LIMIT 1",
        table
    );
    conn.query_row(&sql, [email.trim().to_ascii_lowercase()], |r| r.get(0))
        .optional()
}

fn by_phone(conn: &Connection, table: &str, phone: &str) -> rusqlite::Result<Option<String>> {
    let wanted = phone_digits(phone);
    if wanted.is_empty() {
        return Ok(None);
    }
    // Stored phones carry arbitrary punctuation; compare on digits.
    let sql = format!(
        "SELECT id, phone FROM {} WHERE phone IS NOT NULL ORDER BY created_at, id",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let phone: String = row.get(1)?;
        if phone_digits(&phone) == wanted {
            return Ok(Some(row.get(0)?));
        }
    }
    Ok(None)
}

pub fn resolve(
    conn: &Connection,
    kind: RecordKind,
    user: &Principal,
    email_domain: &str,
) -> rusqlite::Result<Option<IdentityMatch>> {
    let table = kind.table();
    let hit = |id: Option<String>, by: MatchedBy| {
        id.map(|record_id| IdentityMatch {
            record_id,
            matched_by: by,
        })
    };

    if let Some(m) = hit(by_user_id(conn, table, &user.user_id)?, MatchedBy::UserId) {
        return Ok(Some(m));
    }
    if let Some(email) = derived_email(&user.username, email_domain) {
        if let Some(m) = hit(by_email(conn, table, &email)?, MatchedBy::DerivedEmail) {
            return Ok(Some(m));
        }
    }
    if let Some(email) = user.email.as_deref().filter(|e| !e.trim().is_empty()) {
        if let Some(m) = hit(by_email(conn, table, email)?, MatchedBy::Email) {
            return Ok(Some(m));
        }
    }
    if let Some(phone) = user.phone.as_deref() {
        if let Some(m) = hit(by_phone(conn, table, phone)?, MatchedBy::Phone) {
            return Ok(Some(m));
        }
    }
    Ok(None)
}

/// Student ids linked to a parent or guardian record.
pub fn linked_student_ids(
    conn: &Connection,
    kind: RecordKind,
    record_id: &str,
) -> rusqlite::Result<Vec<String>> {
    let sql = match kind {
        RecordKind::Parent => {
            "SELECT ps.student_id FROM parent_students ps
             JOIN students s ON s.id = ps.student_id
             WHERE ps.parent_id = ?
             ORDER BY s.last_name, s.first_name"
        }
        RecordKind::Guardian => {
            "SELECT gs.student_id FROM guardian_students gs
             JOIN students s ON s.id = gs.student_id
             WHERE gs.guardian_id = ?
             ORDER BY s.last_name, s.first_name"
        }
        RecordKind::Student => return Ok(vec![record_id.to_string()]),
    };
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([record_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
