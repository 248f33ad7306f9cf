//! Parents and guardians: directory records linked to students.

use rusqlite::types::Value as SqlValue;
use serde_json::{json, Value};
use tracing::info;

use crate::api::crud::{self, Field, Filter, Kind, Table};
use crate::api::error::{ok, ok_list, HandlerErr};
use crate::api::handlers::students::student_summaries;
use crate::api::helpers::{
    ensure_exists, get_opt_str, get_required_str, like_pattern, new_id, paging, require_role,
};
use crate::api::types::{AppState, Principal, Request, Role};
use crate::identity::{self, RecordKind};

pub const PARENTS: Table = Table {
    name: "parents",
    label: "parent",
    fields: &[
        Field::new("userId", "user_id", Kind::Text),
        Field::required("firstName", "first_name", Kind::Text),
        Field::required("lastName", "last_name", Kind::Text),
        Field::new("email", "email", Kind::Text),
        Field::new("phone", "phone", Kind::Text),
        Field::new("occupation", "occupation", Kind::Text),
        Field::new("address", "address", Kind::Text),
    ],
};

pub const GUARDIANS: Table = Table {
    name: "guardians",
    label: "guardian",
    fields: &[
        Field::new("userId", "user_id", Kind::Text),
        Field::required("firstName", "first_name", Kind::Text),
        Field::required("lastName", "last_name", Kind::Text),
        Field::new("email", "email", Kind::Text),
        Field::new("phone", "phone", Kind::Text),
        Field::new("relation", "relation", Kind::Text),
        Field::new("address", "address", Kind::Text),
    ],
};

struct Family {
    table: &'static Table,
    kind: RecordKind,
    role: Role,
    link_table: &'static str,
    link_column: &'static str,
    /// Parents record the relation per child; guardians on the record itself.
    relation_on_link: bool,
}

const PARENT_FAMILY: Family = Family {
    table: &PARENTS,
    kind: RecordKind::Parent,
    role: Role::Parent,
    link_table: "parent_students",
    link_column: "parent_id",
    relation_on_link: true,
};

const GUARDIAN_FAMILY: Family = Family {
    table: &GUARDIANS,
    kind: RecordKind::Guardian,
    role: Role::Guardian,
    link_table: "guardian_students",
    link_column: "guardian_id",
    relation_on_link: false,
};

/// Students the signed-in family account may see.
pub(crate) fn student_ids_for(state: &AppState, p: &Principal) -> Result<Vec<String>, HandlerErr> {
    let kind = match p.role {
        Role::Parent => RecordKind::Parent,
        Role::Guardian => RecordKind::Guardian,
        Role::Student => RecordKind::Student,
        _ => return Ok(Vec::new()),
    };
    match identity::resolve(&state.db, kind, p, &state.email_domain)? {
        Some(m) => Ok(identity::linked_student_ids(&state.db, kind, &m.record_id)?),
        None => Ok(Vec::new()),
    }
}

fn children(state: &AppState, fam: &Family, record_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let ids = identity::linked_student_ids(&state.db, fam.kind, record_id)?;
    let mut rows = student_summaries(&state.db, &ids)?;
    if fam.relation_on_link {
        let sql = format!(
            "SELECT relation FROM {} WHERE {} = ? AND student_id = ?",
            fam.link_table, fam.link_column
        );
        for row in rows.iter_mut() {
            let sid = row["id"].as_str().unwrap_or_default().to_string();
            let relation: Option<String> =
                state
                    .db
                    .query_row(&sql, (record_id, &sid), |r| r.get(0))?;
            row["relation"] = json!(relation);
        }
    }
    Ok(rows)
}

fn handle_list(state: &AppState, req: &Request, fam: &Family) -> Result<Value, HandlerErr> {
    require_role(req, Role::PERSONNEL)?;
    let (limit, offset) = paging(&req.params)?;

    let mut filter = Filter::new();
    if let Some(search) = get_opt_str(&req.params, "search")? {
        let p = like_pattern(&search);
        filter.push(
            "(t.first_name || ' ' || t.last_name LIKE ? ESCAPE '\\'
              OR t.email LIKE ? ESCAPE '\\'
              OR t.phone LIKE ? ESCAPE '\\')",
            [
                SqlValue::Text(p.clone()),
                SqlValue::Text(p.clone()),
                SqlValue::Text(p),
            ],
        );
    }
    if let Some(student_id) = get_opt_str(&req.params, "studentId")? {
        filter.push(
            format!(
                "t.id IN (SELECT {} FROM {} WHERE student_id = ?)",
                fam.link_column, fam.link_table
            ),
            [SqlValue::Text(student_id)],
        );
    }

    let child_count = format!(
        "(SELECT COUNT(*) FROM {} l WHERE l.{} = t.id)",
        fam.link_table, fam.link_column
    );
    let (rows, count) = crud::list(
        &state.db,
        fam.table,
        "",
        &[child_count.as_str()],
        &filter,
        "t.last_name, t.first_name",
        limit,
        offset,
        |r, base, obj| {
            obj.insert("childCount".into(), json!(r.get::<_, i64>(base)?));
            Ok(())
        },
    )?;
    Ok(ok_list(format!("{} list", fam.table.label), rows, count))
}

fn handle_get(state: &AppState, req: &Request, fam: &Family) -> Result<Value, HandlerErr> {
    require_role(req, Role::PERSONNEL)?;
    let id = get_required_str(&req.params, "id")?;
    let mut obj = crud::fetch_required(&state.db, fam.table, &id)?;
    obj.insert("children".into(), Value::Array(children(state, fam, &id)?));
    Ok(ok(fam.table.label, Value::Object(obj)))
}

fn handle_create(state: &AppState, req: &Request, fam: &Family) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let values = crud::collect_create(fam.table, &req.params)?;
    if let Some(uid) = crud::assigned_text(&values, "user_id") {
        ensure_exists(&state.db, "users", &uid, "user")?;
    }
    let id = new_id();
    crud::insert(&state.db, fam.table, &id, &values)?;
    info!(record_id = %id, table = fam.table.name, "family record created");
    let obj = crud::fetch_required(&state.db, fam.table, &id)?;
    Ok(ok(format!("{} created", fam.table.label), Value::Object(obj)))
}

fn handle_update(state: &AppState, req: &Request, fam: &Family) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, fam.table.name, &id, fam.table.label)?;
    let values = crud::collect_patch(fam.table, &req.params)?;
    if let Some(uid) = crud::assigned_text(&values, "user_id") {
        ensure_exists(&state.db, "users", &uid, "user")?;
    }
    crud::update(&state.db, fam.table, &id, &values)?;
    let obj = crud::fetch_required(&state.db, fam.table, &id)?;
    Ok(ok(format!("{} updated", fam.table.label), Value::Object(obj)))
}

fn handle_delete(state: &AppState, req: &Request, fam: &Family) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    ensure_exists(&state.db, fam.table.name, &id, fam.table.label)?;

    let tx = state.db.unchecked_transaction()?;
    tx.execute(
        &format!("DELETE FROM {} WHERE {} = ?", fam.link_table, fam.link_column),
        [&id],
    )?;
    tx.execute(&format!("DELETE FROM {} WHERE id = ?", fam.table.name), [&id])?;
    tx.commit()?;
    Ok(ok(format!("{} deleted", fam.table.label), json!({ "id": id })))
}

fn handle_link(state: &AppState, req: &Request, fam: &Family) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    ensure_exists(&state.db, fam.table.name, &id, fam.table.label)?;
    ensure_exists(&state.db, "students", &student_id, "student")?;

    if fam.relation_on_link {
        let relation = get_opt_str(&req.params, "relation")?;
        state.db.execute(
            &format!(
                "INSERT INTO {}({}, student_id, relation) VALUES(?, ?, ?)
                 ON CONFLICT({}, student_id) DO UPDATE SET relation = COALESCE(excluded.relation, relation)",
                fam.link_table, fam.link_column, fam.link_column
            ),
            (&id, &student_id, &relation),
        )?;
    } else {
        state.db.execute(
            &format!(
                "INSERT OR IGNORE INTO {}({}, student_id) VALUES(?, ?)",
                fam.link_table, fam.link_column
            ),
            (&id, &student_id),
        )?;
    }
    Ok(ok(
        "student linked",
        json!({ "id": id, "children": children(state, fam, &id)? }),
    ))
}

fn handle_unlink(state: &AppState, req: &Request, fam: &Family) -> Result<Value, HandlerErr> {
    require_role(req, Role::OFFICE)?;
    let id = get_required_str(&req.params, "id")?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let n = state.db.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ? AND student_id = ?",
            fam.link_table, fam.link_column
        ),
        (&id, &student_id),
    )?;
    if n == 0 {
        return Err(HandlerErr::not_found("link"));
    }
    Ok(ok(
        "student unlinked",
        json!({ "id": id, "children": children(state, fam, &id)? }),
    ))
}

fn handle_me(state: &AppState, req: &Request, fam: &Family) -> Result<Value, HandlerErr> {
    let p = require_role(req, &[fam.role])?;
    let Some(m) = identity::resolve(&state.db, fam.kind, p, &state.email_domain)? else {
        return Err(HandlerErr::not_found(fam.table.label)
            .with_details(json!({ "hint": "no record matches this account's username, email or phone" })));
    };
    let mut obj = crud::fetch_required(&state.db, fam.table, &m.record_id)?;
    obj.insert("matchedBy".into(), json!(m.matched_by.as_str()));
    obj.insert(
        "children".into(),
        Value::Array(children(state, fam, &m.record_id)?),
    );
    Ok(ok(fam.table.label, Value::Object(obj)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let (fam, op) = match req.method.split_once('.') {
        Some(("parents", op)) => (&PARENT_FAMILY, op),
        Some(("guardians", op)) => (&GUARDIAN_FAMILY, op),
        _ => return None,
    };
    let result = match op {
        "list" => handle_list(state, req, fam),
        "get" => handle_get(state, req, fam),
        "create" => handle_create(state, req, fam),
        "update" => handle_update(state, req, fam),
        "delete" => handle_delete(state, req, fam),
        "linkStudent" => handle_link(state, req, fam),
        "unlinkStudent" => handle_unlink(state, req, fam),
        "me" => handle_me(state, req, fam),
        _ => return None,
    };
    Some(result.unwrap_or_else(HandlerErr::response))
}
