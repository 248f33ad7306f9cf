//! Column-described tables shared by the entity handlers.
//!
//! Each entity declares its columns once as a [`Table`]; inserts, patches and
//! row rendering are driven from that description so request keys (camelCase)
//! and SQL columns (snake_case) never drift apart.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use crate::api::error::HandlerErr;
use crate::api::helpers::{now_rfc3339, parse_date, parse_time, parse_weekday};

#[derive(Clone, Copy, Debug)]
pub enum Kind {
    Text,
    Int,
    Bool,
    Date,
    Time,
    Weekday,
    OneOf(&'static [&'static str]),
}

#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub param: &'static str,
    pub column: &'static str,
    pub kind: Kind,
    pub required: bool,
}

impl Field {
    pub const fn new(param: &'static str, column: &'static str, kind: Kind) -> Self {
        Self {
            param,
            column,
            kind,
            required: false,
        }
    }

    pub const fn required(param: &'static str, column: &'static str, kind: Kind) -> Self {
        Self {
            param,
            column,
            kind,
            required: true,
        }
    }
}

#[derive(Debug)]
pub struct Table {
    pub name: &'static str,
    pub label: &'static str,
    pub fields: &'static [Field],
}

pub type Assignments = Vec<(&'static str, SqlValue)>;

fn convert(field: &Field, v: &Value) -> Result<SqlValue, HandlerErr> {
    let bad = |what: &str| HandlerErr::bad_params(format!("{} must be {}", field.param, what));
    if v.is_null() {
        return Ok(SqlValue::Null);
    }
    match field.kind {
        Kind::Text => match v {
            Value::String(s) if s.trim().is_empty() => Ok(SqlValue::Null),
            Value::String(s) => Ok(SqlValue::Text(s.trim().to_string())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            _ => Err(bad("a string")),
        },
        Kind::Int => match v {
            Value::Number(n) => n.as_i64().map(SqlValue::Integer).ok_or_else(|| bad("an integer")),
            Value::String(s) if s.trim().is_empty() => Ok(SqlValue::Null),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .map_err(|_| bad("an integer")),
            _ => Err(bad("an integer")),
        },
        Kind::Bool => match v {
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) => Ok(SqlValue::Integer(i64::from(n.as_i64().unwrap_or(0) != 0))),
            Value::String(s) => match s.trim() {
                "true" | "1" => Ok(SqlValue::Integer(1)),
                "false" | "0" => Ok(SqlValue::Integer(0)),
                _ => Err(bad("a boolean")),
            },
            _ => Err(bad("a boolean")),
        },
        Kind::Date => match v {
            Value::String(s) if s.trim().is_empty() => Ok(SqlValue::Null),
            Value::String(s) => {
                let d = parse_date(field.param, s)?;
                Ok(SqlValue::Text(d.format("%Y-%m-%d").to_string()))
            }
            _ => Err(bad("YYYY-MM-DD")),
        },
        Kind::Time => match v {
            Value::String(s) if s.trim().is_empty() => Ok(SqlValue::Null),
            Value::String(s) => {
                let t = parse_time(field.param, s)?;
                Ok(SqlValue::Text(t.format("%H:%M").to_string()))
            }
            _ => Err(bad("HH:MM")),
        },
        Kind::Weekday => match v {
            Value::Number(n) => parse_weekday(field.param, &n.to_string()).map(SqlValue::Integer),
            Value::String(s) => parse_weekday(field.param, s).map(SqlValue::Integer),
            _ => Err(bad("a weekday")),
        },
        Kind::OneOf(allowed) => match v {
            Value::String(s) => {
                let t = s.trim().to_ascii_lowercase();
                if allowed.contains(&t.as_str()) {
                    Ok(SqlValue::Text(t))
                } else {
                    Err(HandlerErr::bad_params(format!(
                        "{} must be one of {}",
                        field.param,
                        allowed.join(", ")
                    )))
                }
            }
            _ => Err(bad("a string")),
        },
    }
}

/// Values for an INSERT; every required field must be present and non-empty.
pub fn collect_create(table: &Table, params: &Value) -> Result<Assignments, HandlerErr> {
    let mut out = Vec::with_capacity(table.fields.len());
    for f in table.fields {
        let v = match params.get(f.param) {
            Some(v) => convert(f, v)?,
            None => SqlValue::Null,
        };
        if f.required && v == SqlValue::Null {
            return Err(HandlerErr::bad_params(format!("missing {}", f.param)));
        }
        if v != SqlValue::Null {
            out.push((f.column, v));
        }
    }
    Ok(out)
}

/// Values for an UPDATE; only keys present in `params` are touched.
pub fn collect_patch(table: &Table, params: &Value) -> Result<Assignments, HandlerErr> {
    let mut out = Vec::new();
    for f in table.fields {
        let Some(raw) = params.get(f.param) else {
            continue;
        };
        let v = convert(f, raw)?;
        if f.required && v == SqlValue::Null {
            return Err(HandlerErr::bad_params(format!("{} must not be empty", f.param)));
        }
        out.push((f.column, v));
    }
    Ok(out)
}

pub fn assigned<'a>(values: &'a Assignments, column: &str) -> Option<&'a SqlValue> {
    values.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
}

pub fn assigned_text(values: &Assignments, column: &str) -> Option<String> {
    match assigned(values, column) {
        Some(SqlValue::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

pub fn insert(
    conn: &Connection,
    table: &Table,
    id: &str,
    values: &Assignments,
) -> Result<(), HandlerErr> {
    let now = now_rfc3339();
    let mut cols: Vec<&str> = vec!["id", "created_at", "updated_at"];
    let mut args: Vec<SqlValue> = vec![
        SqlValue::Text(id.to_string()),
        SqlValue::Text(now.clone()),
        SqlValue::Text(now),
    ];
    for (c, v) in values {
        cols.push(c);
        args.push(v.clone());
    }
    let placeholders = vec!["?"; cols.len()].join(", ");
    let sql = format!(
        "INSERT INTO {}({}) VALUES({})",
        table.name,
        cols.join(", "),
        placeholders
    );
    conn.execute(&sql, params_from_iter(args))?;
    Ok(())
}

/// Returns false when no row has `id`.
pub fn update(
    conn: &Connection,
    table: &Table,
    id: &str,
    values: &Assignments,
) -> Result<bool, HandlerErr> {
    let mut sets: Vec<String> = vec!["updated_at = ?".to_string()];
    let mut args: Vec<SqlValue> = vec![SqlValue::Text(now_rfc3339())];
    for (c, v) in values {
        sets.push(format!("{} = ?", c));
        args.push(v.clone());
    }
    args.push(SqlValue::Text(id.to_string()));
    let sql = format!("UPDATE {} SET {} WHERE id = ?", table.name, sets.join(", "));
    let n = conn.execute(&sql, params_from_iter(args))?;
    Ok(n > 0)
}

pub fn delete(conn: &Connection, table: &Table, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("DELETE FROM {} WHERE id = ?", table.name);
    Ok(conn.execute(&sql, [id])? > 0)
}

/// Column list matching [`row_json`], qualified with `alias`.
pub fn select_columns(table: &Table, alias: &str) -> String {
    let mut cols = vec![format!("{}.id", alias)];
    for f in table.fields {
        cols.push(format!("{}.{}", alias, f.column));
    }
    cols.push(format!("{}.created_at", alias));
    cols.push(format!("{}.updated_at", alias));
    cols.join(", ")
}

/// Number of columns [`select_columns`] emits.
pub fn column_count(table: &Table) -> usize {
    table.fields.len() + 3
}

pub fn row_json(table: &Table, row: &Row<'_>) -> rusqlite::Result<Map<String, Value>> {
    let mut obj = Map::new();
    obj.insert("id".into(), Value::String(row.get(0)?));
    for (i, f) in table.fields.iter().enumerate() {
        let idx = i + 1;
        let v = match f.kind {
            Kind::Int | Kind::Weekday => match row.get::<_, Option<i64>>(idx)? {
                Some(n) => Value::from(n),
                None => Value::Null,
            },
            Kind::Bool => Value::Bool(row.get::<_, Option<i64>>(idx)?.unwrap_or(0) != 0),
            _ => match row.get::<_, Option<String>>(idx)? {
                Some(s) => Value::String(s),
                None => Value::Null,
            },
        };
        obj.insert(f.param.into(), v);
    }
    let n = table.fields.len();
    obj.insert("createdAt".into(), Value::String(row.get(n + 1)?));
    obj.insert("updatedAt".into(), Value::String(row.get(n + 2)?));
    Ok(obj)
}

pub fn fetch(
    conn: &Connection,
    table: &Table,
    id: &str,
) -> Result<Option<Map<String, Value>>, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM {} t WHERE t.id = ?",
        select_columns(table, "t"),
        table.name
    );
    Ok(conn.query_row(&sql, [id], |r| row_json(table, r)).optional()?)
}

pub fn fetch_required(
    conn: &Connection,
    table: &Table,
    id: &str,
) -> Result<Map<String, Value>, HandlerErr> {
    fetch(conn, table, id)?.ok_or_else(|| HandlerErr::not_found(table.label))
}

/// Filter clauses for a list query over alias `t`.
#[derive(Default)]
pub struct Filter {
    clauses: Vec<String>,
    args: Vec<SqlValue>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, clause: impl Into<String>, args: impl IntoIterator<Item = SqlValue>) {
        self.clauses.push(clause.into());
        self.args.extend(args);
    }

    pub fn eq_text(&mut self, column: &str, value: Option<String>) {
        if let Some(v) = value {
            self.push(format!("t.{} = ?", column), [SqlValue::Text(v)]);
        }
    }

    pub fn args(&self) -> &[SqlValue] {
        &self.args
    }

    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// Rows for one page plus the total matching count.
///
/// `extra_select` columns follow the table columns and are folded into each
/// row by `extend`.
pub fn list(
    conn: &Connection,
    table: &Table,
    joins: &str,
    extra_select: &[&str],
    filter: &Filter,
    order_by: &str,
    limit: i64,
    offset: i64,
    extend: impl Fn(&Row<'_>, usize, &mut Map<String, Value>) -> rusqlite::Result<()>,
) -> Result<(Vec<Value>, i64), HandlerErr> {
    let where_sql = filter.where_sql();
    let count_sql = format!(
        "SELECT COUNT(*) FROM {} t {} {}",
        table.name, joins, where_sql
    );
    let count: i64 = conn.query_row(&count_sql, params_from_iter(filter.args.iter()), |r| {
        r.get(0)
    })?;

    let mut select = select_columns(table, "t");
    for e in extra_select {
        select.push_str(", ");
        select.push_str(e);
    }
    let sql = format!(
        "SELECT {} FROM {} t {} {} ORDER BY {} LIMIT ? OFFSET ?",
        select, table.name, joins, where_sql, order_by
    );
    let mut args: Vec<SqlValue> = filter.args.clone();
    args.push(SqlValue::Integer(limit));
    args.push(SqlValue::Integer(offset));

    let base = column_count(table);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| {
            let mut obj = row_json(table, r)?;
            extend(r, base, &mut obj)?;
            Ok(Value::Object(obj))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((rows, count))
}

/// Extra columns that need no post-processing.
pub fn no_extras(_: &Row<'_>, _: usize, _: &mut Map<String, Value>) -> rusqlite::Result<()> {
    Ok(())
}
