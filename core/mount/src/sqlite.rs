//! SQLite-backed credential store.
//!
//! Tables are declared up front; column names in queries come only from the
//! declared schema, never from callers.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use unidrive_common::{Error, Result};

use crate::store::{CredentialStore, Row, MOUNTS_TABLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Text,
    Bool,
}

struct TableSchema {
    name: &'static str,
    columns: &'static [(&'static str, ColumnKind)],
}

const SCHEMAS: &[TableSchema] = &[TableSchema {
    name: MOUNTS_TABLE,
    columns: &[
        ("mount_path", ColumnKind::Text),
        ("mount_type", ColumnKind::Text),
        ("drive_conf", ColumnKind::Text),
        ("drive_save", ColumnKind::Text),
        ("is_enabled", ColumnKind::Bool),
        ("drive_logs", ColumnKind::Text),
    ],
}];

const CREATE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS mounts (
        mount_path TEXT PRIMARY KEY,
        mount_type TEXT NOT NULL DEFAULT '',
        drive_conf TEXT NOT NULL DEFAULT '{}',
        drive_save TEXT NOT NULL DEFAULT '{}',
        is_enabled INTEGER NOT NULL DEFAULT 1,
        drive_logs TEXT NOT NULL DEFAULT ''
    );
"#;

fn schema(table: &str) -> Result<&'static TableSchema> {
    SCHEMAS
        .iter()
        .find(|s| s.name == table)
        .ok_or_else(|| Error::Unsupported(format!("Unknown table '{}'", table)))
}

impl TableSchema {
    fn column(&self, name: &str) -> Result<(&'static str, ColumnKind)> {
        self.columns
            .iter()
            .copied()
            .find(|(c, _)| *c == name)
            .ok_or_else(|| {
                Error::Validation(format!("Unknown column '{}' in table '{}'", name, self.name))
            })
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: SqlValue, kind: ColumnKind) -> Value {
    match (value, kind) {
        (SqlValue::Null, _) => Value::Null,
        (SqlValue::Integer(i), ColumnKind::Bool) => Value::Bool(i != 0),
        (SqlValue::Integer(i), ColumnKind::Text) => Value::String(i.to_string()),
        (SqlValue::Real(f), _) => Value::from(f),
        (SqlValue::Text(s), _) => Value::String(s),
        (SqlValue::Blob(b), _) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn sql_error(err: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite: {}", err))
}

/// `WHERE` clause and parameters for `keys`, numbering from `?{offset + 1}`.
fn where_clause(
    schema: &TableSchema,
    keys: &Row,
    offset: usize,
) -> Result<(String, Vec<SqlValue>)> {
    if keys.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut parts = Vec::with_capacity(keys.len());
    let mut params = Vec::with_capacity(keys.len());
    for (i, (name, value)) in keys.iter().enumerate() {
        let (column, _) = schema.column(name)?;
        parts.push(format!("{} = ?{}", column, offset + i + 1));
        params.push(to_sql(value));
    }
    Ok((format!(" WHERE {}", parts.join(" AND ")), params))
}

fn find_rows(conn: &Connection, schema: &TableSchema, keys: &Row) -> Result<Vec<Row>> {
    let columns: Vec<&str> = schema.columns.iter().map(|(c, _)| *c).collect();
    let (filter, params) = where_clause(schema, keys, 0)?;
    let sql = format!("SELECT {} FROM {}{}", columns.join(", "), schema.name, filter);

    let mut stmt = conn.prepare(&sql).map_err(sql_error)?;
    let rows = stmt
        .query_map(params_from_iter(params), |r| {
            let mut row = Row::new();
            for (i, (name, kind)) in schema.columns.iter().enumerate() {
                let value: SqlValue = r.get(i)?;
                row.insert(name.to_string(), from_sql(value, *kind));
            }
            Ok(row)
        })
        .map_err(sql_error)?;

    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_error)
}

fn save_row(conn: &mut Connection, schema: &TableSchema, keys: &Row, data: &Row) -> Result<()> {
    let tx = conn.transaction().map_err(sql_error)?;

    let (filter, key_params) = where_clause(schema, keys, 0)?;
    let count: i64 = tx
        .query_row(
            &format!("SELECT COUNT(*) FROM {}{}", schema.name, filter),
            params_from_iter(key_params),
            |r| r.get(0),
        )
        .map_err(sql_error)?;

    if count > 0 {
        if !data.is_empty() {
            let mut sets = Vec::with_capacity(data.len());
            let mut params = Vec::with_capacity(data.len() + keys.len());
            for (i, (name, value)) in data.iter().enumerate() {
                let (column, _) = schema.column(name)?;
                sets.push(format!("{} = ?{}", column, i + 1));
                params.push(to_sql(value));
            }
            let (filter, key_params) = where_clause(schema, keys, data.len())?;
            params.extend(key_params);
            let sql = format!("UPDATE {} SET {}{}", schema.name, sets.join(", "), filter);
            tx.execute(&sql, params_from_iter(params)).map_err(sql_error)?;
        }
    } else {
        let mut merged = keys.clone();
        merged.extend(data.clone());
        let mut columns = Vec::with_capacity(merged.len());
        let mut params = Vec::with_capacity(merged.len());
        for (name, value) in &merged {
            let (column, _) = schema.column(name)?;
            columns.push(column);
            params.push(to_sql(value));
        }
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            schema.name,
            columns.join(", "),
            placeholders.join(", ")
        );
        tx.execute(&sql, params_from_iter(params)).map_err(sql_error)?;
    }

    tx.commit().map_err(sql_error)
}

fn delete_rows(conn: &Connection, schema: &TableSchema, keys: &Row) -> Result<usize> {
    let (filter, params) = where_clause(schema, keys, 0)?;
    let sql = format!("DELETE FROM {}{}", schema.name, filter);
    conn.execute(&sql, params_from_iter(params)).map_err(sql_error)
}

/// Credential store persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a database file.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(sql_error)?;
        conn.execute_batch(CREATE_SCHEMA).map_err(sql_error)?;
        info!("Credential store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Run `f` on the connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("Store task failed: {}", e)))?
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn find(&self, table: &str, keys: &Row) -> Result<Vec<Row>> {
        let schema = schema(table)?;
        let keys = keys.clone();
        self.with_conn(move |conn| find_rows(conn, schema, &keys)).await
    }

    async fn save(&self, table: &str, keys: &Row, data: &Row) -> Result<()> {
        let schema = schema(table)?;
        debug!("Saving row in {}", table);
        let (keys, data) = (keys.clone(), data.clone());
        self.with_conn(move |conn| save_row(conn, schema, &keys, &data)).await
    }

    async fn delete(&self, table: &str, keys: &Row) -> Result<usize> {
        let schema = schema(table)?;
        let keys = keys.clone();
        self.with_conn(move |conn| delete_rows(conn, schema, &keys)).await
    }
}
