//! Credential store contract and the typed mount table on top of it.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use unidrive_common::{DrivePath, Error, Result};

use crate::record::{MountEntry, MountRecord};

/// One row: column name to JSON value.
pub type Row = Map<String, Value>;

/// Table holding mount records.
pub const MOUNTS_TABLE: &str = "mounts";

/// Persistent key/value rows keyed by table.
///
/// Each call is atomic for the rows it touches.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Rows whose columns equal every entry in `keys`; all rows when empty.
    async fn find(&self, table: &str, keys: &Row) -> Result<Vec<Row>>;

    /// Merge `data` into rows matching `keys`, inserting `keys + data` when
    /// none match.
    async fn save(&self, table: &str, keys: &Row, data: &Row) -> Result<()>;

    /// Delete rows matching `keys`; returns how many were removed.
    async fn delete(&self, table: &str, keys: &Row) -> Result<usize>;
}

fn matches(row: &Row, keys: &Row) -> bool {
    keys.iter().all(|(k, v)| row.get(k) == Some(v))
}

/// Build a row from column/value pairs.
pub fn row<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find(&self, table: &str, keys: &Row) -> Result<Vec<Row>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| matches(r, keys)).cloned().collect())
            .unwrap_or_default())
    }

    async fn save(&self, table: &str, keys: &Row, data: &Row) -> Result<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();

        let mut updated = false;
        for existing in rows.iter_mut().filter(|r| matches(r, keys)) {
            existing.extend(data.clone());
            updated = true;
        }
        if !updated {
            let mut fresh = keys.clone();
            fresh.extend(data.clone());
            rows.push(fresh);
        }
        Ok(())
    }

    async fn delete(&self, table: &str, keys: &Row) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !matches(r, keys));
        Ok(before - rows.len())
    }
}

fn path_key(path: &DrivePath) -> Row {
    row([("mount_path", Value::String(path.to_string_path()))])
}

fn record_row(record: &MountRecord) -> Result<Row> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Serialization("Mount record is not an object".to_string())),
    }
}

/// Mount entries over a [`CredentialStore`].
#[derive(Clone)]
pub struct MountStore {
    store: Arc<dyn CredentialStore>,
}

impl MountStore {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Every mount; unreadable rows are skipped with a warning.
    pub async fn all(&self) -> Result<Vec<MountEntry>> {
        let rows = self.store.find(MOUNTS_TABLE, &Row::new()).await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let parsed = serde_json::from_value::<MountRecord>(Value::Object(row))
                .map_err(Error::from)
                .and_then(MountEntry::try_from);
            match parsed {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping unreadable mount row: {}", e),
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    pub async fn get(&self, path: &DrivePath) -> Result<Option<MountEntry>> {
        let rows = self.store.find(MOUNTS_TABLE, &path_key(path)).await?;
        match rows.into_iter().next() {
            Some(row) => {
                let record: MountRecord = serde_json::from_value(Value::Object(row))?;
                Ok(Some(MountEntry::try_from(record)?))
            }
            None => Ok(None),
        }
    }

    /// Insert or replace a whole entry.
    pub async fn put(&self, entry: &MountEntry) -> Result<()> {
        let data = record_row(&entry.to_record()?)?;
        self.store.save(MOUNTS_TABLE, &path_key(&entry.path), &data).await
    }

    /// Returns whether a mount was removed.
    pub async fn remove(&self, path: &DrivePath) -> Result<bool> {
        Ok(self.store.delete(MOUNTS_TABLE, &path_key(path)).await? > 0)
    }

    /// Write back drift: saved state and, when present, the log line.
    pub async fn write_state(&self, path: &DrivePath, saved: &Value, log: Option<&str>) -> Result<()> {
        debug!("Persisting saved state for {}", path);
        let mut data = row([("drive_save", Value::String(serde_json::to_string(saved)?))]);
        if let Some(log) = log {
            data.insert("drive_logs".to_string(), Value::String(log.to_string()));
        }
        self.store.save(MOUNTS_TABLE, &path_key(path), &data).await
    }

    pub async fn write_log(&self, path: &DrivePath, log: &str) -> Result<()> {
        let data = row([("drive_logs", Value::String(log.to_string()))]);
        self.store.save(MOUNTS_TABLE, &path_key(path), &data).await
    }

    pub async fn set_enabled(&self, path: &DrivePath, enabled: bool) -> Result<()> {
        let data = row([("is_enabled", Value::Bool(enabled))]);
        self.store.save(MOUNTS_TABLE, &path_key(path), &data).await
    }
}
