//! Mount entries and their persisted form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use unidrive_common::{DrivePath, Error, Result};

/// A drive mounted into the virtual tree.
#[derive(Debug, Clone, PartialEq)]
pub struct MountEntry {
    /// Normalized mount path; unique among mounts.
    pub path: DrivePath,
    /// Registered adapter type name.
    pub adapter_type: String,
    /// Opaque adapter configuration.
    pub config: Value,
    /// Opaque adapter state carried between requests.
    pub saved_state: Value,
    pub enabled: bool,
    /// Last lifecycle log line.
    pub last_log: Option<String>,
}

impl MountEntry {
    pub fn new(path: DrivePath, adapter_type: impl Into<String>, config: Value) -> Self {
        Self {
            path,
            adapter_type: adapter_type.into(),
            config,
            saved_state: Value::Object(Default::default()),
            enabled: true,
            last_log: None,
        }
    }

    /// Persisted form of this entry.
    ///
    /// # Errors
    /// - Config or state not serializable
    pub fn to_record(&self) -> Result<MountRecord> {
        Ok(MountRecord {
            mount_path: self.path.to_string_path(),
            mount_type: self.adapter_type.clone(),
            drive_conf: serde_json::to_string(&self.config)?,
            drive_save: serde_json::to_string(&self.saved_state)?,
            is_enabled: self.enabled,
            drive_logs: self.last_log.clone().unwrap_or_default(),
        })
    }
}

/// Row layout of the `mounts` table.
///
/// Config and state are stored as JSON strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRecord {
    pub mount_path: String,
    pub mount_type: String,
    pub drive_conf: String,
    #[serde(default)]
    pub drive_save: String,
    #[serde(default = "enabled_by_default")]
    pub is_enabled: bool,
    #[serde(default)]
    pub drive_logs: String,
}

fn enabled_by_default() -> bool {
    true
}

fn parse_blob(raw: &str, field: &str, mount: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw).map_err(|e| {
        Error::Serialization(format!("Corrupt {} for mount {}: {}", field, mount, e))
    })
}

impl TryFrom<MountRecord> for MountEntry {
    type Error = Error;

    fn try_from(record: MountRecord) -> Result<Self> {
        let config = parse_blob(&record.drive_conf, "drive_conf", &record.mount_path)?;
        let saved_state = parse_blob(&record.drive_save, "drive_save", &record.mount_path)?;
        Ok(Self {
            path: DrivePath::parse(&record.mount_path)?,
            adapter_type: record.mount_type,
            config,
            saved_state,
            enabled: record.is_enabled,
            last_log: (!record.drive_logs.is_empty()).then_some(record.drive_logs),
        })
    }
}
