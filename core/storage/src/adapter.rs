//! Drive adapter contract.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use unidrive_common::{DrivePath, Error, Result};

use crate::lookup::IdCache;
use crate::request::RequestEngine;
use crate::state::StateCell;
use crate::upload::UploadSettings;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// Content hashes reported by a vendor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Path relative to the mount root (or absolute, once the dispatcher rewrites it).
    pub path: DrivePath,
    /// Display name.
    pub name: String,
    /// Size in bytes (0 for folders).
    pub size: u64,
    /// File or folder.
    pub kind: EntryKind,
    /// Vendor identifier, if the vendor addresses entries by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<FileHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    /// A file entry at `path`.
    pub fn file(path: DrivePath, size: u64) -> Self {
        Self::new(path, size, EntryKind::File)
    }

    /// A folder entry at `path`.
    pub fn folder(path: DrivePath) -> Self {
        Self::new(path, 0, EntryKind::Folder)
    }

    fn new(path: DrivePath, size: u64, kind: EntryKind) -> Self {
        let name = path.name().unwrap_or("/").to_string();
        Self {
            path,
            name,
            size,
            kind,
            remote_id: None,
            hash: None,
            thumbnail: None,
            created_at: None,
            modified_at: None,
        }
    }

    pub fn with_remote_id(mut self, id: impl Into<String>) -> Self {
        self.remote_id = Some(id.into());
        self
    }

    pub fn with_hash(mut self, hash: FileHash) -> Self {
        self.hash = Some(hash);
        self
    }

    pub fn with_times(
        mut self,
        created_at: Option<DateTime<Utc>>,
        modified_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_at = created_at;
        self.modified_at = modified_at;
        self
    }

    pub fn with_thumbnail(mut self, url: Option<String>) -> Self {
        self.thumbnail = url;
        self
    }

    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

/// One directory level, fully paginated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub entries: Vec<FileEntry>,
    pub total: usize,
    pub page_size: usize,
}

impl Listing {
    /// Build a listing whose counters match its entries.
    pub fn new(entries: Vec<FileEntry>) -> Self {
        let total = entries.len();
        Self {
            entries,
            total,
            page_size: total,
        }
    }
}

/// A fetchable descriptor for a file's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLink {
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl FileLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            expires_at: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Status of a mutating operation.
///
/// Many vendor copy/move calls start a server-side job, so `InProgress`
/// is a normal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "error")]
    Error,
}

/// Result descriptor of copy/move/remove/create/upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTask {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl FileTask {
    pub fn done(entry: Option<FileEntry>) -> Self {
        Self {
            status: TaskStatus::Done,
            task_id: None,
            entry,
            message: None,
        }
    }

    pub fn in_progress(task_id: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::InProgress,
            task_id: Some(task_id.into()),
            entry: None,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            task_id: None,
            entry: None,
            message: Some(message.into()),
        }
    }
}

/// A named upload body.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub name: String,
    pub data: Bytes,
}

impl UploadPayload {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Sort field for listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    #[default]
    Name,
    Size,
    Modified,
}

/// Listing order taken from a mount's config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOrder {
    #[serde(default)]
    pub order_by: OrderBy,
    #[serde(default)]
    pub order_desc: bool,
}

impl ListOrder {
    /// Read `order_by`/`order_desc` from a mount config, ignoring other keys.
    pub fn from_config(config: &Value) -> Self {
        serde_json::from_value(config.clone()).unwrap_or_default()
    }

    /// Sort in place: folders first, then by the configured field.
    pub fn apply(&self, entries: &mut [FileEntry]) {
        entries.sort_by(|a, b| {
            let folders = b.is_folder().cmp(&a.is_folder());
            if folders != Ordering::Equal {
                return folders;
            }
            let ord = match self.order_by {
                OrderBy::Name => a.name.cmp(&b.name),
                OrderBy::Size => a.size.cmp(&b.size).then_with(|| a.name.cmp(&b.name)),
                OrderBy::Modified => a
                    .modified_at
                    .cmp(&b.modified_at)
                    .then_with(|| a.name.cmp(&b.name)),
            };
            if self.order_desc {
                ord.reverse()
            } else {
                ord
            }
        });
    }
}

/// Deserialize a mount config into an adapter's typed config.
///
/// A null config is treated as an empty object.
pub fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T> {
    let value = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| Error::Validation(format!("Invalid drive config: {}", e)))
}

/// Everything an adapter constructor receives.
#[derive(Clone)]
pub struct AdapterContext {
    /// Mount point in the virtual tree.
    pub mount_path: DrivePath,
    /// Operator-supplied configuration.
    pub config: Value,
    /// Persisted state from the credential store.
    pub saved: Value,
    /// Shared request/retry engine.
    pub engine: RequestEngine,
    /// Upload protocol settings (per-mount overrides already applied).
    pub upload: UploadSettings,
    /// Optional path-to-id cache shared across requests.
    pub ids: Option<IdCache>,
    /// Shared HTTP client.
    pub http: reqwest::Client,
}

impl AdapterContext {
    /// Context with default engine and upload settings.
    pub fn new(mount_path: DrivePath, config: Value, saved: Value) -> Self {
        let upload = UploadSettings::default().with_mount_overrides(&config);
        Self {
            mount_path,
            config,
            saved,
            engine: RequestEngine::default(),
            upload,
            ids: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_engine(mut self, engine: RequestEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_upload(mut self, upload: UploadSettings) -> Self {
        self.upload = upload.with_mount_overrides(&self.config);
        self
    }

    pub fn with_ids(mut self, ids: Option<IdCache>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

/// Capability contract every drive implementation satisfies.
///
/// An instance is built per request from one mount, used by that request
/// only, and dropped afterwards. All paths are relative to the mount root.
#[async_trait]
pub trait DriveAdapter: Send + Sync {
    /// Adapter type name (e.g., "gdrive", "local").
    fn kind(&self) -> &str;

    /// Saved state and drift flag for write-back.
    fn state(&self) -> &StateCell;

    /// One-time setup at mount creation.
    ///
    /// # Postconditions
    /// - Config is validated
    /// - Initial credentials and account-tier fields are in the saved state
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Authentication errors
    async fn init_self(&self) -> Result<()>;

    /// Cheap per-request hydration; refreshes stale credentials.
    async fn load_self(&self) -> Result<()>;

    /// List one directory level, paginating internally until the end.
    async fn list_file(&self, path: &DrivePath) -> Result<Listing>;

    /// Resolve fetchable descriptors without transferring bytes.
    async fn down_file(&self, path: &DrivePath) -> Result<Vec<FileLink>>;

    /// Copy `from` to the full destination path `to`.
    async fn copy_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask>;

    /// Move/rename `from` to the full destination path `to`.
    async fn move_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask>;

    /// Delete a file or folder.
    async fn kill_file(&self, path: &DrivePath) -> Result<FileTask>;

    /// Create a folder at `path`.
    async fn make_file(&self, path: &DrivePath, options: &Value) -> Result<FileTask>;

    /// Upload `payload` into the directory `dir`.
    async fn push_file(&self, dir: &DrivePath, payload: UploadPayload) -> Result<FileTask>;

    /// Resolve a path to the vendor id; `None` on the first missing component.
    async fn find_id(&self, path: &DrivePath) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(name: &str, size: u64, folder: bool) -> FileEntry {
        let path = DrivePath::root().join(name).unwrap();
        if folder {
            FileEntry::folder(path)
        } else {
            FileEntry::file(path, size)
        }
    }

    #[test]
    fn test_file_entry_serialization() {
        let entry = FileEntry::file(DrivePath::parse("/docs/a.txt").unwrap(), 1024)
            .with_remote_id("id-1")
            .with_hash(FileHash {
                md5: Some("abc".into()),
                ..Default::default()
            });

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["path"], "/docs/a.txt");
        assert_eq!(json["name"], "a.txt");
        assert_eq!(json["kind"], "file");
        assert_eq!(json["remoteId"], "id-1");
        assert_eq!(json["hash"]["md5"], "abc");
        assert!(json.get("thumbnail").is_none());

        let back: FileEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_task_status_wire_names() {
        let task = FileTask::in_progress("job-7");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "in-progress");
        assert_eq!(json["taskId"], "job-7");
    }

    #[test]
    fn test_listing_counters_match_entries() {
        let listing = Listing::new(vec![entry("a", 1, false), entry("b", 2, false)]);
        assert_eq!(listing.total, 2);
        assert_eq!(listing.page_size, listing.entries.len());
    }

    #[test]
    fn test_list_order_folders_first_by_name() {
        let mut entries = vec![entry("b.txt", 5, false), entry("zeta", 0, true), entry("a.txt", 9, false)];
        ListOrder::default().apply(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_list_order_size_desc_from_config() {
        let order = ListOrder::from_config(&json!({"order_by": "size", "order_desc": true, "root": "/x"}));
        assert_eq!(order.order_by, OrderBy::Size);
        let mut entries = vec![entry("small", 1, false), entry("big", 100, false)];
        order.apply(&mut entries);
        assert_eq!(entries[0].name, "big");
    }

    #[test]
    fn test_list_order_bad_config_falls_back() {
        let order = ListOrder::from_config(&json!({"order_by": 42}));
        assert_eq!(order, ListOrder::default());
    }
}
