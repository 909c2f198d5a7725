//! Local filesystem drive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use unidrive_common::{DrivePath, Error, Result};

use crate::adapter::{
    parse_config, AdapterContext, DriveAdapter, FileEntry, FileLink, FileTask, ListOrder,
    Listing, UploadPayload,
};
use crate::state::StateCell;

/// Local drive configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Directory backing the mount.
    pub root: PathBuf,
}

/// Local filesystem drive.
///
/// Serves a directory on the host; the drive-relative path is the id.
pub struct LocalAdapter {
    root: PathBuf,
    order: ListOrder,
    state: StateCell,
}

fn io_error(path: &DrivePath, err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::NotFound => Error::NotFound(format!("Path not found: {}", path)),
        ErrorKind::AlreadyExists => Error::AlreadyExists(format!("Path already exists: {}", path)),
        _ => Error::Io(err),
    }
}

impl LocalAdapter {
    /// Create a local drive rooted at the configured directory.
    ///
    /// # Errors
    /// - Config has no `root`
    pub fn new(ctx: AdapterContext) -> Result<Self> {
        let config: LocalConfig = parse_config(&ctx.config)?;
        Ok(Self {
            root: config.root,
            order: ListOrder::from_config(&ctx.config),
            state: StateCell::new(ctx.saved),
        })
    }

    /// Convert a drive path to a filesystem path.
    fn to_fs_path(&self, path: &DrivePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for component in path.components() {
            fs_path.push(component);
        }
        fs_path
    }

    fn create_entry(&self, path: &DrivePath, fs_meta: &std::fs::Metadata) -> FileEntry {
        let modified: Option<DateTime<Utc>> = fs_meta.modified().ok().map(|t| t.into());
        let created: Option<DateTime<Utc>> = fs_meta.created().ok().map(|t| t.into());
        let entry = if fs_meta.is_dir() {
            FileEntry::folder(path.clone())
        } else {
            FileEntry::file(path.clone(), fs_meta.len())
        };
        entry
            .with_remote_id(path.to_string_path())
            .with_times(created, modified)
    }

    async fn entry_at(&self, path: &DrivePath) -> Result<FileEntry> {
        let fs_meta = fs::metadata(self.to_fs_path(path))
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(self.create_entry(path, &fs_meta))
    }

    async fn ensure_absent(&self, path: &DrivePath) -> Result<()> {
        if fs::try_exists(self.to_fs_path(path)).await? {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                path
            )));
        }
        Ok(())
    }
}

/// Copy a directory tree without recursion.
async fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        fs::create_dir(&dst).await?;
        let mut entries = fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl DriveAdapter for LocalAdapter {
    fn kind(&self) -> &str {
        "local"
    }

    fn state(&self) -> &StateCell {
        &self.state
    }

    async fn init_self(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn load_self(&self) -> Result<()> {
        if !fs::try_exists(&self.root).await? {
            return Err(Error::NotFound(format!(
                "Local root missing: {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn list_file(&self, path: &DrivePath) -> Result<Listing> {
        let fs_path = self.to_fs_path(path);
        let fs_meta = fs::metadata(&fs_path).await.map_err(|e| io_error(path, e))?;
        if !fs_meta.is_dir() {
            return Err(Error::Validation(format!("Not a directory: {}", path)));
        }

        let mut results = Vec::new();
        let mut entries = fs::read_dir(&fs_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = path.join(&name)?;
            let fs_meta = entry.metadata().await?;
            results.push(self.create_entry(&child, &fs_meta));
        }

        self.order.apply(&mut results);
        Ok(Listing::new(results))
    }

    async fn down_file(&self, path: &DrivePath) -> Result<Vec<FileLink>> {
        let entry = self.entry_at(path).await?;
        if entry.is_folder() {
            return Err(Error::Validation(format!("Cannot link a folder: {}", path)));
        }
        let fs_path = fs::canonicalize(self.to_fs_path(path)).await?;
        let url = url::Url::from_file_path(&fs_path).map_err(|_| {
            Error::Validation(format!("Not an absolute path: {}", fs_path.display()))
        })?;
        Ok(vec![FileLink::new(url.to_string())])
    }

    async fn copy_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        if to.starts_with(from) {
            return Err(Error::Validation(format!("Cannot copy {} into itself", from)));
        }
        let source = self.entry_at(from).await?;
        self.ensure_absent(to).await?;

        let from_path = self.to_fs_path(from);
        let to_path = self.to_fs_path(to);
        if source.is_folder() {
            copy_tree(&from_path, &to_path).await?;
        } else {
            fs::copy(&from_path, &to_path)
                .await
                .map_err(|e| io_error(to, e))?;
        }

        Ok(FileTask::done(Some(self.entry_at(to).await?)))
    }

    async fn move_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        if from.is_root() || to.starts_with(from) {
            return Err(Error::Validation(format!("Cannot move {} to {}", from, to)));
        }
        self.entry_at(from).await?;
        self.ensure_absent(to).await?;

        fs::rename(self.to_fs_path(from), self.to_fs_path(to))
            .await
            .map_err(|e| io_error(to, e))?;

        Ok(FileTask::done(Some(self.entry_at(to).await?)))
    }

    async fn kill_file(&self, path: &DrivePath) -> Result<FileTask> {
        if path.is_root() {
            return Err(Error::Validation("The root cannot be removed".to_string()));
        }
        let entry = self.entry_at(path).await?;
        let fs_path = self.to_fs_path(path);
        if entry.is_folder() {
            fs::remove_dir_all(&fs_path).await?;
        } else {
            fs::remove_file(&fs_path).await?;
        }
        Ok(FileTask::done(None))
    }

    async fn make_file(&self, path: &DrivePath, _options: &Value) -> Result<FileTask> {
        self.ensure_absent(path).await?;
        fs::create_dir(self.to_fs_path(path))
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(FileTask::done(Some(self.entry_at(path).await?)))
    }

    async fn push_file(&self, dir: &DrivePath, payload: UploadPayload) -> Result<FileTask> {
        let parent = self.entry_at(dir).await?;
        if !parent.is_folder() {
            return Err(Error::Validation(format!("Not a directory: {}", dir)));
        }
        let path = dir.join(&payload.name)?;
        fs::write(self.to_fs_path(&path), &payload.data).await?;
        Ok(FileTask::done(Some(self.entry_at(&path).await?)))
    }

    async fn find_id(&self, path: &DrivePath) -> Result<Option<String>> {
        match fs::try_exists(self.to_fs_path(path)).await? {
            true => Ok(Some(path.to_string_path())),
            false => Ok(None),
        }
    }
}
