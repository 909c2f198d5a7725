//! Operator actions on mounts.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use unidrive_common::{DrivePath, Error, Result};

use crate::record::MountEntry;
use crate::resolver::MountResolver;

/// Creates, removes and re-initializes mounts.
pub struct MountManager {
    resolver: Arc<MountResolver>,
}

impl MountManager {
    pub fn new(resolver: Arc<MountResolver>) -> Self {
        Self { resolver }
    }

    /// Mount a new drive.
    ///
    /// # Preconditions
    /// - No mount exists at `path`
    /// - `adapter_type` is registered
    ///
    /// # Postconditions
    /// - `init_self` succeeded and its saved state is persisted
    ///
    /// # Errors
    /// - Path already mounted (`AlreadyExists`)
    /// - Unknown adapter type (`Validation`)
    /// - Adapter initialization failure; nothing is persisted
    pub async fn create(&self, path: &DrivePath, adapter_type: &str, config: Value) -> Result<MountEntry> {
        let mounts = self.resolver.mounts();
        if mounts.get(path).await?.is_some() {
            return Err(Error::AlreadyExists(format!("{} is already mounted", path)));
        }
        if !self.resolver.registry().has_adapter(adapter_type) {
            return Err(Error::Validation(format!(
                "Unknown drive type '{}'",
                adapter_type
            )));
        }

        let mut entry = MountEntry::new(path.clone(), adapter_type, config);
        self.initialize(&mut entry, "mounted").await?;
        mounts.put(&entry).await?;
        info!("Mounted {} drive at {}", adapter_type, path);
        Ok(entry)
    }

    /// Run `init_self` again with the stored config and state.
    pub async fn reinit(&self, path: &DrivePath) -> Result<MountEntry> {
        let mut entry = self.require(path).await?;
        if let Err(e) = self.initialize(&mut entry, "reinitialized").await {
            self.resolver
                .mounts()
                .write_log(path, &format!("reinit failed: {}", e))
                .await?;
            return Err(e);
        }
        self.resolver.mounts().put(&entry).await?;
        info!("Reinitialized mount {}", path);
        Ok(entry)
    }

    /// Unmount; the drive's contents are untouched.
    pub async fn remove(&self, path: &DrivePath) -> Result<()> {
        if !self.resolver.mounts().remove(path).await? {
            return Err(Error::NotFound(format!("No mount at {}", path)));
        }
        info!("Removed mount {}", path);
        Ok(())
    }

    pub async fn set_enabled(&self, path: &DrivePath, enabled: bool) -> Result<()> {
        self.require(path).await?;
        self.resolver.mounts().set_enabled(path, enabled).await
    }

    pub async fn list(&self) -> Result<Vec<MountEntry>> {
        self.resolver.mounts().all().await
    }

    async fn require(&self, path: &DrivePath) -> Result<MountEntry> {
        self.resolver
            .mounts()
            .get(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No mount at {}", path)))
    }

    async fn initialize(&self, entry: &mut MountEntry, verb: &str) -> Result<()> {
        let adapter = self.resolver.instantiate(entry)?;
        adapter.init_self().await?;
        entry.saved_state = adapter.state().snapshot();
        entry.last_log = Some(format!("{} at {}", verb, Utc::now().to_rfc3339()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::store::{MemoryStore, MountStore};
    use serde_json::json;
    use tempfile::TempDir;
    use unidrive_storage::create_default_registry;

    fn path(raw: &str) -> DrivePath {
        DrivePath::parse(raw).unwrap()
    }

    fn manager() -> MountManager {
        let mounts = MountStore::new(Arc::new(MemoryStore::new()));
        let resolver =
            MountResolver::new(Arc::new(create_default_registry()), mounts, &ServiceConfig::default())
                .unwrap();
        MountManager::new(Arc::new(resolver))
    }

    #[tokio::test]
    async fn test_create_persists_init_state() {
        let manager = manager();
        let entry = manager
            .create(&path("/cloud/"), "memory", json!({"namespace": "c"}))
            .await
            .unwrap();
        assert_eq!(entry.saved_state, json!({"namespace": "c"}));
        assert!(entry.last_log.as_deref().unwrap().starts_with("mounted at"));

        let all = manager.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].path, path("/cloud"));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_unknown_types() {
        let manager = manager();
        manager.create(&path("/a"), "memory", json!({})).await.unwrap();
        assert!(matches!(
            manager.create(&path("/a/"), "memory", json!({})).await,
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            manager.create(&path("/b"), "ftp", json!({})).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_init_persists_nothing() {
        let manager = manager();
        assert!(manager.create(&path("/disk"), "local", json!({})).await.is_err());
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_mount_lifecycle() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("drive");
        let manager = manager();

        manager
            .create(&path("/disk"), "local", json!({"root": root}))
            .await
            .unwrap();
        assert!(root.is_dir());

        manager.set_enabled(&path("/disk"), false).await.unwrap();
        assert!(!manager.list().await.unwrap()[0].enabled);

        let entry = manager.reinit(&path("/disk")).await.unwrap();
        assert!(entry.last_log.unwrap().starts_with("reinitialized"));

        manager.remove(&path("/disk")).await.unwrap();
        assert!(matches!(
            manager.remove(&path("/disk")).await,
            Err(Error::NotFound(_))
        ));
    }
}
