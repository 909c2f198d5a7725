//! Mount resolver: path to loaded adapter, with drift write-back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use unidrive_common::{DrivePath, Error, Result};
use unidrive_storage::http::build_client;
use unidrive_storage::{
    AdapterContext, AdapterRegistry, DriveAdapter, IdCache, RequestEngine, UploadSettings,
};

use crate::config::ServiceConfig;
use crate::record::MountEntry;
use crate::store::MountStore;
use crate::table::{self, Resolution};

/// An adapter instance hydrated for one request.
pub struct LoadedMount {
    pub entry: MountEntry,
    pub adapter: Box<dyn DriveAdapter>,
}

/// Result of resolving a request path.
pub struct Resolved {
    pub primary: Option<LoadedMount>,
    /// Requested path relative to the primary mount.
    pub relative: DrivePath,
    /// Mounts strictly below the requested path; never loaded.
    pub nested: Vec<MountEntry>,
}

type MountLocks = Mutex<HashMap<DrivePath, Arc<tokio::sync::Mutex<()>>>>;

/// Finds the mounts covering a path and builds adapters for them.
pub struct MountResolver {
    registry: Arc<AdapterRegistry>,
    mounts: MountStore,
    engine: RequestEngine,
    upload: UploadSettings,
    ids: Option<IdCache>,
    http: reqwest::Client,
    /// Present when `refresh_lock` is enabled.
    locks: Option<MountLocks>,
}

impl MountResolver {
    /// # Errors
    /// - HTTP client could not be built
    pub fn new(registry: Arc<AdapterRegistry>, mounts: MountStore, config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            registry,
            mounts,
            engine: RequestEngine::new(config.retry_config()),
            upload: config.upload_settings(),
            ids: config.id_cache(),
            http: build_client(config.request_timeout())?,
            locks: config.refresh_lock.then(|| Mutex::new(HashMap::new())),
        })
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn mounts(&self) -> &MountStore {
        &self.mounts
    }

    /// Build an adapter for `entry` from its config and saved state.
    ///
    /// # Errors
    /// - Unknown adapter type
    /// - Configuration rejected by the adapter
    pub fn instantiate(&self, entry: &MountEntry) -> Result<Box<dyn DriveAdapter>> {
        let ctx = AdapterContext::new(
            entry.path.clone(),
            entry.config.clone(),
            entry.saved_state.clone(),
        )
        .with_engine(self.engine.clone())
        .with_upload(self.upload.clone())
        .with_ids(self.ids.clone())
        .with_http(self.http.clone());
        self.registry.resolve(&entry.adapter_type, ctx)
    }

    /// Mount-table lookup without loading anything.
    pub async fn locate(&self, requested: &DrivePath) -> Result<Resolution> {
        let mounts = self.mounts.all().await?;
        table::resolve(&mounts, requested)
    }

    /// Resolve `requested` and load the primary mount's adapter.
    ///
    /// # Postconditions
    /// - Drift produced by `load_self` is written back before returning
    ///
    /// # Errors
    /// - Duplicate mount paths
    /// - Adapter construction or `load_self` failure
    pub async fn resolve(&self, requested: &DrivePath) -> Result<Resolved> {
        let resolution = self.locate(requested).await?;
        let primary = match resolution.primary {
            Some(entry) => Some(self.load(entry).await?),
            None => None,
        };
        Ok(Resolved {
            primary,
            relative: resolution.relative,
            nested: resolution.nested,
        })
    }

    fn lock_for(&self, path: &DrivePath) -> Option<Arc<tokio::sync::Mutex<()>>> {
        let locks = self.locks.as_ref()?;
        let mut locks = locks.lock().unwrap_or_else(|e| e.into_inner());
        Some(locks.entry(path.clone()).or_default().clone())
    }

    async fn load(&self, entry: MountEntry) -> Result<LoadedMount> {
        let lock = self.lock_for(&entry.path);
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        // Under the lock, state written by the previous holder must be seen
        let entry = match &lock {
            Some(_) => self.mounts.get(&entry.path).await?.unwrap_or(entry),
            None => entry,
        };

        let adapter = self.instantiate(&entry)?;
        debug!("Loading {} mount at {}", entry.adapter_type, entry.path);
        if let Err(e) = adapter.load_self().await {
            let line = format!("load failed: {}", e);
            if let Err(log_err) = self.mounts.write_log(&entry.path, &line).await {
                warn!("Failed to record load failure for {}: {}", entry.path, log_err);
            }
            return Err(e);
        }

        if let Err(e) = self.persist_drift(&entry.path, adapter.as_ref()).await {
            warn!("Deferring drift write-back for {}: {}", entry.path, e);
        }
        Ok(LoadedMount { entry, adapter })
    }

    /// Write pending state drift back to the store.
    ///
    /// Returns whether anything was written. On failure the drift stays
    /// pending so a later flush can retry.
    pub async fn persist_drift(&self, path: &DrivePath, adapter: &dyn DriveAdapter) -> Result<bool> {
        let Some(drift) = adapter.state().take_drift() else {
            return Ok(false);
        };
        match self
            .mounts
            .write_state(path, &drift.saved, drift.log.as_deref())
            .await
        {
            Ok(()) => {
                info!("Persisted state drift for {}", path);
                Ok(true)
            }
            Err(e) => {
                adapter.state().restore_changed();
                Err(Error::Storage(format!("Drift write-back failed: {}", e)))
            }
        }
    }
}
