//! Path-to-id resolution for drives that address entries by id.

use async_trait::async_trait;
use moka::sync::Cache;
use std::time::Duration;
use tracing::debug;

use unidrive_common::{DrivePath, Result};

/// Id lookups an adapter answers from its vendor.
#[async_trait]
pub trait PathQuery: Send + Sync {
    /// Vendor id of the mount's root folder.
    async fn root_id(&self) -> Result<String>;

    /// Id of the child named `name` under `parent_id`, if present.
    async fn child_id(&self, parent_id: &str, name: &str) -> Result<Option<String>>;
}

/// Optional path-to-id cache shared across requests.
///
/// Keys are absolute virtual paths (mount path plus relative path), so one
/// cache may serve every mount.
#[derive(Clone)]
pub struct IdCache {
    cache: Cache<String, String>,
}

impl IdCache {
    /// Create a cache bounded by entry count and time-to-live.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    fn key(mount: &DrivePath, path: &DrivePath) -> String {
        mount.concat(path).to_string_path()
    }

    pub fn get(&self, mount: &DrivePath, path: &DrivePath) -> Option<String> {
        self.cache.get(&Self::key(mount, path))
    }

    pub fn insert(&self, mount: &DrivePath, path: &DrivePath, id: &str) {
        self.cache.insert(Self::key(mount, path), id.to_string());
    }

    /// Drop `path` and everything cached below it.
    pub fn invalidate(&self, mount: &DrivePath, path: &DrivePath) {
        let key = Self::key(mount, path);
        let prefix = format!("{}/", key.trim_end_matches('/'));
        self.cache.invalidate(&key);
        let stale: Vec<String> = self
            .cache
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.as_ref().clone())
            .collect();
        for k in stale {
            self.cache.invalidate(&k);
        }
    }
}

/// Resolve `path` to an id, walking down from the deepest cached ancestor.
///
/// Returns `Ok(None)` as soon as one component is missing.
pub async fn find_id<Q: PathQuery + ?Sized>(
    query: &Q,
    mount: &DrivePath,
    path: &DrivePath,
    cache: Option<&IdCache>,
) -> Result<Option<String>> {
    let components = path.components();

    // Deepest ancestor (or the path itself) already in the cache
    let mut start = 0;
    let mut current = None;
    if let Some(cache) = cache {
        for depth in (1..=components.len()).rev() {
            let prefix = DrivePath::from_components(components[..depth].to_vec())?;
            if let Some(id) = cache.get(mount, &prefix) {
                start = depth;
                current = Some(id);
                break;
            }
        }
    }

    let mut current = match current {
        Some(id) => id,
        None => query.root_id().await?,
    };

    for depth in start..components.len() {
        let name = &components[depth];
        current = match query.child_id(&current, name).await? {
            Some(id) => {
                if let Some(cache) = cache {
                    let prefix = DrivePath::from_components(components[..=depth].to_vec())?;
                    cache.insert(mount, &prefix, &id);
                }
                id
            }
            None => {
                debug!("No entry named {:?} under {}", name, current);
                return Ok(None);
            }
        };
    }

    Ok(Some(current))
}
