//! Service configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use unidrive_common::{Error, Result};
use unidrive_storage::{IdCache, RetryConfig, UploadSettings};

/// Retry settings for transient network failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

/// Chunked upload defaults; mounts may override concurrency and slice size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSection {
    pub concurrency: usize,
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_attempts: 10,
            poll_interval_ms: 1_000,
        }
    }
}

/// Path-to-id cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub capacity: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            capacity: 10_000,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub retry: RetrySection,
    pub upload: UploadSection,
    pub cache: CacheSection,
    /// Deadline for one dispatched operation.
    pub request_timeout_secs: Option<u64>,
    /// Serialize `load_self` per mount instead of last-write-wins.
    pub refresh_lock: bool,
}

impl ServiceConfig {
    /// Load from a JSON file.
    ///
    /// # Errors
    /// - File unreadable
    /// - Invalid JSON
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read(path.as_ref()).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            Error::Validation(format!(
                "Invalid service config {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.retry.max_attempts)
            .with_initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .with_jitter(self.retry.jitter)
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            concurrency: self.upload.concurrency.max(1),
            poll_attempts: self.upload.poll_attempts,
            poll_interval: Duration::from_millis(self.upload.poll_interval_ms),
            ..UploadSettings::default()
        }
    }

    /// The shared id cache, if enabled.
    pub fn id_cache(&self) -> Option<IdCache> {
        self.cache.enabled.then(|| {
            IdCache::new(
                self.cache.capacity,
                Duration::from_secs(self.cache.ttl_secs),
            )
        })
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.upload_settings().concurrency, 3);
        assert!(config.id_cache().is_some());
        assert!(config.request_timeout().is_none());
        assert!(!config.refresh_lock);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ServiceConfig = serde_json::from_value(json!({
            "upload": {"concurrency": 5},
            "cache": {"enabled": false},
            "request_timeout_secs": 30,
        }))
        .unwrap();
        assert_eq!(config.upload.concurrency, 5);
        assert_eq!(config.upload.poll_attempts, 10);
        assert!(config.id_cache().is_none());
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.retry_config().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("unidrive.json");
        tokio::fs::write(&path, r#"{"refresh_lock": true}"#).await.unwrap();
        let config = ServiceConfig::load(&path).await.unwrap();
        assert!(config.refresh_lock);

        tokio::fs::write(&path, "not json").await.unwrap();
        assert!(matches!(
            ServiceConfig::load(&path).await,
            Err(Error::Validation(_))
        ));
    }
}
