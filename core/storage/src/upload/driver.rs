//! Vendor-neutral driver for the chunked upload protocol.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use unidrive_common::{DrivePath, Error, Result};

use super::hash::{slice_hashes, ContentDigest};
use super::plan::{SliceOptions, SlicePlan, SlicePolicy, SliceRange};
use super::session::{SliceReceipt, UploadSession};
use crate::adapter::FileEntry;
use crate::auth::Authenticator;
use crate::request::RequestEngine;

/// Where a payload is going.
#[derive(Debug, Clone)]
pub struct UploadTarget {
    /// Parent directory, relative to the mount.
    pub dir: DrivePath,
    pub name: String,
    /// Full destination path, relative to the mount.
    pub path: DrivePath,
    pub size: u64,
}

impl UploadTarget {
    pub fn new(dir: &DrivePath, name: &str, size: u64) -> Result<Self> {
        Ok(Self {
            dir: dir.clone(),
            name: name.to_string(),
            path: dir.join(name)?,
            size,
        })
    }
}

/// Outcome of the finalize call.
#[derive(Debug, Clone)]
pub enum Finalize {
    /// The vendor assembled the file synchronously.
    Done(FileEntry),
    /// The vendor is assembling; poll with this ticket.
    Pending(String),
}

/// Vendor hooks for the chunked upload protocol.
///
/// Every call receives the credential to attach; the driver routes each one
/// through the request engine so auth refresh and backoff apply per call.
#[async_trait]
pub trait ChunkedUpload: Send + Sync {
    /// Slice size limits for the current account.
    fn slice_policy(&self) -> SlicePolicy;

    /// Vendor cap on slices in flight; `Some(1)` for sequential protocols.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Existence probe by content hash; `Some` registers the file without
    /// transferring bytes.
    async fn rapid_upload(
        &self,
        _credential: &str,
        _target: &UploadTarget,
        _digest: &ContentDigest,
    ) -> Result<Option<FileEntry>> {
        Ok(None)
    }

    /// Open a session and return its upload id.
    async fn open_session(
        &self,
        credential: &str,
        target: &UploadTarget,
        digest: &ContentDigest,
        plan: &SlicePlan,
        slice_hashes: &[String],
    ) -> Result<String>;

    /// Transfer one slice.
    async fn put_slice(
        &self,
        credential: &str,
        session: &UploadSession,
        slice: &SliceRange,
        data: Bytes,
        hash: &str,
    ) -> Result<SliceReceipt>;

    /// Submit the ordered slice list.
    async fn finalize(&self, credential: &str, session: &UploadSession) -> Result<Finalize>;

    /// Check on a pending finalize; `None` while still assembling.
    async fn poll_finalize(
        &self,
        _credential: &str,
        _session: &UploadSession,
        _ticket: &str,
    ) -> Result<Option<FileEntry>> {
        Err(Error::Unsupported(
            "This drive does not report pending uploads".to_string(),
        ))
    }
}

/// Upload protocol settings.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSettings {
    /// Slices in flight (before the vendor cap).
    pub concurrency: usize,
    /// Bounded finalize polling.
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    /// Operator slice preferences.
    pub slice: SliceOptions,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_attempts: 10,
            poll_interval: Duration::from_secs(1),
            slice: SliceOptions::default(),
        }
    }
}

impl UploadSettings {
    /// Apply `upload_concurrency`, `slice_size` and `low_bandwidth` from a
    /// mount config; missing or malformed keys leave the value unchanged.
    pub fn with_mount_overrides(mut self, config: &Value) -> Self {
        if let Some(n) = config.get("upload_concurrency").and_then(Value::as_u64) {
            self.concurrency = (n as usize).max(1);
        }
        if let Some(size) = config.get("slice_size").and_then(Value::as_u64) {
            self.slice.override_size = Some(size);
        }
        if let Some(low) = config.get("low_bandwidth").and_then(Value::as_bool) {
            self.slice.low_bandwidth = low;
        }
        self
    }
}

/// Result of a driver run.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub entry: FileEntry,
    /// Registered by the dedup probe without transfer.
    pub rapid: bool,
    /// Slices transferred.
    pub slices: usize,
}

/// Runs dedup probe, negotiation, bounded slice transfer and finalize.
pub struct UploadDriver<'a> {
    engine: &'a RequestEngine,
    auth: &'a dyn Authenticator,
    settings: &'a UploadSettings,
}

impl<'a> UploadDriver<'a> {
    pub fn new(
        engine: &'a RequestEngine,
        auth: &'a dyn Authenticator,
        settings: &'a UploadSettings,
    ) -> Self {
        Self {
            engine,
            auth,
            settings,
        }
    }

    /// Slices in flight for this vendor.
    pub fn concurrency(&self, uploader: &dyn ChunkedUpload) -> usize {
        let wanted = self.settings.concurrency.max(1);
        match uploader.max_concurrency() {
            Some(cap) => wanted.min(cap.max(1)),
            None => wanted,
        }
    }

    /// Upload `data` to `target`.
    ///
    /// # Errors
    /// - A slice exhausted its retry budget
    /// - Finalize polling exceeded `poll_attempts` (`Error::Timeout`)
    pub async fn run(
        &self,
        uploader: &dyn ChunkedUpload,
        target: &UploadTarget,
        data: Bytes,
    ) -> Result<UploadOutcome> {
        let digest = ContentDigest::compute(data.clone()).await?;
        let digest = &digest;

        // Phase 1: dedup probe
        let hit = self
            .engine
            .execute(self.auth, |c| async move {
                uploader.rapid_upload(&c, target, digest).await
            })
            .await?;
        if let Some(entry) = hit {
            info!("Rapid upload hit for {}", target.path);
            return Ok(UploadOutcome {
                entry,
                rapid: true,
                slices: 0,
            });
        }

        // Phase 2: session negotiation
        let policy = uploader.slice_policy();
        let slice_size = policy.negotiate(target.size, &self.settings.slice);
        let plan = SlicePlan::new(target.size, slice_size);
        let hashes = slice_hashes(data.clone(), &plan).await?;
        debug!(
            "Uploading {} as {} slices of {} bytes",
            target.path,
            plan.count(),
            slice_size
        );

        let plan_ref = &plan;
        let hashes_ref = &hashes;
        let upload_id = self
            .engine
            .execute(self.auth, |c| async move {
                uploader
                    .open_session(&c, target, digest, plan_ref, hashes_ref)
                    .await
            })
            .await?;

        let mut session = UploadSession::new(
            target.path.clone(),
            &plan,
            upload_id,
            digest.md5.clone(),
            digest.head_md5.clone(),
        );

        // Phase 3: bounded slice transfer
        let concurrency = self.concurrency(uploader);
        let receipts: Vec<SliceReceipt> = {
            let session_ref = &session;
            let work: Vec<(SliceRange, String)> = plan
                .slices
                .iter()
                .copied()
                .zip(hashes.iter().cloned())
                .collect();
            stream::iter(work)
                .map(|(slice, hash)| {
                    let body = data.slice(slice.offset as usize..slice.end() as usize);
                    async move {
                        let (slice, hash) = (&slice, hash.as_str());
                        self.engine
                            .execute(self.auth, |c| {
                                let body = body.clone();
                                async move {
                                    uploader
                                        .put_slice(&c, session_ref, slice, body, hash)
                                        .await
                                }
                            })
                            .await
                    }
                })
                .buffer_unordered(concurrency)
                .try_collect()
                .await?
        };
        for receipt in receipts {
            session.record(receipt);
        }
        if !session.is_complete() {
            return Err(Error::Vendor(format!(
                "Upload incomplete: {} of {} slices acknowledged",
                session.completed_count(),
                session.slice_count
            )));
        }

        // Phase 4: finalize
        let session_ref = &session;
        let finalized = self
            .engine
            .execute(self.auth, |c| async move {
                uploader.finalize(&c, session_ref).await
            })
            .await?;

        let entry = match finalized {
            Finalize::Done(entry) => entry,
            Finalize::Pending(ticket) => self.poll(uploader, session_ref, &ticket).await?,
        };

        info!("Uploaded {} ({} slices)", target.path, plan.count());
        Ok(UploadOutcome {
            entry,
            rapid: false,
            slices: plan.count(),
        })
    }

    async fn poll(
        &self,
        uploader: &dyn ChunkedUpload,
        session: &UploadSession,
        ticket: &str,
    ) -> Result<FileEntry> {
        for attempt in 1..=self.settings.poll_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;
            let ready = self
                .engine
                .execute(self.auth, |c| async move {
                    uploader.poll_finalize(&c, session, ticket).await
                })
                .await?;
            if let Some(entry) = ready {
                return Ok(entry);
            }
            debug!("Finalize still pending (attempt {})", attempt);
        }
        Err(Error::Timeout(format!(
            "Upload of {} not assembled after {} polls",
            session.target_path, self.settings.poll_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuth;
    use crate::request::RetryConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const MIB: u64 = 1024 * 1024;

    /// Records calls; optionally dedups, fails slices or stays pending.
    #[derive(Default)]
    struct FakeUploader {
        dedup: bool,
        pending_polls: Option<usize>,
        flaky_slice: Option<usize>,
        broken_slice: Option<usize>,
        cap: Option<usize>,
        puts: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        finalized_with: Mutex<Option<usize>>,
        polls: AtomicUsize,
        failures: AtomicUsize,
        broken_puts: AtomicUsize,
    }

    #[async_trait]
    impl ChunkedUpload for FakeUploader {
        fn slice_policy(&self) -> SlicePolicy {
            SlicePolicy::fixed(4 * MIB)
        }

        fn max_concurrency(&self) -> Option<usize> {
            self.cap
        }

        async fn rapid_upload(
            &self,
            _c: &str,
            target: &UploadTarget,
            _d: &ContentDigest,
        ) -> Result<Option<FileEntry>> {
            Ok(self
                .dedup
                .then(|| FileEntry::file(target.path.clone(), target.size)))
        }

        async fn open_session(
            &self,
            _c: &str,
            _t: &UploadTarget,
            _d: &ContentDigest,
            _p: &SlicePlan,
            _h: &[String],
        ) -> Result<String> {
            Ok("session-1".to_string())
        }

        async fn put_slice(
            &self,
            _c: &str,
            _s: &UploadSession,
            slice: &SliceRange,
            data: Bytes,
            hash: &str,
        ) -> Result<SliceReceipt> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.puts.fetch_add(1, Ordering::SeqCst);

            if self.flaky_slice == Some(slice.index)
                && self.failures.fetch_add(1, Ordering::SeqCst) == 0
            {
                return Err(Error::Network("reset".into()));
            }
            if self.broken_slice == Some(slice.index) {
                self.broken_puts.fetch_add(1, Ordering::SeqCst);
                return Err(Error::Network("connection refused".into()));
            }
            assert_eq!(data.len() as u64, slice.len);
            Ok(SliceReceipt {
                index: slice.index,
                token: hash.to_string(),
            })
        }

        async fn finalize(&self, _c: &str, session: &UploadSession) -> Result<Finalize> {
            assert!(session.is_complete());
            *self.finalized_with.lock().unwrap() = Some(session.completed_count());
            match self.pending_polls {
                Some(_) => Ok(Finalize::Pending("ticket".into())),
                None => Ok(Finalize::Done(FileEntry::file(
                    session.target_path.clone(),
                    session.total_size,
                ))),
            }
        }

        async fn poll_finalize(
            &self,
            _c: &str,
            session: &UploadSession,
            _ticket: &str,
        ) -> Result<Option<FileEntry>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.pending_polls {
                Some(ready_after) if n >= ready_after => Ok(Some(FileEntry::file(
                    session.target_path.clone(),
                    session.total_size,
                ))),
                _ => Ok(None),
            }
        }
    }

    fn engine() -> RequestEngine {
        RequestEngine::new(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    fn settings() -> UploadSettings {
        UploadSettings {
            poll_interval: Duration::from_millis(1),
            ..UploadSettings::default()
        }
    }

    fn target(size: u64) -> UploadTarget {
        UploadTarget::new(&DrivePath::parse("/docs").unwrap(), "big.bin", size).unwrap()
    }

    #[tokio::test]
    async fn test_fifty_mib_upload_finalizes_once_after_all_slices() {
        let uploader = FakeUploader::default();
        let engine = engine();
        let settings = settings();
        let driver = UploadDriver::new(&engine, &NoAuth, &settings);

        let data = Bytes::from(vec![0u8; (50 * MIB) as usize]);
        let outcome = driver.run(&uploader, &target(50 * MIB), data).await.unwrap();

        assert!(!outcome.rapid);
        assert_eq!(outcome.slices, 13);
        assert_eq!(uploader.puts.load(Ordering::SeqCst), 13);
        assert_eq!(*uploader.finalized_with.lock().unwrap(), Some(13));
        assert!(uploader.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(outcome.entry.path.to_string_path(), "/docs/big.bin");
    }

    #[tokio::test]
    async fn test_dedup_hit_transfers_no_slices() {
        let uploader = FakeUploader {
            dedup: true,
            ..Default::default()
        };
        let engine = engine();
        let settings = settings();
        let driver = UploadDriver::new(&engine, &NoAuth, &settings);

        let outcome = driver
            .run(&uploader, &target(10 * MIB), Bytes::from(vec![1u8; (10 * MIB) as usize]))
            .await
            .unwrap();

        assert!(outcome.rapid);
        assert_eq!(uploader.puts.load(Ordering::SeqCst), 0);
        assert!(uploader.finalized_with.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequential_vendor_caps_concurrency() {
        let uploader = FakeUploader {
            cap: Some(1),
            ..Default::default()
        };
        let engine = engine();
        let settings = settings();
        let driver = UploadDriver::new(&engine, &NoAuth, &settings);
        assert_eq!(driver.concurrency(&uploader), 1);

        driver
            .run(&uploader, &target(12 * MIB), Bytes::from(vec![0u8; (12 * MIB) as usize]))
            .await
            .unwrap();
        assert_eq!(uploader.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_slice_is_retried() {
        let uploader = FakeUploader {
            flaky_slice: Some(1),
            ..Default::default()
        };
        let engine = engine();
        let settings = settings();
        let driver = UploadDriver::new(&engine, &NoAuth, &settings);

        let outcome = driver
            .run(&uploader, &target(8 * MIB), Bytes::from(vec![0u8; (8 * MIB) as usize]))
            .await
            .unwrap();
        assert_eq!(outcome.slices, 2);
        assert_eq!(uploader.puts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_slice_fails_upload_without_finalize() {
        let uploader = FakeUploader {
            broken_slice: Some(1),
            cap: Some(1),
            ..Default::default()
        };
        let engine = engine();
        let settings = settings();
        let driver = UploadDriver::new(&engine, &NoAuth, &settings);

        let err = driver
            .run(&uploader, &target(12 * MIB), Bytes::from(vec![0u8; (12 * MIB) as usize]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert_eq!(uploader.broken_puts.load(Ordering::SeqCst), 3);
        assert!(uploader.finalized_with.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_payload_finalizes_without_slices() {
        let uploader = FakeUploader::default();
        let engine = engine();
        let settings = settings();
        let driver = UploadDriver::new(&engine, &NoAuth, &settings);

        let outcome = driver.run(&uploader, &target(0), Bytes::new()).await.unwrap();
        assert_eq!(outcome.slices, 0);
        assert_eq!(uploader.puts.load(Ordering::SeqCst), 0);
        assert_eq!(*uploader.finalized_with.lock().unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_poll_finalize_succeeds_within_budget() {
        let uploader = FakeUploader {
            pending_polls: Some(3),
            ..Default::default()
        };
        let engine = engine();
        let settings = settings();
        let driver = UploadDriver::new(&engine, &NoAuth, &settings);

        driver
            .run(&uploader, &target(MIB), Bytes::from(vec![0u8; MIB as usize]))
            .await
            .unwrap();
        assert_eq!(uploader.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_budget_exhausted_is_timeout() {
        let uploader = FakeUploader {
            pending_polls: Some(usize::MAX),
            ..Default::default()
        };
        let engine = engine();
        let settings = UploadSettings {
            poll_attempts: 2,
            ..settings()
        };
        let driver = UploadDriver::new(&engine, &NoAuth, &settings);

        let err = driver
            .run(&uploader, &target(MIB), Bytes::from(vec![0u8; MIB as usize]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(uploader.polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_mount_overrides() {
        let settings = UploadSettings::default().with_mount_overrides(&json!({
            "upload_concurrency": 5,
            "slice_size": 8388608,
            "low_bandwidth": true
        }));
        assert_eq!(settings.concurrency, 5);
        assert_eq!(settings.slice.override_size, Some(8 * MIB));
        assert!(settings.slice.low_bandwidth);

        let untouched = UploadSettings::default().with_mount_overrides(&json!({"upload_concurrency": "x"}));
        assert_eq!(untouched, UploadSettings::default());
    }
}
