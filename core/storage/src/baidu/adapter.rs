//! Baidu Netdisk adapter.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use unidrive_common::{decode_component, DrivePath, Error, Result, Secret};

use crate::adapter::{
    parse_config, AdapterContext, DriveAdapter, FileEntry, FileLink, FileTask, ListOrder,
    Listing, UploadPayload,
};
use crate::auth::{Authenticator, TokenManager};
use crate::lookup::IdCache;
use crate::request::RequestEngine;
use crate::state::StateCell;
use crate::upload::{
    ChunkedUpload, ContentDigest, Finalize, SlicePlan, SlicePolicy, SliceRange, SliceReceipt,
    slice_md5, UploadDriver, UploadSession, UploadSettings, UploadTarget, KIB_256, MIB,
};

use super::auth::BaiduRefresher;
use super::client::{split_remote, BaiduFile, ManagerOp, PanClient, DOWNLOAD_USER_AGENT};

/// Saved-state key holding the account tier.
pub const TIER_KEY: &str = "vip_type";

/// Baidu refuses more slices than this per file.
const MAX_SLICES: u64 = 1024;

/// `dlink` URLs stay valid for eight hours.
const DLINK_TTL_HOURS: i64 = 8;

/// Block list sent to precreate/create.
///
/// An empty file still carries one block: the MD5 of no bytes.
pub fn block_list(hashes: &[String]) -> Vec<String> {
    if hashes.is_empty() {
        vec![slice_md5(b"")]
    } else {
        hashes.to_vec()
    }
}

/// Largest slice for an account tier.
pub fn tier_slice_max(vip_type: u8) -> u64 {
    match vip_type {
        0 => 4 * MIB,
        1 => 16 * MIB,
        _ => 32 * MIB,
    }
}

/// Baidu Netdisk mount configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BaiduConfig {
    /// App key.
    pub client_id: String,
    /// Secret key.
    pub client_secret: Secret,
    #[serde(default)]
    pub refresh_token: Option<Secret>,
    /// Remote directory the mount is rooted at.
    #[serde(default = "default_root")]
    pub root_path: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub upload_base: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
}

fn default_root() -> String {
    "/".to_string()
}

/// Baidu Netdisk adapter.
///
/// Baidu addresses files by absolute path; `fs_id` is only needed for
/// download links.
pub struct BaiduAdapter {
    mount_path: DrivePath,
    root: String,
    order: ListOrder,
    client: PanClient,
    tokens: TokenManager,
    state: Arc<StateCell>,
    engine: RequestEngine,
    upload: UploadSettings,
    ids: Option<IdCache>,
}

impl BaiduAdapter {
    /// Create a new Baidu adapter.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - No saved tokens and no refresh token configured
    pub fn new(ctx: AdapterContext) -> Result<Self> {
        let config: BaiduConfig = parse_config(&ctx.config)?;
        let root = DrivePath::parse(&config.root_path)?;

        let state = Arc::new(StateCell::new(ctx.saved.clone()));
        let refresher = BaiduRefresher::new(
            ctx.http.clone(),
            &config.client_id,
            &config.client_secret,
            config.token_url.as_deref(),
        );
        let tokens =
            TokenManager::from_state(Box::new(refresher), state.clone(), config.refresh_token)?;
        let client = PanClient::new(
            ctx.http.clone(),
            config.api_base.as_deref(),
            config.upload_base.as_deref(),
        );

        Ok(Self {
            mount_path: ctx.mount_path,
            root: root.to_string_path(),
            order: ListOrder::from_config(&ctx.config),
            client,
            tokens,
            state,
            engine: ctx.engine,
            upload: ctx.upload,
            ids: ctx.ids,
        })
    }

    fn auth(&self) -> &dyn Authenticator {
        &self.tokens
    }

    /// Absolute Baidu path for a drive path.
    fn remote_path(&self, path: &DrivePath) -> String {
        let mut remote = self.root.trim_end_matches('/').to_string();
        for component in path.components() {
            remote.push('/');
            remote.push_str(&decode_component(component));
        }
        if remote.is_empty() {
            remote.push('/');
        }
        remote
    }

    fn tier(&self) -> u8 {
        match self.state.get::<u8>(TIER_KEY) {
            Ok(tier) => tier.unwrap_or(0),
            Err(e) => {
                warn!("Ignoring unreadable account tier: {}", e);
                0
            }
        }
    }

    /// Metadata for a non-root path from its parent's listing.
    async fn stat(&self, path: &DrivePath) -> Result<BaiduFile> {
        let remote = self.remote_path(path);
        let (dir, name) = split_remote(&remote);
        let client = &self.client;
        let found = self
            .engine
            .execute(self.auth(), |c| async move { client.find_child(&c, dir, name).await })
            .await?;
        found.ok_or_else(|| Error::NotFound(format!("No such entry: {}", path)))
    }

    async fn manage(&self, op: ManagerOp, filelist: Value) -> Result<Option<u64>> {
        let client = &self.client;
        let filelist = &filelist;
        let reply = self
            .engine
            .execute(self.auth(), |c| async move {
                client.filemanager(&c, op, filelist).await
            })
            .await?;
        Ok(reply.taskid.filter(|id| *id != 0))
    }

    fn forget_ids(&self, path: &DrivePath) {
        if let Some(ids) = &self.ids {
            ids.invalidate(&self.mount_path, path);
        }
    }

    /// Copy or move `from` to the full destination path `to`.
    async fn transfer(&self, op: ManagerOp, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        if to.starts_with(from) {
            return Err(Error::Validation(format!("Cannot place {} inside itself", from)));
        }
        let source = self.remote_path(from);
        let target = self.remote_path(to);
        let (dest, new_name) = split_remote(&target);
        let filelist = json!([{
            "path": source,
            "dest": dest,
            "newname": new_name,
            "ondup": "fail",
        }]);

        let task = self.manage(op, filelist).await?;
        if op == ManagerOp::Move {
            self.forget_ids(from);
        }
        match task {
            Some(id) => Ok(FileTask::in_progress(id.to_string())),
            None => Ok(FileTask::done(Some(self.stat(to).await?.to_entry(to.clone())))),
        }
    }
}

#[async_trait]
impl ChunkedUpload for BaiduAdapter {
    fn slice_policy(&self) -> SlicePolicy {
        SlicePolicy {
            vendor_min: 4 * MIB,
            tier_max: tier_slice_max(self.tier()),
            max_slices: MAX_SLICES,
            granularity: MIB,
        }
    }

    async fn rapid_upload(
        &self,
        credential: &str,
        target: &UploadTarget,
        digest: &ContentDigest,
    ) -> Result<Option<FileEntry>> {
        // slice-md5 needs a full first block
        if target.size < KIB_256 {
            return Ok(None);
        }
        let remote = self.remote_path(&target.path);
        let hit = self
            .client
            .rapid_upload(credential, &remote, target.size, &digest.md5, &digest.head_md5)
            .await?;
        Ok(hit.map(|file| file.to_entry(target.path.clone())))
    }

    async fn open_session(
        &self,
        credential: &str,
        target: &UploadTarget,
        digest: &ContentDigest,
        _plan: &SlicePlan,
        slice_hashes: &[String],
    ) -> Result<String> {
        let remote = self.remote_path(&target.path);
        self.client
            .precreate(
                credential,
                &remote,
                target.size,
                &block_list(slice_hashes),
                &digest.md5,
                &digest.head_md5,
            )
            .await
    }

    async fn put_slice(
        &self,
        credential: &str,
        session: &UploadSession,
        slice: &SliceRange,
        data: Bytes,
        hash: &str,
    ) -> Result<SliceReceipt> {
        let remote = self.remote_path(&session.target_path);
        let md5 = self
            .client
            .upload_slice(credential, &remote, &session.upload_id, slice.index, data)
            .await?;
        if md5 != hash {
            // Corrupted in transit; resend
            return Err(Error::Network(format!(
                "Slice {} digest mismatch: sent {}, stored {}",
                slice.index, hash, md5
            )));
        }
        Ok(SliceReceipt {
            index: slice.index,
            token: md5,
        })
    }

    async fn finalize(&self, credential: &str, session: &UploadSession) -> Result<Finalize> {
        let remote = self.remote_path(&session.target_path);
        let blocks: Vec<String> = session
            .ordered_receipts()
            .into_iter()
            .map(|r| r.token.clone())
            .collect();
        let blocks = block_list(&blocks);
        let file = self
            .client
            .create_file(
                credential,
                &remote,
                session.total_size,
                &session.upload_id,
                &blocks,
            )
            .await?;
        Ok(Finalize::Done(file.to_entry(session.target_path.clone())))
    }
}

#[async_trait]
impl DriveAdapter for BaiduAdapter {
    fn kind(&self) -> &str {
        "baidu"
    }

    fn state(&self) -> &StateCell {
        &self.state
    }

    async fn init_self(&self) -> Result<()> {
        self.tokens.ensure_fresh().await?;
        let client = &self.client;
        let user = self
            .engine
            .execute(self.auth(), |c| async move { client.uinfo(&c).await })
            .await?;
        info!(
            "Baidu account {} at tier {}",
            user.baidu_name.as_deref().unwrap_or("?"),
            user.vip_type
        );
        self.state.set(TIER_KEY, &user.vip_type)?;
        Ok(())
    }

    async fn load_self(&self) -> Result<()> {
        self.tokens.ensure_fresh().await
    }

    async fn list_file(&self, path: &DrivePath) -> Result<Listing> {
        let remote = self.remote_path(path);
        let client = &self.client;
        let order = &self.order;
        let dir = remote.as_str();
        let files = self
            .engine
            .execute(self.auth(), |c| async move { client.list(&c, dir, order).await })
            .await?;

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            match path.join(&file.name().replace('/', "%2F")) {
                Ok(child) => entries.push(file.to_entry(child)),
                Err(e) => warn!("Skipping entry {:?}: {}", file.name(), e),
            }
        }
        self.order.apply(&mut entries);
        Ok(Listing::new(entries))
    }

    async fn down_file(&self, path: &DrivePath) -> Result<Vec<FileLink>> {
        if path.is_root() {
            return Err(Error::Validation("Cannot link a folder: /".to_string()));
        }
        let file = self.stat(path).await?;
        if file.is_folder() {
            return Err(Error::Validation(format!("Cannot link a folder: {}", path)));
        }

        let client = &self.client;
        let ids = [file.fs_id];
        let ids = &ids[..];
        let metas = self
            .engine
            .execute(self.auth(), |c| async move { client.filemetas(&c, ids).await })
            .await?;
        let dlink = metas
            .into_iter()
            .find(|m| m.fs_id == file.fs_id)
            .and_then(|m| m.dlink)
            .ok_or_else(|| Error::Vendor(format!("No download link for {}", path)))?;

        let credential = self.tokens.credential().await?;
        let mut link = FileLink::new(format!("{}&access_token={}", dlink, credential))
            .with_header("User-Agent", DOWNLOAD_USER_AGENT);
        link.expires_at = Some(Utc::now() + Duration::hours(DLINK_TTL_HOURS));
        Ok(vec![link])
    }

    async fn copy_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        self.transfer(ManagerOp::Copy, from, to).await
    }

    async fn move_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        if from.is_root() {
            return Err(Error::Validation("The root cannot be moved".to_string()));
        }
        self.transfer(ManagerOp::Move, from, to).await
    }

    async fn kill_file(&self, path: &DrivePath) -> Result<FileTask> {
        if path.is_root() {
            return Err(Error::Validation("The root cannot be removed".to_string()));
        }
        let task = self
            .manage(ManagerOp::Delete, json!([self.remote_path(path)]))
            .await?;
        self.forget_ids(path);
        Ok(match task {
            Some(id) => FileTask::in_progress(id.to_string()),
            None => FileTask::done(None),
        })
    }

    async fn make_file(&self, path: &DrivePath, _options: &Value) -> Result<FileTask> {
        if path.is_root() {
            return Err(Error::AlreadyExists("The root already exists".to_string()));
        }
        let remote = self.remote_path(path);
        let client = &self.client;
        let remote = remote.as_str();
        let folder = self
            .engine
            .execute(self.auth(), |c| async move { client.create_dir(&c, remote).await })
            .await?;
        Ok(FileTask::done(Some(folder.to_entry(path.clone()))))
    }

    async fn push_file(&self, dir: &DrivePath, payload: UploadPayload) -> Result<FileTask> {
        let target = UploadTarget::new(dir, &payload.name, payload.data.len() as u64)?;
        debug!("Uploading {} to {}", target.path, self.remote_path(&target.path));
        let driver = UploadDriver::new(&self.engine, self.auth(), &self.upload);
        let outcome = driver.run(self, &target, payload.data).await?;
        Ok(FileTask::done(Some(outcome.entry)))
    }

    async fn find_id(&self, path: &DrivePath) -> Result<Option<String>> {
        if path.is_root() {
            return Ok(Some(self.root.clone()));
        }
        if let Some(id) = self.ids.as_ref().and_then(|ids| ids.get(&self.mount_path, path)) {
            return Ok(Some(id));
        }
        // Path-addressed: one parent listing answers the lookup
        let id = match self.stat(path).await {
            Ok(file) => file.fs_id.to_string(),
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if let Some(ids) = &self.ids {
            ids.insert(&self.mount_path, path, &id);
        }
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Tokens, TOKENS_KEY};
    use crate::upload::SliceOptions;

    fn ctx(config: Value, saved: Value) -> AdapterContext {
        AdapterContext::new(DrivePath::parse("/pan").unwrap(), config, saved)
    }

    fn config() -> Value {
        json!({
            "client_id": "ak",
            "client_secret": "sk",
            "refresh_token": "rt",
            "root_path": "/apps/unidrive",
        })
    }

    fn adapter(saved: Value) -> BaiduAdapter {
        BaiduAdapter::new(ctx(config(), saved)).unwrap()
    }

    #[test]
    fn test_empty_file_sends_one_block() {
        assert_eq!(block_list(&[]), vec!["d41d8cd98f00b204e9800998ecf8427e".to_string()]);

        let hashes = vec!["a".repeat(32), "b".repeat(32)];
        assert_eq!(block_list(&hashes), hashes);
    }

    #[test]
    fn test_remote_path_mapping() {
        let drive = adapter(json!({}));
        assert_eq!(drive.remote_path(&DrivePath::root()), "/apps/unidrive");
        assert_eq!(
            drive.remote_path(&DrivePath::parse("/docs/my%20file.txt").unwrap()),
            "/apps/unidrive/docs/my file.txt"
        );

        let at_root = BaiduAdapter::new(ctx(
            json!({"client_id": "ak", "client_secret": "sk", "refresh_token": "rt"}),
            json!({}),
        ))
        .unwrap();
        assert_eq!(at_root.remote_path(&DrivePath::root()), "/");
        assert_eq!(at_root.remote_path(&DrivePath::parse("/a").unwrap()), "/a");
    }

    #[test]
    fn test_tier_limits() {
        assert_eq!(tier_slice_max(0), 4 * MIB);
        assert_eq!(tier_slice_max(1), 16 * MIB);
        assert_eq!(tier_slice_max(2), 32 * MIB);
    }

    #[test]
    fn test_slice_policy_follows_saved_tier() {
        let normal = adapter(json!({}));
        assert_eq!(normal.slice_policy().tier_max, 4 * MIB);

        let svip = adapter(json!({ TIER_KEY: 2 }));
        let policy = svip.slice_policy();
        assert_eq!(policy.tier_max, 32 * MIB);
        assert_eq!(policy.max_slices, MAX_SLICES);

        // Out of range override clamps to the tier maximum
        let options = SliceOptions {
            override_size: Some(64 * MIB),
            low_bandwidth: false,
        };
        assert_eq!(policy.negotiate(100 * MIB, &options), 32 * MIB);
    }

    #[test]
    fn test_large_file_grows_slices_under_ceiling() {
        let drive = adapter(json!({ TIER_KEY: 2 }));
        let options = SliceOptions {
            override_size: None,
            low_bandwidth: true,
        };
        // 8 GiB over 1024 slices needs 8 MiB slices
        let size = drive.slice_policy().negotiate(8 * 1024 * MIB, &options);
        assert_eq!(size, 8 * MIB);
    }

    #[tokio::test]
    async fn test_saved_tokens_used_without_refresh() {
        let tokens = Tokens::issued_now(
            Secret::new("access"),
            Secret::new("refresh"),
            Duration::days(30),
        );
        let drive = adapter(json!({ TOKENS_KEY: tokens }));
        drive.load_self().await.unwrap();
        assert_eq!(drive.tokens.credential().await.unwrap(), "access");
        assert!(!drive.state().is_changed());
    }

    #[tokio::test]
    async fn test_root_guards() {
        let drive = adapter(json!({}));
        assert!(matches!(
            drive.kill_file(&DrivePath::root()).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            drive.move_file(&DrivePath::root(), &DrivePath::parse("/x").unwrap()).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(
            drive.find_id(&DrivePath::root()).await.unwrap().as_deref(),
            Some("/apps/unidrive")
        );
    }
}
