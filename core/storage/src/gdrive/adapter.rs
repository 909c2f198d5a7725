//! Google Drive adapter.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use unidrive_common::{decode_component, DrivePath, Error, Result, Secret};

use crate::adapter::{
    parse_config, AdapterContext, DriveAdapter, FileLink, FileTask, ListOrder,
    Listing, UploadPayload,
};
use crate::auth::{Authenticator, TokenManager};
use crate::lookup::{self, IdCache, PathQuery};
use crate::request::RequestEngine;
use crate::state::StateCell;
use crate::upload::{
    ChunkedUpload, ContentDigest, Finalize, SlicePlan, SlicePolicy, SliceRange, SliceReceipt,
    UploadDriver, UploadSession, UploadSettings, UploadTarget, KIB_256, MIB,
};

use super::auth::GoogleRefresher;
use super::client::{DriveClient, DriveFile};

/// Payloads up to this size use a single multipart request.
const SIMPLE_UPLOAD_LIMIT: u64 = 5 * MIB;

/// Google Drive mount configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GDriveConfig {
    pub client_id: String,
    pub client_secret: Secret,
    /// Initial refresh token; later rotations live in the saved state.
    #[serde(default)]
    pub refresh_token: Option<Secret>,
    /// Folder id the mount is rooted at.
    #[serde(default = "default_root")]
    pub root_folder_id: String,
    /// Upper bound for resumable chunks.
    #[serde(default = "default_chunk_max")]
    pub chunk_size_max: u64,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub upload_base: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
}

fn default_root() -> String {
    "root".to_string()
}

fn default_chunk_max() -> u64 {
    8 * MIB
}

/// Encode a vendor name as a path component.
fn child_path(dir: &DrivePath, name: &str) -> Result<DrivePath> {
    dir.join(&name.replace('/', "%2F"))
}

/// Google Drive adapter.
pub struct GDriveAdapter {
    mount_path: DrivePath,
    config: GDriveConfig,
    order: ListOrder,
    client: DriveClient,
    tokens: TokenManager,
    state: Arc<StateCell>,
    engine: RequestEngine,
    upload: UploadSettings,
    ids: Option<IdCache>,
}

impl GDriveAdapter {
    /// Create a new Google Drive adapter.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - No saved tokens and no refresh token configured
    pub fn new(ctx: AdapterContext) -> Result<Self> {
        let config: GDriveConfig = parse_config(&ctx.config)?;
        let state = Arc::new(StateCell::new(ctx.saved.clone()));
        let refresher = GoogleRefresher::new(
            &config.client_id,
            &config.client_secret,
            config.token_url.as_deref(),
        )?;
        let tokens = TokenManager::from_state(
            Box::new(refresher),
            state.clone(),
            config.refresh_token.clone(),
        )?;
        let client = DriveClient::new(
            ctx.http.clone(),
            config.api_base.as_deref(),
            config.upload_base.as_deref(),
        );

        Ok(Self {
            mount_path: ctx.mount_path,
            order: ListOrder::from_config(&ctx.config),
            config,
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

    async fn require_id(&self, path: &DrivePath) -> Result<String> {
        self.find_id(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No such entry: {}", path)))
    }

    async fn fetch(&self, id: &str) -> Result<DriveFile> {
        let client = &self.client;
        self.engine
            .execute(self.auth(), |c| async move { client.get_file(&c, id).await })
            .await
    }

    fn forget_ids(&self, path: &DrivePath) {
        if let Some(ids) = &self.ids {
            ids.invalidate(&self.mount_path, path);
        }
    }

    fn destination(to: &DrivePath) -> Result<(DrivePath, String)> {
        let parent = to
            .parent()
            .ok_or_else(|| Error::Validation("Destination cannot be the root".to_string()))?;
        let name = to
            .name()
            .map(decode_component)
            .ok_or_else(|| Error::Validation("Destination has no name".to_string()))?;
        Ok((parent, name))
    }
}

#[async_trait]
impl PathQuery for GDriveAdapter {
    async fn root_id(&self) -> Result<String> {
        Ok(self.config.root_folder_id.clone())
    }

    async fn child_id(&self, parent_id: &str, name: &str) -> Result<Option<String>> {
        let client = &self.client;
        let wanted = decode_component(name);
        let wanted = wanted.as_str();
        let found = self
            .engine
            .execute(self.auth(), |c| async move {
                client.find_child(&c, parent_id, wanted).await
            })
            .await?;
        Ok(found.map(|f| f.id))
    }
}

/// Resumable session upload into a resolved parent folder.
struct ResumableUpload<'a> {
    adapter: &'a GDriveAdapter,
    parent_id: String,
}

#[async_trait]
impl ChunkedUpload for ResumableUpload<'_> {
    fn slice_policy(&self) -> SlicePolicy {
        SlicePolicy {
            vendor_min: KIB_256,
            tier_max: self.adapter.config.chunk_size_max.max(KIB_256),
            max_slices: u64::MAX,
            granularity: KIB_256,
        }
    }

    fn max_concurrency(&self) -> Option<usize> {
        // Resumable sessions accept bytes strictly in order
        Some(1)
    }

    async fn open_session(
        &self,
        credential: &str,
        target: &UploadTarget,
        _digest: &ContentDigest,
        _plan: &SlicePlan,
        _slice_hashes: &[String],
    ) -> Result<String> {
        self.adapter
            .client
            .start_resumable(credential, &target.name, &self.parent_id, target.size)
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
        self.adapter
            .client
            .upload_chunk(
                credential,
                &session.upload_id,
                data,
                slice.offset,
                session.total_size,
            )
            .await?;
        Ok(SliceReceipt {
            index: slice.index,
            token: hash.to_string(),
        })
    }

    async fn finalize(&self, credential: &str, session: &UploadSession) -> Result<Finalize> {
        let file = self
            .adapter
            .client
            .upload_status(credential, &session.upload_id, session.total_size)
            .await?
            .ok_or_else(|| Error::Vendor("Drive reports the upload incomplete".to_string()))?;
        Ok(Finalize::Done(file.to_entry(session.target_path.clone())))
    }
}

#[async_trait]
impl DriveAdapter for GDriveAdapter {
    fn kind(&self) -> &str {
        "gdrive"
    }

    fn state(&self) -> &StateCell {
        &self.state
    }

    async fn init_self(&self) -> Result<()> {
        self.tokens.ensure_fresh().await?;
        let client = &self.client;
        let about = self
            .engine
            .execute(self.auth(), |c| async move { client.about(&c).await })
            .await?;
        if let Some(email) = about.user.email_address {
            self.state.set("account", &email)?;
        }
        Ok(())
    }

    async fn load_self(&self) -> Result<()> {
        self.tokens.ensure_fresh().await
    }

    async fn list_file(&self, path: &DrivePath) -> Result<Listing> {
        let folder_id = self.require_id(path).await?;
        let client = &self.client;
        let order = &self.order;
        let folder_id = folder_id.as_str();
        let files = self
            .engine
            .execute(self.auth(), |c| async move {
                client.list_folder(&c, folder_id, order).await
            })
            .await?;

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            match child_path(path, &file.name) {
                Ok(child) => entries.push(file.to_entry(child)),
                Err(e) => warn!("Skipping entry {:?}: {}", file.name, e),
            }
        }
        self.order.apply(&mut entries);
        Ok(Listing::new(entries))
    }

    async fn down_file(&self, path: &DrivePath) -> Result<Vec<FileLink>> {
        let id = self.require_id(path).await?;
        let file = self.fetch(&id).await?;
        if file.is_folder() {
            return Err(Error::Validation(format!("Cannot link a folder: {}", path)));
        }
        let credential = self.tokens.credential().await?;
        let mut link = FileLink::new(self.client.media_url(&id))
            .with_header("Authorization", format!("Bearer {}", credential));
        link.expires_at = Some(self.tokens.tokens().await.expires_at);
        Ok(vec![link])
    }

    async fn copy_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        let id = self.require_id(from).await?;
        let source = self.fetch(&id).await?;
        if source.is_folder() {
            return Err(Error::Unsupported(
                "Google Drive cannot copy folders".to_string(),
            ));
        }
        let (parent, name) = Self::destination(to)?;
        let parent_id = self.require_id(&parent).await?;

        let client = &self.client;
        let (id, name, parent_id) = (id.as_str(), name.as_str(), parent_id.as_str());
        let copied = self
            .engine
            .execute(self.auth(), |c| async move {
                client.copy_file(&c, id, name, parent_id).await
            })
            .await?;
        Ok(FileTask::done(Some(copied.to_entry(to.clone()))))
    }

    async fn move_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        if from.is_root() {
            return Err(Error::Validation("The root cannot be moved".to_string()));
        }
        let id = self.require_id(from).await?;
        let source = self.fetch(&id).await?;
        let (parent, name) = Self::destination(to)?;

        let new_parent = if Some(&parent) == from.parent().as_ref() {
            None
        } else {
            Some(self.require_id(&parent).await?)
        };
        let new_name = (name != source.name).then_some(name);

        let client = &self.client;
        let id = id.as_str();
        let new_name = new_name.as_deref();
        let new_parent = new_parent.as_deref();
        let parents = source.parents.as_slice();
        let moved = self
            .engine
            .execute(self.auth(), |c| async move {
                client
                    .move_file(&c, id, new_name, new_parent, parents)
                    .await
            })
            .await?;

        self.forget_ids(from);
        Ok(FileTask::done(Some(moved.to_entry(to.clone()))))
    }

    async fn kill_file(&self, path: &DrivePath) -> Result<FileTask> {
        if path.is_root() {
            return Err(Error::Validation("The root cannot be removed".to_string()));
        }
        let id = self.require_id(path).await?;
        let client = &self.client;
        let id = id.as_str();
        self.engine
            .execute(self.auth(), |c| async move { client.delete(&c, id).await })
            .await?;
        self.forget_ids(path);
        Ok(FileTask::done(None))
    }

    async fn make_file(&self, path: &DrivePath, _options: &Value) -> Result<FileTask> {
        let (parent, name) = Self::destination(path)?;
        let parent_id = self.require_id(&parent).await?;
        if self.child_id(&parent_id, &name).await?.is_some() {
            return Err(Error::AlreadyExists(format!("{} already exists", path)));
        }

        let client = &self.client;
        let (name, parent_id) = (name.as_str(), parent_id.as_str());
        let folder = self
            .engine
            .execute(self.auth(), |c| async move {
                client.create_folder(&c, name, parent_id).await
            })
            .await?;
        Ok(FileTask::done(Some(folder.to_entry(path.clone()))))
    }

    async fn push_file(&self, dir: &DrivePath, payload: UploadPayload) -> Result<FileTask> {
        let parent_id = self.require_id(dir).await?;
        let target = UploadTarget::new(dir, &payload.name, payload.data.len() as u64)?;

        if target.size <= SIMPLE_UPLOAD_LIMIT {
            debug!("Simple upload of {} ({} bytes)", target.path, target.size);
            let client = &self.client;
            let data = payload.data.as_ref();
            let (name, parent) = (target.name.as_str(), parent_id.as_str());
            let file = self
                .engine
                .execute(self.auth(), |c| async move {
                    client.upload_simple(&c, name, parent, data).await
                })
                .await?;
            return Ok(FileTask::done(Some(file.to_entry(target.path))));
        }

        let uploader = ResumableUpload {
            adapter: self,
            parent_id,
        };
        let driver = UploadDriver::new(&self.engine, self.auth(), &self.upload);
        let outcome = driver.run(&uploader, &target, payload.data).await?;
        Ok(FileTask::done(Some(outcome.entry)))
    }

    async fn find_id(&self, path: &DrivePath) -> Result<Option<String>> {
        lookup::find_id(self, &self.mount_path, path, self.ids.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Tokens, TOKENS_KEY};
    use chrono::Duration;
    use serde_json::json;

    fn config() -> Value {
        json!({
            "client_id": "cid",
            "client_secret": "csecret",
            "refresh_token": "rtoken",
        })
    }

    #[test]
    fn test_config_defaults() {
        let config: GDriveConfig = parse_config(&config()).unwrap();
        assert_eq!(config.root_folder_id, "root");
        assert_eq!(config.chunk_size_max, 8 * MIB);
        assert_eq!(config.refresh_token.unwrap().expose(), "rtoken");
    }

    #[test]
    fn test_missing_client_id_is_validation_error() {
        let ctx = AdapterContext::new(DrivePath::root(), json!({"client_secret": "x"}), json!({}));
        assert!(matches!(GDriveAdapter::new(ctx), Err(Error::Validation(_))));
    }

    #[test]
    fn test_requires_some_refresh_token() {
        let ctx = AdapterContext::new(
            DrivePath::root(),
            json!({"client_id": "cid", "client_secret": "s"}),
            json!({}),
        );
        assert!(GDriveAdapter::new(ctx).is_err());
    }

    #[tokio::test]
    async fn test_saved_tokens_take_precedence() {
        let tokens = Tokens::issued_now(Secret::new("saved-access"), Secret::new("saved-refresh"), Duration::hours(1));
        let saved = json!({ TOKENS_KEY: tokens });
        let ctx = AdapterContext::new(DrivePath::parse("/g").unwrap(), config(), saved);
        let adapter = GDriveAdapter::new(ctx).unwrap();

        assert_eq!(adapter.tokens.credential().await.unwrap(), "saved-access");
        adapter.load_self().await.unwrap();
        assert!(!adapter.state().is_changed());
    }

    #[test]
    fn test_resumable_slice_policy() {
        let ctx = AdapterContext::new(DrivePath::root(), config(), json!({}));
        let adapter = GDriveAdapter::new(ctx).unwrap();
        let uploader = ResumableUpload {
            adapter: &adapter,
            parent_id: "root".into(),
        };
        let policy = uploader.slice_policy();
        assert_eq!(policy.granularity, KIB_256);
        assert_eq!(uploader.max_concurrency(), Some(1));

        // Overrides are rounded up to the 256 KiB granularity
        let options = crate::upload::SliceOptions {
            override_size: Some(MIB + 1),
            low_bandwidth: false,
        };
        assert_eq!(policy.negotiate(100 * MIB, &options), MIB + KIB_256);
    }

    #[test]
    fn test_destination_decodes_name() {
        let (parent, name) = GDriveAdapter::destination(&DrivePath::parse("/a/my%20file").unwrap()).unwrap();
        assert_eq!(parent.to_string_path(), "/a");
        assert_eq!(name, "my file");
        assert!(GDriveAdapter::destination(&DrivePath::root()).is_err());
    }

    #[test]
    fn test_child_path_encodes_separator() {
        let path = child_path(&DrivePath::root(), "a/b").unwrap();
        assert_eq!(path.to_string_path(), "/a%2Fb");
    }
}
