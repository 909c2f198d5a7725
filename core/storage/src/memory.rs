//! In-memory drive for testing and demos.
//!
//! Volumes live for the lifetime of the process and are shared by every
//! adapter instance built for the same namespace, so state survives the
//! per-request adapter lifecycle. The adapter implements the complete
//! chunked upload protocol, including rapid upload by content MD5 and
//! poll-style finalize, and can optionally require a bearer credential
//! that the volume can revoke.

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

use unidrive_common::{decode_component, DrivePath, Error, Result, Secret};

use crate::adapter::{
    parse_config, AdapterContext, DriveAdapter, FileEntry, FileHash, FileLink, FileTask,
    ListOrder, Listing, UploadPayload,
};
use crate::auth::{Authenticator, NoAuth, TokenManager, TokenRefresher, Tokens};
use crate::lookup::{self, IdCache, PathQuery};
use crate::request::RequestEngine;
use crate::state::StateCell;
use crate::upload::{
    slice_md5, ChunkedUpload, ContentDigest, Finalize, SlicePlan, SlicePolicy, SliceRange,
    SliceReceipt, UploadDriver, UploadSession, UploadSettings, UploadTarget, KIB_256, MIB,
};

/// How the memory drive completes an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeMode {
    #[default]
    Sync,
    Poll,
}

/// Memory drive configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Volume name; defaults to the mount path.
    pub namespace: Option<String>,
    /// Require a bearer credential minted by the volume.
    pub auth: bool,
    pub token_ttl_secs: i64,
    /// Payloads up to this size are written in one call.
    pub inline_threshold: u64,
    pub slice_min: u64,
    pub slice_max: u64,
    pub max_slices: u64,
    pub max_concurrency: Option<usize>,
    pub rapid_upload: bool,
    pub finalize_mode: FinalizeMode,
    /// Polls answered "pending" before a polled upload completes.
    pub poll_rounds: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            auth: false,
            token_ttl_secs: 3600,
            inline_threshold: KIB_256,
            slice_min: KIB_256,
            slice_max: 4 * MIB,
            max_slices: 1024,
            max_concurrency: None,
            rapid_upload: true,
            finalize_mode: FinalizeMode::Sync,
            poll_rounds: 2,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    File {
        id: String,
        data: Bytes,
        md5: String,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    },
    Folder {
        id: String,
        created: DateTime<Utc>,
    },
}

impl Node {
    fn folder() -> Self {
        Node::Folder {
            id: Uuid::new_v4().to_string(),
            created: Utc::now(),
        }
    }

    fn file(data: Bytes) -> Self {
        let now = Utc::now();
        Node::File {
            id: Uuid::new_v4().to_string(),
            md5: slice_md5(&data),
            data,
            created: now,
            modified: now,
        }
    }

    fn id(&self) -> &str {
        match self {
            Node::File { id, .. } | Node::Folder { id, .. } => id,
        }
    }

    fn is_folder(&self) -> bool {
        matches!(self, Node::Folder { .. })
    }

    /// Same content under a fresh id.
    fn duplicate(&self) -> Self {
        let mut node = self.clone();
        match &mut node {
            Node::File { id, .. } | Node::Folder { id, .. } => *id = Uuid::new_v4().to_string(),
        }
        node
    }

    fn entry(&self, path: &DrivePath) -> FileEntry {
        match self {
            Node::File {
                id,
                data,
                md5,
                created,
                modified,
            } => FileEntry::file(path.clone(), data.len() as u64)
                .with_remote_id(id.clone())
                .with_hash(FileHash {
                    md5: Some(md5.clone()),
                    ..Default::default()
                })
                .with_times(Some(*created), Some(*modified)),
            Node::Folder { id, created } => FileEntry::folder(path.clone())
                .with_remote_id(id.clone())
                .with_times(Some(*created), Some(*created)),
        }
    }
}

struct PendingFile {
    path: DrivePath,
    data: Bytes,
    polls_left: u32,
}

/// Call counters for one volume.
#[derive(Debug, Default)]
pub struct MemoryStats {
    put_slices: AtomicUsize,
    finalize_calls: AtomicUsize,
    rapid_hits: AtomicUsize,
    refreshes: AtomicUsize,
}

impl MemoryStats {
    pub fn put_slices(&self) -> usize {
        self.put_slices.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    pub fn rapid_hits(&self) -> usize {
        self.rapid_hits.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

/// One in-memory file tree.
pub struct MemoryVolume {
    nodes: RwLock<BTreeMap<DrivePath, Node>>,
    sessions: Mutex<HashMap<String, BTreeMap<usize, Bytes>>>,
    pending: Mutex<HashMap<String, PendingFile>>,
    tokens: Mutex<HashSet<String>>,
    stats: MemoryStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryVolume {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(DrivePath::root(), Node::folder());
        Self {
            nodes: RwLock::new(nodes),
            sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashSet::new()),
            stats: MemoryStats::default(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<DrivePath, Node>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<DrivePath, Node>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Call counters.
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Invalidate every credential issued so far.
    pub fn revoke_credentials(&self) {
        lock(&self.tokens).clear();
    }

    fn mint(&self, refresh_token: &Secret, ttl: ChronoDuration) -> Tokens {
        let access = format!("mem-{}", Uuid::new_v4());
        lock(&self.tokens).insert(access.clone());
        self.stats.refreshes.fetch_add(1, Ordering::SeqCst);
        Tokens::issued_now(Secret::new(access), refresh_token.clone(), ttl)
    }

    fn authorize(&self, credential: &str) -> Result<()> {
        if lock(&self.tokens).contains(credential) {
            Ok(())
        } else {
            Err(Error::Auth("Unknown or revoked credential".to_string()))
        }
    }

    fn node(&self, path: &DrivePath) -> Result<Node> {
        self.read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No such entry: {}", path)))
    }

    fn require_folder(nodes: &BTreeMap<DrivePath, Node>, path: &DrivePath) -> Result<()> {
        match nodes.get(path) {
            Some(node) if node.is_folder() => Ok(()),
            Some(_) => Err(Error::Validation(format!("Not a folder: {}", path))),
            None => Err(Error::NotFound(format!("No such folder: {}", path))),
        }
    }

    fn require_parent(nodes: &BTreeMap<DrivePath, Node>, path: &DrivePath) -> Result<()> {
        match path.parent() {
            Some(parent) => Self::require_folder(nodes, &parent),
            None => Err(Error::Validation("The root cannot be replaced".to_string())),
        }
    }

    fn children(&self, path: &DrivePath) -> Result<Vec<FileEntry>> {
        let nodes = self.read();
        Self::require_folder(&nodes, path)?;
        Ok(nodes
            .iter()
            .filter(|(key, _)| key.depth() == path.depth() + 1 && key.starts_with(path))
            .map(|(key, node)| node.entry(key))
            .collect())
    }

    fn create_folder(&self, path: &DrivePath) -> Result<FileEntry> {
        let mut nodes = self.write();
        Self::require_parent(&nodes, path)?;
        if nodes.contains_key(path) {
            return Err(Error::AlreadyExists(format!("{} already exists", path)));
        }
        let node = Node::folder();
        let entry = node.entry(path);
        nodes.insert(path.clone(), node);
        Ok(entry)
    }

    /// Write a file, replacing an existing file at the same path.
    fn write_file(&self, path: &DrivePath, data: Bytes) -> Result<FileEntry> {
        let mut nodes = self.write();
        Self::require_parent(&nodes, path)?;
        if matches!(nodes.get(path), Some(node) if node.is_folder()) {
            return Err(Error::AlreadyExists(format!("{} is a folder", path)));
        }
        let node = Node::file(data);
        let entry = node.entry(path);
        nodes.insert(path.clone(), node);
        Ok(entry)
    }

    fn remove(&self, path: &DrivePath) -> Result<()> {
        if path.is_root() {
            return Err(Error::Validation("The root cannot be removed".to_string()));
        }
        let mut nodes = self.write();
        if !nodes.contains_key(path) {
            return Err(Error::NotFound(format!("No such entry: {}", path)));
        }
        nodes.retain(|key, _| !key.starts_with(path));
        Ok(())
    }

    fn transfer(&self, from: &DrivePath, to: &DrivePath, keep_source: bool) -> Result<FileEntry> {
        if from.is_root() {
            return Err(Error::Validation("The root cannot be moved".to_string()));
        }
        if to.starts_with(from) {
            return Err(Error::Validation(format!(
                "Cannot place {} inside itself",
                from
            )));
        }
        let mut nodes = self.write();
        if !nodes.contains_key(from) {
            return Err(Error::NotFound(format!("No such entry: {}", from)));
        }
        Self::require_parent(&nodes, to)?;
        if nodes.contains_key(to) {
            return Err(Error::AlreadyExists(format!("{} already exists", to)));
        }

        let subtree: Vec<(DrivePath, Node)> = nodes
            .iter()
            .filter(|(key, _)| key.starts_with(from))
            .map(|(key, node)| (key.clone(), node.clone()))
            .collect();
        for (key, node) in subtree {
            let rel = key.strip_prefix(from).unwrap_or_default();
            let node = if keep_source {
                node.duplicate()
            } else {
                nodes.remove(&key);
                node
            };
            nodes.insert(to.concat(&rel), node);
        }

        nodes
            .get(to)
            .map(|node| node.entry(to))
            .ok_or_else(|| Error::NotFound(format!("No such entry: {}", to)))
    }

    fn find_by_md5(&self, md5: &str, size: u64) -> Option<Bytes> {
        self.read().values().find_map(|node| match node {
            Node::File { data, md5: m, .. } if m == md5 && data.len() as u64 == size => {
                Some(data.clone())
            }
            _ => None,
        })
    }

    fn path_of_id(&self, id: &str) -> Option<DrivePath> {
        self.read()
            .iter()
            .find(|(_, node)| node.id() == id)
            .map(|(key, _)| key.clone())
    }
}

/// Process-wide set of memory volumes keyed by namespace.
#[derive(Clone, Default)]
pub struct MemoryVolumes {
    inner: Arc<Mutex<HashMap<String, Arc<MemoryVolume>>>>,
}

impl MemoryVolumes {
    /// The volume for `namespace`, created empty on first use.
    pub fn volume(&self, namespace: &str) -> Arc<MemoryVolume> {
        lock(&self.inner)
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(MemoryVolume::new()))
            .clone()
    }
}

struct VolumeRefresher {
    volume: Arc<MemoryVolume>,
    ttl: ChronoDuration,
}

#[async_trait]
impl TokenRefresher for VolumeRefresher {
    async fn refresh_tokens(&self, refresh_token: &Secret) -> Result<Tokens> {
        Ok(self.volume.mint(refresh_token, self.ttl))
    }
}

enum MemoryAuth {
    Open(NoAuth),
    Tokens(TokenManager),
}

impl MemoryAuth {
    fn as_dyn(&self) -> &dyn Authenticator {
        match self {
            MemoryAuth::Open(auth) => auth,
            MemoryAuth::Tokens(manager) => manager,
        }
    }
}

/// In-memory drive adapter.
pub struct MemoryAdapter {
    mount_path: DrivePath,
    config: MemoryConfig,
    order: ListOrder,
    volume: Arc<MemoryVolume>,
    state: Arc<StateCell>,
    auth: MemoryAuth,
    engine: RequestEngine,
    upload: UploadSettings,
    ids: Option<IdCache>,
}

impl MemoryAdapter {
    /// Build an adapter over the volume named by the config (or the mount path).
    pub fn new(ctx: AdapterContext, volumes: &MemoryVolumes) -> Result<Self> {
        let config: MemoryConfig = parse_config(&ctx.config)?;
        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| ctx.mount_path.to_string_path());
        let volume = volumes.volume(&namespace);
        let state = Arc::new(StateCell::new(ctx.saved.clone()));

        let auth = if config.auth {
            let refresher = VolumeRefresher {
                volume: volume.clone(),
                ttl: ChronoDuration::seconds(config.token_ttl_secs.max(1)),
            };
            MemoryAuth::Tokens(TokenManager::from_state(
                Box::new(refresher),
                state.clone(),
                Some(Secret::new(format!("memory-refresh-{}", namespace))),
            )?)
        } else {
            MemoryAuth::Open(NoAuth)
        };

        Ok(Self {
            mount_path: ctx.mount_path,
            order: ListOrder::from_config(&ctx.config),
            config,
            volume,
            state,
            auth,
            engine: ctx.engine,
            upload: ctx.upload,
            ids: ctx.ids,
        })
    }

    /// The backing volume.
    pub fn volume(&self) -> &Arc<MemoryVolume> {
        &self.volume
    }

    fn check(&self, credential: &str) -> Result<()> {
        if self.config.auth {
            self.volume.authorize(credential)
        } else {
            Ok(())
        }
    }

    /// Run a volume operation through the request engine.
    async fn call<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&MemoryVolume) -> Result<T> + Send + Sync,
        T: Send,
    {
        let op = &op;
        self.engine
            .execute(self.auth.as_dyn(), |c| async move {
                self.check(&c)?;
                op(self.volume.as_ref())
            })
            .await
    }

    fn forget_ids(&self, path: &DrivePath) {
        if let Some(ids) = &self.ids {
            ids.invalidate(&self.mount_path, path);
        }
    }
}

#[async_trait]
impl PathQuery for MemoryAdapter {
    async fn root_id(&self) -> Result<String> {
        Ok(self.volume.node(&DrivePath::root())?.id().to_string())
    }

    async fn child_id(&self, parent_id: &str, name: &str) -> Result<Option<String>> {
        let parent = match self.volume.path_of_id(parent_id) {
            Some(parent) => parent,
            None => return Ok(None),
        };
        let wanted = decode_component(name);
        Ok(self
            .volume
            .children(&parent)?
            .into_iter()
            .find(|entry| decode_component(&entry.name) == wanted)
            .and_then(|entry| entry.remote_id))
    }
}

#[async_trait]
impl ChunkedUpload for MemoryAdapter {
    fn slice_policy(&self) -> SlicePolicy {
        SlicePolicy {
            vendor_min: self.config.slice_min,
            tier_max: self.config.slice_max,
            max_slices: self.config.max_slices,
            granularity: 1,
        }
    }

    fn max_concurrency(&self) -> Option<usize> {
        self.config.max_concurrency
    }

    async fn rapid_upload(
        &self,
        credential: &str,
        target: &UploadTarget,
        digest: &ContentDigest,
    ) -> Result<Option<FileEntry>> {
        self.check(credential)?;
        if !self.config.rapid_upload {
            return Ok(None);
        }
        match self.volume.find_by_md5(&digest.md5, digest.size) {
            Some(data) => {
                self.volume.stats.rapid_hits.fetch_add(1, Ordering::SeqCst);
                self.volume.write_file(&target.path, data).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn open_session(
        &self,
        credential: &str,
        target: &UploadTarget,
        _digest: &ContentDigest,
        _plan: &SlicePlan,
        _slice_hashes: &[String],
    ) -> Result<String> {
        self.check(credential)?;
        Self::require_parent_exists(&self.volume, &target.path)?;
        let upload_id = Uuid::new_v4().to_string();
        lock(&self.volume.sessions).insert(upload_id.clone(), BTreeMap::new());
        Ok(upload_id)
    }

    async fn put_slice(
        &self,
        credential: &str,
        session: &UploadSession,
        slice: &SliceRange,
        data: Bytes,
        hash: &str,
    ) -> Result<SliceReceipt> {
        self.check(credential)?;
        self.volume.stats.put_slices.fetch_add(1, Ordering::SeqCst);
        if slice_md5(&data) != hash {
            return Err(Error::Vendor(format!(
                "Slice {} checksum mismatch",
                slice.index
            )));
        }
        let mut sessions = lock(&self.volume.sessions);
        let parts = sessions
            .get_mut(&session.upload_id)
            .ok_or_else(|| Error::NotFound(format!("No upload session {}", session.upload_id)))?;
        parts.insert(slice.index, data);
        Ok(SliceReceipt {
            index: slice.index,
            token: hash.to_string(),
        })
    }

    async fn finalize(&self, credential: &str, session: &UploadSession) -> Result<Finalize> {
        self.check(credential)?;
        self.volume
            .stats
            .finalize_calls
            .fetch_add(1, Ordering::SeqCst);

        let parts = lock(&self.volume.sessions)
            .remove(&session.upload_id)
            .ok_or_else(|| Error::NotFound(format!("No upload session {}", session.upload_id)))?;
        if parts.len() != session.slice_count {
            return Err(Error::Vendor(format!(
                "Expected {} slices, received {}",
                session.slice_count,
                parts.len()
            )));
        }
        let mut assembled = Vec::with_capacity(session.total_size as usize);
        for part in parts.values() {
            assembled.extend_from_slice(part);
        }
        let data = Bytes::from(assembled);
        if slice_md5(&data) != session.content_hash {
            return Err(Error::Vendor("Assembled content checksum mismatch".to_string()));
        }

        match self.config.finalize_mode {
            FinalizeMode::Sync => Ok(Finalize::Done(
                self.volume.write_file(&session.target_path, data)?,
            )),
            FinalizeMode::Poll => {
                let ticket = format!("assemble-{}", session.upload_id);
                lock(&self.volume.pending).insert(
                    ticket.clone(),
                    PendingFile {
                        path: session.target_path.clone(),
                        data,
                        polls_left: self.config.poll_rounds,
                    },
                );
                Ok(Finalize::Pending(ticket))
            }
        }
    }

    async fn poll_finalize(
        &self,
        credential: &str,
        _session: &UploadSession,
        ticket: &str,
    ) -> Result<Option<FileEntry>> {
        self.check(credential)?;
        let ready = {
            let mut pending = lock(&self.volume.pending);
            let file = pending
                .get_mut(ticket)
                .ok_or_else(|| Error::NotFound(format!("No pending upload {}", ticket)))?;
            if file.polls_left > 0 {
                file.polls_left -= 1;
                return Ok(None);
            }
            pending.remove(ticket)
        };
        match ready {
            Some(file) => self.volume.write_file(&file.path, file.data).map(Some),
            None => Ok(None),
        }
    }
}

impl MemoryAdapter {
    fn require_parent_exists(volume: &MemoryVolume, path: &DrivePath) -> Result<()> {
        let nodes = volume.read();
        MemoryVolume::require_parent(&nodes, path)
    }
}

#[async_trait]
impl DriveAdapter for MemoryAdapter {
    fn kind(&self) -> &str {
        "memory"
    }

    fn state(&self) -> &StateCell {
        &self.state
    }

    async fn init_self(&self) -> Result<()> {
        if let MemoryAuth::Tokens(manager) = &self.auth {
            manager.ensure_fresh().await?;
        }
        let namespace = self
            .config
            .namespace
            .clone()
            .unwrap_or_else(|| self.mount_path.to_string_path());
        self.state.set("namespace", &namespace)?;
        Ok(())
    }

    async fn load_self(&self) -> Result<()> {
        if let MemoryAuth::Tokens(manager) = &self.auth {
            manager.ensure_fresh().await?;
        }
        Ok(())
    }

    async fn list_file(&self, path: &DrivePath) -> Result<Listing> {
        let mut entries = self.call(|volume| volume.children(path)).await?;
        self.order.apply(&mut entries);
        Ok(Listing::new(entries))
    }

    async fn down_file(&self, path: &DrivePath) -> Result<Vec<FileLink>> {
        let node = self.call(|volume| volume.node(path)).await?;
        match node {
            Node::File { data, .. } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
                Ok(vec![FileLink::new(format!(
                    "data:application/octet-stream;base64,{}",
                    encoded
                ))])
            }
            Node::Folder { .. } => Err(Error::Validation(format!(
                "Cannot link a folder: {}",
                path
            ))),
        }
    }

    async fn copy_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        let entry = self.call(|volume| volume.transfer(from, to, true)).await?;
        Ok(FileTask::done(Some(entry)))
    }

    async fn move_file(&self, from: &DrivePath, to: &DrivePath) -> Result<FileTask> {
        let entry = self.call(|volume| volume.transfer(from, to, false)).await?;
        self.forget_ids(from);
        Ok(FileTask::done(Some(entry)))
    }

    async fn kill_file(&self, path: &DrivePath) -> Result<FileTask> {
        self.call(|volume| volume.remove(path)).await?;
        self.forget_ids(path);
        Ok(FileTask::done(None))
    }

    async fn make_file(&self, path: &DrivePath, _options: &Value) -> Result<FileTask> {
        let entry = self.call(|volume| volume.create_folder(path)).await?;
        Ok(FileTask::done(Some(entry)))
    }

    async fn push_file(&self, dir: &DrivePath, payload: UploadPayload) -> Result<FileTask> {
        let target = UploadTarget::new(dir, &payload.name, payload.data.len() as u64)?;

        if target.size <= self.config.inline_threshold {
            debug!("Inline upload of {} ({} bytes)", target.path, target.size);
            let data = payload.data;
            let entry = self
                .call(|volume| volume.write_file(&target.path, data.clone()))
                .await?;
            return Ok(FileTask::done(Some(entry)));
        }

        let driver = UploadDriver::new(&self.engine, self.auth.as_dyn(), &self.upload);
        let outcome = driver.run(self, &target, payload.data).await?;
        Ok(FileTask::done(Some(outcome.entry)))
    }

    async fn find_id(&self, path: &DrivePath) -> Result<Option<String>> {
        lookup::find_id(self, &self.mount_path, path, self.ids.as_ref()).await
    }
}
