//! File action dispatcher.
//!
//! Maps one inbound action onto one adapter invocation on the resolved
//! mount. Every outcome, including adapter panics and deadline expiry, comes
//! back as a [`Reply`].

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use unidrive_common::{DrivePath, Error, Result};
use unidrive_storage::{Listing, UploadPayload};

use crate::config::ServiceConfig;
use crate::context::RequestContext;
use crate::resolver::{LoadedMount, MountResolver, Resolved};
use crate::table;

/// Inbound file action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    List,
    Link,
    Copy,
    Move,
    Create,
    Remove,
    Upload,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::List => "list",
            Action::Link => "link",
            Action::Copy => "copy",
            Action::Move => "move",
            Action::Create => "create",
            Action::Remove => "remove",
            Action::Upload => "upload",
        };
        f.write_str(name)
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "list" => Ok(Action::List),
            "link" => Ok(Action::Link),
            "copy" => Ok(Action::Copy),
            "move" => Ok(Action::Move),
            "create" => Ok(Action::Create),
            "remove" => Ok(Action::Remove),
            "upload" => Ok(Action::Upload),
            other => Err(Error::Validation(format!("Unknown action '{}'", other))),
        }
    }
}

/// One authenticated file request.
#[derive(Debug, Clone)]
pub struct FileRequest {
    pub action: Action,
    pub source: String,
    pub target: Option<String>,
    /// Create-time options.
    pub config: Option<Value>,
    pub upload: Option<UploadPayload>,
}

impl FileRequest {
    pub fn new(action: Action, source: impl Into<String>) -> Self {
        Self {
            action,
            source: source.into(),
            target: None,
            config: None,
            upload: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_upload(mut self, payload: UploadPayload) -> Self {
        self.upload = Some(payload);
        self
    }
}

/// Dispatcher response; `flag == false` always carries a reason in `text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub flag: bool,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Reply {
    fn ok(text: impl Into<String>, data: Value) -> Self {
        Self {
            flag: true,
            text: text.into(),
            data: Some(data),
        }
    }

    fn fail(err: &Error) -> Self {
        Self {
            flag: false,
            text: err.to_string(),
            data: None,
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "adapter panicked".to_string()
    }
}

fn require_primary<'a>(resolved: &'a Resolved, path: &DrivePath) -> Result<&'a LoadedMount> {
    resolved
        .primary
        .as_ref()
        .ok_or_else(|| Error::NotFound(format!("No drive mounted at {}", path)))
}

/// Routes file requests to adapters.
pub struct Dispatcher {
    resolver: Arc<MountResolver>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(resolver: Arc<MountResolver>, config: &ServiceConfig) -> Self {
        Self {
            resolver,
            timeout: config.request_timeout(),
        }
    }

    /// Run one request to completion.
    pub async fn dispatch(&self, request: FileRequest) -> Reply {
        let action = request.action;
        let parsed = DrivePath::parse(&request.source).and_then(|source| {
            let target = request.target.as_deref().map(DrivePath::parse).transpose()?;
            Ok((source, target))
        });
        let (source, target) = match parsed {
            Ok(paths) => paths,
            Err(e) => return Reply::fail(&e),
        };

        let ctx = RequestContext::new(source, target, self.timeout);
        info!("[{}] {} {}", ctx.short_id(), action, ctx.source);

        let work = AssertUnwindSafe(self.run(&ctx, request)).catch_unwind();
        let outcome = match ctx.remaining() {
            Some(left) => match tokio::time::timeout(left, work).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(Error::Timeout(format!(
                    "{} {} exceeded its deadline",
                    action, ctx.source
                )))),
            },
            None => work.await,
        };

        let result = outcome.unwrap_or_else(|panic| Err(Error::Vendor(panic_message(panic))));
        match result {
            Ok((text, data)) => {
                debug!("[{}] {} succeeded", ctx.short_id(), action);
                Reply::ok(text, data)
            }
            Err(e) => {
                warn!("[{}] {} {} failed: {}", ctx.short_id(), action, ctx.source, e);
                Reply::fail(&e)
            }
        }
    }

    /// Flush drift from the operation, then hand its result back.
    async fn finish<T>(&self, loaded: &LoadedMount, result: Result<T>) -> Result<T> {
        if let Err(e) = self
            .resolver
            .persist_drift(&loaded.entry.path, loaded.adapter.as_ref())
            .await
        {
            warn!("Drift for {} not persisted: {}", loaded.entry.path, e);
        }
        result
    }

    async fn run(&self, ctx: &RequestContext, request: FileRequest) -> Result<(String, Value)> {
        let source = &ctx.source;
        match request.action {
            Action::List => {
                let listing = self.list(source).await?;
                let text = format!("{} entries", listing.total);
                Ok((text, serde_json::to_value(listing)?))
            }
            Action::Link => {
                let resolved = self.resolver.resolve(source).await?;
                let loaded = require_primary(&resolved, source)?;
                let links = loaded.adapter.down_file(&resolved.relative).await;
                let links = self.finish(loaded, links).await?;
                Ok(("ok".to_string(), serde_json::to_value(links)?))
            }
            Action::Copy | Action::Move => {
                let target = ctx.target.as_ref().ok_or_else(|| {
                    Error::Validation(format!("{} requires a target", request.action))
                })?;
                self.transfer(request.action, source, target).await
            }
            Action::Create => {
                let resolved = self.resolver.resolve(source).await?;
                let loaded = require_primary(&resolved, source)?;
                if resolved.relative.is_root() {
                    return Err(Error::AlreadyExists(format!("{} is a mount point", source)));
                }
                let options = request.config.unwrap_or_else(|| json!({}));
                let task = loaded.adapter.make_file(&resolved.relative, &options).await;
                let task = self.finish(loaded, task).await?;
                Ok(("created".to_string(), serde_json::to_value(task)?))
            }
            Action::Remove => {
                let resolved = self.resolver.resolve(source).await?;
                let loaded = require_primary(&resolved, source)?;
                if resolved.relative.is_root() {
                    return Err(Error::Validation(format!(
                        "{} is a mount root; unmount it instead",
                        source
                    )));
                }
                let task = loaded.adapter.kill_file(&resolved.relative).await;
                let task = self.finish(loaded, task).await?;
                Ok(("removed".to_string(), serde_json::to_value(task)?))
            }
            Action::Upload => {
                let payload = request
                    .upload
                    .ok_or_else(|| Error::Validation("upload requires a payload".to_string()))?;
                let resolved = self.resolver.resolve(source).await?;
                let loaded = require_primary(&resolved, source)?;
                let task = loaded.adapter.push_file(&resolved.relative, payload).await;
                let task = self.finish(loaded, task).await?;
                Ok(("uploaded".to_string(), serde_json::to_value(task)?))
            }
        }
    }

    /// Adapter listing merged with virtual folders for nested mounts.
    async fn list(&self, source: &DrivePath) -> Result<Listing> {
        let resolved = self.resolver.resolve(source).await?;
        let virtuals = table::virtual_entries(source, &resolved.nested);

        let mut native = Vec::new();
        match &resolved.primary {
            Some(loaded) => {
                let listing = loaded.adapter.list_file(&resolved.relative).await;
                match self.finish(loaded, listing).await {
                    Ok(listing) => {
                        native = listing.entries;
                        for entry in &mut native {
                            entry.path = loaded.entry.path.concat(&entry.path);
                        }
                    }
                    // A path that only exists through nested mounts
                    Err(Error::NotFound(_)) if !virtuals.is_empty() => {}
                    Err(e) => return Err(e),
                }
            }
            None if virtuals.is_empty() => {
                return Err(Error::NotFound(format!("No drive mounted at {}", source)));
            }
            None => {}
        }

        // A mount shadows a native entry of the same name
        let shadowed: HashSet<String> = virtuals.iter().map(|e| e.name.clone()).collect();
        native.retain(|e| !shadowed.contains(&e.name));

        let mut entries = virtuals;
        entries.extend(native);
        Ok(Listing::new(entries))
    }

    async fn transfer(&self, action: Action, source: &DrivePath, target: &DrivePath) -> Result<(String, Value)> {
        let resolved = self.resolver.resolve(source).await?;
        let loaded = require_primary(&resolved, source)?;

        let destination = self.resolver.locate(target).await?;
        let same_mount = destination
            .primary
            .as_ref()
            .is_some_and(|m| m.path == loaded.entry.path);
        if !same_mount {
            return Err(Error::Validation(format!(
                "{} and {} are not on the same mount",
                source, target
            )));
        }
        if resolved.relative.is_root() {
            return Err(Error::Validation(format!(
                "Cannot {} the mount root {}",
                action, source
            )));
        }

        let task = match action {
            Action::Move => {
                loaded
                    .adapter
                    .move_file(&resolved.relative, &destination.relative)
                    .await
            }
            _ => {
                loaded
                    .adapter
                    .copy_file(&resolved.relative, &destination.relative)
                    .await
            }
        };
        let task = self.finish(loaded, task).await?;
        Ok((format!("{} ok", action), serde_json::to_value(task)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MountManager;
    use crate::store::{MemoryStore, MountStore};
    use async_trait::async_trait;
    use unidrive_storage::auth::TOKENS_KEY;
    use unidrive_storage::{
        create_registry, AdapterRegistry, DriveAdapter, FileLink, FileTask, MemoryVolumes,
        StateCell,
    };

    const MIB: usize = 1024 * 1024;

    struct Harness {
        dispatcher: Dispatcher,
        manager: MountManager,
        volumes: MemoryVolumes,
    }

    fn harness_with(config: ServiceConfig, registry: AdapterRegistry, volumes: MemoryVolumes) -> Harness {
        let mounts = MountStore::new(Arc::new(MemoryStore::new()));
        let resolver = Arc::new(MountResolver::new(Arc::new(registry), mounts, &config).unwrap());
        Harness {
            dispatcher: Dispatcher::new(resolver.clone(), &config),
            manager: MountManager::new(resolver),
            volumes,
        }
    }

    fn harness() -> Harness {
        let volumes = MemoryVolumes::default();
        harness_with(ServiceConfig::default(), create_registry(volumes.clone()), volumes)
    }

    fn path(raw: &str) -> DrivePath {
        DrivePath::parse(raw).unwrap()
    }

    fn names(reply: &Reply) -> Vec<String> {
        let listing: Listing = serde_json::from_value(reply.data.clone().unwrap()).unwrap();
        assert_eq!(listing.page_size, listing.entries.len());
        assert_eq!(listing.total, listing.entries.len());
        listing.entries.into_iter().map(|e| e.name).collect()
    }

    async fn ok(h: &Harness, request: FileRequest) -> Reply {
        let reply = h.dispatcher.dispatch(request).await;
        assert!(reply.flag, "request failed: {}", reply.text);
        reply
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("LIST".parse::<Action>().unwrap(), Action::List);
        assert!("rename".parse::<Action>().is_err());
        assert_eq!(Action::Upload.to_string(), "upload");
    }

    #[tokio::test]
    async fn test_list_sorted_under_mount() {
        let h = harness();
        h.manager
            .create(&path("/cloud/"), "memory", json!({"order_by": "size", "order_desc": true}))
            .await
            .unwrap();
        ok(&h, FileRequest::new(Action::Create, "/cloud/docs")).await;
        for (name, size) in [("small.txt", 1), ("large.txt", 300), ("mid.txt", 20)] {
            ok(
                &h,
                FileRequest::new(Action::Upload, "/cloud/docs")
                    .with_upload(UploadPayload::new(name, vec![0u8; size])),
            )
            .await;
        }
        ok(&h, FileRequest::new(Action::Create, "/cloud/docs/sub")).await;

        let reply = ok(&h, FileRequest::new(Action::List, "/cloud/docs")).await;
        assert_eq!(names(&reply), vec!["sub", "large.txt", "mid.txt", "small.txt"]);

        let listing: Listing = serde_json::from_value(reply.data.unwrap()).unwrap();
        assert_eq!(listing.entries[1].path, path("/cloud/docs/large.txt"));
    }

    #[tokio::test]
    async fn test_chunked_upload_through_dispatcher() {
        let h = harness();
        h.manager
            .create(&path("/big"), "memory", json!({"namespace": "big", "slice_max": 4 * MIB}))
            .await
            .unwrap();

        let data = vec![7u8; 50 * MIB];
        ok(
            &h,
            FileRequest::new(Action::Upload, "/big").with_upload(UploadPayload::new("blob.bin", data)),
        )
        .await;

        let stats = h.volumes.volume("big");
        assert_eq!(stats.stats().put_slices(), 13);
        assert_eq!(stats.stats().finalize_calls(), 1);

        let reply = ok(&h, FileRequest::new(Action::List, "/big")).await;
        assert_eq!(names(&reply), vec!["blob.bin"]);
    }

    #[tokio::test]
    async fn test_nested_mount_listed_as_virtual_folder() {
        let h = harness();
        h.manager.create(&path("/"), "memory", json!({"namespace": "root"})).await.unwrap();
        h.manager
            .create(&path("/shared/archive/"), "memory", json!({"namespace": "archive"}))
            .await
            .unwrap();
        ok(&h, FileRequest::new(Action::Create, "/shared")).await;
        ok(
            &h,
            FileRequest::new(Action::Upload, "/shared").with_upload(UploadPayload::new("notes.txt", "hi")),
        )
        .await;

        let reply = ok(&h, FileRequest::new(Action::List, "/shared/")).await;
        assert_eq!(names(&reply), vec!["archive", "notes.txt"]);
    }

    #[tokio::test]
    async fn test_mount_shadows_native_entry() {
        let h = harness();
        h.manager.create(&path("/"), "memory", json!({"namespace": "root2"})).await.unwrap();
        ok(&h, FileRequest::new(Action::Create, "/media")).await;
        h.manager
            .create(&path("/media"), "memory", json!({"namespace": "media"}))
            .await
            .unwrap();

        let reply = ok(&h, FileRequest::new(Action::List, "/")).await;
        assert_eq!(names(&reply), vec!["media"]);
    }

    #[tokio::test]
    async fn test_virtual_only_path() {
        let h = harness();
        h.manager.create(&path("/x/y"), "memory", json!({})).await.unwrap();
        let reply = ok(&h, FileRequest::new(Action::List, "/x")).await;
        assert_eq!(names(&reply), vec!["y"]);

        let missing = h.dispatcher.dispatch(FileRequest::new(Action::List, "/nowhere")).await;
        assert!(!missing.flag);
        assert!(missing.text.contains("Not found"));
    }

    #[tokio::test]
    async fn test_copy_move_rules() {
        let h = harness();
        h.manager.create(&path("/a"), "memory", json!({})).await.unwrap();
        h.manager.create(&path("/b"), "memory", json!({})).await.unwrap();
        ok(
            &h,
            FileRequest::new(Action::Upload, "/a").with_upload(UploadPayload::new("f.txt", "data")),
        )
        .await;

        let cross = h
            .dispatcher
            .dispatch(FileRequest::new(Action::Copy, "/a/f.txt").with_target("/b/f.txt"))
            .await;
        assert!(!cross.flag);
        assert!(cross.text.contains("same mount"));

        let no_target = h.dispatcher.dispatch(FileRequest::new(Action::Move, "/a/f.txt")).await;
        assert!(!no_target.flag);

        let root_move = h
            .dispatcher
            .dispatch(FileRequest::new(Action::Move, "/a").with_target("/a/inner"))
            .await;
        assert!(!root_move.flag);

        ok(&h, FileRequest::new(Action::Copy, "/a/f.txt").with_target("/a/g.txt")).await;
        ok(&h, FileRequest::new(Action::Move, "/a/g.txt").with_target("/a/h.txt")).await;
        let reply = ok(&h, FileRequest::new(Action::List, "/a")).await;
        assert_eq!(names(&reply), vec!["f.txt", "h.txt"]);
    }

    #[tokio::test]
    async fn test_remove_and_link() {
        let h = harness();
        h.manager.create(&path("/m"), "memory", json!({})).await.unwrap();
        ok(
            &h,
            FileRequest::new(Action::Upload, "/m").with_upload(UploadPayload::new("f", "hello")),
        )
        .await;

        let link = ok(&h, FileRequest::new(Action::Link, "/m/f")).await;
        let links: Vec<FileLink> = serde_json::from_value(link.data.unwrap()).unwrap();
        assert!(links[0].url.starts_with("data:"));

        let root = h.dispatcher.dispatch(FileRequest::new(Action::Remove, "/m/")).await;
        assert!(!root.flag);
        assert!(root.text.contains("mount root"));

        ok(&h, FileRequest::new(Action::Remove, "/m/f")).await;
        let gone = h.dispatcher.dispatch(FileRequest::new(Action::Link, "/m/f")).await;
        assert!(!gone.flag);
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let h = harness();
        let reply = h.dispatcher.dispatch(FileRequest::new(Action::List, "/a/../b")).await;
        assert!(!reply.flag);
        assert!(reply.text.contains("Validation"));
    }

    #[tokio::test]
    async fn test_drift_from_operation_is_persisted() {
        let h = harness();
        h.manager
            .create(&path("/secure"), "memory", json!({"auth": true, "namespace": "secure"}))
            .await
            .unwrap();
        ok(&h, FileRequest::new(Action::List, "/secure")).await;
        let before = h.manager.list().await.unwrap()[0].saved_state.get(TOKENS_KEY).cloned();

        // Revocation forces an in-call refresh on the next request
        h.volumes.volume("secure").revoke_credentials();
        ok(&h, FileRequest::new(Action::List, "/secure")).await;

        let after = h.manager.list().await.unwrap()[0].saved_state.get(TOKENS_KEY).cloned();
        assert!(after.is_some());
        assert_ne!(before, after);
    }

    struct TrapAdapter {
        state: StateCell,
    }

    #[async_trait]
    impl DriveAdapter for TrapAdapter {
        fn kind(&self) -> &str {
            "trap"
        }
        fn state(&self) -> &StateCell {
            &self.state
        }
        async fn init_self(&self) -> Result<()> {
            Ok(())
        }
        async fn load_self(&self) -> Result<()> {
            Ok(())
        }
        async fn list_file(&self, _path: &DrivePath) -> Result<Listing> {
            panic!("listing exploded")
        }
        async fn down_file(&self, _path: &DrivePath) -> Result<Vec<FileLink>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
        async fn copy_file(&self, _from: &DrivePath, _to: &DrivePath) -> Result<FileTask> {
            Err(Error::Unsupported("copy".into()))
        }
        async fn move_file(&self, _from: &DrivePath, _to: &DrivePath) -> Result<FileTask> {
            Err(Error::Unsupported("move".into()))
        }
        async fn kill_file(&self, _path: &DrivePath) -> Result<FileTask> {
            Err(Error::Unsupported("kill".into()))
        }
        async fn make_file(&self, _path: &DrivePath, _options: &Value) -> Result<FileTask> {
            Err(Error::Unsupported("make".into()))
        }
        async fn push_file(&self, _dir: &DrivePath, _payload: UploadPayload) -> Result<FileTask> {
            Err(Error::Unsupported("push".into()))
        }
        async fn find_id(&self, _path: &DrivePath) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_panic_and_deadline_become_failures() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(
                "trap",
                Box::new(|ctx| {
                    Ok(Box::new(TrapAdapter {
                        state: StateCell::new(ctx.saved),
                    }) as Box<dyn DriveAdapter>)
                }),
            )
            .unwrap();
        let config = ServiceConfig {
            request_timeout_secs: Some(1),
            ..ServiceConfig::default()
        };
        let h = harness_with(config, registry, MemoryVolumes::default());
        h.manager.create(&path("/t"), "trap", json!({})).await.unwrap();

        let panicked = h.dispatcher.dispatch(FileRequest::new(Action::List, "/t")).await;
        assert!(!panicked.flag);
        assert!(panicked.text.contains("listing exploded"));
        assert!(panicked.text.starts_with("Vendor error"));

        let slow = h.dispatcher.dispatch(FileRequest::new(Action::Link, "/t/f")).await;
        assert!(!slow.flag);
        assert!(slow.text.starts_with("Timeout"));
    }
}
