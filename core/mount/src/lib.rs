//! Mount table and request dispatch for UniDrive.
//!
//! Mounts map a normalized path to one drive adapter plus its persisted
//! config and saved state. Each request resolves the longest covering mount,
//! hydrates a fresh adapter, runs one action and writes any state drift back.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod manager;
pub mod record;
pub mod resolver;
pub mod sqlite;
pub mod store;
pub mod table;

pub use config::ServiceConfig;
pub use context::RequestContext;
pub use dispatcher::{Action, Dispatcher, FileRequest, Reply};
pub use manager::MountManager;
pub use record::{MountEntry, MountRecord};
pub use resolver::{LoadedMount, MountResolver, Resolved};
pub use sqlite::SqliteStore;
pub use store::{CredentialStore, MemoryStore, MountStore};
pub use table::Resolution;
