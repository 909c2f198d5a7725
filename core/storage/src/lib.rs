//! Drive adapters for UniDrive.
//!
//! This crate defines the adapter contract every vendor implements, the
//! shared machinery adapters build on (request/retry engine, token manager,
//! path-to-id lookup, chunked upload protocol) and the built-in adapters.
//!
//! # Design Principles
//! - Adapters are built per request and own their saved-state cell
//! - Credentials are attached per call so a refresh can retry the call
//! - Unified error semantics: vendors classify into `unidrive_common::Error`

pub mod adapter;
pub mod auth;
pub mod http;
pub mod lookup;
pub mod registry;
pub mod request;
pub mod state;
pub mod upload;

pub mod baidu;
pub mod gdrive;
pub mod local;
pub mod memory;

pub use adapter::{
    AdapterContext, DriveAdapter, EntryKind, FileEntry, FileHash, FileLink, FileTask, ListOrder,
    Listing, OrderBy, TaskStatus, UploadPayload,
};
pub use auth::{Authenticator, NoAuth, TokenManager, TokenRefresher, Tokens};
pub use lookup::{IdCache, PathQuery};
pub use registry::{create_default_registry, create_registry, AdapterFactory, AdapterRegistry};
pub use request::{RequestEngine, RetryConfig};
pub use state::{Drift, StateCell};
pub use upload::{UploadSettings, SliceOptions};

pub use baidu::BaiduAdapter;
pub use gdrive::GDriveAdapter;
pub use local::LocalAdapter;
pub use memory::{MemoryAdapter, MemoryVolumes};
