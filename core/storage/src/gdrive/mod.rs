//! Google Drive storage.
//!
//! - OAuth2 refresh-token grant with rotation persisted to saved state
//! - Resumable uploads for large files
//! - Path-to-id lookups through the shared cache

pub mod adapter;
pub mod auth;
pub mod client;

pub use adapter::{GDriveAdapter, GDriveConfig};
pub use auth::GoogleRefresher;
pub use client::{DriveClient, DriveFile};
