//! Baidu Netdisk storage.
//!
//! Path-addressed xpan API with account-tier slice limits and
//! precreate / superfile2 / create uploads.

pub mod adapter;
pub mod auth;
pub mod client;

pub use adapter::{BaiduAdapter, BaiduConfig};
pub use auth::BaiduRefresher;
pub use client::PanClient;
