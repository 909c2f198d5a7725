//! Common utilities and types shared across UniDrive crates.
//!
//! This module provides the error taxonomy every layer reports through and the
//! normalized path type used to address mounts and remote entries.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{decode_component, DrivePath, Secret};
