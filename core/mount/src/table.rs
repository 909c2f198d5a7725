//! Longest-prefix mount resolution and nested-mount discovery.

use std::collections::BTreeSet;

use unidrive_common::{DrivePath, Error, Result};
use unidrive_storage::FileEntry;

use crate::record::MountEntry;

/// Mounts covering one requested path.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Mount whose path is the longest prefix of the request.
    pub primary: Option<MountEntry>,
    /// Requested path relative to the primary mount's root.
    pub relative: DrivePath,
    /// Mounts strictly below the requested path.
    pub nested: Vec<MountEntry>,
}

/// Resolve `requested` against the enabled mounts in one scan.
///
/// # Errors
/// - Two enabled mounts share a normalized path
pub fn resolve(mounts: &[MountEntry], requested: &DrivePath) -> Result<Resolution> {
    let mut seen = BTreeSet::new();
    let mut primary: Option<&MountEntry> = None;
    let mut nested = Vec::new();

    for mount in mounts.iter().filter(|m| m.enabled) {
        if !seen.insert(&mount.path) {
            return Err(Error::Validation(format!(
                "Duplicate mount path {}",
                mount.path
            )));
        }
        if requested.starts_with(&mount.path) {
            if primary.map_or(true, |p| mount.path.depth() > p.path.depth()) {
                primary = Some(mount);
            }
        } else if mount.path.is_descendant_of(requested) {
            nested.push(mount.clone());
        }
    }

    let relative = match primary {
        Some(p) => requested.strip_prefix(&p.path).unwrap_or_default(),
        None => requested.clone(),
    };

    Ok(Resolution {
        primary: primary.cloned(),
        relative,
        nested,
    })
}

/// Synthetic folders for nested mounts: the first component below
/// `requested`, deduplicated, in name order.
pub fn virtual_entries(requested: &DrivePath, nested: &[MountEntry]) -> Vec<FileEntry> {
    let names: BTreeSet<&str> = nested
        .iter()
        .filter_map(|m| m.path.components().get(requested.depth()))
        .map(String::as_str)
        .collect();

    names
        .into_iter()
        .filter_map(|name| requested.join(name).ok())
        .map(FileEntry::folder)
        .collect()
}
