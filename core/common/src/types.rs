//! Common types used throughout UniDrive.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A normalized path in the virtual tree or within one drive.
///
/// Stored as components, so "/a/b/", "a//b" and "/a/./b" all normalize to
/// "/a/b". The root is the empty component list and renders as "/".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DrivePath {
    components: Vec<String>,
}

impl DrivePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Create a path from string components.
    ///
    /// # Preconditions
    /// - Components must not contain '/'
    /// - Components must not be empty, "." or ".."
    ///
    /// # Errors
    /// - Returns a validation error if any component is invalid
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        for comp in &components {
            validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse and normalize a path string.
    ///
    /// Empty components and "." are dropped; ".." is rejected because a
    /// request must never climb out of the mount it resolved to.
    pub fn parse(path: &str) -> crate::Result<Self> {
        let mut components = Vec::new();
        for comp in path.split('/') {
            match comp {
                "" | "." => continue,
                ".." => {
                    return Err(crate::Error::Validation(format!(
                        "Parent references are not allowed: {}",
                        path
                    )))
                }
                other => components.push(other.to_string()),
            }
        }
        Ok(Self { components })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components.
    pub fn depth(&self) -> usize {
        self.components.len()
    }

    /// Get the parent path, if any.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            let mut components = self.components.clone();
            components.pop();
            Some(Self { components })
        }
    }

    /// Get the file/directory name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Join this path with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Append every component of `relative` to this path.
    pub fn concat(&self, relative: &DrivePath) -> Self {
        let mut components = self.components.clone();
        components.extend(relative.components.iter().cloned());
        Self { components }
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Component-wise prefix test; "/ab" does not start with "/a".
    pub fn starts_with(&self, prefix: &DrivePath) -> bool {
        self.components.len() >= prefix.components.len()
            && self.components[..prefix.components.len()] == prefix.components[..]
    }

    /// The remainder of this path below `prefix`, if `prefix` covers it.
    pub fn strip_prefix(&self, prefix: &DrivePath) -> Option<DrivePath> {
        if !self.starts_with(prefix) {
            return None;
        }
        Some(Self {
            components: self.components[prefix.components.len()..].to_vec(),
        })
    }

    /// True when `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &DrivePath) -> bool {
        self.components.len() > ancestor.components.len() && self.starts_with(ancestor)
    }

    /// Convert to a string representation.
    pub fn to_string_path(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}", self.components.join("/"))
        }
    }
}

fn validate_component(comp: &str) -> crate::Result<()> {
    if comp.is_empty() || comp == "." || comp == ".." {
        return Err(crate::Error::Validation(format!(
            "Invalid path component: {:?}",
            comp
        )));
    }
    if comp.contains('/') {
        return Err(crate::Error::Validation(
            "Path component cannot contain separators".to_string(),
        ));
    }
    Ok(())
}

impl fmt::Display for DrivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_path())
    }
}

impl TryFrom<String> for DrivePath {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<DrivePath> for String {
    fn from(path: DrivePath) -> Self {
        path.to_string_path()
    }
}

/// Decode a display name for comparison against vendor names.
///
/// Clients may send "%20" where the vendor reports a space; both sides are
/// compared after percent-decoding.
pub fn decode_component(name: &str) -> String {
    percent_decode_str(name).decode_utf8_lossy().into_owned()
}

/// Credential material that zeroizes on drop and never prints.
#[derive(Clone, PartialEq, Eq, Default, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret for use in a request.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {} chars])", self.0.len())
    }
}
