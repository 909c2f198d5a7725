//! Common error types for UniDrive.

use thiserror::Error;

/// Top-level error type for UniDrive operations.
///
/// The first six variants form the user-visible taxonomy; the rest are
/// internal kinds that surface through the dispatcher with their message.
#[derive(Debug, Error)]
pub enum Error {
    /// Request rejected before any vendor call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Credential rejected or expired.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transient transport failure; safe to retry.
    #[error("Network error: {0}")]
    Network(String),

    /// Opaque vendor failure, surfaced verbatim.
    #[error("Vendor error: {0}")]
    Vendor(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A polling or deadline budget was exhausted.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation not supported by this drive.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Credential store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Whether the failure is transient and the same call may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_))
    }

    /// Whether the failure signals an expired or rejected credential.
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_transient() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(!Error::Auth("expired".into()).is_transient());
        assert!(!Error::Vendor("quota".into()).is_transient());
        assert!(!Error::Timeout("finalize".into()).is_transient());
    }

    #[test]
    fn test_vendor_message_is_verbatim() {
        let err = Error::Vendor("errno 31061: file already exists".into());
        assert_eq!(err.to_string(), "Vendor error: errno 31061: file already exists");
    }

    #[test]
    fn test_json_error_converts() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
