//! HTTP plumbing shared by the vendor adapters.

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use unidrive_common::{Error, Result};

/// User agent sent by every adapter unless a vendor requires its own.
pub const USER_AGENT: &str = concat!("UniDrive/", env!("CARGO_PKG_VERSION"));

/// Build the shared HTTP client.
///
/// # Errors
/// - TLS backend initialization failed
pub fn build_client(timeout: Option<Duration>) -> Result<Client> {
    let mut builder = Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))
}

/// Map a transport-level failure.
pub fn send_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Network(format!("{}: timed out", context))
    } else {
        Error::Network(format!("{}: {}", context, err))
    }
}

/// Classify a non-success HTTP status.
pub fn status_error(status: StatusCode, body: &str) -> Error {
    match status.as_u16() {
        401 => Error::Auth(format!("Credential rejected: {}", body)),
        404 => Error::NotFound(format!("Resource not found: {}", body)),
        408 | 429 | 500..=599 => Error::Network(format!("Server busy: {} - {}", status, body)),
        _ => Error::Vendor(format!("{} - {}", status, body)),
    }
}

/// Fail on a non-success status, otherwise hand the response back.
pub async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Check the status and decode a JSON body.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    check_response(response)
        .await?
        .json()
        .await
        .map_err(|e| Error::Vendor(format!("Failed to parse response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            Error::Auth(_)
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, ""),
            Error::NotFound(_)
        ));
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(status_error(StatusCode::REQUEST_TIMEOUT, "").is_transient());
    }

    #[test]
    fn test_other_statuses_are_vendor_errors() {
        let err = status_error(StatusCode::FORBIDDEN, "quota");
        match err {
            Error::Vendor(msg) => assert!(msg.contains("403") && msg.contains("quota")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_build_client() {
        assert!(build_client(Some(Duration::from_secs(5))).is_ok());
    }
}
