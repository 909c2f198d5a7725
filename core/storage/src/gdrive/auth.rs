//! OAuth2 refresh-token grant for Google Drive.

use async_trait::async_trait;
use chrono::Duration;
use oauth2::basic::BasicClient;
use oauth2::{
    ClientId, ClientSecret, EndpointNotSet, EndpointSet, RefreshToken, RequestTokenError,
    TokenResponse, TokenUrl,
};
use tracing::debug;

use unidrive_common::{Error, Result, Secret};

use crate::auth::{TokenRefresher, Tokens};

/// OAuth2 token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

type RefreshClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Exchanges Google refresh tokens for access tokens.
pub struct GoogleRefresher {
    client: RefreshClient,
    http: oauth2::reqwest::Client,
}

impl GoogleRefresher {
    /// Create a refresher for an OAuth2 client.
    ///
    /// # Errors
    /// - Invalid token URL
    /// - HTTP client could not be built
    pub fn new(client_id: &str, client_secret: &Secret, token_url: Option<&str>) -> Result<Self> {
        let token_url = TokenUrl::new(token_url.unwrap_or(GOOGLE_TOKEN_URL).to_string())
            .map_err(|e| Error::Validation(format!("Invalid token URL: {}", e)))?;

        let client = BasicClient::new(ClientId::new(client_id.to_string()))
            .set_client_secret(ClientSecret::new(client_secret.expose().to_string()))
            .set_token_uri(token_url);

        // The token endpoint must not redirect
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create OAuth2 client: {}", e)))?;

        Ok(Self { client, http })
    }
}

#[async_trait]
impl TokenRefresher for GoogleRefresher {
    /// Refresh an access token using the refresh token.
    ///
    /// # Errors
    /// - Invalid or revoked refresh token (`Error::Auth`)
    /// - Token endpoint unreachable (`Error::Network`)
    async fn refresh_tokens(&self, refresh_token: &Secret) -> Result<Tokens> {
        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose().to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| match e {
                RequestTokenError::Request(err) => {
                    Error::Network(format!("Token endpoint unreachable: {}", err))
                }
                other => Error::Auth(format!("Token refresh failed: {}", other)),
            })?;

        let access_token = Secret::new(token_result.access_token().secret().clone());

        // Refresh tokens may or may not be returned in refresh response
        let new_refresh_token = token_result
            .refresh_token()
            .map(|t| Secret::new(t.secret().clone()))
            .unwrap_or_else(|| refresh_token.clone());

        let expires_in = token_result
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or_else(|| Duration::hours(1));
        debug!("Google access token valid for {}s", expires_in.num_seconds());

        Ok(Tokens::issued_now(access_token, new_refresh_token, expires_in))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresher_creation() {
        assert!(GoogleRefresher::new("id", &Secret::new("secret"), None).is_ok());
    }

    #[test]
    fn test_invalid_token_url_rejected() {
        let result = GoogleRefresher::new("id", &Secret::new("secret"), Some("not a url"));
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
