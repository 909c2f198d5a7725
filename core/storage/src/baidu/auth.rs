//! Baidu OAuth2 refresh via the query-string grant.

use async_trait::async_trait;
use chrono::Duration;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use unidrive_common::{Error, Result, Secret};

use crate::auth::{TokenRefresher, Tokens};
use crate::http::{send_error, status_error};

/// OAuth2 token endpoint.
pub const BAIDU_TOKEN_URL: &str = "https://openapi.baidu.com/oauth/2.0/token";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Exchanges Baidu refresh tokens for access tokens.
pub struct BaiduRefresher {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: Secret,
}

impl BaiduRefresher {
    pub fn new(
        http: Client,
        client_id: &str,
        client_secret: &Secret,
        token_url: Option<&str>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.unwrap_or(BAIDU_TOKEN_URL).to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.clone(),
        }
    }
}

/// Turn a token endpoint reply into tokens.
///
/// Baidu rotates the refresh token on every grant; a reply without one keeps
/// the previous token.
fn parse_grant(body: TokenResponse, previous: &Secret) -> Result<Tokens> {
    if let Some(error) = body.error {
        return Err(Error::Auth(format!(
            "Token refresh failed: {} {}",
            error,
            body.error_description.unwrap_or_default()
        )));
    }
    let access = body
        .access_token
        .ok_or_else(|| Error::Auth("Token endpoint returned no access token".to_string()))?;
    let refresh = body
        .refresh_token
        .map(Secret::new)
        .unwrap_or_else(|| previous.clone());
    let expires_in = Duration::seconds(body.expires_in.unwrap_or(30 * 24 * 3600));
    Ok(Tokens::issued_now(Secret::new(access), refresh, expires_in))
}

#[async_trait]
impl TokenRefresher for BaiduRefresher {
    async fn refresh_tokens(&self, refresh_token: &Secret) -> Result<Tokens> {
        let response = self
            .http
            .get(&self.token_url)
            .query(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.expose()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose()),
            ])
            .send()
            .await
            .map_err(|e| send_error("Token endpoint unreachable", e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| send_error("Failed to read token response", e))?;
        let body: TokenResponse = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if !status.is_success() => return Err(status_error(status, &text)),
            Err(e) => return Err(Error::Vendor(format!("Invalid token response: {}", e))),
        };

        let tokens = parse_grant(body, refresh_token)?;
        debug!("Baidu access token valid until {}", tokens.expires_at);
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> TokenResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_grant_rotates_refresh_token() {
        let tokens = parse_grant(
            response(r#"{"access_token":"a1","refresh_token":"r2","expires_in":2592000}"#),
            &Secret::new("r1"),
        )
        .unwrap();
        assert_eq!(tokens.access_token.expose(), "a1");
        assert_eq!(tokens.refresh_token.expose(), "r2");
        assert!(!tokens.is_expired());
    }

    #[test]
    fn test_grant_keeps_previous_refresh_token() {
        let tokens = parse_grant(response(r#"{"access_token":"a1"}"#), &Secret::new("r1")).unwrap();
        assert_eq!(tokens.refresh_token.expose(), "r1");
    }

    #[test]
    fn test_grant_error_is_auth() {
        let result = parse_grant(
            response(r#"{"error":"expired_token","error_description":"refresh token has been used"}"#),
            &Secret::new("r1"),
        );
        assert!(matches!(result, Err(Error::Auth(_))));
    }
}
