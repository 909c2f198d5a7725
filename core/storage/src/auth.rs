//! Credential management and the refresh contract used by the request engine.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use unidrive_common::{Error, Result, Secret};

use crate::state::StateCell;

/// Saved-state key under which token managers persist their tokens.
pub const TOKENS_KEY: &str = "tokens";

/// Source of the credential attached to vendor calls.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Current credential, refreshed first if it is known to be stale.
    async fn credential(&self) -> Result<String>;

    /// Refresh after the vendor rejected `stale`.
    ///
    /// Must be idempotent: if the current credential is no longer `stale`
    /// (another caller already refreshed), this is a no-op success.
    async fn refresh(&self, stale: &str) -> Result<()>;
}

/// Authenticator for drives that need no credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn credential(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn refresh(&self, _stale: &str) -> Result<()> {
        Ok(())
    }
}

/// OAuth2-style tokens with expiration tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tokens {
    /// Access token for API requests.
    pub access_token: Secret,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: Secret,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Tokens whose access token expires `expires_in` from now.
    pub fn issued_now(access_token: Secret, refresh_token: Secret, expires_in: Duration) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: Utc::now() + expires_in,
        }
    }

    /// Placeholder holding only a refresh token; always considered expired.
    pub fn from_refresh_token(refresh_token: Secret) -> Self {
        Self {
            access_token: Secret::default(),
            refresh_token,
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Less than 5 minutes remaining counts as expired
        self.access_token.is_empty() || self.expires_at < Utc::now() + Duration::minutes(5)
    }
}

/// Vendor-specific refresh-token grant.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a refresh token for new tokens.
    async fn refresh_tokens(&self, refresh_token: &Secret) -> Result<Tokens>;
}

/// Token manager that refreshes expired tokens and records the rotation
/// in the adapter's saved state.
pub struct TokenManager {
    refresher: Box<dyn TokenRefresher>,
    tokens: RwLock<Tokens>,
    state: Arc<StateCell>,
}

impl TokenManager {
    /// Create a new token manager with initial tokens.
    pub fn new(refresher: Box<dyn TokenRefresher>, tokens: Tokens, state: Arc<StateCell>) -> Self {
        Self {
            refresher,
            tokens: RwLock::new(tokens),
            state,
        }
    }

    /// Hydrate from saved state, falling back to a configured refresh token.
    ///
    /// # Errors
    /// - Neither saved tokens nor a fallback refresh token are available
    pub fn from_state(
        refresher: Box<dyn TokenRefresher>,
        state: Arc<StateCell>,
        fallback: Option<Secret>,
    ) -> Result<Self> {
        let tokens = match state.get::<Tokens>(TOKENS_KEY)? {
            Some(tokens) => tokens,
            None => match fallback {
                Some(refresh_token) if !refresh_token.is_empty() => {
                    Tokens::from_refresh_token(refresh_token)
                }
                _ => {
                    return Err(Error::Validation(
                        "No saved tokens and no refresh_token configured".to_string(),
                    ))
                }
            },
        };
        Ok(Self::new(refresher, tokens, state))
    }

    /// Get the current tokens.
    pub async fn tokens(&self) -> Tokens {
        self.tokens.read().await.clone()
    }

    /// Refresh only if the access token is expired.
    ///
    /// Calling this on a valid token is a no-op and records no drift.
    pub async fn ensure_fresh(&self) -> Result<()> {
        self.credential().await.map(|_| ())
    }

    async fn renew(&self, tokens: &mut Tokens) -> Result<()> {
        info!("Refreshing access token");
        let renewed = self.refresher.refresh_tokens(&tokens.refresh_token).await?;
        *tokens = renewed;
        self.state.set(TOKENS_KEY, &*tokens)?;
        self.state
            .set_log(format!("token refreshed at {}", Utc::now().to_rfc3339()));
        Ok(())
    }
}

#[async_trait]
impl Authenticator for TokenManager {
    async fn credential(&self) -> Result<String> {
        let tokens = self.tokens.read().await;
        if !tokens.is_expired() {
            return Ok(tokens.access_token.expose().to_string());
        }
        drop(tokens);

        let mut tokens = self.tokens.write().await;

        // Double-check after acquiring write lock
        if !tokens.is_expired() {
            return Ok(tokens.access_token.expose().to_string());
        }

        self.renew(&mut tokens).await?;
        Ok(tokens.access_token.expose().to_string())
    }

    async fn refresh(&self, stale: &str) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        if tokens.access_token.expose() != stale && !tokens.is_expired() {
            debug!("Token already rotated by a concurrent caller");
            return Ok(());
        }
        self.renew(&mut tokens).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeRefresher {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh_tokens(&self, refresh_token: &Secret) -> Result<Tokens> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Tokens::issued_now(
                Secret::new(format!("access-{}", n)),
                refresh_token.clone(),
                Duration::hours(1),
            ))
        }
    }

    fn manager(tokens: Tokens) -> (TokenManager, Arc<AtomicU32>, Arc<StateCell>) {
        let calls = Arc::new(AtomicU32::new(0));
        let state = Arc::new(StateCell::new(json!({})));
        let manager = TokenManager::new(
            Box::new(FakeRefresher {
                calls: calls.clone(),
            }),
            tokens,
            state.clone(),
        );
        (manager, calls, state)
    }

    fn valid() -> Tokens {
        Tokens::issued_now(Secret::new("live"), Secret::new("r"), Duration::hours(1))
    }

    #[test]
    fn test_tokens_expiration() {
        let expired = Tokens {
            access_token: Secret::new("test"),
            refresh_token: Secret::new("refresh"),
            expires_at: Utc::now() - Duration::hours(1),
        };
        assert!(expired.is_expired());
        assert!(!valid().is_expired());
    }

    #[test]
    fn test_tokens_near_expiration() {
        let tokens = Tokens::issued_now(Secret::new("a"), Secret::new("r"), Duration::minutes(4));
        assert!(tokens.is_expired());
    }

    #[test]
    fn test_placeholder_is_expired() {
        assert!(Tokens::from_refresh_token(Secret::new("r")).is_expired());
    }

    #[tokio::test]
    async fn test_ensure_fresh_on_valid_token_is_noop() {
        let (manager, calls, state) = manager(valid());

        manager.ensure_fresh().await.unwrap();
        manager.ensure_fresh().await.unwrap();

        assert_eq!(manager.credential().await.unwrap(), "live");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!state.is_changed());
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once() {
        let (manager, calls, state) = manager(Tokens::from_refresh_token(Secret::new("r")));

        manager.ensure_fresh().await.unwrap();
        manager.ensure_fresh().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.credential().await.unwrap(), "access-1");
        assert!(state.take_drift().is_some());
        assert!(state.take_drift().is_none());
    }

    #[tokio::test]
    async fn test_refresh_with_stale_credential_after_rotation_is_noop() {
        let (manager, calls, _) = manager(valid());

        manager.refresh("live").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A racing caller still holding the old credential
        manager.refresh("live").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.credential().await.unwrap(), "access-1");
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_collapse() {
        let (manager, calls, _) = manager(valid());
        let manager = Arc::new(manager);

        let a = {
            let m = manager.clone();
            tokio::spawn(async move { m.refresh("live").await })
        };
        let b = {
            let m = manager.clone();
            tokio::spawn(async move { m.refresh("live").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_persists_tokens_into_state() {
        let (manager, _, state) = manager(valid());
        manager.refresh("live").await.unwrap();

        let saved: Tokens = state.get(TOKENS_KEY).unwrap().unwrap();
        assert_eq!(saved.access_token.expose(), "access-1");
        assert!(state.log().unwrap().starts_with("token refreshed"));
    }

    #[test]
    fn test_from_state_requires_some_credential() {
        let state = Arc::new(StateCell::new(json!({})));
        let calls = Arc::new(AtomicU32::new(0));
        let result = TokenManager::from_state(Box::new(FakeRefresher { calls }), state, None);
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_tokens_serialization() {
        let tokens = valid();
        let json = serde_json::to_string(&tokens).unwrap();
        let back: Tokens = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tokens);
    }
}
