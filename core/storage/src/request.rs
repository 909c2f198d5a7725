//! Request/retry engine shared by every adapter.
//!
//! Two independent budgets apply to each logical call:
//! - transient network failures back off exponentially up to
//!   `RetryConfig::max_attempts` attempts;
//! - an auth-expired failure triggers exactly one credential refresh and
//!   one retry of the same call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use unidrive_common::{Error, Result};

use crate::auth::Authenticator;

/// Configuration for network retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts for a transient failure (including the first).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given retry number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Issues adapter calls with credential attachment, refresh-once and backoff.
#[derive(Debug, Clone, Default)]
pub struct RequestEngine {
    config: Arc<RetryConfig>,
}

impl RequestEngine {
    /// Create a new engine.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run an authenticated call.
    ///
    /// `operation` receives the credential to attach. If the call reports
    /// `Error::Auth`, the credential is refreshed once and the call is
    /// retried once with the new credential; a second `Error::Auth` is
    /// surfaced. Network failures back off within each of the two rounds.
    pub async fn execute<F, Fut, T>(&self, auth: &dyn Authenticator, operation: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let credential = auth.credential().await?;
        match self.with_backoff(|| operation(credential.clone())).await {
            Err(Error::Auth(reason)) => {
                warn!("Credential rejected ({}), refreshing once", reason);
                auth.refresh(&credential).await?;
                let renewed = auth.credential().await?;
                self.with_backoff(|| operation(renewed.clone())).await
            }
            other => other,
        }
    }

    /// Run a call with network backoff only.
    pub async fn with_backoff<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !err.is_transient() {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        warn!("Operation failed after {} attempts: {}", attempt, err);
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!(
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Hands out "token-N" and bumps N on refresh.
    struct CountingAuth {
        generation: AtomicU32,
        refreshes: AtomicU32,
    }

    impl CountingAuth {
        fn new() -> Self {
            Self {
                generation: AtomicU32::new(0),
                refreshes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Authenticator for CountingAuth {
        async fn credential(&self) -> Result<String> {
            Ok(format!("token-{}", self.generation.load(Ordering::SeqCst)))
        }

        async fn refresh(&self, stale: &str) -> Result<()> {
            if stale == self.credential().await? {
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.refreshes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn fast_engine(attempts: u32) -> RequestEngine {
        RequestEngine::new(
            RetryConfig::new(attempts)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_always_auth_error_is_attempted_exactly_twice() {
        let engine = fast_engine(3);
        let auth = CountingAuth::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = engine
            .execute(&auth, |_credential| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Auth("expired".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_uses_refreshed_credential() {
        let engine = fast_engine(3);
        let auth = CountingAuth::new();

        let result = engine
            .execute(&auth, |credential| async move {
                if credential == "token-0" {
                    Err(Error::Auth("expired".into()))
                } else {
                    Ok(credential)
                }
            })
            .await;

        assert_eq!(result.unwrap(), "token-1");
    }

    #[tokio::test]
    async fn test_network_errors_back_off_then_succeed() {
        let engine = fast_engine(3);
        let auth = CountingAuth::new();
        let calls = AtomicU32::new(0);

        let result = engine
            .execute(&auth, |_| {
                let current = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if current < 2 {
                        Err(Error::Network("connection reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_network_budget_is_capped() {
        let engine = fast_engine(3);
        let calls = AtomicU32::new(0);

        let result: Result<()> = engine
            .with_backoff(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Network("down".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_is_not_retried() {
        let engine = fast_engine(3);
        let calls = AtomicU32::new(0);

        let result: Result<()> = engine
            .with_backoff(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::NotFound("gone".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
