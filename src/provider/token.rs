//! OAuth2 token lifecycle for the telematics provider.
//!
//! The cached credential is served while it stays valid past the safety
//! margin. Refreshes are single-flight: every path that needs a new token
//! takes `refresh_lock` and re-checks the cache first, so N callers that hit
//! an expired or rejected token cause exactly one token exchange.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::client::ProviderConfig;
use super::error::ApiError;
use crate::config::{env_or, env_string};
use crate::models::AccessCredential;
use crate::storage::CredentialStore;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Row id in `api_credential`.
    pub account_id: String,
    /// Tokens closer than this to expiry are refreshed before use.
    pub safety_margin: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            safety_margin: Duration::from_secs(5 * 60),
        }
    }
}

impl TokenConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            account_id: env_string("PROVIDER_ACCOUNT_ID").unwrap_or(d.account_id),
            safety_margin: Duration::from_secs(env_or(
                "TOKEN_SAFETY_MARGIN_SECS",
                d.safety_margin.as_secs(),
            )),
        }
    }

    fn margin(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.safety_margin).unwrap_or_else(|_| chrono::Duration::minutes(5))
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until expiry.
    pub expires_in: i64,
}

/// Token endpoint grants.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn password_grant(&self) -> Result<TokenResponse, ApiError>;

    async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenResponse, ApiError>;
}

/// Form-encoded token endpoint with HTTP Basic client authentication.
pub struct HttpAuthProvider {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    username: String,
    password: String,
}

impl HttpAuthProvider {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(!config.client_id.is_empty(), "PROVIDER_CLIENT_ID is not set");
        anyhow::ensure!(!config.username.is_empty(), "PROVIDER_USERNAME is not set");

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build token client")?;

        Ok(Self {
            client,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    async fn exchange(&self, form: &[(&str, &str)]) -> Result<TokenResponse, ApiError> {
        let resp = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await?;
        Ok(serde_json::from_str::<TokenResponse>(&body)?)
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn password_grant(&self) -> Result<TokenResponse, ApiError> {
        self.exchange(&[
            ("grant_type", "password"),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ])
        .await
    }

    async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenResponse, ApiError> {
        self.exchange(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }
}

pub struct TokenManager {
    config: TokenConfig,
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn CredentialStore>,
    cached: RwLock<Option<AccessCredential>>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    /// Builds the manager and loads the persisted credential, if any.
    pub fn new(
        config: TokenConfig,
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let persisted = store.load_credential(&config.account_id)?;
        if let Some(cred) = &persisted {
            info!(
                account = %cred.id,
                expires_in_secs = cred.seconds_until_expiry(Utc::now()),
                "Loaded persisted provider credential"
            );
        }

        Ok(Self {
            config,
            auth,
            store,
            cached: RwLock::new(persisted),
            refresh_lock: Mutex::new(()),
        })
    }

    /// Read-only copy of the cached credential.
    pub fn credential_snapshot(&self) -> Option<AccessCredential> {
        self.cached.read().clone()
    }

    fn valid_cached_token(&self) -> Option<String> {
        let margin = self.config.margin();
        self.cached
            .read()
            .as_ref()
            .filter(|c| c.is_valid_for(margin, Utc::now()))
            .map(|c| c.access_token.clone())
    }

    /// Returns a token valid for at least the safety margin.
    pub async fn get_access_token(&self) -> Result<String, ApiError> {
        if let Some(token) = self.valid_cached_token() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.valid_cached_token() {
            debug!("Token renewed by a concurrent caller");
            return Ok(token);
        }

        self.renew().await
    }

    /// Called after a data request was rejected with 401 using `stale_token`.
    ///
    /// Only the first caller for a given stale token exchanges; later
    /// callers get the token that caller obtained.
    pub async fn refresh_after_unauthorized(&self, stale_token: &str) -> Result<String, ApiError> {
        let _guard = self.refresh_lock.lock().await;

        let margin = self.config.margin();
        let current = self
            .cached
            .read()
            .as_ref()
            .filter(|c| c.access_token != stale_token && c.is_valid_for(margin, Utc::now()))
            .map(|c| c.access_token.clone());
        if let Some(token) = current {
            debug!("Token already replaced after 401");
            return Ok(token);
        }

        metrics::increment_counter!("provider_unauthorized_total");
        self.renew().await
    }

    /// Refresh grant first, password login as fallback. Caller holds `refresh_lock`.
    async fn renew(&self) -> Result<String, ApiError> {
        let previous = self.credential_snapshot();
        let refresh_token = previous.as_ref().and_then(|c| c.refresh_token.clone());

        let response = match refresh_token {
            Some(refresh_token) => match self.auth.refresh_grant(&refresh_token).await {
                Ok(response) => {
                    metrics::increment_counter!("provider_token_refresh_total", "outcome" => "success");
                    info!("Provider token refreshed");
                    response
                }
                Err(e) => {
                    metrics::increment_counter!("provider_token_refresh_total", "outcome" => "failure");
                    warn!(error = %e, "Token refresh failed, falling back to login");
                    self.login().await?
                }
            },
            None => self.login().await?,
        };

        let credential = AccessCredential {
            id: self.config.account_id.clone(),
            access_token: response.access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| previous.and_then(|c| c.refresh_token)),
            expires_at: Utc::now() + chrono::Duration::seconds(response.expires_in.max(0)),
        };

        if let Err(e) = self.store.save_credential(&credential) {
            // The new token still works for this process; the next restart logs in again.
            error!(error = %e, "Failed to persist provider credential");
        }

        let token = credential.access_token.clone();
        *self.cached.write() = Some(credential);
        Ok(token)
    }

    async fn login(&self) -> Result<TokenResponse, ApiError> {
        match self.auth.password_grant().await {
            Ok(response) => {
                metrics::increment_counter!("provider_login_total", "outcome" => "success");
                info!("Logged in to provider");
                Ok(response)
            }
            Err(e) if e.is_retryable() => {
                // Outage at the token endpoint, not a credential problem.
                metrics::increment_counter!("provider_login_total", "outcome" => "unavailable");
                warn!(error = %e, "Provider token endpoint unavailable");
                Err(e)
            }
            Err(e) => {
                metrics::increment_counter!("provider_login_total", "outcome" => "failure");
                error!(error = %e, "Provider login failed");
                Err(ApiError::Authentication(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeAuth {
        logins: AtomicU32,
        refreshes: AtomicU32,
        refresh_fails: bool,
        login_fails: bool,
    }

    #[async_trait]
    impl AuthProvider for FakeAuth {
        async fn password_grant(&self) -> Result<TokenResponse, ApiError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            if self.login_fails {
                return Err(ApiError::Status {
                    status: 400,
                    body: "invalid_grant".into(),
                });
            }
            Ok(TokenResponse {
                access_token: format!("login-{}", n),
                refresh_token: Some(format!("refresh-{}", n)),
                expires_in: 3600,
            })
        }

        async fn refresh_grant(&self, _refresh_token: &str) -> Result<TokenResponse, ApiError> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            // Keep the exchange in flight long enough for callers to pile up.
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.refresh_fails {
                return Err(ApiError::Status {
                    status: 400,
                    body: "invalid refresh token".into(),
                });
            }
            Ok(TokenResponse {
                access_token: format!("fresh-{}", n),
                refresh_token: None,
                expires_in: 3600,
            })
        }
    }

    fn seeded_store(expires_in: chrono::Duration) -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        store
            .save_credential(&AccessCredential {
                id: "default".to_string(),
                access_token: "stale".to_string(),
                refresh_token: Some("r0".to_string()),
                expires_at: Utc::now() + expires_in,
            })
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_concurrent_unauthorized_single_refresh() {
        let auth = Arc::new(FakeAuth::default());
        let store = seeded_store(chrono::Duration::hours(1));
        let manager = TokenManager::new(TokenConfig::default(), auth.clone(), store.clone()).unwrap();

        let calls = (0..8).map(|_| manager.refresh_after_unauthorized("stale"));
        let tokens = futures_util::future::join_all(calls).await;

        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(auth.logins.load(Ordering::SeqCst), 0);
        for token in tokens {
            assert_eq!(token.unwrap(), "fresh-1");
        }

        // Refresh token carried over when the endpoint does not rotate it.
        let persisted = store.load_credential("default").unwrap().unwrap();
        assert_eq!(persisted.access_token, "fresh-1");
        assert_eq!(persisted.refresh_token.as_deref(), Some("r0"));
    }

    #[tokio::test]
    async fn test_persisted_credential_used_without_network() {
        let auth = Arc::new(FakeAuth::default());
        let store = seeded_store(chrono::Duration::hours(1));
        let manager = TokenManager::new(TokenConfig::default(), auth.clone(), store).unwrap();

        assert_eq!(manager.get_access_token().await.unwrap(), "stale");
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(auth.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_near_expiry_refreshes_proactively() {
        let auth = Arc::new(FakeAuth::default());
        let store = seeded_store(chrono::Duration::minutes(2));
        let manager = TokenManager::new(TokenConfig::default(), auth.clone(), store).unwrap();

        let calls = (0..4).map(|_| manager.get_access_token());
        for token in futures_util::future::join_all(calls).await {
            assert_eq!(token.unwrap(), "fresh-1");
        }
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_falls_back_to_login() {
        let auth = Arc::new(FakeAuth {
            refresh_fails: true,
            ..Default::default()
        });
        let store = seeded_store(chrono::Duration::seconds(-10));
        let manager = TokenManager::new(TokenConfig::default(), auth.clone(), store).unwrap();

        assert_eq!(manager.get_access_token().await.unwrap(), "login-1");
        let snapshot = manager.credential_snapshot().unwrap();
        assert_eq!(snapshot.refresh_token.as_deref(), Some("refresh-1"));
    }

    /// Token endpoint that cannot be reached at all.
    struct Unreachable;

    #[async_trait]
    impl AuthProvider for Unreachable {
        async fn password_grant(&self) -> Result<TokenResponse, ApiError> {
            Err(ApiError::Transport("connection reset".into()))
        }

        async fn refresh_grant(&self, _refresh_token: &str) -> Result<TokenResponse, ApiError> {
            Err(ApiError::Status {
                status: 503,
                body: "maintenance".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_token_endpoint_outage_stays_retryable() {
        let store = seeded_store(chrono::Duration::seconds(-10));
        let manager = TokenManager::new(TokenConfig::default(), Arc::new(Unreachable), store).unwrap();

        let err = manager.get_access_token().await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
        assert!(err.is_retryable());
        assert!(!err.is_fatal_auth());

        // The retry executor treats it like any other network blip.
        let retry = crate::provider::RetryExecutor::new(crate::provider::RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            ..Default::default()
        });
        let err = retry
            .execute("token", |_| manager.get_access_token())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Exhausted { attempts: 2, .. }));
        assert!(!err.is_fatal_auth());
    }

    #[tokio::test]
    async fn test_login_failure_is_authentication_error() {
        let auth = Arc::new(FakeAuth {
            login_fails: true,
            ..Default::default()
        });
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let manager = TokenManager::new(TokenConfig::default(), auth, store).unwrap();

        let err = manager.get_access_token().await.unwrap_err();
        assert!(err.is_fatal_auth());
        assert!(manager.credential_snapshot().is_none());
    }
}
