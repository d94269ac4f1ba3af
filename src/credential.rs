use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::error::AuthError;

/// Bearer credential as persisted between runs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Token handed out by the identity provider, with its absolute expiry.
#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn request_token(&self) -> Result<IssuedToken, AuthError>;
}

/// The single persisted credential slot.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `None` when the slot is empty or unreadable.
    async fn load(&self) -> Option<Credential>;
    async fn save(&self, credential: &Credential) -> Result<(), AuthError>;
}

/// Anything that can put a bearer token on a request.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer(&self) -> Result<String, AuthError>;
}

/// Fixed bearer token, never refreshed.
#[derive(Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn bearer(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// JSON file holding `{access_token, expires_at}`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Option<Credential> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(?err, path = %self.path.display(), "cannot read credential file");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(credential) => Some(credential),
            Err(err) => {
                warn!(%err, path = %self.path.display(), "ignoring unparsable credential file");
                None
            }
        }
    }

    async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        let body = serde_json::to_vec(credential)
            .map_err(|e| AuthError::Store(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        fs::write(&self.path, body).await?;
        Ok(())
    }
}

/// OAuth2 client-credentials grant against the tenant's token endpoint.
#[derive(Clone)]
pub struct ClientSecretProvider {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scope: String,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ClientSecretProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSecretProvider")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

impl ClientSecretProvider {
    pub fn from_config(cfg: &Config, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let authority = Url::parse(&cfg.azure.authority)
            .map_err(|_| ConfigError::Invalid("azure.authority must be a valid URL"))?;
        let token_url = authority
            .join(&format!("{}/oauth2/v2.0/token", cfg.azure.tenant_id))
            .map_err(|_| ConfigError::Invalid("azure.tenant_id must be URL-safe"))?;
        let http = Client::builder()
            .user_agent(concat!("listsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|_| ConfigError::Invalid("cannot build HTTP client"))?;
        Ok(Self {
            http,
            token_url,
            client_id: cfg.azure.client_id.clone(),
            client_secret: cfg.azure.client_secret.clone(),
            scope: cfg.azure.scope.clone(),
            clock,
        })
    }
}

#[async_trait]
impl IdentityProvider for ClientSecretProvider {
    async fn request_token(&self) -> Result<IssuedToken, AuthError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];
        let res = self
            .http
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Unreachable(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => AuthError::Rejected {
                    code: err.error,
                    message: err.error_description,
                },
                Err(_) => AuthError::Rejected {
                    code: status.as_u16().to_string(),
                    message: body,
                },
            });
        }

        let payload: TokenResponse = res
            .json()
            .await
            .map_err(|e| AuthError::Unreachable(format!("invalid token response: {e}")))?;
        Ok(IssuedToken {
            token: payload.access_token,
            expires_on: self.clock.now() + Duration::seconds(payload.expires_in),
        })
    }
}

/// Reuses the persisted credential until it expires, then refreshes it once.
///
/// Concurrent callers that observe a missing or expired credential share a
/// single refresh.
pub struct CredentialCache {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<Credential>>,
    refreshing: Mutex<()>,
}

impl fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCache").finish_non_exhaustive()
    }
}

impl CredentialCache {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            store,
            clock,
            current: RwLock::new(None),
            refreshing: Mutex::new(()),
        }
    }

    #[instrument(skip_all)]
    pub async fn get_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached(self.clock.now()).await {
            return Ok(token);
        }

        let _guard = self.refreshing.lock().await;
        let now = self.clock.now();
        if let Some(token) = self.cached(now).await {
            return Ok(token);
        }

        if let Some(stored) = self.store.load().await {
            if stored.is_valid_at(now) {
                debug!(expires_at = %stored.expires_at, "reusing persisted credential");
                let token = stored.access_token.clone();
                *self.current.write().await = Some(stored);
                return Ok(token);
            }
        }

        self.refresh().await
    }

    async fn cached(&self, now: DateTime<Utc>) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_valid_at(now))
            .map(|c| c.access_token.clone())
    }

    /// Caller holds `refreshing`.
    async fn refresh(&self) -> Result<String, AuthError> {
        let issued = self.provider.request_token().await?;
        let credential = Credential {
            access_token: issued.token,
            expires_at: issued.expires_on,
        };
        self.store.save(&credential).await?;
        info!(expires_at = %credential.expires_at, "refreshed credential");
        let token = credential.access_token.clone();
        *self.current.write().await = Some(credential);
        Ok(token)
    }
}

#[async_trait]
impl TokenSource for CredentialCache {
    async fn bearer(&self) -> Result<String, AuthError> {
        self.get_token().await
    }
}
