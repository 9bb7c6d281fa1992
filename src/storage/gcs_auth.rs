/// OAuth access tokens for the GCS JSON API
/// Signs a service-account JWT assertion and caches the exchanged token
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{CollectorError, Result};

const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Pre-minted token; skips the key file entirely
pub const ACCESS_TOKEN_ENV: &str = "GCS_ACCESS_TOKEN";

/// Refresh this long before the token actually expires
const REFRESH_MARGIN_SECS: i64 = 120;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECS) < self.expires_at
    }
}

enum TokenSource {
    Static(String),
    ServiceAccount {
        key: ServiceAccountKey,
        signing_key: EncodingKey,
    },
}

/// Token manager with thread-safe access
pub struct GcsTokenManager {
    source: TokenSource,
    cached: Arc<RwLock<Option<AccessToken>>>,
    http: reqwest::Client,
}

impl GcsTokenManager {
    /// Honour `GCS_ACCESS_TOKEN`, otherwise load the service-account key file
    pub fn from_env_or_key_file(path: impl AsRef<Path>, http: reqwest::Client) -> Result<Self> {
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.trim().is_empty() {
                info!("🔑 Using GCS access token from {}", ACCESS_TOKEN_ENV);
                return Ok(Self::with_static_token(token.trim().to_string(), http));
            }
        }
        Self::from_key_file(path, http)
    }

    pub fn from_key_file(path: impl AsRef<Path>, http: reqwest::Client) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CollectorError::StoreAuth(format!("cannot read service account key {}: {}", path.display(), e))
        })?;
        let key: ServiceAccountKey = serde_json::from_str(&content)
            .map_err(|e| CollectorError::StoreAuth(format!("malformed service account key {}: {}", path.display(), e)))?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;

        info!("🔑 Loaded service account {}", key.client_email);
        Ok(GcsTokenManager {
            source: TokenSource::ServiceAccount { key, signing_key },
            cached: Arc::new(RwLock::new(None)),
            http,
        })
    }

    pub fn with_static_token(token: String, http: reqwest::Client) -> Self {
        GcsTokenManager {
            source: TokenSource::Static(token),
            cached: Arc::new(RwLock::new(None)),
            http,
        }
    }

    /// Bearer token, refreshed when close to expiry
    pub async fn access_token(&self) -> Result<String> {
        let (key, signing_key) = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount { key, signing_key } => (key, signing_key),
        };

        if let Some(token) = self.cached.read().await.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        let mut cached = self.cached.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        let token = self.exchange(key, signing_key).await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token after the store rejects it
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn exchange(&self, key: &ServiceAccountKey, signing_key: &EncodingKey) -> Result<AccessToken> {
        let now = Utc::now();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: STORAGE_SCOPE,
            aud: &key.token_uri,
            iat: now.timestamp(),
            exp: (now + Duration::hours(1)).timestamp(),
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, signing_key)?;

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(CollectorError::StoreRequest {
                    status: status.as_u16(),
                    message: format!("token exchange failed: {}", body),
                });
            }
            return Err(CollectorError::StoreAuth(format!("token exchange failed ({}): {}", status, body)));
        }

        let body: TokenResponse = response.json().await?;
        debug!("Obtained GCS access token valid for {}s", body.expires_in);
        Ok(AccessToken {
            value: body.access_token,
            expires_at: now + Duration::seconds(body.expires_in),
        })
    }
}
