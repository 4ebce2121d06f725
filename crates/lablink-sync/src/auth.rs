//! # Auth Provider
//!
//! Injects the configured credential into outbound requests. The
//! credential is opaque to the rest of the engine: everything goes
//! through [`AuthProvider::apply`].
//!
//! OAuth 2.0 client-credentials tokens are cached and refreshed five
//! minutes before expiry; a 401 from the endpoint forces one refresh and
//! a single resend.

use std::time::{Duration, Instant};

use reqwest::RequestBuilder;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use lablink_core::AuthConfig;

use crate::error::{SyncError, SyncResult};

/// Margin before token expiry that triggers a proactive refresh.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Fallback token lifetime when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

// =============================================================================
// Token Cache
// =============================================================================

#[derive(Debug, Clone)]
struct TokenInfo {
    access_token: String,
    expires_at: Instant,
}

impl TokenInfo {
    fn needs_refresh(&self) -> bool {
        Instant::now() + REFRESH_MARGIN >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

// =============================================================================
// Provider
// =============================================================================

/// Applies the configured auth scheme to outbound requests.
pub struct AuthProvider {
    config: AuthConfig,
    http: reqwest::Client,
    token: RwLock<Option<TokenInfo>>,
}

impl AuthProvider {
    pub fn new(config: AuthConfig, http: reqwest::Client) -> Self {
        AuthProvider {
            config,
            http,
            token: RwLock::new(None),
        }
    }

    /// Attaches the credential to a request.
    pub async fn apply(&self, builder: RequestBuilder) -> SyncResult<RequestBuilder> {
        match &self.config {
            AuthConfig::None => Ok(builder),

            AuthConfig::ApiKey { header, key } => Ok(builder.header(header.as_str(), key.as_str())),

            AuthConfig::Bearer { token } => Ok(builder.bearer_auth(token)),

            AuthConfig::Basic { username, password } => {
                Ok(builder.basic_auth(username, Some(password)))
            }

            AuthConfig::Headers { headers } => {
                let mut builder = builder;
                for (name, value) in headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                Ok(builder)
            }

            AuthConfig::OAuth2 { .. } => {
                let token = self.oauth_token().await?;
                Ok(builder.bearer_auth(token))
            }
        }
    }

    /// Drops the cached token so the next request authenticates afresh.
    /// Called after a 401 from the endpoint.
    pub async fn invalidate(&self) {
        if matches!(self.config, AuthConfig::OAuth2 { .. }) {
            warn!("Endpoint returned 401, discarding cached OAuth token");
            *self.token.write().await = None;
        }
    }

    /// True when a 401 is worth one forced refresh and resend.
    pub fn supports_refresh(&self) -> bool {
        matches!(self.config, AuthConfig::OAuth2 { .. })
    }

    /// Returns a valid cached token or fetches a new one.
    async fn oauth_token(&self) -> SyncResult<String> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if !token.needs_refresh() {
                    debug!("Using cached OAuth token");
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut guard = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = guard.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.access_token.clone());
            }
        }

        let token = self.fetch_token().await?;
        let access = token.access_token.clone();
        *guard = Some(token);
        Ok(access)
    }

    async fn fetch_token(&self) -> SyncResult<TokenInfo> {
        let AuthConfig::OAuth2 {
            token_url,
            client_id,
            client_secret,
            scope,
        } = &self.config
        else {
            return Err(SyncError::AuthFailed("not an OAuth configuration".into()));
        };

        debug!(url = %token_url, "Requesting OAuth token");

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id.clone()),
        ];
        if !client_secret.is_empty() {
            form.push(("client_secret", client_secret.clone()));
        }
        if let Some(scope) = scope {
            form.push(("scope", scope.clone()));
        }

        let mut request = self.http.post(token_url.as_str()).form(&form);
        if !client_secret.is_empty() {
            request = request.basic_auth(client_id, Some(client_secret));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::AuthFailed(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SyncError::AuthFailed(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::AuthFailed(format!("bad token response: {}", e)))?;

        let lifetime = body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        info!(expires_in_secs = lifetime, "Obtained OAuth token");

        Ok(TokenInfo {
            access_token: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        })
    }
}
