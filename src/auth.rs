//! API key authentication and bearer token lifecycle.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::prelude::ApiError;

/// Margin subtracted from a token's validity so we refresh before expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// API key credentials used to mint bearer tokens.
#[derive(Debug, Clone)]
pub struct ApiKeyAuthConfig {
    /// The account's API secret key.
    pub api_secret_key: String,
    /// Requested token validity in minutes.
    pub validity_minutes: u32,
}

impl ApiKeyAuthConfig {
    /// Credentials with the default 15 minute token validity.
    #[must_use]
    pub fn new<S: Into<String>>(api_secret_key: S) -> Self {
        Self {
            api_secret_key: api_secret_key.into(),
            validity_minutes: 15,
        }
    }
}

/// Body of the token minting request.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AccessTokenRequest<'a> {
    secret: &'a str,
    validity_in_minutes: u32,
}

/// Response of the token minting request.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    access_token: String,
}

/// A minted token and its refresh deadline.
#[derive(Debug)]
struct TokenState {
    access_token: String,
    refresh_after: Instant,
}

/// Owns the bearer token cache and exchanges the API secret for fresh tokens.
///
/// Safe for concurrent use; every outbound call goes through
/// [`AuthManager::access_token`] so a token is minted at most once per expiry
/// window regardless of how many tasks race on it.
#[derive(Debug)]
pub struct AuthManager {
    config: ApiKeyAuthConfig,
    state: Mutex<Option<TokenState>>,
}

impl AuthManager {
    /// Create a manager with no token minted yet.
    #[must_use]
    pub fn new(config: ApiKeyAuthConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// Return a valid bearer token, minting or refreshing if needed.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::Auth`] if the token endpoint rejects the secret
    /// and [`ApiError::Network`] if the request cannot be sent.
    pub async fn access_token(&self, http: &reqwest::Client, base_url: &str) -> Result<String> {
        let mut state = self.state.lock().await;

        if let Some(ref token) = *state {
            if Instant::now() < token.refresh_after {
                return Ok(token.access_token.clone());
            }
        }

        log::info!("Minting a new access token");

        let res = http
            .post(format!("{base_url}/userapiauthservice/personal/access-tokens"))
            .json(&AccessTokenRequest {
                secret: &self.config.api_secret_key,
                validity_in_minutes: self.config.validity_minutes,
            })
            .send()
            .await
            .map_err(ApiError::from)?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            anyhow::bail!(ApiError::Auth(format!(
                "token endpoint returned status {status}"
            )));
        }

        let token = res
            .json::<AccessTokenResponse>()
            .await
            .map_err(ApiError::from)?;
        let validity = Duration::from_secs(u64::from(self.config.validity_minutes) * 60);

        *state = Some(TokenState {
            access_token: token.access_token.clone(),
            refresh_after: Instant::now() + validity.saturating_sub(REFRESH_MARGIN),
        });

        Ok(token.access_token)
    }

    /// Drop the cached token so the next call mints a fresh one.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }

    /// Revoke the current token server-side and drop it from the cache.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::Network`] if the revocation request cannot be
    /// sent. A missing cached token is a no-op.
    pub async fn revoke_current_token(
        &self,
        http: &reqwest::Client,
        base_url: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(token) = state.take() else {
            return Ok(());
        };

        log::info!("Revoking the current access token");

        http.delete(format!("{base_url}/userapiauthservice/personal/access-tokens"))
            .bearer_auth(token.access_token)
            .send()
            .await
            .map_err(ApiError::from)?;

        Ok(())
    }
}
