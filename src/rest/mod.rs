//! REST transport for the brokerage API.
//!
//! [`ApiClient`] owns the shared HTTP client, the base endpoint, and the auth
//! manager. Every request refreshes the bearer token first and maps non-2xx
//! responses into the [`ApiError`] taxonomy, so callers only ever see typed
//! failures.

use std::sync::RwLock;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::{ApiKeyAuthConfig, AuthManager};
use crate::prelude::ApiError;

pub mod data;

/// Default production endpoint.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.public.com";

/// Request timeout applied to every call.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// The shared HTTP layer.
#[derive(Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: RwLock<String>,
    auth: AuthManager,
}

/// Error payload shape the server uses for non-2xx responses.
#[derive(serde::Deserialize, Debug)]
struct ErrorBody {
    message: Option<serde_json::Value>,
}

impl ApiClient {
    /// Build a client against `base_url` with the given credentials.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::Validation`] if `base_url` is not a valid URL.
    pub fn new(auth_config: ApiKeyAuthConfig, base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: RwLock::new(Self::normalize_endpoint(base_url)?),
            auth: AuthManager::new(auth_config),
        })
    }

    /// Validate an endpoint URL and strip any trailing slash.
    fn normalize_endpoint(base_url: &str) -> Result<String> {
        if url::Url::parse(base_url).is_err() {
            anyhow::bail!(ApiError::Validation(format!(
                "`{base_url}` is not a valid endpoint URL"
            )));
        }

        Ok(base_url.trim_end_matches('/').to_owned())
    }

    /// The current base endpoint.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Replace the base endpoint.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::Validation`] if `base_url` is not a valid URL.
    pub fn set_base_url(&self, base_url: &str) -> Result<()> {
        let normalized = Self::normalize_endpoint(base_url)?;

        *self
            .base_url
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = normalized;

        Ok(())
    }

    /// GET `path` with optional query parameters.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification for any non-2xx response or
    /// transport failure.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Option<&[(&str, String)]>,
    ) -> Result<T> {
        let res = self
            .send_with_auth(path, |url, token| {
                let mut req = self.http.get(url).bearer_auth(token);
                if let Some(params) = params {
                    req = req.query(params);
                }
                req
            })
            .await?;

        Self::parse_body(res).await
    }

    /// POST `body` as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification for any non-2xx response or
    /// transport failure.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let res = self
            .send_with_auth(path, |url, token| {
                self.http.post(url).bearer_auth(token).json(body)
            })
            .await?;

        Self::parse_body(res).await
    }

    /// DELETE `path`, discarding any response body.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification for any non-2xx response or
    /// transport failure.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let _ = self
            .send_with_auth(path, |url, token| self.http.delete(url).bearer_auth(token))
            .await?;

        Ok(())
    }

    /// Revoke the current bearer token.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::Network`] if the revocation request cannot be
    /// sent.
    pub async fn revoke_token(&self) -> Result<()> {
        self.auth
            .revoke_current_token(&self.http, &self.base_url())
            .await
    }

    /// Send a request with a fresh token, retrying once on a stale-token 401.
    ///
    /// The retry exists so that one expired token never surfaces as a fetch
    /// failure to the subscription schedulers.
    async fn send_with_auth<F>(&self, path: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(String, String) -> reqwest::RequestBuilder,
    {
        let base = self.base_url();
        let url = format!("{base}{path}");

        let token = self.auth.access_token(&self.http, &base).await?;
        let res = build(url.clone(), token)
            .send()
            .await
            .map_err(ApiError::from)?;

        if res.status() == reqwest::StatusCode::UNAUTHORIZED {
            log::warn!("Request to {path} returned 401, refreshing token and retrying once");
            self.auth.invalidate().await;

            let token = self.auth.access_token(&self.http, &base).await?;
            let res = build(url, token).send().await.map_err(ApiError::from)?;

            return Self::check_status(res).await;
        }

        Self::check_status(res).await
    }

    /// Map a non-2xx response into the error taxonomy.
    async fn check_status(res: reqwest::Response) -> Result<reqwest::Response> {
        let status = res.status();

        if status.is_success() {
            return Ok(res);
        }

        let retry_after = res
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let message = Self::error_message(res).await;

        let err = match status.as_u16() {
            400 => ApiError::Validation(message),
            401 | 403 => ApiError::Auth(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited { retry_after },
            status @ 500..=599 => ApiError::Server { status, message },
            status => ApiError::Unexpected { status, message },
        };

        log::warn!("API request failed: {err}");

        anyhow::bail!(err)
    }

    /// Pull a human-readable message out of an error body.
    async fn error_message(res: reqwest::Response) -> String {
        let raw = res.text().await.unwrap_or_default();

        match serde_json::from_str::<ErrorBody>(&raw) {
            Ok(ErrorBody {
                message: Some(serde_json::Value::String(message)),
            }) => message,
            Ok(ErrorBody {
                message: Some(other),
            }) => other.to_string(),
            _ if raw.is_empty() => "Unknown error".to_owned(),
            _ => raw,
        }
    }

    /// Deserialize a 2xx body, treating an empty body as an empty object.
    async fn parse_body<T: DeserializeOwned>(res: reqwest::Response) -> Result<T> {
        let raw = res.text().await.map_err(ApiError::from)?;

        let body = if raw.is_empty() { "{}" } else { raw.as_str() };

        Ok(serde_json::from_str(body)?)
    }
}
