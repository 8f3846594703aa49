//! Crate config module.

use crate::rest::DEFAULT_API_ENDPOINT;

/// Client-level configuration, passed to
/// [`crate::client::PublicApiClient::new`].
///
/// The default account is per-client configuration: every operation that
/// needs an account and gets none reads it from here.
#[derive(Debug, Clone)]
pub struct PublicApiClientConfiguration {
    /// Account used when an operation gets no explicit account id.
    pub default_account_number: Option<String>,
    /// Base endpoint of the brokerage API.
    pub api_endpoint: String,
}

impl Default for PublicApiClientConfiguration {
    fn default() -> Self {
        Self {
            default_account_number: None,
            api_endpoint: DEFAULT_API_ENDPOINT.to_owned(),
        }
    }
}

impl PublicApiClientConfiguration {
    /// Configuration with a default account and the production endpoint.
    #[must_use]
    pub fn with_default_account<S: Into<String>>(default_account_number: S) -> Self {
        Self {
            default_account_number: Some(default_account_number.into()),
            ..Self::default()
        }
    }
}
