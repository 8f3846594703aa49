//! Main crate error.

/// Main error enum.
///
/// HTTP failures are classified by [`crate::rest::ApiClient`] into the
/// `Auth` / `Validation` / `NotFound` / `RateLimited` / `Server` / `Network`
/// variants; everything else is raised directly by the operation that failed.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// Authentication or token acquisition failed.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// The server rejected the request body or parameters.
    #[error("request validation failed: {0}")]
    Validation(String),
    /// The requested resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// The server is throttling us.
    #[error("rate limited by server")]
    RateLimited {
        /// Server-provided retry hint in seconds, if any.
        retry_after: Option<u64>,
    },
    /// A 5xx response.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server-provided message.
        message: String,
    },
    /// The request never produced an HTTP response.
    #[error("network error: {0}")]
    Network(String),
    /// A response that fits no other classification.
    #[error("unexpected response {status}: {message}")]
    Unexpected {
        /// HTTP status code.
        status: u16,
        /// Server-provided message.
        message: String,
    },
    /// No account ID was passed and no default account is configured.
    #[error("no account ID provided and no default account number configured")]
    MissingAccountId,
    /// `subscribe` was called with no instruments.
    #[error("subscription requires at least one instrument")]
    EmptySubscription,
    /// A polling frequency outside the accepted range.
    #[error("polling frequency must be between 0.1 and 60 seconds, got {0}")]
    InvalidPollingFrequency(f64),
    /// An operation referenced a subscription id that does not exist.
    #[error("subscription `{0}` not found")]
    SubscriptionNotFound(String),
    /// A `wait_for_status` / `wait_for_terminal_status` call exceeded its deadline.
    #[error("timed out waiting for order status")]
    WaitTimeout,
    /// The subscription backing a wait was cancelled before the wait resolved.
    #[error("subscription cancelled while waiting for order status")]
    WaitCancelled,
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        ApiError::Network(value.to_string())
    }
}
