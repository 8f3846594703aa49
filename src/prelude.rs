//! Crate prelude.

use std::sync::Arc;

pub use crate::error::ApiError;
use crate::subscription::order::OrderSource;
use crate::subscription::price::QuoteSource;

/// Shared quote source handle.
pub type QuoteSourceRef = Arc<dyn QuoteSource>;

/// Shared order source handle.
pub type OrderSourceRef = Arc<dyn OrderSource>;
