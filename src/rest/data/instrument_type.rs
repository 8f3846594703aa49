//! Instrument type classification.

use serde::{Deserialize, Serialize};

/// The asset class of an instrument.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstrumentType {
    /// A listed equity or ETF.
    Equity,
    /// A listed option contract.
    Option,
    /// A crypto asset.
    Crypto,
}

impl InstrumentType {
    /// The wire name of the type, used when building URL paths.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equity => "EQUITY",
            Self::Option => "OPTION",
            Self::Crypto => "CRYPTO",
        }
    }
}
