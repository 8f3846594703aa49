//! Instrument reference data and listing filters.

use serde::{Deserialize, Serialize};

use crate::rest::data::instrument_type::InstrumentType;
use crate::rest::data::quote::OrderInstrument;

/// Per-capability trading permission of an instrument.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trading {
    /// Full trading.
    BuyAndSell,
    /// New positions blocked.
    SellOnly,
    /// Capability unavailable.
    Disabled,
}

impl Trading {
    /// The wire name of the permission, used when building query strings.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BuyAndSell => "BUY_AND_SELL",
            Self::SellOnly => "SELL_ONLY",
            Self::Disabled => "DISABLED",
        }
    }
}

/// Reference data for one instrument.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    /// The instrument key.
    pub instrument: OrderInstrument,
    /// Whole-share trading permission.
    #[serde(default)]
    pub trading: Option<Trading>,
    /// Fractional-share trading permission.
    #[serde(default)]
    pub fractional_trading: Option<Trading>,
    /// Single-leg option trading permission.
    #[serde(default)]
    pub option_trading: Option<Trading>,
    /// Multi-leg option trading permission.
    #[serde(default)]
    pub option_spread_trading: Option<Trading>,
}

/// Response of the instrument listing route.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentsResponse {
    /// All instruments matching the filters.
    pub instruments: Vec<Instrument>,
}

/// Filters for the instrument listing route, sent as query parameters.
#[derive(Debug, Clone, Default)]
pub struct InstrumentsRequest {
    /// Restrict by asset class.
    pub type_filter: Option<Vec<InstrumentType>>,
    /// Restrict by whole-share permission.
    pub trading_filter: Option<Vec<Trading>>,
    /// Restrict by fractional permission.
    pub fractional_trading_filter: Option<Vec<Trading>>,
    /// Restrict by option permission.
    pub option_trading_filter: Option<Vec<Trading>>,
    /// Restrict by option spread permission.
    pub option_spread_trading_filter: Option<Vec<Trading>>,
}

impl InstrumentsRequest {
    /// Render the filters as repeated query pairs.
    #[must_use]
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        if let Some(ref types) = self.type_filter {
            for t in types {
                pairs.push(("type", t.as_str().to_owned()));
            }
        }
        if let Some(ref filters) = self.trading_filter {
            for f in filters {
                pairs.push(("trading", f.as_str().to_owned()));
            }
        }
        if let Some(ref filters) = self.fractional_trading_filter {
            for f in filters {
                pairs.push(("fractionalTrading", f.as_str().to_owned()));
            }
        }
        if let Some(ref filters) = self.option_trading_filter {
            for f in filters {
                pairs.push(("optionTrading", f.as_str().to_owned()));
            }
        }
        if let Some(ref filters) = self.option_spread_trading_filter {
            for f in filters {
                pairs.push(("optionSpreadTrading", f.as_str().to_owned()));
            }
        }

        pairs
    }
}
