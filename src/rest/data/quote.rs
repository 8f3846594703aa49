//! Quote data and the instrument key used to request it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::rest::data::instrument_type::InstrumentType;

/// A `(symbol, type)` pair identifying one tradable instrument.
///
/// This is the unit the quote endpoint is keyed by and the subject the price
/// subscription manager polls, so it compares and hashes by value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct OrderInstrument {
    /// Ticker symbol, e.g. `AAPL` or an OCC option symbol.
    pub symbol: String,
    /// Asset class of the symbol.
    #[serde(rename = "type")]
    pub instrument_type: InstrumentType,
}

impl OrderInstrument {
    /// Convenience constructor.
    #[must_use]
    pub fn new<S: Into<String>>(symbol: S, instrument_type: InstrumentType) -> Self {
        Self {
            symbol: symbol.into(),
            instrument_type,
        }
    }

    /// An equity instrument for `symbol`.
    #[must_use]
    pub fn equity<S: Into<String>>(symbol: S) -> Self {
        Self::new(symbol, InstrumentType::Equity)
    }
}

/// Per-instrument outcome of a quote request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteOutcome {
    /// The quote carries real market data.
    Success,
    /// The server could not quote the instrument.
    #[default]
    #[serde(other)]
    Unknown,
}

/// The current market quote for one instrument.
///
/// Every price field is optional; a thinly traded instrument can legitimately
/// be missing any of them.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// The instrument this quote is for.
    pub instrument: OrderInstrument,
    /// Whether the server produced data for the instrument.
    #[serde(default)]
    pub outcome: QuoteOutcome,
    /// Last trade price.
    #[serde(default)]
    pub last: Option<Decimal>,
    /// Best bid price.
    #[serde(default)]
    pub bid: Option<Decimal>,
    /// Size at the best bid.
    #[serde(default)]
    pub bid_size: Option<Decimal>,
    /// Best ask price.
    #[serde(default)]
    pub ask: Option<Decimal>,
    /// Size at the best ask.
    #[serde(default)]
    pub ask_size: Option<Decimal>,
    /// Day volume.
    #[serde(default)]
    pub volume: Option<Decimal>,
    /// Open interest, options only.
    #[serde(default)]
    pub open_interest: Option<Decimal>,
    /// Server quote timestamp.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Body of the quote request.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QuotesRequest<'a> {
    /// Instruments to quote.
    pub instruments: &'a [OrderInstrument],
}

/// Envelope of the quote response.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QuotesResponse {
    /// One entry per requested instrument.
    pub quotes: Vec<Quote>,
}
