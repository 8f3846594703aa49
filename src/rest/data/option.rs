//! Option chain, expiration, and greeks data.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::rest::data::quote::OrderInstrument;

/// Request for the listed expirations of an underlying.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OptionExpirationsRequest {
    /// The underlying instrument.
    pub instrument: OrderInstrument,
}

/// Listed expirations of an underlying.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OptionExpirationsResponse {
    /// Underlying symbol.
    pub base_symbol: String,
    /// Expiration dates with listed contracts.
    pub expirations: Vec<NaiveDate>,
}

/// Call or put.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallPut {
    /// A call contract.
    Call,
    /// A put contract.
    Put,
}

/// One listed contract within a chain.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OptionContract {
    /// The option instrument (OCC symbol).
    pub instrument: OrderInstrument,
    /// Strike price.
    pub strike_price: Decimal,
    /// Call or put.
    pub call_put: CallPut,
}

/// Request for one expiration's chain.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OptionChainRequest {
    /// The underlying instrument.
    pub instrument: OrderInstrument,
    /// Which expiration to list.
    pub expiration: NaiveDate,
}

/// The chain for one underlying and expiration.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OptionChainResponse {
    /// Underlying symbol.
    pub base_symbol: String,
    /// Expiration the chain is for.
    pub expiration: NaiveDate,
    /// Listed contracts, strikes ascending.
    pub chain: Vec<OptionContract>,
}

/// The greeks of one contract.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GreekValues {
    /// Price sensitivity to the underlying.
    #[serde(default)]
    pub delta: Option<Decimal>,
    /// Delta sensitivity to the underlying.
    #[serde(default)]
    pub gamma: Option<Decimal>,
    /// Price decay per day.
    #[serde(default)]
    pub theta: Option<Decimal>,
    /// Price sensitivity to volatility.
    #[serde(default)]
    pub vega: Option<Decimal>,
    /// Price sensitivity to rates.
    #[serde(default)]
    pub rho: Option<Decimal>,
    /// Implied volatility.
    #[serde(default)]
    pub implied_volatility: Option<Decimal>,
}

/// Greeks of one contract, keyed by its OCC symbol.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OptionGreeks {
    /// OCC symbol of the contract.
    pub symbol: String,
    /// The greek values.
    pub greeks: GreekValues,
}

/// Response of the greeks route.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GreeksResponse {
    /// One entry per requested symbol.
    pub greeks: Vec<OptionGreeks>,
}
