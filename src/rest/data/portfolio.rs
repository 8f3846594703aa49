//! Portfolio snapshot data.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::rest::data::account::AccountType;
use crate::rest::data::order::Order;
use crate::rest::data::quote::OrderInstrument;

/// Buying power breakdown of an account.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BuyingPower {
    /// Settled cash available.
    #[serde(default)]
    pub cash_only_buying_power: Option<Decimal>,
    /// Total buying power including margin.
    #[serde(default)]
    pub buying_power: Option<Decimal>,
    /// Buying power usable for options.
    #[serde(default)]
    pub options_buying_power: Option<Decimal>,
}

/// Account-level equity value entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EquityValue {
    /// What the value describes, e.g. `CASH` or `EQUITY`.
    #[serde(default)]
    pub r#type: Option<String>,
    /// Current value.
    #[serde(default)]
    pub value: Option<Decimal>,
}

/// One open position.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioPosition {
    /// Instrument held.
    pub instrument: OrderInstrument,
    /// Signed position size.
    #[serde(default)]
    pub quantity: Option<Decimal>,
    /// Average acquisition cost per unit.
    #[serde(default)]
    pub average_cost: Option<Decimal>,
    /// Current market value of the position.
    #[serde(default)]
    pub market_value: Option<Decimal>,
}

/// Full portfolio snapshot for one account.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    /// Account the snapshot is for.
    pub account_id: String,
    /// Product category of the account.
    pub account_type: AccountType,
    /// Buying power breakdown.
    pub buying_power: BuyingPower,
    /// Account value components.
    #[serde(default)]
    pub equity: Vec<EquityValue>,
    /// Open positions.
    #[serde(default)]
    pub positions: Vec<PortfolioPosition>,
    /// Working orders.
    #[serde(default)]
    pub orders: Vec<Order>,
}
