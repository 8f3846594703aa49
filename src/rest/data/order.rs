//! Order requests, order state, and preflight calculations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::rest::data::quote::OrderInstrument;

/// Which side of the market an order takes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy to open or close.
    Buy,
    /// Sell to open or close.
    Sell,
}

/// Order pricing style.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Execute at the market.
    Market,
    /// Execute at `limit_price` or better.
    Limit,
    /// Becomes a market order once `stop_price` trades.
    Stop,
    /// Becomes a limit order once `stop_price` trades.
    StopLimit,
}

/// How long an order stays working.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    /// Valid for the current session.
    Day,
    /// Good until cancelled.
    Gtc,
    /// Good until the supplied expiration date.
    Gtd,
    /// Immediate or cancel.
    Ioc,
}

/// Market session an equity order may execute in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EquityMarketSession {
    /// Regular trading hours only.
    Core,
    /// Pre-market and after-hours included.
    Extended,
}

/// Whether an option leg opens or closes a position.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpenCloseIndicator {
    /// Opens or adds to a position.
    Open,
    /// Closes or reduces a position.
    Close,
}

/// Lifecycle state of an order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted but not yet working.
    New,
    /// Queued at the venue.
    Pending,
    /// Partially executed, remainder still working.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Cancelled before completion.
    Cancelled,
    /// Rejected by the broker or venue.
    Rejected,
    /// Expired per its time in force.
    Expired,
}

impl OrderStatus {
    /// Whether no further transitions can occur from this status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }
}

/// Expiration settings of an order request.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderExpirationRequest {
    /// How long the order stays working.
    pub time_in_force: TimeInForce,
    /// Required when `time_in_force` is [`TimeInForce::Gtd`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
}

impl OrderExpirationRequest {
    /// A plain DAY expiration.
    #[must_use]
    pub fn day() -> Self {
        Self {
            time_in_force: TimeInForce::Day,
            expiration_time: None,
        }
    }
}

/// A single-leg order request.
///
/// `order_id` is a client-generated UUID used for idempotent submission.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    /// Client-generated idempotency id.
    pub order_id: String,
    /// Instrument to trade.
    pub instrument: OrderInstrument,
    /// Buy or sell.
    pub order_side: OrderSide,
    /// Pricing style.
    pub order_type: OrderType,
    /// Expiration settings.
    pub expiration: OrderExpirationRequest,
    /// Quantity in shares or contracts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,
    /// Notional amount for fractional orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    /// Limit price, required for limit and stop-limit orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    /// Stop price, required for stop and stop-limit orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    /// Session selection for equities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equity_market_session: Option<EquityMarketSession>,
    /// Open/close indicator for single-leg option orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_close_indicator: Option<OpenCloseIndicator>,
}

/// One leg of a multi-leg option order.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderLeg {
    /// Instrument of the leg.
    pub instrument: OrderInstrument,
    /// Buy or sell.
    pub side: OrderSide,
    /// Whether the leg opens or closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_close_indicator: Option<OpenCloseIndicator>,
    /// Per-unit ratio of the leg within the spread.
    pub ratio_quantity: Decimal,
}

/// A multi-leg (spread) order request.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MultilegOrderRequest {
    /// Client-generated idempotency id.
    pub order_id: String,
    /// Net pricing style; spreads are priced as a unit.
    pub order_type: OrderType,
    /// Number of spread units.
    pub quantity: Decimal,
    /// Net limit price per unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    /// Expiration settings.
    pub expiration: OrderExpirationRequest,
    /// The legs, in strategy order.
    pub legs: Vec<OrderLeg>,
}

/// Request for a cost preview of a multi-leg order.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MultilegPreflightRequest {
    /// Net pricing style.
    pub order_type: OrderType,
    /// Number of spread units.
    pub quantity: Decimal,
    /// Net limit price per unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    /// Expiration settings.
    pub expiration: OrderExpirationRequest,
    /// The legs, in strategy order.
    pub legs: Vec<OrderLeg>,
}

/// Request for a cost preview without placing an order.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PreflightRequest {
    /// Instrument to trade.
    pub instrument: OrderInstrument,
    /// Buy or sell.
    pub order_side: OrderSide,
    /// Pricing style.
    pub order_type: OrderType,
    /// Expiration settings.
    pub expiration: OrderExpirationRequest,
    /// Quantity in shares or contracts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,
    /// Limit price for limit orders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    /// Session selection for equities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equity_market_session: Option<EquityMarketSession>,
}

/// Result of a preflight calculation.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PreflightResponse {
    /// Instrument the calculation is for.
    pub instrument: OrderInstrument,
    /// Gross order value.
    #[serde(default)]
    pub order_value: Option<Decimal>,
    /// Estimated commission.
    #[serde(default)]
    pub estimated_commission: Option<Decimal>,
    /// Estimated total cost including fees.
    #[serde(default)]
    pub estimated_cost: Option<Decimal>,
}

/// The server-side state of an order.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order id.
    pub order_id: String,
    /// Instrument the order trades.
    pub instrument: OrderInstrument,
    /// Pricing style.
    #[serde(rename = "type")]
    pub order_type: OrderType,
    /// Buy or sell.
    pub side: OrderSide,
    /// Current lifecycle status.
    pub status: OrderStatus,
    /// Ordered quantity.
    #[serde(default)]
    pub quantity: Option<Decimal>,
    /// Quantity executed so far.
    #[serde(default)]
    pub filled_quantity: Option<Decimal>,
    /// Volume-weighted average fill price.
    #[serde(default)]
    pub average_price: Option<Decimal>,
    /// Limit price, if any.
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    /// Stop price, if any.
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    /// Broker-provided reason when `status` is `REJECTED`.
    #[serde(default)]
    pub reject_reason: Option<String>,
    /// When the order was accepted.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Acknowledgement returned when an order is placed.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponse {
    /// Id of the accepted order.
    pub order_id: String,
}
