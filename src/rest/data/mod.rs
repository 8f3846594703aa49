//! Typed request and response data for the brokerage REST routes.
//!
//! All wire formats are JSON with camelCase keys. Money and quantity fields
//! are [`rust_decimal::Decimal`] so values stay decimal-precise end to end.

pub mod account;
pub mod history;
pub mod instrument;
pub mod instrument_type;
pub mod option;
pub mod order;
pub mod portfolio;
pub mod quote;

pub use account::{Account, AccountsResponse, AccountType};
pub use history::{HistoryRequest, HistoryResponsePage, HistoryTransaction, TransactionType};
pub use instrument::{Instrument, InstrumentsRequest, InstrumentsResponse, Trading};
pub use instrument_type::InstrumentType;
pub use option::{
    GreeksResponse, GreekValues, OptionChainRequest, OptionChainResponse, OptionContract,
    OptionExpirationsRequest, OptionExpirationsResponse, OptionGreeks,
};
pub use order::{
    MultilegOrderRequest, MultilegPreflightRequest, NewOrderResponse, Order,
    OrderExpirationRequest, OrderLeg, OrderRequest, OrderSide, OrderStatus, OrderType,
    PreflightRequest, PreflightResponse, TimeInForce,
};
pub use portfolio::{BuyingPower, Portfolio, PortfolioPosition};
pub use quote::{OrderInstrument, Quote, QuoteOutcome};
