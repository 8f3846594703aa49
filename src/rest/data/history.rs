//! Transaction history data.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::rest::data::quote::OrderInstrument;

/// The category of a ledger transaction.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    /// An executed trade.
    Trade,
    /// A dividend payment.
    Dividend,
    /// Interest earned or charged.
    Interest,
    /// An inbound transfer.
    Deposit,
    /// An outbound transfer.
    Withdrawal,
    /// A broker fee.
    Fee,
}

/// One ledger transaction.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTransaction {
    /// Transaction id.
    pub transaction_id: String,
    /// Category.
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    /// Instrument involved, trades and dividends only.
    #[serde(default)]
    pub instrument: Option<OrderInstrument>,
    /// Signed cash amount.
    #[serde(default)]
    pub amount: Option<Decimal>,
    /// Quantity of the instrument, trades only.
    #[serde(default)]
    pub quantity: Option<Decimal>,
    /// Execution price, trades only.
    #[serde(default)]
    pub price: Option<Decimal>,
    /// When the transaction settled.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Page selector for the history route, sent as query parameters.
#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    /// Maximum transactions per page.
    pub page_size: Option<u32>,
    /// Opaque continuation token from a prior page.
    pub next_token: Option<String>,
}

impl HistoryRequest {
    /// Render the selector as query pairs.
    #[must_use]
    pub fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();

        if let Some(page_size) = self.page_size {
            pairs.push(("pageSize", page_size.to_string()));
        }
        if let Some(ref next_token) = self.next_token {
            pairs.push(("nextToken", next_token.clone()));
        }

        pairs
    }
}

/// One page of transaction history.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponsePage {
    /// Transactions in this page, newest first.
    pub transactions: Vec<HistoryTransaction>,
    /// Token for the next page, absent on the last page.
    #[serde(default)]
    pub next_token: Option<String>,
}
