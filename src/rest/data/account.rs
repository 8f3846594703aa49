//! Account listing data.

use serde::{Deserialize, Serialize};

/// The product category of an account.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    /// Standard brokerage account.
    Brokerage,
    /// High-yield cash account.
    HighYield,
    /// Bond account.
    BondAccount,
    /// Advisor-managed assets.
    RiaAsset,
    /// Treasury account.
    Treasury,
    /// Traditional IRA.
    TraditionalIra,
    /// Roth IRA.
    RothIra,
}

/// Options trading approval level of an account.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsLevel {
    /// No options trading.
    #[serde(rename = "LEVEL_0")]
    Level0,
    /// Covered calls and cash-secured puts.
    #[serde(rename = "LEVEL_1")]
    Level1,
    /// Long options.
    #[serde(rename = "LEVEL_2")]
    Level2,
    /// Spreads.
    #[serde(rename = "LEVEL_3")]
    Level3,
}

/// Cash or margin.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerageAccountType {
    /// Cash account.
    Cash,
    /// Margin account.
    Margin,
}

/// What the account is permitted to do.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradePermissions {
    /// Full trading.
    BuyAndSell,
    /// Liquidation only.
    SellOnly,
    /// No trading.
    Disabled,
}

/// One account visible to the API key.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account identifier used in URL paths.
    pub account_id: String,
    /// Product category.
    pub account_type: AccountType,
    /// Options approval level, brokerage accounts only.
    #[serde(default)]
    pub options_level: Option<OptionsLevel>,
    /// Cash or margin, brokerage accounts only.
    #[serde(default)]
    pub brokerage_account_type: Option<BrokerageAccountType>,
    /// Current trade permissions.
    #[serde(default)]
    pub trade_permissions: Option<TradePermissions>,
}

/// Response of the account listing route.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AccountsResponse {
    /// All accounts visible to the API key.
    pub accounts: Vec<Account>,
}
