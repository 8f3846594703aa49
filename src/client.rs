//! The main client of the library.
//!
//! [`PublicApiClient`] owns the HTTP transport, the auth manager, and the two
//! subscription managers, and exposes the flat trading surface: accounts,
//! portfolio, quotes, instruments, history, options data, preflight
//! calculations, and order placement. Placing an order returns a
//! [`NewOrder`] handle layered on the order subscription manager.

use std::sync::Arc;

use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::auth::ApiKeyAuthConfig;
use crate::order_handle::NewOrder;
use crate::prelude::ApiError;
use crate::rest::data::account::AccountsResponse;
use crate::rest::data::history::{HistoryRequest, HistoryResponsePage};
use crate::rest::data::instrument::{Instrument, InstrumentsRequest, InstrumentsResponse};
use crate::rest::data::instrument_type::InstrumentType;
use crate::rest::data::option::{
    GreeksResponse, OptionChainRequest, OptionChainResponse, OptionExpirationsRequest,
    OptionExpirationsResponse, OptionGreeks,
};
use crate::rest::data::order::{
    MultilegOrderRequest, MultilegPreflightRequest, NewOrderResponse, Order, OrderRequest,
    PreflightRequest, PreflightResponse,
};
use crate::rest::data::portfolio::Portfolio;
use crate::rest::data::quote::{OrderInstrument, Quote};
use crate::rest::ApiClient;
use crate::subscription::order::{OrderSource, OrderSubscriptionManager};
use crate::subscription::price::{PriceSubscriptionManager, QuoteSource};
use crate::utils::config::PublicApiClientConfiguration;

/// Quote source backed by the quotes REST route, shared by every price
/// subscription.
#[derive(Debug)]
struct RestQuoteSource {
    api: Arc<ApiClient>,
    default_account: Option<String>,
}

impl QuoteSource for RestQuoteSource {
    fn fetch_quotes(
        &self,
        instruments: Vec<OrderInstrument>,
    ) -> BoxFuture<'static, Result<Vec<Quote>>> {
        let api = Arc::clone(&self.api);
        let account = self.default_account.clone();

        async move {
            let Some(account) = account else {
                anyhow::bail!(ApiError::MissingAccountId);
            };

            let res: crate::rest::data::quote::QuotesResponse = api
                .post(
                    &format!("/userapigateway/marketdata/{account}/quotes"),
                    &crate::rest::data::quote::QuotesRequest {
                        instruments: &instruments,
                    },
                )
                .await?;

            Ok(res.quotes)
        }
        .boxed()
    }
}

/// Order source backed by the order REST route, shared by every order
/// subscription and waiter.
#[derive(Debug)]
struct RestOrderSource {
    api: Arc<ApiClient>,
}

impl OrderSource for RestOrderSource {
    fn fetch_order(
        &self,
        account_id: String,
        order_id: String,
    ) -> BoxFuture<'static, Result<Order>> {
        let api = Arc::clone(&self.api);

        async move {
            api.get(
                &format!("/userapigateway/trading/{account_id}/order/{order_id}"),
                None,
            )
            .await
        }
        .boxed()
    }
}

/// Everything shared between client clones and order handles.
#[derive(Debug)]
struct ClientCore {
    api_client: Arc<ApiClient>,
    config: PublicApiClientConfiguration,
    price_stream: PriceSubscriptionManager,
    order_stream: OrderSubscriptionManager,
}

/// The Public.com brokerage API client.
///
/// Cloning is cheap and every clone shares the transport, auth state, and
/// subscription managers.
#[derive(Debug, Clone)]
pub struct PublicApiClient {
    core: Arc<ClientCore>,
}

impl PublicApiClient {
    /// Build a client from credentials and configuration.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::Validation`] if the configured endpoint is not
    /// a valid URL.
    pub fn new(
        auth_config: ApiKeyAuthConfig,
        config: PublicApiClientConfiguration,
    ) -> Result<Self> {
        let api_client = Arc::new(ApiClient::new(auth_config, &config.api_endpoint)?);

        let price_stream = PriceSubscriptionManager::new(Arc::new(RestQuoteSource {
            api: Arc::clone(&api_client),
            default_account: config.default_account_number.clone(),
        }));
        let order_stream = OrderSubscriptionManager::new(Arc::new(RestOrderSource {
            api: Arc::clone(&api_client),
        }));

        Ok(Self {
            core: Arc::new(ClientCore {
                api_client,
                config,
                price_stream,
                order_stream,
            }),
        })
    }

    /// The price subscription manager.
    #[must_use]
    pub fn price_stream(&self) -> &PriceSubscriptionManager {
        &self.core.price_stream
    }

    /// The order subscription manager.
    #[must_use]
    pub fn order_stream(&self) -> &OrderSubscriptionManager {
        &self.core.order_stream
    }

    /// The current base endpoint.
    #[must_use]
    pub fn api_endpoint(&self) -> String {
        self.core.api_client.base_url()
    }

    /// Point the client at a different endpoint, e.g. a staging environment.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::Validation`] if `endpoint` is not a valid URL.
    pub fn set_api_endpoint(&self, endpoint: &str) -> Result<()> {
        self.core.api_client.set_base_url(endpoint)
    }

    /// Resolve the account for an operation: the explicit one, else the
    /// configured default.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::MissingAccountId`] if neither is present.
    fn resolve_account(&self, account_id: Option<&str>) -> Result<String> {
        if let Some(account_id) = account_id {
            return Ok(account_id.to_owned());
        }

        match self.core.config.default_account_number {
            Some(ref default) => Ok(default.clone()),
            None => anyhow::bail!(ApiError::MissingAccountId),
        }
    }

    /// List the accounts visible to the API key.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_accounts(&self) -> Result<AccountsResponse> {
        self.core
            .api_client
            .get("/userapigateway/trading/account", None)
            .await
    }

    /// Fetch the portfolio snapshot of an account.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_portfolio(&self, account_id: Option<&str>) -> Result<Portfolio> {
        let account = self.resolve_account(account_id)?;

        self.core
            .api_client
            .get(
                &format!("/userapigateway/trading/{account}/portfolio/v2"),
                None,
            )
            .await
    }

    /// Fetch current quotes for a batch of instruments.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_quotes(
        &self,
        instruments: &[OrderInstrument],
        account_id: Option<&str>,
    ) -> Result<Vec<Quote>> {
        let account = self.resolve_account(account_id)?;

        let res: crate::rest::data::quote::QuotesResponse = self
            .core
            .api_client
            .post(
                &format!("/userapigateway/marketdata/{account}/quotes"),
                &crate::rest::data::quote::QuotesRequest { instruments },
            )
            .await?;

        Ok(res.quotes)
    }

    /// Fetch the quote of a single instrument.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::NotFound`] if the server returns no quote for
    /// the instrument.
    pub async fn get_quote(
        &self,
        instrument: &OrderInstrument,
        account_id: Option<&str>,
    ) -> Result<Quote> {
        let mut quotes = self
            .get_quotes(std::slice::from_ref(instrument), account_id)
            .await?;

        if quotes.is_empty() {
            anyhow::bail!(ApiError::NotFound(format!(
                "no quote returned for {}",
                instrument.symbol
            )));
        }

        Ok(quotes.swap_remove(0))
    }

    /// Fetch one page of account history.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_history(
        &self,
        history_request: Option<&HistoryRequest>,
        account_id: Option<&str>,
    ) -> Result<HistoryResponsePage> {
        let account = self.resolve_account(account_id)?;
        let params = history_request.map(HistoryRequest::to_query);

        self.core
            .api_client
            .get(
                &format!("/userapigateway/trading/{account}/history"),
                params.as_deref(),
            )
            .await
    }

    /// Fetch reference data for one instrument.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_instrument(
        &self,
        symbol: &str,
        instrument_type: InstrumentType,
    ) -> Result<Instrument> {
        let symbol = symbol.trim();

        self.core
            .api_client
            .get(
                &format!(
                    "/userapigateway/marketdata/instrument/{symbol}/{}",
                    instrument_type.as_str()
                ),
                None,
            )
            .await
    }

    /// List instruments, optionally filtered.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_all_instruments(
        &self,
        instruments_request: Option<&InstrumentsRequest>,
    ) -> Result<InstrumentsResponse> {
        let params = instruments_request.map(InstrumentsRequest::to_query);

        self.core
            .api_client
            .get("/userapigateway/marketdata/instruments", params.as_deref())
            .await
    }

    /// List the option expirations of an underlying.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_option_expirations(
        &self,
        request: &OptionExpirationsRequest,
        account_id: Option<&str>,
    ) -> Result<OptionExpirationsResponse> {
        let account = self.resolve_account(account_id)?;

        self.core
            .api_client
            .post(
                &format!("/userapigateway/marketdata/{account}/option-expirations"),
                request,
            )
            .await
    }

    /// Fetch the option chain of one underlying and expiration.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_option_chain(
        &self,
        request: &OptionChainRequest,
        account_id: Option<&str>,
    ) -> Result<OptionChainResponse> {
        let account = self.resolve_account(account_id)?;

        self.core
            .api_client
            .post(
                &format!("/userapigateway/marketdata/{account}/option-chain"),
                request,
            )
            .await
    }

    /// Fetch greeks for a list of option symbols.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_option_greeks(
        &self,
        symbols: &[String],
        account_id: Option<&str>,
    ) -> Result<GreeksResponse> {
        let account = self.resolve_account(account_id)?;
        let params = [("symbols", symbols.join(","))];

        self.core
            .api_client
            .get(
                &format!("/userapigateway/marketdata/{account}/greeks"),
                Some(&params),
            )
            .await
    }

    /// Fetch greeks for a single option symbol.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::NotFound`] if the server returns no greeks for
    /// the symbol.
    pub async fn get_option_greek(
        &self,
        symbol: &str,
        account_id: Option<&str>,
    ) -> Result<OptionGreeks> {
        let symbols = [symbol.to_owned()];
        let mut res = self.get_option_greeks(&symbols, account_id).await?;

        if res.greeks.is_empty() {
            anyhow::bail!(ApiError::NotFound(format!("no greeks found for {symbol}")));
        }

        Ok(res.greeks.swap_remove(0))
    }

    /// Preview the cost of a single-leg order without placing it.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn perform_preflight_calculation(
        &self,
        request: &PreflightRequest,
        account_id: Option<&str>,
    ) -> Result<PreflightResponse> {
        let account = self.resolve_account(account_id)?;

        self.core
            .api_client
            .post(
                &format!("/userapigateway/trading/{account}/preflight/single-leg"),
                request,
            )
            .await
    }

    /// Preview the cost of a multi-leg order without placing it.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn perform_multileg_preflight_calculation(
        &self,
        request: &MultilegPreflightRequest,
        account_id: Option<&str>,
    ) -> Result<PreflightResponse> {
        let account = self.resolve_account(account_id)?;

        self.core
            .api_client
            .post(
                &format!("/userapigateway/trading/{account}/preflight/multi-leg"),
                request,
            )
            .await
    }

    /// Place a single-leg order.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the order is rejected at
    /// submission.
    pub async fn place_order(
        &self,
        request: &OrderRequest,
        account_id: Option<&str>,
    ) -> Result<NewOrder> {
        let account = self.resolve_account(account_id)?;

        let res: NewOrderResponse = self
            .core
            .api_client
            .post(&format!("/userapigateway/trading/{account}/order"), request)
            .await?;

        log::info!("Placed order {}", res.order_id);

        Ok(NewOrder::new(res.order_id, account, self.clone()))
    }

    /// Place a multi-leg option order.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the order is rejected at
    /// submission.
    pub async fn place_multileg_order(
        &self,
        request: &MultilegOrderRequest,
        account_id: Option<&str>,
    ) -> Result<NewOrder> {
        let account = self.resolve_account(account_id)?;

        let res: NewOrderResponse = self
            .core
            .api_client
            .post(
                &format!("/userapigateway/trading/{account}/order/multileg"),
                request,
            )
            .await?;

        log::info!("Placed multi-leg order {}", res.order_id);

        Ok(NewOrder::new(res.order_id, account, self.clone()))
    }

    /// Fetch the current state of an order.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the request fails.
    pub async fn get_order(&self, order_id: &str, account_id: Option<&str>) -> Result<Order> {
        let account = self.resolve_account(account_id)?;

        self.core
            .api_client
            .get(
                &format!("/userapigateway/trading/{account}/order/{order_id}"),
                None,
            )
            .await
    }

    /// Request cancellation of an order.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification if the cancel request is
    /// rejected, including when the order is already terminal.
    pub async fn cancel_order(&self, order_id: &str, account_id: Option<&str>) -> Result<()> {
        let account = self.resolve_account(account_id)?;

        self.core
            .api_client
            .delete(&format!(
                "/userapigateway/trading/{account}/order/{order_id}"
            ))
            .await
    }

    /// Revoke the current access token server-side.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::Network`] if the revocation request cannot be
    /// sent.
    pub async fn revoke_token(&self) -> Result<()> {
        self.core.api_client.revoke_token().await
    }

    /// Shut the client down: stops both subscription managers, cancelling
    /// every subscription and waking pending waiters with `WaitCancelled`.
    pub async fn close(&self) {
        self.core.price_stream.stop().await;
        self.core.order_stream.stop().await;

        log::info!("Client closed");
    }
}
