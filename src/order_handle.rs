//! Handle to a placed order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::client::PublicApiClient;
use crate::rest::data::order::{Order, OrderStatus};
use crate::subscription::{OrderCallback, OrderSubscriptionConfig};

/// A successfully placed order.
///
/// Returned by [`PublicApiClient::place_order`] and
/// [`PublicApiClient::place_multileg_order`]. The handle reads order state
/// through the client and leans on the client's order subscription manager
/// for update callbacks and waiting, so it stays cheap to clone and never
/// keeps polling resources alive by itself.
#[derive(Debug, Clone)]
pub struct NewOrder {
    order_id: String,
    account_id: String,
    client: PublicApiClient,
    subscription_id: Arc<Mutex<Option<String>>>,
}

impl NewOrder {
    pub(crate) fn new(order_id: String, account_id: String, client: PublicApiClient) -> Self {
        Self {
            order_id,
            account_id,
            client,
            subscription_id: Arc::new(Mutex::new(None)),
        }
    }

    /// The id of the placed order.
    #[must_use]
    pub fn order_id(&self) -> &str {
        &self.order_id
    }

    /// The account the order was placed in.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Fetch the current full order state.
    ///
    /// # Errors
    ///
    /// Will return an [`crate::prelude::ApiError`] classification if the
    /// order cannot be read.
    pub async fn get_order(&self) -> Result<Order> {
        self.client
            .get_order(&self.order_id, Some(&self.account_id))
            .await
    }

    /// Fetch the current order status.
    ///
    /// # Errors
    ///
    /// Will return an [`crate::prelude::ApiError`] classification if the
    /// order cannot be read.
    pub async fn get_status(&self) -> Result<OrderStatus> {
        Ok(self.get_order().await?.status)
    }

    /// Request cancellation of the order.
    ///
    /// Cancelling an order that already reached a terminal status fails with
    /// the server's error so racing callers notice; it never corrupts state.
    ///
    /// # Errors
    ///
    /// Will return an [`crate::prelude::ApiError`] classification if the
    /// cancel request is rejected.
    pub async fn cancel(&self) -> Result<()> {
        self.client
            .cancel_order(&self.order_id, Some(&self.account_id))
            .await
    }

    /// Subscribe `callback` to status updates for this order.
    ///
    /// A previous subscription created through this handle is replaced.
    ///
    /// # Errors
    ///
    /// Will return [`crate::prelude::ApiError::InvalidPollingFrequency`] if
    /// the config is out of range.
    pub async fn subscribe_updates(
        &self,
        callback: OrderCallback,
        config: Option<OrderSubscriptionConfig>,
    ) -> Result<String> {
        let id = self
            .client
            .order_stream()
            .subscribe(&self.account_id, &self.order_id, callback, config)
            .await?;

        let previous = {
            let mut slot = self
                .subscription_id
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.replace(id.clone())
        };

        if let Some(previous) = previous {
            self.client.order_stream().unsubscribe(&previous);
        }

        Ok(id)
    }

    /// Remove the subscription created by [`NewOrder::subscribe_updates`],
    /// if any. Returns `false` when there was none.
    pub fn unsubscribe(&self) -> bool {
        let id = self
            .subscription_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();

        match id {
            Some(id) => self.client.order_stream().unsubscribe(&id),
            None => false,
        }
    }

    /// Block until the order reaches `target` status or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Will return [`crate::prelude::ApiError::WaitTimeout`] when the
    /// deadline passes and [`crate::prelude::ApiError::WaitCancelled`] when
    /// the wait's subscription is cancelled first.
    pub async fn wait_for_status(&self, target: OrderStatus, timeout: Duration) -> Result<Order> {
        self.client
            .order_stream()
            .wait_for(
                &self.account_id,
                &self.order_id,
                move |order| order.status == target,
                timeout,
            )
            .await
    }

    /// Block until the order reaches any terminal status (`FILLED`,
    /// `CANCELLED`, `REJECTED`, `EXPIRED`) or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Will return [`crate::prelude::ApiError::WaitTimeout`] when the
    /// deadline passes and [`crate::prelude::ApiError::WaitCancelled`] when
    /// the wait's subscription is cancelled first.
    pub async fn wait_for_terminal_status(&self, timeout: Duration) -> Result<Order> {
        self.client
            .order_stream()
            .wait_for(
                &self.account_id,
                &self.order_id,
                |order| order.status.is_terminal(),
                timeout,
            )
            .await
    }
}
