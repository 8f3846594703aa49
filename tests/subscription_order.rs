//! Behavior tests for the order subscription manager and its waiting
//! primitives, driven by scripted order sources and the paused tokio clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::{Duration, Instant};

use public_com_api::prelude::ApiError;
use public_com_api::rest::data::{
    Order, OrderInstrument, OrderSide, OrderStatus, OrderType,
};
use public_com_api::subscription::order::{
    OrderCallback, OrderSource, OrderSubscriptionManager, OrderUpdate,
};
use public_com_api::subscription::SubscriptionStatus;

const ACCOUNT: &str = "ACC-001";
const ORDER_ID: &str = "ORD-1";

fn aapl() -> OrderInstrument {
    OrderInstrument::equity("AAPL")
}

fn order(status: OrderStatus, filled: Option<Decimal>, average: Option<Decimal>) -> Order {
    Order {
        order_id: ORDER_ID.to_owned(),
        instrument: aapl(),
        order_type: OrderType::Limit,
        side: OrderSide::Buy,
        status,
        quantity: Some(dec!(10)),
        filled_quantity: filled,
        average_price: average,
        limit_price: Some(dec!(150.00)),
        stop_price: None,
        reject_reason: None,
        created_at: None,
    }
}

/// Returns one scripted order per fetch call, repeating the last entry once
/// the script runs out. Records every call.
#[derive(Debug)]
struct ScriptedOrderSource {
    script: Mutex<VecDeque<Order>>,
    last: Mutex<Order>,
    calls: Mutex<Vec<(Instant, String)>>,
}

impl ScriptedOrderSource {
    fn new(script: &[Order]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.to_vec().into()),
            last: Mutex::new(
                script
                    .last()
                    .cloned()
                    .unwrap_or_else(|| order(OrderStatus::New, None, None)),
            ),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl OrderSource for ScriptedOrderSource {
    fn fetch_order(
        &self,
        _account_id: String,
        order_id: String,
    ) -> BoxFuture<'static, Result<Order>> {
        self.calls.lock().unwrap().push((Instant::now(), order_id));

        let next = match self.script.lock().unwrap().pop_front() {
            Some(order) => {
                *self.last.lock().unwrap() = order.clone();
                order
            }
            None => self.last.lock().unwrap().clone(),
        };

        futures_util::future::ready(Ok(next)).boxed()
    }
}

/// Fails every fetch with a server error.
#[derive(Debug)]
struct BrokenOrderSource;

impl OrderSource for BrokenOrderSource {
    fn fetch_order(
        &self,
        _account_id: String,
        _order_id: String,
    ) -> BoxFuture<'static, Result<Order>> {
        futures_util::future::ready(Err(ApiError::Server {
            status: 503,
            message: "unavailable".to_owned(),
        }
        .into()))
        .boxed()
    }
}

fn recording_callback() -> (OrderCallback, Arc<Mutex<Vec<OrderUpdate>>>) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);

    let callback = OrderCallback::sync(move |update| {
        sink.lock().unwrap().push(update);
        Ok(())
    });

    (callback, updates)
}

#[tokio::test(start_paused = true)]
async fn status_transition_dispatches_update_and_auto_cancels() -> Result<()> {
    let source = ScriptedOrderSource::new(&[
        order(OrderStatus::New, None, None),
        order(OrderStatus::Filled, Some(dec!(10)), Some(dec!(150.25))),
    ]);
    let manager = OrderSubscriptionManager::new(source.clone());

    let (callback, updates) = recording_callback();
    let id = manager.subscribe(ACCOUNT, ORDER_ID, callback, None).await?;

    tokio::time::sleep(Duration::from_millis(2500)).await;

    {
        let updates = updates.lock().unwrap();

        // Seed observation, then the NEW -> FILLED transition.
        assert_eq!(updates.len(), 2);
        assert!(updates[0].old_status.is_none());
        assert_eq!(updates[0].new_status, OrderStatus::New);

        let fill = &updates[1];
        assert_eq!(fill.order_id, ORDER_ID);
        assert_eq!(fill.old_status, Some(OrderStatus::New));
        assert_eq!(fill.new_status, OrderStatus::Filled);
        assert_eq!(fill.order.average_price, Some(dec!(150.25)));
    }

    // Terminal status auto-cancelled the subscription after its final
    // dispatch, and polling for the order stopped.
    assert!(manager.get_subscription_info(&id).is_none());
    assert!(manager.get_active_subscriptions().is_empty());

    let calls_at_terminal = source.call_count();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(source.call_count(), calls_at_terminal);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn fill_progress_with_same_status_still_dispatches() -> Result<()> {
    let source = ScriptedOrderSource::new(&[
        order(OrderStatus::PartiallyFilled, Some(dec!(5)), Some(dec!(150.00))),
        order(OrderStatus::PartiallyFilled, Some(dec!(7)), Some(dec!(150.10))),
    ]);
    let manager = OrderSubscriptionManager::new(source);

    let (callback, updates) = recording_callback();
    manager.subscribe(ACCOUNT, ORDER_ID, callback, None).await?;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    manager.stop().await;

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].old_status, Some(OrderStatus::PartiallyFilled));
    assert_eq!(updates[1].new_status, OrderStatus::PartiallyFilled);
    assert_eq!(updates[1].order.filled_quantity, Some(dec!(7)));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn wait_for_status_times_out_when_status_never_arrives() {
    let source = ScriptedOrderSource::new(&[order(OrderStatus::New, None, None)]);
    let manager = OrderSubscriptionManager::new(source);

    let started = Instant::now();
    let err = manager
        .wait_for(
            ACCOUNT,
            ORDER_ID,
            |order| order.status == OrderStatus::Cancelled,
            Duration::from_secs(10),
        )
        .await
        .expect_err("wait must time out");

    let elapsed = started.elapsed();
    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::WaitTimeout)
    ));
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed <= Duration::from_secs(11));

    // The wait's internal subscription was cleaned up.
    assert!(manager.get_active_subscriptions().is_empty());

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wait_for_terminal_status_released_by_fill() -> Result<()> {
    let source = ScriptedOrderSource::new(&[
        order(OrderStatus::New, None, None),
        order(OrderStatus::New, None, None),
        order(OrderStatus::Filled, Some(dec!(10)), Some(dec!(149.90))),
    ]);
    let manager = OrderSubscriptionManager::new(source);

    let started = Instant::now();
    let filled = manager
        .wait_for(
            ACCOUNT,
            ORDER_ID,
            |order| order.status.is_terminal(),
            Duration::from_secs(30),
        )
        .await?;

    assert_eq!(filled.status, OrderStatus::Filled);
    assert_eq!(filled.filled_quantity, Some(dec!(10)));
    assert!(started.elapsed() <= Duration::from_secs(3));

    assert!(manager.get_active_subscriptions().is_empty());

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn wait_for_mismatched_status_cancelled_on_terminal() {
    let source = ScriptedOrderSource::new(&[
        order(OrderStatus::New, None, None),
        order(OrderStatus::Cancelled, None, None),
    ]);
    let manager = OrderSubscriptionManager::new(source);

    // The order terminates as CANCELLED, so a waiter for FILLED can never be
    // satisfied and must be woken instead of stranded.
    let err = manager
        .wait_for(
            ACCOUNT,
            ORDER_ID,
            |order| order.status == OrderStatus::Filled,
            Duration::from_secs(30),
        )
        .await
        .expect_err("waiter must be released with a cancellation");

    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::WaitCancelled)
    ));

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wait_returns_immediately_when_observation_already_matches() -> Result<()> {
    let source = ScriptedOrderSource::new(&[order(OrderStatus::New, None, None)]);
    let manager = OrderSubscriptionManager::new(source.clone());

    let (callback, _updates) = recording_callback();
    manager.subscribe(ACCOUNT, ORDER_ID, callback, None).await?;

    // Let the loop seed the observation.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let calls_before = source.call_count();

    let started = Instant::now();
    let seen = manager
        .wait_for(
            ACCOUNT,
            ORDER_ID,
            |order| order.status == OrderStatus::New,
            Duration::from_secs(10),
        )
        .await?;

    assert_eq!(seen.status, OrderStatus::New);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(source.call_count(), calls_before);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn waiters_are_released_when_the_manager_stops() -> Result<()> {
    let source = ScriptedOrderSource::new(&[order(OrderStatus::New, None, None)]);
    let manager = Arc::new(OrderSubscriptionManager::new(source));

    let waiting = {
        let manager = Arc::clone(&manager);

        tokio::spawn(async move {
            manager
                .wait_for(
                    ACCOUNT,
                    ORDER_ID,
                    |order| order.status == OrderStatus::Filled,
                    Duration::from_secs(60),
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    manager.stop().await;

    let err = waiting
        .await?
        .expect_err("stop must release pending waiters");
    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::WaitCancelled)
    ));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_release_the_waiter() {
    let manager = OrderSubscriptionManager::new(Arc::new(BrokenOrderSource));

    // Default config: three retries with exponential backoff, so the wait's
    // internal subscription errors out at t = 7s, well inside the timeout.
    let started = Instant::now();
    let err = manager
        .wait_for(
            ACCOUNT,
            ORDER_ID,
            |order| order.status.is_terminal(),
            Duration::from_secs(30),
        )
        .await
        .expect_err("waiter must be released when the subscription errors");

    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::WaitCancelled)
    ));
    assert!(started.elapsed() < Duration::from_secs(30));

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_stops_updates_and_reports_unknown_ids() -> Result<()> {
    let source = ScriptedOrderSource::new(&[order(OrderStatus::New, None, None)]);
    let manager = OrderSubscriptionManager::new(source);

    let (callback, updates) = recording_callback();
    let id = manager.subscribe(ACCOUNT, ORDER_ID, callback, None).await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(manager.unsubscribe(&id));
    assert!(!manager.unsubscribe(&id));
    assert!(!manager.unsubscribe("not-a-real-id"));

    let count_at_unsubscribe = updates.lock().unwrap().len();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(updates.lock().unwrap().len(), count_at_unsubscribe);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn paused_order_subscription_skips_dispatch() -> Result<()> {
    let source = ScriptedOrderSource::new(&[
        order(OrderStatus::New, None, None),
        order(OrderStatus::PartiallyFilled, Some(dec!(1)), None),
        order(OrderStatus::PartiallyFilled, Some(dec!(2)), None),
        order(OrderStatus::PartiallyFilled, Some(dec!(3)), None),
    ]);
    let manager = OrderSubscriptionManager::new(source);

    let (callback, updates) = recording_callback();
    let id = manager.subscribe(ACCOUNT, ORDER_ID, callback, None).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(manager.pause(&id));
    assert_eq!(
        manager.get_subscription_info(&id).unwrap().status,
        SubscriptionStatus::Paused
    );

    let count_at_pause = updates.lock().unwrap().len();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(updates.lock().unwrap().len(), count_at_pause);

    assert!(manager.resume(&id));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(updates.lock().unwrap().len() > count_at_pause);

    manager.stop().await;

    Ok(())
}
