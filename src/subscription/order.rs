//! The order subscription manager.
//!
//! Same polling shape as the price side, specialized to order subjects, plus
//! a waiter registry: `wait_for_status` style calls park on a oneshot that
//! the scheduler releases when a freshly observed order matches the waiter's
//! predicate. A subscription whose order reaches a terminal status is
//! cancelled automatically after its final dispatch, since no further
//! updates can arrive.

use core::fmt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::prelude::{ApiError, OrderSourceRef};
use crate::rest::data::order::{Order, OrderStatus};
use crate::subscription::{
    backoff_delay, lock, route_worker, spawn_dispatch_pool, validate_polling_frequency, Callback,
    DispatchJob, DispatchSender, OrderSubscriptionConfig, Registry, Subscription,
    SubscriptionInfo, SubscriptionStatus, IDLE_POLL, STOP_GRACE,
};

/// Identity of one polled order: the account it lives in plus its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderKey {
    /// Account the order belongs to.
    pub account_id: String,
    /// The order id.
    pub order_id: String,
}

/// Supplies order state to the polling loop.
pub trait OrderSource: Send + Sync + fmt::Debug {
    /// Fetch the current state of one order.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification when the upstream call
    /// fails; the scheduler turns that into retry/backoff handling.
    fn fetch_order(&self, account_id: String, order_id: String) -> BoxFuture<'static, Result<Order>>;
}

/// Event dispatched to order subscribers.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    /// The subscription the event is for.
    pub subscription_id: String,
    /// The order that changed.
    pub order_id: String,
    /// Status before the change, absent for the first observation.
    pub old_status: Option<OrderStatus>,
    /// Status after the change.
    pub new_status: OrderStatus,
    /// The full order as last observed.
    pub order: Order,
    /// When the change was detected.
    pub timestamp: DateTime<Utc>,
}

/// Callback type for order subscriptions.
pub type OrderCallback = Callback<OrderUpdate>;

type OrderRegistry = Registry<OrderKey, Order, OrderUpdate>;

/// A parked `wait_for_*` caller.
struct OrderWaiter {
    predicate: Box<dyn Fn(&Order) -> bool + Send + Sync>,
    tx: futures_channel::oneshot::Sender<Result<Order>>,
}

impl fmt::Debug for OrderWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OrderWaiter")
    }
}

type WaiterMap = HashMap<String, Vec<OrderWaiter>>;

/// Running scheduler and dispatch pool of a started manager.
#[derive(Debug)]
struct EngineRuntime {
    shutdown: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    dispatch: Vec<DispatchSender<OrderUpdate>>,
}

/// Turns the order endpoint into per-subscriber status update streams and
/// waiting primitives.
#[derive(Debug)]
pub struct OrderSubscriptionManager {
    source: OrderSourceRef,
    registry: Arc<Mutex<OrderRegistry>>,
    waiters: Arc<Mutex<WaiterMap>>,
    wake: Arc<Notify>,
    runtime: tokio::sync::Mutex<Option<EngineRuntime>>,
}

impl OrderSubscriptionManager {
    /// Create a manager polling orders from `source`.
    #[must_use]
    pub fn new(source: OrderSourceRef) -> Self {
        Self {
            source,
            registry: Arc::new(Mutex::new(Registry::new())),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribe `callback` to status updates for one order.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::InvalidPollingFrequency`] if the config is out
    /// of range.
    pub async fn subscribe(
        &self,
        account_id: &str,
        order_id: &str,
        callback: OrderCallback,
        config: Option<OrderSubscriptionConfig>,
    ) -> Result<String> {
        let config = config.unwrap_or_default();
        config.validate()?;

        self.start().await;

        let subject = OrderKey {
            account_id: account_id.trim().to_owned(),
            order_id: order_id.trim().to_owned(),
        };

        let id = {
            let mut registry = lock(&self.registry);
            let sub = Subscription::new(vec![subject], callback, config);
            let id = sub.id.clone();
            registry.add(sub);
            id
        };

        self.wake.notify_one();
        log::info!("Created order subscription {id} for order {order_id}");

        Ok(id)
    }

    /// Remove a subscription, waking any of its waiters with `WaitCancelled`.
    /// Returns `false` for an unknown id.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = {
            let mut registry = lock(&self.registry);
            registry.remove(id).map(|mut sub| {
                sub.set_status(SubscriptionStatus::Cancelled);
            })
        };

        if removed.is_none() {
            return false;
        }

        if let Some(waiters) = lock(&self.waiters).remove(id) {
            release_waiters(waiters);
        }

        self.wake.notify_one();
        log::info!("Removed order subscription {id}");

        true
    }

    /// Remove every subscription and wake every waiter with `WaitCancelled`.
    pub fn unsubscribe_all(&self) {
        let drained = lock(&self.registry).drain_all();

        for waiters in lock(&self.waiters).drain().map(|(_, waiters)| waiters) {
            release_waiters(waiters);
        }

        self.wake.notify_one();
        log::info!("Removed all {} order subscriptions", drained.len());
    }

    /// Pause delivery and polling for a subscription.
    ///
    /// Returns `false` for an unknown id or one that is not pausable.
    pub fn pause(&self, id: &str) -> bool {
        let mut registry = lock(&self.registry);

        match registry.subscriptions.get_mut(id) {
            Some(sub) if sub.status == SubscriptionStatus::Active => {
                sub.set_status(SubscriptionStatus::Paused);
                true
            }
            Some(sub) => sub.status == SubscriptionStatus::Paused,
            None => false,
        }
    }

    /// Resume a paused (or errored) subscription, resetting its retry
    /// counter.
    pub fn resume(&self, id: &str) -> bool {
        let resumed = {
            let mut registry = lock(&self.registry);

            match registry.subscriptions.get_mut(id) {
                Some(sub)
                    if matches!(
                        sub.status,
                        SubscriptionStatus::Paused | SubscriptionStatus::Error
                    ) =>
                {
                    sub.set_status(SubscriptionStatus::Active);
                    sub.consecutive_failures = 0;
                    true
                }
                Some(sub) => sub.status == SubscriptionStatus::Active,
                None => false,
            }
        };

        if resumed {
            self.wake.notify_one();
        }

        resumed
    }

    /// Change the polling frequency of a subscription.
    ///
    /// Returns `Ok(false)` for an unknown id.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::InvalidPollingFrequency`] if `seconds` is
    /// outside `[0.1, 60.0]`.
    pub fn set_polling_frequency(&self, id: &str, seconds: f64) -> Result<bool> {
        validate_polling_frequency(seconds)?;

        let updated = {
            let mut registry = lock(&self.registry);

            match registry.subscriptions.get_mut(id) {
                Some(sub) => {
                    sub.config.polling_frequency_seconds = seconds;

                    let candidate = Instant::now() + sub.config.period();
                    if candidate < sub.next_due_at {
                        sub.next_due_at = candidate;
                    }

                    true
                }
                None => false,
            }
        };

        if updated {
            self.wake.notify_one();
        }

        Ok(updated)
    }

    /// Ids of every active subscription.
    #[must_use]
    pub fn get_active_subscriptions(&self) -> Vec<String> {
        lock(&self.registry).active_ids()
    }

    /// An immutable snapshot of one subscription, or `None` for an unknown id.
    #[must_use]
    pub fn get_subscription_info(&self, id: &str) -> Option<SubscriptionInfo<OrderKey>> {
        lock(&self.registry)
            .subscriptions
            .get(id)
            .map(Subscription::snapshot)
    }

    /// Block until the observed order satisfies `predicate` or `timeout`
    /// elapses.
    ///
    /// The wait piggy-backs on the shared polling loop through a short-lived
    /// internal subscription, so concurrent waiters on one order cost a
    /// single upstream fetch per tick.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::WaitTimeout`] when the deadline passes and
    /// [`ApiError::WaitCancelled`] when the backing subscription is cancelled
    /// first.
    pub async fn wait_for<P>(
        &self,
        account_id: &str,
        order_id: &str,
        predicate: P,
        timeout: Duration,
    ) -> Result<Order>
    where
        P: Fn(&Order) -> bool + Send + Sync + 'static,
    {
        self.start().await;

        let subject = OrderKey {
            account_id: account_id.trim().to_owned(),
            order_id: order_id.trim().to_owned(),
        };

        // Fast path: the loop already observed a matching order.
        let seen = lock(&self.registry)
            .last_observation
            .get(&subject)
            .filter(|&order| predicate(order))
            .cloned();

        if let Some(order) = seen {
            return Ok(order);
        }

        let sub_id = {
            let mut registry = lock(&self.registry);
            let sub = Subscription::new(
                vec![subject],
                Callback::sync(|_update| Ok(())),
                OrderSubscriptionConfig::default(),
            );
            let id = sub.id.clone();
            registry.add(sub);
            id
        };

        let (tx, rx) = futures_channel::oneshot::channel();

        lock(&self.waiters)
            .entry(sub_id.clone())
            .or_default()
            .push(OrderWaiter {
                predicate: Box::new(predicate),
                tx,
            });

        self.wake.notify_one();

        let outcome = tokio::time::timeout(timeout, rx).await;

        lock(&self.waiters).remove(&sub_id);
        self.unsubscribe(&sub_id);

        match outcome {
            Err(_elapsed) => anyhow::bail!(ApiError::WaitTimeout),
            Ok(Err(_cancelled)) => anyhow::bail!(ApiError::WaitCancelled),
            Ok(Ok(result)) => result,
        }
    }

    /// Start the scheduler and dispatch pool. Idempotent; `subscribe` and
    /// `wait_for` call this lazily.
    pub async fn start(&self) {
        let mut runtime = self.runtime.lock().await;

        if runtime.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatch, workers) = spawn_dispatch_pool();

        let scheduler = tokio::spawn(run_scheduler(
            Arc::clone(&self.source),
            Arc::clone(&self.registry),
            Arc::clone(&self.waiters),
            Arc::clone(&self.wake),
            dispatch.clone(),
            shutdown_rx,
        ));

        *runtime = Some(EngineRuntime {
            shutdown: shutdown_tx,
            scheduler,
            workers,
            dispatch,
        });

        log::info!("Order subscription manager started");
    }

    /// Stop the scheduler, drain the dispatch pool within a bounded grace
    /// period, cancel every subscription, and wake every waiter with
    /// `WaitCancelled`. Idempotent.
    pub async fn stop(&self) {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return;
        };

        let _ = runtime.shutdown.send(true);

        let mut scheduler = runtime.scheduler;
        if tokio::time::timeout(STOP_GRACE, &mut scheduler).await.is_err() {
            log::warn!("Order scheduler did not stop within grace period, aborting");
            scheduler.abort();
        }

        drop(runtime.dispatch);
        for mut worker in runtime.workers {
            if tokio::time::timeout(STOP_GRACE, &mut worker).await.is_err() {
                log::warn!("Order dispatch worker did not drain within grace period, aborting");
                worker.abort();
            }
        }

        let drained = lock(&self.registry).drain_all();

        for waiters in lock(&self.waiters).drain().map(|(_, waiters)| waiters) {
            release_waiters(waiters);
        }

        log::info!(
            "Order subscription manager stopped, cancelled {} subscriptions",
            drained.len()
        );
    }
}

/// Wake parked waiters with `WaitCancelled`.
fn release_waiters(waiters: Vec<OrderWaiter>) {
    for waiter in waiters {
        let _ = waiter.tx.send(Err(ApiError::WaitCancelled.into()));
    }
}

/// Whether two observations of one order differ in any dispatched field.
fn orders_equal(a: &Order, b: &Order) -> bool {
    a.status == b.status
        && a.filled_quantity == b.filled_quantity
        && a.average_price == b.average_price
}

/// The scheduler loop: sleep until the earliest deadline, fetch every due
/// order once, diff, dispatch, release waiters, reschedule.
async fn run_scheduler(
    source: OrderSourceRef,
    registry: Arc<Mutex<OrderRegistry>>,
    waiters: Arc<Mutex<WaiterMap>>,
    wake: Arc<Notify>,
    dispatch: Vec<DispatchSender<OrderUpdate>>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::debug!("Order scheduler loop running");

    loop {
        let deadline = lock(&registry)
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + IDLE_POLL);

        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {}
            () = wake.notified() => continue,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }

        let now = Instant::now();
        let (due_ids, due_subjects) = lock(&registry).due(now);

        if due_subjects.is_empty() {
            continue;
        }

        log::debug!(
            "Polling {} orders for {} due subscriptions",
            due_subjects.len(),
            due_ids.len()
        );

        // One fetch per distinct order per tick; shared across subscribers.
        let results = join_all(due_subjects.into_iter().map(|subject| {
            let source = Arc::clone(&source);

            async move {
                let fetched = source
                    .fetch_order(subject.account_id.clone(), subject.order_id.clone())
                    .await;

                (subject, fetched)
            }
        }))
        .await;

        let due_set: HashSet<String> = due_ids.into_iter().collect();
        let mut jobs = Vec::new();

        {
            let mut reg = lock(&registry);
            let mut parked = lock(&waiters);

            for (subject, fetched) in results {
                match fetched {
                    Ok(order) => apply_order(
                        &mut reg,
                        &mut parked,
                        &due_set,
                        &subject,
                        order,
                        now,
                        &mut jobs,
                    ),
                    Err(err) => fail_subject(&mut reg, &mut parked, &due_set, &subject, &err, now),
                }
            }
        }

        for job in jobs {
            let worker = route_worker(dispatch.len(), &job.subscription_id);

            if dispatch[worker].send(job).await.is_err() {
                return;
            }
        }
    }

    log::debug!("Order scheduler loop exited");
}

/// Record one fresh observation: diff it, build dispatch jobs, release
/// matching waiters, auto-cancel on terminal status, reschedule.
fn apply_order(
    reg: &mut OrderRegistry,
    parked: &mut WaiterMap,
    due_set: &HashSet<String>,
    subject: &OrderKey,
    order: Order,
    now: Instant,
    jobs: &mut Vec<DispatchJob<OrderUpdate>>,
) {
    let Some(ids) = reg.subject_index.get(subject) else {
        return;
    };
    let ids: Vec<String> = ids.iter().cloned().collect();

    let at = Utc::now();
    let prior = reg.record_observation(subject.clone(), order.clone());
    let old_status = prior.as_ref().map(|previous| previous.status);
    let changed = prior
        .as_ref()
        .map_or(true, |previous| !orders_equal(previous, &order));

    if changed {
        for id in &ids {
            let Some(sub) = reg.subscriptions.get_mut(id) else {
                continue;
            };

            if sub.status != SubscriptionStatus::Active {
                continue;
            }

            sub.last_event_at = Some(at);

            jobs.push(DispatchJob {
                subscription_id: id.clone(),
                callback: sub.callback.clone(),
                event: OrderUpdate {
                    subscription_id: id.clone(),
                    order_id: subject.order_id.clone(),
                    old_status,
                    new_status: order.status,
                    order: order.clone(),
                    timestamp: at,
                },
                status: Arc::clone(&sub.status_mirror),
                failures: Arc::clone(&sub.callback_failures),
            });
        }
    }

    // Waiters see every fresh observation, changed or not.
    for id in &ids {
        if let Some(list) = parked.get_mut(id) {
            let pending = std::mem::take(list);

            for waiter in pending {
                if (waiter.predicate)(&order) {
                    let _ = waiter.tx.send(Ok(order.clone()));
                } else {
                    list.push(waiter);
                }
            }
        }
    }

    if order.status.is_terminal() {
        // No further transitions can arrive: cancel every subscription on
        // this order after its final dispatch. The status mirror is left
        // untouched so the queued final event still delivers.
        for id in &ids {
            if let Some(waiters) = parked.remove(id) {
                release_waiters(waiters);
            }

            reg.remove(id);
            log::info!(
                "Order subscription {id} auto-cancelled, order {} reached {:?}",
                subject.order_id,
                order.status
            );
        }
    } else {
        for id in &ids {
            if !due_set.contains(id) {
                continue;
            }

            if let Some(sub) = reg.subscriptions.get_mut(id) {
                if sub.status == SubscriptionStatus::Active {
                    sub.consecutive_failures = 0;
                    sub.next_due_at = now + sub.config.period();
                }
            }
        }
    }
}

/// Apply the retry/backoff policy to the due subscriptions of one order
/// whose fetch failed.
fn fail_subject(
    reg: &mut OrderRegistry,
    parked: &mut WaiterMap,
    due_set: &HashSet<String>,
    subject: &OrderKey,
    err: &anyhow::Error,
    now: Instant,
) {
    let retry_hint = err
        .downcast_ref::<ApiError>()
        .and_then(|api_err| match api_err {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        });

    let Some(ids) = reg.subject_index.get(subject) else {
        return;
    };
    let ids: Vec<String> = ids.iter().cloned().collect();

    let mut errored = Vec::new();

    for id in &ids {
        if !due_set.contains(id) {
            continue;
        }

        let Some(sub) = reg.subscriptions.get_mut(id) else {
            continue;
        };

        if sub.status != SubscriptionStatus::Active {
            continue;
        }

        sub.consecutive_failures += 1;
        let failures = sub.consecutive_failures;

        if sub.config.retry_on_error && failures <= sub.config.max_retries {
            let mut delay = backoff_delay(&sub.config, failures);

            if let Some(hint) = retry_hint {
                delay = delay.max(Duration::from_secs(hint));
            }

            sub.next_due_at = now + delay;
            log::warn!(
                "Order fetch failed for subscription {id} (attempt {failures}): {err}; retrying in {delay:?}"
            );
        } else {
            sub.set_status(SubscriptionStatus::Error);
            errored.push(id.clone());
            log::error!("Order subscription {id} entered ERROR after {failures} failures: {err}");
        }
    }

    for id in &errored {
        if let Some(waiters) = parked.remove(id) {
            release_waiters(waiters);
        }
    }

    if !errored.is_empty() {
        reg.prune_observation(subject);
    }
}
