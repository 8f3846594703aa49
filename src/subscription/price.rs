//! The price subscription manager.
//!
//! Multiplexes any number of client subscriptions over a single periodic
//! quote-polling loop. Each tick batches the union of due instruments into
//! one upstream call, diffs the results against the last seen quote, and
//! fans changes out to subscriber callbacks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::prelude::{ApiError, QuoteSourceRef};
use crate::rest::data::quote::{OrderInstrument, Quote, QuoteOutcome};
use crate::subscription::{
    backoff_delay, lock, route_worker, spawn_dispatch_pool, validate_polling_frequency, Callback,
    DispatchJob, DispatchSender, Registry, Subscription, SubscriptionConfig, SubscriptionInfo,
    SubscriptionStatus, IDLE_POLL, STOP_GRACE,
};

/// Supplies quote batches to the polling loop.
///
/// The returned quotes carry their instrument so responses can be matched
/// back to subjects regardless of ordering.
pub trait QuoteSource: Send + Sync + std::fmt::Debug {
    /// Fetch current quotes for a batch of instruments.
    ///
    /// # Errors
    ///
    /// Will return an [`ApiError`] classification when the upstream call
    /// fails; the scheduler turns that into retry/backoff handling.
    fn fetch_quotes(
        &self,
        instruments: Vec<OrderInstrument>,
    ) -> BoxFuture<'static, Result<Vec<Quote>>>;
}

/// Event dispatched to price subscribers.
#[derive(Debug, Clone)]
pub struct PriceChange {
    /// The subscription the event is for.
    pub subscription_id: String,
    /// The instrument whose quote changed.
    pub instrument: OrderInstrument,
    /// The previously seen quote, absent for the first observation.
    pub old_quote: Option<Quote>,
    /// The quote that triggered the event.
    pub new_quote: Quote,
    /// When the change was detected.
    pub timestamp: DateTime<Utc>,
}

/// Callback type for price subscriptions.
pub type PriceCallback = Callback<PriceChange>;

type PriceRegistry = Registry<OrderInstrument, Quote, PriceChange>;

/// Running scheduler and dispatch pool of a started manager.
#[derive(Debug)]
struct EngineRuntime {
    shutdown: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    dispatch: Vec<DispatchSender<PriceChange>>,
}

/// Turns the quote endpoint into per-subscriber price change streams.
///
/// The manager starts lazily on the first `subscribe`; `stop` is idempotent
/// and cancels every subscription.
#[derive(Debug)]
pub struct PriceSubscriptionManager {
    source: QuoteSourceRef,
    registry: Arc<Mutex<PriceRegistry>>,
    wake: Arc<Notify>,
    runtime: tokio::sync::Mutex<Option<EngineRuntime>>,
}

impl PriceSubscriptionManager {
    /// Create a manager polling quotes from `source`.
    #[must_use]
    pub fn new(source: QuoteSourceRef) -> Self {
        Self {
            source,
            registry: Arc::new(Mutex::new(Registry::new())),
            wake: Arc::new(Notify::new()),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    /// Subscribe `callback` to quote changes for `instruments`.
    ///
    /// Symbols are trimmed, and the new subscription is due immediately so
    /// the first observation of previously unseen instruments is seeded on
    /// the next tick.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::EmptySubscription`] if `instruments` is empty
    /// and [`ApiError::InvalidPollingFrequency`] if the config is out of
    /// range.
    pub async fn subscribe(
        &self,
        instruments: Vec<OrderInstrument>,
        callback: PriceCallback,
        config: Option<SubscriptionConfig>,
    ) -> Result<String> {
        if instruments.is_empty() {
            anyhow::bail!(ApiError::EmptySubscription);
        }

        let config = config.unwrap_or_default();
        config.validate()?;

        let instruments: Vec<OrderInstrument> = instruments
            .into_iter()
            .map(|instrument| OrderInstrument {
                symbol: instrument.symbol.trim().to_owned(),
                instrument_type: instrument.instrument_type,
            })
            .collect();

        self.start().await;

        let id = {
            let mut registry = lock(&self.registry);
            let sub = Subscription::new(instruments, callback, config);
            let id = sub.id.clone();
            registry.add(sub);
            id
        };

        self.wake.notify_one();
        log::info!("Created price subscription {id}");

        Ok(id)
    }

    /// Remove a subscription. Returns `false` for an unknown id.
    ///
    /// After this returns, no new callback for the id will start; at most one
    /// already in-flight dispatch completes.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = {
            let mut registry = lock(&self.registry);
            registry.remove(id).map(|mut sub| {
                sub.set_status(SubscriptionStatus::Cancelled);
            })
        };

        if removed.is_some() {
            self.wake.notify_one();
            log::info!("Removed price subscription {id}");
            true
        } else {
            false
        }
    }

    /// Remove every subscription.
    pub fn unsubscribe_all(&self) {
        let drained = lock(&self.registry).drain_all();

        self.wake.notify_one();
        log::info!("Removed all {} price subscriptions", drained.len());
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

    /// Resume a paused (or errored) subscription.
    ///
    /// The retry counter resets and the old deadline is kept, so the next
    /// tick catches up naturally.
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
    /// Returns `Ok(false)` for an unknown id. The deadline is pulled forward
    /// when the new period is shorter than the time remaining.
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
    pub fn get_subscription_info(&self, id: &str) -> Option<SubscriptionInfo<OrderInstrument>> {
        lock(&self.registry)
            .subscriptions
            .get(id)
            .map(Subscription::snapshot)
    }

    /// Start the scheduler and dispatch pool. Idempotent; `subscribe` calls
    /// this lazily.
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

        log::info!("Price subscription manager started");
    }

    /// Stop the scheduler, drain the dispatch pool within a bounded grace
    /// period, and cancel every subscription. Idempotent.
    pub async fn stop(&self) {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return;
        };

        let _ = runtime.shutdown.send(true);

        let mut scheduler = runtime.scheduler;
        if tokio::time::timeout(STOP_GRACE, &mut scheduler).await.is_err() {
            log::warn!("Price scheduler did not stop within grace period, aborting");
            scheduler.abort();
        }

        drop(runtime.dispatch);
        for mut worker in runtime.workers {
            if tokio::time::timeout(STOP_GRACE, &mut worker).await.is_err() {
                log::warn!("Price dispatch worker did not drain within grace period, aborting");
                worker.abort();
            }
        }

        let drained = lock(&self.registry).drain_all();
        log::info!(
            "Price subscription manager stopped, cancelled {} subscriptions",
            drained.len()
        );
    }
}

/// Whether two quotes differ in any dispatched field. Volume and open
/// interest are not compared; absent values compare as themselves.
fn quotes_equal(a: &Quote, b: &Quote) -> bool {
    a.last == b.last
        && a.bid == b.bid
        && a.bid_size == b.bid_size
        && a.ask == b.ask
        && a.ask_size == b.ask_size
}

/// The scheduler loop: sleep until the earliest deadline, fetch the union of
/// due instruments once, diff, dispatch, reschedule.
async fn run_scheduler(
    source: QuoteSourceRef,
    registry: Arc<Mutex<PriceRegistry>>,
    wake: Arc<Notify>,
    dispatch: Vec<DispatchSender<PriceChange>>,
    mut shutdown: watch::Receiver<bool>,
) {
    log::debug!("Price scheduler loop running");

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
            "Polling {} instruments for {} due subscriptions",
            due_subjects.len(),
            due_ids.len()
        );

        match source.fetch_quotes(due_subjects).await {
            Ok(quotes) => {
                let jobs = apply_quotes(&registry, &due_ids, quotes, now);

                for job in jobs {
                    let worker = route_worker(dispatch.len(), &job.subscription_id);

                    if dispatch[worker].send(job).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => record_failure(&registry, &due_ids, &err, now),
        }
    }

    log::debug!("Price scheduler loop exited");
}

/// Record fresh observations, diff them, build dispatch jobs for changed
/// instruments, and reschedule the due subscriptions.
fn apply_quotes(
    registry: &Mutex<PriceRegistry>,
    due_ids: &[String],
    quotes: Vec<Quote>,
    now: Instant,
) -> Vec<DispatchJob<PriceChange>> {
    let at = Utc::now();
    let mut reg = lock(registry);
    let mut jobs = Vec::new();

    for quote in quotes {
        if quote.outcome != QuoteOutcome::Success {
            log::debug!(
                "Skipping quote for {} with outcome {:?}",
                quote.instrument.symbol,
                quote.outcome
            );
            continue;
        }

        let subject = quote.instrument.clone();

        // Unsolicited or no-longer-tracked instruments are ignored.
        let Some(ids) = reg.subject_index.get(&subject) else {
            continue;
        };
        let ids: Vec<String> = ids.iter().cloned().collect();

        let prior = reg.record_observation(subject.clone(), quote.clone());
        let changed = prior
            .as_ref()
            .map_or(true, |previous| !quotes_equal(previous, &quote));

        if !changed {
            continue;
        }

        for id in ids {
            let Some(sub) = reg.subscriptions.get_mut(&id) else {
                continue;
            };

            if sub.status != SubscriptionStatus::Active {
                continue;
            }

            sub.last_event_at = Some(at);

            jobs.push(DispatchJob {
                subscription_id: id.clone(),
                callback: sub.callback.clone(),
                event: PriceChange {
                    subscription_id: id,
                    instrument: subject.clone(),
                    old_quote: prior.clone(),
                    new_quote: quote.clone(),
                    timestamp: at,
                },
                status: Arc::clone(&sub.status_mirror),
                failures: Arc::clone(&sub.callback_failures),
            });
        }
    }

    for id in due_ids {
        if let Some(sub) = reg.subscriptions.get_mut(id) {
            if sub.status == SubscriptionStatus::Active {
                sub.consecutive_failures = 0;
                sub.next_due_at = now + sub.config.period();
            }
        }
    }

    jobs
}

/// Apply the retry/backoff policy to every due subscription after a failed
/// fetch.
fn record_failure(
    registry: &Mutex<PriceRegistry>,
    due_ids: &[String],
    err: &anyhow::Error,
    now: Instant,
) {
    let retry_hint = err
        .downcast_ref::<ApiError>()
        .and_then(|api_err| match api_err {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        });

    let mut reg = lock(registry);
    let mut errored_subjects = Vec::new();

    for id in due_ids {
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
                "Quote fetch failed for subscription {id} (attempt {failures}): {err}; retrying in {delay:?}"
            );
        } else {
            sub.set_status(SubscriptionStatus::Error);
            errored_subjects.extend(sub.subjects.clone());
            log::error!("Price subscription {id} entered ERROR after {failures} failures: {err}");
        }
    }

    for subject in &errored_subjects {
        reg.prune_observation(subject);
    }
}
