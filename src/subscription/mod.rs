//! The polling subscription engine.
//!
//! The backend has no streaming channel, so this module turns its
//! request/response endpoints into event streams: each manager runs one
//! scheduler task that batches every due subject into a single upstream fetch
//! per tick, diffs the results against the last seen observation, and hands
//! change events to a small pool of dispatch workers that invoke subscriber
//! callbacks. [`price::PriceSubscriptionManager`] specializes the machinery
//! for instruments, [`order::OrderSubscriptionManager`] for orders.

use core::fmt;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::prelude::ApiError;

pub mod order;
pub mod price;

pub use order::{OrderCallback, OrderKey, OrderSource, OrderSubscriptionManager, OrderUpdate};
pub use price::{PriceCallback, PriceChange, PriceSubscriptionManager, QuoteSource};

/// Lowest accepted polling frequency in seconds.
pub const MIN_POLLING_FREQUENCY: f64 = 0.1;
/// Highest accepted polling frequency in seconds.
pub const MAX_POLLING_FREQUENCY: f64 = 60.0;

/// Cap applied to computed backoff delays.
const BACKOFF_CAP_SECONDS: f64 = 60.0;

/// Sleep used when no subscription is schedulable, so a new `subscribe` is
/// picked up promptly even if the wake notification is missed.
pub(crate) const IDLE_POLL: Duration = Duration::from_secs(1);

/// Number of dispatch workers per manager.
pub(crate) const DISPATCH_WORKERS: usize = 4;

/// Queue depth of each dispatch worker. A full queue blocks the scheduler for
/// the current tick, which is the backpressure point that paces polling to the
/// slowest subscriber.
pub(crate) const DISPATCH_QUEUE_DEPTH: usize = 32;

/// Grace period `stop` waits for the scheduler and workers to exit.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(5);

/// Generate a fresh subscription id: 128 random bits as lowercase hex.
#[must_use]
pub(crate) fn new_subscription_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Lock a registry mutex. Critical sections hold plain data, never await and
/// never invoke callbacks, so a poisoned lock is recoverable.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionStatus {
    /// Polled and dispatched.
    Active = 0,
    /// Tracked but neither polled nor dispatched.
    Paused = 1,
    /// Retries exhausted; stays until unsubscribed.
    Error = 2,
    /// Removed, or the manager stopped.
    Cancelled = 3,
}

impl SubscriptionStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Paused,
            2 => Self::Error,
            _ => Self::Cancelled,
        }
    }
}

/// Tuning knobs of a single subscription.
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionConfig {
    /// Seconds between polls, within `[0.1, 60.0]`.
    pub polling_frequency_seconds: f64,
    /// Whether fetch failures are retried before entering ERROR.
    pub retry_on_error: bool,
    /// Retries allowed before entering ERROR.
    pub max_retries: u32,
    /// Whether retry delays double per consecutive failure.
    pub exponential_backoff: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            polling_frequency_seconds: 1.0,
            retry_on_error: true,
            max_retries: 3,
            exponential_backoff: true,
        }
    }
}

impl SubscriptionConfig {
    /// A default config polling every `polling_frequency_seconds`.
    #[must_use]
    pub fn with_frequency(polling_frequency_seconds: f64) -> Self {
        Self {
            polling_frequency_seconds,
            ..Self::default()
        }
    }

    /// Check the polling frequency bounds.
    ///
    /// # Errors
    ///
    /// Will return [`ApiError::InvalidPollingFrequency`] if the frequency is
    /// outside `[0.1, 60.0]`.
    pub fn validate(&self) -> Result<()> {
        validate_polling_frequency(self.polling_frequency_seconds)
    }

    /// The polling period as a [`Duration`].
    #[must_use]
    pub(crate) fn period(&self) -> Duration {
        Duration::from_secs_f64(self.polling_frequency_seconds)
    }
}

/// Order subscriptions share the same tuning knobs.
pub type OrderSubscriptionConfig = SubscriptionConfig;

/// Check a polling frequency against the accepted range.
///
/// # Errors
///
/// Will return [`ApiError::InvalidPollingFrequency`] if the frequency is
/// outside `[0.1, 60.0]`.
pub fn validate_polling_frequency(seconds: f64) -> Result<()> {
    if !seconds.is_finite() || !(MIN_POLLING_FREQUENCY..=MAX_POLLING_FREQUENCY).contains(&seconds) {
        anyhow::bail!(ApiError::InvalidPollingFrequency(seconds));
    }

    Ok(())
}

/// The retry delay after `failures` consecutive fetch failures.
pub(crate) fn backoff_delay(config: &SubscriptionConfig, failures: u32) -> Duration {
    let base = config.polling_frequency_seconds;

    let seconds = if config.exponential_backoff {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        base * 2_f64.powi(exponent.min(30))
    } else {
        base
    };

    Duration::from_secs_f64(seconds.min(BACKOFF_CAP_SECONDS))
}

/// A subscriber callback, either synchronous or deferred-async.
///
/// Sync callbacks run directly on a dispatch worker; async callbacks are
/// scheduled onto the runtime so the worker never blocks on them. Either kind
/// reports failure through its `Result`, and failures are isolated: they are
/// counted and logged without touching the subscription's fetch state.
pub enum Callback<E> {
    /// Invoked inline by a dispatch worker.
    Sync(Arc<dyn Fn(E) -> Result<()> + Send + Sync>),
    /// Scheduled onto the runtime by a dispatch worker.
    Async(Arc<dyn Fn(E) -> BoxFuture<'static, Result<()>> + Send + Sync>),
}

impl<E> Callback<E> {
    /// Wrap a synchronous callback.
    pub fn sync<F>(callback: F) -> Self
    where
        F: Fn(E) -> Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(callback))
    }

    /// Wrap an async callback.
    pub fn async_fn<F, Fut>(callback: F) -> Self
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(move |event| callback(event).boxed()))
    }
}

impl<E> Clone for Callback<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(callback) => Self::Sync(Arc::clone(callback)),
            Self::Async(callback) => Self::Async(Arc::clone(callback)),
        }
    }
}

impl<E> fmt::Debug for Callback<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Callback::Sync"),
            Self::Async(_) => f.write_str("Callback::Async"),
        }
    }
}

/// Immutable snapshot of one subscription, as returned by
/// `get_subscription_info`.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo<S> {
    /// Subscription id.
    pub id: String,
    /// Current lifecycle status.
    pub status: SubscriptionStatus,
    /// Subjects the subscription covers.
    pub subjects: Vec<S>,
    /// Tuning knobs.
    pub config: SubscriptionConfig,
    /// Consecutive fetch failures counted against the retry budget.
    pub consecutive_failures: u32,
    /// Callback invocations that returned an error or panicked.
    pub callback_failures: u32,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
    /// When an event was last dispatched to it.
    pub last_event_at: Option<DateTime<Utc>>,
}

/// The authoritative record of one subscription.
#[derive(Debug)]
pub(crate) struct Subscription<S, E> {
    pub id: String,
    pub subjects: Vec<S>,
    pub callback: Callback<E>,
    pub config: SubscriptionConfig,
    pub status: SubscriptionStatus,
    /// Lock-free mirror of `status` read by dispatch workers, so no callback
    /// starts after `unsubscribe` returns and pause suppresses queued jobs.
    pub status_mirror: Arc<AtomicU8>,
    pub consecutive_failures: u32,
    pub callback_failures: Arc<AtomicU32>,
    pub next_due_at: Instant,
    pub created_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl<S: Clone, E> Subscription<S, E> {
    pub(crate) fn new(subjects: Vec<S>, callback: Callback<E>, config: SubscriptionConfig) -> Self {
        Self {
            id: new_subscription_id(),
            subjects,
            callback,
            config,
            status: SubscriptionStatus::Active,
            status_mirror: Arc::new(AtomicU8::new(SubscriptionStatus::Active as u8)),
            consecutive_failures: 0,
            callback_failures: Arc::new(AtomicU32::new(0)),
            next_due_at: Instant::now(),
            created_at: Utc::now(),
            last_event_at: None,
        }
    }

    pub(crate) fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status;
        self.status_mirror.store(status as u8, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> SubscriptionInfo<S> {
        SubscriptionInfo {
            id: self.id.clone(),
            status: self.status,
            subjects: self.subjects.clone(),
            config: self.config,
            consecutive_failures: self.consecutive_failures,
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            created_at: self.created_at,
            last_event_at: self.last_event_at,
        }
    }
}

/// Subscription storage of one manager: the record map, the subject index,
/// and the last observation per subject.
///
/// All access is serialized by the owning manager's mutex; nothing here does
/// I/O or invokes callbacks.
#[derive(Debug)]
pub(crate) struct Registry<S, O, E> {
    pub subscriptions: HashMap<String, Subscription<S, E>>,
    pub subject_index: HashMap<S, HashSet<String>>,
    pub last_observation: HashMap<S, O>,
}

impl<S, O, E> Registry<S, O, E>
where
    S: Clone + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            subject_index: HashMap::new(),
            last_observation: HashMap::new(),
        }
    }

    /// Insert a subscription and index every one of its subjects.
    pub(crate) fn add(&mut self, sub: Subscription<S, E>) {
        for subject in &sub.subjects {
            self.subject_index
                .entry(subject.clone())
                .or_default()
                .insert(sub.id.clone());
        }

        self.subscriptions.insert(sub.id.clone(), sub);
    }

    /// Remove a subscription, de-index its subjects, and evict observations
    /// nothing tracks anymore.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Subscription<S, E>> {
        let sub = self.subscriptions.remove(id)?;

        for subject in &sub.subjects {
            if let Some(ids) = self.subject_index.get_mut(subject) {
                ids.remove(id);

                if ids.is_empty() {
                    self.subject_index.remove(subject);
                }
            }

            self.prune_observation(subject);
        }

        Some(sub)
    }

    /// Drop the observation for `subject` unless an active or paused
    /// subscription still references it.
    pub(crate) fn prune_observation(&mut self, subject: &S) {
        let tracked = self.subject_index.get(subject).is_some_and(|ids| {
            ids.iter().any(|id| {
                self.subscriptions.get(id).is_some_and(|sub| {
                    matches!(
                        sub.status,
                        SubscriptionStatus::Active | SubscriptionStatus::Paused
                    )
                })
            })
        });

        if !tracked {
            self.last_observation.remove(subject);
        }
    }

    /// Store the newest observation for `subject`, returning the prior one
    /// for diffing.
    pub(crate) fn record_observation(&mut self, subject: S, observation: O) -> Option<O> {
        self.last_observation.insert(subject, observation)
    }

    /// The earliest deadline across active subscriptions.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.subscriptions
            .values()
            .filter(|sub| sub.status == SubscriptionStatus::Active)
            .map(|sub| sub.next_due_at)
            .min()
    }

    /// The ids of every due active subscription and the deduplicated union of
    /// their subjects.
    pub(crate) fn due(&self, now: Instant) -> (Vec<String>, Vec<S>) {
        let mut ids = Vec::new();
        let mut subjects = HashSet::new();

        for sub in self.subscriptions.values() {
            if sub.status == SubscriptionStatus::Active && sub.next_due_at <= now {
                ids.push(sub.id.clone());
                subjects.extend(sub.subjects.iter().cloned());
            }
        }

        (ids, subjects.into_iter().collect())
    }

    /// Ids of every active subscription.
    pub(crate) fn active_ids(&self) -> Vec<String> {
        self.subscriptions
            .values()
            .filter(|sub| sub.status == SubscriptionStatus::Active)
            .map(|sub| sub.id.clone())
            .collect()
    }

    /// Cancel and drain everything, returning the removed records.
    pub(crate) fn drain_all(&mut self) -> Vec<Subscription<S, E>> {
        self.subject_index.clear();
        self.last_observation.clear();

        self.subscriptions
            .drain()
            .map(|(_, mut sub)| {
                sub.set_status(SubscriptionStatus::Cancelled);
                sub
            })
            .collect()
    }
}

/// One callback invocation handed to the dispatch pool.
pub(crate) struct DispatchJob<E> {
    pub subscription_id: String,
    pub callback: Callback<E>,
    pub event: E,
    pub status: Arc<AtomicU8>,
    pub failures: Arc<AtomicU32>,
}

pub(crate) type DispatchSender<E> = mpsc::Sender<DispatchJob<E>>;

/// Pick the worker for a subscription id.
///
/// Routing by id keeps every job of one subscription on one worker, which is
/// what preserves per-subscription delivery order.
pub(crate) fn route_worker(workers: usize, subscription_id: &str) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    subscription_id.hash(&mut hasher);

    (hasher.finish() as usize) % workers
}

/// Spawn the dispatch worker pool for one manager.
pub(crate) fn spawn_dispatch_pool<E: Send + 'static>(
) -> (Vec<DispatchSender<E>>, Vec<JoinHandle<()>>) {
    let mut senders = Vec::with_capacity(DISPATCH_WORKERS);
    let mut handles = Vec::with_capacity(DISPATCH_WORKERS);

    for _ in 0..DISPATCH_WORKERS {
        let (tx, rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);

        senders.push(tx);
        handles.push(tokio::spawn(run_dispatch_worker(rx)));
    }

    (senders, handles)
}

/// Drain one worker queue until every sender is dropped.
async fn run_dispatch_worker<E: Send + 'static>(mut rx: mpsc::Receiver<DispatchJob<E>>) {
    while let Some(job) = rx.recv().await {
        let status = SubscriptionStatus::from_u8(job.status.load(Ordering::Acquire));

        if status != SubscriptionStatus::Active {
            continue;
        }

        match job.callback {
            Callback::Sync(callback) => {
                let event = job.event;
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));

                record_callback_outcome(&job.subscription_id, &job.failures, outcome);
            }
            Callback::Async(callback) => {
                let future = callback(job.event);
                let subscription_id = job.subscription_id;
                let failures = job.failures;

                tokio::spawn(async move {
                    let outcome = std::panic::AssertUnwindSafe(future).catch_unwind().await;

                    record_callback_outcome(&subscription_id, &failures, outcome);
                });
            }
        }
    }
}

/// Count and log a callback failure; success is silent.
fn record_callback_outcome(
    subscription_id: &str,
    failures: &AtomicU32,
    outcome: std::thread::Result<Result<()>>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("Callback for subscription {subscription_id} failed: {err}");
        }
        Err(_) => {
            failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Callback for subscription {subscription_id} panicked");
        }
    }
}
