//! Behavior tests for the price subscription manager, driven by scripted
//! quote sources and the paused tokio clock so every timing assertion is
//! exact.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::time::{Duration, Instant};

use public_com_api::prelude::ApiError;
use public_com_api::rest::data::{OrderInstrument, Quote, QuoteOutcome};
use public_com_api::subscription::price::{
    PriceCallback, PriceChange, PriceSubscriptionManager, QuoteSource,
};
use public_com_api::subscription::{SubscriptionConfig, SubscriptionStatus};

fn aapl() -> OrderInstrument {
    OrderInstrument::equity("AAPL")
}

fn msft() -> OrderInstrument {
    OrderInstrument::equity("MSFT")
}

fn quote_at(instrument: &OrderInstrument, price: Decimal) -> Quote {
    Quote {
        instrument: instrument.clone(),
        outcome: QuoteOutcome::Success,
        last: Some(price),
        bid: Some(price - dec!(0.05)),
        bid_size: Some(dec!(100)),
        ask: Some(price + dec!(0.05)),
        ask_size: Some(dec!(100)),
        volume: None,
        open_interest: None,
        timestamp: None,
    }
}

/// Returns one scripted price per fetch call, repeating the last price once
/// the script runs out. Records every call with its batch and time.
#[derive(Debug)]
struct ScriptedQuoteSource {
    prices: Mutex<VecDeque<Decimal>>,
    last: Mutex<Decimal>,
    calls: Mutex<Vec<(Instant, Vec<OrderInstrument>)>>,
}

impl ScriptedQuoteSource {
    fn new(prices: &[Decimal]) -> Arc<Self> {
        Arc::new(Self {
            prices: Mutex::new(prices.iter().copied().collect()),
            last: Mutex::new(prices.last().copied().unwrap_or(dec!(100))),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn call_batches(&self) -> Vec<Vec<OrderInstrument>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, batch)| batch.clone())
            .collect()
    }
}

impl QuoteSource for ScriptedQuoteSource {
    fn fetch_quotes(
        &self,
        instruments: Vec<OrderInstrument>,
    ) -> BoxFuture<'static, Result<Vec<Quote>>> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), instruments.clone()));

        let price = match self.prices.lock().unwrap().pop_front() {
            Some(price) => {
                *self.last.lock().unwrap() = price;
                price
            }
            None => *self.last.lock().unwrap(),
        };

        let quotes: Vec<Quote> = instruments
            .iter()
            .map(|instrument| quote_at(instrument, price))
            .collect();

        futures_util::future::ready(Ok(quotes)).boxed()
    }
}

/// Fails the first `failures` calls with a server error, then succeeds with
/// a constant price. Records call times for backoff assertions.
#[derive(Debug)]
struct FlakyQuoteSource {
    remaining_failures: Mutex<u32>,
    calls: Mutex<Vec<Instant>>,
}

impl FlakyQuoteSource {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            remaining_failures: Mutex::new(failures),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

impl QuoteSource for FlakyQuoteSource {
    fn fetch_quotes(
        &self,
        instruments: Vec<OrderInstrument>,
    ) -> BoxFuture<'static, Result<Vec<Quote>>> {
        self.calls.lock().unwrap().push(Instant::now());

        let fail = {
            let mut remaining = self.remaining_failures.lock().unwrap();

            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };

        if fail {
            return futures_util::future::ready(Err(ApiError::Server {
                status: 500,
                message: "boom".to_owned(),
            }
            .into()))
            .boxed();
        }

        let quotes: Vec<Quote> = instruments
            .iter()
            .map(|instrument| quote_at(instrument, dec!(150.00)))
            .collect();

        futures_util::future::ready(Ok(quotes)).boxed()
    }
}

fn recording_callback() -> (PriceCallback, Arc<Mutex<Vec<PriceChange>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let callback = PriceCallback::sync(move |change| {
        sink.lock().unwrap().push(change);
        Ok(())
    });

    (callback, events)
}

#[tokio::test(start_paused = true)]
async fn shared_instrument_fetched_once_and_change_dispatched_to_all() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(150.00), dec!(150.00), dec!(151.00)]);
    let manager = PriceSubscriptionManager::new(source.clone());

    let (callback1, events1) = recording_callback();
    let (callback2, events2) = recording_callback();

    manager.subscribe(vec![aapl()], callback1, None).await?;
    manager.subscribe(vec![aapl()], callback2, None).await?;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    manager.stop().await;

    // Three ticks, one single-instrument batch each, despite two subscribers.
    assert_eq!(source.call_count(), 3);
    for batch in source.call_batches() {
        assert_eq!(batch, vec![aapl()]);
    }

    for events in [&events1, &events2] {
        let events = events.lock().unwrap();

        // Seed event for the first observation, then exactly one real change.
        assert_eq!(events.len(), 2);
        assert!(events[0].old_quote.is_none());
        assert_eq!(events[0].new_quote.last, Some(dec!(150.00)));

        let change = &events[1];
        assert_eq!(change.instrument, aapl());
        assert_eq!(
            change.old_quote.as_ref().and_then(|quote| quote.last),
            Some(dec!(150.00))
        );
        assert_eq!(change.new_quote.last, Some(dec!(151.00)));
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn distinct_instruments_batched_into_one_fetch() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source.clone());

    let (callback1, _events1) = recording_callback();
    let (callback2, _events2) = recording_callback();

    manager.subscribe(vec![aapl()], callback1, None).await?;
    manager.subscribe(vec![msft()], callback2, None).await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    manager.stop().await;

    let batches = source.call_batches();
    assert_eq!(batches.len(), 2);

    for mut batch in batches {
        batch.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(batch, vec![aapl(), msft()]);
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn fetch_failures_back_off_exponentially_then_recover() -> Result<()> {
    let source = FlakyQuoteSource::new(3);
    let manager = PriceSubscriptionManager::new(source.clone());

    let (callback, _events) = recording_callback();
    let config = SubscriptionConfig {
        polling_frequency_seconds: 1.0,
        retry_on_error: true,
        max_retries: 3,
        exponential_backoff: true,
    };

    let id = manager
        .subscribe(vec![aapl()], callback, Some(config))
        .await?;

    tokio::time::sleep(Duration::from_millis(8500)).await;

    let times = source.call_times();
    assert!(times.len() >= 5, "expected 5 calls, saw {}", times.len());

    // Fail, retry after 1s, 2s, 4s, then back to the 1s cadence.
    assert_eq!(times[1] - times[0], Duration::from_secs(1));
    assert_eq!(times[2] - times[1], Duration::from_secs(2));
    assert_eq!(times[3] - times[2], Duration::from_secs(4));
    assert_eq!(times[4] - times[3], Duration::from_secs(1));

    let info = manager.get_subscription_info(&id).unwrap();
    assert_eq!(info.status, SubscriptionStatus::Active);
    assert_eq!(info.consecutive_failures, 0);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn subscription_stays_active_through_retries() -> Result<()> {
    let source = FlakyQuoteSource::new(2);
    let manager = PriceSubscriptionManager::new(source.clone());

    let (callback, _events) = recording_callback();
    let id = manager.subscribe(vec![aapl()], callback, None).await?;

    tokio::time::sleep(Duration::from_millis(4500)).await;

    let info = manager
        .get_subscription_info(&id)
        .expect("subscription should still exist");
    assert_eq!(info.status, SubscriptionStatus::Active);
    assert_eq!(info.consecutive_failures, 0);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retries_exhausted_moves_subscription_to_error() -> Result<()> {
    let source = FlakyQuoteSource::new(u32::MAX);
    let manager = PriceSubscriptionManager::new(source.clone());

    let (callback, _events) = recording_callback();
    let config = SubscriptionConfig {
        polling_frequency_seconds: 1.0,
        retry_on_error: true,
        max_retries: 2,
        exponential_backoff: false,
    };

    let id = manager
        .subscribe(vec![aapl()], callback, Some(config))
        .await?;

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let info = manager
        .get_subscription_info(&id)
        .expect("errored subscription should remain queryable");
    assert_eq!(info.status, SubscriptionStatus::Error);

    // An errored subscription no longer polls.
    let calls_at_error = source.call_times().len();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(source.call_times().len(), calls_at_error);

    // Resume clears the failure count and restarts polling.
    assert!(manager.resume(&id));
    let info = manager.get_subscription_info(&id).unwrap();
    assert_eq!(info.status, SubscriptionStatus::Active);
    assert_eq!(info.consecutive_failures, 0);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_subscribe_unsubscribe_cycles_leave_clean_state() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = Arc::new(PriceSubscriptionManager::new(source.clone()));

    let mut tasks = Vec::new();

    for _ in 0..5 {
        let manager = Arc::clone(&manager);

        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let (callback, _events) = recording_callback();
                let id = manager
                    .subscribe(vec![aapl()], callback, None)
                    .await
                    .expect("subscribe should succeed");

                tokio::time::sleep(Duration::from_millis(1)).await;

                assert!(manager.unsubscribe(&id));
            }
        }));
    }

    for task in tasks {
        task.await?;
    }

    assert!(manager.get_active_subscriptions().is_empty());

    // No subjects left: polling stops entirely.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let calls_after_drain = source.call_count();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(source.call_count(), calls_after_drain);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn polling_frequency_bounds_are_enforced() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source);

    let (callback, _events) = recording_callback();
    let id = manager.subscribe(vec![aapl()], callback, None).await?;

    for out_of_range in [0.05, 60.001, 0.0, -1.0] {
        let err = manager
            .set_polling_frequency(&id, out_of_range)
            .expect_err("out-of-range frequency must fail");
        assert!(matches!(
            err.downcast_ref::<ApiError>(),
            Some(ApiError::InvalidPollingFrequency(_))
        ));
    }

    assert!(manager.set_polling_frequency(&id, 0.1)?);
    assert!(manager.set_polling_frequency(&id, 60.0)?);
    assert!(manager.set_polling_frequency(&id, 5.5)?);

    let info = manager.get_subscription_info(&id).unwrap();
    assert!((info.config.polling_frequency_seconds - 5.5).abs() < f64::EPSILON);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn operations_on_unknown_ids_report_absence() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source);

    assert!(!manager.unsubscribe("not-a-real-id"));
    assert!(!manager.pause("not-a-real-id"));
    assert!(!manager.resume("not-a-real-id"));
    assert!(!manager.set_polling_frequency("not-a-real-id", 5.0)?);
    assert!(manager.get_subscription_info("not-a-real-id").is_none());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn subscribe_with_no_instruments_fails() {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source);

    let (callback, _events) = recording_callback();
    let err = manager
        .subscribe(vec![], callback, None)
        .await
        .expect_err("empty subscribe must fail");

    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::EmptySubscription)
    ));
}

#[tokio::test(start_paused = true)]
async fn subscribe_rejects_out_of_range_config() {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source);

    let (callback, _events) = recording_callback();
    let err = manager
        .subscribe(
            vec![aapl()],
            callback,
            Some(SubscriptionConfig::with_frequency(0.01)),
        )
        .await
        .expect_err("invalid frequency must fail");

    assert!(matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::InvalidPollingFrequency(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn pause_suppresses_polling_and_resume_restores_it() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source.clone());

    let (callback, events) = recording_callback();
    let id = manager.subscribe(vec![aapl()], callback, None).await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let events_before_pause = events.lock().unwrap().len();
    let frequency_before = manager
        .get_subscription_info(&id)
        .unwrap()
        .config
        .polling_frequency_seconds;

    assert!(manager.pause(&id));
    assert_eq!(
        manager.get_subscription_info(&id).unwrap().status,
        SubscriptionStatus::Paused
    );

    // The only subscriber is paused: its subject is not polled at all.
    let calls_at_pause = source.call_count();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(source.call_count(), calls_at_pause);
    assert_eq!(events.lock().unwrap().len(), events_before_pause);

    assert!(manager.resume(&id));
    let info = manager.get_subscription_info(&id).unwrap();
    assert_eq!(info.status, SubscriptionStatus::Active);
    assert!((info.config.polling_frequency_seconds - frequency_before).abs() < f64::EPSILON);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(source.call_count() > calls_at_pause);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_all_clears_every_subscription() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source.clone());

    let (callback1, _events1) = recording_callback();
    let (callback2, _events2) = recording_callback();

    let id1 = manager.subscribe(vec![aapl()], callback1, None).await?;
    let id2 = manager.subscribe(vec![msft()], callback2, None).await?;

    assert_eq!(manager.get_active_subscriptions().len(), 2);

    manager.unsubscribe_all();

    assert!(manager.get_active_subscriptions().is_empty());
    assert!(manager.get_subscription_info(&id1).is_none());
    assert!(manager.get_subscription_info(&id2).is_none());

    // Nothing left to poll.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let calls_after_drain = source.call_count();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(source.call_count(), calls_after_drain);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn no_events_are_delivered_after_unsubscribe_returns() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100), dec!(101), dec!(102), dec!(103)]);
    let manager = PriceSubscriptionManager::new(source);

    let (callback, events) = recording_callback();
    let id = manager.subscribe(vec![aapl()], callback, None).await?;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(manager.unsubscribe(&id));
    let count_at_unsubscribe = events.lock().unwrap().len();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(events.lock().unwrap().len(), count_at_unsubscribe);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn callback_failures_are_isolated_and_counted() -> Result<()> {
    // A fresh price every tick keeps the events coming.
    let source = ScriptedQuoteSource::new(&[
        dec!(100),
        dec!(101),
        dec!(102),
        dec!(103),
        dec!(104),
        dec!(105),
    ]);
    let manager = PriceSubscriptionManager::new(source);

    let seen = Arc::new(Mutex::new(0_u32));
    let counter = Arc::clone(&seen);

    let callback = PriceCallback::sync(move |_change| {
        *counter.lock().unwrap() += 1;
        anyhow::bail!("subscriber bug")
    });

    let id = manager.subscribe(vec![aapl()], callback, None).await?;

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let info = manager.get_subscription_info(&id).unwrap();
    assert_eq!(info.status, SubscriptionStatus::Active);
    assert!(info.callback_failures >= 3);
    assert!(*seen.lock().unwrap() >= 3);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn panicking_callback_does_not_break_the_loop() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100), dec!(101), dec!(102), dec!(103)]);
    let manager = PriceSubscriptionManager::new(source);

    let (recording, events) = recording_callback();

    let panicking = PriceCallback::sync(|_change| panic!("subscriber exploded"));

    let panicking_id = manager.subscribe(vec![aapl()], panicking, None).await?;
    manager.subscribe(vec![aapl()], recording, None).await?;

    tokio::time::sleep(Duration::from_millis(3500)).await;

    // The panicking subscription is still ACTIVE and counted, and the well
    // behaved subscriber kept receiving events.
    let info = manager.get_subscription_info(&panicking_id).unwrap();
    assert_eq!(info.status, SubscriptionStatus::Active);
    assert!(info.callback_failures >= 1);
    assert!(events.lock().unwrap().len() >= 2);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn async_callbacks_are_scheduled_and_delivered() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100), dec!(101), dec!(102)]);
    let manager = PriceSubscriptionManager::new(source);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let callback = PriceCallback::async_fn(move |change: PriceChange| {
        let sink = Arc::clone(&sink);

        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sink.lock().unwrap().push(change);
            Ok(())
        }
    });

    manager.subscribe(vec![aapl()], callback, None).await?;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    manager.stop().await;

    let events = events.lock().unwrap();
    assert!(events.len() >= 3);
    assert!(events[0].old_quote.is_none());
    assert_eq!(events[1].new_quote.last, Some(dec!(101)));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn custom_config_is_applied_and_defaults_hold() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source);

    let (callback1, _events1) = recording_callback();
    let default_id = manager.subscribe(vec![aapl()], callback1, None).await?;

    let info = manager.get_subscription_info(&default_id).unwrap();
    assert!((info.config.polling_frequency_seconds - 1.0).abs() < f64::EPSILON);
    assert!(info.config.retry_on_error);
    assert_eq!(info.config.max_retries, 3);
    assert!(info.config.exponential_backoff);
    assert_eq!(info.subjects, vec![aapl()]);

    let (callback2, _events2) = recording_callback();
    let custom = SubscriptionConfig {
        polling_frequency_seconds: 2.5,
        retry_on_error: false,
        max_retries: 5,
        exponential_backoff: false,
    };
    let custom_id = manager
        .subscribe(vec![msft()], callback2, Some(custom))
        .await?;

    let info = manager.get_subscription_info(&custom_id).unwrap();
    assert!((info.config.polling_frequency_seconds - 2.5).abs() < f64::EPSILON);
    assert!(!info.config.retry_on_error);
    assert_eq!(info.config.max_retries, 5);

    manager.stop().await;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn symbols_are_trimmed_on_subscribe() -> Result<()> {
    let source = ScriptedQuoteSource::new(&[dec!(100)]);
    let manager = PriceSubscriptionManager::new(source.clone());

    let (callback, _events) = recording_callback();
    let id = manager
        .subscribe(
            vec![OrderInstrument::equity("  AAPL  ")],
            callback,
            None,
        )
        .await?;

    let info = manager.get_subscription_info(&id).unwrap();
    assert_eq!(info.subjects, vec![aapl()]);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(source.call_batches()[0], vec![aapl()]);

    manager.stop().await;

    Ok(())
}
