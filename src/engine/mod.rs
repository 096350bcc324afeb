//! The alert-evaluation pipeline.
//!
//! `AlertEngine` is the dependency-injected composition root of the
//! evaluation side: it owns the alert index and the registry subscriptions,
//! feeds per-symbol history, and runs the loop that turns delivered ticks
//! into notifications.

pub mod cache;
pub mod evaluator;
pub mod index;
pub mod registry;
pub mod trigger;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::AlertflowError;
use crate::metrics::Metrics;
use crate::model::{AlertDefinition, AlertNotification, PriceTick};

pub use cache::PriceCache;
pub use evaluator::{ConditionEvaluator, SymbolHistory};
pub use index::AlertIndex;
pub use registry::{SubscriberRegistry, SubscriptionHandle, TickCallback};
pub use trigger::TriggerController;

/// Ticks buffered between registry delivery and the evaluation loop.
const TICK_CHANNEL_CAPACITY: usize = 1_024;

pub struct AlertEngine {
    index: Mutex<AlertIndex>,
    registry: Arc<SubscriberRegistry>,
    evaluator: Arc<ConditionEvaluator>,
    trigger: Arc<TriggerController>,
    history: Arc<SymbolHistory>,
    metrics: Arc<Metrics>,
    notify_tx: mpsc::Sender<AlertNotification>,
    tick_tx: mpsc::Sender<PriceTick>,
    tick_rx: Mutex<Option<mpsc::Receiver<PriceTick>>>,
    subscriptions: Mutex<HashMap<String, SubscriptionHandle>>,
    shutdown: watch::Sender<bool>,
}

impl AlertEngine {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        evaluator: Arc<ConditionEvaluator>,
        trigger: Arc<TriggerController>,
        history: Arc<SymbolHistory>,
        metrics: Arc<Metrics>,
        notify_tx: mpsc::Sender<AlertNotification>,
    ) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            index: Mutex::new(AlertIndex::new()),
            registry,
            evaluator,
            trigger,
            history,
            metrics,
            notify_tx,
            tick_tx,
            tick_rx: Mutex::new(Some(tick_rx)),
            subscriptions: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Validates and indexes a definition supplied by the alert CRUD
    /// collaborator. The first alert for a symbol subscribes the pipeline
    /// to that symbol's ticks.
    pub fn add_alert(&self, def: AlertDefinition) -> Result<(), AlertflowError> {
        let symbol = def.symbol.clone();
        let first_for_symbol = self.index.lock().unwrap().add(def)?;
        if first_for_symbol {
            let tx = self.tick_tx.clone();
            let callback: TickCallback = Arc::new(move |tick| {
                if let Err(e) = tx.try_send(tick) {
                    debug!("tick dropped, evaluation backlog full: {}", e);
                }
            });
            let handle = self.registry.subscribe(&symbol, callback);
            self.subscriptions.lock().unwrap().insert(symbol, handle);
        }
        Ok(())
    }

    /// Removes a definition; removing the last alert for a symbol drops
    /// the pipeline's subscription and the alert's cooldown state.
    pub fn remove_alert(&self, id: u64) -> Option<AlertDefinition> {
        let (def, last_for_symbol) = self.index.lock().unwrap().remove(id)?;
        self.trigger.forget(id);
        if last_for_symbol {
            if let Some(handle) = self.subscriptions.lock().unwrap().remove(&def.symbol) {
                self.registry.unsubscribe(handle);
            }
        }
        Some(def)
    }

    pub fn alert_count(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    /// Starts the evaluation loop. After `stop`, the loop hands its tick
    /// receiver back, so a later `start` resumes evaluation; only a call
    /// while the loop is still running is a no-op.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let rx = engine.tick_rx.lock().unwrap().take();
        if rx.is_some() {
            // Clear a leftover stop signal so restart does not break out
            // of the fresh loop immediately.
            let _ = self.shutdown.send(false);
        }
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut rx = match rx {
                Some(rx) => rx,
                None => {
                    warn!("alert engine already running");
                    return;
                }
            };
            info!("alert engine started");
            loop {
                tokio::select! {
                    maybe_tick = rx.recv() => match maybe_tick {
                        Some(tick) => engine.process_tick(tick).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            *engine.tick_rx.lock().unwrap() = Some(rx);
            info!("alert engine stopped");
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn process_tick(&self, tick: PriceTick) {
        self.history.push(&tick);
        let defs: Vec<AlertDefinition> = self
            .index
            .lock()
            .unwrap()
            .alerts_for(&tick.symbol)
            .into_iter()
            .filter(|d| d.active)
            .cloned()
            .collect();

        for def in defs {
            let started = Instant::now();
            let result = self.evaluator.evaluate(&def, &tick).await;
            self.metrics.record_evaluation(started.elapsed());

            if !result.should_trigger {
                continue;
            }
            // Cooldown runs on event time so replayed and simulated feeds
            // behave the same as live ones.
            if !self
                .trigger
                .check_and_record(def.id, def.cooldown_ms, tick.timestamp, &tick, &result)
            {
                debug!("alert {} suppressed by cooldown", def.id);
                continue;
            }
            self.metrics.record_trigger();
            info!("alert {} triggered: {}", def.id, result.reason);
            let notification = AlertNotification {
                alert_id: def.id,
                symbol: def.symbol.clone(),
                tick: tick.clone(),
                result,
                timestamp: tick.timestamp,
            };
            if self.notify_tx.send(notification).await.is_err() {
                warn!("notification collaborator gone, dropping trigger");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EvaluatorConfig, PoolConfig, RegistryConfig};
    use crate::model::{test_tick, Condition, Direction};
    use crate::pool::WorkerPool;
    use std::time::Duration;

    struct Harness {
        engine: Arc<AlertEngine>,
        registry: Arc<SubscriberRegistry>,
        cache: Arc<PriceCache>,
        notify_rx: mpsc::Receiver<AlertNotification>,
    }

    fn harness() -> Harness {
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(PriceCache::new(Arc::clone(&metrics)));
        let registry = Arc::new(SubscriberRegistry::new(
            Arc::clone(&cache),
            &RegistryConfig::default(),
        ));
        let pool = Arc::new(WorkerPool::new(&PoolConfig {
            workers: 2,
            ..PoolConfig::default()
        }));
        let history = Arc::new(SymbolHistory::new(100));
        let evaluator = Arc::new(ConditionEvaluator::new(
            pool,
            Arc::clone(&history),
            &EvaluatorConfig::default(),
        ));
        let trigger = Arc::new(TriggerController::new(1_000));
        let (notify_tx, notify_rx) = mpsc::channel(64);
        let engine = Arc::new(AlertEngine::new(
            Arc::clone(&registry),
            evaluator,
            trigger,
            history,
            metrics,
            notify_tx,
        ));
        Harness {
            engine,
            registry,
            cache,
            notify_rx,
        }
    }

    fn btc_price_alert(id: u64, target: f64, cooldown_ms: u64) -> AlertDefinition {
        AlertDefinition::new(id, "BTCUSDT", Condition::Price, Direction::Above, target)
            .with_cooldown(cooldown_ms)
    }

    async fn deliver(h: &Harness, tick: PriceTick) {
        h.cache.insert(tick.clone());
        h.registry.publish(tick);
        h.registry.flush_now();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn first_alert_subscribes_last_removal_unsubscribes() {
        let h = harness();
        assert!(!h.registry.has_subscribers("BTCUSDT"));

        h.engine.add_alert(btc_price_alert(1, 10.0, 0)).unwrap();
        h.engine.add_alert(btc_price_alert(2, 20.0, 0)).unwrap();
        assert_eq!(h.registry.subscriber_count("BTCUSDT"), 1);

        h.engine.remove_alert(1).unwrap();
        assert!(h.registry.has_subscribers("BTCUSDT"));
        h.engine.remove_alert(2).unwrap();
        assert!(!h.registry.has_subscribers("BTCUSDT"));
        assert_eq!(h.registry.subscriber_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn invalid_alert_is_rejected_and_not_subscribed() {
        let h = harness();
        let err = h.engine.add_alert(btc_price_alert(1, f64::NAN, 0)).unwrap_err();
        assert!(matches!(err, AlertflowError::InvalidAlert(_)));
        assert_eq!(h.engine.alert_count(), 0);
        assert!(!h.registry.has_subscribers("BTCUSDT"));
    }

    #[tokio::test]
    async fn price_scenario_with_cooldown() {
        let mut h = harness();
        h.engine
            .add_alert(btc_price_alert(1, 49_000.0, 60_000))
            .unwrap();
        let _loop_handle = h.engine.start();

        deliver(&h, test_tick("BTCUSDT", 49_500.0, 1_000)).await;
        let first = h.notify_rx.recv().await.unwrap();
        assert_eq!(first.alert_id, 1);
        assert_eq!(first.result.reason, "Price 49500 >= 49000");

        // Qualifying tick inside the cooldown window: no second trigger.
        deliver(&h, test_tick("BTCUSDT", 49_600.0, 2_000)).await;
        assert!(h.notify_rx.try_recv().is_err());

        // After the window: fires again.
        deliver(&h, test_tick("BTCUSDT", 49_700.0, 62_000)).await;
        let second = h.notify_rx.recv().await.unwrap();
        assert_eq!(second.tick.price, 49_700.0);
        h.engine.stop();
    }

    #[tokio::test]
    async fn one_failing_alert_does_not_block_siblings() {
        let mut h = harness();
        // RSI alert with no history fails; the price alert still fires.
        h.engine
            .add_alert(
                AlertDefinition::new(
                    1,
                    "BTCUSDT",
                    Condition::Rsi { period: 14 },
                    Direction::Above,
                    70.0,
                )
                .with_cooldown(0),
            )
            .unwrap();
        h.engine.add_alert(btc_price_alert(2, 49_000.0, 0)).unwrap();
        let _loop_handle = h.engine.start();

        deliver(&h, test_tick("BTCUSDT", 49_500.0, 1_000)).await;
        let fired = h.notify_rx.recv().await.unwrap();
        assert_eq!(fired.alert_id, 2);
        h.engine.stop();
    }

    #[tokio::test]
    async fn restarts_after_stop() {
        let mut h = harness();
        h.engine.add_alert(btc_price_alert(1, 49_000.0, 0)).unwrap();
        let handle = h.engine.start();

        deliver(&h, test_tick("BTCUSDT", 49_500.0, 1_000)).await;
        assert_eq!(h.notify_rx.recv().await.unwrap().alert_id, 1);

        h.engine.stop();
        handle.await.unwrap();

        // A fresh start picks the loop back up on the same channel.
        let handle = h.engine.start();
        deliver(&h, test_tick("BTCUSDT", 49_600.0, 2_000)).await;
        let fired = h.notify_rx.recv().await.unwrap();
        assert_eq!(fired.tick.price, 49_600.0);
        h.engine.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn inactive_alerts_are_skipped() {
        let mut h = harness();
        let mut def = btc_price_alert(1, 49_000.0, 0);
        def.active = false;
        h.engine.add_alert(def).unwrap();
        let _loop_handle = h.engine.start();

        deliver(&h, test_tick("BTCUSDT", 49_500.0, 1_000)).await;
        assert!(h.notify_rx.try_recv().is_err());
        h.engine.stop();
    }
}
