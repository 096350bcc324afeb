//! Per-symbol subscriber fan-out with batched, ordered delivery.
//!
//! Published ticks coalesce to the latest value per symbol within one flush
//! cycle. All deliveries, replays included, go through a single ordered
//! delivery task; that is what makes "replay before any live tick" hold for
//! a fresh subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::RegistryConfig;
use crate::engine::cache::PriceCache;
use crate::model::PriceTick;

pub type TickCallback = Arc<dyn Fn(PriceTick) + Send + Sync>;

/// Returned by `subscribe`; redeem with `unsubscribe` to remove exactly the
/// one callback it names.
#[derive(Debug)]
pub struct SubscriptionHandle {
    symbol: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

struct Subscriber {
    id: u64,
    callback: TickCallback,
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<String, Vec<Subscriber>>,
    pending: HashMap<String, PriceTick>,
    next_id: u64,
}

pub struct SubscriberRegistry {
    inner: Mutex<Inner>,
    cache: Arc<PriceCache>,
    delivery_tx: mpsc::UnboundedSender<Vec<(TickCallback, PriceTick)>>,
    flush_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl SubscriberRegistry {
    /// Spawns the delivery task; must be called inside a tokio runtime.
    pub fn new(cache: Arc<PriceCache>, config: &RegistryConfig) -> Self {
        let (delivery_tx, mut delivery_rx) =
            mpsc::unbounded_channel::<Vec<(TickCallback, PriceTick)>>();
        tokio::spawn(async move {
            while let Some(batch) = delivery_rx.recv().await {
                for (callback, tick) in batch {
                    callback(tick);
                }
            }
        });
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Mutex::new(Inner::default()),
            cache,
            delivery_tx,
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            shutdown,
        }
    }

    /// Registers a callback for a symbol. If the cache already holds a tick
    /// for that symbol it is queued for delivery to the new subscriber
    /// right away, ahead of any live tick from a later flush.
    pub fn subscribe(&self, symbol: &str, callback: TickCallback) -> SubscriptionHandle {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .subscribers
                .entry(symbol.to_string())
                .or_default()
                .push(Subscriber {
                    id,
                    callback: Arc::clone(&callback),
                });
            id
        };
        if let Some(cached) = self.cache.get(symbol) {
            let _ = self.delivery_tx.send(vec![(callback, cached)]);
        }
        debug!("subscribed callback {} to {}", id, symbol);
        SubscriptionHandle {
            symbol: symbol.to_string(),
            id,
        }
    }

    /// Removes exactly the one callback named by the handle. Dropping the
    /// last callback for a symbol removes the symbol bucket, which the
    /// gateway observes through `has_subscribers`.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subs) = inner.subscribers.get_mut(&handle.symbol) {
            subs.retain(|s| s.id != handle.id);
            if subs.is_empty() {
                inner.subscribers.remove(&handle.symbol);
                inner.pending.remove(&handle.symbol);
                debug!("dropped interest in {}", handle.symbol);
            }
        }
    }

    pub fn has_subscribers(&self, symbol: &str) -> bool {
        self.inner.lock().unwrap().subscribers.contains_key(symbol)
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .get(symbol)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Stages a tick for the next delivery cycle, replacing any tick for
    /// the same symbol staged earlier in the cycle.
    pub fn publish(&self, tick: PriceTick) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.insert(tick.symbol.clone(), tick);
    }

    /// Drains staged ticks and queues one delivery per (subscriber, symbol),
    /// callbacks in registration order. Called by the flush task; exposed
    /// for deterministic tests.
    pub fn flush_now(&self) {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            let pending: Vec<(String, PriceTick)> = inner.pending.drain().collect();
            let mut batch = Vec::new();
            for (symbol, tick) in pending {
                if let Some(subs) = inner.subscribers.get(&symbol) {
                    for sub in subs {
                        batch.push((Arc::clone(&sub.callback), tick.clone()));
                    }
                }
            }
            batch
        };
        if !batch.is_empty() {
            let _ = self.delivery_tx.send(batch);
        }
    }

    /// Starts the periodic flush cycle.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.flush_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.flush_now(),
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::model::test_tick;

    fn registry() -> (Arc<SubscriberRegistry>, Arc<PriceCache>) {
        let cache = Arc::new(PriceCache::new(Arc::new(Metrics::new())));
        let registry = Arc::new(SubscriberRegistry::new(
            Arc::clone(&cache),
            &RegistryConfig::default(),
        ));
        (registry, cache)
    }

    fn recording_callback() -> (TickCallback, Arc<Mutex<Vec<PriceTick>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: TickCallback = Arc::new(move |tick| sink.lock().unwrap().push(tick));
        (callback, seen)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn replays_cached_tick_exactly_once_before_live_ticks() {
        let (registry, cache) = registry();
        cache.insert(test_tick("BTCUSDT", 49_000.0, 1_000));

        let (callback, seen) = recording_callback();
        registry.subscribe("BTCUSDT", callback);

        registry.publish(test_tick("BTCUSDT", 49_500.0, 2_000));
        registry.flush_now();
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].price, 49_000.0, "replay must come first");
        assert_eq!(seen[1].price, 49_500.0);
    }

    #[tokio::test]
    async fn no_replay_without_cache_entry() {
        let (registry, _cache) = registry();
        let (callback, seen) = recording_callback();
        registry.subscribe("ETHUSDT", callback);
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn coalesces_ticks_within_one_cycle() {
        let (registry, _cache) = registry();
        let (callback, seen) = recording_callback();
        registry.subscribe("BTCUSDT", callback);

        registry.publish(test_tick("BTCUSDT", 1.0, 1));
        registry.publish(test_tick("BTCUSDT", 2.0, 2));
        registry.publish(test_tick("BTCUSDT", 3.0, 3));
        registry.flush_now();
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "burst must coalesce to the latest tick");
        assert_eq!(seen[0].price, 3.0);
    }

    #[tokio::test]
    async fn delivers_in_registration_order() {
        let (registry, _cache) = registry();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.subscribe(
                "BTCUSDT",
                Arc::new(move |_| order.lock().unwrap().push(label)),
            );
        }
        registry.publish(test_tick("BTCUSDT", 1.0, 1));
        registry.flush_now();
        settle().await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_exactly_one_callback() {
        let (registry, _cache) = registry();
        let (cb_a, seen_a) = recording_callback();
        let (cb_b, seen_b) = recording_callback();
        let handle_a = registry.subscribe("BTCUSDT", cb_a);
        registry.subscribe("BTCUSDT", cb_b);
        assert_eq!(registry.subscriber_count("BTCUSDT"), 2);

        registry.unsubscribe(handle_a);
        assert_eq!(registry.subscriber_count("BTCUSDT"), 1);

        registry.publish(test_tick("BTCUSDT", 5.0, 5));
        registry.flush_now();
        settle().await;
        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(seen_b.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_symbol_bucket_drops_interest() {
        let (registry, _cache) = registry();
        let (callback, _seen) = recording_callback();
        let handle = registry.subscribe("BTCUSDT", callback);
        assert!(registry.has_subscribers("BTCUSDT"));
        registry.unsubscribe(handle);
        assert!(!registry.has_subscribers("BTCUSDT"));
    }
}
