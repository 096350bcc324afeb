//! Latest-known tick per symbol.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::metrics::Metrics;
use crate::model::PriceTick;
use std::sync::Arc;

pub struct PriceCache {
    inner: RwLock<HashMap<String, PriceTick>>,
    metrics: Arc<Metrics>,
}

impl PriceCache {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Stores the tick unless an entry with an equal or newer timestamp is
    /// already present. Returns whether the cache was updated; stale ticks
    /// are discarded silently apart from a metrics counter.
    pub fn insert(&self, tick: PriceTick) -> bool {
        let mut map = self.inner.write().unwrap();
        match map.get(&tick.symbol) {
            Some(existing) if existing.timestamp >= tick.timestamp => {
                self.metrics.record_stale_tick();
                false
            }
            _ => {
                map.insert(tick.symbol.clone(), tick);
                true
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<PriceTick> {
        let found = self.inner.read().unwrap().get(symbol).cloned();
        self.metrics.record_cache_lookup(found.is_some());
        found
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_tick;

    fn cache() -> PriceCache {
        PriceCache::new(Arc::new(Metrics::new()))
    }

    #[test]
    fn stores_latest_tick() {
        let cache = cache();
        assert!(cache.insert(test_tick("BTCUSDT", 49_000.0, 1_000)));
        assert!(cache.insert(test_tick("BTCUSDT", 49_500.0, 2_000)));
        assert_eq!(cache.get("BTCUSDT").unwrap().price, 49_500.0);
    }

    #[test]
    fn discards_out_of_order_ticks() {
        let cache = cache();
        cache.insert(test_tick("BTCUSDT", 49_500.0, 2_000));
        assert!(!cache.insert(test_tick("BTCUSDT", 48_000.0, 1_000)));
        assert!(!cache.insert(test_tick("BTCUSDT", 48_000.0, 2_000)));
        let cached = cache.get("BTCUSDT").unwrap();
        assert_eq!(cached.timestamp, 2_000);
        assert_eq!(cached.price, 49_500.0);
    }

    #[test]
    fn timestamps_never_decrease() {
        let cache = cache();
        let mut last = 0;
        for ts in [5, 3, 9, 9, 1, 12, 7] {
            cache.insert(test_tick("ETHUSDT", ts as f64, ts));
            let stored = cache.get("ETHUSDT").unwrap().timestamp;
            assert!(stored >= last);
            last = stored;
        }
        assert_eq!(last, 12);
    }

    #[test]
    fn one_entry_per_symbol() {
        let cache = cache();
        cache.insert(test_tick("BTCUSDT", 1.0, 1));
        cache.insert(test_tick("ETHUSDT", 2.0, 1));
        cache.insert(test_tick("BTCUSDT", 3.0, 2));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("SOLUSDT").is_none());
    }
}
