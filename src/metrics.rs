//! Pipeline counters and the periodic snapshot reporter.
//!
//! Read-only with respect to every other component; a failed or slow report
//! never touches the hot path.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::model::FeedStatus;
use crate::pool::{PoolStats, WorkerPool};

#[derive(Default)]
pub struct Metrics {
    ticks_processed: AtomicU64,
    stale_ticks: AtomicU64,
    alerts_evaluated: AtomicU64,
    alerts_triggered: AtomicU64,
    eval_latency_us_sum: AtomicU64,
    eval_latency_count: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    feed_status: AtomicU8,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_tick(&self) {
        self.stale_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluation(&self, latency: Duration) {
        self.alerts_evaluated.fetch_add(1, Ordering::Relaxed);
        self.eval_latency_us_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.eval_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trigger(&self) {
        self.alerts_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_feed_status(&self, status: FeedStatus) {
        self.feed_status.store(status as u8, Ordering::Relaxed);
    }

    pub fn feed_status(&self) -> FeedStatus {
        match self.feed_status.load(Ordering::Relaxed) {
            1 => FeedStatus::Connected,
            2 => FeedStatus::Reconnecting,
            3 => FeedStatus::Unavailable,
            _ => FeedStatus::Disconnected,
        }
    }

    pub fn ticks_processed(&self) -> u64 {
        self.ticks_processed.load(Ordering::Relaxed)
    }

    pub fn alerts_triggered(&self) -> u64 {
        self.alerts_triggered.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, pool: Option<&WorkerPool>) -> MetricsSnapshot {
        let evals = self.eval_latency_count.load(Ordering::Relaxed);
        let latency_sum = self.eval_latency_us_sum.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        MetricsSnapshot {
            ticks_processed: self.ticks_processed.load(Ordering::Relaxed),
            stale_ticks: self.stale_ticks.load(Ordering::Relaxed),
            alerts_evaluated: self.alerts_evaluated.load(Ordering::Relaxed),
            alerts_triggered: self.alerts_triggered.load(Ordering::Relaxed),
            avg_eval_latency_us: if evals > 0 { latency_sum / evals } else { 0 },
            cache_hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            feed_status: self.feed_status(),
            pool: pool.map(|p| p.stats()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ticks_processed: u64,
    pub stale_ticks: u64,
    pub alerts_evaluated: u64,
    pub alerts_triggered: u64,
    pub avg_eval_latency_us: u64,
    pub cache_hit_rate: f64,
    pub feed_status: FeedStatus,
    pub pool: Option<PoolStats>,
}

/// Logs one JSON snapshot line per interval.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    pool: Arc<WorkerPool>,
    interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, pool: Arc<WorkerPool>, interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            metrics,
            pool,
            interval,
            shutdown,
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let pool = Arc::clone(&self.pool);
        let interval = self.interval;
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snap = metrics.snapshot(Some(&pool));
                        match serde_json::to_string(&snap) {
                            Ok(line) => info!(target: "alertflow::metrics", "{}", line),
                            Err(e) => warn!("failed to serialize metrics snapshot: {}", e),
                        }
                    }
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

    #[test]
    fn snapshot_aggregates_counters() {
        let m = Metrics::new();
        m.record_tick();
        m.record_tick();
        m.record_stale_tick();
        m.record_evaluation(Duration::from_micros(100));
        m.record_evaluation(Duration::from_micros(300));
        m.record_trigger();
        m.record_cache_lookup(true);
        m.record_cache_lookup(true);
        m.record_cache_lookup(false);
        m.set_feed_status(FeedStatus::Connected);

        let snap = m.snapshot(None);
        assert_eq!(snap.ticks_processed, 2);
        assert_eq!(snap.stale_ticks, 1);
        assert_eq!(snap.alerts_evaluated, 2);
        assert_eq!(snap.alerts_triggered, 1);
        assert_eq!(snap.avg_eval_latency_us, 200);
        assert!((snap.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.feed_status, FeedStatus::Connected);
    }

    #[test]
    fn empty_metrics_do_not_divide_by_zero() {
        let snap = Metrics::new().snapshot(None);
        assert_eq!(snap.avg_eval_latency_us, 0);
        assert_eq!(snap.cache_hit_rate, 0.0);
        assert_eq!(snap.feed_status, FeedStatus::Disconnected);
    }
}
