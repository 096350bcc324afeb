//! Pipeline configuration.
//!
//! Every field has a built-in default so the binary runs with no config file;
//! a JSON file can override any subset of fields.

use std::path::Path;

use serde::Deserialize;

use crate::error::AlertflowError;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AlertflowError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// WebSocket endpoint of the aggregated all-symbols ticker stream.
    #[serde(default = "default_feed_url")]
    pub url: String,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_feed_url() -> String {
    "wss://stream.binance.com:9443/ws/!ticker@arr".to_string()
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            ping_interval_ms: default_ping_interval_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt (milliseconds).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap on the backoff delay (milliseconds).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempts before the feed is declared unavailable.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Delivery cycle length; ticks arriving within one cycle coalesce to
    /// the latest value per symbol before subscribers are notified.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    100
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    /// TTL for memoized (alert, tick) results (milliseconds).
    #[serde(default = "default_memo_ttl_ms")]
    pub memo_ttl_ms: u64,
    /// Trailing ticks kept per symbol for indicator math.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

fn default_memo_ttl_ms() -> u64 {
    5_000
}

fn default_history_cap() -> usize {
    500
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            memo_ttl_ms: default_memo_ttl_ms(),
            history_cap: default_history_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Worker count; 0 means available hardware parallelism.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_queue_cap")]
    pub queue_cap: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Consecutive failures before a worker is retired and replaced.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

fn default_queue_cap() -> usize {
    1_024
}

fn default_task_timeout_ms() -> u64 {
    10_000
}

fn default_error_threshold() -> u32 {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_cap: default_queue_cap(),
            task_timeout_ms: default_task_timeout_ms(),
            error_threshold: default_error_threshold(),
        }
    }
}

impl PoolConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Global cap on retained trigger records; oldest evicted first.
    #[serde(default = "default_trigger_history_cap")]
    pub history_cap: usize,
}

fn default_trigger_history_cap() -> usize {
    1_000
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            history_cap: default_trigger_history_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

fn default_report_interval_ms() -> u64 {
    10_000
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_ms: default_report_interval_ms(),
        }
    }
}
