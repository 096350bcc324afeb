use serde::{Deserialize, Serialize};

/// One timestamped price/volume snapshot for a single instrument.
/// Immutable once constructed; `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: f64,
    pub change_24h: f64,
    pub volume_24h: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub open_24h: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Above,
    Below,
    Either,
}

/// A leaf condition plus its own comparison target, used inside COMPOUND
/// alerts. Clauses are never nested: validation rejects a compound clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionClause {
    pub condition: Condition,
    pub direction: Direction,
    pub target_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Compare the tick's last price against the target.
    Price,
    /// Compare `(price - base_price) / base_price * 100` against the target.
    Percentage { base_price: f64 },
    /// Compare the RSI over the trailing window against the target.
    Rsi { period: usize },
    /// Compare the EMA over the trailing window against the target.
    Ema { period: usize },
    /// Spike when current 24h volume exceeds `spike_factor` times the
    /// trailing average over `lookback` earlier ticks.
    Volume { spike_factor: f64, lookback: usize },
    /// Logical AND of all clauses; fails closed on missing inputs.
    Compound(Vec<ConditionClause>),
}

impl Condition {
    pub fn kind(&self) -> &'static str {
        match self {
            Condition::Price => "PRICE",
            Condition::Percentage { .. } => "PERCENTAGE",
            Condition::Rsi { .. } => "RSI",
            Condition::Ema { .. } => "EMA",
            Condition::Volume { .. } => "VOLUME",
            Condition::Compound(_) => "COMPOUND",
        }
    }
}

pub const DEFAULT_COOLDOWN_MS: u64 = 60_000;

/// Supplied by the alert CRUD collaborator. The core never mutates the
/// semantic fields, only derived trigger history elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDefinition {
    pub id: u64,
    pub symbol: String,
    pub condition: Condition,
    pub direction: Direction,
    pub target_value: f64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_active")]
    pub active: bool,
    pub created_at: i64,
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

fn default_active() -> bool {
    true
}

impl AlertDefinition {
    pub fn new(
        id: u64,
        symbol: impl Into<String>,
        condition: Condition,
        direction: Direction,
        target_value: f64,
    ) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            condition,
            direction,
            target_value,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            active: true,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_cooldown(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }
}

/// Outcome of evaluating one alert against one tick. Transient; lives only
/// in the memoization window and in trigger records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionResult {
    pub should_trigger: bool,
    pub reason: String,
    pub current_value: f64,
    pub target_value: f64,
    pub direction: Direction,
}

impl ConditionResult {
    /// A non-triggering result carrying the failure text, used so one
    /// alert's evaluation error never crosses into its siblings.
    pub fn suppressed(reason: impl Into<String>, direction: Direction, target: f64) -> Self {
        Self {
            should_trigger: false,
            reason: reason.into(),
            current_value: f64::NAN,
            target_value: target,
            direction,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub alert_id: u64,
    pub timestamp: i64,
    pub tick: PriceTick,
    pub result: ConditionResult,
}

/// Handed to the notification collaborator on trigger. Formatting and
/// delivery are entirely external.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub alert_id: u64,
    pub symbol: String,
    pub tick: PriceTick,
    pub result: ConditionResult,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Disconnected,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; manual restart required.
    Unavailable,
}

#[cfg(test)]
pub(crate) fn test_tick(symbol: &str, price: f64, timestamp: i64) -> PriceTick {
    PriceTick {
        symbol: symbol.to_string(),
        price,
        change_24h: 0.0,
        volume_24h: 1_000.0,
        high_24h: price,
        low_24h: price,
        open_24h: price,
        timestamp,
    }
}
