//! Per-alert condition evaluation.
//!
//! Dispatches on condition type, offloads indicator math to the worker
//! pool, and memoizes results per (alert, tick timestamp) so a tick fanning
//! out to several evaluations is computed once. An evaluation error is
//! resolved into a non-triggering result; it never crosses into a sibling
//! alert's evaluation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::warn;

use crate::config::EvaluatorConfig;
use crate::error::AlertflowError;
use crate::model::{
    AlertDefinition, Condition, ConditionClause, ConditionResult, Direction, PriceTick,
};
use crate::pool::{TaskKind, WorkerPool};

/// Queue priority for indicator tasks submitted by live evaluation.
const INDICATOR_PRIORITY: u8 = 5;

/// Memo entries past this count trigger an expiry sweep on insert.
const MEMO_SWEEP_THRESHOLD: usize = 4_096;

/// Trailing ticks per symbol, fed by the engine loop, read for RSI inputs
/// and the volume lookback window.
pub struct SymbolHistory {
    inner: RwLock<HashMap<String, VecDeque<PriceTick>>>,
    cap: usize,
}

impl SymbolHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            cap,
        }
    }

    pub fn push(&self, tick: &PriceTick) {
        let mut map = self.inner.write().unwrap();
        let window = map.entry(tick.symbol.clone()).or_default();
        // The registry already filters stale ticks, but a duplicate flush
        // must not double-count a timestamp.
        if window.back().map(|t| t.timestamp >= tick.timestamp) == Some(true) {
            return;
        }
        window.push_back(tick.clone());
        while window.len() > self.cap {
            window.pop_front();
        }
    }

    pub fn closes(&self, symbol: &str) -> Vec<f64> {
        self.inner
            .read()
            .unwrap()
            .get(symbol)
            .map(|w| w.iter().map(|t| t.price).collect())
            .unwrap_or_default()
    }

    /// Average 24h volume over the `lookback` ticks preceding the most
    /// recent one. None until enough history exists.
    pub fn trailing_volume_average(&self, symbol: &str, lookback: usize) -> Option<f64> {
        let map = self.inner.read().unwrap();
        let window = map.get(symbol)?;
        if window.len() < lookback + 1 {
            return None;
        }
        let volumes: Vec<f64> = window
            .iter()
            .rev()
            .skip(1)
            .take(lookback)
            .map(|t| t.volume_24h)
            .collect();
        Some(volumes.iter().sum::<f64>() / volumes.len() as f64)
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.inner
            .read()
            .unwrap()
            .get(symbol)
            .map(|w| w.len())
            .unwrap_or(0)
    }
}

struct MemoEntry {
    at: Instant,
    result: ConditionResult,
}

pub struct ConditionEvaluator {
    pool: Arc<WorkerPool>,
    history: Arc<SymbolHistory>,
    memo: Mutex<HashMap<(u64, i64), MemoEntry>>,
    memo_ttl: Duration,
}

impl ConditionEvaluator {
    pub fn new(
        pool: Arc<WorkerPool>,
        history: Arc<SymbolHistory>,
        config: &EvaluatorConfig,
    ) -> Self {
        Self {
            pool,
            history,
            memo: Mutex::new(HashMap::new()),
            memo_ttl: Duration::from_millis(config.memo_ttl_ms),
        }
    }

    pub async fn evaluate(&self, def: &AlertDefinition, tick: &PriceTick) -> ConditionResult {
        let key = (def.id, tick.timestamp);
        if let Some(cached) = self.memo_get(key) {
            return cached;
        }

        let evaluated = match &def.condition {
            Condition::Compound(clauses) => self.eval_compound(def, clauses, tick).await,
            leaf => {
                self.eval_leaf(leaf, def.direction, def.target_value, tick)
                    .await
            }
        };
        let result = match evaluated {
            Ok(result) => result,
            Err(e) => {
                warn!("alert {} evaluation error: {}", def.id, e);
                ConditionResult::suppressed(e.to_string(), def.direction, def.target_value)
            }
        };

        self.memo_put(key, result.clone());
        result
    }

    fn memo_get(&self, key: (u64, i64)) -> Option<ConditionResult> {
        let mut memo = self.memo.lock().unwrap();
        match memo.get(&key) {
            Some(entry) if entry.at.elapsed() <= self.memo_ttl => Some(entry.result.clone()),
            Some(_) => {
                memo.remove(&key);
                None
            }
            None => None,
        }
    }

    fn memo_put(&self, key: (u64, i64), result: ConditionResult) {
        let mut memo = self.memo.lock().unwrap();
        if memo.len() >= MEMO_SWEEP_THRESHOLD {
            let ttl = self.memo_ttl;
            memo.retain(|_, entry| entry.at.elapsed() <= ttl);
        }
        memo.insert(
            key,
            MemoEntry {
                at: Instant::now(),
                result,
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn memo_len(&self) -> usize {
        self.memo.lock().unwrap().len()
    }

    /// Evaluates a non-compound condition. Compound clauses are flattened
    /// by `eval_compound`, so a compound here is an internal error.
    async fn eval_leaf(
        &self,
        condition: &Condition,
        direction: Direction,
        target: f64,
        tick: &PriceTick,
    ) -> Result<ConditionResult, AlertflowError> {
        match condition {
            Condition::Price => Ok(directional("Price", tick.price, target, direction, "")),
            Condition::Percentage { base_price } => {
                let change = (tick.price - base_price) / base_price * 100.0;
                Ok(directional("Change", change, target, direction, "%"))
            }
            Condition::Rsi { period } => {
                let closes = self.history.closes(&tick.symbol);
                if closes.len() < period + 1 {
                    return Err(AlertflowError::Evaluation(format!(
                        "insufficient price history for RSI({}): {} of {} ticks",
                        period,
                        closes.len(),
                        period + 1
                    )));
                }
                let value = self
                    .pool
                    .execute(
                        TaskKind::Rsi {
                            prices: closes,
                            period: *period,
                        },
                        INDICATOR_PRIORITY,
                    )
                    .await?;
                Ok(directional("RSI", value, target, direction, ""))
            }
            Condition::Ema { period } => {
                let closes = self.history.closes(&tick.symbol);
                if closes.len() < *period {
                    return Err(AlertflowError::Evaluation(format!(
                        "insufficient price history for EMA({}): {} of {} ticks",
                        period,
                        closes.len(),
                        period
                    )));
                }
                let value = self
                    .pool
                    .execute(
                        TaskKind::Ema {
                            prices: closes,
                            period: *period,
                        },
                        INDICATOR_PRIORITY,
                    )
                    .await?;
                Ok(directional("EMA", value, target, direction, ""))
            }
            Condition::Volume {
                spike_factor,
                lookback,
            } => {
                let average = self
                    .history
                    .trailing_volume_average(&tick.symbol, *lookback)
                    .ok_or_else(|| {
                        AlertflowError::Evaluation(format!(
                            "insufficient volume history for lookback {}",
                            lookback
                        ))
                    })?;
                let threshold = spike_factor * average;
                Ok(directional("Volume", tick.volume_24h, threshold, direction, ""))
            }
            Condition::Compound(_) => Err(AlertflowError::Evaluation(
                "nested compound condition".to_string(),
            )),
        }
    }

    /// Logical AND over the clauses; any clause whose inputs are
    /// unavailable fails the whole compound closed.
    async fn eval_compound(
        &self,
        def: &AlertDefinition,
        clauses: &[ConditionClause],
        tick: &PriceTick,
    ) -> Result<ConditionResult, AlertflowError> {
        let mut reasons = Vec::with_capacity(clauses.len());
        let mut all_met = true;
        let mut current_value = f64::NAN;
        for clause in clauses {
            let result = self
                .eval_leaf(&clause.condition, clause.direction, clause.target_value, tick)
                .await?;
            if current_value.is_nan() {
                current_value = result.current_value;
            }
            all_met &= result.should_trigger;
            reasons.push(result.reason);
        }
        Ok(ConditionResult {
            should_trigger: all_met,
            reason: reasons.join("; "),
            current_value,
            target_value: def.target_value,
            direction: def.direction,
        })
    }
}

fn directional(
    label: &str,
    value: f64,
    target: f64,
    direction: Direction,
    unit: &str,
) -> ConditionResult {
    let above = value >= target;
    let below = value <= target;
    let met = match direction {
        Direction::Above => above,
        Direction::Below => below,
        Direction::Either => above || below,
    };
    let comparator = match (direction, met) {
        (Direction::Above, true) => ">=",
        (Direction::Above, false) => "<",
        (Direction::Below, true) => "<=",
        (Direction::Below, false) => ">",
        (Direction::Either, _) => {
            if above {
                ">="
            } else {
                "<="
            }
        }
    };
    ConditionResult {
        should_trigger: met,
        reason: format!(
            "{} {}{} {} {}{}",
            label,
            fmt_value(value),
            unit,
            comparator,
            fmt_value(target),
            unit
        ),
        current_value: value,
        target_value: target,
        direction,
    }
}

/// Whole numbers print bare ("49500"), everything else with two decimals.
fn fmt_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}
