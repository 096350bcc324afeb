//! Alert definitions keyed by id, secondarily indexed by symbol.

use std::collections::HashMap;

use crate::error::AlertflowError;
use crate::model::{AlertDefinition, Condition, ConditionClause};

#[derive(Default)]
pub struct AlertIndex {
    alerts: HashMap<u64, AlertDefinition>,
    by_symbol: HashMap<String, Vec<u64>>,
}

impl AlertIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and indexes a definition. Returns whether this is the
    /// first alert for its symbol, which is the caller's cue to subscribe.
    pub fn add(&mut self, def: AlertDefinition) -> Result<bool, AlertflowError> {
        validate(&def)?;
        if self.alerts.contains_key(&def.id) {
            return Err(AlertflowError::InvalidAlert(format!(
                "duplicate alert id {}",
                def.id
            )));
        }
        let bucket = self.by_symbol.entry(def.symbol.clone()).or_default();
        let first_for_symbol = bucket.is_empty();
        bucket.push(def.id);
        self.alerts.insert(def.id, def);
        Ok(first_for_symbol)
    }

    /// Removes a definition. The returned flag says whether its symbol
    /// bucket is now empty, the caller's cue to unsubscribe.
    pub fn remove(&mut self, id: u64) -> Option<(AlertDefinition, bool)> {
        let def = self.alerts.remove(&id)?;
        let mut last_for_symbol = false;
        if let Some(bucket) = self.by_symbol.get_mut(&def.symbol) {
            bucket.retain(|&aid| aid != id);
            if bucket.is_empty() {
                self.by_symbol.remove(&def.symbol);
                last_for_symbol = true;
            }
        }
        Some((def, last_for_symbol))
    }

    pub fn get(&self, id: u64) -> Option<&AlertDefinition> {
        self.alerts.get(&id)
    }

    pub fn alerts_for(&self, symbol: &str) -> Vec<&AlertDefinition> {
        self.by_symbol
            .get(symbol)
            .map(|ids| ids.iter().filter_map(|id| self.alerts.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn has_alerts_for(&self, symbol: &str) -> bool {
        self.by_symbol.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

fn validate(def: &AlertDefinition) -> Result<(), AlertflowError> {
    if def.symbol.trim().is_empty() {
        return Err(AlertflowError::InvalidAlert("empty symbol".to_string()));
    }
    if !def.target_value.is_finite() {
        return Err(AlertflowError::InvalidAlert(format!(
            "target value {} is not finite",
            def.target_value
        )));
    }
    validate_condition(&def.condition, true)
}

fn validate_condition(condition: &Condition, allow_compound: bool) -> Result<(), AlertflowError> {
    match condition {
        Condition::Price => Ok(()),
        Condition::Percentage { base_price } => {
            if !base_price.is_finite() || *base_price <= 0.0 {
                return Err(AlertflowError::InvalidAlert(format!(
                    "percentage base price {} must be positive",
                    base_price
                )));
            }
            Ok(())
        }
        Condition::Rsi { period } => {
            if *period < 2 {
                return Err(AlertflowError::InvalidAlert(format!(
                    "RSI period {} must be at least 2",
                    period
                )));
            }
            Ok(())
        }
        Condition::Ema { period } => {
            if *period < 2 {
                return Err(AlertflowError::InvalidAlert(format!(
                    "EMA period {} must be at least 2",
                    period
                )));
            }
            Ok(())
        }
        Condition::Volume {
            spike_factor,
            lookback,
        } => {
            if !spike_factor.is_finite() || *spike_factor <= 0.0 {
                return Err(AlertflowError::InvalidAlert(format!(
                    "volume spike factor {} must be positive",
                    spike_factor
                )));
            }
            if *lookback == 0 {
                return Err(AlertflowError::InvalidAlert(
                    "volume lookback must be at least 1".to_string(),
                ));
            }
            Ok(())
        }
        Condition::Compound(clauses) => {
            if !allow_compound {
                return Err(AlertflowError::InvalidAlert(
                    "compound conditions cannot nest".to_string(),
                ));
            }
            if clauses.is_empty() {
                return Err(AlertflowError::InvalidAlert(
                    "compound condition needs at least one clause".to_string(),
                ));
            }
            for ConditionClause {
                condition,
                target_value,
                ..
            } in clauses
            {
                if !target_value.is_finite() {
                    return Err(AlertflowError::InvalidAlert(format!(
                        "clause target value {} is not finite",
                        target_value
                    )));
                }
                validate_condition(condition, false)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Direction;

    fn price_alert(id: u64, symbol: &str) -> AlertDefinition {
        AlertDefinition::new(id, symbol, Condition::Price, Direction::Above, 49_000.0)
    }

    #[test]
    fn add_and_lookup_by_symbol() {
        let mut index = AlertIndex::new();
        assert!(index.add(price_alert(1, "BTCUSDT")).unwrap());
        assert!(!index.add(price_alert(2, "BTCUSDT")).unwrap());
        assert!(index.add(price_alert(3, "ETHUSDT")).unwrap());

        let ids: Vec<u64> = index.alerts_for("BTCUSDT").iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(index.alerts_for("SOLUSDT").is_empty());
    }

    #[test]
    fn remove_signals_last_for_symbol() {
        let mut index = AlertIndex::new();
        index.add(price_alert(1, "BTCUSDT")).unwrap();
        index.add(price_alert(2, "BTCUSDT")).unwrap();

        let (_, last) = index.remove(1).unwrap();
        assert!(!last);
        let (_, last) = index.remove(2).unwrap();
        assert!(last);
        assert!(!index.has_alerts_for("BTCUSDT"));
        assert!(index.remove(2).is_none());
    }

    #[test]
    fn rejects_duplicate_id() {
        let mut index = AlertIndex::new();
        index.add(price_alert(1, "BTCUSDT")).unwrap();
        let err = index.add(price_alert(1, "ETHUSDT")).unwrap_err();
        assert!(matches!(err, AlertflowError::InvalidAlert(_)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn rejects_malformed_definitions() {
        let mut index = AlertIndex::new();
        let cases = vec![
            price_alert(1, "  "),
            AlertDefinition::new(2, "BTCUSDT", Condition::Price, Direction::Above, f64::NAN),
            AlertDefinition::new(
                3,
                "BTCUSDT",
                Condition::Percentage { base_price: 0.0 },
                Direction::Above,
                5.0,
            ),
            AlertDefinition::new(
                4,
                "BTCUSDT",
                Condition::Rsi { period: 1 },
                Direction::Above,
                70.0,
            ),
            AlertDefinition::new(
                8,
                "BTCUSDT",
                Condition::Ema { period: 1 },
                Direction::Above,
                50_000.0,
            ),
            AlertDefinition::new(
                5,
                "BTCUSDT",
                Condition::Volume {
                    spike_factor: -1.0,
                    lookback: 10,
                },
                Direction::Above,
                0.0,
            ),
            AlertDefinition::new(
                6,
                "BTCUSDT",
                Condition::Compound(vec![]),
                Direction::Above,
                0.0,
            ),
            AlertDefinition::new(
                7,
                "BTCUSDT",
                Condition::Compound(vec![ConditionClause {
                    condition: Condition::Compound(vec![]),
                    direction: Direction::Above,
                    target_value: 1.0,
                }]),
                Direction::Above,
                0.0,
            ),
        ];
        for def in cases {
            let id = def.id;
            assert!(index.add(def).is_err(), "case {} should be rejected", id);
        }
        assert!(index.is_empty());
    }
}
