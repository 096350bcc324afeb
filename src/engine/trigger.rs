//! Cooldown enforcement and bounded trigger history.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::model::{ConditionResult, PriceTick, TriggerRecord};

struct TriggerState {
    /// Last trigger time per alert; the cooldown source of truth, never
    /// evicted while the alert exists.
    last: HashMap<u64, i64>,
    /// Global audit log, oldest evicted first past the cap.
    history: VecDeque<TriggerRecord>,
}

pub struct TriggerController {
    state: Mutex<TriggerState>,
    history_cap: usize,
}

impl TriggerController {
    pub fn new(history_cap: usize) -> Self {
        Self {
            state: Mutex::new(TriggerState {
                last: HashMap::new(),
                history: VecDeque::new(),
            }),
            history_cap,
        }
    }

    /// The check-and-record step as one atomic unit per alert: returns true
    /// and records the trigger only if the alert is outside its cooldown
    /// window. Concurrent qualifying evaluations cannot double-fire.
    pub fn check_and_record(
        &self,
        alert_id: u64,
        cooldown_ms: u64,
        now: i64,
        tick: &PriceTick,
        result: &ConditionResult,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(&last) = state.last.get(&alert_id) {
            if now.saturating_sub(last) < cooldown_ms as i64 {
                return false;
            }
        }
        state.last.insert(alert_id, now);
        state.history.push_back(TriggerRecord {
            alert_id,
            timestamp: now,
            tick: tick.clone(),
            result: result.clone(),
        });
        while state.history.len() > self.history_cap {
            state.history.pop_front();
        }
        true
    }

    /// Drops cooldown state for a removed alert. Audit records stay until
    /// evicted by the cap.
    pub fn forget(&self, alert_id: u64) {
        self.state.lock().unwrap().last.remove(&alert_id);
    }

    pub fn last_trigger(&self, alert_id: u64) -> Option<i64> {
        self.state.lock().unwrap().last.get(&alert_id).copied()
    }

    pub fn history(&self) -> Vec<TriggerRecord> {
        self.state.lock().unwrap().history.iter().cloned().collect()
    }
}
