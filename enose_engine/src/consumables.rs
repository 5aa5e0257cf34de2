//! Consumable accounting: pump tubes, filters, cleaning pump.
//!
//! Two counter families: volume-charged (per pump tube, cumulative
//! injected volume) and time-charged (filters and the cleaning pump,
//! wall-clock operation time). Usage is strictly monotonic except for an
//! explicit reset. Status is recomputed on every charge so a critical
//! transition is observable to subscribers immediately.

use std::collections::HashMap;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use enose_common::config::{ConsumableKind, ConsumableSpec};

/// Wear status of one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CounterStatus {
    /// Below the warning threshold.
    Ok,
    /// Past the warning threshold.
    Warning,
    /// Past the critical threshold.
    Critical,
}

/// Emitted whenever a charge crosses a threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterAlert {
    /// Counter id.
    pub id: String,
    /// New status.
    pub status: CounterStatus,
    /// Remaining lifetime fraction in [0, 1].
    pub remaining_ratio: f64,
}

#[derive(Debug, Clone)]
struct Counter {
    spec: ConsumableSpec,
    used: f64,
    status: CounterStatus,
}

impl Counter {
    fn compute_status(&self) -> CounterStatus {
        let frac = self.used / self.spec.lifetime;
        if frac >= self.spec.critical_at {
            CounterStatus::Critical
        } else if frac >= self.spec.warning_at {
            CounterStatus::Warning
        } else {
            CounterStatus::Ok
        }
    }

    fn remaining_ratio(&self) -> f64 {
        (1.0 - self.used / self.spec.lifetime).max(0.0)
    }
}

/// Read-only view of one counter.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSnapshot {
    /// Counter id.
    pub id: String,
    /// Charging family.
    pub kind: ConsumableKind,
    /// Accumulated usage.
    pub used: f64,
    /// Design lifetime.
    pub lifetime: f64,
    /// Current status.
    pub status: CounterStatus,
    /// Remaining lifetime fraction in [0, 1].
    pub remaining_ratio: f64,
}

/// The consumable ledger.
pub struct ConsumableLedger {
    counters: Mutex<Vec<Counter>>,
    subscribers: Mutex<Vec<Sender<CounterAlert>>>,
}

impl ConsumableLedger {
    /// Build from configured specs.
    pub fn from_specs(specs: &[ConsumableSpec]) -> Self {
        let counters = specs
            .iter()
            .map(|spec| {
                let mut c = Counter {
                    spec: spec.clone(),
                    used: 0.0,
                    status: CounterStatus::Ok,
                };
                c.status = c.compute_status();
                c
            })
            .collect();
        Self {
            counters: Mutex::new(counters),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to threshold-crossing alerts.
    pub fn subscribe(&self) -> Receiver<CounterAlert> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Charge a pump-tube counter by injected volume [ml].
    pub fn charge_volume(&self, pump_index: u8, volume_ml: f64) -> CounterStatus {
        self.charge(&format!("pump_tube_{pump_index}"), volume_ml)
    }

    /// Charge a time-family counter by operation time [s].
    pub fn charge_time(&self, id: &str, seconds: f64) -> CounterStatus {
        self.charge(id, seconds)
    }

    fn charge(&self, id: &str, amount: f64) -> CounterStatus {
        if amount <= 0.0 {
            return self.status(id);
        }
        let mut counters = self.counters.lock();
        let Some(c) = counters.iter_mut().find(|c| c.spec.id == id) else {
            // Uncounted consumables charge into the void.
            return CounterStatus::Ok;
        };
        c.used += amount;
        let new_status = c.compute_status();
        let crossed = new_status != c.status;
        c.status = new_status;
        let alert = CounterAlert {
            id: c.spec.id.clone(),
            status: new_status,
            remaining_ratio: c.remaining_ratio(),
        };
        drop(counters);

        if crossed {
            match alert.status {
                CounterStatus::Critical => {
                    warn!(id = %alert.id, "consumable critical")
                }
                CounterStatus::Warning => {
                    warn!(id = %alert.id, remaining = alert.remaining_ratio, "consumable warning")
                }
                CounterStatus::Ok => {}
            }
            self.subscribers
                .lock()
                .retain(|tx| tx.send(alert.clone()).is_ok());
        }
        alert.status
    }

    /// Status of one counter; unknown ids read as `Ok`.
    pub fn status(&self, id: &str) -> CounterStatus {
        self.counters
            .lock()
            .iter()
            .find(|c| c.spec.id == id)
            .map(|c| c.status)
            .unwrap_or(CounterStatus::Ok)
    }

    /// Remaining lifetime fraction of one counter.
    pub fn remaining_ratio(&self, id: &str) -> f64 {
        self.counters
            .lock()
            .iter()
            .find(|c| c.spec.id == id)
            .map(|c| c.remaining_ratio())
            .unwrap_or(1.0)
    }

    /// True if any of the given pump tubes is critical.
    pub fn any_pump_critical(&self, pump_indices: &[u8]) -> bool {
        pump_indices
            .iter()
            .any(|i| self.status(&format!("pump_tube_{i}")) == CounterStatus::Critical)
    }

    /// Zero one counter after replacement.
    pub fn reset(&self, id: &str, note: &str) {
        let mut counters = self.counters.lock();
        if let Some(c) = counters.iter_mut().find(|c| c.spec.id == id) {
            info!(id, note, previous_used = c.used, "consumable reset");
            c.used = 0.0;
            c.status = c.compute_status();
        }
    }

    /// All counters, for display and persistence.
    pub fn snapshots(&self) -> Vec<CounterSnapshot> {
        self.counters
            .lock()
            .iter()
            .map(|c| CounterSnapshot {
                id: c.spec.id.clone(),
                kind: c.spec.kind,
                used: c.used,
                lifetime: c.spec.lifetime,
                status: c.status,
                remaining_ratio: c.remaining_ratio(),
            })
            .collect()
    }

    /// Serialize usage for the store's key-value side table.
    pub fn usage_json(&self) -> String {
        let map: HashMap<String, f64> = self
            .counters
            .lock()
            .iter()
            .map(|c| (c.spec.id.clone(), c.used))
            .collect();
        serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
    }

    /// Restore usage persisted by [`usage_json`](Self::usage_json).
    pub fn restore_usage_json(&self, json: &str) {
        let Ok(map) = serde_json::from_str::<HashMap<String, f64>>(json) else {
            warn!("unparseable consumable usage snapshot ignored");
            return;
        };
        let mut counters = self.counters.lock();
        for c in counters.iter_mut() {
            if let Some(used) = map.get(&c.spec.id) {
                c.used = *used;
                c.status = c.compute_status();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enose_common::config::default_consumables;

    fn small_tube(id: &str) -> ConsumableSpec {
        ConsumableSpec {
            id: id.to_string(),
            kind: ConsumableKind::Volume,
            lifetime: 10.0,
            warning_at: 0.5,
            critical_at: 0.9,
        }
    }

    #[test]
    fn status_progression() {
        let ledger = ConsumableLedger::from_specs(&[small_tube("pump_tube_0")]);
        assert_eq!(ledger.charge_volume(0, 4.0), CounterStatus::Ok);
        assert_eq!(ledger.charge_volume(0, 2.0), CounterStatus::Warning);
        assert_eq!(ledger.charge_volume(0, 3.5), CounterStatus::Critical);
        assert!((ledger.remaining_ratio("pump_tube_0") - 0.05).abs() < 1e-9);
    }

    #[test]
    fn alerts_fire_on_crossings_only() {
        let ledger = ConsumableLedger::from_specs(&[small_tube("pump_tube_0")]);
        let rx = ledger.subscribe();

        ledger.charge_volume(0, 1.0); // Ok, no crossing
        ledger.charge_volume(0, 5.0); // → Warning
        ledger.charge_volume(0, 0.1); // still Warning, no alert
        ledger.charge_volume(0, 4.0); // → Critical

        let alerts: Vec<CounterAlert> = rx.try_iter().collect();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].status, CounterStatus::Warning);
        assert_eq!(alerts[1].status, CounterStatus::Critical);
    }

    #[test]
    fn reset_returns_to_ok() {
        let ledger = ConsumableLedger::from_specs(&[small_tube("pump_tube_0")]);
        ledger.charge_volume(0, 9.5);
        assert_eq!(ledger.status("pump_tube_0"), CounterStatus::Critical);
        ledger.reset("pump_tube_0", "tube replaced");
        assert_eq!(ledger.status("pump_tube_0"), CounterStatus::Ok);
        assert_eq!(ledger.remaining_ratio("pump_tube_0"), 1.0);
    }

    #[test]
    fn usage_survives_json_round_trip() {
        let ledger = ConsumableLedger::from_specs(&default_consumables());
        ledger.charge_volume(2, 123.0);
        ledger.charge_time("inlet_filter", 45.0);
        let json = ledger.usage_json();

        let restored = ConsumableLedger::from_specs(&default_consumables());
        restored.restore_usage_json(&json);
        let snap = restored
            .snapshots()
            .into_iter()
            .find(|s| s.id == "pump_tube_2")
            .unwrap();
        assert_eq!(snap.used, 123.0);
    }

    #[test]
    fn any_pump_critical_checks_only_given_pumps() {
        let ledger =
            ConsumableLedger::from_specs(&[small_tube("pump_tube_0"), small_tube("pump_tube_1")]);
        ledger.charge_volume(0, 9.9);
        assert!(ledger.any_pump_critical(&[0, 1]));
        assert!(!ledger.any_pump_critical(&[1]));
    }

    #[test]
    fn unknown_counter_charges_are_ignored() {
        let ledger = ConsumableLedger::from_specs(&[]);
        assert_eq!(ledger.charge_time("nonexistent", 100.0), CounterStatus::Ok);
    }
}
