//! Scripted sensor port for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::protocol::{SensorEvent, SensorReply};
use super::{SensorError, SensorPort};

#[derive(Debug, Default)]
struct SimSensorState {
    dead: bool,
    reject_next: Option<String>,
    incoming: VecDeque<String>,
    received_ops: Vec<String>,
    received_ids: Vec<u64>,
}

/// Simulated [`SensorPort`]: auto-acks commands and lets tests inject
/// unsolicited events.
pub struct SimSensorPort {
    name: String,
    state: Arc<Mutex<SimSensorState>>,
}

/// Test-side handle to a [`SimSensorPort`].
#[derive(Clone)]
pub struct SimSensorHandle {
    state: Arc<Mutex<SimSensorState>>,
}

impl SimSensorPort {
    /// A port that acks every command.
    pub fn healthy(name: &str) -> (Self, SimSensorHandle) {
        let state = Arc::new(Mutex::new(SimSensorState::default()));
        (
            Self {
                name: name.to_string(),
                state: state.clone(),
            },
            SimSensorHandle { state },
        )
    }
}

impl SensorPort for SimSensorPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_line(&mut self, line: &str) -> Result<(), SensorError> {
        let mut state = self.state.lock();

        // Record what arrived for assertions, even when playing dead.
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(id) = v.get("id").and_then(|x| x.as_u64()) {
                state.received_ids.push(id);
            }
            if let Some(op) = v.get("op").and_then(|x| x.as_str()) {
                state.received_ops.push(op.to_string());
            }
            if state.dead {
                return Ok(());
            }
            if let Some(id) = v.get("id").and_then(|x| x.as_u64()) {
                let reply = SensorReply {
                    id,
                    ok: state.reject_next.is_none(),
                    message: state.reject_next.take(),
                };
                if let Ok(line) = serde_json::to_string(&reply) {
                    state.incoming.push_back(line);
                }
            }
        }
        Ok(())
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, SensorError> {
        if let Some(line) = self.state.lock().incoming.pop_front() {
            return Ok(Some(line));
        }
        std::thread::sleep(timeout);
        Ok(self.state.lock().incoming.pop_front())
    }
}

impl SimSensorHandle {
    /// Stop acknowledging commands (events still flow).
    pub fn set_dead(&self, dead: bool) {
        self.state.lock().dead = dead;
    }

    /// Reject the next command with the given message.
    pub fn reject_next(&self, message: &str) {
        self.state.lock().reject_next = Some(message.to_string());
    }

    /// Inject an unsolicited event.
    pub fn push_event(&self, event: SensorEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            self.state.lock().incoming.push_back(line);
        }
    }

    /// Inject a raw line (for malformed-input tests).
    pub fn push_raw_line(&self, line: &str) {
        self.state.lock().incoming.push_back(line.to_string());
    }

    /// Operation names received so far.
    pub fn received_ops(&self) -> Vec<String> {
        self.state.lock().received_ops.clone()
    }

    /// Request ids received so far.
    pub fn received_ids(&self) -> Vec<u64> {
        self.state.lock().received_ids.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::SensorReading;
    use super::*;

    #[test]
    fn auto_ack_echoes_id() {
        let (mut port, _h) = SimSensorPort::healthy("sim");
        port.send_line(r#"{"id":5,"op":"start"}"#).unwrap();
        let line = port.recv_line(Duration::from_millis(5)).unwrap().unwrap();
        assert!(line.contains("\"id\":5"));
        assert!(line.contains("\"ok\":true"));
    }

    #[test]
    fn dead_port_swallows_but_records() {
        let (mut port, h) = SimSensorPort::healthy("sim");
        h.set_dead(true);
        port.send_line(r#"{"id":5,"op":"start"}"#).unwrap();
        assert!(port.recv_line(Duration::from_millis(5)).unwrap().is_none());
        assert_eq!(h.received_ops(), vec!["start".to_string()]);
    }

    #[test]
    fn pushed_events_come_out_as_lines() {
        let (mut port, h) = SimSensorPort::healthy("sim");
        h.push_event(SensorEvent::Data(SensorReading {
            t_us: 1,
            idx: 3,
            value: 2.5,
            heater_step: 0,
            humidity: None,
            temp_c: None,
        }));
        let line = port.recv_line(Duration::from_millis(5)).unwrap().unwrap();
        assert!(line.contains("\"event\":\"data\""));
        assert!(line.contains("\"idx\":3"));
    }
}
