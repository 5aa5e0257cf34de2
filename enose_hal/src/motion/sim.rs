//! Scripted motion-controller backend for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{MotionError, MotionPort};

/// One scripted reply to the next command.
#[derive(Debug, Clone, PartialEq)]
pub enum SimReply {
    /// Acknowledge with a payload (may be empty).
    Ok(String),
    /// Reject with a controller error message.
    Error(String),
    /// Swallow the command — the caller sees an ack timeout.
    Silence,
}

/// Link health of the simulated controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimMode {
    /// Every command acks immediately.
    Healthy,
    /// No command is ever acknowledged.
    Dead,
}

#[derive(Debug)]
struct SimState {
    mode: SimMode,
    sent: Vec<String>,
    scripted: VecDeque<SimReply>,
    pending: VecDeque<String>,
}

/// Simulated [`MotionPort`]: records every line sent and produces replies
/// per mode, with per-command scripted overrides.
pub struct SimMotionPort {
    state: Arc<Mutex<SimState>>,
}

/// Test-side handle to a [`SimMotionPort`].
#[derive(Clone)]
pub struct SimMotionHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimMotionPort {
    fn with_mode(mode: SimMode) -> (Self, SimMotionHandle) {
        let state = Arc::new(Mutex::new(SimState {
            mode,
            sent: Vec::new(),
            scripted: VecDeque::new(),
            pending: VecDeque::new(),
        }));
        (
            Self {
                state: state.clone(),
            },
            SimMotionHandle { state },
        )
    }

    /// A controller that acks everything.
    pub fn healthy() -> (Self, SimMotionHandle) {
        Self::with_mode(SimMode::Healthy)
    }

    /// A controller that never replies.
    pub fn dead() -> (Self, SimMotionHandle) {
        Self::with_mode(SimMode::Dead)
    }

    fn default_payload(line: &str) -> String {
        if line.starts_with("QUERY_PUMP") {
            "MOVING=0 POS=0.000".to_string()
        } else {
            String::new()
        }
    }
}

impl MotionPort for SimMotionPort {
    fn send_line(&mut self, line: &str) -> Result<(), MotionError> {
        let mut state = self.state.lock();
        state.sent.push(line.to_string());

        let reply = match state.scripted.pop_front() {
            Some(r) => r,
            None => match state.mode {
                SimMode::Healthy => SimReply::Ok(Self::default_payload(line)),
                SimMode::Dead => SimReply::Silence,
            },
        };

        match reply {
            SimReply::Ok(payload) if payload.is_empty() => {
                state.pending.push_back("ok".to_string())
            }
            SimReply::Ok(payload) => state.pending.push_back(format!("ok {payload}")),
            SimReply::Error(message) => state.pending.push_back(format!("!! {message}")),
            SimReply::Silence => {}
        }
        Ok(())
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, MotionError> {
        if let Some(line) = self.state.lock().pending.pop_front() {
            return Ok(Some(line));
        }
        // Nothing queued: emulate the wire going quiet for the window.
        std::thread::sleep(timeout);
        Ok(self.state.lock().pending.pop_front())
    }
}

impl SimMotionHandle {
    /// Every command line sent so far, in order.
    pub fn sent_lines(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Forget recorded lines.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Script the reply to the next unscripted command.
    pub fn push_reply(&self, reply: SimReply) {
        self.state.lock().scripted.push_back(reply);
    }

    /// Switch link health.
    pub fn set_mode(&self, mode: SimMode) {
        self.state.lock().mode = mode;
    }

    /// Count of lines sent that start with the given prefix.
    pub fn count_sent(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|l| l.starts_with(prefix))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_port_acks() {
        let (mut port, handle) = SimMotionPort::healthy();
        port.send_line("SET_VALVE VALVE=0 STATE=1").unwrap();
        let reply = port.recv_line(Duration::from_millis(5)).unwrap();
        assert_eq!(reply.as_deref(), Some("ok"));
        assert_eq!(handle.sent_lines().len(), 1);
    }

    #[test]
    fn dead_port_is_silent() {
        let (mut port, _handle) = SimMotionPort::dead();
        port.send_line("EMERGENCY_STOP").unwrap();
        let reply = port.recv_line(Duration::from_millis(5)).unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn scripted_replies_run_in_order() {
        let (mut port, handle) = SimMotionPort::healthy();
        handle.push_reply(SimReply::Error("nope".to_string()));
        handle.push_reply(SimReply::Silence);

        port.send_line("A").unwrap();
        assert_eq!(
            port.recv_line(Duration::from_millis(5)).unwrap().as_deref(),
            Some("!! nope")
        );

        port.send_line("B").unwrap();
        assert!(port.recv_line(Duration::from_millis(5)).unwrap().is_none());

        // Back to mode default.
        port.send_line("C").unwrap();
        assert_eq!(
            port.recv_line(Duration::from_millis(5)).unwrap().as_deref(),
            Some("ok")
        );
    }

    #[test]
    fn query_gets_status_payload() {
        let (mut port, _handle) = SimMotionPort::healthy();
        port.send_line("QUERY_PUMP PUMP=1").unwrap();
        let reply = port.recv_line(Duration::from_millis(5)).unwrap().unwrap();
        assert!(reply.contains("MOVING="));
    }
}
