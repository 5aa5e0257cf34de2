//! Request/reply client for the motion controller.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{MacroCommand, MotionError, MotionPort};
use enose_common::peripheral::DeltaCommand;

/// Status of one pump axis as reported by `QUERY_PUMP`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PumpStatus {
    /// Axis currently executing a move.
    pub moving: bool,
    /// Axis position [mm].
    pub position_mm: f64,
}

struct PortState {
    port: Box<dyn MotionPort>,
    seq: u64,
}

/// Connection-oriented client for the G-code macro surface.
///
/// The request/reply correlation lives under a single mutex: one command
/// is in flight at a time and the reply is matched to it by order, which
/// is the controller's own guarantee. The link never calls back into the
/// engine.
pub struct MotionLink {
    state: Mutex<PortState>,
    ack_timeout: Duration,
}

impl MotionLink {
    /// Wrap a transport with the given acknowledgement window.
    pub fn new(port: Box<dyn MotionPort>, ack_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(PortState { port, seq: 0 }),
            ack_timeout,
        }
    }

    /// The configured acknowledgement window.
    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Send one macro and wait for its ack.
    ///
    /// Returns the ack payload (the text after `ok`), or the appropriate
    /// [`MotionError`]. A timeout here is the caller's signal to mark the
    /// surrounding transition degraded.
    pub fn command(&self, cmd: &MacroCommand) -> Result<String, MotionError> {
        let line = cmd.render();
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        debug!(seq, command = %line, "motion tx");

        state.port.send_line(&line)?;

        match state.port.recv_line(self.ack_timeout)? {
            None => {
                warn!(seq, command = %line, "motion ack window elapsed");
                Err(MotionError::Timeout {
                    command: line,
                    window_ms: self.ack_timeout.as_millis() as u64,
                })
            }
            Some(reply) => parse_reply(&line, &reply),
        }
    }

    /// Apply one peripheral-state delta.
    pub fn apply_delta(&self, delta: &DeltaCommand) -> Result<(), MotionError> {
        let cmd = MacroCommand::from_delta(delta)?;
        self.command(&cmd).map(|_| ())
    }

    /// Run one pump axis: speed, acceleration, travel distance.
    pub fn run_pump(
        &self,
        index: u8,
        speed_mm_s: f64,
        accel_mm_s2: f64,
        distance_mm: f64,
    ) -> Result<(), MotionError> {
        self.command(&MacroCommand::RunPump {
            index,
            speed_mm_s,
            accel_mm_s2,
            distance_mm,
        })
        .map(|_| ())
    }

    /// Halt one pump axis.
    pub fn stop_pump(&self, index: u8) -> Result<(), MotionError> {
        self.command(&MacroCommand::StopPump { index }).map(|_| ())
    }

    /// Halt all motion immediately.
    pub fn emergency_stop(&self) -> Result<(), MotionError> {
        self.command(&MacroCommand::EmergencyStop).map(|_| ())
    }

    /// Query one pump axis.
    pub fn query_pump(&self, index: u8) -> Result<PumpStatus, MotionError> {
        let payload = self.command(&MacroCommand::QueryPump { index })?;
        parse_pump_status(&payload)
    }
}

/// Parse `ok [payload]` / `!! message` reply lines.
fn parse_reply(command: &str, reply: &str) -> Result<String, MotionError> {
    let reply = reply.trim();
    if let Some(payload) = reply.strip_prefix("ok") {
        return Ok(payload.trim().to_string());
    }
    if let Some(message) = reply.strip_prefix("!!") {
        return Err(MotionError::Rejected {
            command: command.to_string(),
            message: message.trim().to_string(),
        });
    }
    Err(MotionError::MalformedReply(reply.to_string()))
}

/// Parse `MOVING=0 POS=1.250` query payloads.
fn parse_pump_status(payload: &str) -> Result<PumpStatus, MotionError> {
    let mut status = PumpStatus::default();
    let mut saw_moving = false;
    for field in payload.split_whitespace() {
        let Some((key, value)) = field.split_once('=') else {
            continue;
        };
        match key {
            "MOVING" => {
                status.moving = value != "0";
                saw_moving = true;
            }
            "POS" => {
                status.position_mm = value
                    .parse()
                    .map_err(|_| MotionError::MalformedReply(payload.to_string()))?;
            }
            _ => {}
        }
    }
    if !saw_moving {
        return Err(MotionError::MalformedReply(payload.to_string()));
    }
    Ok(status)
}
