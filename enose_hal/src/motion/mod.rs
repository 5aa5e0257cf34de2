//! Motion-controller link.
//!
//! The motion controller is a G-code-style printer firmware on a
//! microcontroller. Commands are named macros (`RUN_PUMP`, `SET_VALVE`,
//! `SET_FAN`, `SET_HEATER`, `EMERGENCY_STOP`, `QUERY_PUMP`); replies are
//! `ok [payload]` or `!! message`. An unacknowledged command is a timeout
//! after the configured window and surfaces as a *degraded* transition at
//! the state-machine level, not a hard failure.

mod link;
mod sim;
mod tcp;

pub use link::{MotionLink, PumpStatus};
pub use sim::{SimMode, SimMotionHandle, SimMotionPort, SimReply};
pub use tcp::TcpMotionPort;

use std::time::Duration;
use thiserror::Error;

use enose_common::peripheral::{DeltaCommand, PumpMotion, Valve};

/// Error types for motion-link operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MotionError {
    /// No reply within the acknowledgement window.
    #[error("command '{command}' unacknowledged after {window_ms} ms")]
    Timeout {
        /// The rendered command line.
        command: String,
        /// Acknowledgement window that elapsed.
        window_ms: u64,
    },

    /// The controller replied with an error.
    #[error("controller rejected '{command}': {message}")]
    Rejected {
        /// The rendered command line.
        command: String,
        /// Controller error text.
        message: String,
    },

    /// Transport-level failure (socket closed, serial gone).
    #[error("transport error: {0}")]
    Transport(String),

    /// The reply could not be parsed.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// The delta cannot be expressed as a macro.
    #[error("unsupported delta: {0}")]
    Unsupported(String),
}

/// Byte transport carrying one command line out and reply lines back.
///
/// Implementations own the socket/serial handle. `recv_line` blocks up to
/// `timeout` and returns [`MotionError::Timeout`]-free transport errors
/// only; the caller maps elapsed timeouts itself.
pub trait MotionPort: Send {
    /// Write one command line (newline appended by the transport).
    fn send_line(&mut self, line: &str) -> Result<(), MotionError>;

    /// Read the next reply line, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the window elapses with no reply.
    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, MotionError>;
}

/// A named G-code macro understood by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum MacroCommand {
    /// Run one pump axis over a distance with trapezoidal motion.
    RunPump {
        /// Pump index 0..7.
        index: u8,
        /// Speed [mm/s].
        speed_mm_s: f64,
        /// Acceleration [mm/s²].
        accel_mm_s2: f64,
        /// Travel distance [mm].
        distance_mm: f64,
    },
    /// Halt one pump axis.
    StopPump {
        /// Pump index 0..7.
        index: u8,
    },
    /// Move a valve.
    SetValve {
        /// Valve index 0..3.
        index: u8,
        /// Target position.
        to: Valve,
    },
    /// Set a fan-channel duty (air pump or cleaning pump).
    SetFan {
        /// Channel name, e.g. `air_pump`.
        channel: &'static str,
        /// Duty in [0, 1].
        duty: f64,
    },
    /// Set the chamber-heater duty.
    SetHeater {
        /// Duty in [0, 1].
        duty: f64,
    },
    /// Halt all motion immediately.
    EmergencyStop,
    /// Query one pump axis.
    QueryPump {
        /// Pump index 0..7.
        index: u8,
    },
}

impl MacroCommand {
    /// Render the command line sent over the wire.
    pub fn render(&self) -> String {
        match self {
            MacroCommand::RunPump {
                index,
                speed_mm_s,
                accel_mm_s2,
                distance_mm,
            } => format!(
                "RUN_PUMP PUMP={index} SPEED={speed_mm_s:.3} ACCEL={accel_mm_s2:.3} MOVE={distance_mm:.3}"
            ),
            MacroCommand::StopPump { index } => format!("STOP_PUMP PUMP={index}"),
            MacroCommand::SetValve { index, to } => format!(
                "SET_VALVE VALVE={index} STATE={}",
                if *to == Valve::Open { 1 } else { 0 }
            ),
            MacroCommand::SetFan { channel, duty } => {
                format!("SET_FAN FAN={channel} DUTY={duty:.3}")
            }
            MacroCommand::SetHeater { duty } => format!("SET_HEATER DUTY={duty:.3}"),
            MacroCommand::EmergencyStop => "EMERGENCY_STOP".to_string(),
            MacroCommand::QueryPump { index } => format!("QUERY_PUMP PUMP={index}"),
        }
    }

    /// Translate a peripheral-state delta into a macro.
    ///
    /// Pump `Running` deltas are not expressible — motion is started by
    /// `RUN_PUMP` with an explicit distance, never by a mode change.
    pub fn from_delta(delta: &DeltaCommand) -> Result<Self, MotionError> {
        match *delta {
            DeltaCommand::Valve { index, to } => Ok(MacroCommand::SetValve { index, to }),
            DeltaCommand::AirPumpPwm { duty } => Ok(MacroCommand::SetFan {
                channel: "air_pump",
                duty,
            }),
            DeltaCommand::CleanPump { intensity } => Ok(MacroCommand::SetFan {
                channel: "clean_pump",
                duty: intensity,
            }),
            DeltaCommand::Pump {
                index,
                to: PumpMotion::Stopped,
            } => Ok(MacroCommand::StopPump { index }),
            DeltaCommand::Pump {
                index,
                to: PumpMotion::Running,
            } => Err(MotionError::Unsupported(format!(
                "pump {index} cannot be started by a state delta"
            ))),
            DeltaCommand::Heater { duty } => Ok(MacroCommand::SetHeater { duty }),
        }
    }
}
