//! Sensor firmware link.
//!
//! The gas-sensor array speaks newline-delimited JSON over serial. Two
//! ports are listened to concurrently; each command carries a
//! monotonically increasing request id and the reply originates from
//! whichever port received the command. When the active port stops
//! acknowledging, the link fails over to the other port live.
//!
//! Unsolicited `data` events carry per-sensor readings with the heater
//! step; [`detect`] hosts the heater-cycle counter and the primary-value
//! stability detector the acquire waits are built on.

pub mod detect;
mod link;
mod protocol;
mod sim;

pub use detect::{HeaterCycleCounter, SignalStability};
pub use link::{SensorLink, SensorLinkConfig};
pub use protocol::{
    parse_line, HeaterProfile, HeaterStepSpec, Incoming, SensorEvent, SensorOp, SensorReading,
    SensorReply,
};
pub use sim::{SimSensorHandle, SimSensorPort};

use std::time::Duration;
use thiserror::Error;

/// Error types for sensor-link operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    /// No reply on either port within the window.
    #[error("sensor command '{op}' unacknowledged on both ports")]
    Timeout {
        /// Operation name.
        op: String,
    },

    /// Firmware replied `ok: false`.
    #[error("sensor rejected '{op}': {message}")]
    Rejected {
        /// Operation name.
        op: String,
        /// Firmware error text.
        message: String,
    },

    /// Serial transport failure.
    #[error("transport error on {port}: {message}")]
    Transport {
        /// Port name.
        port: String,
        /// Underlying error text.
        message: String,
    },

    /// A line that is neither a reply nor a known event.
    #[error("malformed sensor line: {0}")]
    Malformed(String),

    /// The link worker threads are gone.
    #[error("sensor link stopped")]
    Stopped,
}

/// Line transport for one serial port.
pub trait SensorPort: Send {
    /// Port name for logs.
    fn name(&self) -> &str;

    /// Write one line (newline appended by the transport).
    fn send_line(&mut self, line: &str) -> Result<(), SensorError>;

    /// Read the next line, waiting at most `timeout`. `Ok(None)` when the
    /// window elapses quietly.
    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, SensorError>;
}
