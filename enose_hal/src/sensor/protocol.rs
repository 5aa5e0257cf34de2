//! Wire types for the newline-delimited JSON sensor protocol.

use serde::{Deserialize, Serialize};

use super::SensorError;

/// One heater setpoint in a profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeaterStepSpec {
    /// Plate temperature [°C].
    pub temp_c: f64,
    /// Hold time at this step [ms].
    pub hold_ms: u64,
}

/// The heater cycle the firmware steps through during acquisition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HeaterProfile {
    /// Ordered setpoints; the firmware reports its current index as
    /// `heater_step` in data events, returning to 0 at each cycle end.
    pub steps: Vec<HeaterStepSpec>,
}

/// Operation kinds the firmware understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SensorOp {
    /// Time alignment: host clock in microseconds.
    Sync {
        /// Host time [µs since epoch].
        t_host_us: u64,
    },
    /// (Re-)initialize the array.
    Init,
    /// Install a heater profile.
    Config {
        /// The profile to run.
        heater: HeaterProfile,
    },
    /// Begin streaming data events.
    Start,
    /// Stop streaming.
    Stop,
    /// Status query.
    Status,
    /// Full firmware reset.
    Reset,
}

impl SensorOp {
    /// Operation name for errors and logs.
    pub const fn name(&self) -> &'static str {
        match self {
            SensorOp::Sync { .. } => "sync",
            SensorOp::Init => "init",
            SensorOp::Config { .. } => "config",
            SensorOp::Start => "start",
            SensorOp::Stop => "stop",
            SensorOp::Status => "status",
            SensorOp::Reset => "reset",
        }
    }
}

/// Outgoing command envelope: request id plus operation.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEnvelope {
    /// Monotonically increasing request id.
    pub id: u64,
    /// The operation.
    #[serde(flatten)]
    pub op: SensorOp,
}

/// Reply to a command, correlated by id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorReply {
    /// Echoed request id.
    pub id: u64,
    /// Success flag.
    pub ok: bool,
    /// Error text when `ok` is false.
    #[serde(default)]
    pub message: Option<String>,
}

/// One per-sensor reading from a `data` event.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct SensorReading {
    /// Firmware timestamp [µs].
    pub t_us: u64,
    /// Sensor index within the array.
    pub idx: u8,
    /// Primary value (sensor resistance or counts).
    pub value: f64,
    /// Current heater-profile step; 0 marks the cycle boundary.
    pub heater_step: u32,
    /// Relative humidity [%], when the array reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    /// Ambient temperature [°C], when the array reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_c: Option<f64>,
}

/// Unsolicited firmware messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SensorEvent {
    /// Per-sensor reading.
    Data(SensorReading),
    /// Firmware finished boot/init.
    Ready,
    /// Firmware-side fault notification.
    Error {
        /// Fault text.
        message: String,
    },
}

/// Any inbound line: a command reply or an unsolicited event.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Incoming {
    /// Correlated reply.
    Reply(SensorReply),
    /// Unsolicited event.
    Event(SensorEvent),
}

/// Parse one inbound line.
pub fn parse_line(line: &str) -> Result<Incoming, SensorError> {
    serde_json::from_str(line).map_err(|_| SensorError::Malformed(line.to_string()))
}

/// Render one outbound command line.
pub fn render_command(id: u64, op: &SensorOp) -> String {
    // Envelope serialization cannot fail: all fields are plain data.
    serde_json::to_string(&CommandEnvelope {
        id,
        op: op.clone(),
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_renders_with_id_and_op() {
        let line = render_command(7, &SensorOp::Start);
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["op"], "start");
    }

    #[test]
    fn sync_carries_host_time() {
        let line = render_command(1, &SensorOp::Sync { t_host_us: 42 });
        assert!(line.contains("\"t_host_us\":42"));
    }

    #[test]
    fn config_embeds_profile() {
        let op = SensorOp::Config {
            heater: HeaterProfile {
                steps: vec![HeaterStepSpec {
                    temp_c: 280.0,
                    hold_ms: 200,
                }],
            },
        };
        let line = render_command(3, &op);
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["heater"]["steps"][0]["hold_ms"], 200);
    }

    #[test]
    fn reply_parses() {
        let inc = parse_line(r#"{"id":7,"ok":true}"#).unwrap();
        assert_eq!(
            inc,
            Incoming::Reply(SensorReply {
                id: 7,
                ok: true,
                message: None
            })
        );
    }

    #[test]
    fn failure_reply_carries_message() {
        let inc = parse_line(r#"{"id":9,"ok":false,"message":"bad profile"}"#).unwrap();
        match inc {
            Incoming::Reply(r) => {
                assert!(!r.ok);
                assert_eq!(r.message.as_deref(), Some("bad profile"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn data_event_parses() {
        let inc = parse_line(
            r#"{"event":"data","t_us":1000,"idx":2,"value":8.25,"heater_step":3,"humidity":40.5}"#,
        )
        .unwrap();
        match inc {
            Incoming::Event(SensorEvent::Data(r)) => {
                assert_eq!(r.idx, 2);
                assert_eq!(r.heater_step, 3);
                assert_eq!(r.humidity, Some(40.5));
                assert!(r.temp_c.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ready_and_error_events_parse() {
        assert_eq!(
            parse_line(r#"{"event":"ready"}"#).unwrap(),
            Incoming::Event(SensorEvent::Ready)
        );
        match parse_line(r#"{"event":"error","message":"sensor 3 open circuit"}"#).unwrap() {
            Incoming::Event(SensorEvent::Error { message }) => {
                assert!(message.contains("open circuit"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_line("not json"),
            Err(SensorError::Malformed(_))
        ));
    }
}
