//! Peripheral setpoint model and named canonical states.
//!
//! A [`PeripheralState`] is the complete instantaneous hardware setpoint:
//! four valves, the air-pump PWM, the cleaning-pump intensity, eight pump
//! motion flags and the chamber-heater duty. Five canonical configurations
//! are named ([`NamedState`]) and exposed as an immutable lookup table.
//!
//! The state machine that *applies* transitions lives in `enose_engine`;
//! this module only models setpoints and computes field-level diffs.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::consts::{PUMP_COUNT, VALVE_COUNT};

/// Position of an on/off or pinch valve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Valve {
    /// Flow blocked.
    #[default]
    Closed,
    /// Flow open.
    Open,
}

/// Motion flag of a peristaltic pump axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PumpMotion {
    /// Axis idle.
    #[default]
    Stopped,
    /// Axis executing a move.
    Running,
}

/// Complete instantaneous hardware setpoint.
///
/// Equality is fieldwise. PWM and duty fields are commanded values in
/// [0, 1], compared exactly (they are setpoints, not measurements).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeripheralState {
    /// Valve positions, indexed per [`ValveRole`].
    pub valves: [Valve; VALVE_COUNT],
    /// Continuous air-pump PWM duty in [0, 1].
    pub air_pump_pwm: f64,
    /// Cleaning-pump intensity in [0, 1].
    pub clean_pump: f64,
    /// Per-pump motion flags.
    pub pumps: [PumpMotion; PUMP_COUNT],
    /// Chamber-heater duty in [0, 1].
    pub heater_duty: f64,
}

impl Default for PeripheralState {
    fn default() -> Self {
        Self::all_off()
    }
}

/// Fixed plumbing role of each valve index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ValveRole {
    /// Chamber drain line.
    Drain = 0,
    /// Chamber vent.
    Vent = 1,
    /// Cleaning-fluid supply.
    CleanSupply = 2,
    /// Sample loop to the sensor array.
    SampleLoop = 3,
}

impl PeripheralState {
    /// Everything closed, stopped and at zero duty.
    pub const fn all_off() -> Self {
        Self {
            valves: [Valve::Closed; VALVE_COUNT],
            air_pump_pwm: 0.0,
            clean_pump: 0.0,
            pumps: [PumpMotion::Stopped; PUMP_COUNT],
            heater_duty: 0.0,
        }
    }

    /// Compute the minimum set of delta commands that turns `self` into
    /// `target`. Unchanged fields produce no command, which is what keeps
    /// transitions from clicking valves that are already in position.
    pub fn diff(&self, target: &Self) -> Vec<DeltaCommand> {
        let mut out = Vec::new();
        for i in 0..VALVE_COUNT {
            if self.valves[i] != target.valves[i] {
                out.push(DeltaCommand::Valve {
                    index: i as u8,
                    to: target.valves[i],
                });
            }
        }
        if self.air_pump_pwm != target.air_pump_pwm {
            out.push(DeltaCommand::AirPumpPwm {
                duty: target.air_pump_pwm,
            });
        }
        if self.clean_pump != target.clean_pump {
            out.push(DeltaCommand::CleanPump {
                intensity: target.clean_pump,
            });
        }
        for i in 0..PUMP_COUNT {
            if self.pumps[i] != target.pumps[i] {
                out.push(DeltaCommand::Pump {
                    index: i as u8,
                    to: target.pumps[i],
                });
            }
        }
        if self.heater_duty != target.heater_duty {
            out.push(DeltaCommand::Heater {
                duty: target.heater_duty,
            });
        }
        out
    }

    /// Apply a single delta in place.
    pub fn apply(&mut self, delta: &DeltaCommand) {
        match *delta {
            DeltaCommand::Valve { index, to } => self.valves[index as usize] = to,
            DeltaCommand::AirPumpPwm { duty } => self.air_pump_pwm = duty,
            DeltaCommand::CleanPump { intensity } => self.clean_pump = intensity,
            DeltaCommand::Pump { index, to } => self.pumps[index as usize] = to,
            DeltaCommand::Heater { duty } => self.heater_duty = duty,
        }
    }

    /// True if any pump motion flag is `Running`.
    pub fn any_pump_running(&self) -> bool {
        self.pumps.iter().any(|p| *p == PumpMotion::Running)
    }
}

/// A single field-level change to the peripheral setpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeltaCommand {
    /// Move one valve.
    Valve {
        /// Valve index (see [`ValveRole`]).
        index: u8,
        /// Target position.
        to: Valve,
    },
    /// Set the air-pump PWM duty.
    AirPumpPwm {
        /// Duty in [0, 1].
        duty: f64,
    },
    /// Set the cleaning-pump intensity.
    CleanPump {
        /// Intensity in [0, 1].
        intensity: f64,
    },
    /// Change one pump's motion flag.
    Pump {
        /// Pump index 0..7.
        index: u8,
        /// Target motion flag.
        to: PumpMotion,
    },
    /// Set the chamber-heater duty.
    Heater {
        /// Duty in [0, 1].
        duty: f64,
    },
}

impl DeltaCommand {
    /// The field group this delta touches.
    pub fn mask(&self) -> DeltaMask {
        match self {
            DeltaCommand::Valve { index, .. } => match index {
                0 => DeltaMask::VALVE_0,
                1 => DeltaMask::VALVE_1,
                2 => DeltaMask::VALVE_2,
                _ => DeltaMask::VALVE_3,
            },
            DeltaCommand::AirPumpPwm { .. } => DeltaMask::AIR_PUMP,
            DeltaCommand::CleanPump { .. } => DeltaMask::CLEAN_PUMP,
            DeltaCommand::Pump { .. } => DeltaMask::PUMPS,
            DeltaCommand::Heater { .. } => DeltaMask::HEATER,
        }
    }
}

bitflags! {
    /// Field groups of the peripheral setpoint, used to describe which
    /// parts of the state a transition or manual override touched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeltaMask: u16 {
        /// Drain valve.
        const VALVE_0    = 0x0001;
        /// Vent valve.
        const VALVE_1    = 0x0002;
        /// Cleaning-supply valve.
        const VALVE_2    = 0x0004;
        /// Sample-loop valve.
        const VALVE_3    = 0x0008;
        /// Air-pump PWM.
        const AIR_PUMP   = 0x0010;
        /// Cleaning pump.
        const CLEAN_PUMP = 0x0020;
        /// Pump motion flags.
        const PUMPS      = 0x0040;
        /// Chamber heater.
        const HEATER     = 0x0080;
    }
}

impl Default for DeltaMask {
    fn default() -> Self {
        Self::empty()
    }
}

// ─── Named States ───────────────────────────────────────────────────

/// One of the five labeled canonical peripheral configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NamedState {
    /// Everything off; the safe resting configuration.
    #[default]
    Initial,
    /// Drain valve and vent open; chamber empties by gravity.
    Drain,
    /// Cleaning fluid circulating into the chamber.
    Clean,
    /// Gas path through the sensor array; chamber heater on.
    Sample,
    /// Vent open for liquid injection through the pump bank.
    Inject,
}

impl NamedState {
    /// All named states, in declaration order.
    pub const ALL: [NamedState; 5] = [
        NamedState::Initial,
        NamedState::Drain,
        NamedState::Clean,
        NamedState::Sample,
        NamedState::Inject,
    ];

    /// Canonical setpoint for this named state.
    ///
    /// The table is the single source of truth for what each mode means
    /// in hardware terms. Pump motion flags are always `Stopped` here;
    /// pumps are started by the inject executor, not by mode changes.
    pub const fn setpoint(self) -> PeripheralState {
        let mut s = PeripheralState::all_off();
        match self {
            NamedState::Initial => {}
            NamedState::Drain => {
                s.valves[ValveRole::Drain as usize] = Valve::Open;
                s.valves[ValveRole::Vent as usize] = Valve::Open;
            }
            NamedState::Clean => {
                s.valves[ValveRole::Vent as usize] = Valve::Open;
                s.valves[ValveRole::CleanSupply as usize] = Valve::Open;
                s.clean_pump = 1.0;
            }
            NamedState::Sample => {
                s.valves[ValveRole::SampleLoop as usize] = Valve::Open;
                s.air_pump_pwm = 0.5;
                s.heater_duty = 0.6;
            }
            NamedState::Inject => {
                s.valves[ValveRole::Vent as usize] = Valve::Open;
            }
        }
        s
    }

    /// Display name as used in programs and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            NamedState::Initial => "INITIAL",
            NamedState::Drain => "DRAIN",
            NamedState::Clean => "CLEAN",
            NamedState::Sample => "SAMPLE",
            NamedState::Inject => "INJECT",
        }
    }
}

impl std::fmt::Display for NamedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
