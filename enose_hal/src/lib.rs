//! Peripheral links for the e-nose instrument.
//!
//! Three external collaborators live behind the traits in this crate:
//!
//! - [`motion`] - the G-code-style motion controller driving pumps,
//!   valves, fans and the heater
//! - [`sensor`] - the gas-sensor firmware behind a newline-delimited JSON
//!   serial protocol with two-port failover
//! - [`loadcell`] - the strain-gauge load cell with its sampling thread,
//!   stability detector and empty-bottle waiter
//!
//! Each link has a transport trait (`MotionPort`, `SensorPort`,
//! `WeightSource`) with a scripted simulation implementation, so the
//! engine and its tests run without hardware.

pub mod loadcell;
pub mod motion;
pub mod sensor;
