//! Peripheral state machine with transactional transitions.
//!
//! Transitions are unconditional — any named state may transition to any
//! other. The machine computes the field-level diff between the current
//! setpoint and the target's canonical setpoint and issues only the
//! minimum set of motion-controller commands, which keeps valves that are
//! already in position from clicking.
//!
//! A transition is complete once every commanded delta has been
//! acknowledged or has timed out; timed-out subcommands mark the
//! transition *degraded* but not failed. Callers that need a hard verdict
//! (the executors) inspect [`TransitionReport::link_down`].

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use enose_common::peripheral::{DeltaCommand, NamedState, PeripheralState, PumpMotion};
use enose_hal::motion::{MotionError, MotionLink};

/// What happened while applying one transition or override.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionReport {
    /// State label before.
    pub from: NamedState,
    /// State label after (unchanged for raw overrides).
    pub to: NamedState,
    /// Deltas commanded.
    pub commanded: usize,
    /// Deltas acknowledged.
    pub acked: usize,
    /// Deltas that hit the ack window.
    pub timed_out: usize,
}

impl TransitionReport {
    /// Some subcommand timed out.
    pub fn degraded(&self) -> bool {
        self.timed_out > 0
    }

    /// Every commanded delta timed out — the link is unresponsive.
    pub fn link_down(&self) -> bool {
        self.commanded > 0 && self.acked == 0 && self.timed_out == self.commanded
    }
}

/// Notification for state-change subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateChange {
    /// Previous named state.
    pub from: NamedState,
    /// New named state.
    pub to: NamedState,
    /// The transition was only partially acknowledged.
    pub degraded: bool,
}

struct PsmInner {
    current: PeripheralState,
    active: NamedState,
    degraded: bool,
}

/// The peripheral state machine. Single legitimate writer of peripheral
/// state during a run.
pub struct PeripheralStateMachine {
    motion: Arc<MotionLink>,
    inner: Mutex<PsmInner>,
    /// One transaction guard at a time; see `guard`.
    pub(crate) guard_held: AtomicBool,
    subscribers: Mutex<Vec<Sender<StateChange>>>,
}

impl PeripheralStateMachine {
    /// New machine assumed to start at the INITIAL setpoint.
    pub fn new(motion: Arc<MotionLink>) -> Self {
        Self {
            motion,
            inner: Mutex::new(PsmInner {
                current: NamedState::Initial.setpoint(),
                active: NamedState::Initial,
                degraded: false,
            }),
            guard_held: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The motion link behind this machine.
    pub fn motion(&self) -> &MotionLink {
        &self.motion
    }

    /// Currently active named state.
    pub fn current(&self) -> NamedState {
        self.inner.lock().active
    }

    /// Complete instantaneous setpoint.
    pub fn snapshot(&self) -> PeripheralState {
        self.inner.lock().current
    }

    /// Whether the last transition was degraded.
    pub fn is_degraded(&self) -> bool {
        self.inner.lock().degraded
    }

    /// Subscribe to (old, new) state-change notifications.
    pub fn subscribe(&self) -> Receiver<StateChange> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Transition to a named state.
    ///
    /// Timeouts degrade the transition (reported, not raised); controller
    /// rejections and transport faults are hard errors.
    pub fn transition_to(&self, target: NamedState) -> Result<TransitionReport, MotionError> {
        let (from, mut state, deltas) = {
            let inner = self.inner.lock();
            let target_state = target.setpoint();
            (
                inner.active,
                inner.current,
                inner.current.diff(&target_state),
            )
        };

        debug!(from = %from, to = %target, deltas = deltas.len(), "peripheral transition");
        let mut report = TransitionReport {
            from,
            to: target,
            commanded: deltas.len(),
            acked: 0,
            timed_out: 0,
        };

        for delta in &deltas {
            match self.motion.apply_delta(delta) {
                Ok(()) => {
                    report.acked += 1;
                    state.apply(delta);
                }
                Err(MotionError::Timeout { .. }) => {
                    // Not recorded as applied: the next transition (or a
                    // retry) re-commands exactly this field.
                    report.timed_out += 1;
                }
                Err(e) => {
                    // Partial progress is recorded before surfacing.
                    let mut inner = self.inner.lock();
                    inner.current = state;
                    return Err(e);
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.current = state;
            inner.active = target;
            inner.degraded = report.degraded();
        }

        if report.degraded() {
            warn!(
                from = %from,
                to = %target,
                timed_out = report.timed_out,
                "transition degraded"
            );
        } else {
            info!(from = %from, to = %target, "transition complete");
        }
        self.notify(StateChange {
            from,
            to: target,
            degraded: report.degraded(),
        });
        Ok(report)
    }

    /// Apply raw deltas without changing the active-name label.
    ///
    /// Used for manual overrides and for executors that tweak a single
    /// field (the gas-pump PWM) inside a named state.
    pub fn apply_raw(&self, deltas: &[DeltaCommand]) -> Result<TransitionReport, MotionError> {
        let from = self.current();
        let mut report = TransitionReport {
            from,
            to: from,
            commanded: deltas.len(),
            acked: 0,
            timed_out: 0,
        };
        for delta in deltas {
            match self.motion.apply_delta(delta) {
                Ok(()) => {
                    report.acked += 1;
                    self.inner.lock().current.apply(delta);
                }
                Err(MotionError::Timeout { .. }) => {
                    report.timed_out += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Record pump motion flags changed by `RUN_PUMP`/`STOP_PUMP`, which
    /// go through the motion link directly rather than as state deltas.
    pub fn note_pump_motion(&self, index: u8, motion: PumpMotion) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.current.pumps.get_mut(usize::from(index)) {
            *slot = motion;
        }
    }

    fn notify(&self, change: StateChange) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enose_hal::motion::{SimMotionPort, SimReply};
    use std::time::Duration;

    fn machine() -> (PeripheralStateMachine, enose_hal::motion::SimMotionHandle) {
        let (port, handle) = SimMotionPort::healthy();
        let link = Arc::new(MotionLink::new(
            Box::new(port),
            Duration::from_millis(30),
        ));
        (PeripheralStateMachine::new(link), handle)
    }

    #[test]
    fn starts_at_initial() {
        let (psm, _h) = machine();
        assert_eq!(psm.current(), NamedState::Initial);
        assert_eq!(psm.snapshot(), NamedState::Initial.setpoint());
        assert!(!psm.is_degraded());
    }

    #[test]
    fn transition_issues_minimal_commands() {
        let (psm, handle) = machine();
        let report = psm.transition_to(NamedState::Drain).unwrap();
        assert_eq!(report.commanded, 2); // two valves differ
        assert_eq!(report.acked, 2);
        assert!(!report.degraded());
        assert_eq!(psm.current(), NamedState::Drain);
        assert_eq!(handle.count_sent("SET_VALVE"), 2);

        // Re-entering the same state commands nothing.
        handle.clear_sent();
        let report = psm.transition_to(NamedState::Drain).unwrap();
        assert_eq!(report.commanded, 0);
        assert!(handle.sent_lines().is_empty());
    }

    #[test]
    fn any_state_reaches_any_other() {
        let (psm, _h) = machine();
        for target in NamedState::ALL {
            psm.transition_to(target).unwrap();
            assert_eq!(psm.current(), target);
            assert_eq!(psm.snapshot(), target.setpoint());
        }
        psm.transition_to(NamedState::Initial).unwrap();
        assert_eq!(psm.snapshot(), NamedState::Initial.setpoint());
    }

    #[test]
    fn timeout_degrades_but_does_not_fail() {
        let (psm, handle) = machine();
        // First delta times out, the second acks.
        handle.push_reply(SimReply::Silence);
        let report = psm.transition_to(NamedState::Drain).unwrap();
        assert!(report.degraded());
        assert!(!report.link_down());
        assert_eq!(report.acked, 1);
        assert_eq!(report.timed_out, 1);
        assert_eq!(psm.current(), NamedState::Drain);
        assert!(psm.is_degraded());
    }

    #[test]
    fn dead_link_reports_link_down() {
        let (psm, handle) = machine_dead();
        let report = psm.transition_to(NamedState::Drain).unwrap();
        assert!(report.link_down());
        assert!(report.degraded());
        let _ = handle;
    }

    fn machine_dead() -> (PeripheralStateMachine, enose_hal::motion::SimMotionHandle) {
        let (port, handle) = SimMotionPort::dead();
        let link = Arc::new(MotionLink::new(
            Box::new(port),
            Duration::from_millis(10),
        ));
        (PeripheralStateMachine::new(link), handle)
    }

    #[test]
    fn subscribers_see_old_and_new_names() {
        let (psm, _h) = machine();
        let rx = psm.subscribe();
        psm.transition_to(NamedState::Clean).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.from, NamedState::Initial);
        assert_eq!(change.to, NamedState::Clean);
        assert!(!change.degraded);
    }

    #[test]
    fn apply_raw_keeps_label() {
        let (psm, _h) = machine();
        psm.transition_to(NamedState::Sample).unwrap();
        psm.apply_raw(&[DeltaCommand::AirPumpPwm { duty: 0.8 }])
            .unwrap();
        assert_eq!(psm.current(), NamedState::Sample);
        assert_eq!(psm.snapshot().air_pump_pwm, 0.8);
    }

    #[test]
    fn note_pump_motion_updates_snapshot_only() {
        let (psm, handle) = machine();
        handle.clear_sent();
        psm.note_pump_motion(2, PumpMotion::Running);
        assert!(psm.snapshot().any_pump_running());
        assert!(handle.sent_lines().is_empty());
    }

    #[test]
    fn rejection_is_a_hard_error() {
        let (psm, handle) = machine();
        handle.push_reply(SimReply::Error("valve stuck".to_string()));
        let err = psm.transition_to(NamedState::Drain).unwrap_err();
        assert!(matches!(err, MotionError::Rejected { .. }));
    }
}
