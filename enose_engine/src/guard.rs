//! Scoped transaction guard over the peripheral state machine.
//!
//! Construction records the current state name and optionally issues an
//! initial transition. Unless the guard is committed or abandoned, the
//! recorded pre-state is restored on scope exit — on early return, on
//! error propagation and on unwind alike, which is what makes the
//! executors safe to cancel anywhere.
//!
//! Guards are non-reentrant: opening a second guard while one is live is
//! a programming error surfaced as `InternalInvariantViolated`.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use enose_common::error::StepError;
use enose_common::peripheral::NamedState;
use enose_hal::motion::MotionError;

use crate::state::{PeripheralStateMachine, TransitionReport};

/// Map a motion-link failure onto the step-level error taxonomy.
pub fn motion_to_step_error(e: MotionError) -> StepError {
    match e {
        MotionError::Timeout { .. } => StepError::CommunicationTimeout(e.to_string()),
        other => StepError::FeedbackLost(format!("motion controller: {other}")),
    }
}

/// Scoped acquisition of a state transition with guaranteed restore.
pub struct TransactionGuard<'a> {
    psm: &'a PeripheralStateMachine,
    pre: NamedState,
    finished: bool,
}

impl<'a> std::fmt::Debug for TransactionGuard<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionGuard")
            .field("pre", &self.pre)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<'a> TransactionGuard<'a> {
    /// Open a guard, optionally transitioning to `target`.
    ///
    /// Returns the guard and the initial transition's report (None when no
    /// target was requested). On a hard transition error the guard is not
    /// created and the pre-state is restored best-effort.
    pub fn open(
        psm: &'a PeripheralStateMachine,
        target: Option<NamedState>,
    ) -> Result<(Self, Option<TransitionReport>), StepError> {
        if psm
            .guard_held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StepError::InternalInvariantViolated(
                "nested transaction guard".to_string(),
            ));
        }

        let pre = psm.current();
        let guard = Self {
            psm,
            pre,
            finished: false,
        };
        debug!(pre = %pre, target = ?target, "transaction guard open");

        let report = match target {
            None => None,
            Some(t) => match psm.transition_to(t) {
                Ok(report) => Some(report),
                Err(e) => {
                    // Constructor failed: restore and release via Drop.
                    drop(guard);
                    return Err(motion_to_step_error(e));
                }
            },
        };
        Ok((guard, report))
    }

    /// The state recorded at construction.
    pub fn pre_state(&self) -> NamedState {
        self.pre
    }

    /// Restore the pre-state and mark the guard successful.
    pub fn commit_and_restore(mut self) -> Result<TransitionReport, StepError> {
        self.finished = true;
        self.psm
            .transition_to(self.pre)
            .map_err(motion_to_step_error)
    }

    /// Leave the peripheral as-is; the next step chains directly.
    pub fn abandon(mut self) {
        debug!(pre = %self.pre, "transaction guard abandoned");
        self.finished = true;
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Best-effort restore on every unfinished exit path,
            // including unwinds and cancellation.
            if let Err(e) = self.psm.transition_to(self.pre) {
                warn!(pre = %self.pre, error = %e, "guard restore failed");
            }
        }
        self.psm.guard_held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enose_hal::motion::{MotionLink, SimMotionPort};
    use std::sync::Arc;
    use std::time::Duration;

    fn machine() -> PeripheralStateMachine {
        let (port, _handle) = SimMotionPort::healthy();
        PeripheralStateMachine::new(Arc::new(MotionLink::new(
            Box::new(port),
            Duration::from_millis(30),
        )))
    }

    #[test]
    fn drop_restores_pre_state() {
        let psm = machine();
        {
            let (_guard, report) =
                TransactionGuard::open(&psm, Some(NamedState::Inject)).unwrap();
            assert_eq!(psm.current(), NamedState::Inject);
            assert!(!report.unwrap().degraded());
        }
        assert_eq!(psm.current(), NamedState::Initial);
    }

    #[test]
    fn commit_restores_and_reports() {
        let psm = machine();
        let (guard, _) = TransactionGuard::open(&psm, Some(NamedState::Drain)).unwrap();
        let report = guard.commit_and_restore().unwrap();
        assert_eq!(report.to, NamedState::Initial);
        assert_eq!(psm.current(), NamedState::Initial);
        // The machine is free again.
        let (g2, _) = TransactionGuard::open(&psm, None).unwrap();
        g2.abandon();
    }

    #[test]
    fn abandon_leaves_state_as_is() {
        let psm = machine();
        let (guard, _) = TransactionGuard::open(&psm, Some(NamedState::Sample)).unwrap();
        guard.abandon();
        assert_eq!(psm.current(), NamedState::Sample);
    }

    #[test]
    fn nesting_is_an_invariant_violation() {
        let psm = machine();
        let (_outer, _) = TransactionGuard::open(&psm, None).unwrap();
        let err = TransactionGuard::open(&psm, Some(NamedState::Drain)).unwrap_err();
        assert!(matches!(err, StepError::InternalInvariantViolated(_)));
        // The outer guard still owns the machine; the failed open must
        // not have released it.
        let err = TransactionGuard::open(&psm, None).unwrap_err();
        assert!(matches!(err, StepError::InternalInvariantViolated(_)));
    }

    #[test]
    fn guard_restores_on_panic() {
        let psm = machine();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let (_guard, _) = TransactionGuard::open(&psm, Some(NamedState::Clean)).unwrap();
            panic!("executor body blew up");
        }));
        assert!(result.is_err());
        assert_eq!(psm.current(), NamedState::Initial);
        // Released: a new guard opens fine.
        let (g, _) = TransactionGuard::open(&psm, None).unwrap();
        g.abandon();
    }

    #[test]
    fn pre_state_is_construction_time_state() {
        let psm = machine();
        psm.transition_to(NamedState::Inject).unwrap();
        let (guard, _) = TransactionGuard::open(&psm, Some(NamedState::Drain)).unwrap();
        assert_eq!(guard.pre_state(), NamedState::Inject);
        drop(guard);
        assert_eq!(psm.current(), NamedState::Inject);
    }
}
