//! Drain: empty the chamber until the bottle reads empty.

use std::time::{Duration, Instant};

use tracing::info;

use enose_common::error::{PreconditionReport, StepError};
use enose_common::peripheral::NamedState;
use enose_common::program::{BoundStep, DrainStep, StepKind};

use crate::guard::TransactionGuard;

use super::{transition_with_retry, ExecCtx, StepExecutor, StepOutcome};

/// Executor for [`StepKind::Drain`].
///
/// Idempotent: draining an already-empty bottle is a no-op that settles
/// immediately.
pub struct DrainExecutor;

impl DrainExecutor {
    fn params<'s>(step: &'s BoundStep) -> Option<&'s DrainStep> {
        match &step.step.kind {
            StepKind::Drain(d) => Some(d),
            _ => None,
        }
    }
}

impl StepExecutor for DrainExecutor {
    fn name(&self) -> &'static str {
        "drain"
    }

    fn check_preconditions(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> PreconditionReport {
        let mut report = PreconditionReport::ok();
        if Self::params(step).is_none() {
            report.fail("kind", "step is not a drain");
            return report;
        }
        let state = ctx.psm.current();
        if !matches!(state, NamedState::Initial | NamedState::Inject) {
            report.fail("state", format!("expected INITIAL or INJECT, found {state}"));
        }
        report
    }

    fn execute(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError> {
        let started = Instant::now();
        let d = Self::params(step).ok_or_else(|| {
            StepError::InternalInvariantViolated("drain executor on non-drain step".to_string())
        })?;
        let timeout = Duration::from_secs_f64(d.timeout_s);
        let window = Duration::from_secs_f64(
            d.stability_window_s.unwrap_or(ctx.cfg.stability.window_s),
        );

        let (guard, _) = TransactionGuard::open(ctx.psm, None)?;
        transition_with_retry(ctx.psm, NamedState::Drain)?;

        match ctx.loadcell {
            Some(lc) => {
                let outcome = lc
                    .wait_for_empty_bottle(d.tolerance_g, timeout, window, ctx.cancel.as_atomic())
                    .map_err(|e| StepError::FeedbackLost(e.to_string()))?;
                if outcome.cancelled {
                    return Err(StepError::Cancelled);
                }
                info!(
                    step = %step.step.name,
                    success = outcome.success,
                    empty_weight_g = outcome.empty_weight_g,
                    "drain finished"
                );
            }
            None => {
                // No load cell: a timed drain is the best available.
                if ctx.cancel.sleep(timeout) {
                    return Err(StepError::Cancelled);
                }
            }
        }

        guard.commit_and_restore()?;
        Ok(StepOutcome::timed(started.elapsed()))
    }

    fn estimate_duration(&self, step: &BoundStep, _ctx: &ExecCtx<'_>) -> Duration {
        match Self::params(step) {
            Some(d) => Duration::from_secs_f64(d.timeout_s / 2.0),
            None => Duration::ZERO,
        }
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["valves", "load_cell"]
    }
}
