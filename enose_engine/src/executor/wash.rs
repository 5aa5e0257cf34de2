//! Wash: repeated drain → fill → drain cleaning cycles.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use enose_common::consts::CANCEL_POLL_MS;
use enose_common::error::{PreconditionReport, StepError};
use enose_common::peripheral::NamedState;
use enose_common::program::{BoundStep, StepKind, WashStep};
use enose_hal::loadcell::LoadCell;

use crate::guard::TransactionGuard;

use super::{transition_with_retry, ExecCtx, StepExecutor, StepOutcome};

/// Executor for [`StepKind::Wash`]. Not idempotent — every cycle consumes
/// cleaning fluid.
pub struct WashExecutor;

impl WashExecutor {
    fn params<'s>(step: &'s BoundStep) -> Option<&'s WashStep> {
        match &step.step.kind {
            StepKind::Wash(w) => Some(w),
            _ => None,
        }
    }
}

impl StepExecutor for WashExecutor {
    fn name(&self) -> &'static str {
        "wash"
    }

    fn check_preconditions(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> PreconditionReport {
        let mut report = PreconditionReport::ok();
        let Some(w) = Self::params(step) else {
            report.fail("kind", "step is not a wash");
            return report;
        };
        let state = ctx.psm.current();
        if state != NamedState::Initial {
            report.fail("state", format!("expected INITIAL, found {state}"));
        }
        if w.repeat_count < 1 {
            report.fail("repeat_count", "must be >= 1");
        }
        if w.target_weight_g <= 0.0 {
            report.fail("target_weight", "must be > 0");
        }
        if ctx.loadcell.is_none() {
            report.fail("load_cell", "wash needs weight feedback");
        }
        report
    }

    fn execute(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError> {
        let started = Instant::now();
        let w = Self::params(step).ok_or_else(|| {
            StepError::InternalInvariantViolated("wash executor on non-wash step".to_string())
        })?;
        let lc = ctx
            .loadcell
            .ok_or_else(|| StepError::FeedbackLost("no load cell".to_string()))?;
        let drain_timeout = Duration::from_secs_f64(w.drain_timeout_s);
        let fill_timeout = Duration::from_secs_f64(w.fill_timeout_s);
        let window = Duration::from_secs_f64(ctx.cfg.stability.window_s);

        let (guard, _) = TransactionGuard::open(ctx.psm, None)?;

        for cycle in 0..w.repeat_count {
            debug!(step = %step.step.name, cycle, "wash cycle start");

            // Phase 1: drain and capture the baseline, which may be the
            // last observed weight when the wait timed out.
            transition_with_retry(ctx.psm, NamedState::Drain)?;
            let baseline = self.drained_weight(lc, w, drain_timeout, window, ctx)?;

            if ctx.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            // Phase 2: fill with cleaning fluid until the weight delta.
            transition_with_retry(ctx.psm, NamedState::Clean)?;
            let fill_started = Instant::now();
            let mut reached = false;
            loop {
                if lc.weight_g() - baseline >= w.target_weight_g {
                    reached = true;
                    break;
                }
                if fill_started.elapsed() >= fill_timeout {
                    break;
                }
                if ctx.cancel.sleep(Duration::from_millis(CANCEL_POLL_MS)) {
                    return Err(StepError::Cancelled);
                }
            }
            ctx.ledger
                .charge_time("clean_pump", fill_started.elapsed().as_secs_f64());
            if !reached {
                warn!(cycle, baseline_g = baseline, "wash fill phase timed out");
                if ctx.cfg.runner.wash_fill_timeout_is_error {
                    return Err(StepError::FeedbackLost(format!(
                        "wash fill did not gain {} g within {} s",
                        w.target_weight_g, w.fill_timeout_s
                    )));
                }
            }

            if ctx.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            // Phase 3: drain the cleaning fluid back out.
            transition_with_retry(ctx.psm, NamedState::Drain)?;
            let _ = self.drained_weight(lc, w, drain_timeout, window, ctx)?;

            info!(step = %step.step.name, cycle, reached, "wash cycle complete");
        }

        guard.commit_and_restore()?;
        Ok(StepOutcome::timed(started.elapsed()))
    }

    fn estimate_duration(&self, step: &BoundStep, _ctx: &ExecCtx<'_>) -> Duration {
        match Self::params(step) {
            Some(w) => Duration::from_secs_f64(
                f64::from(w.repeat_count) * (2.0 * w.drain_timeout_s + w.fill_timeout_s) * 0.6,
            ),
            None => Duration::ZERO,
        }
    }

    fn is_idempotent(&self) -> bool {
        false
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["cleaning_pump", "valves", "load_cell"]
    }
}

impl WashExecutor {
    /// Wait for empty and return the settled (or last observed) weight.
    fn drained_weight(
        &self,
        lc: &LoadCell,
        w: &WashStep,
        timeout: Duration,
        window: Duration,
        ctx: &ExecCtx<'_>,
    ) -> Result<f64, StepError> {
        let outcome = lc
            .wait_for_empty_bottle(w.tolerance_g, timeout, window, ctx.cancel.as_atomic())
            .map_err(|e| StepError::FeedbackLost(e.to_string()))?;
        if outcome.cancelled {
            return Err(StepError::Cancelled);
        }
        Ok(outcome.empty_weight_g)
    }
}
