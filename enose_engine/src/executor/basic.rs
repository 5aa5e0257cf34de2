//! The small executors: SetState, SetGasPump, Wait, PhaseMarker.

use std::time::{Duration, Instant};

use enose_common::error::{PreconditionReport, StepError};
use enose_common::program::{BoundStep, StepKind, WaitCondition};

use super::acquire::{condition_needs_sensor, run_wait_condition, set_gas_pump_with_retry};
use super::{transition_with_retry, wait_estimate, ExecCtx, StepExecutor, StepOutcome};

/// Transition to a named state; no wait, no guard — the effect *is* the
/// new state.
pub struct SetStateExecutor;

impl StepExecutor for SetStateExecutor {
    fn name(&self) -> &'static str {
        "set_state"
    }

    fn check_preconditions(&self, step: &BoundStep, _ctx: &ExecCtx<'_>) -> PreconditionReport {
        let mut report = PreconditionReport::ok();
        if !matches!(step.step.kind, StepKind::SetState(_)) {
            report.fail("kind", "step is not a set_state");
        }
        report
    }

    fn execute(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError> {
        let started = Instant::now();
        let StepKind::SetState(s) = &step.step.kind else {
            return Err(StepError::InternalInvariantViolated(
                "set_state executor on wrong step".to_string(),
            ));
        };
        transition_with_retry(ctx.psm, s.target)?;
        Ok(StepOutcome::timed(started.elapsed()))
    }

    fn estimate_duration(&self, _step: &BoundStep, _ctx: &ExecCtx<'_>) -> Duration {
        Duration::from_secs(1)
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["valves"]
    }
}

/// Write the air-pump PWM; the named-state label is unchanged.
pub struct SetGasPumpExecutor;

impl StepExecutor for SetGasPumpExecutor {
    fn name(&self) -> &'static str {
        "set_gas_pump"
    }

    fn check_preconditions(&self, step: &BoundStep, _ctx: &ExecCtx<'_>) -> PreconditionReport {
        let mut report = PreconditionReport::ok();
        match &step.step.kind {
            StepKind::SetGasPump(g) => {
                if !(0.0..=100.0).contains(&g.percent) {
                    report.fail("percent", format!("{} out of [0, 100]", g.percent));
                }
            }
            _ => report.fail("kind", "step is not a set_gas_pump"),
        }
        report
    }

    fn execute(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError> {
        let started = Instant::now();
        let StepKind::SetGasPump(g) = &step.step.kind else {
            return Err(StepError::InternalInvariantViolated(
                "set_gas_pump executor on wrong step".to_string(),
            ));
        };
        set_gas_pump_with_retry(ctx, g.percent)?;
        Ok(StepOutcome::timed(started.elapsed()))
    }

    fn estimate_duration(&self, _step: &BoundStep, _ctx: &ExecCtx<'_>) -> Duration {
        Duration::from_millis(200)
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["gas_pump"]
    }
}

/// Wait between steps without touching peripheral state.
pub struct WaitExecutor;

impl WaitExecutor {
    fn params<'s>(step: &'s BoundStep) -> Option<(&'s WaitCondition, Option<f64>)> {
        match &step.step.kind {
            StepKind::Wait(w) => Some((&w.until, w.max_duration_s)),
            _ => None,
        }
    }
}

impl StepExecutor for WaitExecutor {
    fn name(&self) -> &'static str {
        "wait"
    }

    fn check_preconditions(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> PreconditionReport {
        let mut report = PreconditionReport::ok();
        match Self::params(step) {
            Some((cond, _)) => {
                if condition_needs_sensor(cond) && ctx.sensor.is_none() {
                    report.fail("sensor", "wait condition needs the sensor link");
                }
            }
            None => report.fail("kind", "step is not a wait"),
        }
        report
    }

    fn execute(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError> {
        let started = Instant::now();
        let (cond, max_s) = Self::params(step).ok_or_else(|| {
            StepError::InternalInvariantViolated("wait executor on non-wait step".to_string())
        })?;
        let bound = match (cond, max_s) {
            (_, Some(max)) => Duration::from_secs_f64(max),
            (WaitCondition::Duration { seconds }, None) => Duration::from_secs_f64(*seconds),
            // Event-driven waits always need a bound; fall back to the
            // program-wide default timeout.
            (_, None) => Duration::from_secs_f64(ctx.program.preamble.default_timeout_s),
        };
        run_wait_condition(ctx, cond, bound)?;
        Ok(StepOutcome::timed(started.elapsed()))
    }

    fn estimate_duration(&self, step: &BoundStep, _ctx: &ExecCtx<'_>) -> Duration {
        match Self::params(step) {
            Some((cond, max_s)) => wait_estimate(cond, max_s),
            None => Duration::ZERO,
        }
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Pure annotation; the runner emits the phase events and tags weight
/// samples. Executing the marker itself is a no-op.
pub struct PhaseMarkerExecutor;

impl StepExecutor for PhaseMarkerExecutor {
    fn name(&self) -> &'static str {
        "phase_marker"
    }

    fn check_preconditions(&self, _step: &BoundStep, _ctx: &ExecCtx<'_>) -> PreconditionReport {
        PreconditionReport::ok()
    }

    fn execute(&self, _step: &BoundStep, _ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::timed(Duration::ZERO))
    }

    fn estimate_duration(&self, _step: &BoundStep, _ctx: &ExecCtx<'_>) -> Duration {
        Duration::ZERO
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &[]
    }
}
