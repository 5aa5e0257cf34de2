//! Inject: closed-loop liquid dosing terminated by weight feedback.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use enose_common::consts::{CANCEL_POLL_MS, PUMP_COUNT, RATIO_SUM_TOLERANCE};
use enose_common::error::{PreconditionReport, StepError};
use enose_common::peripheral::{NamedState, PumpMotion};
use enose_common::program::{BoundStep, InjectStep, StepKind};
use enose_hal::motion::MotionError;

use crate::guard::{motion_to_step_error, TransactionGuard};

use super::{transition_with_retry, ExecCtx, InjectOutcome, StepExecutor, StepOutcome};

/// Executor for [`StepKind::Inject`].
pub struct InjectExecutor;

impl InjectExecutor {
    fn params<'s>(step: &'s BoundStep) -> Option<&'s InjectStep> {
        match &step.step.kind {
            StepKind::Inject(inj) => Some(inj),
            _ => None,
        }
    }

    /// Positional component → pump mapping from the configured offset.
    fn pump_indices(inj: &InjectStep, offset: u8) -> Vec<u8> {
        (0..inj.components.len())
            .map(|pos| offset + pos as u8)
            .collect()
    }
}

impl StepExecutor for InjectExecutor {
    fn name(&self) -> &'static str {
        "inject"
    }

    fn check_preconditions(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> PreconditionReport {
        let mut report = PreconditionReport::ok();
        let Some(inj) = Self::params(step) else {
            report.fail("kind", "step is not an injection");
            return report;
        };

        let state = ctx.psm.current();
        if state != NamedState::Initial {
            report.fail("state", format!("expected INITIAL, found {state}"));
        }
        if inj.total_volume_ml <= 0.0 {
            report.fail("volume", "target volume must be > 0");
        }
        if inj.components.is_empty() {
            report.fail("components", "at least one component required");
        } else {
            let sum: f64 = inj.components.iter().map(|c| c.ratio).sum();
            if (sum - 1.0).abs() > RATIO_SUM_TOLERANCE {
                report.fail("ratios", format!("ratios must sum to 1, got {sum}"));
            }
            let last = usize::from(ctx.cfg.injection.pump_offset) + inj.components.len();
            if last > PUMP_COUNT {
                report.fail(
                    "pumps",
                    format!("components need pumps up to {last}, bank has {PUMP_COUNT}"),
                );
            }
        }
        if ctx.loadcell.is_none() {
            report.fail("load_cell", "no load cell available for weight feedback");
        }

        // The motion controller must be reachable to enter INJECT.
        if let Err(MotionError::Timeout { .. }) =
            ctx.psm.motion().query_pump(ctx.cfg.injection.pump_offset)
        {
            report.fail("motion_link", "motion controller unresponsive");
        }

        report
    }

    fn execute(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError> {
        let started = Instant::now();
        let inj = Self::params(step).ok_or_else(|| {
            StepError::InternalInvariantViolated("inject executor on non-inject step".to_string())
        })?;
        let lc = ctx
            .loadcell
            .ok_or_else(|| StepError::FeedbackLost("no load cell".to_string()))?;

        let offset = ctx.cfg.injection.pump_offset;
        let indices = Self::pump_indices(inj, offset);
        if ctx.cfg.runner.block_on_critical && ctx.ledger.any_pump_critical(&indices) {
            return Err(StepError::ResourceExhausted(
                "pump tube at critical wear".to_string(),
            ));
        }

        let speed = inj.speed_mm_s.unwrap_or(ctx.cfg.injection.default_speed_mm_s);
        let accel = inj.accel_mm_s2.unwrap_or(ctx.cfg.injection.default_accel_mm_s2);
        let stable_timeout =
            Duration::from_secs_f64(inj.stable_timeout_s.unwrap_or(ctx.cfg.injection.stable_timeout_s));

        let mut volumes = [0.0_f64; PUMP_COUNT];
        for (pos, comp) in inj.components.iter().enumerate() {
            volumes[usize::from(offset) + pos] = inj.total_volume_ml * comp.ratio;
        }

        let (guard, _) = TransactionGuard::open(ctx.psm, None)?;
        transition_with_retry(ctx.psm, NamedState::Inject)?;

        let empty_weight = lc.weight_g();
        let target = empty_weight + inj.total_volume_ml;
        info!(
            step = %step.step.name,
            total_ml = inj.total_volume_ml,
            speed_mm_s = speed,
            empty_weight_g = empty_weight,
            "inject start"
        );

        // Start every non-zero pump concurrently with common kinematics.
        let mut commanded: Vec<u8> = Vec::new();
        for &idx in &indices {
            let volume = volumes[usize::from(idx)];
            if volume <= 0.0 {
                continue;
            }
            if let Err(e) = run_pump_with_retry(ctx, idx, speed, accel, volume) {
                warn!(pump = idx, error = %e, "pump start failed, aborting injection");
                finish_pumps(ctx, &commanded, &volumes);
                return Err(e);
            }
            ctx.psm.note_pump_motion(idx, PumpMotion::Running);
            commanded.push(idx);
        }

        // Closed loop: poll the filtered weight at ~10 Hz.
        let deadline = started + stable_timeout;
        let mut cancelled = false;
        loop {
            if let Some(fault) = lc.fault() {
                finish_pumps(ctx, &commanded, &volumes);
                return Err(StepError::FeedbackLost(fault));
            }
            let weight = lc.weight_g();
            if weight >= target - inj.tolerance_g {
                debug!(weight_g = weight, "weight target reached");
                break;
            }
            if Instant::now() >= deadline {
                warn!(weight_g = weight, target_g = target, "inject weight timeout");
                break;
            }
            if ctx.cancel.sleep(Duration::from_millis(CANCEL_POLL_MS)) {
                cancelled = true;
                break;
            }
        }

        // Consumables are charged for what was commanded, regardless of
        // whether the weight target was reached.
        finish_pumps(ctx, &commanded, &volumes);
        let full_weight = lc.weight_g();

        if cancelled {
            // Guard drop restores the pre-state, same as completion.
            return Err(StepError::Cancelled);
        }

        guard.commit_and_restore()?;
        info!(
            injected_g = full_weight - empty_weight,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "inject complete"
        );
        Ok(StepOutcome {
            duration: started.elapsed(),
            inject: Some(InjectOutcome {
                pump_volumes_ml: volumes,
                speed_mm_s: speed,
                empty_weight_g: empty_weight,
                full_weight_g: full_weight,
            }),
            closes_cycle: false,
        })
    }

    fn estimate_duration(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Duration {
        match Self::params(step) {
            Some(inj) => {
                let speed = inj.speed_mm_s.unwrap_or(ctx.cfg.injection.default_speed_mm_s);
                Duration::from_secs_f64(inj.total_volume_ml / speed.max(1e-6) + 5.0)
            }
            None => Duration::ZERO,
        }
    }

    fn is_idempotent(&self) -> bool {
        false
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["peristaltic_pumps", "load_cell", "valves"]
    }
}

/// `RUN_PUMP` with the single in-executor retry on an ack timeout.
fn run_pump_with_retry(
    ctx: &ExecCtx<'_>,
    index: u8,
    speed: f64,
    accel: f64,
    distance: f64,
) -> Result<(), StepError> {
    match ctx.psm.motion().run_pump(index, speed, accel, distance) {
        Ok(()) => Ok(()),
        Err(MotionError::Timeout { .. }) => ctx
            .psm
            .motion()
            .run_pump(index, speed, accel, distance)
            .map_err(motion_to_step_error),
        Err(e) => Err(motion_to_step_error(e)),
    }
}

/// Stop every commanded pump and charge its tube counter.
fn finish_pumps(ctx: &ExecCtx<'_>, commanded: &[u8], volumes: &[f64; PUMP_COUNT]) {
    for &idx in commanded {
        if let Err(e) = ctx.psm.motion().stop_pump(idx) {
            warn!(pump = idx, error = %e, "pump stop failed");
        }
        ctx.psm.note_pump_motion(idx, PumpMotion::Stopped);
        ctx.ledger
            .charge_volume(idx, volumes[usize::from(idx)] * ctx.cfg.injection.mm_to_ml);
    }
}
