//! Acquire: drive gas through the sensor array and wait out the
//! acquisition, plus the shared wait-condition machinery.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use enose_common::consts::CANCEL_POLL_MS;
use enose_common::error::{PreconditionReport, StepError};
use enose_common::peripheral::{DeltaCommand, NamedState};
use enose_common::program::{AcquireStep, BoundStep, StepKind, WaitCondition};
use enose_hal::sensor::{HeaterCycleCounter, SensorError, SensorEvent, SignalStability};

use crate::guard::TransactionGuard;

use super::{transition_with_retry, wait_estimate, ExecCtx, StepExecutor, StepOutcome};

/// Executor for [`StepKind::Acquire`]. Not idempotent — the sample is
/// consumed by pulling it through the array.
pub struct AcquireExecutor;

impl AcquireExecutor {
    fn params<'s>(step: &'s BoundStep) -> Option<&'s AcquireStep> {
        match &step.step.kind {
            StepKind::Acquire(a) => Some(a),
            _ => None,
        }
    }
}

impl StepExecutor for AcquireExecutor {
    fn name(&self) -> &'static str {
        "acquire"
    }

    fn check_preconditions(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> PreconditionReport {
        let mut report = PreconditionReport::ok();
        let Some(a) = Self::params(step) else {
            report.fail("kind", "step is not an acquire");
            return report;
        };
        let state = ctx.psm.current();
        if state != NamedState::Initial {
            report.fail("state", format!("expected INITIAL, found {state}"));
        }
        if !(0.0..=100.0).contains(&a.gas_pwm_percent) {
            report.fail(
                "gas_pwm",
                format!("{} out of [0, 100]", a.gas_pwm_percent),
            );
        }
        if condition_needs_sensor(&a.until) && ctx.sensor.is_none() {
            report.fail("sensor", "wait condition needs the sensor link");
        }
        report
    }

    fn execute(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError> {
        let started = Instant::now();
        let a = Self::params(step).ok_or_else(|| {
            StepError::InternalInvariantViolated("acquire executor on non-acquire step".to_string())
        })?;

        let (guard, _) = TransactionGuard::open(ctx.psm, None)?;
        transition_with_retry(ctx.psm, NamedState::Sample)?;
        set_gas_pump_with_retry(ctx, a.gas_pwm_percent)?;
        info!(
            step = %step.step.name,
            gas_pwm = a.gas_pwm_percent,
            "acquire start"
        );

        run_wait_condition(ctx, &a.until, Duration::from_secs_f64(a.max_duration_s))?;

        // Gas was pulled through the inlet filter for the whole wait.
        ctx.ledger
            .charge_time("inlet_filter", started.elapsed().as_secs_f64());

        guard.commit_and_restore()?;
        Ok(StepOutcome {
            duration: started.elapsed(),
            inject: None,
            closes_cycle: true,
        })
    }

    fn estimate_duration(&self, step: &BoundStep, _ctx: &ExecCtx<'_>) -> Duration {
        match Self::params(step) {
            Some(a) => wait_estimate(&a.until, Some(a.max_duration_s)),
            None => Duration::ZERO,
        }
    }

    fn is_idempotent(&self) -> bool {
        false
    }

    fn required_resources(&self) -> &'static [&'static str] {
        &["gas_pump", "sensor", "valves"]
    }
}

/// True when the condition consumes sensor data events.
pub(crate) fn condition_needs_sensor(cond: &WaitCondition) -> bool {
    !matches!(cond, WaitCondition::Duration { .. })
}

/// Write the air-pump PWM with the single in-executor retry.
pub(crate) fn set_gas_pump_with_retry(ctx: &ExecCtx<'_>, percent: f64) -> Result<(), StepError> {
    let delta = DeltaCommand::AirPumpPwm {
        duty: percent / 100.0,
    };
    let report = ctx
        .psm
        .apply_raw(&[delta])
        .map_err(crate::guard::motion_to_step_error)?;
    if !report.link_down() {
        return Ok(());
    }
    let retry = ctx
        .psm
        .apply_raw(&[delta])
        .map_err(crate::guard::motion_to_step_error)?;
    if retry.link_down() {
        return Err(StepError::CommunicationTimeout(
            "motion link unresponsive setting gas pump".to_string(),
        ));
    }
    Ok(())
}

fn sensor_to_step_error(e: SensorError) -> StepError {
    match e {
        SensorError::Timeout { .. } | SensorError::Stopped => {
            StepError::CommunicationTimeout(e.to_string())
        }
        other => StepError::FeedbackLost(other.to_string()),
    }
}

/// Block until the wait condition is met, the bound elapses or the run is
/// cancelled. Shared by Acquire and Wait.
pub(crate) fn run_wait_condition(
    ctx: &ExecCtx<'_>,
    cond: &WaitCondition,
    max_duration: Duration,
) -> Result<(), StepError> {
    match cond {
        WaitCondition::Duration { seconds } => {
            let wait = Duration::from_secs_f64(*seconds).min(max_duration);
            if ctx.cancel.sleep(wait) {
                return Err(StepError::Cancelled);
            }
            Ok(())
        }
        WaitCondition::HeaterCycles { count } => with_sensor_stream(
            ctx,
            max_duration,
            HeaterCycleCounter::new(),
            |event, counter| {
                if let SensorEvent::Data(r) = event {
                    return counter.feed(r.heater_step) >= *count;
                }
                false
            },
        ),
        WaitCondition::Stability { pct, window_s } => with_sensor_stream(
            ctx,
            max_duration,
            SignalStability::new(Duration::from_secs_f64(*window_s), *pct),
            |event, detector| match event {
                // Stability is judged on the reference sensor.
                SensorEvent::Data(r) if r.idx == 0 => detector.feed(r.value),
                _ => false,
            },
        ),
    }
}

/// Subscribe to sensor events, pump them through `observe` until it
/// reports done, the bound elapses or the run is cancelled. Reaching the
/// bound is a normal exit — it is how the duration fallback works.
fn with_sensor_stream<S>(
    ctx: &ExecCtx<'_>,
    max_duration: Duration,
    mut state: S,
    mut observe: impl FnMut(&SensorEvent, &mut S) -> bool,
) -> Result<(), StepError> {
    let sensor = ctx
        .sensor
        .ok_or_else(|| StepError::FeedbackLost("no sensor link".to_string()))?;
    let rx = sensor.subscribe();
    sensor.start().map_err(sensor_to_step_error)?;

    let deadline = Instant::now() + max_duration;
    let result = loop {
        if ctx.cancel.is_cancelled() {
            break Err(StepError::Cancelled);
        }
        if Instant::now() >= deadline {
            debug!("wait condition fell back to its duration bound");
            break Ok(());
        }
        match rx.recv_timeout(Duration::from_millis(CANCEL_POLL_MS)) {
            Ok(event) => {
                if observe(&event, &mut state) {
                    break Ok(());
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                break Err(StepError::CommunicationTimeout(
                    "sensor event stream closed".to_string(),
                ));
            }
        }
    };

    // Streaming stop is best-effort; the array tolerates repeats.
    let _ = sensor.stop_stream();
    result
}
