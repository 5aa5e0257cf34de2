//! Action executors.
//!
//! The executor set is closed and known at build time: dispatch is a
//! match over the step kind onto static executor instances, not an open
//! registry. Every executor implements the same surface — preconditions,
//! execution, duration estimate, idempotence flag, required resources —
//! and polls the shared cancellation token at least every 100 ms when
//! blocking.
//!
//! Precondition failures are returned as values; the runner decides
//! whether to surface, retry or skip. A fatal internal failure leaves the
//! transaction guard to restore the pre-state and returns `fail(reason)`.

mod acquire;
mod basic;
mod drain;
mod inject;
mod wash;

pub use acquire::AcquireExecutor;
pub use basic::{PhaseMarkerExecutor, SetGasPumpExecutor, SetStateExecutor, WaitExecutor};
pub use drain::DrainExecutor;
pub use inject::InjectExecutor;
pub use wash::WashExecutor;

use std::time::Duration;

use enose_common::config::EnoseConfig;
use enose_common::consts::PUMP_COUNT;
use enose_common::error::{PreconditionReport, StepError};
use enose_common::peripheral::NamedState;
use enose_common::program::{BoundStep, Program, StepKind, WaitCondition};
use enose_hal::loadcell::LoadCell;
use enose_hal::sensor::SensorLink;

use crate::cancel::CancelToken;
use crate::consumables::ConsumableLedger;
use crate::guard::motion_to_step_error;
use crate::state::{PeripheralStateMachine, TransitionReport};

/// Everything an executor may touch during one step.
pub struct ExecCtx<'a> {
    /// Instrument configuration.
    pub cfg: &'a EnoseConfig,
    /// The running program (liquid bindings, preamble).
    pub program: &'a Program,
    /// Peripheral state machine.
    pub psm: &'a PeripheralStateMachine,
    /// Load cell, when present.
    pub loadcell: Option<&'a LoadCell>,
    /// Sensor link, when present.
    pub sensor: Option<&'a SensorLink>,
    /// Consumable counters.
    pub ledger: &'a ConsumableLedger,
    /// Shared cancellation token for this run.
    pub cancel: &'a CancelToken,
}

/// Weight bookkeeping from an inject step, merged into the cycle's
/// `TestResult` by the runner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectOutcome {
    /// Volume commanded per pump [ml].
    pub pump_volumes_ml: [f64; PUMP_COUNT],
    /// Commanded speed [mm/s].
    pub speed_mm_s: f64,
    /// Weight before injection [g].
    pub empty_weight_g: f64,
    /// Weight after injection [g].
    pub full_weight_g: f64,
}

/// Result of a successful `execute`.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// Wall-clock execution time.
    pub duration: Duration,
    /// Inject bookkeeping, when the step was an injection.
    pub inject: Option<InjectOutcome>,
    /// True for acquire steps (closes the pending cycle result).
    pub closes_cycle: bool,
}

impl StepOutcome {
    /// Plain outcome carrying only a duration.
    pub fn timed(duration: Duration) -> Self {
        Self {
            duration,
            inject: None,
            closes_cycle: false,
        }
    }
}

/// One step kind's implementation.
pub trait StepExecutor: Sync {
    /// Executor name, matching the step kind.
    fn name(&self) -> &'static str;

    /// Check preconditions without touching hardware state.
    fn check_preconditions(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> PreconditionReport;

    /// Execute the step to completion, honoring cancellation.
    fn execute(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Result<StepOutcome, StepError>;

    /// Estimated duration for progress display.
    fn estimate_duration(&self, step: &BoundStep, ctx: &ExecCtx<'_>) -> Duration;

    /// Whether re-running the step is harmless.
    fn is_idempotent(&self) -> bool;

    /// Hardware resources the step needs.
    fn required_resources(&self) -> &'static [&'static str];
}

static INJECT: InjectExecutor = InjectExecutor;
static DRAIN: DrainExecutor = DrainExecutor;
static WASH: WashExecutor = WashExecutor;
static ACQUIRE: AcquireExecutor = AcquireExecutor;
static WAIT: WaitExecutor = WaitExecutor;
static SET_STATE: SetStateExecutor = SetStateExecutor;
static SET_GAS_PUMP: SetGasPumpExecutor = SetGasPumpExecutor;
static PHASE_MARKER: PhaseMarkerExecutor = PhaseMarkerExecutor;

/// Dispatch table over the closed executor set.
///
/// Containers never reach execution — the runner flattens them — so they
/// dispatch to the phase-marker no-op only to keep the function total.
pub fn executor_for(kind: &StepKind) -> &'static dyn StepExecutor {
    match kind {
        StepKind::Inject(_) => &INJECT,
        StepKind::Drain(_) => &DRAIN,
        StepKind::Wash(_) => &WASH,
        StepKind::Acquire(_) => &ACQUIRE,
        StepKind::Wait(_) => &WAIT,
        StepKind::SetState(_) => &SET_STATE,
        StepKind::SetGasPump(_) => &SET_GAS_PUMP,
        StepKind::PhaseMarker(_) | StepKind::Loop(_) | StepKind::ParamSweep(_) => &PHASE_MARKER,
    }
}

// ─── Shared Helpers ────────────────────────────────────────────────

/// Transition with the single in-executor retry on an unresponsive link.
pub(crate) fn transition_with_retry(
    psm: &PeripheralStateMachine,
    target: NamedState,
) -> Result<TransitionReport, StepError> {
    let report = psm.transition_to(target).map_err(motion_to_step_error)?;
    if !report.link_down() {
        return Ok(report);
    }
    let retry = psm.transition_to(target).map_err(motion_to_step_error)?;
    if retry.link_down() {
        return Err(StepError::CommunicationTimeout(format!(
            "motion link unresponsive entering {target}"
        )));
    }
    Ok(retry)
}

/// Duration for a wait condition, for estimates.
pub(crate) fn wait_estimate(cond: &WaitCondition, max_duration_s: Option<f64>) -> Duration {
    let seconds = match cond {
        WaitCondition::Duration { seconds } => *seconds,
        WaitCondition::HeaterCycles { count } => f64::from(*count) * 10.0,
        WaitCondition::Stability { window_s, .. } => window_s * 3.0,
    };
    let bounded = match max_duration_s {
        Some(max) => seconds.min(max),
        None => seconds,
    };
    Duration::from_secs_f64(bounded.max(0.0))
}
