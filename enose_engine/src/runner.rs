//! Experiment runner.
//!
//! One dedicated runner thread walks the flattened program and invokes
//! executors synchronously. The engine is single-writer: one experiment
//! at a time; `start` while a run is live fails with `ConflictingState`.
//!
//! Between leaf steps the runner checks the abort flag, blocks on pause,
//! applies the precondition policy, executes, merges cycle results and
//! appends them to the recorder, and emits progress events in
//! step-completion order. Suspension only happens between steps — never
//! inside a blocking executor call — so hardware stays in well-defined
//! states across a pause.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

use enose_common::config::{OverloadPolicy, PreconditionPolicy};
use enose_common::peripheral::{DeltaCommand, NamedState};
use enose_common::program::{
    validate, BoundStep, FlattenWalker, PhaseEdge, Program, StepKind, ValidationReport,
};
use enose_common::records::{RunId, RunRecord, RunState, TestResult, WeightSample};

use crate::context::ControllerContext;
use crate::executor::{executor_for, ExecCtx};
use crate::CancelToken;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No program loaded.
    Idle,
    /// Program loaded and validated.
    Loaded,
    /// Runner thread walking the program.
    Running,
    /// Suspended between steps.
    Paused,
    /// Final teardown after a normal walk.
    Completing,
    /// Teardown after an abort.
    Aborting,
    /// Run finished normally.
    Completed,
    /// Run terminated by abort.
    Aborted,
    /// Run terminated by a step failure.
    Error,
}

impl EngineState {
    /// A run is in progress (commands other than abort conflict).
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            EngineState::Running
                | EngineState::Paused
                | EngineState::Completing
                | EngineState::Aborting
        )
    }
}

/// Errors surfaced by engine commands.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The command conflicts with the current lifecycle state.
    #[error("ConflictingState: {0}")]
    ConflictingState(String),

    /// `start` without a loaded program.
    #[error("no program loaded")]
    NoProgram,

    /// The validator rejected the program.
    #[error("program rejected with {} error(s)", .0.errors.len())]
    ProgramInvalid(ValidationReport),

    /// A manual override could not be applied.
    #[error("motion link: {0}")]
    Motion(String),
}

/// Progress events, emitted in step-completion order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A leaf step began.
    StepStarted {
        /// Flattened step index.
        index: u32,
        /// Step name.
        name: String,
        /// Phase label active at start.
        phase: Option<String>,
    },
    /// A leaf step finished.
    StepCompleted {
        /// Flattened step index.
        index: u32,
        /// Step name.
        name: String,
        /// Wall-clock duration [ms].
        duration_ms: u64,
    },
    /// A step was skipped under the precondition policy.
    StepSkipped {
        /// Flattened step index.
        index: u32,
        /// Step name.
        name: String,
        /// Joined precondition failures.
        reason: String,
    },
    /// A phase marker opened a labeled span.
    PhaseStarted {
        /// Phase label.
        name: String,
    },
    /// A phase marker closed a labeled span.
    PhaseEnded {
        /// Phase label.
        name: String,
    },
    /// The run finished normally.
    RunCompleted {
        /// Run id.
        run_id: RunId,
    },
    /// The run was aborted.
    RunAborted {
        /// Run id.
        run_id: RunId,
    },
    /// The run failed.
    RunFailed {
        /// Run id.
        run_id: RunId,
        /// Failure reason.
        reason: String,
    },
}

struct EngineInner {
    state: Mutex<EngineState>,
    state_cv: Condvar,
    program: Mutex<Option<Arc<Program>>>,
    cancel: CancelToken,
    paused: AtomicBool,
    subscribers: Mutex<Vec<Sender<ProgressEvent>>>,
    current_phase: Mutex<Option<String>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    run_seq: AtomicU64,
}

/// The experiment engine.
pub struct ExperimentEngine {
    ctx: Arc<ControllerContext>,
    inner: Arc<EngineInner>,
}

impl ExperimentEngine {
    /// Build the engine over a wired context.
    ///
    /// Any run the store still shows as `running` is closed as an error —
    /// the single-running-run invariant is re-checked defensively on
    /// startup.
    pub fn new(ctx: ControllerContext) -> Self {
        let ctx = Arc::new(ctx);
        match ctx.store.runs_in_state(RunState::Running) {
            Ok(stale) => {
                for mut run in stale {
                    warn!(run_id = %run.id, "closing run interrupted by restart");
                    run.state = RunState::Error;
                    run.error = Some("interrupted by restart".to_string());
                    run.completed_at_ms = Some(now_ms());
                    if let Err(e) = ctx.store.upsert_run(&run) {
                        warn!(error = %e, "stale run not closed");
                    }
                }
            }
            Err(e) => warn!(error = %e, "startup run recovery query failed"),
        }

        Self {
            ctx,
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::Idle),
                state_cv: Condvar::new(),
                program: Mutex::new(None),
                cancel: CancelToken::new(),
                paused: AtomicBool::new(false),
                subscribers: Mutex::new(Vec::new()),
                current_phase: Mutex::new(None),
                handle: Mutex::new(None),
                run_seq: AtomicU64::new(0),
            }),
        }
    }

    /// The wired context (links, store, counters).
    pub fn context(&self) -> &ControllerContext {
        &self.ctx
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    /// Subscribe to progress events.
    pub fn subscribe_progress(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Validate and load a program.
    ///
    /// Returns the validation report (carrying any warnings) on success;
    /// a report with errors rejects the program and leaves the previous
    /// one loaded.
    pub fn load(&self, program: Program) -> Result<ValidationReport, EngineError> {
        let mut state = self.inner.state.lock();
        if state.is_busy() {
            return Err(EngineError::ConflictingState(format!(
                "cannot load while {:?}",
                *state
            )));
        }
        let report = validate(&program);
        if !report.is_ok() {
            return Err(EngineError::ProgramInvalid(report));
        }
        for w in &report.warnings {
            warn!(warning = %w, "program warning");
        }
        *self.inner.program.lock() = Some(Arc::new(program));
        *state = EngineState::Loaded;
        Ok(report)
    }

    /// Start the loaded program. One experiment at a time.
    pub fn start(&self) -> Result<RunId, EngineError> {
        let mut state = self.inner.state.lock();
        if state.is_busy() {
            return Err(EngineError::ConflictingState(format!(
                "a run is already {:?}",
                *state
            )));
        }
        let program = self
            .inner
            .program
            .lock()
            .clone()
            .ok_or(EngineError::NoProgram)?;

        // The previous runner thread, if any, has settled.
        if let Some(old) = self.inner.handle.lock().take() {
            let _ = old.join();
        }

        self.inner.cancel.reset();
        self.inner.paused.store(false, Ordering::Release);
        *self.inner.current_phase.lock() = None;

        let seq = self.inner.run_seq.fetch_add(1, Ordering::Relaxed);
        let created = now_ms();
        let run_id: RunId = format!("run-{created}-{seq}");
        let config_text = program.to_toml().unwrap_or_default();
        let run = RunRecord::started(run_id.clone(), created, config_text, program.leaf_count());
        self.ctx.recorder.record_run(run.clone());

        *state = EngineState::Running;
        drop(state);

        info!(run_id = %run_id, steps = run.total_steps, "run starting");
        let ctx = self.ctx.clone();
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("runner".to_string())
            .spawn(move || run_thread(ctx, inner, program, run));
        match handle {
            Ok(h) => *self.inner.handle.lock() = Some(h),
            Err(e) => {
                *self.inner.state.lock() = EngineState::Error;
                return Err(EngineError::ConflictingState(format!(
                    "runner thread failed to spawn: {e}"
                )));
            }
        }
        Ok(run_id)
    }

    /// Suspend between steps. The current step still runs to completion.
    pub fn pause(&self) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock();
        match *state {
            EngineState::Running => {
                self.inner.paused.store(true, Ordering::Release);
                *state = EngineState::Paused;
                info!("run paused");
                Ok(())
            }
            EngineState::Paused => Ok(()),
            other => Err(EngineError::ConflictingState(format!(
                "cannot pause while {other:?}"
            ))),
        }
    }

    /// Resume a paused run.
    pub fn resume(&self) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock();
        match *state {
            EngineState::Paused => {
                self.inner.paused.store(false, Ordering::Release);
                *state = EngineState::Running;
                self.inner.state_cv.notify_all();
                info!("run resumed");
                Ok(())
            }
            EngineState::Running => Ok(()),
            other => Err(EngineError::ConflictingState(format!(
                "cannot resume while {other:?}"
            ))),
        }
    }

    /// Abort the run. Level-triggered: the flag stays set until the run
    /// settles.
    pub fn abort(&self) -> Result<(), EngineError> {
        let state = *self.inner.state.lock();
        if !state.is_busy() {
            return Err(EngineError::ConflictingState(format!(
                "cannot abort while {state:?}"
            )));
        }
        info!("abort requested");
        self.inner.cancel.cancel();
        self.inner.state_cv.notify_all();
        Ok(())
    }

    /// Apply raw peripheral deltas outside the state machine's named
    /// transitions. Rejected during a run unless explicitly allowed.
    pub fn manual_override(
        &self,
        deltas: &[DeltaCommand],
        allow_during_run: bool,
    ) -> Result<(), EngineError> {
        let state = *self.inner.state.lock();
        if state.is_busy() && !allow_during_run {
            return Err(EngineError::ConflictingState(
                "manual override during a run requires allow_during_run".to_string(),
            ));
        }
        info!(deltas = deltas.len(), allow_during_run, "manual override");
        self.ctx
            .psm
            .apply_raw(deltas)
            .map(|_| ())
            .map_err(|e| EngineError::Motion(e.to_string()))
    }

    /// Block until the engine reaches a non-busy state, or the timeout.
    pub fn wait_settled(&self, timeout: Duration) -> EngineState {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.is_busy() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.inner.state_cv.wait_for(&mut state, deadline - now);
        }
        *state
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn emit(inner: &EngineInner, event: ProgressEvent) {
    inner
        .subscribers
        .lock()
        .retain(|tx| tx.send(event.clone()).is_ok());
}

fn set_state(inner: &EngineInner, state: EngineState) {
    *inner.state.lock() = state;
    inner.state_cv.notify_all();
}

/// Why the walk ended.
enum WalkEnd {
    Completed,
    Aborted,
    Failed(String),
}

fn run_thread(
    ctx: Arc<ControllerContext>,
    inner: Arc<EngineInner>,
    program: Arc<Program>,
    mut run: RunRecord,
) {
    let run_id = run.id.clone();

    // Weight samples are recorded for the whole run, tagged with the
    // phase label current at the moment of emission.
    let weights_stop = Arc::new(AtomicBool::new(false));
    let weights_handle = ctx.loadcell.as_ref().map(|lc| {
        let lc = lc.clone();
        let recorder = ctx.recorder.clone();
        let inner = inner.clone();
        let stop = weights_stop.clone();
        let run_id = run_id.clone();
        let period = Duration::from_millis(ctx.config.stability.sample_period_ms);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                let reading = lc.snapshot();
                recorder.record_weight_sample(WeightSample {
                    run_id: run_id.clone(),
                    t_ms: now_ms(),
                    weight_g: reading.weight_g,
                    phase: inner.current_phase.lock().clone(),
                });
                std::thread::sleep(period);
            }
        })
    });

    let exec_ctx = ExecCtx {
        cfg: &ctx.config,
        program: &program,
        psm: &ctx.psm,
        loadcell: ctx.loadcell.as_deref(),
        sensor: ctx.sensor.as_deref(),
        ledger: &ctx.ledger,
        cancel: &inner.cancel,
    };

    let mut index: u32 = 0;
    let mut cycle_counter: u32 = 0;
    let mut pending_cycle: Option<TestResult> = None;
    let end = walk_program(
        &ctx,
        &inner,
        &program,
        &exec_ctx,
        &mut run,
        &mut index,
        &mut cycle_counter,
        &mut pending_cycle,
    );

    // An inject without its acquire still yields a (partial) result.
    if let Some(tr) = pending_cycle.take() {
        ctx.recorder.record_test_result(tr);
    }

    let final_state = match end {
        WalkEnd::Aborted => {
            set_state(&inner, EngineState::Aborting);
            if ctx.psm.snapshot().any_pump_running() {
                let _ = ctx.motion.emergency_stop();
            }
            teardown_to_initial(&ctx);
            run.state = RunState::Aborted;
            info!(run_id = %run_id, "run aborted");
            emit(&inner, ProgressEvent::RunAborted {
                run_id: run_id.clone(),
            });
            EngineState::Aborted
        }
        WalkEnd::Failed(reason) => {
            set_state(&inner, EngineState::Aborting);
            teardown_to_initial(&ctx);
            run.state = RunState::Error;
            run.error = Some(reason.clone());
            error!(run_id = %run_id, reason = %reason, "run failed");
            emit(&inner, ProgressEvent::RunFailed {
                run_id: run_id.clone(),
                reason,
            });
            EngineState::Error
        }
        WalkEnd::Completed => {
            set_state(&inner, EngineState::Completing);
            teardown_to_initial(&ctx);
            run.state = RunState::Completed;
            info!(run_id = %run_id, steps = index, "run completed");
            emit(&inner, ProgressEvent::RunCompleted {
                run_id: run_id.clone(),
            });
            EngineState::Completed
        }
    };

    run.current_step = index;
    run.completed_at_ms = Some(now_ms());
    ctx.recorder.record_run(run);
    ctx.persist_consumables();

    weights_stop.store(true, Ordering::Release);
    if let Some(h) = weights_handle {
        let _ = h.join();
    }

    set_state(&inner, final_state);
}

/// Return the peripheral to INITIAL, best-effort.
fn teardown_to_initial(ctx: &ControllerContext) {
    if let Err(e) = ctx.psm.transition_to(NamedState::Initial) {
        warn!(error = %e, "teardown transition failed");
    }
}

#[allow(clippy::too_many_arguments)]
fn walk_program(
    ctx: &ControllerContext,
    inner: &EngineInner,
    program: &Program,
    exec_ctx: &ExecCtx<'_>,
    run: &mut RunRecord,
    index: &mut u32,
    cycle_counter: &mut u32,
    pending_cycle: &mut Option<TestResult>,
) -> WalkEnd {
    for bound in FlattenWalker::new(program) {
        // Abort wins over everything between steps.
        if inner.cancel.is_cancelled() {
            return WalkEnd::Aborted;
        }

        // Pause blocks here, never inside an executor. Paused time keeps
        // counting toward overall wall-clock.
        {
            let mut state = inner.state.lock();
            while inner.paused.load(Ordering::Acquire) && !inner.cancel.is_cancelled() {
                inner
                    .state_cv
                    .wait_for(&mut state, Duration::from_millis(100));
            }
        }
        if inner.cancel.is_cancelled() {
            return WalkEnd::Aborted;
        }

        // Recorder pressure per policy.
        while ctx.recorder.is_overloaded() {
            match ctx.config.runner.overload_policy {
                OverloadPolicy::Pause => {
                    warn!("recorder overloaded, runner waiting");
                    if inner.cancel.sleep(Duration::from_millis(100)) {
                        return WalkEnd::Aborted;
                    }
                }
                OverloadPolicy::Abort => {
                    return WalkEnd::Failed("recorder overloaded".to_string());
                }
            }
        }

        let name = bound.step.name.clone();
        let phase = inner.current_phase.lock().clone();
        emit(inner, ProgressEvent::StepStarted {
            index: *index,
            name: name.clone(),
            phase,
        });
        run.current_step = *index;
        ctx.recorder.record_run(run.clone());

        // Phase markers are runner bookkeeping, not hardware work.
        if let StepKind::PhaseMarker(m) = &bound.step.kind {
            match m.edge {
                PhaseEdge::Start => {
                    *inner.current_phase.lock() = Some(m.name.clone());
                    emit(inner, ProgressEvent::PhaseStarted {
                        name: m.name.clone(),
                    });
                }
                PhaseEdge::End => {
                    let mut cur = inner.current_phase.lock();
                    if cur.as_deref() == Some(m.name.as_str()) {
                        *cur = None;
                    }
                    drop(cur);
                    emit(inner, ProgressEvent::PhaseEnded {
                        name: m.name.clone(),
                    });
                }
            }
            emit(inner, ProgressEvent::StepCompleted {
                index: *index,
                name,
                duration_ms: 0,
            });
            *index += 1;
            continue;
        }

        let exec = executor_for(&bound.step.kind);
        let pre = exec.check_preconditions(&bound, exec_ctx);
        if !pre.passed() {
            match ctx.config.runner.on_precondition_failure {
                PreconditionPolicy::Skip => {
                    warn!(step = %name, reason = %pre.summary(), "step skipped");
                    emit(inner, ProgressEvent::StepSkipped {
                        index: *index,
                        name,
                        reason: pre.summary(),
                    });
                    *index += 1;
                    continue;
                }
                PreconditionPolicy::Abort => {
                    return WalkEnd::Failed(format!(
                        "PreconditionFailed at '{name}': {}",
                        pre.summary()
                    ));
                }
            }
        }

        info!(step = %name, executor = exec.name(), "step executing");
        match exec.execute(&bound, exec_ctx) {
            Ok(outcome) => {
                merge_cycle(ctx, &bound, &outcome, run, cycle_counter, pending_cycle);
                emit(inner, ProgressEvent::StepCompleted {
                    index: *index,
                    name,
                    duration_ms: outcome.duration.as_millis() as u64,
                });
            }
            Err(e) if e.is_cancellation() => return WalkEnd::Aborted,
            Err(e) => return WalkEnd::Failed(format!("step '{name}' failed: {e}")),
        }
        *index += 1;
    }
    WalkEnd::Completed
}

/// Fold an executor outcome into the per-cycle test result.
fn merge_cycle(
    ctx: &ControllerContext,
    bound: &BoundStep,
    outcome: &crate::executor::StepOutcome,
    run: &RunRecord,
    cycle_counter: &mut u32,
    pending_cycle: &mut Option<TestResult>,
) {
    if let Some(injected) = outcome.inject {
        // A new cycle begins; flush any unfinished one first.
        if let Some(tr) = pending_cycle.take() {
            ctx.recorder.record_test_result(tr);
        }
        let mut tr = TestResult::new(run.id.clone(), *cycle_counter);
        *cycle_counter += 1;
        tr.param_set_id = bound.param_set_id;
        tr.param_set_name = bound.param_set_name.clone();
        tr.pump_volumes_ml = injected.pump_volumes_ml;
        tr.speed_mm_s = injected.speed_mm_s;
        tr.empty_weight_g = injected.empty_weight_g;
        tr.full_weight_g = injected.full_weight_g;
        tr.injected_weight_g = injected.full_weight_g - injected.empty_weight_g;
        tr.push_phase("inject", outcome.duration.as_millis() as u64);
        *pending_cycle = Some(tr);
    } else if outcome.closes_cycle {
        if let Some(mut tr) = pending_cycle.take() {
            tr.push_phase("acquire", outcome.duration.as_millis() as u64);
            ctx.recorder.record_test_result(tr);
        }
    }
}
