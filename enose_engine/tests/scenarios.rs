//! End-to-end scenarios against the simulated instrument.
//!
//! The plant model derives weight physics from the motion-command stream:
//! running pumps raise the chamber weight, the cleaning pump fills it,
//! and an open drain valve empties it. Timescales are compressed — the
//! semantics under test are the runner's, not the plumbing's.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use enose_common::config::{EnoseConfig, PreconditionPolicy};
use enose_common::peripheral::NamedState;
use enose_common::program::{
    AcquireStep, Component, DrainStep, InjectStep, LiquidBinding, Preamble, Program, Step,
    StepKind, WaitCondition, WaitStep, WashStep,
};
use enose_common::records::RunState;
use enose_engine::runner::EngineState;
use enose_engine::{ControllerContext, EngineError, ExperimentEngine, ProgressEvent};
use enose_hal::loadcell::SimWeightSource;
use enose_hal::motion::{SimMode, SimMotionHandle, SimMotionPort};
use enose_hal::sensor::SimSensorPort;
use enose_store::{MemoryStore, ResultStore};

// ─── Plant Model ───────────────────────────────────────────────────

/// Weight physics driven by the commands the engine actually sent.
struct PlantSim {
    handle: SimMotionHandle,
    parsed: usize,
    weight: f64,
    last_tick: Instant,
    pumping: bool,
    cleaning: bool,
    draining: bool,
    inject_rate: f64,
    clean_rate: f64,
    drain_rate: f64,
}

impl PlantSim {
    fn new(handle: SimMotionHandle, inject_rate: f64, clean_rate: f64) -> Self {
        Self {
            handle,
            parsed: 0,
            weight: 0.0,
            last_tick: Instant::now(),
            pumping: false,
            cleaning: false,
            draining: false,
            inject_rate,
            clean_rate,
            drain_rate: 10.0,
        }
    }

    fn consume_commands(&mut self) {
        let lines = self.handle.sent_lines();
        for line in &lines[self.parsed.min(lines.len())..] {
            if line.starts_with("RUN_PUMP") {
                self.pumping = true;
            } else if line.starts_with("STOP_PUMP") || line == "EMERGENCY_STOP" {
                self.pumping = false;
            } else if line.starts_with("SET_VALVE VALVE=0") {
                self.draining = line.ends_with("STATE=1");
            } else if line.starts_with("SET_FAN FAN=clean_pump") {
                self.cleaning = !line.ends_with("DUTY=0.000");
            }
        }
        self.parsed = lines.len();
    }

    fn read(&mut self) -> f64 {
        self.consume_commands();
        let dt = self.last_tick.elapsed().as_secs_f64();
        self.last_tick = Instant::now();
        if self.draining {
            self.weight = (self.weight - self.drain_rate * dt).max(0.0);
        } else {
            if self.pumping {
                self.weight += self.inject_rate * dt;
            }
            if self.cleaning {
                self.weight += self.clean_rate * dt;
            }
        }
        self.weight
    }
}

// ─── Rig ───────────────────────────────────────────────────────────

struct Rig {
    engine: Arc<ExperimentEngine>,
    motion: SimMotionHandle,
    store: Arc<MemoryStore>,
    events: crossbeam_channel::Receiver<ProgressEvent>,
}

fn build_rig(tune: impl FnOnce(&mut EnoseConfig), motion_dead: bool) -> Rig {
    let mut config = EnoseConfig::for_testing();
    tune(&mut config);

    let (motion_port, motion_handle) = if motion_dead {
        SimMotionPort::dead()
    } else {
        SimMotionPort::healthy()
    };
    let plant = Arc::new(Mutex::new(PlantSim::new(motion_handle.clone(), 1.0, 2.0)));
    let weight_plant = plant.clone();
    let weight_source = SimWeightSource::from_fn(move || weight_plant.lock().read());

    let (s0, _h0) = SimSensorPort::healthy("sim0");
    let (s1, _h1) = SimSensorPort::healthy("sim1");

    let store = Arc::new(MemoryStore::new());
    let ctx = ControllerContext::assemble(
        config,
        Box::new(motion_port),
        Some(Box::new(weight_source)),
        Some((Box::new(s0), Box::new(s1))),
        store.clone(),
    );
    let engine = Arc::new(ExperimentEngine::new(ctx));
    let events = engine.subscribe_progress();
    Rig {
        engine,
        motion: motion_handle,
        store,
        events,
    }
}

fn leaf(id: &str, kind: StepKind) -> Step {
    Step {
        id: id.to_string(),
        name: id.to_string(),
        comment: None,
        kind,
    }
}

fn drain_step(id: &str) -> Step {
    leaf(
        id,
        StepKind::Drain(DrainStep {
            timeout_s: 5.0,
            tolerance_g: 1.0,
            stability_window_s: None,
        }),
    )
}

fn inject_step(id: &str, volume: f64, ratios: &[f64]) -> Step {
    leaf(
        id,
        StepKind::Inject(InjectStep {
            total_volume_ml: volume,
            components: ratios
                .iter()
                .enumerate()
                .map(|(i, r)| Component {
                    liquid: format!("liq{i}"),
                    ratio: *r,
                })
                .collect(),
            speed_mm_s: Some(0.5),
            accel_mm_s2: Some(10.0),
            tolerance_g: 0.05,
            stable_timeout_s: Some(30.0),
        }),
    )
}

fn acquire_step(id: &str, seconds: f64) -> Step {
    leaf(
        id,
        StepKind::Acquire(AcquireStep {
            gas_pwm_percent: 50.0,
            until: WaitCondition::Duration { seconds },
            max_duration_s: seconds + 30.0,
        }),
    )
}

fn wait_step(id: &str, seconds: f64) -> Step {
    leaf(
        id,
        StepKind::Wait(WaitStep {
            until: WaitCondition::Duration { seconds },
            max_duration_s: None,
        }),
    )
}

fn program(steps: Vec<Step>) -> Program {
    Program {
        preamble: Preamble::default(),
        liquids: vec![
            LiquidBinding {
                id: "liq0".to_string(),
                pump: 2,
            },
            LiquidBinding {
                id: "liq1".to_string(),
                pump: 3,
            },
        ],
        steps,
    }
}

fn drain_events(rig: &Rig) -> Vec<ProgressEvent> {
    rig.events.try_iter().collect()
}

// ─── Scenarios ─────────────────────────────────────────────────────

#[test]
fn s1_drain_inject_acquire_drain_completes() {
    let rig = build_rig(
        |cfg| {
            // The single component maps positionally onto pump 2.
            cfg.injection.pump_offset = 2;
        },
        false,
    );

    let p = program(vec![
        drain_step("d1"),
        inject_step("inj", 4.0, &[1.0]),
        acquire_step("acq", 1.0),
        drain_step("d2"),
    ]);
    rig.engine.load(p).unwrap();
    let run_id = rig.engine.start().unwrap();

    let settled = rig.engine.wait_settled(Duration::from_secs(60));
    assert_eq!(settled, EngineState::Completed);

    // Peripheral back at INITIAL.
    assert_eq!(rig.engine.context().psm.current(), NamedState::Initial);

    // Run record closed as completed.
    assert!(rig.engine.context().recorder.flush(Duration::from_secs(5)));
    let run = rig.store.fetch_run(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Completed);
    assert!(run.completed_at_ms.is_some());

    // One test result with the injected weight in band.
    let results = rig.store.results_for_run(&run_id).unwrap();
    assert_eq!(results.len(), 1);
    let tr = &results[0];
    assert!(
        (3.85..=4.25).contains(&tr.injected_weight_g),
        "injected weight {} out of band",
        tr.injected_weight_g
    );
    assert_eq!(tr.pump_volumes_ml[2], 4.0);
    assert_eq!(tr.speed_mm_s, 0.5);
    assert_eq!(tr.phase_durations_ms.len(), 2);

    // Pump 2's tube was charged the commanded volume.
    let ledger = &rig.engine.context().ledger;
    let used = ledger
        .snapshots()
        .into_iter()
        .find(|s| s.id == "pump_tube_2")
        .unwrap()
        .used;
    assert!((used - 4.0).abs() < 1e-9, "pump_tube_2 charged {used}");

    // Four leaf steps, four completions, then the run-completed event.
    let events = drain_events(&rig);
    let completions = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::StepCompleted { .. }))
        .count();
    assert_eq!(completions, 4);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunCompleted { .. })
    ));

    // Weight samples were recorded along the way.
    assert!(rig.store.sample_count() > 10);
}

#[test]
fn s2_abort_during_acquire() {
    let rig = build_rig(|_| {}, false);
    let p = program(vec![
        drain_step("d1"),
        acquire_step("acq", 30.0),
        drain_step("d2"),
        wait_step("w", 1.0),
    ]);
    rig.engine.load(p).unwrap();
    let run_id = rig.engine.start().unwrap();

    // Let the run get into the acquire, then abort.
    std::thread::sleep(Duration::from_millis(1_500));
    rig.engine.abort().unwrap();

    let settled = rig.engine.wait_settled(Duration::from_secs(30));
    assert_eq!(settled, EngineState::Aborted);
    assert_eq!(rig.engine.context().psm.current(), NamedState::Initial);

    assert!(rig.engine.context().recorder.flush(Duration::from_secs(5)));
    let run = rig.store.fetch_run(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Aborted);

    let events = drain_events(&rig);
    // The final event is the abort notification.
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunAborted { .. })
    ));
    // No step was started after the abort: at most d1 and acq started.
    let started = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::StepStarted { .. }))
        .count();
    assert!(started <= 2, "steps started after abort: {started}");
}

#[test]
fn s3_wash_two_cycles() {
    let rig = build_rig(|_| {}, false);
    let state_changes = rig.engine.context().psm.subscribe();

    let p = program(vec![leaf(
        "wash",
        StepKind::Wash(WashStep {
            repeat_count: 2,
            target_weight_g: 2.0,
            drain_timeout_s: 5.0,
            fill_timeout_s: 10.0,
            tolerance_g: 1.0,
        }),
    )]);
    rig.engine.load(p).unwrap();
    rig.engine.start().unwrap();

    let settled = rig.engine.wait_settled(Duration::from_secs(60));
    assert_eq!(settled, EngineState::Completed);
    assert_eq!(rig.engine.context().psm.current(), NamedState::Initial);

    // Two full drain → clean → drain sequences, ending back at INITIAL.
    let names: Vec<NamedState> = state_changes.try_iter().map(|c| c.to).collect();
    let drain_to_clean = names
        .windows(2)
        .filter(|w| w[0] == NamedState::Drain && w[1] == NamedState::Clean)
        .count();
    assert!(drain_to_clean >= 2, "observed transitions: {names:?}");
    assert_eq!(*names.last().unwrap(), NamedState::Initial);

    // The cleaning pump accrued running time.
    assert!(
        rig.engine
            .context()
            .ledger
            .snapshots()
            .into_iter()
            .find(|s| s.id == "clean_pump")
            .unwrap()
            .used
            > 0.0
    );
}

#[test]
fn s4_bad_ratio_sum_rejected_before_execution() {
    let rig = build_rig(|_| {}, false);
    let p = program(vec![inject_step("inj", 4.0, &[0.7, 0.4])]);

    let err = rig.engine.load(p).unwrap_err();
    match err {
        EngineError::ProgramInvalid(report) => {
            assert_eq!(report.errors.len(), 1);
            assert!(report.errors[0].message.contains("ratios must sum to 1"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(rig.engine.state(), EngineState::Idle);
    // Nothing was commanded.
    assert!(rig.motion.sent_lines().is_empty());
}

#[test]
fn s5_motion_link_down_fails_run_then_recovers() {
    let rig = build_rig(
        |cfg| {
            cfg.motion.ack_timeout_ms = 100;
        },
        true,
    );

    let p = program(vec![drain_step("d1"), wait_step("w", 0.2)]);
    rig.engine.load(p).unwrap();
    let run_id = rig.engine.start().unwrap();

    let settled = rig.engine.wait_settled(Duration::from_secs(30));
    assert_eq!(settled, EngineState::Error);
    assert_eq!(rig.engine.context().psm.current(), NamedState::Initial);

    assert!(rig.engine.context().recorder.flush(Duration::from_secs(5)));
    let run = rig.store.fetch_run(&run_id).unwrap().unwrap();
    assert_eq!(run.state, RunState::Error);
    assert!(
        run.error.as_deref().unwrap_or("").contains("CommunicationTimeout"),
        "error was {:?}",
        run.error
    );

    let events = drain_events(&rig);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::RunFailed { .. })
    ));

    // The link recovers; a fresh load and start succeed.
    rig.motion.set_mode(SimMode::Healthy);
    let p2 = program(vec![drain_step("d1"), wait_step("w", 0.2)]);
    rig.engine.load(p2).unwrap();
    let run2 = rig.engine.start().unwrap();
    let settled = rig.engine.wait_settled(Duration::from_secs(30));
    assert_eq!(settled, EngineState::Completed);

    assert!(rig.engine.context().recorder.flush(Duration::from_secs(5)));
    let run2 = rig.store.fetch_run(&run2).unwrap().unwrap();
    assert_eq!(run2.state, RunState::Completed);
}

#[test]
fn s6_pause_and_resume_preserve_order() {
    let rig = build_rig(|_| {}, false);
    let p = program(vec![
        wait_step("w1", 0.2),
        wait_step("w2", 0.2),
        wait_step("w3", 0.2),
        wait_step("w4", 0.2),
        wait_step("w5", 0.2),
    ]);
    rig.engine.load(p).unwrap();

    let started = Instant::now();
    rig.engine.start().unwrap();

    // Pause while step 2 is in flight; it completes, then the runner
    // blocks between steps.
    std::thread::sleep(Duration::from_millis(300));
    rig.engine.pause().unwrap();
    assert_eq!(rig.engine.state(), EngineState::Paused);
    std::thread::sleep(Duration::from_millis(700));
    rig.engine.resume().unwrap();

    let settled = rig.engine.wait_settled(Duration::from_secs(30));
    assert_eq!(settled, EngineState::Completed);

    // Wall clock includes the pause plus the natural step durations;
    // the step in flight when pause hit overlaps the pause window.
    assert!(started.elapsed() >= Duration::from_millis(700 + 5 * 200 - 250));

    // Completion order is program order.
    let indices: Vec<u32> = drain_events(&rig)
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::StepCompleted { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indices, [0, 1, 2, 3, 4]);
}

// ─── Invariants ────────────────────────────────────────────────────

#[test]
fn abort_at_any_time_settles_at_initial() {
    for abort_after_ms in [30, 250, 700] {
        let rig = build_rig(|_| {}, false);
        let p = program(vec![
            drain_step("d1"),
            wait_step("w1", 0.3),
            wait_step("w2", 0.3),
            drain_step("d2"),
        ]);
        rig.engine.load(p).unwrap();
        let run_id = rig.engine.start().unwrap();

        std::thread::sleep(Duration::from_millis(abort_after_ms));
        // The run may already have settled; abort only while busy.
        let _ = rig.engine.abort();

        let settled = rig.engine.wait_settled(Duration::from_secs(30));
        assert!(
            matches!(settled, EngineState::Aborted | EngineState::Completed),
            "settled at {settled:?} after {abort_after_ms} ms"
        );
        assert_eq!(rig.engine.context().psm.current(), NamedState::Initial);

        assert!(rig.engine.context().recorder.flush(Duration::from_secs(5)));
        let run = rig.store.fetch_run(&run_id).unwrap().unwrap();
        assert!(run.state.is_terminal(), "run left in {:?}", run.state);
    }
}

#[test]
fn conflicting_start_rejected_while_running() {
    let rig = build_rig(|_| {}, false);
    let p = program(vec![wait_step("w", 1.0)]);
    rig.engine.load(p).unwrap();
    rig.engine.start().unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert!(matches!(
        rig.engine.start(),
        Err(EngineError::ConflictingState(_))
    ));
    rig.engine.abort().unwrap();
    rig.engine.wait_settled(Duration::from_secs(10));
}

#[test]
fn critical_consumable_blocks_injection() {
    let rig = build_rig(
        |cfg| {
            cfg.runner.on_precondition_failure = PreconditionPolicy::Abort;
        },
        false,
    );
    // Pump 0's tube at critical before the run starts.
    rig.engine
        .context()
        .ledger
        .charge_volume(0, 9_999.0);

    let p = program(vec![inject_step("inj", 4.0, &[1.0])]);
    rig.engine.load(p).unwrap();
    let run_id = rig.engine.start().unwrap();

    let settled = rig.engine.wait_settled(Duration::from_secs(30));
    assert_eq!(settled, EngineState::Error);

    assert!(rig.engine.context().recorder.flush(Duration::from_secs(5)));
    let run = rig.store.fetch_run(&run_id).unwrap().unwrap();
    assert!(
        run.error.as_deref().unwrap_or("").contains("ResourceExhausted"),
        "error was {:?}",
        run.error
    );
    assert_eq!(rig.engine.context().psm.current(), NamedState::Initial);
}

#[test]
fn skip_policy_skips_failed_preconditions() {
    let rig = build_rig(
        |cfg| {
            cfg.runner.on_precondition_failure = PreconditionPolicy::Skip;
        },
        false,
    );
    let p2 = program(vec![
        leaf(
            "set_sample",
            StepKind::SetState(enose_common::program::SetStateStep {
                target: NamedState::Sample,
            }),
        ),
        // Drain requires INITIAL or INJECT; from SAMPLE its
        // precondition fails and the policy skips it.
        drain_step("d1"),
        leaf(
            "set_initial",
            StepKind::SetState(enose_common::program::SetStateStep {
                target: NamedState::Initial,
            }),
        ),
    ]);
    rig.engine.load(p2).unwrap();
    rig.engine.start().unwrap();
    let settled = rig.engine.wait_settled(Duration::from_secs(30));
    assert_eq!(settled, EngineState::Completed);

    let events = drain_events(&rig);
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::StepSkipped { name, .. } if name == "d1"
    )));
}

#[test]
fn startup_recovery_closes_interrupted_runs() {
    let store = Arc::new(MemoryStore::new());
    let stale = enose_common::records::RunRecord::started(
        "run-stale".to_string(),
        1,
        String::new(),
        3,
    );
    store.upsert_run(&stale).unwrap();

    let (motion_port, _handle) = SimMotionPort::healthy();
    let ctx = ControllerContext::assemble(
        EnoseConfig::for_testing(),
        Box::new(motion_port),
        None,
        None,
        store.clone(),
    );
    let _engine = ExperimentEngine::new(ctx);

    let run = store.fetch_run(&"run-stale".to_string()).unwrap().unwrap();
    assert_eq!(run.state, RunState::Error);
    assert!(run.error.as_deref().unwrap_or("").contains("interrupted"));
}

#[test]
fn manual_override_rejected_during_run() {
    let rig = build_rig(|_| {}, false);
    let p = program(vec![wait_step("w", 0.8)]);
    rig.engine.load(p).unwrap();
    rig.engine.start().unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let delta = [enose_common::peripheral::DeltaCommand::Heater { duty: 0.5 }];
    assert!(matches!(
        rig.engine.manual_override(&delta, false),
        Err(EngineError::ConflictingState(_))
    ));
    // Explicitly flagged overrides pass through mid-run.
    rig.engine.manual_override(&delta, true).unwrap();
    assert_eq!(rig.engine.context().psm.snapshot().heater_duty, 0.5);

    rig.engine.wait_settled(Duration::from_secs(10));
    // Settled back at INITIAL, overrides no longer need the flag.
    rig.engine.manual_override(&delta, false).unwrap();
    assert_eq!(rig.engine.context().psm.snapshot().heater_duty, 0.5);
}
