//! Acquire/Wait termination against the simulated sensor stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use enose_common::config::EnoseConfig;
use enose_common::program::{
    LiquidBinding, Preamble, Program, Step, StepKind, WaitCondition, WaitStep,
};
use enose_engine::runner::EngineState;
use enose_engine::{ControllerContext, ExperimentEngine};
use enose_hal::motion::SimMotionPort;
use enose_hal::sensor::{SensorEvent, SensorReading, SimSensorHandle, SimSensorPort};
use enose_store::MemoryStore;

struct SensorRig {
    engine: Arc<ExperimentEngine>,
    primary: SimSensorHandle,
}

fn build_rig() -> SensorRig {
    let (motion_port, _motion_handle) = SimMotionPort::healthy();
    let (s0, h0) = SimSensorPort::healthy("sim0");
    let (s1, _h1) = SimSensorPort::healthy("sim1");
    let ctx = ControllerContext::assemble(
        EnoseConfig::for_testing(),
        Box::new(motion_port),
        None,
        Some((Box::new(s0), Box::new(s1))),
        Arc::new(MemoryStore::new()),
    );
    SensorRig {
        engine: Arc::new(ExperimentEngine::new(ctx)),
        primary: h0,
    }
}

fn reading(t_us: u64, value: f64, heater_step: u32) -> SensorEvent {
    SensorEvent::Data(SensorReading {
        t_us,
        idx: 0,
        value,
        heater_step,
        humidity: None,
        temp_c: None,
    })
}

fn wait_program(until: WaitCondition, max_duration_s: f64) -> Program {
    Program {
        preamble: Preamble::default(),
        liquids: vec![LiquidBinding {
            id: "etoh".to_string(),
            pump: 0,
        }],
        steps: vec![Step {
            id: "w".to_string(),
            name: "sensor wait".to_string(),
            comment: None,
            kind: StepKind::Wait(WaitStep {
                until,
                max_duration_s: Some(max_duration_s),
            }),
        }],
    }
}

/// Push a stream of events on a background thread until the flag drops.
fn pump_events(
    handle: SimSensorHandle,
    period: Duration,
    mut produce: impl FnMut(u64) -> SensorEvent + Send + 'static,
) -> (Arc<std::sync::atomic::AtomicBool>, std::thread::JoinHandle<()>) {
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let stop2 = stop.clone();
    let h = std::thread::spawn(move || {
        let mut n = 0u64;
        while !stop2.load(std::sync::atomic::Ordering::Acquire) {
            handle.push_event(produce(n));
            n += 1;
            std::thread::sleep(period);
        }
    });
    (stop, h)
}

#[test]
fn heater_cycles_wait_counts_transitions() {
    let rig = build_rig();
    // Heater steps cycle 0,1,2,3 every four events; the first return to
    // zero primes, the next two complete the wait.
    let (stop, pump) = pump_events(
        rig.primary.clone(),
        Duration::from_millis(15),
        |n| reading(n, 5.0, (n % 4) as u32),
    );

    rig.engine
        .load(wait_program(WaitCondition::HeaterCycles { count: 2 }, 20.0))
        .unwrap();
    let started = Instant::now();
    rig.engine.start().unwrap();
    let settled = rig.engine.wait_settled(Duration::from_secs(30));

    stop.store(true, std::sync::atomic::Ordering::Release);
    let _ = pump.join();

    assert_eq!(settled, EngineState::Completed);
    // Three zero-transitions at 4 events each, well under the bound.
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn stability_wait_settles_on_flat_signal() {
    let rig = build_rig();
    // Noisy for the first 20 events, then flat at 100.
    let (stop, pump) = pump_events(
        rig.primary.clone(),
        Duration::from_millis(15),
        |n| {
            let value = if n < 20 {
                100.0 + (n % 5) as f64 * 8.0
            } else {
                100.0
            };
            reading(n, value, 1)
        },
    );

    rig.engine
        .load(wait_program(
            WaitCondition::Stability {
                pct: 2.0,
                window_s: 0.3,
            },
            20.0,
        ))
        .unwrap();
    let started = Instant::now();
    rig.engine.start().unwrap();
    let settled = rig.engine.wait_settled(Duration::from_secs(30));

    stop.store(true, std::sync::atomic::Ordering::Release);
    let _ = pump.join();

    assert_eq!(settled, EngineState::Completed);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn silent_sensor_falls_back_to_duration_bound() {
    let rig = build_rig();
    rig.engine
        .load(wait_program(
            WaitCondition::Stability {
                pct: 2.0,
                window_s: 0.2,
            },
            0.5,
        ))
        .unwrap();
    let started = Instant::now();
    rig.engine.start().unwrap();
    let settled = rig.engine.wait_settled(Duration::from_secs(30));

    assert_eq!(settled, EngineState::Completed);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(450), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5));
}
