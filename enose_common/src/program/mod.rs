//! Experiment program model.
//!
//! A [`Program`] is an immutable ordered sequence of [`Step`]s plus a
//! preamble of hardware-configuration values. Programs are constructed
//! either from their TOML textual form ([`Program::from_toml`]) or
//! directly from the structured form; the [`validate`](crate::program::validate)
//! pass runs before any execution.
//!
//! Loop and ParamSweep containers nest recursively (depth capped by the
//! validator). [`FlattenWalker`] expands containers into a deterministic
//! sequence of leaf steps at the moment each container is entered, binding
//! sweep parameters at that moment.

mod validate;

pub use validate::{validate, ValidationIssue, ValidationReport};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::peripheral::NamedState;

// ─── Step Types ────────────────────────────────────────────────────

/// Identity and annotation common to every step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepMeta {
    /// Stable identifier, unique within the program.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Optional free-form comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// One liquid component of an injection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Component {
    /// Liquid id, resolved through the program's binding table.
    pub liquid: String,
    /// Fraction of the total volume, components must sum to 1.
    pub ratio: f64,
}

/// Inject a liquid sample of specified composition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InjectStep {
    /// Total volume to inject [ml].
    pub total_volume_ml: f64,
    /// Composition; ratios sum to 1.
    pub components: Vec<Component>,
    /// Pump speed [mm/s]; instrument default when omitted.
    #[serde(default)]
    pub speed_mm_s: Option<f64>,
    /// Pump acceleration [mm/s²]; instrument default when omitted.
    #[serde(default)]
    pub accel_mm_s2: Option<f64>,
    /// Stop when filtered weight is within this of the target [g].
    #[serde(default = "default_inject_tolerance")]
    pub tolerance_g: f64,
    /// Give up waiting for the weight target after this long [s].
    #[serde(default)]
    pub stable_timeout_s: Option<f64>,
}

fn default_inject_tolerance() -> f64 {
    0.05
}

/// Drain the chamber until the bottle reads empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DrainStep {
    /// Give up after this long [s].
    pub timeout_s: f64,
    /// Stability tolerance around the empty baseline [g].
    #[serde(default = "default_drain_tolerance")]
    pub tolerance_g: f64,
    /// Stability window [s]; instrument default when omitted.
    #[serde(default)]
    pub stability_window_s: Option<f64>,
}

fn default_drain_tolerance() -> f64 {
    1.0
}

/// Repeated drain → fill → drain cleaning cycles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WashStep {
    /// Number of cycles, ≥ 1.
    pub repeat_count: u32,
    /// Fill phase ends once weight has risen by this much [g].
    pub target_weight_g: f64,
    /// Empty-bottle wait timeout per drain phase [s].
    pub drain_timeout_s: f64,
    /// Fill phase timeout [s].
    pub fill_timeout_s: f64,
    /// Stability tolerance for the drain phases [g].
    #[serde(default = "default_drain_tolerance")]
    pub tolerance_g: f64,
}

/// Termination condition for Acquire and Wait steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WaitCondition {
    /// Simple elapsed-time wait.
    Duration {
        /// Seconds to wait.
        seconds: f64,
    },
    /// Wait for N completed sensor heater cycles.
    HeaterCycles {
        /// Cycles to count.
        count: u32,
    },
    /// Wait until sensor primary values settle.
    Stability {
        /// Peak-to-peak variation threshold [% of mean].
        pct: f64,
        /// Observation window [s].
        window_s: f64,
    },
}

/// Drive gas through the sensor array and wait out the acquisition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AcquireStep {
    /// Gas-pump PWM in [0, 100].
    pub gas_pwm_percent: f64,
    /// Termination condition.
    pub until: WaitCondition,
    /// Hard bound on the wait [s].
    pub max_duration_s: f64,
}

/// Wait between steps without changing peripheral state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WaitStep {
    /// Termination condition.
    pub until: WaitCondition,
    /// Hard bound on the wait [s]; for `Duration` the duration itself.
    #[serde(default)]
    pub max_duration_s: Option<f64>,
}

/// Transition to a named state with no wait and no guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SetStateStep {
    /// Target named state.
    pub target: NamedState,
}

/// Write the air-pump PWM without changing the named-state label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SetGasPumpStep {
    /// PWM in [0, 100].
    pub percent: f64,
}

/// Which end of a phase a marker denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseEdge {
    /// Phase begins.
    Start,
    /// Phase ends.
    End,
}

/// Pure annotation delimiting a labeled span within the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhaseMarkerStep {
    /// Start or end.
    pub edge: PhaseEdge,
    /// Phase label.
    pub name: String,
}

/// Repeat a body a fixed number of times.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoopStep {
    /// Repetition count, 1..=1000.
    pub count: u32,
    /// Nested steps.
    pub body: Vec<Step>,
}

/// Parameter axis a sweep varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepAxis {
    /// Inject total volume [ml].
    InjectVolume,
    /// Inject pump speed [mm/s].
    InjectSpeed,
    /// Gas-pump PWM [%], applied to Acquire and SetGasPump.
    GasPwm,
}

impl SweepAxis {
    /// Label used in parameter-set names.
    pub const fn as_str(self) -> &'static str {
        match self {
            SweepAxis::InjectVolume => "volume",
            SweepAxis::InjectSpeed => "speed",
            SweepAxis::GasPwm => "gas_pwm",
        }
    }
}

/// Run a body once per point of a parameter axis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SweepStep {
    /// The varied parameter.
    pub axis: SweepAxis,
    /// Points, in execution order.
    pub points: Vec<f64>,
    /// Nested steps, re-run per point with the axis value bound.
    pub body: Vec<Step>,
}

/// The step sum type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Liquid injection with weight feedback.
    Inject(InjectStep),
    /// Drain to empty.
    Drain(DrainStep),
    /// Cleaning cycles.
    Wash(WashStep),
    /// Sensor acquisition.
    Acquire(AcquireStep),
    /// Bare wait.
    Wait(WaitStep),
    /// Named-state transition.
    SetState(SetStateStep),
    /// Air-pump PWM write.
    SetGasPump(SetGasPumpStep),
    /// Phase annotation.
    PhaseMarker(PhaseMarkerStep),
    /// Fixed repetition container.
    Loop(LoopStep),
    /// Parameter sweep container.
    ParamSweep(SweepStep),
}

impl StepKind {
    /// True for Loop and ParamSweep.
    pub const fn is_container(&self) -> bool {
        matches!(self, StepKind::Loop(_) | StepKind::ParamSweep(_))
    }

    /// Executor name for dispatch and logging.
    pub const fn name(&self) -> &'static str {
        match self {
            StepKind::Inject(_) => "inject",
            StepKind::Drain(_) => "drain",
            StepKind::Wash(_) => "wash",
            StepKind::Acquire(_) => "acquire",
            StepKind::Wait(_) => "wait",
            StepKind::SetState(_) => "set_state",
            StepKind::SetGasPump(_) => "set_gas_pump",
            StepKind::PhaseMarker(_) => "phase_marker",
            StepKind::Loop(_) => "loop",
            StepKind::ParamSweep(_) => "param_sweep",
        }
    }
}

/// One program step: identity plus kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Stable identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Optional comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// What the step does.
    pub kind: StepKind,
}

impl Step {
    /// Identity/annotation view of this step.
    pub fn meta(&self) -> StepMeta {
        StepMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            comment: self.comment.clone(),
        }
    }
}

// ─── Program ───────────────────────────────────────────────────────

/// Hardware-configuration values carried by the program itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Preamble {
    /// Bottle capacity [ml].
    pub bottle_capacity_ml: f64,
    /// Maximum permitted injection volume [ml].
    pub max_fill_ml: f64,
    /// Default timeout for steps that omit their own [s].
    pub default_timeout_s: f64,
}

impl Default for Preamble {
    fn default() -> Self {
        Self {
            bottle_capacity_ml: 50.0,
            max_fill_ml: 20.0,
            default_timeout_s: 60.0,
        }
    }
}

/// Binding of a liquid id to the pump that doses it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LiquidBinding {
    /// Liquid id as referenced by Inject components.
    pub id: String,
    /// Pump index 0..7.
    pub pump: u8,
}

/// An experiment program. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Program {
    /// Hardware-configuration preamble.
    #[serde(default)]
    pub preamble: Preamble,
    /// Liquid → pump binding table.
    #[serde(default)]
    pub liquids: Vec<LiquidBinding>,
    /// Ordered steps.
    pub steps: Vec<Step>,
}

impl Program {
    /// Parse the textual form.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| {
            let msg = e.to_string();
            if msg.contains("unknown field") {
                ConfigError::UnknownField(msg)
            } else {
                ConfigError::ParseError(msg)
            }
        })
    }

    /// Serialize back to the textual form.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Number of leaf steps the program flattens to.
    pub fn leaf_count(&self) -> u32 {
        fn count(steps: &[Step]) -> u64 {
            steps
                .iter()
                .map(|s| match &s.kind {
                    StepKind::Loop(l) => u64::from(l.count) * count(&l.body),
                    StepKind::ParamSweep(sw) => sw.points.len() as u64 * count(&sw.body),
                    _ => 1,
                })
                .sum()
        }
        count(&self.steps).min(u64::from(u32::MAX)) as u32
    }
}

// ─── Flattening ────────────────────────────────────────────────────

/// A leaf step with its sweep parameters bound.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStep {
    /// The step, guaranteed non-container, with sweep values substituted.
    pub step: Step,
    /// Parameter-set id; 0 outside any sweep.
    pub param_set_id: u32,
    /// Parameter-set name, e.g. `volume=4.0`; empty outside sweeps.
    pub param_set_name: String,
}

enum Frame {
    /// Plain sequence of (possibly bound) steps.
    Seq { steps: Vec<Step>, idx: usize },
    /// Install a parameter set when reached.
    SetParams { id: u32, name: String },
}

/// Expands containers into leaf steps, one container at a time as it is
/// entered. Iteration order is the program's deterministic execution
/// order.
pub struct FlattenWalker {
    frames: Vec<Frame>,
    param_counter: u32,
    cur_param_id: u32,
    cur_param_name: String,
}

impl FlattenWalker {
    /// Walk the given program from the top.
    pub fn new(program: &Program) -> Self {
        Self {
            frames: vec![Frame::Seq {
                steps: program.steps.clone(),
                idx: 0,
            }],
            param_counter: 0,
            cur_param_id: 0,
            cur_param_name: String::new(),
        }
    }
}

impl Iterator for FlattenWalker {
    type Item = BoundStep;

    fn next(&mut self) -> Option<BoundStep> {
        loop {
            let top = self.frames.last_mut()?;
            let step = match top {
                Frame::SetParams { id, name } => {
                    self.cur_param_id = *id;
                    self.cur_param_name = std::mem::take(name);
                    self.frames.pop();
                    continue;
                }
                Frame::Seq { steps, idx } => {
                    if *idx >= steps.len() {
                        self.frames.pop();
                        continue;
                    }
                    let s = steps[*idx].clone();
                    *idx += 1;
                    s
                }
            };

            match step.kind {
                StepKind::Loop(l) => {
                    // Entered now: materialize count copies of the body.
                    let mut repeated = Vec::with_capacity(l.body.len() * l.count as usize);
                    for _ in 0..l.count {
                        repeated.extend(l.body.iter().cloned());
                    }
                    self.frames.push(Frame::Seq {
                        steps: repeated,
                        idx: 0,
                    });
                }
                StepKind::ParamSweep(sw) => {
                    // Entered now: bind each point into its own body copy.
                    // Frames are a stack, so push the restore frame first,
                    // then the points in reverse order, each preceded (on
                    // top) by its parameter-set installer.
                    self.frames.push(Frame::SetParams {
                        id: self.cur_param_id,
                        name: self.cur_param_name.clone(),
                    });
                    let base = self.param_counter;
                    self.param_counter += sw.points.len() as u32;
                    for (i, point) in sw.points.iter().enumerate().rev() {
                        let bound: Vec<Step> = sw
                            .body
                            .iter()
                            .map(|s| bind_axis(s, sw.axis, *point))
                            .collect();
                        self.frames.push(Frame::Seq {
                            steps: bound,
                            idx: 0,
                        });
                        self.frames.push(Frame::SetParams {
                            id: base + i as u32 + 1,
                            name: format!("{}={}", sw.axis.as_str(), point),
                        });
                    }
                }
                _ => {
                    return Some(BoundStep {
                        step,
                        param_set_id: self.cur_param_id,
                        param_set_name: self.cur_param_name.clone(),
                    });
                }
            }
        }
    }
}

/// Substitute a sweep axis value into a step, recursing into containers.
fn bind_axis(step: &Step, axis: SweepAxis, value: f64) -> Step {
    let mut out = step.clone();
    match (&mut out.kind, axis) {
        (StepKind::Inject(i), SweepAxis::InjectVolume) => i.total_volume_ml = value,
        (StepKind::Inject(i), SweepAxis::InjectSpeed) => i.speed_mm_s = Some(value),
        (StepKind::Acquire(a), SweepAxis::GasPwm) => a.gas_pwm_percent = value,
        (StepKind::SetGasPump(g), SweepAxis::GasPwm) => g.percent = value,
        (StepKind::Loop(l), _) => {
            l.body = l.body.iter().map(|s| bind_axis(s, axis, value)).collect();
        }
        (StepKind::ParamSweep(sw), _) => {
            sw.body = sw.body.iter().map(|s| bind_axis(s, axis, value)).collect();
        }
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str, kind: StepKind) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            comment: None,
            kind,
        }
    }

    fn wait_s(id: &str, seconds: f64) -> Step {
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
            liquids: vec![LiquidBinding {
                id: "etoh".to_string(),
                pump: 2,
            }],
            steps,
        }
    }

    #[test]
    fn leaf_count_multiplies_containers() {
        let p = program(vec![
            wait_s("a", 1.0),
            leaf(
                "l",
                StepKind::Loop(LoopStep {
                    count: 3,
                    body: vec![wait_s("b", 1.0), wait_s("c", 1.0)],
                }),
            ),
            leaf(
                "sw",
                StepKind::ParamSweep(SweepStep {
                    axis: SweepAxis::GasPwm,
                    points: vec![10.0, 20.0],
                    body: vec![wait_s("d", 1.0)],
                }),
            ),
        ]);
        assert_eq!(p.leaf_count(), 1 + 3 * 2 + 2);
    }

    #[test]
    fn flatten_preserves_program_order() {
        let p = program(vec![
            wait_s("a", 1.0),
            leaf(
                "l",
                StepKind::Loop(LoopStep {
                    count: 2,
                    body: vec![wait_s("b", 1.0)],
                }),
            ),
            wait_s("c", 1.0),
        ]);
        let ids: Vec<String> = FlattenWalker::new(&p).map(|b| b.step.id).collect();
        assert_eq!(ids, ["a", "b", "b", "c"]);
        assert_eq!(p.leaf_count() as usize, ids.len());
    }

    #[test]
    fn sweep_binds_axis_per_point() {
        let p = program(vec![leaf(
            "sw",
            StepKind::ParamSweep(SweepStep {
                axis: SweepAxis::InjectVolume,
                points: vec![2.0, 4.0],
                body: vec![leaf(
                    "i",
                    StepKind::Inject(InjectStep {
                        total_volume_ml: 0.0,
                        components: vec![Component {
                            liquid: "etoh".to_string(),
                            ratio: 1.0,
                        }],
                        speed_mm_s: None,
                        accel_mm_s2: None,
                        tolerance_g: 0.05,
                        stable_timeout_s: None,
                    }),
                )],
            }),
        )]);

        let bound: Vec<BoundStep> = FlattenWalker::new(&p).collect();
        assert_eq!(bound.len(), 2);
        let volumes: Vec<f64> = bound
            .iter()
            .map(|b| match &b.step.kind {
                StepKind::Inject(i) => i.total_volume_ml,
                _ => panic!("expected inject"),
            })
            .collect();
        assert_eq!(volumes, [2.0, 4.0]);
        assert_eq!(bound[0].param_set_name, "volume=2");
        assert_eq!(bound[1].param_set_name, "volume=4");
        assert_ne!(bound[0].param_set_id, bound[1].param_set_id);
    }

    #[test]
    fn params_restored_after_sweep() {
        let p = program(vec![
            leaf(
                "sw",
                StepKind::ParamSweep(SweepStep {
                    axis: SweepAxis::GasPwm,
                    points: vec![50.0],
                    body: vec![wait_s("in", 1.0)],
                }),
            ),
            wait_s("after", 1.0),
        ]);
        let bound: Vec<BoundStep> = FlattenWalker::new(&p).collect();
        assert_eq!(bound[0].param_set_id, 1);
        assert_eq!(bound[1].param_set_id, 0);
        assert!(bound[1].param_set_name.is_empty());
    }

    #[test]
    fn nested_sweep_inner_binding_wins() {
        let inner = leaf(
            "sw_in",
            StepKind::ParamSweep(SweepStep {
                axis: SweepAxis::GasPwm,
                points: vec![30.0],
                body: vec![leaf(
                    "g",
                    StepKind::SetGasPump(SetGasPumpStep { percent: 0.0 }),
                )],
            }),
        );
        let p = program(vec![leaf(
            "sw_out",
            StepKind::ParamSweep(SweepStep {
                axis: SweepAxis::GasPwm,
                points: vec![80.0],
                body: vec![inner],
            }),
        )]);
        let bound: Vec<BoundStep> = FlattenWalker::new(&p).collect();
        assert_eq!(bound.len(), 1);
        match &bound[0].step.kind {
            StepKind::SetGasPump(g) => assert_eq!(g.percent, 30.0),
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(bound[0].param_set_name, "gas_pwm=30");
    }

    #[test]
    fn toml_round_trip() {
        let p = program(vec![
            leaf(
                "d1",
                StepKind::Drain(DrainStep {
                    timeout_s: 10.0,
                    tolerance_g: 1.0,
                    stability_window_s: None,
                }),
            ),
            leaf(
                "acq",
                StepKind::Acquire(AcquireStep {
                    gas_pwm_percent: 50.0,
                    until: WaitCondition::Duration { seconds: 30.0 },
                    max_duration_s: 60.0,
                }),
            ),
        ]);
        let text = p.to_toml().unwrap();
        let back = Program::from_toml(&text).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn textual_form_parses() {
        let text = r#"
[preamble]
bottle_capacity_ml = 50.0
max_fill_ml = 20.0
default_timeout_s = 60.0

[[liquids]]
id = "etoh"
pump = 2

[[steps]]
id = "s1"
name = "pre-drain"

[steps.kind.drain]
timeout_s = 10.0
tolerance_g = 1.0

[[steps]]
id = "s2"
name = "settle"

[steps.kind.wait.until.duration]
seconds = 5.0
"#;
        let p = Program::from_toml(text).unwrap();
        assert_eq!(p.steps.len(), 2);
        assert_eq!(p.steps[0].kind.name(), "drain");
        assert_eq!(p.steps[1].kind.name(), "wait");
        assert_eq!(p.liquids[0].pump, 2);
    }
}
