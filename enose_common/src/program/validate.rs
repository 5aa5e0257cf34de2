//! Deterministic program validator.
//!
//! Runs before any execution and returns two lists: errors block
//! execution, warnings allow it. Validation is pure — the same program
//! always produces the same report.

use std::collections::{HashMap, HashSet};

use crate::consts::{MAX_LOOP_COUNT, MAX_NESTING_DEPTH, RATIO_SUM_TOLERANCE};
use crate::program::{PhaseEdge, Program, Step, StepKind};

/// One validator finding, tied to a step where possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Id of the offending step, if the issue is step-scoped.
    pub step_id: Option<String>,
    /// What is wrong.
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(id) => write!(f, "[{id}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Errors and warnings produced by a validation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    /// Block execution.
    pub errors: Vec<ValidationIssue>,
    /// Allow execution.
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// True when the program may execute.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, step_id: Option<&str>, message: impl Into<String>) {
        self.errors.push(ValidationIssue {
            step_id: step_id.map(str::to_string),
            message: message.into(),
        });
    }

    fn warn(&mut self, step_id: Option<&str>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue {
            step_id: step_id.map(str::to_string),
            message: message.into(),
        });
    }
}

/// Validate a program. Pure; touches no hardware and no clock.
pub fn validate(program: &Program) -> ValidationReport {
    let mut report = ValidationReport::default();

    // Liquid binding table.
    let mut liquid_pumps: HashMap<&str, u8> = HashMap::new();
    for binding in &program.liquids {
        if usize::from(binding.pump) >= crate::consts::PUMP_COUNT {
            report.error(
                None,
                format!(
                    "liquid '{}' bound to pump {} (valid range 0..{})",
                    binding.id,
                    binding.pump,
                    crate::consts::PUMP_COUNT
                ),
            );
        }
        if liquid_pumps.insert(&binding.id, binding.pump).is_some() {
            report.error(None, format!("liquid '{}' bound twice", binding.id));
        }
    }

    if program.preamble.max_fill_ml <= 0.0 {
        report.error(None, "preamble.max_fill_ml must be > 0");
    }
    if program.preamble.max_fill_ml > program.preamble.bottle_capacity_ml {
        report.error(
            None,
            format!(
                "preamble.max_fill_ml {} exceeds bottle capacity {}",
                program.preamble.max_fill_ml, program.preamble.bottle_capacity_ml
            ),
        );
    }

    if program.steps.is_empty() {
        report.warn(None, "program has no steps");
    }

    let mut ctx = WalkContext {
        report: &mut report,
        liquid_pumps: &liquid_pumps,
        max_fill_ml: program.preamble.max_fill_ml,
        seen_ids: HashSet::new(),
        open_phases: Vec::new(),
        referenced_liquids: HashSet::new(),
    };
    walk(&program.steps, 1, &mut ctx);

    for name in &ctx.open_phases {
        let name = name.clone();
        ctx.report
            .error(None, format!("phase '{name}' started but never ended"));
    }

    let referenced = std::mem::take(&mut ctx.referenced_liquids);
    for binding in &program.liquids {
        if !referenced.contains(binding.id.as_str()) {
            report.warn(None, format!("liquid '{}' is bound but never used", binding.id));
        }
    }

    report
}

struct WalkContext<'a> {
    report: &'a mut ValidationReport,
    liquid_pumps: &'a HashMap<&'a str, u8>,
    max_fill_ml: f64,
    seen_ids: HashSet<String>,
    open_phases: Vec<String>,
    referenced_liquids: HashSet<String>,
}

fn walk(steps: &[Step], depth: usize, ctx: &mut WalkContext<'_>) {
    if depth > MAX_NESTING_DEPTH {
        ctx.report.error(
            steps.first().map(|s| s.id.as_str()),
            format!("nesting depth exceeds {MAX_NESTING_DEPTH}"),
        );
        return;
    }

    for step in steps {
        if !ctx.seen_ids.insert(step.id.clone()) {
            ctx.report
                .error(Some(&step.id), "duplicate step id".to_string());
        }
        if step.name.is_empty() {
            ctx.report.warn(Some(&step.id), "step has no name");
        }

        match &step.kind {
            StepKind::Inject(inj) => check_inject(step, inj, ctx),
            StepKind::Drain(d) => {
                if d.timeout_s <= 0.0 {
                    ctx.report.error(Some(&step.id), "drain timeout must be > 0");
                }
            }
            StepKind::Wash(w) => {
                if w.repeat_count < 1 {
                    ctx.report
                        .error(Some(&step.id), "wash repeat_count must be >= 1");
                }
                if w.target_weight_g <= 0.0 {
                    ctx.report
                        .error(Some(&step.id), "wash target_weight_g must be > 0");
                }
                if w.drain_timeout_s <= 0.0 || w.fill_timeout_s <= 0.0 {
                    ctx.report
                        .error(Some(&step.id), "wash timeouts must be > 0");
                }
            }
            StepKind::Acquire(a) => {
                if !(0.0..=100.0).contains(&a.gas_pwm_percent) {
                    ctx.report.error(
                        Some(&step.id),
                        format!("gas_pwm_percent {} out of [0, 100]", a.gas_pwm_percent),
                    );
                }
                if a.max_duration_s <= 0.0 {
                    ctx.report
                        .error(Some(&step.id), "max_duration_s must be > 0");
                }
                check_wait_condition(step, &a.until, ctx);
            }
            StepKind::Wait(w) => {
                check_wait_condition(step, &w.until, ctx);
                if let Some(max) = w.max_duration_s {
                    if max <= 0.0 {
                        ctx.report
                            .error(Some(&step.id), "max_duration_s must be > 0");
                    }
                }
            }
            StepKind::SetGasPump(g) => {
                if !(0.0..=100.0).contains(&g.percent) {
                    ctx.report.error(
                        Some(&step.id),
                        format!("gas pump percent {} out of [0, 100]", g.percent),
                    );
                }
            }
            StepKind::SetState(_) => {}
            StepKind::PhaseMarker(m) => match m.edge {
                PhaseEdge::Start => {
                    if ctx.open_phases.iter().any(|p| p == &m.name) {
                        ctx.report.error(
                            Some(&step.id),
                            format!("phase '{}' started twice without an end", m.name),
                        );
                    } else {
                        ctx.open_phases.push(m.name.clone());
                    }
                }
                PhaseEdge::End => {
                    if let Some(pos) = ctx.open_phases.iter().position(|p| p == &m.name) {
                        ctx.open_phases.remove(pos);
                    } else {
                        ctx.report.error(
                            Some(&step.id),
                            format!("phase '{}' ended without a start", m.name),
                        );
                    }
                }
            },
            StepKind::Loop(l) => {
                if l.count < 1 {
                    ctx.report.error(Some(&step.id), "loop count must be >= 1");
                } else if l.count > MAX_LOOP_COUNT {
                    ctx.report.error(
                        Some(&step.id),
                        format!("loop count {} exceeds {MAX_LOOP_COUNT}", l.count),
                    );
                }
                walk(&l.body, depth + 1, ctx);
            }
            StepKind::ParamSweep(sw) => {
                if sw.points.is_empty() {
                    ctx.report
                        .error(Some(&step.id), "param sweep has no points");
                }
                walk(&sw.body, depth + 1, ctx);
            }
        }
    }
}

fn check_inject(step: &Step, inj: &crate::program::InjectStep, ctx: &mut WalkContext<'_>) {
    if inj.components.is_empty() {
        ctx.report
            .error(Some(&step.id), "inject has no components");
        return;
    }
    if inj.total_volume_ml <= 0.0 {
        ctx.report
            .error(Some(&step.id), "inject total volume must be > 0");
    }
    if inj.total_volume_ml > ctx.max_fill_ml {
        ctx.report.error(
            Some(&step.id),
            format!(
                "inject volume {} exceeds max_fill_ml {}",
                inj.total_volume_ml, ctx.max_fill_ml
            ),
        );
    } else if inj.total_volume_ml > 0.8 * ctx.max_fill_ml {
        ctx.report.warn(
            Some(&step.id),
            format!(
                "inject volume {} is close to max_fill_ml {}",
                inj.total_volume_ml, ctx.max_fill_ml
            ),
        );
    }

    let ratio_sum: f64 = inj.components.iter().map(|c| c.ratio).sum();
    if (ratio_sum - 1.0).abs() > RATIO_SUM_TOLERANCE {
        ctx.report.error(
            Some(&step.id),
            format!("ratios must sum to 1 (got {ratio_sum})"),
        );
    }

    for c in &inj.components {
        ctx.referenced_liquids.insert(c.liquid.clone());
        if !ctx.liquid_pumps.contains_key(c.liquid.as_str()) {
            ctx.report.error(
                Some(&step.id),
                format!("liquid '{}' is not bound to a pump", c.liquid),
            );
        }
        if c.ratio <= 0.0 {
            ctx.report.error(
                Some(&step.id),
                format!("component '{}' ratio must be > 0", c.liquid),
            );
        }
    }

    if let Some(speed) = inj.speed_mm_s {
        if speed <= 0.0 {
            ctx.report
                .error(Some(&step.id), "inject speed must be > 0");
        }
    }
    if let Some(accel) = inj.accel_mm_s2 {
        if accel <= 0.0 {
            ctx.report
                .error(Some(&step.id), "inject acceleration must be > 0");
        }
    }
}

fn check_wait_condition(
    step: &Step,
    cond: &crate::program::WaitCondition,
    ctx: &mut WalkContext<'_>,
) {
    use crate::program::WaitCondition::*;
    match cond {
        Duration { seconds } => {
            if *seconds <= 0.0 {
                ctx.report
                    .error(Some(&step.id), "wait duration must be > 0");
            } else if *seconds > 3_600.0 {
                ctx.report
                    .warn(Some(&step.id), "wait duration exceeds one hour");
            }
        }
        HeaterCycles { count } => {
            if *count == 0 {
                ctx.report
                    .error(Some(&step.id), "heater cycle count must be >= 1");
            }
        }
        Stability { pct, window_s } => {
            if *pct <= 0.0 || *pct >= 100.0 {
                ctx.report
                    .error(Some(&step.id), "stability pct must be in (0, 100)");
            }
            if *window_s <= 0.0 {
                ctx.report
                    .error(Some(&step.id), "stability window must be > 0");
            }
        }
    }
}
