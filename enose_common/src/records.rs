//! Persistent record types: runs, per-cycle test results, weight samples.
//!
//! `RunRecord` is created at experiment start, mutated only by the runner,
//! and closed on termination. `TestResult` and `WeightSample` entries are
//! append-only once handed to the recorder.

use serde::{Deserialize, Serialize};

use crate::consts::PUMP_COUNT;

/// Opaque run identifier.
pub type RunId = String;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Runner thread is walking the program.
    Running,
    /// Program finished normally.
    Completed,
    /// A step failed; see `RunRecord::error`.
    Error,
    /// Terminated by an abort command.
    Aborted,
}

impl RunState {
    /// True once the run can no longer change.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running)
    }
}

/// One execution of a loaded program end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Opaque run id.
    pub id: RunId,
    /// Creation time [ms since epoch].
    pub created_at_ms: u64,
    /// Completion time, set when the run reaches a terminal state.
    pub completed_at_ms: Option<u64>,
    /// Lifecycle state.
    pub state: RunState,
    /// Serialized program configuration as loaded.
    pub program_config: String,
    /// Index of the current leaf step.
    pub current_step: u32,
    /// Total leaf step count after flattening.
    pub total_steps: u32,
    /// Failure reason when `state == Error`.
    pub error: Option<String>,
}

impl RunRecord {
    /// New record in the `Running` state.
    pub fn started(id: RunId, created_at_ms: u64, program_config: String, total_steps: u32) -> Self {
        Self {
            id,
            created_at_ms,
            completed_at_ms: None,
            state: RunState::Running,
            program_config,
            current_step: 0,
            total_steps,
            error: None,
        }
    }
}

/// Result of one inject+acquire cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Owning run.
    pub run_id: RunId,
    /// Parameter-set id (sweep point index, 0 outside sweeps).
    pub param_set_id: u32,
    /// Parameter-set display name.
    pub param_set_name: String,
    /// Cycle index within the run.
    pub cycle_index: u32,
    /// Volume actually commanded per pump [ml].
    pub pump_volumes_ml: [f64; PUMP_COUNT],
    /// Commanded pump speed [mm/s].
    pub speed_mm_s: f64,
    /// Chamber weight before injection [g].
    pub empty_weight_g: f64,
    /// Chamber weight after injection [g].
    pub full_weight_g: f64,
    /// `full - empty` [g].
    pub injected_weight_g: f64,
    /// Per-phase durations, in emission order.
    pub phase_durations_ms: Vec<(String, u64)>,
    /// Total cycle duration [ms].
    pub total_ms: u64,
}

impl TestResult {
    /// Empty result shell for a new cycle.
    pub fn new(run_id: RunId, cycle_index: u32) -> Self {
        Self {
            run_id,
            param_set_id: 0,
            param_set_name: String::new(),
            cycle_index,
            pump_volumes_ml: [0.0; PUMP_COUNT],
            speed_mm_s: 0.0,
            empty_weight_g: 0.0,
            full_weight_g: 0.0,
            injected_weight_g: 0.0,
            phase_durations_ms: Vec::new(),
            total_ms: 0,
        }
    }

    /// Add a named phase duration and extend the total.
    pub fn push_phase(&mut self, name: impl Into<String>, ms: u64) {
        self.phase_durations_ms.push((name.into(), ms));
        self.total_ms += ms;
    }
}

/// One filtered weight reading tagged with its run and phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightSample {
    /// Owning run.
    pub run_id: RunId,
    /// Sample time [ms since epoch].
    pub t_ms: u64,
    /// Filtered weight [g].
    pub weight_g: f64,
    /// Phase label active at emission, if any.
    pub phase: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_states_terminal() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Error.is_terminal());
        assert!(RunState::Aborted.is_terminal());
    }

    #[test]
    fn started_record_shape() {
        let r = RunRecord::started("run-1".into(), 123, "cfg".into(), 7);
        assert_eq!(r.state, RunState::Running);
        assert_eq!(r.total_steps, 7);
        assert!(r.completed_at_ms.is_none());
        assert!(r.error.is_none());
    }

    #[test]
    fn test_result_phase_accumulation() {
        let mut t = TestResult::new("run-1".into(), 0);
        t.push_phase("inject", 1_200);
        t.push_phase("acquire", 30_000);
        assert_eq!(t.total_ms, 31_200);
        assert_eq!(t.phase_durations_ms.len(), 2);
        assert_eq!(t.phase_durations_ms[1].0, "acquire");
    }
}
