//! Hardware and engine constants.

/// Number of peristaltic pumps on the pump bank.
pub const PUMP_COUNT: usize = 8;

/// Number of on/off and pinch valves.
pub const VALVE_COUNT: usize = 4;

/// Default load-cell sampling period (10 Hz).
pub const LOAD_CELL_PERIOD_MS: u64 = 100;

/// Maximum blocking interval between cancellation polls.
pub const CANCEL_POLL_MS: u64 = 100;

/// Maximum nesting depth of Loop/ParamSweep containers.
pub const MAX_NESTING_DEPTH: usize = 8;

/// Maximum allowed Loop repetition count.
pub const MAX_LOOP_COUNT: u32 = 1_000;

/// Tolerance for the sum of injection component ratios.
pub const RATIO_SUM_TOLERANCE: f64 = 0.01;

/// Maximum rows per weight-sample batch insert.
pub const WEIGHT_BATCH_MAX_ROWS: usize = 1_000;

/// Cap for the recorder's exponential retry backoff [s].
pub const RECORDER_BACKOFF_CAP_S: u64 = 30;

/// Capacity of the load-cell ring window (samples).
///
/// The configured stability window must fit: window / period <= this.
pub const WINDOW_CAPACITY: usize = 256;

/// Default motion-controller acknowledgement window [ms].
pub const MOTION_ACK_TIMEOUT_MS: u64 = 2_000;
