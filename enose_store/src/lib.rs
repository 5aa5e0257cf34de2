//! Result store interface and buffered recorder.
//!
//! The time-series database sits behind [`ResultStore`]: append-only
//! inserts for runs, per-cycle test results and weight-sample batches,
//! plus the read queries external surfaces use. [`MemoryStore`] is the
//! in-process backend used by tests and dry runs.
//!
//! [`recorder::Recorder`] buffers appends in a bounded in-memory queue
//! and drains them on a worker thread, so persistence failures never
//! propagate into the experiment runner.

mod memory;
pub mod recorder;

pub use memory::MemoryStore;
pub use recorder::{Recorder, RecorderConfig};

use thiserror::Error;

use enose_common::records::{RunId, RunRecord, RunState, TestResult, WeightSample};

/// Error types for store operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The backing store cannot be reached; retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A query failed for a non-transient reason.
    #[error("query failed: {0}")]
    Query(String),
}

/// Append-only persistence for runs, results and weight samples.
///
/// Implementations must be safe to call from the recorder worker and the
/// engine simultaneously. Appends are idempotent per primary key so the
/// recorder can retry after a transient failure.
pub trait ResultStore: Send + Sync {
    /// Insert or replace a run row by id.
    fn upsert_run(&self, run: &RunRecord) -> Result<(), StoreError>;

    /// Append one test result.
    fn insert_test_result(&self, result: &TestResult) -> Result<(), StoreError>;

    /// Append a batch of weight samples (multi-row insert).
    fn insert_weight_samples(&self, batch: &[WeightSample]) -> Result<(), StoreError>;

    /// Most recent runs, newest first.
    fn list_recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;

    /// One run by id.
    fn fetch_run(&self, id: &RunId) -> Result<Option<RunRecord>, StoreError>;

    /// All runs currently in the given state.
    fn runs_in_state(&self, state: RunState) -> Result<Vec<RunRecord>, StoreError>;

    /// Test results for a run, in append order.
    fn results_for_run(&self, id: &RunId) -> Result<Vec<TestResult>, StoreError>;

    /// Weight samples for a run within `[from_ms, to_ms]`.
    fn weight_samples_between(
        &self,
        id: &RunId,
        from_ms: u64,
        to_ms: u64,
    ) -> Result<Vec<WeightSample>, StoreError>;

    /// Small key-value side table (consumable snapshots and the like).
    fn put_kv(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Read back a key-value entry.
    fn get_kv(&self, key: &str) -> Result<Option<String>, StoreError>;
}
