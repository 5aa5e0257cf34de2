//! In-memory store backend for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use enose_common::records::{RunId, RunRecord, RunState, TestResult, WeightSample};

use crate::{ResultStore, StoreError};

#[derive(Debug, Default)]
struct MemInner {
    runs: Vec<RunRecord>,
    results: Vec<TestResult>,
    samples: Vec<WeightSample>,
    kv: HashMap<String, String>,
}

/// In-process [`ResultStore`] with write-failure injection.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemInner>,
    fail_writes: AtomicU32,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write operations fail as unavailable.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let prev = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .unwrap_or(0);
        if prev > 0 {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    /// Number of stored weight samples.
    pub fn sample_count(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Number of stored test results.
    pub fn result_count(&self) -> usize {
        self.inner.lock().results.len()
    }
}

impl ResultStore for MemoryStore {
    fn upsert_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.check_write()?;
        let mut inner = self.inner.lock();
        match inner.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => inner.runs.push(run.clone()),
        }
        Ok(())
    }

    fn insert_test_result(&self, result: &TestResult) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.lock().results.push(result.clone());
        Ok(())
    }

    fn insert_weight_samples(&self, batch: &[WeightSample]) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.lock().samples.extend_from_slice(batch);
        Ok(())
    }

    fn list_recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.runs.iter().rev().take(limit).cloned().collect())
    }

    fn fetch_run(&self, id: &RunId) -> Result<Option<RunRecord>, StoreError> {
        Ok(self.inner.lock().runs.iter().find(|r| &r.id == id).cloned())
    }

    fn runs_in_state(&self, state: RunState) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .runs
            .iter()
            .filter(|r| r.state == state)
            .cloned()
            .collect())
    }

    fn results_for_run(&self, id: &RunId) -> Result<Vec<TestResult>, StoreError> {
        Ok(self
            .inner
            .lock()
            .results
            .iter()
            .filter(|r| &r.run_id == id)
            .cloned()
            .collect())
    }

    fn weight_samples_between(
        &self,
        id: &RunId,
        from_ms: u64,
        to_ms: u64,
    ) -> Result<Vec<WeightSample>, StoreError> {
        Ok(self
            .inner
            .lock()
            .samples
            .iter()
            .filter(|s| &s.run_id == id && s.t_ms >= from_ms && s.t_ms <= to_ms)
            .cloned()
            .collect())
    }

    fn put_kv(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner
            .lock()
            .kv
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_kv(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().kv.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str, state: RunState) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            created_at_ms: 1,
            completed_at_ms: None,
            state,
            program_config: String::new(),
            current_step: 0,
            total_steps: 0,
            error: None,
        }
    }

    #[test]
    fn upsert_replaces_by_id() {
        let store = MemoryStore::new();
        store.upsert_run(&run("r1", RunState::Running)).unwrap();
        store.upsert_run(&run("r1", RunState::Completed)).unwrap();
        let got = store.fetch_run(&"r1".to_string()).unwrap().unwrap();
        assert_eq!(got.state, RunState::Completed);
        assert_eq!(store.list_recent_runs(10).unwrap().len(), 1);
    }

    #[test]
    fn recent_runs_newest_first() {
        let store = MemoryStore::new();
        store.upsert_run(&run("r1", RunState::Completed)).unwrap();
        store.upsert_run(&run("r2", RunState::Completed)).unwrap();
        let recent = store.list_recent_runs(1).unwrap();
        assert_eq!(recent[0].id, "r2");
    }

    #[test]
    fn sample_time_range_query() {
        let store = MemoryStore::new();
        for t in [10, 20, 30] {
            store
                .insert_weight_samples(&[WeightSample {
                    run_id: "r1".to_string(),
                    t_ms: t,
                    weight_g: t as f64,
                    phase: None,
                }])
                .unwrap();
        }
        let hits = store
            .weight_samples_between(&"r1".to_string(), 15, 25)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].t_ms, 20);
    }

    #[test]
    fn injected_failures_expire() {
        let store = MemoryStore::new();
        store.fail_next_writes(2);
        assert!(store.upsert_run(&run("r1", RunState::Running)).is_err());
        assert!(store.put_kv("a", "b").is_err());
        assert!(store.put_kv("a", "b").is_ok());
    }

    #[test]
    fn runs_in_state_filters() {
        let store = MemoryStore::new();
        store.upsert_run(&run("r1", RunState::Running)).unwrap();
        store.upsert_run(&run("r2", RunState::Aborted)).unwrap();
        let running = store.runs_in_state(RunState::Running).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "r1");
    }
}
