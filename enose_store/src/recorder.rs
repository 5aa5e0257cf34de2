//! Buffered result recorder.
//!
//! Producers append run rows, test results and weight samples without
//! blocking on the store. A drain worker flushes in batches — weight
//! samples in multi-row inserts of up to 1,000 rows, test results and run
//! rows individually — and retries with exponential backoff capped at
//! 30 s on store failure.
//!
//! Under queue pressure the oldest weight samples are dropped first and
//! counted; run and test-result entries are never dropped. Once the
//! critical queue reaches the hard cap the producer blocks instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use enose_common::consts::{RECORDER_BACKOFF_CAP_S, WEIGHT_BATCH_MAX_ROWS};
use enose_common::records::{RunRecord, TestResult, WeightSample};

use crate::ResultStore;

/// Recorder tunables.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Oldest weight samples are dropped beyond this queue length.
    pub sample_soft_cap: usize,
    /// Producers of critical entries block beyond this queue length.
    pub critical_hard_cap: usize,
    /// Weight-sample rows per batch insert.
    pub batch_rows: usize,
    /// First retry delay after a store failure.
    pub initial_backoff: Duration,
    /// Retry delay ceiling.
    pub max_backoff: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sample_soft_cap: 8_192,
            critical_hard_cap: 4_096,
            batch_rows: WEIGHT_BATCH_MAX_ROWS,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(RECORDER_BACKOFF_CAP_S),
        }
    }
}

/// Entries that are never dropped.
#[derive(Debug, Clone)]
enum CriticalEntry {
    Run(RunRecord),
    Result(TestResult),
}

#[derive(Debug, Default)]
struct Queues {
    critical: VecDeque<CriticalEntry>,
    samples: VecDeque<WeightSample>,
}

struct RecShared {
    cfg: RecorderConfig,
    queues: Mutex<Queues>,
    work_cv: Condvar,
    space_cv: Condvar,
    stop: AtomicBool,
    dropped_samples: AtomicU64,
    overloaded: AtomicBool,
}

/// Asynchronous append sink in front of a [`ResultStore`].
pub struct Recorder {
    shared: Arc<RecShared>,
    worker: Option<JoinHandle<()>>,
}

impl Recorder {
    /// Spawn the drain worker over the given store.
    pub fn spawn(store: Arc<dyn ResultStore>, cfg: RecorderConfig) -> Self {
        let shared = Arc::new(RecShared {
            cfg,
            queues: Mutex::new(Queues::default()),
            work_cv: Condvar::new(),
            space_cv: Condvar::new(),
            stop: AtomicBool::new(false),
            dropped_samples: AtomicU64::new(0),
            overloaded: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || drain_loop(store, &worker_shared))
            .ok();
        Self { shared, worker }
    }

    /// Append or update a run row. Never dropped; blocks at the hard cap.
    pub fn record_run(&self, run: RunRecord) {
        self.push_critical(CriticalEntry::Run(run));
    }

    /// Append a test result. Never dropped; blocks at the hard cap.
    pub fn record_test_result(&self, result: TestResult) {
        self.push_critical(CriticalEntry::Result(result));
    }

    fn push_critical(&self, entry: CriticalEntry) {
        let mut q = self.shared.queues.lock();
        while q.critical.len() >= self.shared.cfg.critical_hard_cap
            && !self.shared.stop.load(Ordering::Acquire)
        {
            self.shared.overloaded.store(true, Ordering::Release);
            self.shared.space_cv.wait(&mut q);
        }
        q.critical.push_back(entry);
        self.shared.work_cv.notify_all();
    }

    /// Append a weight sample. Oldest samples are dropped past the soft
    /// cap; the drop count is observable.
    pub fn record_weight_sample(&self, sample: WeightSample) {
        let mut q = self.shared.queues.lock();
        q.samples.push_back(sample);
        let mut dropped = 0u64;
        while q.samples.len() > self.shared.cfg.sample_soft_cap {
            q.samples.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.shared
                .dropped_samples
                .fetch_add(dropped, Ordering::Relaxed);
            self.shared.overloaded.store(true, Ordering::Release);
        }
        self.shared.work_cv.notify_all();
    }

    /// Weight samples dropped under overload so far.
    pub fn dropped_samples(&self) -> u64 {
        self.shared.dropped_samples.load(Ordering::Relaxed)
    }

    /// True while queue pressure is above the configured bounds.
    pub fn is_overloaded(&self) -> bool {
        self.shared.overloaded.load(Ordering::Acquire)
    }

    /// Entries still queued (critical + samples).
    pub fn backlog(&self) -> usize {
        let q = self.shared.queues.lock();
        q.critical.len() + q.samples.len()
    }

    /// Block until the queues are drained or the timeout elapses.
    /// Returns true when fully drained.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut q = self.shared.queues.lock();
        while !(q.critical.is_empty() && q.samples.is_empty()) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared.space_cv.wait_for(&mut q, deadline - now);
        }
        true
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.work_cv.notify_all();
        self.shared.space_cv.notify_all();
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

enum Inflight {
    Critical(CriticalEntry),
    Samples(Vec<WeightSample>),
}

fn drain_loop(store: Arc<dyn ResultStore>, shared: &Arc<RecShared>) {
    info!("recorder worker up");
    let mut backoff = shared.cfg.initial_backoff;
    let mut inflight: Option<Inflight> = None;

    loop {
        if inflight.is_none() {
            let mut q = shared.queues.lock();
            inflight = if let Some(entry) = q.critical.pop_front() {
                Some(Inflight::Critical(entry))
            } else if !q.samples.is_empty() {
                let n = q.samples.len().min(shared.cfg.batch_rows);
                Some(Inflight::Samples(q.samples.drain(..n).collect()))
            } else {
                if shared.stop.load(Ordering::Acquire) {
                    break;
                }
                shared
                    .work_cv
                    .wait_for(&mut q, Duration::from_millis(100));
                continue;
            };
            // Queue shrank: clear overload once well below the caps.
            if q.critical.len() < shared.cfg.critical_hard_cap / 2
                && q.samples.len() < shared.cfg.sample_soft_cap / 2
            {
                shared.overloaded.store(false, Ordering::Release);
            }
        }

        let result = match inflight.as_ref() {
            Some(Inflight::Critical(CriticalEntry::Run(run))) => store.upsert_run(run),
            Some(Inflight::Critical(CriticalEntry::Result(r))) => store.insert_test_result(r),
            Some(Inflight::Samples(batch)) => store.insert_weight_samples(batch),
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                inflight = None;
                backoff = shared.cfg.initial_backoff;
                shared.space_cv.notify_all();
            }
            Err(e) => {
                // Keep the in-flight item and retry; nothing is lost.
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "store append failed");
                if shared.stop.load(Ordering::Acquire) {
                    // Last-ditch: give the store one immediate chance per
                    // item during shutdown, then drop the rest.
                    debug!("recorder stopping with store still failing");
                    break;
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(shared.cfg.max_backoff);
            }
        }
    }
    info!("recorder worker down");
}
