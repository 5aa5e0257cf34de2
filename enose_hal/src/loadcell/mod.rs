//! Load-cell driver.
//!
//! A sampling thread reads the raw scale at a fixed rate (≈10 Hz),
//! maintains the ring window and publishes an atomic snapshot of the
//! filtered, tare-subtracted weight with stability and trend flags.
//!
//! The blocking [`LoadCell::wait_for_empty_bottle`] primitive tracks a
//! dynamic empty baseline: a sustained stable reading below the current
//! baseline lowers it, so the instrument self-corrects against film and
//! carryover buildup on the bottle.

mod filter;
mod sim;

pub use filter::{Trend, WeightWindow};
pub use sim::SimWeightSource;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for load-cell operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadCellError {
    /// The raw source failed repeatedly.
    #[error("weight source failed: {0}")]
    Source(String),

    /// A tare was requested in the wrong order.
    #[error("tare error: {0}")]
    Tare(String),

    /// The sampling thread is gone.
    #[error("load cell sampler stopped")]
    Stopped,
}

/// Raw scale behind the sampling thread.
pub trait WeightSource: Send {
    /// One raw reading [g, uncalibrated]. Should return promptly; the
    /// sampler owns the pacing.
    fn read(&mut self) -> Result<f64, LoadCellError>;
}

/// One published reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoadCellReading {
    /// Filtered, tare-subtracted weight [g].
    pub weight_g: f64,
    /// Raw reading as a fraction of full scale.
    pub raw_fraction: f64,
    /// A tare has been applied and the source is healthy.
    pub calibrated: bool,
    /// Peak-to-peak over the window within tolerance, window full.
    pub stable: bool,
    /// Sign of the least-squares slope over the window.
    pub trend: Trend,
}

/// Sampler tunables.
#[derive(Debug, Clone)]
pub struct LoadCellConfig {
    /// Sampling period.
    pub sample_period: Duration,
    /// Stability window.
    pub window: Duration,
    /// Moving-average sub-window [samples].
    pub filter_samples: usize,
    /// Stability tolerance [g].
    pub tolerance_g: f64,
    /// Configured empty tare [g], the initial empty baseline.
    pub empty_tare_g: f64,
    /// Full-scale range for `raw_fraction` [g].
    pub full_scale_g: f64,
}

impl Default for LoadCellConfig {
    fn default() -> Self {
        Self {
            sample_period: Duration::from_millis(enose_common::consts::LOAD_CELL_PERIOD_MS),
            window: Duration::from_secs(3),
            filter_samples: 5,
            tolerance_g: 0.2,
            empty_tare_g: 0.0,
            full_scale_g: 1_000.0,
        }
    }
}

impl LoadCellConfig {
    /// Window length in samples.
    pub fn window_samples(&self) -> usize {
        let period_ms = self.sample_period.as_millis().max(1) as u64;
        ((self.window.as_millis() as u64 / period_ms).max(1)) as usize
    }
}

/// Outcome of an empty-bottle wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmptyWaitOutcome {
    /// Reached a stable reading at the empty baseline.
    pub success: bool,
    /// Achieved empty weight on success, last observed weight otherwise.
    pub empty_weight_g: f64,
    /// The wait was abandoned by the caller.
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct TareState {
    offset_g: f64,
    calibrated: bool,
    capturing: Option<Vec<f64>>,
}

struct LcShared {
    config: LoadCellConfig,
    snapshot: RwLock<LoadCellReading>,
    window: Mutex<WeightWindow>,
    tare: Mutex<TareState>,
    fault: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Sender<LoadCellReading>>>,
    stop: AtomicBool,
}

/// The load-cell driver handle. Owns the sampling thread.
pub struct LoadCell {
    shared: Arc<LcShared>,
    worker: Option<JoinHandle<()>>,
}

impl LoadCell {
    /// Spawn the sampling thread over a raw source.
    pub fn spawn(mut source: Box<dyn WeightSource>, config: LoadCellConfig) -> Self {
        let window = WeightWindow::new(config.window_samples(), config.filter_samples);
        let shared = Arc::new(LcShared {
            snapshot: RwLock::new(LoadCellReading::default()),
            window: Mutex::new(window),
            tare: Mutex::new(TareState {
                offset_g: config.empty_tare_g,
                calibrated: true,
                capturing: None,
            }),
            fault: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            config,
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("loadcell".to_string())
            .spawn(move || sampler_loop(&mut source, &worker_shared))
            .ok();
        if worker.is_none() {
            warn!("load cell sampler thread failed to spawn");
        }

        Self { shared, worker }
    }

    /// Latest published reading.
    pub fn snapshot(&self) -> LoadCellReading {
        *self.shared.snapshot.read()
    }

    /// Subscribe to every published reading.
    pub fn subscribe(&self) -> Receiver<LoadCellReading> {
        let (tx, rx) = unbounded();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    /// Last filtered weight [g].
    pub fn weight_g(&self) -> f64 {
        self.shared.snapshot.read().weight_g
    }

    /// Sampler fault, if the source has been failing.
    pub fn fault(&self) -> Option<String> {
        self.shared.fault.lock().clone()
    }

    /// Start capturing samples for a new tare.
    pub fn begin_tare(&self) -> Result<(), LoadCellError> {
        let mut tare = self.shared.tare.lock();
        if tare.capturing.is_some() {
            return Err(LoadCellError::Tare("tare already in progress".to_string()));
        }
        tare.capturing = Some(Vec::new());
        Ok(())
    }

    /// Commit the tare started by [`begin_tare`](Self::begin_tare).
    ///
    /// Returns the new offset. Requires at least one captured sample.
    pub fn commit_tare(&self) -> Result<f64, LoadCellError> {
        let mut tare = self.shared.tare.lock();
        let samples = tare
            .capturing
            .take()
            .ok_or_else(|| LoadCellError::Tare("no tare in progress".to_string()))?;
        if samples.is_empty() {
            return Err(LoadCellError::Tare("no samples captured".to_string()));
        }
        let offset = samples.iter().sum::<f64>() / samples.len() as f64;
        tare.offset_g = offset;
        tare.calibrated = true;
        drop(tare);
        self.shared.window.lock().clear();
        info!(offset_g = offset, "tare committed");
        Ok(offset)
    }

    /// Block until the bottle reads empty, the timeout elapses or the
    /// caller cancels.
    ///
    /// The dynamic baseline starts at the configured empty tare and is
    /// lowered whenever a stable reading sits below it for one full
    /// stability window. Success means stable within `tolerance_g` of the
    /// baseline. Peripheral state is untouched.
    pub fn wait_for_empty_bottle(
        &self,
        tolerance_g: f64,
        timeout: Duration,
        stability_window: Duration,
        cancel: &AtomicBool,
    ) -> Result<EmptyWaitOutcome, LoadCellError> {
        let started = Instant::now();
        let poll = self
            .shared
            .config
            .sample_period
            .min(Duration::from_millis(enose_common::consts::CANCEL_POLL_MS));

        let mut baseline = 0.0_f64;
        let mut below_since: Option<Instant> = None;
        let mut last_weight = self.weight_g();

        loop {
            if cancel.load(Ordering::Acquire) {
                debug!(last_weight, "empty-bottle wait cancelled");
                return Ok(EmptyWaitOutcome {
                    success: false,
                    empty_weight_g: last_weight,
                    cancelled: true,
                });
            }
            if let Some(fault) = self.fault() {
                return Err(LoadCellError::Source(fault));
            }

            let reading = self.snapshot();
            last_weight = reading.weight_g;

            if reading.stable {
                // Self-correcting baseline: sustained stable readings
                // below the current empty level become the new empty.
                if reading.weight_g < baseline {
                    match below_since {
                        Some(t0) if t0.elapsed() >= stability_window => {
                            debug!(
                                old = baseline,
                                new = reading.weight_g,
                                "empty baseline lowered"
                            );
                            baseline = reading.weight_g;
                            below_since = None;
                        }
                        Some(_) => {}
                        None => below_since = Some(Instant::now()),
                    }
                } else {
                    below_since = None;
                }

                if (reading.weight_g - baseline).abs() <= tolerance_g {
                    return Ok(EmptyWaitOutcome {
                        success: true,
                        empty_weight_g: reading.weight_g,
                        cancelled: false,
                    });
                }
            } else {
                below_since = None;
            }

            if started.elapsed() >= timeout {
                debug!(last_weight, "empty-bottle wait timed out");
                return Ok(EmptyWaitOutcome {
                    success: false,
                    empty_weight_g: last_weight,
                    cancelled: false,
                });
            }
            std::thread::sleep(poll);
        }
    }
}

impl Drop for LoadCell {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

fn sampler_loop(source: &mut Box<dyn WeightSource>, shared: &Arc<LcShared>) {
    info!(
        period_ms = shared.config.sample_period.as_millis() as u64,
        window_samples = shared.config.window_samples(),
        "load cell sampler up"
    );
    let mut consecutive_errors = 0u32;

    while !shared.stop.load(Ordering::Acquire) {
        let t0 = Instant::now();
        match source.read() {
            Ok(raw) => {
                consecutive_errors = 0;
                process_sample(shared, raw);
            }
            Err(e) => {
                consecutive_errors += 1;
                if consecutive_errors == 10 {
                    warn!(error = %e, "weight source failing, marking fault");
                    *shared.fault.lock() = Some(e.to_string());
                    let mut snap = shared.snapshot.write();
                    snap.calibrated = false;
                }
            }
        }
        if let Some(remaining) = shared.config.sample_period.checked_sub(t0.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
    info!("load cell sampler down");
}

fn process_sample(shared: &Arc<LcShared>, raw: f64) {
    let (offset, calibrated) = {
        let mut tare = shared.tare.lock();
        if let Some(cap) = tare.capturing.as_mut() {
            cap.push(raw);
        }
        (tare.offset_g, tare.calibrated)
    };

    let mut window = shared.window.lock();
    window.push(raw);
    let filtered = window.filtered().unwrap_or(raw);
    let stable = window.stable(shared.config.tolerance_g);
    let trend = window.trend(shared.config.sample_period.as_secs_f64());
    drop(window);

    let reading = LoadCellReading {
        weight_g: filtered - offset,
        raw_fraction: raw / shared.config.full_scale_g,
        calibrated,
        stable,
        trend,
    };
    *shared.snapshot.write() = reading;
    shared
        .subscribers
        .lock()
        .retain(|tx| tx.send(reading).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn fast_config() -> LoadCellConfig {
        LoadCellConfig {
            sample_period: Duration::from_millis(5),
            window: Duration::from_millis(100),
            filter_samples: 3,
            tolerance_g: 0.2,
            empty_tare_g: 0.0,
            full_scale_g: 1_000.0,
        }
    }

    #[test]
    fn snapshot_tracks_constant_source() {
        let lc = LoadCell::spawn(Box::new(SimWeightSource::constant(12.0)), fast_config());
        std::thread::sleep(Duration::from_millis(200));
        let snap = lc.snapshot();
        assert!((snap.weight_g - 12.0).abs() < 0.01, "weight {}", snap.weight_g);
        assert!(snap.stable);
        assert_eq!(snap.trend, Trend::Flat);
        assert!(snap.calibrated);
    }

    #[test]
    fn subscribers_receive_readings() {
        let lc = LoadCell::spawn(Box::new(SimWeightSource::constant(3.0)), fast_config());
        let rx = lc.subscribe();
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!((first.weight_g - 3.0).abs() < 0.5);
        // Stream keeps flowing.
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn tare_shifts_weight() {
        let lc = LoadCell::spawn(Box::new(SimWeightSource::constant(5.0)), fast_config());
        std::thread::sleep(Duration::from_millis(100));
        lc.begin_tare().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let offset = lc.commit_tare().unwrap();
        assert!((offset - 5.0).abs() < 0.01);
        std::thread::sleep(Duration::from_millis(150));
        assert!(lc.weight_g().abs() < 0.01);
    }

    #[test]
    fn double_begin_tare_rejected() {
        let lc = LoadCell::spawn(Box::new(SimWeightSource::constant(1.0)), fast_config());
        lc.begin_tare().unwrap();
        assert!(matches!(lc.begin_tare(), Err(LoadCellError::Tare(_))));
    }

    #[test]
    fn empty_wait_succeeds_on_stable_empty() {
        let lc = LoadCell::spawn(Box::new(SimWeightSource::constant(0.0)), fast_config());
        let cancel = AtomicBool::new(false);
        let out = lc
            .wait_for_empty_bottle(
                0.5,
                Duration::from_secs(2),
                Duration::from_millis(100),
                &cancel,
            )
            .unwrap();
        assert!(out.success);
        assert!(out.empty_weight_g.abs() < 0.1);
        assert!(!out.cancelled);
    }

    #[test]
    fn empty_wait_times_out_on_residual_weight() {
        let lc = LoadCell::spawn(Box::new(SimWeightSource::constant(8.0)), fast_config());
        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let out = lc
            .wait_for_empty_bottle(
                0.5,
                Duration::from_millis(300),
                Duration::from_millis(100),
                &cancel,
            )
            .unwrap();
        assert!(!out.success);
        assert!((out.empty_weight_g - 8.0).abs() < 0.5);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn empty_wait_honors_cancel() {
        let lc = LoadCell::spawn(Box::new(SimWeightSource::constant(8.0)), fast_config());
        let cancel = AtomicBool::new(true);
        let out = lc
            .wait_for_empty_bottle(
                0.5,
                Duration::from_secs(10),
                Duration::from_millis(100),
                &cancel,
            )
            .unwrap();
        assert!(out.cancelled);
        assert!(!out.success);
    }

    #[test]
    fn draining_bottle_reaches_empty() {
        // Starts at 6 g, drains 0.4 g per read, floors at zero.
        let remaining = std::sync::Arc::new(parking_lot::Mutex::new(6.0_f64));
        let r = remaining.clone();
        let source = SimWeightSource::from_fn(move || {
            let mut w = r.lock();
            *w = (*w - 0.4).max(0.0);
            *w
        });
        let lc = LoadCell::spawn(Box::new(source), fast_config());
        let cancel = AtomicBool::new(false);
        let out = lc
            .wait_for_empty_bottle(
                0.5,
                Duration::from_secs(3),
                Duration::from_millis(100),
                &cancel,
            )
            .unwrap();
        assert!(out.success, "drain should settle empty: {out:?}");
    }
}
