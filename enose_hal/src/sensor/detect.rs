//! Detectors over the sensor data stream.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Counts completed heater cycles.
///
/// A cycle completes on a transition where the reported heater step
/// decreases from a positive value back to zero. The first such
/// transition only *primes* the counter — it closes whatever partial
/// cycle was in flight when observation began — and is not counted.
#[derive(Debug, Default)]
pub struct HeaterCycleCounter {
    last_step: Option<u32>,
    primed: bool,
    completed: u32,
}

impl HeaterCycleCounter {
    /// Fresh, unprimed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed cycles so far.
    pub fn completed(&self) -> u32 {
        self.completed
    }

    /// Feed the next observed heater step; returns the completed count.
    pub fn feed(&mut self, heater_step: u32) -> u32 {
        if let Some(last) = self.last_step {
            if last > 0 && heater_step == 0 {
                if self.primed {
                    self.completed += 1;
                } else {
                    self.primed = true;
                }
            }
        }
        self.last_step = Some(heater_step);
        self.completed
    }
}

/// Peak-to-peak stability of the sensor primary values over a window.
///
/// Stable once the window is fully covered and the relative variation
/// (max − min as a percentage of the window mean magnitude) falls below
/// the threshold.
#[derive(Debug)]
pub struct SignalStability {
    window: Duration,
    threshold_pct: f64,
    samples: VecDeque<(Instant, f64)>,
}

impl SignalStability {
    /// Detector over `window` with the given percentage threshold.
    pub fn new(window: Duration, threshold_pct: f64) -> Self {
        Self {
            window,
            threshold_pct,
            samples: VecDeque::new(),
        }
    }

    /// Feed a value observed now.
    pub fn feed(&mut self, value: f64) -> bool {
        self.feed_at(Instant::now(), value)
    }

    /// Feed a value with an explicit timestamp (test hook).
    pub fn feed_at(&mut self, t: Instant, value: f64) -> bool {
        self.samples.push_back((t, value));
        while let Some(&(oldest, _)) = self.samples.front() {
            if t.duration_since(oldest) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.is_stable(t)
    }

    fn is_stable(&self, now: Instant) -> bool {
        let Some(&(oldest, _)) = self.samples.front() else {
            return false;
        };
        // Window must be fully covered before a verdict.
        if now.duration_since(oldest) < self.window.mul_f64(0.95) {
            return false;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &(_, v) in &self.samples {
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = (sum / self.samples.len() as f64).abs();
        if mean == 0.0 {
            return max - min == 0.0;
        }
        ((max - min) / mean) * 100.0 <= self.threshold_pct
    }
}
