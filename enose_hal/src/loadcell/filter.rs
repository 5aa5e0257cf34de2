//! Ring window, moving-average filter, stability and trend detection.

use heapless::Deque;

use enose_common::consts::WINDOW_CAPACITY;

/// Direction the filtered weight is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trend {
    /// No significant slope.
    #[default]
    Flat,
    /// Weight increasing.
    Rising,
    /// Weight decreasing.
    Falling,
}

/// Slope magnitude below which the trend reads flat [g/s].
const TREND_DEADBAND_G_PER_S: f64 = 0.02;

/// Fixed-capacity ring of recent raw readings.
///
/// Holds the last `window_len` samples. The filtered weight is a moving
/// average over the trailing `filter_len` sub-window; stability is
/// peak-to-peak over the whole window, and only reported once the window
/// is full.
#[derive(Debug)]
pub struct WeightWindow {
    window_len: usize,
    filter_len: usize,
    samples: Deque<f64, WINDOW_CAPACITY>,
}

impl WeightWindow {
    /// New window; `window_len` is clamped to the ring capacity and
    /// `filter_len` to `window_len`.
    pub fn new(window_len: usize, filter_len: usize) -> Self {
        let window_len = window_len.clamp(1, WINDOW_CAPACITY);
        Self {
            window_len,
            filter_len: filter_len.clamp(1, window_len),
            samples: Deque::new(),
        }
    }

    /// Push a raw reading, evicting the oldest beyond the window.
    pub fn push(&mut self, raw: f64) {
        while self.samples.len() >= self.window_len {
            let _ = self.samples.pop_front();
        }
        // Capacity is >= window_len, so this cannot fail.
        let _ = self.samples.push_back(raw);
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when no samples have been pushed.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True once the stability window is fully populated.
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.window_len
    }

    /// Drop all samples (e.g. after a tare).
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Moving average over the trailing filter sub-window.
    pub fn filtered(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.filter_len.min(self.samples.len());
        let sum: f64 = self.samples.iter().skip(self.samples.len() - n).sum();
        Some(sum / n as f64)
    }

    /// Max − min over the held samples.
    pub fn peak_to_peak(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in self.samples.iter() {
            min = min.min(v);
            max = max.max(v);
        }
        Some(max - min)
    }

    /// Stable iff the window is full and the peak-to-peak variation is
    /// within `tolerance_g`.
    pub fn stable(&self, tolerance_g: f64) -> bool {
        self.is_full()
            && self
                .peak_to_peak()
                .is_some_and(|ptp| ptp <= tolerance_g)
    }

    /// Least-squares slope over the window [g per sample].
    pub fn slope_per_sample(&self) -> Option<f64> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }
        let nf = n as f64;
        let mean_x = (nf - 1.0) / 2.0;
        let mean_y: f64 = self.samples.iter().sum::<f64>() / nf;
        let mut num = 0.0;
        let mut den = 0.0;
        for (i, &y) in self.samples.iter().enumerate() {
            let dx = i as f64 - mean_x;
            num += dx * (y - mean_y);
            den += dx * dx;
        }
        if den == 0.0 {
            None
        } else {
            Some(num / den)
        }
    }

    /// Sign of the least-squares slope, dead-banded in g/s.
    pub fn trend(&self, sample_period_s: f64) -> Trend {
        match self.slope_per_sample() {
            None => Trend::Flat,
            Some(per_sample) => {
                let per_s = per_sample / sample_period_s.max(1e-9);
                if per_s > TREND_DEADBAND_G_PER_S {
                    Trend::Rising
                } else if per_s < -TREND_DEADBAND_G_PER_S {
                    Trend::Falling
                } else {
                    Trend::Flat
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_is_trailing_mean() {
        let mut w = WeightWindow::new(10, 3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        // Mean of the last 3: (2 + 3 + 4) / 3.
        assert!((w.filtered().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn not_stable_until_window_full() {
        let mut w = WeightWindow::new(5, 2);
        for _ in 0..4 {
            w.push(1.0);
        }
        assert!(!w.stable(0.5));
        w.push(1.0);
        assert!(w.stable(0.5));
    }

    #[test]
    fn noisy_window_is_unstable() {
        let mut w = WeightWindow::new(4, 2);
        for v in [1.0, 2.0, 1.0, 2.0] {
            w.push(v);
        }
        assert!(!w.stable(0.5));
        assert!(w.stable(1.5));
    }

    #[test]
    fn eviction_keeps_window_length() {
        let mut w = WeightWindow::new(3, 1);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        // Oldest two evicted: 3, 4, 5 remain.
        assert_eq!(w.peak_to_peak().unwrap(), 2.0);
    }

    #[test]
    fn trend_signs() {
        let mut rising = WeightWindow::new(10, 2);
        let mut falling = WeightWindow::new(10, 2);
        let mut flat = WeightWindow::new(10, 2);
        for i in 0..10 {
            rising.push(i as f64 * 0.1);
            falling.push(-(i as f64) * 0.1);
            flat.push(1.0);
        }
        // 0.1 g per sample at 10 Hz = 1 g/s.
        assert_eq!(rising.trend(0.1), Trend::Rising);
        assert_eq!(falling.trend(0.1), Trend::Falling);
        assert_eq!(flat.trend(0.1), Trend::Flat);
    }

    #[test]
    fn slope_of_line_is_exact() {
        let mut w = WeightWindow::new(5, 1);
        for i in 0..5 {
            w.push(2.0 * i as f64);
        }
        assert!((w.slope_per_sample().unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn clear_resets_fill() {
        let mut w = WeightWindow::new(2, 1);
        w.push(1.0);
        w.push(1.0);
        assert!(w.is_full());
        w.clear();
        assert!(w.is_empty());
        assert!(!w.stable(10.0));
    }
}
