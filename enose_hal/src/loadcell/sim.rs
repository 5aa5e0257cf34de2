//! Simulated weight sources for tests and dry runs.

use super::{LoadCellError, WeightSource};

/// Closure-backed [`WeightSource`].
pub struct SimWeightSource {
    f: Box<dyn FnMut() -> Result<f64, LoadCellError> + Send>,
}

impl SimWeightSource {
    /// Always reads the same weight.
    pub fn constant(weight_g: f64) -> Self {
        Self {
            f: Box::new(move || Ok(weight_g)),
        }
    }

    /// Reads whatever the closure produces; called once per sample.
    pub fn from_fn(mut f: impl FnMut() -> f64 + Send + 'static) -> Self {
        Self {
            f: Box::new(move || Ok(f())),
        }
    }

    /// Every read fails (fault-path tests).
    pub fn failing(message: &str) -> Self {
        let message = message.to_string();
        Self {
            f: Box::new(move || Err(LoadCellError::Source(message.clone()))),
        }
    }
}

impl WeightSource for SimWeightSource {
    fn read(&mut self) -> Result<f64, LoadCellError> {
        (self.f)()
    }
}
