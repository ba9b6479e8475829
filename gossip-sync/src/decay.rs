//! Smoothing for the permit suspension signal.
//!
//! Suspension pressure can jump around from one sample to the next. Letting
//! it drive permit availability directly would make the pool flap between
//! "everyone syncs" and "nobody syncs". The [`DecayEngine`] follows increases
//! immediately but only lets the value fall at a fixed rate, so after a burst
//! of pressure permits come back gradually instead of all at once.

use {
    crate::{
        clock::Clock,
        error::{GossipSyncError, Result},
    },
    std::{sync::Arc, time::Instant},
};

/// Asymmetric smoother: instant attack, linear release.
#[derive(Debug)]
pub struct DecayEngine {
    clock: Arc<dyn Clock>,
    /// Permits per second the smoothed value may fall by.
    decay_rate: f64,
    previous_count: f64,
    previous_update: Instant,
}

impl DecayEngine {
    /// Create an engine starting at zero suspension.
    ///
    /// Returns `Err` if `decay_rate` is not a positive number.
    pub fn new(decay_rate: f64, clock: Arc<dyn Clock>) -> Result<Self> {
        if decay_rate.is_nan() || decay_rate <= 0.0 {
            return Err(GossipSyncError::InvalidConfig(format!(
                "decay rate must be positive, got {decay_rate}"
            )));
        }
        let previous_update = clock.now();
        Ok(Self {
            clock,
            decay_rate,
            previous_count: 0.0,
            previous_update,
        })
    }

    /// Feed the latest instantaneous suspension count and get the smoothed
    /// value back.
    pub fn current_suspension_count(&mut self, instantaneous: f64) -> f64 {
        let now = self.clock.now();
        if instantaneous > self.previous_count {
            self.previous_count = instantaneous;
        } else {
            let elapsed = now
                .saturating_duration_since(self.previous_update)
                .as_secs_f64();
            self.previous_count = (self.previous_count - elapsed * self.decay_rate).max(0.0);
        }
        self.previous_update = now;
        self.previous_count
    }

    /// The smoothed value as of the last update.
    pub fn previous_count(&self) -> f64 {
        self.previous_count
    }
}
