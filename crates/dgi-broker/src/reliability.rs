//! Simulated link reliability.
//!
//! A connection with reliability R drops each outbound datagram with
//! probability (100 - R) / 100, independently, when simulation is on.
//! The random source is shared and seedable so runs are reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

use crate::error::ConnectionError;

/// Reliability of a freshly created connection.
pub const DEFAULT_RELIABILITY: u8 = 100;

/// Upper bound (inclusive) of the reliability percentage.
pub const MAX_RELIABILITY: u8 = 100;

/// Check a requested reliability value. Out-of-range input is rejected, never clamped.
pub fn validate_reliability(value: i64) -> Result<u8, ConnectionError> {
    if (0..=MAX_RELIABILITY as i64).contains(&value) {
        Ok(value as u8)
    } else {
        Err(ConnectionError::InvalidReliability(value))
    }
}

/// Shared random source for loss decisions.
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Decides whether an outbound datagram survives the simulated link.
#[derive(Clone)]
pub struct LossPolicy {
    simulate: bool,
    rng: SharedRng,
}

impl LossPolicy {
    /// Simulation on, deterministic draws from `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            simulate: true,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Simulation on, seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            simulate: true,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Simulation off: every send is attempted regardless of reliability.
    pub fn disabled() -> Self {
        Self {
            simulate: false,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(0))),
        }
    }

    /// Build from config: `seed` when given, entropy otherwise.
    pub fn from_config(simulate: bool, seed: Option<u64>) -> Self {
        match (simulate, seed) {
            (false, _) => Self::disabled(),
            (true, Some(seed)) => Self::seeded(seed),
            (true, None) => Self::from_entropy(),
        }
    }

    pub fn is_simulating(&self) -> bool {
        self.simulate
    }

    /// Draw once and report whether a datagram at `reliability` is delivered.
    ///
    /// No draw is consumed when simulation is off or the link is perfect.
    pub fn should_deliver(&self, reliability: u8) -> bool {
        if !self.simulate || reliability >= MAX_RELIABILITY {
            return true;
        }
        let draw: u8 = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..MAX_RELIABILITY),
            // A poisoned lock only means another sender panicked mid-draw.
            Err(poisoned) => poisoned.into_inner().gen_range(0..MAX_RELIABILITY),
        };
        draw < reliability
    }
}

impl Default for LossPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for LossPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LossPolicy")
            .field("simulate", &self.simulate)
            .finish_non_exhaustive()
    }
}
