//! Injectable randomness for pacing and ad selection.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::SeedableRng;

/// Shared random source. Seed it in tests for repeatable selections.
#[derive(Debug)]
pub struct AdRng(Mutex<StdRng>);

impl AdRng {
    pub fn seeded(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    pub fn from_os_rng() -> Self {
        Self(Mutex::new(StdRng::from_os_rng()))
    }

    /// Run `f` with exclusive access to the generator.
    pub fn with<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}
