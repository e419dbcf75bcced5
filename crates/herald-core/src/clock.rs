//! Injectable time and randomness.
//!
//! Timers themselves run on `tokio::time`, which tests drive with a paused clock.
//! Wall-clock reads (post age, usage date keys, ledger timestamps) go through
//! [`Clock`] so they can be pinned.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut g) = self.now.lock() {
            *g += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|g| *g).unwrap_or_else(|p| *p.into_inner())
    }
}

/// Source of uniform draws in `[0, 1)` for the response gate.
pub trait RandomSource: Send + Sync {
    fn uniform(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn uniform(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Always returns the same draw.
#[derive(Clone, Copy, Debug)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn uniform(&self) -> f64 {
        self.0
    }
}
