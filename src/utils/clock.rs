//! Time source used by block generation.
//!
//! The chain itself never reads the wall clock: median time is derived from
//! accepted blocks. Only the generator needs "now", to stamp the root block
//! and the issuer time of candidates, so the clock is kept behind a trait
//! that tests can pin.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

pub trait Clock: Send + Sync {
    /// Seconds since the UNIX epoch.
    fn now(&self) -> u64;
}

/// System wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock pinned to a fixed instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

pub type SharedClock = Arc<dyn Clock>;
