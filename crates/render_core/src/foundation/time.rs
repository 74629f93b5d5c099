//! Time management utilities
//!
//! The pipeline needs two notions of time: a monotonically increasing frame
//! stamp (staleness tracking, skinning dedupe) and wall-clock seconds
//! (memory-pressure throttling). Wall-clock time is read through the
//! [`Clock`] trait so frame control can be driven deterministically.

use std::cell::Cell;
use std::time::Instant;

/// Source of wall-clock seconds
pub trait Clock {
    /// Seconds elapsed since an arbitrary fixed origin
    fn now_seconds(&self) -> f64;
}

/// Clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    /// Create a clock whose origin is now
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now_seconds(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock advanced by hand, for headless runs and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<f64>,
}

impl ManualClock {
    /// Create a manual clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward by `seconds`
    pub fn advance(&self, seconds: f64) {
        self.now.set(self.now.get() + seconds);
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> f64 {
        self.now.get()
    }
}

impl<C: Clock + ?Sized> Clock for std::rc::Rc<C> {
    fn now_seconds(&self) -> f64 {
        (**self).now_seconds()
    }
}

/// Monotonic frame counter shared by every per-frame cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameStamp(pub u64);

impl FrameStamp {
    /// The stamp following this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}
