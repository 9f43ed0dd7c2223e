//! Time sources for the tracker.
//!
//! Every timestamp in the crate is a [`Micros`] value on one monotonic clock.
//! The live tracker uses [`SystemClock`]; replay and tests use [`ManualClock`],
//! whose sleeps complete instantly by advancing virtual time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use crate::state::Micros;

/// Below this remaining time the system clock spins instead of sleeping.
const SPIN_THRESHOLD_US: Micros = 1_500;

/// Monotonic microsecond time source with deadline sleeping.
pub trait Clock: Send + Sync {
    /// Current time in microseconds since the clock epoch
    fn now_us(&self) -> Micros;

    /// Block until `deadline` (returns immediately if it already passed)
    fn sleep_until(&self, deadline: Micros);
}

/// Clock backed by `Instant`, epoch at construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> Micros {
        self.epoch.elapsed().as_micros() as Micros
    }

    /// Coarse OS sleep followed by a short spin, so tick deadlines land well
    /// inside one millisecond even with a coarse scheduler quantum.
    fn sleep_until(&self, deadline: Micros) {
        loop {
            let remaining = deadline - self.now_us();
            if remaining <= 0 {
                return;
            }
            if remaining > SPIN_THRESHOLD_US {
                std::thread::sleep(Duration::from_micros((remaining - SPIN_THRESHOLD_US) as u64));
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Virtual clock for deterministic replay and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Micros) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Micros) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Micros) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> Micros {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep_until(&self, deadline: Micros) {
        self.now.fetch_max(deadline, Ordering::SeqCst);
    }
}
