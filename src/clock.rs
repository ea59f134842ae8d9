//! Time source and interruptible delays.
//!
//! Every time read and every deliberate delay in the core goes through a
//! [`Clock`], so tests can drive the full dispatch cycle with a
//! [`ManualClock`] instead of waiting on the wall clock.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Source of "now" plus the service-simulation delay.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Suspend for `duration` unless `interrupt` is raised first.
    /// Returns `true` if the full delay elapsed.
    fn sleep(&self, duration: Duration, interrupt: &Interrupt) -> bool;
}

/// Wall-clock time with real, interruptible sleeps.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, interrupt: &Interrupt) -> bool {
        !interrupt.wait_timeout(duration)
    }
}

/// A clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset += by;
    }

    /// Total time this clock has advanced since creation.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration, interrupt: &Interrupt) -> bool {
        if interrupt.is_raised() {
            return false;
        }
        self.advance(duration);
        true
    }
}

/// One-shot broadcast flag that wakes anything blocked in [`Interrupt::wait_timeout`].
#[derive(Debug, Default)]
pub struct Interrupt {
    raised: Mutex<bool>,
    wake: Condvar,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut raised = self.raised.lock();
        *raised = true;
        self.wake.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    /// Block up to `timeout`; returns `true` if the interrupt was raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut raised = self.raised.lock();
        // Past the representable range: wait for the raise alone.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while !*raised {
                self.wake.wait(&mut raised);
            }
            return true;
        };
        while !*raised {
            if self.wake.wait_until(&mut raised, deadline).timed_out() {
                break;
            }
        }
        *raised
    }
}
