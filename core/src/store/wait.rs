//! Hybrid wait strategy for the pipeline stages.
//!
//! A waiter first spins with exponential backoff, then parks on a condition
//! variable with a timeout so the alert flag is re-checked periodically.

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Raised instead of a sequence when shutdown was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alerted;

pub struct WaitStrategy {
    lock: Mutex<()>,
    condvar: Condvar,
    park_timeout: Duration,
}

impl WaitStrategy {
    pub fn new(park_timeout: Duration) -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
            park_timeout,
        }
    }

    /// Wait until `dependent` reaches `sequence` and return the highest
    /// available sequence.
    pub fn wait_for(
        &self,
        sequence: i64,
        dependent: &AtomicI64,
        alert: &AtomicBool,
    ) -> Result<i64, Alerted> {
        let backoff = Backoff::new();
        loop {
            let available = dependent.load(Ordering::Acquire);
            if available >= sequence {
                return Ok(available);
            }
            if alert.load(Ordering::Acquire) {
                return Err(Alerted);
            }
            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }

            let mut guard = self.lock.lock();
            if dependent.load(Ordering::Acquire) < sequence && !alert.load(Ordering::Acquire) {
                self.condvar.wait_for(&mut guard, self.park_timeout);
            }
        }
    }

    /// Like [`WaitStrategy::wait_for`] but gives up at `deadline`.
    pub fn wait_until(&self, sequence: i64, dependent: &AtomicI64, deadline: Instant) -> Option<i64> {
        loop {
            let available = dependent.load(Ordering::Acquire);
            if available >= sequence {
                return Some(available);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let mut guard = self.lock.lock();
            if dependent.load(Ordering::Acquire) < sequence {
                let timeout = self.park_timeout.min(deadline - now);
                self.condvar.wait_for(&mut guard, timeout);
            }
        }
    }

    pub fn signal_all(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}
