// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::thread;
use std::time::{Duration, Instant};

use guarded_sync::RawLock;

use crate::Protected;

/// Default per-mutex bound for a single timed acquisition attempt.
pub const DEADLOCK_TIMEOUT: Duration = Duration::from_micros(100);
/// Default number of raw try-locks before the timed loop starts.
pub const SPIN_ITERATIONS: usize = 100;

/// Whether a failed sweep gives up or starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One sweep; on failure no locks are held.
    Once,
    /// Sweep until every lock is acquired.
    Infinite,
}

/// A handle that can take part in a [`LockTimedAny`] sweep.
///
/// Blanket-implemented for every handle type of this crate; heterogeneous
/// inner types and mutex types mix freely in one sweep.
pub trait Lockable {
    #[doc(hidden)]
    fn raw_lock(&self) -> &dyn RawLock;
}

impl<P: Protected> Lockable for P {
    fn raw_lock(&self) -> &dyn RawLock {
        self.raw()
    }
}

/// Acquires the exclusive locks of several handles with a bounded try-lock
/// sweep, avoiding deadlock without any lock ordering discipline.
///
/// Each mutex is tried in argument order: first a short burst of raw
/// try-locks, then a timed loop that sleeps the remaining budget between
/// attempts. The moment one mutex cannot be had in time, everything already
/// acquired is released and the sweep backs off for the timeout plus a
/// random jitter, then fails ([`Mode::Once`]) or starts over
/// ([`Mode::Infinite`]). The jitter keeps two sweeps that approach the same
/// handles from opposite ends from re-colliding forever.
///
/// On success all locks are held until the object is dropped; on failure
/// none are.
///
/// ```
/// use guarded::{Guarded, LockTimedAny, Lockable};
///
/// let a = Guarded::new(1);
/// let b = Guarded::new(2);
/// let txn = LockTimedAny::infinite(&[&a as &dyn Lockable, &b]);
/// assert!(txn.owns_locks());
/// ```
#[clippy::has_significant_drop]
#[must_use = "if unused the locks are immediately released"]
pub struct LockTimedAny<'a> {
    held: Vec<&'a dyn RawLock>,
    success: bool,
}

impl<'a> LockTimedAny<'a> {
    /// One sweep over `handles` with the default budget.
    pub fn once(handles: &[&'a dyn Lockable]) -> Self {
        Self::with(Mode::Once, handles, DEADLOCK_TIMEOUT, SPIN_ITERATIONS)
    }

    /// Sweeps `handles` with the default budget until all locks are held.
    pub fn infinite(handles: &[&'a dyn Lockable]) -> Self {
        Self::with(Mode::Infinite, handles, DEADLOCK_TIMEOUT, SPIN_ITERATIONS)
    }

    /// Sweeps `handles` with an explicit per-mutex timeout and spin budget.
    pub fn with(
        mode: Mode,
        handles: &[&'a dyn Lockable],
        timeout: Duration,
        spin_iters: usize,
    ) -> Self {
        loop {
            let mut held: Vec<&'a dyn RawLock> = Vec::with_capacity(handles.len());

            let acquired_all = handles.iter().all(|handle| {
                let raw = handle.raw_lock();
                if try_lock_one(raw, timeout, spin_iters) {
                    held.push(raw);
                    true
                } else {
                    false
                }
            });

            if acquired_all {
                return Self {
                    held,
                    success: true,
                };
            }

            for raw in held.drain(..).rev() {
                // Safety: acquired in this sweep
                unsafe { raw.unlock() };
            }

            log::trace!("timed multi-lock sweep failed, backing off");
            thread::sleep(timeout + jitter(timeout));

            if mode == Mode::Once {
                return Self {
                    held: Vec::new(),
                    success: false,
                };
            }
        }
    }

    /// Whether the sweep acquired every lock.
    pub fn owns_locks(&self) -> bool {
        self.success
    }
}

impl Drop for LockTimedAny<'_> {
    fn drop(&mut self) {
        for raw in self.held.drain(..).rev() {
            // Safety: acquired by the successful sweep
            unsafe { raw.unlock() };
        }
    }
}

/// One bounded acquisition attempt: spin burst, then sleep out the budget.
fn try_lock_one(raw: &dyn RawLock, timeout: Duration, spin_iters: usize) -> bool {
    for _ in 0..spin_iters {
        if raw.try_lock() {
            return true;
        }
    }

    let start = Instant::now();
    loop {
        if raw.try_lock() {
            return true;
        }
        let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
            return false;
        };
        if remaining.is_zero() {
            return false;
        }
        thread::sleep(remaining);
    }
}

fn jitter(timeout: Duration) -> Duration {
    let bound = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(fastrand::u64(0..=bound))
}
