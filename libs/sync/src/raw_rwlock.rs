// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::loom_const_fn;
use crate::loom::{AtomicUsize, Ordering};
use crate::{Backoff, RawLock, RawSharedLock};

const WRITER: usize = 1;
const READER: usize = 1 << 1;

/// Low-level reader-writer spinlock.
///
/// A single word counts readers above a writer bit. This is the conventional
/// shared mutex configuration: readers contend on one cache line, which is
/// exactly the cost profile [`RawContfreeMutex`](crate::RawContfreeMutex)
/// exists to avoid, but it is compact, non-recursive and has no per-thread
/// state.
///
/// There is no upgradeable mode; upgrading a shared acquisition to an
/// exclusive one is rejected by this design across the whole crate.
pub struct RawRwSpinlock {
    lock: AtomicUsize,
}

impl RawRwSpinlock {
    loom_const_fn! {
        /// Creates a new unlocked lock.
        #[must_use]
        pub const fn new() -> RawRwSpinlock {
            RawRwSpinlock {
                lock: AtomicUsize::new(0),
            }
        }
    }

    fn acquire_reader(&self) -> usize {
        // An arbitrary cap that allows us to catch overflows long before they happen
        const MAX_READERS: usize = usize::MAX / READER / 2;

        let value = self.lock.fetch_add(READER, Ordering::Acquire);

        if value > MAX_READERS * READER {
            self.lock.fetch_sub(READER, Ordering::Relaxed);
            panic!("Too many lock readers, cannot safely proceed");
        } else {
            value
        }
    }

    /// Acquires the lock in shared mode.
    #[inline]
    pub fn lock_shared(&self) {
        let mut boff = Backoff::default();
        while !self.try_lock_shared() {
            boff.spin();
        }
    }

    /// Attempts to acquire the lock in shared mode without blocking.
    #[inline]
    pub fn try_lock_shared(&self) -> bool {
        let value = self.acquire_reader();

        if value & WRITER != 0 {
            // Lock is taken, undo.
            self.lock.fetch_sub(READER, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Releases one shared acquisition.
    ///
    /// # Safety
    ///
    /// The shared lock must be held by the current thread.
    #[inline]
    pub unsafe fn unlock_shared(&self) {
        debug_assert!(self.lock.load(Ordering::Relaxed) & !WRITER > 0);
        self.lock.fetch_sub(READER, Ordering::Release);
    }

    /// Acquires the lock in exclusive mode.
    #[inline]
    pub fn lock_exclusive(&self) {
        let mut boff = Backoff::default();
        while !self.try_lock_exclusive() {
            boff.spin();
        }
    }

    /// Attempts to acquire the lock in exclusive mode without blocking.
    #[inline]
    pub fn try_lock_exclusive(&self) -> bool {
        self.lock
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the exclusive acquisition.
    ///
    /// # Safety
    ///
    /// The exclusive lock must be held by the current thread.
    #[inline]
    pub unsafe fn unlock_exclusive(&self) {
        debug_assert_eq!(self.lock.load(Ordering::Relaxed) & WRITER, WRITER);

        // Clear only the writer bit: readers backing off of `try_lock_shared`
        // may transiently have added reader counts.
        self.lock.fetch_and(!WRITER, Ordering::Release);
    }

    /// Checks whether the lock is held in either mode.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed) != 0
    }
}

impl Default for RawRwSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: the WRITER bit admits a single thread, acquire/release pair up
// across lock/unlock.
unsafe impl RawLock for RawRwSpinlock {
    fn lock(&self) {
        self.lock_exclusive();
    }

    fn try_lock(&self) -> bool {
        self.try_lock_exclusive()
    }

    unsafe fn unlock(&self) {
        // Safety: forwarded precondition
        unsafe { self.unlock_exclusive() }
    }

    fn is_locked(&self) -> bool {
        RawRwSpinlock::is_locked(self)
    }
}

// Safety: readers count above the WRITER bit; `try_lock_shared` backs out
// whenever the bit is set, `try_lock_exclusive` only succeeds on zero.
unsafe impl RawSharedLock for RawRwSpinlock {
    fn lock_shared(&self) {
        RawRwSpinlock::lock_shared(self);
    }

    fn try_lock_shared(&self) -> bool {
        RawRwSpinlock::try_lock_shared(self)
    }

    unsafe fn unlock_shared(&self) {
        // Safety: forwarded precondition
        unsafe { RawRwSpinlock::unlock_shared(self) }
    }
}

// Safety: see the inherent implementations above.
#[cfg(not(loom))]
unsafe impl lock_api::RawRwLock for RawRwSpinlock {
    #[allow(clippy::declare_interior_mutable_const, reason = "lock_api contract")]
    const INIT: Self = RawRwSpinlock::new();

    type GuardMarker = lock_api::GuardSend;

    fn lock_shared(&self) {
        RawRwSpinlock::lock_shared(self);
    }

    fn try_lock_shared(&self) -> bool {
        RawRwSpinlock::try_lock_shared(self)
    }

    unsafe fn unlock_shared(&self) {
        // Safety: forwarded precondition
        unsafe { RawRwSpinlock::unlock_shared(self) }
    }

    fn lock_exclusive(&self) {
        RawRwSpinlock::lock_exclusive(self);
    }

    fn try_lock_exclusive(&self) -> bool {
        RawRwSpinlock::try_lock_exclusive(self)
    }

    unsafe fn unlock_exclusive(&self) {
        // Safety: forwarded precondition
        unsafe { RawRwSpinlock::unlock_exclusive(self) }
    }

    fn is_locked(&self) -> bool {
        RawRwSpinlock::is_locked(self)
    }
}

/// A reader-writer lock over [`RawRwSpinlock`] with `lock_api` guards.
#[cfg(not(loom))]
pub type RwSpinlock<T> = lock_api::RwLock<RawRwSpinlock, T>;
/// RAII guard for the shared mode of [`RwSpinlock`].
#[cfg(not(loom))]
pub type RwSpinlockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawRwSpinlock, T>;
/// RAII guard for the exclusive mode of [`RwSpinlock`].
#[cfg(not(loom))]
pub type RwSpinlockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawRwSpinlock, T>;
