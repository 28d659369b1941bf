// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::Cell;

use crate::loom::loom_const_fn;
use crate::loom::{AtomicBool, AtomicUsize, Ordering};
use crate::thread_id::current_thread;
use crate::{Backoff, RawLock, RawSharedLock};

/// A spinlock which can be recursively acquired by its owning thread.
///
/// The lock records the id of the thread that holds it; further `lock` calls
/// from that thread increment a depth counter instead of deadlocking. The
/// lock is released once `unlock` has been called as many times as `lock`.
pub struct RawRecursiveSpinlock {
    flag: AtomicBool,
    owner: AtomicUsize,
    // Only ever touched while `flag` is held by the current thread.
    depth: Cell<usize>,
}

// Safety: `depth` is only accessed by the thread that owns `flag`, all other
// state is atomic.
unsafe impl Send for RawRecursiveSpinlock {}
// Safety: see above.
unsafe impl Sync for RawRecursiveSpinlock {}

impl RawRecursiveSpinlock {
    loom_const_fn! {
        /// Creates a new unlocked spinlock.
        #[must_use]
        pub const fn new() -> RawRecursiveSpinlock {
            RawRecursiveSpinlock {
                flag: AtomicBool::new(false),
                owner: AtomicUsize::new(0),
                depth: Cell::new(0),
            }
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Succeeds if the lock is free or already held by the current thread.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let id = current_thread().get();

        if self
            .flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(id, Ordering::Release);
            debug_assert_eq!(self.depth.get(), 0);
            self.depth.set(1);
            true
        } else if self.owner.load(Ordering::Acquire) == id {
            self.depth.set(self.depth.get() + 1);
            true
        } else {
            false
        }
    }

    /// Acquires the lock, spinning with a yielding backoff until it is
    /// available or the current thread already owns it.
    #[inline]
    pub fn lock(&self) {
        let mut boff = Backoff::default();
        while !self.try_lock() {
            boff.spin();
        }
    }

    /// Releases one level of ownership.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current thread.
    #[inline]
    pub unsafe fn unlock(&self) {
        debug_assert_eq!(self.owner.load(Ordering::Acquire), current_thread().get());
        debug_assert!(self.depth.get() > 0);

        let depth = self.depth.get() - 1;
        self.depth.set(depth);
        if depth == 0 {
            self.owner.store(0, Ordering::Release);
            self.flag.store(false, Ordering::Release);
        }
    }

    /// Checks whether the lock is currently held by any thread.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl Default for RawRecursiveSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: `flag` admits one owning thread at a time, acquire/release pair up
// across lock/unlock.
unsafe impl RawLock for RawRecursiveSpinlock {
    fn lock(&self) {
        RawRecursiveSpinlock::lock(self);
    }

    fn try_lock(&self) -> bool {
        RawRecursiveSpinlock::try_lock(self)
    }

    unsafe fn unlock(&self) {
        // Safety: forwarded precondition
        unsafe { RawRecursiveSpinlock::unlock(self) }
    }

    fn is_locked(&self) -> bool {
        RawRecursiveSpinlock::is_locked(self)
    }
}

/// Adapter that gives an exclusive-only lock a [`RawSharedLock`] surface by
/// making the shared operations aliases of the exclusive ones.
///
/// This is the configuration where readers and writers use the same guard:
/// `Exclusive<RawRecursiveSpinlock>` serializes all access while still
/// allowing same-thread recursion in either mode.
pub struct Exclusive<R>(R);

impl<R> Exclusive<R> {
    /// Wraps an exclusive-only lock.
    pub const fn new(raw: R) -> Self {
        Self(raw)
    }

    /// Returns the wrapped lock.
    pub fn into_inner(self) -> R {
        self.0
    }
}

impl<R: Default> Default for Exclusive<R> {
    fn default() -> Self {
        Self(R::default())
    }
}

// Safety: defers to the wrapped lock.
unsafe impl<R: RawLock> RawLock for Exclusive<R> {
    fn lock(&self) {
        self.0.lock();
    }

    fn try_lock(&self) -> bool {
        self.0.try_lock()
    }

    unsafe fn unlock(&self) {
        // Safety: forwarded precondition
        unsafe { self.0.unlock() }
    }

    fn is_locked(&self) -> bool {
        self.0.is_locked()
    }
}

// Safety: shared mode *is* exclusive mode here, so readers trivially exclude
// writers.
unsafe impl<R: RawLock> RawSharedLock for Exclusive<R> {
    fn lock_shared(&self) {
        self.0.lock();
    }

    fn try_lock_shared(&self) -> bool {
        self.0.try_lock()
    }

    unsafe fn unlock_shared(&self) {
        // Safety: forwarded precondition
        unsafe { self.0.unlock() }
    }
}
