// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives optimized for read-heavy workloads.
//!
//! The centerpiece is [`RawContfreeMutex`], a reader/writer lock whose shared
//! path touches only a per-thread cache line instead of a shared reader
//! counter. Around it sit [`RawRecursiveSpinlock`], an owner-tracking
//! recursive spinlock, and [`RawRwSpinlock`], a conventional word-based
//! reader/writer spinlock that also plugs into [`lock_api`].
//!
//! All primitives here are *raw*: they carry no data and hand out no
//! references, only lock/unlock protocol. The `guarded` crate layers value
//! access on top.

mod backoff;
mod loom;
mod raw_contfree;
mod raw_rwlock;
mod raw_spinlock;
mod thread_id;

pub use backoff::Backoff;
pub use raw_contfree::RawContfreeMutex;
#[cfg(not(loom))]
pub use raw_rwlock::{RwSpinlock, RwSpinlockReadGuard, RwSpinlockWriteGuard};
pub use raw_rwlock::RawRwSpinlock;
pub use raw_spinlock::{Exclusive, RawRecursiveSpinlock};

/// Low-level exclusive lock protocol.
///
/// Unlike [`lock_api::RawMutex`] this trait admits same-thread recursion:
/// an implementation may let the owning thread re-acquire the lock, counting
/// depth internally. Callers therefore cannot assume that a successful
/// `lock` on one handle excludes the *same* thread elsewhere.
///
/// # Safety
///
/// Implementations must guarantee that at most one thread at a time holds
/// the lock, and that `lock`/`try_lock` establish a happens-before edge with
/// the previous `unlock`.
pub unsafe trait RawLock {
    /// Acquires the lock, blocking the current thread until it is available.
    fn lock(&self);

    /// Attempts to acquire the lock without blocking.
    fn try_lock(&self) -> bool;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the current thread.
    unsafe fn unlock(&self);

    /// Checks whether the lock is currently held by any thread.
    fn is_locked(&self) -> bool;
}

/// Low-level lock protocol with an additional shared (reader) mode.
///
/// Multiple threads may hold the shared lock at once; the exclusive lock of
/// [`RawLock`] excludes both readers and writers. Same-thread recursion is
/// permitted for X→X, X→S and S→S acquisitions; upgrading S→X on the same
/// thread is a contract violation that implementations detect with a debug
/// assertion at best and deadlock at worst.
///
/// # Safety
///
/// Implementations must guarantee that no thread holds the shared lock while
/// another thread holds the exclusive lock, and that lock/unlock pairs
/// establish the usual happens-before edges.
pub unsafe trait RawSharedLock: RawLock {
    /// Acquires the lock in shared mode, blocking until it is available.
    fn lock_shared(&self);

    /// Attempts to acquire the lock in shared mode without blocking.
    fn try_lock_shared(&self) -> bool;

    /// Releases one level of shared ownership.
    ///
    /// # Safety
    ///
    /// The shared lock must be held by the current thread.
    unsafe fn unlock_shared(&self);
}

/// Marker type which indicates that the Guard type for a lock is not `Send`.
pub struct GuardNoSend(#[expect(dead_code, reason = "inner pointer is unused")] *mut ());

// Safety: the pointer is never dereferenced, it only strips `Send`.
unsafe impl Sync for GuardNoSend {}
