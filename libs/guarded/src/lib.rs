// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread-safe access wrappers around arbitrary values.
//!
//! A [`Guarded<T>`] bundles a value with a mutex so that every access goes
//! through a lock: [`read`](Guarded::read) hands out a shared guard that
//! derefs to `&T`, [`write`](Guarded::write) an exclusive guard that derefs
//! to `&mut T`. There is no other path to the value, so unlocked access is
//! unrepresentable.
//!
//! The default mutex is the contention-free shared mutex from
//! [`guarded_sync`], whose readers touch only a per-thread cache line. Any
//! lock implementing [`RawSharedLock`] can be configured instead, and
//! exclusive-only locks participate through the [`Exclusive`] adapter:
//!
//! ```
//! use guarded::{Guarded, GuardedRecursive};
//!
//! let counter = Guarded::new(0_u64);
//! *counter.write() += 1;
//! assert_eq!(*counter.read(), 1);
//!
//! // same surface over the recursive spinlock
//! let serial = GuardedRecursive::new(String::from("hi"));
//! serial.write().push('!');
//! ```
//!
//! On top of the handles sit the [`xlock`]/[`slock`] projections, mutex
//! [linking](link_handles), the deadlock-avoiding [`LockTimedAny`] sweep and
//! the sharded [`PartitionedMap`].

mod handle;
mod link;
mod partitioned;
mod timed;

pub use guarded_sync::{
    Backoff, Exclusive, RawContfreeMutex, RawLock, RawRecursiveSpinlock, RawRwSpinlock,
    RawSharedLock,
};
#[cfg(not(loom))]
pub use guarded_sync::{RwSpinlock, RwSpinlockReadGuard, RwSpinlockWriteGuard};
pub use handle::{
    ExclusiveGuard, Guarded, GuardedObj, Hidden, HiddenObj, Protected, SharedGuard, slock, xlock,
};
pub use link::{Linkable, link_handles};
pub use partitioned::{Entries, PartitionedMap};
pub use timed::{DEADLOCK_TIMEOUT, LockTimedAny, Lockable, Mode, SPIN_ITERATIONS};

/// A handle whose readers and writers both take the recursive spinlock.
pub type GuardedRecursive<T> = Guarded<T, Exclusive<RawRecursiveSpinlock>>;
/// A handle over the conventional reader/writer spinlock.
pub type GuardedRw<T> = Guarded<T, RawRwSpinlock>;
