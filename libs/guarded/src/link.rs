// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use guarded_sync::{RawContfreeMutex, RawSharedLock};

use crate::{Guarded, Hidden};

/// A handle whose mutex can be swapped out by [`link_handles`].
///
/// Implemented by the heap-sharing handle types ([`Guarded`], [`Hidden`]);
/// the inline variants own their mutex and cannot take part.
pub trait Linkable {
    type Raw: RawSharedLock;

    #[doc(hidden)]
    fn mutex(&self) -> &Arc<Self::Raw>;

    /// Reseats this handle's mutex, returning the old one.
    ///
    /// # Safety
    ///
    /// No critical section may be active on this handle's old mutex in any
    /// other thread, and no other clone of this handle may be in use while
    /// the swap happens: a clone still pointing at the old mutex would no
    /// longer exclude accesses made through this handle.
    #[doc(hidden)]
    unsafe fn replace_mutex(&mut self, mutex: Arc<Self::Raw>) -> Arc<Self::Raw>;
}

impl<T, R: RawSharedLock> Linkable for Guarded<T, R> {
    type Raw = R;

    fn mutex(&self) -> &Arc<R> {
        &self.mutex
    }

    unsafe fn replace_mutex(&mut self, mutex: Arc<R>) -> Arc<R> {
        core::mem::replace(&mut self.mutex, mutex)
    }
}

impl<T, R: RawSharedLock> Linkable for Hidden<T, R> {
    type Raw = R;

    fn mutex(&self) -> &Arc<R> {
        self.0.mutex()
    }

    unsafe fn replace_mutex(&mut self, mutex: Arc<R>) -> Arc<R> {
        // Safety: forwarded precondition
        unsafe { self.0.replace_mutex(mutex) }
    }
}

/// Fuses the mutexes of several handles into one critical section.
///
/// After linking, all handles use the first handle's mutex; locking any of
/// them excludes access through all of them. The values themselves stay
/// where they are. Each old mutex is locked while its handle is reseated
/// and released before the old mutex object is dropped.
///
/// This is a heavyweight setup operation, meant to run during construction
/// of a handle group, not a per-operation combinator.
///
/// # Safety
///
/// No critical section may be active on any involved handle in another
/// thread, and no other clones of `others` may be in use concurrently:
/// clones keep the old mutex and would no longer be excluded by the new
/// one.
pub unsafe fn link_handles<R: RawSharedLock>(
    first: &dyn Linkable<Raw = R>,
    others: &mut [&mut dyn Linkable<Raw = R>],
) {
    let shared = Arc::clone(first.mutex());
    shared.lock();

    let mut retired = Vec::with_capacity(others.len());
    for handle in others.iter_mut() {
        handle.mutex().lock();
        // Safety: caller guarantees the handles are quiescent.
        retired.push(unsafe { handle.replace_mutex(Arc::clone(&shared)) });
    }

    // Release on the old mutex objects, which are kept alive until after
    // the unlock by the `retired` vector.
    for old in retired.iter().rev() {
        // Safety: locked above
        unsafe { old.unlock() };
    }
    // Safety: locked above
    unsafe { shared.unlock() };

    log::debug!("linked {} handles into one critical section", others.len() + 1);
}
