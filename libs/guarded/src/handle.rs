// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use guarded_sync::{GuardNoSend, RawContfreeMutex, RawLock, RawSharedLock};

pub(crate) mod sealed {
    use super::RawSharedLock;

    /// Crate-internal access to a handle's value pointer and raw lock.
    ///
    /// Deliberately not nameable outside the crate: the only public paths to
    /// the value are the lock-holding guards.
    pub trait Access {
        type Target;
        type Raw: RawSharedLock;

        fn data_ptr(&self) -> *mut Self::Target;
        fn raw(&self) -> &Self::Raw;
    }
}

/// A handle whose value sits behind a shared/exclusive lock.
///
/// Implemented by all handle types in this crate; the [`xlock`] and
/// [`slock`] projections operate on any of them. The trait is sealed.
pub trait Protected: sealed::Access {}

impl<P: sealed::Access> Protected for P {}

/// A value guarded by a mutex, behind a shared handle.
///
/// Cloning the handle is cheap and shares both the value and the mutex: two
/// handles, one lock. The pair is destroyed when the last handle goes away.
///
/// Every access takes the lock for exactly the lifetime of the returned
/// guard. Shared recursion (a thread re-entering `read`, or `read` under
/// `write`) is supported by the recursive lock types; holding two exclusive
/// guards of the same handle on one thread is possible for the same reason
/// and must not be used for overlapping mutation.
pub struct Guarded<T, R: RawSharedLock = RawContfreeMutex> {
    pub(crate) mutex: Arc<R>,
    pub(crate) value: Arc<UnsafeCell<T>>,
}

// Safety: the value is only reachable through guards that hold the lock; the
// handle itself is just a pair of refcounted pointers.
unsafe impl<T: Send, R: RawSharedLock + Send + Sync> Send for Guarded<T, R> {}
// Safety: shared guards hand out `&T` (requires `T: Sync`), exclusive guards
// `&mut T` from any thread holding the handle (requires `T: Send`).
unsafe impl<T: Send + Sync, R: RawSharedLock + Send + Sync> Sync for Guarded<T, R> {}

impl<T, R: RawSharedLock + Default> Guarded<T, R> {
    /// Wraps a value in a fresh handle with a fresh mutex.
    pub fn new(value: T) -> Self {
        Self {
            mutex: Arc::new(R::default()),
            value: Arc::new(UnsafeCell::new(value)),
        }
    }

    /// Adopts an already-built boxed value.
    pub fn from_box(value: Box<T>) -> Self {
        Self::new(*value)
    }
}

impl<T, R: RawSharedLock> Guarded<T, R> {
    /// Acquires the lock in shared mode and returns a guard derefing to
    /// `&T`.
    pub fn read(&self) -> SharedGuard<'_, T, R> {
        slock(self)
    }

    /// Acquires the lock in exclusive mode and returns a guard derefing to
    /// `&mut T`.
    pub fn write(&self) -> ExclusiveGuard<'_, T, R> {
        xlock(self)
    }

    /// Attempts the shared lock without blocking.
    pub fn try_read(&self) -> Option<SharedGuard<'_, T, R>> {
        self.mutex.try_lock_shared().then(|| SharedGuard {
            value: self.value.get(),
            raw: &*self.mutex,
            _marker: PhantomData,
        })
    }

    /// Attempts the exclusive lock without blocking.
    pub fn try_write(&self) -> Option<ExclusiveGuard<'_, T, R>> {
        self.mutex.try_lock().then(|| ExclusiveGuard {
            value: self.value.get(),
            raw: &*self.mutex,
            _marker: PhantomData,
        })
    }
}

impl<T, R: RawSharedLock> Clone for Guarded<T, R> {
    /// Returns a handle to the *same* value under the *same* mutex.
    fn clone(&self) -> Self {
        Self {
            mutex: Arc::clone(&self.mutex),
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: Default, R: RawSharedLock + Default> Default for Guarded<T, R> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, R: RawSharedLock + Default> From<T> for Guarded<T, R> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T, R: RawSharedLock> sealed::Access for Guarded<T, R> {
    type Target = T;
    type Raw = R;

    fn data_ptr(&self) -> *mut T {
        self.value.get()
    }

    fn raw(&self) -> &R {
        &self.mutex
    }
}

impl<T: fmt::Debug, R: RawSharedLock> fmt::Debug for Guarded<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_read() {
            Some(guard) => f.debug_struct("Guarded").field("data", &&*guard).finish(),
            None => f.debug_struct("Guarded").field("data", &"<locked>").finish(),
        }
    }
}

/// A value guarded by a mutex, both stored inline.
///
/// Same access contract as [`Guarded`], but nothing is heap-allocated and
/// nothing is shared: cloning locks the source exclusively, copies the value
/// and builds an independent pair.
pub struct GuardedObj<T, R: RawSharedLock = RawContfreeMutex> {
    mutex: R,
    value: UnsafeCell<T>,
}

// Safety: as for `Guarded`.
unsafe impl<T: Send, R: RawSharedLock + Send> Send for GuardedObj<T, R> {}
// Safety: as for `Guarded`.
unsafe impl<T: Send + Sync, R: RawSharedLock + Sync> Sync for GuardedObj<T, R> {}

impl<T, R: RawSharedLock + Default> GuardedObj<T, R> {
    /// Wraps a value.
    pub fn new(value: T) -> Self {
        Self {
            mutex: R::default(),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T, R: RawSharedLock> GuardedObj<T, R> {
    /// Acquires the lock in shared mode and returns a guard derefing to
    /// `&T`.
    pub fn read(&self) -> SharedGuard<'_, T, R> {
        slock(self)
    }

    /// Acquires the lock in exclusive mode and returns a guard derefing to
    /// `&mut T`.
    pub fn write(&self) -> ExclusiveGuard<'_, T, R> {
        xlock(self)
    }

    /// Returns an owned copy of the value, made under the shared lock.
    pub fn to_value(&self) -> T
    where
        T: Clone,
    {
        slock(self).clone()
    }

    /// Consumes the handle, returning the value without locking.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Clone, R: RawSharedLock + Default> Clone for GuardedObj<T, R> {
    /// Copies the value while holding the source's exclusive lock.
    fn clone(&self) -> Self {
        Self::new(xlock(self).clone())
    }
}

impl<T: Default, R: RawSharedLock + Default> Default for GuardedObj<T, R> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, R: RawSharedLock> sealed::Access for GuardedObj<T, R> {
    type Target = T;
    type Raw = R;

    fn data_ptr(&self) -> *mut T {
        self.value.get()
    }

    fn raw(&self) -> &R {
        &self.mutex
    }
}

impl<T: fmt::Debug, R: RawSharedLock> fmt::Debug for GuardedObj<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mutex.try_lock_shared() {
            let guard = SharedGuard {
                value: self.value.get(),
                raw: &self.mutex,
                _marker: PhantomData,
            };
            f.debug_struct("GuardedObj").field("data", &&*guard).finish()
        } else {
            f.debug_struct("GuardedObj")
                .field("data", &"<locked>")
                .finish()
        }
    }
}

/// A [`Guarded`] without inherent access methods.
///
/// The only way to reach the value is through [`xlock`]/[`slock`], which
/// keeps every lock acquisition loud at the call site.
pub struct Hidden<T, R: RawSharedLock = RawContfreeMutex>(pub(crate) Guarded<T, R>);

impl<T, R: RawSharedLock + Default> Hidden<T, R> {
    /// Wraps a value in a fresh projection-only handle.
    pub fn new(value: T) -> Self {
        Self(Guarded::new(value))
    }
}

impl<T, R: RawSharedLock> Clone for Hidden<T, R> {
    /// Returns a handle to the *same* value under the *same* mutex.
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, R: RawSharedLock> sealed::Access for Hidden<T, R> {
    type Target = T;
    type Raw = R;

    fn data_ptr(&self) -> *mut T {
        self.0.value.get()
    }

    fn raw(&self) -> &R {
        &self.0.mutex
    }
}

/// A [`GuardedObj`] without inherent access methods.
pub struct HiddenObj<T, R: RawSharedLock = RawContfreeMutex>(GuardedObj<T, R>);

impl<T, R: RawSharedLock + Default> HiddenObj<T, R> {
    /// Wraps a value.
    pub fn new(value: T) -> Self {
        Self(GuardedObj::new(value))
    }
}

impl<T, R: RawSharedLock> HiddenObj<T, R> {
    /// Returns an owned copy of the value, made under the shared lock.
    pub fn to_value(&self) -> T
    where
        T: Clone,
    {
        self.0.to_value()
    }
}

impl<T: Clone, R: RawSharedLock + Default> Clone for HiddenObj<T, R> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, R: RawSharedLock> sealed::Access for HiddenObj<T, R> {
    type Target = T;
    type Raw = R;

    fn data_ptr(&self) -> *mut T {
        self.0.value.get()
    }

    fn raw(&self) -> &R {
        &self.0.mutex
    }
}

/// Acquires a handle's lock in exclusive mode and exposes the value for the
/// guard's lifetime.
///
/// The composition pattern for nested structures is shared-outside,
/// exclusive-inside: `slock` a container, find an element, `xlock` the
/// element's value.
pub fn xlock<P: Protected>(handle: &P) -> ExclusiveGuard<'_, P::Target, P::Raw> {
    handle.raw().lock();
    ExclusiveGuard {
        value: handle.data_ptr(),
        raw: handle.raw(),
        _marker: PhantomData,
    }
}

/// Acquires a handle's lock in shared mode and exposes the value for the
/// guard's lifetime.
pub fn slock<P: Protected>(handle: &P) -> SharedGuard<'_, P::Target, P::Raw> {
    handle.raw().lock_shared();
    SharedGuard {
        value: handle.data_ptr(),
        raw: handle.raw(),
        _marker: PhantomData,
    }
}

/// RAII guard holding a shared lock; derefs to `&T`.
///
/// The lock is released when the guard is dropped. The guard must stay on
/// the thread that acquired it.
#[clippy::has_significant_drop]
#[must_use = "if unused the lock will immediately unlock"]
pub struct SharedGuard<'a, T, R: RawSharedLock> {
    value: *const T,
    raw: &'a R,
    _marker: PhantomData<(&'a T, GuardNoSend)>,
}

// Safety: derefs only to `&T`.
unsafe impl<T: Sync, R: RawSharedLock + Sync> Sync for SharedGuard<'_, T, R> {}

impl<T, R: RawSharedLock> Deref for SharedGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the shared lock is held for the guard's whole lifetime, so
        // no exclusive guard can alias this value.
        unsafe { &*self.value }
    }
}

impl<T, R: RawSharedLock> Drop for SharedGuard<'_, T, R> {
    fn drop(&mut self) {
        // Safety: acquired when the guard was created.
        unsafe { self.raw.unlock_shared() }
    }
}

impl<T: fmt::Debug, R: RawSharedLock> fmt::Debug for SharedGuard<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display, R: RawSharedLock> fmt::Display for SharedGuard<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

/// RAII guard holding an exclusive lock; derefs to `&T` and `&mut T`.
#[clippy::has_significant_drop]
#[must_use = "if unused the lock will immediately unlock"]
pub struct ExclusiveGuard<'a, T, R: RawSharedLock> {
    value: *mut T,
    raw: &'a R,
    _marker: PhantomData<(&'a mut T, GuardNoSend)>,
}

// Safety: derefs to `&T`/`&mut T` only through the usual borrow of the
// guard itself.
unsafe impl<T: Sync, R: RawSharedLock + Sync> Sync for ExclusiveGuard<'_, T, R> {}

impl<T, R: RawSharedLock> Deref for ExclusiveGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the exclusive lock is held for the guard's whole lifetime.
        unsafe { &*self.value }
    }
}

impl<T, R: RawSharedLock> DerefMut for ExclusiveGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the exclusive lock is held for the guard's whole lifetime.
        unsafe { &mut *self.value }
    }
}

impl<T, R: RawSharedLock> Drop for ExclusiveGuard<'_, T, R> {
    fn drop(&mut self) {
        // Safety: acquired when the guard was created.
        unsafe { self.raw.unlock() }
    }
}

impl<T: fmt::Debug, R: RawSharedLock> fmt::Debug for ExclusiveGuard<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: fmt::Display, R: RawSharedLock> fmt::Display for ExclusiveGuard<'_, T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guarded_sync::RawRwSpinlock;

    #[derive(Eq, PartialEq, Debug, Clone)]
    struct NonCopy(i32);

    #[test]
    fn read_then_write() {
        let h = Guarded::<_, RawContfreeMutex>::new(NonCopy(10));
        assert_eq!(*h.read(), NonCopy(10));
        h.write().0 = 20;
        assert_eq!(*h.read(), NonCopy(20));
    }

    #[test]
    fn clones_share_value_and_lock() {
        // A non-recursive lock, so a second same-thread attempt observably
        // fails instead of counting recursion.
        let a = Guarded::<_, RawRwSpinlock>::new(0_i32);
        let b = a.clone();

        *a.write() = 7;
        assert_eq!(*b.read(), 7);

        let guard = a.write();
        assert!(b.try_write().is_none(), "one lock for both handles");
        drop(guard);
        assert!(b.try_write().is_some());
    }

    #[test]
    fn shared_guards_coexist() {
        let h = Guarded::<_, RawContfreeMutex>::new(5_u8);
        let a = h.read();
        let b = h.read();
        assert_eq!(*a, *b);
    }

    #[test]
    fn obj_clone_copies_independently() {
        let a = GuardedObj::<_, RawContfreeMutex>::new(NonCopy(1));
        let b = a.clone();
        a.write().0 = 2;
        assert_eq!(*b.read(), NonCopy(1));
        assert_eq!(a.to_value(), NonCopy(2));
        assert_eq!(a.into_inner(), NonCopy(2));
    }

    #[test]
    fn hidden_is_reached_through_projections_only() {
        let h = Hidden::<_, RawContfreeMutex>::new(vec![1_i32, 2, 3]);
        xlock(&h).push(4);
        assert_eq!(slock(&h).len(), 4);

        let o = HiddenObj::<_, RawContfreeMutex>::new(NonCopy(9));
        assert_eq!(xlock(&o).0, 9);
        assert_eq!(o.to_value(), NonCopy(9));
    }

    #[test]
    fn projection_composition_outer_shared_inner_exclusive() {
        let table: Guarded<Vec<Guarded<i32>>> =
            Guarded::new((0..4).map(Guarded::new).collect());

        let outer = slock(&table);
        for item in outer.iter() {
            *xlock(item) += 1;
        }
        drop(outer);

        let outer = slock(&table);
        let sum: i32 = outer.iter().map(|item| *slock(item)).sum();
        assert_eq!(sum, 1 + 2 + 3 + 4);
    }

    #[test]
    fn global_handle_via_lazy_init() {
        // `Guarded::new` allocates, so a global handle needs lazy
        // initialization.
        lazy_static::lazy_static! {
            static ref GLOBAL: Guarded<Vec<u32>> = Guarded::new(Vec::new());
        }

        GLOBAL.write().push(7);
        assert_eq!(*GLOBAL.read(), [7]);
    }

    #[test]
    fn debug_formats_through_the_lock() {
        let h = Guarded::<_, RawRwSpinlock>::new(3_u8);
        assert!(format!("{h:?}").contains('3'));
        let _guard = h.write();
        assert!(format!("{h:?}").contains("locked"));
    }
}
