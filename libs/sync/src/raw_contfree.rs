// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::{Cell, RefCell};
use core::mem;
use core::ptr;
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use static_assertions::const_assert;

use crate::loom::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use crate::thread_id::current_thread;
use crate::{Backoff, RawLock, RawSharedLock};

/// Slot of a destroyed mutex; stale registry entries self-purge on sight.
const TOMBSTONE: i32 = -1;
/// Slot not claimed by any thread.
const FREE: i32 = 0;
/// Slot claimed by a thread that currently holds no shared lock. Values
/// above this encode the shared recursion depth plus one, folding presence
/// and recursion into a single atomic.
const REGISTERED: i32 = 1;

type SlotArray = [CachePadded<AtomicI32>];

const_assert!(mem::align_of::<CachePadded<AtomicI32>>() >= 64);

/// A contention-free shared mutex.
///
/// A reader/writer lock whose shared path touches only a per-thread cache
/// line: the first `N` distinct threads to take the shared lock each claim
/// one padded slot and from then on publish their presence by bumping that
/// slot alone, re-checking a single writer-intent flag. There is no shared
/// reader counter, so under a read-heavy workload no cache line ping-pongs
/// between readers.
///
/// Writers pay for this: taking the exclusive lock sweeps every slot and
/// can be starved by a steady stream of readers. Threads beyond the first
/// `N` never get a slot and are serialized with writers.
///
/// Same-thread recursion is supported for X→X, X→S and S→S acquisitions.
/// S→X would deadlock and trips a debug assertion instead.
pub struct RawContfreeMutex<const N: usize = 36> {
    want_x: AtomicBool,
    owner: AtomicUsize,
    // Exclusive recursion depth, also counts shared acquisitions of threads
    // that went down the exclusive path. Only touched by `owner`.
    xdepth: Cell<usize>,
    // Kept alive by registry entries of idle threads even after the mutex
    // itself is gone, so they can still release their slot.
    slots: Arc<SlotArray>,
}

// Safety: `xdepth` is only accessed by the thread recorded in `owner`, all
// other state is atomic.
unsafe impl<const N: usize> Send for RawContfreeMutex<N> {}
// Safety: see above.
unsafe impl<const N: usize> Sync for RawContfreeMutex<N> {}

/// Per-thread record of one (thread, mutex) registration.
///
/// Holds a strong reference to the slot array so the slot can be released
/// at thread exit even if the mutex was destroyed first. `slot` is `None`
/// when registration found the array full: that thread permanently uses the
/// exclusive path for this mutex.
struct Registration {
    slot: Option<usize>,
    slots: Arc<SlotArray>,
}

impl Registration {
    fn is_dead(&self) -> bool {
        self.slots
            .first()
            .is_some_and(|s| s.load(Ordering::Relaxed) == TOMBSTONE)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(i) = self.slot {
            // Release the slot unless the array is tombstoned. The thread
            // holds no shared lock at de-registration time, so the slot is
            // either REGISTERED or TOMBSTONE.
            let _ = self.slots[i].compare_exchange(
                REGISTERED,
                FREE,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }
}

crate::loom::thread_local! {
    static REGISTRY: RefCell<HashMap<usize, Registration>> = RefCell::new(HashMap::new());
}

impl<const N: usize> RawContfreeMutex<N> {
    /// Creates a new unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            want_x: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            xdepth: Cell::new(0),
            slots: (0..N).map(|_| CachePadded::new(AtomicI32::new(FREE))).collect(),
        }
    }

    fn key(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    /// Returns this thread's slot index without attempting registration.
    ///
    /// Validates that the cached entry belongs to *this* mutex's slot array:
    /// an entry left behind by a destroyed mutex that happened to live at
    /// the same address must not be resurrected.
    fn lookup_slot(&self) -> Option<usize> {
        REGISTRY.with(|r| {
            r.borrow()
                .get(&self.key())
                .filter(|entry| Arc::ptr_eq(&entry.slots, &self.slots))
                .and_then(|entry| entry.slot)
        })
    }

    /// Returns this thread's slot index, registering on first contact.
    ///
    /// Registration is attempted at most once per thread per mutex; if the
    /// slot array is full the outcome is cached and the thread permanently
    /// falls back to the exclusive path.
    fn register(&self) -> Option<usize> {
        REGISTRY.with(|r| {
            let mut map = r.borrow_mut();

            match map.get(&self.key()) {
                Some(entry) if Arc::ptr_eq(&entry.slots, &self.slots) => return entry.slot,
                Some(_) => {
                    // Address reuse: stale entry of a destroyed mutex.
                    map.remove(&self.key());
                }
                None => {}
            }

            // First contact with this mutex. Drop records of destroyed
            // mutexes while we are here anyway.
            map.retain(|_, entry| !entry.is_dead());

            let mut claimed = None;
            for (i, slot) in self.slots.iter().enumerate() {
                if slot
                    .compare_exchange(FREE, REGISTERED, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    claimed = Some(i);
                    break;
                }
            }

            match claimed {
                Some(i) => log::trace!("registered reader slot {} of {}", i, N),
                None => log::trace!("slot array full, thread falls back to exclusive path"),
            }

            map.insert(
                self.key(),
                Registration {
                    slot: claimed,
                    slots: Arc::clone(&self.slots),
                },
            );
            claimed
        })
    }

    /// Acquires the lock in shared mode.
    ///
    /// Registered threads publish their presence on their own slot and back
    /// off while a writer has announced intent. Unregistered threads (and
    /// X→S recursion) go down the exclusive path.
    pub fn lock_shared(&self) {
        let id = current_thread().get();

        if self.owner.load(Ordering::Acquire) == id {
            // X→S recursion, or the shared recursion of a slotless thread.
            self.xdepth.set(self.xdepth.get() + 1);
            return;
        }

        if let Some(i) = self.register() {
            let slot = &self.slots[i];
            let depth = slot.load(Ordering::Acquire);
            debug_assert!(depth >= REGISTERED);

            if depth > REGISTERED {
                // Recursive shared acquisition, presence is already visible.
                slot.store(depth + 1, Ordering::Release);
            } else {
                // The SeqCst store-load fence is what keeps a writer from
                // missing our presence: either the writer's slot sweep sees
                // the bumped slot, or we see `want_x` and retreat.
                slot.store(depth + 1, Ordering::SeqCst);
                while self.want_x.load(Ordering::SeqCst) {
                    slot.store(depth, Ordering::SeqCst);
                    let mut boff = Backoff::default();
                    while self.want_x.load(Ordering::SeqCst) {
                        boff.spin();
                    }
                    slot.store(depth + 1, Ordering::SeqCst);
                }
            }
        } else {
            self.lock_exclusive_path(id);
            self.xdepth.set(1);
        }
    }

    /// Attempts to acquire the lock in shared mode without blocking.
    pub fn try_lock_shared(&self) -> bool {
        let id = current_thread().get();

        if self.owner.load(Ordering::Acquire) == id {
            self.xdepth.set(self.xdepth.get() + 1);
            return true;
        }

        if let Some(i) = self.register() {
            let slot = &self.slots[i];
            let depth = slot.load(Ordering::Acquire);
            debug_assert!(depth >= REGISTERED);

            if depth > REGISTERED {
                slot.store(depth + 1, Ordering::Release);
                return true;
            }

            slot.store(depth + 1, Ordering::SeqCst);
            if self.want_x.load(Ordering::SeqCst) {
                slot.store(depth, Ordering::SeqCst);
                return false;
            }
            true
        } else {
            if self
                .want_x
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                return false;
            }
            self.owner.store(id, Ordering::Release);
            self.xdepth.set(1);
            true
        }
    }

    /// Releases one shared acquisition.
    ///
    /// # Safety
    ///
    /// The shared lock must be held by the current thread.
    pub unsafe fn unlock_shared(&self) {
        if let Some(i) = self.lookup_slot() {
            let slot = &self.slots[i];
            let depth = slot.load(Ordering::Acquire);
            if depth > REGISTERED {
                slot.store(depth - 1, Ordering::Release);
                return;
            }
        }

        // Shared lock taken through the exclusive path (slotless thread or
        // X→S recursion).
        self.unlock_exclusive_path();
    }

    /// Acquires the lock in exclusive mode.
    ///
    /// Upgrading a held shared lock is not supported: a registered thread
    /// whose slot shows an active shared acquisition trips a debug
    /// assertion here and deadlocks in release builds.
    pub fn lock(&self) {
        let id = current_thread().get();

        if self.owner.load(Ordering::Acquire) == id {
            self.xdepth.set(self.xdepth.get() + 1);
            return;
        }

        if let Some(i) = self.lookup_slot() {
            debug_assert_eq!(
                self.slots[i].load(Ordering::Acquire),
                REGISTERED,
                "shared-to-exclusive upgrade"
            );
        }

        self.lock_exclusive_path(id);

        // No new reader publishes a slot while `want_x` is set; wait out the
        // ones that were already inside.
        for slot in self.slots.iter() {
            let mut boff = Backoff::default();
            while slot.load(Ordering::SeqCst) > REGISTERED {
                boff.spin();
            }
        }

        self.xdepth.set(1);
    }

    /// Attempts to acquire the lock in exclusive mode without blocking.
    ///
    /// Rolls back the writer-intent flag if any reader is found inside.
    pub fn try_lock(&self) -> bool {
        let id = current_thread().get();

        if self.owner.load(Ordering::Acquire) == id {
            self.xdepth.set(self.xdepth.get() + 1);
            return true;
        }

        if let Some(i) = self.lookup_slot() {
            if self.slots[i].load(Ordering::Acquire) > REGISTERED {
                // Would be an upgrade.
                return false;
            }
        }

        if self
            .want_x
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.owner.store(id, Ordering::Release);

        for slot in self.slots.iter() {
            if slot.load(Ordering::SeqCst) > REGISTERED {
                self.owner.store(0, Ordering::Release);
                self.want_x.store(false, Ordering::Release);
                return false;
            }
        }

        self.xdepth.set(1);
        true
    }

    /// Releases one exclusive acquisition.
    ///
    /// # Safety
    ///
    /// The exclusive lock must be held by the current thread.
    pub unsafe fn unlock(&self) {
        self.unlock_exclusive_path();
    }

    /// Checks whether the lock is held in either mode.
    pub fn is_locked(&self) -> bool {
        self.want_x.load(Ordering::Relaxed)
            || self
                .slots
                .iter()
                .any(|slot| slot.load(Ordering::Relaxed) > REGISTERED)
    }

    /// Claims writer intent and records ownership. Caller is not the owner.
    fn lock_exclusive_path(&self, id: usize) {
        let mut boff = Backoff::default();
        while self
            .want_x
            .compare_exchange_weak(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            boff.spin();
        }
        self.owner.store(id, Ordering::Release);
    }

    fn unlock_exclusive_path(&self) {
        debug_assert_eq!(self.owner.load(Ordering::Acquire), current_thread().get());
        debug_assert!(self.xdepth.get() > 0);

        let depth = self.xdepth.get() - 1;
        self.xdepth.set(depth);
        if depth == 0 {
            self.owner.store(0, Ordering::Release);
            self.want_x.store(false, Ordering::Release);
        }
    }
}

impl<const N: usize> Default for RawContfreeMutex<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for RawContfreeMutex<N> {
    fn drop(&mut self) {
        // Tombstone every slot so idle registrations in other threads'
        // registries can detect that this mutex is gone.
        for slot in self.slots.iter() {
            slot.store(TOMBSTONE, Ordering::SeqCst);
        }
    }
}

// Safety: `want_x` plus the slot sweep admit a single writer that excludes
// itself from every registered reader; the SeqCst protocol on slots and
// `want_x` orders reader presence against writer intent.
unsafe impl<const N: usize> RawLock for RawContfreeMutex<N> {
    fn lock(&self) {
        RawContfreeMutex::lock(self);
    }

    fn try_lock(&self) -> bool {
        RawContfreeMutex::try_lock(self)
    }

    unsafe fn unlock(&self) {
        // Safety: forwarded precondition
        unsafe { RawContfreeMutex::unlock(self) }
    }

    fn is_locked(&self) -> bool {
        RawContfreeMutex::is_locked(self)
    }
}

// Safety: readers publish presence on their slot (or take the exclusive
// path) before touching data, and retreat whenever writer intent is set.
unsafe impl<const N: usize> RawSharedLock for RawContfreeMutex<N> {
    fn lock_shared(&self) {
        RawContfreeMutex::lock_shared(self);
    }

    fn try_lock_shared(&self) -> bool {
        RawContfreeMutex::try_lock_shared(self)
    }

    unsafe fn unlock_shared(&self) {
        // Safety: forwarded precondition
        unsafe { RawContfreeMutex::unlock_shared(self) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn shared_recursion_counts_on_the_slot() {
        let m = RawContfreeMutex::<4>::new();

        m.lock_shared();
        m.lock_shared();
        let i = m.lookup_slot().unwrap();
        assert_eq!(m.slots[i].load(Ordering::Relaxed), 3);

        // Safety: locked twice above
        unsafe {
            m.unlock_shared();
            m.unlock_shared();
        }
        assert_eq!(m.slots[i].load(Ordering::Relaxed), REGISTERED);
        assert!(!m.is_locked());
    }

    #[test]
    fn exclusive_recursion_and_downgrade_to_shared() {
        let m = RawContfreeMutex::<4>::new();

        m.lock();
        m.lock();
        m.lock_shared(); // X→S on the same thread
        assert!(m.is_locked());

        // Safety: three acquisitions above
        unsafe {
            m.unlock_shared();
            m.unlock();
            m.unlock();
        }
        assert!(!m.is_locked());
    }

    #[test]
    fn try_lock_fails_under_reader() {
        let m = std::sync::Arc::new(RawContfreeMutex::<4>::new());
        m.lock_shared();

        let contender = std::sync::Arc::clone(&m);
        std::thread::spawn(move || {
            assert!(!contender.try_lock());
            assert!(contender.try_lock_shared());
            // Safety: locked right above
            unsafe { contender.unlock_shared() };
        })
        .join()
        .unwrap();

        // Safety: locked above
        unsafe { m.unlock_shared() };
        assert!(m.try_lock());
        // Safety: locked right above
        unsafe { m.unlock() };
    }

    #[test]
    fn writer_waits_for_recursive_reader() {
        let m = std::sync::Arc::new(RawContfreeMutex::<4>::new());
        let (tx, rx) = channel();

        m.lock_shared();
        m.lock_shared();

        let writer = {
            let m = std::sync::Arc::clone(&m);
            std::thread::spawn(move || {
                m.lock();
                tx.send(()).unwrap();
                // Safety: locked right above
                unsafe { m.unlock() };
            })
        };

        // The writer must not get in while we hold either level.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        // Safety: locked twice above
        unsafe { m.unlock_shared() };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        // Safety: one level still held
        unsafe { m.unlock_shared() };

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
    }

    #[test]
    fn slot_exhaustion_falls_back_to_exclusive() {
        let m = std::sync::Arc::new(RawContfreeMutex::<1>::new());

        // Claim the only slot from this thread.
        m.lock_shared();

        let overflow = std::sync::Arc::clone(&m);
        let t = std::thread::spawn(move || {
            // No slot left: this thread serializes with writers but must
            // still complete.
            overflow.lock_shared();
            overflow.lock_shared();
            // Safety: locked twice right above
            unsafe {
                overflow.unlock_shared();
                overflow.unlock_shared();
            }
        });

        t.join().unwrap();
        // Safety: locked above
        unsafe { m.unlock_shared() };
        assert!(!m.is_locked());
    }

    #[test]
    fn tombstoned_registration_is_purged() {
        let first = Box::new(RawContfreeMutex::<2>::new());
        first.lock_shared();
        // Safety: locked right above
        unsafe { first.unlock_shared() };

        let stale = first.slots.first().unwrap() as *const CachePadded<AtomicI32>;
        drop(first);

        // The registry still holds the old entry; the next registration on
        // any contention-free mutex purges it.
        let second = RawContfreeMutex::<2>::new();
        second.lock_shared();
        // Safety: locked right above
        unsafe { second.unlock_shared() };

        REGISTRY.with(|r| {
            assert!(
                r.borrow()
                    .values()
                    .all(|entry| !ptr::eq(entry.slots.first().unwrap(), stale))
            );
        });
    }

    #[test]
    fn static_mutex_via_lazy_init() {
        // `new` allocates the slot array, so a global instance needs lazy
        // initialization.
        lazy_static::lazy_static! {
            static ref GLOBAL: RawContfreeMutex<4> = RawContfreeMutex::new();
        }

        GLOBAL.lock_shared();
        // Safety: locked right above
        unsafe { GLOBAL.unlock_shared() };
        assert!(GLOBAL.try_lock());
        // Safety: locked right above
        unsafe { GLOBAL.unlock() };
    }

    #[test]
    fn randomized_lock_storm_counts_exactly() {
        use rand::Rng;

        struct Ptr(std::sync::Arc<core::cell::UnsafeCell<u64>>);
        // Safety: the cell is only touched under the mutex.
        unsafe impl Send for Ptr {}

        let m = std::sync::Arc::new(RawContfreeMutex::<8>::new());
        let value = std::sync::Arc::new(core::cell::UnsafeCell::new(0_u64));

        let mut threads = Vec::new();
        for _ in 0..4 {
            let m = std::sync::Arc::clone(&m);
            let value = Ptr(std::sync::Arc::clone(&value));
            threads.push(std::thread::spawn(move || {
                let value = value;
                let mut rng = rand::rng();
                let mut written = 0_u64;
                for _ in 0..10_000 {
                    if rng.random_range(0..4) == 0 {
                        m.lock();
                        // Safety: exclusive lock held
                        unsafe { *value.0.get() += 1 };
                        written += 1;
                        // Safety: locked above
                        unsafe { m.unlock() };
                    } else {
                        m.lock_shared();
                        // Safety: shared lock held, writers are excluded
                        let _ = unsafe { *value.0.get() };
                        // Safety: locked above
                        unsafe { m.unlock_shared() };
                    }
                }
                written
            }));
        }

        let expected: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        m.lock_shared();
        // Safety: shared lock held
        assert_eq!(unsafe { *value.get() }, expected);
        // Safety: locked above
        unsafe { m.unlock_shared() };
    }

    #[test]
    fn registration_is_cached_per_mutex() {
        let m = RawContfreeMutex::<4>::new();
        m.lock_shared();
        // Safety: locked right above
        unsafe { m.unlock_shared() };
        let first = m.lookup_slot();
        m.lock_shared();
        // Safety: locked right above
        unsafe { m.unlock_shared() };
        assert_eq!(first, m.lookup_slot());
        assert!(first.is_some());
    }
}
