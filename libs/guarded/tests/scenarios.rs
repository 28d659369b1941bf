// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios across handles, locks and the partitioned map.

use std::sync::Barrier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::thread;
use std::time::Duration;

use guarded::{
    Guarded, GuardedRecursive, LockTimedAny, Lockable, Mode, PartitionedMap, RawContfreeMutex,
    slock, xlock,
};
use rand::Rng;

const THREADS: usize = 4;
const INCREMENTS: usize = 100_000;

#[test]
fn increment_race_is_exact() {
    let counter: Guarded<u64> = Guarded::new(0_u64);

    thread::scope(|s| {
        for _ in 0..THREADS {
            let counter = counter.clone();
            s.spawn(move || {
                for _ in 0..INCREMENTS {
                    *counter.write() += 1;
                }
            });
        }
    });

    assert_eq!(*counter.read(), (THREADS * INCREMENTS) as u64);
}

#[test]
fn increment_race_is_exact_over_the_recursive_spinlock() {
    let counter = GuardedRecursive::new(0_u64);

    thread::scope(|s| {
        for _ in 0..THREADS {
            let counter = counter.clone();
            s.spawn(move || {
                for _ in 0..INCREMENTS {
                    *counter.write() += 1;
                }
            });
        }
    });

    assert_eq!(*counter.read(), (THREADS * INCREMENTS) as u64);
}

#[test]
fn recursive_shared_holds_out_a_writer() {
    let value: Guarded<i32> = Guarded::new(42_i32);
    let (tx, rx) = channel();

    let outer = value.read();
    let snapshot = *outer;
    let inner = value.read();
    assert_eq!(*inner, snapshot);

    let writer = {
        let value = value.clone();
        thread::spawn(move || {
            *value.write() = 0;
            tx.send(()).unwrap();
        })
    };

    assert!(
        rx.recv_timeout(Duration::from_millis(50)).is_err(),
        "writer got in under a shared guard"
    );
    drop(inner);
    assert!(
        rx.recv_timeout(Duration::from_millis(50)).is_err(),
        "writer got in under the outer shared guard"
    );
    drop(outer);

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    writer.join().unwrap();
    assert_eq!(*value.read(), 0);
}

#[test]
fn readers_observe_monotonic_counter() {
    const WRITES: u64 = 1_000;
    const READERS: usize = 8;

    let counter: Guarded<u64> = Guarded::new(0_u64);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        for _ in 0..READERS {
            let counter = counter.clone();
            let done = &done;
            s.spawn(move || {
                let mut last = 0_u64;
                while !done.load(Ordering::Acquire) {
                    let seen = *slock(&counter);
                    assert!(seen >= last, "counter went backwards");
                    last = seen;
                }
                assert!(last <= WRITES);
            });
        }

        let writer = counter.clone();
        let done = &done;
        s.spawn(move || {
            for _ in 0..WRITES {
                *xlock(&writer) += 1;
            }
            done.store(true, Ordering::Release);
        });
    });

    assert_eq!(*counter.read(), WRITES);
}

#[test]
fn partitioned_map_counts_are_exact() {
    const THREADS: usize = 10;
    const PER_THREAD: u64 = 10_000;

    let map: PartitionedMap<String, u64> =
        PartitionedMap::new(["a", "f", "k", "p", "u"].map(String::from));

    thread::scope(|s| {
        for _ in 0..THREADS {
            let map = map.clone();
            s.spawn(move || {
                for _ in 0..PER_THREAD {
                    for key in ["apple", "potato"] {
                        let shard = map.part(&key.to_string());
                        *xlock(shard).entry(key.to_string()).or_insert(0) += 1;
                    }
                }
            });
        }
    });

    let total = THREADS as u64 * PER_THREAD;
    assert_eq!(
        map.collect_equal(&"apple".into()),
        vec![("apple".into(), total)]
    );
    assert_eq!(
        map.collect_equal(&"potato".into()),
        vec![("potato".into(), total)]
    );

    map.remove_range(&"a".into(), &"c".into());

    let rest = map.collect_range(&"a".into(), &"z".into());
    assert_eq!(rest, vec![("potato".into(), total)]);
}

#[test]
fn opposite_order_sweeps_both_finish_in_infinite_mode() {
    const ROUNDS: usize = 200;

    let x: Guarded<u64> = Guarded::new(0_u64);
    let y: Guarded<u64> = Guarded::new(0_u64);
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        for forward in [true, false] {
            let x = x.clone();
            let y = y.clone();
            let barrier = &barrier;
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    barrier.wait();
                    let handles: [&dyn Lockable; 2] =
                        if forward { [&x, &y] } else { [&y, &x] };
                    let txn = LockTimedAny::infinite(&handles);
                    assert!(txn.owns_locks());
                }
            });
        }
    });
}

#[test]
fn failed_once_sweep_leaves_everything_unlocked() {
    let x: Guarded<u64> = Guarded::new(0_u64);
    let y: Guarded<u64> = Guarded::new(0_u64);

    let blocker = x.clone();
    let (locked_tx, locked_rx) = channel();
    let (release_tx, release_rx) = channel::<()>();
    let holder = thread::spawn(move || {
        let guard = blocker.write();
        locked_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        drop(guard);
    });
    locked_rx.recv().unwrap();

    // `x` is held by another thread, so the sweep must fail…
    let txn = LockTimedAny::with(
        Mode::Once,
        &[&y as &dyn Lockable, &x],
        Duration::from_micros(100),
        10,
    );
    assert!(!txn.owns_locks());
    drop(txn);

    // …and must have rolled `y` back.
    assert!(y.try_write().is_some());

    release_tx.send(()).unwrap();
    holder.join().unwrap();
    assert!(x.try_write().is_some());
}

#[test]
fn slot_overflow_readers_still_read_correctly() {
    // More reader threads than slots: the overflow threads serialize with
    // writers but results stay exact.
    const READERS: usize = 3;

    let value: Guarded<u64, RawContfreeMutex<2>> = Guarded::new(7);
    let barrier = Barrier::new(READERS);

    thread::scope(|s| {
        for _ in 0..READERS {
            let value = value.clone();
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for _ in 0..10_000 {
                    assert_eq!(*value.read(), 7);
                }
            });
        }
    });

    *value.write() = 8;
    assert_eq!(*value.read(), 8);
}

#[test]
fn randomized_reader_writer_mix_stays_consistent() {
    const OPS: usize = 20_000;

    // The value is kept as a pair that must always be equal; a torn or
    // unguarded access would surface as a mismatch.
    let value: Guarded<(u64, u64)> = Guarded::new((0_u64, 0_u64));

    thread::scope(|s| {
        for _ in 0..THREADS {
            let value = value.clone();
            s.spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..OPS {
                    if rng.random_range(0..10) == 0 {
                        let mut pair = value.write();
                        pair.0 += 1;
                        pair.1 += 1;
                    } else {
                        let pair = value.read();
                        assert_eq!(pair.0, pair.1);
                    }
                }
            });
        }
    });

    let pair = value.read();
    assert_eq!(pair.0, pair.1);
}
