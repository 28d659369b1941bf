// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ops::{Add, Bound};
use std::collections::BTreeMap;
use std::sync::Arc;

use guarded_sync::{RawContfreeMutex, RawSharedLock};

use crate::{Guarded, SharedGuard, slock, xlock};

/// Key/value pairs collected out of a [`PartitionedMap`].
pub type Entries<K, V> = Vec<(K, V)>;

type Shard<K, V, R> = Guarded<BTreeMap<K, V>, R>;

/// An ordered map sharded over key ranges, each shard behind its own lock.
///
/// Partition boundaries are fixed at construction. A key belongs to the
/// shard with the greatest boundary not greater than the key; a key below
/// every boundary falls back to the *last* shard. Operations that touch a
/// single key lock only its shard, so writers on different shards do not
/// contend.
///
/// Range operations walk the affected shards one lock at a time: the result
/// is a view of each shard at the moment it was locked, not a snapshot of
/// the whole map. The walk honors the same fallback rule as single-key
/// lookup: when the lower bound precedes every boundary it also visits the
/// last shard, where such keys are stored, so a pair reachable through
/// [`collect_equal`](Self::collect_equal) is reachable through
/// [`collect_range`](Self::collect_range) over the same key too.
pub struct PartitionedMap<K, V, R: RawSharedLock = RawContfreeMutex> {
    partitions: Arc<BTreeMap<K, Shard<K, V, R>>>,
}

impl<K: Ord + Clone, V, R: RawSharedLock + Default> PartitionedMap<K, V, R> {
    /// Creates a map with one shard per boundary.
    ///
    /// # Panics
    ///
    /// Panics if `bounds` is empty.
    pub fn new(bounds: impl IntoIterator<Item = K>) -> Self {
        let partitions: BTreeMap<_, _> = bounds
            .into_iter()
            .map(|bound| (bound, Guarded::new(BTreeMap::new())))
            .collect();
        assert!(!partitions.is_empty(), "at least one partition boundary is required");

        Self {
            partitions: Arc::new(partitions),
        }
    }

    /// Creates a map with boundaries `start, start + step, …` up to and
    /// including `end`.
    pub fn with_range(start: K, end: K, step: K) -> Self
    where
        K: Add<Output = K>,
    {
        let mut bounds = Vec::new();
        let mut bound = start;
        while bound <= end {
            bounds.push(bound.clone());
            bound = bound + step.clone();
        }
        Self::new(bounds)
    }
}

impl<K: Ord + Clone + Default, V, R: RawSharedLock + Default> Default for PartitionedMap<K, V, R> {
    /// A single shard under the default boundary.
    fn default() -> Self {
        Self::new([K::default()])
    }
}

impl<K: Ord, V, R: RawSharedLock> PartitionedMap<K, V, R> {
    fn shard_entry(&self, key: &K) -> (&K, &Shard<K, V, R>) {
        self.partitions
            .range(..=key)
            .next_back()
            .or_else(|| self.partitions.last_key_value())
            .expect("partition map has at least one shard")
    }

    /// The shards owning keys in `[low, up]`, plus the one immediately past
    /// the shard owning `up`.
    ///
    /// Must agree with [`shard_entry`](Self::shard_entry) about where a key
    /// lives: when `low` precedes every boundary, keys in `[low, up]` may
    /// sit in the fallback (last) shard as well as in the leading shards,
    /// so the walk covers every shard instead of stopping past `up`.
    fn shards_between(&self, low: &K, up: &K) -> Vec<&Shard<K, V, R>> {
        let mut shards = Vec::new();

        match self.partitions.range(..=low).next_back() {
            Some((start, _)) => {
                let range = (Bound::Included(start), Bound::Unbounded);
                for (bound, shard) in self.partitions.range(range) {
                    let past = bound > up;
                    shards.push(shard);
                    if past {
                        break;
                    }
                }
            }
            None => shards.extend(self.partitions.values()),
        }

        shards
    }

    /// Returns the shard owning `key`.
    pub fn part(&self, key: &K) -> &Guarded<BTreeMap<K, V>, R> {
        self.shard_entry(key).1
    }

    /// Returns the boundary of the shard owning `key`.
    pub fn part_key(&self, key: &K) -> &K {
        self.shard_entry(key).0
    }

    /// Shared-locks the shard owning `key` and returns its guard.
    pub fn read_part(&self, key: &K) -> SharedGuard<'_, BTreeMap<K, V>, R> {
        slock(self.part(key))
    }

    /// Inserts a pair, exclusively locking only the owning shard.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut shard = xlock(self.part(&key));
        shard.insert(key, value)
    }

    /// Removes a key, exclusively locking only the owning shard.
    pub fn remove(&self, key: &K) -> Option<V> {
        xlock(self.part(key)).remove(key)
    }

    /// Collects the pair stored under `key`, shared-locking one shard.
    pub fn collect_equal(&self, key: &K) -> Entries<K, V>
    where
        K: Clone,
        V: Clone,
    {
        let shard = slock(self.part(key));
        shard
            .range(key..=key)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Collects every pair with key in `[low, up]`, shared-locking each
    /// affected shard in turn.
    pub fn collect_range(&self, low: &K, up: &K) -> Entries<K, V>
    where
        K: Clone,
        V: Clone,
    {
        let mut out = Vec::new();
        for shard in self.shards_between(low, up) {
            let shard = slock(shard);
            out.extend(shard.range(low..=up).map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }

    /// Removes every pair with key in `[low, up]`, exclusively locking each
    /// affected shard in turn.
    pub fn remove_range(&self, low: &K, up: &K) {
        for shard in self.shards_between(low, up) {
            xlock(shard).retain(|key, _| key < low || key > up);
        }
    }

    /// Counts pairs across all shards, shared-locking each in turn.
    ///
    /// An approximation while writers are active: shards are not counted at
    /// one common instant.
    pub fn len(&self) -> usize {
        self.partitions.values().map(|shard| slock(shard).len()).sum()
    }

    /// Whether no shard holds any pair (same caveat as [`len`](Self::len)).
    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(|shard| slock(shard).is_empty())
    }

    /// Clears every shard, exclusively locking each in turn.
    pub fn clear(&self) {
        for shard in self.partitions.values() {
            xlock(shard).clear();
        }
    }
}

impl<K, V, R: RawSharedLock> Clone for PartitionedMap<K, V, R> {
    /// Returns a handle to the *same* shards; nothing is copied.
    fn clone(&self) -> Self {
        Self {
            partitions: Arc::clone(&self.partitions),
        }
    }
}
