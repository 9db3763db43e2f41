// Read/unread tracking per stream. Every mutation is a read-modify-write of
// the stream's state in the store, so two calls for the same stream must not
// interleave. Instead of a lock per stream, a fixed table of locks is indexed
// by a hash of the stream: unrelated streams can share a stripe and wait on
// each other, in exchange for a table that never grows.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::partition::TenantId;

// fixed so a stream lands on the same stripe in every process
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

pub struct StripedLocks {
    stripes: Box<[Mutex<()>]>,
    hasher: ahash::RandomState,
}

impl StripedLocks {
    /// A table of `count` locks. A count of zero is treated as one.
    pub fn new(count: usize) -> Self {
        let stripes = (0..count.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            stripes,
            hasher: ahash::RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }

    pub fn stripe<K: Hash>(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) % self.stripes.len() as u64) as usize
    }

    pub fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(key)].lock()
    }
}

/// What has been read in one stream.
///
/// An activity is read when it was marked read explicitly, or when it is at
/// or before the watermark and was not marked unread since.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadState {
    pub watermark: Option<i64>,
    pub read: BTreeSet<u64>,
    pub unread: BTreeSet<u64>,
}

impl ReadState {
    pub fn is_read(&self, activity: u64, timestamp: i64) -> bool {
        if self.unread.contains(&activity) {
            return false;
        }
        self.read.contains(&activity) || self.watermark.is_some_and(|w| timestamp <= w)
    }
}

/// Where read state lives, and where the activities of a stream can be
/// listed. Loads and stores are not atomic with each other.
pub trait ReadStore: Send + Sync {
    fn load(&self, tenant: &TenantId, stream: &str) -> ReadState;
    fn store(&self, tenant: &TenantId, stream: &str, state: ReadState);
    /// `(activity id, timestamp)` of every activity in the stream.
    fn activities(&self, tenant: &TenantId, stream: &str) -> Vec<(u64, i64)>;
}

impl<S: ReadStore + ?Sized> ReadStore for Arc<S> {
    fn load(&self, tenant: &TenantId, stream: &str) -> ReadState {
        (**self).load(tenant, stream)
    }

    fn store(&self, tenant: &TenantId, stream: &str, state: ReadState) {
        (**self).store(tenant, stream, state)
    }

    fn activities(&self, tenant: &TenantId, stream: &str) -> Vec<(u64, i64)> {
        (**self).activities(tenant, stream)
    }
}

pub struct ReadTracker<S> {
    store: S,
    locks: StripedLocks,
}

impl<S: ReadStore> ReadTracker<S> {
    pub fn new(store: S, stripes: usize) -> Self {
        Self {
            store,
            locks: StripedLocks::new(stripes),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn mark_read(&self, tenant: &TenantId, stream: &str, activities: &[u64]) {
        self.update(tenant, stream, |state| {
            for id in activities {
                state.unread.remove(id);
                state.read.insert(*id);
            }
        });
    }

    pub fn mark_unread(&self, tenant: &TenantId, stream: &str, activities: &[u64]) {
        self.update(tenant, stream, |state| {
            for id in activities {
                state.read.remove(id);
                state.unread.insert(*id);
            }
        });
    }

    /// Marks everything up to and including `up_to` read, overriding earlier
    /// unread marks.
    pub fn mark_all_read(&self, tenant: &TenantId, stream: &str, up_to: i64) {
        self.update(tenant, stream, |state| {
            state.watermark = Some(state.watermark.map_or(up_to, |w| w.max(up_to)));
            state.unread.clear();
        });
    }

    /// Unread activity IDs of a stream, ascending.
    pub fn unread(&self, tenant: &TenantId, stream: &str) -> Vec<u64> {
        let _guard = self.locks.lock(&(tenant, stream));
        let state = self.store.load(tenant, stream);
        let mut unread: Vec<u64> = self
            .store
            .activities(tenant, stream)
            .into_iter()
            .filter(|(id, ts)| !state.is_read(*id, *ts))
            .map(|(id, _)| id)
            .collect();
        unread.sort_unstable();
        unread.dedup();
        unread
    }

    fn update(&self, tenant: &TenantId, stream: &str, f: impl FnOnce(&mut ReadState)) {
        let _guard = self.locks.lock(&(tenant, stream));
        let mut state = self.store.load(tenant, stream);
        f(&mut state);
        debug!(%tenant, stream, read = state.read.len(), "read state updated");
        self.store.store(tenant, stream, state);
    }
}
