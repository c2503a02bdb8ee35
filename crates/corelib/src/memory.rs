//! Memory accounting for caches.
//!
//! A [`MemoryBudget`] is a shared counter that containers charge as they grow
//! and refund as they shrink. [`AccountedMap`] wraps a `BTreeMap` and keeps
//! the budget in step with every insert, removal and in-place mutation, so
//! the total is observable without hooking the allocator.

use std::borrow::Borrow;
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Heap plus inline size attributed to a value.
pub trait MemoryFootprint {
    fn memory_footprint(&self) -> usize;
}

impl MemoryFootprint for String {
    fn memory_footprint(&self) -> usize {
        std::mem::size_of::<String>() + self.capacity()
    }
}

impl MemoryFootprint for i64 {
    fn memory_footprint(&self) -> usize {
        std::mem::size_of::<i64>()
    }
}

/// Shared byte counter with an optional soft limit.
///
/// The limit is advisory: charging never fails, callers consult
/// [`limit_exceeded`](Self::limit_exceeded) to decide when to shed memory.
pub struct MemoryBudget {
    id: String,
    limit: Option<i64>,
    consumption: AtomicI64,
    peak: AtomicI64,
}

impl MemoryBudget {
    pub fn new(id: impl Into<String>, limit: Option<i64>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            limit,
            consumption: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        })
    }

    pub fn unlimited(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    /// Charge (positive) or refund (negative) `bytes`.
    pub fn consume(&self, bytes: i64) {
        if bytes == 0 {
            return;
        }
        let now = self.consumption.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(now, Ordering::AcqRel);
        if let Some(limit) = self.limit {
            if now > limit && now - bytes <= limit {
                tracing::debug!(budget = %self.id, consumption = now, limit, "memory budget exceeded");
            }
        }
        metrics::gauge!("rpc.memory_budget.bytes", "budget" => self.id.clone()).set(now as f64);
    }

    pub fn release(&self, bytes: i64) {
        self.consume(-bytes);
    }

    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Acquire)
    }

    pub fn peak_consumption(&self) -> i64 {
        self.peak.load(Ordering::Acquire)
    }

    pub fn limit_exceeded(&self) -> bool {
        self.limit.map_or(false, |limit| self.consumption() > limit)
    }
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("id", &self.id)
            .field("consumption", &self.consumption())
            .field("peak", &self.peak_consumption())
            .field("limit", &self.limit)
            .finish()
    }
}

/// Ordered map whose entries are charged to a [`MemoryBudget`].
///
/// Values must not be mutated behind the map's back: [`get_mut`](Self::get_mut)
/// hands out an [`AccountedMut`] guard that re-measures the value when it is
/// dropped.
pub struct AccountedMap<K, V>
where
    K: Ord + MemoryFootprint,
    V: MemoryFootprint,
{
    entries: BTreeMap<K, V>,
    budget: Arc<MemoryBudget>,
    charged: i64,
}

/// Mutable access to one value of an [`AccountedMap`].
pub struct AccountedMut<'a, V: MemoryFootprint> {
    value: &'a mut V,
    before: usize,
    budget: &'a MemoryBudget,
    charged: &'a mut i64,
}

impl<V: MemoryFootprint> Deref for AccountedMut<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value
    }
}

impl<V: MemoryFootprint> DerefMut for AccountedMut<'_, V> {
    fn deref_mut(&mut self) -> &mut V {
        self.value
    }
}

impl<V: MemoryFootprint> Drop for AccountedMut<'_, V> {
    fn drop(&mut self) {
        let delta = self.value.memory_footprint() as i64 - self.before as i64;
        *self.charged += delta;
        self.budget.consume(delta);
    }
}

impl<K, V> AccountedMap<K, V>
where
    K: Ord + MemoryFootprint,
    V: MemoryFootprint,
{
    pub fn new(budget: Arc<MemoryBudget>) -> Self {
        Self {
            entries: BTreeMap::new(),
            budget,
            charged: 0,
        }
    }

    fn entry_footprint(key: &K, value: &V) -> i64 {
        (key.memory_footprint() + value.memory_footprint()) as i64
    }

    fn charge(&mut self, bytes: i64) {
        self.charged += bytes;
        self.budget.consume(bytes);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes currently attributed to this map.
    pub fn charged_bytes(&self) -> i64 {
        self.charged
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.entries.get(key)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<AccountedMut<'_, V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let budget = &*self.budget;
        let charged = &mut self.charged;
        self.entries.get_mut(key).map(|value| AccountedMut {
            before: value.memory_footprint(),
            value,
            budget,
            charged,
        })
    }

    /// Mutable access to `key`, inserting `make()` first if it is absent.
    pub fn get_or_insert_with(&mut self, key: K, make: impl FnOnce() -> V) -> AccountedMut<'_, V> {
        let budget = &*self.budget;
        let charged = &mut self.charged;
        let value = match self.entries.entry(key) {
            btree_map::Entry::Occupied(entry) => entry.into_mut(),
            btree_map::Entry::Vacant(entry) => {
                let value = make();
                let bytes = Self::entry_footprint(entry.key(), &value);
                *charged += bytes;
                budget.consume(bytes);
                entry.insert(value)
            }
        };
        AccountedMut {
            before: value.memory_footprint(),
            value,
            budget,
            charged,
        }
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let added = Self::entry_footprint(&key, &value);
        let previous = self.remove(&key);
        self.charge(added);
        self.entries.insert(key, value);
        previous
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (key, value) = self.entries.remove_entry(key)?;
        self.charge(-Self::entry_footprint(&key, &value));
        Some(value)
    }

    /// Keep only the entries for which `keep` returns true, re-measuring the
    /// survivors since `keep` may mutate them.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &mut V) -> bool) {
        let mut delta = 0i64;
        self.entries.retain(|key, value| {
            let before = value.memory_footprint() as i64;
            let retained = keep(key, value);
            let after = value.memory_footprint() as i64;
            if retained {
                delta += after - before;
            } else {
                delta -= key.memory_footprint() as i64 + before;
            }
            retained
        });
        self.charge(delta);
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.entries.iter()
    }

    pub fn keys(&self) -> btree_map::Keys<'_, K, V> {
        self.entries.keys()
    }

    pub fn values(&self) -> btree_map::Values<'_, K, V> {
        self.entries.values()
    }
}

impl<K, V> Drop for AccountedMap<K, V>
where
    K: Ord + MemoryFootprint,
    V: MemoryFootprint,
{
    fn drop(&mut self) {
        self.budget.release(self.charged);
    }
}

impl<K, V> fmt::Debug for AccountedMap<K, V>
where
    K: Ord + MemoryFootprint + fmt::Debug,
    V: MemoryFootprint + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}
