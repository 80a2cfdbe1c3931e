//! Weakly-consistent traversal.
//!
//! An iterator first drives any in-flight migration to completion, then walks
//! the root it settled on in slot order. Each published key is resolved
//! through the normal lookup path, so a slot primed by a resize that starts
//! mid-walk is answered from its successor rather than from the frozen copy.
//! A key occupies one slot per generation, hence is yielded at most once.

use crate::map::OccMap;
use crate::table::{Table, dead_key};
use crate::Versioned;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::Ordering;
use kovan::{Guard, pin};

/// Iterator over clones of a map's entries. Created by [`OccMap::iter`].
pub struct Iter<'m, K, V, S> {
    map: &'m OccMap<K, V, S>,
    // Keeps `table` and everything it forwards to alive.
    guard: Guard,
    table: *const Table<K, V>,
    idx: usize,
}

impl<'m, K, V, S> Iter<'m, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Versioned + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    pub(crate) fn new(map: &'m OccMap<K, V, S>) -> Self {
        let guard = pin();
        let table: *const Table<K, V> = map.settle(&guard);
        Self {
            map,
            guard,
            table,
            idx: 0,
        }
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Versioned + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: pinned by `self.guard` since construction.
        let table = unsafe { &*self.table };
        while self.idx < table.len() {
            let slot = table.slot(self.idx);
            self.idx += 1;

            let k = slot.key.load(Ordering::Acquire);
            if k.is_null() || k == dead_key() {
                continue;
            }
            // SAFETY: published key cells live as long as their table.
            let cell = unsafe { &*k };
            if let Some(value) = self.map.get_in(table, &cell.key, cell.hash, &self.guard) {
                return Some((cell.key.clone(), value.clone()));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        // SAFETY: as in `next`.
        let len = unsafe { (*self.table).len() };
        (0, Some(len.saturating_sub(self.idx)))
    }
}

impl<K, V, S> fmt::Debug for Iter<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").field("idx", &self.idx).finish_non_exhaustive()
    }
}

/// Iterator over clones of a map's keys. Created by [`OccMap::keys`].
pub struct Keys<'m, K, V, S> {
    pub(crate) inner: Iter<'m, K, V, S>,
}

impl<K, V, S> Iterator for Keys<'_, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Versioned + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.inner.next().map(|(k, _)| k)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Iterator over clones of a map's values. Created by [`OccMap::values`].
pub struct Values<'m, K, V, S> {
    pub(crate) inner: Iter<'m, K, V, S>,
}

impl<K, V, S> Iterator for Values<'_, K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Versioned + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = V;

    fn next(&mut self) -> Option<V> {
        self.inner.next().map(|(_, v)| v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
