//! The public map.

use crate::counter::Counter;
use crate::engine::{Expect, Outcome};
use crate::error::{VersionConflict, WriteOutcome};
use crate::iter::{Iter, Keys, Values};
use crate::table::{Generation, Table, slots_for};
use crate::Versioned;
use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::Ordering;
use foldhash::fast::FixedState;
use kovan::{Atomic, Guard, pin};
use portable_atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

/// Default capacity hint.
const DEFAULT_CAPACITY: usize = 8;

/// A lock-free hash map whose writes are admitted by version.
///
/// Every value carries a caller-assigned version ([`Versioned`]). A write over
/// a live value lands only if its version is strictly greater than the stored
/// one; otherwise it is rejected and the map is left untouched. Removal is not
/// version-checked, so once a key is gone any version may be written again.
///
/// Reads and writes never block. Resizing is incremental: every thread that
/// runs into a table being migrated copies part of it before carrying on.
///
/// # Examples
///
/// ```
/// use occ_map::{OccMap, Stamped};
///
/// let map = OccMap::new();
/// map.put("k", Stamped::new("a", 1)).unwrap();
/// assert!(map.put("k", Stamped::new("b", 1)).is_err());
/// map.put("k", Stamped::new("c", 2)).unwrap();
/// assert_eq!(map.get("k"), Some(Stamped::new("c", 2)));
/// ```
pub struct OccMap<K, V, S = FixedState> {
    /// Handle on the current root generation.
    pub(crate) table: Atomic<Generation<K, V>>,
    /// Live entries, map-wide.
    pub(crate) size: Counter,
    hasher: S,
    epoch: Instant,
    /// Milliseconds since `epoch` at the last promotion.
    pub(crate) last_resize: AtomicU64,
}

// SAFETY: keys and values are shared between threads and may be dropped by
// whichever thread reclaims their cell.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Send> Send for OccMap<K, V, S> {}
// SAFETY: as above; the hasher is only used through `&S`.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for OccMap<K, V, S> {}

impl<K, V> OccMap<K, V, FixedState> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an empty map sized for about `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, FixedState::default())
    }
}

impl<K, V> Default for OccMap<K, V, FixedState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> OccMap<K, V, S> {
    /// Creates an empty map that hashes keys with `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_CAPACITY, hasher)
    }

    /// Creates an empty map sized for about `capacity` entries that hashes
    /// keys with `hasher`.
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            table: Atomic::new(Generation::alloc(Arc::new(Table::new(slots_for(capacity))))),
            size: Counter::new(),
            hasher,
            epoch: Instant::now(),
            last_resize: AtomicU64::new(0),
        }
    }

    /// The hasher used for keys.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Approximate number of live entries. Never negative.
    pub fn len(&self) -> usize {
        self.size.estimate_usize()
    }

    /// True if [`len`](Self::len) is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots in the current root table.
    pub fn capacity(&self) -> usize {
        let guard = pin();
        self.root(&guard).len()
    }

    #[inline]
    pub(crate) fn root<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        // SAFETY: the root handle is never null and is retired only after a
        // successor replaces it, which `guard` holds off.
        let generation = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        &generation.table
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl<K, V, S> OccMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Versioned + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.hasher.hash_one(key)
    }

    fn write(&self, key: &K, value: V, expect: Expect<'_, V>, gated: bool) -> Outcome<V> {
        let guard = pin();
        let hash = self.hash(key);
        self.put_if_match(
            self.root(&guard),
            key,
            hash,
            Some(key),
            Some(value),
            expect,
            gated,
            &guard,
        )
    }

    fn delete<Q>(&self, key: &Q, expect: Expect<'_, V>) -> Outcome<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = pin();
        let hash = self.hash(key);
        self.put_if_match(
            self.root(&guard),
            key,
            hash,
            None,
            None,
            expect,
            false,
            &guard,
        )
    }

    /// Returns a clone of the value stored for `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = pin();
        let hash = self.hash(key);
        self.get_in(self.root(&guard), key, hash, &guard).cloned()
    }

    /// True if `key` has a live value.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = pin();
        let hash = self.hash(key);
        self.get_in(self.root(&guard), key, hash, &guard).is_some()
    }

    /// Stores `value` under `key` if its version beats the stored one.
    ///
    /// Returns the displaced value. If a live value with an equal or greater
    /// version is present, nothing is written and the conflict is returned.
    ///
    /// ```
    /// use occ_map::{OccMap, Stamped};
    ///
    /// let map = OccMap::new();
    /// assert_eq!(map.put(1, Stamped::new('a', 3)), Ok(None));
    /// let err = map.put(1, Stamped::new('b', 3)).unwrap_err();
    /// assert_eq!((err.key, err.existing, err.attempted), (1, 3, 3));
    /// ```
    pub fn put(&self, key: K, value: V) -> Result<Option<V>, VersionConflict<K>> {
        match self.write(&key, value, Expect::Any, true) {
            Outcome::Written(prior) => Ok(prior),
            Outcome::Conflict(conflict) => Err(conflict.into_error(key)),
            Outcome::Unmatched(_) => unreachable!("unconditional write did not match"),
        }
    }

    /// Like [`put`](Self::put), but reports a rejection with both values.
    pub fn try_put(&self, key: K, value: V) -> WriteOutcome<V> {
        match self.write(&key, value, Expect::Any, true) {
            Outcome::Written(prior) => WriteOutcome::Accepted(prior),
            Outcome::Conflict(conflict) => WriteOutcome::Conflict(conflict),
            Outcome::Unmatched(_) => unreachable!("unconditional write did not match"),
        }
    }

    /// Stores `value` only if `key` has no live value.
    ///
    /// Returns `None` on success, otherwise the current value. Versions are
    /// not compared.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        match self.write(&key, value, Expect::Absent, false) {
            Outcome::Written(_) => None,
            Outcome::Unmatched(current) => current,
            Outcome::Conflict(_) => None,
        }
    }

    /// Replaces the live value of `key` if the version gate admits `value`.
    ///
    /// Returns the displaced value, or `None` when `key` had no live value, in
    /// which case nothing is written.
    pub fn replace(&self, key: K, value: V) -> Result<Option<V>, VersionConflict<K>> {
        match self.write(&key, value, Expect::Present, true) {
            Outcome::Written(prior) => Ok(prior),
            Outcome::Unmatched(_) => Ok(None),
            Outcome::Conflict(conflict) => Err(conflict.into_error(key)),
        }
    }

    /// Like [`replace`](Self::replace), but reports a rejection with both
    /// values. An absent key yields `Accepted(None)` without writing.
    pub fn try_replace(&self, key: K, value: V) -> WriteOutcome<V> {
        match self.write(&key, value, Expect::Present, true) {
            Outcome::Written(prior) => WriteOutcome::Accepted(prior),
            Outcome::Unmatched(_) => WriteOutcome::Accepted(None),
            Outcome::Conflict(conflict) => WriteOutcome::Conflict(conflict),
        }
    }

    /// Replaces the value of `key` with `value` if the current value equals
    /// `expected` and `value` has a greater version.
    ///
    /// Returns false without writing if either check fails.
    pub fn replace_if(&self, key: K, expected: &V, value: V) -> bool
    where
        V: PartialEq,
    {
        let matches = |cur: &V| cur == expected;
        matches!(
            self.write(&key, value, Expect::Matching(&matches), true),
            Outcome::Written(_)
        )
    }

    /// Removes `key`, returning its live value.
    ///
    /// Removal ignores versions. A later write for `key` is admitted
    /// whatever its version.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.delete(key, Expect::Any) {
            Outcome::Written(prior) => prior,
            Outcome::Unmatched(_) | Outcome::Conflict(_) => None,
        }
    }

    /// Removes `key` only if its current value equals `expected`.
    pub fn remove_if<Q>(&self, key: &Q, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let matches = |cur: &V| cur == expected;
        matches!(
            self.delete(key, Expect::Matching(&matches)),
            Outcome::Written(_)
        )
    }

    /// True if some key currently maps to a value equal to `value`.
    ///
    /// Walks the whole map.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.values().any(|v| v == *value)
    }

    /// Removes every key seen by a traversal.
    ///
    /// Keys written concurrently may survive. The table keeps its size.
    pub fn clear(&self) {
        for key in self.keys() {
            self.remove(&key);
        }
    }

    /// Iterates over clones of the live entries.
    ///
    /// The traversal is weakly consistent: entries present for its whole
    /// duration are yielded exactly once, concurrent changes may or may not
    /// show up.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter::new(self)
    }

    /// Iterates over clones of the live keys.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { inner: self.iter() }
    }

    /// Iterates over clones of the live values.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { inner: self.iter() }
    }
}

impl<'m, K, V, S> IntoIterator for &'m OccMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Versioned + Clone + Send + Sync + 'static,
    S: BuildHasher,
{
    type Item = (K, V);
    type IntoIter = Iter<'m, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, S> fmt::Display for OccMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Display + 'static,
    V: Versioned + Clone + Send + Sync + fmt::Display + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

impl<K, V, S> fmt::Debug for OccMap<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Debug + 'static,
    V: Versioned + Clone + Send + Sync + fmt::Debug + 'static,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> Drop for OccMap<K, V, S> {
    fn drop(&mut self) {
        let guard = pin();
        let root = self.table.load(Ordering::Acquire, &guard).as_raw();
        // SAFETY: `&mut self` excludes every other user of the root handle.
        let generation = unsafe { Box::from_raw(root) };

        // Demoted generations are fully sealed. Only the root and any
        // successor it is migrating into still own value cells.
        let mut table = Some(&*generation.table);
        while let Some(t) = table {
            // SAFETY: as above.
            unsafe { t.free_values(&guard) };
            table = t.successor();
        }
        // Key cells go with each table once its last link is released.
        drop(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stamped;

    type Map = OccMap<u64, Stamped<u64>>;

    #[test]
    fn test_initial_capacity() {
        assert_eq!(Map::new().capacity(), 32);
        assert_eq!(Map::with_capacity(0).capacity(), 8);
        assert_eq!(Map::with_capacity(100).capacity(), 512);
    }

    #[test]
    fn test_put_get_remove() {
        let map = Map::new();
        assert!(map.is_empty());
        assert_eq!(map.put(1, Stamped::new(10, 1)), Ok(None));
        assert_eq!(map.get(&1), Some(Stamped::new(10, 1)));
        assert!(map.contains_key(&1));
        assert_eq!(map.len(), 1);

        assert_eq!(map.remove(&1), Some(Stamped::new(10, 1)));
        assert_eq!(map.remove(&1), None);
        assert_eq!(map.get(&1), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_gate_on_put() {
        let map = Map::new();
        map.put(7, Stamped::new(1, 5)).unwrap();
        let err = map.put(7, Stamped::new(2, 5)).unwrap_err();
        assert_eq!(err, VersionConflict { key: 7, existing: 5, attempted: 5 });
        assert_eq!(map.get(&7), Some(Stamped::new(1, 5)));

        match map.try_put(7, Stamped::new(3, 4)) {
            WriteOutcome::Conflict(c) => {
                assert_eq!(c.existing, Stamped::new(1, 5));
                assert_eq!(c.attempted, Stamped::new(3, 4));
            }
            other => panic!("expected a conflict, got {other:?}"),
        }

        assert_eq!(map.put(7, Stamped::new(4, 6)), Ok(Some(Stamped::new(1, 5))));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_replace_variants() {
        let map = Map::new();
        assert_eq!(map.replace(1, Stamped::new(1, 1)), Ok(None));
        assert!(!map.contains_key(&1));

        map.put(1, Stamped::new(1, 1)).unwrap();
        assert!(map.replace(1, Stamped::new(2, 1)).is_err());
        assert_eq!(map.replace(1, Stamped::new(2, 2)), Ok(Some(Stamped::new(1, 1))));

        assert!(!map.replace_if(1, &Stamped::new(1, 1), Stamped::new(3, 3)));
        assert!(!map.replace_if(1, &Stamped::new(2, 2), Stamped::new(3, 2)));
        assert!(map.replace_if(1, &Stamped::new(2, 2), Stamped::new(3, 3)));
        assert_eq!(map.get(&1), Some(Stamped::new(3, 3)));
    }

    #[test]
    fn test_remove_if() {
        let map = Map::new();
        map.put(1, Stamped::new(1, 1)).unwrap();
        assert!(!map.remove_if(&1, &Stamped::new(1, 2)));
        assert!(map.remove_if(&1, &Stamped::new(1, 1)));
        assert!(!map.remove_if(&1, &Stamped::new(1, 1)));
        assert!(map.is_empty());
    }

    #[test]
    fn test_growth_keeps_entries() {
        let map = Map::with_capacity(0);
        for i in 0..1_000 {
            map.put(i, Stamped::initial(i * 2)).unwrap();
        }
        assert!(map.capacity() > 8);
        assert_eq!(map.len(), 1_000);
        for i in 0..1_000 {
            assert_eq!(map.get(&i), Some(Stamped::initial(i * 2)));
        }
    }

    #[test]
    fn test_display_and_debug() {
        let map: OccMap<&str, Stamped<u32>> = OccMap::new();
        assert_eq!(map.to_string(), "{}");
        map.put("a", Stamped::new(1, 2)).unwrap();
        assert_eq!(map.to_string(), "{a=1@v2}");
        assert_eq!(
            format!("{map:?}"),
            "{\"a\": Stamped { value: 1, version: 2 }}"
        );
    }

    #[test]
    fn test_clear_and_contains_value() {
        let map = Map::new();
        for i in 0..20 {
            map.put(i, Stamped::initial(i)).unwrap();
        }
        assert!(map.contains_value(&Stamped::initial(5)));
        assert!(!map.contains_value(&Stamped::new(5, 1)));
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.iter().count(), 0);
    }
}
