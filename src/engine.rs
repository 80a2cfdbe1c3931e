//! Probe & CAS engine.
//!
//! Both entry points walk a linear reprobe sequence from the key's home slot
//! and compare the cached hash before calling `Eq`. Whenever the table they
//! stand on turns out to be mid-migration for the slot they need, they help
//! copy that slot and continue in the successor, so they never act on a value
//! that has already been forwarded.

use crate::error::Conflict;
use crate::gate::{Admission, admit};
use crate::map::OccMap;
use crate::table::{
    KeyCell, Table, Val, ValueCell, dead_key, is_prime, owns_cell, reprobe_limit, tombstone,
};
use crate::Versioned;
use core::borrow::Borrow;
use core::ptr;
use core::sync::atomic::Ordering;
use kovan::{Guard, Shared, retire};

/// What the current value must look like for a write to proceed.
pub(crate) enum Expect<'a, V> {
    /// Unconditional.
    Any,
    /// No live value (empty or tombstoned).
    Absent,
    /// A live value of any kind.
    Present,
    /// The slot never held a value in this generation. Used by copies only.
    Vacant,
    /// A live value the predicate accepts.
    Matching(&'a dyn Fn(&V) -> bool),
}

impl<V> Expect<'_, V> {
    #[inline]
    fn is_copy(&self) -> bool {
        matches!(self, Expect::Vacant)
    }

    #[inline]
    fn holds(&self, val: &Val<'_, V>) -> bool {
        let live = val.live();
        match self {
            Expect::Any => true,
            Expect::Absent => live.is_none(),
            Expect::Present => live.is_some(),
            Expect::Vacant => matches!(val, Val::Empty),
            Expect::Matching(pred) => live.is_some_and(|v| pred(v)),
        }
    }
}

/// Raw result of [`OccMap::put_if_match`].
pub(crate) enum Outcome<V> {
    /// The write landed. Carries the live value it displaced.
    Written(Option<V>),
    /// The expectation did not hold. Carries the live value that was seen.
    Unmatched(Option<V>),
    /// The version gate refused the write.
    Conflict(Conflict<V>),
}

/// Frees a cell this operation allocated but never published.
#[inline]
fn discard<V>(cell: *mut ValueCell<V>) {
    if cell != tombstone() {
        // SAFETY: allocated by the caller and never reachable from a slot.
        drop(unsafe { ValueCell::reclaim(cell) });
    }
}

#[inline]
fn same_key<K, Q>(cell: *mut KeyCell<K>, key: &Q, hash: u64) -> bool
where
    K: Borrow<Q>,
    Q: Eq + ?Sized,
{
    if cell.is_null() || cell == dead_key() {
        return false;
    }
    // SAFETY: published key cells live as long as their table.
    let cell = unsafe { &*cell };
    cell.hash == hash && cell.key.borrow() == key
}

impl<K, V, S> OccMap<K, V, S>
where
    K: Eq + Clone + 'static,
    V: Versioned + Clone + 'static,
{
    /// Looks `key` up starting at `table`, chasing forwarding as needed.
    pub(crate) fn get_in<'g, Q>(
        &self,
        mut table: &'g Table<K, V>,
        key: &Q,
        hash: u64,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        'table: loop {
            let len = table.len();
            let mut idx = table.home(hash);
            let mut reprobes = 0;

            loop {
                let slot = table.slot(idx);
                let k = slot.key.load(Ordering::Acquire);
                if k.is_null() {
                    return None;
                }
                let v = slot.value.load(Ordering::Acquire, guard);

                if same_key(k, key, hash) {
                    // SAFETY: loaded from a value slot under `guard`.
                    match unsafe { Val::decode(v) } {
                        Val::Live(value) => return Some(value),
                        Val::Empty | Val::Tombstone => return None,
                        Val::Prime | Val::TombPrime => {
                            table = self.copy_slot_and_check(table, idx, true, guard);
                            continue 'table;
                        }
                    }
                }

                reprobes += 1;
                if reprobes >= reprobe_limit(len) || k == dead_key() {
                    match table.successor() {
                        None => return None,
                        Some(next) => {
                            self.help_copy(guard);
                            table = next;
                            continue 'table;
                        }
                    }
                }
                idx = table.reprobe(idx);
            }
        }
    }

    /// The single write path.
    ///
    /// Finds (or claims, when `owned` is given) the slot for `key` and tries to
    /// replace its value with `value`, or with a tombstone when `value` is
    /// `None`. The write only lands if `expect` holds and, when `gated`, the
    /// version gate admits it. Both checks are re-run against the fresh value
    /// after every lost CAS.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn put_if_match<'g, Q>(
        &self,
        mut table: &'g Table<K, V>,
        key: &Q,
        hash: u64,
        owned: Option<&K>,
        value: Option<V>,
        expect: Expect<'_, V>,
        gated: bool,
        guard: &'g Guard,
    ) -> Outcome<V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let removing = value.is_none();
        let new_cell = match value {
            Some(v) => ValueCell::alloc(v),
            None => tombstone(),
        };
        let helps = !expect.is_copy();
        let mut spare_key: *mut KeyCell<K> = ptr::null_mut();

        let outcome = 'table: loop {
            let len = table.len();
            let mut idx = table.home(hash);
            let mut reprobes = 0;

            // Probe for the key, claiming an empty slot on the way if allowed.
            loop {
                let slot = table.slot(idx);
                let mut k = slot.key.load(Ordering::Acquire);

                if k.is_null() {
                    // Not in this generation, and by the probe invariant not in
                    // any later one either.
                    let claimable = !removing
                        && !matches!(expect, Expect::Present | Expect::Matching(_));
                    let Some(owned) = owned.filter(|_| claimable) else {
                        discard(new_cell);
                        break 'table Outcome::Unmatched(None);
                    };
                    if spare_key.is_null() {
                        spare_key = Box::into_raw(Box::new(KeyCell {
                            hash,
                            key: owned.clone(),
                        }));
                    }
                    match slot.key.compare_exchange(
                        ptr::null_mut(),
                        spare_key,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            table.claimed.increment();
                            k = spare_key;
                            spare_key = ptr::null_mut();
                        }
                        Err(actual) => k = actual,
                    }
                }

                if same_key(k, key, hash) {
                    break;
                }

                reprobes += 1;
                if reprobes >= reprobe_limit(len) || k == dead_key() {
                    let next = self.resize(table);
                    if helps {
                        self.help_copy(guard);
                    }
                    table = next;
                    continue 'table;
                }
                idx = table.reprobe(idx);
            }

            let slot = table.slot(idx);
            let mut cur = slot.value.load(Ordering::Acquire, guard);

            // Migrating? Then the successor owns this key from now on.
            let mut next = table.successor();
            if next.is_none()
                && ((cur.is_null() && table.is_full(reprobes)) || is_prime(cur.as_raw()))
            {
                next = Some(self.resize(table));
            }
            if next.is_some() {
                table = self.copy_slot_and_check(table, idx, helps, guard);
                continue 'table;
            }

            loop {
                // SAFETY: loaded from a value slot under `guard`.
                let val = unsafe { Val::decode(cur) };
                if val.is_prime() {
                    table = self.copy_slot_and_check(table, idx, helps, guard);
                    continue 'table;
                }

                let live = val.live();
                if !expect.holds(&val) || (removing && live.is_none()) {
                    discard(new_cell);
                    break 'table Outcome::Unmatched(live.cloned());
                }

                if gated && !removing {
                    // SAFETY: not removing, so `new_cell` is a real cell we own
                    // until it is published.
                    let incoming = unsafe { &(*new_cell).value };
                    if let (Some(existing), Admission::Reject) = (live, admit(live, incoming)) {
                        tracing::trace!(
                            existing = existing.version(),
                            attempted = incoming.version(),
                            "version gate rejected write"
                        );
                        break 'table Outcome::Conflict(Conflict {
                            existing: existing.clone(),
                            // SAFETY: as above; never published.
                            attempted: unsafe { ValueCell::reclaim(new_cell) },
                        });
                    }
                }

                match slot.value.compare_exchange(
                    cur,
                    // SAFETY: a fresh cell or the tombstone marker.
                    unsafe { Shared::from_raw(new_cell) },
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        let prior = live.cloned();
                        if !expect.is_copy() {
                            match (prior.is_some(), removing) {
                                (false, false) => self.size.increment(),
                                (true, true) => self.size.decrement(),
                                _ => {}
                            }
                        }
                        if owns_cell(cur.as_raw()) {
                            // SAFETY: unlinked by our CAS; `ValueCell` starts with its
                            // `RetiredNode`.
                            unsafe { retire(cur.as_raw()) };
                        }
                        break 'table Outcome::Written(prior);
                    }
                    Err(_) => cur = slot.value.load(Ordering::Acquire, guard),
                }
            }
        };

        if !spare_key.is_null() {
            // SAFETY: never published.
            drop(unsafe { Box::from_raw(spare_key) });
        }
        outcome
    }
}
