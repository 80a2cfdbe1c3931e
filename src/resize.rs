//! Resize coordination.
//!
//! A resize publishes a successor table in `next`. From then on every thread
//! that touches the old table helps migrate it a chunk at a time. Each old slot
//! is first primed (frozen against direct writes), its value is copied into
//! the successor only if the successor has nothing newer for that key, and the
//! slot is finally sealed as tomb-prime. Once every slot has been counted the
//! successor is promoted to the root and the old root handle is retired. The
//! old table itself is freed only after every generation linking to it is.

use crate::engine::{Expect, Outcome};
use crate::map::OccMap;
use crate::table::{
    Generation, MIN_SIZE_LOG, Table, dead_key, is_prime, owns_cell, primed, tombprime, unprimed,
};
use crate::Versioned;
use core::ptr;
use core::sync::atomic::Ordering;
use kovan::{Guard, Shared, retire};
use std::sync::Arc;

/// Most slots a helper claims per visit.
const COPY_CHUNK: usize = 1024;

/// Window in which a table full of tombstones is grown rather than rebuilt at
/// the same size.
const RESIZE_COOLDOWN_MS: u64 = 10_000;

impl<K, V, S> OccMap<K, V, S>
where
    K: Eq + Clone + 'static,
    V: Versioned + Clone + 'static,
{
    /// Returns `table`'s successor, creating it if no resize is in progress.
    pub(crate) fn resize<'g>(&self, table: &'g Table<K, V>) -> &'g Table<K, V> {
        loop {
            if let Some(next) = table.successor() {
                return next;
            }
            let (new_len, live) = self.successor_len(table);
            if table.publish_successor(Table::new(new_len)) {
                tracing::debug!(
                    old_len = table.len(),
                    new_len,
                    live,
                    "published successor table"
                );
            }
        }
    }

    /// Picks the successor size for `table` from the live estimate.
    fn successor_len(&self, table: &Table<K, V>) -> (usize, usize) {
        let old_len = table.len();
        let live = self.size.estimate_usize();
        let mut new_len = old_len;
        if live >= old_len >> 2 {
            new_len = old_len << 1;
            if live >= old_len >> 1 {
                new_len = old_len << 2;
            }
        }

        // Lots of tombstones and a recent resize: rebuilding at the same size
        // would only fill up again, so grow anyway.
        let now = self.elapsed_ms();
        let last = self.last_resize.load(Ordering::Relaxed);
        if new_len <= old_len
            && now <= last.saturating_add(RESIZE_COOLDOWN_MS)
            && table.claimed.estimate_usize() >= live << 1
        {
            new_len = old_len << 1;
        }
        (new_len.max(old_len).max(1 << MIN_SIZE_LOG), live)
    }

    /// Does a bounded amount of copy work on the root table, if it is being
    /// migrated.
    pub(crate) fn help_copy(&self, guard: &Guard) {
        let root = self.root(guard);
        if root.successor().is_some() {
            self.help_copy_impl(root, false, guard);
        }
    }

    /// Finishes every in-flight migration and returns the settled root.
    pub(crate) fn settle<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        loop {
            let root = self.root(guard);
            if root.successor().is_none() {
                return root;
            }
            self.help_copy_impl(root, true, guard);
        }
    }

    fn help_copy_impl(&self, old: &Table<K, V>, copy_all: bool, guard: &Guard) {
        let Some(next) = old.successor() else {
            return;
        };
        let len = old.len();
        let chunk = len.min(COPY_CHUNK);
        let mut panic_start = None;
        let mut copy_idx = 0;

        while old.copy_done.load(Ordering::Acquire) < len {
            if panic_start.is_none() {
                copy_idx = old.copy_idx.fetch_add(chunk, Ordering::AcqRel);
                if copy_idx >= len << 1 {
                    // Every chunk has been handed out twice and the copy is
                    // still not done. Sweep the whole table ourselves.
                    tracing::trace!(len, copy_idx, "copy stalled, sweeping all slots");
                    panic_start = Some(copy_idx);
                }
            }

            let mut work = 0;
            for i in 0..chunk {
                if self.copy_slot(old, copy_idx.wrapping_add(i), next, guard) {
                    work += 1;
                }
            }
            if work > 0 {
                self.copy_check_and_promote(old, work, guard);
            }

            copy_idx = copy_idx.wrapping_add(chunk);
            if !copy_all && panic_start.is_none() {
                return;
            }
        }

        self.copy_check_and_promote(old, 0, guard);
    }

    /// Copies one slot and moves on to the successor.
    pub(crate) fn copy_slot_and_check<'g>(
        &self,
        old: &'g Table<K, V>,
        idx: usize,
        should_help: bool,
        guard: &'g Guard,
    ) -> &'g Table<K, V> {
        let Some(next) = old.successor() else {
            return old;
        };
        if self.copy_slot(old, idx, next, guard) {
            self.copy_check_and_promote(old, 1, guard);
        }
        if should_help {
            self.help_copy(guard);
        }
        next
    }

    /// Counts `work` freshly copied slots and promotes the successor once the
    /// whole table is accounted for.
    fn copy_check_and_promote(&self, old: &Table<K, V>, work: usize, guard: &Guard) {
        let len = old.len();
        let done = if work > 0 {
            old.copy_done.fetch_add(work, Ordering::AcqRel) + work
        } else {
            old.copy_done.load(Ordering::Acquire)
        };
        if done < len {
            return;
        }
        debug_assert_eq!(done, len, "slot copied twice");

        // Only the root is ever promoted past.
        let root = self.table.load(Ordering::Acquire, guard);
        // SAFETY: the root handle is never null and `guard` holds it.
        if !ptr::eq(Arc::as_ptr(&unsafe { root.deref() }.table), old) {
            return;
        }
        let Some(next) = old.successor_arc() else {
            return;
        };
        let promoted = Generation::alloc(next);
        match self.table.compare_exchange(
            root,
            // SAFETY: freshly allocated.
            unsafe { Shared::from_raw(promoted) },
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => {
                self.last_resize.store(self.elapsed_ms(), Ordering::Relaxed);
                tracing::debug!(old_len = len, "promoted successor table");
                // SAFETY: unlinked from the root, which is the only place a
                // handle is reachable from. `Generation` starts with its
                // `RetiredNode`. The table itself lives on while its
                // predecessor still links to it.
                unsafe { retire(root.as_raw()) };
            }
            Err(_) => {
                // SAFETY: ours, never published.
                drop(unsafe { Box::from_raw(promoted) });
            }
        }
    }

    /// Migrates the slot at `idx` from `old` into `next`.
    ///
    /// Returns true for exactly one caller per slot: the one whose action
    /// finished the slot's migration.
    fn copy_slot(&self, old: &Table<K, V>, idx: usize, next: &Table<K, V>, guard: &Guard) -> bool {
        let slot = old.slot(idx);

        // Kill unused key slots so no key can land here any more.
        if slot.key.load(Ordering::Acquire).is_null() {
            let _ = slot.key.compare_exchange(
                ptr::null_mut(),
                dead_key(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        // Freeze the value.
        let mut cur = slot.value.load(Ordering::Acquire, guard);
        while !is_prime(cur.as_raw()) {
            let raw = cur.as_raw();
            let frozen = if owns_cell(raw) { primed(raw) } else { tombprime() };
            // SAFETY: a primed view of a live cell, or the tomb-prime marker.
            let frozen = unsafe { Shared::from_raw(frozen) };
            match slot
                .value
                .compare_exchange(cur, frozen, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    if frozen.as_raw() == tombprime() {
                        // Nothing to carry over; this slot is done.
                        return true;
                    }
                    cur = frozen;
                }
                Err(_) => cur = slot.value.load(Ordering::Acquire, guard),
            }
        }

        if cur.as_raw() == tombprime() {
            return false;
        }

        // A primed value implies a published key.
        // SAFETY: key cells outlive their table, which `guard` keeps alive.
        let key = unsafe { &*slot.key.load(Ordering::Acquire) };
        // SAFETY: the primed cell is retired only by the sealing CAS below.
        let value = unsafe { &(*unprimed(cur.as_raw())).value }.clone();
        let copied = matches!(
            self.put_if_match(
                next,
                &key.key,
                key.hash,
                Some(&key.key),
                Some(value),
                Expect::Vacant,
                false,
                guard,
            ),
            Outcome::Written(_)
        );

        // Seal. The thread that seals owns the old cell.
        while cur.as_raw() != tombprime() {
            match slot.value.compare_exchange(
                cur,
                // SAFETY: marker, never dereferenced.
                unsafe { Shared::from_raw(tombprime()) },
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    // SAFETY: unlinked by the seal; `ValueCell` starts with its
                    // `RetiredNode`.
                    unsafe { retire(unprimed(cur.as_raw())) };
                    break;
                }
                Err(_) => cur = slot.value.load(Ordering::Acquire, guard),
            }
        }

        copied
    }
}
