//! Slot array: one generation of the open-addressed table.
//!
//! # Slot states
//!
//! The key cell goes `empty -> key` or `empty -> dead`. A dead key cell is
//! only ever written by a copier sealing an unused slot, so no key can land in
//! a table that is being migrated away from.
//!
//! The value cell goes `empty -> live <-> tombstone`, and from any of those to
//! `prime` (live value frozen for copying) or `tomb-prime` (nothing to copy).
//! A primed value ends as `tomb-prime`, which is terminal.
//!
//! Keys never leave their slot once published. Removing a key tombstones the
//! value and keeps the key, so reprobe chains through the slot stay intact.

use crate::counter::Counter;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use kovan::{Atomic, Guard, RetiredNode, Shared};
use std::sync::Arc;

/// Smallest table is `1 << MIN_SIZE_LOG` slots.
pub(crate) const MIN_SIZE_LOG: u32 = 3;

/// Reprobes every table tolerates before its length is considered.
pub(crate) const REPROBE_LIMIT: usize = 10;

/// Low pointer bit marking a value cell as primed.
const PRIME_TAG: usize = 0b1;

/// Reprobe budget for a table of `len` slots.
#[inline]
pub(crate) fn reprobe_limit(len: usize) -> usize {
    REPROBE_LIMIT + (len >> 4)
}

/// Number of slots for a capacity hint: the smallest power of two holding
/// four slots per expected entry, but at least `1 << MIN_SIZE_LOG`.
pub(crate) fn slots_for(capacity: usize) -> usize {
    capacity
        .saturating_mul(4)
        .max(1 << MIN_SIZE_LOG)
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

/// A published key. Lives exactly as long as its table.
pub(crate) struct KeyCell<K> {
    pub(crate) hash: u64,
    pub(crate) key: K,
}

/// A published value.
///
/// `RetiredNode` must stay the first field: kovan reclaims the cell through it.
#[repr(C)]
pub(crate) struct ValueCell<V> {
    retired: RetiredNode,
    pub(crate) value: V,
}

impl<V> ValueCell<V> {
    pub(crate) fn alloc(value: V) -> *mut Self {
        Box::into_raw(Box::new(Self {
            retired: RetiredNode::new(),
            value,
        }))
    }

    /// Takes the value back out of a cell that was never published.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`alloc`](Self::alloc) and must not be reachable
    /// from any slot.
    pub(crate) unsafe fn reclaim(ptr: *mut Self) -> V {
        let cell = unsafe { Box::from_raw(ptr) };
        cell.value
    }
}

/// Address of the dead-key marker. Never dereferenced.
#[inline]
pub(crate) fn dead_key<K>() -> *mut KeyCell<K> {
    ptr::dangling_mut()
}

/// Address of the value tombstone. Never dereferenced.
#[inline]
pub(crate) fn tombstone<V>() -> *mut ValueCell<V> {
    ptr::dangling_mut()
}

/// Address of the tomb-prime marker. Never dereferenced.
#[inline]
pub(crate) fn tombprime<V>() -> *mut ValueCell<V> {
    tombstone::<V>().map_addr(|a| a | PRIME_TAG)
}

#[inline]
pub(crate) fn is_prime<V>(ptr: *mut ValueCell<V>) -> bool {
    ptr.addr() & PRIME_TAG != 0
}

#[inline]
pub(crate) fn primed<V>(ptr: *mut ValueCell<V>) -> *mut ValueCell<V> {
    ptr.map_addr(|a| a | PRIME_TAG)
}

#[inline]
pub(crate) fn unprimed<V>(ptr: *mut ValueCell<V>) -> *mut ValueCell<V> {
    ptr.map_addr(|a| a & !PRIME_TAG)
}

/// True if `ptr` owns a heap cell (live or primed), as opposed to a marker.
#[inline]
pub(crate) fn owns_cell<V>(ptr: *mut ValueCell<V>) -> bool {
    let raw = unprimed(ptr);
    !raw.is_null() && raw != tombstone()
}

/// Decoded value cell.
pub(crate) enum Val<'g, V> {
    Empty,
    Live(&'g V),
    Tombstone,
    Prime,
    TombPrime,
}

impl<'g, V> Val<'g, V> {
    /// Decodes a value pointer.
    ///
    /// # Safety
    ///
    /// `shared` must have been loaded from a value slot under a guard that
    /// outlives `'g`.
    #[inline]
    pub(crate) unsafe fn decode(shared: Shared<'g, ValueCell<V>>) -> Self {
        let raw = shared.as_raw();
        if raw.is_null() {
            Val::Empty
        } else if raw == tombstone() {
            Val::Tombstone
        } else if raw == tombprime() {
            Val::TombPrime
        } else if is_prime(raw) {
            Val::Prime
        } else {
            Val::Live(unsafe { &(*raw).value })
        }
    }

    /// The live value, if any.
    #[inline]
    pub(crate) fn live(&self) -> Option<&'g V> {
        match *self {
            Val::Live(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn is_prime(&self) -> bool {
        matches!(self, Val::Prime | Val::TombPrime)
    }
}

pub(crate) struct Slot<K, V> {
    pub(crate) key: AtomicPtr<KeyCell<K>>,
    pub(crate) value: Atomic<ValueCell<V>>,
}

/// One generation of the table.
///
/// Generations are shared: the root handle holds one strong count and the
/// predecessor's `next` link holds another. A demoted table therefore stays
/// alive for as long as any older generation can still forward into it.
pub(crate) struct Table<K, V> {
    slots: Box<[Slot<K, V>]>,
    mask: usize,
    /// Key slots claimed in this generation, live or tombstoned.
    pub(crate) claimed: Counter,
    /// The generation being migrated into, once a resize starts. Holds a
    /// strong count from `Arc::into_raw`.
    next: AtomicPtr<Table<K, V>>,
    /// Cursor handing out chunks of slots to helpers.
    pub(crate) copy_idx: AtomicUsize,
    /// Slots fully migrated so far.
    pub(crate) copy_done: AtomicUsize,
}

impl<K, V> Table<K, V> {
    /// Creates an empty table. `len` must be a power of two.
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two());
        let slots = (0..len)
            .map(|_| Slot {
                key: AtomicPtr::new(ptr::null_mut()),
                value: Atomic::null(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: len - 1,
            claimed: Counter::new(),
            next: AtomicPtr::new(ptr::null_mut()),
            copy_idx: AtomicUsize::new(0),
            copy_done: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn slot(&self, idx: usize) -> &Slot<K, V> {
        &self.slots[idx & self.mask]
    }

    #[inline]
    pub(crate) fn home(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    #[inline]
    pub(crate) fn reprobe(&self, idx: usize) -> usize {
        (idx + 1) & self.mask
    }

    /// The successor generation, if a resize has started.
    #[inline]
    pub(crate) fn successor(&self) -> Option<&Table<K, V>> {
        // SAFETY: `next` owns a strong count that is released only when
        // `self` drops.
        unsafe { self.next.load(Ordering::Acquire).as_ref() }
    }

    /// Like [`successor`](Self::successor), but hands out a counted reference.
    pub(crate) fn successor_arc(&self) -> Option<Arc<Table<K, V>>> {
        let raw = self.next.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: as in `successor`; the extra count is ours to take.
        unsafe {
            Arc::increment_strong_count(raw);
            Some(Arc::from_raw(raw))
        }
    }

    /// Installs `fresh` as the successor. Returns false if another thread
    /// got there first, in which case `fresh` is dropped.
    pub(crate) fn publish_successor(&self, fresh: Table<K, V>) -> bool {
        let raw = Arc::into_raw(Arc::new(fresh)).cast_mut();
        match self
            .next
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                // SAFETY: ours, never published.
                drop(unsafe { Arc::from_raw(raw) });
                false
            }
        }
    }

    /// Whether a fresh insert that needed `reprobes` probes should force a
    /// resize.
    pub(crate) fn is_full(&self, reprobes: usize) -> bool {
        let len = self.len();
        let claimed = self.claimed.estimate_usize();
        (reprobes >= REPROBE_LIMIT && (reprobes >= reprobe_limit(len) || claimed >= len >> 1))
            || claimed >= (len >> 1) + (len >> 2)
    }

    /// Frees every value cell still owned by a slot.
    ///
    /// # Safety
    ///
    /// No other thread may reach this table.
    pub(crate) unsafe fn free_values(&self, guard: &Guard) {
        for slot in self.slots.iter() {
            let raw = slot.value.load(Ordering::Relaxed, guard).as_raw();
            if owns_cell(raw) {
                drop(unsafe { Box::from_raw(unprimed(raw)) });
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // Value cells are released by the map or already sealed; only keys
        // belong to the generation itself.
        for slot in self.slots.iter() {
            let key = slot.key.load(Ordering::Relaxed);
            if !key.is_null() && key != dead_key() {
                drop(unsafe { Box::from_raw(key) });
            }
        }

        // Release the successor chain without recursing through it.
        let mut next = *self.next.get_mut();
        while !next.is_null() {
            // SAFETY: the strong count installed by `publish_successor`.
            let arc = unsafe { Arc::from_raw(next) };
            match Arc::try_unwrap(arc) {
                Ok(mut table) => {
                    next = core::mem::replace(table.next.get_mut(), ptr::null_mut());
                }
                Err(_) => break,
            }
        }
    }
}

/// Root handle on one generation.
///
/// `RetiredNode` must stay the first field: the handle is retired through
/// kovan once its table is demoted. Only the root ever points at a handle, so
/// a guard that loaded it keeps the table alive, and the table keeps every
/// later generation alive through `next`.
#[repr(C)]
pub(crate) struct Generation<K, V> {
    retired: RetiredNode,
    pub(crate) table: Arc<Table<K, V>>,
}

impl<K, V> Generation<K, V> {
    pub(crate) fn alloc(table: Arc<Table<K, V>>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            retired: RetiredNode::new(),
            table,
        }))
    }
}
