use std::alloc::Layout;
use std::any::type_name;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use crate::error::Result;
use crate::raw::{self, RawSource};
use crate::sharded_map::ShardedMap;
use crate::sorted_list::SortedList;
use crate::spin_lock::SpinLock;
use crate::{LedgerStats, ScopeCounter};

/// Number of address shards in a [`Ledger`] unless specified otherwise.
pub const DEFAULT_SHARD_COUNT: usize = 1024;

/// The accumulator of one registered scope counter.
///
/// Lives in storage obtained from the ledger's raw source, so it neither moves when the
/// owning [`ScopeCounter`] moves nor shows up in the counts it is accumulating.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CounterCell(NonNull<AtomicI64>);

// SAFETY: The cell is an atomic, valid to touch from any thread. Its lifetime is managed by
// the ledger and the owning scope counter, not by this handle.
unsafe impl Send for CounterCell {}

impl CounterCell {
    fn key(self) -> usize {
        self.0.as_ptr().addr()
    }

    /// # Safety
    ///
    /// The cell must not have been freed.
    pub(crate) unsafe fn value<'a>(self) -> &'a AtomicI64 {
        // SAFETY: Forwarding the caller's guarantee that the cell is still allocated. It was
        // initialized when allocated.
        unsafe { self.0.as_ref() }
    }
}

/// Records the size of every live allocation and broadcasts size changes to every registered
/// [`ScopeCounter`].
///
/// A ledger is a passive bookkeeping structure: it does not allocate or release the memory it
/// records, it is told about it by allocation hooks. The process-wide instance used by
/// [`Allocator`][crate::Allocator] (and the `interpose` hooks) is available via
/// [`global_ledger()`][crate::global_ledger], and independent ledgers can be created for
/// custom hooks or for testing.
///
/// # Bookkeeping storage
///
/// All storage the ledger needs for its own records comes from the raw source given at
/// construction. That source must not be the allocator whose activity the ledger records,
/// or recording an allocation would itself allocate and be recorded, recursively.
///
/// # Concurrency
///
/// Records are kept in `SHARDS` independently spin-locked partitions of the address space.
/// Deltas are applied to all registered counters while holding the lock of the counter list,
/// so every counter observes the same sequence of deltas. A shard lock and the counter list
/// lock are never held at the same time.
///
/// # Examples
///
/// ```
/// use std::alloc::System;
///
/// use alloc_ledger::Ledger;
///
/// let ledger = Ledger::<16>::new(&System);
/// let counter = ledger.scope_counter();
///
/// ledger.track(0x1000, 123).unwrap();
/// ledger.track(0x2000, 1024).unwrap();
/// assert_eq!(counter.current_bytes(), 1147);
///
/// ledger.untrack(0x1000);
/// assert_eq!(counter.current_bytes(), 1024);
/// ```
pub struct Ledger<const SHARDS: usize = DEFAULT_SHARD_COUNT> {
    allocations: ShardedMap<usize, SHARDS>,

    /// The broadcast list, keyed by cell address.
    counters: SpinLock<SortedList<usize, CounterCell>>,

    /// Number of entries in `counters`, readable without taking its lock.
    registered_counters: AtomicUsize,

    live_bytes: AtomicU64,
    live_allocations: AtomicU64,

    raw: RawSource,
}

impl<const SHARDS: usize> Ledger<SHARDS> {
    /// Creates an empty ledger whose bookkeeping storage comes from `raw`.
    ///
    /// This is a `const fn`, so a ledger can be placed in a static that is usable from the
    /// very first allocation of the process.
    ///
    /// # Panics
    ///
    /// Panics if `SHARDS` is zero.
    #[must_use]
    pub const fn new(raw: RawSource) -> Self {
        Self {
            allocations: ShardedMap::new(raw),
            counters: SpinLock::new(SortedList::new(raw)),
            registered_counters: AtomicUsize::new(0),
            live_bytes: AtomicU64::new(0),
            live_allocations: AtomicU64::new(0),
            raw,
        }
    }

    /// Records a live allocation of `size` bytes at `address` and adds `size` to every
    /// registered scope counter.
    ///
    /// A null `address` means the underlying allocator failed, so nothing is recorded.
    /// Zero-byte allocations with a non-null address are recorded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RepeatedKey`][crate::Error::RepeatedKey] if `address` is already
    /// recorded, which means a release was missed. Returns
    /// [`Error::StorageExhausted`][crate::Error::StorageExhausted] if the raw source cannot
    /// provide storage for the record. In both cases no counter is changed.
    pub fn track(&self, address: usize, size: usize) -> Result<()> {
        if address == 0 {
            return Ok(());
        }

        self.allocations.insert(address, size)?;

        self.live_bytes
            .fetch_add(size_to_u64(size), Ordering::Relaxed);
        self.live_allocations.fetch_add(1, Ordering::Relaxed);

        self.broadcast(size_to_delta(size));

        Ok(())
    }

    /// Forgets the allocation at `address` and subtracts its size from every registered
    /// scope counter, returning the size.
    ///
    /// Untracking an address that is not recorded (never allocated, already released or
    /// null) does nothing and returns `None`, matching the permissive contract of releasing
    /// memory.
    pub fn untrack(&self, address: usize) -> Option<usize> {
        let size = self.allocations.remove(address)?;

        self.live_bytes
            .fetch_sub(size_to_u64(size), Ordering::Relaxed);
        self.live_allocations.fetch_sub(1, Ordering::Relaxed);

        self.broadcast(size_to_delta(size).saturating_neg());

        Some(size)
    }

    /// Moves the record at `address` to `new_address` with a new size, returning the old
    /// size if `address` was recorded.
    ///
    /// This is exactly [`untrack(address)`][Self::untrack] followed by
    /// [`track(new_address, new_size)`][Self::track], even when the two addresses are equal,
    /// so every registered counter ends up adjusted by `new_size - old_size`.
    ///
    /// Hooks that forward to a real allocator should rather call `untrack()` before the real
    /// reallocation and `track()` after it. Once the real allocator has released `address`,
    /// another thread may receive it and record it before this thread gets to untrack it.
    ///
    /// # Errors
    ///
    /// As for [`track()`][Self::track]. The old record is removed even if recording the new
    /// one fails.
    pub fn reallocate(
        &self,
        address: usize,
        new_address: usize,
        new_size: usize,
    ) -> Result<Option<usize>> {
        let previous = self.untrack(address);
        self.track(new_address, new_size)?;
        Ok(previous)
    }

    /// The recorded size of the live allocation at `address`.
    #[must_use]
    pub fn size_of(&self, address: usize) -> Option<usize> {
        self.allocations.find(address)
    }

    /// A point-in-time snapshot of the ledger's totals.
    ///
    /// The totals are updated without a global lock, so under concurrent activity they may
    /// be momentarily inconsistent with each other.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        LedgerStats::new(
            self.live_bytes.load(Ordering::Relaxed),
            self.live_allocations.load(Ordering::Relaxed),
            self.registered_counters.load(Ordering::Relaxed),
        )
    }

    /// Creates a [`ScopeCounter`] that receives every delta recorded by this ledger from now
    /// until it is dropped.
    pub fn scope_counter(&self) -> ScopeCounter<'_, SHARDS> {
        ScopeCounter::with_ledger(self)
    }

    /// Allocates a zeroed counter cell and appends it to the broadcast list.
    pub(crate) fn register_counter(&self) -> Result<CounterCell> {
        let layout = Layout::new::<AtomicI64>();
        let cell = CounterCell(raw::allocate(self.raw, layout)?.cast());

        // SAFETY: Freshly allocated with the layout of `AtomicI64`.
        unsafe {
            cell.0.as_ptr().write(AtomicI64::new(0));
        }

        let mut counters = self.counters.acquire();

        if let Err(e) = counters.insert(cell.key(), cell) {
            counters.release();

            // SAFETY: Allocated above with this layout and never published.
            unsafe {
                raw::release(self.raw, cell.0.cast(), layout);
            }

            return Err(e);
        }

        // Still under the list lock, so the count never disagrees with a completed broadcast.
        self.registered_counters.fetch_add(1, Ordering::Release);

        Ok(cell)
    }

    /// Removes a counter cell from the broadcast list. Returns whether it was registered.
    ///
    /// Idempotent: deregistering a cell that is not registered does nothing. Once this
    /// returns, no broadcast can still be writing to the cell.
    pub(crate) fn deregister_counter(&self, cell: CounterCell) -> bool {
        let mut counters = self.counters.acquire();

        if counters.remove(cell.key()).is_none() {
            return false;
        }

        self.registered_counters.fetch_sub(1, Ordering::Release);

        true
    }

    /// Returns a counter cell to the raw source.
    ///
    /// # Safety
    ///
    /// The cell must have been created by [`register_counter()`][Self::register_counter] on
    /// this ledger, must already be deregistered and must not be used afterwards.
    pub(crate) unsafe fn free_counter(&self, cell: CounterCell) {
        // SAFETY: Forwarding the caller's guarantees. The layout matches `register_counter()`.
        unsafe {
            raw::release(self.raw, cell.0.cast(), Layout::new::<AtomicI64>());
        }
    }

    fn broadcast(&self, delta: i64) {
        if self.registered_counters.load(Ordering::Acquire) == 0 {
            return;
        }

        let counters = self.counters.acquire();

        for (_, cell) in counters.iter() {
            // SAFETY: Cells are freed only after being removed from the list, which requires
            // the lock we are holding.
            let value = unsafe { cell.value() };
            value.fetch_add(delta, Ordering::Relaxed);
        }
    }
}

impl<const SHARDS: usize> fmt::Debug for Ledger<SHARDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[inline]
fn size_to_u64(size: usize) -> u64 {
    size.try_into().expect("usize always fits into u64")
}

#[inline]
fn size_to_delta(size: usize) -> i64 {
    // No real allocation comes anywhere near this, so saturating is purely formal.
    i64::try_from(size).unwrap_or(i64::MAX)
}
