//! The raw allocation capability used for bookkeeping storage.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// A non-intercepted source of memory for the ledger's own bookkeeping.
///
/// Every record, shard node and scope counter cell the ledger creates is obtained from the raw
/// source it was constructed with, never from the process's global allocator. If bookkeeping
/// storage were allocated through the hooks being tracked, recording one allocation would cause
/// another, without end.
///
/// With the [`Allocator`][crate::Allocator] shim, [`std::alloc::System`] is a suitable raw source
/// because it is the allocator being wrapped, not the wrapper. When the C heap interface itself
/// is interposed, [`std::alloc::System`] would loop back into the hooks and the resolved real
/// allocator must be used instead.
pub type RawSource = &'static (dyn GlobalAlloc + Sync);

/// Allocates storage for `layout` from the raw source.
///
/// `layout` must have a non-zero size.
pub(crate) fn allocate(raw: RawSource, layout: Layout) -> Result<NonNull<u8>> {
    debug_assert!(layout.size() > 0);

    // SAFETY: The caller guarantees a non-zero size, which is the only requirement of `alloc`.
    let ptr = unsafe { raw.alloc(layout) };

    NonNull::new(ptr).ok_or(Error::StorageExhausted {
        bytes: layout.size(),
    })
}

/// Returns storage obtained from [`allocate()`] to the raw source.
///
/// # Safety
///
/// `ptr` must have been returned by `allocate()` on the same raw source with the same layout
/// and must not have been released already.
pub(crate) unsafe fn release(raw: RawSource, ptr: NonNull<u8>, layout: Layout) {
    // SAFETY: Forwarding the caller's guarantees.
    unsafe {
        raw.dealloc(ptr.as_ptr(), layout);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use testing::CountingAlloc;

    use super::*;

    #[test]
    fn allocate_and_release_go_through_the_raw_source() {
        static RAW: CountingAlloc = CountingAlloc::new();

        let layout = Layout::new::<u64>();
        let ptr = allocate(&RAW, layout).unwrap();

        assert_eq!(RAW.allocations(), 1);
        assert_eq!(RAW.releases(), 0);

        // SAFETY: Obtained from `allocate()` above with the same layout.
        unsafe {
            release(&RAW, ptr, layout);
        }

        assert_eq!(RAW.releases(), 1);
    }

    #[test]
    fn failed_allocation_is_storage_exhausted() {
        static RAW: CountingAlloc = CountingAlloc::failing();

        let layout = Layout::new::<[u64; 4]>();
        let result = allocate(&RAW, layout);

        assert!(matches!(result, Err(Error::StorageExhausted { bytes: 32 })));
    }
}
