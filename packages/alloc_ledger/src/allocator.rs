//! Allocation wrapper that reports every allocation to the process-wide ledger.

use std::alloc::{GlobalAlloc, Layout};
use std::fmt;

use crate::error::or_fatal;
use crate::global_ledger;

/// A memory allocator that records every allocation and deallocation in the
/// [`global_ledger()`].
///
/// This allocator wraps any [`GlobalAlloc`] implementation and keeps its allocation behavior
/// unchanged: every call is forwarded to the wrapped allocator and its result returned as-is.
/// The only side effect is the bookkeeping, which is what [`ScopeCounter`][crate::ScopeCounter]
/// instances observe.
///
/// Null results (allocation failures) are passed through and not recorded. Bookkeeping
/// failures cannot be reported from inside an allocator, so they abort the process.
///
/// Not available with the `interpose` feature, because then the C heap interface underneath
/// is already hooked and wrapping it again would record every allocation twice.
///
/// # Examples
///
/// ```rust
/// use alloc_ledger::Allocator;
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .finish()
    }
}

impl Allocator<std::alloc::System> {
    /// Creates a new tracking allocator using the system's default allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self {
            inner: std::alloc::System,
        }
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a new tracking allocator that forwards to the provided allocator.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

#[inline]
fn record_allocation(ptr: *mut u8, size: usize) {
    if !ptr.is_null() {
        or_fatal(global_ledger().track(ptr.addr(), size));
    }
}

// SAFETY: We delegate all allocation operations to the underlying allocator,
// which already implements GlobalAlloc safely, while adding tracking functionality.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc(layout) };

        record_allocation(ptr, layout.size());
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Forget the address before releasing it, since from then on any thread may get it.
        global_ledger().untrack(ptr.addr());

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };

        record_allocation(ptr, layout.size());
        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let ledger = global_ledger();

        // Same reasoning as in `dealloc()`: the old address may be handed out again as soon
        // as the inner allocator returns.
        let previous = ledger.untrack(ptr.addr());

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };

        if new_ptr.is_null() {
            // The original block is untouched on failure, so it is still live.
            if let Some(previous) = previous {
                record_allocation(ptr, previous);
            }
        } else {
            record_allocation(new_ptr, new_size);
        }

        new_ptr
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ptr;

    use super::*;

    static_assertions::assert_impl_all!(Allocator<std::alloc::System>: Send, Sync);

    /// Serves allocations from the system allocator but refuses to resize them.
    struct NoReallocAlloc;

    // SAFETY: Allocation and deallocation are forwarded to `System`; realloc only ever
    // reports failure, which leaves the original block untouched as required.
    unsafe impl GlobalAlloc for NoReallocAlloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { std::alloc::System.alloc(layout) }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            // SAFETY: Forwarding the caller's guarantees.
            unsafe { std::alloc::System.dealloc(ptr, layout) }
        }

        unsafe fn realloc(&self, _ptr: *mut u8, _layout: Layout, _new_size: usize) -> *mut u8 {
            ptr::null_mut()
        }
    }

    // These tests call the wrapper directly instead of installing it as the global allocator,
    // so the only records in the global ledger that they can see are the ones they create.

    #[test]
    fn alloc_and_dealloc_are_recorded() {
        let allocator = Allocator::system();
        let layout = Layout::from_size_align(321, 8).unwrap();

        // SAFETY: Non-zero size layout.
        let ptr = unsafe { allocator.alloc(layout) };
        assert_eq!(global_ledger().size_of(ptr.addr()), Some(321));

        // SAFETY: Allocated above with the same layout.
        unsafe { allocator.dealloc(ptr, layout) };
        assert_eq!(global_ledger().size_of(ptr.addr()), None);
    }

    #[test]
    fn alloc_zeroed_is_recorded_and_zeroed() {
        let allocator = Allocator::system();
        let layout = Layout::from_size_align(64, 16).unwrap();

        // SAFETY: Non-zero size layout.
        let ptr = unsafe { allocator.alloc_zeroed(layout) };
        assert_eq!(global_ledger().size_of(ptr.addr()), Some(64));

        // SAFETY: The block is 64 bytes long and was just zero-initialized.
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 64) };
        assert!(bytes.iter().all(|b| *b == 0));

        // SAFETY: Allocated above with the same layout.
        unsafe { allocator.dealloc(ptr, layout) };
    }

    #[test]
    fn realloc_moves_the_record() {
        let allocator = Allocator::system();
        let layout = Layout::from_size_align(16, 8).unwrap();

        // SAFETY: Non-zero size layout.
        let ptr = unsafe { allocator.alloc(layout) };

        // SAFETY: `ptr` was allocated with `layout`; the new size is non-zero.
        let grown = unsafe { allocator.realloc(ptr, layout, 4096) };
        assert!(!grown.is_null());
        assert_eq!(global_ledger().size_of(grown.addr()), Some(4096));

        if grown != ptr {
            assert_eq!(global_ledger().size_of(ptr.addr()), None);
        }

        let grown_layout = Layout::from_size_align(4096, 8).unwrap();
        // SAFETY: `grown` is live with the grown layout.
        unsafe { allocator.dealloc(grown, grown_layout) };
    }

    #[test]
    fn failed_realloc_keeps_the_original_record() {
        let allocator = Allocator::new(NoReallocAlloc);
        let layout = Layout::from_size_align(40, 8).unwrap();

        // SAFETY: Non-zero size layout.
        let ptr = unsafe { allocator.alloc(layout) };
        assert_eq!(global_ledger().size_of(ptr.addr()), Some(40));

        // SAFETY: `ptr` was allocated with `layout`; the new size is non-zero.
        let grown = unsafe { allocator.realloc(ptr, layout, 8000) };

        assert!(grown.is_null());
        assert_eq!(global_ledger().size_of(ptr.addr()), Some(40));

        // SAFETY: The failed realloc left `ptr` live with its original layout.
        unsafe { allocator.dealloc(ptr, layout) };
        assert_eq!(global_ledger().size_of(ptr.addr()), None);
    }
}
