//! Lazily resolved entry points of the real C heap allocator.
//!
//! When this crate exports the C heap interface itself, the implementation it stands in front
//! of is found with `dlsym(RTLD_NEXT, ..)`: the next definition of the symbol in link order,
//! the one that would have been called without the hooks. Each entry point is resolved on its
//! first use and cached for the rest of the process lifetime.

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::{CStr, c_void};
use std::fmt;
use std::hint::spin_loop;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::fatal;

pub(crate) type MallocFn = unsafe extern "C" fn(size: libc::size_t) -> *mut c_void;
pub(crate) type ReallocFn =
    unsafe extern "C" fn(ptr: *mut c_void, size: libc::size_t) -> *mut c_void;
pub(crate) type CallocFn =
    unsafe extern "C" fn(count: libc::size_t, size: libc::size_t) -> *mut c_void;
pub(crate) type AlignedAllocFn =
    unsafe extern "C" fn(alignment: libc::size_t, size: libc::size_t) -> *mut c_void;
pub(crate) type FreeFn = unsafe extern "C" fn(ptr: *mut c_void);

/// The alignment that `malloc` guarantees for every allocation.
const MIN_ALIGN: usize = if cfg!(target_pointer_width = "64") {
    16
} else {
    8
};

/// No thread is resolving the slot.
const NO_RESOLVER: usize = 0;

/// Identifies the calling thread without touching thread-local storage, which may allocate.
#[expect(
    clippy::cast_possible_truncation,
    reason = "pthread_t is an unsigned long, which is pointer-sized on Linux"
)]
fn current_thread_token() -> usize {
    // SAFETY: No preconditions. Never returns zero for a live thread.
    (unsafe { libc::pthread_self() }) as usize
}

/// One entry point: unresolved until the first lookup succeeds, then fixed forever.
struct Slot {
    symbol: &'static CStr,

    // Null until resolved. Written exactly once, by the thread holding `resolver`.
    resolved: AtomicPtr<c_void>,

    // Token of the thread currently performing the lookup, or `NO_RESOLVER`.
    resolver: AtomicUsize,
}

impl Slot {
    const fn new(symbol: &'static CStr) -> Self {
        Self {
            symbol,
            resolved: AtomicPtr::new(ptr::null_mut()),
            resolver: AtomicUsize::new(NO_RESOLVER),
        }
    }

    /// Returns the resolved entry point, resolving it first if needed.
    ///
    /// Returns `None` if the calling thread is itself in the middle of resolving this slot,
    /// which happens when the symbol lookup allocates through the hooks.
    #[inline]
    fn get(&self) -> Option<NonNull<c_void>> {
        NonNull::new(self.resolved.load(Ordering::Acquire)).or_else(|| self.resolve())
    }

    #[cold]
    fn resolve(&self) -> Option<NonNull<c_void>> {
        let token = current_thread_token();

        loop {
            match self.resolver.compare_exchange_weak(
                NO_RESOLVER,
                token,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(owner) if owner == token => return None,
                Err(_) => {
                    // Someone else is resolving. Their result is as good as ours.
                    if let Some(resolved) = NonNull::new(self.resolved.load(Ordering::Acquire)) {
                        return Some(resolved);
                    }

                    spin_loop();
                }
            }
        }

        // Another thread may have finished between our fast path check and taking ownership.
        let resolved = NonNull::new(self.resolved.load(Ordering::Acquire)).unwrap_or_else(|| {
            // SAFETY: `symbol` is a valid nul-terminated string and `RTLD_NEXT` is a valid
            // pseudo-handle for `dlsym`.
            let found = unsafe { libc::dlsym(libc::RTLD_NEXT, self.symbol.as_ptr()) };

            let Some(found) = NonNull::new(found) else {
                fatal("alloc_ledger: the real allocator entry point could not be resolved\n");
            };

            self.resolved.store(found.as_ptr(), Ordering::Release);
            found
        });

        self.resolver.store(NO_RESOLVER, Ordering::Release);

        Some(resolved)
    }

    fn is_resolved(&self) -> bool {
        !self.resolved.load(Ordering::Acquire).is_null()
    }
}

/// The real C heap allocator of the process, as found behind this crate's hooks.
///
/// Each of the five entry points (`malloc`, `realloc`, `calloc`, `aligned_alloc` and `free`) is
/// looked up on its first use and never again. The lookup is atomic: when several threads race
/// to resolve the same entry point, one of them performs it and the others adopt its result.
/// An entry point that cannot be found aborts the process.
///
/// As a [`GlobalAlloc`] this allocates directly from the real allocator, so it is a suitable
/// [`RawSource`][crate::RawSource] even when the C heap interface is hooked.
///
/// # Examples
///
/// ```
/// use alloc_ledger::{Ledger, resolved_allocator};
///
/// static LEDGER: Ledger<64> = Ledger::new(resolved_allocator());
///
/// LEDGER.track(0x1000, 48).unwrap();
/// assert_eq!(LEDGER.size_of(0x1000), Some(48));
/// ```
pub struct ResolvedAllocator {
    malloc: Slot,
    realloc: Slot,
    calloc: Slot,
    aligned_alloc: Slot,
    free: Slot,
}

impl ResolvedAllocator {
    const fn new() -> Self {
        Self {
            malloc: Slot::new(c"malloc"),
            realloc: Slot::new(c"realloc"),
            calloc: Slot::new(c"calloc"),
            aligned_alloc: Slot::new(c"aligned_alloc"),
            free: Slot::new(c"free"),
        }
    }

    pub(crate) fn real_malloc(&self) -> Option<MallocFn> {
        self.malloc.get().map(|f| {
            // SAFETY: `dlsym` returned the address of the `malloc` function, whose signature
            // is the C standard one this type describes.
            unsafe { mem::transmute::<*mut c_void, MallocFn>(f.as_ptr()) }
        })
    }

    pub(crate) fn real_realloc(&self) -> Option<ReallocFn> {
        self.realloc.get().map(|f| {
            // SAFETY: As in `real_malloc()`, for `realloc`.
            unsafe { mem::transmute::<*mut c_void, ReallocFn>(f.as_ptr()) }
        })
    }

    pub(crate) fn real_calloc(&self) -> Option<CallocFn> {
        self.calloc.get().map(|f| {
            // SAFETY: As in `real_malloc()`, for `calloc`.
            unsafe { mem::transmute::<*mut c_void, CallocFn>(f.as_ptr()) }
        })
    }

    pub(crate) fn real_aligned_alloc(&self) -> Option<AlignedAllocFn> {
        self.aligned_alloc.get().map(|f| {
            // SAFETY: As in `real_malloc()`, for `aligned_alloc`.
            unsafe { mem::transmute::<*mut c_void, AlignedAllocFn>(f.as_ptr()) }
        })
    }

    pub(crate) fn real_free(&self) -> Option<FreeFn> {
        self.free.get().map(|f| {
            // SAFETY: As in `real_malloc()`, for `free`.
            unsafe { mem::transmute::<*mut c_void, FreeFn>(f.as_ptr()) }
        })
    }

    /// Resolves every entry point that bookkeeping storage may come from.
    ///
    /// Returns `false` if the calling thread is resolving one of them right now, in which case
    /// the ledger must not be touched: a lookup it triggered could run under a ledger lock.
    #[cfg(any(test, feature = "interpose"))]
    pub(crate) fn bookkeeping_ready(&self) -> bool {
        self.malloc.get().is_some()
            && self.aligned_alloc.get().is_some()
            && self.free.get().is_some()
    }
}

impl fmt::Debug for ResolvedAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAllocator")
            .field("malloc", &self.malloc.is_resolved())
            .field("realloc", &self.realloc.is_resolved())
            .field("calloc", &self.calloc.is_resolved())
            .field("aligned_alloc", &self.aligned_alloc.is_resolved())
            .field("free", &self.free.is_resolved())
            .finish()
    }
}

#[inline]
fn fits_malloc(align: usize, size: usize) -> bool {
    align <= MIN_ALIGN && align <= size
}

// SAFETY: Every request is served by the real C allocator, which returns blocks of at least the
// requested size and alignment: `malloc` guarantees `MIN_ALIGN` and larger alignments go through
// `aligned_alloc`. Blocks from either are released with `free`.
unsafe impl GlobalAlloc for ResolvedAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if fits_malloc(layout.align(), layout.size()) {
            let Some(malloc) = self.real_malloc() else {
                return ptr::null_mut();
            };

            // SAFETY: Plain C call with a size argument.
            unsafe { malloc(layout.size()) }.cast()
        } else {
            let Some(aligned_alloc) = self.real_aligned_alloc() else {
                return ptr::null_mut();
            };

            // C requires the size to be a multiple of the alignment.
            let padded = layout.pad_to_align();

            // SAFETY: The alignment is a power of two and the size is a multiple of it.
            unsafe { aligned_alloc(padded.align(), padded.size()) }.cast()
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if fits_malloc(layout.align(), layout.size()) {
            let Some(calloc) = self.real_calloc() else {
                return ptr::null_mut();
            };

            // SAFETY: Plain C call with count and size arguments.
            unsafe { calloc(1, layout.size()) }.cast()
        } else {
            // SAFETY: Forwarding the caller's guarantees.
            let ptr = unsafe { self.alloc(layout) };

            if !ptr.is_null() {
                // SAFETY: The block was just allocated with at least `layout.size()` bytes.
                unsafe {
                    ptr::write_bytes(ptr, 0, layout.size());
                }
            }

            ptr
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // A block exists, so `malloc` or `aligned_alloc` was used and `free` can only be
        // unresolved if the lookup of `free` itself is freeing. Leaking is all we can do then.
        if let Some(free) = self.real_free() {
            // SAFETY: The caller guarantees `ptr` came from this allocator.
            unsafe { free(ptr.cast()) }
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if fits_malloc(layout.align(), new_size) {
            let Some(realloc) = self.real_realloc() else {
                return ptr::null_mut();
            };

            // SAFETY: The caller guarantees `ptr` came from this allocator.
            return unsafe { realloc(ptr.cast(), new_size) }.cast();
        }

        // SAFETY: The caller guarantees that `new_size` rounded up to the alignment does not
        // overflow, which is what makes this layout valid.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };

        // SAFETY: `new_layout` has a non-zero size, as the caller guarantees.
        let new_ptr = unsafe { self.alloc(new_layout) };

        if !new_ptr.is_null() {
            // SAFETY: Both blocks are live, distinct and at least this long.
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            }

            // SAFETY: The caller guarantees `ptr` came from this allocator with `layout`.
            unsafe {
                self.dealloc(ptr, layout);
            }
        }

        new_ptr
    }
}

static RESOLVED_ALLOCATOR: ResolvedAllocator = ResolvedAllocator::new();

/// The process-wide [`ResolvedAllocator`].
#[must_use]
#[inline]
pub const fn resolved_allocator() -> &'static ResolvedAllocator {
    &RESOLVED_ALLOCATOR
}
