//! The C heap interface, exported by this crate so that every allocation in the process is
//! recorded in the [`global_ledger()`], including those made by C code and by the Rust
//! standard library's `System` allocator.
//!
//! Each entry point forwards to the real allocator from the
//! [`resolved_allocator()`][crate::resolved_allocator] registry and reports the result. The only
//! requests not served by the real allocator are those made while the calling thread is still
//! looking up an entry point (symbol lookup may allocate); a small static bootstrap arena serves
//! those and they are never recorded.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::or_fatal;
use crate::global_ledger;
use crate::registry::resolved_allocator;

const BOOTSTRAP_CAPACITY: usize = 64 * 1024;

/// Matches what `malloc` guarantees, so bootstrap blocks are valid for any ordinary request.
const BOOTSTRAP_ALIGN: usize = 16;

/// Each block is preceded by its requested size.
const BOOTSTRAP_HEADER: usize = BOOTSTRAP_ALIGN;

/// Bump allocator over a static buffer. Blocks are never reused, so released ones simply leak.
#[repr(C, align(16))]
struct BootstrapArena {
    storage: UnsafeCell<[u8; BOOTSTRAP_CAPACITY]>,
    used: AtomicUsize,
}

// SAFETY: Each byte of `storage` is handed out at most once, via the atomic bump of `used`, so
// no two threads ever receive overlapping blocks.
unsafe impl Sync for BootstrapArena {}

impl BootstrapArena {
    const fn new() -> Self {
        Self {
            storage: UnsafeCell::new([0; BOOTSTRAP_CAPACITY]),
            used: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.storage.get().cast()
    }

    /// Returns a zeroed block, or null if the arena cannot fit it.
    fn allocate(&self, size: usize, align: usize) -> *mut c_void {
        if !align.is_power_of_two() {
            return ptr::null_mut();
        }

        let align = align.max(BOOTSTRAP_ALIGN);
        let base = self.base();

        let mut used = self.used.load(Ordering::Relaxed);

        loop {
            let Some((start, end)) = Self::place(base.addr(), used, size, align) else {
                return ptr::null_mut();
            };

            match self
                .used
                .compare_exchange_weak(used, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    // The block and its header lie within `storage`, so the offsets stay in
                    // bounds.
                    let block = base.wrapping_add(start);

                    // SAFETY: The header is inside the range this thread just claimed and is
                    // aligned for `usize` because `start` is a multiple of `BOOTSTRAP_HEADER`.
                    unsafe {
                        block.wrapping_sub(BOOTSTRAP_HEADER).cast::<usize>().write(size);
                    }

                    return block.cast();
                }
                Err(actual) => used = actual,
            }
        }
    }

    /// Offsets of a block that starts after `used` bytes plus its header, or `None` if it does
    /// not fit.
    fn place(base: usize, used: usize, size: usize, align: usize) -> Option<(usize, usize)> {
        let start = base
            .checked_add(used)?
            .checked_add(BOOTSTRAP_HEADER)?
            .checked_next_multiple_of(align)?
            .checked_sub(base)?;

        // Zero-byte requests still get a unique address.
        let end = start.checked_add(size.max(1))?;

        (end <= BOOTSTRAP_CAPACITY).then_some((start, end))
    }

    fn contains(&self, ptr: *const c_void) -> bool {
        let base = self.base().addr();

        ptr.addr()
            .checked_sub(base)
            .is_some_and(|offset| offset < BOOTSTRAP_CAPACITY)
    }

    /// The size that the block at `ptr` was requested with.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate()` of this arena.
    unsafe fn block_size(ptr: *const c_void) -> usize {
        // SAFETY: The caller guarantees a header precedes the block, written before the block
        // was handed out.
        unsafe { ptr.cast::<u8>().sub(BOOTSTRAP_HEADER).cast::<usize>().read() }
    }
}

static BOOTSTRAP: BootstrapArena = BootstrapArena::new();

/// Records a block returned by the real allocator.
#[inline]
fn record(ptr: *mut c_void, size: usize) {
    if !ptr.is_null() && resolved_allocator().bookkeeping_ready() {
        or_fatal(global_ledger().track(ptr.addr(), size));
    }
}

/// Allocates `size` bytes.
///
/// # Safety
///
/// Same contract as the C standard `malloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
    let Some(real) = resolved_allocator().real_malloc() else {
        return BOOTSTRAP.allocate(size, BOOTSTRAP_ALIGN);
    };

    // SAFETY: Forwarding the caller's guarantees.
    let ptr = unsafe { real(size) };

    record(ptr, size);
    ptr
}

/// Allocates zeroed storage for `count` elements of `size` bytes.
///
/// # Safety
///
/// Same contract as the C standard `calloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(count: libc::size_t, size: libc::size_t) -> *mut c_void {
    let Some(real) = resolved_allocator().real_calloc() else {
        // The arena starts zeroed and its blocks are never reused.
        return count.checked_mul(size).map_or(ptr::null_mut(), |total| {
            BOOTSTRAP.allocate(total, BOOTSTRAP_ALIGN)
        });
    };

    // SAFETY: Forwarding the caller's guarantees.
    let ptr = unsafe { real(count, size) };

    // A successful result implies the product did not overflow.
    record(ptr, count.saturating_mul(size));
    ptr
}

/// Allocates `size` bytes aligned to `alignment`.
///
/// # Safety
///
/// Same contract as the C standard `aligned_alloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(
    alignment: libc::size_t,
    size: libc::size_t,
) -> *mut c_void {
    let Some(real) = resolved_allocator().real_aligned_alloc() else {
        return BOOTSTRAP.allocate(size, alignment);
    };

    // SAFETY: Forwarding the caller's guarantees.
    let ptr = unsafe { real(alignment, size) };

    record(ptr, size);
    ptr
}

/// Resizes the block at `ptr` to `size` bytes.
///
/// # Safety
///
/// Same contract as the C standard `realloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
    if ptr.is_null() {
        // SAFETY: Equivalent by the C standard.
        return unsafe { malloc(size) };
    }

    if BOOTSTRAP.contains(ptr) {
        // SAFETY: Plain allocation request.
        let moved = unsafe { malloc(size) };

        if !moved.is_null() {
            // SAFETY: The caller guarantees `ptr` is a live block, so it came from the arena.
            let len = size.min(unsafe { BootstrapArena::block_size(ptr) });

            // SAFETY: Both blocks hold at least `len` bytes and are distinct live blocks, so
            // they do not overlap.
            unsafe {
                ptr::copy_nonoverlapping(ptr.cast::<u8>(), moved.cast::<u8>(), len);
            }
        }

        return moved;
    }

    let Some(real) = resolved_allocator().real_realloc() else {
        // Only possible while this thread is looking up `realloc` itself. Failing leaves the
        // block intact, as C requires.
        return ptr::null_mut();
    };

    let ledger = global_ledger();

    // The old address may be handed to another thread as soon as the real call returns.
    let previous = ledger.untrack(ptr.addr());

    // SAFETY: Forwarding the caller's guarantees.
    let new_ptr = unsafe { real(ptr, size) };

    if !new_ptr.is_null() {
        record(new_ptr, size);
    } else if size != 0 {
        // Failed; the original block is still live.
        if let Some(previous) = previous {
            record(ptr, previous);
        }
    }

    // A zero-size request that returned null has freed the block, which stays untracked.
    new_ptr
}

/// Releases the block at `ptr`.
///
/// # Safety
///
/// Same contract as the C standard `free`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() || BOOTSTRAP.contains(ptr) {
        return;
    }

    // Removing a record never allocates, so this is safe even before bookkeeping is ready.
    global_ledger().untrack(ptr.addr());

    if let Some(real) = resolved_allocator().real_free() {
        // SAFETY: Forwarding the caller's guarantees.
        unsafe { real(ptr) }
    }
}
