#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in `alloc_ledger` packages.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Runs a test with a timeout to prevent infinite hangs.
///
/// Spin locks turn lock ordering mistakes into silent busy loops instead of crashes, so every
/// test that exercises them from multiple threads should run under this watchdog. If the test
/// takes longer than the timeout to complete, the test panics instead of hanging CI.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled
/// and the test function is executed directly. This allows mutation testing to properly detect
/// hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {} second timeout", timeout.as_secs());
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// A raw allocation source that counts the calls made to it.
///
/// Memory comes from [`System`]. Inject a `&'static CountingAlloc` wherever a ledger expects a
/// raw source to observe exactly how much bookkeeping storage it requests, or construct it with
/// [`failing()`](Self::failing) to simulate exhaustion.
///
/// # Example
///
/// ```rust
/// use std::alloc::{GlobalAlloc, Layout};
///
/// use testing::CountingAlloc;
///
/// static RAW: CountingAlloc = CountingAlloc::new();
///
/// let layout = Layout::new::<u32>();
/// // SAFETY: Non-zero size layout; released with the same layout below.
/// unsafe {
///     let ptr = RAW.alloc(layout);
///     RAW.dealloc(ptr, layout);
/// }
///
/// assert_eq!(RAW.allocations(), 1);
/// assert_eq!(RAW.releases(), 1);
/// ```
#[derive(Debug)]
pub struct CountingAlloc {
    allocations: AtomicUsize,
    releases: AtomicUsize,
    bytes_outstanding: AtomicUsize,
    fail: AtomicBool,
}

impl CountingAlloc {
    /// Creates a counting allocator that serves every request.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            bytes_outstanding: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Creates a counting allocator that returns null for every request.
    #[must_use]
    pub const fn failing() -> Self {
        Self {
            allocations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            bytes_outstanding: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
        }
    }

    /// Makes subsequent requests fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    /// Number of successful allocations, including reallocations.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of releases.
    #[must_use]
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }

    /// Bytes currently handed out and not yet released.
    #[must_use]
    pub fn bytes_outstanding(&self) -> usize {
        self.bytes_outstanding.load(Ordering::Relaxed)
    }
}

impl Default for CountingAlloc {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: We delegate to `System`, which implements `GlobalAlloc` correctly, and only add
// bookkeeping on top.
unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if self.fail.load(Ordering::Relaxed) {
            return ptr::null_mut();
        }

        // SAFETY: Forwarding the caller's guarantees to the system allocator.
        let ptr = unsafe { System.alloc(layout) };

        if !ptr.is_null() {
            self.allocations.fetch_add(1, Ordering::Relaxed);
            self.bytes_outstanding
                .fetch_add(layout.size(), Ordering::Relaxed);
        }

        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        self.bytes_outstanding
            .fetch_sub(layout.size(), Ordering::Relaxed);

        // SAFETY: Forwarding the caller's guarantees to the system allocator.
        unsafe { System.dealloc(ptr, layout) }
    }
}
