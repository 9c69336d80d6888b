//! Scope counter measurements through the exported C heap interface.
//!
//! Counters observe every thread, so this binary holds a single test: no other test can
//! allocate or release while it measures.

#![cfg(all(feature = "interpose", target_os = "linux", not(miri)))]

use alloc_ledger::{ScopeCounter, global_ledger};

#[test]
fn c_entry_points_update_counters() {
    let counter = ScopeCounter::new();
    assert_eq!(counter.current_bytes(), 0);

    // SAFETY: Plain C allocations, each released exactly once.
    unsafe {
        let block = libc::malloc(123);
        assert!(!block.is_null());
        assert_eq!(counter.current_bytes(), 123);

        let block = libc::realloc(block, 1024);
        assert!(!block.is_null());
        assert_eq!(counter.current_bytes(), 1024);

        libc::free(block);
        assert_eq!(counter.current_bytes(), 0);

        let zeroed = libc::calloc(4, 64);
        assert!(!zeroed.is_null());
        assert_eq!(counter.current_bytes(), 256);

        libc::free(zeroed);
        assert_eq!(counter.current_bytes(), 0);

        let aligned = libc::aligned_alloc(1024, 1024);
        assert!(!aligned.is_null());
        assert_eq!(aligned.addr() % 1024, 0);
        assert_eq!(counter.current_bytes(), 1024);

        libc::free(aligned);
        assert_eq!(counter.current_bytes(), 0);

        let block = libc::malloc(50);
        assert!(!block.is_null());
        assert_eq!(counter.current_bytes(), 50);

        // Releases the block. Should the allocator hand out a fresh zero-byte block instead, it
        // is recorded with no bytes.
        let resized = libc::realloc(block, 0);
        assert_eq!(counter.current_bytes(), 0);

        if resized.is_null() {
            assert_eq!(global_ledger().size_of(block.addr()), None);
        } else {
            assert_eq!(global_ledger().size_of(resized.addr()), Some(0));
            libc::free(resized);
        }
    }

    assert_eq!(counter.current_bytes(), 0);
}
