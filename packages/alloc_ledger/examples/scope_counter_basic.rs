//! Measures how many heap bytes a few common operations leave outstanding.
//!
//! Shows the main types of the `alloc_ledger` crate:
//! - `Allocator`: Global allocator wrapper that reports to the process-wide ledger
//! - `ScopeCounter`: Net bytes allocated between its creation and drop
//! - `global_ledger()`: Totals and per-address sizes of everything live
//!
//! Run with: `cargo run --example scope_counter_basic`

use std::collections::HashMap;
use std::hint::black_box;

#[cfg(not(all(feature = "interpose", target_os = "linux")))]
use alloc_ledger::Allocator;
use alloc_ledger::{ScopeCounter, global_ledger};

#[cfg(not(all(feature = "interpose", target_os = "linux")))]
#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

fn main() {
    let counter = ScopeCounter::new();

    let numbers = black_box((0..1000_u32).collect::<Vec<_>>());
    let after_vec = counter.current_bytes();

    let mut names = HashMap::new();
    for i in 0..100 {
        names.insert(i, format!("name number {i}"));
    }
    let after_map = counter.current_bytes();

    drop(numbers);
    let after_drop = counter.current_bytes();

    // Printing allocates as well, so read everything first.
    println!("after collecting 1000 numbers: {after_vec} bytes");
    println!("after building a map of 100 names: {after_map} bytes");
    println!("after dropping the numbers: {after_drop} bytes");

    let (text, bytes) = ScopeCounter::measure(|| "abc".repeat(1000));
    println!("repeating a string to {} chars took {bytes} bytes", text.len());

    println!("process-wide: {}", global_ledger().stats());

    black_box(names);
}
