#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Byte-accurate accounting of outstanding heap memory, process-wide or within a scope.
//!
//! Every allocation and deallocation that passes through the hooks of this package is recorded
//! in a [`Ledger`], keyed by address. The ledger knows at any moment how many bytes are live,
//! and it broadcasts every change to all currently registered [`ScopeCounter`]s, each of which
//! accumulates the net bytes allocated while it is alive.
//!
//! The core functionality includes:
//! - [`Allocator`] - A Rust memory allocator wrapper that reports to the process-wide ledger
//! - [`ScopeCounter`] - Measures net bytes allocated between its creation and drop
//! - [`Ledger`] - The address to size map and broadcast list behind the counters
//! - [`global_ledger()`] - The process-wide ledger the hooks report to
//!
//! # Simple usage
//!
//! ```
//! # #[cfg(not(feature = "interpose"))]
//! use alloc_ledger::Allocator;
//! use alloc_ledger::ScopeCounter;
//!
//! # #[cfg(not(feature = "interpose"))]
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn main() {
//!     let counter = ScopeCounter::new();
//!
//!     let data = vec![0_u8; 4096];
//!     assert!(counter.current_bytes() >= 4096);
//!
//!     drop(data);
//!     println!("{} bytes still outstanding", counter.current_bytes());
//! }
//! ```
//!
//! Counters see allocations from all threads, not only their own. Run the code of interest in
//! isolation to attribute bytes to it precisely.
//!
//! # Hooking the C heap interface
//!
//! With the `interpose` feature on Linux, this package exports `malloc`, `calloc`, `realloc`,
//! `aligned_alloc` and `free` itself and forwards them to the real allocator found behind it
//! (see [`ResolvedAllocator`]). Then allocations made by C code linked into the process are
//! recorded too, and [`Allocator`] is not available, since it would record them twice.
//!
//! Only these five entry points are hooked. Memory obtained through `posix_memalign`, `memalign`,
//! `valloc` or `pvalloc` bypasses the ledger, and so do its releases. This includes allocations
//! by the Rust standard library's `System` allocator with an alignment above 16 bytes, which it
//! serves with `posix_memalign`.
//!
//! # Bookkeeping storage
//!
//! Records and counters need memory of their own. The ledger never takes it from the hooks it
//! serves, only from the [`RawSource`] it is constructed with; otherwise recording one
//! allocation would cause another.
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so the hooks cannot be exercised under
//! Miri. Ledgers used directly work fine.

#[cfg(not(all(feature = "interpose", target_os = "linux")))]
mod allocator;
mod error;
mod global;
#[cfg(all(feature = "interpose", target_os = "linux"))]
mod interpose;
mod ledger;
mod raw;
#[cfg(target_os = "linux")]
mod registry;
mod scope_counter;
mod sharded_map;
mod sorted_list;
mod spin_lock;
mod stats;

#[cfg(not(all(feature = "interpose", target_os = "linux")))]
pub use allocator::Allocator;
pub use error::{Error, Result};
pub use global::global_ledger;
#[cfg(all(feature = "interpose", target_os = "linux"))]
pub use interpose::{aligned_alloc, calloc, free, malloc, realloc};
pub use ledger::{DEFAULT_SHARD_COUNT, Ledger};
pub use raw::RawSource;
#[cfg(target_os = "linux")]
pub use registry::{ResolvedAllocator, resolved_allocator};
pub use scope_counter::ScopeCounter;
pub use stats::LedgerStats;
