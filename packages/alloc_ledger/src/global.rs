//! The process-wide ledger fed by the allocation hooks.

#[cfg(not(all(feature = "interpose", target_os = "linux")))]
use std::alloc::System;

use crate::Ledger;

// The hooks wrap some other allocator, so the system allocator is not itself hooked and can
// serve bookkeeping storage.
#[cfg(not(all(feature = "interpose", target_os = "linux")))]
static LEDGER: Ledger = Ledger::new(&System);

// The C heap interface itself is hooked, so `System` (which calls `malloc`) would recurse.
// Bookkeeping goes straight to the real allocator behind the hooks instead.
#[cfg(all(feature = "interpose", target_os = "linux"))]
static LEDGER: Ledger = Ledger::new(crate::registry::resolved_allocator());

/// The ledger that the allocation hooks of this crate report to.
///
/// [`ScopeCounter::new()`][crate::ScopeCounter::new] registers with this ledger. It only
/// records anything if the hooks are installed: [`Allocator`][crate::Allocator] as the
/// `#[global_allocator]`, or the C heap interface with the `interpose` feature.
///
/// # Examples
///
/// ```
/// # #[cfg(not(feature = "interpose"))]
/// use alloc_ledger::Allocator;
/// use alloc_ledger::global_ledger;
///
/// # #[cfg(not(feature = "interpose"))]
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let data = vec![0_u64; 16];
///
/// assert_eq!(global_ledger().size_of(data.as_ptr().addr()), Some(128));
/// ```
#[must_use]
#[inline]
pub fn global_ledger() -> &'static Ledger {
    &LEDGER
}
