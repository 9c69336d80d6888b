use std::fmt;

/// A point-in-time snapshot of a [`Ledger`][crate::Ledger]'s totals.
///
/// Obtained from [`Ledger::stats()`][crate::Ledger::stats].
///
/// # Examples
///
/// ```
/// use std::alloc::System;
///
/// use alloc_ledger::Ledger;
///
/// let ledger = Ledger::<16>::new(&System);
/// ledger.track(0x1000, 64).unwrap();
///
/// let stats = ledger.stats();
/// assert_eq!(stats.live_bytes(), 64);
/// assert_eq!(stats.live_allocations(), 1);
/// println!("{stats}");
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LedgerStats {
    live_bytes: u64,
    live_allocations: u64,
    active_counters: usize,
}

impl LedgerStats {
    pub(crate) const fn new(live_bytes: u64, live_allocations: u64, active_counters: usize) -> Self {
        Self {
            live_bytes,
            live_allocations,
            active_counters,
        }
    }

    /// Sum of the sizes of all allocations currently recorded.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    /// Number of allocations currently recorded.
    #[must_use]
    pub fn live_allocations(&self) -> u64 {
        self.live_allocations
    }

    /// Number of scope counters currently registered.
    #[must_use]
    pub fn active_counters(&self) -> usize {
        self.active_counters
    }
}

impl fmt::Display for LedgerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {} live allocations, {} scope counters",
            self.live_bytes, self.live_allocations, self.active_counters
        )
    }
}
