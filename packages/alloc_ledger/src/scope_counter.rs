//! Scoped measurement of outstanding heap bytes.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::ledger::CounterCell;
use crate::{DEFAULT_SHARD_COUNT, Ledger, global_ledger};

/// Accumulates the net number of bytes allocated while it is alive.
///
/// On creation the counter starts at zero and registers itself with a [`Ledger`]; from then
/// on every allocation the ledger records adds to it and every release subtracts from it,
/// regardless of which thread performed it. Dropping the counter deregisters it.
///
/// The value is signed: releasing memory that was allocated before the counter was created
/// makes it go down, possibly below zero.
///
/// Creating and dropping a counter emits `tracing` events at trace level. Whatever a subscriber
/// allocates while handling them happens outside the new counter's lifetime, but every other
/// counter alive at that moment records it. This includes the counter of an enclosing
/// [`measure()`][Self::measure] call.
///
/// # Examples
///
/// ```
/// # #[cfg(not(feature = "interpose"))]
/// use alloc_ledger::Allocator;
/// use alloc_ledger::ScopeCounter;
///
/// # #[cfg(not(feature = "interpose"))]
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let counter = ScopeCounter::new();
///
/// let data = vec![0_u8; 1000];
/// assert!(counter.current_bytes() >= 1000);
///
/// drop(data);
/// ```
#[derive(Debug)]
#[must_use = "Measurements are taken between creation and drop"]
pub struct ScopeCounter<'a, const SHARDS: usize = DEFAULT_SHARD_COUNT> {
    ledger: &'a Ledger<SHARDS>,
    cell: CounterCell,
}

impl ScopeCounter<'static> {
    /// Creates a counter registered with the process-wide [`global_ledger()`].
    ///
    /// The process-wide ledger only sees allocations if its hooks are installed, either via
    /// [`Allocator`][crate::Allocator] as the `#[global_allocator]` or via the `interpose`
    /// feature.
    ///
    /// # Panics
    ///
    /// Panics if the ledger's raw source cannot provide the few bytes the counter needs.
    #[expect(
        clippy::new_without_default,
        reason = "creating a counter registers it, which is not what one expects from Default"
    )]
    pub fn new() -> Self {
        Self::with_ledger(global_ledger())
    }

    /// Runs `f` and returns its result together with the net bytes it allocated.
    ///
    /// Allocations made concurrently by other threads are included, as with any counter.
    ///
    /// # Examples
    ///
    /// ```
    /// # #[cfg(not(feature = "interpose"))]
    /// use alloc_ledger::Allocator;
    /// use alloc_ledger::ScopeCounter;
    ///
    /// # #[cfg(not(feature = "interpose"))]
    /// #[global_allocator]
    /// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
    ///
    /// let (text, bytes) = ScopeCounter::measure(|| "x".repeat(256));
    ///
    /// assert_eq!(text.len(), 256);
    /// assert!(bytes >= 256);
    /// ```
    pub fn measure<R>(f: impl FnOnce() -> R) -> (R, i64) {
        let counter = Self::new();
        let result = f();
        (result, counter.current_bytes())
    }
}

impl<'a, const SHARDS: usize> ScopeCounter<'a, SHARDS> {
    /// Creates a counter registered with `ledger`.
    ///
    /// # Panics
    ///
    /// Panics if the ledger's raw source cannot provide the few bytes the counter needs.
    pub fn with_ledger(ledger: &'a Ledger<SHARDS>) -> Self {
        // Logged before registering so that allocations made by the subscriber are not
        // attributed to this counter. Counters already registered still see them.
        trace!(ledger = ?ledger.stats(), "registering scope counter");

        let cell = ledger.register_counter().expect(
            "we do not intend to handle bookkeeping allocation failure as a real possibility",
        );

        Self { ledger, cell }
    }

    /// Net bytes allocated since this counter was created.
    ///
    /// May be read at any time, including while other threads allocate. The value is an
    /// observation, not a synchronization point: it may be stale by the time it is used.
    #[must_use]
    pub fn current_bytes(&self) -> i64 {
        // SAFETY: The cell is freed only when `self` is dropped.
        unsafe { self.cell.value() }.load(Ordering::Relaxed)
    }
}

impl<const SHARDS: usize> Drop for ScopeCounter<'_, SHARDS> {
    fn drop(&mut self) {
        self.ledger.deregister_counter(self.cell);

        let final_bytes = self.current_bytes();

        // SAFETY: The cell came from this ledger, is deregistered now and `self` is going away.
        unsafe {
            self.ledger.free_counter(self.cell);
        }

        trace!(final_bytes, "scope counter deregistered");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::alloc::System;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use testing::CountingAlloc;
    use tracing::span::{Attributes, Id, Record};
    use tracing::{Event, Metadata, Subscriber};

    use super::*;

    // Registration is tied to one owner, but that owner may move between threads.
    assert_impl_all!(ScopeCounter<'static>: Send);
    assert_not_impl_any!(ScopeCounter<'static>: Sync);

    #[test]
    fn starts_at_zero() {
        let ledger = Ledger::<4>::new(&System);
        ledger.track(0x1000, 1).unwrap();

        let counter = ScopeCounter::with_ledger(&ledger);

        assert_eq!(counter.current_bytes(), 0);
    }

    #[test]
    fn value_survives_moving_the_counter() {
        let ledger = Ledger::<4>::new(&System);
        let counter = ledger.scope_counter();

        ledger.track(0x1000, 77).unwrap();

        let moved = Box::new(counter);
        ledger.track(0x2000, 3).unwrap();

        assert_eq!(moved.current_bytes(), 80);
    }

    #[test]
    fn counter_can_be_read_from_another_thread() {
        static LEDGER: Ledger<4> = Ledger::new(&System);

        let counter = LEDGER.scope_counter();
        LEDGER.track(0x1000, 5).unwrap();

        let value = thread::spawn(move || counter.current_bytes())
            .join()
            .unwrap();

        assert_eq!(value, 5);
        assert_eq!(LEDGER.stats().active_counters(), 0);
        assert_eq!(LEDGER.untrack(0x1000), Some(5));
    }

    #[test]
    fn cell_is_returned_to_raw_source_on_drop() {
        static RAW: CountingAlloc = CountingAlloc::new();

        let ledger = Ledger::<4>::new(&RAW);

        let counter = ledger.scope_counter();
        let outstanding_while_registered = RAW.bytes_outstanding();
        drop(counter);

        assert!(outstanding_while_registered > RAW.bytes_outstanding());
        assert_eq!(ledger.stats().active_counters(), 0);
    }

    #[test]
    fn nested_counters_see_only_their_own_window() {
        let ledger = Ledger::<4>::new(&System);

        let outer = ledger.scope_counter();
        ledger.track(0x1000, 100).unwrap();

        {
            let inner = ledger.scope_counter();
            ledger.track(0x2000, 10).unwrap();
            ledger.untrack(0x1000);

            assert_eq!(inner.current_bytes(), -90);
        }

        ledger.track(0x3000, 1).unwrap();

        assert_eq!(outer.current_bytes(), 11);
    }

    /// Records an 8-byte allocation in a ledger for every event it receives.
    struct AllocatingSubscriber {
        ledger: &'static Ledger<4>,
        next_address: AtomicUsize,
    }

    impl Subscriber for AllocatingSubscriber {
        fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, _span: &Attributes<'_>) -> Id {
            Id::from_u64(1)
        }

        fn record(&self, _span: &Id, _values: &Record<'_>) {}

        fn record_follows_from(&self, _span: &Id, _follows: &Id) {}

        fn event(&self, _event: &Event<'_>) {
            let address = self.next_address.fetch_add(16, Ordering::Relaxed);
            self.ledger.track(address, 8).unwrap();
        }

        fn enter(&self, _span: &Id) {}

        fn exit(&self, _span: &Id) {}
    }

    #[test]
    fn subscriber_allocations_reach_enclosing_counters_only() {
        static LEDGER: Ledger<4> = Ledger::new(&System);

        let outer = LEDGER.scope_counter();

        let subscriber = AllocatingSubscriber {
            ledger: &LEDGER,
            next_address: AtomicUsize::new(0x1000),
        };

        tracing::subscriber::with_default(subscriber, || {
            let inner = LEDGER.scope_counter();

            assert_eq!(inner.current_bytes(), 0);
            assert_eq!(outer.current_bytes(), 8);

            drop(inner);
            assert_eq!(outer.current_bytes(), 16);
        });
    }
}
