//! Thread safety integration tests for `alloc_ledger`.
//!
//! These tests drive ledgers through the public API from many threads at once. They use their
//! own ledgers with plain addresses, so no global allocator is needed.

use std::alloc::System;
use std::sync::Barrier;
use std::thread;

use alloc_ledger::{Ledger, ScopeCounter};
use testing::with_watchdog;

#[test]
fn two_threads_of_matched_cycles_balance_to_zero() {
    const CYCLES: usize = 1000;

    static LEDGER: Ledger<64> = Ledger::new(&System);

    with_watchdog(|| {
        let counter = LEDGER.scope_counter();

        thread::scope(|s| {
            for thread_index in 0..2_usize {
                s.spawn(move || {
                    for cycle in 0..CYCLES {
                        let address = 0x10_0000 * (thread_index + 1) + cycle * 16;

                        LEDGER.track(address, cycle + 1).unwrap();
                        assert_eq!(LEDGER.untrack(address), Some(cycle + 1));
                    }
                });
            }
        });

        assert_eq!(counter.current_bytes(), 0);
        assert_eq!(LEDGER.stats().live_allocations(), 0);
    });
}

#[test]
fn every_counter_sees_the_same_total() {
    const THREADS: usize = 4;
    const RECORDS_PER_THREAD: usize = 250;

    static LEDGER: Ledger<16> = Ledger::new(&System);

    with_watchdog(|| {
        let counters = (0..3).map(|_| LEDGER.scope_counter()).collect::<Vec<_>>();

        thread::scope(|s| {
            for thread_index in 0..THREADS {
                s.spawn(move || {
                    for record in 0..RECORDS_PER_THREAD {
                        let address = (thread_index * RECORDS_PER_THREAD + record + 1) * 8;
                        LEDGER.track(address, 4).unwrap();
                    }
                });
            }
        });

        let expected = i64::try_from(THREADS * RECORDS_PER_THREAD * 4).unwrap();

        for counter in &counters {
            assert_eq!(counter.current_bytes(), expected);
        }

        assert_eq!(LEDGER.stats().live_bytes(), expected.unsigned_abs());
    });
}

#[test]
fn counters_can_be_created_and_dropped_on_any_thread() {
    static LEDGER: Ledger<8> = Ledger::new(&System);

    with_watchdog(|| {
        let barrier = Barrier::new(8);

        thread::scope(|s| {
            for thread_index in 0..8_usize {
                let barrier = &barrier;

                s.spawn(move || {
                    barrier.wait();

                    for round in 0..100_usize {
                        let counter = ScopeCounter::with_ledger(&LEDGER);

                        let address = 0x1000 + (thread_index * 100 + round) * 32;
                        LEDGER.track(address, 1).unwrap();
                        LEDGER.untrack(address);

                        // Other threads' records come and go too, each of them balanced.
                        let seen = counter.current_bytes();
                        assert!((-8..=8).contains(&seen), "unexpected value {seen}");
                    }
                });
            }
        });

        assert_eq!(LEDGER.stats().active_counters(), 0);
        assert_eq!(LEDGER.stats().live_allocations(), 0);
    });
}

#[test]
fn counter_moves_to_another_thread() {
    static LEDGER: Ledger<4> = Ledger::new(&System);

    let counter = LEDGER.scope_counter();
    LEDGER.track(0xA000, 99).unwrap();

    let seen = thread::spawn(move || {
        LEDGER.track(0xB000, 1).unwrap();
        counter.current_bytes()
    })
    .join()
    .unwrap();

    assert_eq!(seen, 100);
    assert_eq!(LEDGER.stats().active_counters(), 0);
}
