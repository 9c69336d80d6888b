use std::alloc::Layout;
use std::any::type_name;
use std::fmt;
use std::iter::FusedIterator;
use std::ptr::{self, NonNull};

use crate::error::{Error, Result};
use crate::raw::{self, RawSource};

/// Capacity of the backing store on first growth. Doubles on every subsequent growth.
const INITIAL_CAPACITY: usize = 4;

/// A singly-linked list of key-value pairs kept in ascending key order.
///
/// Nodes are not individually heap-allocated. They live in an arena of indexed slots backed by
/// a single flat array obtained from the raw source, and link to each other by index. Vacant
/// slots form an intrusive free list, so removing and re-inserting reuses storage without
/// touching the raw source at all. The arena only grows; it
/// is returned to the raw source when the list is dropped.
///
/// All operations are linear scans. The list is meant to be kept short by sharding (see
/// `ShardedMap`).
pub(crate) struct SortedList<K, V> {
    slots: NonNull<Slot<K, V>>,
    capacity: usize,

    /// Index of the first occupied slot in key order.
    head: Option<usize>,

    /// Index of the next free slot. Think of this as a virtual stack of the most recently
    /// freed slots, with the stack entries stored in the vacant slots themselves. Points out of
    /// bounds (at `capacity`) when the arena is full.
    next_free_index: usize,

    len: usize,

    raw: RawSource,
}

#[derive(Clone, Copy, Debug)]
enum Slot<K, V> {
    Occupied { key: K, value: V, next: Option<usize> },

    Vacant { next_free_index: usize },
}

// SAFETY: The list exclusively owns its arena, so sending it to another thread is as safe as
// sending the keys and values it contains. The raw source is `Sync`, so sharing it is fine.
unsafe impl<K: Send, V: Send> Send for SortedList<K, V> {}

impl<K, V> SortedList<K, V>
where
    K: Copy + Ord,
    V: Copy,
{
    /// Creates an empty list. No storage is requested from `raw` until the first insertion.
    pub(crate) const fn new(raw: RawSource) -> Self {
        Self {
            slots: NonNull::dangling(),
            capacity: 0,
            head: None,
            next_free_index: 0,
            len: 0,
            raw,
        }
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts `value` under `key`, keeping the list in ascending key order.
    ///
    /// A key that is already present is a contract violation: the existing record is left
    /// untouched and [`Error::RepeatedKey`] is returned.
    pub(crate) fn insert(&mut self, key: K, value: V) -> Result<()> {
        let mut previous = None;
        let mut current = self.head;

        while let Some(index) = current {
            let (existing_key, _, next) = self.occupied(index);

            if existing_key == key {
                return Err(Error::RepeatedKey);
            }

            if existing_key > key {
                break;
            }

            previous = Some(index);
            current = next;
        }

        let index = self.take_vacant()?;
        *self.slot_mut(index) = Slot::Occupied {
            key,
            value,
            next: current,
        };

        match previous {
            Some(previous) => self.set_next(previous, Some(index)),
            None => self.head = Some(index),
        }

        self.len = self
            .len
            .checked_add(1)
            .expect("cannot have more items than arena slots, which are bounded by usize");

        Ok(())
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub(crate) fn find(&self, key: K) -> Option<V> {
        self.iter()
            .take_while(|(existing_key, _)| *existing_key <= key)
            .find(|(existing_key, _)| *existing_key == key)
            .map(|(_, value)| value)
    }

    /// Removes the record stored under `key` and returns its value.
    ///
    /// Removing an absent key does nothing and returns `None`.
    pub(crate) fn remove(&mut self, key: K) -> Option<V> {
        let mut previous = None;
        let mut current = self.head;

        while let Some(index) = current {
            let (existing_key, value, next) = self.occupied(index);

            if existing_key > key {
                return None;
            }

            if existing_key == key {
                match previous {
                    Some(previous) => self.set_next(previous, next),
                    None => self.head = next,
                }

                *self.slot_mut(index) = Slot::Vacant {
                    next_free_index: self.next_free_index,
                };
                self.next_free_index = index;

                self.len = self
                    .len
                    .checked_sub(1)
                    .expect("we just unlinked an occupied slot so len cannot be zero");

                return Some(value);
            }

            previous = Some(index);
            current = next;
        }

        None
    }

    /// The record with the smallest key.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn first(&self) -> Option<(K, V)> {
        self.iter().next()
    }

    /// The record with the largest key.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn last(&self) -> Option<(K, V)> {
        self.iter().last()
    }

    /// Iterates over all records in ascending key order.
    pub(crate) fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            list: self,
            current: self.head,
        }
    }

    fn occupied(&self, index: usize) -> (K, V, Option<usize>) {
        match *self.slot(index) {
            Slot::Occupied { key, value, next } => (key, value, next),
            Slot::Vacant { .. } => panic!(
                "linked slot {index} was vacant in sorted list of {}",
                type_name::<V>()
            ),
        }
    }

    fn set_next(&mut self, index: usize, new_next: Option<usize>) {
        match self.slot_mut(index) {
            Slot::Occupied { next, .. } => *next = new_next,
            Slot::Vacant { .. } => panic!(
                "linked slot {index} was vacant in sorted list of {}",
                type_name::<V>()
            ),
        }
    }

    /// Pops a slot off the free list, growing the arena first if it is full.
    fn take_vacant(&mut self) -> Result<usize> {
        if self.next_free_index >= self.capacity {
            self.grow()?;
        }

        let index = self.next_free_index;

        match *self.slot(index) {
            Slot::Vacant { next_free_index } => self.next_free_index = next_free_index,
            Slot::Occupied { .. } => panic!(
                "free list pointed at occupied slot {index} in sorted list of {}",
                type_name::<V>()
            ),
        }

        Ok(index)
    }

    #[cold]
    fn grow(&mut self) -> Result<()> {
        let new_capacity = if self.capacity == 0 {
            INITIAL_CAPACITY
        } else {
            self.capacity
                .checked_mul(2)
                .ok_or(Error::StorageExhausted { bytes: usize::MAX })?
        };

        let new_layout = Self::layout(new_capacity)?;
        let new_slots = raw::allocate(self.raw, new_layout)?.cast::<Slot<K, V>>();

        if self.capacity > 0 {
            // SAFETY: Both regions are valid for `capacity` slots (the new one holds more) and
            // come from distinct allocations, so they cannot overlap. Slots are `Copy`.
            unsafe {
                ptr::copy_nonoverlapping(self.slots.as_ptr(), new_slots.as_ptr(), self.capacity);
            }

            let old_layout = Self::layout(self.capacity)?;

            // SAFETY: The old arena was allocated from the same raw source with this layout and
            // everything in it has just been copied out.
            unsafe {
                raw::release(self.raw, self.slots.cast(), old_layout);
            }
        }

        for index in self.capacity..new_capacity {
            // SAFETY: `index` is within the new arena of `new_capacity` slots.
            let slot = unsafe { new_slots.add(index) };

            // SAFETY: The pointer is valid for writes and of the right type. Slots are `Copy`
            // so there is no previous value that would need dropping.
            unsafe {
                slot.as_ptr().write(Slot::Vacant {
                    // For the last slot this points out of bounds, which marks the arena full.
                    next_free_index: index
                        .checked_add(1)
                        .expect("index is below new_capacity, which is a valid usize"),
                });
            }
        }

        self.slots = new_slots;
        // We only grow when the free list is exhausted, so it continues into the new slots.
        self.next_free_index = self.capacity;
        self.capacity = new_capacity;

        Ok(())
    }

    fn layout(capacity: usize) -> Result<Layout> {
        Layout::array::<Slot<K, V>>(capacity).map_err(|_overflow| Error::StorageExhausted {
            bytes: usize::MAX,
        })
    }

    fn slot(&self, index: usize) -> &Slot<K, V> {
        assert!(
            index < self.capacity,
            "slot {index} out of bounds in sorted list of {}",
            type_name::<V>()
        );

        // SAFETY: Guarded by the bounds check above and every slot below `capacity` is
        // initialized when the arena grows.
        unsafe { self.slots.add(index).as_ref() }
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot<K, V> {
        assert!(
            index < self.capacity,
            "slot {index} out of bounds in sorted list of {}",
            type_name::<V>()
        );

        // SAFETY: Guarded by the bounds check above and every slot below `capacity` is
        // initialized when the arena grows. We hold `&mut self` so the access is exclusive.
        unsafe { self.slots.add(index).as_mut() }
    }
}

impl<K, V> Drop for SortedList<K, V> {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }

        // Cannot fail: the same layout was computed successfully when the arena grew.
        let Ok(layout) = Layout::array::<Slot<K, V>>(self.capacity) else {
            return;
        };

        // SAFETY: The arena was allocated from this raw source with this layout. Slots are
        // `Copy` so there is nothing to drop inside them.
        unsafe {
            raw::release(self.raw, self.slots.cast(), layout);
        }
    }
}

impl<K, V> fmt::Debug for SortedList<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Iterator over the records of a [`SortedList`] in ascending key order.
#[derive(Debug)]
pub(crate) struct Iter<'a, K, V> {
    list: &'a SortedList<K, V>,
    current: Option<usize>,
}

impl<K, V> Iterator for Iter<'_, K, V>
where
    K: Copy + Ord,
    V: Copy,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.current?;
        let (key, value, next) = self.list.occupied(index);
        self.current = next;
        Some((key, value))
    }
}

impl<K, V> FusedIterator for Iter<'_, K, V>
where
    K: Copy + Ord,
    V: Copy,
{
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::alloc::System;

    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use testing::CountingAlloc;

    use super::*;

    assert_impl_all!(SortedList<usize, usize>: Send);
    assert_not_impl_any!(SortedList<usize, usize>: Sync);

    fn keys(list: &SortedList<i32, &'static str>) -> Vec<i32> {
        list.iter().map(|(key, _)| key).collect()
    }

    #[test]
    fn insert_keeps_ascending_order() {
        let mut list = SortedList::new(&System);

        list.insert(6, "six").unwrap();
        assert_eq!(list.first(), Some((6, "six")));
        assert_eq!(list.last(), Some((6, "six")));

        list.insert(3, "three").unwrap();
        assert_eq!(keys(&list), [3, 6]);

        list.insert(9, "nine").unwrap();
        assert_eq!(list.last(), Some((9, "nine")));

        list.insert(7, "seven").unwrap();
        assert_eq!(keys(&list), [3, 6, 7, 9]);

        list.insert(1, "one").unwrap();
        assert_eq!(list.first(), Some((1, "one")));

        list.insert(4, "four").unwrap();

        assert_eq!(keys(&list), [1, 3, 4, 6, 7, 9]);
        assert_eq!(list.len(), 6);
    }

    #[test]
    fn repeated_key_is_rejected_without_overwrite() {
        let mut list = SortedList::new(&System);

        list.insert(3, "three").unwrap();
        let result = list.insert(3, "other");

        assert!(matches!(result, Err(Error::RepeatedKey)));
        assert_eq!(list.find(3), Some("three"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn find_matches_only_present_keys() {
        let mut list = SortedList::new(&System);

        assert_eq!(list.find(0), None);

        list.insert(3, "three").unwrap();
        list.insert(6, "six").unwrap();
        list.insert(9, "nine").unwrap();

        assert_eq!(list.find(3), Some("three"));
        assert_eq!(list.find(6), Some("six"));
        assert_eq!(list.find(9), Some("nine"));
        assert_eq!(list.find(10), None);
        assert_eq!(list.find(5), None);

        assert_eq!(list.remove(6), Some("six"));
        assert_eq!(list.find(6), None);
    }

    #[test]
    fn remove_relinks_head_tail_and_middle() {
        let mut list = SortedList::new(&System);

        assert_eq!(list.remove(99), None);

        for (key, value) in [(9, "nine"), (6, "six"), (5, "five"), (3, "three"), (1, "one")] {
            list.insert(key, value).unwrap();
        }
        assert_eq!(keys(&list), [1, 3, 5, 6, 9]);

        // Tail.
        assert_eq!(list.remove(9), Some("nine"));
        assert_eq!(list.find(9), None);
        assert_eq!(list.last(), Some((6, "six")));

        // Head.
        assert_eq!(list.remove(1), Some("one"));
        assert_eq!(list.first(), Some((3, "three")));

        // Middle.
        assert_eq!(list.remove(5), Some("five"));
        assert_eq!(keys(&list), [3, 6]);

        assert_eq!(list.remove(6), Some("six"));
        assert_eq!(list.last(), Some((3, "three")));

        assert_eq!(list.remove(3), Some("three"));
        assert!(list.is_empty());

        for key in 0..10 {
            assert_eq!(list.find(key), None);
        }
    }

    #[test]
    fn remove_twice_reports_absence() {
        let mut list = SortedList::new(&System);

        list.insert(1, "one").unwrap();

        assert_eq!(list.remove(1), Some("one"));
        assert_eq!(list.remove(1), None);
        assert!(list.is_empty());
    }

    #[test]
    fn arena_grows_through_raw_source_only() {
        static RAW: CountingAlloc = CountingAlloc::new();

        let mut list = SortedList::new(&RAW);
        assert_eq!(RAW.allocations(), 0);

        for key in 0..INITIAL_CAPACITY {
            list.insert(key, ()).unwrap();
        }
        assert_eq!(RAW.allocations(), 1);

        // One more than fits: the arena doubles and the old one is handed back.
        list.insert(INITIAL_CAPACITY, ()).unwrap();
        assert_eq!(RAW.allocations(), 2);
        assert_eq!(RAW.releases(), 1);

        assert!(list.iter().map(|(key, ())| key).eq(0..=INITIAL_CAPACITY));

        drop(list);
        assert_eq!(RAW.releases(), 2);
        assert_eq!(RAW.bytes_outstanding(), 0);
    }

    #[test]
    fn removed_slots_are_reused() {
        static RAW: CountingAlloc = CountingAlloc::new();

        let mut list = SortedList::new(&RAW);

        for key in 0..INITIAL_CAPACITY {
            list.insert(key, ()).unwrap();
        }

        for _ in 0..100 {
            assert_eq!(list.remove(1), Some(()));
            assert_eq!(list.remove(2), Some(()));
            list.insert(2, ()).unwrap();
            list.insert(1, ()).unwrap();
        }

        assert_eq!(RAW.allocations(), 1);
        assert!(list.iter().map(|(key, ())| key).eq(0..INITIAL_CAPACITY));
    }

    #[test]
    fn exhausted_raw_source_leaves_list_unchanged() {
        static RAW: CountingAlloc = CountingAlloc::new();

        let mut list = SortedList::new(&RAW);

        for key in 0..INITIAL_CAPACITY {
            list.insert(key, ()).unwrap();
        }

        RAW.set_failing(true);
        let result = list.insert(100, ());
        RAW.set_failing(false);

        assert!(matches!(result, Err(Error::StorageExhausted { .. })));
        assert_eq!(list.len(), INITIAL_CAPACITY);
        assert_eq!(list.find(100), None);

        // The arena recovers once the raw source does.
        list.insert(100, ()).unwrap();
        assert_eq!(list.last(), Some((100, ())));
    }

    #[test]
    fn empty_list_never_touches_raw_source() {
        static RAW: CountingAlloc = CountingAlloc::new();

        let list = SortedList::<usize, usize>::new(&RAW);
        assert_eq!(list.first(), None);
        assert_eq!(list.last(), None);
        drop(list);

        assert_eq!(RAW.allocations(), 0);
        assert_eq!(RAW.releases(), 0);
    }
}
