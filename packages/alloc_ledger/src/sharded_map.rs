use std::any::type_name;
use std::fmt;
use std::mem::MaybeUninit;

use crate::error::Result;
use crate::raw::RawSource;
use crate::sorted_list::SortedList;
use crate::spin_lock::SpinLock;

type Shard<V> = SpinLock<SortedList<usize, V>>;

/// A concurrent map from address-sized keys to values, split into `SHARDS` independently
/// locked sorted lists.
///
/// A key belongs to shard `key % SHARDS`. Operations lock only the shard they touch and hold
/// the lock only for the scan and relink, so under a uniform key distribution contention is
/// `1 / SHARDS` of what a single lock would see. Lookups lock too; there is no reader fast path.
///
/// All node storage comes from the raw source given at construction.
pub(crate) struct ShardedMap<V, const SHARDS: usize> {
    shards: [Shard<V>; SHARDS],
}

impl<V, const SHARDS: usize> ShardedMap<V, SHARDS>
where
    V: Copy,
{
    /// Creates an empty map.
    ///
    /// This is a `const fn` so that maps can be embedded in statics that are usable from the
    /// very first allocation of the process.
    ///
    /// # Panics
    ///
    /// Panics (at compile time, when used in a static) if `SHARDS` is zero.
    pub(crate) const fn new(raw: RawSource) -> Self {
        assert!(SHARDS > 0, "ShardedMap must have at least one shard");

        let mut shards: [MaybeUninit<Shard<V>>; SHARDS] =
            [const { MaybeUninit::uninit() }; SHARDS];

        let mut index = 0;
        while index < SHARDS {
            shards[index] = MaybeUninit::new(SpinLock::new(SortedList::new(raw)));
            index += 1;
        }

        // SAFETY: Every element was initialized by the loop above and `MaybeUninit<T>` has the
        // same layout as `T`, so the array of one has the same layout as the array of the other.
        let shards = unsafe { shards.as_ptr().cast::<[Shard<V>; SHARDS]>().read() };

        Self { shards }
    }

    /// Inserts `value` under `key`. A key already present is reported as
    /// [`Error::RepeatedKey`][crate::Error::RepeatedKey] and not overwritten.
    pub(crate) fn insert(&self, key: usize, value: V) -> Result<()> {
        self.shard(key).acquire().insert(key, value)
    }

    #[must_use]
    pub(crate) fn find(&self, key: usize) -> Option<V> {
        self.shard(key).acquire().find(key)
    }

    /// Removes and returns the value under `key`. An absent key is a no-op returning `None`.
    pub(crate) fn remove(&self, key: usize) -> Option<V> {
        self.shard(key).acquire().remove(key)
    }

    /// Counts records across all shards.
    ///
    /// Each shard is locked in turn, so under concurrent mutation the result is only a
    /// point-in-time approximation.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.acquire().len())
            .fold(0, usize::saturating_add)
    }

    fn shard(&self, key: usize) -> &Shard<V> {
        let index = key
            .checked_rem(SHARDS)
            .expect("SHARDS is asserted non-zero in the constructor");

        self.shards
            .get(index)
            .expect("index is reduced modulo the number of shards")
    }

    #[cfg(test)]
    fn shard_keys(&self, index: usize) -> Vec<usize> {
        self.shards
            .get(index)
            .expect("test asked for a shard that does not exist")
            .acquire()
            .iter()
            .map(|(key, _)| key)
            .collect()
    }
}

impl<V, const SHARDS: usize> fmt::Debug for ShardedMap<V, SHARDS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("shards", &SHARDS)
            .finish_non_exhaustive()
    }
}
