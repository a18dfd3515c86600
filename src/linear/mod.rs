//! A lock-free hash map with plain linear probing.
//!
//! The simplest of the three variants: one open-addressed table, probe by
//! ones, and a live-cell budget that refuses inserts past 75% occupancy.
//! Overflow hands the table to the migration engine and the insert retries
//! against the new table.

mod raw;

use std::marker::PhantomData;

use crate::traits::{
    DefaultKeyTraits, DefaultValueTraits, KeyTraits, ValueTraits, NULL_HASH, NULL_VALUE, REDIRECT,
};

/// A concurrent hash map using linear probing.
///
/// See the [crate docs](crate) for the reclamation contract every thread
/// must follow.
pub struct LinearMap<K, V, KT = DefaultKeyTraits<K>, VT = DefaultValueTraits<V>>
where
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    raw: raw::Map,
    _marker: PhantomData<(K, V, KT, VT)>,
}

impl<K, V, KT, VT> LinearMap<K, V, KT, VT>
where
    K: Copy + Eq,
    V: Copy + Eq,
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    /// Creates a map with the default initial capacity.
    pub fn new() -> Self {
        Self::with_capacity(raw::INITIAL_SIZE)
    }

    /// Creates a map able to hold roughly `capacity` live entries before
    /// the first migration. Rounded up to a power of two, at least 4.
    pub fn with_capacity(capacity: usize) -> Self {
        let size = capacity.next_power_of_two().max(4);
        LinearMap {
            raw: raw::Map::with_capacity(size),
            _marker: PhantomData,
        }
    }

    fn check_key(key: K) -> u64 {
        assert!(key != KT::NULL_KEY, "the null key is reserved");
        let hash = KT::hash(key);
        debug_assert!(hash != NULL_HASH);
        hash
    }

    fn check_value(value: V) -> u64 {
        let word = VT::to_word(value);
        assert!(
            word != NULL_VALUE && word != REDIRECT,
            "values 0 and 1 are reserved"
        );
        word
    }

    /// Returns the value for `key`, or the null value if absent.
    pub fn get(&self, key: K) -> V {
        VT::from_word(self.raw.get(Self::check_key(key)))
    }

    /// Installs `value`, returning the previous value (or null).
    pub fn assign(&self, key: K, value: V) -> V {
        self.exchange(key, value)
    }

    /// Same as [`assign`](Self::assign); the name mirrors the cell-level
    /// operation.
    pub fn exchange(&self, key: K, value: V) -> V {
        let word = Self::check_value(value);
        let mut mutator = self.raw.insert_or_find(Self::check_key(key));
        VT::from_word(mutator.exchange(word))
    }

    /// Removes `key`, returning the previous value (or null). Idempotent.
    pub fn erase(&self, key: K) -> V {
        let mut mutator = self.raw.find(Self::check_key(key));
        VT::from_word(mutator.erase())
    }

    /// Locates (inserting if needed) the cell for `key` and returns a
    /// handle for inspect-then-update under a single visit.
    pub fn insert_or_find(&self, key: K) -> Mutator<'_, K, V, KT, VT> {
        Mutator {
            raw: self.raw.insert_or_find(Self::check_key(key)),
            _marker: PhantomData,
        }
    }

    /// Like [`insert_or_find`](Self::insert_or_find) but never inserts; the
    /// mutator's value is null if the key is absent.
    pub fn find(&self, key: K) -> Mutator<'_, K, V, KT, VT> {
        Mutator {
            raw: self.raw.find(Self::check_key(key)),
            _marker: PhantomData,
        }
    }

    /// A weakly consistent iterator over `(key, value)` pairs.
    ///
    /// Entries moved by a migration that starts after the iterator snapshots
    /// the table may be missed or seen twice.
    pub fn iter(&self) -> Iter<'_, K, V, KT, VT> {
        Iter {
            raw: self.raw.iter(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, KT, VT> Default for LinearMap<K, V, KT, VT>
where
    K: Copy + Eq,
    V: Copy + Eq,
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A caller-held reference to a located cell.
///
/// Holding one pins this thread's view of the cell: do not declare a
/// quiescent state (`qsbr::Qsbr::update`) while a mutator is live; that is
/// asserted.
pub struct Mutator<'m, K, V, KT, VT>
where
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    raw: raw::Mutator<'m>,
    _marker: PhantomData<(K, V, KT, VT)>,
}

impl<K, V, KT, VT> Mutator<'_, K, V, KT, VT>
where
    K: Copy + Eq,
    V: Copy + Eq,
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    /// The value seen when the cell was located. Not reloaded.
    pub fn value(&self) -> V {
        VT::from_word(self.raw.value())
    }

    /// Swaps in `value`, returning the previous value. If a concurrent
    /// write wins the race, that write is treated as having overwritten
    /// ours and `value` is returned.
    pub fn exchange_value(&mut self, value: V) -> V {
        let word = VT::to_word(value);
        assert!(
            word != NULL_VALUE && word != REDIRECT,
            "values 0 and 1 are reserved"
        );
        VT::from_word(self.raw.exchange(word))
    }

    /// Erases the cell's value, returning what was erased (or null).
    pub fn erase_value(&mut self) -> V {
        VT::from_word(self.raw.erase())
    }
}

/// See [`LinearMap::iter`].
pub struct Iter<'m, K, V, KT, VT>
where
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    raw: raw::Iter<'m>,
    _marker: PhantomData<(K, V, KT, VT)>,
}

impl<K, V, KT, VT> Iterator for Iter<'_, K, V, KT, VT>
where
    K: Copy + Eq,
    V: Copy + Eq,
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        let (hash, value) = self.raw.next()?;
        Some((KT::dehash(hash), VT::from_word(value)))
    }
}
