//! A two-level lock-free hash map: a flat tree of leapfrog leaves.
//!
//! Small maps live in a single table. Once a migration wants more than one
//! leaf's worth of cells, the table splits by high-order hash bits into
//! sibling leaves indexed by a flat tree, and from then on leaves migrate
//! independently: a hot slice of the key space resizes without touching
//! the rest of the map. The tree itself also grows by migration when a
//! subtree needs finer slots.

mod flat_tree;
mod raw;

use std::marker::PhantomData;

use crate::traits::{
    DefaultKeyTraits, DefaultValueTraits, KeyTraits, ValueTraits, NULL_HASH, NULL_VALUE, REDIRECT,
};

/// A concurrent hash map sharded by high-order hash bits.
///
/// Construction is lazy: no table exists until the first insert. See the
/// [crate docs](crate) for the reclamation contract every thread must
/// follow.
pub struct GrampaMap<K, V, KT = DefaultKeyTraits<K>, VT = DefaultValueTraits<V>>
where
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    raw: raw::Map,
    _marker: PhantomData<(K, V, KT, VT)>,
}

impl<K, V, KT, VT> GrampaMap<K, V, KT, VT>
where
    K: Copy + Eq,
    V: Copy + Eq,
    KT: KeyTraits<Key = K>,
    VT: ValueTraits<Value = V>,
{
    /// Creates an empty map. Nothing is allocated until the first insert.
    pub fn new() -> Self {
        GrampaMap {
            raw: raw::Map::new_lazy(),
            _marker: PhantomData,
        }
    }

    /// Creates a map with an eagerly allocated first table. Rounded up to
    /// a power of two between 8 and the leaf size.
    pub fn with_capacity(capacity: usize) -> Self {
        let size = capacity
            .next_power_of_two()
            .clamp(raw::MIN_TABLE_SIZE, raw::LEAF_SIZE);
        GrampaMap {
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

    /// A weakly consistent iterator over `(key, value)` pairs, walking
    /// every unique leaf. Entries moved by migrations that start after the
    /// snapshot may be missed or seen twice.
    pub fn iter(&self) -> Iter<'_, K, V, KT, VT> {
        Iter {
            raw: self.raw.iter(),
            _marker: PhantomData,
        }
    }
}

impl<K, V, KT, VT> Default for GrampaMap<K, V, KT, VT>
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
/// Do not declare a quiescent state while a mutator is live on this
/// thread; that is asserted by `qsbr`.
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

    /// Swaps in `value`, returning the previous value. A losing race
    /// against a concurrent write returns `value`, as if ours landed first
    /// and was immediately overwritten.
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

/// See [`GrampaMap::iter`].
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
