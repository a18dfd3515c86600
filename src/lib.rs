//! Lock-free hash maps from word-sized keys to word-sized values.
//!
//! Three variants share one protocol of atomic `(hash, value)` cells,
//! cooperative table migration, and quiescent-state-based reclamation:
//!
//! - [`LinearMap`]: one table, linear probing, 75% load cap.
//! - [`LeapfrogMap`]: one table, bucketed probing with short per-bucket
//!   delta chains that bound probe length.
//! - [`GrampaMap`]: a flat tree of leapfrog leaves indexed by high-order
//!   hash bits; leaves and the tree itself migrate independently.
//!
//! Keys are stored as their image under an invertible avalanche
//! permutation, so the tables hold hashes rather than keys and iteration
//! recovers keys by inverting the hash. The all-zero key and the values
//! `0` and `1` are reserved as sentinels; see [`traits`].
//!
//! Every thread that touches a map must register a reclamation context and
//! declare quiescent states between units of work:
//!
//! ```
//! use quince::{qsbr, LeapfrogMap};
//!
//! let map: LeapfrogMap<u64, u64> = LeapfrogMap::new();
//! let ctx = qsbr::default().create_context();
//!
//! map.assign(5, 0x50);
//! assert_eq!(map.get(5), 0x50);
//! qsbr::default().update(ctx);
//!
//! qsbr::default().destroy_context(ctx);
//! qsbr::default().flush();
//! ```

// Hashes and values are machine words; the cells store them in u64 atomics.
const _: () = assert!(
    usize::BITS == 64,
    "quince requires a 64-bit target: hashes and values are machine words"
);

mod coordinator;
mod sync;

pub mod qsbr;
pub mod traits;

pub mod grampa;
pub mod leapfrog;
pub mod linear;

pub use grampa::GrampaMap;
pub use leapfrog::LeapfrogMap;
pub use linear::LinearMap;
pub use traits::{DefaultKeyTraits, DefaultValueTraits, KeyTraits, ValueTraits};
