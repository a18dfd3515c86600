// Shared by every test binary; not all of them use every helper.
#![allow(dead_code)]

use quince::{qsbr, GrampaMap, LeapfrogMap, LinearMap};

/// Uniform adapter so every scenario runs against all three variants.
pub trait MapUnderTest: Send + Sync + 'static {
    const NAME: &'static str;

    fn with_capacity(capacity: usize) -> Self;
    fn get(&self, key: u64) -> u64;
    fn assign(&self, key: u64, value: u64) -> u64;
    fn erase(&self, key: u64) -> u64;
    fn pairs(&self) -> Vec<(u64, u64)>;
}

macro_rules! adapt {
    ($map:ident, $name:literal) => {
        impl MapUnderTest for $map<u64, u64> {
            const NAME: &'static str = $name;

            fn with_capacity(capacity: usize) -> Self {
                $map::with_capacity(capacity)
            }

            fn get(&self, key: u64) -> u64 {
                $map::get(self, key)
            }

            fn assign(&self, key: u64, value: u64) -> u64 {
                $map::assign(self, key, value)
            }

            fn erase(&self, key: u64) -> u64 {
                $map::erase(self, key)
            }

            fn pairs(&self) -> Vec<(u64, u64)> {
                self.iter().collect()
            }
        }
    };
}

adapt!(LinearMap, "linear");
adapt!(LeapfrogMap, "leapfrog");
adapt!(GrampaMap, "grampa");

/// Expands a generic scenario against all three variants.
macro_rules! for_each_map {
    ($scenario:ident) => {{
        $scenario::<quince::LinearMap<u64, u64>>();
        $scenario::<quince::LeapfrogMap<u64, u64>>();
        $scenario::<quince::GrampaMap<u64, u64>>();
    }};
}
pub(crate) use for_each_map;

/// Registers a reclamation context for the duration of `f`, per the
/// contract that every thread touching a map holds one.
pub fn with_context<T>(f: impl FnOnce() -> T) -> T {
    let ctx = qsbr::default().create_context();
    let result = f();
    qsbr::default().destroy_context(ctx);
    result
}

/// Worker count for the concurrent scenarios.
pub fn threads() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
        .clamp(2, 8)
}
