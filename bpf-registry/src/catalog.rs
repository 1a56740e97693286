//! Ready-made descriptors for a fixture exercising every map kind.
//!
//! The fixture declares one map of each supported kind, all with `u32` keys
//! and values. [`populate`] fills the keyed ones with a few entries, which is
//! handy to smoke test a driver or to give a program something to read.
//!
//! ```
//! use bpf_registry::{
//!     catalog,
//!     maps::{lpm_trie::Key, LpmTrie},
//!     sys::MemoryDriver,
//!     MapRegistry,
//! };
//!
//! let registry = MapRegistry::builder()
//!     .driver(MemoryDriver::new(2))
//!     .load(catalog::fixture_descriptors())?;
//!
//! let mut next = 0u32;
//! let written = catalog::populate(&registry, || {
//!     next += 1;
//!     next
//! })?;
//! assert_eq!(written, 35);
//!
//! let trie = registry.get(catalog::LPM_TRIE_MAP).unwrap();
//! let trie = LpmTrie::<_, u32, u32>::try_from(&*trie)?;
//! assert!(trie.lookup(&Key::new(32, 3))?.is_some());
//! # Ok::<(), bpf_registry::MapError>(())
//! ```
use log::debug;

use crate::{
    maps::{
        lpm_trie::Key, Array, HashMap, LpmTrie, MapDescriptor, MapError, MapKind, PerCpuArray,
        PerCpuHashMap, PerCpuValues, UpdatePolicy,
    },
    MapRegistry,
};

/// Name of the fixture's hash map.
pub const HASH_MAP: &str = "hash_map";
/// Name of the fixture's per-CPU hash map.
pub const PERCPU_HASH_MAP: &str = "percpu_hash_map";
/// Name of the fixture's LRU hash map.
pub const LRU_HASH_MAP: &str = "lru_hash_map";
/// Name of the fixture's per-CPU LRU hash map.
pub const PERCPU_LRU_HASH_MAP: &str = "percpu_lru_hash_map";
/// Name of the fixture's array.
pub const ARRAY_MAP: &str = "array_map";
/// Name of the fixture's per-CPU array.
pub const PERCPU_ARRAY_MAP: &str = "percpu_array_map";
/// Name of the fixture's LPM trie.
pub const LPM_TRIE_MAP: &str = "lpm_trie_map";
/// Name of the fixture's queue.
pub const QUEUE_MAP: &str = "queue_map";

/// Capacity of every fixture map but the trie.
pub const MAX_ENTRIES: u32 = 10;
/// Capacity of the fixture trie.
pub const LPM_TRIE_MAX_ENTRIES: u32 = 255;

/// Number of entries [`populate`] writes to each keyed map.
pub const POPULATE_ENTRIES: u32 = 5;

/// Returns the descriptors of the eight fixture maps.
pub fn fixture_descriptors() -> Vec<MapDescriptor> {
    vec![
        MapDescriptor::hash::<u32, u32>(HASH_MAP, MAX_ENTRIES),
        MapDescriptor::per_cpu_hash::<u32, u32>(PERCPU_HASH_MAP, MAX_ENTRIES),
        MapDescriptor::lru_hash::<u32, u32>(LRU_HASH_MAP, MAX_ENTRIES),
        MapDescriptor::lru_per_cpu_hash::<u32, u32>(PERCPU_LRU_HASH_MAP, MAX_ENTRIES),
        MapDescriptor::array::<u32>(ARRAY_MAP, MAX_ENTRIES),
        MapDescriptor::per_cpu_array::<u32>(PERCPU_ARRAY_MAP, MAX_ENTRIES),
        MapDescriptor::lpm_trie::<u32, u32>(LPM_TRIE_MAP, LPM_TRIE_MAX_ENTRIES),
        MapDescriptor::queue::<u32>(QUEUE_MAP, MAX_ENTRIES),
    ]
}

/// Writes [`POPULATE_ENTRIES`] entries to each keyed fixture map in `registry`.
///
/// Keys are `0..POPULATE_ENTRIES`; trie keys are `/32` prefixes of the same
/// numbers. Values are drawn from `next_value`, one per CPU for per-CPU maps.
/// The queue is left empty and fixture maps missing from the registry are
/// skipped.
///
/// Returns the number of entries written.
pub fn populate(
    registry: &MapRegistry,
    mut next_value: impl FnMut() -> u32,
) -> Result<usize, MapError> {
    let mut written = 0;
    for def in fixture_descriptors() {
        let Some(map) = registry.get(def.name()) else {
            debug!("map `{}` is not registered, skipping", def.name());
            continue;
        };
        match def.kind() {
            MapKind::Hash | MapKind::LruHash => {
                let mut hm = HashMap::<_, u32, u32>::try_from(&*map)?;
                for key in 0..POPULATE_ENTRIES {
                    hm.update(key, next_value(), UpdatePolicy::Any)?;
                }
            }
            MapKind::PerCpuHash | MapKind::LruPerCpuHash => {
                let nr_cpus = map.data().nr_cpus()?;
                let mut hm = PerCpuHashMap::<_, u32, u32>::try_from(&*map)?;
                for key in 0..POPULATE_ENTRIES {
                    let values = per_cpu_values(nr_cpus, &mut next_value);
                    hm.update_values(key, values, UpdatePolicy::Any)?;
                }
            }
            MapKind::Array => {
                let mut array = Array::<_, u32>::try_from(&*map)?;
                for index in 0..POPULATE_ENTRIES {
                    array.update(index, next_value(), UpdatePolicy::Any)?;
                }
            }
            MapKind::PerCpuArray => {
                let nr_cpus = map.data().nr_cpus()?;
                let mut array = PerCpuArray::<_, u32>::try_from(&*map)?;
                for index in 0..POPULATE_ENTRIES {
                    let values = per_cpu_values(nr_cpus, &mut next_value);
                    array.update_values(index, values, UpdatePolicy::Any)?;
                }
            }
            MapKind::LpmTrie => {
                let mut trie = LpmTrie::<_, u32, u32>::try_from(&*map)?;
                for data in 0..POPULATE_ENTRIES {
                    trie.update(&Key::new(32, data), next_value(), UpdatePolicy::Any)?;
                }
            }
            MapKind::Queue => continue,
        }
        debug!("populated map `{}`", def.name());
        written += POPULATE_ENTRIES as usize;
    }
    Ok(written)
}

fn per_cpu_values(nr_cpus: usize, next_value: &mut impl FnMut() -> u32) -> PerCpuValues<u32> {
    PerCpuValues::from((0..nr_cpus).map(|_| next_value()).collect::<Vec<_>>())
}
