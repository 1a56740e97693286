//! Hash map types.
use crate::{
    bytes_of,
    maps::{MapData, MapError, UpdatePolicy},
    Pod,
};

#[allow(clippy::module_inception)]
mod hash_map;
mod per_cpu_hash_map;

pub use hash_map::*;
pub use per_cpu_hash_map::*;

pub(crate) fn update<K: Pod, V: Pod>(
    map: &MapData,
    key: &K,
    value: &V,
    policy: UpdatePolicy,
) -> Result<(), MapError> {
    map.update(bytes_of(key), bytes_of(value), policy)
}

pub(crate) fn delete<K: Pod>(map: &MapData, key: &K) -> Result<bool, MapError> {
    map.delete(bytes_of(key))
}
