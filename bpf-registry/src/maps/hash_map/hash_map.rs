use std::{borrow::Borrow, marker::PhantomData};

use crate::{
    bytes_of,
    maps::{
        check_kv_size, hash_map, value_from_bytes, IterableMap, MapData, MapError, MapIter,
        MapKeys, UpdatePolicy,
    },
    Pod,
};

/// A hash map that can be shared between eBPF programs and user space.
///
/// This type is used for both [`MapKind::Hash`](crate::maps::MapKind::Hash)
/// and [`MapKind::LruHash`](crate::maps::MapKind::LruHash) maps. When an LRU
/// map is full, inserting a new key silently evicts the least recently used
/// one; lookups and updates both count as a use.
///
/// # Examples
///
/// ```
/// use bpf_registry::{
///     maps::{HashMap, MapDescriptor, UpdatePolicy},
///     sys::MemoryDriver,
///     MapRegistry,
/// };
///
/// let registry = MapRegistry::new(MemoryDriver::new(1));
/// let map = registry.create(MapDescriptor::hash::<u16, u16>("redirect_ports", 8))?;
/// let mut redirect_ports = HashMap::<_, u16, u16>::try_from(map)?;
///
/// // redirect port 80 to 8080
/// redirect_ports.update(80, 8080, UpdatePolicy::Any)?;
/// // redirect port 443 to 8443
/// redirect_ports.update(443, 8443, UpdatePolicy::Any)?;
/// assert_eq!(redirect_ports.lookup(&443)?, Some(8443));
/// # Ok::<(), bpf_registry::MapError>(())
/// ```
#[doc(alias = "BPF_MAP_TYPE_HASH")]
#[doc(alias = "BPF_MAP_TYPE_LRU_HASH")]
#[derive(Debug)]
pub struct HashMap<T, K, V> {
    pub(crate) inner: T,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

impl<T: Borrow<MapData>, K: Pod, V: Pod> HashMap<T, K, V> {
    pub(crate) fn new(map: T) -> Result<Self, MapError> {
        let data = map.borrow();
        check_kv_size::<K, V>(data)?;

        Ok(Self {
            inner: map,
            _k: PhantomData,
            _v: PhantomData,
        })
    }

    /// Returns a copy of the value associated with the key, or `None` if the
    /// key is not present.
    pub fn lookup(&self, key: &K) -> Result<Option<V>, MapError> {
        self.inner
            .borrow()
            .lookup(bytes_of(key))?
            .map(|value| value_from_bytes(&value))
            .transpose()
    }

    /// An iterator visiting all key-value pairs in arbitrary order. The
    /// iterator item type is `Result<(K, V), MapError>`.
    pub fn iter(&self) -> MapIter<'_, K, V, Self> {
        MapIter::new(self)
    }

    /// An iterator visiting all keys in arbitrary order. The iterator element
    /// type is `Result<K, MapError>`.
    pub fn keys(&self) -> MapKeys<'_, K> {
        MapKeys::new(self.inner.borrow())
    }

    /// Inserts a key-value pair into the map.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::CapacityExceeded`] if a new key is inserted into a
    /// full, non-LRU map.
    pub fn update(
        &mut self,
        key: impl Borrow<K>,
        value: impl Borrow<V>,
        policy: UpdatePolicy,
    ) -> Result<(), MapError> {
        hash_map::update(self.inner.borrow(), key.borrow(), value.borrow(), policy)
    }

    /// Removes a key from the map. Returns `false` if the key was not present.
    pub fn delete(&mut self, key: &K) -> Result<bool, MapError> {
        hash_map::delete(self.inner.borrow(), key)
    }
}

impl<T: Borrow<MapData>, K: Pod, V: Pod> IterableMap<K, V> for HashMap<T, K, V> {
    fn map(&self) -> &MapData {
        self.inner.borrow()
    }

    fn get(&self, key: &K) -> Result<V, MapError> {
        self.inner
            .borrow()
            .read(bytes_of(key))?
            .map(|value| value_from_bytes(&value))
            .transpose()?
            .ok_or(MapError::KeyNotFound)
    }
}
