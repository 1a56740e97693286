//! Per-CPU hash map.
use std::{borrow::Borrow, marker::PhantomData};

use crate::{
    bytes_of,
    maps::{
        check_kv_size, hash_map, lookup_one_cpu, lookup_per_cpu, read_per_cpu, update_per_cpu,
        update_per_cpu_values, CpuPolicy, IterableMap, MapData, MapError, MapIter, MapKeys,
        PerCpuValues, Reduced, Reduction, UpdatePolicy, WrappingAdd,
    },
    Pod,
};

/// Similar to [`HashMap`](crate::maps::HashMap) but each CPU holds a separate
/// value for a given key. Typically used to minimize lock contention in eBPF
/// programs.
///
/// This type can be used with maps of kind
/// [`MapKind::PerCpuHash`](crate::maps::MapKind::PerCpuHash) and
/// [`MapKind::LruPerCpuHash`](crate::maps::MapKind::LruPerCpuHash).
///
/// # Examples
///
/// ```
/// use bpf_registry::{
///     maps::{CpuPolicy, MapDescriptor, PerCpuHashMap, Reduced, Reduction, UpdatePolicy},
///     sys::MemoryDriver,
///     MapRegistry,
/// };
///
/// const WAKEUPS: u8 = 2;
///
/// let registry = MapRegistry::new(MemoryDriver::new(4));
/// let map = registry.create(MapDescriptor::per_cpu_hash::<u8, u32>("per_cpu_storage", 8))?;
/// let mut hm = PerCpuHashMap::<_, u8, u32>::try_from(map)?;
///
/// hm.update(WAKEUPS, 1, CpuPolicy::Cpu(0), UpdatePolicy::Any)?;
/// hm.update(WAKEUPS, 5, CpuPolicy::Cpu(3), UpdatePolicy::Any)?;
///
/// let wakeups = hm.lookup(&WAKEUPS)?.unwrap();
/// for (cpu_id, wakeups) in wakeups.iter().enumerate() {
///     println!("cpu {} woke up {} times", cpu_id, wakeups);
/// }
/// assert_eq!(hm.lookup_reduced(&WAKEUPS, Reduction::Sum)?, Some(Reduced::Sum(6)));
/// # Ok::<(), bpf_registry::MapError>(())
/// ```
#[doc(alias = "BPF_MAP_TYPE_LRU_PERCPU_HASH")]
#[doc(alias = "BPF_MAP_TYPE_PERCPU_HASH")]
#[derive(Debug)]
pub struct PerCpuHashMap<T, K: Pod, V: Pod> {
    pub(crate) inner: T,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

impl<T: Borrow<MapData>, K: Pod, V: Pod> PerCpuHashMap<T, K, V> {
    pub(crate) fn new(map: T) -> Result<Self, MapError> {
        let data = map.borrow();
        check_kv_size::<K, V>(data)?;

        Ok(Self {
            inner: map,
            _k: PhantomData,
            _v: PhantomData,
        })
    }

    /// Returns a slice of values - one for each CPU - associated with the key.
    pub fn lookup(&self, key: &K) -> Result<Option<PerCpuValues<V>>, MapError> {
        lookup_per_cpu(self.inner.borrow(), bytes_of(key))
    }

    /// Returns the value `cpu` holds for the key.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::CpuOutOfRange`] if `cpu` is not a possible CPU.
    pub fn lookup_cpu(&self, key: &K, cpu: u32) -> Result<Option<V>, MapError> {
        lookup_one_cpu(self.inner.borrow(), bytes_of(key), cpu)
    }

    /// An iterator visiting all key-value pairs in arbitrary order. The
    /// iterator item type is `Result<(K, PerCpuValues<V>), MapError>`.
    pub fn iter(&self) -> MapIter<'_, K, PerCpuValues<V>, Self> {
        MapIter::new(self)
    }

    /// An iterator visiting all keys in arbitrary order. The iterator element
    /// type is `Result<K, MapError>`.
    pub fn keys(&self) -> MapKeys<'_, K> {
        MapKeys::new(self.inner.borrow())
    }

    /// Stores `value` for the CPUs selected by `cpu`.
    ///
    /// With [`CpuPolicy::CurrentCpu`] or [`CpuPolicy::Cpu`] the other CPUs'
    /// values are left untouched, or zero if the key is new. With
    /// [`CpuPolicy::AllCpus`] every CPU gets a copy of `value`; the write is
    /// not atomic across CPUs.
    pub fn update(
        &mut self,
        key: impl Borrow<K>,
        value: V,
        cpu: CpuPolicy,
        policy: UpdatePolicy,
    ) -> Result<(), MapError> {
        update_per_cpu(
            self.inner.borrow(),
            bytes_of(key.borrow()),
            value,
            cpu,
            policy,
        )
    }

    /// Inserts a slice of values - one for each CPU - for the given key.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bpf_registry::{maps::MapDescriptor, sys::MemoryDriver, MapRegistry};
    /// # let registry = MapRegistry::new(MemoryDriver::new(4));
    /// # let map = registry.create(MapDescriptor::per_cpu_hash::<u8, u32>("per_cpu_storage", 8))?;
    /// use bpf_registry::maps::{PerCpuHashMap, PerCpuValues, UpdatePolicy};
    ///
    /// const RETRIES: u8 = 1;
    ///
    /// let nr_cpus = map.data().nr_cpus()?;
    /// let mut hm = PerCpuHashMap::<_, u8, u32>::try_from(map)?;
    /// hm.update_values(
    ///     RETRIES,
    ///     PerCpuValues::from(vec![3u32; nr_cpus]),
    ///     UpdatePolicy::Any,
    /// )?;
    /// # Ok::<(), bpf_registry::MapError>(())
    /// ```
    pub fn update_values(
        &mut self,
        key: impl Borrow<K>,
        values: PerCpuValues<V>,
        policy: UpdatePolicy,
    ) -> Result<(), MapError> {
        update_per_cpu_values(self.inner.borrow(), bytes_of(key.borrow()), &values, policy)
    }

    /// Removes a key from the map. Returns `false` if the key was not present.
    pub fn delete(&mut self, key: &K) -> Result<bool, MapError> {
        hash_map::delete(self.inner.borrow(), key)
    }
}

impl<T: Borrow<MapData>, K: Pod, V: WrappingAdd> PerCpuHashMap<T, K, V> {
    /// Returns the values associated with the key, reduced as requested.
    pub fn lookup_reduced(
        &self,
        key: &K,
        reduction: Reduction,
    ) -> Result<Option<Reduced<V>>, MapError> {
        Ok(self.lookup(key)?.map(|values| match reduction {
            Reduction::Sum => Reduced::Sum(values.sum()),
            Reduction::PerCpu => Reduced::PerCpu(values),
        }))
    }
}

impl<T: Borrow<MapData>, K: Pod, V: Pod> IterableMap<K, PerCpuValues<V>>
    for PerCpuHashMap<T, K, V>
{
    fn map(&self) -> &MapData {
        self.inner.borrow()
    }

    fn get(&self, key: &K) -> Result<PerCpuValues<V>, MapError> {
        read_per_cpu(self.inner.borrow(), bytes_of(key))?.ok_or(MapError::KeyNotFound)
    }
}
