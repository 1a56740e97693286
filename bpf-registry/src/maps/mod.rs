//! Data structures used to share data with eBPF programs.
//!
//! The eBPF platform provides data structures - maps in eBPF speak - that are
//! used to setup and share data with eBPF programs. Maps are described by a
//! [`MapDescriptor`], created through a [`MapDriver`] and, once registered in a
//! [`MapRegistry`](crate::MapRegistry), handed out as [`MapRef`]s.
//!
//! # Typed maps
//!
//! Each map kind supports different operations. [`Map`] is the opaque,
//! untyped map; it can be converted to a *typed map* using the [`TryFrom`]
//! trait. The conversion checks the map kind and the sizes of the key and
//! value types against the descriptor. For example:
//!
//! ```
//! use bpf_registry::{
//!     maps::{Array, MapDescriptor, UpdatePolicy},
//!     sys::MemoryDriver,
//!     MapRegistry,
//! };
//!
//! let registry = MapRegistry::new(MemoryDriver::new(2));
//! let map = registry.create(MapDescriptor::array::<u64>("counters", 4))?;
//! let mut counters = Array::<_, u64>::try_from(map)?;
//! counters.update(1, 42, UpdatePolicy::Any)?;
//! assert_eq!(counters.lookup(1)?, 42);
//! # Ok::<(), bpf_registry::MapError>(())
//! ```
//!
//! # Maps and `Pod` values
//!
//! Map operations copy keys and values to and from the driver as raw bytes.
//! Because of that, all map keys and values must be plain old data and
//! therefore implement the [Pod] trait.
use std::{
    borrow::Borrow,
    fmt,
    marker::PhantomData,
    mem,
    ops::Deref,
    sync::Arc,
};

use libc::{E2BIG, ENOENT, ENOSPC};
use log::{debug, warn};

use crate::{
    errors::{LayoutPart, SysError},
    from_bytes,
    sys::{per_cpu_value_stride, MapDriver, MapHandle},
    Pod,
};

pub mod array;
pub mod descriptor;
pub mod hash_map;
pub mod lpm_trie;
mod map_lock;
pub mod queue;

pub use array::{Array, PerCpuArray};
pub use descriptor::{KeyLayout, MapDescriptor, MapFlags, MapKind};
pub use hash_map::{HashMap, PerCpuHashMap};
pub use lpm_trie::LpmTrie;
pub use map_lock::MapRef;
pub use queue::Queue;

pub use crate::{errors::MapError, sys::UpdatePolicy};

/// eBPF map types.
#[derive(Debug)]
pub enum Map {
    /// A [`HashMap`] map.
    HashMap(MapData),
    /// A [`PerCpuHashMap`] map.
    PerCpuHashMap(MapData),
    /// A [`HashMap`] map that uses a LRU eviction policy.
    LruHashMap(MapData),
    /// A [`PerCpuHashMap`] map that uses a LRU eviction policy.
    PerCpuLruHashMap(MapData),
    /// An [`Array`] map.
    Array(MapData),
    /// A [`PerCpuArray`] map.
    PerCpuArray(MapData),
    /// A [`LpmTrie`] map.
    LpmTrie(MapData),
    /// A [`Queue`] map.
    Queue(MapData),
}

impl Map {
    /// Wraps `data` in the variant matching its kind.
    pub fn from_map_data(data: MapData) -> Self {
        match data.kind() {
            MapKind::Hash => Self::HashMap(data),
            MapKind::PerCpuHash => Self::PerCpuHashMap(data),
            MapKind::LruHash => Self::LruHashMap(data),
            MapKind::LruPerCpuHash => Self::PerCpuLruHashMap(data),
            MapKind::Array => Self::Array(data),
            MapKind::PerCpuArray => Self::PerCpuArray(data),
            MapKind::LpmTrie => Self::LpmTrie(data),
            MapKind::Queue => Self::Queue(data),
        }
    }

    /// Returns the kind of the map.
    pub fn kind(&self) -> MapKind {
        self.data().kind()
    }

    /// Returns the low level map type.
    fn map_type(&self) -> u32 {
        self.kind().map_type()
    }

    /// Returns the untyped map.
    pub fn data(&self) -> &MapData {
        match self {
            Self::HashMap(map) => map,
            Self::PerCpuHashMap(map) => map,
            Self::LruHashMap(map) => map,
            Self::PerCpuLruHashMap(map) => map,
            Self::Array(map) => map,
            Self::PerCpuArray(map) => map,
            Self::LpmTrie(map) => map,
            Self::Queue(map) => map,
        }
    }

    /// Returns the untyped map, consuming `self`.
    pub fn into_data(self) -> MapData {
        match self {
            Self::HashMap(map) => map,
            Self::PerCpuHashMap(map) => map,
            Self::LruHashMap(map) => map,
            Self::PerCpuLruHashMap(map) => map,
            Self::Array(map) => map,
            Self::PerCpuArray(map) => map,
            Self::LpmTrie(map) => map,
            Self::Queue(map) => map,
        }
    }
}

impl Borrow<MapData> for Map {
    fn borrow(&self) -> &MapData {
        self.data()
    }
}

macro_rules! impl_try_from_map {
    ($(<$($tp:ident),+> $ty:ident from $($variant:ident)|+),+ $(,)?) => {
        $(
            impl<'a, $($tp: Pod),+> TryFrom<&'a Map> for $ty<&'a MapData, $($tp),+> {
                type Error = MapError;

                fn try_from(map: &'a Map) -> Result<Self, MapError> {
                    match map {
                        $(Map::$variant(m))|+ => $ty::new(m),
                        _ => Err(MapError::InvalidMapType { map_type: map.map_type() }),
                    }
                }
            }

            impl<$($tp: Pod),+> TryFrom<Map> for $ty<MapData, $($tp),+> {
                type Error = MapError;

                fn try_from(map: Map) -> Result<Self, MapError> {
                    match map {
                        $(Map::$variant(m))|+ => $ty::new(m),
                        _ => Err(MapError::InvalidMapType { map_type: map.map_type() }),
                    }
                }
            }

            impl<$($tp: Pod),+> TryFrom<MapRef> for $ty<MapRef, $($tp),+> {
                type Error = MapError;

                fn try_from(map: MapRef) -> Result<Self, MapError> {
                    if matches!(&*map, $(Map::$variant(_))|+) {
                        $ty::new(map)
                    } else {
                        Err(MapError::InvalidMapType { map_type: map.map_type() })
                    }
                }
            }
        )+
    }
}

impl_try_from_map!(
    <K, V> HashMap from HashMap | LruHashMap,
    <K, V> PerCpuHashMap from PerCpuHashMap | PerCpuLruHashMap,
    <V> Array from Array,
    <V> PerCpuArray from PerCpuArray,
    <K, V> LpmTrie from LpmTrie,
    <V> Queue from Queue,
);

pub(crate) fn check_bounds(map: &MapData, index: u32) -> Result<(), MapError> {
    let max_entries = map.def.max_entries();
    if index >= max_entries {
        Err(MapError::OutOfRange { index, max_entries })
    } else {
        Ok(())
    }
}

pub(crate) fn check_kv_size<K, V>(map: &MapData) -> Result<(), MapError> {
    check_size(LayoutPart::Key, mem::size_of::<K>(), map.def.key_size() as usize)?;
    check_size(
        LayoutPart::Value,
        mem::size_of::<V>(),
        map.def.value_size() as usize,
    )
}

/// Reads a `V` from a value returned by the driver.
pub(crate) fn value_from_bytes<V: Pod>(bytes: &[u8]) -> Result<V, MapError> {
    let expected = mem::size_of::<V>();
    match from_bytes(bytes) {
        Some(value) if bytes.len() == expected => Ok(value),
        _ => Err(MapError::LayoutMismatch {
            part: LayoutPart::Value,
            size: bytes.len(),
            expected,
        }),
    }
}

fn check_size(part: LayoutPart, size: usize, expected: usize) -> Result<(), MapError> {
    if size != expected {
        return Err(MapError::LayoutMismatch {
            part,
            size,
            expected,
        });
    }
    Ok(())
}

/// A generic handle to a map.
///
/// `MapData` binds a shared, immutable [`MapDescriptor`] to the driver handle
/// of a live map, which it owns exclusively. It exposes the byte level
/// operations typed maps are built on: every call checks the key and value
/// sizes against the descriptor and rejects operations the map kind does not
/// support before reaching the driver.
///
/// The map is destroyed exactly once, either by [`close`](MapData::close) or
/// when the `MapData` is dropped.
///
/// You should never need to use this unless you're implementing a new map type.
pub struct MapData {
    def: Arc<MapDescriptor>,
    handle: Option<MapHandle>,
    driver: Arc<dyn MapDriver>,
}

impl fmt::Debug for MapData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapData")
            .field("def", &self.def)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl MapData {
    /// Validates `def` and creates a new map through `driver`.
    pub fn create(def: MapDescriptor, driver: Arc<dyn MapDriver>) -> Result<Self, MapError> {
        def.validate()?;
        let handle = driver.create_map(&def)?;
        debug!(
            "created {:?} map `{}` ({handle})",
            def.kind(),
            def.name()
        );
        Ok(Self {
            def: Arc::new(def),
            handle: Some(handle),
            driver,
        })
    }

    /// Returns the descriptor the map was created from.
    pub fn descriptor(&self) -> &Arc<MapDescriptor> {
        &self.def
    }

    /// Returns the map name.
    pub fn name(&self) -> &str {
        self.def.name()
    }

    /// Returns the map kind.
    pub fn kind(&self) -> MapKind {
        self.def.kind()
    }

    /// Returns the number of values per-CPU operations exchange for each key.
    pub fn nr_cpus(&self) -> Result<usize, MapError> {
        Ok(self.driver.nr_cpus()?)
    }

    pub(crate) fn current_cpu(&self) -> Result<u32, MapError> {
        Ok(self.driver.current_cpu()?)
    }

    fn handle(&self, call: &'static str) -> Result<&MapHandle, SysError> {
        self.handle
            .as_ref()
            .ok_or_else(|| SysError::new(call, libc::EBADF))
    }

    fn unsupported(&self, operation: &'static str) -> MapError {
        MapError::UnsupportedOperation {
            kind: self.kind(),
            operation,
        }
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<(), MapError> {
        if supported {
            Ok(())
        } else {
            Err(self.unsupported(operation))
        }
    }

    fn require_keyed(&self, operation: &'static str) -> Result<(), MapError> {
        self.require(self.kind() != MapKind::Queue, operation)
    }

    fn check_key(&self, key: &[u8]) -> Result<(), MapError> {
        check_size(LayoutPart::Key, key.len(), self.def.key_size() as usize)?;
        match self.def.key() {
            KeyLayout::Scalar { .. } if self.kind().is_array() => {
                // checked above, key is exactly a u32
                let index = from_bytes::<u32>(key).unwrap_or_default();
                check_bounds(self, index)
            }
            KeyLayout::Prefixed { data_size } => {
                let prefix_len = from_bytes::<u32>(key).unwrap_or_default();
                let max_prefix_len = data_size * 8;
                if prefix_len > max_prefix_len {
                    return Err(MapError::PrefixLengthOutOfRange {
                        prefix_len,
                        max_prefix_len,
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_cpu(&self, cpu: u32) -> Result<(), MapError> {
        let nr_cpus = self.nr_cpus()?;
        if cpu as usize >= nr_cpus {
            return Err(MapError::CpuOutOfRange { cpu, nr_cpus });
        }
        Ok(())
    }

    /// Returns the size of a whole value as exchanged with the driver.
    fn value_len(&self) -> Result<usize, MapError> {
        let value_size = self.def.value_size() as usize;
        if self.kind().is_per_cpu() {
            Ok(self.nr_cpus()? * per_cpu_value_stride(value_size))
        } else {
            Ok(value_size)
        }
    }

    fn check_value(&self, value: &[u8]) -> Result<(), MapError> {
        let expected = self.value_len()?;
        let part = if self.kind().is_per_cpu() {
            LayoutPart::PerCpuValues
        } else {
            LayoutPart::Value
        };
        check_size(part, value.len(), expected)
    }

    fn capacity_error(&self, error: SysError) -> MapError {
        match error.raw_os_error() {
            Some(E2BIG | ENOSPC) => MapError::CapacityExceeded {
                name: self.name().to_owned(),
                max_entries: self.def.max_entries(),
            },
            _ => error.into(),
        }
    }

    /// Returns the value stored at `key`, or `None` if there is none.
    ///
    /// For per-CPU maps the values of every CPU are returned, each padded to
    /// a multiple of 8 bytes.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        self.require_keyed("lookup")?;
        self.check_key(key)?;
        let handle = self.handle("bpf_map_lookup_elem")?;
        Ok(self.driver.lookup_elem(handle, key)?)
    }

    /// Like [`lookup`](Self::lookup) but the entry isn't marked as recently
    /// used in LRU maps.
    pub(crate) fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        self.require_keyed("lookup")?;
        self.check_key(key)?;
        let handle = self.handle("bpf_map_lookup_elem")?;
        Ok(self.driver.read_elem(handle, key)?)
    }

    /// Returns the value stored at `key` by `cpu` in a per-CPU map.
    pub fn lookup_cpu(&self, key: &[u8], cpu: u32) -> Result<Option<Vec<u8>>, MapError> {
        self.require(self.kind().is_per_cpu(), "lookup_cpu")?;
        self.check_key(key)?;
        self.check_cpu(cpu)?;
        let handle = self.handle("bpf_map_lookup_elem")?;
        Ok(self.driver.lookup_elem_cpu(handle, key, cpu)?)
    }

    /// Stores `value` at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::CapacityExceeded`] if the map is full and can't
    /// evict, [`MapError::Driver`] if the driver fails (this includes
    /// [`UpdatePolicy`] conflicts).
    pub fn update(&self, key: &[u8], value: &[u8], policy: UpdatePolicy) -> Result<(), MapError> {
        self.require_keyed("update")?;
        self.check_key(key)?;
        self.check_value(value)?;
        let handle = self.handle("bpf_map_update_elem")?;
        self.driver
            .update_elem(handle, key, value, policy)
            .map_err(|e| self.capacity_error(e))
    }

    /// Stores `value` at `key` for `cpu` only, in a per-CPU map.
    pub fn update_cpu(
        &self,
        key: &[u8],
        cpu: u32,
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), MapError> {
        self.require(self.kind().is_per_cpu(), "update_cpu")?;
        self.check_key(key)?;
        check_size(
            LayoutPart::Value,
            value.len(),
            self.def.value_size() as usize,
        )?;
        self.check_cpu(cpu)?;
        let handle = self.handle("bpf_map_update_elem")?;
        self.driver
            .update_elem_cpu(handle, key, cpu, value, policy)
            .map_err(|e| self.capacity_error(e))
    }

    /// Deletes the element stored at `key`. Returns `false` if there was none.
    ///
    /// Array elements can't be deleted.
    pub fn delete(&self, key: &[u8]) -> Result<bool, MapError> {
        self.require(
            !self.kind().is_array() && self.kind() != MapKind::Queue,
            "delete",
        )?;
        self.check_key(key)?;
        let handle = self.handle("bpf_map_delete_elem")?;
        match self.driver.delete_elem(handle, key) {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(ENOENT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the key following `key`, or the first key if `key` is `None`.
    pub fn next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>, MapError> {
        self.require_keyed("next_key")?;
        if let Some(key) = key {
            check_size(LayoutPart::Key, key.len(), self.def.key_size() as usize)?;
        }
        let handle = self.handle("bpf_map_get_next_key")?;
        Ok(self.driver.get_next_key(handle, key)?)
    }

    /// Appends `value` to a queue.
    pub fn push(&self, value: &[u8]) -> Result<(), MapError> {
        self.require(self.kind() == MapKind::Queue, "push")?;
        self.check_value(value)?;
        let handle = self.handle("bpf_map_push_elem")?;
        self.driver
            .push_elem(handle, value)
            .map_err(|e| self.capacity_error(e))
    }

    /// Removes and returns the front of a queue.
    pub fn pop(&self) -> Result<Option<Vec<u8>>, MapError> {
        self.require(self.kind() == MapKind::Queue, "pop")?;
        let handle = self.handle("bpf_map_lookup_and_delete_elem")?;
        Ok(self.driver.pop_elem(handle)?)
    }

    /// Returns the front of a queue without removing it.
    pub fn peek(&self) -> Result<Option<Vec<u8>>, MapError> {
        self.require(self.kind() == MapKind::Queue, "peek")?;
        let handle = self.handle("bpf_map_lookup_elem")?;
        Ok(self.driver.peek_elem(handle)?)
    }

    /// Destroys the map, returning any error the driver reports.
    pub fn close(mut self) -> Result<(), MapError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), MapError> {
        match self.handle.take() {
            Some(handle) => {
                debug!("destroying map `{}` ({handle})", self.name());
                Ok(self.driver.destroy_map(handle)?)
            }
            None => Ok(()),
        }
    }
}

impl Drop for MapData {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to destroy map `{}`: {e}", self.name());
        }
    }
}

/// An iterable map
pub trait IterableMap<K: Pod, V> {
    /// Get a generic map handle
    fn map(&self) -> &MapData;

    /// Get the value for the provided `key`
    fn get(&self, key: &K) -> Result<V, MapError>;
}

/// Iterator returned by `map.keys()`.
pub struct MapKeys<'coll, K: Pod> {
    map: &'coll MapData,
    err: bool,
    key: Option<K>,
}

impl<'coll, K: Pod> MapKeys<'coll, K> {
    fn new(map: &'coll MapData) -> Self {
        Self {
            map,
            err: false,
            key: None,
        }
    }
}

impl<K: Pod> Iterator for MapKeys<'_, K> {
    type Item = Result<K, MapError>;

    fn next(&mut self) -> Option<Result<K, MapError>> {
        if self.err {
            return None;
        }

        let key = self
            .map
            .next_key(self.key.as_ref().map(crate::bytes_of))
            .and_then(|key| {
                key.map(|key| {
                    from_bytes::<K>(&key).ok_or(MapError::LayoutMismatch {
                        part: LayoutPart::Key,
                        size: key.len(),
                        expected: mem::size_of::<K>(),
                    })
                })
                .transpose()
            });
        match key {
            Err(err) => {
                self.err = true;
                Some(Err(err))
            }
            Ok(key) => {
                self.key = key;
                key.map(Ok)
            }
        }
    }
}

/// Iterator returned by `map.iter()`.
pub struct MapIter<'coll, K: Pod, V, I: IterableMap<K, V>> {
    keys: MapKeys<'coll, K>,
    map: &'coll I,
    _v: PhantomData<V>,
}

impl<'coll, K: Pod, V, I: IterableMap<K, V>> MapIter<'coll, K, V, I> {
    fn new(map: &'coll I) -> Self {
        Self {
            keys: MapKeys::new(map.map()),
            map,
            _v: PhantomData,
        }
    }
}

impl<K: Pod, V, I: IterableMap<K, V>> Iterator for MapIter<'_, K, V, I> {
    type Item = Result<(K, V), MapError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.keys.next() {
                Some(Ok(key)) => match self.map.get(&key) {
                    Ok(value) => return Some(Ok((key, value))),
                    Err(MapError::KeyNotFound) => continue,
                    Err(e) => return Some(Err(e)),
                },
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}

/// A slice of per-CPU values.
///
/// Used by maps that implement per-CPU storage like [`PerCpuHashMap`]. The
/// number of values must match [`MapData::nr_cpus`] when writing.
///
/// # Examples
///
/// ```
/// use bpf_registry::maps::PerCpuValues;
///
/// let values = PerCpuValues::from(vec![1u32, 2, 3, u32::MAX]);
/// assert_eq!(values.len(), 4);
/// assert_eq!(values.sum(), 5);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerCpuValues<T: Pod> {
    values: Box<[T]>,
}

impl<T: Pod> From<Vec<T>> for PerCpuValues<T> {
    fn from(values: Vec<T>) -> Self {
        Self {
            values: values.into_boxed_slice(),
        }
    }
}

impl<T: Pod> PerCpuValues<T> {
    pub(crate) fn from_kernel_mem(bytes: &[u8]) -> Result<Self, MapError> {
        let stride = per_cpu_value_stride(mem::size_of::<T>());
        bytes
            .chunks_exact(stride)
            .map(|slot| {
                from_bytes::<T>(slot).ok_or(MapError::LayoutMismatch {
                    part: LayoutPart::Value,
                    size: slot.len(),
                    expected: mem::size_of::<T>(),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::from)
    }

    pub(crate) fn build_kernel_mem(&self) -> Vec<u8> {
        let value_size = mem::size_of::<T>();
        let stride = per_cpu_value_stride(value_size);
        let mut mem = vec![0u8; self.values.len() * stride];
        for (slot, value) in mem.chunks_exact_mut(stride).zip(self.values.iter()) {
            slot[..value_size].copy_from_slice(crate::bytes_of(value));
        }
        mem
    }

    /// Consumes `self`, returning the values.
    pub fn into_inner(self) -> Box<[T]> {
        self.values
    }
}

impl<T: WrappingAdd> PerCpuValues<T> {
    /// Returns the sum of every CPU's value, wrapping around on overflow.
    pub fn sum(&self) -> T {
        self.values
            .iter()
            .fold(T::ZERO, |acc, value| acc.wrapping_add(*value))
    }
}

impl<T: Pod> Deref for PerCpuValues<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

/// Integer types that per-CPU values can be summed as.
pub trait WrappingAdd: Pod {
    /// The additive identity.
    const ZERO: Self;

    /// Adds `other`, wrapping around at the boundary of the type.
    fn wrapping_add(self, other: Self) -> Self;
}

macro_rules! impl_wrapping_add {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl WrappingAdd for $ty {
                const ZERO: Self = 0;

                fn wrapping_add(self, other: Self) -> Self {
                    $ty::wrapping_add(self, other)
                }
            }
        )+
    }
}

impl_wrapping_add!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

/// How a per-CPU lookup presents the values of the individual CPUs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reduction {
    /// Sum every CPU's value into one.
    Sum,
    /// Return every CPU's value.
    PerCpu,
}

/// The result of a per-CPU lookup under a [`Reduction`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reduced<T: Pod> {
    /// The values summed across CPUs.
    Sum(T),
    /// One value per CPU.
    PerCpu(PerCpuValues<T>),
}

/// Which CPUs a per-CPU update writes to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CpuPolicy {
    /// Write the same value for every CPU.
    #[default]
    AllCpus,
    /// Write the value for the CPU the caller is running on only.
    CurrentCpu,
    /// Write the value for the given CPU only.
    Cpu(u32),
}

pub(crate) fn lookup_per_cpu<V: Pod>(
    map: &MapData,
    key: &[u8],
) -> Result<Option<PerCpuValues<V>>, MapError> {
    map.lookup(key)?
        .map(|bytes| PerCpuValues::from_kernel_mem(&bytes))
        .transpose()
}

pub(crate) fn read_per_cpu<V: Pod>(
    map: &MapData,
    key: &[u8],
) -> Result<Option<PerCpuValues<V>>, MapError> {
    map.read(key)?
        .map(|bytes| PerCpuValues::from_kernel_mem(&bytes))
        .transpose()
}

pub(crate) fn lookup_one_cpu<V: Pod>(
    map: &MapData,
    key: &[u8],
    cpu: u32,
) -> Result<Option<V>, MapError> {
    map.lookup_cpu(key, cpu)?
        .map(|bytes| value_from_bytes(&bytes))
        .transpose()
}

pub(crate) fn update_per_cpu<V: Pod>(
    map: &MapData,
    key: &[u8],
    value: V,
    cpu: CpuPolicy,
    policy: UpdatePolicy,
) -> Result<(), MapError> {
    match cpu {
        CpuPolicy::AllCpus => {
            let values = PerCpuValues::from(vec![value; map.nr_cpus()?]);
            map.update(key, &values.build_kernel_mem(), policy)
        }
        CpuPolicy::CurrentCpu => {
            let cpu = map.current_cpu()?;
            map.update_cpu(key, cpu, crate::bytes_of(&value), policy)
        }
        CpuPolicy::Cpu(cpu) => map.update_cpu(key, cpu, crate::bytes_of(&value), policy),
    }
}

pub(crate) fn update_per_cpu_values<V: Pod>(
    map: &MapData,
    key: &[u8],
    values: &PerCpuValues<V>,
    policy: UpdatePolicy,
) -> Result<(), MapError> {
    let nr_cpus = map.nr_cpus()?;
    if values.len() != nr_cpus {
        return Err(MapError::LayoutMismatch {
            part: LayoutPart::PerCpuValues,
            size: values.len(),
            expected: nr_cpus,
        });
    }
    map.update(key, &values.build_kernel_mem(), policy)
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;

    use super::{Map, MapData, MapDescriptor};
    use crate::sys::{fake::FakeDriver, MapDriver, MemoryDriver};

    pub(crate) fn new_map(def: MapDescriptor) -> Map {
        new_map_with(def, MemoryDriver::new(4))
    }

    pub(crate) fn new_map_with(def: MapDescriptor, driver: impl MapDriver + 'static) -> Map {
        Map::from_map_data(MapData::create(def, Arc::new(driver)).unwrap())
    }

    pub(crate) fn new_fake_map(def: MapDescriptor) -> (Map, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::new(4));
        let map = Map::from_map_data(MapData::create(def, driver.clone()).unwrap());
        (map, driver)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use libc::{EBADF, EFAULT};

    use super::{test_utils::*, *};
    use crate::errors::DescriptorError;

    #[test]
    fn test_create_invalid_descriptor() {
        let driver = Arc::new(crate::sys::fake::FakeDriver::new(1));
        assert_matches!(
            MapData::create(MapDescriptor::hash::<u32, u32>("m", 0), driver.clone()),
            Err(MapError::InvalidDescriptor {
                reason: DescriptorError::ZeroMaxEntries,
                ..
            })
        );
        assert_eq!(driver.map_count(), 0);
    }

    #[test]
    fn test_create_failed() {
        let driver = Arc::new(crate::sys::fake::FakeDriver::new(1));
        driver.override_call("bpf_map_create", EFAULT);
        assert_matches!(
            MapData::create(MapDescriptor::hash::<u32, u32>("m", 1), driver),
            Err(MapError::Driver(SysError::Syscall { call, io_error }))
                if call == "bpf_map_create" && io_error.raw_os_error() == Some(EFAULT)
        );
    }

    #[test]
    fn test_from_map_data_matches_kind() {
        assert_matches!(
            new_map(MapDescriptor::lru_per_cpu_hash::<u32, u32>("m", 1)),
            Map::PerCpuLruHashMap(_)
        );
        assert_matches!(
            new_map(MapDescriptor::lpm_trie::<u32, u32>("m", 1)),
            Map::LpmTrie(_)
        );
    }

    #[test]
    fn test_layout_checks() {
        let map = new_map(MapDescriptor::hash::<u32, u64>("m", 1));
        let map = map.data();
        assert_matches!(
            map.lookup(&[0; 2]),
            Err(MapError::LayoutMismatch {
                part: LayoutPart::Key,
                size: 2,
                expected: 4
            })
        );
        assert_matches!(
            map.update(&[0; 4], &[0; 4], UpdatePolicy::Any),
            Err(MapError::LayoutMismatch {
                part: LayoutPart::Value,
                size: 4,
                expected: 8
            })
        );
    }

    #[test]
    fn test_per_cpu_layout_check() {
        let map = new_map(MapDescriptor::per_cpu_hash::<u32, u32>("m", 1));
        assert_matches!(
            map.data().update(&[0; 4], &[0; 4], UpdatePolicy::Any),
            Err(MapError::LayoutMismatch {
                part: LayoutPart::PerCpuValues,
                size: 4,
                expected: 32
            })
        );
        assert_matches!(
            map.data().lookup_cpu(&[0; 4], 4),
            Err(MapError::CpuOutOfRange { cpu: 4, nr_cpus: 4 })
        );
    }

    #[test]
    fn test_unsupported_operations() {
        let queue = new_map(MapDescriptor::queue::<u32>("q", 1));
        assert_matches!(
            queue.data().lookup(&[]),
            Err(MapError::UnsupportedOperation {
                kind: MapKind::Queue,
                operation: "lookup"
            })
        );
        assert_matches!(
            queue.data().next_key(None),
            Err(MapError::UnsupportedOperation { .. })
        );

        let hash = new_map(MapDescriptor::hash::<u32, u32>("h", 1));
        assert_matches!(
            hash.data().push(&[0; 4]),
            Err(MapError::UnsupportedOperation {
                kind: MapKind::Hash,
                operation: "push"
            })
        );
        assert_matches!(
            hash.data().lookup_cpu(&[0; 4], 0),
            Err(MapError::UnsupportedOperation { .. })
        );
    }

    #[test]
    fn test_delete_missing_key() {
        let map = new_map(MapDescriptor::hash::<u32, u32>("m", 1));
        assert!(!map.data().delete(&[0; 4]).unwrap());
        map.data()
            .update(&[0; 4], &[1; 4], UpdatePolicy::Any)
            .unwrap();
        assert!(map.data().delete(&[0; 4]).unwrap());
    }

    #[test]
    fn test_close_error() {
        let (map, driver) = new_fake_map(MapDescriptor::hash::<u32, u32>("m", 1));
        driver.override_call("close", EBADF);
        assert_matches!(
            map.into_data().close(),
            Err(MapError::Driver(SysError::Syscall { call, .. })) if call == "close"
        );
    }

    #[test]
    fn test_drop_destroys() {
        let driver = Arc::new(crate::sys::MemoryDriver::new(1));
        let map = MapData::create(MapDescriptor::array::<u32>("m", 1), driver.clone()).unwrap();
        assert_eq!(driver.map_count(), 1);
        drop(map);
        assert_eq!(driver.map_count(), 0);
    }

    #[test]
    fn test_per_cpu_values_kernel_mem() {
        let values = PerCpuValues::from(vec![1u32, 2]);
        let mem = values.build_kernel_mem();
        assert_eq!(mem.len(), 16);
        assert_eq!(PerCpuValues::<u32>::from_kernel_mem(&mem).unwrap(), values);
    }

    #[test]
    fn test_per_cpu_values_sum_wraps() {
        let values = PerCpuValues::from(vec![u8::MAX, 2]);
        assert_eq!(values.sum(), 1);
    }
}
