//! Drivers performing the actual map creation and I/O.
//!
//! Everything above this module talks to maps through the [`MapDriver`] trait.
//! Two implementations are provided:
//!
//! * [`SyscallDriver`] issues `bpf(2)` system calls and creates real kernel
//!   maps (Linux only).
//! * [`MemoryDriver`] emulates the supported map kinds in process. It is what
//!   the tests use and works without kernel privileges.
//!
//! Drivers follow the kernel's calling convention: keys and values are byte
//! slices of exactly the sizes declared when the map was created, per-CPU
//! values are exchanged as one slot per possible CPU with each slot rounded up
//! to 8 bytes, and failures carry the errno the kernel would return.

#[cfg(target_os = "linux")]
mod bpf;
#[cfg(test)]
pub(crate) mod fake;
mod memory;

use std::{fmt, sync::Arc};

#[cfg(target_os = "linux")]
#[cfg_attr(docsrs, doc(cfg(target_os = "linux")))]
pub use bpf::SyscallDriver;
pub use memory::MemoryDriver;

use crate::{errors::SysError, maps::MapDescriptor};

/// Flags accepted by element updates, with the values of the kernel's
/// `BPF_ANY`, `BPF_NOEXIST` and `BPF_EXIST`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Create a new element or update an existing one.
    #[default]
    Any,
    /// Only create a new element. Fails with `EEXIST` if the key exists.
    NoExist,
    /// Only update an existing element. Fails with `ENOENT` if the key is missing.
    Exist,
}

impl UpdatePolicy {
    /// Returns the kernel flag value.
    pub fn flags(self) -> u64 {
        match self {
            Self::Any => 0,
            Self::NoExist => 1,
            Self::Exist => 2,
        }
    }
}

/// An opaque handle to a map created by a [`MapDriver`].
///
/// The handle is an identifier into the driver's own table (a file descriptor
/// for [`SyscallDriver`]). It is deliberately neither `Copy` nor `Clone`:
/// whoever holds it owns the map and is the only one who can pass it to
/// [`MapDriver::destroy_map`].
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MapHandle(u32);

impl MapHandle {
    /// Wraps a raw driver identifier.
    ///
    /// Only drivers should create handles.
    pub fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw driver identifier.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The low level map primitives.
///
/// Each call is atomic with respect to the single map it targets. Nothing is
/// atomic across calls: a lookup followed by an update can race with other
/// callers.
///
/// Lookups return `Ok(None)` when the element does not exist. All other
/// failures are reported as [`SysError`]s carrying the errno the kernel would
/// return for the same condition (`E2BIG` for a full hash map, array or queue,
/// `ENOSPC` for a full trie, `EEXIST`/`ENOENT` for [`UpdatePolicy`]
/// conflicts, `EINVAL` for invalid arguments).
pub trait MapDriver: Send + Sync + fmt::Debug {
    /// Creates a map as described by `def`.
    fn create_map(&self, def: &MapDescriptor) -> Result<MapHandle, SysError>;

    /// Looks up the value stored at `key`. For per-CPU maps the value of every
    /// CPU is returned.
    fn lookup_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError>;

    /// Reads the value stored at `key` like [`lookup_elem`](Self::lookup_elem)
    /// without counting as a use of the entry in LRU maps.
    ///
    /// Used when listing a map. Drivers whose lookups leave LRU state alone
    /// can keep the default.
    fn read_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError> {
        self.lookup_elem(map, key)
    }

    /// Looks up the value stored at `key` for a single CPU of a per-CPU map.
    fn lookup_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
    ) -> Result<Option<Vec<u8>>, SysError>;

    /// Stores `value` at `key`. For per-CPU maps `value` holds every CPU's value.
    fn update_elem(
        &self,
        map: &MapHandle,
        key: &[u8],
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError>;

    /// Stores `value` at `key` for a single CPU of a per-CPU map, leaving the
    /// other CPUs' values untouched (zero for a newly created element).
    fn update_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError>;

    /// Deletes the element stored at `key`. Fails with `ENOENT` if there is none.
    fn delete_elem(&self, map: &MapHandle, key: &[u8]) -> Result<(), SysError>;

    /// Returns the key following `key`, or the first key when `key` is `None`.
    /// Returns `Ok(None)` after the last key.
    ///
    /// What follows a key that has been deleted is up to the driver: the kernel
    /// restarts from the first key of hash maps, [`MemoryDriver`] continues
    /// with the next key in order.
    fn get_next_key(&self, map: &MapHandle, key: Option<&[u8]>)
        -> Result<Option<Vec<u8>>, SysError>;

    /// Appends `value` to a queue.
    fn push_elem(&self, map: &MapHandle, value: &[u8]) -> Result<(), SysError>;

    /// Removes and returns the element at the front of a queue.
    fn pop_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError>;

    /// Returns the element at the front of a queue without removing it.
    fn peek_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError>;

    /// Destroys the map, consuming its handle.
    fn destroy_map(&self, map: MapHandle) -> Result<(), SysError>;

    /// Returns the number of slots per-CPU maps hold for each element.
    fn nr_cpus(&self) -> Result<usize, SysError>;

    /// Returns the CPU the caller is running on.
    fn current_cpu(&self) -> Result<u32, SysError>;
}

// Lets callers keep a handle on a driver they hand to a registry.
impl<D: MapDriver + ?Sized> MapDriver for Arc<D> {
    fn create_map(&self, def: &MapDescriptor) -> Result<MapHandle, SysError> {
        (**self).create_map(def)
    }

    fn lookup_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError> {
        (**self).lookup_elem(map, key)
    }

    fn read_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError> {
        (**self).read_elem(map, key)
    }

    fn lookup_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
    ) -> Result<Option<Vec<u8>>, SysError> {
        (**self).lookup_elem_cpu(map, key, cpu)
    }

    fn update_elem(
        &self,
        map: &MapHandle,
        key: &[u8],
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError> {
        (**self).update_elem(map, key, value, policy)
    }

    fn update_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError> {
        (**self).update_elem_cpu(map, key, cpu, value, policy)
    }

    fn delete_elem(&self, map: &MapHandle, key: &[u8]) -> Result<(), SysError> {
        (**self).delete_elem(map, key)
    }

    fn get_next_key(
        &self,
        map: &MapHandle,
        key: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, SysError> {
        (**self).get_next_key(map, key)
    }

    fn push_elem(&self, map: &MapHandle, value: &[u8]) -> Result<(), SysError> {
        (**self).push_elem(map, value)
    }

    fn pop_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError> {
        (**self).pop_elem(map)
    }

    fn peek_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError> {
        (**self).peek_elem(map)
    }

    fn destroy_map(&self, map: MapHandle) -> Result<(), SysError> {
        (**self).destroy_map(map)
    }

    fn nr_cpus(&self) -> Result<usize, SysError> {
        (**self).nr_cpus()
    }

    fn current_cpu(&self) -> Result<u32, SysError> {
        (**self).current_cpu()
    }
}

/// Returns the size of one per-CPU slot for values of `value_size` bytes.
pub(crate) fn per_cpu_value_stride(value_size: usize) -> usize {
    (value_size + 7) & !7
}
