//! Map descriptors.
use std::{fmt, mem};

use crate::{
    errors::{DescriptorError, MapError},
    maps::lpm_trie::Key,
    Pod,
};

/// The largest trie key data the kernel accepts, in bytes.
pub const LPM_DATA_SIZE_MAX: u32 = 256;

/// The kinds of map this crate knows how to handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapKind {
    /// A hash map.
    #[doc(alias = "BPF_MAP_TYPE_HASH")]
    Hash,
    /// A hash map holding one value per CPU for each key.
    #[doc(alias = "BPF_MAP_TYPE_PERCPU_HASH")]
    PerCpuHash,
    /// A hash map that evicts the least recently used entry when full.
    #[doc(alias = "BPF_MAP_TYPE_LRU_HASH")]
    LruHash,
    /// A per-CPU hash map that evicts the least recently used entry when full.
    #[doc(alias = "BPF_MAP_TYPE_LRU_PERCPU_HASH")]
    LruPerCpuHash,
    /// A fixed-size, zero-initialized array.
    #[doc(alias = "BPF_MAP_TYPE_ARRAY")]
    Array,
    /// A fixed-size array holding one value per CPU for each index.
    #[doc(alias = "BPF_MAP_TYPE_PERCPU_ARRAY")]
    PerCpuArray,
    /// A longest prefix match trie.
    #[doc(alias = "BPF_MAP_TYPE_LPM_TRIE")]
    LpmTrie,
    /// A FIFO queue.
    #[doc(alias = "BPF_MAP_TYPE_QUEUE")]
    Queue,
}

impl MapKind {
    /// Returns the kernel `BPF_MAP_TYPE_*` value for this kind.
    pub fn map_type(self) -> u32 {
        match self {
            Self::Hash => 1,
            Self::Array => 2,
            Self::PerCpuHash => 5,
            Self::PerCpuArray => 6,
            Self::LruHash => 9,
            Self::LruPerCpuHash => 10,
            Self::LpmTrie => 11,
            Self::Queue => 22,
        }
    }

    /// Returns true for kinds that hold one value per CPU.
    pub fn is_per_cpu(self) -> bool {
        matches!(self, Self::PerCpuHash | Self::LruPerCpuHash | Self::PerCpuArray)
    }

    /// Returns true for kinds that evict instead of failing when full.
    pub fn is_lru(self) -> bool {
        matches!(self, Self::LruHash | Self::LruPerCpuHash)
    }

    /// Returns true for the array kinds, whose keys are indices.
    pub fn is_array(self) -> bool {
        matches!(self, Self::Array | Self::PerCpuArray)
    }
}

impl TryFrom<u32> for MapKind {
    type Error = MapError;

    fn try_from(map_type: u32) -> Result<Self, Self::Error> {
        Ok(match map_type {
            1 => Self::Hash,
            2 => Self::Array,
            5 => Self::PerCpuHash,
            6 => Self::PerCpuArray,
            9 => Self::LruHash,
            10 => Self::LruPerCpuHash,
            11 => Self::LpmTrie,
            22 => Self::Queue,
            _ => return Err(MapError::InvalidMapType { map_type }),
        })
    }
}

bitflags::bitflags! {
    /// Map creation flags, with the values of the kernel's `BPF_F_*` constants.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Don't preallocate entries. Required by [`MapKind::LpmTrie`].
        const NO_PREALLOC = 1 << 0;
        /// Use one LRU list per CPU instead of a shared one.
        const NO_COMMON_LRU = 1 << 1;
        /// Allocate the map on a specific NUMA node.
        const NUMA_NODE = 1 << 2;
        /// User space may only read the map.
        const RDONLY = 1 << 3;
        /// User space may only write the map.
        const WRONLY = 1 << 4;
        /// Use a zero hash seed.
        const ZERO_SEED = 1 << 6;
        /// Programs may only read the map.
        const RDONLY_PROG = 1 << 7;
        /// Programs may only write the map.
        const WRONLY_PROG = 1 << 8;
        /// The map can be memory mapped.
        const MMAPABLE = 1 << 10;
    }
}

/// The shape of a map key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyLayout {
    /// The map has no keys. Used by queues.
    None,
    /// A fixed-width key of `size` bytes.
    Scalar {
        /// Key size in bytes.
        size: u32,
    },
    /// A trie key: a `u32` prefix length followed by `data_size` bytes of data.
    Prefixed {
        /// Size of the data part in bytes.
        data_size: u32,
    },
}

impl KeyLayout {
    /// Returns the size of a key in bytes.
    pub fn size(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Scalar { size } => *size,
            Self::Prefixed { data_size } => mem::size_of::<u32>() as u32 + data_size,
        }
    }
}

impl fmt::Display for KeyLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Scalar { size } => write!(f, "scalar({size})"),
            Self::Prefixed { data_size } => write!(f, "prefixed({data_size})"),
        }
    }
}

/// Describes a map: its kind, key and value layout, capacity and flags.
///
/// Descriptors are plain values. They are checked with
/// [`validate`](MapDescriptor::validate) before a map is created from them and
/// never change afterwards; a live map shares its descriptor read-only.
///
/// # Examples
///
/// ```
/// use bpf_registry::maps::{MapDescriptor, MapFlags, MapKind};
///
/// let trie = MapDescriptor::lpm_trie::<u32, u32>("lpm_trie_map", 255);
/// assert_eq!(trie.kind(), MapKind::LpmTrie);
/// assert_eq!(trie.key_size(), 8);
/// assert!(trie.flags().contains(MapFlags::NO_PREALLOC));
/// assert!(trie.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapDescriptor {
    name: String,
    kind: MapKind,
    key: KeyLayout,
    value_size: u32,
    max_entries: u32,
    flags: MapFlags,
}

impl MapDescriptor {
    /// Creates a descriptor with no flags.
    pub fn new(
        name: impl Into<String>,
        kind: MapKind,
        key: KeyLayout,
        value_size: u32,
        max_entries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            key,
            value_size,
            max_entries,
            flags: MapFlags::empty(),
        }
    }

    /// Returns a copy of this descriptor with `flags` set.
    pub fn with_flags(self, flags: MapFlags) -> Self {
        Self { flags, ..self }
    }

    /// Returns a copy of this descriptor with a different capacity.
    pub fn with_max_entries(self, max_entries: u32) -> Self {
        Self {
            max_entries,
            ..self
        }
    }

    fn keyed<K: Pod, V: Pod>(name: impl Into<String>, kind: MapKind, max_entries: u32) -> Self {
        Self::new(
            name,
            kind,
            KeyLayout::Scalar {
                size: mem::size_of::<K>() as u32,
            },
            mem::size_of::<V>() as u32,
            max_entries,
        )
    }

    /// A [`MapKind::Hash`] descriptor for keys `K` and values `V`.
    pub fn hash<K: Pod, V: Pod>(name: impl Into<String>, max_entries: u32) -> Self {
        Self::keyed::<K, V>(name, MapKind::Hash, max_entries)
    }

    /// A [`MapKind::PerCpuHash`] descriptor for keys `K` and values `V`.
    pub fn per_cpu_hash<K: Pod, V: Pod>(name: impl Into<String>, max_entries: u32) -> Self {
        Self::keyed::<K, V>(name, MapKind::PerCpuHash, max_entries)
    }

    /// A [`MapKind::LruHash`] descriptor for keys `K` and values `V`.
    pub fn lru_hash<K: Pod, V: Pod>(name: impl Into<String>, max_entries: u32) -> Self {
        Self::keyed::<K, V>(name, MapKind::LruHash, max_entries)
    }

    /// A [`MapKind::LruPerCpuHash`] descriptor for keys `K` and values `V`.
    pub fn lru_per_cpu_hash<K: Pod, V: Pod>(name: impl Into<String>, max_entries: u32) -> Self {
        Self::keyed::<K, V>(name, MapKind::LruPerCpuHash, max_entries)
    }

    /// A [`MapKind::Array`] descriptor for values `V`.
    pub fn array<V: Pod>(name: impl Into<String>, max_entries: u32) -> Self {
        Self::keyed::<u32, V>(name, MapKind::Array, max_entries)
    }

    /// A [`MapKind::PerCpuArray`] descriptor for values `V`.
    pub fn per_cpu_array<V: Pod>(name: impl Into<String>, max_entries: u32) -> Self {
        Self::keyed::<u32, V>(name, MapKind::PerCpuArray, max_entries)
    }

    /// A [`MapKind::LpmTrie`] descriptor for [`Key<K>`] keys and values `V`.
    ///
    /// The [`MapFlags::NO_PREALLOC`] flag the kind requires is set.
    pub fn lpm_trie<K: Pod, V: Pod>(name: impl Into<String>, max_entries: u32) -> Self {
        debug_assert_eq!(
            mem::size_of::<Key<K>>(),
            mem::size_of::<u32>() + mem::size_of::<K>()
        );
        Self::new(
            name,
            MapKind::LpmTrie,
            KeyLayout::Prefixed {
                data_size: mem::size_of::<K>() as u32,
            },
            mem::size_of::<V>() as u32,
            max_entries,
        )
        .with_flags(MapFlags::NO_PREALLOC)
    }

    /// A [`MapKind::Queue`] descriptor for values `V`.
    pub fn queue<V: Pod>(name: impl Into<String>, max_entries: u32) -> Self {
        Self::new(
            name,
            MapKind::Queue,
            KeyLayout::None,
            mem::size_of::<V>() as u32,
            max_entries,
        )
    }

    /// Returns the map name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the map kind.
    pub fn kind(&self) -> MapKind {
        self.kind
    }

    /// Returns the key layout.
    pub fn key(&self) -> KeyLayout {
        self.key
    }

    /// Returns the key size in bytes, zero for maps without keys.
    pub fn key_size(&self) -> u32 {
        self.key.size()
    }

    /// Returns the value size in bytes.
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Returns the maximum number of entries.
    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Returns the creation flags.
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// Checks that the descriptor describes a map the kind can back.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidDescriptor`] naming the first problem found.
    pub fn validate(&self) -> Result<(), MapError> {
        self.check().map_err(|reason| MapError::InvalidDescriptor {
            name: self.name.clone(),
            reason,
        })
    }

    fn check(&self) -> Result<(), DescriptorError> {
        let Self {
            name,
            kind,
            key,
            value_size,
            max_entries,
            flags,
        } = self;
        let kind = *kind;

        if name.is_empty() || name.contains('\0') {
            return Err(DescriptorError::InvalidName);
        }
        if *max_entries == 0 {
            return Err(DescriptorError::ZeroMaxEntries);
        }
        if *value_size == 0 {
            return Err(DescriptorError::ZeroValueSize);
        }

        let key_ok = match (kind, key) {
            (MapKind::Queue, KeyLayout::None) => true,
            (MapKind::Array | MapKind::PerCpuArray, KeyLayout::Scalar { size }) => {
                *size as usize == mem::size_of::<u32>()
            }
            (MapKind::LpmTrie, KeyLayout::Prefixed { data_size }) => {
                (1..=LPM_DATA_SIZE_MAX).contains(data_size)
            }
            (
                MapKind::Hash | MapKind::PerCpuHash | MapKind::LruHash | MapKind::LruPerCpuHash,
                KeyLayout::Scalar { size },
            ) => *size > 0,
            _ => false,
        };
        if !key_ok {
            return Err(DescriptorError::InvalidKeyLayout {
                kind,
                key: key.to_string(),
            });
        }

        if flags.contains(MapFlags::NO_PREALLOC)
            && !matches!(kind, MapKind::Hash | MapKind::PerCpuHash | MapKind::LpmTrie)
        {
            return Err(DescriptorError::InvalidFlag {
                kind,
                flag: "NO_PREALLOC".to_owned(),
            });
        }
        if flags.contains(MapFlags::NO_COMMON_LRU) && !kind.is_lru() {
            return Err(DescriptorError::InvalidFlag {
                kind,
                flag: "NO_COMMON_LRU".to_owned(),
            });
        }
        if kind == MapKind::LpmTrie && !flags.contains(MapFlags::NO_PREALLOC) {
            return Err(DescriptorError::MissingFlag {
                kind,
                flag: "NO_PREALLOC",
            });
        }

        Ok(())
    }
}
