//! A LPM Trie.
use std::{borrow::Borrow, fmt, marker::PhantomData};

use crate::{
    bytes_of,
    maps::{
        check_kv_size, hash_map, value_from_bytes, IterableMap, MapData, MapError, MapIter,
        MapKeys, UpdatePolicy,
    },
    Pod,
};

/// A Longest Prefix Match Trie.
///
/// Key data is compared in memory order, most significant bit first, so
/// addresses must be stored in network byte order.
///
/// # Examples
///
/// ```
/// use bpf_registry::{
///     maps::{lpm_trie::{Key, LpmTrie}, MapDescriptor, UpdatePolicy},
///     sys::MemoryDriver,
///     MapRegistry,
/// };
/// use std::net::Ipv4Addr;
///
/// let registry = MapRegistry::new(MemoryDriver::new(1));
/// let map = registry.create(MapDescriptor::lpm_trie::<u32, u32>("LPM_TRIE", 16))?;
/// let mut trie = LpmTrie::<_, u32, u32>::try_from(map)?;
/// let ipaddr = Ipv4Addr::new(8, 8, 8, 8);
/// // The following represents a key for the "8.8.8.8/16" subnet.
/// // The first argument - the prefix length - represents how many bits should be matched against. The second argument is the actual data to be matched.
/// let key = Key::new(16, u32::from(ipaddr).to_be());
/// trie.update(&key, 1, UpdatePolicy::Any)?;
///
/// // LpmTrie matches against the longest (most accurate) key.
/// let lookup = Key::new(32, u32::from(ipaddr).to_be());
/// let value = trie.lookup(&lookup)?;
/// assert_eq!(value, Some(1));
///
/// // If we were to insert a key with longer 'prefix_len'
/// // our trie should match against it.
/// let longer_key = Key::new(24, u32::from(ipaddr).to_be());
/// trie.update(&longer_key, 2, UpdatePolicy::Any)?;
/// let value = trie.lookup(&lookup)?;
/// assert_eq!(value, Some(2));
/// # Ok::<(), bpf_registry::MapError>(())
/// ```
#[doc(alias = "BPF_MAP_TYPE_LPM_TRIE")]
#[derive(Debug)]
pub struct LpmTrie<T, K, V> {
    pub(crate) inner: T,
    _k: PhantomData<K>,
    _v: PhantomData<V>,
}

/// A Key for an LpmTrie map.
///
/// # Examples
///
/// ```
/// use bpf_registry::maps::lpm_trie::Key;
/// use std::net::Ipv4Addr;
///
/// let ipaddr = Ipv4Addr::new(8,8,8,8);
/// let key =  Key::new(16, u32::from(ipaddr).to_be());
/// assert_eq!(key.prefix_len(), 16);
/// ```
#[repr(C, packed)]
pub struct Key<K: Pod> {
    prefix_len: u32,
    data: K,
}

impl<K: Pod> Key<K> {
    /// Creates a new key.
    ///
    /// `prefix_len` is the number of bits in the data to match against.
    /// `data` is the data in the key which is typically an IPv4 or IPv6 address.
    /// If using a key to perform a longest prefix match on you would use a `prefix_len`
    /// of 32 for IPv4 and 128 for IPv6.
    pub fn new(prefix_len: u32, data: K) -> Self {
        Self { prefix_len, data }
    }

    /// Returns the number of bits in the data to be matched.
    pub fn prefix_len(&self) -> u32 {
        self.prefix_len
    }

    /// Returns the data stored in the Key.
    pub fn data(&self) -> K {
        self.data
    }
}

impl<K: Pod> Copy for Key<K> {}

impl<K: Pod> Clone for Key<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Pod + fmt::Debug> fmt::Debug for Key<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("prefix_len", &self.prefix_len())
            .field("data", &self.data())
            .finish()
    }
}

impl<K: Pod + PartialEq> PartialEq for Key<K> {
    fn eq(&self, other: &Self) -> bool {
        self.prefix_len() == other.prefix_len() && self.data() == other.data()
    }
}

// A Pod impl is required as Key struct is a key for a map.
unsafe impl<K: Pod> Pod for Key<K> {}

impl<T: Borrow<MapData>, K: Pod, V: Pod> LpmTrie<T, K, V> {
    pub(crate) fn new(map: T) -> Result<Self, MapError> {
        let data = map.borrow();
        check_kv_size::<Key<K>, V>(data)?;

        Ok(Self {
            inner: map,
            _k: PhantomData,
            _v: PhantomData,
        })
    }

    /// Returns a copy of the value associated with the longest prefix matching key in the LpmTrie.
    ///
    /// Only entries whose prefix length is at most `key.prefix_len()` are considered.
    pub fn lookup(&self, key: &Key<K>) -> Result<Option<V>, MapError> {
        self.inner
            .borrow()
            .lookup(bytes_of(key))?
            .map(|value| value_from_bytes(&value))
            .transpose()
    }

    /// An iterator visiting all key-value pairs. The
    /// iterator item type is `Result<(Key<K>, V), MapError>`.
    pub fn iter(&self) -> MapIter<'_, Key<K>, V, Self> {
        MapIter::new(self)
    }

    /// An iterator visiting all keys. The iterator element
    /// type is `Result<Key<K>, MapError>`.
    pub fn keys(&self) -> MapKeys<'_, Key<K>> {
        MapKeys::new(self.inner.borrow())
    }

    /// Inserts a key value pair into the map.
    ///
    /// Only the first `key.prefix_len()` bits of the key data are stored, so
    /// keys differing in the remaining bits replace each other.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::PrefixLengthOutOfRange`] if the prefix is longer
    /// than the key data, [`MapError::CapacityExceeded`] if the trie is full.
    pub fn update(
        &mut self,
        key: &Key<K>,
        value: impl Borrow<V>,
        policy: UpdatePolicy,
    ) -> Result<(), MapError> {
        hash_map::update(self.inner.borrow(), key, value.borrow(), policy)
    }

    /// Removes an element from the map.
    ///
    /// Both the prefix and data must match exactly - this method does not do a longest prefix match.
    pub fn delete(&mut self, key: &Key<K>) -> Result<bool, MapError> {
        hash_map::delete(self.inner.borrow(), key)
    }
}

impl<T: Borrow<MapData>, K: Pod, V: Pod> IterableMap<Key<K>, V> for LpmTrie<T, K, V> {
    fn map(&self) -> &MapData {
        self.inner.borrow()
    }

    fn get(&self, key: &Key<K>) -> Result<V, MapError> {
        self.lookup(key)?.ok_or(MapError::KeyNotFound)
    }
}
