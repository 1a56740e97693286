use std::{
    collections::{BTreeMap, VecDeque},
    mem,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use libc::{E2BIG, EBADF, EEXIST, EINVAL, ENOENT, ENOSPC};
use parking_lot::Mutex;

use super::{per_cpu_value_stride, MapDriver, MapHandle, UpdatePolicy};
use crate::{
    errors::SysError,
    maps::{MapDescriptor, MapKind},
    util,
};

type Errno = i32;

/// A [`MapDriver`] that keeps every map in process memory.
///
/// The emulation follows the kernel's semantics for each kind: arrays are
/// zero-initialized and can't shrink, LRU hash maps evict the least recently
/// used element (lookups and updates both count as a use), tries match the
/// longest stored prefix and queues are FIFO. Each map is guarded by its own
/// lock, so individual operations are atomic.
///
/// # Examples
///
/// ```
/// use bpf_registry::sys::MemoryDriver;
///
/// // Emulate a machine with 4 CPUs, and pretend callers always run on CPU 2.
/// let driver = MemoryDriver::new(4);
/// driver.set_current_cpu(Some(2));
/// ```
#[derive(Debug)]
pub struct MemoryDriver {
    nr_cpus: usize,
    current_cpu: Mutex<Option<u32>>,
    next_id: AtomicU32,
    maps: Mutex<HashMap<u32, Arc<Mutex<MemoryMap>>>>,
}

impl MemoryDriver {
    /// Creates a driver whose per-CPU maps have `nr_cpus` slots per element.
    ///
    /// # Panics
    ///
    /// Panics if `nr_cpus` is zero.
    pub fn new(nr_cpus: usize) -> Self {
        assert!(nr_cpus > 0, "nr_cpus must be greater than zero");
        Self {
            nr_cpus,
            current_cpu: Mutex::new(None),
            next_id: AtomicU32::new(1),
            maps: Mutex::new(HashMap::new()),
        }
    }

    /// Pins the CPU reported by [`MapDriver::current_cpu`].
    ///
    /// With `None` (the default) the CPU the calling thread runs on is
    /// reported, folded into the emulated CPU count.
    pub fn set_current_cpu(&self, cpu: Option<u32>) {
        *self.current_cpu.lock() = cpu;
    }

    /// Returns the number of maps currently alive.
    pub fn map_count(&self) -> usize {
        self.maps.lock().len()
    }

    fn with_map<R>(
        &self,
        map: &MapHandle,
        call: &'static str,
        f: impl FnOnce(&mut MemoryMap) -> Result<R, Errno>,
    ) -> Result<R, SysError> {
        let map = self
            .maps
            .lock()
            .get(&map.as_raw())
            .cloned()
            .ok_or_else(|| SysError::new(call, EBADF))?;
        let mut map = map.lock();
        f(&mut map).map_err(|errno| SysError::new(call, errno))
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new(util::nr_cpus().unwrap_or(1).max(1))
    }
}

impl MapDriver for MemoryDriver {
    fn create_map(&self, def: &MapDescriptor) -> Result<MapHandle, SysError> {
        def.validate()
            .map_err(|_| SysError::new("bpf_map_create", EINVAL))?;
        let map = MemoryMap::new(def, self.nr_cpus);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.maps.lock().insert(id, Arc::new(Mutex::new(map)));
        Ok(MapHandle::from_raw(id))
    }

    fn lookup_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError> {
        self.with_map(map, "bpf_map_lookup_elem", |m| m.lookup(key, None, true))
    }

    fn read_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError> {
        self.with_map(map, "bpf_map_lookup_elem", |m| m.lookup(key, None, false))
    }

    fn lookup_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
    ) -> Result<Option<Vec<u8>>, SysError> {
        self.with_map(map, "bpf_map_lookup_elem", |m| m.lookup(key, Some(cpu), true))
    }

    fn update_elem(
        &self,
        map: &MapHandle,
        key: &[u8],
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError> {
        self.with_map(map, "bpf_map_update_elem", |m| {
            m.update(key, value, None, policy)
        })
    }

    fn update_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError> {
        self.with_map(map, "bpf_map_update_elem", |m| {
            m.update(key, value, Some(cpu), policy)
        })
    }

    fn delete_elem(&self, map: &MapHandle, key: &[u8]) -> Result<(), SysError> {
        self.with_map(map, "bpf_map_delete_elem", |m| m.delete(key))
    }

    fn get_next_key(
        &self,
        map: &MapHandle,
        key: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, SysError> {
        self.with_map(map, "bpf_map_get_next_key", |m| m.next_key(key))
    }

    fn push_elem(&self, map: &MapHandle, value: &[u8]) -> Result<(), SysError> {
        self.with_map(map, "bpf_map_push_elem", |m| m.push(value))
    }

    fn pop_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError> {
        self.with_map(map, "bpf_map_lookup_and_delete_elem", |m| m.pop(true))
    }

    fn peek_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError> {
        self.with_map(map, "bpf_map_lookup_elem", |m| m.pop(false))
    }

    fn destroy_map(&self, map: MapHandle) -> Result<(), SysError> {
        self.maps
            .lock()
            .remove(&map.as_raw())
            .map(|_| ())
            .ok_or_else(|| SysError::new("close", EBADF))
    }

    fn nr_cpus(&self) -> Result<usize, SysError> {
        Ok(self.nr_cpus)
    }

    fn current_cpu(&self) -> Result<u32, SysError> {
        if let Some(cpu) = *self.current_cpu.lock() {
            return Ok(cpu);
        }
        let cpu = util::current_cpu().map_err(|io_error| SysError::Syscall {
            call: "sched_getcpu".to_owned(),
            io_error,
        })?;
        Ok(cpu % self.nr_cpus as u32)
    }
}

/// How values are stored: `slots` values of `value_size` bytes back to back.
#[derive(Copy, Clone, Debug)]
struct Layout {
    per_cpu: bool,
    slots: usize,
    value_size: usize,
}

impl Layout {
    fn zeroed(&self) -> Box<[u8]> {
        vec![0; self.slots * self.value_size].into_boxed_slice()
    }

    /// Converts a stored value to the layout callers exchange with the driver.
    fn export(&self, stored: &[u8]) -> Vec<u8> {
        if !self.per_cpu {
            return stored.to_vec();
        }
        let stride = per_cpu_value_stride(self.value_size);
        let mut out = vec![0; self.slots * stride];
        for (slot, value) in stored.chunks_exact(self.value_size).enumerate() {
            out[slot * stride..slot * stride + self.value_size].copy_from_slice(value);
        }
        out
    }

    fn import(&self, value: &[u8]) -> Result<Box<[u8]>, Errno> {
        if !self.per_cpu {
            return if value.len() == self.value_size {
                Ok(value.into())
            } else {
                Err(EINVAL)
            };
        }
        let stride = per_cpu_value_stride(self.value_size);
        if value.len() != self.slots * stride {
            return Err(EINVAL);
        }
        Ok(value
            .chunks_exact(stride)
            .flat_map(|slot| &slot[..self.value_size])
            .copied()
            .collect())
    }

    fn slot<'a>(&self, stored: &'a [u8], cpu: u32) -> Result<&'a [u8], Errno> {
        let start = self.slot_start(cpu)?;
        Ok(&stored[start..start + self.value_size])
    }

    fn set_slot(&self, stored: &mut [u8], cpu: u32, value: &[u8]) -> Result<(), Errno> {
        let start = self.slot_start(cpu)?;
        stored[start..start + self.value_size].copy_from_slice(value);
        Ok(())
    }

    fn slot_start(&self, cpu: u32) -> Result<usize, Errno> {
        let cpu = cpu as usize;
        if !self.per_cpu || cpu >= self.slots {
            return Err(EINVAL);
        }
        Ok(cpu * self.value_size)
    }
}

#[derive(Debug)]
struct Entry {
    value: Box<[u8]>,
    last_used: u64,
}

#[derive(Debug)]
enum Storage {
    Hash(BTreeMap<Vec<u8>, Entry>),
    Array(Vec<Box<[u8]>>),
    // keyed by prefix length followed by the data masked to that prefix
    Trie(BTreeMap<Vec<u8>, Box<[u8]>>),
    Queue(VecDeque<Box<[u8]>>),
}

#[derive(Debug)]
struct MemoryMap {
    kind: MapKind,
    key_size: usize,
    max_entries: u32,
    layout: Layout,
    clock: u64,
    storage: Storage,
}

impl MemoryMap {
    fn new(def: &MapDescriptor, nr_cpus: usize) -> Self {
        let kind = def.kind();
        let layout = Layout {
            per_cpu: kind.is_per_cpu(),
            slots: if kind.is_per_cpu() { nr_cpus } else { 1 },
            value_size: def.value_size() as usize,
        };
        let storage = match kind {
            MapKind::Hash | MapKind::PerCpuHash | MapKind::LruHash | MapKind::LruPerCpuHash => {
                Storage::Hash(BTreeMap::new())
            }
            MapKind::Array | MapKind::PerCpuArray => Storage::Array(
                (0..def.max_entries())
                    .map(|_| layout.zeroed())
                    .collect(),
            ),
            MapKind::LpmTrie => Storage::Trie(BTreeMap::new()),
            MapKind::Queue => Storage::Queue(VecDeque::new()),
        };
        Self {
            kind,
            key_size: def.key_size() as usize,
            max_entries: def.max_entries(),
            layout,
            clock: 0,
            storage,
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<(), Errno> {
        if key.len() == self.key_size {
            Ok(())
        } else {
            Err(EINVAL)
        }
    }

    fn tick(clock: &mut u64) -> u64 {
        *clock += 1;
        *clock
    }

    // `touch` marks the entry as recently used in LRU maps.
    fn lookup(
        &mut self,
        key: &[u8],
        cpu: Option<u32>,
        touch: bool,
    ) -> Result<Option<Vec<u8>>, Errno> {
        self.check_key(key)?;
        let Self {
            kind,
            layout,
            clock,
            storage,
            ..
        } = self;
        let stored = match storage {
            Storage::Hash(entries) => match entries.get_mut(key) {
                Some(entry) => {
                    if touch && kind.is_lru() {
                        entry.last_used = Self::tick(clock);
                    }
                    &entry.value[..]
                }
                None => return Ok(None),
            },
            Storage::Array(slots) => match slots.get(array_index(key) as usize) {
                Some(value) => &value[..],
                None => return Ok(None),
            },
            Storage::Trie(entries) => match trie_longest_match(entries, key) {
                Some(value) => value,
                None => return Ok(None),
            },
            Storage::Queue(_) => return Err(EINVAL),
        };
        match cpu {
            Some(cpu) => Ok(Some(layout.slot(stored, cpu)?.to_vec())),
            None => Ok(Some(layout.export(stored))),
        }
    }

    fn update(
        &mut self,
        key: &[u8],
        value: &[u8],
        cpu: Option<u32>,
        policy: UpdatePolicy,
    ) -> Result<(), Errno> {
        self.check_key(key)?;
        let Self {
            kind,
            max_entries,
            layout,
            clock,
            storage,
            ..
        } = self;
        let max_entries = *max_entries as usize;

        // the new stored value, given the current one (if any)
        let build = |current: Option<&[u8]>| -> Result<Box<[u8]>, Errno> {
            match cpu {
                None => layout.import(value),
                Some(cpu) => {
                    if value.len() != layout.value_size {
                        return Err(EINVAL);
                    }
                    let mut stored = current.map_or_else(|| layout.zeroed(), Box::from);
                    layout.set_slot(&mut stored, cpu, value)?;
                    Ok(stored)
                }
            }
        };

        match storage {
            Storage::Hash(entries) => {
                let current = entries.get(key).map(|entry| &*entry.value);
                let exists = current.is_some();
                check_policy(policy, exists)?;
                let value = build(current)?;
                if !exists && entries.len() >= max_entries {
                    if !kind.is_lru() {
                        return Err(E2BIG);
                    }
                    let victim = entries
                        .iter()
                        .min_by_key(|(_, entry)| entry.last_used)
                        .map(|(key, _)| key.clone());
                    if let Some(victim) = victim {
                        entries.remove(&victim);
                    }
                }
                let last_used = Self::tick(clock);
                entries.insert(key.to_vec(), Entry { value, last_used });
            }
            Storage::Array(slots) => {
                let index = array_index(key) as usize;
                let current = slots.get(index).ok_or(E2BIG)?;
                if policy == UpdatePolicy::NoExist {
                    return Err(EEXIST);
                }
                let value = build(Some(current))?;
                slots[index] = value;
            }
            Storage::Trie(entries) => {
                let key = trie_key(key)?;
                let exists = entries.contains_key(&key);
                check_policy(policy, exists)?;
                let value = build(None)?;
                if !exists && entries.len() >= max_entries {
                    return Err(ENOSPC);
                }
                entries.insert(key, value);
            }
            Storage::Queue(_) => return Err(EINVAL),
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Errno> {
        self.check_key(key)?;
        let removed = match &mut self.storage {
            Storage::Hash(entries) => entries.remove(key).is_some(),
            Storage::Trie(entries) => entries.remove(&trie_key(key)?).is_some(),
            Storage::Array(_) | Storage::Queue(_) => return Err(EINVAL),
        };
        if removed {
            Ok(())
        } else {
            Err(ENOENT)
        }
    }

    fn next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>, Errno> {
        if let Some(key) = key {
            self.check_key(key)?;
        }
        let next = match &self.storage {
            Storage::Hash(entries) => next_in(entries, key),
            Storage::Trie(entries) => next_in(entries, key),
            Storage::Array(_) => {
                let next = match key.map(array_index) {
                    None => 0,
                    Some(index) if index >= self.max_entries => 0,
                    Some(index) => index + 1,
                };
                (next < self.max_entries).then(|| next.to_ne_bytes().to_vec())
            }
            Storage::Queue(_) => return Err(EINVAL),
        };
        Ok(next)
    }

    fn push(&mut self, value: &[u8]) -> Result<(), Errno> {
        let Storage::Queue(queue) = &mut self.storage else {
            return Err(EINVAL);
        };
        if value.len() != self.layout.value_size {
            return Err(EINVAL);
        }
        if queue.len() >= self.max_entries as usize {
            return Err(E2BIG);
        }
        queue.push_back(value.into());
        Ok(())
    }

    fn pop(&mut self, remove: bool) -> Result<Option<Vec<u8>>, Errno> {
        let Storage::Queue(queue) = &mut self.storage else {
            return Err(EINVAL);
        };
        Ok(if remove {
            queue.pop_front().map(Vec::from)
        } else {
            queue.front().map(|value| value.to_vec())
        })
    }
}

fn check_policy(policy: UpdatePolicy, exists: bool) -> Result<(), Errno> {
    match (policy, exists) {
        (UpdatePolicy::NoExist, true) => Err(EEXIST),
        (UpdatePolicy::Exist, false) => Err(ENOENT),
        _ => Ok(()),
    }
}

fn next_in<V>(entries: &BTreeMap<Vec<u8>, V>, key: Option<&[u8]>) -> Option<Vec<u8>> {
    use std::ops::Bound::{Excluded, Unbounded};

    match key {
        None => entries.keys().next().cloned(),
        Some(key) => entries
            .range::<[u8], _>((Excluded(key), Unbounded))
            .next()
            .map(|(key, _)| key.clone()),
    }
}

fn array_index(key: &[u8]) -> u32 {
    let mut index = [0; mem::size_of::<u32>()];
    index.copy_from_slice(&key[..mem::size_of::<u32>()]);
    u32::from_ne_bytes(index)
}

fn split_trie_key(key: &[u8]) -> (u32, &[u8]) {
    let (prefix_len, data) = key.split_at(mem::size_of::<u32>());
    (array_index(prefix_len), data)
}

/// Normalizes a trie key so that keys naming the same prefix compare equal.
fn trie_key(key: &[u8]) -> Result<Vec<u8>, Errno> {
    let (prefix_len, data) = split_trie_key(key);
    if prefix_len as usize > data.len() * 8 {
        return Err(EINVAL);
    }
    let mut normalized = key.to_vec();
    mask_prefix(&mut normalized[mem::size_of::<u32>()..], prefix_len);
    Ok(normalized)
}

fn mask_prefix(data: &mut [u8], prefix_len: u32) {
    let full = (prefix_len / 8) as usize;
    let rem = prefix_len % 8;
    if full >= data.len() {
        return;
    }
    let mut zero_from = full;
    if rem != 0 {
        data[full] &= 0xff << (8 - rem);
        zero_from += 1;
    }
    data[zero_from..].fill(0);
}

fn prefix_matches(a: &[u8], b: &[u8], prefix_len: u32) -> bool {
    let full = (prefix_len / 8) as usize;
    let rem = prefix_len % 8;
    if a[..full] != b[..full] {
        return false;
    }
    if rem == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rem);
    a[full] & mask == b[full] & mask
}

fn trie_longest_match<'a>(
    entries: &'a BTreeMap<Vec<u8>, Box<[u8]>>,
    key: &[u8],
) -> Option<&'a [u8]> {
    let (max_prefix_len, data) = split_trie_key(key);
    let max_prefix_len = max_prefix_len.min(data.len() as u32 * 8);
    entries
        .iter()
        .filter_map(|(entry_key, value)| {
            let (prefix_len, entry_data) = split_trie_key(entry_key);
            (prefix_len <= max_prefix_len && prefix_matches(entry_data, data, prefix_len))
                .then_some((prefix_len, &**value))
        })
        .max_by_key(|(prefix_len, _)| *prefix_len)
        .map(|(_, value)| value)
}
