use hashbrown::HashMap;
use parking_lot::Mutex;

use super::{MapDriver, MapHandle, MemoryDriver, UpdatePolicy};
use crate::{errors::SysError, maps::MapDescriptor};

/// A [`MemoryDriver`] whose calls can be made to fail with a given errno.
#[derive(Debug)]
pub(crate) struct FakeDriver {
    inner: MemoryDriver,
    failures: Mutex<HashMap<&'static str, i32>>,
}

impl FakeDriver {
    pub(crate) fn new(nr_cpus: usize) -> Self {
        Self {
            inner: MemoryDriver::new(nr_cpus),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Makes every later `call` fail with `errno`.
    pub(crate) fn override_call(&self, call: &'static str, errno: i32) {
        self.failures.lock().insert(call, errno);
    }

    pub(crate) fn map_count(&self) -> usize {
        self.inner.map_count()
    }

    fn check(&self, call: &'static str) -> Result<(), SysError> {
        match self.failures.lock().get(call) {
            Some(errno) => Err(SysError::new(call, *errno)),
            None => Ok(()),
        }
    }
}

impl MapDriver for FakeDriver {
    fn create_map(&self, def: &MapDescriptor) -> Result<MapHandle, SysError> {
        self.check("bpf_map_create")?;
        self.inner.create_map(def)
    }

    fn lookup_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError> {
        self.check("bpf_map_lookup_elem")?;
        self.inner.lookup_elem(map, key)
    }

    fn read_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError> {
        self.check("bpf_map_lookup_elem")?;
        self.inner.read_elem(map, key)
    }

    fn lookup_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
    ) -> Result<Option<Vec<u8>>, SysError> {
        self.check("bpf_map_lookup_elem")?;
        self.inner.lookup_elem_cpu(map, key, cpu)
    }

    fn update_elem(
        &self,
        map: &MapHandle,
        key: &[u8],
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError> {
        self.check("bpf_map_update_elem")?;
        self.inner.update_elem(map, key, value, policy)
    }

    fn update_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError> {
        self.check("bpf_map_update_elem")?;
        self.inner.update_elem_cpu(map, key, cpu, value, policy)
    }

    fn delete_elem(&self, map: &MapHandle, key: &[u8]) -> Result<(), SysError> {
        self.check("bpf_map_delete_elem")?;
        self.inner.delete_elem(map, key)
    }

    fn get_next_key(
        &self,
        map: &MapHandle,
        key: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, SysError> {
        self.check("bpf_map_get_next_key")?;
        self.inner.get_next_key(map, key)
    }

    fn push_elem(&self, map: &MapHandle, value: &[u8]) -> Result<(), SysError> {
        self.check("bpf_map_push_elem")?;
        self.inner.push_elem(map, value)
    }

    fn pop_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError> {
        self.check("bpf_map_lookup_and_delete_elem")?;
        self.inner.pop_elem(map)
    }

    fn peek_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError> {
        self.check("bpf_map_lookup_elem")?;
        self.inner.peek_elem(map)
    }

    fn destroy_map(&self, map: MapHandle) -> Result<(), SysError> {
        self.check("close")?;
        self.inner.destroy_map(map)
    }

    fn nr_cpus(&self) -> Result<usize, SysError> {
        self.inner.nr_cpus()
    }

    fn current_cpu(&self) -> Result<u32, SysError> {
        self.inner.current_cpu()
    }
}
