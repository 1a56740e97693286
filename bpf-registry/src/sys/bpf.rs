use std::{
    cmp, io, mem,
    os::fd::RawFd,
    ptr,
};

use hashbrown::HashMap;
use libc::{c_long, SYS_bpf, ENOENT};
use log::debug;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use super::{per_cpu_value_stride, MapDriver, MapHandle, UpdatePolicy};
use crate::{
    errors::SysError,
    maps::{MapDescriptor, MapKind},
    util,
};

const BPF_OBJ_NAME_LEN: usize = 16;

#[repr(u32)]
#[derive(Copy, Clone, Debug)]
enum BpfCmd {
    MapCreate = 0,
    MapLookupElem = 1,
    MapUpdateElem = 2,
    MapDeleteElem = 3,
    MapGetNextKey = 4,
    MapLookupAndDeleteElem = 21,
}

// The leading members of `union bpf_attr` used by `BPF_MAP_CREATE`.
#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
}

// The leading members of `union bpf_attr` used by the element commands.
// `value` doubles as `next_key` for `BPF_MAP_GET_NEXT_KEY`.
#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[derive(Copy, Clone, Debug)]
struct MapLayout {
    kind: MapKind,
    key_size: usize,
    value_size: usize,
}

/// A [`MapDriver`] creating real kernel maps through the `bpf(2)` system call.
///
/// Creating maps usually requires `CAP_BPF` (or `CAP_SYS_ADMIN` on older
/// kernels). Handles are the maps' file descriptors.
///
/// Single-CPU updates of per-CPU maps are implemented as a lookup of every
/// CPU's value followed by an update, which is not atomic.
#[derive(Debug, Default)]
pub struct SyscallDriver {
    nr_cpus: OnceCell<usize>,
    maps: RwLock<HashMap<RawFd, MapLayout>>,
}

impl SyscallDriver {
    /// Creates a new driver.
    pub fn new() -> Self {
        Self::default()
    }

    fn layout(&self, map: &MapHandle, call: &'static str) -> Result<(RawFd, MapLayout), SysError> {
        let fd = map.as_raw() as RawFd;
        self.maps
            .read()
            .get(&fd)
            .map(|layout| (fd, *layout))
            .ok_or_else(|| SysError::new(call, libc::EBADF))
    }

    fn value_buf_len(&self, layout: &MapLayout) -> Result<usize, SysError> {
        if layout.kind.is_per_cpu() {
            Ok(self.nr_cpus()? * per_cpu_value_stride(layout.value_size))
        } else {
            Ok(layout.value_size)
        }
    }

    fn slot(&self, layout: &MapLayout, cpu: u32) -> Result<std::ops::Range<usize>, SysError> {
        if !layout.kind.is_per_cpu() || cpu as usize >= self.nr_cpus()? {
            return Err(SysError::new("bpf_map_lookup_elem", libc::EINVAL));
        }
        let start = cpu as usize * per_cpu_value_stride(layout.value_size);
        Ok(start..start + layout.value_size)
    }
}

impl MapDriver for SyscallDriver {
    fn create_map(&self, def: &MapDescriptor) -> Result<MapHandle, SysError> {
        let mut attr = MapCreateAttr {
            map_type: def.kind().map_type(),
            key_size: def.key_size(),
            value_size: def.value_size(),
            max_entries: def.max_entries(),
            map_flags: def.flags().bits(),
            ..Default::default()
        };
        // map_name is 16 bytes max and must be NUL terminated
        let name = def.name().as_bytes();
        let name_len = cmp::min(name.len(), BPF_OBJ_NAME_LEN - 1);
        attr.map_name[..name_len].copy_from_slice(&name[..name_len]);

        let fd = sys_bpf(BpfCmd::MapCreate, &attr).map_err(|io_error| SysError::Syscall {
            call: "bpf_map_create".to_owned(),
            io_error,
        })? as RawFd;
        debug!("created map `{}` with fd {fd}", def.name());

        self.maps.write().insert(
            fd,
            MapLayout {
                kind: def.kind(),
                key_size: def.key_size() as usize,
                value_size: def.value_size() as usize,
            },
        );
        Ok(MapHandle::from_raw(fd as u32))
    }

    fn lookup_elem(&self, map: &MapHandle, key: &[u8]) -> Result<Option<Vec<u8>>, SysError> {
        let (fd, layout) = self.layout(map, "bpf_map_lookup_elem")?;
        let mut value = vec![0; self.value_buf_len(&layout)?];
        let found = lookup(fd, Some(key), &mut value, BpfCmd::MapLookupElem)
            .map_err(|io_error| syscall_error("bpf_map_lookup_elem", io_error))?;
        Ok(found.then_some(value))
    }

    fn lookup_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
    ) -> Result<Option<Vec<u8>>, SysError> {
        let (_, layout) = self.layout(map, "bpf_map_lookup_elem")?;
        let slot = self.slot(&layout, cpu)?;
        Ok(self
            .lookup_elem(map, key)?
            .map(|values| values[slot].to_vec()))
    }

    fn update_elem(
        &self,
        map: &MapHandle,
        key: &[u8],
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError> {
        let (fd, _) = self.layout(map, "bpf_map_update_elem")?;
        let attr = MapElemAttr {
            map_fd: fd as u32,
            key: key.as_ptr() as u64,
            value: value.as_ptr() as u64,
            flags: policy.flags(),
            ..Default::default()
        };
        sys_bpf(BpfCmd::MapUpdateElem, &attr)
            .map(|_| ())
            .map_err(|io_error| syscall_error("bpf_map_update_elem", io_error))
    }

    fn update_elem_cpu(
        &self,
        map: &MapHandle,
        key: &[u8],
        cpu: u32,
        value: &[u8],
        policy: UpdatePolicy,
    ) -> Result<(), SysError> {
        let (_, layout) = self.layout(map, "bpf_map_update_elem")?;
        let slot = self.slot(&layout, cpu)?;
        if value.len() != slot.len() {
            return Err(SysError::new("bpf_map_update_elem", libc::EINVAL));
        }
        let mut values = match self.lookup_elem(map, key)? {
            Some(values) => values,
            None => vec![0; self.value_buf_len(&layout)?],
        };
        values[slot].copy_from_slice(value);
        self.update_elem(map, key, &values, policy)
    }

    fn delete_elem(&self, map: &MapHandle, key: &[u8]) -> Result<(), SysError> {
        let (fd, _) = self.layout(map, "bpf_map_delete_elem")?;
        let attr = MapElemAttr {
            map_fd: fd as u32,
            key: key.as_ptr() as u64,
            ..Default::default()
        };
        sys_bpf(BpfCmd::MapDeleteElem, &attr)
            .map(|_| ())
            .map_err(|io_error| syscall_error("bpf_map_delete_elem", io_error))
    }

    fn get_next_key(
        &self,
        map: &MapHandle,
        key: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, SysError> {
        let (fd, layout) = self.layout(map, "bpf_map_get_next_key")?;
        let mut next_key = vec![0; layout.key_size];
        let found = lookup(fd, key, &mut next_key, BpfCmd::MapGetNextKey)
            .map_err(|io_error| syscall_error("bpf_map_get_next_key", io_error))?;
        Ok(found.then_some(next_key))
    }

    fn push_elem(&self, map: &MapHandle, value: &[u8]) -> Result<(), SysError> {
        let (fd, _) = self.layout(map, "bpf_map_push_elem")?;
        let attr = MapElemAttr {
            map_fd: fd as u32,
            value: value.as_ptr() as u64,
            ..Default::default()
        };
        sys_bpf(BpfCmd::MapUpdateElem, &attr)
            .map(|_| ())
            .map_err(|io_error| syscall_error("bpf_map_push_elem", io_error))
    }

    fn pop_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError> {
        let (fd, layout) = self.layout(map, "bpf_map_lookup_and_delete_elem")?;
        let mut value = vec![0; layout.value_size];
        let found = lookup(fd, None, &mut value, BpfCmd::MapLookupAndDeleteElem)
            .map_err(|io_error| syscall_error("bpf_map_lookup_and_delete_elem", io_error))?;
        Ok(found.then_some(value))
    }

    fn peek_elem(&self, map: &MapHandle) -> Result<Option<Vec<u8>>, SysError> {
        let (fd, layout) = self.layout(map, "bpf_map_lookup_elem")?;
        let mut value = vec![0; layout.value_size];
        let found = lookup(fd, None, &mut value, BpfCmd::MapLookupElem)
            .map_err(|io_error| syscall_error("bpf_map_lookup_elem", io_error))?;
        Ok(found.then_some(value))
    }

    fn destroy_map(&self, map: MapHandle) -> Result<(), SysError> {
        let (fd, _) = self.layout(&map, "close")?;
        self.maps.write().remove(&fd);
        // SAFETY: the fd was created by `create_map` and its only handle is consumed here.
        if unsafe { libc::close(fd) } < 0 {
            return Err(syscall_error("close", io::Error::last_os_error()));
        }
        Ok(())
    }

    fn nr_cpus(&self) -> Result<usize, SysError> {
        self.nr_cpus
            .get_or_try_init(util::nr_cpus)
            .copied()
            .map_err(|io_error| syscall_error("nr_cpus", io_error))
    }

    fn current_cpu(&self) -> Result<u32, SysError> {
        util::current_cpu().map_err(|io_error| syscall_error("sched_getcpu", io_error))
    }
}

fn syscall_error(call: &str, io_error: io::Error) -> SysError {
    SysError::Syscall {
        call: call.to_owned(),
        io_error,
    }
}

/// Runs a command that writes its result to `out`. Returns `Ok(false)` on `ENOENT`.
fn lookup(fd: RawFd, key: Option<&[u8]>, out: &mut [u8], cmd: BpfCmd) -> Result<bool, io::Error> {
    let attr = MapElemAttr {
        map_fd: fd as u32,
        key: key.map_or(0, |key| key.as_ptr() as u64),
        value: out.as_mut_ptr() as u64,
        ..Default::default()
    };
    match sys_bpf(cmd, &attr) {
        Ok(_) => Ok(true),
        Err(io_error) if io_error.raw_os_error() == Some(ENOENT) => Ok(false),
        Err(io_error) => Err(io_error),
    }
}

fn sys_bpf<T>(cmd: BpfCmd, attr: &T) -> Result<c_long, io::Error> {
    // SAFETY: `attr` is a prefix of `union bpf_attr`; the kernel zero-extends
    // attributes shorter than its own definition.
    let ret = unsafe {
        libc::syscall(
            SYS_bpf,
            cmd as u32,
            ptr::from_ref(attr),
            mem::size_of::<T>() as u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}
