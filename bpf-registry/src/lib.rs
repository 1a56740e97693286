//! A typed registry and access layer for eBPF maps.
//!
//! eBPF programs share state with user space through maps. This crate sits
//! between a low level map driver (the `bpf(2)` system call, or an in-process
//! emulation of it) and the code that wants to use those maps. It provides:
//!
//! * [`MapDescriptor`](crate::maps::MapDescriptor), an immutable description of
//!   a map's kind, key and value layout, capacity and creation flags.
//! * Typed map handles - [`HashMap`](crate::maps::HashMap),
//!   [`PerCpuHashMap`](crate::maps::PerCpuHashMap), [`Array`](crate::maps::Array),
//!   [`PerCpuArray`](crate::maps::PerCpuArray), [`LpmTrie`](crate::maps::LpmTrie)
//!   and [`Queue`](crate::maps::Queue) - that check layouts and translate each
//!   kind's semantics into a uniform key/value interface.
//! * [`MapRegistry`], a catalog from map names to live maps which owns their
//!   lifecycle.
//!
//! Eight map kinds are supported: hash, per-CPU hash, LRU hash, per-CPU LRU
//! hash, array, per-CPU array, longest prefix match trie and queue.
//!
//! # Example
//!
//! ```
//! use bpf_registry::{
//!     maps::{HashMap, MapDescriptor, UpdatePolicy},
//!     sys::MemoryDriver,
//!     MapRegistry,
//! };
//!
//! let registry = MapRegistry::new(MemoryDriver::new(4));
//! let map = registry.create(MapDescriptor::hash::<u32, u32>("ports", 16))?;
//!
//! let mut ports = HashMap::<_, u32, u32>::try_from(&*map)?;
//! ports.update(80, 8080, UpdatePolicy::Any)?;
//! assert_eq!(ports.lookup(&80)?, Some(8080));
//!
//! drop(map);
//! registry.shutdown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
#![deny(clippy::all)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod catalog;
pub mod errors;
pub mod maps;
mod registry;
pub mod sys;
pub mod util;

use std::{mem, slice};

pub use errors::{MapError, ShutdownError, SysError};
pub use registry::{MapRegistry, RegistryBuilder};

/// Marker trait for types that can safely be converted to and from byte slices.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or a primitive), contain no pointers and
/// be valid for every bit pattern.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! unsafe_impl_pod {
    ($($struct_name:ident),+ $(,)?) => {
        $(
            unsafe impl Pod for $struct_name { }
        )+
    }
}

unsafe_impl_pod!(i8, u8, i16, u16, i32, u32, i64, u64, u128, i128);

// It only makes sense that an array of POD types is itself POD
unsafe impl<T: Pod, const N: usize> Pod for [T; N] {}

// Maps without keys (queues) use `()` as their key type.
unsafe impl Pod for () {}

pub(crate) fn bytes_of<T: Pod>(value: &T) -> &[u8] {
    // SAFETY: T is Pod so every byte of it may be read.
    unsafe { slice::from_raw_parts((value as *const T).cast::<u8>(), mem::size_of::<T>()) }
}

/// Reads a `T` from the start of `bytes`. Returns `None` if `bytes` is too short.
pub(crate) fn from_bytes<T: Pod>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }
    // SAFETY: the length was checked above and T is valid for any bit pattern.
    Some(unsafe { bytes.as_ptr().cast::<T>().read_unaligned() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_bytes() {
        let value = 0x0102_0304u32;
        assert_eq!(bytes_of(&value), &value.to_ne_bytes());
        assert_eq!(from_bytes::<u32>(&value.to_ne_bytes()), Some(value));
        assert_eq!(from_bytes::<u32>(&[1, 2]), None);
        assert_eq!(bytes_of(&()).len(), 0);
    }
}
