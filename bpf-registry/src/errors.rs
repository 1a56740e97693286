//! Error types.

use std::{error::Error, fmt, io};

use thiserror::Error;

use crate::maps::MapKind;

/// Errors from operations on maps and on the registry.
#[derive(Error, Debug)]
pub enum MapError {
    /// The descriptor failed validation.
    #[error("invalid descriptor for map `{name}`: {reason}")]
    InvalidDescriptor {
        /// The map name
        name: String,
        /// What is wrong with the descriptor
        #[source]
        reason: DescriptorError,
    },

    /// A map with the same name is already registered.
    #[error("a map named `{name}` is already registered")]
    DuplicateName {
        /// The map name
        name: String,
    },

    /// A key or value does not have the size the descriptor declares.
    #[error("invalid {part} size {size}, expected {expected}")]
    LayoutMismatch {
        /// Which part of the entry is wrong
        part: LayoutPart,
        /// Size encountered
        size: usize,
        /// Size expected
        expected: usize,
    },

    /// Index is out of bounds
    #[error("the index is {index} but `max_entries` is {max_entries}")]
    OutOfRange {
        /// Index accessed
        index: u32,
        /// Map size
        max_entries: u32,
    },

    /// The prefix length of a trie key is longer than its data.
    #[error("prefix length {prefix_len} exceeds the {max_prefix_len} bits of key data")]
    PrefixLengthOutOfRange {
        /// Prefix length requested
        prefix_len: u32,
        /// Number of bits in the key data
        max_prefix_len: u32,
    },

    /// A per-CPU slot was addressed on a CPU that does not exist.
    #[error("cpu {cpu} is out of range, the map has {nr_cpus} slots per entry")]
    CpuOutOfRange {
        /// CPU requested
        cpu: u32,
        /// Number of possible CPUs
        nr_cpus: usize,
    },

    /// The map is full.
    #[error("map `{name}` is full (`max_entries` is {max_entries})")]
    CapacityExceeded {
        /// The map name
        name: String,
        /// Map size
        max_entries: u32,
    },

    /// The operation is not defined for this kind of map.
    #[error("{operation} is not supported by {kind:?} maps")]
    UnsupportedOperation {
        /// The map kind
        kind: MapKind,
        /// The operation attempted
        operation: &'static str,
    },

    /// Invalid map type encountered
    #[error("invalid map type {map_type}")]
    InvalidMapType {
        /// The map type
        map_type: u32,
    },

    /// Key not found
    #[error("key not found")]
    KeyNotFound,

    /// The map is still referenced and can't be released.
    #[error("map `{name}` is still in use")]
    MapInUse {
        /// The map name
        name: String,
    },

    /// The driver failed.
    #[error(transparent)]
    Driver(#[from] SysError),
}

/// The part of a map entry a [`MapError::LayoutMismatch`] refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayoutPart {
    /// The key.
    Key,
    /// The value.
    Value,
    /// The number of per-CPU values.
    PerCpuValues,
}

impl fmt::Display for LayoutPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Key => "key",
            Self::Value => "value",
            Self::PerCpuValues => "per-cpu value count",
        })
    }
}

/// Reasons a [`MapDescriptor`](crate::maps::MapDescriptor) is rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DescriptorError {
    /// The map name is empty or contains a NUL byte.
    #[error("invalid map name")]
    InvalidName,

    /// `max_entries` is zero.
    #[error("`max_entries` must be greater than zero")]
    ZeroMaxEntries,

    /// The value size is zero.
    #[error("value size must be greater than zero")]
    ZeroValueSize,

    /// The key layout is not allowed for the map kind.
    #[error("key layout {key} is not valid for {kind:?} maps")]
    InvalidKeyLayout {
        /// The map kind
        kind: MapKind,
        /// The rejected layout
        key: String,
    },

    /// A flag is not allowed for the map kind.
    #[error("flag {flag} is not valid for {kind:?} maps")]
    InvalidFlag {
        /// The map kind
        kind: MapKind,
        /// The rejected flag
        flag: String,
    },

    /// A flag the map kind requires is missing.
    #[error("{kind:?} maps require the {flag} flag")]
    MissingFlag {
        /// The map kind
        kind: MapKind,
        /// The required flag
        flag: &'static str,
    },
}

/// Errors from the map driver.
#[derive(Debug, Error)]
pub enum SysError {
    /// A driver call failed.
    #[error("{call} failed")]
    Syscall {
        /// The name of the call which failed.
        call: String,
        /// The [`io::Error`] returned by the call.
        #[source]
        io_error: io::Error,
    },
    /// An irrecoverable error occurred.
    #[error(transparent)]
    Other(#[from] Box<dyn Error + Send + Sync>),
}

impl SysError {
    pub(crate) fn new(call: impl Into<String>, errno: i32) -> Self {
        Self::Syscall {
            call: call.into(),
            io_error: io::Error::from_raw_os_error(errno),
        }
    }

    /// Returns the OS error number carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Syscall { io_error, .. } => io_error.raw_os_error(),
            Self::Other(_) => None,
        }
    }
}

/// The error returned by [`MapRegistry::shutdown`](crate::MapRegistry::shutdown).
///
/// Holds every map that failed to release, not just the first one.
#[derive(Debug, Error)]
#[error("failed to release {} map(s): {}", .failures.len(), names(.failures))]
pub struct ShutdownError {
    /// The name of each map that failed to release along with the reason.
    pub failures: Vec<(String, MapError)>,
}

fn names(failures: &[(String, MapError)]) -> String {
    failures
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_error_lists_every_map() {
        let err = ShutdownError {
            failures: vec![
                ("a".to_owned(), MapError::MapInUse { name: "a".to_owned() }),
                ("b".to_owned(), SysError::new("close", libc::EBADF).into()),
            ],
        };
        assert_eq!(err.to_string(), "failed to release 2 map(s): a, b");
    }

    #[test]
    fn test_sys_error_errno() {
        assert_eq!(
            SysError::new("bpf_map_update_elem", libc::E2BIG).raw_os_error(),
            Some(libc::E2BIG)
        );
    }
}
