//! A FIFO queue.
use std::{borrow::Borrow, marker::PhantomData};

use crate::{
    bytes_of,
    maps::{check_kv_size, value_from_bytes, MapData, MapError},
    Pod,
};

/// A FIFO queue.
///
/// # Examples
/// ```
/// use bpf_registry::{
///     maps::{MapDescriptor, Queue},
///     sys::MemoryDriver,
///     MapRegistry,
/// };
///
/// let registry = MapRegistry::new(MemoryDriver::new(1));
/// let mut queue = Queue::<_, u32>::try_from(registry.create(MapDescriptor::queue::<u32>("QUEUE", 8))?)?;
/// queue.push(42)?;
/// queue.push(43)?;
/// assert_eq!(queue.pop()?, Some(42));
/// assert_eq!(queue.peek()?, Some(43));
/// # Ok::<(), bpf_registry::MapError>(())
/// ```
#[doc(alias = "BPF_MAP_TYPE_QUEUE")]
#[derive(Debug)]
pub struct Queue<T, V: Pod> {
    pub(crate) inner: T,
    _v: PhantomData<V>,
}

impl<T: Borrow<MapData>, V: Pod> Queue<T, V> {
    pub(crate) fn new(map: T) -> Result<Self, MapError> {
        let data = map.borrow();
        check_kv_size::<(), V>(data)?;

        Ok(Self {
            inner: map,
            _v: PhantomData,
        })
    }

    /// Returns the number of elements the queue can hold.
    ///
    /// This corresponds to the value of `max_entries` in the descriptor.
    pub fn capacity(&self) -> u32 {
        self.inner.borrow().descriptor().max_entries()
    }

    /// Removes the first element and returns it, or `None` if the queue is
    /// empty.
    ///
    /// # Errors
    ///
    /// [`MapError::Driver`] if the driver fails.
    pub fn pop(&mut self) -> Result<Option<V>, MapError> {
        self.inner
            .borrow()
            .pop()?
            .map(|value| value_from_bytes(&value))
            .transpose()
    }

    /// Returns the first element without removing it.
    pub fn peek(&self) -> Result<Option<V>, MapError> {
        self.inner
            .borrow()
            .peek()?
            .map(|value| value_from_bytes(&value))
            .transpose()
    }

    /// Appends an element at the end of the queue.
    ///
    /// # Errors
    ///
    /// [`MapError::CapacityExceeded`] if the queue is full, [`MapError::Driver`]
    /// if the driver fails.
    pub fn push(&mut self, value: impl Borrow<V>) -> Result<(), MapError> {
        self.inner.borrow().push(bytes_of(value.borrow()))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use libc::EFAULT;

    use super::*;
    use crate::{
        errors::LayoutPart,
        maps::{
            test_utils::{new_fake_map, new_map},
            MapDescriptor, MapKind,
        },
    };

    #[test]
    fn test_wrong_value_size() {
        let map = new_map(MapDescriptor::queue::<u32>("TEST", 2));
        assert_matches!(
            Queue::<_, u16>::try_from(&map),
            Err(MapError::LayoutMismatch {
                part: LayoutPart::Value,
                size: 2,
                expected: 4
            })
        );
    }

    #[test]
    fn test_fifo_order_and_capacity() {
        let map = new_map(MapDescriptor::queue::<u32>("TEST", 2));
        let mut queue = Queue::<_, u32>::try_from(&map).unwrap();
        assert_eq!(queue.capacity(), 2);

        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_matches!(
            queue.push(3),
            Err(MapError::CapacityExceeded { name, max_entries: 2 }) if name == "TEST"
        );

        assert_eq!(queue.peek().unwrap(), Some(1));
        assert_eq!(queue.pop().unwrap(), Some(1));
        assert_eq!(queue.pop().unwrap(), Some(2));
        assert_eq!(queue.pop().unwrap(), None);
        assert_eq!(queue.peek().unwrap(), None);
    }

    #[test]
    fn test_keyed_operations_unsupported() {
        let map = new_map(MapDescriptor::queue::<u32>("TEST", 2));
        assert_matches!(
            map.data().lookup(&[]),
            Err(MapError::UnsupportedOperation {
                kind: MapKind::Queue,
                operation: "lookup"
            })
        );
    }

    #[test]
    fn test_push_syscall_error() {
        let (map, driver) = new_fake_map(MapDescriptor::queue::<u32>("TEST", 2));
        driver.override_call("bpf_map_push_elem", EFAULT);
        let mut queue = Queue::<_, u32>::try_from(&map).unwrap();
        assert_matches!(
            queue.push(1),
            Err(MapError::Driver(e)) if e.raw_os_error() == Some(EFAULT)
        );
    }
}
