use std::{borrow::Borrow, marker::PhantomData};

use crate::{
    bytes_of,
    maps::{
        check_bounds, check_kv_size, value_from_bytes, IterableMap, MapData, MapError,
        UpdatePolicy,
    },
    Pod,
};

/// A fixed-size array.
///
/// The size of the array is the `max_entries` of its descriptor. All the
/// entries are zero-initialized when the map is created and can't be
/// deleted.
///
/// # Examples
/// ```
/// use bpf_registry::{
///     maps::{Array, MapDescriptor, UpdatePolicy},
///     sys::MemoryDriver,
///     MapRegistry,
/// };
///
/// let registry = MapRegistry::new(MemoryDriver::new(1));
/// let mut array = Array::<_, u32>::try_from(registry.create(MapDescriptor::array::<u32>("ARRAY", 4))?)?;
/// array.update(1, 42, UpdatePolicy::Any)?;
/// assert_eq!(array.lookup(1)?, 42);
/// assert_eq!(array.lookup(2)?, 0);
/// # Ok::<(), bpf_registry::MapError>(())
/// ```
#[doc(alias = "BPF_MAP_TYPE_ARRAY")]
#[derive(Debug)]
pub struct Array<T, V: Pod> {
    pub(crate) inner: T,
    _v: PhantomData<V>,
}

#[allow(clippy::len_without_is_empty)]
impl<T: Borrow<MapData>, V: Pod> Array<T, V> {
    pub(crate) fn new(map: T) -> Result<Self, MapError> {
        let data = map.borrow();
        check_kv_size::<u32, V>(data)?;

        Ok(Self {
            inner: map,
            _v: PhantomData,
        })
    }

    /// Returns the number of elements in the array.
    ///
    /// This corresponds to the value of `max_entries` in the descriptor.
    pub fn len(&self) -> u32 {
        self.inner.borrow().descriptor().max_entries()
    }

    /// Returns the value stored at the given index.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::OutOfRange`] if `index` is out of bounds, [`MapError::Driver`]
    /// if the driver fails.
    pub fn lookup(&self, index: u32) -> Result<V, MapError> {
        let data = self.inner.borrow();
        check_bounds(data, index)?;
        let value = data.lookup(bytes_of(&index))?;
        value_from_bytes(&value.ok_or(MapError::KeyNotFound)?)
    }

    /// An iterator over the elements of the array. The iterator item type is
    /// `Result<(u32, V), MapError>`.
    pub fn iter(&self) -> impl Iterator<Item = Result<(u32, V), MapError>> + '_ {
        (0..self.len()).map(move |i| Ok((i, self.lookup(i)?)))
    }

    /// Sets the value of the element at the given index.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::OutOfRange`] if `index` is out of bounds, [`MapError::Driver`]
    /// if the driver fails. Every element always exists, so
    /// [`UpdatePolicy::NoExist`] always fails.
    pub fn update(
        &mut self,
        index: u32,
        value: impl Borrow<V>,
        policy: UpdatePolicy,
    ) -> Result<(), MapError> {
        let data = self.inner.borrow();
        check_bounds(data, index)?;
        data.update(bytes_of(&index), bytes_of(value.borrow()), policy)
    }

    /// Array elements can't be deleted: this always fails with
    /// [`MapError::UnsupportedOperation`].
    pub fn delete(&mut self, index: u32) -> Result<bool, MapError> {
        self.inner.borrow().delete(bytes_of(&index))
    }
}

impl<T: Borrow<MapData>, V: Pod> IterableMap<u32, V> for Array<T, V> {
    fn map(&self) -> &MapData {
        self.inner.borrow()
    }

    fn get(&self, index: &u32) -> Result<V, MapError> {
        self.lookup(*index)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use libc::{EEXIST, EFAULT};

    use super::*;
    use crate::{
        errors::{LayoutPart, SysError},
        maps::{
            test_utils::{new_fake_map, new_map},
            MapDescriptor, MapKind,
        },
    };

    #[test]
    fn test_wrong_value_size() {
        let map = new_map(MapDescriptor::array::<u32>("TEST", 10));
        assert_matches!(
            Array::<_, u64>::try_from(&map),
            Err(MapError::LayoutMismatch {
                part: LayoutPart::Value,
                size: 8,
                expected: 4
            })
        );
    }

    #[test]
    fn test_try_from_wrong_map() {
        let map = new_map(MapDescriptor::per_cpu_array::<u32>("TEST", 10));
        assert_matches!(
            Array::<_, u32>::try_from(&map),
            Err(MapError::InvalidMapType { map_type: 6 })
        );
    }

    #[test]
    fn test_zero_initialized() {
        let map = new_map(MapDescriptor::array::<u64>("TEST", 10));
        let array = Array::<_, u64>::try_from(&map).unwrap();
        assert_eq!(array.len(), 10);
        for i in 0..10 {
            assert_eq!(array.lookup(i).unwrap(), 0);
        }
    }

    #[test]
    fn test_out_of_range() {
        let map = new_map(MapDescriptor::array::<u32>("TEST", 10));
        let mut array = Array::<_, u32>::try_from(&map).unwrap();
        assert_matches!(
            array.lookup(10),
            Err(MapError::OutOfRange {
                index: 10,
                max_entries: 10
            })
        );
        assert_matches!(
            array.update(u32::MAX, 1, UpdatePolicy::Any),
            Err(MapError::OutOfRange { .. })
        );
    }

    #[test]
    fn test_update_lookup() {
        let map = new_map(MapDescriptor::array::<u32>("TEST", 10));
        let mut array = Array::<_, u32>::try_from(&map).unwrap();
        array.update(9, 42, UpdatePolicy::Any).unwrap();
        assert_eq!(array.lookup(9).unwrap(), 42);
        array.update(9, 43, UpdatePolicy::Exist).unwrap();
        assert_eq!(array.lookup(9).unwrap(), 43);
        assert_matches!(
            array.update(9, 44, UpdatePolicy::NoExist),
            Err(MapError::Driver(e)) if e.raw_os_error() == Some(EEXIST)
        );
    }

    #[test]
    fn test_delete_unsupported() {
        let map = new_map(MapDescriptor::array::<u32>("TEST", 10));
        let mut array = Array::<_, u32>::try_from(&map).unwrap();
        assert_matches!(
            array.delete(0),
            Err(MapError::UnsupportedOperation {
                kind: MapKind::Array,
                operation: "delete"
            })
        );
    }

    #[test]
    fn test_lookup_syscall_error() {
        let (map, driver) = new_fake_map(MapDescriptor::array::<u32>("TEST", 10));
        driver.override_call("bpf_map_lookup_elem", EFAULT);
        let array = Array::<_, u32>::try_from(&map).unwrap();
        assert_matches!(
            array.lookup(1),
            Err(MapError::Driver(SysError::Syscall { call, io_error }))
                if call == "bpf_map_lookup_elem" && io_error.raw_os_error() == Some(EFAULT)
        );
    }

    #[test]
    fn test_iter() {
        let map = new_map(MapDescriptor::array::<u32>("TEST", 3));
        let mut array = Array::<_, u32>::try_from(&map).unwrap();
        array.update(1, 7, UpdatePolicy::Any).unwrap();
        assert_eq!(
            array.iter().collect::<Result<Vec<_>, _>>().unwrap(),
            [(0, 0), (1, 7), (2, 0)]
        );
    }
}
