use std::{borrow::Borrow, marker::PhantomData};

use crate::{
    bytes_of,
    maps::{
        check_bounds, check_kv_size, lookup_one_cpu, lookup_per_cpu, update_per_cpu,
        update_per_cpu_values, CpuPolicy, IterableMap, MapData, MapError, PerCpuValues, Reduced,
        Reduction, UpdatePolicy, WrappingAdd,
    },
    Pod,
};

/// A per-CPU fixed-size array.
///
/// The size of the array is the `max_entries` of its descriptor. All the
/// entries are zero-initialized when the map is created.
///
/// # Examples
/// ```
/// use bpf_registry::{
///     maps::{CpuPolicy, MapDescriptor, PerCpuArray, UpdatePolicy},
///     sys::MemoryDriver,
///     MapRegistry,
/// };
///
/// let registry = MapRegistry::new(MemoryDriver::new(2));
/// let map = registry.create(MapDescriptor::per_cpu_array::<u32>("ARRAY", 4))?;
/// let nr_cpus = map.data().nr_cpus()?;
/// let mut array = PerCpuArray::<_, u32>::try_from(map)?;
///
/// // set array[1] = 42 for all cpus
/// array.update(1, 42, CpuPolicy::AllCpus, UpdatePolicy::Any)?;
///
/// // retrieve the values at index 1 for all cpus
/// let values = array.lookup(1)?;
/// assert_eq!(values.len(), nr_cpus);
/// for cpu_val in values.iter() {
///     assert_eq!(*cpu_val, 42u32);
/// }
/// # Ok::<(), bpf_registry::MapError>(())
/// ```
#[doc(alias = "BPF_MAP_TYPE_PERCPU_ARRAY")]
#[derive(Debug)]
pub struct PerCpuArray<T, V: Pod> {
    pub(crate) inner: T,
    _v: PhantomData<V>,
}

#[allow(clippy::len_without_is_empty)]
impl<T: Borrow<MapData>, V: Pod> PerCpuArray<T, V> {
    pub(crate) fn new(map: T) -> Result<Self, MapError> {
        let data = map.borrow();
        check_kv_size::<u32, V>(data)?;

        Ok(Self {
            inner: map,
            _v: PhantomData,
        })
    }

    /// Returns the number of elements in the array.
    pub fn len(&self) -> u32 {
        self.inner.borrow().descriptor().max_entries()
    }

    /// Returns a slice of values - one for each CPU - stored at the given index.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::OutOfRange`] if `index` is out of bounds, [`MapError::Driver`]
    /// if the driver fails.
    pub fn lookup(&self, index: u32) -> Result<PerCpuValues<V>, MapError> {
        let data = self.inner.borrow();
        check_bounds(data, index)?;
        lookup_per_cpu(data, bytes_of(&index))?.ok_or(MapError::KeyNotFound)
    }

    /// Returns the value `cpu` holds at the given index.
    pub fn lookup_cpu(&self, index: u32, cpu: u32) -> Result<V, MapError> {
        let data = self.inner.borrow();
        check_bounds(data, index)?;
        lookup_one_cpu(data, bytes_of(&index), cpu)?.ok_or(MapError::KeyNotFound)
    }

    /// An iterator over the elements of the array. The iterator item type is
    /// `Result<(u32, PerCpuValues<V>), MapError>`.
    pub fn iter(&self) -> impl Iterator<Item = Result<(u32, PerCpuValues<V>), MapError>> + '_ {
        (0..self.len()).map(move |i| Ok((i, self.lookup(i)?)))
    }

    /// Stores `value` at the given index for the CPUs selected by `cpu`.
    pub fn update(
        &mut self,
        index: u32,
        value: V,
        cpu: CpuPolicy,
        policy: UpdatePolicy,
    ) -> Result<(), MapError> {
        let data = self.inner.borrow();
        check_bounds(data, index)?;
        update_per_cpu(data, bytes_of(&index), value, cpu, policy)
    }

    /// Sets the values - one for each CPU - at the given index.
    pub fn update_values(
        &mut self,
        index: u32,
        values: PerCpuValues<V>,
        policy: UpdatePolicy,
    ) -> Result<(), MapError> {
        let data = self.inner.borrow();
        check_bounds(data, index)?;
        update_per_cpu_values(data, bytes_of(&index), &values, policy)
    }
}

impl<T: Borrow<MapData>, V: WrappingAdd> PerCpuArray<T, V> {
    /// Returns the values stored at the given index, reduced as requested.
    pub fn lookup_reduced(&self, index: u32, reduction: Reduction) -> Result<Reduced<V>, MapError> {
        let values = self.lookup(index)?;
        Ok(match reduction {
            Reduction::Sum => Reduced::Sum(values.sum()),
            Reduction::PerCpu => Reduced::PerCpu(values),
        })
    }
}

impl<T: Borrow<MapData>, V: Pod> IterableMap<u32, PerCpuValues<V>> for PerCpuArray<T, V> {
    fn map(&self) -> &MapData {
        self.inner.borrow()
    }

    fn get(&self, index: &u32) -> Result<PerCpuValues<V>, MapError> {
        self.lookup(*index)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        maps::{
            test_utils::{new_map, new_map_with},
            MapDescriptor,
        },
        sys::MemoryDriver,
    };

    #[test]
    fn test_zero_initialized() {
        let map = new_map(MapDescriptor::per_cpu_array::<u32>("TEST", 2));
        let array = PerCpuArray::<_, u32>::try_from(&map).unwrap();
        assert_eq!(&*array.lookup(1).unwrap(), &[0, 0, 0, 0]);
        assert_matches!(
            array.lookup(2),
            Err(MapError::OutOfRange {
                index: 2,
                max_entries: 2
            })
        );
    }

    #[test]
    fn test_counters() {
        let driver = MemoryDriver::new(4);
        driver.set_current_cpu(Some(1));
        let map = new_map_with(MapDescriptor::per_cpu_array::<u64>("TEST", 1), driver);
        let mut array = PerCpuArray::<_, u64>::try_from(&map).unwrap();

        array
            .update(0, 3, CpuPolicy::CurrentCpu, UpdatePolicy::Any)
            .unwrap();
        array
            .update(0, 4, CpuPolicy::Cpu(3), UpdatePolicy::Exist)
            .unwrap();
        assert_eq!(array.lookup_cpu(0, 1).unwrap(), 3);
        assert_eq!(array.lookup_reduced(0, Reduction::Sum).unwrap(), Reduced::Sum(7));
        assert_eq!(
            array.lookup_reduced(0, Reduction::PerCpu).unwrap(),
            Reduced::PerCpu(PerCpuValues::from(vec![0, 3, 0, 4]))
        );
    }

    #[test]
    fn test_update_values_and_iter() {
        let map = new_map(MapDescriptor::per_cpu_array::<u32>("TEST", 2));
        let mut array = PerCpuArray::<_, u32>::try_from(&map).unwrap();
        array
            .update_values(1, PerCpuValues::from(vec![1, 2, 3, 4]), UpdatePolicy::Any)
            .unwrap();

        let items = array.iter().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, 0);
        assert_eq!(items[1], (1, PerCpuValues::from(vec![1, 2, 3, 4])));
    }
}
