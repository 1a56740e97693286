use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    errors::{MapError, ShutdownError},
    maps::{Map, MapData, MapDescriptor, MapRef},
    sys::MapDriver,
};

/// Builder style API for advanced registry configuration.
///
/// The builder selects the [`MapDriver`] maps are created with and lets
/// callers override map capacities by name before the maps are created.
///
/// # Examples
///
/// ```
/// use bpf_registry::{catalog, sys::MemoryDriver, RegistryBuilder};
///
/// let registry = RegistryBuilder::new()
///     .driver(MemoryDriver::new(2))
///     .set_max_entries("hash_map", 64)
///     .load(catalog::fixture_descriptors())?;
/// assert_eq!(registry.len(), 8);
/// # Ok::<(), bpf_registry::MapError>(())
/// ```
#[derive(Debug)]
pub struct RegistryBuilder {
    driver: Option<Arc<dyn MapDriver>>,
    max_entries: HashMap<String, u32>,
}

impl RegistryBuilder {
    /// Creates a new builder with the default driver and no overrides.
    ///
    /// On Linux the default driver is the
    /// [`SyscallDriver`](crate::sys::SyscallDriver), elsewhere it is the
    /// [`MemoryDriver`](crate::sys::MemoryDriver).
    pub fn new() -> Self {
        Self {
            driver: None,
            max_entries: HashMap::new(),
        }
    }

    /// Sets the driver maps are created with.
    pub fn driver(&mut self, driver: impl MapDriver + 'static) -> &mut Self {
        self.driver = Some(Arc::new(driver));
        self
    }

    /// Set the max_entries for specified map.
    ///
    /// Overwrite the value of max_entries of the map that matches
    /// the provided name before the map is created.
    ///
    /// # Example
    ///
    /// ```
    /// use bpf_registry::{maps::MapDescriptor, sys::MemoryDriver, RegistryBuilder};
    ///
    /// let registry = RegistryBuilder::new()
    ///     .driver(MemoryDriver::new(1))
    ///     .set_max_entries("map", 64)
    ///     .build();
    /// let map = registry.create(MapDescriptor::hash::<u32, u32>("map", 10))?;
    /// assert_eq!(map.data().descriptor().max_entries(), 64);
    /// # Ok::<(), bpf_registry::MapError>(())
    /// ```
    pub fn set_max_entries(&mut self, name: impl Into<String>, size: u32) -> &mut Self {
        self.max_entries.insert(name.into(), size);
        self
    }

    /// Builds an empty registry.
    pub fn build(&mut self) -> MapRegistry {
        let driver = self.driver.clone().unwrap_or_else(default_driver);
        MapRegistry {
            driver,
            max_entries: self.max_entries.clone(),
            maps: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a registry and creates a map for each descriptor.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered. The maps created before the
    /// failure are released.
    pub fn load(
        &mut self,
        descriptors: impl IntoIterator<Item = MapDescriptor>,
    ) -> Result<MapRegistry, MapError> {
        let registry = self.build();
        for def in descriptors {
            if let Err(e) = registry.create(def) {
                if let Err(shutdown) = registry.shutdown() {
                    warn!("failed to release maps after load error: {shutdown}");
                }
                return Err(e);
            }
        }
        Ok(registry)
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn default_driver() -> Arc<dyn MapDriver> {
    Arc::new(crate::sys::SyscallDriver::new())
}

#[cfg(not(target_os = "linux"))]
fn default_driver() -> Arc<dyn MapDriver> {
    Arc::new(crate::sys::MemoryDriver::default())
}

/// A catalog of named maps.
///
/// The registry creates maps from [`MapDescriptor`]s, hands them out as
/// [`MapRef`]s and owns their lifecycle: a map is destroyed when it is
/// [removed](MapRegistry::remove), when the registry is
/// [shut down](MapRegistry::shutdown) or when the registry is dropped.
///
/// All the methods take `&self`; the name table is guarded by a single lock,
/// so concurrent [`create`](MapRegistry::create) calls for the same name
/// succeed exactly once.
#[derive(Debug)]
pub struct MapRegistry {
    driver: Arc<dyn MapDriver>,
    max_entries: HashMap<String, u32>,
    maps: Mutex<HashMap<String, Arc<Map>>>,
}

impl MapRegistry {
    /// Creates an empty registry backed by `driver`.
    pub fn new(driver: impl MapDriver + 'static) -> Self {
        RegistryBuilder::new().driver(driver).build()
    }

    /// Returns a builder for a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Creates a map and registers it under its descriptor name.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::InvalidDescriptor`] if the descriptor is invalid,
    /// [`MapError::DuplicateName`] if a map with the same name is already
    /// registered and [`MapError::Driver`] if the driver fails to create the
    /// map. The registry is unchanged on error.
    pub fn create(&self, def: MapDescriptor) -> Result<MapRef, MapError> {
        def.validate()?;
        let def = match self.max_entries.get(def.name()) {
            Some(&max_entries) => def.with_max_entries(max_entries),
            None => def,
        };

        let mut maps = self.maps.lock();
        if maps.contains_key(def.name()) {
            return Err(MapError::DuplicateName {
                name: def.name().to_owned(),
            });
        }
        let name = def.name().to_owned();
        let map = Arc::new(Map::from_map_data(MapData::create(
            def,
            self.driver.clone(),
        )?));
        maps.insert(name.clone(), map.clone());
        debug!("registered map `{name}`");

        Ok(MapRef::new(map))
    }

    /// Returns a reference to the map registered under `name`.
    pub fn get(&self, name: &str) -> Option<MapRef> {
        self.maps.lock().get(name).cloned().map(MapRef::new)
    }

    /// Unregisters and destroys the map registered under `name`.
    ///
    /// Returns `Ok(false)` if there is no such map.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::MapInUse`] if a [`MapRef`] to the map is still
    /// alive, in which case the map stays registered. Returns
    /// [`MapError::Driver`] if the driver fails to destroy the map; the map is
    /// unregistered regardless.
    pub fn remove(&self, name: &str) -> Result<bool, MapError> {
        let mut maps = self.maps.lock();
        let Some((name, map)) = maps.remove_entry(name) else {
            return Ok(false);
        };
        match Arc::try_unwrap(map) {
            Ok(map) => {
                debug!("removing map `{name}`");
                map.into_data().close()?;
                Ok(true)
            }
            Err(map) => {
                maps.insert(name.clone(), map);
                Err(MapError::MapInUse { name })
            }
        }
    }

    /// Unregisters and destroys every map.
    ///
    /// Callers must stop using the maps first: maps that are still referenced
    /// are unregistered but reported as [`MapError::MapInUse`], and destroyed
    /// only once their last [`MapRef`] is dropped. A failure to release such a
    /// map is logged at warn level when that happens and is not returned
    /// from here.
    ///
    /// # Errors
    ///
    /// Returns a [`ShutdownError`] listing every map that could not be
    /// released.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        let drained = self.maps.lock().drain().collect::<Vec<_>>();
        let mut failures = Vec::new();
        for (name, map) in drained {
            let result = match Arc::try_unwrap(map) {
                Ok(map) => map.into_data().close(),
                Err(_) => Err(MapError::MapInUse { name: name.clone() }),
            };
            if let Err(e) = result {
                failures.push((name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }

    /// Returns the number of registered maps.
    pub fn len(&self) -> usize {
        self.maps.lock().len()
    }

    /// Returns `true` if no map is registered.
    pub fn is_empty(&self) -> bool {
        self.maps.lock().is_empty()
    }

    /// Returns the names of the registered maps, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.maps.lock().keys().cloned().collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

    /// An iterator over the registered maps, sorted by name.
    ///
    /// The iterator works on a snapshot: maps created or removed while
    /// iterating are not reflected.
    pub fn maps(&self) -> impl Iterator<Item = (String, MapRef)> {
        let mut maps = self
            .maps
            .lock()
            .iter()
            .map(|(name, map)| (name.clone(), MapRef::new(map.clone())))
            .collect::<Vec<_>>();
        maps.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        maps.into_iter()
    }
}

impl Drop for MapRegistry {
    fn drop(&mut self) {
        if self.maps.get_mut().is_empty() {
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use libc::{EBADF, EPERM};

    use super::*;
    use crate::{
        errors::DescriptorError,
        maps::{HashMap as TypedHashMap, UpdatePolicy},
        sys::{fake::FakeDriver, MemoryDriver},
    };

    fn new_registry() -> MapRegistry {
        MapRegistry::new(MemoryDriver::new(2))
    }

    #[test]
    fn test_create_get() {
        let registry = new_registry();
        assert!(registry.is_empty());
        let map = registry
            .create(MapDescriptor::hash::<u32, u32>("hash", 4))
            .unwrap();
        assert_eq!(map.name(), "hash");
        assert_eq!(registry.len(), 1);

        let mut hm = TypedHashMap::<_, u32, u32>::try_from(map).unwrap();
        hm.update(1, 2, UpdatePolicy::Any).unwrap();

        let again = registry.get("hash").unwrap();
        let hm = TypedHashMap::<_, u32, u32>::try_from(&*again).unwrap();
        assert_eq!(hm.lookup(&1).unwrap(), Some(2));
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_create_invalid() {
        let registry = new_registry();
        assert_matches!(
            registry.create(MapDescriptor::hash::<u32, u32>("hash", 0)),
            Err(MapError::InvalidDescriptor {
                reason: DescriptorError::ZeroMaxEntries,
                ..
            })
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_name() {
        let registry = new_registry();
        let _map = registry
            .create(MapDescriptor::hash::<u32, u32>("dup", 4))
            .unwrap();
        assert_matches!(
            registry.create(MapDescriptor::array::<u32>("dup", 4)),
            Err(MapError::DuplicateName { name }) if name == "dup"
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_driver_failure_leaves_registry_unchanged() {
        let driver = FakeDriver::new(1);
        driver.override_call("bpf_map_create", EPERM);
        let registry = MapRegistry::new(driver);
        assert_matches!(
            registry.create(MapDescriptor::hash::<u32, u32>("hash", 4)),
            Err(MapError::Driver(e)) if e.raw_os_error() == Some(EPERM)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_max_entries_override() {
        let registry = MapRegistry::builder()
            .driver(MemoryDriver::new(1))
            .set_max_entries("small", 1)
            .build();
        let map = registry
            .create(MapDescriptor::hash::<u32, u32>("small", 10))
            .unwrap();
        assert_eq!(map.data().descriptor().max_entries(), 1);

        let mut hm = TypedHashMap::<_, u32, u32>::try_from(map).unwrap();
        hm.update(1, 1, UpdatePolicy::Any).unwrap();
        assert_matches!(
            hm.update(2, 2, UpdatePolicy::Any),
            Err(MapError::CapacityExceeded { max_entries: 1, .. })
        );
    }

    #[test]
    fn test_remove() {
        let registry = new_registry();
        let map = registry
            .create(MapDescriptor::queue::<u32>("queue", 4))
            .unwrap();

        assert_matches!(
            registry.remove("queue"),
            Err(MapError::MapInUse { name }) if name == "queue"
        );
        assert_eq!(registry.names(), ["queue"]);

        drop(map);
        assert!(registry.remove("queue").unwrap());
        assert!(!registry.remove("queue").unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_driver_error() {
        let driver = Arc::new(FakeDriver::new(1));
        let registry = MapRegistry::new(driver.clone());
        drop(registry.create(MapDescriptor::array::<u32>("array", 4)).unwrap());
        driver.override_call("close", EBADF);

        assert_matches!(
            registry.remove("array"),
            Err(MapError::Driver(e)) if e.raw_os_error() == Some(EBADF)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_shutdown_reports_every_failure() {
        let registry = new_registry();
        let held = registry
            .create(MapDescriptor::hash::<u32, u32>("held", 4))
            .unwrap();
        drop(registry.create(MapDescriptor::array::<u32>("free", 4)).unwrap());
        let also_held = registry
            .create(MapDescriptor::queue::<u32>("also_held", 4))
            .unwrap();

        let err = registry.shutdown().unwrap_err();
        let mut names = err
            .failures
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>();
        names.sort_unstable();
        assert_eq!(names, ["also_held", "held"]);
        assert!(err
            .failures
            .iter()
            .all(|(_, e)| matches!(e, MapError::MapInUse { .. })));
        assert!(registry.is_empty());

        drop((held, also_held));
        assert!(registry.shutdown().is_ok());
    }

    #[test]
    fn test_drop_destroys_maps() {
        let driver = Arc::new(FakeDriver::new(1));
        {
            let registry = MapRegistry::new(driver.clone());
            drop(registry.create(MapDescriptor::array::<u32>("a", 4)).unwrap());
            drop(registry.create(MapDescriptor::array::<u32>("b", 4)).unwrap());
            assert_eq!(driver.map_count(), 2);
        }
        assert_eq!(driver.map_count(), 0);
    }

    #[test]
    fn test_load_releases_on_failure() {
        let driver = Arc::new(FakeDriver::new(1));
        let result = RegistryBuilder::new().driver(driver.clone()).load([
            MapDescriptor::array::<u32>("a", 4),
            MapDescriptor::array::<u32>("b", 4),
            MapDescriptor::array::<u32>("a", 4),
        ]);
        assert_matches!(result, Err(MapError::DuplicateName { name }) if name == "a");
        assert_eq!(driver.map_count(), 0);
    }

    #[test]
    fn test_maps_sorted() {
        let registry = new_registry();
        for name in ["c", "a", "b"] {
            drop(registry.create(MapDescriptor::array::<u32>(name, 1)).unwrap());
        }
        assert_eq!(registry.names(), ["a", "b", "c"]);
        let kinds = registry
            .maps()
            .map(|(name, map)| (name, map.kind()))
            .collect::<Vec<_>>();
        assert_eq!(kinds.len(), 3);
        assert_eq!(kinds[0].0, "a");
    }
}
