use std::{borrow::Borrow, ops::Deref, sync::Arc};

use crate::maps::{Map, MapData};

/// A shared reference to a map owned by a [`MapRegistry`](crate::MapRegistry).
///
/// Outstanding references keep the map alive: the registry refuses to remove
/// a map while any `MapRef` to it exists.
#[derive(Clone, Debug)]
pub struct MapRef {
    inner: Arc<Map>,
}

impl MapRef {
    pub(crate) fn new(inner: Arc<Map>) -> Self {
        Self { inner }
    }

    /// Returns the map name.
    pub fn name(&self) -> &str {
        self.inner.data().name()
    }
}

impl Deref for MapRef {
    type Target = Map;

    fn deref(&self) -> &Map {
        &self.inner
    }
}

impl Borrow<MapData> for MapRef {
    fn borrow(&self) -> &MapData {
        self.inner.data()
    }
}
