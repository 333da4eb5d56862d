//! Id-keyed data registries
//!
//! Static data (attachments, weapons, ability sets, montages, items) is authored as RON lists
//! and looked up by registry id. The id is what crosses the network; each endpoint resolves it
//! against its own registry.

use bevy::prelude::*;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::error::ConfigError;

/// Anything that can live in a `DataRegistry`.
pub trait RegistryItem {
    fn registry_id(&self) -> &str;
}

#[derive(Resource, Debug)]
pub struct DataRegistry<T> {
    items: BTreeMap<String, Arc<T>>,
}

impl<T> Default for DataRegistry<T> {
    fn default() -> Self {
        Self { items: BTreeMap::new() }
    }
}

impl<T> Clone for DataRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T: RegistryItem> DataRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the shared handle.
    pub fn insert(&mut self, item: T) -> Arc<T> {
        let id = item.registry_id().to_string();
        let item = Arc::new(item);
        if self.items.insert(id.clone(), item.clone()).is_some() {
            debug!("DataRegistry: replaced {}", id);
        }
        item
    }

    pub fn get_cached_item(&self, id: &str) -> Option<Arc<T>> {
        self.items.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: RegistryItem + DeserializeOwned> DataRegistry<T> {
    /// Parse a RON list of items.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let items: Vec<T> = ron::from_str(text)?;
        let mut registry = Self::new();
        for item in items {
            registry.insert(item);
        }
        Ok(registry)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    /// Load, logging and returning an empty registry on failure.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path) {
            Ok(registry) => {
                info!("Loaded {} registry entries from {:?}", registry.len(), path);
                registry
            }
            Err(e) => {
                warn!("Failed to load registry {:?}: {}", path, e);
                Self::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Thing {
        id: String,
        value: i32,
    }

    impl RegistryItem for Thing {
        fn registry_id(&self) -> &str {
            &self.id
        }
    }

    #[test]
    fn test_registry_from_ron() {
        let reg: DataRegistry<Thing> =
            DataRegistry::from_ron_str(r#"[(id: "a", value: 1), (id: "b", value: 2)]"#).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get_cached_item("b").map(|t| t.value), Some(2));
        assert!(reg.get_cached_item("c").is_none());
    }
}
