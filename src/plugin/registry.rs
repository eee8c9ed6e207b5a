//! Explicit plugin registry
//!
//! Storage plugins are keyed by URI prefix (the longest matching prefix
//! wins); filters are keyed by name and take an optional `?options` suffix,
//! e.g. `delay?ms=50`.

use crate::error::ConfigError;
use crate::plugin::{delay, test_storage, DelayFilter, SyncFilter, SyncStorage, TestStorage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a storage from its full URI
pub type StorageFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn SyncStorage>, ConfigError> + Send + Sync>;

/// Builds a filter from its option string (the part after `?`)
pub type FilterFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn SyncFilter>, ConfigError> + Send + Sync>;

#[derive(Default, Clone)]
pub struct PluginRegistry {
    storages: Vec<(String, StorageFactory)>,
    filters: HashMap<String, FilterFactory>,
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_storage(test_storage::URI_PREFIX, |uri| {
            Ok(Arc::new(TestStorage::from_uri(uri)?) as Arc<dyn SyncStorage>)
        });
        registry.register_filter(delay::FILTER_NAME, |options| {
            Ok(Arc::new(DelayFilter::from_options(options)?) as Arc<dyn SyncFilter>)
        });
        registry
    }

    pub fn register_storage<F>(&mut self, prefix: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn SyncStorage>, ConfigError> + Send + Sync + 'static,
    {
        self.storages.retain(|(p, _)| p != prefix);
        self.storages.push((prefix.to_string(), Arc::new(factory)));
    }

    pub fn register_filter<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn SyncFilter>, ConfigError> + Send + Sync + 'static,
    {
        self.filters.insert(name.to_string(), Arc::new(factory));
    }

    /// Registered storage prefixes
    pub fn storage_prefixes(&self) -> Vec<&str> {
        self.storages.iter().map(|(p, _)| p.as_str()).collect()
    }

    /// Registered filter names, sorted
    pub fn filter_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.filters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the storage plugin for `uri`
    pub fn resolve_storage(&self, uri: &str) -> Result<Arc<dyn SyncStorage>, ConfigError> {
        let (prefix, factory) = self
            .storages
            .iter()
            .filter(|(prefix, _)| uri.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .ok_or_else(|| ConfigError::UnknownStorage {
                uri: uri.to_string(),
            })?;

        debug!(uri, prefix = %prefix, "Resolved storage plugin");
        factory(uri)
    }

    /// Build the filter described by `spec` (`name` or `name?options`)
    pub fn resolve_filter(&self, spec: &str) -> Result<Arc<dyn SyncFilter>, ConfigError> {
        let (name, options) = spec.split_once('?').unwrap_or((spec, ""));
        let factory = self
            .filters
            .get(name)
            .ok_or_else(|| ConfigError::UnknownFilter {
                name: name.to_string(),
            })?;

        debug!(name, options, "Resolved filter plugin");
        factory(options)
    }
}
