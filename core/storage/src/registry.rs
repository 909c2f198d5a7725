//! Adapter registry for resolving drive types by name.

use std::collections::HashMap;

use unidrive_common::{Error, Result};

use crate::adapter::{AdapterContext, DriveAdapter};
use crate::baidu::BaiduAdapter;
use crate::gdrive::GDriveAdapter;
use crate::local::LocalAdapter;
use crate::memory::{MemoryAdapter, MemoryVolumes};

/// Factory function type for creating adapters.
pub type AdapterFactory =
    Box<dyn Fn(AdapterContext) -> Result<Box<dyn DriveAdapter>> + Send + Sync>;

/// Registry of adapter factories keyed by type name.
///
/// Each resolution builds a fresh adapter instance owned by one request.
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register an adapter factory.
    ///
    /// # Errors
    /// - `name` is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: AdapterFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Adapter '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build an adapter of type `name` for one mount.
    ///
    /// # Errors
    /// - Unknown adapter type
    /// - Configuration rejected by the adapter
    pub fn resolve(&self, name: &str, ctx: AdapterContext) -> Result<Box<dyn DriveAdapter>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Adapter '{}' is not registered", name)))?;
        factory(ctx)
    }

    /// Registered type names, sorted.
    pub fn adapter_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_adapter(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with every built-in adapter and a private memory namespace set.
pub fn create_default_registry() -> AdapterRegistry {
    create_registry(MemoryVolumes::default())
}

/// Registry with every built-in adapter; memory drives share `volumes`.
pub fn create_registry(volumes: MemoryVolumes) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    let factories = &mut registry.factories;

    factories.insert(
        "memory".to_string(),
        Box::new(move |ctx| Ok(Box::new(MemoryAdapter::new(ctx, &volumes)?))),
    );
    factories.insert(
        "local".to_string(),
        Box::new(|ctx| Ok(Box::new(LocalAdapter::new(ctx)?))),
    );
    factories.insert(
        "gdrive".to_string(),
        Box::new(|ctx| Ok(Box::new(GDriveAdapter::new(ctx)?))),
    );
    factories.insert(
        "baidu".to_string(),
        Box::new(|ctx| Ok(Box::new(BaiduAdapter::new(ctx)?))),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use unidrive_common::DrivePath;

    fn ctx(config: Value) -> AdapterContext {
        AdapterContext::new(DrivePath::parse("/m").unwrap(), config, json!({}))
    }

    fn memory_factory() -> AdapterFactory {
        let volumes = MemoryVolumes::default();
        Box::new(move |ctx| Ok(Box::new(MemoryAdapter::new(ctx, &volumes)?) as Box<dyn DriveAdapter>))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = AdapterRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let adapter = registry.resolve("test", ctx(Value::Null)).unwrap();
        assert_eq!(adapter.kind(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = AdapterRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let result = registry.register("test", memory_factory());
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = AdapterRegistry::new();
        let result = registry.resolve("unknown", ctx(Value::Null));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_default_registry_types() {
        let registry = create_default_registry();
        assert_eq!(
            registry.adapter_types(),
            vec!["baidu", "gdrive", "local", "memory"]
        );
        assert!(registry.has_adapter("local"));
    }

    #[test]
    fn test_bad_config_surfaces_from_factory() {
        let registry = create_default_registry();
        assert!(matches!(
            registry.resolve("local", ctx(json!({}))),
            Err(Error::Validation(_))
        ));
    }
}
