//! Module registry.
//!
//! Maps module names to their compiled module and instance pool. Entries are
//! published only once their pool is completely filled, so a lookup never
//! observes a half-loaded module.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use capsule_common::{RuntimeError, config_file};
use capsule_core::{InstancePool, PoolStatus};

/// Where a module's bytecode comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// A file on disk; `.wat` files are parsed as text.
    File(PathBuf),
    /// WebAssembly binary already in memory.
    Bytes(Vec<u8>),
    /// WebAssembly text.
    Wat(String),
}

/// Everything needed to load one module.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Unique name in the registry.
    pub name: String,
    /// Bytecode source.
    pub source: ModuleSource,
    /// Number of pooled instances.
    pub pool_size: usize,
}

impl ModuleConfig {
    /// Load a module from a file.
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>, pool_size: usize) -> Self {
        Self {
            name: name.into(),
            source: ModuleSource::File(path.into()),
            pool_size,
        }
    }

    /// Load a module from in-memory bytes.
    pub fn bytes(name: impl Into<String>, bytes: impl Into<Vec<u8>>, pool_size: usize) -> Self {
        Self {
            name: name.into(),
            source: ModuleSource::Bytes(bytes.into()),
            pool_size,
        }
    }

    /// Load a module from WAT text.
    pub fn wat(name: impl Into<String>, wat: impl Into<String>, pool_size: usize) -> Self {
        Self {
            name: name.into(),
            source: ModuleSource::Wat(wat.into()),
            pool_size,
        }
    }

    /// Build from a `[[modules]]` entry, using `default_pool_size` when the
    /// entry does not set one.
    pub fn from_entry(entry: &config_file::ModuleEntry, default_pool_size: usize) -> Self {
        Self::file(
            entry.name.clone(),
            entry.path.clone(),
            entry.pool_size.unwrap_or(default_pool_size),
        )
    }

    /// Check the configuration before any work is done.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for an empty name or a zero
    /// pool size.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.name.is_empty() {
            return Err(RuntimeError::invalid_config("module name must not be empty"));
        }
        if self.pool_size == 0 {
            return Err(RuntimeError::invalid_config(format!(
                "module '{}': pool_size must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

/// A loaded module.
#[derive(Debug)]
pub struct ModuleEntry {
    name: String,
    content_hash: String,
    loaded_at: Instant,
    pool: InstancePool,
}

impl ModuleEntry {
    /// Create an entry around a filled pool.
    pub fn new(name: impl Into<String>, content_hash: impl Into<String>, pool: InstancePool) -> Self {
        Self {
            name: name.into(),
            content_hash: content_hash.into(),
            loaded_at: Instant::now(),
            pool,
        }
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content hash of the module bytecode.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// When the entry was created.
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    /// The module's instance pool.
    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    /// Pool status for this module.
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }
}

#[derive(Debug, Default)]
struct Entries {
    modules: HashMap<String, Arc<ModuleEntry>>,
    closed: bool,
}

/// Name to module map guarded by a read/write lock.
///
/// Lookups hold the read lock only long enough to clone the entry's `Arc`.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    entries: RwLock<Entries>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a module.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::ServerClosed`] once the registry is closed
    /// - [`RuntimeError::ModuleNotFound`] if no module has that name
    pub fn get(&self, name: &str) -> Result<Arc<ModuleEntry>, RuntimeError> {
        let entries = self.entries.read();
        if entries.closed {
            return Err(RuntimeError::ServerClosed);
        }
        entries
            .modules
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::module_not_found(name))
    }

    /// Fail early if `name` cannot be published.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::ServerClosed`] once the registry is closed
    /// - [`RuntimeError::DuplicateModule`] if the name is taken
    pub fn check_available(&self, name: &str) -> Result<(), RuntimeError> {
        let entries = self.entries.read();
        if entries.closed {
            return Err(RuntimeError::ServerClosed);
        }
        if entries.modules.contains_key(name) {
            return Err(RuntimeError::duplicate_module(name));
        }
        Ok(())
    }

    /// Publish a fully loaded module.
    ///
    /// On failure the entry is handed back so the caller can drain its pool.
    pub fn publish(
        &self,
        entry: ModuleEntry,
    ) -> Result<Arc<ModuleEntry>, (ModuleEntry, RuntimeError)> {
        let mut entries = self.entries.write();
        if entries.closed {
            return Err((entry, RuntimeError::ServerClosed));
        }
        if entries.modules.contains_key(entry.name()) {
            let err = RuntimeError::duplicate_module(entry.name());
            return Err((entry, err));
        }

        let entry = Arc::new(entry);
        entries
            .modules
            .insert(entry.name().to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Remove a module.
    pub fn remove(&self, name: &str) -> Option<Arc<ModuleEntry>> {
        self.entries.write().modules.remove(name)
    }

    /// Close the registry and take every entry out of it.
    ///
    /// Returns `None` if it was already closed.
    pub fn close(&self) -> Option<Vec<Arc<ModuleEntry>>> {
        let mut entries = self.entries.write();
        if entries.closed {
            return None;
        }
        entries.closed = true;
        Some(entries.modules.drain().map(|(_, entry)| entry).collect())
    }

    /// Returns `true` once [`ModuleRegistry::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.entries.read().closed
    }

    /// Registered module names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().modules.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Number of registered modules.
    pub fn len(&self) -> usize {
        self.entries.read().modules.len()
    }

    /// Returns `true` if no module is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ModuleConfig::wat("echo", "(module)", 2).validate().is_ok());

        let err = ModuleConfig::wat("echo", "(module)", 0).validate().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));

        let err = ModuleConfig::wat("", "(module)", 1).validate().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_from_entry_uses_default_pool_size() {
        let entry = config_file::ModuleEntry {
            name: "echo".into(),
            path: "echo.wasm".into(),
            pool_size: None,
        };
        let config = ModuleConfig::from_entry(&entry, 3);
        assert_eq!(config.pool_size, 3);
        assert!(matches!(config.source, ModuleSource::File(ref p) if p == &PathBuf::from("echo.wasm")));

        let entry = config_file::ModuleEntry {
            pool_size: Some(7),
            ..entry
        };
        assert_eq!(ModuleConfig::from_entry(&entry, 3).pool_size, 7);
    }

    #[test]
    fn test_empty_registry() {
        let registry = ModuleRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("missing"),
            Err(RuntimeError::ModuleNotFound { .. })
        ));
        assert!(registry.check_available("missing").is_ok());
    }

    #[test]
    fn test_close_is_once() {
        let registry = ModuleRegistry::new();
        assert!(registry.close().is_some());
        assert!(registry.close().is_none());
        assert!(registry.is_closed());
        assert!(matches!(registry.get("x"), Err(RuntimeError::ServerClosed)));
        assert!(matches!(
            registry.check_available("x"),
            Err(RuntimeError::ServerClosed)
        ));
    }
}
