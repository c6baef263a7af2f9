//! The process-wide storage provider registry.
//!
//! Providers are registered at process start (the two built-in backends are
//! seeded automatically) and selected either by name or by priority among
//! the available ones. A provider declares its own availability so that
//! platform- or license-gated backends can sit in the registry without being
//! chosen.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::debug;

use crate::io::{FileBackend, IoSettings, MmapBackend, StorageBackend};
use crate::primitives::bytes::BytePipe;
use crate::types::{RastroError, Result};

/// Constructor signature of a registered backend.
pub type OpenFn = fn(&Path, Arc<BytePipe>, IoSettings) -> Result<Box<dyn StorageBackend>>;

/// One registered storage backend.
pub struct Provider {
    /// Unique provider name, referenced from resource configurations.
    pub name: &'static str,
    /// Higher wins when selecting automatically.
    pub priority: i32,
    /// Whether the provider can run in this process (library present, OS
    /// supported, license valid).
    pub available: fn() -> bool,
    /// Opens the backend against a resource directory.
    pub open: OpenFn,
}

/// The registry of storage providers.
pub struct StorageProviders {
    providers: RwLock<Vec<Provider>>,
}

fn always_available() -> bool {
    true
}

fn open_file_backend(
    dir: &Path,
    pipe: Arc<BytePipe>,
    settings: IoSettings,
) -> Result<Box<dyn StorageBackend>> {
    Ok(Box::new(FileBackend::open(dir, pipe, settings)?))
}

fn open_mmap_backend(
    dir: &Path,
    pipe: Arc<BytePipe>,
    settings: IoSettings,
) -> Result<Box<dyn StorageBackend>> {
    Ok(Box::new(MmapBackend::open(dir, pipe, settings)?))
}

impl StorageProviders {
    fn seeded() -> Self {
        Self {
            providers: RwLock::new(vec![
                Provider {
                    name: "memory-mapped",
                    priority: 20,
                    available: always_available,
                    open: open_mmap_backend,
                },
                Provider {
                    name: "file-channel",
                    priority: 10,
                    available: always_available,
                    open: open_file_backend,
                },
            ]),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static StorageProviders {
        static GLOBAL: OnceLock<StorageProviders> = OnceLock::new();
        GLOBAL.get_or_init(StorageProviders::seeded)
    }

    /// Registers an additional provider.
    pub fn register(&self, provider: Provider) {
        debug!(name = provider.name, priority = provider.priority, "providers.register");
        self.providers.write().push(provider);
    }

    /// Names of every registered provider, by descending priority.
    pub fn names(&self) -> Vec<&'static str> {
        let guard = self.providers.read();
        let mut entries: Vec<(&'static str, i32)> =
            guard.iter().map(|p| (p.name, p.priority)).collect();
        entries.sort_by_key(|(_, priority)| -priority);
        entries.into_iter().map(|(name, _)| name).collect()
    }

    /// Opens a backend by provider name.
    pub fn open_named(
        &self,
        name: &str,
        dir: &Path,
        pipe: Arc<BytePipe>,
        settings: IoSettings,
    ) -> Result<Box<dyn StorageBackend>> {
        let guard = self.providers.read();
        let provider = guard
            .iter()
            .find(|p| p.name == name)
            .ok_or(RastroError::Invalid("unknown storage provider"))?;
        if !(provider.available)() {
            return Err(RastroError::Invalid("storage provider not available"));
        }
        (provider.open)(dir, pipe, settings)
    }

    /// Opens the highest-priority available backend.
    pub fn open_best(
        &self,
        dir: &Path,
        pipe: Arc<BytePipe>,
        settings: IoSettings,
    ) -> Result<Box<dyn StorageBackend>> {
        let guard = self.providers.read();
        let best = guard
            .iter()
            .filter(|p| (p.available)())
            .max_by_key(|p| p.priority)
            .ok_or(RastroError::Invalid("no storage provider available"))?;
        (best.open)(dir, pipe, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::checksum::HashKind;
    use tempfile::tempdir;

    fn settings() -> IoSettings {
        IoSettings {
            database_id: 1,
            resource_id: 1,
            hash_kind: HashKind::Xxh3,
            use_fsst: false,
        }
    }

    #[test]
    fn builtin_providers_are_seeded_by_priority() {
        let names = StorageProviders::global().names();
        let mmap_pos = names.iter().position(|n| *n == "memory-mapped").unwrap();
        let file_pos = names.iter().position(|n| *n == "file-channel").unwrap();
        assert!(mmap_pos < file_pos);
    }

    #[test]
    fn open_named_and_best() {
        let dir = tempdir().unwrap();
        let registry = StorageProviders::global();
        let backend = registry
            .open_named(
                "file-channel",
                dir.path(),
                Arc::new(BytePipe::identity()),
                settings(),
            )
            .unwrap();
        assert_eq!(backend.name(), "file-channel");

        let best = registry
            .open_best(dir.path(), Arc::new(BytePipe::identity()), settings())
            .unwrap();
        assert_eq!(best.name(), "memory-mapped");

        assert!(registry
            .open_named(
                "does-not-exist",
                dir.path(),
                Arc::new(BytePipe::identity()),
                settings(),
            )
            .is_err());
    }
}
