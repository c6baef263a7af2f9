//! Per-resource configuration, persisted as TOML beside the data files.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::io::IoSettings;
use crate::primitives::bytes::{BytePipe, ByteStage, SnappyStage};
use crate::types::checksum::HashKind;
use crate::types::{RastroError, Result};
use crate::versioning::Versioning;

/// File name of the persisted configuration inside a resource directory.
pub const CONFIG_FILE: &str = "resource.toml";

/// Per-string compression inside leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringCompression {
    /// Slots are stored verbatim.
    None,
    /// Slots are encoded against a per-page symbol table.
    Fsst,
}

/// Secondary-index backend consumed by the CAS/name/path listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexBackend {
    /// Red-black-tree backed indexes.
    RbTree,
    /// Height-optimized-trie backed indexes.
    Hot,
}

/// Byte-pipe stages, applied in configuration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageKind {
    /// Snappy block compression.
    Snappy,
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendChoice {
    /// Highest-priority available provider.
    Auto,
    /// A provider by registry name.
    Named(String),
}

/// Everything a resource needs to reopen exactly as it was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Owning database id.
    pub database_id: u64,
    /// Resource id, unique within the database.
    pub resource_id: u64,
    /// Leaf reconstruction strategy.
    pub versioning: Versioning,
    /// Window size for INCREMENTAL / SLIDING_SNAPSHOT and full-dump period
    /// for DIFFERENTIAL.
    pub revs_to_restore: u32,
    /// Page checksum algorithm.
    pub hash: HashKind,
    /// Per-string symbol-table compression inside leaves.
    pub string_compression: StringCompression,
    /// Secondary-index backend choice.
    pub index_backend: IndexBackend,
    /// Whether text-node payloads are compressed by the node layer.
    pub use_text_compression: bool,
    /// Whether a DeweyID is stored per record.
    pub use_dewey_ids: bool,
    /// Byte-pipe stages in order.
    pub byte_pipe: Vec<StageKind>,
    /// Storage backend selection.
    pub backend: BackendChoice,
    /// Page cache capacity in pages.
    pub cache_capacity: usize,
}

impl ResourceConfig {
    /// A configuration with the engine defaults.
    pub fn new(database_id: u64, resource_id: u64) -> Self {
        Self {
            database_id,
            resource_id,
            versioning: Versioning::default(),
            revs_to_restore: 3,
            hash: HashKind::default(),
            string_compression: StringCompression::None,
            index_backend: IndexBackend::RbTree,
            use_text_compression: false,
            use_dewey_ids: false,
            byte_pipe: vec![StageKind::Snappy],
            backend: BackendChoice::Auto,
            cache_capacity: crate::cache::DEFAULT_CACHE_CAPACITY,
        }
    }

    /// Sets the versioning strategy.
    pub fn with_versioning(mut self, versioning: Versioning) -> Self {
        self.versioning = versioning;
        self
    }

    /// Sets the reconstruction window / dump period.
    pub fn with_revs_to_restore(mut self, revs: u32) -> Self {
        self.revs_to_restore = revs.max(1);
        self
    }

    /// Selects the checksum algorithm.
    pub fn with_hash(mut self, hash: HashKind) -> Self {
        self.hash = hash;
        self
    }

    /// Enables the dewey-id sidecar.
    pub fn with_dewey_ids(mut self, enabled: bool) -> Self {
        self.use_dewey_ids = enabled;
        self
    }

    /// Sets the per-string compression mode.
    pub fn with_string_compression(mut self, mode: StringCompression) -> Self {
        self.string_compression = mode;
        self
    }

    /// Replaces the byte-pipe stages.
    pub fn with_byte_pipe(mut self, stages: Vec<StageKind>) -> Self {
        self.byte_pipe = stages;
        self
    }

    /// Selects the storage backend by provider name.
    pub fn with_backend(mut self, name: &str) -> Self {
        self.backend = BackendChoice::Named(name.to_string());
        self
    }

    /// Builds the configured byte pipe.
    pub fn build_pipe(&self) -> BytePipe {
        let stages: Vec<Arc<dyn ByteStage>> = self
            .byte_pipe
            .iter()
            .map(|stage| match stage {
                StageKind::Snappy => Arc::new(SnappyStage) as Arc<dyn ByteStage>,
            })
            .collect();
        BytePipe::new(stages)
    }

    /// The IO-layer view of this configuration.
    pub fn io_settings(&self) -> IoSettings {
        IoSettings {
            database_id: self.database_id,
            resource_id: self.resource_id,
            hash_kind: self.hash,
            use_fsst: self.string_compression == StringCompression::Fsst,
        }
    }

    /// Persists the configuration into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|_| RastroError::Invalid("configuration not serializable"))?;
        std::fs::write(dir.join(CONFIG_FILE), text).map_err(RastroError::from)
    }

    /// Loads the configuration persisted in `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(dir.join(CONFIG_FILE)).map_err(RastroError::from)?;
        toml::from_str(&text).map_err(|_| RastroError::CorruptHeader("resource configuration invalid"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn toml_roundtrip() {
        let dir = tempdir().unwrap();
        let config = ResourceConfig::new(7, 9)
            .with_versioning(Versioning::Incremental)
            .with_revs_to_restore(4)
            .with_dewey_ids(true)
            .with_backend("file-channel");
        config.save(dir.path()).unwrap();

        let loaded = ResourceConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.database_id, 7);
        assert_eq!(loaded.resource_id, 9);
        assert_eq!(loaded.versioning, Versioning::Incremental);
        assert_eq!(loaded.revs_to_restore, 4);
        assert!(loaded.use_dewey_ids);
        assert_eq!(loaded.backend, BackendChoice::Named("file-channel".into()));
    }

    #[test]
    fn revs_to_restore_never_drops_below_one() {
        let config = ResourceConfig::new(1, 1).with_revs_to_restore(0);
        assert_eq!(config.revs_to_restore, 1);
    }

    #[test]
    fn pipe_matches_configured_stages() {
        let config = ResourceConfig::new(1, 1);
        assert_eq!(config.build_pipe().stage_names(), vec!["snappy"]);
        let empty = ResourceConfig::new(1, 1).with_byte_pipe(Vec::new());
        assert!(empty.build_pipe().stage_names().is_empty());
    }
}
