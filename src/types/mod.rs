//! Core identifiers, the error taxonomy, and the crate-wide `Result` alias.

use std::io;
use thiserror::Error;

pub mod checksum;

pub use checksum::{HashKind, HashValue};

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RastroError>;

/// Revision number of a committed snapshot. Revision 0 is the bootstrap.
pub type Revision = u32;

/// Key of a record inside a resource. Unique per index instance.
pub type NodeKey = u64;

/// Logical number of a record-leaf page inside an index trie.
pub type PageKey = u64;

/// Sentinel file key for a reference that has never been persisted.
pub const NULL_FILE_KEY: i64 = -1;

/// The index tries a resource maintains. Each kind has a fixed trie depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum IndexKind {
    /// The document tree itself: one instance per resource.
    Document,
    /// The path-summary tree: one instance per resource.
    PathSummary,
    /// Name dictionary indexes, one instance per node kind.
    Name,
    /// Content-and-structure indexes, one instance per index definition.
    Cas,
    /// Path indexes, one instance per index definition.
    Path,
}

impl IndexKind {
    /// Stable one-byte tag persisted on disk.
    pub fn tag(self) -> u8 {
        match self {
            IndexKind::Document => 0,
            IndexKind::PathSummary => 1,
            IndexKind::Name => 2,
            IndexKind::Cas => 3,
            IndexKind::Path => 4,
        }
    }

    /// Decodes a persisted tag.
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => IndexKind::Document,
            1 => IndexKind::PathSummary,
            2 => IndexKind::Name,
            3 => IndexKind::Cas,
            4 => IndexKind::Path,
            _ => return Err(RastroError::CorruptHeader("unknown index kind tag")),
        })
    }

    /// True for the kinds that address multiple instances through an
    /// `index_id` directory level.
    pub fn has_directory(self) -> bool {
        matches!(self, IndexKind::Name | IndexKind::Cas | IndexKind::Path)
    }
}

/// Where a checksum mismatch was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumScope {
    /// Hash over the compressed frame bytes (all non-leaf pages).
    CompressedFrame,
    /// Hash over the canonical uncompressed leaf bytes.
    LeafCanonical,
    /// One of the two UberPage beacon slots.
    Beacon,
}

impl std::fmt::Display for ChecksumScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChecksumScope::CompressedFrame => "compressed frame",
            ChecksumScope::LeafCanonical => "leaf canonical bytes",
            ChecksumScope::Beacon => "uber beacon",
        };
        f.write_str(name)
    }
}

/// Error taxonomy of the storage engine.
///
/// Every failure the engine surfaces carries one of these kinds with stable
/// identity; `Invalid` covers argument and state misuse that no dedicated
/// kind describes. All of them abort the enclosing transaction except where
/// the caller recovers a lock/backpressure wait locally, and `RecordNotFound`
/// is recoverable at the call site.
#[derive(Debug, Error)]
pub enum RastroError {
    /// Filesystem or channel failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk bytes do not hash to the reference's expected value.
    #[error("checksum mismatch at offset {offset} ({scope}): expected {expected}, actual {actual}")]
    ChecksumMismatch {
        /// File offset of the frame that failed verification.
        offset: u64,
        /// Which byte range the hash covers.
        scope: ChecksumScope,
        /// Hex rendering of the expected hash.
        expected: String,
        /// Hex rendering of the recomputed hash.
        actual: String,
    },
    /// Impossible page-kind tag, bad length prefix, or unknown hash length.
    #[error("corrupt header: {0}")]
    CorruptHeader(&'static str),
    /// A fragment chain is inconsistent with the configured window.
    #[error("versioning invariant violated: {0}")]
    VersioningInvariant(&'static str),
    /// A record key is negative or above the index capacity.
    #[error("record key {0} out of range")]
    KeyOutOfRange(u64),
    /// No live record exists at the key (never created, or removed).
    #[error("no record for key {0}")]
    RecordNotFound(u64),
    /// A documented non-null parameter was absent.
    #[error("missing required argument: {0}")]
    NullArg(&'static str),
    /// Operation on a closed session or transaction.
    #[error("resource is closed")]
    ClosedResource,
    /// A byte-pipe stage was asked to operate in a mode it does not support.
    #[error("unsupported compression mode: {0}")]
    UnsupportedCompression(&'static str),
    /// A write transaction was requested while another writer is active.
    #[error("an exclusive writer already exists for this resource")]
    SessionLimit,
    /// Invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl RastroError {
    /// Builds a `ChecksumMismatch` from raw hash values.
    pub fn checksum_mismatch(
        offset: u64,
        scope: ChecksumScope,
        expected: HashValue,
        actual: u64,
    ) -> Self {
        RastroError::ChecksumMismatch {
            offset,
            scope,
            expected: hex::encode(expected.to_bytes()),
            actual: hex::encode(HashValue::new(expected.kind(), actual).to_bytes()),
        }
    }
}
