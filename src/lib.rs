//! # Rastro - Versioned Tree-Document Storage Engine
//!
//! Rastro is an embedded, append-only storage engine for tree-structured
//! data with an unbounded linear revision history. Every commit produces an
//! immutable snapshot addressable by revision number or wall-clock
//! timestamp; writes are copy-on-write at page granularity through an
//! indirect-page trie rooted at an UberPage.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rastro::{IndexKind, Resource, ResourceConfig};
//!
//! let config = ResourceConfig::new(1, 1);
//! let resource = Resource::create("my-resource", config)?;
//!
//! // Stage and commit records through the single writer.
//! let mut txn = resource.begin_write()?;
//! let record = txn.create_record(7, b"payload".to_vec(), None, IndexKind::Document, 0)?;
//! txn.commit(Some("first revision"), None, false)?;
//!
//! // Read the committed snapshot.
//! let read = resource.begin_read()?;
//! let found = read.get_record(record.node_key, IndexKind::Document, 0)?;
//! assert!(found.is_some());
//! # Ok::<(), rastro::RastroError>(())
//! ```
//!
//! ## Architecture
//!
//! Bottom-up:
//! - **Byte pipe**: composable compression stages with stream and zero-copy
//!   segment shapes over a striped buffer pool.
//! - **Checksum engine**: content-addressing of every frame; the persisted
//!   hash length identifies the algorithm.
//! - **IO backends**: file-channel and memory-mapped implementations behind
//!   one reader/writer contract, discovered through a provider registry.
//! - **Page model**: UberPage, revision roots, indirect trie pages, and
//!   slot-addressed record leaves with fragment chains.
//! - **Versioning**: four reconstruction strategies combining leaf fragments
//!   on read.
//! - **Transaction intent log**: per-writer staging of dirty page
//!   containers, driving the post-order commit pipeline and the atomic
//!   UberPage swap.
//! - **Revision index**: timestamp → revision lookups over a dual
//!   sorted/Eytzinger layout, published copy-on-write.

pub mod cache;
pub mod io;
pub mod logging;
pub mod page;
pub mod primitives;
pub mod revindex;
pub mod store;
pub mod til;
pub mod trie;
pub mod types;
pub mod versioning;

// Re-export the main public API
pub use crate::cache::{PageCache, PageGuard};
pub use crate::page::{Record, UberPage};
pub use crate::revindex::{RevisionIndex, RevisionIndexHolder};
pub use crate::store::{
    ReadTxn, Resource, ResourceConfig, StoreMetricsSnapshot, StringCompression, WriteTxn,
};
pub use crate::types::{IndexKind, NodeKey, RastroError, Result, Revision};
pub use crate::versioning::Versioning;
