//! Read transactions: snapshot reads over one committed revision.

use std::sync::Arc;

use tracing::trace;

use crate::cache::{CacheKey, PageGuard};
use crate::io::Reader;
use crate::page::{Page, Record};
use crate::store::{combined_leaf, record_from_leaf, walk_leaf_ref, ResourceInner};
use crate::trie;
use crate::types::{IndexKind, NodeKey, RastroError, Result, Revision};

/// A read transaction pinned to one committed revision.
///
/// The transaction owns a clone of the revision root, so the same key always
/// resolves to the same result regardless of later commits.
pub struct ReadTxn {
    inner: Arc<ResourceInner>,
    reader: Box<dyn Reader>,
    root: crate::page::RevisionRootPage,
    revision: Revision,
    closed: bool,
}

impl std::fmt::Debug for ReadTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTxn")
            .field("revision", &self.revision)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ReadTxn {
    pub(crate) fn open(inner: Arc<ResourceInner>, revision: Revision) -> Result<Self> {
        let latest = inner
            .holder
            .get()
            .latest_revision()
            .ok_or(RastroError::Invalid("no committed revision"))?;
        if revision > latest {
            return Err(RastroError::Invalid("revision not committed yet"));
        }
        let reader = inner.backend.create_reader()?;
        let root = reader
            .read_revision_root(revision)?
            .as_revision_root()?
            .clone();
        inner.register_reader(revision);
        trace!(revision, "readtxn.open");
        Ok(Self {
            inner,
            reader,
            root,
            revision,
            closed: false,
        })
    }

    /// The revision this transaction observes.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Commit timestamp of the observed revision.
    pub fn commit_timestamp_millis(&self) -> i64 {
        self.root.commit_timestamp_millis()
    }

    /// Commit message of the observed revision.
    pub fn commit_message(&self) -> Option<&str> {
        self.root.commit_message()
    }

    /// Highest allocated record key of an index, if any.
    pub fn max_node_key(&self, kind: IndexKind, index_id: u32) -> Option<u64> {
        self.root.max_node_key(kind, index_id)
    }

    /// Fetches a record by key, reconstructing its leaf from the fragment
    /// chain as dictated by the configured versioning strategy.
    pub fn get_record(
        &self,
        node_key: NodeKey,
        kind: IndexKind,
        index_id: u32,
    ) -> Result<Option<Record>> {
        self.check_open()?;
        trie::check_node_key(kind, node_key)?;
        let page_key = trie::page_key_of(node_key);
        let Some(reference) = walk_leaf_ref(
            &self.inner,
            &*self.reader,
            &self.root,
            kind,
            index_id,
            page_key,
        )?
        else {
            return Ok(None);
        };
        let leaf = combined_leaf(&self.inner, &*self.reader, &reference)?;
        record_from_leaf(&self.inner, &*self.reader, &leaf, node_key)
    }

    /// Pins the leaf holding `node_key` behind a guard, so its bytes stay
    /// reclaim-safe across cache eviction until the guard drops.
    pub fn pin_leaf(
        &self,
        node_key: NodeKey,
        kind: IndexKind,
        index_id: u32,
    ) -> Result<Option<PageGuard>> {
        self.check_open()?;
        trie::check_node_key(kind, node_key)?;
        let page_key = trie::page_key_of(node_key);
        let Some(reference) = walk_leaf_ref(
            &self.inner,
            &*self.reader,
            &self.root,
            kind,
            index_id,
            page_key,
        )?
        else {
            return Ok(None);
        };
        let leaf = combined_leaf(&self.inner, &*self.reader, &reference)?;
        let key = CacheKey {
            resource_id: self.inner.config.resource_id,
            offset: reference.file_key() as u64,
        };
        Ok(Some(PageGuard::new(key, Arc::new(Page::Leaf(leaf)))))
    }

    /// Dewey id stored for `node_key`, when the sidecar is enabled.
    pub fn get_dewey_id(
        &self,
        node_key: NodeKey,
        kind: IndexKind,
        index_id: u32,
    ) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        trie::check_node_key(kind, node_key)?;
        let page_key = trie::page_key_of(node_key);
        let Some(reference) = walk_leaf_ref(
            &self.inner,
            &*self.reader,
            &self.root,
            kind,
            index_id,
            page_key,
        )?
        else {
            return Ok(None);
        };
        let leaf = combined_leaf(&self.inner, &*self.reader, &reference)?;
        Ok(leaf
            .dewey_id(trie::slot_offset_of(node_key))
            .map(|d| d.to_vec()))
    }

    /// Cooperative close; also performed on drop.
    pub fn close(&mut self) {
        if !self.closed {
            self.inner.release_reader(self.revision);
            self.closed = true;
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(RastroError::ClosedResource);
        }
        self.inner.check_open()
    }
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        self.close();
    }
}
