//! Resource sessions and the page-level transaction surface.
//!
//! A [`Resource`] owns one versioned store: its configuration, backend,
//! shared page cache, and revision index. At most one [`WriteTxn`] exists at
//! any instant; read transactions are unbounded and operate on immutable
//! committed snapshots.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::cache::{CacheKey, PageCache};
use crate::io::{Reader, StorageBackend, StorageProviders};
use crate::page::{KeyValueLeafPage, Page, PageRef, RevisionRootPage, UberPage};
use crate::revindex::{RevisionIndex, RevisionIndexHolder};
use crate::trie::{self, FANOUT};
use crate::types::{IndexKind, NodeKey, PageKey, RastroError, Result, Revision};

pub mod config;
pub mod metrics;
pub mod reader;
pub mod writer;

pub use config::{BackendChoice, IndexBackend, ResourceConfig, StageKind, StringCompression};
pub use metrics::{StoreMetrics, StoreMetricsSnapshot};
pub use reader::ReadTxn;
pub use writer::WriteTxn;

pub(crate) struct ResourceInner {
    pub(crate) config: ResourceConfig,
    pub(crate) dir: PathBuf,
    pub(crate) backend: Box<dyn StorageBackend>,
    pub(crate) cache: Arc<PageCache>,
    pub(crate) holder: RevisionIndexHolder,
    pub(crate) current_uber: Mutex<UberPage>,
    pub(crate) metrics: Arc<StoreMetrics>,
    pub(crate) writer_active: AtomicBool,
    pub(crate) open_readers: Mutex<FxHashMap<Revision, usize>>,
    pub(crate) closed: AtomicBool,
}

impl ResourceInner {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RastroError::ClosedResource);
        }
        Ok(())
    }

    pub(crate) fn register_reader(&self, revision: Revision) {
        *self.open_readers.lock().entry(revision).or_insert(0) += 1;
    }

    pub(crate) fn release_reader(&self, revision: Revision) {
        let mut readers = self.open_readers.lock();
        if let Some(count) = readers.get_mut(&revision) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&revision);
            }
        }
    }

    pub(crate) fn readers_above(&self, revision: Revision) -> usize {
        self.open_readers
            .lock()
            .iter()
            .filter(|(r, _)| **r > revision)
            .map(|(_, count)| count)
            .sum()
    }
}

/// A handle on one versioned resource.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("dir", &self.inner.dir)
            .finish()
    }
}

impl Resource {
    /// Creates a resource in `dir` and runs the bootstrap commit, so the
    /// first user commit becomes revision 1.
    pub fn create(dir: impl AsRef<Path>, config: ResourceConfig) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(RastroError::from)?;
        config.save(dir)?;
        let backend = open_backend(dir, &config)?;
        if backend.uber_page_reference()?.is_some() {
            return Err(RastroError::Invalid("resource directory already initialized"));
        }
        let resource = Self::assemble(dir, config, backend, UberPage::bootstrap())?;
        {
            let mut txn = resource.begin_write()?;
            txn.commit(None, None, false)?;
        }
        debug!(dir = %dir.display(), "resource.create");
        Ok(resource)
    }

    /// Opens an existing resource, recovering the current UberPage from the
    /// beacon slots.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config = ResourceConfig::load(dir)?;
        let backend = open_backend(dir, &config)?;
        let uber = backend
            .uber_page_reference()?
            .ok_or(RastroError::Invalid("resource directory not initialized"))?;
        let resource = Self::assemble(dir, config, backend, uber)?;
        debug!(dir = %dir.display(), "resource.open");
        Ok(resource)
    }

    fn assemble(
        dir: &Path,
        config: ResourceConfig,
        backend: Box<dyn StorageBackend>,
        uber: UberPage,
    ) -> Result<Self> {
        let cache = Arc::new(PageCache::new(config.cache_capacity)?);
        let reader = backend.create_reader()?;
        let mut pairs = Vec::new();
        let recorded = reader.revision_count()?;
        for revision in 0..recorded.min(uber.revision_count()) {
            pairs.push(reader.revision_file_data(revision)?);
        }
        drop(reader);
        let timestamps = pairs.iter().map(|(_, ts)| *ts).collect();
        let offsets = pairs.iter().map(|(offset, _)| *offset).collect();
        let holder = RevisionIndexHolder::with_index(RevisionIndex::create(timestamps, offsets)?);
        Ok(Self {
            inner: Arc::new(ResourceInner {
                config,
                dir: dir.to_path_buf(),
                backend,
                cache,
                holder,
                current_uber: Mutex::new(uber),
                metrics: Arc::new(StoreMetrics::default()),
                writer_active: AtomicBool::new(false),
                open_readers: Mutex::new(FxHashMap::default()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The resource configuration.
    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    /// Directory the resource persists into.
    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    /// Snapshot of the resource's operation counters.
    pub fn metrics_snapshot(&self) -> StoreMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Latest committed revision visible to readers.
    pub fn latest_revision(&self) -> Option<Revision> {
        self.inner.holder.get().latest_revision()
    }

    /// Opens a read transaction on the latest committed revision.
    pub fn begin_read(&self) -> Result<ReadTxn> {
        let revision = self
            .latest_revision()
            .ok_or(RastroError::Invalid("no committed revision"))?;
        self.begin_read_at(revision)
    }

    /// Opens a read transaction on a specific revision.
    pub fn begin_read_at(&self, revision: Revision) -> Result<ReadTxn> {
        self.inner.check_open()?;
        ReadTxn::open(Arc::clone(&self.inner), revision)
    }

    /// Opens a read transaction on the latest revision committed at or
    /// before the wall-clock timestamp.
    pub fn begin_read_at_timestamp(&self, timestamp_millis: i64) -> Result<ReadTxn> {
        self.inner.check_open()?;
        let revision = self
            .inner
            .holder
            .get()
            .revision_at_or_before(timestamp_millis)
            .ok_or(RastroError::Invalid("no revision at or before timestamp"))?;
        ReadTxn::open(Arc::clone(&self.inner), revision)
    }

    /// Opens the single write transaction.
    pub fn begin_write(&self) -> Result<WriteTxn> {
        self.inner.check_open()?;
        if self
            .inner
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RastroError::SessionLimit);
        }
        match WriteTxn::open(Arc::clone(&self.inner)) {
            Ok(txn) => Ok(txn),
            Err(err) => {
                self.inner.writer_active.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Closes the resource; subsequent transactions fail with
    /// `ClosedResource`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

fn open_backend(dir: &Path, config: &ResourceConfig) -> Result<Box<dyn StorageBackend>> {
    let pipe = Arc::new(config.build_pipe());
    let settings = config.io_settings();
    match &config.backend {
        BackendChoice::Auto => StorageProviders::global().open_best(dir, pipe, settings),
        BackendChoice::Named(name) => {
            StorageProviders::global().open_named(name, dir, pipe, settings)
        }
    }
}

/// Loads a committed page through the shared cache.
pub(crate) fn load_page(
    inner: &ResourceInner,
    reader: &dyn Reader,
    reference: &PageRef,
) -> Result<Arc<Page>> {
    if !reference.is_persisted() {
        return Err(RastroError::Invalid("reference was never persisted"));
    }
    let key = CacheKey {
        resource_id: inner.config.resource_id,
        offset: reference.file_key() as u64,
    };
    if let Some(page) = inner.cache.get(key) {
        inner.metrics.add_cache_hit();
        return Ok(page);
    }
    let page = Arc::new(reader.read(key.offset, reference.hash())?);
    inner.metrics.add_page_read();
    inner.cache.insert(key, Arc::clone(&page));
    Ok(page)
}

/// Loads the fragment chain of a leaf reference, latest first: the verified
/// head plus the unverified older fragments listed in the reference.
pub(crate) fn load_leaf_fragments(
    inner: &ResourceInner,
    reader: &dyn Reader,
    reference: &PageRef,
) -> Result<Vec<KeyValueLeafPage>> {
    let mut fragments = Vec::with_capacity(1 + reference.fragments().len());
    let head = load_page(inner, reader, reference)?;
    fragments.push(head.as_leaf()?.clone());
    for fragment in reference.fragments() {
        let key = CacheKey {
            resource_id: inner.config.resource_id,
            offset: fragment.offset,
        };
        let page = match inner.cache.get(key) {
            Some(page) => page,
            None => {
                let page = Arc::new(reader.read(fragment.offset, None)?);
                inner.cache.insert(key, Arc::clone(&page));
                page
            }
        };
        fragments.push(page.as_leaf()?.clone());
    }
    Ok(fragments)
}

/// Reconstructs the logical leaf behind a committed reference.
pub(crate) fn combined_leaf(
    inner: &ResourceInner,
    reader: &dyn Reader,
    reference: &PageRef,
) -> Result<KeyValueLeafPage> {
    let fragments = load_leaf_fragments(inner, reader, reference)?;
    inner.metrics.add_leaf_reconstruction();
    inner
        .config
        .versioning
        .combine_for_read(fragments, inner.config.revs_to_restore)
}

/// Walks the committed trie from a revision root down to the reference of
/// the leaf holding `page_key`. `None` when the path was never grown.
pub(crate) fn walk_leaf_ref(
    inner: &ResourceInner,
    reader: &dyn Reader,
    root: &RevisionRootPage,
    kind: IndexKind,
    index_id: u32,
    page_key: PageKey,
) -> Result<Option<PageRef>> {
    if kind.has_directory() && index_id as usize >= FANOUT {
        return Err(RastroError::KeyOutOfRange(u64::from(index_id)));
    }
    let mut current = root.index_ref(kind).clone();
    if kind.has_directory() {
        if !current.is_persisted() {
            return Ok(None);
        }
        let page = load_page(inner, reader, &current)?;
        match page.as_indirect()?.reference(index_id as usize) {
            Some(next) => current = next.clone(),
            None => return Ok(None),
        }
    }
    for offset in trie::level_offsets(page_key, trie::depth(kind)) {
        if !current.is_persisted() {
            return Ok(None);
        }
        let page = load_page(inner, reader, &current)?;
        match page.as_indirect()?.reference(offset) {
            Some(next) => current = next.clone(),
            None => return Ok(None),
        }
    }
    if !current.is_persisted() {
        return Ok(None);
    }
    Ok(Some(current))
}

/// Materializes the record stored at `node_key` of a combined leaf,
/// resolving overflow payloads through the reference map.
pub(crate) fn record_from_leaf(
    inner: &ResourceInner,
    reader: &dyn Reader,
    leaf: &KeyValueLeafPage,
    node_key: NodeKey,
) -> Result<Option<crate::page::Record>> {
    let offset = trie::slot_offset_of(node_key);
    let Some(bytes) = leaf.slot(offset) else {
        return Ok(None);
    };
    if bytes.is_empty() {
        // Removal tombstone.
        return Ok(None);
    }
    let kind = bytes[0];
    let payload = if let Some(overflow_ref) = leaf.references().get(&node_key) {
        let page = load_page(inner, reader, overflow_ref)?;
        match &*page {
            Page::Overflow(overflow) => overflow.data().to_vec(),
            _ => {
                return Err(RastroError::CorruptHeader(
                    "overflow reference points at a non-overflow page",
                ))
            }
        }
    } else {
        bytes[1..].to_vec()
    };
    Ok(Some(crate::page::Record {
        node_key,
        kind,
        payload,
    }))
}
