//! The write transaction: record staging, the transaction intent log, and
//! the commit pipeline.
//!
//! One writer exists per resource. Record operations stage copy-on-write
//! page containers in the intent log, keeping the eager-cascade invariant:
//! whenever a record leaf is dirty, every indirect page on its root path up
//! to the UberPage's revision trie is dirty too. Commit traverses the log in
//! post-order from the leaves, so every page is written after its children
//! and the UberPage swap at the end publishes the revision atomically.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::cache::{CacheKey, PageGuard};
use crate::io::Writer;
use crate::page::{
    IndirectPage, KeyValueLeafPage, LogKey, OverflowPage, Page, PageFragmentKey, PageKind,
    PageRef, Record, RevisionRootPage, UberPage, OVERFLOW_THRESHOLD,
};
use crate::revindex::RevisionIndex;
use crate::store::{load_leaf_fragments, load_page, ResourceInner};
use crate::til::{IntentLog, PageContainer};
use crate::trie::{self, FANOUT, REVISION_TRIE_DEPTH};
use crate::types::checksum::HashValue;
use crate::types::{IndexKind, NodeKey, PageKey, RastroError, Result, Revision};
use crate::versioning::Versioning;

/// Upper bound on registered pre/post commit hooks.
const MAX_COMMIT_HOOKS: usize = 16;
/// Record kind tag used for name-dictionary records.
const NAME_RECORD_KIND: u8 = 1;

/// A commit hook: invoked with the revision root inside the commit path.
pub type CommitHook = Box<dyn FnMut(&RevisionRootPage) + Send>;

#[derive(Debug, Clone, Copy)]
struct FragMeta {
    head_revision: Revision,
    combined: usize,
}

#[derive(Debug, Clone)]
struct PersistedRef {
    offset: u64,
    hash: HashValue,
    fragments: SmallVec<[PageFragmentKey; 4]>,
}

struct CommitOutcome {
    uber: UberPage,
    persisted: FxHashMap<usize, PersistedRef>,
    revision: Revision,
    revroot_offset: u64,
    timestamp: i64,
}

struct CommitCtx {
    versioning: Versioning,
    revs_to_restore: u32,
    new_revision: Revision,
    frag_meta: FxHashMap<usize, FragMeta>,
    persisted: FxHashMap<usize, PersistedRef>,
    revroot_offset: Option<u64>,
    pages_written: u64,
}

#[derive(Debug, Clone, Copy)]
enum ChildSlot {
    IndexRoot(IndexKind),
    Directory(usize),
    Level(usize),
}

enum ChildBuild {
    Indirect,
    RevisionRoot(Box<RevisionRootPage>),
    Leaf {
        page_key: PageKey,
        kind: IndexKind,
        index_id: u32,
    },
}

enum LeafSnapshot {
    Staged(LogKey),
    Owned(KeyValueLeafPage),
}

impl std::fmt::Debug for WriteTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("new_revision", &self.new_revision)
            .finish()
    }
}

/// The exclusive write transaction of a resource.
pub struct WriteTxn {
    inner: Arc<ResourceInner>,
    reader: Box<dyn crate::io::Reader>,
    writer: Arc<Mutex<Box<dyn Writer>>>,
    til: IntentLog,
    generation: u64,
    former: Option<Arc<Mutex<IntentLog>>>,
    former_generation: u64,
    pending: Option<JoinHandle<Result<CommitOutcome>>>,
    uber: UberPage,
    root_key: Option<LogKey>,
    new_revision: Revision,
    frag_meta: FxHashMap<usize, FragMeta>,
    name_keys: FxHashMap<(u32, String), i32>,
    names_scanned: Vec<u32>,
    current_node: Option<(IndexKind, u32, NodeKey)>,
    last_document_page: Option<PageKey>,
    document_boundary_crossed: bool,
    buffers: Vec<BytesMut>,
    pre_commit_hooks: Vec<CommitHook>,
    post_commit_hooks: Vec<CommitHook>,
    user_dirty: bool,
    closed: bool,
}

impl WriteTxn {
    pub(crate) fn open(inner: Arc<ResourceInner>) -> Result<Self> {
        let reader = inner.backend.create_reader()?;
        let writer = Arc::new(Mutex::new(inner.backend.create_writer()?));
        let uber = inner.current_uber.lock().clone();
        let new_revision = uber.next_revision();
        let root = if uber.is_bootstrap() {
            RevisionRootPage::bootstrap()
        } else {
            let latest = uber
                .latest_revision()
                .ok_or(RastroError::CorruptHeader("uber page counts no revision"))?;
            reader
                .read_revision_root(latest)?
                .as_revision_root()?
                .next_revision()
        };
        let mut txn = Self {
            inner,
            reader,
            writer,
            til: IntentLog::new(1),
            generation: 1,
            former: None,
            former_generation: 0,
            pending: None,
            uber,
            root_key: None,
            new_revision,
            frag_meta: FxHashMap::default(),
            name_keys: FxHashMap::default(),
            names_scanned: Vec::new(),
            current_node: None,
            last_document_page: None,
            document_boundary_crossed: false,
            buffers: Vec::new(),
            pre_commit_hooks: Vec::new(),
            post_commit_hooks: Vec::new(),
            user_dirty: false,
            closed: false,
        };
        txn.stage_root_path(root)?;
        debug!(revision = txn.new_revision, "writetxn.open");
        Ok(txn)
    }

    /// Revision number the next commit will produce.
    pub fn revision(&self) -> Revision {
        self.new_revision
    }

    /// Hands out a reusable scratch buffer for record serialization.
    pub fn new_buffered_bytes(&mut self) -> BytesMut {
        self.buffers
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(4096))
    }

    /// Returns a scratch buffer for reuse.
    pub fn return_buffered_bytes(&mut self, mut buffer: BytesMut) {
        buffer.clear();
        self.buffers.push(buffer);
    }

    /// Registers a hook invoked with the stamped revision root right before
    /// pages are persisted.
    pub fn on_pre_commit(&mut self, hook: CommitHook) -> Result<()> {
        if self.pre_commit_hooks.len() == MAX_COMMIT_HOOKS {
            return Err(RastroError::Invalid("pre-commit hook list is full"));
        }
        self.pre_commit_hooks.push(hook);
        Ok(())
    }

    /// Registers a hook invoked after the revision became visible.
    pub fn on_post_commit(&mut self, hook: CommitHook) -> Result<()> {
        if self.post_commit_hooks.len() == MAX_COMMIT_HOOKS {
            return Err(RastroError::Invalid("post-commit hook list is full"));
        }
        self.post_commit_hooks.push(hook);
        Ok(())
    }

    /// Allocates a fresh node key in the highest non-full leaf of the index
    /// and stores the record there. Not durable until commit.
    pub fn create_record(
        &mut self,
        kind: u8,
        payload: Vec<u8>,
        dewey_id: Option<Vec<u8>>,
        index: IndexKind,
        index_id: u32,
    ) -> Result<Record> {
        self.check_open()?;
        let node_key = self.root_mut()?.allocate_node_key(index, index_id);
        trie::check_node_key(index, node_key)?;
        let record = Record {
            node_key,
            kind,
            payload,
        };
        self.put_record(record.clone(), dewey_id, index, index_id)?;
        if index == IndexKind::Document {
            let page_key = trie::page_key_of(node_key);
            if self.last_document_page.is_some() && self.last_document_page != Some(page_key) {
                self.document_boundary_crossed = true;
            }
            self.last_document_page = Some(page_key);
        }
        self.current_node = Some((index, index_id, node_key));
        Ok(record)
    }

    /// Stores a record at an explicit key; shared by record creation and the
    /// name dictionary.
    fn put_record(
        &mut self,
        record: Record,
        dewey_id: Option<Vec<u8>>,
        index: IndexKind,
        index_id: u32,
    ) -> Result<()> {
        self.user_dirty = true;
        let node_key = record.node_key;
        let page_key = trie::page_key_of(node_key);
        let offset = trie::slot_offset_of(node_key);
        let leaf_key = self.ensure_leaf_staged(index, index_id, page_key)?;

        let overflow_key = if record.payload.len() > OVERFLOW_THRESHOLD {
            Some(self.til.push(PageContainer::mirrored(Page::Overflow(
                OverflowPage::new(record.payload.clone()),
            ))))
        } else {
            None
        };

        let (database_id, resource_id) = (
            self.inner.config.database_id,
            self.inner.config.resource_id,
        );
        let container = self
            .til
            .get_by_key_mut(leaf_key)
            .ok_or(RastroError::Invalid("leaf vanished from the intent log"))?;
        let slot_bytes = match overflow_key {
            Some(_) => vec![record.kind],
            None => record.to_slot_bytes(),
        };
        let overflow_ref = overflow_key.map(|key| {
            let mut reference = PageRef::unset();
            reference.assign_ids(database_id, resource_id);
            reference.set_log_key(key);
            reference
        });

        let modified = container.modified.as_leaf_mut()?;
        if let Some(reference) = &overflow_ref {
            modified.references_mut().insert(node_key, reference.clone());
            modified.set_slot(offset, slot_bytes.clone());
        } else {
            modified.install_record(offset, record);
            modified.sync_record_slot(offset);
        }
        if let Some(dewey) = &dewey_id {
            modified.set_dewey_id(offset, dewey.clone());
        }

        let complete = container.complete.as_leaf_mut()?;
        complete.set_slot(offset, slot_bytes);
        if let Some(reference) = overflow_ref {
            complete.references_mut().insert(node_key, reference);
        }
        if let Some(dewey) = dewey_id {
            complete.set_dewey_id(offset, dewey);
        }
        Ok(())
    }

    /// Reads a record, promotes its leaf into the intent log, and returns
    /// the mutable in-memory instance. Repeated calls for the same key
    /// return the same instance within the transaction.
    pub fn prepare_record_for_modification(
        &mut self,
        node_key: NodeKey,
        index: IndexKind,
        index_id: u32,
    ) -> Result<&mut Record> {
        self.check_open()?;
        trie::check_node_key(index, node_key)?;
        self.user_dirty = true;
        let page_key = trie::page_key_of(node_key);
        let offset = trie::slot_offset_of(node_key);
        let leaf_key = self.ensure_leaf_staged(index, index_id, page_key)?;
        self.current_node = Some((index, index_id, node_key));

        let (slot_bytes, overflow_ref) = {
            let container = self
                .til
                .get_by_key(leaf_key)
                .ok_or(RastroError::Invalid("leaf vanished from the intent log"))?;
            let complete = container.complete.as_leaf()?;
            (
                complete.slot(offset).map(|b| b.to_vec()),
                complete.references().get(&node_key).cloned(),
            )
        };
        let Some(slot_bytes) = slot_bytes else {
            return Err(RastroError::RecordNotFound(node_key));
        };
        if slot_bytes.is_empty() {
            // Removal tombstone.
            return Err(RastroError::RecordNotFound(node_key));
        }
        let payload = match &overflow_ref {
            Some(reference) => self.resolve_overflow_payload(reference)?,
            None => slot_bytes[1..].to_vec(),
        };

        let container = self
            .til
            .get_by_key_mut(leaf_key)
            .ok_or(RastroError::Invalid("leaf vanished from the intent log"))?;
        let modified = container.modified.as_leaf_mut()?;
        if modified.peek_record(offset).is_none() {
            modified.install_record(
                offset,
                Record {
                    node_key,
                    kind: slot_bytes[0],
                    payload,
                },
            );
        }
        modified
            .record_mut(offset)?
            .ok_or(RastroError::RecordNotFound(node_key))
    }

    /// Persists the in-memory record instance back into its slot bytes,
    /// keeping the dirty write view in sync with the logical record.
    pub fn update_record_slot(
        &mut self,
        node_key: NodeKey,
        index: IndexKind,
        index_id: u32,
    ) -> Result<()> {
        self.check_open()?;
        let page_key = trie::page_key_of(node_key);
        let offset = trie::slot_offset_of(node_key);
        let leaf_key = self.ensure_leaf_staged(index, index_id, page_key)?;

        let record = {
            let container = self
                .til
                .get_by_key(leaf_key)
                .ok_or(RastroError::Invalid("leaf vanished from the intent log"))?;
            container
                .modified
                .as_leaf()?
                .peek_record(offset)
                .cloned()
                .ok_or(RastroError::Invalid(
                    "record was not prepared for modification",
                ))?
        };

        let overflow_key = if record.payload.len() > OVERFLOW_THRESHOLD {
            Some(self.til.push(PageContainer::mirrored(Page::Overflow(
                OverflowPage::new(record.payload.clone()),
            ))))
        } else {
            None
        };
        let (database_id, resource_id) = (
            self.inner.config.database_id,
            self.inner.config.resource_id,
        );

        let container = self
            .til
            .get_by_key_mut(leaf_key)
            .ok_or(RastroError::Invalid("leaf vanished from the intent log"))?;
        let slot_bytes = match overflow_key {
            Some(_) => vec![record.kind],
            None => record.to_slot_bytes(),
        };
        let overflow_ref = overflow_key.map(|key| {
            let mut reference = PageRef::unset();
            reference.assign_ids(database_id, resource_id);
            reference.set_log_key(key);
            reference
        });

        let modified = container.modified.as_leaf_mut()?;
        modified.set_slot(offset, slot_bytes.clone());
        match &overflow_ref {
            Some(reference) => {
                modified.references_mut().insert(node_key, reference.clone());
            }
            None => {
                modified.references_mut().remove(&node_key);
            }
        }
        let complete = container.complete.as_leaf_mut()?;
        complete.set_slot(offset, slot_bytes);
        match overflow_ref {
            Some(reference) => {
                complete.references_mut().insert(node_key, reference);
            }
            None => {
                complete.references_mut().remove(&node_key);
            }
        }
        Ok(())
    }

    /// Marks the record's slot as removed in the dirty write view.
    pub fn remove_record(
        &mut self,
        node_key: NodeKey,
        index: IndexKind,
        index_id: u32,
    ) -> Result<()> {
        self.check_open()?;
        trie::check_node_key(index, node_key)?;
        self.user_dirty = true;
        let page_key = trie::page_key_of(node_key);
        let offset = trie::slot_offset_of(node_key);
        let leaf_key = self.ensure_leaf_staged(index, index_id, page_key)?;
        let container = self
            .til
            .get_by_key_mut(leaf_key)
            .ok_or(RastroError::Invalid("leaf vanished from the intent log"))?;
        container.modified.as_leaf_mut()?.tombstone_slot(offset);
        container.complete.as_leaf_mut()?.tombstone_slot(offset);
        Ok(())
    }

    /// Fetches a record through the writer's own state: staged pages first
    /// (read-your-writes), then the committed trie.
    pub fn get_record(
        &mut self,
        node_key: NodeKey,
        index: IndexKind,
        index_id: u32,
    ) -> Result<Option<Record>> {
        self.check_open()?;
        trie::check_node_key(index, node_key)?;
        let page_key = trie::page_key_of(node_key);
        let offset = trie::slot_offset_of(node_key);
        self.current_node = Some((index, index_id, node_key));
        let Some(snapshot) = self.resolve_leaf_for_read(index, index_id, page_key)? else {
            return Ok(None);
        };
        let (slot_bytes, overflow_ref) = match &snapshot {
            LeafSnapshot::Staged(key) => {
                let container = self
                    .til
                    .get_by_key(*key)
                    .ok_or(RastroError::Invalid("leaf vanished from the intent log"))?;
                let modified = container.modified.as_leaf()?;
                if let Some(record) = modified.peek_record(offset) {
                    return Ok(Some(record.clone()));
                }
                let complete = container.complete.as_leaf()?;
                (
                    complete.slot(offset).map(|b| b.to_vec()),
                    complete.references().get(&node_key).cloned(),
                )
            }
            LeafSnapshot::Owned(leaf) => (
                leaf.slot(offset).map(|b| b.to_vec()),
                leaf.references().get(&node_key).cloned(),
            ),
        };
        let Some(slot_bytes) = slot_bytes else {
            return Ok(None);
        };
        if slot_bytes.is_empty() {
            return Ok(None);
        }
        let payload = match overflow_ref {
            Some(reference) => self.resolve_overflow_payload(&reference)?,
            None => slot_bytes[1..].to_vec(),
        };
        Ok(Some(Record {
            node_key,
            kind: slot_bytes[0],
            payload,
        }))
    }

    /// Interns a name for the given node kind and returns its stable key
    /// within the resource.
    pub fn create_name_key(&mut self, name: &str, node_kind: u32) -> Result<i32> {
        self.check_open()?;
        if name.is_empty() {
            return Err(RastroError::NullArg("name"));
        }
        let cache_key = (node_kind, name.to_string());
        if let Some(key) = self.name_keys.get(&cache_key) {
            return Ok(*key);
        }
        if !self.names_scanned.contains(&node_kind) {
            let counter = self.root()?.name_key_counter();
            for key in 0..counter {
                if let Some(record) =
                    self.get_record(key as u64, IndexKind::Name, node_kind)?
                {
                    if let Ok(existing) = String::from_utf8(record.payload) {
                        self.name_keys.insert((node_kind, existing), key);
                    }
                }
            }
            self.names_scanned.push(node_kind);
            if let Some(key) = self.name_keys.get(&cache_key) {
                return Ok(*key);
            }
        }
        let key = self.root_mut()?.next_name_key();
        self.put_record(
            Record {
                node_key: key as u64,
                kind: NAME_RECORD_KIND,
                payload: name.as_bytes().to_vec(),
            },
            None,
            IndexKind::Name,
            node_kind,
        )?;
        self.name_keys.insert(cache_key, key);
        trace!(key, node_kind, "writetxn.create_name_key");
        Ok(key)
    }

    /// Pins the page holding the current cursor node. The guard serves a
    /// stable snapshot of the page bytes until dropped.
    pub fn acquire_guard_for_current_node(&mut self) -> Result<PageGuard> {
        self.check_open()?;
        let (index, index_id, node_key) = self
            .current_node
            .ok_or(RastroError::Invalid("no current node to guard"))?;
        let page_key = trie::page_key_of(node_key);
        let snapshot = self
            .resolve_leaf_for_read(index, index_id, page_key)?
            .ok_or(RastroError::Invalid("current node has no page"))?;
        let leaf = match snapshot {
            LeafSnapshot::Staged(key) => {
                let container = self
                    .til
                    .get_by_key(key)
                    .ok_or(RastroError::Invalid("leaf vanished from the intent log"))?;
                let mut leaf = container.complete.as_leaf()?.clone();
                leaf.serialize_records();
                leaf
            }
            LeafSnapshot::Owned(leaf) => leaf,
        };
        let cache_key = CacheKey {
            resource_id: self.inner.config.resource_id,
            offset: u64::MAX,
        };
        Ok(PageGuard::new(cache_key, Arc::new(Page::Leaf(leaf))))
    }

    /// Serializes the record objects of any dirty document leaf whose page
    /// boundary was crossed by the latest inserts, releasing the objects to
    /// the allocator. A memory-bound hint, not a durability operation.
    pub fn eager_serialize_pages_if_page_boundary_crossed(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.document_boundary_crossed {
            return Ok(());
        }
        self.document_boundary_crossed = false;
        let keep = self.last_document_page;
        for (_, container) in self.til.iter_mut() {
            if let Page::Leaf(leaf) = &mut container.modified {
                if leaf.index() == IndexKind::Document && Some(leaf.page_key()) != keep {
                    leaf.serialize_records();
                }
            }
        }
        Ok(())
    }

    /// Rotates the intent log and commits the rotated state on a background
    /// worker. Blocks when a previous intermediate commit is still in
    /// flight.
    pub fn async_intermediate_commit(&mut self, message: Option<&str>) -> Result<()> {
        self.check_open()?;
        if self.pending.is_some() {
            self.await_pending_async_commit()?;
        }
        let timestamp = self.clamped_now();
        let root_snapshot = {
            let root = self.root_mut()?;
            root.stamp_commit(timestamp, message.map(String::from), None);
            root.clone()
        };
        for hook in &mut self.pre_commit_hooks {
            hook(&root_snapshot);
        }

        let mut uber = self.uber.clone();
        uber.record_commit();
        let revision = self.new_revision;

        let rotated = std::mem::replace(&mut self.til, IntentLog::new(self.generation + 1));
        self.former_generation = self.generation;
        self.generation += 1;
        let former = Arc::new(Mutex::new(rotated));
        self.former = Some(Arc::clone(&former));
        let frag_meta = std::mem::take(&mut self.frag_meta);

        // Prepare the foreground for the next revision before the worker
        // starts: the root path is cloned out of the rotated log while it is
        // guaranteed uncontended.
        self.uber.record_commit();
        self.new_revision = revision + 1;
        self.root_key = None;
        self.user_dirty = false;
        self.last_document_page = None;
        self.stage_root_path(root_snapshot.next_revision())?;

        let writer = Arc::clone(&self.writer);
        let inner = Arc::clone(&self.inner);
        let versioning = self.inner.config.versioning;
        let revs_to_restore = self.inner.config.revs_to_restore;
        let handle = std::thread::spawn(move || -> Result<CommitOutcome> {
            let mut writer = writer.lock();
            let mut ctx = CommitCtx {
                versioning,
                revs_to_restore,
                new_revision: revision,
                frag_meta,
                persisted: FxHashMap::default(),
                revroot_offset: None,
                pages_written: 0,
            };
            persist_reference(uber.revision_trie_ref_mut(), &former, &mut **writer, &mut ctx)?;
            let revroot_offset = ctx
                .revroot_offset
                .ok_or(RastroError::Invalid("commit produced no revision root"))?;
            writer.append_revision_entry(revision, revroot_offset, timestamp)?;
            let mut uber_frame = Page::Uber(uber.clone());
            writer.write_page(&mut uber_frame)?;
            writer.write_uber_beacons(&mut uber)?;
            writer.sync()?;
            inner.holder.add_revision(revroot_offset, timestamp)?;
            *inner.current_uber.lock() = uber.clone();
            inner.metrics.add_pages_written(ctx.pages_written + 1);
            inner.metrics.add_commit();
            inner.metrics.add_intermediate_commit();
            Ok(CommitOutcome {
                uber,
                persisted: ctx.persisted,
                revision,
                revroot_offset,
                timestamp,
            })
        });
        self.pending = Some(handle);
        debug!(revision, "writetxn.async_intermediate_commit");
        Ok(())
    }

    /// Barrier: joins the in-flight intermediate commit, then patches every
    /// reference that still points into the rotated log with the persisted
    /// locations.
    pub fn await_pending_async_commit(&mut self) -> Result<()> {
        let Some(handle) = self.pending.take() else {
            // A rotated log with no worker in flight is the residue of a
            // failed join; nothing can heal through it anymore.
            self.former = None;
            return Ok(());
        };
        let outcome = handle
            .join()
            .map_err(|_| RastroError::Invalid("async commit worker panicked"))??;
        let former_generation = self.former_generation;
        let persisted = &outcome.persisted;
        for (_, container) in self.til.iter_mut() {
            container
                .complete
                .for_each_reference_mut(|r| heal_reference(r, former_generation, persisted));
            container
                .modified
                .for_each_reference_mut(|r| heal_reference(r, former_generation, persisted));
        }
        heal_reference(
            self.uber.revision_trie_ref_mut(),
            former_generation,
            persisted,
        );
        self.former = None;
        trace!(
            revision = outcome.revision,
            offset = outcome.revroot_offset,
            ts = outcome.timestamp,
            "writetxn.await_async_commit"
        );
        Ok(())
    }

    /// Commits the staged state as the next revision and returns the newly
    /// published UberPage.
    pub fn commit(
        &mut self,
        message: Option<&str>,
        timestamp: Option<i64>,
        is_auto: bool,
    ) -> Result<UberPage> {
        self.check_open()?;
        self.await_pending_async_commit()?;

        let timestamp = match timestamp {
            Some(ts) => {
                if let Some(latest) = self.inner.holder.get().latest_revision() {
                    if ts < self.inner.holder.get().get_timestamp(latest)? {
                        return Err(RastroError::Invalid(
                            "commit timestamp precedes the last revision",
                        ));
                    }
                }
                ts
            }
            None => self.clamped_now(),
        };

        let root_snapshot = {
            let root = self.root_mut()?;
            root.stamp_commit(timestamp, message.map(String::from), None);
            root.clone()
        };
        for hook in &mut self.pre_commit_hooks {
            hook(&root_snapshot);
        }

        let result = self.persist_staged(timestamp, is_auto);
        match result {
            Ok(uber) => {
                for hook in &mut self.post_commit_hooks {
                    hook(&root_snapshot);
                }
                self.user_dirty = false;
                self.last_document_page = None;
                self.document_boundary_crossed = false;
                self.current_node = None;
                // Restage from the persisted root: the pre-persist snapshot
                // still carries staging identities and pre-commit locations.
                let committed = uber
                    .latest_revision()
                    .ok_or(RastroError::CorruptHeader("uber page counts no revision"))?;
                let root = self
                    .reader
                    .read_revision_root(committed)?
                    .as_revision_root()?
                    .next_revision();
                self.stage_root_path(root)?;
                Ok(uber)
            }
            Err(err) => {
                warn!(%err, "writetxn.commit failed; rolling back");
                self.reset_to_durable()?;
                Err(err)
            }
        }
    }

    fn persist_staged(&mut self, timestamp: i64, is_auto: bool) -> Result<UberPage> {
        let mut uber = self.uber.clone();
        uber.record_commit();
        let revision = self.new_revision;
        let til = Mutex::new(std::mem::replace(
            &mut self.til,
            IntentLog::new(self.generation + 1),
        ));
        self.generation += 1;
        self.root_key = None;
        let mut ctx = CommitCtx {
            versioning: self.inner.config.versioning,
            revs_to_restore: self.inner.config.revs_to_restore,
            new_revision: revision,
            frag_meta: std::mem::take(&mut self.frag_meta),
            persisted: FxHashMap::default(),
            revroot_offset: None,
            pages_written: 0,
        };
        {
            let mut writer = self.writer.lock();
            persist_reference(uber.revision_trie_ref_mut(), &til, &mut **writer, &mut ctx)?;
            let revroot_offset = ctx
                .revroot_offset
                .ok_or(RastroError::Invalid("commit produced no revision root"))?;
            writer.append_revision_entry(revision, revroot_offset, timestamp)?;
            let mut uber_frame = Page::Uber(uber.clone());
            writer.write_page(&mut uber_frame)?;
            writer.write_uber_beacons(&mut uber)?;
            if is_auto {
                let writer_handle = Arc::clone(&self.writer);
                std::thread::spawn(move || {
                    let mut writer = writer_handle.lock();
                    if let Err(err) = writer.sync() {
                        warn!(%err, "writetxn.auto_commit background sync failed");
                    }
                });
            } else {
                writer.sync()?;
            }
            self.inner.holder.add_revision(revroot_offset, timestamp)?;
            debug!(
                revision,
                offset = revroot_offset,
                ts = timestamp,
                "writetxn.commit"
            );
        }
        *self.inner.current_uber.lock() = uber.clone();
        self.inner.metrics.add_pages_written(ctx.pages_written + 1);
        self.inner.metrics.add_commit();
        self.uber = uber.clone();
        self.new_revision = revision + 1;
        Ok(uber)
    }

    /// Discards every staged change; the previous durable UberPage remains
    /// authoritative. Returns that UberPage.
    pub fn rollback(&mut self) -> Result<UberPage> {
        self.check_open()?;
        self.await_pending_async_commit()?;
        self.reset_to_durable()?;
        debug!(revision = self.new_revision, "writetxn.rollback");
        Ok(self.uber.clone())
    }

    fn reset_to_durable(&mut self) -> Result<()> {
        self.generation += 1;
        self.til = IntentLog::new(self.generation);
        self.frag_meta.clear();
        self.root_key = None;
        self.user_dirty = false;
        self.current_node = None;
        self.last_document_page = None;
        self.document_boundary_crossed = false;
        // Interned names staged in the discarded log never became durable.
        self.name_keys.clear();
        self.names_scanned.clear();
        self.former = None;
        self.pending = None;
        self.uber = self.inner.current_uber.lock().clone();
        self.new_revision = self.uber.next_revision();
        let root = if self.uber.is_bootstrap() {
            RevisionRootPage::bootstrap()
        } else {
            let latest = self
                .uber
                .latest_revision()
                .ok_or(RastroError::CorruptHeader("uber page counts no revision"))?;
            self.reader
                .read_revision_root(latest)?
                .as_revision_root()?
                .next_revision()
        };
        self.stage_root_path(root)
    }

    /// Physically cuts the history to `revision`: the data file ends right
    /// after that revision's root frame, the revisions file drops the later
    /// entries, and rebuilt trie pages plus a fresh UberPage are appended
    /// and published.
    pub fn truncate_to(&mut self, revision: Revision) -> Result<()> {
        self.check_open()?;
        self.await_pending_async_commit()?;
        if self.user_dirty {
            return Err(RastroError::Invalid(
                "staged changes pending; commit or roll back first",
            ));
        }
        let latest = self
            .uber
            .latest_revision()
            .ok_or(RastroError::Invalid("nothing committed to truncate"))?;
        if revision > latest {
            return Err(RastroError::Invalid("revision not committed yet"));
        }
        if self.inner.readers_above(revision) > 0 {
            return Err(RastroError::Invalid(
                "open readers on higher revisions block truncation",
            ));
        }

        let (root_offset, _) = self.reader.revision_file_data(revision)?;
        let cut = self.reader.frame_end_offset(root_offset)?;
        let entries: Vec<(u64, i64)> = (0..=revision)
            .map(|r| self.reader.revision_file_data(r))
            .collect::<Result<_>>()?;

        {
            let mut writer = self.writer.lock();
            writer.truncate_to(revision, cut)?;
            let trie_ref = build_revision_trie(&mut **writer, &entries)?;
            let mut uber = UberPage::rebuilt(revision + 1, trie_ref);
            let mut uber_frame = Page::Uber(uber.clone());
            writer.write_page(&mut uber_frame)?;
            writer.write_uber_beacons(&mut uber)?;
            writer.sync()?;
            self.uber = uber.clone();
            *self.inner.current_uber.lock() = uber;
        }
        self.inner.cache.purge_resource(self.inner.config.resource_id);
        let timestamps = entries.iter().map(|(_, ts)| *ts).collect();
        let offsets = entries.iter().map(|(offset, _)| *offset).collect();
        self.inner
            .holder
            .update(Arc::new(RevisionIndex::create(timestamps, offsets)?));

        self.generation += 1;
        self.til = IntentLog::new(self.generation);
        self.frag_meta.clear();
        self.root_key = None;
        self.new_revision = revision + 1;
        let root = self
            .reader
            .read_revision_root(revision)?
            .as_revision_root()?
            .next_revision();
        self.stage_root_path(root)?;
        debug!(revision, cut, "writetxn.truncate_to");
        Ok(())
    }

    /// Cooperative close; also performed on drop. An active transaction
    /// behaves as a rollback.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(handle) = self.pending.take() {
            let _ = handle.join();
        }
        self.closed = true;
        self.inner.writer_active.store(false, Ordering::Release);
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(RastroError::ClosedResource);
        }
        self.inner.check_open()
    }

    fn clamped_now(&self) -> i64 {
        let now = now_millis();
        let index = self.inner.holder.get();
        match index.latest_revision().and_then(|r| index.get_timestamp(r).ok()) {
            Some(last) => now.max(last),
            None => now,
        }
    }

    fn root(&self) -> Result<&RevisionRootPage> {
        let key = self.root_key.ok_or(RastroError::Invalid("root not staged"))?;
        self.til
            .get_by_key(key)
            .ok_or(RastroError::Invalid("root vanished from the intent log"))?
            .modified
            .as_revision_root()
    }

    fn root_mut(&mut self) -> Result<&mut RevisionRootPage> {
        let key = self.root_key.ok_or(RastroError::Invalid("root not staged"))?;
        self.til
            .get_by_key_mut(key)
            .ok_or(RastroError::Invalid("root vanished from the intent log"))?
            .modified
            .as_revision_root_mut()
    }

    /// Stages the revision-trie path from the uber page down to a fresh
    /// revision root for `new_revision`.
    fn stage_root_path(&mut self, root: RevisionRootPage) -> Result<()> {
        debug_assert_eq!(root.revision(), self.new_revision);
        let digits = trie::revision_offsets(self.new_revision);
        let mut parent = self.ensure_top_staged()?;
        for (i, digit) in digits.iter().enumerate() {
            let build = if i + 1 == digits.len() {
                ChildBuild::RevisionRoot(Box::new(root.clone()))
            } else {
                ChildBuild::Indirect
            };
            parent = self.ensure_child_staged(parent, ChildSlot::Level(*digit), build)?;
        }
        self.root_key = Some(parent);
        Ok(())
    }

    /// Stages the top of the revision trie, referenced by the uber page.
    fn ensure_top_staged(&mut self) -> Result<LogKey> {
        let reference = self.uber.revision_trie_ref().clone();
        if let Some(key) = reference.log_key() {
            if key.generation == self.generation {
                return Ok(key);
            }
            if self.former.is_some() && key.generation == self.former_generation {
                if let Some(page) = self.clone_from_former(key) {
                    let new_key = self.til.push(PageContainer::mirrored(page));
                    self.uber.revision_trie_ref_mut().set_log_key(new_key);
                    return Ok(new_key);
                }
            }
        }
        let (container, _) = self.build_container(Some(&reference), &ChildBuild::Indirect)?;
        let key = self.til.push(container);
        self.uber.revision_trie_ref_mut().set_log_key(key);
        Ok(key)
    }

    /// Stages the child behind `slot` of an already-staged parent,
    /// copy-on-write, returning its log key.
    fn ensure_child_staged(
        &mut self,
        parent: LogKey,
        slot: ChildSlot,
        build: ChildBuild,
    ) -> Result<LogKey> {
        loop {
            let existing = {
                let container = self
                    .til
                    .get_by_key(parent)
                    .ok_or(RastroError::Invalid("parent vanished from the intent log"))?;
                child_ref_of(&container.modified, slot)?
            };
            if let Some(reference) = &existing {
                if let Some(key) = reference.log_key() {
                    if key.generation == self.generation {
                        return Ok(key);
                    }
                    if self.former.is_some() && key.generation == self.former_generation {
                        if matches!(build, ChildBuild::Leaf { .. }) {
                            // Leaves carry versioning state that is only
                            // final once the in-flight commit lands; wait
                            // for the barrier, then retry on healed state.
                            self.await_pending_async_commit()?;
                            continue;
                        }
                        if let Some(page) = self.clone_from_former(key) {
                            return self.stage_child(
                                parent,
                                slot,
                                PageContainer::mirrored(page),
                                None,
                            );
                        }
                        self.await_pending_async_commit()?;
                        continue;
                    }
                }
            }
            let (container, meta) = self.build_container(existing.as_ref(), &build)?;
            return self.stage_child(parent, slot, container, meta);
        }
    }

    fn clone_from_former(&self, key: LogKey) -> Option<Page> {
        let former = self.former.as_ref()?;
        let guard = former.lock();
        guard.get_by_key(key).map(|c| c.modified.clone())
    }

    fn stage_child(
        &mut self,
        parent: LogKey,
        slot: ChildSlot,
        container: PageContainer,
        meta: Option<FragMeta>,
    ) -> Result<LogKey> {
        let key = self.til.next_key();
        let (database_id, resource_id) = (
            self.inner.config.database_id,
            self.inner.config.resource_id,
        );
        {
            let parent_container = self
                .til
                .get_by_key_mut(parent)
                .ok_or(RastroError::Invalid("parent vanished from the intent log"))?;
            let reference = match slot {
                ChildSlot::IndexRoot(kind) => parent_container
                    .modified
                    .as_revision_root_mut()?
                    .index_ref_mut(kind),
                ChildSlot::Directory(offset) | ChildSlot::Level(offset) => parent_container
                    .modified
                    .as_indirect_mut()?
                    .reference_or_link(offset),
            };
            reference.set_log_key(key);
            reference.assign_ids(database_id, resource_id);
        }
        let pushed = self.til.push(container);
        debug_assert_eq!(pushed, key);
        if let Some(meta) = meta {
            self.frag_meta.insert(key.index, meta);
        }
        Ok(key)
    }

    fn build_container(
        &mut self,
        reference: Option<&PageRef>,
        build: &ChildBuild,
    ) -> Result<(PageContainer, Option<FragMeta>)> {
        match build {
            ChildBuild::Indirect => {
                let page = match reference.filter(|r| r.is_persisted()) {
                    Some(r) => {
                        let shared = load_page(&self.inner, &*self.reader, r)?;
                        shared.as_indirect()?.clone()
                    }
                    None => IndirectPage::empty(),
                };
                Ok((PageContainer::mirrored(Page::Indirect(page)), None))
            }
            ChildBuild::RevisionRoot(root) => Ok((
                PageContainer::mirrored(Page::RevisionRoot(root.as_ref().clone())),
                None,
            )),
            ChildBuild::Leaf {
                page_key,
                kind,
                index_id,
            } => match reference.filter(|r| r.is_persisted()) {
                Some(r) => {
                    let fragments = load_leaf_fragments(&self.inner, &*self.reader, r)?;
                    let meta = FragMeta {
                        head_revision: fragments[0].revision(),
                        combined: fragments.len(),
                    };
                    let container = self.inner.config.versioning.combine_for_modification(
                        fragments,
                        self.inner.config.revs_to_restore,
                        self.new_revision,
                    )?;
                    Ok((container, Some(meta)))
                }
                None => {
                    let leaf = KeyValueLeafPage::empty(
                        *page_key,
                        *kind,
                        *index_id,
                        self.new_revision,
                        self.inner.config.use_dewey_ids,
                    );
                    Ok((
                        PageContainer::mirrored(Page::Leaf(leaf)),
                        Some(FragMeta {
                            head_revision: 0,
                            combined: 0,
                        }),
                    ))
                }
            },
        }
    }

    /// Walks the staged trie (copy-on-write along the way) down to the leaf
    /// holding `page_key` and returns its log key.
    fn ensure_leaf_staged(
        &mut self,
        kind: IndexKind,
        index_id: u32,
        page_key: PageKey,
    ) -> Result<LogKey> {
        if kind.has_directory() && index_id as usize >= FANOUT {
            return Err(RastroError::KeyOutOfRange(u64::from(index_id)));
        }
        let root_key = self
            .root_key
            .ok_or(RastroError::Invalid("root not staged"))?;
        let mut parent =
            self.ensure_child_staged(root_key, ChildSlot::IndexRoot(kind), ChildBuild::Indirect)?;
        if kind.has_directory() {
            parent = self.ensure_child_staged(
                parent,
                ChildSlot::Directory(index_id as usize),
                ChildBuild::Indirect,
            )?;
        }
        let digits = trie::level_offsets(page_key, trie::depth(kind));
        for (i, digit) in digits.iter().enumerate() {
            let build = if i + 1 == digits.len() {
                ChildBuild::Leaf {
                    page_key,
                    kind,
                    index_id,
                }
            } else {
                ChildBuild::Indirect
            };
            parent = self.ensure_child_staged(parent, ChildSlot::Level(*digit), build)?;
        }
        Ok(parent)
    }

    /// Read-only walk over the mixed staged/committed trie.
    fn resolve_leaf_for_read(
        &self,
        kind: IndexKind,
        index_id: u32,
        page_key: PageKey,
    ) -> Result<Option<LeafSnapshot>> {
        if kind.has_directory() && index_id as usize >= FANOUT {
            return Err(RastroError::KeyOutOfRange(u64::from(index_id)));
        }
        let root_key = self
            .root_key
            .ok_or(RastroError::Invalid("root not staged"))?;
        let mut steps = vec![ChildSlot::IndexRoot(kind)];
        if kind.has_directory() {
            steps.push(ChildSlot::Directory(index_id as usize));
        }
        for digit in trie::level_offsets(page_key, trie::depth(kind)) {
            steps.push(ChildSlot::Level(digit));
        }

        enum Node {
            Staged(LogKey),
            Shared(Arc<Page>),
        }
        let mut current = Node::Staged(root_key);
        for (i, slot) in steps.iter().enumerate() {
            let leaf_level = i + 1 == steps.len();
            let reference = match &current {
                Node::Staged(key) => {
                    let container = self
                        .til
                        .get_by_key(*key)
                        .ok_or(RastroError::Invalid("page vanished from the intent log"))?;
                    child_ref_of(&container.modified, *slot)?
                }
                Node::Shared(page) => child_ref_of(page, *slot)?,
            };
            let Some(reference) = reference else {
                return Ok(None);
            };
            if let Some(key) = reference.log_key() {
                if key.generation == self.generation {
                    current = Node::Staged(key);
                    continue;
                }
                if self.former.is_some() && key.generation == self.former_generation {
                    if let Some(page) = self.clone_from_former(key) {
                        current = Node::Shared(Arc::new(page));
                        continue;
                    }
                }
            }
            if !reference.is_persisted() {
                return Ok(None);
            }
            if leaf_level {
                let leaf = crate::store::combined_leaf(&self.inner, &*self.reader, &reference)?;
                return Ok(Some(LeafSnapshot::Owned(leaf)));
            }
            current = Node::Shared(load_page(&self.inner, &*self.reader, &reference)?);
        }
        Ok(Some(match current {
            Node::Staged(key) => LeafSnapshot::Staged(key),
            Node::Shared(page) => LeafSnapshot::Owned(page.as_leaf()?.clone()),
        }))
    }

    fn resolve_overflow_payload(&self, reference: &PageRef) -> Result<Vec<u8>> {
        if let Some(key) = reference.log_key() {
            if key.generation == self.generation {
                if let Some(container) = self.til.get_by_key(key) {
                    if let Page::Overflow(page) = &container.modified {
                        return Ok(page.data().to_vec());
                    }
                    return Err(RastroError::CorruptHeader(
                        "overflow reference points at a non-overflow page",
                    ));
                }
            }
            if self.former.is_some() && key.generation == self.former_generation {
                if let Some(Page::Overflow(page)) = self.clone_from_former(key) {
                    return Ok(page.data().to_vec());
                }
            }
        }
        let page = load_page(&self.inner, &*self.reader, reference)?;
        match &*page {
            Page::Overflow(overflow) => Ok(overflow.data().to_vec()),
            _ => Err(RastroError::CorruptHeader(
                "overflow reference points at a non-overflow page",
            )),
        }
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        self.close();
    }
}

fn heal_reference(
    reference: &mut PageRef,
    former_generation: u64,
    persisted: &FxHashMap<usize, PersistedRef>,
) {
    let Some(key) = reference.log_key() else {
        return;
    };
    if key.generation != former_generation {
        return;
    }
    if let Some(entry) = persisted.get(&key.index) {
        reference.set_persisted(entry.offset as i64, entry.hash);
        reference.set_fragments(entry.fragments.clone());
        reference.clear_log_key();
    }
}

fn child_ref_of(page: &Page, slot: ChildSlot) -> Result<Option<PageRef>> {
    Ok(match slot {
        ChildSlot::IndexRoot(kind) => {
            let reference = page.as_revision_root()?.index_ref(kind);
            if reference.is_persisted() || reference.log_key().is_some() {
                Some(reference.clone())
            } else {
                None
            }
        }
        ChildSlot::Directory(offset) | ChildSlot::Level(offset) => {
            page.as_indirect()?.reference(offset).cloned()
        }
    })
}

/// Writes one staged subtree in post-order: children first, then the page
/// itself, finally patching the owning reference with the new location,
/// hash, and (for leaves) fragment chain.
///
/// The log is locked only for the clone-out and the write-back, so a
/// foreground transaction keeps resolving rotated-out entries while a
/// background commit persists them.
fn persist_reference(
    reference: &mut PageRef,
    til: &Mutex<IntentLog>,
    writer: &mut dyn Writer,
    ctx: &mut CommitCtx,
) -> Result<()> {
    let Some(key) = reference.log_key() else {
        return Ok(());
    };
    let container = til.lock().get_by_key(key).cloned();
    let Some(mut container) = container else {
        reference.clear_log_key();
        return Ok(());
    };
    persist_children(&mut container.modified, til, writer, ctx)?;

    let chain = if matches!(container.modified, Page::Leaf(_)) {
        let meta = ctx.frag_meta.get(&key.index).copied().unwrap_or(FragMeta {
            head_revision: 0,
            combined: 0,
        });
        ctx.versioning.fragment_chain_after_commit(
            reference,
            meta.head_revision,
            ctx.new_revision,
            ctx.revs_to_restore,
            meta.combined,
        )
    } else {
        SmallVec::new()
    };

    let kind = container.modified.kind();
    let (offset, hash) = writer.write_page(&mut container.modified)?;
    ctx.pages_written += 1;
    if kind == PageKind::RevisionRoot {
        ctx.revroot_offset = Some(offset);
    }
    reference.set_persisted(offset as i64, hash);
    reference.set_fragments(chain.clone());
    reference.clear_log_key();
    ctx.persisted.insert(
        key.index,
        PersistedRef {
            offset,
            hash,
            fragments: chain,
        },
    );
    til.lock().restore(key, container);
    Ok(())
}

fn persist_children(
    page: &mut Page,
    til: &Mutex<IntentLog>,
    writer: &mut dyn Writer,
    ctx: &mut CommitCtx,
) -> Result<()> {
    match page {
        Page::Uber(p) => persist_reference(p.revision_trie_ref_mut(), til, writer, ctx),
        Page::RevisionRoot(p) => {
            for (_, reference) in p.index_refs_mut() {
                persist_reference(reference, til, writer, ctx)?;
            }
            Ok(())
        }
        Page::Indirect(p) => {
            for (_, reference) in p.linked_mut() {
                persist_reference(reference, til, writer, ctx)?;
            }
            Ok(())
        }
        Page::Leaf(p) => {
            // Deterministic traversal: overflow references by record key.
            let mut keys: Vec<NodeKey> = p.references_mut().keys().copied().collect();
            keys.sort_unstable();
            for node_key in keys {
                if let Some(reference) = p.references_mut().get_mut(&node_key) {
                    persist_reference(reference, til, writer, ctx)?;
                }
            }
            Ok(())
        }
        Page::Overflow(_) => Ok(()),
    }
}

/// Rebuilds the revision trie bottom-up from the surviving revisions-file
/// entries, writing the pages and returning the new top reference.
fn build_revision_trie(writer: &mut dyn Writer, entries: &[(u64, i64)]) -> Result<PageRef> {
    let mut level: Vec<PageRef> = entries
        .iter()
        .map(|(offset, _)| {
            let mut reference = PageRef::unset();
            reference.set_file_key(*offset as i64);
            reference
        })
        .collect();
    for _ in 0..REVISION_TRIE_DEPTH {
        let mut parents = Vec::with_capacity(level.len().div_ceil(FANOUT));
        for chunk in level.chunks(FANOUT) {
            let mut page = IndirectPage::empty();
            for (i, reference) in chunk.iter().enumerate() {
                *page.reference_or_link(i) = reference.clone();
            }
            let mut frame = Page::Indirect(page);
            let (offset, hash) = writer.write_page(&mut frame)?;
            let mut parent = PageRef::unset();
            parent.set_persisted(offset as i64, hash);
            parents.push(parent);
        }
        level = parents;
    }
    level
        .into_iter()
        .next()
        .ok_or(RastroError::Invalid("no revisions survive the truncation"))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
