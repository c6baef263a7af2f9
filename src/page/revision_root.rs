//! Per-revision root pages.

use crate::page::codec::{ByteReader, ByteWriter};
use crate::page::reference::PageRef;
use crate::types::{IndexKind, RastroError, Result, Revision};

/// Sentinel for "no key allocated yet" in the high-water marks.
const NO_KEY: i64 = -1;

/// The root page of one committed revision.
///
/// Holds the trie roots for every index kind, the commit metadata, and the
/// record-key high-water marks that drive key allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRootPage {
    revision: Revision,
    commit_timestamp_millis: i64,
    commit_message: Option<String>,
    user_id: Option<String>,
    max_node_key_document: i64,
    max_node_key_path_summary: i64,
    name_key_counter: i32,
    named_max_keys: Vec<(IndexKind, u32, i64)>,
    document_ref: PageRef,
    path_summary_ref: PageRef,
    name_dir_ref: PageRef,
    cas_dir_ref: PageRef,
    path_dir_ref: PageRef,
}

impl RevisionRootPage {
    /// The empty root of the bootstrap revision.
    pub fn bootstrap() -> Self {
        Self {
            revision: 0,
            commit_timestamp_millis: 0,
            commit_message: None,
            user_id: None,
            max_node_key_document: NO_KEY,
            max_node_key_path_summary: NO_KEY,
            name_key_counter: 0,
            named_max_keys: Vec::new(),
            document_ref: PageRef::unset(),
            path_summary_ref: PageRef::unset(),
            name_dir_ref: PageRef::unset(),
            cas_dir_ref: PageRef::unset(),
            path_dir_ref: PageRef::unset(),
        }
    }

    /// Derives the next revision's root from a committed one. Trie roots are
    /// carried over (copy-on-write happens per path); commit metadata resets.
    pub fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.revision = self.revision + 1;
        next.commit_timestamp_millis = 0;
        next.commit_message = None;
        next.user_id = None;
        next
    }

    /// Revision number this root belongs to.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Commit wall-clock timestamp in epoch milliseconds.
    pub fn commit_timestamp_millis(&self) -> i64 {
        self.commit_timestamp_millis
    }

    /// Optional commit message.
    pub fn commit_message(&self) -> Option<&str> {
        self.commit_message.as_deref()
    }

    /// Optional committing user.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Stamps the commit metadata. Called once per commit.
    pub fn stamp_commit(
        &mut self,
        timestamp_millis: i64,
        message: Option<String>,
        user_id: Option<String>,
    ) {
        self.commit_timestamp_millis = timestamp_millis;
        self.commit_message = message;
        self.user_id = user_id;
    }

    /// Interns the next name-dictionary key.
    pub fn next_name_key(&mut self) -> i32 {
        let key = self.name_key_counter;
        self.name_key_counter += 1;
        key
    }

    /// Current name-dictionary counter.
    pub fn name_key_counter(&self) -> i32 {
        self.name_key_counter
    }

    /// Highest allocated node key for `(kind, index_id)`, or `None` when the
    /// index holds no record yet.
    pub fn max_node_key(&self, kind: IndexKind, index_id: u32) -> Option<u64> {
        let raw = match kind {
            IndexKind::Document => self.max_node_key_document,
            IndexKind::PathSummary => self.max_node_key_path_summary,
            _ => self
                .named_max_keys
                .iter()
                .find(|(k, id, _)| *k == kind && *id == index_id)
                .map(|(_, _, max)| *max)
                .unwrap_or(NO_KEY),
        };
        (raw >= 0).then_some(raw as u64)
    }

    /// Allocates the next node key for `(kind, index_id)`.
    pub fn allocate_node_key(&mut self, kind: IndexKind, index_id: u32) -> u64 {
        let slot = match kind {
            IndexKind::Document => &mut self.max_node_key_document,
            IndexKind::PathSummary => &mut self.max_node_key_path_summary,
            _ => {
                if let Some(pos) = self
                    .named_max_keys
                    .iter()
                    .position(|(k, id, _)| *k == kind && *id == index_id)
                {
                    &mut self.named_max_keys[pos].2
                } else {
                    self.named_max_keys.push((kind, index_id, NO_KEY));
                    let last = self.named_max_keys.len() - 1;
                    &mut self.named_max_keys[last].2
                }
            }
        };
        *slot += 1;
        *slot as u64
    }

    /// Trie root (or per-id directory root) for an index kind.
    pub fn index_ref(&self, kind: IndexKind) -> &PageRef {
        match kind {
            IndexKind::Document => &self.document_ref,
            IndexKind::PathSummary => &self.path_summary_ref,
            IndexKind::Name => &self.name_dir_ref,
            IndexKind::Cas => &self.cas_dir_ref,
            IndexKind::Path => &self.path_dir_ref,
        }
    }

    /// Mutable trie root (or per-id directory root) for an index kind.
    pub fn index_ref_mut(&mut self, kind: IndexKind) -> &mut PageRef {
        match kind {
            IndexKind::Document => &mut self.document_ref,
            IndexKind::PathSummary => &mut self.path_summary_ref,
            IndexKind::Name => &mut self.name_dir_ref,
            IndexKind::Cas => &mut self.cas_dir_ref,
            IndexKind::Path => &mut self.path_dir_ref,
        }
    }

    /// All five index references with their kinds.
    pub fn index_refs_mut(&mut self) -> [(IndexKind, &mut PageRef); 5] {
        [
            (IndexKind::Document, &mut self.document_ref),
            (IndexKind::PathSummary, &mut self.path_summary_ref),
            (IndexKind::Name, &mut self.name_dir_ref),
            (IndexKind::Cas, &mut self.cas_dir_ref),
            (IndexKind::Path, &mut self.path_dir_ref),
        ]
    }

    /// Serializes the page body (without the kind tag).
    pub fn serialize(&self, w: &mut ByteWriter<'_>) {
        w.u32(self.revision);
        w.i64(self.commit_timestamp_millis);
        match &self.commit_message {
            Some(msg) => {
                w.u8(1);
                w.bytes_u32(msg.as_bytes());
            }
            None => w.u8(0),
        }
        match &self.user_id {
            Some(user) => {
                w.u8(1);
                w.bytes_u16(user.as_bytes());
            }
            None => w.u8(0),
        }
        w.i64(self.max_node_key_document);
        w.i64(self.max_node_key_path_summary);
        w.u32(self.name_key_counter as u32);
        w.u16(self.named_max_keys.len() as u16);
        for (kind, index_id, max) in &self.named_max_keys {
            w.u8(kind.tag());
            w.u32(*index_id);
            w.i64(*max);
        }
        self.document_ref.serialize(w);
        self.path_summary_ref.serialize(w);
        self.name_dir_ref.serialize(w);
        self.cas_dir_ref.serialize(w);
        self.path_dir_ref.serialize(w);
    }

    /// Deserializes a page body written by [`Self::serialize`].
    pub fn deserialize(r: &mut ByteReader<'_>) -> Result<Self> {
        let revision = r.u32()?;
        let commit_timestamp_millis = r.i64()?;
        let commit_message = if r.u8()? != 0 {
            Some(
                String::from_utf8(r.bytes_u32()?.to_vec())
                    .map_err(|_| RastroError::CorruptHeader("commit message not UTF-8"))?,
            )
        } else {
            None
        };
        let user_id = if r.u8()? != 0 {
            Some(
                String::from_utf8(r.bytes_u16()?.to_vec())
                    .map_err(|_| RastroError::CorruptHeader("user id not UTF-8"))?,
            )
        } else {
            None
        };
        let max_node_key_document = r.i64()?;
        let max_node_key_path_summary = r.i64()?;
        let name_key_counter = r.u32()? as i32;
        let named_count = r.u16()? as usize;
        let mut named_max_keys = Vec::with_capacity(named_count);
        for _ in 0..named_count {
            let kind = IndexKind::from_tag(r.u8()?)?;
            let index_id = r.u32()?;
            let max = r.i64()?;
            named_max_keys.push((kind, index_id, max));
        }
        Ok(Self {
            revision,
            commit_timestamp_millis,
            commit_message,
            user_id,
            max_node_key_document,
            max_node_key_path_summary,
            name_key_counter,
            named_max_keys,
            document_ref: PageRef::deserialize(r)?,
            path_summary_ref: PageRef::deserialize(r)?,
            name_dir_ref: PageRef::deserialize(r)?,
            cas_dir_ref: PageRef::deserialize(r)?,
            path_dir_ref: PageRef::deserialize(r)?,
        })
    }
}
