//! Page references and fragment chains.

use smallvec::SmallVec;

use crate::page::codec::{ByteReader, ByteWriter};
use crate::types::checksum::HashValue;
use crate::types::{Result, Revision, NULL_FILE_KEY};

/// One previous version of a record-leaf page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFragmentKey {
    /// Revision that produced the fragment.
    pub revision: Revision,
    /// File offset of the fragment's frame.
    pub offset: u64,
}

/// Identity of a staged page inside a transaction intent log.
///
/// Log keys are insertion indexes; the generation ties a key to the log
/// instance that assigned it, so rotated-out keys never resolve against a
/// newer log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogKey {
    /// Generation of the assigning intent log.
    pub generation: u64,
    /// Insertion index inside that log.
    pub index: usize,
}

/// A pointer from a parent page to a child page.
///
/// References never own pages; they are resolved through the intent log
/// during a write transaction or through the storage backend and cache on
/// read. The file key and hash are set when the referenced page is first
/// persisted and are immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    file_key: i64,
    hash: Option<HashValue>,
    fragments: SmallVec<[PageFragmentKey; 4]>,
    database_id: u64,
    resource_id: u64,
    log_key: Option<LogKey>,
}

impl PageRef {
    /// A reference that points nowhere yet.
    pub fn unset() -> Self {
        Self {
            file_key: NULL_FILE_KEY,
            hash: None,
            fragments: SmallVec::new(),
            database_id: 0,
            resource_id: 0,
            log_key: None,
        }
    }

    /// File offset of the latest persisted fragment, or `NULL_FILE_KEY`.
    pub fn file_key(&self) -> i64 {
        self.file_key
    }

    /// True once the reference points at persisted bytes.
    pub fn is_persisted(&self) -> bool {
        self.file_key != NULL_FILE_KEY
    }

    /// Expected hash of the referenced bytes.
    pub fn hash(&self) -> Option<HashValue> {
        self.hash
    }

    /// The previous-version fragment chain, newest first.
    pub fn fragments(&self) -> &[PageFragmentKey] {
        &self.fragments
    }

    /// Owning database id (set by fixup after deserialization).
    pub fn database_id(&self) -> u64 {
        self.database_id
    }

    /// Owning resource id (set by fixup after deserialization).
    pub fn resource_id(&self) -> u64 {
        self.resource_id
    }

    /// Identity of the staged container, when the reference is dirty.
    pub fn log_key(&self) -> Option<LogKey> {
        self.log_key
    }

    /// Stages the reference against an intent-log entry.
    pub fn set_log_key(&mut self, key: LogKey) {
        self.log_key = Some(key);
    }

    /// Clears the staging identity (after persist or rollback).
    pub fn clear_log_key(&mut self) {
        self.log_key = None;
    }

    /// Records the persisted location and hash of the referenced page.
    pub fn set_persisted(&mut self, file_key: i64, hash: HashValue) {
        self.file_key = file_key;
        self.hash = Some(hash);
    }

    /// Records a location without a hash; reads through the reference skip
    /// verification. Used when a trie is rebuilt from the revisions file.
    pub fn set_file_key(&mut self, file_key: i64) {
        self.file_key = file_key;
        self.hash = None;
    }

    /// Replaces the fragment chain.
    pub fn set_fragments(&mut self, fragments: SmallVec<[PageFragmentKey; 4]>) {
        self.fragments = fragments;
    }

    /// Sets the owning ids; called during fixup and when pages are created.
    pub fn assign_ids(&mut self, database_id: u64, resource_id: u64) {
        self.database_id = database_id;
        self.resource_id = resource_id;
    }

    /// Builds the fragment chain for the next version of the referenced
    /// page: the current head becomes the newest fragment and the chain is
    /// truncated to `revs_to_restore - 1` entries.
    pub fn pushed_fragment_chain(
        &self,
        current_revision: Revision,
        revs_to_restore: u32,
    ) -> SmallVec<[PageFragmentKey; 4]> {
        let mut chain: SmallVec<[PageFragmentKey; 4]> = SmallVec::new();
        if self.is_persisted() {
            chain.push(PageFragmentKey {
                revision: current_revision,
                offset: self.file_key as u64,
            });
            for fragment in &self.fragments {
                chain.push(*fragment);
            }
        }
        let keep = (revs_to_restore.max(1) - 1) as usize;
        chain.truncate(keep);
        chain
    }

    /// Serializes the persistent fields (file key, hash, fragment chain).
    pub fn serialize(&self, w: &mut ByteWriter<'_>) {
        w.i64(self.file_key);
        match self.hash {
            Some(hash) => {
                let bytes = hash.to_bytes();
                w.u8(bytes.len() as u8);
                w.raw(&bytes);
            }
            None => w.u8(0),
        }
        w.u8(self.fragments.len() as u8);
        for fragment in &self.fragments {
            w.u32(fragment.revision);
            w.u64(fragment.offset);
        }
    }

    /// Deserializes the persistent fields. Owning ids are zero until fixup.
    pub fn deserialize(r: &mut ByteReader<'_>) -> Result<Self> {
        let file_key = r.i64()?;
        let hash_len = r.u8()? as usize;
        let hash = if hash_len == 0 {
            None
        } else {
            Some(HashValue::from_bytes(r.take(hash_len)?)?)
        };
        let fragment_count = r.u8()? as usize;
        let mut fragments = SmallVec::new();
        for _ in 0..fragment_count {
            let revision = r.u32()?;
            let offset = r.u64()?;
            fragments.push(PageFragmentKey { revision, offset });
        }
        Ok(Self {
            file_key,
            hash,
            fragments,
            database_id: 0,
            resource_id: 0,
            log_key: None,
        })
    }
}

impl Default for PageRef {
    fn default() -> Self {
        Self::unset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::codec::ByteWriter;
    use crate::types::checksum::{HashKind, HashValue};

    #[test]
    fn serialize_roundtrip_with_hash_and_fragments() {
        let mut reference = PageRef::unset();
        reference.set_persisted(8192, HashValue::new(HashKind::Xxh3, 0xABCD));
        reference.set_fragments(
            [
                PageFragmentKey {
                    revision: 4,
                    offset: 1024,
                },
                PageFragmentKey {
                    revision: 3,
                    offset: 512,
                },
            ]
            .into_iter()
            .collect(),
        );
        reference.set_log_key(LogKey {
            generation: 1,
            index: 9,
        });

        let mut buf = Vec::new();
        reference.serialize(&mut ByteWriter::new(&mut buf));
        let mut r = ByteReader::new(&buf);
        let decoded = PageRef::deserialize(&mut r).unwrap();

        assert_eq!(decoded.file_key(), 8192);
        assert_eq!(decoded.hash(), reference.hash());
        assert_eq!(decoded.fragments(), reference.fragments());
        // Staging identity never crosses the serialization boundary.
        assert_eq!(decoded.log_key(), None);
    }

    #[test]
    fn unset_reference_roundtrip() {
        let reference = PageRef::unset();
        let mut buf = Vec::new();
        reference.serialize(&mut ByteWriter::new(&mut buf));
        let mut r = ByteReader::new(&buf);
        let decoded = PageRef::deserialize(&mut r).unwrap();
        assert!(!decoded.is_persisted());
        assert_eq!(decoded.hash(), None);
        assert!(decoded.fragments().is_empty());
    }

    #[test]
    fn fragment_chain_push_truncates_to_window() {
        let mut reference = PageRef::unset();
        reference.set_persisted(100, HashValue::new(HashKind::Xxh3, 1));
        reference.set_fragments(
            [
                PageFragmentKey {
                    revision: 3,
                    offset: 60,
                },
                PageFragmentKey {
                    revision: 2,
                    offset: 40,
                },
                PageFragmentKey {
                    revision: 1,
                    offset: 20,
                },
            ]
            .into_iter()
            .collect(),
        );

        let chain = reference.pushed_fragment_chain(4, 4);
        assert_eq!(chain.len(), 3);
        assert_eq!(
            chain[0],
            PageFragmentKey {
                revision: 4,
                offset: 100
            }
        );
        assert_eq!(chain[1].revision, 3);
        assert_eq!(chain[2].revision, 2);
    }

    #[test]
    fn fragment_chain_for_full_versioning_is_empty() {
        let mut reference = PageRef::unset();
        reference.set_persisted(100, HashValue::new(HashKind::Xxh3, 1));
        let chain = reference.pushed_fragment_chain(2, 1);
        assert!(chain.is_empty());
    }
}
