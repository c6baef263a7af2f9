//! The root pointer of a resource.

use crate::page::codec::{ByteReader, ByteWriter};
use crate::page::reference::PageRef;
use crate::types::{Result, Revision};

/// The UberPage: rewritten on every commit, duplicated in the two beacon
/// slots at the start of the data file for crash-consistent root discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UberPage {
    revision_count: u32,
    is_bootstrap: bool,
    revision_trie_ref: PageRef,
}

impl UberPage {
    /// The uber page of a freshly created resource, before the bootstrap
    /// commit runs.
    pub fn bootstrap() -> Self {
        Self {
            revision_count: 0,
            is_bootstrap: true,
            revision_trie_ref: PageRef::unset(),
        }
    }

    /// An uber page reassembled around a rebuilt revision trie, after a
    /// physical truncation.
    pub fn rebuilt(revision_count: u32, revision_trie_ref: PageRef) -> Self {
        Self {
            revision_count,
            is_bootstrap: false,
            revision_trie_ref,
        }
    }

    /// Number of committed revisions. The latest revision is `count - 1`.
    pub fn revision_count(&self) -> u32 {
        self.revision_count
    }

    /// Latest committed revision, if any commit ever happened.
    pub fn latest_revision(&self) -> Option<Revision> {
        self.revision_count.checked_sub(1)
    }

    /// Revision number the next commit will create.
    pub fn next_revision(&self) -> Revision {
        self.revision_count
    }

    /// True until the bootstrap commit persists revision 0.
    pub fn is_bootstrap(&self) -> bool {
        self.is_bootstrap
    }

    /// Reference to the top of the revision-root trie.
    pub fn revision_trie_ref(&self) -> &PageRef {
        &self.revision_trie_ref
    }

    /// Mutable reference to the top of the revision-root trie.
    pub fn revision_trie_ref_mut(&mut self) -> &mut PageRef {
        &mut self.revision_trie_ref
    }

    /// Marks one more committed revision and clears the bootstrap flag.
    pub fn record_commit(&mut self) {
        self.revision_count += 1;
        self.is_bootstrap = false;
    }

    /// Rewinds the committed-revision count after a truncation, keeping
    /// revisions `0..=revision`.
    pub fn rewind_to(&mut self, revision: Revision) {
        self.revision_count = revision + 1;
    }

    /// Serializes the page body (without the kind tag).
    pub fn serialize(&self, w: &mut ByteWriter<'_>) {
        w.u32(self.revision_count);
        w.u8(u8::from(self.is_bootstrap));
        self.revision_trie_ref.serialize(w);
    }

    /// Deserializes a page body written by [`Self::serialize`].
    pub fn deserialize(r: &mut ByteReader<'_>) -> Result<Self> {
        let revision_count = r.u32()?;
        let is_bootstrap = r.u8()? != 0;
        let revision_trie_ref = PageRef::deserialize(r)?;
        Ok(Self {
            revision_count,
            is_bootstrap,
            revision_trie_ref,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::checksum::{HashKind, HashValue};

    #[test]
    fn bootstrap_page_has_no_revisions() {
        let page = UberPage::bootstrap();
        assert!(page.is_bootstrap());
        assert_eq!(page.revision_count(), 0);
        assert_eq!(page.latest_revision(), None);
        assert_eq!(page.next_revision(), 0);
    }

    #[test]
    fn commit_advances_revision_count() {
        let mut page = UberPage::bootstrap();
        page.record_commit();
        assert!(!page.is_bootstrap());
        assert_eq!(page.latest_revision(), Some(0));
        page.record_commit();
        assert_eq!(page.latest_revision(), Some(1));
        page.rewind_to(0);
        assert_eq!(page.latest_revision(), Some(0));
    }

    #[test]
    fn serialize_roundtrip() {
        let mut page = UberPage::bootstrap();
        page.record_commit();
        page.revision_trie_ref_mut()
            .set_persisted(4096, HashValue::new(HashKind::Xxh3, 99));

        let mut buf = Vec::new();
        page.serialize(&mut ByteWriter::new(&mut buf));
        let mut r = ByteReader::new(&buf);
        let decoded = UberPage::deserialize(&mut r).unwrap();
        assert_eq!(decoded, page);
    }
}
