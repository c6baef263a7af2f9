//! Fixed-fanout interior pages of the tries.

use crate::page::codec::{read_bitmap, write_bitmap, ByteReader, ByteWriter};
use crate::page::reference::PageRef;
use crate::trie::FANOUT;
use crate::types::Result;

/// An interior trie page: a fixed-fanout array of page references.
///
/// Indirect pages are copied on write along the path from a revision root to
/// the modified leaf; a null slot means the subtree below it has never been
/// materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectPage {
    refs: Vec<Option<PageRef>>,
}

impl IndirectPage {
    /// A page with every slot unset.
    pub fn empty() -> Self {
        Self {
            refs: vec![None; FANOUT],
        }
    }

    /// Reference at `offset`, if one was ever linked.
    pub fn reference(&self, offset: usize) -> Option<&PageRef> {
        self.refs[offset].as_ref()
    }

    /// Mutable reference at `offset`, if one was ever linked.
    pub fn reference_mut(&mut self, offset: usize) -> Option<&mut PageRef> {
        self.refs[offset].as_mut()
    }

    /// Returns the reference at `offset`, linking a fresh unset one when the
    /// slot was null. This is the only way trie paths grow.
    pub fn reference_or_link(&mut self, offset: usize) -> &mut PageRef {
        self.refs[offset].get_or_insert_with(PageRef::unset)
    }

    /// Iterates the linked slots with their offsets.
    pub fn linked(&self) -> impl Iterator<Item = (usize, &PageRef)> {
        self.refs
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r)))
    }

    /// Iterates the linked slots mutably with their offsets.
    pub fn linked_mut(&mut self) -> impl Iterator<Item = (usize, &mut PageRef)> {
        self.refs
            .iter_mut()
            .enumerate()
            .filter_map(|(i, r)| r.as_mut().map(|r| (i, r)))
    }

    /// Number of linked slots.
    pub fn linked_count(&self) -> usize {
        self.refs.iter().filter(|r| r.is_some()).count()
    }

    /// Serializes the bitmap followed by the linked references in order.
    pub fn serialize(&self, w: &mut ByteWriter<'_>) {
        write_bitmap(w, &self.refs);
        for (_, reference) in self.linked() {
            reference.serialize(w);
        }
    }

    /// Deserializes a page written by [`Self::serialize`].
    pub fn deserialize(r: &mut ByteReader<'_>) -> Result<Self> {
        let set = read_bitmap(r, FANOUT)?;
        let mut refs = vec![None; FANOUT];
        for idx in set {
            refs[idx] = Some(PageRef::deserialize(r)?);
        }
        Ok(Self { refs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::checksum::{HashKind, HashValue};

    #[test]
    fn roundtrip_sparse_page() {
        let mut page = IndirectPage::empty();
        page.reference_or_link(0)
            .set_persisted(1024, HashValue::new(HashKind::Xxh3, 11));
        page.reference_or_link(513)
            .set_persisted(2048, HashValue::new(HashKind::Xxh3, 22));
        page.reference_or_link(1023);

        let mut buf = Vec::new();
        page.serialize(&mut ByteWriter::new(&mut buf));
        let mut r = ByteReader::new(&buf);
        let decoded = IndirectPage::deserialize(&mut r).unwrap();

        assert_eq!(decoded.linked_count(), 3);
        assert_eq!(decoded.reference(0).unwrap().file_key(), 1024);
        assert_eq!(decoded.reference(513).unwrap().file_key(), 2048);
        assert!(!decoded.reference(1023).unwrap().is_persisted());
        assert!(decoded.reference(7).is_none());
    }

    #[test]
    fn linking_grows_paths_exactly_once() {
        let mut page = IndirectPage::empty();
        assert!(page.reference(42).is_none());
        page.reference_or_link(42)
            .set_persisted(8, HashValue::new(HashKind::Xxh3, 1));
        assert_eq!(page.reference(42).unwrap().file_key(), 8);
        // A second link call returns the same slot rather than resetting it.
        assert_eq!(page.reference_or_link(42).file_key(), 8);
    }
}
