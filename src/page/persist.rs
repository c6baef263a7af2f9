//! Serialization boundary for all page kinds.
//!
//! A frame payload is the kind tag byte followed by the kind's body. After
//! deserialization every reference is fixed up with the owning database and
//! resource ids, which never cross the boundary themselves.

use std::sync::Arc;

use crate::page::codec::{ByteReader, ByteWriter};
use crate::page::{
    IndirectPage, KeyValueLeafPage, OverflowPage, Page, PageKind, RevisionRootPage, UberPage,
};
use crate::primitives::bytes::OwnedSegment;
use crate::types::Result;

/// Owning ids stamped onto every deserialized reference.
#[derive(Debug, Clone, Copy)]
pub struct IdFixup {
    /// Id of the owning database.
    pub database_id: u64,
    /// Id of the owning resource.
    pub resource_id: u64,
}

impl IdFixup {
    /// Stamps the ids onto every reference of `page`.
    pub fn apply(self, page: &mut Page) {
        page.for_each_reference_mut(|reference| {
            reference.assign_ids(self.database_id, self.resource_id);
        });
    }
}

/// Serializes a page into a frame payload, reusing `buf`.
///
/// Leaves canonicalize here: materialized records flush into slots and the
/// optional symbol table is retrained, so the produced bytes are the form
/// the leaf checksum covers.
pub fn serialize_page(page: &mut Page, use_fsst: bool, buf: &mut Vec<u8>) {
    buf.clear();
    let mut w = ByteWriter::new(buf);
    w.u8(page.kind().tag());
    match page {
        Page::Uber(p) => p.serialize(&mut w),
        Page::RevisionRoot(p) => p.serialize(&mut w),
        Page::Indirect(p) => p.serialize(&mut w),
        Page::Leaf(p) => p.serialize(&mut w, use_fsst),
        Page::Overflow(p) => p.serialize(&mut w),
    }
}

/// Deserializes a frame payload and applies the id fixup.
///
/// For leaves, `backing` is the claimed decompression buffer holding exactly
/// the payload bytes; slots then reference it instead of copying.
pub fn deserialize_page(
    bytes: &[u8],
    backing: Option<Arc<OwnedSegment>>,
    fixup: IdFixup,
) -> Result<Page> {
    let mut r = ByteReader::new(bytes);
    let kind = PageKind::from_tag(r.u8()?)?;
    let mut page = match kind {
        PageKind::Uber => Page::Uber(UberPage::deserialize(&mut r)?),
        PageKind::RevisionRoot => Page::RevisionRoot(RevisionRootPage::deserialize(&mut r)?),
        PageKind::Indirect => Page::Indirect(IndirectPage::deserialize(&mut r)?),
        PageKind::KeyValueLeaf => Page::Leaf(KeyValueLeafPage::deserialize(&mut r, backing)?),
        PageKind::Overflow => Page::Overflow(OverflowPage::deserialize(&mut r)?),
    };
    fixup.apply(&mut page);
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::checksum::{HashKind, HashValue};
    use crate::types::IndexKind;

    fn fixup() -> IdFixup {
        IdFixup {
            database_id: 11,
            resource_id: 22,
        }
    }

    #[test]
    fn every_kind_roundtrips_with_fixup() {
        let mut uber = UberPage::bootstrap();
        uber.revision_trie_ref_mut()
            .set_persisted(1024, HashValue::new(HashKind::Xxh3, 5));
        let mut root = RevisionRootPage::bootstrap();
        root.index_ref_mut(IndexKind::Document)
            .set_persisted(2048, HashValue::new(HashKind::Xxh3, 6));
        let mut indirect = IndirectPage::empty();
        indirect
            .reference_or_link(3)
            .set_persisted(4096, HashValue::new(HashKind::Xxh3, 7));
        let mut leaf = KeyValueLeafPage::empty(0, IndexKind::Document, 0, 1, false);
        leaf.set_slot(0, vec![1, 2, 3]);
        let overflow = OverflowPage::new(vec![9; 32]);

        for mut page in [
            Page::Uber(uber),
            Page::RevisionRoot(root),
            Page::Indirect(indirect),
            Page::Leaf(leaf),
            Page::Overflow(overflow),
        ] {
            let mut buf = Vec::new();
            serialize_page(&mut page, false, &mut buf);
            assert_eq!(buf[0], page.kind().tag());
            let decoded = deserialize_page(&buf, None, fixup()).unwrap();
            assert_eq!(decoded.kind(), page.kind());
            let mut checked = 0;
            let mut decoded = decoded;
            decoded.for_each_reference_mut(|reference| {
                assert_eq!(reference.database_id(), 11);
                assert_eq!(reference.resource_id(), 22);
                checked += 1;
            });
            if matches!(decoded.kind(), PageKind::Overflow) {
                assert_eq!(checked, 0);
            } else if !matches!(decoded.kind(), PageKind::KeyValueLeaf) {
                assert!(checked >= 1, "kind {:?} lost references", decoded.kind());
            }
        }
    }

    #[test]
    fn impossible_tag_is_corrupt_header() {
        let err = deserialize_page(&[0xEE, 0, 0], None, fixup()).unwrap_err();
        assert!(matches!(
            err,
            crate::types::RastroError::CorruptHeader("impossible page kind tag")
        ));
    }
}
