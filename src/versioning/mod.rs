//! Reconstruction strategies for record-leaf pages.
//!
//! A leaf read materializes one logical page from a chain of fragments
//! supplied latest-first. A leaf write derives the pair of views the intent
//! log stages: the complete combination for reads and the dirty view whose
//! serialized form the commit persists. The strategy also dictates how a
//! reference's fragment chain evolves across commits.

use smallvec::SmallVec;

use crate::page::{KeyValueLeafPage, Page, PageFragmentKey, PageRef};
use crate::til::PageContainer;
use crate::types::{RastroError, Result, Revision};

/// The four leaf reconstruction strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Versioning {
    /// Every commit persists the entire page.
    Full,
    /// Deltas accumulate since the last full dump; at most two fragments.
    Differential,
    /// Per-commit deltas with a full dump whenever the window fills.
    Incremental,
    /// Per-commit deltas in a sliding window; slots leaving the window are
    /// re-materialized instead of dumped.
    SlidingSnapshot,
}

impl Default for Versioning {
    fn default() -> Self {
        Versioning::SlidingSnapshot
    }
}

impl Versioning {
    /// Maximum number of fragments a read may combine.
    pub fn window(self, revs_to_restore: u32) -> usize {
        match self {
            Versioning::Full => 1,
            Versioning::Differential => 2,
            Versioning::Incremental | Versioning::SlidingSnapshot => {
                revs_to_restore.max(1) as usize
            }
        }
    }

    /// Whether `revision` writes a full dump under the differential cadence.
    /// The cadence is a pure function of the revision number, so truncation
    /// never shifts it.
    fn is_differential_dump(revision: Revision, revs_to_restore: u32) -> bool {
        revision % revs_to_restore.max(1) == 0
    }

    /// Combines fragments (latest first) into the logical page a reader
    /// observes.
    pub fn combine_for_read(
        self,
        fragments: Vec<KeyValueLeafPage>,
        revs_to_restore: u32,
    ) -> Result<KeyValueLeafPage> {
        if fragments.is_empty() {
            return Err(RastroError::VersioningInvariant(
                "no fragments supplied for reconstruction",
            ));
        }
        if fragments.len() > self.window(revs_to_restore) {
            return Err(RastroError::VersioningInvariant(
                "fragment count exceeds the versioning window",
            ));
        }
        let mut fragments = fragments;
        let mut combined = fragments.remove(0);
        for older in &fragments {
            if union_into(&mut combined, older) {
                break;
            }
        }
        Ok(combined)
    }

    /// Combines fragments into the `(complete, modified)` container a write
    /// transaction stages for this page.
    pub fn combine_for_modification(
        self,
        fragments: Vec<KeyValueLeafPage>,
        revs_to_restore: u32,
        new_revision: Revision,
    ) -> Result<PageContainer> {
        if fragments.is_empty() {
            return Err(RastroError::VersioningInvariant(
                "no fragments supplied for reconstruction",
            ));
        }
        let window = self.window(revs_to_restore);
        if fragments.len() > window {
            return Err(RastroError::VersioningInvariant(
                "fragment count exceeds the versioning window",
            ));
        }
        let latest = fragments[0].clone();
        let mut complete = self.combine_for_read(fragments.clone(), revs_to_restore)?;
        complete.set_revision(new_revision);

        let mut modified = match self {
            Versioning::Full => complete.clone(),
            Versioning::Differential => {
                if Self::is_differential_dump(new_revision, revs_to_restore) {
                    complete.clone()
                } else {
                    // The delta accumulates everything since the last dump,
                    // which is exactly what the latest fragment holds.
                    latest
                }
            }
            Versioning::Incremental => {
                if fragments.len() == window {
                    complete.clone()
                } else {
                    empty_like(&complete)
                }
            }
            Versioning::SlidingSnapshot => {
                let mut delta = empty_like(&complete);
                if fragments.len() == window {
                    keep_expiring_entries(&mut delta, &fragments);
                }
                delta
            }
        };
        modified.set_revision(new_revision);
        Ok(PageContainer {
            complete: Page::Leaf(complete),
            modified: Page::Leaf(modified),
        })
    }

    /// Builds the reference's fragment chain for the commit of
    /// `new_revision`, given the pre-commit reference state and the revision
    /// of its current head fragment.
    pub fn fragment_chain_after_commit(
        self,
        reference: &PageRef,
        head_revision: Revision,
        new_revision: Revision,
        revs_to_restore: u32,
        fragments_combined: usize,
    ) -> SmallVec<[PageFragmentKey; 4]> {
        match self {
            Versioning::Full => SmallVec::new(),
            Versioning::Differential => {
                if Self::is_differential_dump(new_revision, revs_to_restore)
                    || !reference.is_persisted()
                {
                    SmallVec::new()
                } else if Self::is_differential_dump(head_revision, revs_to_restore) {
                    let mut chain = SmallVec::new();
                    chain.push(PageFragmentKey {
                        revision: head_revision,
                        offset: reference.file_key() as u64,
                    });
                    chain
                } else {
                    // Carry the dump fragment the previous chain points at.
                    reference.fragments().iter().copied().collect()
                }
            }
            Versioning::Incremental => {
                if fragments_combined >= self.window(revs_to_restore) {
                    // The new fragment is a full dump; nothing older is
                    // needed to reconstruct it.
                    SmallVec::new()
                } else {
                    reference.pushed_fragment_chain(head_revision, revs_to_restore)
                }
            }
            Versioning::SlidingSnapshot => {
                reference.pushed_fragment_chain(head_revision, revs_to_restore)
            }
        }
    }
}

/// Fills holes in `target` from `source`; returns true when `target` is
/// complete and older fragments cannot contribute further slots.
fn union_into(target: &mut KeyValueLeafPage, source: &KeyValueLeafPage) -> bool {
    for offset in source.populated_offsets() {
        if target.slot(offset).is_none() {
            target.adopt_slot_from(source, offset);
        }
    }
    target.is_full()
}

fn empty_like(leaf: &KeyValueLeafPage) -> KeyValueLeafPage {
    KeyValueLeafPage::empty(
        leaf.page_key(),
        leaf.index(),
        leaf.index_id(),
        leaf.revision(),
        leaf.has_dewey_ids(),
    )
}

/// Copies into `delta` every entry served only by the oldest fragment of a
/// full window, so it survives the window sliding past that fragment.
fn keep_expiring_entries(delta: &mut KeyValueLeafPage, fragments: &[KeyValueLeafPage]) {
    let (oldest, newer) = fragments.split_last().expect("window checked non-empty");
    for offset in oldest.populated_offsets() {
        if newer.iter().all(|f| f.slot(offset).is_none()) {
            delta.adopt_slot_from(oldest, offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndexKind;

    fn leaf_with(revision: Revision, slots: &[(usize, u8)]) -> KeyValueLeafPage {
        let mut leaf = KeyValueLeafPage::empty(0, IndexKind::Document, 0, revision, false);
        for (offset, value) in slots {
            leaf.set_slot(*offset, vec![1, *value]);
        }
        leaf
    }

    #[test]
    fn full_combines_single_fragment() {
        let combined = Versioning::Full
            .combine_for_read(vec![leaf_with(3, &[(0, 9)])], 1)
            .unwrap();
        assert_eq!(combined.slot(0), Some(&[1, 9][..]));
        let err = Versioning::Full
            .combine_for_read(vec![leaf_with(3, &[]), leaf_with(2, &[])], 1)
            .unwrap_err();
        assert!(matches!(err, RastroError::VersioningInvariant(_)));
    }

    #[test]
    fn incremental_union_is_latest_first() {
        // Three deltas touching overlapping slots; the newest value wins.
        let fragments = vec![
            leaf_with(5, &[(0, 50)]),
            leaf_with(4, &[(0, 40), (1, 41)]),
            leaf_with(3, &[(1, 31), (2, 32)]),
        ];
        let combined = Versioning::Incremental.combine_for_read(fragments, 4).unwrap();
        assert_eq!(combined.slot(0), Some(&[1, 50][..]));
        assert_eq!(combined.slot(1), Some(&[1, 41][..]));
        assert_eq!(combined.slot(2), Some(&[1, 32][..]));
        assert_eq!(combined.slot(3), None);
    }

    #[test]
    fn incremental_window_overflow_is_rejected() {
        let fragments = (0..5).map(|i| leaf_with(i, &[])).collect();
        let err = Versioning::Incremental
            .combine_for_read(fragments, 4)
            .unwrap_err();
        assert!(matches!(err, RastroError::VersioningInvariant(_)));
    }

    #[test]
    fn incremental_dumps_on_window_boundary() {
        let fragments = vec![
            leaf_with(4, &[(0, 40)]),
            leaf_with(3, &[(1, 31)]),
            leaf_with(2, &[(2, 22)]),
            leaf_with(1, &[(3, 13)]),
        ];
        let container = Versioning::Incremental
            .combine_for_modification(fragments, 4, 5)
            .unwrap();
        let modified = container.modified.as_leaf().unwrap();
        // Window full: the write view is a dump of everything.
        for offset in 0..4 {
            assert!(modified.slot(offset).is_some(), "slot {offset} missing");
        }
        assert_eq!(modified.revision(), 5);
    }

    #[test]
    fn incremental_delta_is_empty_off_boundary() {
        let fragments = vec![leaf_with(2, &[(0, 20)]), leaf_with(1, &[(1, 11)])];
        let container = Versioning::Incremental
            .combine_for_modification(fragments, 4, 3)
            .unwrap();
        let complete = container.complete.as_leaf().unwrap();
        let modified = container.modified.as_leaf().unwrap();
        assert!(complete.slot(0).is_some() && complete.slot(1).is_some());
        assert!(modified.slot(0).is_none() && modified.slot(1).is_none());
    }

    #[test]
    fn differential_mirrors_latest_delta() {
        // Revision 2 (not a dump under period 4): write view mirrors the
        // latest cumulative delta, not the dump.
        let fragments = vec![leaf_with(1, &[(0, 10)]), leaf_with(0, &[(1, 1), (0, 2)])];
        let container = Versioning::Differential
            .combine_for_modification(fragments, 4, 2)
            .unwrap();
        let complete = container.complete.as_leaf().unwrap();
        let modified = container.modified.as_leaf().unwrap();
        assert_eq!(complete.slot(0), Some(&[1, 10][..]));
        assert_eq!(complete.slot(1), Some(&[1, 1][..]));
        assert_eq!(modified.slot(0), Some(&[1, 10][..]));
        assert_eq!(modified.slot(1), None);
    }

    #[test]
    fn differential_dump_copies_everything() {
        let fragments = vec![leaf_with(3, &[(0, 30)]), leaf_with(0, &[(1, 1)])];
        let container = Versioning::Differential
            .combine_for_modification(fragments, 4, 4)
            .unwrap();
        let modified = container.modified.as_leaf().unwrap();
        assert!(modified.slot(0).is_some());
        assert!(modified.slot(1).is_some());
    }

    #[test]
    fn sliding_snapshot_keeps_expiring_slots_alive() {
        // Window of 3 is full. Slot 9 exists only in the oldest fragment and
        // would fall out when the window slides; the write view must carry it.
        let fragments = vec![
            leaf_with(5, &[(0, 50)]),
            leaf_with(4, &[(1, 41)]),
            leaf_with(3, &[(9, 39), (1, 31)]),
        ];
        let container = Versioning::SlidingSnapshot
            .combine_for_modification(fragments, 3, 6)
            .unwrap();
        let modified = container.modified.as_leaf().unwrap();
        assert_eq!(modified.slot(9), Some(&[1, 39][..]));
        // Slot 1 is served by a newer fragment, so it is not re-materialized.
        assert_eq!(modified.slot(1), None);
        assert_eq!(modified.slot(0), None);
    }

    #[test]
    fn sliding_snapshot_partial_window_writes_pure_delta() {
        let fragments = vec![leaf_with(2, &[(0, 20)]), leaf_with(1, &[(1, 11)])];
        let container = Versioning::SlidingSnapshot
            .combine_for_modification(fragments, 3, 3)
            .unwrap();
        let modified = container.modified.as_leaf().unwrap();
        assert!(modified.slot(0).is_none());
        assert!(modified.slot(1).is_none());
        assert!(modified.slot(9).is_none());
    }

    #[test]
    fn chain_evolution_full_and_sliding() {
        use crate::types::checksum::{HashKind, HashValue};
        let mut reference = PageRef::unset();
        reference.set_persisted(700, HashValue::new(HashKind::Xxh3, 1));
        reference.set_fragments(
            [
                PageFragmentKey {
                    revision: 6,
                    offset: 600,
                },
                PageFragmentKey {
                    revision: 5,
                    offset: 500,
                },
            ]
            .into_iter()
            .collect(),
        );

        assert!(Versioning::Full
            .fragment_chain_after_commit(&reference, 7, 8, 1, 1)
            .is_empty());

        let chain =
            Versioning::SlidingSnapshot.fragment_chain_after_commit(&reference, 7, 8, 4, 3);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].offset, 700);
        assert_eq!(chain[1].offset, 600);
        assert_eq!(chain[2].offset, 500);
    }

    #[test]
    fn chain_evolution_incremental_resets_on_dump() {
        use crate::types::checksum::{HashKind, HashValue};
        let mut reference = PageRef::unset();
        reference.set_persisted(700, HashValue::new(HashKind::Xxh3, 1));
        reference.set_fragments(
            [
                PageFragmentKey {
                    revision: 6,
                    offset: 600,
                },
                PageFragmentKey {
                    revision: 5,
                    offset: 500,
                },
                PageFragmentKey {
                    revision: 4,
                    offset: 400,
                },
            ]
            .into_iter()
            .collect(),
        );
        // The read combined a full window, so the new fragment is a dump.
        let chain = Versioning::Incremental.fragment_chain_after_commit(&reference, 7, 8, 4, 4);
        assert!(chain.is_empty());
        // Off-boundary pushes the head onto the chain.
        let mut shorter = reference.clone();
        shorter.set_fragments(
            [PageFragmentKey {
                revision: 6,
                offset: 600,
            }]
            .into_iter()
            .collect(),
        );
        let chain = Versioning::Incremental.fragment_chain_after_commit(&shorter, 7, 8, 4, 2);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].offset, 700);
    }

    #[test]
    fn differential_chain_points_at_the_dump() {
        use crate::types::checksum::{HashKind, HashValue};
        let mut reference = PageRef::unset();
        reference.set_persisted(900, HashValue::new(HashKind::Xxh3, 1));
        // Head revision 4 is a dump under period 4.
        let chain = Versioning::Differential.fragment_chain_after_commit(&reference, 4, 5, 4, 1);
        assert_eq!(chain.len(), 1);
        assert_eq!(
            chain[0],
            PageFragmentKey {
                revision: 4,
                offset: 900
            }
        );
        // Head revision 5 is a delta: the existing chain (pointing at the
        // dump) is carried unchanged.
        let mut carried = reference.clone();
        carried.set_fragments(chain.clone());
        let next = Versioning::Differential.fragment_chain_after_commit(&carried, 5, 6, 4, 2);
        assert_eq!(next, chain);
        // A dump revision clears the chain.
        assert!(Versioning::Differential
            .fragment_chain_after_commit(&carried, 7, 8, 4, 2)
            .is_empty());
    }
}
