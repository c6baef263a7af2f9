//! Level math for the fixed-fanout indirect-page tries.
//!
//! Every index trie has a fixed depth chosen per index kind so that
//! `FANOUT ^ depth` covers the kind's maximum page key. Leaves live at the
//! fixed depth; internal levels never hold records.

use crate::types::{IndexKind, NodeKey, PageKey, RastroError, Result, Revision};

/// References per indirect page. Power of two.
pub const FANOUT: usize = 1 << FANOUT_BITS;
/// Bits per trie digit.
pub const FANOUT_BITS: u32 = 10;
const FANOUT_MASK: u64 = (FANOUT as u64) - 1;

/// Record slots per key-value leaf page. Power of two.
pub const RECORDS_PER_PAGE: usize = 1 << RECORDS_PER_PAGE_BITS;
/// Bits of a node key that select the slot inside its leaf.
pub const RECORDS_PER_PAGE_BITS: u32 = 10;
const RECORDS_PER_PAGE_MASK: u64 = (RECORDS_PER_PAGE as u64) - 1;

/// Depth of the revision-root trie hanging off the UberPage.
pub const REVISION_TRIE_DEPTH: usize = 3;

/// Trie depth for an index kind (not counting the per-id directory level of
/// the secondary kinds).
pub fn depth(kind: IndexKind) -> usize {
    match kind {
        IndexKind::Document | IndexKind::Cas | IndexKind::Path => 5,
        IndexKind::PathSummary | IndexKind::Name => 3,
    }
}

/// Largest page key addressable at the given depth.
pub fn max_page_key(depth: usize) -> u64 {
    (1u64 << (FANOUT_BITS * depth as u32)) - 1
}

/// Largest node key addressable inside an index kind's trie.
pub fn max_node_key(kind: IndexKind) -> u64 {
    ((max_page_key(depth(kind)) + 1) << RECORDS_PER_PAGE_BITS) - 1
}

/// Splits a node key into its leaf page key.
pub fn page_key_of(node_key: NodeKey) -> PageKey {
    node_key >> RECORDS_PER_PAGE_BITS
}

/// Splits a node key into its slot offset inside the leaf.
pub fn slot_offset_of(node_key: NodeKey) -> usize {
    (node_key & RECORDS_PER_PAGE_MASK) as usize
}

/// First node key stored in the given leaf page.
pub fn first_node_key_of(page_key: PageKey) -> NodeKey {
    page_key << RECORDS_PER_PAGE_BITS
}

/// Per-level digits of `page_key` in base `FANOUT`, most significant first.
///
/// The digits drive the trie walk: digit `i` selects the reference inside
/// the level-`i` indirect page.
pub fn level_offsets(page_key: PageKey, depth: usize) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(depth);
    for level in 0..depth {
        let shift = FANOUT_BITS * (depth - 1 - level) as u32;
        offsets.push(((page_key >> shift) & FANOUT_MASK) as usize);
    }
    offsets
}

/// Validates a node key against an index kind's capacity.
pub fn check_node_key(kind: IndexKind, node_key: NodeKey) -> Result<()> {
    if node_key > max_node_key(kind) {
        return Err(RastroError::KeyOutOfRange(node_key));
    }
    Ok(())
}

/// Digits for walking the revision-root trie with a revision number as key.
pub fn revision_offsets(revision: Revision) -> Vec<usize> {
    level_offsets(u64::from(revision), REVISION_TRIE_DEPTH)
}
