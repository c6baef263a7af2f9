//! Storage backends: the uniform reader/writer contract, the on-disk frame
//! and beacon formats, and the provider registry.
//!
//! A resource persists into two files. The data file opens with the two
//! 512-byte UberPage beacon slots and continues as an append-only sequence
//! of padded page frames. The revisions-offset file mirrors the beacon
//! region and then records, per revision, the revision-root frame offset and
//! the commit timestamp at a fixed 16-byte stride.

use std::sync::Arc;

use crate::page::{Page, PageKind, UberPage};
use crate::primitives::bytes::BytePipe;
use crate::types::checksum::{HashKind, HashValue};
use crate::types::{ChecksumScope, RastroError, Result, Revision};

pub mod file;
pub mod mmap;
pub mod providers;
pub mod revfile;

pub use file::{FileBackend, DATA_FILE, REVISIONS_FILE};
pub use mmap::MmapBackend;
pub use providers::{Provider, StorageProviders};

/// Size of one UberPage beacon slot.
pub const BEACON_SLOT: u64 = 512;
/// Offset of the first beacon.
pub const BEACON_PRIMARY: u64 = 0;
/// Offset of the duplicate beacon.
pub const BEACON_SECONDARY: u64 = 512;
/// First append offset of the data file, past both beacons.
pub const DATA_START: u64 = 2 * BEACON_SLOT;
/// Length prefix bytes in front of every frame payload.
pub const FRAME_PREFIX: u64 = 4;
/// Header bytes of a beacon slot: length prefix plus payload hash.
const BEACON_HEADER: usize = 12;

/// Per-resource settings the IO layer needs on both sides.
#[derive(Debug, Clone, Copy)]
pub struct IoSettings {
    /// Owning database id stamped onto deserialized references.
    pub database_id: u64,
    /// Owning resource id stamped onto deserialized references.
    pub resource_id: u64,
    /// Page checksum algorithm.
    pub hash_kind: HashKind,
    /// Whether leaves carry per-page symbol tables.
    pub use_fsst: bool,
}

/// Rounds `offset` up to the next multiple of `align` (a power of two).
pub fn align_up(offset: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

/// End of a frame written at `start`, padding included. Uber frames occupy
/// whole 512-byte multiples so the following frame stays 512-aligned; all
/// other kinds pad to the 8-byte base alignment.
pub fn frame_end(kind: PageKind, start: u64, payload_len: u64) -> u64 {
    let raw = FRAME_PREFIX + payload_len;
    match kind {
        PageKind::Uber => start + align_up(raw, 512),
        _ => align_up(start + raw, 8),
    }
}

/// Encodes an uber frame payload into a 512-byte beacon slot: length prefix,
/// payload hash, payload, zero padding. The hash makes each slot
/// self-verifying for crash recovery.
pub fn encode_beacon(payload: &[u8]) -> Result<[u8; BEACON_SLOT as usize]> {
    if payload.len() > BEACON_SLOT as usize - BEACON_HEADER {
        return Err(RastroError::Invalid("uber payload exceeds beacon slot"));
    }
    let mut slot = [0u8; BEACON_SLOT as usize];
    slot[..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    let hash = HashKind::Xxh3.hash(payload);
    slot[4..12].copy_from_slice(&hash.to_be_bytes());
    slot[BEACON_HEADER..BEACON_HEADER + payload.len()].copy_from_slice(payload);
    Ok(slot)
}

/// Decodes and verifies one beacon slot, returning the uber frame payload.
pub fn decode_beacon(slot: &[u8], slot_offset: u64) -> Result<Vec<u8>> {
    if slot.len() < BEACON_HEADER {
        return Err(RastroError::CorruptHeader("beacon slot truncated"));
    }
    let len = u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]) as usize;
    if len == 0 || len > BEACON_SLOT as usize - BEACON_HEADER {
        return Err(RastroError::CorruptHeader("beacon length prefix invalid"));
    }
    let mut expected = [0u8; 8];
    expected.copy_from_slice(&slot[4..12]);
    let expected = u64::from_be_bytes(expected);
    let payload = &slot[BEACON_HEADER..BEACON_HEADER + len];
    let actual = HashKind::Xxh3.hash(payload);
    if actual != expected {
        return Err(RastroError::checksum_mismatch(
            slot_offset,
            ChecksumScope::Beacon,
            HashValue::new(HashKind::Xxh3, expected),
            actual,
        ));
    }
    Ok(payload.to_vec())
}

/// Read side of a storage backend.
///
/// Readers produce deserialized, id-fixed-up pages from file offsets,
/// verifying checksums against the owning reference: compressed bytes for
/// every non-leaf kind, uncompressed canonical bytes for record leaves.
pub trait Reader: Send {
    /// Reads and verifies the page at `offset` against `expected`.
    fn read(&self, offset: u64, expected: Option<HashValue>) -> Result<Page>;

    /// Reads the revision root of `revision` through the revisions-offset
    /// file fast path.
    fn read_revision_root(&self, revision: Revision) -> Result<Page>;

    /// Data-file offset and commit timestamp recorded for a revision.
    fn revision_file_data(&self, revision: Revision) -> Result<(u64, i64)>;

    /// Number of revisions recorded in the revisions-offset file.
    fn revision_count(&self) -> Result<u32>;

    /// Offset of the first byte after the frame starting at `offset`
    /// (padding excluded); used by physical truncation.
    fn frame_end_offset(&self, offset: u64) -> Result<u64>;

    /// The byte pipe configured for the resource.
    fn byte_handler(&self) -> &BytePipe;
}

/// Write side of a storage backend. Single-owner; the commit pipeline drives
/// the call order.
pub trait Writer: Send {
    /// Serializes, compresses, checksums, and appends a page at an offset
    /// satisfying the alignment rules. Returns the frame offset and the hash
    /// the parent reference must store.
    fn write_page(&mut self, page: &mut Page) -> Result<(u64, HashValue)>;

    /// Appends the `(offset, timestamp)` entry for a committed revision.
    fn append_revision_entry(
        &mut self,
        revision: Revision,
        offset: u64,
        timestamp: i64,
    ) -> Result<()>;

    /// Rewrites both beacon slots (and their revisions-file mirror) with the
    /// serialized uber page.
    fn write_uber_beacons(&mut self, uber: &mut UberPage) -> Result<()>;

    /// Forces file contents to durable storage.
    fn sync(&mut self) -> Result<()>;

    /// Cuts the data file to `data_len` and the revisions file to cover
    /// revisions `0..=revision`.
    fn truncate_to(&mut self, revision: Revision, data_len: u64) -> Result<()>;

    /// Wipes everything after the beacon regions.
    fn truncate(&mut self) -> Result<()>;

    /// Next append offset of the data file.
    fn data_len(&self) -> u64;
}

/// A storage backend bound to one resource directory.
pub trait StorageBackend: Send + Sync {
    /// Opens the read side.
    fn create_reader(&self) -> Result<Box<dyn Reader>>;

    /// Opens the write side.
    fn create_writer(&self) -> Result<Box<dyn Writer>>;

    /// Recovers the current UberPage from the beacon slots: the
    /// checksum-valid copy wins, and when both verify, the higher revision
    /// count does. Returns `None` on a fresh resource.
    fn uber_page_reference(&self) -> Result<Option<UberPage>>;

    /// The byte pipe configured for the resource.
    fn byte_handler(&self) -> Arc<BytePipe>;

    /// Backend name, matching its provider registration.
    fn name(&self) -> &'static str;
}

/// Verifies raw bytes against an expected reference hash.
pub(crate) fn verify_expected(
    bytes: &[u8],
    expected: Option<HashValue>,
    offset: u64,
    scope: ChecksumScope,
) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = expected.kind().hash(bytes);
    if actual != expected.value() {
        return Err(RastroError::checksum_mismatch(
            offset, scope, expected, actual,
        ));
    }
    Ok(())
}

/// Recovers the current UberPage from the two beacon slots of the data file.
///
/// A slot whose checksum fails is skipped; when both verify, the higher
/// revision count wins (a crash between the two beacon writes leaves them
/// one commit apart). Both slots failing on a non-empty file is corruption.
pub(crate) fn recover_uber_page(
    io: &dyn crate::primitives::io::FileIo,
    pipe: &BytePipe,
    settings: IoSettings,
) -> Result<Option<UberPage>> {
    use crate::page::persist::{deserialize_page, IdFixup};

    if io.is_empty()? {
        return Ok(None);
    }
    let fixup = IdFixup {
        database_id: settings.database_id,
        resource_id: settings.resource_id,
    };
    let mut recovered: Option<UberPage> = None;
    for slot_offset in [BEACON_PRIMARY, BEACON_SECONDARY] {
        let mut slot = [0u8; BEACON_SLOT as usize];
        if io.read_at(slot_offset, &mut slot).is_err() {
            continue;
        }
        let payload = match decode_beacon(&slot, slot_offset) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(slot_offset, %err, "io.beacon.invalid");
                continue;
            }
        };
        let frame = pipe.decompress(&payload)?;
        let page = deserialize_page(&frame, None, fixup)?;
        let Page::Uber(uber) = page else {
            return Err(RastroError::CorruptHeader("beacon holds a non-uber page"));
        };
        recovered = match recovered.take() {
            Some(best) if best.revision_count() >= uber.revision_count() => Some(best),
            _ => Some(uber),
        };
    }
    match recovered {
        Some(uber) => Ok(Some(uber)),
        None => Err(RastroError::CorruptHeader(
            "both uber beacons failed verification",
        )),
    }
}

/// Reads, verifies, decompresses, and deserializes the frame at `offset`.
///
/// Leaf frames verify the reference hash over the uncompressed canonical
/// bytes and claim the pooled decompression buffer as slot backing; all
/// other kinds verify over the compressed bytes and return the buffer to
/// its stripe on exit.
pub(crate) fn read_page_at(
    io: &dyn crate::primitives::io::FileIo,
    offset: u64,
    expected: Option<HashValue>,
    pipe: &BytePipe,
    pool: &Arc<crate::primitives::bytes::BufferPool>,
    settings: IoSettings,
) -> Result<Page> {
    use crate::page::persist::{deserialize_page, IdFixup};
    use crate::primitives::io::read_frame_exact;

    let mut prefix = [0u8; FRAME_PREFIX as usize];
    read_frame_exact(io, offset, &mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 || len > (1 << 30) {
        return Err(RastroError::CorruptHeader("frame length prefix invalid"));
    }
    let mut compressed = vec![0u8; len];
    read_frame_exact(io, offset + FRAME_PREFIX, &mut compressed)?;

    let fixup = IdFixup {
        database_id: settings.database_id,
        resource_id: settings.resource_id,
    };
    let scoped = pipe.decompress_scoped(&compressed, pool)?;
    let segment = scoped.segment();
    let tag = *segment
        .first()
        .ok_or(RastroError::CorruptHeader("frame payload empty"))?;
    let kind = PageKind::from_tag(tag)?;
    if kind == PageKind::KeyValueLeaf {
        verify_expected(segment, expected, offset, ChecksumScope::LeafCanonical)?;
        // Claim the pooled buffer; plain slots of the leaf index straight
        // into it instead of copying.
        let backing = Arc::new(scoped.transfer_ownership());
        deserialize_page(backing.as_slice(), Some(Arc::clone(&backing)), fixup)
    } else {
        verify_expected(&compressed, expected, offset, ChecksumScope::CompressedFrame)?;
        deserialize_page(segment, None, fixup)
    }
}
