//! Slot-addressed record pages.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::page::codec::{read_bitmap, write_bitmap, ByteReader, ByteWriter};
use crate::page::reference::PageRef;
use crate::primitives::bytes::OwnedSegment;
use crate::primitives::fsst::SymbolTable;
use crate::trie::{first_node_key_of, RECORDS_PER_PAGE};
use crate::types::{IndexKind, NodeKey, PageKey, RastroError, Result, Revision};

/// Serialized record payloads above this size move to an overflow page.
pub const OVERFLOW_THRESHOLD: usize = 4096;

/// A record stored in a leaf slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Key of the record, unique per index instance.
    pub node_key: NodeKey,
    /// One-byte kind tag owned by the node layer.
    pub kind: u8,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Record {
    /// Serialized slot form: kind tag followed by the payload.
    pub fn to_slot_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.payload.len());
        bytes.push(self.kind);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parses the slot form back into a record.
    pub fn from_slot_bytes(node_key: NodeKey, bytes: &[u8]) -> Result<Self> {
        let (kind, payload) = bytes
            .split_first()
            .ok_or(RastroError::CorruptHeader("record slot empty"))?;
        Ok(Self {
            node_key,
            kind: *kind,
            payload: payload.to_vec(),
        })
    }
}

/// Slot bytes either own their storage or index into the page's claimed
/// decompression buffer.
#[derive(Debug, Clone)]
enum SlotData {
    Inline(Vec<u8>),
    Backed { start: usize, len: usize },
}

/// A slot-addressed page holding the records of one leaf of an index trie.
///
/// Slot `i` stores the record with key `first_node_key + i`. Oversized
/// records live in overflow pages addressed through the reference map. A
/// leaf read without string compression claims the decompressed frame buffer
/// and lets its slots point into it; any mutation rewrites the touched slot
/// as owned bytes.
#[derive(Debug, Clone)]
pub struct KeyValueLeafPage {
    page_key: PageKey,
    index: IndexKind,
    index_id: u32,
    revision: Revision,
    slots: Vec<Option<SlotData>>,
    dewey_ids: Option<Vec<Option<Vec<u8>>>>,
    references: FxHashMap<NodeKey, PageRef>,
    records: FxHashMap<usize, Record>,
    backing: Option<Arc<OwnedSegment>>,
}

impl KeyValueLeafPage {
    /// An empty leaf for the given position in an index trie.
    pub fn empty(
        page_key: PageKey,
        index: IndexKind,
        index_id: u32,
        revision: Revision,
        use_dewey_ids: bool,
    ) -> Self {
        Self {
            page_key,
            index,
            index_id,
            revision,
            slots: vec![None; RECORDS_PER_PAGE],
            dewey_ids: use_dewey_ids.then(|| vec![None; RECORDS_PER_PAGE]),
            references: FxHashMap::default(),
            records: FxHashMap::default(),
            backing: None,
        }
    }

    /// Logical page number inside the index trie.
    pub fn page_key(&self) -> PageKey {
        self.page_key
    }

    /// Index kind this leaf belongs to.
    pub fn index(&self) -> IndexKind {
        self.index
    }

    /// Index instance id (0 for document and path-summary).
    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    /// Revision that produced this fragment.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Rebrands the leaf as belonging to `revision`; used when a write view
    /// is derived from committed fragments.
    pub fn set_revision(&mut self, revision: Revision) {
        self.revision = revision;
    }

    /// Whether the dewey-id sidecar is carried.
    pub fn has_dewey_ids(&self) -> bool {
        self.dewey_ids.is_some()
    }

    /// Slot bytes at `offset`, if present.
    pub fn slot(&self, offset: usize) -> Option<&[u8]> {
        match self.slots[offset].as_ref()? {
            SlotData::Inline(bytes) => Some(bytes),
            SlotData::Backed { start, len } => {
                let backing = self
                    .backing
                    .as_ref()
                    .expect("backed slot without claimed buffer");
                Some(&backing.as_slice()[*start..*start + *len])
            }
        }
    }

    /// Stores raw slot bytes at `offset`.
    pub fn set_slot(&mut self, offset: usize, bytes: Vec<u8>) {
        self.slots[offset] = Some(SlotData::Inline(bytes));
    }

    /// Marks a record as removed: the slot stays populated with empty bytes
    /// so the tombstone shadows older fragments during reconstruction.
    pub fn tombstone_slot(&mut self, offset: usize) {
        let node_key = self.node_key_at(offset);
        self.slots[offset] = Some(SlotData::Inline(Vec::new()));
        self.records.remove(&offset);
        self.references.remove(&node_key);
        if let Some(deweys) = &mut self.dewey_ids {
            deweys[offset] = None;
        }
    }

    /// Clears a slot and its sidecar entries (record removal).
    pub fn clear_slot(&mut self, offset: usize) {
        let node_key = self.node_key_at(offset);
        self.slots[offset] = None;
        self.records.remove(&offset);
        self.references.remove(&node_key);
        if let Some(deweys) = &mut self.dewey_ids {
            deweys[offset] = None;
        }
    }

    /// Offsets of the populated slots, ascending.
    pub fn populated_offsets(&self) -> Vec<usize> {
        (0..RECORDS_PER_PAGE)
            .filter(|&i| self.slots[i].is_some())
            .collect()
    }

    /// True when every slot is populated.
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    /// True when no slot and no reference is populated.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none()) && self.references.is_empty()
    }

    /// Dewey id at `offset`, if carried and present.
    pub fn dewey_id(&self, offset: usize) -> Option<&[u8]> {
        self.dewey_ids.as_ref()?[offset].as_deref()
    }

    /// Stores a dewey id at `offset`. No-op when the sidecar is disabled.
    pub fn set_dewey_id(&mut self, offset: usize, dewey: Vec<u8>) {
        if let Some(deweys) = &mut self.dewey_ids {
            deweys[offset] = Some(dewey);
        }
    }

    /// The overflow reference map.
    pub fn references(&self) -> &FxHashMap<NodeKey, PageRef> {
        &self.references
    }

    /// Mutable overflow reference map.
    pub fn references_mut(&mut self) -> &mut FxHashMap<NodeKey, PageRef> {
        &mut self.references
    }

    /// Node key stored at a slot offset.
    pub fn node_key_at(&self, offset: usize) -> NodeKey {
        first_node_key_of(self.page_key) + offset as u64
    }

    /// Returns the materialized record at `offset`, parsing the slot bytes
    /// on first access. Repeated calls return the same instance.
    pub fn record_mut(&mut self, offset: usize) -> Result<Option<&mut Record>> {
        if !self.records.contains_key(&offset) {
            let node_key = self.node_key_at(offset);
            let Some(bytes) = self.slot(offset) else {
                return Ok(None);
            };
            if bytes.is_empty() {
                // Removal tombstone.
                return Ok(None);
            }
            let record = Record::from_slot_bytes(node_key, bytes)?;
            self.records.insert(offset, record);
        }
        Ok(self.records.get_mut(&offset))
    }

    /// The live record object at `offset`, when one was materialized.
    pub fn peek_record(&self, offset: usize) -> Option<&Record> {
        self.records.get(&offset)
    }

    /// Installs a materialized record without touching the slot bytes yet.
    pub fn install_record(&mut self, offset: usize, record: Record) -> &mut Record {
        self.records.insert(offset, record);
        self.records
            .get_mut(&offset)
            .expect("record inserted above")
    }

    /// Writes every materialized record back into its slot and drops the
    /// record objects, freeing their memory to the allocator.
    pub fn serialize_records(&mut self) {
        let offsets: Vec<usize> = self.records.keys().copied().collect();
        for offset in offsets {
            if let Some(record) = self.records.remove(&offset) {
                self.slots[offset] = Some(SlotData::Inline(record.to_slot_bytes()));
            }
        }
    }

    /// Writes one materialized record back into its slot, keeping the record
    /// object alive.
    pub fn sync_record_slot(&mut self, offset: usize) {
        if let Some(record) = self.records.get(&offset) {
            let bytes = record.to_slot_bytes();
            self.slots[offset] = Some(SlotData::Inline(bytes));
        }
    }

    /// Copies a slot from another fragment, together with its dewey id and
    /// overflow reference. A slot's reference entry always lives in the same
    /// fragment as the slot, so adoption keeps them paired; a newer inline
    /// value must never pick up an older fragment's overflow reference.
    pub fn adopt_slot_from(&mut self, other: &KeyValueLeafPage, offset: usize) {
        if let Some(bytes) = other.slot(offset) {
            self.slots[offset] = Some(SlotData::Inline(bytes.to_vec()));
        }
        if let Some(dewey) = other.dewey_id(offset) {
            self.set_dewey_id(offset, dewey.to_vec());
        }
        let node_key = other.node_key_at(offset);
        if let Some(reference) = other.references().get(&node_key) {
            self.references.insert(node_key, reference.clone());
        }
    }

    /// Compares logical content: header fields, resolved slot bytes, dewey
    /// sidecar, and overflow references. Backing representation differences
    /// do not matter.
    pub fn logical_eq(&self, other: &KeyValueLeafPage) -> bool {
        if self.page_key != other.page_key
            || self.index != other.index
            || self.index_id != other.index_id
        {
            return false;
        }
        for offset in 0..RECORDS_PER_PAGE {
            if self.slot(offset) != other.slot(offset) {
                return false;
            }
            if self.dewey_id(offset) != other.dewey_id(offset) {
                return false;
            }
        }
        self.references == other.references
    }

    /// Serializes the canonical body (without the kind tag): header, optional
    /// symbol table, slots ascending, dewey sidecar, reference map sorted by
    /// node key. Materialized records are flushed first, so the byte form
    /// always wins.
    pub fn serialize(&mut self, w: &mut ByteWriter<'_>, use_fsst: bool) {
        self.serialize_records();
        let table = if use_fsst {
            let samples: Vec<&[u8]> = (0..RECORDS_PER_PAGE).filter_map(|i| self.slot(i)).collect();
            let table = SymbolTable::train(samples);
            (!table.is_empty()).then_some(table)
        } else {
            None
        };

        w.u64(self.page_key);
        w.u8(self.index.tag());
        w.u32(self.index_id);
        w.u32(self.revision);
        let mut flags = 0u8;
        if self.dewey_ids.is_some() {
            flags |= 0b01;
        }
        if table.is_some() {
            flags |= 0b10;
        }
        w.u8(flags);
        if let Some(table) = &table {
            let mut bytes = Vec::new();
            table.serialize(&mut bytes);
            w.raw(&bytes);
        }

        write_bitmap(w, &self.slots);
        for offset in 0..RECORDS_PER_PAGE {
            if let Some(bytes) = self.slot(offset) {
                match &table {
                    Some(table) => w.bytes_u32(&table.encode(bytes)),
                    None => w.bytes_u32(bytes),
                }
            }
        }

        if let Some(deweys) = &self.dewey_ids {
            write_bitmap(w, deweys);
            for dewey in deweys.iter().flatten() {
                w.bytes_u16(dewey);
            }
        }

        let mut keys: Vec<NodeKey> = self.references.keys().copied().collect();
        keys.sort_unstable();
        w.u16(keys.len() as u16);
        for key in keys {
            w.u64(key);
            self.references[&key].serialize(w);
        }
    }

    /// Deserializes a body written by [`Self::serialize`].
    ///
    /// `backing` must be the buffer the reader walks, starting at the frame
    /// payload's first byte, so backed slots can index into it; pass `None`
    /// to copy slots instead. Symbol-encoded slots always decode into owned
    /// bytes.
    pub fn deserialize(
        r: &mut ByteReader<'_>,
        backing: Option<Arc<OwnedSegment>>,
    ) -> Result<Self> {
        let page_key = r.u64()?;
        let index = IndexKind::from_tag(r.u8()?)?;
        let index_id = r.u32()?;
        let revision = r.u32()?;
        let flags = r.u8()?;
        let has_deweys = flags & 0b01 != 0;
        let table = if flags & 0b10 != 0 {
            let mut consumed = 0;
            let table = SymbolTable::deserialize(r.rest(), &mut consumed)?;
            r.advance(consumed)?;
            Some(table)
        } else {
            None
        };

        let set = read_bitmap(r, RECORDS_PER_PAGE)?;
        let mut slots: Vec<Option<SlotData>> = vec![None; RECORDS_PER_PAGE];
        for offset in set {
            let prefix_at = r.offset();
            let bytes = r.bytes_u32()?;
            slots[offset] = Some(match &table {
                Some(table) => SlotData::Inline(table.decode(bytes)?),
                None if backing.is_some() => SlotData::Backed {
                    start: prefix_at + 4,
                    len: bytes.len(),
                },
                None => SlotData::Inline(bytes.to_vec()),
            });
        }

        let dewey_ids = if has_deweys {
            let set = read_bitmap(r, RECORDS_PER_PAGE)?;
            let mut deweys: Vec<Option<Vec<u8>>> = vec![None; RECORDS_PER_PAGE];
            for offset in set {
                deweys[offset] = Some(r.bytes_u16()?.to_vec());
            }
            Some(deweys)
        } else {
            None
        };

        let ref_count = r.u16()? as usize;
        let mut references = FxHashMap::default();
        for _ in 0..ref_count {
            let key = r.u64()?;
            references.insert(key, PageRef::deserialize(r)?);
        }

        Ok(Self {
            page_key,
            index,
            index_id,
            revision,
            slots,
            dewey_ids,
            references,
            records: FxHashMap::default(),
            backing,
        })
    }
}

/// A page holding one oversized record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowPage {
    data: Vec<u8>,
}

impl OverflowPage {
    /// Wraps an oversized payload.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The stored payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes the page body (without the kind tag).
    pub fn serialize(&self, w: &mut ByteWriter<'_>) {
        w.bytes_u32(&self.data);
    }

    /// Deserializes a body written by [`Self::serialize`].
    pub fn deserialize(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            data: r.bytes_u32()?.to_vec(),
        })
    }
}
