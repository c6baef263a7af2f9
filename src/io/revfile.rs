//! The revisions-offset side file.
//!
//! Layout: a 1024-byte mirror of the two UberPage beacon slots, then one
//! 16-byte entry per revision holding the revision-root frame offset and the
//! commit timestamp in epoch milliseconds, both in native byte order.

use std::path::Path;

use crate::io::{BEACON_SLOT, DATA_START};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{RastroError, Result, Revision};

/// Bytes per revision entry.
pub const ENTRY_STRIDE: u64 = 16;

/// Handle on one resource's revisions-offset file.
#[derive(Debug, Clone)]
pub struct RevisionsFile {
    io: StdFileIo,
}

impl RevisionsFile {
    /// Opens or creates the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            io: StdFileIo::open(path)?,
        })
    }

    /// Number of recorded revisions.
    pub fn revision_count(&self) -> Result<u32> {
        let len = self.io.len()?;
        if len < DATA_START {
            return Ok(0);
        }
        Ok(((len - DATA_START) / ENTRY_STRIDE) as u32)
    }

    /// `(offset, timestamp)` recorded for `revision`.
    pub fn entry(&self, revision: Revision) -> Result<(u64, i64)> {
        if revision >= self.revision_count()? {
            return Err(RastroError::Invalid("revision not recorded"));
        }
        let mut buf = [0u8; ENTRY_STRIDE as usize];
        self.io
            .read_at(DATA_START + u64::from(revision) * ENTRY_STRIDE, &mut buf)?;
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[..8]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[8..]);
        Ok((u64::from_ne_bytes(offset), i64::from_ne_bytes(ts)))
    }

    /// Every recorded `(offset, timestamp)` pair, in revision order.
    pub fn all_entries(&self) -> Result<Vec<(u64, i64)>> {
        let count = self.revision_count()?;
        let mut entries = Vec::with_capacity(count as usize);
        for revision in 0..count {
            entries.push(self.entry(revision)?);
        }
        Ok(entries)
    }

    /// Records the entry for `revision` at its fixed stride.
    pub fn append(&self, revision: Revision, offset: u64, timestamp: i64) -> Result<()> {
        let mut buf = [0u8; ENTRY_STRIDE as usize];
        buf[..8].copy_from_slice(&offset.to_ne_bytes());
        buf[8..].copy_from_slice(&timestamp.to_ne_bytes());
        self.io
            .write_at(DATA_START + u64::from(revision) * ENTRY_STRIDE, &buf)
    }

    /// Mirrors a beacon slot (0 or 1) into the file's beacon region.
    pub fn write_beacon_mirror(&self, slot_index: u64, slot: &[u8]) -> Result<()> {
        debug_assert_eq!(slot.len() as u64, BEACON_SLOT);
        self.io.write_at(slot_index * BEACON_SLOT, slot)
    }

    /// Cuts the file so revisions `0..=revision` survive.
    pub fn truncate_to(&self, revision: Revision) -> Result<()> {
        self.io
            .truncate(DATA_START + u64::from(revision + 1) * ENTRY_STRIDE)
    }

    /// Removes every revision entry, keeping the beacon region.
    pub fn truncate_all(&self) -> Result<()> {
        self.io.truncate(DATA_START)
    }

    /// Forces the file to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn entries_roundtrip_at_fixed_stride() {
        let dir = tempdir().unwrap();
        let file = RevisionsFile::open(dir.path().join("revisions")).unwrap();
        assert_eq!(file.revision_count().unwrap(), 0);

        file.append(0, 1024, 1_000).unwrap();
        file.append(1, 4096, 2_500).unwrap();
        assert_eq!(file.revision_count().unwrap(), 2);
        assert_eq!(file.entry(0).unwrap(), (1024, 1_000));
        assert_eq!(file.entry(1).unwrap(), (4096, 2_500));
        assert_eq!(file.all_entries().unwrap(), vec![(1024, 1_000), (4096, 2_500)]);
        assert!(file.entry(2).is_err());
    }

    #[test]
    fn truncate_to_drops_later_revisions() {
        let dir = tempdir().unwrap();
        let file = RevisionsFile::open(dir.path().join("revisions")).unwrap();
        for revision in 0..5u32 {
            file.append(revision, u64::from(revision) * 100, i64::from(revision) * 10)
                .unwrap();
        }
        file.truncate_to(2).unwrap();
        assert_eq!(file.revision_count().unwrap(), 3);
        assert_eq!(file.entry(2).unwrap(), (200, 20));
        assert!(file.entry(3).is_err());
    }

    #[test]
    fn beacon_mirror_occupies_the_header_region() {
        let dir = tempdir().unwrap();
        let file = RevisionsFile::open(dir.path().join("revisions")).unwrap();
        file.write_beacon_mirror(0, &[1u8; BEACON_SLOT as usize])
            .unwrap();
        file.write_beacon_mirror(1, &[2u8; BEACON_SLOT as usize])
            .unwrap();
        // The mirror does not count as revision data.
        assert_eq!(file.revision_count().unwrap(), 0);
        file.append(0, 7, 8).unwrap();
        assert_eq!(file.entry(0).unwrap(), (7, 8));
    }
}
