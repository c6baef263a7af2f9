#![allow(unsafe_code)]
//! The memory-mapped backend.
//!
//! Readers share one read mapping that is remapped under a lock whenever the
//! data file grows past it. Writes go through the file channel and
//! invalidate the mapping, so the next read observes the grown file; the
//! mapping itself is never aliased mutably.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::trace;

use crate::io::file::FileWriter;
use crate::io::revfile::RevisionsFile;
use crate::io::{
    read_page_at, recover_uber_page, IoSettings, Reader, StorageBackend, Writer, DATA_FILE,
    REVISIONS_FILE,
};
use crate::page::{Page, PageKind, UberPage};
use crate::primitives::bytes::{BufferPool, BytePipe};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::HashValue;
use crate::types::{RastroError, Result, Revision};

/// A shared read mapping over the data file, remapped on growth.
pub struct MmapSource {
    io: StdFileIo,
    map: RwLock<Option<Mmap>>,
}

impl MmapSource {
    fn open(path: &Path) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        let source = Self {
            io,
            map: RwLock::new(None),
        };
        source.remap()?;
        Ok(source)
    }

    /// Drops the current mapping; the next read remaps over the grown file.
    fn invalidate(&self) {
        *self.map.write() = None;
    }

    fn remap(&self) -> Result<()> {
        let mut guard = self.map.write();
        let len = self.io.len()?;
        *guard = if len == 0 {
            None
        } else {
            Some(
                unsafe { Mmap::map(self.io.file()) }
                    .map_err(RastroError::from)?,
            )
        };
        trace!(len, "mmap.remap");
        Ok(())
    }

    fn try_read_mapped(&self, off: u64, dst: &mut [u8]) -> Result<bool> {
        let guard = self.map.read();
        let Some(map) = guard.as_ref() else {
            return Ok(false);
        };
        let start = off as usize;
        let end = start + dst.len();
        if end > map.len() {
            return Ok(false);
        }
        dst.copy_from_slice(&map[start..end]);
        Ok(true)
    }
}

impl FileIo for MmapSource {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        if self.try_read_mapped(off, dst)? {
            return Ok(());
        }
        // The mapping is stale or absent; remap over the current file length
        // and retry once before reporting EOF.
        self.remap()?;
        if self.try_read_mapped(off, dst)? {
            return Ok(());
        }
        Err(RastroError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "read past the mapped file length",
        )))
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.io.write_at(off, src)?;
        self.invalidate();
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn len(&self) -> Result<u64> {
        self.io.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.io.truncate(len)?;
        self.invalidate();
        Ok(())
    }
}

/// Storage backend over a shared read mapping.
pub struct MmapBackend {
    data_path: PathBuf,
    revisions_path: PathBuf,
    source: Arc<MmapSource>,
    pipe: Arc<BytePipe>,
    pool: Arc<BufferPool>,
    settings: IoSettings,
}

impl MmapBackend {
    /// Binds the backend to a resource directory.
    pub fn open(dir: &Path, pipe: Arc<BytePipe>, settings: IoSettings) -> Result<Self> {
        let data_path = dir.join(DATA_FILE);
        Ok(Self {
            source: Arc::new(MmapSource::open(&data_path)?),
            data_path,
            revisions_path: dir.join(REVISIONS_FILE),
            pipe,
            pool: Arc::new(BufferPool::new()),
            settings,
        })
    }
}

impl StorageBackend for MmapBackend {
    fn create_reader(&self) -> Result<Box<dyn Reader>> {
        Ok(Box::new(MmapReader {
            source: Arc::clone(&self.source),
            revfile: RevisionsFile::open(&self.revisions_path)?,
            pipe: Arc::clone(&self.pipe),
            pool: Arc::clone(&self.pool),
            settings: self.settings,
        }))
    }

    fn create_writer(&self) -> Result<Box<dyn Writer>> {
        Ok(Box::new(MmapWriter {
            inner: FileWriter::open(
                StdFileIo::open(&self.data_path)?,
                RevisionsFile::open(&self.revisions_path)?,
                Arc::clone(&self.pipe),
                self.settings,
            )?,
            source: Arc::clone(&self.source),
        }))
    }

    fn uber_page_reference(&self) -> Result<Option<UberPage>> {
        recover_uber_page(&*self.source, &self.pipe, self.settings)
    }

    fn byte_handler(&self) -> Arc<BytePipe> {
        Arc::clone(&self.pipe)
    }

    fn name(&self) -> &'static str {
        "memory-mapped"
    }
}

/// Read side of the mmap backend.
pub struct MmapReader {
    source: Arc<MmapSource>,
    revfile: RevisionsFile,
    pipe: Arc<BytePipe>,
    pool: Arc<BufferPool>,
    settings: IoSettings,
}

impl Reader for MmapReader {
    fn read(&self, offset: u64, expected: Option<HashValue>) -> Result<Page> {
        read_page_at(
            &*self.source,
            offset,
            expected,
            &self.pipe,
            &self.pool,
            self.settings,
        )
    }

    fn read_revision_root(&self, revision: Revision) -> Result<Page> {
        let (offset, _) = self.revfile.entry(revision)?;
        let page = self.read(offset, None)?;
        if page.kind() != PageKind::RevisionRoot {
            return Err(RastroError::CorruptHeader(
                "revision entry does not point at a revision root",
            ));
        }
        Ok(page)
    }

    fn revision_file_data(&self, revision: Revision) -> Result<(u64, i64)> {
        self.revfile.entry(revision)
    }

    fn revision_count(&self) -> Result<u32> {
        self.revfile.revision_count()
    }

    fn frame_end_offset(&self, offset: u64) -> Result<u64> {
        let mut prefix = [0u8; crate::io::FRAME_PREFIX as usize];
        crate::primitives::io::read_frame_exact(&*self.source, offset, &mut prefix)?;
        Ok(offset + crate::io::FRAME_PREFIX + u64::from(u32::from_be_bytes(prefix)))
    }

    fn byte_handler(&self) -> &BytePipe {
        &self.pipe
    }
}

/// Write side of the mmap backend: the file writer plus mapping
/// invalidation, with a forced sync before truncation and on drop.
pub struct MmapWriter {
    inner: FileWriter,
    source: Arc<MmapSource>,
}

impl Writer for MmapWriter {
    fn write_page(&mut self, page: &mut Page) -> Result<(u64, HashValue)> {
        let result = self.inner.write_page(page)?;
        self.source.invalidate();
        Ok(result)
    }

    fn append_revision_entry(
        &mut self,
        revision: Revision,
        offset: u64,
        timestamp: i64,
    ) -> Result<()> {
        self.inner.append_revision_entry(revision, offset, timestamp)
    }

    fn write_uber_beacons(&mut self, uber: &mut UberPage) -> Result<()> {
        self.inner.write_uber_beacons(uber)?;
        self.source.invalidate();
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn truncate_to(&mut self, revision: Revision, data_len: u64) -> Result<()> {
        self.inner.sync()?;
        self.inner.truncate_to(revision, data_len)?;
        self.source.invalidate();
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.inner.truncate()?;
        self.source.invalidate();
        Ok(())
    }

    fn data_len(&self) -> u64 {
        self.inner.data_len()
    }
}

impl Drop for MmapWriter {
    fn drop(&mut self) {
        let _ = self.inner.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::IndirectPage;
    use crate::primitives::bytes::SnappyStage;
    use crate::types::checksum::HashKind;
    use tempfile::tempdir;

    fn settings() -> IoSettings {
        IoSettings {
            database_id: 1,
            resource_id: 2,
            hash_kind: HashKind::Xxh3,
            use_fsst: false,
        }
    }

    #[test]
    fn reader_observes_growth_through_remap() {
        let dir = tempdir().unwrap();
        let backend = MmapBackend::open(
            dir.path(),
            Arc::new(BytePipe::new(vec![Arc::new(SnappyStage)])),
            settings(),
        )
        .unwrap();

        let mut writer = backend.create_writer().unwrap();
        let reader = backend.create_reader().unwrap();

        let mut first = Page::Indirect(IndirectPage::empty());
        let (first_offset, first_hash) = writer.write_page(&mut first).unwrap();
        writer.sync().unwrap();
        assert!(reader.read(first_offset, Some(first_hash)).is_ok());

        // Grow the file after the mapping was established.
        let mut second = Page::Indirect(IndirectPage::empty());
        let (second_offset, second_hash) = writer.write_page(&mut second).unwrap();
        writer.sync().unwrap();
        assert!(reader.read(second_offset, Some(second_hash)).is_ok());
    }

    #[test]
    fn beacons_roundtrip_under_mmap() {
        let dir = tempdir().unwrap();
        let backend = MmapBackend::open(
            dir.path(),
            Arc::new(BytePipe::identity()),
            settings(),
        )
        .unwrap();
        assert!(backend.uber_page_reference().unwrap().is_none());
        let mut writer = backend.create_writer().unwrap();
        let mut uber = UberPage::bootstrap();
        uber.record_commit();
        uber.record_commit();
        writer.write_uber_beacons(&mut uber).unwrap();
        drop(writer);
        let recovered = backend.uber_page_reference().unwrap().unwrap();
        assert_eq!(recovered.revision_count(), 2);
    }
}
