//! The file-channel backend: positional reads and buffered-then-positional
//! appends over plain file handles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use crate::io::revfile::RevisionsFile;
use crate::io::{
    align_up, encode_beacon, frame_end, read_page_at, recover_uber_page, IoSettings, Reader,
    StorageBackend, Writer, DATA_START, FRAME_PREFIX,
};
use crate::page::persist::serialize_page;
use crate::page::{Page, PageKind, UberPage};
use crate::primitives::bytes::{BufferPool, BytePipe};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::checksum::HashValue;
use crate::types::{RastroError, Result, Revision};

/// File name of the page data file inside a resource directory.
pub const DATA_FILE: &str = "data";
/// File name of the revisions-offset file inside a resource directory.
pub const REVISIONS_FILE: &str = "revisions";

/// Storage backend over positional file I/O.
pub struct FileBackend {
    data_path: PathBuf,
    revisions_path: PathBuf,
    pipe: Arc<BytePipe>,
    pool: Arc<BufferPool>,
    settings: IoSettings,
}

impl FileBackend {
    /// Binds the backend to a resource directory.
    pub fn open(dir: &Path, pipe: Arc<BytePipe>, settings: IoSettings) -> Result<Self> {
        Ok(Self {
            data_path: dir.join(DATA_FILE),
            revisions_path: dir.join(REVISIONS_FILE),
            pipe,
            pool: Arc::new(BufferPool::new()),
            settings,
        })
    }
}

impl StorageBackend for FileBackend {
    fn create_reader(&self) -> Result<Box<dyn Reader>> {
        Ok(Box::new(FileReader {
            io: StdFileIo::open(&self.data_path)?,
            revfile: RevisionsFile::open(&self.revisions_path)?,
            pipe: Arc::clone(&self.pipe),
            pool: Arc::clone(&self.pool),
            settings: self.settings,
        }))
    }

    fn create_writer(&self) -> Result<Box<dyn Writer>> {
        Ok(Box::new(FileWriter::open(
            StdFileIo::open(&self.data_path)?,
            RevisionsFile::open(&self.revisions_path)?,
            Arc::clone(&self.pipe),
            self.settings,
        )?))
    }

    fn uber_page_reference(&self) -> Result<Option<UberPage>> {
        let io = StdFileIo::open(&self.data_path)?;
        recover_uber_page(&io, &self.pipe, self.settings)
    }

    fn byte_handler(&self) -> Arc<BytePipe> {
        Arc::clone(&self.pipe)
    }

    fn name(&self) -> &'static str {
        "file-channel"
    }
}

/// Read side of the file backend.
pub struct FileReader {
    io: StdFileIo,
    revfile: RevisionsFile,
    pipe: Arc<BytePipe>,
    pool: Arc<BufferPool>,
    settings: IoSettings,
}

impl Reader for FileReader {
    fn read(&self, offset: u64, expected: Option<HashValue>) -> Result<Page> {
        read_page_at(
            &self.io,
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
        let mut prefix = [0u8; FRAME_PREFIX as usize];
        crate::primitives::io::read_frame_exact(&self.io, offset, &mut prefix)?;
        Ok(offset + FRAME_PREFIX + u64::from(u32::from_be_bytes(prefix)))
    }

    fn byte_handler(&self) -> &BytePipe {
        &self.pipe
    }
}

/// Write side of the file backend. The frame is assembled in a reusable
/// scratch buffer, then placed with one positional write.
pub struct FileWriter {
    io: StdFileIo,
    revfile: RevisionsFile,
    pipe: Arc<BytePipe>,
    settings: IoSettings,
    append_offset: u64,
    scratch: Vec<u8>,
    frame: Vec<u8>,
}

impl FileWriter {
    pub(crate) fn open(
        io: StdFileIo,
        revfile: RevisionsFile,
        pipe: Arc<BytePipe>,
        settings: IoSettings,
    ) -> Result<Self> {
        let len = io.len()?;
        let append_offset = align_up(len.max(DATA_START), 8);
        Ok(Self {
            io,
            revfile,
            pipe,
            settings,
            append_offset,
            scratch: Vec::new(),
            frame: Vec::new(),
        })
    }

    /// Serializes and compresses `page`, returning the hash the parent
    /// reference stores: over the canonical bytes for leaves, over the
    /// compressed bytes for every other kind.
    fn prepare_frame(&mut self, page: &mut Page) -> Result<HashValue> {
        serialize_page(page, self.settings.use_fsst, &mut self.scratch);
        let leaf_hash = if page.kind() == PageKind::KeyValueLeaf {
            Some(HashValue::compute(self.settings.hash_kind, &self.scratch))
        } else {
            None
        };
        let compressed = self.pipe.compress(&self.scratch)?;
        self.frame.clear();
        self.frame
            .extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        self.frame.extend_from_slice(&compressed);
        Ok(match leaf_hash {
            Some(hash) => hash,
            None => HashValue::compute(self.settings.hash_kind, &compressed),
        })
    }
}

impl Writer for FileWriter {
    fn write_page(&mut self, page: &mut Page) -> Result<(u64, HashValue)> {
        let kind = page.kind();
        let hash = self.prepare_frame(page)?;
        let start = align_up(self.append_offset, kind.alignment());
        self.io.write_at(start, &self.frame)?;
        let payload_len = self.frame.len() as u64 - FRAME_PREFIX;
        self.append_offset = frame_end(kind, start, payload_len);
        trace!(
            offset = start,
            len = payload_len,
            kind = ?kind,
            "io.write_page"
        );
        Ok((start, hash))
    }

    fn append_revision_entry(
        &mut self,
        revision: Revision,
        offset: u64,
        timestamp: i64,
    ) -> Result<()> {
        self.revfile.append(revision, offset, timestamp)
    }

    fn write_uber_beacons(&mut self, uber: &mut UberPage) -> Result<()> {
        let mut page = Page::Uber(uber.clone());
        serialize_page(&mut page, false, &mut self.scratch);
        let compressed = self.pipe.compress(&self.scratch)?;
        let slot = encode_beacon(&compressed)?;
        for (index, offset) in [(0u64, super::BEACON_PRIMARY), (1, super::BEACON_SECONDARY)] {
            self.io.write_at(offset, &slot)?;
            self.revfile.write_beacon_mirror(index, &slot)?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.io.sync_all()?;
        self.revfile.sync()
    }

    fn truncate_to(&mut self, revision: Revision, data_len: u64) -> Result<()> {
        self.io.truncate(data_len)?;
        self.revfile.truncate_to(revision)?;
        self.append_offset = align_up(data_len, 8);
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.io.truncate(DATA_START)?;
        self.revfile.truncate_all()?;
        self.append_offset = DATA_START;
        Ok(())
    }

    fn data_len(&self) -> u64 {
        self.append_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::IndirectPage;
    use crate::types::checksum::HashKind;
    use crate::types::IndexKind;
    use tempfile::tempdir;

    fn settings() -> IoSettings {
        IoSettings {
            database_id: 1,
            resource_id: 2,
            hash_kind: HashKind::Xxh3,
            use_fsst: false,
        }
    }

    fn backend(dir: &Path) -> FileBackend {
        FileBackend::open(
            dir,
            Arc::new(BytePipe::new(vec![Arc::new(
                crate::primitives::bytes::SnappyStage,
            )])),
            settings(),
        )
        .unwrap()
    }

    #[test]
    fn write_read_roundtrip_with_verification() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());
        let mut writer = backend.create_writer().unwrap();

        let mut indirect = IndirectPage::empty();
        indirect.reference_or_link(7);
        let mut page = Page::Indirect(indirect);
        let (offset, hash) = writer.write_page(&mut page).unwrap();
        assert!(offset >= DATA_START);
        assert_eq!(offset % 8, 0);
        writer.sync().unwrap();

        let reader = backend.create_reader().unwrap();
        let read = reader.read(offset, Some(hash)).unwrap();
        let indirect = read.as_indirect().unwrap();
        assert_eq!(indirect.linked_count(), 1);
    }

    #[test]
    fn leaf_hash_covers_canonical_bytes() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());
        let mut writer = backend.create_writer().unwrap();

        let mut leaf =
            crate::page::KeyValueLeafPage::empty(0, IndexKind::Document, 0, 1, false);
        leaf.set_slot(3, vec![1, 2, 3, 4]);
        let mut page = Page::Leaf(leaf);
        let (offset, hash) = writer.write_page(&mut page).unwrap();
        writer.sync().unwrap();

        let reader = backend.create_reader().unwrap();
        let read = reader.read(offset, Some(hash)).unwrap();
        assert_eq!(read.as_leaf().unwrap().slot(3), Some(&[1, 2, 3, 4][..]));

        // A wrong expected hash surfaces as a checksum mismatch.
        let bogus = HashValue::new(HashKind::Xxh3, hash.value() ^ 1);
        let err = reader.read(offset, Some(bogus)).unwrap_err();
        assert!(matches!(err, RastroError::ChecksumMismatch { .. }));
    }

    #[test]
    fn revision_root_alignment_and_fast_path() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());
        let mut writer = backend.create_writer().unwrap();

        // Push the append offset off the 256 boundary first.
        let mut filler = Page::Indirect(IndirectPage::empty());
        writer.write_page(&mut filler).unwrap();

        let mut root = Page::RevisionRoot(crate::page::RevisionRootPage::bootstrap());
        let (offset, _) = writer.write_page(&mut root).unwrap();
        assert_eq!(offset % 256, 0);
        writer.append_revision_entry(0, offset, 777).unwrap();
        writer.sync().unwrap();

        let reader = backend.create_reader().unwrap();
        assert_eq!(reader.revision_count().unwrap(), 1);
        assert_eq!(reader.revision_file_data(0).unwrap(), (offset, 777));
        let root = reader.read_revision_root(0).unwrap();
        assert_eq!(root.kind(), PageKind::RevisionRoot);
    }

    #[test]
    fn beacons_recover_the_latest_uber() {
        let dir = tempdir().unwrap();
        let backend = backend(dir.path());
        assert!(backend.uber_page_reference().unwrap().is_none());

        let mut writer = backend.create_writer().unwrap();
        let mut uber = UberPage::bootstrap();
        uber.record_commit();
        writer.write_uber_beacons(&mut uber).unwrap();
        writer.sync().unwrap();

        let recovered = backend.uber_page_reference().unwrap().unwrap();
        assert_eq!(recovered.revision_count(), 1);
    }
}
