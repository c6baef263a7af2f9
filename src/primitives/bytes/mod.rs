#![forbid(unsafe_code)]
//! The byte pipe: an ordered list of byte transformers applied to serialized
//! page bytes on the way to disk and reversed on the way back.
//!
//! Two call shapes exist. The stream shape wraps `Read`/`Write` when no
//! contiguous source buffer is available. The segment shape operates on
//! contiguous memory regions and is used on every hot read path; a pipeline
//! supports segments iff all of its stages do, with the empty pipeline as the
//! identity. Decompressed segments borrow pooled buffers whose lifetime is
//! governed by [`DecompressionResult`].

use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{RastroError, Result};

/// Number of pooled buffers a stripe retains. Extra returns are dropped.
const STRIPE_RETAIN: usize = 8;

/// A single byte transformer.
///
/// Stages that support the segment shape must produce byte-identical output
/// in both shapes, so frames written through either path decode through
/// either path.
pub trait ByteStage: Send + Sync + 'static {
    /// Short stable name, used in configuration and logs.
    fn name(&self) -> &'static str;

    /// True when the stage can operate on contiguous segments.
    fn supports_segments(&self) -> bool {
        false
    }

    /// Compresses a contiguous segment, appending to `dst`.
    fn compress_segment(&self, _src: &[u8], _dst: &mut Vec<u8>) -> Result<()> {
        Err(RastroError::UnsupportedCompression(
            "stage does not support segment compression",
        ))
    }

    /// Decompresses a contiguous segment, appending to `dst`.
    fn decompress_segment(&self, _src: &[u8], _dst: &mut Vec<u8>) -> Result<()> {
        Err(RastroError::UnsupportedCompression(
            "stage does not support segment decompression",
        ))
    }

    /// Compresses a stream. The default buffers through the segment shape.
    fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<()> {
        let mut input = Vec::new();
        src.read_to_end(&mut input)?;
        let mut output = Vec::new();
        self.compress_segment(&input, &mut output)?;
        dst.write_all(&output)?;
        Ok(())
    }

    /// Decompresses a stream. The default buffers through the segment shape.
    fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<()> {
        let mut input = Vec::new();
        src.read_to_end(&mut input)?;
        let mut output = Vec::new();
        self.decompress_segment(&input, &mut output)?;
        dst.write_all(&output)?;
        Ok(())
    }
}

/// Snappy stage over the raw block format.
#[derive(Default)]
pub struct SnappyStage;

impl ByteStage for SnappyStage {
    fn name(&self) -> &'static str {
        "snappy"
    }

    fn supports_segments(&self) -> bool {
        true
    }

    fn compress_segment(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        let mut encoder = snap::raw::Encoder::new();
        let compressed = encoder
            .compress_vec(src)
            .map_err(|_| RastroError::UnsupportedCompression("snappy compression failed"))?;
        dst.extend_from_slice(&compressed);
        Ok(())
    }

    fn decompress_segment(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        let len = snap::raw::decompress_len(src)
            .map_err(|_| RastroError::CorruptHeader("snappy length header invalid"))?;
        let start = dst.len();
        dst.resize(start + len, 0);
        let mut decoder = snap::raw::Decoder::new();
        let written = decoder
            .decompress(src, &mut dst[start..])
            .map_err(|_| RastroError::CorruptHeader("snappy payload invalid"))?;
        dst.truncate(start + written);
        Ok(())
    }
}

/// The ordered list of stages configured for a resource.
///
/// An empty pipe is the identity transform.
pub struct BytePipe {
    stages: Vec<Arc<dyn ByteStage>>,
}

impl BytePipe {
    /// Builds a pipe from the given stages, applied in order on compression.
    pub fn new(stages: Vec<Arc<dyn ByteStage>>) -> Self {
        Self { stages }
    }

    /// The identity pipe.
    pub fn identity() -> Self {
        Self { stages: Vec::new() }
    }

    /// True when every stage supports the segment shape (vacuously true when
    /// empty).
    pub fn supports_segments(&self) -> bool {
        self.stages.iter().all(|s| s.supports_segments())
    }

    /// Names of the configured stages in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Compresses a segment through every stage in order.
    pub fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        if self.stages.is_empty() {
            return Ok(src.to_vec());
        }
        if !self.supports_segments() {
            return self.compress_via_streams(src);
        }
        let mut current = Vec::new();
        let mut input: &[u8] = src;
        let mut scratch = Vec::new();
        for (i, stage) in self.stages.iter().enumerate() {
            current.clear();
            stage.compress_segment(input, &mut current)?;
            if i + 1 < self.stages.len() {
                std::mem::swap(&mut current, &mut scratch);
                input = &scratch;
            }
        }
        Ok(current)
    }

    /// Decompresses a segment through every stage in reverse order.
    pub fn decompress(&self, src: &[u8]) -> Result<Vec<u8>> {
        if self.stages.is_empty() {
            return Ok(src.to_vec());
        }
        if !self.supports_segments() {
            return self.decompress_via_streams(src);
        }
        let mut current = Vec::new();
        let mut input: &[u8] = src;
        let mut scratch = Vec::new();
        for (i, stage) in self.stages.iter().rev().enumerate() {
            current.clear();
            stage.decompress_segment(input, &mut current)?;
            if i + 1 < self.stages.len() {
                std::mem::swap(&mut current, &mut scratch);
                input = &scratch;
            }
        }
        Ok(current)
    }

    /// Zero-copy-oriented decompression into a pooled buffer.
    ///
    /// The caller either consumes the returned segment and lets the result
    /// drop (returning the buffer to its stripe) or claims the buffer through
    /// [`DecompressionResult::transfer_ownership`]; the transfer is
    /// single-shot and the subsequent drop is a no-op.
    pub fn decompress_scoped(
        &self,
        src: &[u8],
        pool: &Arc<BufferPool>,
    ) -> Result<DecompressionResult> {
        if !self.supports_segments() {
            return Err(RastroError::UnsupportedCompression(
                "pipeline has a stream-only stage",
            ));
        }
        let (stripe, mut buf) = pool.acquire();
        buf.clear();
        if self.stages.is_empty() {
            buf.extend_from_slice(src);
        } else if self.stages.len() == 1 {
            self.stages[0].decompress_segment(src, &mut buf)?;
        } else {
            // Intermediate hops go through scratch vectors; only the last
            // stage lands in the pooled buffer.
            let mut intermediate = src.to_vec();
            for stage in self.stages.iter().rev().take(self.stages.len() - 1) {
                let mut next = Vec::new();
                stage.decompress_segment(&intermediate, &mut next)?;
                intermediate = next;
            }
            self.stages[0].decompress_segment(&intermediate, &mut buf)?;
        }
        let len = buf.len();
        trace!(stripe, len, "bytepipe.decompress_scoped");
        Ok(DecompressionResult {
            inner: Some(PooledBuf {
                buf,
                len,
                stripe,
                pool: Arc::clone(pool),
            }),
        })
    }

    /// Compresses through the stream shape of every stage.
    pub fn compress_via_streams(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut current = src.to_vec();
        for stage in &self.stages {
            let mut out = Vec::new();
            let mut reader: &[u8] = &current;
            stage.compress_stream(&mut reader, &mut out)?;
            current = out;
        }
        Ok(current)
    }

    /// Decompresses through the stream shape of every stage, reversed.
    pub fn decompress_via_streams(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut current = src.to_vec();
        for stage in self.stages.iter().rev() {
            let mut out = Vec::new();
            let mut reader: &[u8] = &current;
            stage.decompress_stream(&mut reader, &mut out)?;
            current = out;
        }
        Ok(current)
    }
}

impl std::fmt::Debug for BytePipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytePipe")
            .field("stages", &self.stage_names())
            .finish()
    }
}

struct PooledBuf {
    buf: Vec<u8>,
    len: usize,
    stripe: usize,
    pool: Arc<BufferPool>,
}

/// A decompressed segment backed by a pooled buffer.
///
/// Dropping the result returns the buffer to its stripe. Claiming the buffer
/// through [`Self::transfer_ownership`] detaches it from the pool; ownership
/// moves exactly once, so a double release cannot occur.
pub struct DecompressionResult {
    inner: Option<PooledBuf>,
}

impl std::fmt::Debug for DecompressionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecompressionResult")
            .field("len", &self.inner.as_ref().map(|p| p.len))
            .finish()
    }
}

impl DecompressionResult {
    /// The decompressed bytes.
    pub fn segment(&self) -> &[u8] {
        match &self.inner {
            Some(p) => &p.buf[..p.len],
            None => &[],
        }
    }

    /// Detaches the backing buffer from the pool and hands it to the caller,
    /// typically a record-leaf page that wants the bytes as slot memory.
    pub fn transfer_ownership(mut self) -> OwnedSegment {
        let p = self.inner.take().expect("segment already transferred");
        OwnedSegment {
            buf: p.buf,
            len: p.len,
        }
    }
}

impl Drop for DecompressionResult {
    fn drop(&mut self) {
        if let Some(p) = self.inner.take() {
            p.pool.release(p.stripe, p.buf);
        }
    }
}

/// A decompressed segment whose backing buffer left the pool.
#[derive(Debug, Clone)]
pub struct OwnedSegment {
    buf: Vec<u8>,
    len: usize,
}

impl OwnedSegment {
    /// The decompressed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Consumes the segment, yielding the backing vector truncated to the
    /// payload length.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.truncate(self.len);
        self.buf
    }
}

/// Bounded, striped pool of decompression buffers.
///
/// Stripe count scales with CPU parallelism so memory scales with cores, not
/// with the number of concurrent tasks. Returns are LIFO within a stripe.
pub struct BufferPool {
    stripes: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    /// Creates a pool with two stripes per available CPU.
    pub fn new() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_stripes(cpus * 2)
    }

    /// Creates a pool with an explicit stripe count (minimum one).
    pub fn with_stripes(count: usize) -> Self {
        let count = count.max(1);
        let stripes = (0..count).map(|_| Mutex::new(Vec::new())).collect();
        Self { stripes }
    }

    /// Pops the most recently returned buffer from the caller's stripe, or
    /// allocates a fresh one when the stripe is empty.
    pub fn acquire(&self) -> (usize, Vec<u8>) {
        let stripe = self.stripe_for_thread();
        let mut slot = self.stripes[stripe].lock();
        let buf = slot.pop().unwrap_or_default();
        (stripe, buf)
    }

    /// Returns a buffer to its stripe, LIFO. Buffers beyond the retention cap
    /// are dropped.
    pub fn release(&self, stripe: usize, buf: Vec<u8>) {
        let mut slot = self.stripes[stripe].lock();
        if slot.len() < STRIPE_RETAIN {
            slot.push(buf);
        }
    }

    /// Number of stripes.
    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    fn stripe_for_thread(&self) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = rustc_hash::FxHasher::default();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snappy_pipe() -> BytePipe {
        BytePipe::new(vec![Arc::new(SnappyStage)])
    }

    #[test]
    fn identity_pipe_is_identity() {
        let pipe = BytePipe::identity();
        assert!(pipe.supports_segments());
        let payload = b"unchanged".to_vec();
        assert_eq!(pipe.compress(&payload).unwrap(), payload);
        assert_eq!(pipe.decompress(&payload).unwrap(), payload);
    }

    #[test]
    fn snappy_roundtrip_segment_shape() {
        let pipe = snappy_pipe();
        let payload = vec![42u8; 4096];
        let compressed = pipe.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(pipe.decompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn stream_and_segment_shapes_agree() {
        let pipe = snappy_pipe();
        let payload: Vec<u8> = (0..1024u32).flat_map(|v| v.to_le_bytes()).collect();
        let via_segment = pipe.compress(&payload).unwrap();
        let via_stream = pipe.compress_via_streams(&payload).unwrap();
        assert_eq!(via_segment, via_stream);
        assert_eq!(pipe.decompress_via_streams(&via_segment).unwrap(), payload);
    }

    #[test]
    fn scoped_decompression_returns_buffer_to_stripe() {
        let pipe = snappy_pipe();
        let pool = Arc::new(BufferPool::with_stripes(1));
        let payload = vec![7u8; 512];
        let compressed = pipe.compress(&payload).unwrap();

        {
            let result = pipe.decompress_scoped(&compressed, &pool).unwrap();
            assert_eq!(result.segment(), &payload[..]);
        }
        // The buffer went back to the single stripe and is reused.
        let (stripe, buf) = pool.acquire();
        assert_eq!(stripe, 0);
        assert!(buf.capacity() >= payload.len());
    }

    #[test]
    fn ownership_transfer_detaches_from_pool() {
        let pipe = snappy_pipe();
        let pool = Arc::new(BufferPool::with_stripes(1));
        let payload = vec![9u8; 256];
        let compressed = pipe.compress(&payload).unwrap();

        let result = pipe.decompress_scoped(&compressed, &pool).unwrap();
        let owned = result.transfer_ownership();
        assert_eq!(owned.as_slice(), &payload[..]);

        // The pool never saw the buffer come back.
        let (_, buf) = pool.acquire();
        assert_eq!(buf.capacity(), 0);
    }

    #[test]
    fn stream_only_stage_rejects_segment_shape() {
        struct StreamOnly;
        impl ByteStage for StreamOnly {
            fn name(&self) -> &'static str {
                "stream-only"
            }
            fn compress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<()> {
                std::io::copy(src, dst)?;
                Ok(())
            }
            fn decompress_stream(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<()> {
                std::io::copy(src, dst)?;
                Ok(())
            }
        }
        let pipe = BytePipe::new(vec![Arc::new(StreamOnly)]);
        assert!(!pipe.supports_segments());
        let pool = Arc::new(BufferPool::with_stripes(1));
        let err = pipe.decompress_scoped(b"abc", &pool).unwrap_err();
        assert!(matches!(err, RastroError::UnsupportedCompression(_)));
        // The stream shape still works.
        assert_eq!(pipe.compress(b"abc").unwrap(), b"abc".to_vec());
    }

    #[test]
    fn pool_release_is_lifo() {
        let pool = BufferPool::with_stripes(1);
        let mut a = Vec::with_capacity(10);
        a.push(1u8);
        let mut b = Vec::with_capacity(20);
        b.push(2u8);
        pool.release(0, a);
        pool.release(0, b);
        let (_, first) = pool.acquire();
        assert_eq!(first.capacity(), 20);
        let (_, second) = pool.acquire();
        assert_eq!(second.capacity(), 10);
    }

    proptest! {
        #[test]
        fn snappy_roundtrip_prop(payload in proptest::collection::vec(any::<u8>(), 1..4096)) {
            let pipe = snappy_pipe();
            let compressed = pipe.compress(&payload).unwrap();
            prop_assert_eq!(pipe.decompress(&compressed).unwrap(), payload);
        }
    }
}
