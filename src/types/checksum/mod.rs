//! Content-addressing of serialized pages.
//!
//! The engine persists one hash per page reference. The stored hash length is
//! what identifies the algorithm on read, so the enumeration is closed: a new
//! algorithm needs a new, distinct length.

use crate::types::{RastroError, Result};
use xxhash_rust::xxh3::xxh3_64;

/// The checksum algorithms the engine can write and verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum HashKind {
    /// 64-bit XXH3. The default for all new resources.
    Xxh3,
    /// 32-bit CRC, selectable for resources that favor the smaller footprint.
    Crc32,
}

impl Default for HashKind {
    fn default() -> Self {
        HashKind::Xxh3
    }
}

impl HashKind {
    /// Number of bytes this algorithm persists. Doubles as the on-disk id.
    pub fn len(self) -> usize {
        match self {
            HashKind::Xxh3 => 8,
            HashKind::Crc32 => 4,
        }
    }

    /// True when the algorithm writes no bytes (never the case today).
    pub fn is_empty(self) -> bool {
        false
    }

    /// Resolves the algorithm from a persisted hash length.
    pub fn from_len(len: usize) -> Result<Self> {
        match len {
            8 => Ok(HashKind::Xxh3),
            4 => Ok(HashKind::Crc32),
            _ => Err(RastroError::CorruptHeader("unknown hash length")),
        }
    }

    /// Hashes a byte slice into the algorithm's native width, widened to u64.
    pub fn hash(self, bytes: &[u8]) -> u64 {
        match self {
            HashKind::Xxh3 => xxh3_64(bytes),
            HashKind::Crc32 => u64::from(crc32fast::hash(bytes)),
        }
    }

    /// Verifies a byte slice against an expected value.
    pub fn verify(self, bytes: &[u8], expected: u64) -> bool {
        self.hash(bytes) == expected
    }
}

/// A computed hash value together with the algorithm that produced it.
///
/// Hot-path comparisons are `u64` compares; the byte form exists only at the
/// serialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashValue {
    kind: HashKind,
    value: u64,
}

impl HashValue {
    /// Wraps a raw hash value.
    pub fn new(kind: HashKind, value: u64) -> Self {
        Self { kind, value }
    }

    /// Hashes `bytes` with `kind`.
    pub fn compute(kind: HashKind, bytes: &[u8]) -> Self {
        Self {
            kind,
            value: kind.hash(bytes),
        }
    }

    /// The producing algorithm.
    pub fn kind(self) -> HashKind {
        self.kind
    }

    /// The hash as a u64 (CRC32 occupies the low 32 bits).
    pub fn value(self) -> u64 {
        self.value
    }

    /// Big-endian byte form, `kind.len()` bytes long. No allocation beyond
    /// the fixed-size array.
    pub fn to_bytes(self) -> HashBytes {
        let mut out = HashBytes {
            buf: [0u8; 8],
            len: self.kind.len(),
        };
        match self.kind {
            HashKind::Xxh3 => out.buf.copy_from_slice(&self.value.to_be_bytes()),
            HashKind::Crc32 => out.buf[..4].copy_from_slice(&(self.value as u32).to_be_bytes()),
        }
        out
    }

    /// Decodes the byte form; the slice length selects the algorithm.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let kind = HashKind::from_len(bytes.len())?;
        let value = match kind {
            HashKind::Xxh3 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                u64::from_be_bytes(raw)
            }
            HashKind::Crc32 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                u64::from(u32::from_be_bytes(raw))
            }
        };
        Ok(Self { kind, value })
    }

    /// Verifies `bytes` against this value.
    pub fn verify(self, bytes: &[u8]) -> bool {
        self.kind.verify(bytes, self.value)
    }
}

/// Fixed-capacity big-endian byte form of a hash.
#[derive(Debug, Clone, Copy)]
pub struct HashBytes {
    buf: [u8; 8],
    len: usize,
}

impl std::ops::Deref for HashBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsRef<[u8]> for HashBytes {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_identifies_algorithm() {
        assert_eq!(HashKind::from_len(8).unwrap(), HashKind::Xxh3);
        assert_eq!(HashKind::from_len(4).unwrap(), HashKind::Crc32);
        assert!(HashKind::from_len(16).is_err());
        assert!(HashKind::from_len(0).is_err());
    }

    #[test]
    fn byte_form_roundtrip() {
        for kind in [HashKind::Xxh3, HashKind::Crc32] {
            let value = HashValue::compute(kind, b"some page bytes");
            let bytes = value.to_bytes();
            assert_eq!(bytes.len(), kind.len());
            let decoded = HashValue::from_bytes(&bytes).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn verify_detects_flipped_bit() {
        let payload = vec![7u8; 64];
        let value = HashValue::compute(HashKind::Xxh3, &payload);
        assert!(value.verify(&payload));
        let mut tampered = payload;
        tampered[9] ^= 1;
        assert!(!value.verify(&tampered));
    }

    #[test]
    fn crc32_matches_reference_impl() {
        let payload = b"rastro";
        let value = HashValue::compute(HashKind::Crc32, payload);
        assert_eq!(value.value(), u64::from(crc32fast::hash(payload)));
    }
}
