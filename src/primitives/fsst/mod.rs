#![forbid(unsafe_code)]
//! Per-page static symbol tables for string-heavy record slots.
//!
//! A table maps up to 255 one-byte codes to symbols of two to eight bytes,
//! learned from the slot bytes of a single leaf page. Encoded output replaces
//! symbol occurrences with their code and escapes every other byte, so pages
//! whose strings share structure shrink while the codec stays byte-exact.
//! Code 255 is the escape marker and is never assigned to a symbol.

use rustc_hash::FxHashMap;

use crate::types::{RastroError, Result};

const ESCAPE: u8 = 0xFF;
const MAX_SYMBOLS: usize = 255;
const MIN_SYMBOL_LEN: usize = 2;
const MAX_SYMBOL_LEN: usize = 8;
/// A candidate must be seen at least this often to earn a code.
const MIN_OCCURRENCES: usize = 4;

/// A trained symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: Vec<Vec<u8>>,
}

impl SymbolTable {
    /// Trains a table over sample slices by counting 2..=8 byte substrings
    /// and keeping the candidates with the highest saved-bytes score.
    ///
    /// Training is deterministic: candidates are ranked by score, then by
    /// content, so the same samples always produce the same table.
    pub fn train<'a, I>(samples: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut counts: FxHashMap<&[u8], usize> = FxHashMap::default();
        for sample in samples {
            for len in MIN_SYMBOL_LEN..=MAX_SYMBOL_LEN {
                if sample.len() < len {
                    continue;
                }
                for window in sample.windows(len) {
                    *counts.entry(window).or_insert(0) += 1;
                }
            }
        }
        let mut ranked: Vec<(&[u8], usize)> = counts
            .into_iter()
            .filter(|(sym, count)| {
                *count >= MIN_OCCURRENCES && saved_bytes(sym.len(), *count) > 0
            })
            .collect();
        ranked.sort_by(|a, b| {
            saved_bytes(b.0.len(), b.1)
                .cmp(&saved_bytes(a.0.len(), a.1))
                .then_with(|| a.0.cmp(b.0))
        });
        let mut symbols: Vec<Vec<u8>> = Vec::new();
        for (candidate, _) in ranked {
            if symbols.len() == MAX_SYMBOLS {
                break;
            }
            // Skip candidates contained in an already chosen symbol; they
            // mostly double-count the same savings.
            if symbols
                .iter()
                .any(|s| contains_subslice(s, candidate) || contains_subslice(candidate, s))
            {
                continue;
            }
            symbols.push(candidate.to_vec());
        }
        Self { symbols }
    }

    /// An empty table; encoding with it only escapes.
    pub fn empty() -> Self {
        Self {
            symbols: Vec::new(),
        }
    }

    /// True when the table assigns no symbols.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Number of assigned symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Encodes `src` with longest-match substitution. Bytes not covered by a
    /// symbol are escaped, so the output never aliases a code.
    pub fn encode(&self, src: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(src.len());
        let mut i = 0;
        while i < src.len() {
            let mut matched = None;
            for (code, symbol) in self.symbols.iter().enumerate() {
                if src[i..].starts_with(symbol)
                    && matched
                        .map(|(_, len)| symbol.len() > len)
                        .unwrap_or(true)
                {
                    matched = Some((code as u8, symbol.len()));
                }
            }
            match matched {
                Some((code, len)) => {
                    out.push(code);
                    i += len;
                }
                None => {
                    out.push(ESCAPE);
                    out.push(src[i]);
                    i += 1;
                }
            }
        }
        out
    }

    /// Decodes an encoded slice.
    pub fn decode(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(src.len());
        let mut i = 0;
        while i < src.len() {
            let byte = src[i];
            if byte == ESCAPE {
                let literal = src
                    .get(i + 1)
                    .ok_or(RastroError::CorruptHeader("symbol escape truncated"))?;
                out.push(*literal);
                i += 2;
            } else {
                let symbol = self
                    .symbols
                    .get(byte as usize)
                    .ok_or(RastroError::CorruptHeader("symbol code out of table"))?;
                out.extend_from_slice(symbol);
                i += 1;
            }
        }
        Ok(out)
    }

    /// Serializes the table: symbol count, then per symbol a length byte and
    /// the symbol bytes.
    pub fn serialize(&self, dst: &mut Vec<u8>) {
        dst.push(self.symbols.len() as u8);
        for symbol in &self.symbols {
            dst.push(symbol.len() as u8);
            dst.extend_from_slice(symbol);
        }
    }

    /// Deserializes a table, advancing `off`.
    pub fn deserialize(src: &[u8], off: &mut usize) -> Result<Self> {
        let count = *src
            .get(*off)
            .ok_or(RastroError::CorruptHeader("symbol table truncated"))? as usize;
        *off += 1;
        if count > MAX_SYMBOLS {
            return Err(RastroError::CorruptHeader("symbol table too large"));
        }
        let mut symbols = Vec::with_capacity(count);
        for _ in 0..count {
            let len = *src
                .get(*off)
                .ok_or(RastroError::CorruptHeader("symbol table truncated"))?
                as usize;
            *off += 1;
            if !(MIN_SYMBOL_LEN..=MAX_SYMBOL_LEN).contains(&len) {
                return Err(RastroError::CorruptHeader("symbol length out of range"));
            }
            let end = *off + len;
            let bytes = src
                .get(*off..end)
                .ok_or(RastroError::CorruptHeader("symbol table truncated"))?;
            symbols.push(bytes.to_vec());
            *off = end;
        }
        Ok(Self { symbols })
    }
}

fn saved_bytes(symbol_len: usize, count: usize) -> isize {
    // Each occurrence shrinks symbol_len bytes to one code byte, but escaped
    // literals elsewhere cost one extra byte; the table entry itself costs
    // symbol_len + 1.
    (count as isize) * (symbol_len as isize - 1) - (symbol_len as isize + 1)
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
