//! Low-level building blocks shared by the storage layers: positioned file
//! I/O, the byte pipe with its pooled buffers, and the per-page symbol-table
//! codec.

pub mod bytes;
pub mod fsst;
pub mod io;
