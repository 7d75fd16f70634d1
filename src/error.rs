//! Error taxonomy for library parsing and matching.
//!
//! Parse-time problems are fatal for the whole containing library: a library
//! with one malformed object is useless as matching input, because segment
//! and extern indices would be unreliable. Matching itself never fails on
//! bad input — a segment that does not match simply contributes no
//! candidates — so the only matching-phase variant is `Internal`, raised
//! when the parsed object graph violates its own invariants.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The input is neither an OMF library nor a bare OMF object module.
    #[error("not an OMF library or object: leading byte {0:#04x}")]
    BadMagic(u8),

    /// 0xF0 0x01 header: PharLap-flavored libraries are not handled.
    #[error("unsupported library format")]
    UnsupportedLibraryFormat,

    /// The library page size must hold at least the 10-byte header.
    #[error("library page size {0} is too small")]
    PageSizeTooSmall(u32),

    #[error("library page size {0} is not a power of two")]
    PageSizeNotPowerOfTwo(u32),

    /// A record with a nonzero checksum byte did not sum to zero mod 256.
    #[error("checksum failed for record at offset {0:#x}")]
    ChecksumFailed(usize),

    #[error("unknown object record tag {tag:#04x} at offset {offset:#x}")]
    UnknownTag { tag: u8, offset: usize },

    /// SEGDEF class name that maps to no Location.
    #[error("unknown segment class {0:?}")]
    UnknownSegmentClass(String),

    /// Fixup shapes the matcher cannot use (threaded fixups, group or
    /// absolute-frame targets, relative 48-bit pointers).
    #[error("unsupported fixup: {0}")]
    UnsupportedFixup(String),

    /// A record body ended before its declared content.
    #[error("truncated record: {0}")]
    Truncated(&'static str),

    /// Structurally valid records with inconsistent content (bad indices,
    /// data overruns, fixups with no data site).
    #[error("malformed object: {0}")]
    InvalidObject(String),

    /// Problems with the target executable.
    #[error("malformed executable: {0}")]
    InvalidImage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The parsed object graph broke one of its own invariants; this is a
    /// parser bug, not an input problem.
    #[error("internal error: {0}")]
    Internal(String),
}
