//! Errors raised while parsing or updating on-disk share containers.

use std::io;

use storage_types::StorageIndex;

/// Failures that can occur while reading or writing an immutable or mutable
/// share container. Corresponds to spec.md §7's format-level error kinds.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("i/o error on share file: {0}")]
    Io(#[from] io::Error),

    /// `UnknownImmutableContainerVersionError` (spec.md §7): the 4-byte
    /// version prefix on an immutable share was neither 1 nor 2.
    #[error("unknown immutable share container version {version} for storage index {si}")]
    UnknownImmutableVersion { si: StorageIndex, version: u32 },

    /// `UnknownMutableContainerVersionError` (spec.md §7): the fixed magic
    /// string at the head of a mutable share did not match.
    #[error("unknown mutable share container magic for storage index {si}")]
    UnknownMutableMagic { si: StorageIndex },

    #[error("mutable share version {version} is not supported")]
    UnsupportedMutableVersion { version: u8 },

    #[error("write past declared allocation: offset {offset} + len {len} > allocated {allocated}")]
    DataTooLarge {
        offset: u64,
        len: u64,
        allocated: u64,
    },

    #[error("lease record is malformed ({0} bytes, expected {1})")]
    MalformedLease(usize, usize),

    #[error("share container is corrupt: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, FormatError>;
