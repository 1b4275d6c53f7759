//! On-disk immutable and mutable share container formats (spec.md §3.3-3.4,
//! components A-C).
//!
//! This crate only knows how to read and write bytes on disk; it has no
//! concept of leases policy, disk-space admission, or RPC semantics — those
//! live in `storage-core` and `storage-crawler`.

pub mod error;
pub mod immutable;
mod io_ext;
pub mod lease;
pub mod mutable;

pub use error::{FormatError, Result};
pub use immutable::{ImmutableShareFile, ImmutableVersion};
pub use lease::{DEFAULT_LEASE_DURATION_SECS, LEASE_RECORD_LEN, LeaseRecord};
pub use mutable::{MUTABLE_HEADER_LEN, MutableShareFile};

use std::fs::File;
use std::path::Path;

use storage_types::StorageIndex;

/// Which container format a share file on disk uses. Detected by peeking
/// at the first bytes without committing to either reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareKind {
    Immutable,
    Mutable,
}

impl ShareKind {
    pub fn detect(path: &Path, si: StorageIndex) -> Result<Self> {
        let file = File::open(path)?;
        let head = io_ext::pread(&file, 0, 32)?;
        if head.len() >= 32 && head[0..32] == *b"storage-rs mutable share v1\0\0\0\0\0" {
            return Ok(ShareKind::Mutable);
        }
        if head.len() >= 4 {
            let tag = u32::from_be_bytes(head[0..4].try_into().unwrap());
            if tag == 1 || tag == 2 {
                return Ok(ShareKind::Immutable);
            }
        }
        Err(FormatError::Corrupt(format!(
            "share {si} at {} matches neither immutable nor mutable magic",
            path.display()
        )))
    }
}
