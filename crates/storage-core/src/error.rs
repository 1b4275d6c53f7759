//! Server-level errors (spec.md §7).

use storage_types::{NodeId, StorageIndex};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no space: reserved floor would be violated")]
    NoSpace,

    #[error("write of {len} bytes at offset {offset} exceeds allocated size {allocated}")]
    DataTooLarge { offset: u64, len: u64, allocated: u64 },

    #[error("conflicting close for storage index {si} share {shnum}: share already finalized with different contents")]
    ConflictingWrite { si: StorageIndex, shnum: u8 },

    /// Carries the node ID that originally recorded the write-enabler, so
    /// the caller can tell whether it's talking to the wrong server.
    #[error("bad write-enabler for storage index {si}; originally recorded by node {hint_node_id}")]
    BadWriteEnabler { si: StorageIndex, hint_node_id: NodeId },

    #[error("server is read-only")]
    ReadOnly,

    #[error("share container error: {0}")]
    Format(#[from] storage_format::FormatError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown bucket writer for storage index {si} share {shnum} (closed, aborted, or never allocated)")]
    UnknownWriter { si: StorageIndex, shnum: u8 },
}

pub type Result<T> = std::result::Result<T, ServerError>;
