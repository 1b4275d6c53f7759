//! Identifiers and secrets shared across the storage-server core crates.
//!
//! This crate has no on-disk format knowledge (that's `storage-format`) and
//! no I/O (that's `storage-core`/`storage-crawler`); it just gives every
//! other crate a single, typed vocabulary for storage indices, share
//! numbers, node ids and the three secret kinds, instead of passing raw
//! byte slices around.

pub mod ids;
pub mod secrets;

pub use ids::{BASE32_ALPHABET, MAX_SHARES_PER_SI, NODE_ID_LEN, NodeId, STORAGE_INDEX_LEN, ShareNumber, StorageIndex};
pub use secrets::{CancelSecret, RenewSecret, WriteEnablerSecret};
