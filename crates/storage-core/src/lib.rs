//! Storage-server core: bucket writer/reader, the top-level server
//! operations and disk-space admission control (spec.md §4.D-F, components
//! D-F).
//!
//! This crate knows about RPC-shaped semantics (leases, write-enablers,
//! admission control) but not about any wire transport — see `SPEC_FULL.md`
//! §6, which models the RPC surface as the `StorageBackend` trait
//! implemented by `StorageServer`.

pub mod bucket;
pub mod corruption;
pub mod error;
pub mod server;
pub mod space;

pub use bucket::{BucketReader, BucketWriter, Canary};
pub use corruption::ShareType;
pub use error::{Result, ServerError};
pub use server::{
    AllocateBucketsResult, StorageConfig, StorageServer, TestOp, TestWriteResult, TestWriteVector,
};
pub use space::SpaceAccountant;
