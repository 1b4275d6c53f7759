//! Operator-visible corruption-advisory log (`SPEC_FULL.md` §4.E).
//!
//! `advise_corrupt_share` never touches the share itself; it just drops a
//! breadcrumb under `<basedir>/corruption-advisories/` for a human to look
//! at later. One file per report, named so reports sort chronologically.

use std::fs;
use std::path::{Path, PathBuf};

use storage_types::StorageIndex;
use time::OffsetDateTime;

use crate::error::Result;

/// Which kind of share a corruption report concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareType {
    Mutable,
    Immutable,
}

impl ShareType {
    fn as_str(self) -> &'static str {
        match self {
            ShareType::Mutable => "mutable",
            ShareType::Immutable => "immutable",
        }
    }
}

pub struct CorruptionLog {
    dir: PathBuf,
}

impl CorruptionLog {
    pub fn new(basedir: &Path) -> Self {
        Self {
            dir: basedir.join("corruption-advisories"),
        }
    }

    /// Appends one report. Directory creation is lazy — most servers never
    /// receive a corruption advisory in their lifetime.
    pub fn record(
        &self,
        share_type: ShareType,
        si: StorageIndex,
        shnum: u8,
        reason: &[u8],
    ) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let name = format!("{now}-{}-{shnum}", si.to_base32());
        let path = self.dir.join(name);
        let mut body = format!("share_type: {}\nstorage_index: {si}\nshnum: {shnum}\nreason: ", share_type.as_str())
            .into_bytes();
        body.extend_from_slice(reason);
        body.push(b'\n');
        fs::write(path, body)?;
        Ok(())
    }
}
