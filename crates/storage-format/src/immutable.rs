//! Immutable share container (spec.md §3.3, component B).
//!
//! Write-once: created by `allocate_buckets`, written sequentially via
//! `write(offset, data)`, finalized by `close`. The data region never
//! changes after that; only the trailing lease table is ever rewritten.

use std::fs::{File, OpenOptions};
use std::io::Cursor;
use std::path::Path;

use binrw::{BinRead, BinWrite};
use storage_types::StorageIndex;

use crate::error::{FormatError, Result};
use crate::io_ext::{pread, pwrite};
use crate::lease::{LEASE_RECORD_LEN, LeaseRecord};

/// Version 1 uses 32-bit length fields (max ~4 GiB share); version 2 uses
/// 64-bit fields. The version is picked once, at creation time, from the
/// declared allocated size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmutableVersion {
    V1,
    V2,
}

impl ImmutableVersion {
    fn header_len(self) -> u64 {
        match self {
            ImmutableVersion::V1 => 12,
            ImmutableVersion::V2 => 20,
        }
    }
}

#[derive(BinRead, BinWrite, Debug, Clone, Copy)]
#[brw(big)]
enum RawHeader {
    #[brw(magic = 1u32)]
    V1 {
        data_length: u32,
        lease_table_offset: u32,
    },
    #[brw(magic = 2u32)]
    V2 {
        data_length: u64,
        lease_table_offset: u64,
    },
}

/// An open immutable share file (finalized or still in the incoming
/// directory — this type doesn't care which; `BucketWriter` owns the
/// lifecycle transition).
pub struct ImmutableShareFile {
    file: File,
    version: ImmutableVersion,
    header_len: u64,
    data_length: u64,
    lease_table_offset: u64,
}

impl ImmutableShareFile {
    /// Creates a brand-new share file of exactly `allocated_size` data
    /// bytes. The data region is a sparse hole until `write` fills it.
    pub fn create(path: &Path, allocated_size: u64) -> Result<Self> {
        let version = if allocated_size > u32::MAX as u64 {
            ImmutableVersion::V2
        } else {
            ImmutableVersion::V1
        };
        let header_len = version.header_len();
        let lease_table_offset = header_len + allocated_size;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let raw = match version {
            ImmutableVersion::V1 => RawHeader::V1 {
                data_length: allocated_size as u32,
                lease_table_offset: lease_table_offset as u32,
            },
            ImmutableVersion::V2 => RawHeader::V2 {
                data_length: allocated_size,
                lease_table_offset,
            },
        };
        let mut buf = Cursor::new(Vec::new());
        raw.write(&mut buf)?;
        pwrite(&file, 0, &buf.into_inner())?;
        file.set_len(lease_table_offset)?;

        Ok(Self {
            file,
            version,
            header_len,
            data_length: allocated_size,
            lease_table_offset,
        })
    }

    /// Opens a share file that already exists on disk (finalized, or a
    /// still-open in-progress write being resumed within the same process).
    pub fn open(path: &Path, si: StorageIndex) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let head = pread(&file, 0, 20)?;
        if head.len() < 4 {
            return Err(FormatError::Corrupt("share file shorter than header".into()));
        }
        let version_tag = u32::from_be_bytes(head[0..4].try_into().unwrap());
        let mut cursor = Cursor::new(&head);
        let raw = RawHeader::read(&mut cursor)
            .map_err(|_| FormatError::UnknownImmutableVersion { si, version: version_tag })?;
        let (version, data_length, lease_table_offset) = match raw {
            RawHeader::V1 {
                data_length,
                lease_table_offset,
            } => (ImmutableVersion::V1, data_length as u64, lease_table_offset as u64),
            RawHeader::V2 {
                data_length,
                lease_table_offset,
            } => (ImmutableVersion::V2, data_length, lease_table_offset),
        };
        Ok(Self {
            file,
            version,
            header_len: version.header_len(),
            data_length,
            lease_table_offset,
        })
    }

    pub fn version(&self) -> ImmutableVersion {
        self.version
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    /// Writes `data` at `offset` within the declared data region.
    ///
    /// A zero-length write is accepted and is a no-op (spec.md §8).
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FormatError::DataTooLarge {
                offset,
                len: data.len() as u64,
                allocated: self.data_length,
            })?;
        if end > self.data_length {
            return Err(FormatError::DataTooLarge {
                offset,
                len: data.len() as u64,
                allocated: self.data_length,
            });
        }
        pwrite(&self.file, self.header_len + offset, data)?;
        Ok(())
    }

    /// Reads up to `length` bytes starting at `offset`, truncating at the
    /// end of the data region rather than erroring (the `get_version`
    /// advertised `tolerates-immutable-read-overrun` behavior).
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset >= self.data_length {
            return Ok(Vec::new());
        }
        let capped = length.min(self.data_length - offset);
        Ok(pread(&self.file, self.header_len + offset, capped as usize)?)
    }

    /// Installs the final lease table and fsyncs. Called exactly once, by
    /// `BucketWriter::close`, before the file is renamed into the finalized
    /// shares directory.
    pub fn finalize(&mut self, leases: &[LeaseRecord]) -> Result<()> {
        self.write_lease_table(leases)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn leases(&self) -> Result<Vec<LeaseRecord>> {
        let file_len = self.file.metadata()?.len();
        if file_len <= self.lease_table_offset {
            return Ok(Vec::new());
        }
        let bytes = pread(&self.file, self.lease_table_offset, (file_len - self.lease_table_offset) as usize)?;
        bytes
            .chunks_exact(LEASE_RECORD_LEN)
            .map(LeaseRecord::from_bytes)
            .collect()
    }

    fn write_lease_table(&self, leases: &[LeaseRecord]) -> Result<()> {
        let mut buf = Vec::with_capacity(leases.len() * LEASE_RECORD_LEN);
        for lease in leases {
            buf.extend_from_slice(&lease.to_bytes());
        }
        pwrite(&self.file, self.lease_table_offset, &buf)?;
        self.file.set_len(self.lease_table_offset + buf.len() as u64)?;
        Ok(())
    }

    /// Renews `renew_secret`'s lease if one exists, else appends a fresh
    /// one. Returns `true` if a new lease record was appended (used by
    /// callers to decide whether a space check is needed).
    pub fn add_or_renew_lease(
        &mut self,
        owner_num: u32,
        renew_secret: storage_types::RenewSecret,
        cancel_secret: storage_types::CancelSecret,
        now: u32,
    ) -> Result<bool> {
        let mut leases = self.leases()?;
        if let Some(existing) = leases.iter_mut().find(|l| l.renew_secret == renew_secret) {
            existing.renew(now);
            self.write_lease_table(&leases)?;
            Ok(false)
        } else {
            leases.push(LeaseRecord::fresh(owner_num, renew_secret, cancel_secret, now));
            self.write_lease_table(&leases)?;
            Ok(true)
        }
    }

    /// Removes leases matching `predicate`; returns the removed records.
    pub fn remove_leases(&mut self, predicate: impl Fn(&LeaseRecord) -> bool) -> Result<Vec<LeaseRecord>> {
        let leases = self.leases()?;
        let (removed, kept): (Vec<_>, Vec<_>) = leases.into_iter().partition(|l| predicate(l));
        self.write_lease_table(&kept)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_types::{CancelSecret, RenewSecret};
    use tempfile::tempdir;

    fn si() -> StorageIndex {
        StorageIndex::new([7u8; 16])
    }

    #[test]
    fn write_close_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let share = ImmutableShareFile::create(&path, 1000).unwrap();
        share.write(0, &[0xffu8; 1000]).unwrap();
        drop(share);

        let share = ImmutableShareFile::open(&path, si()).unwrap();
        let data = share.read(0, 1000).unwrap();
        assert_eq!(data, vec![0xffu8; 1000]);
    }

    #[test]
    fn read_past_end_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let share = ImmutableShareFile::create(&path, 10).unwrap();
        share.write(0, b"hello").unwrap();
        let data = share.read(0, 1000).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(&data[0..5], b"hello");
    }

    #[test]
    fn write_past_allocation_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let share = ImmutableShareFile::create(&path, 10).unwrap();
        let err = share.write(5, b"toolong!!!").unwrap_err();
        assert!(matches!(err, FormatError::DataTooLarge { .. }));
    }

    #[test]
    fn large_share_selects_v2() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let share = ImmutableShareFile::create(&path, u32::MAX as u64 + 10).unwrap();
        assert_eq!(share.version(), ImmutableVersion::V2);
    }

    #[test]
    fn lease_renew_is_in_place_not_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut share = ImmutableShareFile::create(&path, 10).unwrap();
        let rs = RenewSecret::new([1u8; 32]);
        let cs = CancelSecret::new([2u8; 32]);
        share.add_or_renew_lease(0, rs, cs, 1000).unwrap();
        share.add_or_renew_lease(0, rs, cs, 2000).unwrap();
        let leases = share.leases().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].last_renewed_at(), 2000);
    }
}
