//! Mutable share container (spec.md §3.4, component C).
//!
//! Unlike an immutable share, the data region can be rewritten in place and
//! can grow; growing relocates the trailing lease table (fixed 4-slot table
//! plus any overflow "extra" leases) so it always starts right after the
//! data region.

use std::fs::{File, OpenOptions};
use std::io::Cursor;
use std::path::Path;

use binrw::{BinRead, BinWrite};
use storage_types::{CancelSecret, NodeId, RenewSecret, StorageIndex, WriteEnablerSecret};

use crate::error::{FormatError, Result};
use crate::io_ext::{pread, pwrite};
use crate::lease::{LEASE_RECORD_LEN, LeaseRecord};

const MAGIC: &[u8; 32] = b"storage-rs mutable share v1\0\0\0\0\0";

/// Header length in bytes: 32 (magic) + 1 (version) + 20 (nodeid) + 32
/// (write-enabler secret) + 8 (data_length) + 8 (extra_lease_offset).
pub const MUTABLE_HEADER_LEN: u64 = 101;

/// Fixed number of lease slots kept inline in the header-adjacent table.
/// A 5th concurrent lease on one share spills into the "extra leases"
/// region past the fixed table.
pub const MUTABLE_LEASE_SLOTS: usize = 4;

const MUTABLE_LEASE_SLOT_LEN: u64 = 92;
pub const MUTABLE_LEASE_TABLE_LEN: u64 = MUTABLE_LEASE_SLOT_LEN * MUTABLE_LEASE_SLOTS as u64;

#[derive(BinRead, BinWrite, Debug, Clone)]
#[brw(big, magic = b"storage-rs mutable share v1\0\0\0\0\0")]
struct RawHeader {
    version: u8,
    write_enabler_nodeid: [u8; 20],
    #[br(map = |x: [u8; 32]| WriteEnablerSecret::new(x))]
    #[bw(map = |s: &WriteEnablerSecret| *s.as_bytes())]
    write_enabler_secret: WriteEnablerSecret,
    data_length: u64,
    extra_lease_offset: u64,
}

#[derive(BinRead, BinWrite, Debug, Clone, Copy)]
#[brw(big)]
struct RawLeaseSlot {
    #[brw(pad_after = 3)]
    enabled: u8,
    owner_num: u32,
    #[br(map = |x: [u8; 32]| RenewSecret::new(x))]
    #[bw(map = |s: &RenewSecret| *s.as_bytes())]
    renew_secret: RenewSecret,
    #[br(map = |x: [u8; 32]| CancelSecret::new(x))]
    #[bw(map = |s: &CancelSecret| *s.as_bytes())]
    cancel_secret: CancelSecret,
    #[brw(pad_after = 16)]
    expiration_time: u32,
}

/// An open mutable slot's single share file on this server.
pub struct MutableShareFile {
    file: File,
    version: u8,
    write_enabler_nodeid: NodeId,
    write_enabler_secret: WriteEnablerSecret,
    data_length: u64,
    extra_lease_offset: u64,
}

impl MutableShareFile {
    pub fn create(path: &Path, nodeid: NodeId, secret: WriteEnablerSecret) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut share = Self {
            file,
            version: 1,
            write_enabler_nodeid: nodeid,
            write_enabler_secret: secret,
            data_length: 0,
            extra_lease_offset: MUTABLE_HEADER_LEN,
        };
        share.write_header()?;
        share.set_leases(&[])?;
        Ok(share)
    }

    pub fn open(path: &Path, si: StorageIndex) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let head = pread(&file, 0, MUTABLE_HEADER_LEN as usize)?;
        if head.len() < 32 || &head[0..32] != MAGIC.as_slice() {
            return Err(FormatError::UnknownMutableMagic { si });
        }
        let mut cursor = Cursor::new(&head);
        let raw = RawHeader::read(&mut cursor).map_err(|_| FormatError::UnknownMutableMagic { si })?;
        if raw.version != 1 {
            return Err(FormatError::UnsupportedMutableVersion { version: raw.version });
        }
        Ok(Self {
            file,
            version: raw.version,
            write_enabler_nodeid: NodeId::new(raw.write_enabler_nodeid),
            write_enabler_secret: raw.write_enabler_secret,
            data_length: raw.data_length,
            extra_lease_offset: raw.extra_lease_offset,
        })
    }

    fn write_header(&self) -> Result<()> {
        let raw = RawHeader {
            version: self.version,
            write_enabler_nodeid: *self.write_enabler_nodeid.as_bytes(),
            write_enabler_secret: self.write_enabler_secret,
            data_length: self.data_length,
            extra_lease_offset: self.extra_lease_offset,
        };
        let mut buf = Cursor::new(Vec::new());
        raw.write(&mut buf)?;
        pwrite(&self.file, 0, &buf.into_inner())?;
        Ok(())
    }

    pub fn write_enabler_secret(&self) -> &WriteEnablerSecret {
        &self.write_enabler_secret
    }

    pub fn write_enabler_nodeid(&self) -> NodeId {
        self.write_enabler_nodeid
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    pub fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset >= self.data_length {
            return Ok(Vec::new());
        }
        let capped = length.min(self.data_length - offset);
        Ok(pread(&self.file, MUTABLE_HEADER_LEN + offset, capped as usize)?)
    }

    /// Writes `data` at `offset`, growing (and zero-filling the hole, if
    /// any) when `offset + data.len()` exceeds the current data length.
    pub fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FormatError::Corrupt("write range overflow".into()))?;
        if end > self.data_length {
            self.resize(end)?;
        }
        pwrite(&self.file, MUTABLE_HEADER_LEN + offset, data)?;
        Ok(())
    }

    /// Shrinks the data region. A no-op if `new_length >= data_length`
    /// (new_length never grows the share on its own — only write vectors
    /// do that, per spec.md §4.E step 4).
    pub fn truncate_to(&mut self, new_length: u64) -> Result<()> {
        if new_length < self.data_length {
            self.resize(new_length)?;
        }
        Ok(())
    }

    /// Relocates the lease table to sit immediately after `new_data_length`
    /// bytes of data, preserving every existing lease record.
    fn resize(&mut self, new_data_length: u64) -> Result<()> {
        let leases = self.leases()?;
        let old_data_length = self.data_length;
        if new_data_length > old_data_length {
            let gap = (new_data_length - old_data_length) as usize;
            pwrite(&self.file, MUTABLE_HEADER_LEN + old_data_length, &vec![0u8; gap])?;
        }
        self.data_length = new_data_length;
        self.extra_lease_offset = MUTABLE_HEADER_LEN + new_data_length;
        self.write_header()?;
        self.set_leases(&leases)
    }

    pub fn leases(&self) -> Result<Vec<LeaseRecord>> {
        let mut out = Vec::new();
        let slot_bytes = pread(&self.file, self.extra_lease_offset, MUTABLE_LEASE_TABLE_LEN as usize)?;
        for chunk in slot_bytes.chunks_exact(MUTABLE_LEASE_SLOT_LEN as usize) {
            let mut cursor = Cursor::new(chunk);
            let slot = RawLeaseSlot::read(&mut cursor).map_err(|e| FormatError::Corrupt(e.to_string()))?;
            if slot.enabled != 0 {
                out.push(LeaseRecord::new(
                    slot.owner_num,
                    slot.renew_secret,
                    slot.cancel_secret,
                    slot.expiration_time,
                ));
            }
        }
        let extra_start = self.extra_lease_offset + MUTABLE_LEASE_TABLE_LEN;
        let file_len = self.file.metadata()?.len();
        if file_len > extra_start {
            let extra_bytes = pread(&self.file, extra_start, (file_len - extra_start) as usize)?;
            for chunk in extra_bytes.chunks_exact(LEASE_RECORD_LEN) {
                out.push(LeaseRecord::from_bytes(chunk)?);
            }
        }
        Ok(out)
    }

    /// Rewrites the whole lease table (4 fixed slots, any overflow as
    /// extra leases) and truncates/extends the file to match.
    pub fn set_leases(&mut self, leases: &[LeaseRecord]) -> Result<()> {
        let mut slot_buf = vec![0u8; MUTABLE_LEASE_TABLE_LEN as usize];
        let mut extra_buf = Vec::new();
        for (i, lease) in leases.iter().enumerate() {
            let slot = RawLeaseSlot {
                enabled: 1,
                owner_num: lease.owner_num,
                renew_secret: lease.renew_secret,
                cancel_secret: lease.cancel_secret,
                expiration_time: lease.expiration_time,
            };
            if i < MUTABLE_LEASE_SLOTS {
                let mut cursor = Cursor::new(Vec::new());
                slot.write(&mut cursor)?;
                let bytes = cursor.into_inner();
                let start = i * MUTABLE_LEASE_SLOT_LEN as usize;
                slot_buf[start..start + MUTABLE_LEASE_SLOT_LEN as usize].copy_from_slice(&bytes);
            } else {
                extra_buf.extend_from_slice(&lease.to_bytes());
            }
        }
        pwrite(&self.file, self.extra_lease_offset, &slot_buf)?;
        if !extra_buf.is_empty() {
            pwrite(&self.file, self.extra_lease_offset + MUTABLE_LEASE_TABLE_LEN, &extra_buf)?;
        }
        self.file
            .set_len(self.extra_lease_offset + MUTABLE_LEASE_TABLE_LEN + extra_buf.len() as u64)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn add_or_renew_lease(
        &mut self,
        owner_num: u32,
        renew_secret: RenewSecret,
        cancel_secret: CancelSecret,
        now: u32,
    ) -> Result<bool> {
        let mut leases = self.leases()?;
        if let Some(existing) = leases.iter_mut().find(|l| l.renew_secret == renew_secret) {
            existing.renew(now);
            self.set_leases(&leases)?;
            Ok(false)
        } else {
            leases.push(LeaseRecord::fresh(owner_num, renew_secret, cancel_secret, now));
            self.set_leases(&leases)?;
            Ok(true)
        }
    }

    pub fn remove_leases(&mut self, predicate: impl Fn(&LeaseRecord) -> bool) -> Result<Vec<LeaseRecord>> {
        let leases = self.leases()?;
        let (removed, kept): (Vec<_>, Vec<_>) = leases.into_iter().partition(|l| predicate(l));
        self.set_leases(&kept)?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn si() -> StorageIndex {
        StorageIndex::new([3u8; 16])
    }

    #[test]
    fn write_then_read_same_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut share = MutableShareFile::create(&path, NodeId::new([1u8; 20]), WriteEnablerSecret::new([2u8; 32])).unwrap();
        share.write_range(0, b"hello").unwrap();
        assert_eq!(share.read_range(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn gap_is_zero_filled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut share = MutableShareFile::create(&path, NodeId::new([1u8; 20]), WriteEnablerSecret::new([2u8; 32])).unwrap();
        share.write_range(10, b"x").unwrap();
        let data = share.read_range(0, 11).unwrap();
        assert_eq!(&data[0..10], &[0u8; 10]);
        assert_eq!(&data[10..11], b"x");
    }

    #[test]
    fn new_length_zero_shrinks_to_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut share = MutableShareFile::create(&path, NodeId::new([1u8; 20]), WriteEnablerSecret::new([2u8; 32])).unwrap();
        share.write_range(0, b"hello world").unwrap();
        share.truncate_to(0).unwrap();
        assert_eq!(share.data_length(), 0);
        assert_eq!(share.read_range(0, 100).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn gap_is_zero_filled_even_when_it_overlaps_a_vacated_lease_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut share = MutableShareFile::create(&path, NodeId::new([1u8; 20]), WriteEnablerSecret::new([2u8; 32])).unwrap();
        share.write_range(0, b"payload").unwrap();
        share
            .add_or_renew_lease(0, RenewSecret::new([9u8; 32]), CancelSecret::new([8u8; 32]), 1000)
            .unwrap();
        share.write_range(100, b"x").unwrap();
        let data = share.read_range(7, 93).unwrap();
        assert_eq!(data, vec![0u8; 93]);
    }

    #[test]
    fn leases_survive_resize() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let mut share = MutableShareFile::create(&path, NodeId::new([1u8; 20]), WriteEnablerSecret::new([2u8; 32])).unwrap();
        share
            .add_or_renew_lease(0, RenewSecret::new([9u8; 32]), CancelSecret::new([8u8; 32]), 1000)
            .unwrap();
        share.write_range(0, &vec![0xab; 5000]).unwrap();
        let leases = share.leases().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].expiration_time, 1000 + crate::lease::DEFAULT_LEASE_DURATION_SECS);
    }

    #[test]
    fn reopen_preserves_write_enabler() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let nodeid = NodeId::new([5u8; 20]);
        let secret = WriteEnablerSecret::new([6u8; 32]);
        MutableShareFile::create(&path, nodeid, secret).unwrap();
        let reopened = MutableShareFile::open(&path, si()).unwrap();
        assert_eq!(reopened.write_enabler_secret(), &secret);
        assert_eq!(reopened.write_enabler_nodeid(), nodeid);
    }
}
