//! Disk-space accounting and admission control (spec.md §4.F, component F).

use std::path::{Path, PathBuf};

use sysinfo::Disks;

/// Computes `free_for_nonroot(basedir) - reserved_space` and gates
/// allocating operations on it.
///
/// If the OS provides no usable free-space figure for `basedir`'s
/// filesystem, `available()` returns `None` ("unknown"); the server must
/// then refuse new allocations while continuing to serve reads and lease
/// renewals (spec.md §4.F).
pub struct SpaceAccountant {
    basedir: PathBuf,
    reserved_space: u64,
}

impl SpaceAccountant {
    pub fn new(basedir: PathBuf, reserved_space: u64) -> Self {
        Self {
            basedir,
            reserved_space,
        }
    }

    pub fn reserved_space(&self) -> u64 {
        self.reserved_space
    }

    /// Bytes available for new allocations, or `None` if unknown.
    pub fn available(&self) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|d| self.basedir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())?;
        Some(best.available_space().saturating_sub(self.reserved_space))
    }

    /// `true` iff allocating `bytes_needed` more would not dip the
    /// filesystem below the reserved floor. `None` (unknown free space)
    /// counts as "cannot allocate".
    pub fn can_allocate(&self, bytes_needed: u64) -> bool {
        matches!(self.available(), Some(avail) if bytes_needed <= avail)
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reserved_floor_is_exposed() {
        let dir = tempdir().unwrap();
        let acct = SpaceAccountant::new(dir.path().to_path_buf(), 1024);
        assert_eq!(acct.reserved_space(), 1024);
    }

    #[test]
    fn huge_request_cannot_be_allocated() {
        let dir = tempdir().unwrap();
        let acct = SpaceAccountant::new(dir.path().to_path_buf(), 0);
        // No real disk offers an exabyte of free space.
        assert!(!acct.can_allocate(u64::MAX / 2));
    }
}
