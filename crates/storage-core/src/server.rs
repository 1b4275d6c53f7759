//! Top-level storage-server operations (spec.md §4.E, component E):
//! `get_version`, `allocate_buckets`, `get_buckets`, `add_lease`,
//! `slot_readv`, `slot_testv_and_readv_and_writev`, `advise_corrupt_share`.
//!
//! `StorageServer` is the long-lived object a future RPC layer would
//! dispatch onto (SPEC_FULL.md §6 models this as the `StorageBackend`
//! trait; we implement the operations directly as inherent methods, since
//! this crate has exactly one backend).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use storage_format::{LeaseRecord, MutableShareFile, ShareKind, LEASE_RECORD_LEN};
use storage_types::{CancelSecret, NodeId, RenewSecret, ShareNumber, StorageIndex, WriteEnablerSecret};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::bucket::{BucketReader, BucketWriter, Canary, LiveWriters};
use crate::corruption::{CorruptionLog, ShareType};
use crate::error::{Result, ServerError};
use crate::space::SpaceAccountant;

/// Configuration accepted by the core at construction (SPEC_FULL.md §1:
/// the core does not parse config files, only a materialized struct).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub basedir: PathBuf,
    pub reserved_space: u64,
    pub readonly_storage: bool,
}

impl StorageConfig {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            basedir: basedir.into(),
            reserved_space: 0,
            readonly_storage: false,
        }
    }
}

/// Advertised capability dictionary (spec.md §4.E `get_version`,
/// SPEC_FULL.md §3.6).
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub maximum_immutable_share_size: u64,
    pub maximum_mutable_share_size: u64,
    pub available_space: Option<u64>,
    pub fills_holes_with_zero_bytes: bool,
    pub tolerates_immutable_read_overrun: bool,
    pub prevents_read_past_end_of_share_data: bool,
    pub delete_mutable_shares_with_zero_length_writev: bool,
    pub application_version: String,
}

/// Result of `allocate_buckets`: §8 invariant — `already_have` and the
/// keys of `allocated` never overlap, and their union is a subset of the
/// requested shnums.
#[derive(Default)]
pub struct AllocateBucketsResult {
    pub already_have: HashSet<ShareNumber>,
    pub allocated: HashMap<ShareNumber, BucketWriter>,
}

/// One mutable test-and-write operator. `Eq` is the only operator spec.md
/// requires to be honored; `Lt`/`Le` are accepted for wire compatibility
/// with the historical write-if-newer / write-if-same-or-newer idioms
/// (SPEC_FULL.md §9 open question), compared lexicographically like the
/// original implementation's byte-string comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOp {
    Eq,
    Lt,
    Le,
}

/// One `(test_vector, write_vector, new_length)` entry of a
/// `tw_vectors` map.
#[derive(Debug, Clone, Default)]
pub struct TestWriteVector {
    pub test_vector: Vec<(u64, u64, TestOp, Vec<u8>)>,
    pub write_vector: Vec<(u64, Vec<u8>)>,
    pub new_length: Option<u64>,
}

pub type TestWriteResult = (bool, HashMap<ShareNumber, Vec<Vec<u8>>>);

/// Per-SI mutual exclusion between RPC handlers and the crawler
/// (SPEC_FULL.md §5).
type SiLocks = Arc<AsyncMutex<HashMap<StorageIndex, Arc<AsyncMutex<()>>>>>;

pub struct StorageServer {
    basedir: PathBuf,
    node_id: NodeId,
    readonly: bool,
    space: SpaceAccountant,
    live_writers: LiveWriters,
    corruption: CorruptionLog,
    si_locks: SiLocks,
}

impl StorageServer {
    pub fn new(config: StorageConfig, node_id: NodeId) -> Result<Self> {
        fs::create_dir_all(config.basedir.join("shares").join("incoming"))?;
        Ok(Self {
            space: SpaceAccountant::new(config.basedir.clone(), config.reserved_space),
            corruption: CorruptionLog::new(&config.basedir),
            basedir: config.basedir,
            node_id,
            readonly: config.readonly_storage,
            live_writers: Arc::new(AsyncMutex::new(HashMap::new())),
            si_locks: Arc::new(AsyncMutex::new(HashMap::new())),
        })
    }

    pub fn basedir(&self) -> &std::path::Path {
        &self.basedir
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn shares_dir(&self, si: StorageIndex) -> PathBuf {
        self.basedir.join("shares").join(si.prefix()).join(si.to_base32())
    }

    fn incoming_dir(&self, si: StorageIndex) -> PathBuf {
        self.basedir
            .join("shares")
            .join("incoming")
            .join(si.prefix())
            .join(si.to_base32())
    }

    fn share_path(&self, si: StorageIndex, shnum: ShareNumber) -> PathBuf {
        self.shares_dir(si).join(shnum.to_string())
    }

    fn incoming_path(&self, si: StorageIndex, shnum: ShareNumber) -> PathBuf {
        self.incoming_dir(si).join(shnum.to_string())
    }

    fn list_existing_shnums(&self, si: StorageIndex) -> Result<Vec<ShareNumber>> {
        let dir = self.shares_dir(si);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(shnum) = name.parse::<u16>() {
                    if shnum <= u8::MAX as u16 {
                        out.push(shnum as u8);
                    }
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    async fn si_lock(&self, si: StorageIndex) -> Arc<AsyncMutex<()>> {
        let mut locks = self.si_locks.lock().await;
        Arc::clone(locks.entry(si).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }

    /// The same per-SI mutex RPC handlers serialize on, exposed so the
    /// crawler (`storage-crawler`) can hold off visiting a bucket while an
    /// RPC handler is mid-transaction on it, and vice versa (spec.md §5:
    /// "Mutual exclusion ... between RPC handlers and the crawler").
    pub async fn lock_si(&self, si: StorageIndex) -> OwnedMutexGuard<()> {
        self.si_lock(si).await.lock_owned().await
    }

    fn now(&self) -> u32 {
        time::OffsetDateTime::now_utc().unix_timestamp() as u32
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ServerError::ReadOnly);
        }
        Ok(())
    }

    // ---- get_version -----------------------------------------------------

    pub fn get_version(&self) -> VersionInfo {
        VersionInfo {
            maximum_immutable_share_size: u64::MAX,
            maximum_mutable_share_size: u64::MAX,
            available_space: self.space.available(),
            fills_holes_with_zero_bytes: true,
            tolerates_immutable_read_overrun: true,
            prevents_read_past_end_of_share_data: true,
            delete_mutable_shares_with_zero_length_writev: true,
            application_version: concat!("storage-rs/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    // ---- allocate_buckets --------------------------------------------------

    pub async fn allocate_buckets(
        &self,
        si: StorageIndex,
        renew_secret: RenewSecret,
        cancel_secret: CancelSecret,
        shnums: &[ShareNumber],
        allocated_size: u64,
        canary: Canary,
    ) -> Result<AllocateBucketsResult> {
        let lock = self.si_lock(si).await;
        let _guard = lock.lock().await;

        let mut already_have = HashSet::new();
        let now = self.now();
        let mut in_progress = {
            let writers = self.live_writers.lock().await;
            writers.get(&si).cloned().unwrap_or_default()
        };

        let mut needs_allocation = Vec::new();
        for &shnum in shnums {
            let path = self.share_path(si, shnum);
            if path.is_file() {
                already_have.insert(shnum);
                if self.space.can_allocate(LEASE_RECORD_LEN as u64) {
                    let mut share = storage_format::ImmutableShareFile::open(&path, si)?;
                    share.add_or_renew_lease(0, renew_secret, cancel_secret, now)?;
                }
                continue;
            }
            if in_progress.contains(&shnum) {
                // Already being written by another in-flight allocation: neither
                // already-have nor newly allocated (spec.md §4.D conflict rule).
                continue;
            }
            needs_allocation.push(shnum);
        }

        let mut allocated = HashMap::new();
        if !needs_allocation.is_empty() && !self.readonly {
            let total = allocated_size.saturating_mul(needs_allocation.len() as u64);
            if self.space.can_allocate(total) {
                let mut writers = self.live_writers.lock().await;
                let entry = writers.entry(si).or_default();
                for &shnum in &needs_allocation {
                    entry.insert(shnum);
                }
                drop(writers);
                in_progress.extend(needs_allocation.iter().copied());

                for &shnum in &needs_allocation {
                    let writer = BucketWriter::create(
                        si,
                        shnum,
                        allocated_size,
                        self.incoming_path(si, shnum),
                        self.share_path(si, shnum),
                        Arc::clone(&self.live_writers),
                        canary.clone(),
                    )?;
                    allocated.insert(shnum, writer);
                }
            }
        }

        Ok(AllocateBucketsResult { already_have, allocated })
    }

    // ---- get_buckets --------------------------------------------------------

    pub fn get_buckets(&self, si: StorageIndex) -> Result<HashMap<ShareNumber, BucketReader>> {
        let mut out = HashMap::new();
        for shnum in self.list_existing_shnums(si)? {
            let path = self.share_path(si, shnum);
            if let Ok(share) = storage_format::ImmutableShareFile::open(&path, si) {
                out.insert(shnum, BucketReader::open(si, shnum, share));
            }
        }
        Ok(out)
    }

    // ---- add_lease ----------------------------------------------------------

    pub async fn add_lease(&self, si: StorageIndex, renew_secret: RenewSecret, cancel_secret: CancelSecret) -> Result<()> {
        let lock = self.si_lock(si).await;
        let _guard = lock.lock().await;

        let shnums = self.list_existing_shnums(si)?;
        if shnums.is_empty() {
            return Ok(());
        }
        let now = self.now();

        // First pass: determine how many shares would need a brand-new lease
        // record (no existing match), so the whole SI either gets leases on
        // every share or none (spec.md §4.E).
        let mut new_lease_count = 0u64;
        for &shnum in &shnums {
            if self.has_matching_lease(si, shnum, renew_secret)? {
                continue;
            }
            new_lease_count += 1;
        }
        if new_lease_count > 0 {
            self.ensure_allocatable_ignoring_readonly(new_lease_count * LEASE_RECORD_LEN as u64)?;
        }

        for &shnum in &shnums {
            self.add_or_renew_lease_on_share(si, shnum, renew_secret, cancel_secret, now)?;
        }
        Ok(())
    }

    /// `add_lease` must still be able to refresh leases on a read-only
    /// server (spec.md §4.F allows lease refresh when space allows); only
    /// the space floor gates it, not `readonly_storage`.
    fn ensure_allocatable_ignoring_readonly(&self, bytes_needed: u64) -> Result<()> {
        if !self.space.can_allocate(bytes_needed) {
            return Err(ServerError::NoSpace);
        }
        Ok(())
    }

    fn has_matching_lease(&self, si: StorageIndex, shnum: ShareNumber, renew_secret: RenewSecret) -> Result<bool> {
        let path = self.share_path(si, shnum);
        let leases = match ShareKind::detect(&path, si)? {
            ShareKind::Immutable => storage_format::ImmutableShareFile::open(&path, si)?.leases()?,
            ShareKind::Mutable => MutableShareFile::open(&path, si)?.leases()?,
        };
        Ok(leases.iter().any(|l| l.renew_secret == renew_secret))
    }

    fn add_or_renew_lease_on_share(
        &self,
        si: StorageIndex,
        shnum: ShareNumber,
        renew_secret: RenewSecret,
        cancel_secret: CancelSecret,
        now: u32,
    ) -> Result<()> {
        let path = self.share_path(si, shnum);
        match ShareKind::detect(&path, si)? {
            ShareKind::Immutable => {
                let mut share = storage_format::ImmutableShareFile::open(&path, si)?;
                share.add_or_renew_lease(0, renew_secret, cancel_secret, now)?;
            }
            ShareKind::Mutable => {
                let mut share = MutableShareFile::open(&path, si)?;
                share.add_or_renew_lease(0, renew_secret, cancel_secret, now)?;
            }
        }
        Ok(())
    }

    // ---- slot_readv -----------------------------------------------------

    pub async fn slot_readv(
        &self,
        si: StorageIndex,
        shnums: &[ShareNumber],
        read_vector: &[(u64, u64)],
    ) -> Result<HashMap<ShareNumber, Vec<Vec<u8>>>> {
        let lock = self.si_lock(si).await;
        let _guard = lock.lock().await;

        let existing = self.list_existing_shnums(si)?;
        let wanted: Vec<ShareNumber> = if shnums.is_empty() {
            existing
        } else {
            existing.into_iter().filter(|s| shnums.contains(s)).collect()
        };

        let mut out = HashMap::new();
        for shnum in wanted {
            let path = self.share_path(si, shnum);
            let share = MutableShareFile::open(&path, si)?;
            let reads = read_vector
                .iter()
                .map(|&(offset, length)| share.read_range(offset, length))
                .collect::<storage_format::Result<Vec<_>>>()?;
            out.insert(shnum, reads);
        }
        Ok(out)
    }

    // ---- slot_testv_and_readv_and_writev --------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn slot_testv_and_readv_and_writev(
        &self,
        si: StorageIndex,
        write_enabler: WriteEnablerSecret,
        renew_secret: RenewSecret,
        cancel_secret: CancelSecret,
        tw_vectors: &HashMap<ShareNumber, TestWriteVector>,
        r_vector: &[(u64, u64)],
    ) -> Result<TestWriteResult> {
        let lock = self.si_lock(si).await;
        let _guard = lock.lock().await;

        let writes_requested = tw_vectors.values().any(|tw| !tw.write_vector.is_empty() || tw.new_length.is_some());
        if writes_requested {
            self.ensure_writable()?;
        }

        let existing = self.list_existing_shnums(si)?;

        // Step 1: write-enabler check against every share that already
        // exists. Shares that don't exist yet defer the check to creation.
        for &shnum in &existing {
            let path = self.share_path(si, shnum);
            let share = MutableShareFile::open(&path, si)?;
            if share.write_enabler_secret() != &write_enabler {
                return Err(ServerError::BadWriteEnabler {
                    si,
                    hint_node_id: share.write_enabler_nodeid(),
                });
            }
        }

        // Step 2-3: evaluate test vectors and collect pre-write read results
        // for r_vector against every known share (existing, or implicitly
        // empty for a shnum named only in tw_vectors).
        let mut considered: Vec<ShareNumber> = existing.clone();
        for &shnum in tw_vectors.keys() {
            if !considered.contains(&shnum) {
                considered.push(shnum);
            }
        }
        considered.sort_unstable();

        let mut current_bytes: HashMap<ShareNumber, Vec<u8>> = HashMap::new();
        for &shnum in &considered {
            let bytes = if existing.contains(&shnum) {
                let path = self.share_path(si, shnum);
                let share = MutableShareFile::open(&path, si)?;
                share.read_range(0, share.data_length())?
            } else {
                Vec::new()
            };
            current_bytes.insert(shnum, bytes);
        }

        let mut read_results = HashMap::new();
        for &shnum in &considered {
            let bytes = &current_bytes[&shnum];
            let reads = r_vector.iter().map(|&(offset, length)| read_slice(bytes, offset, length)).collect();
            read_results.insert(shnum, reads);
        }

        let mut all_pass = true;
        for (shnum, tw) in tw_vectors {
            let bytes = current_bytes.entry(*shnum).or_default();
            for (offset, length, op, specimen) in &tw.test_vector {
                let actual = read_slice(bytes, *offset, *length);
                if !eval_test_op(*op, &actual, specimen) {
                    all_pass = false;
                    break;
                }
            }
            if !all_pass {
                break;
            }
        }

        if !all_pass {
            return Ok((false, read_results));
        }

        // Space admission for net growth across all touched shares.
        if writes_requested {
            let mut growth = 0u64;
            for (shnum, tw) in tw_vectors {
                if tw.write_vector.is_empty() && tw.new_length.is_none() {
                    continue;
                }
                let before = if existing.contains(shnum) {
                    let share = MutableShareFile::open(&self.share_path(si, *shnum), si)?;
                    share.data_length()
                } else {
                    0
                };
                let mut after = before;
                for (offset, data) in &tw.write_vector {
                    after = after.max(offset + data.len() as u64);
                }
                growth += after.saturating_sub(before);
            }
            if growth > 0 {
                self.ensure_allocatable_ignoring_readonly(growth)?;
            }
        }

        let now = self.now();
        for (&shnum, tw) in tw_vectors {
            if tw.write_vector.is_empty() && tw.new_length.is_none() {
                continue;
            }
            let path = self.share_path(si, shnum);
            let mut share = if existing.contains(&shnum) {
                MutableShareFile::open(&path, si)?
            } else {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                MutableShareFile::create(&path, self.node_id, write_enabler)?
            };

            for (offset, data) in &tw.write_vector {
                share.write_range(*offset, data)?;
            }

            if let Some(new_length) = tw.new_length {
                if new_length == 0 {
                    drop(share);
                    fs::remove_file(&path)?;
                    continue;
                }
                share.truncate_to(new_length)?;
            }

            share.add_or_renew_lease(0, renew_secret, cancel_secret, now)?;
        }

        Ok((true, read_results))
    }

    // ---- advise_corrupt_share --------------------------------------------

    pub fn advise_corrupt_share(&self, share_type: ShareType, si: StorageIndex, shnum: ShareNumber, reason: &[u8]) -> Result<()> {
        self.corruption.record(share_type, si, shnum, reason)
    }
}

fn read_slice(bytes: &[u8], offset: u64, length: u64) -> Vec<u8> {
    if offset >= bytes.len() as u64 {
        return Vec::new();
    }
    let start = offset as usize;
    let end = (offset + length).min(bytes.len() as u64) as usize;
    bytes[start..end].to_vec()
}

fn eval_test_op(op: TestOp, actual: &[u8], specimen: &[u8]) -> bool {
    match op {
        TestOp::Eq => actual == specimen,
        TestOp::Lt => actual < specimen,
        TestOp::Le => actual <= specimen,
    }
}
