//! Bucket writer/reader: the per-connection stateful objects that mediate
//! one immutable upload or read (spec.md §4.D, component D).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use storage_format::{ImmutableShareFile, LeaseRecord};
use storage_types::{ShareNumber, StorageIndex};
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::error::{Result, ServerError};

/// Shnums currently claimed by an in-progress (not yet closed) writer, per
/// storage index. `allocate_buckets` consults this, together with the
/// finalized-shares directory, to enforce the no-double-allocate rule
/// (spec.md §4.D: "the second allocation returns empty").
pub type LiveWriters = Arc<AsyncMutex<std::collections::HashMap<StorageIndex, HashSet<ShareNumber>>>>;

/// A connection-lifetime token. Loss (client disconnect) is signalled by
/// the transport layer calling [`CanaryHandle::signal_lost`], or simply by
/// dropping the handle — either way every [`Canary`] cloned from it wakes
/// up. The core only ever awaits "has this been lost yet?"; it never
/// inspects the transport connection itself (SPEC_FULL.md §9).
#[derive(Clone)]
pub struct Canary(watch::Receiver<bool>);

pub struct CanaryHandle(watch::Sender<bool>);

impl Canary {
    pub fn new() -> (Canary, CanaryHandle) {
        let (tx, rx) = watch::channel(false);
        (Canary(rx), CanaryHandle(tx))
    }

    /// Resolves once the paired handle signals loss (explicitly or via
    /// drop).
    pub async fn wait_lost(mut self) {
        loop {
            if *self.0.borrow() {
                return;
            }
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

impl CanaryHandle {
    pub fn signal_lost(&self) {
        let _ = self.0.send(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Closed,
    Aborted,
}

/// `OPEN → (CLOSED | ABORTED)` state machine over one in-progress
/// immutable share.
pub struct BucketWriter {
    si: StorageIndex,
    shnum: ShareNumber,
    allocated_size: u64,
    incoming_path: PathBuf,
    final_path: PathBuf,
    share: ImmutableShareFile,
    state: WriterState,
    registry: LiveWriters,
    active: Arc<AtomicBool>,
}

impl BucketWriter {
    /// Creates the backing sparse file in the `incoming/` subdirectory and
    /// registers a background task that aborts this writer the moment
    /// `canary` signals loss.
    pub fn create(
        si: StorageIndex,
        shnum: ShareNumber,
        allocated_size: u64,
        incoming_path: PathBuf,
        final_path: PathBuf,
        registry: LiveWriters,
        canary: Canary,
    ) -> Result<Self> {
        if let Some(parent) = incoming_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let share = ImmutableShareFile::create(&incoming_path, allocated_size)?;
        let active = Arc::new(AtomicBool::new(true));

        let watcher_active = Arc::clone(&active);
        let watcher_registry = Arc::clone(&registry);
        let watcher_path = incoming_path.clone();
        tokio::spawn(async move {
            canary.wait_lost().await;
            if watcher_active.swap(false, Ordering::SeqCst) {
                let _ = tokio::fs::remove_file(&watcher_path).await;
                let mut reg = watcher_registry.lock().await;
                if let Some(set) = reg.get_mut(&si) {
                    set.remove(&shnum);
                    if set.is_empty() {
                        reg.remove(&si);
                    }
                }
                log::info!("bucket writer for {si}/{shnum} aborted: canary lost");
            }
        });

        Ok(Self {
            si,
            shnum,
            allocated_size,
            incoming_path,
            final_path,
            share,
            state: WriterState::Open,
            registry,
            active,
        })
    }

    pub fn storage_index(&self) -> StorageIndex {
        self.si
    }

    pub fn shnum(&self) -> ShareNumber {
        self.shnum
    }

    fn require_open(&self) -> Result<()> {
        if self.state != WriterState::Open {
            return Err(ServerError::UnknownWriter {
                si: self.si,
                shnum: self.shnum,
            });
        }
        if !self.active.load(Ordering::SeqCst) {
            return Err(ServerError::UnknownWriter {
                si: self.si,
                shnum: self.shnum,
            });
        }
        Ok(())
    }

    /// A zero-length write is accepted and is a no-op (spec.md §8).
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.require_open()?;
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > self.allocated_size) {
            return Err(ServerError::DataTooLarge {
                offset,
                len: data.len() as u64,
                allocated: self.allocated_size,
            });
        }
        self.share.write(offset, data)?;
        Ok(())
    }

    /// Installs the lease table, fsyncs, and atomically renames the file
    /// out of `incoming/` into the finalized shares directory. Drops this
    /// writer from the live-writers registry.
    ///
    /// The normal `allocate_buckets` admission path never lets two writers
    /// race for the same (SI, shnum) (spec.md §4.D), but a share can also
    /// have been finalized out-of-band between this writer's allocation and
    /// its close. If so, and its bytes differ from what this writer holds,
    /// this is `ConflictingWriteError` (spec.md §7) rather than a silent
    /// overwrite.
    pub async fn close(&mut self, lease: LeaseRecord) -> Result<()> {
        self.require_open()?;
        self.active.store(false, Ordering::SeqCst);

        if self.final_path.is_file() {
            let existing = ImmutableShareFile::open(&self.final_path, self.si)?;
            let existing_data = existing.read(0, existing.data_length())?;
            let our_data = self.share.read(0, self.share.data_length())?;
            if existing_data != our_data {
                let _ = tokio::fs::remove_file(&self.incoming_path).await;
                self.state = WriterState::Aborted;
                self.deregister().await;
                return Err(ServerError::ConflictingWrite {
                    si: self.si,
                    shnum: self.shnum,
                });
            }
        }

        self.share.finalize(&[lease])?;
        if let Some(parent) = self.final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&self.incoming_path, &self.final_path).await?;
        self.state = WriterState::Closed;
        self.deregister().await;
        Ok(())
    }

    /// Discards the backing file. Also invoked automatically by the
    /// canary-loss watcher spawned in [`Self::create`].
    pub async fn abort(&mut self) -> Result<()> {
        self.require_open()?;
        self.active.store(false, Ordering::SeqCst);
        let _ = tokio::fs::remove_file(&self.incoming_path).await;
        self.state = WriterState::Aborted;
        self.deregister().await;
        Ok(())
    }

    async fn deregister(&self) {
        let mut reg = self.registry.lock().await;
        if let Some(set) = reg.get_mut(&self.si) {
            set.remove(&self.shnum);
            if set.is_empty() {
                reg.remove(&self.si);
            }
        }
    }
}

/// Read-only handle onto a finalized immutable share.
pub struct BucketReader {
    si: StorageIndex,
    shnum: ShareNumber,
    share: ImmutableShareFile,
}

impl BucketReader {
    pub fn open(si: StorageIndex, shnum: ShareNumber, share: ImmutableShareFile) -> Self {
        Self { si, shnum, share }
    }

    pub fn storage_index(&self) -> StorageIndex {
        self.si
    }

    pub fn shnum(&self) -> ShareNumber {
        self.shnum
    }

    /// Truncates at end-of-data rather than erroring (the
    /// `tolerates-immutable-read-overrun` behavior advertised by
    /// `get_version`).
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        Ok(self.share.read(offset, length)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn registry() -> LiveWriters {
        Arc::new(AsyncMutex::new(HashMap::new()))
    }

    #[tokio::test]
    async fn write_close_then_read() {
        let dir = tempdir().unwrap();
        let si = StorageIndex::new([1u8; 16]);
        let incoming = dir.path().join("incoming").join("0");
        let final_path = dir.path().join("final").join("0");
        let (canary, _handle) = Canary::new();
        let reg = registry();
        reg.lock().await.entry(si).or_default().insert(0);

        let mut writer = BucketWriter::create(si, 0, 5, incoming, final_path.clone(), reg, canary).unwrap();
        writer.write(0, b"hello").unwrap();
        writer
            .close(LeaseRecord::new(
                0,
                storage_types::RenewSecret::new([1u8; 32]),
                storage_types::CancelSecret::new([2u8; 32]),
                1000,
            ))
            .await
            .unwrap();

        let share = ImmutableShareFile::open(&final_path, si).unwrap();
        let reader = BucketReader::open(si, 0, share);
        assert_eq!(reader.read(0, 5).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn write_past_allocation_is_rejected() {
        let dir = tempdir().unwrap();
        let si = StorageIndex::new([2u8; 16]);
        let incoming = dir.path().join("incoming").join("0");
        let final_path = dir.path().join("final").join("0");
        let (canary, _handle) = Canary::new();
        let writer = BucketWriter::create(si, 0, 4, incoming, final_path, registry(), canary).unwrap();
        let err = writer.write(0, b"toolong").unwrap_err();
        assert!(matches!(err, ServerError::DataTooLarge { .. }));
    }

    #[tokio::test]
    async fn canary_loss_aborts_writer_and_removes_file() {
        let dir = tempdir().unwrap();
        let si = StorageIndex::new([3u8; 16]);
        let incoming = dir.path().join("incoming").join("0");
        let final_path = dir.path().join("final").join("0");
        let (canary, handle) = Canary::new();
        let reg = registry();
        reg.lock().await.entry(si).or_default().insert(0);
        let writer = BucketWriter::create(si, 0, 4, incoming.clone(), final_path, Arc::clone(&reg), canary).unwrap();

        handle.signal_lost();
        // Give the spawned watcher a chance to run.
        for _ in 0..100 {
            if !incoming.exists() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!incoming.exists());
        assert!(reg.lock().await.get(&si).is_none());
        drop(writer);
    }

    #[tokio::test]
    async fn closing_over_a_differing_finalized_share_is_a_conflict() {
        let dir = tempdir().unwrap();
        let si = StorageIndex::new([4u8; 16]);
        let final_path = dir.path().join("final").join("0");
        std::fs::create_dir_all(final_path.parent().unwrap()).unwrap();
        let existing = ImmutableShareFile::create(&final_path, 5).unwrap();
        existing.write(0, b"world").unwrap();
        drop(existing);

        let incoming = dir.path().join("incoming").join("0");
        let (canary, _handle) = Canary::new();
        let mut writer = BucketWriter::create(si, 0, 5, incoming, final_path, registry(), canary).unwrap();
        writer.write(0, b"hello").unwrap();
        let err = writer
            .close(LeaseRecord::new(
                0,
                storage_types::RenewSecret::new([1u8; 32]),
                storage_types::CancelSecret::new([2u8; 32]),
                1000,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::ConflictingWrite { .. }));
    }
}
