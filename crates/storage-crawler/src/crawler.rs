//! Generic, resumable, time-sliced directory walker (spec.md §4.G,
//! component G).
//!
//! Mirrors the teacher's cooperative-yield style: `run_one_slice` does a
//! bounded amount of work and returns, rather than owning a long-lived
//! task itself; `run_forever` is the thin driver loop a binary calls from
//! its own `tokio::select!` alongside shutdown signals.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use storage_core::StorageServer;
use storage_types::{BASE32_ALPHABET, ShareNumber, StorageIndex};
use tokio::time::Instant;

use crate::error::Result;
use crate::state::{CrawlerHistory, CrawlerState};

pub const DEFAULT_CPU_SLICE: Duration = Duration::from_millis(500);
pub const DEFAULT_MINIMUM_CYCLE_TIME: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SLOW_START: Duration = Duration::from_secs(0);

/// Number of two-character base32 prefixes the bucket keyspace is sharded
/// into (32 symbols × 32 symbols, spec.md §3.5).
pub const PREFIX_COUNT: usize = 1024;

/// Per-bucket callback a crawler subclass implements (spec.md §4.G
/// "per-bucket callback"). `shnums` is the sorted set of share numbers
/// present in `bucket_dir`. Implementations should not panic; anything
/// that would be an error is logged by the crawler and does not abort the
/// cycle (spec.md §4.G step "raised exceptions ... do not abort the
/// cycle"), so a `visit_bucket` that wants this behavior should catch its
/// own errors and return `Ok(())`.
pub trait BucketVisitor: Send {
    fn visit_bucket(&mut self, si: StorageIndex, shnums: &[ShareNumber], bucket_dir: &Path) -> Result<()>;

    /// Called once a full cycle (all 1,024 prefixes) completes. Returns the
    /// JSON summary the crawler appends to its history file.
    fn finish_cycle(&mut self, cycle: u64, cycle_start_time: u32) -> serde_json::Value;
}

/// The fixed, stable ordering prefixes are visited in. A splitmix64-seeded
/// Fisher-Yates shuffle of the 1,024 two-character prefixes — there's no
/// operational requirement for the permutation to match any particular
/// historical implementation, only that it be stable across process
/// restarts and not simply lexicographic (spec.md §3.5: "a stable
/// permutation"). Computed once and reused for the life of the crawler
/// (`SPEC_FULL.md` §3.1a).
pub fn prefix_order() -> Vec<String> {
    let alphabet: Vec<char> = BASE32_ALPHABET.chars().collect();
    let mut prefixes = Vec::with_capacity(PREFIX_COUNT);
    for a in &alphabet {
        for b in &alphabet {
            prefixes.push(format!("{a}{b}"));
        }
    }
    debug_assert_eq!(prefixes.len(), PREFIX_COUNT);

    let mut seed: u64 = 0x5EED_D06E_B453_u64;
    for i in (1..prefixes.len()).rev() {
        let r = splitmix64(&mut seed);
        let j = (r % (i as u64 + 1)) as usize;
        prefixes.swap(i, j);
    }
    prefixes
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlerTiming {
    pub cpu_slice: Duration,
    pub minimum_cycle_time: Duration,
    pub slow_start: Duration,
}

impl Default for CrawlerTiming {
    fn default() -> Self {
        Self {
            cpu_slice: DEFAULT_CPU_SLICE,
            minimum_cycle_time: DEFAULT_MINIMUM_CYCLE_TIME,
            slow_start: DEFAULT_SLOW_START,
        }
    }
}

/// One instantiation: a visitor `V`, a fixed prefix order, and its own
/// state/history files on disk.
pub struct ShareCrawler<V: BucketVisitor> {
    server: Arc<StorageServer>,
    state_path: PathBuf,
    history_path: PathBuf,
    prefixes: Vec<String>,
    timing: CrawlerTiming,
    state: CrawlerState,
    history: CrawlerHistory,
    /// Index into `prefixes` of the prefix currently (or next) being
    /// walked. Rebuilt from `state.last_complete_prefix` at construction;
    /// only advances in memory thereafter until persisted at prefix
    /// boundaries (`SPEC_FULL.md` §4.G: per-prefix resumption granularity).
    prefix_cursor: usize,
    /// Buckets within the current prefix already visited this process
    /// run. Not persisted — `last_complete_bucket` in the state file is
    /// diagnostic only; a restart re-walks the whole current prefix.
    buckets_done_this_prefix: usize,
}

impl<V: BucketVisitor> ShareCrawler<V> {
    pub fn new(server: Arc<StorageServer>, state_path: PathBuf, history_path: PathBuf, timing: CrawlerTiming, visitor: V) -> Result<(Self, V)> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp() as u32;
        let state = CrawlerState::load_or_fresh(&state_path, now)?;
        let history = CrawlerHistory::load_or_default(&history_path)?;
        let prefixes = prefix_order();

        let prefix_cursor = match &state.last_complete_prefix {
            Some(p) => match prefixes.iter().position(|x| x == p) {
                Some(idx) => (idx + 1) % prefixes.len(),
                None => 0,
            },
            None => 0,
        };

        Ok((
            Self {
                server,
                state_path,
                history_path,
                prefixes,
                timing,
                state,
                history,
                prefix_cursor,
                buckets_done_this_prefix: 0,
            },
            visitor,
        ))
    }

    pub fn current_cycle(&self) -> u64 {
        self.state.current_cycle
    }

    pub fn history(&self) -> &CrawlerHistory {
        &self.history
    }

    fn bucket_dirs_in_prefix(&self, prefix: &str) -> Result<Vec<(StorageIndex, PathBuf)>> {
        let dir = self.server.basedir().join("shares").join(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(si) = StorageIndex::from_base32(name) {
                    out.push((si, entry.path()));
                }
            }
        }
        out.sort_by(|a, b| a.0.to_base32().cmp(&b.0.to_base32()));
        Ok(out)
    }

    fn shnums_in_bucket(dir: &Path) -> Result<Vec<ShareNumber>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(n) = name.parse::<u16>() {
                    if n <= u8::MAX as u16 {
                        out.push(n as u8);
                    }
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Runs for up to `timing.cpu_slice`, then returns. Each call processes
    /// whole buckets only (never splits a bucket visit across slices); a
    /// completed cycle persists state, appends history, and returns
    /// `Ok(true)` so the caller can honor `minimum_cycle_time` before the
    /// next activation.
    pub async fn run_one_slice(&mut self, visitor: &mut V) -> Result<bool> {
        let started = Instant::now();
        let mut completed_cycle = false;

        while started.elapsed() < self.timing.cpu_slice {
            if self.prefix_cursor >= self.prefixes.len() {
                self.finish_cycle(visitor)?;
                completed_cycle = true;
                break;
            }

            let prefix = self.prefixes[self.prefix_cursor].clone();
            let buckets = self.bucket_dirs_in_prefix(&prefix)?;

            if self.buckets_done_this_prefix >= buckets.len() {
                self.state.last_complete_prefix = Some(prefix.clone());
                self.state.last_complete_bucket = None;
                self.state.save_atomic(&self.state_path)?;
                self.prefix_cursor += 1;
                self.buckets_done_this_prefix = 0;
                continue;
            }

            let (si, bucket_dir) = buckets[self.buckets_done_this_prefix].clone();
            let shnums = Self::shnums_in_bucket(&bucket_dir)?;

            {
                let _guard = self.server.lock_si(si).await;
                if let Err(e) = visitor.visit_bucket(si, &shnums, &bucket_dir) {
                    log::warn!("crawler: error visiting bucket {si}: {e}");
                }
            }

            self.buckets_done_this_prefix += 1;
            self.state.last_complete_bucket = Some(si.to_base32());
            tokio::task::yield_now().await;
        }

        Ok(completed_cycle)
    }

    fn finish_cycle(&mut self, visitor: &mut V) -> Result<()> {
        let cycle = self.state.current_cycle;
        let summary = visitor.finish_cycle(cycle, self.state.current_cycle_start_time);
        self.history.record(cycle, summary);
        self.history.save_atomic(&self.history_path)?;

        let now = time::OffsetDateTime::now_utc().unix_timestamp() as u32;
        self.state.last_cycle_finished = Some(now);
        self.state.current_cycle += 1;
        self.state.current_cycle_start_time = now;
        self.state.last_complete_prefix = None;
        self.state.last_complete_bucket = None;
        self.state.save_atomic(&self.state_path)?;

        self.prefix_cursor = 0;
        self.buckets_done_this_prefix = 0;
        Ok(())
    }

    /// Drives the crawler indefinitely: `slow_start` delay once at boot,
    /// then repeated `run_one_slice` activations separated by
    /// `minimum_cycle_time` whenever a cycle just completed, and by nothing
    /// (immediate re-arm) mid-cycle. Intended to be raced against a
    /// shutdown signal by the caller (`tokio::select!`), since this never
    /// returns on its own.
    pub async fn run_forever(&mut self, visitor: &mut V) -> Result<()> {
        tokio::time::sleep(self.timing.slow_start).await;
        loop {
            let cycle_completed = self.run_one_slice(visitor).await?;
            if cycle_completed {
                tokio::time::sleep(self.timing.minimum_cycle_time).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn prefix_order_visits_every_prefix_exactly_once() {
        let order = prefix_order();
        assert_eq!(order.len(), PREFIX_COUNT);
        let unique: HashSet<_> = order.iter().collect();
        assert_eq!(unique.len(), PREFIX_COUNT);
    }

    #[test]
    fn prefix_order_is_deterministic_across_calls() {
        assert_eq!(prefix_order(), prefix_order());
    }

    #[test]
    fn prefix_order_is_not_lexicographic() {
        let order = prefix_order();
        let mut sorted = order.clone();
        sorted.sort();
        assert_ne!(order, sorted);
    }
}
