//! LRU eviction manager (C8): demotes cold `Both`-state entries to
//! `ExternalOnly` under LOCAL free-space pressure, and the inverse
//! `prefetch` path that pulls an `ExternalOnly` entry back down to LOCAL.
//!
//! Candidate selection and the demotion sequence are a plain in-memory
//! filter+sort over one [`overlayfs_index::FileIndex::list`] call per pass
//! -- the same merge-scan shape the index itself uses internally, and
//! acceptable at the LOCAL-cache scale this system targets.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use overlayfs_config::EvictionConfig;
use overlayfs_index::{FileEntry, FileIndex, IndexError, Location, LockState};
use overlayfs_state::StateSets;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum EvictError {
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("entry is not eligible for eviction: {0}")]
    NotEligible(String),
    #[error("failed to delete local copy: {0}")]
    DeleteFailed(#[from] std::io::Error),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

pub type Result<T> = std::result::Result<T, EvictError>;

/// Stats maintained per manager, mirroring the control-plane diagnostics
/// surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictionStats {
    pub evicted_count: u64,
    pub evicted_size: u64,
    pub last_eviction_time: Option<SystemTime>,
    pub skipped_dirty: u64,
    pub skipped_locked: u64,
    pub failed_sync: u64,
}

/// Implemented by the sync collaborator: requests an upload of a
/// `LocalOnly` entry so it becomes eligible for eviction on a later pass.
/// Never evict unsynced data, so a `LocalOnly` candidate is deferred here
/// instead of demoted.
pub trait SyncRequester: Send + Sync {
    fn request_sync(&self, pair: &str, vp: &str);
}

pub struct EvictionManager {
    config: EvictionConfig,
    stats: Mutex<EvictionStats>,
    /// `"{pair}:{virtual_path}"` keys already counted into `failed_sync` on
    /// a prior pass, so a `LocalOnly` candidate still waiting on its sync is
    /// counted once, not once per tick until it syncs.
    pending_sync: Mutex<HashSet<String>>,
}

impl EvictionManager {
    pub fn new(config: EvictionConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(EvictionStats::default()),
            pending_sync: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    pub fn stats(&self) -> EvictionStats {
        self.stats.lock().unwrap().clone()
    }

    fn is_old_enough(&self, entry: &FileEntry, now: SystemTime) -> bool {
        let min_age = Duration::from_secs(self.config.min_file_age_secs);
        now.duration_since(entry.accessed_at)
            .map(|age| age >= min_age)
            .unwrap_or(false)
    }

    /// `location=Both ∧ ¬is_dirty ∧ ¬is_locked ∧ age ≥ min_file_age`,
    /// ordered by `accessed_at` ascending (coldest first).
    fn select_candidates(&self, index: &FileIndex, pair: &str, now: SystemTime) -> Result<Vec<FileEntry>> {
        let mut candidates: Vec<FileEntry> = index
            .list(pair)?
            .into_iter()
            .filter(|e| {
                e.location == Location::Both
                    && !e.is_dirty
                    && e.lock_state == LockState::Unlocked
                    && self.is_old_enough(e, now)
            })
            .collect();
        candidates.sort_by_key(|e| e.accessed_at);
        Ok(candidates)
    }

    /// `LocalOnly` entries old enough to be eviction candidates except that
    /// they have never reached EXTERNAL -- these get a sync request instead
    /// of a demotion.
    fn select_local_only_pending_sync(
        &self,
        index: &FileIndex,
        pair: &str,
        now: SystemTime,
    ) -> Result<Vec<FileEntry>> {
        Ok(index
            .list(pair)?
            .into_iter()
            .filter(|e| e.location == Location::LocalOnly && self.is_old_enough(e, now))
            .collect())
    }

    /// Runs one eviction pass for `pair`: walks candidates coldest-first,
    /// demoting each to `ExternalOnly` until free space under `local_dir`
    /// reaches `target_free_bytes` or `max_files_per_run` is hit. Returns
    /// the number of entries actually evicted.
    pub fn run_pass(
        &self,
        index: &FileIndex,
        state: &StateSets,
        sync: &dyn SyncRequester,
        pair: &str,
        local_dir: &Path,
    ) -> Result<usize> {
        let now = SystemTime::now();

        let pending_sync_entries = self.select_local_only_pending_sync(index, pair, now)?;
        if !pending_sync_entries.is_empty() {
            let prefix = format!("{pair}:");
            let mut tracked = self.pending_sync.lock().unwrap();
            let mut still_pending = Vec::with_capacity(pending_sync_entries.len());
            let mut newly_counted = 0u64;
            for entry in &pending_sync_entries {
                let key = format!("{prefix}{}", entry.virtual_path);
                if !tracked.contains(&key) {
                    newly_counted += 1;
                }
                still_pending.push(key);
            }
            tracked.retain(|k| !k.starts_with(&prefix));
            tracked.extend(still_pending);
            drop(tracked);
            if newly_counted > 0 {
                self.stats.lock().unwrap().failed_sync += newly_counted;
            }
        }
        for pending in &pending_sync_entries {
            sync.request_sync(pair, &pending.virtual_path);
        }

        let candidates = self.select_candidates(index, pair, now)?;
        let mut evicted_this_pass = 0usize;

        for candidate in candidates {
            if evicted_this_pass >= self.config.max_files_per_run {
                break;
            }
            if let Ok(free) = free_space_bytes(local_dir) {
                if free >= self.config.target_free_bytes {
                    break;
                }
            }
            if self.evict_one(index, state, &candidate).is_ok() {
                evicted_this_pass += 1;
            }
        }
        Ok(evicted_this_pass)
    }

    /// Insert into `evicting`, delete LOCAL, flip `Both → ExternalOnly`,
    /// remove from `evicting`. If the LOCAL delete fails, the entry is left
    /// untouched and the failure is returned to the caller to log.
    fn evict_one(&self, index: &FileIndex, state: &StateSets, candidate: &FileEntry) -> Result<()> {
        let vp = candidate.virtual_path.clone();
        state.evicting.add(&vp);

        let outcome = (|| -> Result<()> {
            let local_path = candidate
                .local_path
                .as_ref()
                .ok_or_else(|| EvictError::NotEligible(vp.clone()))?;
            std::fs::remove_file(local_path)?;
            index.demote_to_external(&candidate.sync_pair_id, &vp)?;
            Ok(())
        })();

        state.evicting.remove(&vp);

        match &outcome {
            Ok(()) => {
                let mut stats = self.stats.lock().unwrap();
                stats.evicted_count += 1;
                stats.evicted_size += candidate.size;
                stats.last_eviction_time = Some(SystemTime::now());
            }
            Err(e) => {
                tracing::warn!(
                    component = "EVICT",
                    path = %vp,
                    error = %e,
                    "local delete failed during eviction, entry left untouched"
                );
            }
        }
        outcome
    }

    /// Explicit single-path eviction: validates the same preconditions as
    /// the automatic pass.
    pub fn evict(&self, index: &FileIndex, state: &StateSets, pair: &str, vp: &str) -> Result<()> {
        let entry = index
            .get(pair, vp)?
            .ok_or_else(|| EvictError::NotFound(vp.to_string()))?;

        if entry.location != Location::Both {
            return Err(EvictError::NotEligible(vp.to_string()));
        }
        if entry.is_dirty {
            self.stats.lock().unwrap().skipped_dirty += 1;
            return Err(EvictError::NotEligible(vp.to_string()));
        }
        if entry.lock_state != LockState::Unlocked {
            self.stats.lock().unwrap().skipped_locked += 1;
            return Err(EvictError::NotEligible(vp.to_string()));
        }
        self.evict_one(index, state, &entry)
    }

    /// EXTERNAL → LOCAL copy with parent-dir creation; no-op if the entry
    /// is already available on LOCAL.
    pub fn prefetch(&self, index: &FileIndex, pair: &str, vp: &str, local_root: &Path) -> Result<()> {
        let entry = index
            .get(pair, vp)?
            .ok_or_else(|| EvictError::NotFound(vp.to_string()))?;

        if matches!(entry.location, Location::Both | Location::LocalOnly) {
            return Ok(());
        }
        let external_path = entry
            .external_path
            .clone()
            .ok_or_else(|| EvictError::NotEligible(vp.to_string()))?;

        let local_path = local_root.join(entry.virtual_path.trim_start_matches('/'));
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&external_path, &local_path)?;
        index.promote_to_local(pair, vp, local_path.to_string_lossy().to_string())?;
        Ok(())
    }
}

fn free_space_bytes(path: &Path) -> nix::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlayfs_index::FileIndex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NoopSync;
    impl SyncRequester for NoopSync {
        fn request_sync(&self, _pair: &str, _vp: &str) {}
    }

    struct CountingSync {
        requests: AtomicUsize,
    }
    impl SyncRequester for CountingSync {
        fn request_sync(&self, _pair: &str, _vp: &str) {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn old_entry(pair: &str, vp: &str, local: &Path, external: &Path) -> FileEntry {
        let stale = SystemTime::now() - Duration::from_secs(7200);
        FileEntry {
            sync_pair_id: pair.to_string(),
            virtual_path: vp.to_string(),
            local_path: Some(local.join(vp.trim_start_matches('/')).to_string_lossy().to_string()),
            external_path: Some(
                external
                    .join(vp.trim_start_matches('/'))
                    .to_string_lossy()
                    .to_string(),
            ),
            size: 10,
            modified_at: stale,
            created_at: stale,
            accessed_at: stale,
            is_directory: false,
            is_dirty: false,
            lock_state: LockState::Unlocked,
            location: Location::Both,
        }
    }

    fn config_for_test() -> EvictionConfig {
        let mut cfg = EvictionConfig::default();
        cfg.min_file_age_secs = 60;
        cfg.target_free_bytes = u64::MAX; // force eviction regardless of real free space
        cfg.max_files_per_run = 10;
        cfg
    }

    #[test]
    fn run_pass_evicts_cold_both_entries() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("local");
        let external = tmp.path().join("external");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&external).unwrap();
        std::fs::write(local.join("a.txt"), b"hello").unwrap();
        std::fs::write(external.join("a.txt"), b"hello").unwrap();

        let index = FileIndex::open(tmp.path().join("idx")).unwrap();
        index.batch_upsert(vec![old_entry("p1", "/a.txt", &local, &external)]);
        index.commit().unwrap();

        let manager = EvictionManager::new(config_for_test());
        let state = StateSets::default();
        let evicted = manager
            .run_pass(&index, &state, &NoopSync, "p1", &local)
            .unwrap();

        assert_eq!(evicted, 1);
        assert!(!local.join("a.txt").exists());
        let entry = index.get("p1", "/a.txt").unwrap().unwrap();
        assert_eq!(entry.location, Location::ExternalOnly);
        assert_eq!(manager.stats().evicted_count, 1);
    }

    #[test]
    fn run_pass_skips_dirty_and_locked_entries() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("local");
        let external = tmp.path().join("external");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&external).unwrap();
        std::fs::write(local.join("dirty.txt"), b"x").unwrap();
        std::fs::write(local.join("locked.txt"), b"x").unwrap();

        let index = FileIndex::open(tmp.path().join("idx")).unwrap();
        let mut dirty = old_entry("p1", "/dirty.txt", &local, &external);
        dirty.is_dirty = true;
        let mut locked = old_entry("p1", "/locked.txt", &local, &external);
        locked.lock_state = LockState::Locked;
        index.batch_upsert(vec![dirty, locked]);
        index.commit().unwrap();

        let manager = EvictionManager::new(config_for_test());
        let state = StateSets::default();
        let evicted = manager
            .run_pass(&index, &state, &NoopSync, "p1", &local)
            .unwrap();

        assert_eq!(evicted, 0);
        assert!(local.join("dirty.txt").exists());
        assert!(local.join("locked.txt").exists());
    }

    #[test]
    fn run_pass_requests_sync_for_local_only_instead_of_evicting() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("local");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("unsynced.txt"), b"x").unwrap();

        let index = FileIndex::open(tmp.path().join("idx")).unwrap();
        let mut entry = old_entry("p1", "/unsynced.txt", &local, &local);
        entry.location = Location::LocalOnly;
        entry.external_path = None;
        index.batch_upsert(vec![entry]);
        index.commit().unwrap();

        let manager = EvictionManager::new(config_for_test());
        let state = StateSets::default();
        let sync = CountingSync {
            requests: AtomicUsize::new(0),
        };
        let evicted = manager.run_pass(&index, &state, &sync, "p1", &local).unwrap();

        assert_eq!(evicted, 0);
        assert_eq!(sync.requests.load(Ordering::Relaxed), 1);
        assert!(local.join("unsynced.txt").exists());
        assert_eq!(manager.stats().failed_sync, 1);
    }

    #[test]
    fn run_pass_does_not_recount_failed_sync_across_passes() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("local");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(local.join("unsynced.txt"), b"x").unwrap();

        let index = FileIndex::open(tmp.path().join("idx")).unwrap();
        let mut entry = old_entry("p1", "/unsynced.txt", &local, &local);
        entry.location = Location::LocalOnly;
        entry.external_path = None;
        index.batch_upsert(vec![entry]);
        index.commit().unwrap();

        let manager = EvictionManager::new(config_for_test());
        let state = StateSets::default();
        let sync = CountingSync {
            requests: AtomicUsize::new(0),
        };

        manager.run_pass(&index, &state, &sync, "p1", &local).unwrap();
        manager.run_pass(&index, &state, &sync, "p1", &local).unwrap();
        manager.run_pass(&index, &state, &sync, "p1", &local).unwrap();

        assert_eq!(sync.requests.load(Ordering::Relaxed), 3);
        assert_eq!(manager.stats().failed_sync, 1);
    }

    #[test]
    fn evict_rejects_local_only_entry() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("local");
        std::fs::create_dir_all(&local).unwrap();

        let index = FileIndex::open(tmp.path().join("idx")).unwrap();
        let mut entry = old_entry("p1", "/a.txt", &local, &local);
        entry.location = Location::LocalOnly;
        entry.external_path = None;
        index.batch_upsert(vec![entry]);
        index.commit().unwrap();

        let manager = EvictionManager::new(config_for_test());
        let state = StateSets::default();
        let err = manager.evict(&index, &state, "p1", "/a.txt").unwrap_err();
        assert!(matches!(err, EvictError::NotEligible(_)));
    }

    #[test]
    fn prefetch_copies_external_to_local_and_promotes() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("local");
        let external = tmp.path().join("external");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&external).unwrap();
        std::fs::write(external.join("only.txt"), b"remote-data").unwrap();

        let index = FileIndex::open(tmp.path().join("idx")).unwrap();
        let entry = FileEntry {
            sync_pair_id: "p1".to_string(),
            virtual_path: "/only.txt".to_string(),
            local_path: None,
            external_path: Some(external.join("only.txt").to_string_lossy().to_string()),
            size: 11,
            modified_at: SystemTime::now(),
            created_at: SystemTime::now(),
            accessed_at: SystemTime::now(),
            is_directory: false,
            is_dirty: false,
            lock_state: LockState::Unlocked,
            location: Location::ExternalOnly,
        };
        index.batch_upsert(vec![entry]);
        index.commit().unwrap();

        let manager = EvictionManager::new(config_for_test());
        manager.prefetch(&index, "p1", "/only.txt", &local).unwrap();

        assert!(local.join("only.txt").exists());
        let got = index.get("p1", "/only.txt").unwrap().unwrap();
        assert_eq!(got.location, Location::Both);
    }

    #[test]
    fn prefetch_is_noop_when_already_local() {
        let tmp = TempDir::new().unwrap();
        let local = tmp.path().join("local");
        let external = tmp.path().join("external");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::create_dir_all(&external).unwrap();

        let index = FileIndex::open(tmp.path().join("idx")).unwrap();
        index.batch_upsert(vec![old_entry("p1", "/a.txt", &local, &external)]);
        index.commit().unwrap();

        let manager = EvictionManager::new(config_for_test());
        // Should not touch the filesystem or error even though the
        // external file doesn't actually exist on disk.
        manager.prefetch(&index, "p1", "/a.txt", &local).unwrap();
    }
}
