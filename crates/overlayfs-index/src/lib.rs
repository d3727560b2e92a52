//! Persistent file-state index (C3): a transactional, idempotent map from
//! `(sync_pair_id, virtual_path)` to [`FileEntry`], backed by LMDB with a
//! `DashMap` delta layer so hot writers never take an LMDB write
//! transaction on the synchronous path.
//!
//! Grounded directly on the manifest's own base+delta split, generalized
//! from content-hash identity to sync-pair/virtual-path identity.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use heed::types::{Bytes, SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub mod build;

pub type SyncPairId = String;
pub type KeyHash = [u8; 32];

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("lmdb error: {0}")]
    Heed(#[from] heed::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("entry not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    LocalOnly,
    ExternalOnly,
    Both,
    NotExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// The indexed unit. Identity is `(sync_pair_id, virtual_path)`, carried
/// alongside the entry rather than only in the key, so callers working off
/// `list`/`iter` results don't need a second lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub sync_pair_id: SyncPairId,
    pub virtual_path: String,
    pub local_path: Option<String>,
    pub external_path: Option<String>,
    pub size: u64,
    pub modified_at: SystemTime,
    pub created_at: SystemTime,
    pub accessed_at: SystemTime,
    pub is_directory: bool,
    pub is_dirty: bool,
    pub lock_state: LockState,
    pub location: Location,
}

impl FileEntry {
    pub fn new_directory(pair: &str, vp: &str) -> Self {
        let now = SystemTime::now();
        Self {
            sync_pair_id: pair.to_string(),
            virtual_path: vp.to_string(),
            local_path: None,
            external_path: None,
            size: 0,
            modified_at: now,
            created_at: now,
            accessed_at: now,
            is_directory: true,
            is_dirty: false,
            lock_state: LockState::Unlocked,
            location: Location::NotExists,
        }
    }

    /// Invariants of §3: a `location` tag must agree with which paths are
    /// actually set.
    pub fn check_invariants(&self) -> bool {
        match self.location {
            Location::LocalOnly => self.local_path.is_some() && self.external_path.is_none(),
            Location::ExternalOnly => self.external_path.is_some() && self.local_path.is_none(),
            Location::Both => self.local_path.is_some() && self.external_path.is_some(),
            Location::NotExists => true,
        }
    }
}

fn key_hash(pair: &str, virtual_path: &str) -> KeyHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(pair.as_bytes());
    hasher.update(b"\0");
    hasher.update(virtual_path.as_bytes());
    *hasher.finalize().as_bytes()
}

fn compound_key(pair: &str, virtual_path: &str) -> String {
    format!("{pair}\0{virtual_path}")
}

#[derive(Debug, Clone)]
enum DeltaEntry {
    Modified(FileEntry),
    Deleted,
}

/// LMDB-backed index with a `DashMap` delta layer.
pub struct FileIndex {
    env: Env,
    entries_db: Database<Bytes, SerdeBincode<FileEntry>>,
    keys_db: Database<Bytes, Str>,
    delta: Arc<DashMap<KeyHash, DeltaEntry>>,
    delta_keys: Arc<DashMap<KeyHash, String>>,
}

impl FileIndex {
    const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
    const MAX_READERS: u32 = 128;

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::DEFAULT_MAP_SIZE)
                .max_readers(Self::MAX_READERS)
                .max_dbs(2)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let entries_db = env.create_database(&mut wtxn, Some("entries"))?;
        let keys_db = env.create_database(&mut wtxn, Some("keys"))?;
        wtxn.commit()?;

        debug!(path = %path.display(), "opened file index");

        Ok(Self {
            env,
            entries_db,
            keys_db,
            delta: Arc::new(DashMap::new()),
            delta_keys: Arc::new(DashMap::new()),
        })
    }

    fn get_inner(&self, pair: &str, vp: &str) -> Result<Option<FileEntry>> {
        let hash = key_hash(pair, vp);
        if let Some(d) = self.delta.get(&hash) {
            return Ok(match d.value() {
                DeltaEntry::Modified(e) => Some(e.clone()),
                DeltaEntry::Deleted => None,
            });
        }
        let rtxn = self.env.read_txn()?;
        Ok(self.entries_db.get(&rtxn, &hash)?)
    }

    pub fn get(&self, pair: &str, vp: &str) -> Result<Option<FileEntry>> {
        self.get_inner(pair, vp)
    }

    /// Upserts entries into the delta layer. Idempotent: re-upserting the
    /// same key overwrites it, it does not accumulate.
    pub fn batch_upsert(&self, entries: Vec<FileEntry>) {
        for entry in entries {
            let hash = key_hash(&entry.sync_pair_id, &entry.virtual_path);
            let key = compound_key(&entry.sync_pair_id, &entry.virtual_path);
            self.delta.insert(hash, DeltaEntry::Modified(entry));
            self.delta_keys.insert(hash, key);
        }
    }

    /// Whiteouts entries: a subsequent `get` returns `None` until the
    /// next write re-introduces the key, even if the base layer still
    /// holds a stale copy until `commit`.
    pub fn batch_remove(&self, pairs_and_paths: &[(String, String)]) {
        for (pair, vp) in pairs_and_paths {
            let hash = key_hash(pair, vp);
            self.delta.insert(hash, DeltaEntry::Deleted);
            self.delta_keys.remove(&hash);
        }
    }

    pub fn mark_dirty(&self, pair: &str, vp: &str, dirty: bool) -> Result<()> {
        match self.get_inner(pair, vp)? {
            Some(mut entry) => {
                entry.is_dirty = dirty;
                self.batch_upsert(vec![entry]);
                Ok(())
            }
            None => Err(IndexError::NotFound(vp.to_string())),
        }
    }

    pub fn touch_access(&self, pair: &str, vp: &str) -> Result<()> {
        match self.get_inner(pair, vp)? {
            Some(mut entry) => {
                entry.accessed_at = SystemTime::now();
                self.batch_upsert(vec![entry]);
                Ok(())
            }
            None => Err(IndexError::NotFound(vp.to_string())),
        }
    }

    pub fn set_lock_state(&self, pair: &str, vp: &str, state: LockState) -> Result<()> {
        match self.get_inner(pair, vp)? {
            Some(mut entry) => {
                entry.lock_state = state;
                self.batch_upsert(vec![entry]);
                Ok(())
            }
            None => Err(IndexError::NotFound(vp.to_string())),
        }
    }

    /// Flips a `Both` entry to `ExternalOnly` after the eviction manager has
    /// deleted its LOCAL copy. No-op on entries that are already
    /// `ExternalOnly`; errors if the entry has no EXTERNAL path to fall
    /// back to.
    pub fn demote_to_external(&self, pair: &str, vp: &str) -> Result<()> {
        match self.get_inner(pair, vp)? {
            Some(mut entry) => {
                if entry.external_path.is_none() {
                    return Err(IndexError::NotFound(format!(
                        "{vp}: no external path to demote to"
                    )));
                }
                entry.local_path = None;
                entry.location = Location::ExternalOnly;
                self.batch_upsert(vec![entry]);
                Ok(())
            }
            None => Err(IndexError::NotFound(vp.to_string())),
        }
    }

    /// Flips an `ExternalOnly` entry to `Both` after a prefetch has copied
    /// it down to LOCAL.
    pub fn promote_to_local(&self, pair: &str, vp: &str, local_path: String) -> Result<()> {
        match self.get_inner(pair, vp)? {
            Some(mut entry) => {
                entry.local_path = Some(local_path);
                entry.location = Location::Both;
                self.batch_upsert(vec![entry]);
                Ok(())
            }
            None => Err(IndexError::NotFound(vp.to_string())),
        }
    }

    /// Removes every entry belonging to `pair`, base and delta alike.
    pub fn clear(&self, pair: &str) -> Result<()> {
        let all = self.list(pair)?;
        let removals: Vec<(String, String)> = all
            .into_iter()
            .map(|e| (e.sync_pair_id, e.virtual_path))
            .collect();
        self.batch_remove(&removals);
        self.commit()
    }

    /// Commits the delta layer into the base layer in one write
    /// transaction, then clears the delta.
    pub fn commit(&self) -> Result<()> {
        if self.delta.is_empty() {
            return Ok(());
        }
        let mut wtxn = self.env.write_txn()?;
        for entry in self.delta.iter() {
            let hash = entry.key();
            match entry.value() {
                DeltaEntry::Modified(file_entry) => {
                    self.entries_db.put(&mut wtxn, hash, file_entry)?;
                    if let Some(key_ref) = self.delta_keys.get(hash) {
                        self.keys_db.put(&mut wtxn, hash, key_ref.value())?;
                    }
                }
                DeltaEntry::Deleted => {
                    self.entries_db.delete(&mut wtxn, hash)?;
                    self.keys_db.delete(&mut wtxn, hash)?;
                }
            }
        }
        wtxn.commit()?;
        self.delta.clear();
        self.delta_keys.clear();
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }

    /// All entries for `pair`, merging delta over base.
    pub fn list(&self, pair: &str) -> Result<Vec<FileEntry>> {
        let prefix = format!("{pair}\0");
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        let mut deleted = std::collections::HashSet::new();

        for d in self.delta.iter() {
            if matches!(d.value(), DeltaEntry::Deleted) {
                deleted.insert(*d.key());
            }
        }
        for d in self.delta.iter() {
            if let DeltaEntry::Modified(entry) = d.value() {
                if entry.sync_pair_id == pair {
                    out.push(entry.clone());
                }
            }
        }

        let mut iter = self.entries_db.iter(&rtxn)?;
        while let Some(Ok((hash_bytes, entry))) = iter.next() {
            let hash: KeyHash = hash_bytes.try_into().unwrap_or([0u8; 32]);
            if self.delta.contains_key(&hash) || deleted.contains(&hash) {
                continue;
            }
            if let Some(key) = self.keys_db.get(&rtxn, &hash)? {
                if key.starts_with(&prefix) {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    pub fn stats(&self, pair: &str) -> Result<IndexStats> {
        let entries = self.list(pair)?;
        let mut stats = IndexStats::default();
        for e in &entries {
            if e.is_directory {
                stats.dir_count += 1;
            } else {
                stats.file_count += 1;
                stats.total_size += e.size;
            }
            if e.is_dirty {
                stats.dirty_count += 1;
            }
            match e.location {
                Location::LocalOnly => stats.local_only_count += 1,
                Location::ExternalOnly => stats.external_only_count += 1,
                Location::Both => stats.both_count += 1,
                Location::NotExists => {}
            }
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub file_count: u64,
    pub dir_count: u64,
    pub total_size: u64,
    pub dirty_count: u64,
    pub local_only_count: u64,
    pub external_only_count: u64,
    pub both_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_entry(pair: &str, vp: &str) -> FileEntry {
        FileEntry {
            sync_pair_id: pair.to_string(),
            virtual_path: vp.to_string(),
            local_path: Some(format!("/local{vp}")),
            external_path: None,
            size: 42,
            modified_at: SystemTime::now(),
            created_at: SystemTime::now(),
            accessed_at: SystemTime::now(),
            is_directory: false,
            is_dirty: true,
            lock_state: LockState::Unlocked,
            location: Location::LocalOnly,
        }
    }

    #[test]
    fn upsert_then_get_sees_delta_before_commit() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        idx.batch_upsert(vec![sample_entry("p1", "/a.txt")]);
        let got = idx.get("p1", "/a.txt").unwrap().unwrap();
        assert_eq!(got.size, 42);
        assert!(got.check_invariants());
    }

    #[test]
    fn commit_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        idx.batch_upsert(vec![sample_entry("p1", "/a.txt")]);
        idx.commit().unwrap();
        drop(idx);

        let idx2 = FileIndex::open(tmp.path().join("idx")).unwrap();
        let got = idx2.get("p1", "/a.txt").unwrap().unwrap();
        assert_eq!(got.virtual_path, "/a.txt");
    }

    #[test]
    fn delta_overrides_committed_base() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        idx.batch_upsert(vec![sample_entry("p1", "/a.txt")]);
        idx.commit().unwrap();

        let mut updated = sample_entry("p1", "/a.txt");
        updated.size = 100;
        idx.batch_upsert(vec![updated]);

        let got = idx.get("p1", "/a.txt").unwrap().unwrap();
        assert_eq!(got.size, 100);
    }

    #[test]
    fn remove_whiteouts_a_committed_entry() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        idx.batch_upsert(vec![sample_entry("p1", "/a.txt")]);
        idx.commit().unwrap();

        idx.batch_remove(&[("p1".to_string(), "/a.txt".to_string())]);
        assert!(idx.get("p1", "/a.txt").unwrap().is_none());

        idx.commit().unwrap();
        assert!(idx.get("p1", "/a.txt").unwrap().is_none());
    }

    #[test]
    fn list_merges_delta_and_base_scoped_to_pair() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        idx.batch_upsert(vec![sample_entry("p1", "/a.txt")]);
        idx.commit().unwrap();
        idx.batch_upsert(vec![sample_entry("p1", "/b.txt")]);
        idx.batch_upsert(vec![sample_entry("p2", "/c.txt")]);

        let p1 = idx.list("p1").unwrap();
        assert_eq!(p1.len(), 2);
        let p2 = idx.list("p2").unwrap();
        assert_eq!(p2.len(), 1);
    }

    #[test]
    fn mark_dirty_and_touch_access_update_in_place() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        idx.batch_upsert(vec![sample_entry("p1", "/a.txt")]);
        idx.mark_dirty("p1", "/a.txt", false).unwrap();
        let got = idx.get("p1", "/a.txt").unwrap().unwrap();
        assert!(!got.is_dirty);
    }

    #[test]
    fn demote_to_external_clears_local_path() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        let mut entry = sample_entry("p1", "/a.txt");
        entry.external_path = Some("/external/a.txt".to_string());
        entry.location = Location::Both;
        idx.batch_upsert(vec![entry]);

        idx.demote_to_external("p1", "/a.txt").unwrap();
        let got = idx.get("p1", "/a.txt").unwrap().unwrap();
        assert_eq!(got.location, Location::ExternalOnly);
        assert!(got.local_path.is_none());
    }

    #[test]
    fn promote_to_local_sets_both() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        let mut entry = sample_entry("p1", "/a.txt");
        entry.local_path = None;
        entry.external_path = Some("/external/a.txt".to_string());
        entry.location = Location::ExternalOnly;
        idx.batch_upsert(vec![entry]);

        idx.promote_to_local("p1", "/a.txt", "/local/a.txt".to_string())
            .unwrap();
        let got = idx.get("p1", "/a.txt").unwrap().unwrap();
        assert_eq!(got.location, Location::Both);
        assert_eq!(got.local_path.as_deref(), Some("/local/a.txt"));
    }

    #[test]
    fn stats_counts_by_location_and_dirty() {
        let tmp = TempDir::new().unwrap();
        let idx = FileIndex::open(tmp.path().join("idx")).unwrap();
        idx.batch_upsert(vec![sample_entry("p1", "/a.txt")]);
        let mut dir = FileEntry::new_directory("p1", "/sub");
        dir.location = Location::NotExists;
        idx.batch_upsert(vec![dir]);

        let stats = idx.stats("p1").unwrap();
        assert_eq!(stats.file_count, 1);
        assert_eq!(stats.dir_count, 1);
        assert_eq!(stats.local_only_count, 1);
        assert_eq!(stats.dirty_count, 1);
    }
}
