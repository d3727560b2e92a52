//! `evicting` / `pending_delete` / `syncing` — the three bounded concurrent
//! sets that gate `resolve`, `readdir`, and the write-path callbacks.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashSet;

/// A concurrent string set with a capacity ceiling; once full, the oldest
/// still-present member is evicted to make room for the new one.
pub struct BoundedSet {
    members: DashSet<String>,
    order: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl BoundedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            members: DashSet::new(),
            order: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Inserts `path`. If the set was already at capacity, drops the oldest
    /// member first. Returns the member dropped to make room, if any.
    pub fn add(&self, path: &str) -> Option<String> {
        if self.members.contains(path) {
            return None;
        }
        self.members.insert(path.to_string());
        let mut order = self.order.lock().unwrap();
        order.push_back(path.to_string());

        if order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.members.remove(&oldest);
                return Some(oldest);
            }
        }
        None
    }

    pub fn remove(&self, path: &str) {
        self.members.remove(path);
        let mut order = self.order.lock().unwrap();
        order.retain(|p| p != path);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.members.contains(path)
    }

    pub fn clear(&self) {
        self.members.clear();
        self.order.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Default capacities per spec: `evicting` 256, `pending_delete`/`syncing`
/// 1024.
pub struct StateSets {
    pub evicting: BoundedSet,
    pub pending_delete: BoundedSet,
    pub syncing: BoundedSet,
}

impl Default for StateSets {
    fn default() -> Self {
        Self::new(256, 1024, 1024)
    }
}

impl StateSets {
    pub fn new(evicting_cap: usize, pending_delete_cap: usize, syncing_cap: usize) -> Self {
        Self {
            evicting: BoundedSet::new(evicting_cap),
            pending_delete: BoundedSet::new(pending_delete_cap),
            syncing: BoundedSet::new(syncing_cap),
        }
    }

    pub fn clear_all(&self) {
        self.evicting.clear();
        self.pending_delete.clear();
        self.syncing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_contains_roundtrip() {
        let set = BoundedSet::new(4);
        assert!(set.add("/a.txt").is_none());
        assert!(set.contains("/a.txt"));
        set.remove("/a.txt");
        assert!(!set.contains("/a.txt"));
    }

    #[test]
    fn capacity_evicts_oldest_on_overflow() {
        let set = BoundedSet::new(2);
        set.add("/a");
        set.add("/b");
        let evicted = set.add("/c");
        assert_eq!(evicted, Some("/a".to_string()));
        assert!(!set.contains("/a"));
        assert!(set.contains("/b"));
        assert!(set.contains("/c"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn re_adding_existing_member_is_a_no_op() {
        let set = BoundedSet::new(2);
        set.add("/a");
        set.add("/b");
        assert!(set.add("/a").is_none());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn clear_empties_members_and_order() {
        let sets = StateSets::default();
        sets.evicting.add("/x");
        sets.pending_delete.add("/y");
        sets.syncing.add("/z");
        sets.clear_all();
        assert!(sets.evicting.is_empty());
        assert!(sets.pending_delete.is_empty());
        assert!(sets.syncing.is_empty());
    }
}
