//! # Versioned Map
//!
//! The in-memory multi-version view of this server's data: a persistent
//! copy-on-write ordered map whose entries are either a value or a
//! `ClearTo(end)` marker, decorated with the version at which they were
//! inserted. Every published version keeps an O(1) snapshot of the tree, so
//! reads at any version in the MVCC window walk an immutable view while the
//! update pipeline keeps writing the latest one.
//!
//! Invariants maintained here and by the update pipeline:
//! - no clear overlaps another clear or a set, adjacent clears are merged
//! - for a readable key, engine state at the storage version overlaid with
//!   the view at `v` equals the database at `v`
//! - every entry in the latest view has `insert_version` above the durable
//!   version; older views may keep older entries until they are forgotten

pub mod tree;

use crate::types::{key_after, Key, Value, Version};
use std::collections::VecDeque;
use tree::Tree;

/// A point value or the right-open end of a cleared span
#[derive(Clone, Debug, PartialEq)]
pub enum ValueOrClear {
    Value(Value),
    ClearTo(Key),
}

impl ValueOrClear {
    pub fn is_clear_to(&self) -> bool {
        matches!(self, ValueOrClear::ClearTo(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VEntry {
    pub val: ValueOrClear,
    pub insert_version: Version,
}

pub type View = Tree<VEntry>;

/// Result of resolving one key against a view
#[derive(Clone, Debug, PartialEq)]
pub enum VmRead {
    /// A set at exactly this key
    Value(Value),
    /// A clear covers this key; the engine must not be consulted
    Cleared,
    /// The view says nothing; fall through to the engine
    Missing,
}

/// Resolves `key` in `view`: an exact entry wins, otherwise a clear whose
/// span covers the key, otherwise nothing.
pub fn lookup(view: &View, key: &[u8]) -> VmRead {
    if let Some((entry_key, entry)) = view.last_less_or_equal(key) {
        match &entry.val {
            ValueOrClear::Value(v) if entry_key.as_slice() == key => return VmRead::Value(v.clone()),
            ValueOrClear::ClearTo(end) if end.as_slice() > key => return VmRead::Cleared,
            _ => {}
        }
    }
    VmRead::Missing
}

pub struct VersionedMap {
    /// Ascending by version; the back entry is the live, writable view
    views: VecDeque<(Version, View)>,
}

impl VersionedMap {
    pub fn new(initial_version: Version) -> Self {
        let mut views = VecDeque::new();
        views.push_back((initial_version, Tree::new()));
        Self { views }
    }

    pub fn latest_version(&self) -> Version {
        self.views.back().unwrap().0
    }

    pub fn oldest_version(&self) -> Version {
        self.views.front().unwrap().0
    }

    pub fn latest(&self) -> &View {
        &self.views.back().unwrap().1
    }

    /// Publishes `v` as the new latest view. A no-op when `v` is already
    /// the latest; `v` may never move backwards.
    pub fn create_new_version(&mut self, v: Version) {
        let latest = self.latest_version();
        debug_assert!(v >= latest, "version moved backwards: {} < {}", v, latest);
        if v > latest {
            let snapshot = self.latest().clone();
            self.views.push_back((v, snapshot));
        }
    }

    /// O(log) snapshot at the newest version <= `v`; `None` below the
    /// oldest retained view
    pub fn at(&self, v: Version) -> Option<View> {
        let idx = self.views.partition_point(|(ver, _)| *ver <= v);
        idx.checked_sub(1).map(|i| self.views[i].1.clone())
    }

    /// Inserts into the latest view at the latest version
    pub fn insert(&mut self, key: Key, val: ValueOrClear) {
        let v = self.latest_version();
        self.insert_at(key, val, v);
    }

    /// Inserts into the latest view with an explicit insert version, used
    /// when the left half of a split clear must keep its original version
    pub fn insert_at(&mut self, key: Key, val: ValueOrClear, insert_version: Version) {
        let (_, view) = self.views.back_mut().unwrap();
        *view = view.insert(key, VEntry { val, insert_version });
    }

    /// Removes entries in `[begin, end)` from the latest view only
    pub fn erase_range(&mut self, begin: &[u8], end: &[u8]) {
        let (_, view) = self.views.back_mut().unwrap();
        *view = view.erase_range(begin, end);
    }

    pub fn erase_key(&mut self, key: &[u8]) {
        let end = key_after(key);
        self.erase_range(key, &end);
    }

    /// Applies a canonical set: a value landing inside an existing clear
    /// splits it, preserving the original insert version on the left half
    /// so the durability loop still forgets it by that version.
    pub fn apply_set(&mut self, key: &[u8], value: Value) {
        let split = {
            let view = self.latest();
            match view.last_less_or_equal(key) {
                Some((prev_key, prev)) => match &prev.val {
                    ValueOrClear::ClearTo(end) if end.as_slice() > key => {
                        Some((prev_key.clone(), end.clone(), prev.insert_version))
                    }
                    _ => None,
                },
                None => None,
            }
        };
        if let Some((prev_key, end, prev_version)) = split {
            self.insert_at(prev_key, ValueOrClear::ClearTo(key.to_vec()), prev_version);
            let next_key = key_after(key);
            if end != next_key {
                debug_assert!(end > next_key);
                self.insert(next_key, ValueOrClear::ClearTo(end));
            }
        }
        self.insert(key.to_vec(), ValueOrClear::Value(value));
    }

    /// Applies a canonical (already expanded) clear over `[begin, end)`
    pub fn apply_clear(&mut self, begin: &[u8], end: &[u8]) {
        debug_assert!(begin < end);
        self.erase_range(begin, end);
        debug_assert!(lookup(self.latest(), begin) != VmRead::Cleared);
        self.insert(begin.to_vec(), ValueOrClear::ClearTo(end.to_vec()));
    }

    /// Frees views strictly older than `v`, keeping the newest view at or
    /// below `v` so reads at `v` keep working. Reclamation is the Arc drop
    /// of unshared nodes.
    pub fn forget_versions_before(&mut self, v: Version) {
        while self.views.len() > 1 && self.views[1].0 <= v {
            self.views.pop_front();
        }
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_are_isolated() {
        let mut vm = VersionedMap::new(10);
        vm.apply_set(b"a", b"1".to_vec());
        vm.create_new_version(20);
        vm.apply_set(b"a", b"2".to_vec());

        let at10 = vm.at(10).unwrap();
        let at15 = vm.at(15).unwrap();
        let at20 = vm.at(20).unwrap();
        assert_eq!(lookup(&at10, b"a"), VmRead::Value(b"1".to_vec()));
        assert_eq!(lookup(&at15, b"a"), VmRead::Value(b"1".to_vec()));
        assert_eq!(lookup(&at20, b"a"), VmRead::Value(b"2".to_vec()));
        assert!(vm.at(9).is_none());
    }

    #[test]
    fn test_clear_covers_and_set_splits() {
        let mut vm = VersionedMap::new(10);
        vm.apply_clear(b"b", b"f");
        assert_eq!(lookup(vm.latest(), b"c"), VmRead::Cleared);
        assert_eq!(lookup(vm.latest(), b"f"), VmRead::Missing);

        vm.create_new_version(20);
        vm.apply_set(b"d", b"x".to_vec());
        let view = vm.latest().clone();
        assert_eq!(lookup(&view, b"c"), VmRead::Cleared);
        assert_eq!(lookup(&view, b"d"), VmRead::Value(b"x".to_vec()));
        assert_eq!(lookup(&view, b"d\x00"), VmRead::Cleared);
        assert_eq!(lookup(&view, b"e"), VmRead::Cleared);

        // the left half keeps insert version 10, the right half got 20
        let left = view.get(b"b").unwrap();
        assert_eq!(left.insert_version, 10);
        assert_eq!(left.val, ValueOrClear::ClearTo(b"d".to_vec()));
        let right = view.get(b"d\x00").unwrap();
        assert_eq!(right.insert_version, 20);
        assert_eq!(right.val, ValueOrClear::ClearTo(b"f".to_vec()));
    }

    #[test]
    fn test_set_at_clear_boundary_key() {
        let mut vm = VersionedMap::new(10);
        vm.apply_clear(b"b", b"d");
        vm.apply_set(b"b", b"v".to_vec());
        let view = vm.latest();
        assert_eq!(lookup(view, b"b"), VmRead::Value(b"v".to_vec()));
        assert_eq!(lookup(view, b"c"), VmRead::Cleared);
    }

    #[test]
    fn test_forget_versions_before() {
        let mut vm = VersionedMap::new(10);
        vm.apply_set(b"a", b"1".to_vec());
        vm.create_new_version(20);
        vm.create_new_version(30);
        assert_eq!(vm.view_count(), 3);
        vm.forget_versions_before(25);
        assert_eq!(vm.oldest_version(), 20);
        assert!(vm.at(10).is_none());
        assert!(vm.at(25).is_some());
        vm.forget_versions_before(30);
        assert_eq!(vm.view_count(), 1);
        assert_eq!(lookup(&vm.at(30).unwrap(), b"a"), VmRead::Value(b"1".to_vec()));
    }

    #[test]
    fn test_erase_key_only_touches_latest() {
        let mut vm = VersionedMap::new(10);
        vm.apply_set(b"a", b"1".to_vec());
        vm.create_new_version(20);
        vm.erase_key(b"a");
        assert_eq!(lookup(&vm.at(10).unwrap(), b"a"), VmRead::Value(b"1".to_vec()));
        assert_eq!(lookup(&vm.at(20).unwrap(), b"a"), VmRead::Missing);
    }
}
