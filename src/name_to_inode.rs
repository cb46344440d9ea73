//! Best-effort bidirectional path ↔ upstream-inode cache.
//!
//! Populated whenever an upstream stat passes through the cache manager,
//! consumed by replay to notice that a path now names a different upstream
//! file. Dropped wholesale when the upstream is unmounted; stale answers
//! are acceptable, wrong ones are not.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

#[derive(Default)]
pub struct NameToInodeMap {
    by_name: DashMap<PathBuf, u64>,
    by_inode: DashMap<u64, Vec<PathBuf>>,
}

impl NameToInodeMap {
    pub fn new() -> NameToInodeMap {
        NameToInodeMap::default()
    }

    pub fn record(&self, path: &Path, inode: u64) {
        self.by_name.insert(path.to_path_buf(), inode);
        let mut names = self.by_inode.entry(inode).or_default();
        if !names.iter().any(|p| p == path) {
            names.push(path.to_path_buf());
        }
    }

    pub fn inode_of(&self, path: &Path) -> Option<u64> {
        self.by_name.get(path).map(|entry| *entry)
    }

    pub fn names_of(&self, inode: u64) -> Vec<PathBuf> {
        self.by_inode.get(&inode).map(|entry| entry.clone()).unwrap_or_default()
    }

    /// Forget one path, e.g. after a rename retires the old name.
    pub fn forget(&self, path: &Path) {
        if let Some((_, inode)) = self.by_name.remove(path) {
            if let Some(mut names) = self.by_inode.get_mut(&inode) {
                names.retain(|p| p != path);
            }
        }
    }

    /// Drop everything. Inode numbers from a previous mount generation
    /// mean nothing after a remount.
    pub fn invalidate(&self) {
        self.by_name.clear();
        self.by_inode.clear();
    }

    pub fn describe(&self) -> String {
        let mut pairs: Vec<(PathBuf, u64)> =
            self.by_name.iter().map(|e| (e.key().clone(), *e.value())).collect();
        pairs.sort();
        let mut out = String::from("{");
        for (idx, (path, inode)) in pairs.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            let _ = write!(out, " {}: {}", path.display(), inode);
        }
        out.push_str(" }");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_visible_both_ways() {
        let map = NameToInodeMap::new();
        map.record(Path::new("/a"), 7);
        map.record(Path::new("/b"), 7);

        assert_eq!(map.inode_of(Path::new("/a")), Some(7));
        assert_eq!(map.names_of(7).len(), 2);
    }

    #[test]
    fn duplicate_records_do_not_accumulate() {
        let map = NameToInodeMap::new();
        map.record(Path::new("/a"), 7);
        map.record(Path::new("/a"), 7);
        assert_eq!(map.names_of(7).len(), 1);
    }

    #[test]
    fn invalidate_clears_everything() {
        let map = NameToInodeMap::new();
        map.record(Path::new("/a"), 7);
        map.invalidate();
        assert_eq!(map.inode_of(Path::new("/a")), None);
        assert!(map.names_of(7).is_empty());
    }

    #[test]
    fn forget_retires_a_single_name() {
        let map = NameToInodeMap::new();
        map.record(Path::new("/a"), 7);
        map.record(Path::new("/b"), 7);
        map.forget(Path::new("/a"));
        assert_eq!(map.inode_of(Path::new("/a")), None);
        assert_eq!(map.names_of(7), vec![PathBuf::from("/b")]);
    }
}
