//! On-demand per-path lock tables.
//!
//! Both the cache tree and the upstream proxy serialize access per path.
//! Lock cells are allocated the first time a path is touched and handed out
//! as owned guards so a lease can carry them across await points. When a
//! holder needs a cache lock and an upstream lock for the same path it must
//! take the cache side first; two paths in the same table are taken in
//! lexicographic order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A held lock on a single path.
pub type PathGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct PathLocks {
    cells: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> PathLocks {
        PathLocks { cells: DashMap::new() }
    }

    fn cell(&self, path: &Path) -> Arc<Mutex<()>> {
        self.cells
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Lock a single path, blocking until any previous holder releases it.
    pub async fn lock(&self, path: &Path) -> PathGuard {
        self.cell(path).lock_owned().await
    }

    /// Lock two paths in lexicographic order. Locking the same path twice
    /// yields a single guard.
    pub async fn lock_pair(&self, a: &Path, b: &Path) -> (PathGuard, Option<PathGuard>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first_guard = self.lock(first).await;
        let second_guard = self.lock(second).await;
        (first_guard, Some(second_guard))
    }
}
