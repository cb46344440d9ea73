//! The durable journal of mutations awaiting replay.
//!
//! Structural mutations append [`SyncItem`]s to a FIFO queue; data
//! mutations fold into a side map of [`DataChange`]s keyed by the cache
//! inode, so at most one `Change` record per inode is ever queued. An
//! unlink erases the queued history it supersedes. The whole state
//! checkpoints to `sync.log` on a timer and at shutdown; a crash loses at
//! most one checkpoint window.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec;
use crate::context::Signals;
use crate::data_change::DataChange;
use crate::error::{map_io_error, FsResult};
use crate::path_lock::{PathGuard, PathLocks};
use crate::sync_item::SyncItem;
use crate::types::FileKind;

/// How often the journal checkpoints itself to disk.
pub const CHECKPOINT_PERIOD: Duration = Duration::from_secs(30);

struct LogState {
    queue: VecDeque<SyncItem>,
    changes: HashMap<u64, DataChange>,
}

/// A popped journal entry, holding the cache and upstream locks for every
/// path the entry touches. The locks are taken cache side first, then
/// upstream, paths in lexicographic order; they release when the lease is
/// handed back through [`SyncLog::finish`].
pub struct SyncLease {
    item: SyncItem,
    change: Option<DataChange>,
    _guards: Vec<PathGuard>,
}

impl SyncLease {
    pub fn item(&self) -> &SyncItem {
        &self.item
    }

    pub fn change(&self) -> Option<&DataChange> {
        self.change.as_ref()
    }
}

pub struct SyncLog {
    log_path: PathBuf,
    state: Mutex<LogState>,
    cache_locks: Arc<PathLocks>,
    upstream_locks: Arc<PathLocks>,
}

impl SyncLog {
    /// Open the journal, loading any checkpoint found at `log_path`. A
    /// missing file starts the log empty; a corrupt one is logged and
    /// dropped rather than refusing to mount.
    pub fn open(
        log_path: PathBuf,
        cache_locks: Arc<PathLocks>,
        upstream_locks: Arc<PathLocks>,
    ) -> SyncLog {
        let (queue, changes) = match std::fs::read(&log_path) {
            Ok(data) => match codec::decode_log(&data) {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!("discarding corrupt sync log: {err}");
                    (VecDeque::new(), HashMap::new())
                }
            },
            Err(_) => (VecDeque::new(), HashMap::new()),
        };
        SyncLog {
            log_path,
            state: Mutex::new(LogState { queue, changes }),
            cache_locks,
            upstream_locks,
        }
    }

    /// Record a node created locally.
    pub fn add_new(&self, kind: FileKind, path: &Path) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(SyncItem::New { kind, path: path.to_path_buf() });
    }

    /// Record a hard link created locally.
    pub fn add_link(&self, inode: u64, path: &Path) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(SyncItem::Link { inode, path: path.to_path_buf() });
    }

    /// Record a rename. Renames never coalesce; they redirect the history
    /// scan that a later unlink performs.
    pub fn add_rename(&self, inode: u64, old_path: &Path, new_path: &Path) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(SyncItem::Rename {
            inode,
            old_path: old_path.to_path_buf(),
            new_path: new_path.to_path_buf(),
        });
    }

    /// Record an unlink, erasing the queued history it supersedes.
    ///
    /// The queue is walked newest to oldest. Every `New`/`Change`/`Link`
    /// for the traced name is removed; a `Rename` whose destination is the
    /// traced name redirects the trace to its source. When the trace
    /// bottoms out at a `New` the whole chain — rename links included —
    /// vanishes and no `Unlink` is queued: the node never existed
    /// upstream. Otherwise the `Unlink` is appended under the name the
    /// caller passed, which is the name the upstream file bears once the
    /// earlier renames have replayed.
    pub fn add_unlink(&self, kind: FileKind, path: &Path) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let mut target = path.to_path_buf();
        let mut saw_new = false;
        let mut removals: Vec<usize> = Vec::new();
        let mut chain_renames: Vec<usize> = Vec::new();

        for index in (0..state.queue.len()).rev() {
            match &state.queue[index] {
                SyncItem::New { path: p, .. } if *p == target => {
                    removals.push(index);
                    saw_new = true;
                    // Creation boundary: anything older belongs to a
                    // previous incarnation of the name.
                    break;
                }
                SyncItem::Change { path: p, inode } if *p == target => {
                    let inode = *inode;
                    removals.push(index);
                    state.changes.remove(&inode);
                }
                SyncItem::Link { path: p, .. } if *p == target => {
                    removals.push(index);
                }
                SyncItem::Rename { old_path, new_path, .. } if *new_path == target => {
                    chain_renames.push(index);
                    target = old_path.clone();
                }
                _ => {}
            }
        }

        if saw_new {
            removals.extend(chain_renames);
            removals.sort_unstable_by(|a, b| b.cmp(a));
            for index in removals {
                state.queue.remove(index);
            }
            debug!(path = %path.display(), "unlink elided; node was never pushed upstream");
        } else {
            removals.sort_unstable_by(|a, b| b.cmp(a));
            for index in removals {
                state.queue.remove(index);
            }
            state.queue.push_back(SyncItem::Unlink { kind, path: path.to_path_buf() });
        }
    }

    /// Record a data mutation. The first change for an inode appends a
    /// `Change` record and opens its [`DataChange`]; later calls fold into
    /// it. `old_bytes` is the pre-image of the written range, read from
    /// the cache before the write landed; replay compares it against the
    /// upstream to detect divergence. Zero-length writes are no-ops.
    pub fn add_change(
        &self,
        path: &Path,
        inode: u64,
        start: u64,
        end: u64,
        old_bytes: Vec<u8>,
    ) -> FsResult<()> {
        if start == end {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        if !state.changes.contains_key(&inode) {
            state.queue.push_back(SyncItem::Change { path: path.to_path_buf(), inode });
            state.changes.insert(inode, DataChange::new());
        }
        state.changes.get_mut(&inode).unwrap().add(start, end, old_bytes)
    }

    /// Ensure a `Change` record exists for the inode without queueing any
    /// data, so queued metadata reaches the upstream.
    pub fn add_metadata_change(&self, path: &Path, inode: u64) {
        let mut state = self.state.lock().unwrap();
        if !state.changes.contains_key(&inode) {
            state.queue.push_back(SyncItem::Change { path: path.to_path_buf(), inode });
            state.changes.insert(inode, DataChange::new());
        }
    }

    /// Update the queued metadata for an inode that already has a
    /// `Change` record.
    pub fn amend_change(&self, inode: u64, amend: impl FnOnce(&mut DataChange)) {
        let mut state = self.state.lock().unwrap();
        if let Some(change) = state.changes.get_mut(&inode) {
            amend(change);
        }
    }

    /// Propagate a truncation into any queued change for `path`.
    pub fn truncate_changes(&self, path: &Path, new_len: u64) {
        let mut state = self.state.lock().unwrap();
        let inodes: Vec<u64> = state
            .queue
            .iter()
            .filter_map(|item| match item {
                SyncItem::Change { path: p, inode } if p == path => Some(*inode),
                _ => None,
            })
            .collect();
        for inode in inodes {
            if let Some(change) = state.changes.get_mut(&inode) {
                change.truncate(new_len);
            }
        }
    }

    /// Whether `path` was created locally and not yet replayed.
    pub fn is_new_file(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state
            .queue
            .iter()
            .any(|item| matches!(item, SyncItem::New { path: p, .. } if p == path))
    }

    /// Whether the most recent queued record leaves `path` unlinked.
    pub fn is_unlinked_file(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        let mut unlinked = false;
        for item in state.queue.iter() {
            match item {
                SyncItem::Unlink { path: p, .. } if p == path => unlinked = true,
                SyncItem::New { path: p, .. }
                | SyncItem::Change { path: p, .. }
                | SyncItem::Link { path: p, .. }
                    if p == path =>
                {
                    unlinked = false
                }
                SyncItem::Rename { new_path, .. } if new_path == path => unlinked = false,
                _ => {}
            }
        }
        unlinked
    }

    /// Whether any queued record references `path`.
    pub fn is_dirty(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.queue.iter().any(|item| item.touches(path))
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue_len() == 0
    }

    fn lease_paths(item: &SyncItem) -> Vec<PathBuf> {
        match item {
            SyncItem::Rename { old_path, new_path, .. } => {
                let mut paths = vec![old_path.clone(), new_path.clone()];
                paths.sort();
                paths
            }
            other => vec![other.path().to_path_buf()],
        }
    }

    /// Dequeue the oldest record, locking every path it touches on the
    /// cache side and then the upstream side before returning. The caller
    /// must hand the lease back through [`SyncLog::finish`].
    pub async fn pop_change(&self) -> Option<SyncLease> {
        let (item, change) = {
            let mut state = self.state.lock().unwrap();
            let item = state.queue.pop_front()?;
            let change = match &item {
                SyncItem::Change { inode, .. } => state.changes.remove(inode),
                _ => None,
            };
            (item, change)
        };

        let paths = Self::lease_paths(&item);
        let mut guards = Vec::with_capacity(paths.len() * 2);
        for path in &paths {
            guards.push(self.cache_locks.lock(path).await);
        }
        for path in &paths {
            guards.push(self.upstream_locks.lock(path).await);
        }

        Some(SyncLease { item, change, _guards: guards })
    }

    /// Release a lease. With `remove` the record is retired for good;
    /// without it the record returns to the front of the queue so replay
    /// order is preserved across a disconnect.
    pub fn finish(&self, lease: SyncLease, remove: bool) {
        if remove {
            return;
        }
        let SyncLease { item, change, _guards } = lease;
        let mut state = self.state.lock().unwrap();
        if let (SyncItem::Change { inode, .. }, Some(old_change)) = (&item, change) {
            let inode = *inode;
            if state.changes.contains_key(&inode) {
                // A fresh Change for the same inode was queued while this
                // one was leased out. Fold the leased regions underneath
                // the newer ones instead of queueing a duplicate record.
                let newer = state.changes.get_mut(&inode).unwrap();
                let mut merged = old_change;
                for region in newer.regions() {
                    let _ = merged.add(region.start(), region.end(), region.bytes().to_vec());
                }
                if let Some(len) = newer.length() {
                    merged.truncate(len);
                }
                if let Some(v) = newer.ctime() {
                    merged.set_ctime(v);
                }
                if let Some(v) = newer.mtime() {
                    merged.set_mtime(v);
                }
                if let Some(v) = newer.mode() {
                    merged.set_mode(v);
                }
                if let (Some(uid), Some(gid)) = (newer.uid(), newer.gid()) {
                    merged.set_owner(uid, gid);
                }
                if let Some(target) = newer.symlink_target() {
                    merged.set_symlink_target(target.to_owned());
                }
                *newer = merged;
                return;
            }
            state.changes.insert(inode, old_change);
        }
        state.queue.push_front(item);
    }

    /// Serialize the journal to disk, replacing the previous checkpoint
    /// atomically.
    pub async fn checkpoint(&self) -> FsResult<()> {
        let encoded = {
            let state = self.state.lock().unwrap();
            codec::encode_log(&state.queue, &state.changes).map_err(|err| {
                warn!("unable to encode sync log: {err}");
                crate::error::FsError::Io
            })?
        };
        let tmp = self.log_path.with_extension("tmp");
        tokio::fs::write(&tmp, &encoded).await.map_err(map_io_error)?;
        tokio::fs::rename(&tmp, &self.log_path).await.map_err(map_io_error)
    }

    /// Spawn the periodic checkpoint task. Checkpoint failures are logged
    /// and retried next period; the task exits on shutdown after a final
    /// flush.
    pub fn spawn_checkpointer(self: &Arc<Self>, signals: Arc<Signals>) -> JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CHECKPOINT_PERIOD).await;
                if signals.shutdown() {
                    break;
                }
                debug!("checkpointing sync log");
                if let Err(err) = log.checkpoint().await {
                    warn!("sync log checkpoint failed: {err:?}");
                }
            }
            if let Err(err) = log.checkpoint().await {
                warn!("final sync log checkpoint failed: {err:?}");
            }
        })
    }

    /// Human-readable dump for the control xattr surface.
    pub fn describe(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::new();
        let _ = writeln!(out, "queue ({} items):", state.queue.len());
        for item in state.queue.iter() {
            let _ = writeln!(out, "  {item:?}");
        }
        let _ = writeln!(out, "changes ({} inodes):", state.changes.len());
        let mut inodes: Vec<&u64> = state.changes.keys().collect();
        inodes.sort();
        for inode in inodes {
            let _ = writeln!(out, "  {}: {:?}", inode, state.changes[inode]);
        }
        out
    }

    #[doc(hidden)]
    pub fn snapshot(&self) -> (Vec<SyncItem>, HashMap<u64, DataChange>) {
        let state = self.state.lock().unwrap();
        (state.queue.iter().cloned().collect(), state.changes.clone())
    }
}

/// Control attributes answering from the journal.
pub fn register_xattrs(registry: &mut crate::xattr::XattrRegistry) {
    use crate::xattr::{flag, XattrScope};

    registry.register(
        XattrScope::Any,
        "dirty",
        Box::new(|ctx, path| Ok(flag(ctx.sync_log.is_dirty(path)))),
    );
    registry.register(
        XattrScope::Root,
        "synclog-contents",
        Box::new(|ctx, _path| Ok(ctx.sync_log.describe())),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (tempfile::TempDir, SyncLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = SyncLog::open(
            dir.path().join("sync.log"),
            Arc::new(PathLocks::new()),
            Arc::new(PathLocks::new()),
        );
        (dir, log)
    }

    #[test]
    fn one_change_record_per_inode() {
        let (_dir, log) = fresh();
        log.add_change(Path::new("/a"), 7, 0, 5, vec![0; 5]).unwrap();
        log.add_change(Path::new("/a"), 7, 5, 10, vec![0; 5]).unwrap();
        assert_eq!(log.queue_len(), 1);

        let (queue, changes) = log.snapshot();
        assert!(matches!(&queue[0], SyncItem::Change { inode: 7, .. }));
        // Adjacent ranges folded into one region.
        assert_eq!(changes[&7].regions().len(), 1);
    }

    #[test]
    fn zero_length_writes_are_ignored() {
        let (_dir, log) = fresh();
        log.add_change(Path::new("/a"), 7, 5, 5, Vec::new()).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn unlink_erases_new_and_changes() {
        let (_dir, log) = fresh();
        log.add_new(FileKind::Regular, Path::new("/c"));
        log.add_change(Path::new("/c"), 3, 0, 1, vec![0]).unwrap();
        log.add_unlink(FileKind::Regular, Path::new("/c"));

        assert!(log.is_empty());
        let (_, changes) = log.snapshot();
        assert!(changes.is_empty());
    }

    #[test]
    fn unlink_traces_through_renames() {
        let (_dir, log) = fresh();
        log.add_new(FileKind::Regular, Path::new("/d"));
        log.add_change(Path::new("/d"), 4, 0, 1, vec![0]).unwrap();
        log.add_rename(4, Path::new("/d"), Path::new("/e"));
        log.add_unlink(FileKind::Regular, Path::new("/e"));

        assert!(log.is_empty());
    }

    #[test]
    fn unlink_of_a_mirrored_file_is_queued() {
        let (_dir, log) = fresh();
        log.add_change(Path::new("/f"), 5, 0, 1, vec![0]).unwrap();
        log.add_unlink(FileKind::Regular, Path::new("/f"));

        let (queue, changes) = log.snapshot();
        assert_eq!(queue.len(), 1);
        assert!(matches!(&queue[0], SyncItem::Unlink { .. }));
        assert!(changes.is_empty());
        assert!(log.is_unlinked_file(Path::new("/f")));
    }

    #[test]
    fn rename_resurrects_an_unlinked_name() {
        let (_dir, log) = fresh();
        log.add_unlink(FileKind::Regular, Path::new("/g"));
        assert!(log.is_unlinked_file(Path::new("/g")));
        log.add_rename(6, Path::new("/h"), Path::new("/g"));
        assert!(!log.is_unlinked_file(Path::new("/g")));
    }

    #[test]
    fn truncate_changes_clips_queued_regions() {
        let (_dir, log) = fresh();
        log.add_change(Path::new("/t"), 9, 0, 10, vec![b'x'; 10]).unwrap();
        log.add_change(Path::new("/t"), 9, 20, 30, vec![b'y'; 10]).unwrap();
        log.truncate_changes(Path::new("/t"), 15);

        let (_, changes) = log.snapshot();
        let change = &changes[&9];
        assert_eq!(change.regions().len(), 1);
        assert_eq!(change.regions()[0].end(), 10);
        assert_eq!(change.length(), Some(15));
    }

    #[tokio::test]
    async fn pop_is_fifo_and_finish_requeues_in_front() {
        let (_dir, log) = fresh();
        log.add_new(FileKind::Regular, Path::new("/one"));
        log.add_new(FileKind::Regular, Path::new("/two"));

        let lease = log.pop_change().await.unwrap();
        assert_eq!(lease.item().path(), Path::new("/one"));
        log.finish(lease, false);

        let lease = log.pop_change().await.unwrap();
        assert_eq!(lease.item().path(), Path::new("/one"));
        log.finish(lease, true);

        let lease = log.pop_change().await.unwrap();
        assert_eq!(lease.item().path(), Path::new("/two"));
        log.finish(lease, true);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn pop_carries_the_data_change() {
        let (_dir, log) = fresh();
        log.add_change(Path::new("/a"), 7, 0, 5, b"aaaaa".to_vec()).unwrap();

        let lease = log.pop_change().await.unwrap();
        assert!(lease.change().is_some());
        log.finish(lease, false);

        // Requeued lease restored the change map entry.
        let (_, changes) = log.snapshot();
        assert!(changes.contains_key(&7));
    }

    #[tokio::test]
    async fn checkpoint_round_trips_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.log");
        let log = SyncLog::open(
            path.clone(),
            Arc::new(PathLocks::new()),
            Arc::new(PathLocks::new()),
        );
        log.add_new(FileKind::Directory, Path::new("/d"));
        log.add_change(Path::new("/a"), 7, 0, 3, b"abc".to_vec()).unwrap();
        log.checkpoint().await.unwrap();

        let reloaded = SyncLog::open(
            path,
            Arc::new(PathLocks::new()),
            Arc::new(PathLocks::new()),
        );
        assert_eq!(reloaded.snapshot(), log.snapshot());
    }

    #[test]
    fn corrupt_log_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.log");
        std::fs::write(&path, b"garbage").unwrap();
        let log = SyncLog::open(
            path,
            Arc::new(PathLocks::new()),
            Arc::new(PathLocks::new()),
        );
        assert!(log.is_empty());
    }
}
