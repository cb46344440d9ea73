//! The replay worker.
//!
//! One long-running task supervises the upstream mount and drains the
//! journal into it. Each popped record is verified against the upstream
//! before it is applied: if the upstream no longer matches the recorded
//! pre-image the record routes to conflict materialization instead of
//! being forced. Losing the upstream mid-replay requeues the record and
//! drops the worker back to mount supervision.

pub mod conflict;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::read_padded;
use crate::context::CoreContext;
use crate::data_change::DataChange;
use crate::error::FsError;
use crate::sync_item::SyncItem;
use crate::sync_log::SyncLease;
use crate::types::{FileKind, FileStat};

use conflict::{ChangeRecord, ChangeSet};

/// Delay between mount probes while disconnected.
pub const MOUNT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay between queue polls while idle or paused.
pub const IDLE_DELAY: Duration = Duration::from_secs(1);

/// How one replay attempt ended.
enum ReplayOutcome {
    /// Applied; retire the record.
    Done,
    /// The upstream diverged; materialize and retire.
    Conflict(ChangeSet),
    /// The upstream vanished; requeue and re-enter mount supervision.
    Disconnected,
}

pub struct SyncWorker {
    ctx: Arc<CoreContext>,
}

impl SyncWorker {
    pub fn new(ctx: Arc<CoreContext>) -> SyncWorker {
        SyncWorker { ctx }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Main loop: supervise the mount, drain the journal, shut down
    /// cleanly when asked.
    pub async fn run(self) {
        info!("sync worker started");
        loop {
            if self.ctx.signals.shutdown() {
                break;
            }

            if !self.ctx.signals.upstream_available() {
                if !self.ctx.signals.force_disconnect() {
                    self.attempt_mount().await;
                }
                if !self.ctx.signals.upstream_available() {
                    tokio::time::sleep(MOUNT_RETRY_DELAY).await;
                    continue;
                }
            }

            if self.ctx.signals.sync_paused() {
                debug!("sync paused");
                tokio::time::sleep(IDLE_DELAY).await;
                continue;
            }

            if !self.step().await {
                tokio::time::sleep(IDLE_DELAY).await;
            }
        }

        info!("shutting down: unmounting upstream and checkpointing journal");
        self.ctx.signals.set_upstream_available(false);
        self.ctx.upstream.unmount().await;
        if let Err(err) = self.ctx.sync_log.checkpoint().await {
            warn!("journal checkpoint on shutdown failed: {err:?}");
        }
        info!("sync worker stopped");
    }

    /// Probe the server and try to mount. Sets `upstream_available` on
    /// success.
    pub async fn attempt_mount(&self) -> bool {
        if !self.ctx.upstream.is_server_reachable().await {
            debug!("upstream server unreachable");
            return false;
        }
        if self.ctx.upstream.mount().await {
            info!("upstream mounted; replay can resume");
            self.ctx.signals.set_upstream_available(true);
            true
        } else {
            debug!("upstream mount attempt failed");
            false
        }
    }

    /// Pop and replay a single record. Returns whether there was one.
    pub async fn step(&self) -> bool {
        let Some(lease) = self.ctx.sync_log.pop_change().await else {
            return false;
        };

        let outcome = self.replay(&lease).await;
        match outcome {
            ReplayOutcome::Done => {
                debug!(item = ?lease.item(), "replayed");
                self.ctx.sync_log.finish(lease, true);
            }
            ReplayOutcome::Conflict(set) => {
                let path = lease.item().path().to_path_buf();
                if let Err(err) = conflict::materialize(&self.ctx, &path, set).await {
                    warn!("conflict materialization failed: {err:?}");
                }
                // Drop the conflicted mirror; the next access refetches
                // the upstream's version of the truth.
                match self.ctx.cache.evict_inner(&path).await {
                    Ok(()) | Err(FsError::NotFound) => {}
                    Err(err) => warn!("unable to evict conflicted copy: {err:?}"),
                }
                self.ctx.sync_log.finish(lease, true);
            }
            ReplayOutcome::Disconnected => {
                info!("upstream lost during replay; requeueing");
                self.ctx.sync_log.finish(lease, false);
            }
        }
        true
    }

    /// Drain the journal until it is empty or replay has to stop.
    pub async fn drain(&self) {
        while self.ctx.signals.upstream_available()
            && !self.ctx.signals.sync_paused()
            && !self.ctx.signals.shutdown()
        {
            if !self.step().await {
                break;
            }
        }
    }

    async fn replay(&self, lease: &SyncLease) -> ReplayOutcome {
        match lease.item().clone() {
            SyncItem::New { kind, path } => self.replay_new(kind, &path).await,
            SyncItem::Unlink { kind, path } => self.replay_unlink(kind, &path).await,
            SyncItem::Change { path, .. } => self.replay_change(&path, lease.change()).await,
            SyncItem::Rename { old_path, new_path, .. } => {
                self.replay_rename(&old_path, &new_path).await
            }
            SyncItem::Link { path, .. } => {
                // Hard-link propagation is journalled but unsupported.
                debug!(path = %path.display(), "skipping hard link replay");
                ReplayOutcome::Done
            }
        }
    }

    /// Route an upstream I/O failure: a fatal one drops to disconnected
    /// mode; anything else preserves the record as a conflict so replay
    /// never spins on a permanently failing item.
    async fn fatal_or_conflict(&self, err: std::io::Error, set: ChangeSet) -> ReplayOutcome {
        match self.ctx.upstream.note_fatal(err).await {
            FsError::UpstreamGone => ReplayOutcome::Disconnected,
            other => {
                warn!("replay error: {other:?}");
                ReplayOutcome::Conflict(set)
            }
        }
    }

    // ---- per-variant replay -------------------------------------------

    /// The artifact for a `New` that could not reach the upstream: the
    /// whole local file for regular files, an empty marker otherwise.
    async fn new_set_from_cache(&self, kind: FileKind, path: &Path) -> ChangeSet {
        let cpath = self.ctx.layout.cache_path_of(path);
        let mut set = ChangeSet::new(path);
        if kind == FileKind::Regular {
            if let Ok(size) = self.ctx.cache.cache_size(path).await {
                if let Ok(data) = read_padded(&cpath, 0, size).await {
                    set.push(ChangeRecord::Patch { start: 0, end: size, data });
                }
            }
        }
        set
    }

    async fn replay_new(&self, kind: FileKind, path: &Path) -> ReplayOutcome {
        let upath = self.ctx.layout.upstream_path_of(path);
        let cpath = self.ctx.layout.cache_path_of(path);

        match fs::symlink_metadata(&upath).await {
            // Somebody beat the journal to this name.
            Ok(_) => return ReplayOutcome::Conflict(self.new_set_from_cache(kind, path).await),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                let set = self.new_set_from_cache(kind, path).await;
                return self.fatal_or_conflict(err, set).await;
            }
        }

        let perms = self.ctx.overlay.get(&cpath).ok();
        let result = match kind {
            FileKind::Directory => fs::create_dir(&upath).await,
            FileKind::Symlink => match fs::read_link(&cpath).await {
                Ok(target) => fs::symlink(&target, &upath).await,
                Err(err) => Err(err),
            },
            FileKind::Regular => fs::copy(&cpath, &upath).await.map(|_| ()),
            other => {
                make_special_node(&upath, other, perms.map(|p| p.mode)).await;
                Ok(())
            }
        };
        if let Err(err) = result {
            let set = self.new_set_from_cache(kind, path).await;
            return self.fatal_or_conflict(err, set).await;
        }

        if let Some(perms) = perms {
            apply_perms(&upath, perms.mode, perms.uid, perms.gid).await;
        }
        ReplayOutcome::Done
    }

    async fn replay_unlink(&self, kind: FileKind, path: &Path) -> ReplayOutcome {
        let upath = self.ctx.layout.upstream_path_of(path);
        let result = if kind.is_dir() {
            fs::remove_dir(&upath).await
        } else {
            fs::remove_file(&upath).await
        };
        match result {
            Ok(()) => ReplayOutcome::Done,
            // Already gone: replay is idempotent.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ReplayOutcome::Done,
            Err(err) => {
                let mut set = ChangeSet::new(path);
                set.push(ChangeRecord::Unlink);
                self.fatal_or_conflict(err, set).await
            }
        }
    }

    async fn replay_change(&self, path: &Path, change: Option<&DataChange>) -> ReplayOutcome {
        let upath = self.ctx.layout.upstream_path_of(path);
        let cpath = self.ctx.layout.cache_path_of(path);

        let cache_meta = match fs::symlink_metadata(&cpath).await {
            Ok(meta) => meta,
            Err(_) => {
                // The mirror vanished underneath its own journal entry;
                // nothing left to push.
                warn!(path = %path.display(), "cache copy missing for queued change");
                return ReplayOutcome::Done;
            }
        };
        let cache_stat = FileStat::from_metadata(&cache_meta);

        let upstream_meta = match fs::symlink_metadata(&upath).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return ReplayOutcome::Conflict(self.change_set_from_cache(path, change).await);
            }
            Err(err) => {
                let set = self.change_set_from_cache(path, change).await;
                return self.fatal_or_conflict(err, set).await;
            }
        };
        let upstream_stat = FileStat::from_metadata(&upstream_meta);

        let overlay_kind = self
            .ctx
            .overlay
            .get(&cpath)
            .map(|perms| FileKind::from_mode(perms.mode, 0))
            .unwrap_or(cache_stat.kind());
        if overlay_kind.mode_bits() != upstream_stat.kind().mode_bits() {
            return ReplayOutcome::Conflict(self.change_set_from_cache(path, change).await);
        }

        if let Some(expected) = self.ctx.name_map.inode_of(path) {
            if expected != upstream_stat.ino {
                return ReplayOutcome::Conflict(self.change_set_from_cache(path, change).await);
            }
        }

        if let Some(change) = change {
            // Verify the pre-images before touching anything.
            for region in change.regions() {
                let mut upstream_bytes = match self
                    .ctx
                    .upstream
                    .read_region_unlocked(path, region.start(), region.end())
                    .await
                {
                    Ok(bytes) => bytes,
                    Err(FsError::UpstreamGone) => return ReplayOutcome::Disconnected,
                    Err(FsError::NotFound) => Vec::new(),
                    Err(err) => {
                        warn!("upstream read failed during verify: {err:?}");
                        return ReplayOutcome::Conflict(
                            self.change_set_from_cache(path, Some(change)).await,
                        );
                    }
                };
                upstream_bytes.resize(region.len() as usize, 0);
                if upstream_bytes != region.bytes() {
                    return ReplayOutcome::Conflict(
                        self.change_set_from_cache(path, Some(change)).await,
                    );
                }
            }

            // Apply the regions from the cache copy's current bytes.
            for region in change.regions() {
                let data = match read_padded(&cpath, region.start(), region.end()).await {
                    Ok(data) => data,
                    Err(err) => {
                        warn!("cache read failed during apply: {err:?}");
                        return ReplayOutcome::Done;
                    }
                };
                match self
                    .ctx
                    .upstream
                    .write_region_unlocked(path, region.start(), region.end(), &data)
                    .await
                {
                    Ok(()) => {}
                    Err(FsError::UpstreamGone) => return ReplayOutcome::Disconnected,
                    Err(err) => {
                        warn!("upstream write failed: {err:?}");
                        return ReplayOutcome::Conflict(
                            self.change_set_from_cache(path, Some(change)).await,
                        );
                    }
                }
            }

            if let Some(mode) = change.mode() {
                apply_perms(&upath, mode, change.uid().unwrap_or(upstream_stat.uid),
                    change.gid().unwrap_or(upstream_stat.gid)).await;
            } else if let (Some(uid), Some(gid)) = (change.uid(), change.gid()) {
                apply_owner(&upath, uid, gid).await;
            }
            if let Some(mtime) = change.mtime() {
                apply_mtime(&upath, mtime).await;
            }
        }

        // Length parity: the cache copy is the truth for file size.
        if cache_stat.size < upstream_stat.size {
            match self.ctx.upstream.truncate_unlocked(path, cache_stat.size).await {
                Ok(()) => {}
                Err(FsError::UpstreamGone) => return ReplayOutcome::Disconnected,
                Err(err) => warn!("upstream truncate failed: {err:?}"),
            }
        }

        ReplayOutcome::Done
    }

    async fn replay_rename(&self, old_path: &Path, new_path: &Path) -> ReplayOutcome {
        let u_old = self.ctx.layout.upstream_path_of(old_path);
        let u_new = self.ctx.layout.upstream_path_of(new_path);
        match fs::rename(&u_old, &u_new).await {
            Ok(()) => ReplayOutcome::Done,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // The source is gone upstream; record the intent.
                let mut set = ChangeSet::new(old_path);
                set.push(ChangeRecord::Rename {
                    new_name: new_path.display().to_string(),
                });
                ReplayOutcome::Conflict(set)
            }
            Err(err) => {
                let mut set = ChangeSet::new(old_path);
                set.push(ChangeRecord::Rename {
                    new_name: new_path.display().to_string(),
                });
                self.fatal_or_conflict(err, set).await
            }
        }
    }

    /// Build the artifact for a diverged change: the local bytes of every
    /// queued region, plus the queued truncation if any.
    async fn change_set_from_cache(&self, path: &Path, change: Option<&DataChange>) -> ChangeSet {
        let cpath = self.ctx.layout.cache_path_of(path);
        let mut set = ChangeSet::new(path);
        if let Some(change) = change {
            for region in change.regions() {
                if let Ok(data) = read_padded(&cpath, region.start(), region.end()).await {
                    set.push(ChangeRecord::Patch {
                        start: region.start(),
                        end: region.end(),
                        data,
                    });
                }
            }
            if let Some(pos) = change.length() {
                set.push(ChangeRecord::Truncate { pos });
            }
        }
        set
    }
}

async fn apply_perms(path: &Path, mode: u32, uid: u32, gid: u32) {
    use std::os::unix::fs::PermissionsExt;
    let path_buf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::set_permissions(&path_buf, std::fs::Permissions::from_mode(mode & 0o7777))
    })
    .await;
    if let Ok(Err(err)) = result {
        warn!("unable to apply mode upstream: {err}");
    }
    apply_owner(path, uid, gid).await;
}

async fn apply_owner(path: &Path, uid: u32, gid: u32) {
    let path_buf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::os::unix::fs::chown(&path_buf, Some(uid), Some(gid))
    })
    .await;
    if let Ok(Err(err)) = result {
        // Needs privilege; the overlay keeps the authoritative answer.
        debug!("unable to chown upstream copy: {err}");
    }
}

async fn apply_mtime(path: &Path, mtime: i64) {
    let path_buf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        filetime::set_file_mtime(&path_buf, filetime::FileTime::from_unix_time(mtime, 0))
    })
    .await;
    if let Ok(Err(err)) = result {
        warn!("unable to apply mtime upstream: {err}");
    }
}

#[cfg(target_os = "linux")]
async fn make_special_node(path: &Path, kind: FileKind, mode: Option<u32>) {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let (type_bits, dev) = match kind {
        FileKind::Fifo => (libc::S_IFIFO, 0),
        FileKind::Socket => (libc::S_IFSOCK, 0),
        FileKind::CharDevice { major, minor } => {
            (libc::S_IFCHR, unsafe { libc::makedev(major, minor) })
        }
        FileKind::BlockDevice { major, minor } => {
            (libc::S_IFBLK, unsafe { libc::makedev(major, minor) })
        }
        _ => return,
    };
    let mode = type_bits | (mode.unwrap_or(0o644) & 0o7777);
    let result =
        tokio::task::spawn_blocking(move || unsafe { libc::mknod(cpath.as_ptr(), mode, dev) })
            .await;
    if let Ok(rc) = result {
        if rc != 0 {
            warn!(path = %path.display(), "mknod on upstream failed");
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn make_special_node(path: &Path, _kind: FileKind, _mode: Option<u32>) {
    warn!(path = %path.display(), "special node replay unsupported on this platform");
}
