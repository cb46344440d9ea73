//! The lockable proxy in front of the upstream filesystem.
//!
//! All remote I/O funnels through here. A fatal-looking error (EIO,
//! ESTALE) from any data call clears the `upstream_available` signal,
//! unmounts the upstream and surfaces [`FsError::UpstreamGone`]; everything
//! else propagates verbatim. Mount lifecycle itself is delegated to a
//! [`MountHelper`] so the proxy never cares whether the upstream is a real
//! network mount or a plain directory.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::context::Signals;
use crate::error::{is_fatal_upstream_error, map_io_error, FsError, FsResult};
use crate::name_to_inode::NameToInodeMap;
use crate::path_lock::{PathGuard, PathLocks};

/// Mount lifecycle operations, supplied by the host environment.
#[async_trait]
pub trait MountHelper: Send + Sync {
    /// Attach the upstream under the configured mount point.
    async fn mount(&self) -> bool;

    /// Detach the upstream. Must be safe to call when already detached.
    async fn unmount(&self) -> bool;

    /// Whether the backing server currently answers at all.
    async fn is_server_reachable(&self) -> bool;
}

/// Mounts a remote NFS export by shelling out to mount(8)/umount(8).
pub struct ShellMountHelper {
    source: String,
    mount_point: PathBuf,
    options: Option<String>,
}

impl ShellMountHelper {
    pub fn new(source: String, mount_point: PathBuf, options: Option<String>) -> ShellMountHelper {
        ShellMountHelper { source, mount_point, options }
    }
}

#[async_trait]
impl MountHelper for ShellMountHelper {
    async fn mount(&self) -> bool {
        if let Err(err) = fs::create_dir_all(&self.mount_point).await {
            warn!("unable to create upstream mount point: {err}");
            return false;
        }

        let mut cmd = Command::new("mount");
        cmd.arg("-t").arg("nfs");
        if let Some(options) = &self.options {
            cmd.arg("-o").arg(options);
        }
        cmd.arg(&self.source).arg(&self.mount_point);

        debug!(source = %self.source, "invoking mount(8)");
        match cmd.status().await {
            Ok(status) if status.success() => {
                info!(source = %self.source, "upstream mounted");
                true
            }
            Ok(status) => {
                warn!("mount(8) exited with {status}");
                false
            }
            Err(err) => {
                warn!("unable to invoke mount(8): {err}");
                false
            }
        }
    }

    async fn unmount(&self) -> bool {
        let mut cmd = Command::new("umount");
        cmd.arg(&self.mount_point);
        match cmd.status().await {
            Ok(status) if status.success() => {
                info!("upstream unmounted");
                true
            }
            Ok(status) => {
                warn!("umount(8) exited with {status}");
                false
            }
            Err(err) => {
                warn!("unable to invoke umount(8): {err}");
                false
            }
        }
    }

    async fn is_server_reachable(&self) -> bool {
        let Some(host) = self.source.split(':').next().filter(|h| !h.is_empty()) else {
            return false;
        };
        match Command::new("ping").args(["-c", "1", "-W", "1", host]).status().await {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }
}

/// Treats an existing local directory as the upstream. Used when the mount
/// source is a plain path, and by the test suites to simulate a server
/// that comes and goes.
pub struct LoopbackMountHelper {
    mounted: AtomicBool,
    reachable: AtomicBool,
}

impl LoopbackMountHelper {
    pub fn new() -> LoopbackMountHelper {
        LoopbackMountHelper {
            mounted: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
        }
    }

    /// Flip simulated reachability; pending mounts start failing once the
    /// "server" goes away.
    pub fn set_reachable(&self, value: bool) {
        self.reachable.store(value, Ordering::SeqCst);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackMountHelper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MountHelper for LoopbackMountHelper {
    async fn mount(&self) -> bool {
        if !self.reachable.load(Ordering::SeqCst) {
            return false;
        }
        self.mounted.store(true, Ordering::SeqCst);
        true
    }

    async fn unmount(&self) -> bool {
        self.mounted.store(false, Ordering::SeqCst);
        true
    }

    async fn is_server_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// The proxy itself: upstream root, per-path locks, disconnect handling.
pub struct UpstreamMount {
    root: PathBuf,
    locks: Arc<PathLocks>,
    signals: Arc<Signals>,
    name_map: Arc<NameToInodeMap>,
    helper: Box<dyn MountHelper>,
}

impl UpstreamMount {
    pub fn new(
        root: PathBuf,
        locks: Arc<PathLocks>,
        signals: Arc<Signals>,
        name_map: Arc<NameToInodeMap>,
        helper: Box<dyn MountHelper>,
    ) -> UpstreamMount {
        UpstreamMount { root, locks, signals, name_map, helper }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn mount(&self) -> bool {
        self.helper.mount().await
    }

    /// Unmount and drop every inode mapping; numbers from a dead mount
    /// generation are meaningless.
    pub async fn unmount(&self) -> bool {
        let result = self.helper.unmount().await;
        self.name_map.invalidate();
        result
    }

    pub async fn is_server_reachable(&self) -> bool {
        self.helper.is_server_reachable().await
    }

    pub async fn lock(&self, path: &Path) -> PathGuard {
        self.locks.lock(path).await
    }

    /// Flag the upstream as gone after a fatal I/O error: clear the
    /// availability signal, unmount, and hand the caller `UpstreamGone`.
    pub async fn note_fatal(&self, err: std::io::Error) -> FsError {
        if is_fatal_upstream_error(&err) {
            warn!("fatal upstream error ({err}); entering disconnected mode");
            self.signals.set_upstream_available(false);
            self.unmount().await;
            FsError::UpstreamGone
        } else {
            map_io_error(err)
        }
    }

    /// Read `[start, end)` of an upstream file. Short data (EOF inside
    /// the range) yields a short buffer; the caller decides how to pad.
    pub async fn read_region(&self, path: &Path, start: u64, end: u64) -> FsResult<Vec<u8>> {
        let _guard = self.lock(path).await;
        self.read_region_unlocked(path, start, end).await
    }

    /// Lock-free variant for callers already holding this path's lease.
    pub async fn read_region_unlocked(&self, path: &Path, start: u64, end: u64) -> FsResult<Vec<u8>> {
        if end < start {
            return Err(FsError::InvalidArgument);
        }
        match self.try_read_region(path, start, end).await {
            Ok(data) => Ok(data),
            Err(err) => Err(self.note_fatal(err).await),
        }
    }

    async fn try_read_region(&self, path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
        let mut file = fs::File::open(&path_under(&self.root, path)).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut data = Vec::with_capacity((end - start) as usize);
        let mut remaining = end - start;
        let mut chunk = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(chunk.len() as u64) as usize;
            let got = file.read(&mut chunk[..want]).await?;
            if got == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..got]);
            remaining -= got as u64;
        }
        Ok(data)
    }

    /// Write `bytes` over `[start, end)` of an upstream file.
    pub async fn write_region(
        &self,
        path: &Path,
        start: u64,
        end: u64,
        bytes: &[u8],
    ) -> FsResult<()> {
        let _guard = self.lock(path).await;
        self.write_region_unlocked(path, start, end, bytes).await
    }

    /// Lock-free variant for callers already holding this path's lease.
    pub async fn write_region_unlocked(
        &self,
        path: &Path,
        start: u64,
        end: u64,
        bytes: &[u8],
    ) -> FsResult<()> {
        if end < start || bytes.len() as u64 != end - start {
            return Err(FsError::InvalidArgument);
        }
        let attempt = async {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path_under(&self.root, path))
                .await?;
            file.seek(SeekFrom::Start(start)).await?;
            file.write_all(bytes).await?;
            file.flush().await
        };
        match attempt.await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.note_fatal(err).await),
        }
    }

    /// Truncate an upstream file to `new_len`.
    pub async fn truncate(&self, path: &Path, new_len: u64) -> FsResult<()> {
        let _guard = self.lock(path).await;
        self.truncate_unlocked(path, new_len).await
    }

    /// Lock-free variant for callers already holding this path's lease.
    pub async fn truncate_unlocked(&self, path: &Path, new_len: u64) -> FsResult<()> {
        let attempt = async {
            let file = OpenOptions::new()
                .write(true)
                .open(&path_under(&self.root, path))
                .await?;
            file.set_len(new_len).await
        };
        match attempt.await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.note_fatal(err).await),
        }
    }
}

fn path_under(root: &Path, fusepath: &Path) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in fusepath.components() {
        if let std::path::Component::Normal(name) = part {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, UpstreamMount) {
        let dir = tempfile::tempdir().unwrap();
        let upstream = UpstreamMount::new(
            dir.path().to_path_buf(),
            Arc::new(PathLocks::new()),
            Arc::new(Signals::new()),
            Arc::new(NameToInodeMap::new()),
            Box::new(LoopbackMountHelper::new()),
        );
        (dir, upstream)
    }

    #[tokio::test]
    async fn read_region_returns_short_data_at_eof() {
        let (dir, upstream) = fixture().await;
        std::fs::write(dir.path().join("f"), b"hello").unwrap();

        let data = upstream.read_region(Path::new("/f"), 0, 10).await.unwrap();
        assert_eq!(data, b"hello");

        let data = upstream.read_region(Path::new("/f"), 2, 4).await.unwrap();
        assert_eq!(data, b"ll");

        let data = upstream.read_region(Path::new("/f"), 9, 12).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn write_region_patches_in_place() {
        let (dir, upstream) = fixture().await;
        std::fs::write(dir.path().join("f"), b"aaaaa").unwrap();

        upstream.write_region(Path::new("/f"), 1, 4, b"bbb").await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"abbba");

        assert_eq!(
            upstream.write_region(Path::new("/f"), 0, 3, b"xx").await.unwrap_err(),
            FsError::InvalidArgument
        );
    }

    #[tokio::test]
    async fn truncate_cuts_the_file() {
        let (dir, upstream) = fixture().await;
        std::fs::write(dir.path().join("f"), b"aaaaa").unwrap();
        upstream.truncate(Path::new("/f"), 2).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"aa");
    }

    #[tokio::test]
    async fn missing_file_is_not_fatal() {
        let (_dir, upstream) = fixture().await;
        assert_eq!(
            upstream.read_region(Path::new("/absent"), 0, 1).await.unwrap_err(),
            FsError::NotFound
        );
    }

    #[tokio::test]
    async fn unmount_invalidates_inode_map() {
        let dir = tempfile::tempdir().unwrap();
        let name_map = Arc::new(NameToInodeMap::new());
        let upstream = UpstreamMount::new(
            dir.path().to_path_buf(),
            Arc::new(PathLocks::new()),
            Arc::new(Signals::new()),
            name_map.clone(),
            Box::new(LoopbackMountHelper::new()),
        );
        name_map.record(Path::new("/a"), 1);
        upstream.unmount().await;
        assert_eq!(name_map.inode_of(Path::new("/a")), None);
    }
}
