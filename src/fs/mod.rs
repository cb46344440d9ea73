//! The filesystem front-end.
//!
//! [`TsumuFs`] translates the host bridge's callbacks into cache-manager
//! and journal calls. No caching policy lives here: the front-end
//! validates arguments, sequences the cache mutation with its journal
//! record (pre-image capture included), and keeps the per-operation
//! metrics. The host supplies caller identity through [`CallContext`].

pub mod utils;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::context::CoreContext;
use crate::error::{FsError, FsResult};
use crate::types::{FileKind, FileStat, OpenFlags, StatFs, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::xattr::{self, XattrRegistry};

use utils::validate_path;

/// Caller identity, supplied per callback by the host bridge.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl CallContext {
    pub fn root() -> CallContext {
        CallContext { uid: 0, gid: 0, pid: 0 }
    }
}

/// One directory entry as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

pub struct TsumuFs {
    ctx: Arc<CoreContext>,
    xattrs: XattrRegistry,
}

impl TsumuFs {
    pub fn new(ctx: Arc<CoreContext>) -> TsumuFs {
        TsumuFs { ctx, xattrs: xattr::build_registry() }
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = FsResult<T>>,
    ) -> FsResult<T> {
        let start = Instant::now();
        let result = fut.await;
        self.ctx.metrics.observe(op, start.elapsed());
        result
    }

    // ---- metadata ------------------------------------------------------

    pub async fn getattr(&self, path: &Path) -> FsResult<FileStat> {
        validate_path(path)?;
        self.timed("getattr", self.ctx.cache.stat_file(path)).await
    }

    pub async fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        validate_path(path)?;
        self.timed("readlink", self.ctx.cache.read_link(path)).await
    }

    pub async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        validate_path(path)?;
        self.timed("readdir", async {
            let names = self.ctx.cache.get_dirents(path).await?;
            let mut entries = Vec::with_capacity(names.len());
            for name in names {
                match self.ctx.cache.stat_file(&path.join(&name)).await {
                    Ok(stat) => entries.push(DirEntry { name, kind: stat.kind() }),
                    Err(err) => {
                        debug!("skipping unstattable dirent {name}: {err:?}");
                    }
                }
            }
            Ok(entries)
        })
        .await
    }

    pub async fn access(&self, path: &Path, mode: u32, call: &CallContext) -> FsResult<()> {
        validate_path(path)?;
        self.timed("access", async {
            let groups = (self.ctx.groups)(call.uid);
            if self.ctx.cache.access(call.uid, call.gid, &groups, path, mode).await? {
                Ok(())
            } else {
                Err(FsError::PermissionDenied)
            }
        })
        .await
    }

    pub async fn statfs(&self) -> FsResult<StatFs> {
        self.timed("statfs", async {
            let target = if self.ctx.signals.upstream_available() {
                self.ctx.layout.upstream_root.clone()
            } else {
                self.ctx.layout.cache_point.clone()
            };
            statvfs(&target).await
        })
        .await
    }

    // ---- open / read / write -------------------------------------------

    /// Open with POSIX create semantics honored against the cache copy.
    pub async fn open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
        call: &CallContext,
    ) -> FsResult<()> {
        validate_path(path)?;
        self.timed("open", async {
            let outcome = self.ctx.cache.fake_open(path, flags, mode).await?;
            if outcome.created && !outcome.on_upstream {
                let cpath = self.ctx.layout.cache_path_of(path);
                self.ctx.overlay.set(&cpath, call.uid, call.gid, S_IFREG | (mode & 0o7777))?;
                self.ctx.sync_log.add_new(FileKind::Regular, path);
            }
            Ok(())
        })
        .await
    }

    pub async fn create(&self, path: &Path, mode: u32, call: &CallContext) -> FsResult<()> {
        let flags = OpenFlags { write: true, create: true, truncate: true, ..OpenFlags::default() };
        self.open(path, flags, mode, call).await
    }

    pub async fn read(&self, path: &Path, offset: u64, size: u64) -> FsResult<Vec<u8>> {
        validate_path(path)?;
        self.timed("read", self.ctx.cache.read_file(path, offset, size)).await
    }

    /// Write to the cache copy and journal the mutation with its
    /// pre-image. Writes to files still queued as `New` skip the journal:
    /// their replay copies the final cache contents wholesale.
    pub async fn write(&self, path: &Path, offset: u64, data: &[u8]) -> FsResult<usize> {
        validate_path(path)?;
        self.timed("write", async {
            if data.is_empty() {
                return Ok(0);
            }
            let outcome = self.ctx.cache.write_file(path, offset, data).await?;
            if !self.ctx.sync_log.is_new_file(path) {
                self.ctx.sync_log.add_change(
                    path,
                    outcome.inode,
                    offset,
                    offset + data.len() as u64,
                    outcome.pre_image,
                )?;
            }
            Ok(outcome.written)
        })
        .await
    }

    pub async fn flush(&self, path: &Path) -> FsResult<()> {
        validate_path(path)?;
        self.timed("flush", self.ctx.cache.sync_file(path)).await
    }

    pub async fn fsync(&self, path: &Path) -> FsResult<()> {
        validate_path(path)?;
        self.timed("fsync", self.ctx.cache.sync_file(path)).await
    }

    pub async fn release(&self, _path: &Path) -> FsResult<()> {
        Ok(())
    }

    /// Truncate the cache copy and queue whatever replay needs to
    /// reproduce the new length: a zero-filled extension region when the
    /// file grew, a bare metadata change plus clipped regions when it
    /// shrank.
    pub async fn truncate(&self, path: &Path, new_len: u64) -> FsResult<()> {
        validate_path(path)?;
        self.timed("truncate", async {
            let outcome = self.ctx.cache.truncate_file(path, new_len).await?;
            if !self.ctx.sync_log.is_new_file(path) {
                if new_len > outcome.old_size {
                    let extension = (new_len - outcome.old_size) as usize;
                    self.ctx.sync_log.add_change(
                        path,
                        outcome.inode,
                        outcome.old_size,
                        new_len,
                        vec![0; extension],
                    )?;
                } else {
                    self.ctx.sync_log.add_metadata_change(path, outcome.inode);
                }
                self.ctx.sync_log.truncate_changes(path, new_len);
            }
            Ok(())
        })
        .await
    }

    pub async fn ftruncate(&self, path: &Path, new_len: u64) -> FsResult<()> {
        self.truncate(path, new_len).await
    }

    // ---- structure -----------------------------------------------------

    pub async fn mkdir(&self, path: &Path, mode: u32, call: &CallContext) -> FsResult<()> {
        validate_path(path)?;
        self.timed("mkdir", async {
            self.ctx.cache.make_dir(path, mode).await?;
            let cpath = self.ctx.layout.cache_path_of(path);
            self.ctx.overlay.set(&cpath, call.uid, call.gid, S_IFDIR | (mode & 0o7777))?;
            self.ctx.sync_log.add_new(FileKind::Directory, path);
            Ok(())
        })
        .await
    }

    pub async fn rmdir(&self, path: &Path) -> FsResult<()> {
        validate_path(path)?;
        self.timed("rmdir", async {
            let stat = self.ctx.cache.stat_file(path).await?;
            if !stat.kind().is_dir() {
                return Err(FsError::NotADirectory);
            }
            if !self.ctx.cache.get_dirents(path).await?.is_empty() {
                return Err(FsError::NotEmpty);
            }
            match self.ctx.cache.evict(path).await {
                Ok(()) | Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
            self.ctx.sync_log.add_unlink(FileKind::Directory, path);
            Ok(())
        })
        .await
    }

    pub async fn unlink(&self, path: &Path) -> FsResult<()> {
        validate_path(path)?;
        self.timed("unlink", async {
            let stat = self.ctx.cache.stat_file(path).await?;
            let kind = stat.kind();
            if kind.is_dir() {
                return Err(FsError::IsADirectory);
            }
            match self.ctx.cache.evict(path).await {
                Ok(()) | Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
            self.ctx.sync_log.add_unlink(kind, path);
            Ok(())
        })
        .await
    }

    pub async fn symlink(&self, target: &Path, link: &Path, call: &CallContext) -> FsResult<()> {
        validate_path(link)?;
        self.timed("symlink", async {
            self.ctx.cache.make_symlink(link, target).await?;
            let cpath = self.ctx.layout.cache_path_of(link);
            self.ctx.overlay.set(&cpath, call.uid, call.gid, S_IFLNK | 0o777)?;
            self.ctx.sync_log.add_new(FileKind::Symlink, link);
            Ok(())
        })
        .await
    }

    pub async fn link(&self, source: &Path, link: &Path) -> FsResult<()> {
        validate_path(source)?;
        validate_path(link)?;
        self.timed("link", async {
            let inode = self.ctx.cache.make_link(source, link).await?;
            self.ctx.sync_log.add_link(inode, link);
            Ok(())
        })
        .await
    }

    pub async fn mknod(
        &self,
        path: &Path,
        mode: u32,
        rdev: u64,
        call: &CallContext,
    ) -> FsResult<()> {
        validate_path(path)?;
        self.timed("mknod", async {
            let kind = FileKind::from_mode(mode, rdev);
            match kind {
                FileKind::Directory => return Err(FsError::InvalidArgument),
                FileKind::Regular => return self.create(path, mode & 0o7777, call).await,
                _ => {}
            }
            self.ctx.cache.make_special(path).await?;
            let cpath = self.ctx.layout.cache_path_of(path);
            self.ctx.overlay.set(&cpath, call.uid, call.gid, mode)?;
            self.ctx.sync_log.add_new(kind, path);
            Ok(())
        })
        .await
    }

    pub async fn rename(&self, old: &Path, new: &Path) -> FsResult<()> {
        validate_path(old)?;
        validate_path(new)?;
        self.timed("rename", async {
            self.ctx.cache.ensure_cached(old).await?;
            let resolved = self.ctx.cache.rename(old, new).await?;
            let inode = self.ctx.cache.cache_inode(&resolved).await?;
            self.ctx.sync_log.add_rename(inode, old, &resolved);
            Ok(())
        })
        .await
    }

    // ---- attributes ----------------------------------------------------

    pub async fn chmod(&self, path: &Path, mode: u32, call: &CallContext) -> FsResult<()> {
        validate_path(path)?;
        self.timed("chmod", async {
            let stat = self.ctx.cache.stat_file(path).await?;
            if call.uid != 0 && call.uid != stat.uid {
                return Err(FsError::PermissionDenied);
            }
            self.ctx.cache.ensure_cached(path).await?;

            let full_mode = (stat.mode & S_IFMT) | (mode & 0o7777);
            let cpath = self.ctx.layout.cache_path_of(path);
            self.ctx.overlay.set(&cpath, stat.uid, stat.gid, full_mode)?;
            let _ = self.ctx.cache.apply_mode(path, mode).await;

            let inode = self.ctx.cache.cache_inode(path).await?;
            self.ctx.sync_log.add_metadata_change(path, inode);
            self.ctx.sync_log.amend_change(inode, |change| change.set_mode(full_mode));
            Ok(())
        })
        .await
    }

    pub async fn chown(&self, path: &Path, uid: u32, gid: u32, call: &CallContext) -> FsResult<()> {
        validate_path(path)?;
        self.timed("chown", async {
            if call.uid != 0 {
                return Err(FsError::PermissionDenied);
            }
            let stat = self.ctx.cache.stat_file(path).await?;
            self.ctx.cache.ensure_cached(path).await?;

            let cpath = self.ctx.layout.cache_path_of(path);
            self.ctx.overlay.set(&cpath, uid, gid, stat.mode)?;

            let inode = self.ctx.cache.cache_inode(path).await?;
            self.ctx.sync_log.add_metadata_change(path, inode);
            self.ctx.sync_log.amend_change(inode, |change| change.set_owner(uid, gid));
            Ok(())
        })
        .await
    }

    pub async fn utime(&self, path: &Path, atime: i64, mtime: i64) -> FsResult<()> {
        validate_path(path)?;
        self.timed("utime", async {
            self.ctx.cache.ensure_cached(path).await?;
            self.ctx.cache.apply_times(path, atime, mtime).await?;

            let inode = self.ctx.cache.cache_inode(path).await?;
            self.ctx.sync_log.add_metadata_change(path, inode);
            self.ctx.sync_log.amend_change(inode, |change| change.set_mtime(mtime));
            Ok(())
        })
        .await
    }

    // ---- extended attributes -------------------------------------------

    pub async fn getxattr(&self, path: &Path, name: &str) -> FsResult<String> {
        validate_path(path)?;
        self.timed("getxattr", async { self.xattrs.get(&self.ctx, path, name) }).await
    }

    pub async fn setxattr(&self, path: &Path, name: &str, value: &str) -> FsResult<()> {
        validate_path(path)?;
        self.timed("setxattr", self.xattrs.set(&self.ctx, path, name, value)).await
    }

    pub async fn listxattr(&self, path: &Path) -> FsResult<Vec<String>> {
        validate_path(path)?;
        self.timed("listxattr", async { Ok(self.xattrs.list(path)) }).await
    }
}

#[cfg(target_os = "linux")]
async fn statvfs(path: &Path) -> FsResult<StatFs> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::InvalidArgument)?;
    tokio::task::spawn_blocking(move || {
        let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut out) };
        if rc == 0 {
            Ok(StatFs {
                block_size: out.f_bsize as u64,
                fragment_size: out.f_frsize as u64,
                blocks: out.f_blocks as u64,
                blocks_free: out.f_bfree as u64,
                blocks_available: out.f_bavail as u64,
                files: out.f_files as u64,
                files_free: out.f_ffree as u64,
                name_max: out.f_namemax as u64,
            })
        } else {
            Err(FsError::Io)
        }
    })
    .await
    .map_err(|_| FsError::Io)?
}

#[cfg(not(target_os = "linux"))]
async fn statvfs(_path: &Path) -> FsResult<StatFs> {
    Ok(StatFs::default())
}
