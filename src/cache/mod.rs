//! The cache manager: policy engine and keeper of the mirrored tree.
//!
//! Every host-visible operation resolves here. The manager decides where
//! the operation lands (cache or upstream), mirrors upstream files into
//! the cache on demand, evicts copies policy no longer wants, and keeps
//! the stat and dirent caches that make disconnected metadata cheap.

mod plan;

pub use plan::{plan, Opcode, PlanInputs};

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task;
use tracing::{debug, warn};

use crate::context::{Layout, Signals};
use crate::error::{map_io_error, FsError, FsResult};
use crate::name_to_inode::NameToInodeMap;
use crate::path_lock::{PathGuard, PathLocks};
use crate::perms_overlay::PermsOverlay;
use crate::policy::CachePolicy;
use crate::sync_log::SyncLog;
use crate::types::{FileKind, FileStat, OpenFlags};
use crate::upstream::UpstreamMount;

/// Base lifetime of a cached stat entry.
pub const STAT_TTL: Duration = Duration::from_secs(60);

/// Per-path jitter applied to [`STAT_TTL`], derived from the path hash so
/// a directory scan's entries do not all expire in the same instant.
fn stat_ttl_for(path: &Path) -> Duration {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    let jitter_ms = (hasher.finish() % 20_000) as i64 - 10_000;
    Duration::from_millis((STAT_TTL.as_millis() as i64 + jitter_ms) as u64)
}

struct StatExpiry;

impl moka::Expiry<PathBuf, Arc<FileStat>> for StatExpiry {
    fn expire_after_create(
        &self,
        key: &PathBuf,
        _value: &Arc<FileStat>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(stat_ttl_for(key))
    }
}

/// Where an operation resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Cache(PathBuf),
    Upstream(PathBuf),
    /// The plan said not-found but the caller intends to create.
    Missing(PathBuf),
}

/// Result of a cache write: what the journal needs to record it.
#[derive(Debug)]
pub struct WriteOutcome {
    pub written: usize,
    /// Cache inode of the written file; keys the queued data change.
    pub inode: u64,
    /// Bytes previously occupying the written range, zero-padded past EOF.
    pub pre_image: Vec<u8>,
}

/// Result of a cache truncate.
#[derive(Debug)]
pub struct TruncateOutcome {
    pub old_size: u64,
    pub inode: u64,
}

/// Result of an open with create intent.
#[derive(Debug)]
pub struct OpenOutcome {
    pub created: bool,
    pub inode: u64,
    /// The open landed on the upstream path (policy refused to cache);
    /// nothing was journalled against the cache.
    pub on_upstream: bool,
}

pub struct CacheManager {
    layout: Layout,
    locks: Arc<PathLocks>,
    signals: Arc<Signals>,
    sync_log: Arc<SyncLog>,
    overlay: Arc<PermsOverlay>,
    policy: Arc<CachePolicy>,
    name_map: Arc<NameToInodeMap>,
    upstream: Arc<UpstreamMount>,
    stats: moka::sync::Cache<PathBuf, Arc<FileStat>>,
    dirents: DashMap<PathBuf, Vec<String>>,
}

impl CacheManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: Layout,
        locks: Arc<PathLocks>,
        signals: Arc<Signals>,
        sync_log: Arc<SyncLog>,
        overlay: Arc<PermsOverlay>,
        policy: Arc<CachePolicy>,
        name_map: Arc<NameToInodeMap>,
        upstream: Arc<UpstreamMount>,
    ) -> CacheManager {
        let stats = moka::sync::Cache::builder()
            .max_capacity(65_536)
            .expire_after(StatExpiry)
            .build();
        CacheManager {
            layout,
            locks,
            signals,
            sync_log,
            overlay,
            policy,
            name_map,
            upstream,
            stats,
            dirents: DashMap::new(),
        }
    }

    pub async fn lock(&self, path: &Path) -> PathGuard {
        self.locks.lock(path).await
    }

    fn cache_path(&self, path: &Path) -> PathBuf {
        self.layout.cache_path_of(path)
    }

    fn upstream_path(&self, path: &Path) -> PathBuf {
        self.layout.upstream_path_of(path)
    }

    fn is_root(path: &Path) -> bool {
        path == Path::new("/")
    }

    // ---- stat and dirent caches ---------------------------------------

    /// Stat through the cache: a fresh entry is taken over an lstat for as
    /// long as its jittered TTL lasts.
    async fn cached_stat(&self, realpath: &Path) -> FsResult<Arc<FileStat>> {
        if let Some(stat) = self.stats.get(realpath) {
            return Ok(stat);
        }
        let meta = fs::symlink_metadata(realpath).await.map_err(map_io_error)?;
        let stat = Arc::new(FileStat::from_metadata(&meta));
        self.stats.insert(realpath.to_path_buf(), stat.clone());
        Ok(stat)
    }

    pub(crate) fn invalidate_stat(&self, path: &Path) {
        self.stats.invalidate(&self.cache_path(path));
        self.stats.invalidate(&self.upstream_path(path));
    }

    fn note_dirent_added(&self, path: &Path, name: &str) {
        let Some(parent) = path.parent() else { return };
        if let Some(mut names) = self.dirents.get_mut(parent) {
            let name = name.to_owned();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    fn note_dirent_removed(&self, path: &Path) {
        let Some(parent) = path.parent() else { return };
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(mut names) = self.dirents.get_mut(parent) {
                names.retain(|existing| existing != name);
            }
        }
    }

    fn drop_dirent_subtree(&self, path: &Path) {
        self.dirents.retain(|key, _| !key.starts_with(path));
    }

    /// Render the stat cache for the debug xattr.
    pub fn describe_stats(&self) -> String {
        let mut lines: Vec<String> = self
            .stats
            .iter()
            .map(|(path, stat)| {
                format!(
                    "{}: ino {} size {} mtime {}",
                    path.display(),
                    stat.ino,
                    stat.size,
                    stat.mtime
                )
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }

    /// Render the dirent cache for the debug xattr.
    pub fn describe_dirents(&self) -> String {
        let mut lines: Vec<String> = self
            .dirents
            .iter()
            .map(|entry| {
                let mut names = entry.value().clone();
                names.sort();
                format!("{}: {}", entry.key().display(), names.join(" "))
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }

    // ---- planning -----------------------------------------------------

    /// Whether the path has a usable mirror on disk. A directory only
    /// counts as cached while connected if its dirent snapshot is live,
    /// otherwise a fetch refreshes the listing.
    async fn is_cached_inner(&self, path: &Path) -> bool {
        match fs::symlink_metadata(&self.cache_path(path)).await {
            Ok(meta) if meta.is_dir() && self.signals.upstream_available() => {
                self.dirents.contains_key(path)
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    /// Synchronous variant for the control xattr surface.
    pub fn is_cached_blocking(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(self.cache_path(path)).is_ok()
    }

    /// Compare the remembered upstream stat against a fresh lstat. Any
    /// difference in blocks, mtime, size or inode means the upstream copy
    /// moved. No remembered stat means no verdict.
    async fn upstream_changed(&self, path: &Path) -> FsResult<bool> {
        let upath = self.upstream_path(path);
        let Some(remembered) = self.stats.get(&upath) else {
            return Ok(false);
        };
        match fs::symlink_metadata(&upath).await {
            Ok(meta) => {
                let fresh = FileStat::from_metadata(&meta);
                Ok(remembered.blocks != fresh.blocks
                    || remembered.mtime != fresh.mtime
                    || remembered.size != fresh.size
                    || remembered.ino != fresh.ino)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.upstream.note_fatal(err).await),
        }
    }

    async fn plan_for(&self, path: &Path, for_stat: bool) -> FsResult<Vec<Opcode>> {
        // The root is always visible and always cached.
        if Self::is_root(path) {
            return Ok(vec![Opcode::UseCache]);
        }
        let cached = self.is_cached_inner(path).await;
        let should_cache =
            self.policy.should_cache(path) && !self.sync_log.is_unlinked_file(path);
        let upstream_up = self.signals.upstream_available();
        let upstream_changed = if cached && should_cache && upstream_up {
            self.upstream_changed(path).await?
        } else {
            false
        };
        let inputs = PlanInputs {
            cached,
            should_cache,
            upstream_up,
            upstream_changed,
            log_dirty: self.sync_log.is_dirty(path),
            for_stat,
        };
        let opcodes = plan(inputs);
        debug!(path = %path.display(), ?opcodes, "cache plan");
        Ok(opcodes)
    }

    /// Execute a plan's side effects and resolve the concrete path the
    /// operation should run against.
    async fn run_plan(
        &self,
        path: &Path,
        opcodes: &[Opcode],
        tolerate_missing: bool,
    ) -> FsResult<Resolution> {
        for opcode in opcodes {
            match opcode {
                Opcode::Fetch => self.fetch(path).await?,
                Opcode::Evict => self.evict_inner(path).await?,
                Opcode::Enoent => {
                    if tolerate_missing {
                        return Ok(Resolution::Missing(self.cache_path(path)));
                    }
                    return Err(FsError::NotFound);
                }
                Opcode::UseUpstream => {
                    return Ok(Resolution::Upstream(self.upstream_path(path)))
                }
                // A conflicted path keeps answering from the local copy
                // until replay materializes the divergence.
                Opcode::UseCache | Opcode::Conflict => {
                    return Ok(Resolution::Cache(self.cache_path(path)))
                }
            }
        }
        Ok(Resolution::Cache(self.cache_path(path)))
    }

    async fn resolve(&self, path: &Path, for_stat: bool) -> FsResult<Resolution> {
        let opcodes = self.plan_for(path, for_stat).await?;
        self.run_plan(path, &opcodes, false).await
    }

    // ---- fetch and evict ----------------------------------------------

    /// Mirror one upstream node into the cache.
    async fn fetch(&self, path: &Path) -> FsResult<()> {
        let upath = self.upstream_path(path);
        let cpath = self.cache_path(path);

        let meta = match fs::symlink_metadata(&upath).await {
            Ok(meta) => meta,
            Err(err) => return Err(self.upstream.note_fatal(err).await),
        };
        let stat = FileStat::from_metadata(&meta);
        debug!(path = %path.display(), kind = ?stat.kind(), "fetching into cache");

        match stat.kind() {
            FileKind::Directory => self.fetch_dir(path, &upath, &cpath, &stat).await?,
            FileKind::Symlink => {
                let target = fs::read_link(&upath).await.map_err(map_io_error)?;
                match fs::remove_file(&cpath).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(map_io_error(err)),
                }
                fs::symlink(&target, &cpath).await.map_err(map_io_error)?;
            }
            FileKind::Regular => {
                if let Some(parent) = cpath.parent() {
                    fs::create_dir_all(parent).await.map_err(map_io_error)?;
                }
                if let Err(err) = fs::copy(&upath, &cpath).await {
                    return Err(self.upstream.note_fatal(err).await);
                }
                copy_stat_blocking(&meta, &cpath).await?;
            }
            // Special nodes mirror as empty markers; their identity lives
            // in the overlay's full mode.
            _ => {
                fs::File::create(&cpath).await.map_err(map_io_error)?;
                copy_stat_blocking(&meta, &cpath).await?;
            }
        }

        if !Self::is_root(path) {
            self.overlay.set(&cpath, stat.uid, stat.gid, stat.mode)?;
        }
        self.name_map.record(path, stat.ino);
        self.stats.insert(upath, Arc::new(stat));
        Ok(())
    }

    async fn fetch_dir(
        &self,
        path: &Path,
        upath: &Path,
        cpath: &Path,
        stat: &FileStat,
    ) -> FsResult<()> {
        if !Self::is_root(path) {
            match fs::create_dir(&cpath).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(map_io_error(err)),
            }
            set_mode_blocking(cpath, stat.mode & 0o7777).await?;
        }

        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&upath).await {
            Ok(entries) => entries,
            Err(err) => return Err(self.upstream.note_fatal(err).await),
        };
        while let Some(entry) = entries.next_entry().await.map_err(map_io_error)? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        self.dirents.insert(path.to_path_buf(), names);
        Ok(())
    }

    /// Remove a path's mirror, dropping its overlay entry and caches.
    pub(crate) async fn evict_inner(&self, path: &Path) -> FsResult<()> {
        let cpath = self.cache_path(path);
        let meta = fs::symlink_metadata(&cpath).await.map_err(map_io_error)?;
        use std::os::unix::fs::MetadataExt;
        let inode = meta.ino();

        if meta.is_dir() {
            fs::remove_dir(&cpath).await.map_err(map_io_error)?;
            self.drop_dirent_subtree(path);
        } else {
            fs::remove_file(&cpath).await.map_err(map_io_error)?;
        }

        self.invalidate_stat(path);
        self.note_dirent_removed(path);
        self.overlay.remove(inode)?;
        Ok(())
    }

    /// Public eviction, e.g. after replay routes a path to conflict.
    pub async fn evict(&self, path: &Path) -> FsResult<()> {
        let _guard = self.lock(path).await;
        self.evict_inner(path).await
    }

    // ---- metadata operations ------------------------------------------

    /// Stat a path, preferring the cache and shadowing ownership with the
    /// overlay. While connected, uncached paths stat straight off the
    /// upstream through the stat cache.
    pub async fn stat_file(&self, path: &Path) -> FsResult<FileStat> {
        let _guard = self.lock(path).await;
        self.stat_file_inner(path).await
    }

    pub(crate) async fn stat_file_inner(&self, path: &Path) -> FsResult<FileStat> {
        if !Self::is_root(path) && self.sync_log.is_unlinked_file(path) {
            return Err(FsError::NotFound);
        }
        match self.resolve(path, true).await? {
            Resolution::Upstream(real) => {
                let stat = self.cached_stat(&real).await?;
                self.name_map.record(path, stat.ino);
                Ok((*stat).clone())
            }
            Resolution::Cache(real) | Resolution::Missing(real) => {
                let meta = fs::symlink_metadata(&real).await.map_err(map_io_error)?;
                let mut stat = FileStat::from_metadata(&meta);
                if !Self::is_root(path) {
                    if let Ok(perms) = self.overlay.get(&real) {
                        stat.apply_overlay(&perms);
                    }
                }
                Ok(stat)
            }
        }
    }

    /// POSIX access check against the effective (overlay-shadowed) stat.
    ///
    /// Directory traversal applies first: every ancestor needs execute
    /// permission before the leaf's own bits matter. Root bypasses.
    pub fn access<'a>(
        &'a self,
        uid: u32,
        gid: u32,
        groups: &'a [u32],
        path: &'a Path,
        mode: u32,
    ) -> futures::future::BoxFuture<'a, FsResult<bool>> {
        Box::pin(async move {
            if uid == 0 {
                return Ok(true);
            }
            if let Some(parent) = path.parent() {
                if parent != path && !self.access(uid, gid, groups, parent, 0o1).await? {
                    return Ok(false);
                }
            }
            let stat = self.stat_file(path).await?;
            if mode == 0 {
                return Ok(true); // F_OK: existence is enough
            }
            let triad = if uid == stat.uid {
                (stat.mode >> 6) & 0o7
            } else if stat.gid == gid || groups.contains(&stat.gid) {
                (stat.mode >> 3) & 0o7
            } else {
                stat.mode & 0o7
            };
            Ok(triad & mode == mode)
        })
    }

    /// List a directory. Connected, the upstream snapshot and the local
    /// cache contents merge, minus anything unlinked locally; offline the
    /// cache directory is the whole truth.
    pub async fn get_dirents(&self, path: &Path) -> FsResult<Vec<String>> {
        let _guard = self.lock(path).await;
        if !Self::is_root(path) && self.sync_log.is_unlinked_file(path) {
            return Err(FsError::NotFound);
        }
        self.resolve(path, false).await?;

        let mut names: HashSet<String> = HashSet::new();
        if self.signals.upstream_available() {
            if let Some(snapshot) = self.dirents.get(path) {
                names.extend(snapshot.iter().cloned());
            } else {
                // Never fetched (the root, or a policy-deny directory):
                // list the upstream live and keep the snapshot.
                match fs::read_dir(&self.upstream_path(path)).await {
                    Ok(mut entries) => {
                        while let Some(entry) =
                            entries.next_entry().await.map_err(map_io_error)?
                        {
                            if let Some(name) = entry.file_name().to_str() {
                                names.insert(name.to_owned());
                            }
                        }
                        self.dirents
                            .insert(path.to_path_buf(), names.iter().cloned().collect());
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(self.upstream.note_fatal(err).await),
                }
            }
        }

        let cpath = self.cache_path(path);
        match fs::read_dir(&cpath).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await.map_err(map_io_error)? {
                    if let Some(name) = entry.file_name().to_str() {
                        names.insert(name.to_owned());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if !self.signals.upstream_available() {
                    return Err(FsError::NotFound);
                }
            }
            Err(err) => return Err(map_io_error(err)),
        }

        let mut names: Vec<String> = names
            .into_iter()
            .filter(|name| !self.sync_log.is_unlinked_file(&path.join(name)))
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn read_link(&self, path: &Path) -> FsResult<PathBuf> {
        let _guard = self.lock(path).await;
        if self.sync_log.is_unlinked_file(path) {
            return Err(FsError::NotFound);
        }
        let real = match self.resolve(path, false).await? {
            Resolution::Cache(real) | Resolution::Missing(real) => real,
            Resolution::Upstream(real) => real,
        };
        fs::read_link(&real).await.map_err(map_io_error)
    }

    // ---- data operations ----------------------------------------------

    /// Open semantics against the cache copy: O_CREAT materializes a new
    /// cache file, O_EXCL refuses an existing path, O_TRUNC invalidates
    /// the stat cache. Returns whether a node was created.
    pub async fn fake_open(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> FsResult<OpenOutcome> {
        let _guard = self.lock(path).await;

        if self.sync_log.is_unlinked_file(path) && !flags.create {
            return Err(FsError::NotFound);
        }

        let opcodes = self.plan_for(path, false).await?;
        let resolution = self.run_plan(path, &opcodes, flags.create).await?;
        let (real, on_upstream) = match resolution {
            Resolution::Cache(real) | Resolution::Missing(real) => (real, false),
            Resolution::Upstream(real) => (real, true),
        };

        let exists = fs::symlink_metadata(&real).await.is_ok();
        if exists && flags.create && flags.exclusive {
            return Err(FsError::AlreadyExists);
        }
        if !exists && !flags.create {
            return Err(FsError::NotFound);
        }
        if !exists {
            // Creating under an uncached parent has nowhere to land.
            if let Some(parent) = real.parent() {
                if fs::symlink_metadata(parent).await.is_err() {
                    return Err(FsError::NotFound);
                }
            }
        }

        let mut options = OpenOptions::new();
        options.read(flags.read).write(flags.write || flags.create);
        if flags.create {
            options.create(true);
        }
        if flags.exclusive {
            options.create_new(true);
        }
        if flags.truncate {
            options.truncate(true);
        }
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode & 0o7777);

        let file = options.open(&real).await.map_err(map_io_error)?;
        drop(file);

        if flags.truncate || !exists {
            self.invalidate_stat(path);
        }
        let created = !exists && flags.create;
        if created && !on_upstream {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                self.note_dirent_added(path, name);
            }
        }

        use std::os::unix::fs::MetadataExt;
        let inode = fs::symlink_metadata(&real).await.map_err(map_io_error)?.ino();
        Ok(OpenOutcome { created, inode, on_upstream })
    }

    /// Read a span of a file from wherever the plan resolves it.
    pub async fn read_file(&self, path: &Path, offset: u64, length: u64) -> FsResult<Vec<u8>> {
        let _guard = self.lock(path).await;
        if self.sync_log.is_unlinked_file(path) {
            return Err(FsError::NotFound);
        }
        let real = match self.resolve(path, false).await? {
            Resolution::Cache(real) | Resolution::Missing(real) => real,
            Resolution::Upstream(real) => real,
        };

        let attempt = async {
            let mut file = fs::File::open(&real).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut data = Vec::new();
            let mut remaining = length;
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
        };
        match attempt.await {
            Ok(data) => Ok(data),
            Err(err) => Err(self.upstream.note_fatal(err).await),
        }
    }

    /// Write into the cache copy. Always the cache: upstream propagation
    /// is replay's job. The returned pre-image is what occupied the
    /// written range beforehand, zero-padded past the old end of file.
    pub async fn write_file(&self, path: &Path, offset: u64, bytes: &[u8]) -> FsResult<WriteOutcome> {
        let _guard = self.lock(path).await;

        let opcodes = self.plan_for(path, false).await?;
        self.run_plan(path, &opcodes, false).await?;
        let cpath = self.cache_path(path);

        let end = offset + bytes.len() as u64;
        let pre_image = read_padded(&cpath, offset, end).await?;

        let mut file = OpenOptions::new()
            .write(true)
            .open(&cpath)
            .await
            .map_err(map_io_error)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(map_io_error)?;
        file.write_all(bytes).await.map_err(map_io_error)?;
        file.flush().await.map_err(map_io_error)?;

        self.invalidate_stat(path);

        use std::os::unix::fs::MetadataExt;
        let inode = fs::symlink_metadata(&cpath).await.map_err(map_io_error)?.ino();
        Ok(WriteOutcome { written: bytes.len(), inode, pre_image })
    }

    /// Truncate the cache copy.
    pub async fn truncate_file(&self, path: &Path, new_len: u64) -> FsResult<TruncateOutcome> {
        let _guard = self.lock(path).await;

        let opcodes = self.plan_for(path, false).await?;
        self.run_plan(path, &opcodes, false).await?;
        let cpath = self.cache_path(path);

        use std::os::unix::fs::MetadataExt;
        let meta = fs::symlink_metadata(&cpath).await.map_err(map_io_error)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&cpath)
            .await
            .map_err(map_io_error)?;
        file.set_len(new_len).await.map_err(map_io_error)?;

        self.invalidate_stat(path);
        Ok(TruncateOutcome { old_size: meta.size(), inode: meta.ino() })
    }

    /// Ensure the file is durably on its backing store.
    pub async fn sync_file(&self, path: &Path) -> FsResult<()> {
        let _guard = self.lock(path).await;
        let cpath = self.cache_path(path);
        match fs::File::open(&cpath).await {
            Ok(file) => file.sync_all().await.map_err(map_io_error),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(map_io_error(err)),
        }
    }

    // ---- structural operations ----------------------------------------

    /// Create a directory in the cache.
    pub async fn make_dir(&self, path: &Path, mode: u32) -> FsResult<u64> {
        let _guard = self.lock(path).await;
        let cpath = self.cache_path(path);
        fs::create_dir(&cpath).await.map_err(map_io_error)?;
        set_mode_blocking(&cpath, mode & 0o7777).await?;

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            self.note_dirent_added(path, name);
        }
        self.dirents.insert(path.to_path_buf(), Vec::new());
        self.invalidate_stat(path);

        use std::os::unix::fs::MetadataExt;
        Ok(fs::symlink_metadata(&cpath).await.map_err(map_io_error)?.ino())
    }

    /// Create a symlink in the cache.
    pub async fn make_symlink(&self, path: &Path, target: &Path) -> FsResult<u64> {
        let _guard = self.lock(path).await;
        let cpath = self.cache_path(path);
        fs::symlink(target, &cpath).await.map_err(map_io_error)?;

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            self.note_dirent_added(path, name);
        }
        self.invalidate_stat(path);

        use std::os::unix::fs::MetadataExt;
        Ok(fs::symlink_metadata(&cpath).await.map_err(map_io_error)?.ino())
    }

    /// Create the cache-side marker for a special node (fifo, socket,
    /// device). The node's real identity lives in the overlay.
    pub async fn make_special(&self, path: &Path) -> FsResult<u64> {
        let _guard = self.lock(path).await;
        let cpath = self.cache_path(path);
        if fs::symlink_metadata(&cpath).await.is_ok() {
            return Err(FsError::AlreadyExists);
        }
        fs::File::create(&cpath).await.map_err(map_io_error)?;

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            self.note_dirent_added(path, name);
        }
        self.invalidate_stat(path);

        use std::os::unix::fs::MetadataExt;
        Ok(fs::symlink_metadata(&cpath).await.map_err(map_io_error)?.ino())
    }

    /// Rename within the cache. A directory destination resolves to
    /// `dest/basename(src)`; an existing file destination is replaced.
    /// Returns the resolved destination; the overlay needs no update
    /// because it keys on the unchanged inode.
    pub async fn rename(&self, old: &Path, new: &Path) -> FsResult<PathBuf> {
        let (_g1, _g2) = self.locks.lock_pair(old, new).await;

        let old_cpath = self.cache_path(old);
        let mut resolved = new.to_path_buf();
        let mut new_cpath = self.cache_path(new);

        if let Ok(meta) = fs::symlink_metadata(&new_cpath).await {
            if meta.is_dir() {
                let base = old.file_name().ok_or(FsError::InvalidArgument)?;
                resolved = new.join(base);
                new_cpath = self.cache_path(&resolved);
            } else {
                fs::remove_file(&new_cpath).await.map_err(map_io_error)?;
            }
        }

        let was_dir = fs::symlink_metadata(&old_cpath)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        fs::rename(&old_cpath, &new_cpath).await.map_err(map_io_error)?;

        self.note_dirent_removed(old);
        if let Some(name) = resolved.file_name().and_then(|n| n.to_str()) {
            self.note_dirent_added(&resolved, name);
        }
        if was_dir {
            // Snapshots under the old name are stale; they repopulate on
            // the next listing.
            self.drop_dirent_subtree(old);
        }
        self.invalidate_stat(old);
        self.invalidate_stat(&resolved);
        self.name_map.forget(old);

        Ok(resolved)
    }

    /// Run the plan for `path` so a mirrorable file ends up in the cache.
    /// Mutating operations call this before journalling against the cache
    /// inode.
    pub async fn ensure_cached(&self, path: &Path) -> FsResult<()> {
        let _guard = self.lock(path).await;
        self.resolve(path, false).await.map(|_| ())
    }

    /// Hard-link within the cache. Returns the (shared) inode of the link.
    pub async fn make_link(&self, source: &Path, link: &Path) -> FsResult<u64> {
        let (_g1, _g2) = self.locks.lock_pair(source, link).await;
        let src_cpath = self.cache_path(source);
        let link_cpath = self.cache_path(link);
        fs::hard_link(&src_cpath, &link_cpath).await.map_err(map_io_error)?;

        if let Some(name) = link.file_name().and_then(|n| n.to_str()) {
            self.note_dirent_added(link, name);
        }
        self.invalidate_stat(link);

        use std::os::unix::fs::MetadataExt;
        Ok(fs::symlink_metadata(&link_cpath).await.map_err(map_io_error)?.ino())
    }

    /// Apply a permission-bit change to the cache copy.
    pub async fn apply_mode(&self, path: &Path, mode: u32) -> FsResult<()> {
        let _guard = self.lock(path).await;
        let cpath = self.cache_path(path);
        set_mode_blocking(&cpath, mode & 0o7777).await?;
        self.invalidate_stat(path);
        Ok(())
    }

    /// Apply new timestamps to the cache copy.
    pub async fn apply_times(&self, path: &Path, atime: i64, mtime: i64) -> FsResult<()> {
        let _guard = self.lock(path).await;
        let cpath = self.cache_path(path);
        let result = task::spawn_blocking(move || {
            filetime::set_file_times(
                &cpath,
                filetime::FileTime::from_unix_time(atime, 0),
                filetime::FileTime::from_unix_time(mtime, 0),
            )
        })
        .await
        .map_err(|_| FsError::Io)?;
        result.map_err(map_io_error)?;
        self.invalidate_stat(path);
        Ok(())
    }

    /// The cache copy's inode, the identity every journal record keys on.
    pub async fn cache_inode(&self, path: &Path) -> FsResult<u64> {
        use std::os::unix::fs::MetadataExt;
        let meta = fs::symlink_metadata(&self.cache_path(path))
            .await
            .map_err(map_io_error)?;
        Ok(meta.ino())
    }

    /// The cache copy's current size.
    pub async fn cache_size(&self, path: &Path) -> FsResult<u64> {
        use std::os::unix::fs::MetadataExt;
        let meta = fs::symlink_metadata(&self.cache_path(path))
            .await
            .map_err(map_io_error)?;
        Ok(meta.size())
    }
}

/// Control attributes answering from the cache manager.
pub fn register_xattrs(registry: &mut crate::xattr::XattrRegistry) {
    use crate::policy::PolicyRule;
    use crate::xattr::{flag, XattrScope};

    registry.register(
        XattrScope::Any,
        "in-cache",
        Box::new(|ctx, path| Ok(flag(ctx.cache.is_cached_blocking(path)))),
    );
    registry.register(
        XattrScope::Root,
        "cached-dirents",
        Box::new(|ctx, _path| Ok(ctx.cache.describe_dirents())),
    );
    registry.register(
        XattrScope::Root,
        "cached-stats",
        Box::new(|ctx, _path| Ok(ctx.cache.describe_stats())),
    );
    registry.register_writable(
        XattrScope::Any,
        "should-cache",
        Box::new(|ctx, path| Ok(ctx.policy.describe(path))),
        Box::new(|ctx, path, value| {
            Box::pin(async move {
                let rule = PolicyRule::parse(&value)?;
                ctx.policy.set(&path, rule)
            })
        }),
    );
}

/// Read `[start, end)` from a file, zero-padding whatever the file does
/// not cover. A missing file reads as all zeroes.
pub(crate) async fn read_padded(path: &Path, start: u64, end: u64) -> FsResult<Vec<u8>> {
    if end < start {
        return Err(FsError::InvalidArgument);
    }
    let want = (end - start) as usize;
    let mut data = Vec::with_capacity(want);
    match fs::File::open(path).await {
        Ok(mut file) => {
            if file.seek(SeekFrom::Start(start)).await.is_ok() {
                let mut chunk = [0u8; 64 * 1024];
                while data.len() < want {
                    let cap = (want - data.len()).min(chunk.len());
                    match file.read(&mut chunk[..cap]).await {
                        Ok(0) => break,
                        Ok(got) => data.extend_from_slice(&chunk[..got]),
                        Err(err) => return Err(map_io_error(err)),
                    }
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(map_io_error(err)),
    }
    data.resize(want, 0);
    Ok(data)
}

/// Mirror permissions and timestamps from `meta` onto `dest`.
async fn copy_stat_blocking(meta: &std::fs::Metadata, dest: &Path) -> FsResult<()> {
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::fs::PermissionsExt;
    let mode = meta.mode() & 0o7777;
    let atime = meta.atime();
    let mtime = meta.mtime();
    let dest = dest.to_path_buf();
    let result = task::spawn_blocking(move || {
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
        filetime::set_file_times(
            &dest,
            filetime::FileTime::from_unix_time(atime, 0),
            filetime::FileTime::from_unix_time(mtime, 0),
        )
    })
    .await
    .map_err(|_| FsError::Io)?;
    result.map_err(map_io_error)
}

async fn set_mode_blocking(path: &Path, mode: u32) -> FsResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let path = path.to_path_buf();
    let result = task::spawn_blocking(move || {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
    })
    .await
    .map_err(|_| FsError::Io)?;
    result.map_err(|err| {
        warn!("unable to set mode: {err}");
        map_io_error(err)
    })
}
