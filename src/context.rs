//! Process-wide wiring: control signals, the on-disk layout and the
//! [`CoreContext`] that owns every component.
//!
//! Nothing here is a global. The context is built once during startup and
//! passed (as an `Arc`) to the front-end, the replay worker and the control
//! xattr handlers.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::fs;
use tracing::info;

use crate::cache::CacheManager;
use crate::error::{map_io_error, FsResult};
use crate::metrics::Metrics;
use crate::name_to_inode::NameToInodeMap;
use crate::path_lock::PathLocks;
use crate::perms_overlay::PermsOverlay;
use crate::policy::CachePolicy;
use crate::sync_log::SyncLog;
use crate::upstream::{MountHelper, UpstreamMount};

/// Edge-triggered control flags, polled by the long-running tasks.
#[derive(Default)]
pub struct Signals {
    upstream_available: AtomicBool,
    force_disconnect: AtomicBool,
    sync_paused: AtomicBool,
    shutdown: AtomicBool,
}

impl Signals {
    pub fn new() -> Signals {
        Signals::default()
    }

    pub fn upstream_available(&self) -> bool {
        self.upstream_available.load(Ordering::SeqCst)
    }

    pub fn set_upstream_available(&self, value: bool) {
        self.upstream_available.store(value, Ordering::SeqCst);
    }

    pub fn force_disconnect(&self) -> bool {
        self.force_disconnect.load(Ordering::SeqCst)
    }

    pub fn set_force_disconnect(&self, value: bool) {
        self.force_disconnect.store(value, Ordering::SeqCst);
    }

    pub fn sync_paused(&self) -> bool {
        self.sync_paused.load(Ordering::SeqCst)
    }

    pub fn set_sync_paused(&self, value: bool) {
        self.sync_paused.store(value, Ordering::SeqCst);
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Where everything lives on disk.
///
/// Every logical path inside the mount maps to two concrete locations by
/// prefix substitution: one under the upstream mount point and one under
/// the local cache tree.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Where the host exposes the filesystem.
    pub mount_point: PathBuf,
    /// Where the upstream filesystem is mounted locally.
    pub upstream_root: PathBuf,
    /// Base directory holding the cache tree and the durable state files.
    pub cache_point: PathBuf,
    /// Cachespec file with explicit caching policy entries.
    pub cachespec_path: PathBuf,
    /// Logical path of the conflict subtree inside the mount.
    pub conflict_dir: PathBuf,
}

impl Layout {
    /// The mirrored file tree.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_point.join("cache")
    }

    /// The durable journal.
    pub fn sync_log_path(&self) -> PathBuf {
        self.cache_point.join("sync.log")
    }

    /// The durable permissions overlay.
    pub fn perms_path(&self) -> PathBuf {
        self.cache_point.join("permissions.ovr")
    }

    fn resolve(root: &Path, fusepath: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for part in fusepath.components() {
            if let Component::Normal(name) = part {
                out.push(name);
            }
        }
        out
    }

    /// The upstream location of a logical path.
    pub fn upstream_path_of(&self, fusepath: &Path) -> PathBuf {
        Self::resolve(&self.upstream_root, fusepath)
    }

    /// The cache location of a logical path.
    pub fn cache_path_of(&self, fusepath: &Path) -> PathBuf {
        Self::resolve(&self.cache_root(), fusepath)
    }

    /// The artifact name a conflicted path materializes under: the path
    /// with separators flattened to `-`.
    pub fn conflict_slug(fusepath: &Path) -> String {
        let flat = fusepath
            .to_string_lossy()
            .trim_start_matches('/')
            .replace('/', "-");
        if flat.is_empty() {
            "root".to_owned()
        } else {
            flat
        }
    }
}

/// Callback resolving the supplementary groups of a uid. Supplied by the
/// host environment; the permission checks never consult the local user
/// database directly.
pub type GroupsForUid = Box<dyn Fn(u32) -> Vec<u32> + Send + Sync>;

/// Everything the filesystem core needs, built once at startup.
pub struct CoreContext {
    pub layout: Layout,
    pub signals: Arc<Signals>,
    pub cache: CacheManager,
    pub sync_log: Arc<SyncLog>,
    pub upstream: Arc<UpstreamMount>,
    pub overlay: Arc<PermsOverlay>,
    pub name_map: Arc<NameToInodeMap>,
    pub policy: Arc<CachePolicy>,
    pub metrics: Metrics,
    pub groups: GroupsForUid,
}

impl CoreContext {
    /// Wire up every component over the given layout.
    ///
    /// Creates the cache point (and the cache tree under it) if absent,
    /// then loads the journal, the overlay and the caching policy from
    /// their state files.
    pub async fn new(
        layout: Layout,
        helper: Box<dyn MountHelper>,
        groups: GroupsForUid,
    ) -> FsResult<Arc<CoreContext>> {
        fs::create_dir_all(layout.cache_root()).await.map_err(map_io_error)?;
        info!(cache_point = %layout.cache_point.display(), "cache point ready");

        let signals = Arc::new(Signals::new());
        let cache_locks = Arc::new(PathLocks::new());
        let upstream_locks = Arc::new(PathLocks::new());
        let name_map = Arc::new(NameToInodeMap::new());
        let overlay = Arc::new(PermsOverlay::open(layout.perms_path()));
        let policy = Arc::new(CachePolicy::load(layout.cachespec_path.clone()));

        let sync_log = Arc::new(SyncLog::open(
            layout.sync_log_path(),
            cache_locks.clone(),
            upstream_locks.clone(),
        ));

        let upstream = Arc::new(UpstreamMount::new(
            layout.upstream_root.clone(),
            upstream_locks,
            signals.clone(),
            name_map.clone(),
            helper,
        ));

        let cache = CacheManager::new(
            layout.clone(),
            cache_locks,
            signals.clone(),
            sync_log.clone(),
            overlay.clone(),
            policy.clone(),
            name_map.clone(),
            upstream.clone(),
        );

        Ok(Arc::new(CoreContext {
            layout,
            signals,
            cache,
            sync_log,
            upstream,
            overlay,
            name_map,
            policy,
            metrics: Metrics::new(),
            groups,
        }))
    }

    /// A groups callback for hosts that cannot supply one: every uid is a
    /// member of its own primary group only.
    pub fn no_groups() -> GroupsForUid {
        Box::new(|_uid| Vec::new())
    }
}

/// Control attributes owned by the process-wide signal state.
pub fn register_xattrs(registry: &mut crate::xattr::XattrRegistry) {
    use crate::xattr::{flag, parse_flag, XattrScope};

    registry.register(
        XattrScope::Root,
        "version",
        Box::new(|_ctx, _path| Ok(crate::VERSION.to_owned())),
    );
    registry.register(
        XattrScope::Root,
        "connected",
        Box::new(|ctx, _path| Ok(flag(ctx.signals.upstream_available()))),
    );
    registry.register_writable(
        XattrScope::Root,
        "force-disconnect",
        Box::new(|ctx, _path| Ok(flag(ctx.signals.force_disconnect()))),
        Box::new(|ctx, _path, value| {
            Box::pin(async move {
                if parse_flag(&value)? {
                    ctx.signals.set_force_disconnect(true);
                    ctx.signals.set_upstream_available(false);
                    ctx.upstream.unmount().await;
                } else {
                    ctx.signals.set_force_disconnect(false);
                }
                Ok(())
            })
        }),
    );
    registry.register_writable(
        XattrScope::Root,
        "pause-sync",
        Box::new(|ctx, _path| Ok(flag(ctx.signals.sync_paused()))),
        Box::new(|ctx, _path, value| {
            Box::pin(async move {
                ctx.signals.set_sync_paused(parse_flag(&value)?);
                Ok(())
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_substitutes_prefixes() {
        let layout = Layout {
            mount_point: PathBuf::from("/mnt/t"),
            upstream_root: PathBuf::from("/var/lib/t/nfs"),
            cache_point: PathBuf::from("/var/cache/t"),
            cachespec_path: PathBuf::from("/var/lib/t/cachespec"),
            conflict_dir: PathBuf::from("/tsumufs-conflicts"),
        };
        assert_eq!(
            layout.upstream_path_of(Path::new("/a/b")),
            PathBuf::from("/var/lib/t/nfs/a/b")
        );
        assert_eq!(
            layout.cache_path_of(Path::new("/a/b")),
            PathBuf::from("/var/cache/t/cache/a/b")
        );
        assert_eq!(layout.cache_path_of(Path::new("/")), PathBuf::from("/var/cache/t/cache"));
    }

    #[test]
    fn conflict_slug_flattens_separators() {
        assert_eq!(Layout::conflict_slug(Path::new("/a/b/c")), "a-b-c");
        assert_eq!(Layout::conflict_slug(Path::new("/b")), "b");
        assert_eq!(Layout::conflict_slug(Path::new("/")), "root");
    }

    #[test]
    fn signals_default_clear() {
        let signals = Signals::new();
        assert!(!signals.upstream_available());
        assert!(!signals.shutdown());
        signals.set_upstream_available(true);
        signals.request_shutdown();
        assert!(signals.upstream_available());
        assert!(signals.shutdown());
    }
}
