use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use tsumufs::config::DEFAULT_CONFLICT_DIR;
use tsumufs::context::{CoreContext, Layout};
use tsumufs::fs::{CallContext, TsumuFs};
use tsumufs::sync::SyncWorker;
use tsumufs::upstream::{LoopbackMountHelper, MountHelper};

/// Shareable wrapper so a test can keep a handle on the helper it gave
/// away to the core.
pub struct SharedHelper(pub Arc<LoopbackMountHelper>);

#[async_trait]
impl MountHelper for SharedHelper {
    async fn mount(&self) -> bool {
        self.0.mount().await
    }

    async fn unmount(&self) -> bool {
        self.0.unmount().await
    }

    async fn is_server_reachable(&self) -> bool {
        self.0.is_server_reachable().await
    }
}

/// A full core wired over two temp directories: one playing the upstream
/// mount, one holding the cache point and state files.
pub struct Fixture {
    pub upstream_dir: TempDir,
    pub state_dir: TempDir,
    pub helper: Arc<LoopbackMountHelper>,
    pub ctx: Arc<CoreContext>,
    pub fs: TsumuFs,
    pub worker: SyncWorker,
}

impl Fixture {
    /// Build a core that starts connected.
    pub async fn connected() -> Fixture {
        let fixture = Fixture::disconnected().await;
        fixture.connect();
        fixture
    }

    /// Build a core that starts disconnected.
    pub async fn disconnected() -> Fixture {
        let upstream_dir = TempDir::new().expect("create upstream dir");
        let state_dir = TempDir::new().expect("create state dir");

        let layout = Layout {
            mount_point: PathBuf::from("/mnt/tsumu-test"),
            upstream_root: upstream_dir.path().to_path_buf(),
            cache_point: state_dir.path().join("cachepoint"),
            cachespec_path: state_dir.path().join("cachespec"),
            conflict_dir: PathBuf::from(DEFAULT_CONFLICT_DIR),
        };

        let helper = Arc::new(LoopbackMountHelper::new());
        let ctx = CoreContext::new(
            layout,
            Box::new(SharedHelper(helper.clone())),
            CoreContext::no_groups(),
        )
        .await
        .expect("core context");

        let fs = TsumuFs::new(ctx.clone());
        let worker = SyncWorker::new(ctx.clone());
        Fixture { upstream_dir, state_dir, helper, ctx, fs, worker }
    }

    pub fn connect(&self) {
        self.ctx.signals.set_upstream_available(true);
    }

    pub fn disconnect(&self) {
        self.ctx.signals.set_upstream_available(false);
    }

    /// Replay everything currently queued.
    pub async fn drain(&self) {
        self.worker.drain().await;
    }

    pub fn upstream_path(&self, name: &str) -> PathBuf {
        self.upstream_dir.path().join(name.trim_start_matches('/'))
    }

    pub fn write_upstream(&self, name: &str, data: &[u8]) {
        std::fs::write(self.upstream_path(name), data).expect("write upstream file");
    }

    pub fn read_upstream(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.upstream_path(name)).expect("read upstream file")
    }

    pub fn upstream_exists(&self, name: &str) -> bool {
        std::fs::symlink_metadata(self.upstream_path(name)).is_ok()
    }

    pub fn cache_path(&self, fusepath: &str) -> PathBuf {
        self.ctx.layout.cache_path_of(Path::new(fusepath))
    }

    pub fn cache_exists(&self, fusepath: &str) -> bool {
        std::fs::symlink_metadata(self.cache_path(fusepath)).is_ok()
    }
}

pub fn root_call() -> CallContext {
    CallContext { uid: 0, gid: 0, pid: 1 }
}

pub fn user_call(uid: u32, gid: u32) -> CallContext {
    CallContext { uid, gid, pid: 1 }
}
