//! TsumuFS — a disconnected-operation caching filesystem core.
//!
//! The core mirrors a remote upstream filesystem into a local cache,
//! journals every mutation durably, and replays the journal upstream when
//! connectivity returns. Replay verifies recorded pre-images against the
//! upstream; divergence is preserved as conflict artifacts, never
//! silently discarded.

pub mod cache;
pub mod codec;
pub mod config;
pub mod context;
pub mod data_change;
pub mod data_region;
pub mod error;
pub mod fs;
pub mod metrics;
pub mod name_to_inode;
pub mod path_lock;
pub mod perms_overlay;
pub mod policy;
pub mod sync;
pub mod sync_item;
pub mod sync_log;
pub mod types;
pub mod upstream;
pub mod xattr;

/// Crate version, exposed through the `tsumufs.version` control xattr.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use context::{CoreContext, Layout, Signals};
pub use error::{FsError, FsResult};
pub use fs::{CallContext, TsumuFs};
pub use sync::SyncWorker;
