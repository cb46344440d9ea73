//! The control extended-attribute surface.
//!
//! Every control attribute lives in the `tsumufs.` namespace and is backed
//! by a handler in an explicit registration table keyed by `(scope, name)`.
//! Each subsystem contributes its handlers through a `register_xattrs`
//! function at startup; the dispatcher consults only the table, so unknown
//! names and writes to read-only attributes uniformly answer
//! `Unsupported`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::CoreContext;
use crate::error::{FsError, FsResult};

/// Namespace prefix for every control attribute.
pub const XATTR_PREFIX: &str = "tsumufs.";

/// Which nodes an attribute answers on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum XattrScope {
    /// Only the mount root.
    Root,
    /// Every node in the tree.
    Any,
}

pub type ReadHandler = Box<dyn Fn(&CoreContext, &Path) -> FsResult<String> + Send + Sync>;
pub type WriteHandler =
    Box<dyn Fn(Arc<CoreContext>, PathBuf, String) -> BoxFuture<'static, FsResult<()>> + Send + Sync>;

struct XattrEntry {
    read: ReadHandler,
    write: Option<WriteHandler>,
}

#[derive(Default)]
pub struct XattrRegistry {
    entries: HashMap<(XattrScope, String), XattrEntry>,
}

fn qualified(name: &str) -> String {
    if name.starts_with(XATTR_PREFIX) {
        name.to_owned()
    } else {
        format!("{XATTR_PREFIX}{name}")
    }
}

impl XattrRegistry {
    pub fn new() -> XattrRegistry {
        XattrRegistry::default()
    }

    /// Install a read-only attribute.
    pub fn register(&mut self, scope: XattrScope, name: &str, read: ReadHandler) {
        self.entries.insert((scope, qualified(name)), XattrEntry { read, write: None });
    }

    /// Install a writable attribute.
    pub fn register_writable(
        &mut self,
        scope: XattrScope,
        name: &str,
        read: ReadHandler,
        write: WriteHandler,
    ) {
        self.entries
            .insert((scope, qualified(name)), XattrEntry { read, write: Some(write) });
    }

    fn entry(&self, path: &Path, name: &str) -> Option<&XattrEntry> {
        let name = qualified(name);
        if path == Path::new("/") {
            if let Some(entry) = self.entries.get(&(XattrScope::Root, name.clone())) {
                return Some(entry);
            }
        }
        self.entries.get(&(XattrScope::Any, name))
    }

    /// Answer a `getxattr`.
    pub fn get(&self, ctx: &CoreContext, path: &Path, name: &str) -> FsResult<String> {
        match self.entry(path, name) {
            Some(entry) => (entry.read)(ctx, path),
            None => Err(FsError::Unsupported),
        }
    }

    /// Answer a `setxattr`. Read-only attributes refuse.
    pub async fn set(
        &self,
        ctx: &Arc<CoreContext>,
        path: &Path,
        name: &str,
        value: &str,
    ) -> FsResult<()> {
        let entry = self.entry(path, name).ok_or(FsError::Unsupported)?;
        let write = entry.write.as_ref().ok_or(FsError::Unsupported)?;
        write(ctx.clone(), path.to_path_buf(), value.to_owned()).await
    }

    /// Names visible on `path`, sorted.
    pub fn list(&self, path: &Path) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .keys()
            .filter(|(scope, _)| *scope == XattrScope::Any || path == Path::new("/"))
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Assemble the full control surface from every subsystem's handlers.
pub fn build_registry() -> XattrRegistry {
    let mut registry = XattrRegistry::new();
    crate::context::register_xattrs(&mut registry);
    crate::sync_log::register_xattrs(&mut registry);
    crate::cache::register_xattrs(&mut registry);
    crate::perms_overlay::register_xattrs(&mut registry);
    crate::metrics::register_xattrs(&mut registry);
    registry
}

/// Render a flag as the `0`/`1` strings the control surface speaks.
pub fn flag(value: bool) -> String {
    if value {
        "1".to_owned()
    } else {
        "0".to_owned()
    }
}

/// Parse a `0`/`1` control value.
pub fn parse_flag(value: &str) -> FsResult<bool> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(FsError::InvalidArgument),
    }
}
