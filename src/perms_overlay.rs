//! Durable ownership/mode overlay for cached files.
//!
//! The cache tree lives on a local filesystem owned by the daemon user, so
//! the real upstream ownership and mode of each mirrored file cannot be
//! expressed on disk without breaking replay. They are shadowed here
//! instead, keyed by the cache copy's inode number: renames move paths but
//! leave the inode alone, so the overlay survives them without rewriting.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::codec;
use crate::error::{map_io_error, FsError, FsResult};

/// Ownership and mode shadowed for one cached file. `mode` carries the
/// full `st_mode`, type bits included.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FilePerms {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

pub struct PermsOverlay {
    state_path: PathBuf,
    overlay: Mutex<HashMap<u64, FilePerms>>,
}

impl PermsOverlay {
    /// Open the overlay, loading any previous state from `state_path`.
    /// A missing file starts empty; a corrupt one is logged and dropped.
    pub fn open(state_path: PathBuf) -> PermsOverlay {
        let overlay = match fs::read(&state_path) {
            Ok(data) => match codec::decode_overlay(&data) {
                Ok(map) => map,
                Err(err) => {
                    warn!("discarding corrupt permissions overlay: {err}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        PermsOverlay { state_path, overlay: Mutex::new(overlay) }
    }

    fn cache_inode(cache_path: &Path) -> FsResult<u64> {
        use std::os::unix::fs::MetadataExt;
        Ok(fs::symlink_metadata(cache_path).map_err(map_io_error)?.ino())
    }

    /// Look up the shadowed permissions for the file at `cache_path`.
    pub fn get(&self, cache_path: &Path) -> FsResult<FilePerms> {
        let inode = Self::cache_inode(cache_path)?;
        self.get_by_inode(inode)
    }

    pub fn get_by_inode(&self, inode: u64) -> FsResult<FilePerms> {
        let overlay = self.overlay.lock().unwrap();
        overlay.get(&inode).copied().ok_or(FsError::NotFound)
    }

    /// Record permissions for the file at `cache_path`, flushing to disk
    /// before returning.
    pub fn set(&self, cache_path: &Path, uid: u32, gid: u32, mode: u32) -> FsResult<()> {
        let inode = Self::cache_inode(cache_path)?;
        let mut overlay = self.overlay.lock().unwrap();
        overlay.insert(inode, FilePerms { uid, gid, mode });
        self.checkpoint(&overlay)
    }

    /// Drop the record for an inode, flushing to disk before returning.
    /// Unknown inodes are ignored.
    pub fn remove(&self, inode: u64) -> FsResult<()> {
        let mut overlay = self.overlay.lock().unwrap();
        if overlay.remove(&inode).is_some() {
            self.checkpoint(&overlay)?;
        }
        Ok(())
    }

    fn checkpoint(&self, overlay: &HashMap<u64, FilePerms>) -> FsResult<()> {
        let encoded = codec::encode_overlay(overlay).map_err(|err| {
            warn!("unable to encode permissions overlay: {err}");
            FsError::Io
        })?;
        let tmp = self.state_path.with_extension("tmp");
        fs::write(&tmp, &encoded).map_err(map_io_error)?;
        fs::rename(&tmp, &self.state_path).map_err(map_io_error)
    }

    /// Human-readable dump for the control xattr surface.
    pub fn describe(&self) -> String {
        let overlay = self.overlay.lock().unwrap();
        let mut inodes: Vec<&u64> = overlay.keys().collect();
        inodes.sort();
        let mut out = String::from("{");
        for (idx, inode) in inodes.iter().enumerate() {
            let perms = overlay[inode];
            if idx > 0 {
                out.push(',');
            }
            let _ = write!(
                out,
                " {}: (uid: {}, gid: {}, mode: {:o})",
                inode, perms.uid, perms.gid, perms.mode
            );
        }
        out.push_str(" }");
        out
    }

    pub fn len(&self) -> usize {
        self.overlay.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Control attribute dumping the overlay.
pub fn register_xattrs(registry: &mut crate::xattr::XattrRegistry) {
    use crate::xattr::XattrScope;

    registry.register(
        XattrScope::Root,
        "perms-overlay",
        Box::new(|ctx, _path| Ok(ctx.overlay.describe())),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();

        let overlay = PermsOverlay::open(dir.path().join("permissions.ovr"));
        overlay.set(&file, 100, 200, 0o100640).unwrap();
        assert_eq!(
            overlay.get(&file).unwrap(),
            FilePerms { uid: 100, gid: 200, mode: 0o100640 }
        );

        use std::os::unix::fs::MetadataExt;
        let inode = fs::symlink_metadata(&file).unwrap().ino();
        overlay.remove(inode).unwrap();
        assert_eq!(overlay.get(&file).unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        let state = dir.path().join("permissions.ovr");

        PermsOverlay::open(state.clone()).set(&file, 1, 2, 0o100755).unwrap();

        let reopened = PermsOverlay::open(state);
        assert_eq!(reopened.get(&file).unwrap(), FilePerms { uid: 1, gid: 2, mode: 0o100755 });
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("permissions.ovr");
        fs::write(&state, b"not an overlay file").unwrap();
        assert!(PermsOverlay::open(state).is_empty());
    }
}
