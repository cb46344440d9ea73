//! Journal records: one tagged entry per pending structural mutation.

use std::path::{Path, PathBuf};

use crate::types::FileKind;

/// A single pending mutation in the journal queue.
///
/// `Change` carries no data itself; the byte ranges and metadata deltas
/// live in the journal's side map keyed by `inode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncItem {
    /// A node created locally that does not yet exist upstream.
    New { kind: FileKind, path: PathBuf },
    /// A hard link created locally. Journalled but not replayed.
    Link { inode: u64, path: PathBuf },
    /// A node removed locally.
    Unlink { kind: FileKind, path: PathBuf },
    /// Data or metadata modified on an already-mirrored node.
    Change { path: PathBuf, inode: u64 },
    /// A node moved locally.
    Rename { inode: u64, old_path: PathBuf, new_path: PathBuf },
}

impl SyncItem {
    /// The path this record acts on; for renames, the destination.
    pub fn path(&self) -> &Path {
        match self {
            SyncItem::New { path, .. }
            | SyncItem::Link { path, .. }
            | SyncItem::Unlink { path, .. }
            | SyncItem::Change { path, .. } => path,
            SyncItem::Rename { new_path, .. } => new_path,
        }
    }

    /// Whether this record references `path` at all.
    pub fn touches(&self, path: &Path) -> bool {
        match self {
            SyncItem::Rename { old_path, new_path, .. } => {
                old_path == path || new_path == path
            }
            _ => self.path() == path,
        }
    }

    /// The side-map key, for variants that carry one.
    pub fn inode(&self) -> Option<u64> {
        match self {
            SyncItem::Link { inode, .. }
            | SyncItem::Change { inode, .. }
            | SyncItem::Rename { inode, .. } => Some(*inode),
            _ => None,
        }
    }
}
