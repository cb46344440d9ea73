//! Validation helpers for paths crossing the host boundary.

use std::path::{Component, Path};

use crate::error::{FsError, FsResult};

/// Maximum length of a single path component.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a full path.
pub const MAX_PATH_LEN: usize = 1024;

/// Check a host-supplied path: absolute, bounded, and free of `.`/`..`
/// components.
pub fn validate_path(path: &Path) -> FsResult<()> {
    if !path.is_absolute() {
        return Err(FsError::InvalidArgument);
    }
    if path.as_os_str().len() > MAX_PATH_LEN {
        return Err(FsError::InvalidArgument);
    }
    for part in path.components() {
        match part {
            Component::RootDir => {}
            Component::Normal(name) => {
                if name.is_empty() || name.len() > MAX_NAME_LEN {
                    return Err(FsError::InvalidArgument);
                }
            }
            _ => return Err(FsError::InvalidArgument),
        }
    }
    Ok(())
}
