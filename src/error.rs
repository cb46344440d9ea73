//! Error vocabulary shared by every filesystem-facing component.

use std::io;

/// Result alias used by all cache, journal and replay operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Operation status codes surfaced by the filesystem core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FsError {
    /// No such file or directory.
    NotFound,
    /// The caller does not have permission to perform the operation.
    PermissionDenied,
    /// A non-directory was named in a directory operation.
    NotADirectory,
    /// A directory was named in a non-directory operation.
    IsADirectory,
    /// The target of a create-style operation already exists.
    AlreadyExists,
    /// An attempt was made to remove a non-empty directory.
    NotEmpty,
    /// Invalid or unsupported argument for the operation.
    InvalidArgument,
    /// The upstream mount died underneath an I/O call (EIO or ESTALE).
    /// Seeing this error means the process has degraded to disconnected
    /// mode; the caller should retry against the cache.
    UpstreamGone,
    /// Replay found the upstream diverged from the recorded pre-image.
    /// Never surfaced to host callers.
    Conflict,
    /// The operation is not supported.
    Unsupported,
    /// Any other hard I/O error.
    Io,
}

impl FsError {
    /// The closest errno for handing back across the host boundary.
    pub fn errno(self) -> i32 {
        match self {
            FsError::NotFound => 2,          // ENOENT
            FsError::PermissionDenied => 13, // EACCES
            FsError::NotADirectory => 20,    // ENOTDIR
            FsError::IsADirectory => 21,     // EISDIR
            FsError::AlreadyExists => 17,    // EEXIST
            FsError::NotEmpty => 39,         // ENOTEMPTY
            FsError::InvalidArgument => 22,  // EINVAL
            FsError::Unsupported => 95,      // EOPNOTSUPP
            FsError::UpstreamGone | FsError::Conflict | FsError::Io => 5, // EIO
        }
    }
}

/// Map a host `io::Error` to the closest core status code.
pub fn map_io_error(err: io::Error) -> FsError {
    use io::ErrorKind::*;
    match err.kind() {
        NotFound => FsError::NotFound,
        PermissionDenied => FsError::PermissionDenied,
        AlreadyExists => FsError::AlreadyExists,
        InvalidInput | InvalidData => FsError::InvalidArgument,
        NotADirectory => FsError::NotADirectory,
        IsADirectory => FsError::IsADirectory,
        DirectoryNotEmpty => FsError::NotEmpty,
        Unsupported => FsError::Unsupported,
        _ => FsError::Io,
    }
}

/// Whether an upstream I/O failure means the mount itself is gone.
///
/// EIO and ESTALE from an NFS-style mount indicate the server stopped
/// answering or handed back a stale handle; every other errno is an
/// ordinary per-file failure and propagates verbatim.
pub fn is_fatal_upstream_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(5) | Some(116)) // EIO, ESTALE
}
