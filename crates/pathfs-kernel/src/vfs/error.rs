//! VFS error types.

use std::fmt::Display;
use std::io;
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path is not in `~`/`.` notation, contains `\`, or pops past its root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation is not supported for this path or namespace.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Region exceeds the file or buffer size.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Structurally disallowed (removing a root, writing a folder, ...).
    #[error("illegal operation: {0}")]
    Illegal(String),

    /// Access flags forbid the request.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The native watcher could not be created or attached.
    #[error("watch error: {0}")]
    Watch(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotSupported error.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create an OutOfBounds error.
    pub fn out_of_bounds(msg: impl Into<String>) -> Self {
        Self::OutOfBounds(msg.into())
    }

    /// Create an Illegal error.
    pub fn illegal(msg: impl Into<String>) -> Self {
        Self::Illegal(msg.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a Watch error.
    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch(msg.into())
    }

    /// Map an I/O error onto the taxonomy, keeping the path for context.
    pub(crate) fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            _ => Self::Io(err),
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::InvalidPath(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::NotSupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            VfsError::OutOfBounds(msg) => io::Error::new(io::ErrorKind::UnexpectedEof, msg),
            VfsError::Illegal(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::Watch(msg) => io::Error::other(msg),
            VfsError::Io(e) => e,
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

/// Abort on a contract violation that means the tree can no longer be trusted.
///
/// Never returns. Continuing past a corrupted index range would hand out
/// handles that point at the wrong records.
#[track_caller]
pub fn fatal(message: impl Display) -> ! {
    tracing::error!(%message, "fatal file system error");
    panic!("fatal file system error: {message}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_mapping() {
        let err: io::Error = VfsError::not_found("~/a").into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let err: io::Error = VfsError::not_supported("cross-directory move").into();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn test_from_io_keeps_path() {
        let err = VfsError::from_io(io::Error::from(io::ErrorKind::NotFound), "./gone");
        assert!(matches!(err, VfsError::NotFound(p) if p == "./gone"));

        let err = VfsError::from_io(io::Error::other("boom"), "./x");
        assert!(matches!(err, VfsError::Io(_)));
    }

    #[test]
    #[should_panic(expected = "fatal file system error")]
    fn test_fatal_panics() {
        fatal("lookup table disagrees with array");
    }
}
