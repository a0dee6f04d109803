//! Status vocabulary shared by every adapter operation.
//!
//! Providers speak `std::io::Error`; the protocol side speaks [`FsError`].
//! [`From<io::Error>`] is the only place the two are related, so call sites
//! just use `?` or `.map_err(FsError::from)`.

use std::io::{self, ErrorKind};

use thiserror::Error;

/// Result of a protocol operation. `Ok` is the OK status.
pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("function not implemented")]
    NotImplemented,

    /// Any other provider failure, kept intact for diagnostics.
    #[error("i/o error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => FsError::NotFound,
            ErrorKind::PermissionDenied => FsError::PermissionDenied,
            ErrorKind::InvalidInput => FsError::InvalidArgument,
            ErrorKind::Unsupported => FsError::NotImplemented,
            _ => FsError::Io(err),
        }
    }
}

impl FsError {
    /// Errno handed to the kernel for this status.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotImplemented => libc::ENOSYS,
            FsError::Io(err) => err.raw_os_error().unwrap_or_else(|| kind_errno(err.kind())),
        }
    }
}

impl From<FsError> for rfuse3::Errno {
    fn from(err: FsError) -> Self {
        err.errno().into()
    }
}

fn kind_errno(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::AlreadyExists => libc::EEXIST,
        ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
        ErrorKind::IsADirectory => libc::EISDIR,
        ErrorKind::NotADirectory => libc::ENOTDIR,
        ErrorKind::WouldBlock => libc::EAGAIN,
        ErrorKind::Interrupted => libc::EINTR,
        ErrorKind::StorageFull => libc::ENOSPC,
        ErrorKind::ReadOnlyFilesystem => libc::EROFS,
        ErrorKind::CrossesDevices => libc::EXDEV,
        ErrorKind::InvalidFilename => libc::ENAMETOOLONG,
        _ => libc::EIO,
    }
}

/// Treats end-of-stream on a positioned read or write as a zero-byte transfer.
pub(crate) fn swallow_eof(res: io::Result<usize>) -> io::Result<usize> {
    match res {
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(0),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_well_known_kinds() {
        assert!(matches!(
            FsError::from(io::Error::from(ErrorKind::NotFound)),
            FsError::NotFound
        ));
        assert!(matches!(
            FsError::from(io::Error::from_raw_os_error(libc::EACCES)),
            FsError::PermissionDenied
        ));
        assert!(matches!(
            FsError::from(io::Error::from(ErrorKind::InvalidInput)),
            FsError::InvalidArgument
        ));
        assert!(matches!(
            FsError::from(io::Error::from(ErrorKind::Unsupported)),
            FsError::NotImplemented
        ));
    }

    #[test]
    fn unknown_errors_keep_their_cause() {
        let err = FsError::from(io::Error::from_raw_os_error(libc::EEXIST));
        match &err {
            FsError::Io(inner) => assert_eq!(inner.raw_os_error(), Some(libc::EEXIST)),
            other => panic!("expected Io, got {other:?}"),
        }
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn errno_projection() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::PermissionDenied.errno(), libc::EACCES);
        assert_eq!(FsError::InvalidArgument.errno(), libc::EINVAL);
        assert_eq!(FsError::NotImplemented.errno(), libc::ENOSYS);
        assert_eq!(
            FsError::Io(io::Error::from(ErrorKind::DirectoryNotEmpty)).errno(),
            libc::ENOTEMPTY
        );
        assert_eq!(FsError::Io(io::Error::other("boom")).errno(), libc::EIO);
    }

    #[test]
    fn eof_is_swallowed_only_for_eof() {
        assert_eq!(
            swallow_eof(Err(io::Error::from(ErrorKind::UnexpectedEof))).unwrap(),
            0
        );
        assert_eq!(swallow_eof(Ok(7)).unwrap(), 7);
        assert!(swallow_eof(Err(io::Error::from(ErrorKind::NotFound))).is_err());
    }
}
