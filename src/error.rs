//! Error types for mirrorcrypt
//!
//! Every component returns [`Error`]. The FUSE layer turns it into a
//! libc errno with [`Error::errno`].

use libc::c_int;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Native I/O failure on the mirror directory
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Native failure reported through nix
    #[error("System error: {0}")]
    Errno(#[from] nix::errno::Errno),

    /// The cipher rejected the stream (bad header, unsupported format)
    #[error("Cipher failure: {0}")]
    Cipher(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Path too long: {len} bytes exceeds limit of {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("Invalid encryption marker value: {0:?}")]
    InvalidMarker(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Running as root opens unacceptable security holes")]
    Privileged,

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Mount failed: {0}")]
    Mount(String),
}

impl Error {
    /// libc error code reported to the kernel for this error
    pub fn errno(&self) -> c_int {
        match self {
            Error::Io(e) => io_errno(e),
            Error::Errno(e) => *e as c_int,
            Error::Cipher(_) => libc::EBADMSG,
            Error::PathTooLong { .. } => libc::ENAMETOOLONG,
            Error::InvalidMarker(_) | Error::InvalidArgument(_) => libc::EINVAL,
            Error::PathNotFound(_) => libc::ENOENT,
            Error::Privileged => libc::EPERM,
            Error::KeyDerivation(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::Mount(_) => libc::EIO,
        }
    }

    /// True when the underlying store does not support extended attributes
    pub fn is_unsupported(&self) -> bool {
        let code = self.errno();
        code == libc::ENOTSUP || code == libc::EOPNOTSUPP || code == libc::ENOSYS
    }
}

/// Native code when present, otherwise a best-effort mapping of the kind
fn io_errno(err: &std::io::Error) -> c_int {
    if let Some(code) = err.raw_os_error() {
        return code;
    }
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => libc::ENOENT,
        ErrorKind::PermissionDenied => libc::EACCES,
        ErrorKind::AlreadyExists => libc::EEXIST,
        ErrorKind::InvalidInput => libc::EINVAL,
        ErrorKind::UnexpectedEof => libc::EIO,
        ErrorKind::WouldBlock => libc::EAGAIN,
        ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}
