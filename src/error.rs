//! Gateway-wide error kinds.
//!
//! Every failure crossing a component boundary is one of these; nothing is
//! retried locally. [`Error::errno`] gives the positive errno value the FUSE
//! reply layer negates on the wire.

use std::io;

/// Error kinds recognized across the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed input: bad cfgstring, bad block size, range wrap.
    #[error("invalid argument")]
    Invalid,
    /// Reference to an unknown minor or unknown node.
    #[error("no such device")]
    NoDevice,
    /// Feature not implemented by the handler.
    #[error("not implemented by handler")]
    NoEnt,
    /// Resource in use: non-empty directory, held node, handler with devices.
    #[error("resource busy")]
    Busy,
    /// Duplicate name or subtype.
    #[error("already exists")]
    Exists,
    /// Fixed-capacity table exhausted.
    #[error("table full")]
    NoSpace,
    /// No node or entry with that name.
    #[error("not found")]
    NotFound,
    /// Directory still has children.
    #[error("directory not empty")]
    NotEmpty,
    /// Kind mismatch: I/O on a directory.
    #[error("is a directory")]
    IsDirectory,
    /// Kind mismatch: listing a non-directory.
    #[error("not a directory")]
    NotDirectory,
    /// Non-OK status surfaced from a handler.
    #[error("i/o error")]
    Io,
    /// Dynamic loader or symbol lookup failure.
    #[error("module load failure: {0}")]
    BadModule(String),
    /// Handler rejected a cfgstring, with its reason.
    #[error("bad config: {0}")]
    BadConfig(String),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The errno value reported for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Invalid => libc::EINVAL,
            Error::NoDevice => libc::ENODEV,
            Error::NoEnt => libc::ENOENT,
            Error::Busy => libc::EBUSY,
            Error::Exists => libc::EEXIST,
            Error::NoSpace => libc::ENOSPC,
            Error::NotFound => libc::ENOENT,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::IsDirectory => libc::EISDIR,
            Error::NotDirectory => libc::ENOTDIR,
            Error::Io => libc::EIO,
            Error::BadModule(_) => libc::EBADF,
            Error::BadConfig(_) => libc::EINVAL,
        }
    }
}

impl From<io::Error> for Error {
    fn from(_: io::Error) -> Self {
        Error::Io
    }
}
