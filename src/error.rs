//! Error taxonomy for node handlers and the bridge.
//!
//! Mirrors `lnxdrive-fuse::error::FuseError`'s shape: a `thiserror`-derived
//! enum with a conversion to the host kernel's errno space, plus blanket
//! `From` impls so handler authors can bubble up arbitrary I/O failures.

use thiserror::Error;

/// A handler or bridge-level failure, convertible to a kernel errno.
#[derive(Error, Debug)]
pub enum Errno {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("read-only filesystem: {0}")]
    ReadOnly(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(String),
}

impl Errno {
    pub fn not_supported(capability: &str) -> Self {
        Errno::NotSupported(capability.to_string())
    }
}

impl From<Errno> for libc::c_int {
    fn from(err: Errno) -> libc::c_int {
        match err {
            Errno::NotFound(_) => libc::ENOENT,
            Errno::Exists(_) => libc::EEXIST,
            Errno::NotSupported(_) => libc::ENOSYS,
            Errno::ReadOnly(_) => libc::EROFS,
            Errno::Invalid(_) => libc::EINVAL,
            Errno::Busy(_) => libc::EBUSY,
            Errno::Interrupted => libc::EINTR,
            Errno::Io(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for Errno {
    fn from(err: std::io::Error) -> Self {
        Errno::Io(err.to_string())
    }
}

impl From<anyhow::Error> for Errno {
    fn from(err: anyhow::Error) -> Self {
        Errno::Io(err.to_string())
    }
}

/// Result type returned by handler capability methods.
pub type OpResult<T> = Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_expected_errno() {
        assert_eq!(libc::c_int::from(Errno::NotFound("x".into())), libc::ENOENT);
        assert_eq!(libc::c_int::from(Errno::Exists("x".into())), libc::EEXIST);
        assert_eq!(
            libc::c_int::from(Errno::NotSupported("getxattr".into())),
            libc::ENOSYS
        );
        assert_eq!(libc::c_int::from(Errno::Interrupted), libc::EINTR);
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk died");
        let errno: Errno = io.into();
        assert!(matches!(errno, Errno::Io(_)));
    }
}
