//! Error types for the composer backend.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HwcError {
    /// The panel or connector does not have the requested capability.
    #[error("{0} is not supported")]
    Unsupported(&'static str),

    /// A sysfs node could not be read or written; retrying later may succeed.
    #[error("sysfs access to {path} failed: {source}")]
    NoResources {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),

    #[error("unknown display config {0}")]
    BadConfig(u32),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("required DRM property {name} is not available on object {object_id}")]
    MissingProperty { name: String, object_id: u32 },

    /// The kernel rejected an atomic commit.
    #[error("atomic commit failed with errno {errno}")]
    Commit { errno: i32 },

    #[error("{op} failed: {source}")]
    Drm {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("out of memory while creating a framebuffer")]
    NoMemory,
}

impl HwcError {
    pub(crate) fn drm(op: &'static str, source: io::Error) -> Self {
        if source.raw_os_error() == Some(libc::ENOMEM) {
            return Self::NoMemory;
        }
        Self::Drm { op, source }
    }

    /// Negative errno-style code for callers that keep integer status semantics.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Unsupported(_) => -libc::EOPNOTSUPP,
            Self::NoResources { .. } => -libc::EIO,
            Self::TimedOut(_) => -libc::ETIMEDOUT,
            Self::BadConfig(_) | Self::BadValue(_) | Self::MissingProperty { .. } => -libc::EINVAL,
            Self::Commit { errno } => *errno,
            Self::Drm { source, .. } => -source.raw_os_error().unwrap_or(libc::EIO),
            Self::NoMemory => -libc::ENOMEM,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

pub type Result<T, E = HwcError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drm_enomem_becomes_no_memory() {
        let err = HwcError::drm("AddFB2", io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(matches!(err, HwcError::NoMemory));
        assert_eq!(err.errno(), -libc::ENOMEM);
    }

    #[test]
    fn errno_mapping() {
        let err = HwcError::drm("PRIME_FD_TO_HANDLE", io::Error::from_raw_os_error(libc::EBADF));
        assert_eq!(err.errno(), -libc::EBADF);
        assert_eq!(HwcError::Commit { errno: -libc::EINVAL }.errno(), -libc::EINVAL);
        assert!(HwcError::Unsupported("local HBM").is_unsupported());
    }
}
