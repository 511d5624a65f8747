#![forbid(unsafe_code)]
//! Error types for VOpt.
//!
//! Defines `VoptError` and a `Result<T>` alias used throughout the workspace.

use thiserror::Error;

/// Unified error type for all VOpt operations.
#[derive(Debug, Error)]
pub enum VoptError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("bad state: {0}")]
    BadState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device is in read-only mode")]
    ReadOnly,

    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("chapter capacity exceeded")]
    VolumeOverflow,

    #[error("lock error: {0}")]
    LockError(&'static str),

    #[error("component busy: {0}")]
    ComponentBusy(&'static str),

    #[error("invalid admin state transition: {0}")]
    InvalidAdminState(String),

    #[error("bad configuration: {0}")]
    BadConfiguration(String),

    #[error("no threads configured for {0}")]
    NoThreads(&'static str),

    #[error("operation cancelled by drain")]
    Cancelled,

    #[error("unsupported version {found} (supported {min}..={max})")]
    UnsupportedVersion { found: u32, min: u32, max: u32 },
}

impl VoptError {
    /// True for errors that force the device into read-only mode when they
    /// reach a metadata write path.
    #[must_use]
    pub fn is_read_only_trigger(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::CorruptJournal(_) | Self::BadState(_)
        )
    }

    /// True when the caller may retry after waiting (resource exhaustion
    /// rather than corruption).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ComponentBusy(_) | Self::LockError("pool-empty"))
    }
}

/// Result alias using `VoptError`.
pub type Result<T> = std::result::Result<T, VoptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_triggers() {
        assert!(VoptError::CorruptJournal("x".to_owned()).is_read_only_trigger());
        assert!(!VoptError::NoSpace.is_read_only_trigger());
        assert!(!VoptError::ReadOnly.is_read_only_trigger());
    }

    #[test]
    fn transient_kinds() {
        assert!(VoptError::LockError("pool-empty").is_transient());
        assert!(VoptError::ComponentBusy("packer").is_transient());
        assert!(!VoptError::CorruptJournal("x".to_owned()).is_transient());
    }
}
