//! Error types for the hbridge crate.

use thiserror::Error;

use crate::host::HostException;

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bridge operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Handle is null.
    #[error("invalid handle")]
    InvalidHandle,

    /// Handle was closed, or its slot has since been reused.
    #[error("stale handle {0:#x}")]
    StaleHandle(u64),

    /// Handle was never issued by this table.
    #[error("foreign handle {0:#x}")]
    ForeignHandle(u64),

    /// Every slot of the handle table is in use.
    #[error("handle table exhausted (capacity {capacity})")]
    HandleTableFull {
        /// Maximum number of live handles.
        capacity: usize,
    },

    /// Native code was built against an incompatible context layout.
    #[error(
        "ABI version mismatch: bridge provides {expected_major}.{expected_minor}, \
         extension requires {found_major}.{found_minor}"
    )]
    VersionMismatch {
        /// Major version provided by the bridge.
        expected_major: u16,
        /// Minor version provided by the bridge.
        expected_minor: u16,
        /// Major version the extension was compiled against.
        found_major: u16,
        /// Minor version the extension was compiled against.
        found_minor: u16,
    },

    /// Module definition is malformed.
    #[error("invalid module definition: {0}")]
    InvalidModule(String),

    /// Pointer does not designate a live legacy wrapper.
    #[error("invalid legacy object")]
    InvalidLegacyObject,

    /// Function argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The host runtime raised an exception.
    #[error("host exception: {0:?}")]
    Host(HostException),

    /// The context backing a callback has been dropped.
    #[error("context released")]
    ContextReleased,
}

impl Error {
    /// Check if this is a handle validity error.
    pub fn is_handle_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidHandle | Error::StaleHandle(_) | Error::ForeignHandle(_)
        )
    }

    /// Check if this is an ABI version mismatch.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Error::VersionMismatch { .. })
    }

    /// Check if the handle table ran out of slots.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::HandleTableFull { .. })
    }

    /// The host exception carried by this error, if any.
    pub fn host_exception(&self) -> Option<&HostException> {
        match self {
            Error::Host(exc) => Some(exc),
            _ => None,
        }
    }
}

impl From<HostException> for Error {
    fn from(exc: HostException) -> Self {
        Error::Host(exc)
    }
}
