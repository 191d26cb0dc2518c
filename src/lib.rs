//! A handle-based bridge between native extension code and a managed host
//! runtime.
//!
//! Native code never sees host objects directly. It receives a context
//! pointer whose table of operations it calls with opaque [`Handle`]s; the
//! bridge resolves those through a generation-checked [`HandleTable`],
//! invokes the host through the [`HostRuntime`] trait, and reports failure
//! with a sentinel return value plus a per-thread pending error.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hbridge::host::MemoryHost;
//! use hbridge::{Bridge, BridgeOptions};
//!
//! fn main() -> hbridge::Result<()> {
//!     let host = Arc::new(MemoryHost::new());
//!     let bridge = Bridge::with_options(host, BridgeOptions::from_env())?;
//!
//!     // Hand `ctx` to native code; every operation goes through it.
//!     let ctx = bridge.context();
//!     let list = unsafe { ((*ctx).ctx_List_New)(ctx, 0) };
//!     assert!(list.is_valid());
//!     unsafe { ((*ctx).ctx_Close)(ctx, list) };
//!     Ok(())
//! }
//! ```
//!
//! Extensions built against the older pointer convention go through the
//! [`legacy`] adapter, which backs every `LegacyObject` with handles.

pub mod context;
pub mod error;
pub mod ffi;
pub mod host;
pub mod legacy;
mod module;
pub mod shims;
pub mod table;
pub mod types;

// Re-export main types at the crate root
pub use context::Bridge;
pub use error::{Error, Result};
pub use ffi::{Handle, HContext, MethodDef, ModuleDef, SlotDef};
pub use host::{HostException, HostRef, HostRuntime, Singleton};
pub use legacy::{LegacyAdapter, LegacyObject};
pub use table::{Closed, HandleTable};
pub use types::{BridgeOptions, CallingConvention, InvalidHandlePolicy};

use std::os::raw::c_int;

/// Context ABI version constants.
pub mod version {
    use std::os::raw::c_int;

    use crate::error::{Error, Result};

    /// ABI major version. Extensions must match it exactly.
    pub const MAJOR: u16 = 1;
    /// ABI minor version. Extensions built against an older minor run
    /// unchanged; newer minors are refused.
    pub const MINOR: u16 = 1;

    /// Pack a version the way `ctx_version` stores it.
    pub const fn pack(major: u16, minor: u16) -> c_int {
        ((major as c_int) << 16) | minor as c_int
    }

    /// Split a packed version into `(major, minor)`.
    pub const fn unpack(packed: c_int) -> (u16, u16) {
        (((packed >> 16) & 0xffff) as u16, (packed & 0xffff) as u16)
    }

    /// The packed version of this bridge.
    pub const fn packed() -> c_int {
        pack(MAJOR, MINOR)
    }

    /// Check the packed version an extension was compiled against.
    pub fn check_abi_version(packed: c_int) -> Result<()> {
        let (major, minor) = unpack(packed);
        if packed < 0 || !super::api_version_compatible(major, minor) {
            return Err(Error::VersionMismatch {
                expected_major: MAJOR,
                expected_minor: MINOR,
                found_major: major,
                found_minor: minor,
            });
        }
        Ok(())
    }
}

/// Get the ABI version string (e.g., "1.1").
pub fn api_version() -> String {
    format!("{}.{}", version::MAJOR, version::MINOR)
}

/// Check if this bridge can serve code compiled against `major.minor`.
pub fn api_version_compatible(major: u16, minor: u16) -> bool {
    major == version::MAJOR && minor <= version::MINOR
}

/// Read the version stored in a context.
///
/// # Safety
///
/// `ctx` must point to a live context.
pub unsafe fn context_version(ctx: *const HContext) -> c_int {
    (*ctx).ctx_version
}
