//! The binary surface shared with native extension code.
//!
//! `raw` fixes the layout of the context and module descriptors, `handles`
//! defines the handle token and `error` the pending-error indicator.

pub mod error;
pub mod handles;
pub mod raw;

pub use error::{check_function_result, host_exception_for, raise_bridge_error, ErrorState};
pub use handles::*;
pub use raw::*;
