//! `extern "C"` entry points behind the context's operation table.
//!
//! Every shim follows the same contract: resolve its handle arguments (never
//! touching the host when one is bad), call exactly one host capability,
//! and report failure through the sentinel return value plus the pending
//! error. Handles a shim returns are new and owned by the caller.
//!
//! # Safety
//!
//! Every shim is `unsafe` for the same reasons. `ctx` must be null or a
//! context of a live [`Bridge`](crate::Bridge). Pointer arguments must be
//! null or valid for the reads the operation documents: strings
//! NUL-terminated, arrays holding `nargs` handles.

pub mod errors;
pub mod number;
pub mod object;
pub mod sequence;

use std::os::raw::c_int;

use crate::context::BridgeState;
use crate::ffi::{Ctx, Handle};
use crate::host::TypeKind;

/// Native boolean from a predicate.
pub(crate) fn flag(value: bool) -> c_int {
    c_int::from(value)
}

/// Shared body of the `*_Check` predicates. A bad handle answers 0.
pub(crate) unsafe fn check(ctx: Ctx, h: Handle, kind: TypeKind) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return 0;
    };
    match st.resolve_arg(h) {
        Some(obj) => flag(st.host.is_instance(&obj, kind)),
        None => 0,
    }
}
