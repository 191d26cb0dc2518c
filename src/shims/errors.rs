//! Raising, inspecting and clearing the pending error.
//!
//! See the [module safety contract](crate::shims#safety).
#![allow(non_snake_case, clippy::missing_safety_doc)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

use super::flag;
use crate::context::BridgeState;
use crate::ffi::{Ctx, Handle};

/// Raise `exc_type` with a message. The message is decoded lossily so a
/// malformed message never masks the error being raised.
pub unsafe extern "C" fn ctx_Err_SetString(ctx: Ctx, exc_type: Handle, message: *const c_char) {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return;
    };
    let Some(exc_type) = st.resolve_arg(exc_type) else {
        return;
    };
    let message = if message.is_null() {
        String::new()
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    };
    st.raise(st.host.new_exception(&exc_type, &message));
}

pub unsafe extern "C" fn ctx_Err_Occurred(ctx: Ctx) -> c_int {
    match BridgeState::from_ctx(ctx) {
        Some(st) => flag(st.errors.occurred()),
        None => 0,
    }
}

pub unsafe extern "C" fn ctx_Err_Clear(ctx: Ctx) {
    if let Some(st) = BridgeState::from_ctx(ctx) {
        st.errors.clear();
    }
}

/// Take the pending error: returns a new handle to the exception instance
/// and clears the indicator, or the null handle when nothing is pending.
pub unsafe extern "C" fn ctx_Err_Fetch(ctx: Ctx) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    match st.errors.take() {
        Some(exc) => st.wrap(exc.value),
        None => Handle::NULL,
    }
}
