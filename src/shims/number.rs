//! Integer and float constructors, narrowing and arithmetic.
//!
//! See the [module safety contract](crate::shims#safety).
#![allow(non_snake_case, clippy::missing_safety_doc)]

use std::os::raw::{c_double, c_int, c_long, c_longlong, c_ulonglong};

use super::check;
use crate::context::BridgeState;
use crate::ffi::{Ctx, Handle};
use crate::host::{HostOp, Singleton, TypeKind};

pub unsafe extern "C" fn ctx_Long_Check(ctx: Ctx, h: Handle) -> c_int {
    check(ctx, h, TypeKind::Long)
}

pub unsafe extern "C" fn ctx_Long_FromLong(ctx: Ctx, value: c_long) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.from_i64(value as i64))
}

pub unsafe extern "C" fn ctx_Long_FromLongLong(ctx: Ctx, value: c_longlong) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.from_i64(value))
}

pub unsafe extern "C" fn ctx_Long_FromUnsignedLongLong(ctx: Ctx, value: c_ulonglong) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.from_u64(value))
}

/// Narrow an integer to `long`. Returns -1 with a pending error on failure;
/// callers tell that apart from a real -1 by checking `Err_Occurred`.
pub unsafe extern "C" fn ctx_Long_AsLong(ctx: Ctx, h: Handle) -> c_long {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(h) else {
        return -1;
    };
    let wide = match st.host.as_i64(&obj) {
        Ok(v) => v,
        Err(exc) => {
            st.raise(exc);
            return -1;
        }
    };
    match c_long::try_from(wide) {
        Ok(v) => v,
        Err(_) => {
            st.raise(st.host.raise(
                Singleton::OverflowError,
                "int too large to convert to C long",
            ));
            -1
        }
    }
}

pub unsafe extern "C" fn ctx_Float_FromDouble(ctx: Ctx, value: c_double) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.from_f64(value))
}

/// Returns -1.0 with a pending error on failure.
pub unsafe extern "C" fn ctx_Float_AsDouble(ctx: Ctx, h: Handle) -> c_double {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1.0;
    };
    let Some(obj) = st.resolve_arg(h) else {
        return -1.0;
    };
    match st.host.as_f64(&obj) {
        Ok(v) => v,
        Err(exc) => {
            st.raise(exc);
            -1.0
        }
    }
}

pub unsafe extern "C" fn ctx_Number_Add(ctx: Ctx, a: Handle, b: Handle) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(a) = st.resolve_arg(a) else {
        return Handle::NULL;
    };
    let Some(b) = st.resolve_arg(b) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.call(HostOp::Add, &[a, b]))
}
