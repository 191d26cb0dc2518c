//! Handle lifetime, attribute, item, truth and call operations.
//!
//! See the [module safety contract](crate::shims#safety).
#![allow(non_snake_case, clippy::missing_safety_doc)]

use std::os::raw::{c_char, c_int};

use log::{debug, warn};

use super::flag;
use crate::context::BridgeState;
use crate::ffi::{Ctx, Handle};
use crate::host::{HostOp, HostRef, HostResult, Singleton};
use crate::table::Closed;
use crate::types::InvalidHandlePolicy;

pub unsafe extern "C" fn ctx_Dup(ctx: Ctx, h: Handle) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    match st.table.duplicate(h) {
        Ok(dup) => dup,
        Err(err) => {
            st.fail(&err);
            Handle::NULL
        }
    }
}

/// Closing never sets a pending error; a bad handle is only reported
/// through the invalid-handle policy's log or trap.
pub unsafe extern "C" fn ctx_Close(ctx: Ctx, h: Handle) {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return;
    };
    match st.table.close(h) {
        Ok(Closed::Released) => {}
        Ok(Closed::Permanent) => debug!("ignored close of interned handle {:#x}", h.to_raw()),
        Err(err) => match st.policy {
            InvalidHandlePolicy::Trap => panic!("native code closed a bad handle: {err}"),
            InvalidHandlePolicy::Report => warn!("ignored close of a bad handle: {err}"),
        },
    }
}

pub unsafe extern "C" fn ctx_Object_IsTrue(ctx: Ctx, h: Handle) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(h) else {
        return -1;
    };
    match st.host.is_true(&obj) {
        Ok(truth) => flag(truth),
        Err(exc) => {
            st.raise(exc);
            -1
        }
    }
}

/// Host `len()` of a sized object, narrowed to `isize`.
pub(crate) fn length(st: &BridgeState, obj: &HostRef) -> HostResult<isize> {
    let len = st.host.call(HostOp::Len, std::slice::from_ref(obj))?;
    let len = st.host.as_i64(&len)?;
    isize::try_from(len).map_err(|_| {
        st.host
            .raise(Singleton::OverflowError, "length does not fit in a native size")
    })
}

/// Returns -1 with a pending error for unsized objects.
pub unsafe extern "C" fn ctx_Length(ctx: Ctx, h: Handle) -> isize {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(h) else {
        return -1;
    };
    match length(st, &obj) {
        Ok(len) => len,
        Err(exc) => {
            st.raise(exc);
            -1
        }
    }
}

pub unsafe extern "C" fn ctx_GetAttr(ctx: Ctx, obj: Handle, name: Handle) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return Handle::NULL;
    };
    let Some(name) = st.resolve_arg(name) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.call(HostOp::GetAttr, &[obj, name]))
}

pub unsafe extern "C" fn ctx_GetAttr_s(ctx: Ctx, obj: Handle, name: *const c_char) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return Handle::NULL;
    };
    let Some(name) = st.str_arg(name) else {
        return Handle::NULL;
    };
    let result = st
        .host
        .from_str(name)
        .and_then(|name| st.host.call(HostOp::GetAttr, &[obj, name]));
    st.wrap_result(result)
}

fn has_attr(st: &BridgeState, obj: HostRef, name: HostRef) -> c_int {
    // A failed lookup means "no"; the lookup's exception is not left pending.
    flag(st.host.call(HostOp::GetAttr, &[obj, name]).is_ok())
}

pub unsafe extern "C" fn ctx_HasAttr(ctx: Ctx, obj: Handle, name: Handle) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return 0;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return 0;
    };
    let Some(name) = st.resolve_arg(name) else {
        return 0;
    };
    has_attr(st, obj, name)
}

pub unsafe extern "C" fn ctx_HasAttr_s(ctx: Ctx, obj: Handle, name: *const c_char) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return 0;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return 0;
    };
    let Some(name) = st.str_arg(name) else {
        return 0;
    };
    match st.host.from_str(name) {
        Ok(name) => has_attr(st, obj, name),
        Err(_) => 0,
    }
}

pub unsafe extern "C" fn ctx_SetAttr(ctx: Ctx, obj: Handle, name: Handle, value: Handle) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return -1;
    };
    let Some(name) = st.resolve_arg(name) else {
        return -1;
    };
    let Some(value) = st.resolve_arg(value) else {
        return -1;
    };
    st.status(st.host.call(HostOp::SetAttr, &[obj, name, value]))
}

pub unsafe extern "C" fn ctx_SetAttr_s(
    ctx: Ctx,
    obj: Handle,
    name: *const c_char,
    value: Handle,
) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return -1;
    };
    let Some(name) = st.str_arg(name) else {
        return -1;
    };
    let Some(value) = st.resolve_arg(value) else {
        return -1;
    };
    let result = st
        .host
        .from_str(name)
        .and_then(|name| st.host.call(HostOp::SetAttr, &[obj, name, value]));
    st.status(result)
}

pub unsafe extern "C" fn ctx_GetItem(ctx: Ctx, obj: Handle, key: Handle) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return Handle::NULL;
    };
    let Some(key) = st.resolve_arg(key) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.call(HostOp::GetItem, &[obj, key]))
}

pub unsafe extern "C" fn ctx_GetItem_i(ctx: Ctx, obj: Handle, idx: isize) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return Handle::NULL;
    };
    let result = st
        .host
        .from_i64(idx as i64)
        .and_then(|key| st.host.call(HostOp::GetItem, &[obj, key]));
    st.wrap_result(result)
}

pub unsafe extern "C" fn ctx_GetItem_s(ctx: Ctx, obj: Handle, key: *const c_char) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return Handle::NULL;
    };
    let Some(key) = st.str_arg(key) else {
        return Handle::NULL;
    };
    let result = st
        .host
        .from_str(key)
        .and_then(|key| st.host.call(HostOp::GetItem, &[obj, key]));
    st.wrap_result(result)
}

pub unsafe extern "C" fn ctx_SetItem(ctx: Ctx, obj: Handle, key: Handle, value: Handle) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return -1;
    };
    let Some(key) = st.resolve_arg(key) else {
        return -1;
    };
    let Some(value) = st.resolve_arg(value) else {
        return -1;
    };
    st.status(st.host.call(HostOp::SetItem, &[obj, key, value]))
}

pub unsafe extern "C" fn ctx_SetItem_i(ctx: Ctx, obj: Handle, idx: isize, value: Handle) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return -1;
    };
    let Some(value) = st.resolve_arg(value) else {
        return -1;
    };
    let result = st
        .host
        .from_i64(idx as i64)
        .and_then(|key| st.host.call(HostOp::SetItem, &[obj, key, value]));
    st.status(result)
}

pub unsafe extern "C" fn ctx_SetItem_s(
    ctx: Ctx,
    obj: Handle,
    key: *const c_char,
    value: Handle,
) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(obj) else {
        return -1;
    };
    let Some(key) = st.str_arg(key) else {
        return -1;
    };
    let Some(value) = st.resolve_arg(value) else {
        return -1;
    };
    let result = st
        .host
        .from_str(key)
        .and_then(|key| st.host.call(HostOp::SetItem, &[obj, key, value]));
    st.status(result)
}

/// Call `callable` with `nargs` positional handles and an optional keyword
/// dictionary (`kw` may be the null handle).
pub unsafe extern "C" fn ctx_Call(
    ctx: Ctx,
    callable: Handle,
    args: *const Handle,
    nargs: isize,
    kw: Handle,
) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(callable) = st.resolve_arg(callable) else {
        return Handle::NULL;
    };
    let Some(args) = resolve_args(st, args, nargs) else {
        return Handle::NULL;
    };
    let kwargs = if kw.is_valid() {
        match st.resolve_arg(kw) {
            Some(kw) => Some(kw),
            None => return Handle::NULL,
        }
    } else {
        None
    };
    st.wrap_result(st.host.call_object(&callable, &args, kwargs.as_ref()))
}

/// Resolve an argument array. A negative count or a null array with a
/// positive count is a bad argument.
pub(crate) unsafe fn resolve_args(
    st: &BridgeState,
    args: *const Handle,
    nargs: isize,
) -> Option<Vec<HostRef>> {
    if nargs < 0 || (nargs > 0 && args.is_null()) {
        st.fail(&crate::Error::InvalidArgument(format!(
            "bad argument array ({nargs} arguments)"
        )));
        return None;
    }
    if nargs == 0 {
        return Some(Vec::new());
    }
    std::slice::from_raw_parts(args, nargs as usize)
        .iter()
        .map(|h| st.resolve_arg(*h))
        .collect()
}
