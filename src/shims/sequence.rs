//! Byte strings, text, lists and dictionaries.
//!
//! See the [module safety contract](crate::shims#safety).
#![allow(non_snake_case, clippy::missing_safety_doc)]

use std::os::raw::{c_char, c_int};
use std::ptr;

use libc::wchar_t;

use super::check;
use crate::context::BridgeState;
use crate::error::Error;
use crate::ffi::{Ctx, Handle};
use crate::host::{HostOp, TypeKind};

unsafe fn bytes_size(ctx: Ctx, h: Handle) -> isize {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(obj) = st.resolve_arg(h) else {
        return -1;
    };
    // A short-lived pin reads the length and rejects non-bytes the way the
    // host does.
    match st.host.pin_bytes(&obj) {
        Ok(pin) => pin.len() as isize,
        Err(exc) => {
            st.raise(exc);
            -1
        }
    }
}

/// Raw contents, pinned until `h` is closed.
unsafe fn pinned_contents(ctx: Ctx, h: Handle) -> *const c_char {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return ptr::null();
    };
    if st.resolve_arg(h).is_none() {
        return ptr::null();
    }
    match st.table.pin_with(h, |obj| st.host.pin_bytes(obj)) {
        Ok(data) => data as *const c_char,
        Err(err) => {
            st.fail(&err);
            ptr::null()
        }
    }
}

pub unsafe extern "C" fn ctx_Bytes_Check(ctx: Ctx, h: Handle) -> c_int {
    check(ctx, h, TypeKind::Bytes)
}

pub unsafe extern "C" fn ctx_Bytes_Size(ctx: Ctx, h: Handle) -> isize {
    bytes_size(ctx, h)
}

pub unsafe extern "C" fn ctx_Bytes_GET_SIZE(ctx: Ctx, h: Handle) -> isize {
    bytes_size(ctx, h)
}

/// The returned buffer stays valid and unmoved for as long as `h` is open.
pub unsafe extern "C" fn ctx_Bytes_AsString(ctx: Ctx, h: Handle) -> *const c_char {
    pinned_contents(ctx, h)
}

pub unsafe extern "C" fn ctx_Bytes_AS_STRING(ctx: Ctx, h: Handle) -> *const c_char {
    pinned_contents(ctx, h)
}

pub unsafe extern "C" fn ctx_Unicode_FromString(ctx: Ctx, utf8: *const c_char) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(text) = st.str_arg(utf8) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.from_str(text))
}

pub unsafe extern "C" fn ctx_Unicode_Check(ctx: Ctx, h: Handle) -> c_int {
    check(ctx, h, TypeKind::Unicode)
}

pub unsafe extern "C" fn ctx_Unicode_AsUTF8String(ctx: Ctx, h: Handle) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(obj) = st.resolve_arg(h) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.call(HostOp::EncodeUtf8, &[obj]))
}

/// Decode `size` wide characters, or up to the first NUL when `size` is
/// negative.
pub unsafe extern "C" fn ctx_Unicode_FromWideChar(
    ctx: Ctx,
    w: *const wchar_t,
    size: isize,
) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    if w.is_null() {
        st.fail(&Error::InvalidArgument("null wide string".to_string()));
        return Handle::NULL;
    }
    match decode_wide(w, size) {
        Some(text) => st.wrap_result(st.host.from_str(&text)),
        None => {
            st.fail(&Error::InvalidArgument(
                "wide string is not valid Unicode".to_string(),
            ));
            Handle::NULL
        }
    }
}

unsafe fn decode_wide(w: *const wchar_t, size: isize) -> Option<String> {
    let len = if size < 0 {
        let mut n = 0;
        while *w.add(n) != 0 {
            n += 1;
        }
        n
    } else {
        size as usize
    };
    let units = std::slice::from_raw_parts(w, len);
    decode_units(units)
}

#[cfg(windows)]
fn decode_units(units: &[wchar_t]) -> Option<String> {
    String::from_utf16(units).ok()
}

#[cfg(not(windows))]
fn decode_units(units: &[wchar_t]) -> Option<String> {
    units.iter().map(|&u| char::from_u32(u as u32)).collect()
}

pub unsafe extern "C" fn ctx_List_New(ctx: Ctx, len: isize) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Ok(len) = usize::try_from(len) else {
        st.fail(&Error::InvalidArgument(format!("negative list length {len}")));
        return Handle::NULL;
    };
    st.wrap_result(st.host.new_list(len))
}

pub unsafe extern "C" fn ctx_List_Check(ctx: Ctx, h: Handle) -> c_int {
    check(ctx, h, TypeKind::List)
}

pub unsafe extern "C" fn ctx_List_Append(ctx: Ctx, list: Handle, item: Handle) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(list) = st.resolve_arg(list) else {
        return -1;
    };
    let Some(item) = st.resolve_arg(item) else {
        return -1;
    };
    st.status(st.host.call(HostOp::ListAppend, &[list, item]))
}

pub unsafe extern "C" fn ctx_Dict_New(ctx: Ctx) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.new_dict())
}

pub unsafe extern "C" fn ctx_Dict_Check(ctx: Ctx, h: Handle) -> c_int {
    check(ctx, h, TypeKind::Dict)
}

pub unsafe extern "C" fn ctx_Dict_SetItem(ctx: Ctx, dict: Handle, key: Handle, value: Handle) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(dict) = st.resolve_arg(dict) else {
        return -1;
    };
    let Some(key) = st.resolve_arg(key) else {
        return -1;
    };
    let Some(value) = st.resolve_arg(value) else {
        return -1;
    };
    st.status(st.host.call(HostOp::DictSetItem, &[dict, key, value]))
}

pub unsafe extern "C" fn ctx_Dict_GetItem(ctx: Ctx, dict: Handle, key: Handle) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(dict) = st.resolve_arg(dict) else {
        return Handle::NULL;
    };
    let Some(key) = st.resolve_arg(key) else {
        return Handle::NULL;
    };
    st.wrap_result(st.host.call(HostOp::DictGetItem, &[dict, key]))
}
