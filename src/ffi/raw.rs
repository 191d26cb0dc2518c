//! Binary layout of the native extension interface.
//!
//! Field order, pointer widths and the offset of `ctx_version` are a stable
//! contract within a major version. New entries are only ever appended, and
//! each append bumps the minor version.

use std::os::raw::{c_char, c_double, c_int, c_long, c_longlong, c_ulonglong, c_void};

use libc::wchar_t;

use super::handles::Handle;
use crate::legacy::LegacyObject;

/// Context pointer passed as the first argument of every operation.
pub type Ctx = *const HContext;

// Calling convention flags of a method definition
pub const METH_VARARGS: c_int = 0x0001;
pub const METH_KEYWORDS: c_int = 0x0002;
pub const METH_NOARGS: c_int = 0x0004;
pub const METH_O: c_int = 0x0008;

// Module slot ids
pub const SLOT_END: c_int = 0;
pub const SLOT_EXEC: c_int = 2;

/// `f(ctx, self)`
pub type NoArgsFn = unsafe extern "C" fn(ctx: Ctx, this: Handle) -> Handle;
/// `f(ctx, self, arg)`
pub type OneArgFn = unsafe extern "C" fn(ctx: Ctx, this: Handle, arg: Handle) -> Handle;
/// `f(ctx, self, args, nargs)`
pub type VarArgsFn =
    unsafe extern "C" fn(ctx: Ctx, this: Handle, args: *const Handle, nargs: isize) -> Handle;
/// `f(ctx, self, args, nargs, kw)`
pub type KeywordsFn = unsafe extern "C" fn(
    ctx: Ctx,
    this: Handle,
    args: *const Handle,
    nargs: isize,
    kw: Handle,
) -> Handle;
/// Module exec slot: returns 0 on success, non-zero with a pending error.
pub type ExecFn = unsafe extern "C" fn(ctx: Ctx, module: Handle) -> c_int;
/// Extension entry point, returns a handle to the created module.
pub type InitFn = unsafe extern "C" fn(ctx: Ctx) -> Handle;

/// One method of a module definition. A null `ml_name` ends the table.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MethodDef {
    pub ml_name: *const c_char,
    pub ml_meth: *const c_void,
    pub ml_flags: c_int,
    pub ml_doc: *const c_char,
}

impl MethodDef {
    /// Table terminator.
    pub const END: MethodDef = MethodDef {
        ml_name: std::ptr::null(),
        ml_meth: std::ptr::null(),
        ml_flags: 0,
        ml_doc: std::ptr::null(),
    };
}

/// One slot of a module definition. Slot id [`SLOT_END`] ends the table.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SlotDef {
    pub slot: c_int,
    pub value: *const c_void,
}

impl SlotDef {
    /// Table terminator.
    pub const END: SlotDef = SlotDef {
        slot: SLOT_END,
        value: std::ptr::null(),
    };
}

/// Static module descriptor supplied by native code at load time.
#[repr(C)]
#[derive(Debug)]
pub struct ModuleDef {
    pub m_name: *const c_char,
    pub m_doc: *const c_char,
    pub m_methods: *const MethodDef,
    pub m_slots: *const SlotDef,
}

// Descriptors are immutable static data owned by the extension.
unsafe impl Sync for MethodDef {}
unsafe impl Sync for SlotDef {}
unsafe impl Sync for ModuleDef {}

/// The context: version, singleton handles and one entry per operation.
#[repr(C)]
#[allow(non_snake_case)]
pub struct HContext {
    pub ctx_version: c_int,
    pub _private: *const c_void,
    pub h_None: Handle,
    pub h_True: Handle,
    pub h_False: Handle,
    pub h_ValueError: Handle,
    pub h_TypeError: Handle,
    pub ctx_Module_Create: unsafe extern "C" fn(Ctx, *const ModuleDef) -> Handle,
    pub ctx_Dup: unsafe extern "C" fn(Ctx, Handle) -> Handle,
    pub ctx_Close: unsafe extern "C" fn(Ctx, Handle),
    pub ctx_Long_FromLong: unsafe extern "C" fn(Ctx, c_long) -> Handle,
    pub ctx_Long_FromLongLong: unsafe extern "C" fn(Ctx, c_longlong) -> Handle,
    pub ctx_Long_FromUnsignedLongLong: unsafe extern "C" fn(Ctx, c_ulonglong) -> Handle,
    pub ctx_Long_AsLong: unsafe extern "C" fn(Ctx, Handle) -> c_long,
    pub ctx_Float_FromDouble: unsafe extern "C" fn(Ctx, c_double) -> Handle,
    pub ctx_Number_Add: unsafe extern "C" fn(Ctx, Handle, Handle) -> Handle,
    pub ctx_Err_SetString: unsafe extern "C" fn(Ctx, Handle, *const c_char),
    pub ctx_Err_Occurred: unsafe extern "C" fn(Ctx) -> c_int,
    pub ctx_Object_IsTrue: unsafe extern "C" fn(Ctx, Handle) -> c_int,
    pub ctx_GetAttr: unsafe extern "C" fn(Ctx, Handle, Handle) -> Handle,
    pub ctx_GetAttr_s: unsafe extern "C" fn(Ctx, Handle, *const c_char) -> Handle,
    pub ctx_HasAttr: unsafe extern "C" fn(Ctx, Handle, Handle) -> c_int,
    pub ctx_HasAttr_s: unsafe extern "C" fn(Ctx, Handle, *const c_char) -> c_int,
    pub ctx_SetAttr: unsafe extern "C" fn(Ctx, Handle, Handle, Handle) -> c_int,
    pub ctx_SetAttr_s: unsafe extern "C" fn(Ctx, Handle, *const c_char, Handle) -> c_int,
    pub ctx_GetItem: unsafe extern "C" fn(Ctx, Handle, Handle) -> Handle,
    pub ctx_GetItem_i: unsafe extern "C" fn(Ctx, Handle, isize) -> Handle,
    pub ctx_GetItem_s: unsafe extern "C" fn(Ctx, Handle, *const c_char) -> Handle,
    pub ctx_SetItem: unsafe extern "C" fn(Ctx, Handle, Handle, Handle) -> c_int,
    pub ctx_SetItem_i: unsafe extern "C" fn(Ctx, Handle, isize, Handle) -> c_int,
    pub ctx_SetItem_s: unsafe extern "C" fn(Ctx, Handle, *const c_char, Handle) -> c_int,
    pub ctx_Bytes_Check: unsafe extern "C" fn(Ctx, Handle) -> c_int,
    pub ctx_Bytes_Size: unsafe extern "C" fn(Ctx, Handle) -> isize,
    pub ctx_Bytes_GET_SIZE: unsafe extern "C" fn(Ctx, Handle) -> isize,
    pub ctx_Bytes_AsString: unsafe extern "C" fn(Ctx, Handle) -> *const c_char,
    pub ctx_Bytes_AS_STRING: unsafe extern "C" fn(Ctx, Handle) -> *const c_char,
    pub ctx_Unicode_FromString: unsafe extern "C" fn(Ctx, *const c_char) -> Handle,
    pub ctx_Unicode_Check: unsafe extern "C" fn(Ctx, Handle) -> c_int,
    pub ctx_Unicode_AsUTF8String: unsafe extern "C" fn(Ctx, Handle) -> Handle,
    pub ctx_Unicode_FromWideChar: unsafe extern "C" fn(Ctx, *const wchar_t, isize) -> Handle,
    pub ctx_List_New: unsafe extern "C" fn(Ctx, isize) -> Handle,
    pub ctx_List_Append: unsafe extern "C" fn(Ctx, Handle, Handle) -> c_int,
    pub ctx_Dict_New: unsafe extern "C" fn(Ctx) -> Handle,
    pub ctx_Dict_SetItem: unsafe extern "C" fn(Ctx, Handle, Handle, Handle) -> c_int,
    pub ctx_Dict_GetItem: unsafe extern "C" fn(Ctx, Handle, Handle) -> Handle,
    pub ctx_FromPyObject: unsafe extern "C" fn(Ctx, *mut LegacyObject) -> Handle,
    pub ctx_AsPyObject: unsafe extern "C" fn(Ctx, Handle) -> *mut LegacyObject,
    pub ctx_CallRealFunctionFromTrampoline: unsafe extern "C" fn(
        Ctx,
        *mut LegacyObject,
        *mut LegacyObject,
        *mut LegacyObject,
        *const c_void,
        c_int,
    ) -> *mut LegacyObject,

    // Added in 1.1
    pub ctx_Err_Clear: unsafe extern "C" fn(Ctx),
    pub ctx_Err_Fetch: unsafe extern "C" fn(Ctx) -> Handle,
    pub ctx_Call: unsafe extern "C" fn(Ctx, Handle, *const Handle, isize, Handle) -> Handle,
    pub h_MemoryError: Handle,
    pub h_SystemError: Handle,
    pub h_OverflowError: Handle,
    pub ctx_Float_AsDouble: unsafe extern "C" fn(Ctx, Handle) -> c_double,
    pub ctx_Length: unsafe extern "C" fn(Ctx, Handle) -> isize,
    pub ctx_Long_Check: unsafe extern "C" fn(Ctx, Handle) -> c_int,
    pub ctx_List_Check: unsafe extern "C" fn(Ctx, Handle) -> c_int,
    pub ctx_Dict_Check: unsafe extern "C" fn(Ctx, Handle) -> c_int,
}
