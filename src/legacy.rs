//! Adapter for extensions written against the older pointer convention.
//!
//! Legacy code holds `*mut LegacyObject` pointers with a visible reference
//! count instead of handles. Every wrapper is backed by handles in the
//! bridge's table: one primary handle plus one extra handle per additional
//! reference, so `ob_refcnt` always equals the number of handles the wrapper
//! owns. Reference-count operations map onto duplicate and close.
//!
//! A wrapper is cached per host object, so converting the same object twice
//! yields the same pointer with its count raised.
//!
//! Raw buffer views handed out through a wrapper are pinned on its primary
//! handle and therefore stay valid until the wrapper's last reference is
//! dropped.
//!
//! # Safety
//!
//! The `extern "C"` functions here are `unsafe` because they take raw
//! pointers. `ctx` must be null or a live context; object pointers are
//! checked against the wrapper cache before use, but string and data
//! pointers must be valid for the reads each function documents.

#![allow(non_snake_case, clippy::missing_safety_doc)]

use std::collections::HashMap;
use std::os::raw::{c_char, c_int, c_long, c_void};
use std::ptr;
use std::sync::atomic::{AtomicIsize, Ordering};

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::context::BridgeState;
use crate::error::{Error, Result};
use crate::ffi::{Ctx, Handle};
use crate::host::{HostOp, HostRef, HostResult};
use crate::module::{call_native, NativeMethod};
use crate::shims::{errors, number, object, sequence};
use crate::table::HandleTable;
use crate::types::{CallingConvention, InvalidHandlePolicy};

/// The structure legacy code receives in place of an object pointer.
///
/// Legacy code may read `ob_refcnt` and `ob_handle` directly but must change
/// the count only through `legacy_IncRef`/`legacy_DecRef`.
#[repr(C)]
pub struct LegacyObject {
    /// Number of outstanding references.
    pub ob_refcnt: AtomicIsize,
    /// The wrapper's primary handle.
    pub ob_handle: Handle,
    extra: Mutex<Vec<Handle>>,
}

/// Wrapper cache for one context.
///
/// Two sharded maps: host object address to wrapper address, locked by
/// object, and wrapper address to host object address, locked by wrapper.
/// Validating a wrapper only takes a read lock on its own shard. Paths that
/// need both always lock the object shard first.
pub struct LegacyAdapter {
    by_target: Box<[Mutex<HashMap<usize, usize>>]>,
    wrappers: Box<[RwLock<HashMap<usize, usize>>]>,
}

impl LegacyAdapter {
    /// A cache split `shards` ways, rounded up to a power of two.
    pub(crate) fn new(shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        Self {
            by_target: (0..shards).map(|_| Mutex::default()).collect(),
            wrappers: (0..shards).map(|_| RwLock::default()).collect(),
        }
    }

    fn shard_of(&self, addr: usize) -> usize {
        // Low bits are alignment; mix in higher ones.
        ((addr >> 4) ^ (addr >> 12)) & (self.wrappers.len() - 1)
    }

    fn targets(&self, target: usize) -> &Mutex<HashMap<usize, usize>> {
        &self.by_target[self.shard_of(target)]
    }

    fn registry(&self, obj: *mut LegacyObject) -> &RwLock<HashMap<usize, usize>> {
        &self.wrappers[self.shard_of(obj as usize)]
    }

    /// Number of wrappers currently alive.
    pub fn live_wrappers(&self) -> usize {
        self.wrappers.iter().map(|shard| shard.read().len()).sum()
    }

    /// Take ownership of `handle` as one reference of the wrapper for its
    /// target, creating the wrapper if none exists.
    pub(crate) fn adopt(&self, table: &HandleTable, handle: Handle) -> Result<*mut LegacyObject> {
        let target = table.resolve(handle)?;
        let addr = target.addr();
        let mut targets = self.targets(addr).lock();
        if let Some(&existing) = targets.get(&addr) {
            let wrapper = existing as *mut LegacyObject;
            // SAFETY: cached addresses designate live wrappers, and freeing
            // one requires the object shard lock held here.
            let obj = unsafe { &*wrapper };
            obj.extra.lock().push(handle);
            obj.ob_refcnt.fetch_add(1, Ordering::AcqRel);
            return Ok(wrapper);
        }
        let wrapper = Box::into_raw(Box::new(LegacyObject {
            ob_refcnt: AtomicIsize::new(1),
            ob_handle: handle,
            extra: Mutex::new(Vec::new()),
        }));
        targets.insert(addr, wrapper as usize);
        self.registry(wrapper).write().insert(wrapper as usize, addr);
        debug!("created legacy wrapper {:p} for {:?}", wrapper, target);
        Ok(wrapper)
    }

    /// A new reference to the wrapper for `target`.
    pub(crate) fn to_legacy(
        &self,
        table: &HandleTable,
        target: HostRef,
    ) -> Result<*mut LegacyObject> {
        let handle = table.allocate(target)?;
        self.adopt(table, handle).inspect_err(|_| {
            let _ = table.close(handle);
        })
    }

    /// The primary handle of a live wrapper, borrowed.
    pub(crate) fn primary(&self, obj: *mut LegacyObject) -> Result<Handle> {
        let registry = self.registry(obj).read();
        if !registry.contains_key(&(obj as usize)) {
            return Err(Error::InvalidLegacyObject);
        }
        // SAFETY: `obj` is registered, and unregistering it needs the write
        // lock.
        Ok(unsafe { (*obj).ob_handle })
    }

    /// The host object behind a live wrapper.
    pub(crate) fn from_legacy(&self, table: &HandleTable, obj: *mut LegacyObject) -> Result<HostRef> {
        table.resolve(self.primary(obj)?)
    }

    /// Add a reference by duplicating the primary handle.
    pub(crate) fn incref(&self, table: &HandleTable, obj: *mut LegacyObject) -> Result<()> {
        let registry = self.registry(obj).read();
        if !registry.contains_key(&(obj as usize)) {
            return Err(Error::InvalidLegacyObject);
        }
        // SAFETY: registered, and kept so by the read lock.
        let obj = unsafe { &*obj };
        let dup = table.duplicate(obj.ob_handle)?;
        obj.extra.lock().push(dup);
        obj.ob_refcnt.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop a reference. The last one closes the primary handle, which
    /// releases any pinned buffer, and frees the wrapper.
    pub(crate) fn decref(&self, table: &HandleTable, obj: *mut LegacyObject) -> Result<()> {
        let key = obj as usize;
        let Some(target) = self.registry(obj).read().get(&key).copied() else {
            return Err(Error::InvalidLegacyObject);
        };
        let mut targets = self.targets(target).lock();
        let mut registry = self.registry(obj).write();
        // Freed by another thread in between.
        if registry.get(&key) != Some(&target) {
            return Err(Error::InvalidLegacyObject);
        }
        // SAFETY: registered, and both locks keep every other path out.
        let wrapper = unsafe { &*obj };
        if let Some(extra) = wrapper.extra.lock().pop() {
            wrapper.ob_refcnt.fetch_sub(1, Ordering::AcqRel);
            drop(registry);
            drop(targets);
            table.close(extra)?;
            return Ok(());
        }
        registry.remove(&key);
        targets.remove(&target);
        drop(registry);
        drop(targets);
        wrapper.ob_refcnt.store(0, Ordering::Release);
        let primary = wrapper.ob_handle;
        // SAFETY: unregistered above, so no other path can reach it.
        drop(unsafe { Box::from_raw(obj) });
        table.close(primary)?;
        Ok(())
    }

    /// Free every remaining wrapper. Their handles die with the table.
    pub(crate) fn release_all(&self) -> usize {
        for shard in self.by_target.iter() {
            shard.lock().clear();
        }
        let mut count = 0;
        for shard in self.wrappers.iter() {
            for (addr, _) in shard.write().drain() {
                // SAFETY: registered wrappers were created by `Box::into_raw`.
                drop(unsafe { Box::from_raw(addr as *mut LegacyObject) });
                count += 1;
            }
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Context entries
// ---------------------------------------------------------------------------

/// Borrow a wrapper's primary handle, reporting bad pointers.
fn borrow(st: &BridgeState, obj: *mut LegacyObject) -> Option<Handle> {
    match st.legacy.primary(obj) {
        Ok(h) => Some(h),
        Err(err) => {
            bad_wrapper(st, &err);
            None
        }
    }
}

fn bad_wrapper(st: &BridgeState, err: &Error) {
    match st.policy {
        InvalidHandlePolicy::Trap => panic!("legacy code passed a bad object: {err}"),
        InvalidHandlePolicy::Report => {
            warn!("legacy code passed a bad object: {err}");
            st.fail(err);
        }
    }
}

/// Convert a new handle returned by a shim into a new legacy reference.
fn adopt(st: &BridgeState, h: Handle) -> *mut LegacyObject {
    if !h.is_valid() {
        return ptr::null_mut();
    }
    match st.legacy.adopt(&st.table, h) {
        Ok(obj) => obj,
        Err(err) => {
            let _ = st.table.close(h);
            st.fail(&err);
            ptr::null_mut()
        }
    }
}

fn new_reference(st: &BridgeState, target: HostResult<HostRef>) -> *mut LegacyObject {
    let result = target
        .map_err(Error::from)
        .and_then(|t| st.legacy.to_legacy(&st.table, t));
    match result {
        Ok(obj) => obj,
        Err(err) => {
            st.fail(&err);
            ptr::null_mut()
        }
    }
}

/// A new handle to the object behind a legacy wrapper.
pub unsafe extern "C" fn ctx_FromPyObject(ctx: Ctx, obj: *mut LegacyObject) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(h) = borrow(st, obj) else {
        return Handle::NULL;
    };
    object::ctx_Dup(ctx, h)
}

/// A new legacy reference to the object behind a handle. The handle stays
/// owned by the caller.
pub unsafe extern "C" fn ctx_AsPyObject(ctx: Ctx, h: Handle) -> *mut LegacyObject {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return ptr::null_mut();
    };
    let Some(target) = st.resolve_arg(h) else {
        return ptr::null_mut();
    };
    new_reference(st, Ok(target))
}

/// Call a handle-based function on behalf of a legacy trampoline.
///
/// `args` is a legacy sequence of positional arguments (or null) and `kw` a
/// legacy dictionary (or null). `flags` selects the calling convention of
/// `func` exactly as in a method definition.
pub unsafe extern "C" fn ctx_CallRealFunctionFromTrampoline(
    ctx: Ctx,
    this: *mut LegacyObject,
    args: *mut LegacyObject,
    kw: *mut LegacyObject,
    func: *const c_void,
    flags: c_int,
) -> *mut LegacyObject {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return ptr::null_mut();
    };
    let Some(conv) = CallingConvention::from_flags(flags) else {
        st.fail(&Error::InvalidArgument(format!("invalid calling convention {flags:#x}")));
        return ptr::null_mut();
    };
    if func.is_null() {
        st.fail(&Error::InvalidArgument("null function".to_string()));
        return ptr::null_mut();
    }
    let this = match st.legacy.from_legacy(&st.table, this) {
        Ok(this) => this,
        Err(err) => {
            bad_wrapper(st, &err);
            return ptr::null_mut();
        }
    };
    let positional = if args.is_null() {
        Vec::new()
    } else {
        let items = st
            .legacy
            .from_legacy(&st.table, args)
            .and_then(|seq| sequence_items(st, &seq).map_err(Error::from));
        match items {
            Ok(items) => items,
            Err(err) => {
                st.fail(&err);
                return ptr::null_mut();
            }
        }
    };
    let kwargs = if kw.is_null() {
        None
    } else {
        match st.legacy.from_legacy(&st.table, kw) {
            Ok(kw) => Some(kw),
            Err(err) => {
                bad_wrapper(st, &err);
                return ptr::null_mut();
            }
        }
    };
    let method = NativeMethod::new("trampoline target".to_string(), conv, func);
    new_reference(st, call_native(st, &method, this, &positional, kwargs.as_ref()))
}

fn sequence_items(st: &BridgeState, seq: &HostRef) -> HostResult<Vec<HostRef>> {
    let len = st.host.call(HostOp::Len, std::slice::from_ref(seq))?;
    let len = st.host.as_i64(&len)?;
    (0..len)
        .map(|i| {
            let key = st.host.from_i64(i)?;
            st.host.call(HostOp::GetItem, &[seq.clone(), key])
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Legacy entry points
// ---------------------------------------------------------------------------

pub unsafe extern "C" fn legacy_IncRef(ctx: Ctx, obj: *mut LegacyObject) {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return;
    };
    if let Err(err) = st.legacy.incref(&st.table, obj) {
        refcount_error(st, &err);
    }
}

pub unsafe extern "C" fn legacy_DecRef(ctx: Ctx, obj: *mut LegacyObject) {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return;
    };
    if let Err(err) = st.legacy.decref(&st.table, obj) {
        refcount_error(st, &err);
    }
}

// Reference-count operations have no failure sentinel.
fn refcount_error(st: &BridgeState, err: &Error) {
    match st.policy {
        InvalidHandlePolicy::Trap => panic!("bad legacy reference count operation: {err}"),
        InvalidHandlePolicy::Report => warn!("ignored bad legacy reference count operation: {err}"),
    }
}

pub unsafe extern "C" fn legacy_Long_FromLong(ctx: Ctx, value: c_long) -> *mut LegacyObject {
    match BridgeState::from_ctx(ctx) {
        Some(st) => adopt(st, number::ctx_Long_FromLong(ctx, value)),
        None => ptr::null_mut(),
    }
}

pub unsafe extern "C" fn legacy_Long_AsLong(ctx: Ctx, obj: *mut LegacyObject) -> c_long {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    match borrow(st, obj) {
        Some(h) => number::ctx_Long_AsLong(ctx, h),
        None => -1,
    }
}

pub unsafe extern "C" fn legacy_Object_IsTrue(ctx: Ctx, obj: *mut LegacyObject) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    match borrow(st, obj) {
        Some(h) => object::ctx_Object_IsTrue(ctx, h),
        None => -1,
    }
}

pub unsafe extern "C" fn legacy_GetAttrString(
    ctx: Ctx,
    obj: *mut LegacyObject,
    name: *const c_char,
) -> *mut LegacyObject {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return ptr::null_mut();
    };
    match borrow(st, obj) {
        Some(h) => adopt(st, object::ctx_GetAttr_s(ctx, h, name)),
        None => ptr::null_mut(),
    }
}

pub unsafe extern "C" fn legacy_SetAttrString(
    ctx: Ctx,
    obj: *mut LegacyObject,
    name: *const c_char,
    value: *mut LegacyObject,
) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(h) = borrow(st, obj) else {
        return -1;
    };
    let Some(v) = borrow(st, value) else {
        return -1;
    };
    object::ctx_SetAttr_s(ctx, h, name, v)
}

pub unsafe extern "C" fn legacy_Unicode_FromString(
    ctx: Ctx,
    utf8: *const c_char,
) -> *mut LegacyObject {
    match BridgeState::from_ctx(ctx) {
        Some(st) => adopt(st, sequence::ctx_Unicode_FromString(ctx, utf8)),
        None => ptr::null_mut(),
    }
}

/// Copy `size` bytes into a new byte string.
pub unsafe extern "C" fn legacy_Bytes_FromStringAndSize(
    ctx: Ctx,
    data: *const c_char,
    size: isize,
) -> *mut LegacyObject {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return ptr::null_mut();
    };
    let Ok(len) = usize::try_from(size) else {
        st.fail(&Error::InvalidArgument(format!("negative size {size}")));
        return ptr::null_mut();
    };
    if data.is_null() && len > 0 {
        st.fail(&Error::InvalidArgument("null data".to_string()));
        return ptr::null_mut();
    }
    let bytes = if len == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(data as *const u8, len)
    };
    new_reference(st, st.host.from_bytes(bytes))
}

/// Raw contents of a byte string, valid until the wrapper's last reference
/// is dropped.
pub unsafe extern "C" fn legacy_Bytes_AsString(
    ctx: Ctx,
    obj: *mut LegacyObject,
) -> *const c_char {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return ptr::null();
    };
    match borrow(st, obj) {
        Some(h) => sequence::ctx_Bytes_AsString(ctx, h),
        None => ptr::null(),
    }
}

pub unsafe extern "C" fn legacy_Bytes_Size(ctx: Ctx, obj: *mut LegacyObject) -> isize {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    match borrow(st, obj) {
        Some(h) => sequence::ctx_Bytes_Size(ctx, h),
        None => -1,
    }
}

pub unsafe extern "C" fn legacy_List_New(ctx: Ctx, len: isize) -> *mut LegacyObject {
    match BridgeState::from_ctx(ctx) {
        Some(st) => adopt(st, sequence::ctx_List_New(ctx, len)),
        None => ptr::null_mut(),
    }
}

pub unsafe extern "C" fn legacy_List_Append(
    ctx: Ctx,
    list: *mut LegacyObject,
    item: *mut LegacyObject,
) -> c_int {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return -1;
    };
    let Some(list) = borrow(st, list) else {
        return -1;
    };
    let Some(item) = borrow(st, item) else {
        return -1;
    };
    sequence::ctx_List_Append(ctx, list, item)
}

pub unsafe extern "C" fn legacy_Err_Occurred(ctx: Ctx) -> c_int {
    errors::ctx_Err_Occurred(ctx)
}
