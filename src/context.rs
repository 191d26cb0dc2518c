//! Context construction and the Rust-side owner of a bridge.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::sync::{Arc, Weak};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::ffi::{
    check_function_result, raise_bridge_error, Ctx, ErrorState, HContext, Handle, InitFn,
};
use crate::host::{HostException, HostRef, HostResult, HostRuntime, Singleton};
use crate::legacy::{self, LegacyAdapter, LegacyObject};
use crate::module;
use crate::shims;
use crate::table::{Closed, HandleTable};
use crate::types::{BridgeOptions, InvalidHandlePolicy};
use crate::version;

/// Everything a context pointer leads to.
pub struct BridgeState {
    pub(crate) ctx: HContext,
    pub(crate) host: Arc<dyn HostRuntime>,
    pub(crate) table: HandleTable,
    pub(crate) errors: ErrorState,
    pub(crate) legacy: LegacyAdapter,
    pub(crate) policy: InvalidHandlePolicy,
    pub(crate) this: Weak<BridgeState>,
    singletons: [Handle; Singleton::ALL.len()],
}

// The context is immutable after construction; the table, the legacy cache
// and the host synchronize internally.
unsafe impl Send for BridgeState {}
unsafe impl Sync for BridgeState {}

impl BridgeState {
    /// Recover the state behind a context pointer.
    ///
    /// # Safety
    ///
    /// `ctx` must be null or a context produced by a live [`Bridge`].
    pub(crate) unsafe fn from_ctx<'a>(ctx: Ctx) -> Option<&'a BridgeState> {
        if ctx.is_null() {
            return None;
        }
        let private = (*ctx)._private as *const BridgeState;
        private.as_ref()
    }

    pub(crate) fn ctx_ptr(&self) -> Ctx {
        &self.ctx
    }

    pub(crate) fn singleton(&self, which: Singleton) -> Handle {
        let idx = Singleton::ALL
            .iter()
            .position(|s| *s == which)
            .unwrap_or_default();
        self.singletons[idx]
    }

    /// Resolve a handle argument, applying the invalid-handle policy.
    pub(crate) fn resolve_arg(&self, handle: Handle) -> Option<HostRef> {
        match self.table.resolve(handle) {
            Ok(target) => Some(target),
            Err(err) => {
                self.invalid_handle(&err);
                None
            }
        }
    }

    pub(crate) fn invalid_handle(&self, err: &Error) {
        match self.policy {
            InvalidHandlePolicy::Trap => panic!("native code passed a bad handle: {err}"),
            InvalidHandlePolicy::Report => {
                warn!("native code passed a bad handle: {err}");
                raise_bridge_error(&self.errors, self.host.as_ref(), err);
            }
        }
    }

    /// Report a failure: handle errors follow the policy, everything else
    /// becomes the pending error.
    pub(crate) fn fail(&self, err: &Error) {
        if err.is_handle_error() {
            self.invalid_handle(err);
        } else {
            raise_bridge_error(&self.errors, self.host.as_ref(), err);
        }
    }

    pub(crate) fn raise(&self, exc: HostException) {
        self.errors.set(exc);
    }

    /// Hand a host object to native code under a fresh handle.
    pub(crate) fn wrap(&self, target: HostRef) -> Handle {
        match self.table.allocate(target) {
            Ok(handle) => handle,
            Err(err) => {
                self.fail(&err);
                Handle::NULL
            }
        }
    }

    /// Wrap a successful result, or make its exception pending.
    pub(crate) fn wrap_result(&self, result: HostResult<HostRef>) -> Handle {
        match result {
            Ok(target) => self.wrap(target),
            Err(exc) => {
                self.raise(exc);
                Handle::NULL
            }
        }
    }

    /// Status code of a mutator: 0 on success, -1 with a pending error.
    pub(crate) fn status<T>(&self, result: HostResult<T>) -> c_int {
        match result {
            Ok(_) => 0,
            Err(exc) => {
                self.raise(exc);
                -1
            }
        }
    }

    /// Borrow a NUL-terminated UTF-8 argument.
    ///
    /// # Safety
    ///
    /// `s` must be null or point to a NUL-terminated string.
    pub(crate) unsafe fn str_arg<'a>(&self, s: *const c_char) -> Option<&'a str> {
        if s.is_null() {
            self.fail(&Error::InvalidArgument("null string argument".to_string()));
            return None;
        }
        match CStr::from_ptr(s).to_str() {
            Ok(s) => Some(s),
            Err(e) => {
                self.fail(&Error::InvalidArgument(format!("invalid UTF-8: {e}")));
                None
            }
        }
    }

    /// Run a native callback and check its result against the indicator.
    pub(crate) fn check_result(&self, name: &str, result: Handle) -> HostResult<HostRef> {
        let checked = check_function_result(&self.errors, self.host.as_ref(), name, !result.is_valid());
        if let Err(exc) = checked {
            if result.is_valid() {
                let _ = self.table.close(result);
            }
            return Err(exc);
        }
        let target = self
            .table
            .resolve(result)
            .map_err(|e| self.host.raise(Singleton::SystemError, &format!("{name}: {e}")))?;
        let _ = self.table.close(result);
        Ok(target)
    }
}

/// A live bridge: one context, one handle table, one host runtime.
///
/// The context pointer stays valid for as long as the `Bridge` lives.
pub struct Bridge {
    state: Arc<BridgeState>,
}

impl Bridge {
    /// Create a bridge with default options.
    pub fn new(host: Arc<dyn HostRuntime>) -> Result<Self> {
        Self::with_options(host, BridgeOptions::default())
    }

    /// Create a bridge.
    pub fn with_options(host: Arc<dyn HostRuntime>, options: BridgeOptions) -> Result<Self> {
        options.validate()?;
        let table = HandleTable::new(options.max_handles, options.shards)?;
        let mut singletons = [Handle::NULL; Singleton::ALL.len()];
        for (slot, which) in singletons.iter_mut().zip(Singleton::ALL) {
            *slot = table.allocate_permanent(host.singleton(which))?;
        }

        let state = Arc::new_cyclic(|this: &Weak<BridgeState>| {
            let private = this.as_ptr() as *const std::os::raw::c_void;
            BridgeState {
                ctx: build_context(private, &singletons),
                host,
                table,
                errors: ErrorState::new(),
                legacy: LegacyAdapter::new(options.shards),
                policy: options.invalid_handle,
                this: this.clone(),
                singletons,
            }
        });
        debug!(
            "created context v{}.{} (capacity {}, {} shards)",
            version::MAJOR,
            version::MINOR,
            state.table.capacity(),
            options.shards
        );
        Ok(Self { state })
    }

    /// The context pointer to hand to native code.
    pub fn context(&self) -> Ctx {
        self.state.ctx_ptr()
    }

    /// The host runtime.
    pub fn host(&self) -> &Arc<dyn HostRuntime> {
        &self.state.host
    }

    /// The handle table.
    pub fn handles(&self) -> &HandleTable {
        &self.state.table
    }

    /// The pending-error indicator of this context.
    pub fn errors(&self) -> &ErrorState {
        &self.state.errors
    }

    /// The legacy wrapper cache.
    pub fn legacy(&self) -> &LegacyAdapter {
        &self.state.legacy
    }

    /// The interned handle of a singleton.
    pub fn singleton(&self, which: Singleton) -> Handle {
        self.state.singleton(which)
    }

    /// Expose a host object under a fresh handle.
    pub fn wrap(&self, target: HostRef) -> Result<Handle> {
        self.state.table.allocate(target)
    }

    /// The host object behind a handle.
    pub fn resolve(&self, handle: Handle) -> Result<HostRef> {
        self.state.table.resolve(handle)
    }

    /// Resolve the way a shim does, applying the invalid-handle policy.
    pub fn resolve_arg(&self, handle: Handle) -> Option<HostRef> {
        self.state.resolve_arg(handle)
    }

    /// Duplicate a handle.
    pub fn dup(&self, handle: Handle) -> Result<Handle> {
        self.state.table.duplicate(handle)
    }

    /// Close a handle.
    pub fn close(&self, handle: Handle) -> Result<Closed> {
        self.state.table.close(handle)
    }

    /// A new legacy reference to `target`.
    pub fn to_legacy(&self, target: HostRef) -> Result<*mut LegacyObject> {
        self.state.legacy.to_legacy(&self.state.table, target)
    }

    /// The host object behind a legacy wrapper.
    pub fn from_legacy(&self, obj: *mut LegacyObject) -> Result<HostRef> {
        self.state.legacy.from_legacy(&self.state.table, obj)
    }

    /// Add a reference to a legacy wrapper.
    pub fn legacy_incref(&self, obj: *mut LegacyObject) -> Result<()> {
        self.state.legacy.incref(&self.state.table, obj)
    }

    /// Drop a reference to a legacy wrapper, freeing it with the last one.
    pub fn legacy_decref(&self, obj: *mut LegacyObject) -> Result<()> {
        self.state.legacy.decref(&self.state.table, obj)
    }

    /// Build and register a module from a native descriptor.
    ///
    /// # Safety
    ///
    /// `def` and everything it points to must be valid descriptors whose
    /// function pointers match their declared calling conventions.
    pub unsafe fn create_module(&self, def: &crate::ffi::ModuleDef) -> Result<HostRef> {
        module::create(&self.state, def)
    }

    /// Load a native extension.
    ///
    /// The ABI version the extension was compiled against is checked before
    /// anything else; on mismatch `init` is never called.
    ///
    /// # Safety
    ///
    /// `init` must be a valid extension entry point.
    pub unsafe fn load_extension(&self, abi_version: c_int, init: InitFn) -> Result<HostRef> {
        if let Err(err) = version::check_abi_version(abi_version) {
            warn!("refusing to load extension: {err}");
            return Err(err);
        }
        let st = &self.state;
        let result = init(st.ctx_ptr());
        let module = st.check_result("extension init", result)?;
        debug!("loaded extension module {:?}", module);
        Ok(module)
    }
}

fn build_context(private: *const std::os::raw::c_void, singletons: &[Handle]) -> HContext {
    let h = |which: Singleton| {
        let idx = Singleton::ALL
            .iter()
            .position(|s| *s == which)
            .unwrap_or_default();
        singletons[idx]
    };
    HContext {
        ctx_version: version::packed(),
        _private: private,
        h_None: h(Singleton::None),
        h_True: h(Singleton::True),
        h_False: h(Singleton::False),
        h_ValueError: h(Singleton::ValueError),
        h_TypeError: h(Singleton::TypeError),
        ctx_Module_Create: module::ctx_Module_Create,
        ctx_Dup: shims::object::ctx_Dup,
        ctx_Close: shims::object::ctx_Close,
        ctx_Long_FromLong: shims::number::ctx_Long_FromLong,
        ctx_Long_FromLongLong: shims::number::ctx_Long_FromLongLong,
        ctx_Long_FromUnsignedLongLong: shims::number::ctx_Long_FromUnsignedLongLong,
        ctx_Long_AsLong: shims::number::ctx_Long_AsLong,
        ctx_Float_FromDouble: shims::number::ctx_Float_FromDouble,
        ctx_Number_Add: shims::number::ctx_Number_Add,
        ctx_Err_SetString: shims::errors::ctx_Err_SetString,
        ctx_Err_Occurred: shims::errors::ctx_Err_Occurred,
        ctx_Object_IsTrue: shims::object::ctx_Object_IsTrue,
        ctx_GetAttr: shims::object::ctx_GetAttr,
        ctx_GetAttr_s: shims::object::ctx_GetAttr_s,
        ctx_HasAttr: shims::object::ctx_HasAttr,
        ctx_HasAttr_s: shims::object::ctx_HasAttr_s,
        ctx_SetAttr: shims::object::ctx_SetAttr,
        ctx_SetAttr_s: shims::object::ctx_SetAttr_s,
        ctx_GetItem: shims::object::ctx_GetItem,
        ctx_GetItem_i: shims::object::ctx_GetItem_i,
        ctx_GetItem_s: shims::object::ctx_GetItem_s,
        ctx_SetItem: shims::object::ctx_SetItem,
        ctx_SetItem_i: shims::object::ctx_SetItem_i,
        ctx_SetItem_s: shims::object::ctx_SetItem_s,
        ctx_Bytes_Check: shims::sequence::ctx_Bytes_Check,
        ctx_Bytes_Size: shims::sequence::ctx_Bytes_Size,
        ctx_Bytes_GET_SIZE: shims::sequence::ctx_Bytes_GET_SIZE,
        ctx_Bytes_AsString: shims::sequence::ctx_Bytes_AsString,
        ctx_Bytes_AS_STRING: shims::sequence::ctx_Bytes_AS_STRING,
        ctx_Unicode_FromString: shims::sequence::ctx_Unicode_FromString,
        ctx_Unicode_Check: shims::sequence::ctx_Unicode_Check,
        ctx_Unicode_AsUTF8String: shims::sequence::ctx_Unicode_AsUTF8String,
        ctx_Unicode_FromWideChar: shims::sequence::ctx_Unicode_FromWideChar,
        ctx_List_New: shims::sequence::ctx_List_New,
        ctx_List_Append: shims::sequence::ctx_List_Append,
        ctx_Dict_New: shims::sequence::ctx_Dict_New,
        ctx_Dict_SetItem: shims::sequence::ctx_Dict_SetItem,
        ctx_Dict_GetItem: shims::sequence::ctx_Dict_GetItem,
        ctx_FromPyObject: legacy::ctx_FromPyObject,
        ctx_AsPyObject: legacy::ctx_AsPyObject,
        ctx_CallRealFunctionFromTrampoline: legacy::ctx_CallRealFunctionFromTrampoline,
        ctx_Err_Clear: shims::errors::ctx_Err_Clear,
        ctx_Err_Fetch: shims::errors::ctx_Err_Fetch,
        ctx_Call: shims::object::ctx_Call,
        h_MemoryError: h(Singleton::MemoryError),
        h_SystemError: h(Singleton::SystemError),
        h_OverflowError: h(Singleton::OverflowError),
        ctx_Float_AsDouble: shims::number::ctx_Float_AsDouble,
        ctx_Length: shims::object::ctx_Length,
        ctx_Long_Check: shims::number::ctx_Long_Check,
        ctx_List_Check: shims::sequence::ctx_List_Check,
        ctx_Dict_Check: shims::sequence::ctx_Dict_Check,
    }
}

impl Drop for BridgeState {
    fn drop(&mut self) {
        let leaked = self.legacy.release_all();
        if leaked > 0 {
            debug!("released {leaked} legacy wrappers still alive at context teardown");
        }
    }
}
