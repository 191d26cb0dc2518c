//! Module registration and native method dispatch.
//!
//! A [`ModuleDef`] is validated in full before anything reaches the host.
//! Each method becomes a host callable that allocates callback-local
//! handles for its arguments, invokes the native function with the
//! convention its flags declare, closes those handles again and checks the
//! result against the pending-error indicator.

#![allow(non_snake_case)]

use std::collections::HashSet;
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::{Arc, OnceLock, Weak};

use log::debug;

use crate::context::BridgeState;
use crate::error::{Error, Result};
use crate::ffi::{
    check_function_result, host_exception_for, Ctx, ExecFn, Handle, KeywordsFn, MethodDef,
    ModuleDef, NoArgsFn, OneArgFn, SlotDef, VarArgsFn, SLOT_END, SLOT_EXEC,
};
use crate::host::{
    FunctionSpec, HostFunction, HostRef, HostResult, ModuleSpec, Singleton, WeakHostRef,
};
use crate::shims::object::length;
use crate::table::HandleTable;
use crate::types::CallingConvention;

/// A validated method entry.
#[derive(Debug, Clone)]
pub(crate) struct NativeMethod {
    pub name: String,
    pub doc: Option<String>,
    pub conv: CallingConvention,
    meth: usize,
}

impl NativeMethod {
    pub(crate) fn new(name: String, conv: CallingConvention, meth: *const c_void) -> Self {
        Self {
            name,
            doc: None,
            conv,
            meth: meth as usize,
        }
    }
}

struct ParsedModule {
    name: String,
    doc: Option<String>,
    methods: Vec<NativeMethod>,
    exec: Vec<ExecFn>,
}

unsafe fn opt_str(s: *const c_char, what: &str) -> Result<Option<String>> {
    if s.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(s)
        .to_str()
        .map(|s| Some(s.to_string()))
        .map_err(|_| Error::InvalidModule(format!("{what} is not valid UTF-8")))
}

unsafe fn parse(def: &ModuleDef) -> Result<ParsedModule> {
    let name = opt_str(def.m_name, "module name")?
        .ok_or_else(|| Error::InvalidModule("module definition has no name".to_string()))?;
    let doc = opt_str(def.m_doc, "module doc")?;

    let mut methods = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: *const MethodDef = def.m_methods;
    while !cursor.is_null() && !(*cursor).ml_name.is_null() {
        let entry = &*cursor;
        let method_name = opt_str(entry.ml_name, "method name")?.unwrap_or_default();
        if entry.ml_meth.is_null() {
            return Err(Error::InvalidModule(format!(
                "method '{method_name}' has no implementation"
            )));
        }
        let conv = CallingConvention::from_flags(entry.ml_flags).ok_or_else(|| {
            Error::InvalidModule(format!(
                "method '{method_name}' has invalid flags {:#x}",
                entry.ml_flags
            ))
        })?;
        if !seen.insert(method_name.clone()) {
            return Err(Error::InvalidModule(format!(
                "duplicate method name '{method_name}'"
            )));
        }
        let mut method = NativeMethod::new(method_name, conv, entry.ml_meth);
        method.doc = opt_str(entry.ml_doc, "method doc")?;
        methods.push(method);
        cursor = cursor.add(1);
    }

    let mut exec = Vec::new();
    let mut cursor: *const SlotDef = def.m_slots;
    while !cursor.is_null() && (*cursor).slot != SLOT_END {
        let slot = &*cursor;
        match slot.slot {
            SLOT_EXEC if !slot.value.is_null() => {
                exec.push(std::mem::transmute::<*const c_void, ExecFn>(slot.value));
            }
            SLOT_EXEC => {
                return Err(Error::InvalidModule("exec slot has no function".to_string()))
            }
            other => return Err(Error::InvalidModule(format!("unknown slot id {other}"))),
        }
        cursor = cursor.add(1);
    }

    Ok(ParsedModule {
        name,
        doc,
        methods,
        exec,
    })
}

/// Validate `def`, register it with the host and run its exec slots.
pub(crate) unsafe fn create(st: &BridgeState, def: &ModuleDef) -> Result<HostRef> {
    let parsed = parse(def)?;
    let module_self: Arc<OnceLock<WeakHostRef>> = Arc::new(OnceLock::new());

    let functions = parsed
        .methods
        .iter()
        .map(|method| FunctionSpec {
            name: method.name.clone(),
            doc: method.doc.clone(),
            keywords: method.conv == CallingConvention::Keywords,
            func: native_function(st, method.clone(), Arc::clone(&module_self)),
        })
        .collect();
    let spec = ModuleSpec {
        name: parsed.name.clone(),
        doc: parsed.doc,
        functions,
    };
    let module = st.host.create_module(spec)?;
    let _ = module_self.set(module.downgrade());

    for exec in parsed.exec {
        let handle = st.table.allocate(module.clone())?;
        let rc = exec(st.ctx_ptr(), handle);
        let _ = st.table.close(handle);
        check_function_result(&st.errors, st.host.as_ref(), "module exec", rc != 0)?;
    }

    debug!(
        "created module '{}' with {} methods",
        parsed.name,
        parsed.methods.len()
    );
    Ok(module)
}

fn native_function(
    st: &BridgeState,
    method: NativeMethod,
    module_self: Arc<OnceLock<WeakHostRef>>,
) -> HostFunction {
    let bridge: Weak<BridgeState> = st.this.clone();
    let host = Arc::clone(&st.host);
    host_function(move |args, kwargs| {
        let Some(st) = bridge.upgrade() else {
            return Err(host.raise(Singleton::SystemError, &Error::ContextReleased.to_string()));
        };
        let this = module_self
            .get()
            .and_then(WeakHostRef::upgrade)
            .unwrap_or_else(|| st.host.singleton(Singleton::None));
        // SAFETY: the pointer was validated against its flags at registration.
        unsafe { call_native(&st, &method, this, args, kwargs) }
    })
}

fn host_function<F>(f: F) -> HostFunction
where
    F: Fn(&[HostRef], Option<&HostRef>) -> HostResult<HostRef> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handles that live only for the duration of one native call.
struct LocalHandles<'a> {
    table: &'a HandleTable,
    handles: Vec<Handle>,
}

impl<'a> LocalHandles<'a> {
    fn new(table: &'a HandleTable) -> Self {
        Self {
            table,
            handles: Vec::new(),
        }
    }

    fn push(&mut self, target: HostRef) -> Result<Handle> {
        let h = self.table.allocate(target)?;
        self.handles.push(h);
        Ok(h)
    }
}

impl Drop for LocalHandles<'_> {
    fn drop(&mut self) {
        for h in self.handles.drain(..) {
            // Native code may already have closed a borrowed handle.
            let _ = self.table.close(h);
        }
    }
}

fn arity_error(st: &BridgeState, message: String) -> HostResult<HostRef> {
    Err(st.host.raise(Singleton::TypeError, &message))
}

/// Invoke a native method with host arguments and check its result.
///
/// # Safety
///
/// `method` must carry a function pointer matching its calling convention.
pub(crate) unsafe fn call_native(
    st: &BridgeState,
    method: &NativeMethod,
    this: HostRef,
    args: &[HostRef],
    kwargs: Option<&HostRef>,
) -> HostResult<HostRef> {
    let name = method.name.as_str();
    // An empty keyword dictionary counts as no keywords.
    let keywords = match kwargs {
        Some(kw) => length(st, kw)?,
        None => 0,
    };
    match method.conv {
        CallingConvention::NoArgs if !args.is_empty() || keywords > 0 => {
            return arity_error(
                st,
                format!("{name}() takes no arguments ({} given)", args.len()),
            );
        }
        CallingConvention::O if args.len() != 1 || keywords > 0 => {
            return arity_error(
                st,
                format!("{name}() takes exactly one argument ({} given)", args.len()),
            );
        }
        CallingConvention::VarArgs if keywords > 0 => {
            return arity_error(st, format!("{name}() takes no keyword arguments"));
        }
        _ => {}
    }

    let ctx: Ctx = st.ctx_ptr();
    let mut locals = LocalHandles::new(&st.table);
    let local = |locals: &mut LocalHandles<'_>, target: HostRef| {
        locals
            .push(target)
            .map_err(|e| host_exception_for(st.host.as_ref(), &e))
    };
    let this_h = local(&mut locals, this)?;
    let mut arg_handles = Vec::with_capacity(args.len());
    for arg in args {
        arg_handles.push(local(&mut locals, arg.clone())?);
    }
    let kw_h = match kwargs {
        Some(kw) if method.conv == CallingConvention::Keywords => local(&mut locals, kw.clone())?,
        _ => Handle::NULL,
    };

    let meth = method.meth as *const c_void;
    let result = match method.conv {
        CallingConvention::NoArgs => {
            let f = std::mem::transmute::<*const c_void, NoArgsFn>(meth);
            f(ctx, this_h)
        }
        CallingConvention::O => {
            let f = std::mem::transmute::<*const c_void, OneArgFn>(meth);
            f(ctx, this_h, arg_handles[0])
        }
        CallingConvention::VarArgs => {
            let f = std::mem::transmute::<*const c_void, VarArgsFn>(meth);
            f(ctx, this_h, arg_handles.as_ptr(), arg_handles.len() as isize)
        }
        CallingConvention::Keywords => {
            let f = std::mem::transmute::<*const c_void, KeywordsFn>(meth);
            f(
                ctx,
                this_h,
                arg_handles.as_ptr(),
                arg_handles.len() as isize,
                kw_h,
            )
        }
    };
    drop(locals);
    st.check_result(name, result)
}

/// Register a module described by `def` and return a handle to it.
///
/// # Safety
///
/// `def` must be null or point to a descriptor whose tables are terminated.
pub unsafe extern "C" fn ctx_Module_Create(ctx: Ctx, def: *const ModuleDef) -> Handle {
    let Some(st) = BridgeState::from_ctx(ctx) else {
        return Handle::NULL;
    };
    let Some(def) = def.as_ref() else {
        st.fail(&Error::InvalidModule("null module definition".to_string()));
        return Handle::NULL;
    };
    match create(st, def) {
        Ok(module) => st.wrap(module),
        Err(err) => {
            st.fail(&err);
            Handle::NULL
        }
    }
}
