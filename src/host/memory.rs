//! An in-process host runtime with a small dynamic object model.
//!
//! `MemoryHost` implements [`HostRuntime`] over reference-counted objects:
//! none, booleans, integers, floats, text, byte strings, lists,
//! dictionaries, classes with instances, exceptions, functions and modules.
//! Byte strings can be relocated by [`MemoryHost::compact`] unless pinned,
//! which makes pinning observable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    FunctionSpec, HostException, HostFunction, HostOp, HostRef, HostResult, HostRuntime,
    ModuleSpec, PinnedBuffer, Singleton, TypeKind, WeakHostRef,
};

/// A host object.
pub enum Object {
    /// The none value.
    None,
    /// Boolean.
    Bool(bool),
    /// Integer wide enough for every native 64-bit value.
    Int(i128),
    /// Double precision float.
    Float(f64),
    /// Text.
    Str(String),
    /// Immutable byte string with a relocatable buffer.
    Bytes(BytesObject),
    /// Mutable list.
    List(Mutex<Vec<HostRef>>),
    /// Insertion-ordered dictionary.
    Dict(Mutex<Vec<(HostRef, HostRef)>>),
    /// Class object.
    Type(TypeObject),
    /// Instance of a class.
    Instance(InstanceObject),
    /// Exception instance.
    Exception(ExceptionObject),
    /// Callable implemented outside the object model.
    Function(FunctionObject),
    /// Module object.
    Module(ModuleObject),
}

/// Byte string storage. The buffer always carries a trailing NUL.
pub struct BytesObject {
    data: Mutex<Box<[u8]>>,
    pins: AtomicUsize,
}

impl BytesObject {
    fn new(bytes: &[u8]) -> Self {
        Self {
            data: Mutex::new(nul_terminated(bytes)),
            pins: AtomicUsize::new(0),
        }
    }

    /// Contents without the trailing NUL.
    pub fn to_vec(&self) -> Vec<u8> {
        let data = self.data.lock();
        data[..data.len() - 1].to_vec()
    }

    fn len(&self) -> usize {
        self.data.lock().len() - 1
    }
}

fn nul_terminated(bytes: &[u8]) -> Box<[u8]> {
    let mut buf = Vec::with_capacity(bytes.len() + 1);
    buf.extend_from_slice(bytes);
    buf.push(0);
    buf.into_boxed_slice()
}

/// A class.
pub struct TypeObject {
    /// Class name.
    pub name: String,
    /// Base class.
    pub base: Option<HostRef>,
    attrs: Mutex<Vec<(String, HostRef)>>,
}

/// An instance of a class.
pub struct InstanceObject {
    /// The instance's class.
    pub class: HostRef,
    attrs: Mutex<Vec<(String, HostRef)>>,
    frozen: bool,
}

/// An exception instance.
pub struct ExceptionObject {
    /// Exception type.
    pub exc_type: HostRef,
    /// Message the exception was raised with.
    pub message: String,
}

/// A callable implemented in Rust or in native extension code.
pub struct FunctionObject {
    /// Function name.
    pub name: String,
    /// Docstring.
    pub doc: Option<String>,
    keywords: bool,
    func: HostFunction,
}

/// A module.
pub struct ModuleObject {
    /// Module name.
    pub name: String,
    attrs: Mutex<Vec<(String, HostRef)>>,
}

fn lookup(attrs: &Mutex<Vec<(String, HostRef)>>, name: &str) -> Option<HostRef> {
    attrs
        .lock()
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

fn store(attrs: &Mutex<Vec<(String, HostRef)>>, name: &str, value: HostRef) {
    let mut attrs = attrs.lock();
    match attrs.iter_mut().find(|(k, _)| k == name) {
        Some(slot) => slot.1 = value,
        None => attrs.push((name.to_string(), value)),
    }
}

/// Reference host runtime.
pub struct MemoryHost {
    none: HostRef,
    true_: HostRef,
    false_: HostRef,
    object_type: HostRef,
    base_exception: HostRef,
    value_error: HostRef,
    type_error: HostRef,
    memory_error: HostRef,
    system_error: HostRef,
    overflow_error: HostRef,
    attribute_error: HostRef,
    key_error: HostRef,
    index_error: HostRef,
    byte_strings: Mutex<Vec<WeakHostRef>>,
    invocations: AtomicUsize,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    /// Create a runtime with its builtin types.
    pub fn new() -> Self {
        let object_type = new_type("object", None);
        let base_exception = new_type("BaseException", Some(object_type.clone()));
        let exc = |name: &str| new_type(name, Some(base_exception.clone()));
        Self {
            none: HostRef::new(Object::None),
            true_: HostRef::new(Object::Bool(true)),
            false_: HostRef::new(Object::Bool(false)),
            value_error: exc("ValueError"),
            type_error: exc("TypeError"),
            memory_error: exc("MemoryError"),
            system_error: exc("SystemError"),
            overflow_error: exc("OverflowError"),
            attribute_error: exc("AttributeError"),
            key_error: exc("KeyError"),
            index_error: exc("IndexError"),
            object_type,
            base_exception,
            byte_strings: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Number of capabilities invoked so far.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }

    /// The `AttributeError` type.
    pub fn attribute_error(&self) -> HostRef {
        self.attribute_error.clone()
    }

    /// The `KeyError` type.
    pub fn key_error(&self) -> HostRef {
        self.key_error.clone()
    }

    /// The `IndexError` type.
    pub fn index_error(&self) -> HostRef {
        self.index_error.clone()
    }

    /// Define a class deriving from `object`.
    pub fn new_class(&self, name: &str) -> HostRef {
        new_type(name, Some(self.object_type.clone()))
    }

    /// Create an instance with writable attributes.
    pub fn new_instance(&self, class: &HostRef) -> HostRef {
        self.instance(class, false)
    }

    /// Create an instance whose attributes cannot be set.
    pub fn new_frozen_instance(&self, class: &HostRef) -> HostRef {
        self.instance(class, true)
    }

    fn instance(&self, class: &HostRef, frozen: bool) -> HostRef {
        HostRef::new(Object::Instance(InstanceObject {
            class: class.clone(),
            attrs: Mutex::new(Vec::new()),
            frozen,
        }))
    }

    /// Wrap a Rust closure as a host callable.
    pub fn new_function<F>(&self, name: &str, func: F) -> HostRef
    where
        F: Fn(&[HostRef], Option<&HostRef>) -> HostResult<HostRef> + Send + Sync + 'static,
    {
        HostRef::new(Object::Function(FunctionObject {
            name: name.to_string(),
            doc: None,
            keywords: true,
            func: Arc::new(func),
        }))
    }

    /// Bind an attribute on a class or module without going through `SetAttr`.
    pub fn set_class_attr(&self, target: &HostRef, name: &str, value: HostRef) {
        match target.downcast_ref::<Object>() {
            Some(Object::Type(t)) => store(&t.attrs, name, value),
            Some(Object::Module(m)) => store(&m.attrs, name, value),
            Some(Object::Instance(i)) => store(&i.attrs, name, value),
            _ => {}
        }
    }

    /// Integer value of `obj`, if it is an integer.
    pub fn int_value(&self, obj: &HostRef) -> Option<i128> {
        match obj.downcast_ref::<Object>()? {
            Object::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value of `obj`, if it is a float.
    pub fn float_value(&self, obj: &HostRef) -> Option<f64> {
        match obj.downcast_ref::<Object>()? {
            Object::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value of `obj`, if it is text.
    pub fn str_value(&self, obj: &HostRef) -> Option<String> {
        match obj.downcast_ref::<Object>()? {
            Object::Str(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Byte string contents of `obj`, if it is a byte string.
    pub fn bytes_value(&self, obj: &HostRef) -> Option<Vec<u8>> {
        match obj.downcast_ref::<Object>()? {
            Object::Bytes(b) => Some(b.to_vec()),
            _ => None,
        }
    }

    /// Snapshot of a list's items.
    pub fn list_items(&self, obj: &HostRef) -> Option<Vec<HostRef>> {
        match obj.downcast_ref::<Object>()? {
            Object::List(items) => Some(items.lock().clone()),
            _ => None,
        }
    }

    /// Number of entries in a dictionary.
    pub fn dict_len(&self, obj: &HostRef) -> Option<usize> {
        match obj.downcast_ref::<Object>()? {
            Object::Dict(entries) => Some(entries.lock().len()),
            _ => None,
        }
    }

    /// Message of an exception instance.
    pub fn exception_message(&self, obj: &HostRef) -> Option<String> {
        match obj.downcast_ref::<Object>()? {
            Object::Exception(e) => Some(e.message.clone()),
            _ => None,
        }
    }

    /// Attribute lookup without counting as a capability invocation.
    pub fn peek_attr(&self, obj: &HostRef, name: &str) -> Option<HostRef> {
        get_attr(obj, name)
    }

    /// Number of outstanding pins on a byte string.
    pub fn pin_count(&self, obj: &HostRef) -> usize {
        match obj.downcast_ref::<Object>() {
            Some(Object::Bytes(b)) => b.pins.load(Ordering::SeqCst),
            _ => 0,
        }
    }

    /// Move every unpinned byte string to a fresh buffer.
    ///
    /// Returns the number of buffers moved.
    pub fn compact(&self) -> usize {
        let mut moved = 0;
        let mut strings = self.byte_strings.lock();
        strings.retain(|weak| weak.is_retained());
        for weak in strings.iter() {
            let Some(obj) = weak.upgrade() else {
                continue;
            };
            if let Some(Object::Bytes(b)) = obj.downcast_ref::<Object>() {
                let mut data = b.data.lock();
                if b.pins.load(Ordering::SeqCst) == 0 {
                    let fresh = data.to_vec().into_boxed_slice();
                    *data = fresh;
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Name of the type of `obj`.
    pub fn type_name(&self, obj: &HostRef) -> String {
        type_name(obj)
    }

    fn int(&self, v: i128) -> HostRef {
        HostRef::new(Object::Int(v))
    }

    fn bytes(&self, data: &[u8]) -> HostRef {
        let obj = HostRef::new(Object::Bytes(BytesObject::new(data)));
        let mut strings = self.byte_strings.lock();
        // Drop reclaimed entries before the list would grow.
        if strings.len() == strings.capacity() {
            strings.retain(|weak| weak.is_retained());
        }
        strings.push(obj.downgrade());
        obj
    }

    fn type_err(&self, message: String) -> HostException {
        self.new_exception(&self.type_error, &message)
    }

    fn attr_name(&self, name: &HostRef) -> HostResult<String> {
        match name.downcast_ref::<Object>() {
            Some(Object::Str(s)) => Ok(s.clone()),
            _ => Err(self.type_err(format!(
                "attribute name must be string, not '{}'",
                type_name(name)
            ))),
        }
    }

    fn add(&self, a: &HostRef, b: &HostRef) -> HostResult<HostRef> {
        let (Some(x), Some(y)) = (a.downcast_ref::<Object>(), b.downcast_ref::<Object>()) else {
            return Err(self.type_err("unsupported operand type(s) for +".to_string()));
        };
        match (x, y) {
            (Object::Int(l), Object::Int(r)) => match l.checked_add(*r) {
                Some(sum) => Ok(self.int(sum)),
                None => Err(self.new_exception(&self.overflow_error, "integer overflow")),
            },
            (Object::Float(l), Object::Float(r)) => Ok(HostRef::new(Object::Float(l + r))),
            (Object::Int(l), Object::Float(r)) => Ok(HostRef::new(Object::Float(*l as f64 + r))),
            (Object::Float(l), Object::Int(r)) => Ok(HostRef::new(Object::Float(l + *r as f64))),
            (Object::Str(l), Object::Str(r)) => Ok(HostRef::new(Object::Str(format!("{l}{r}")))),
            (Object::Bytes(l), Object::Bytes(r)) => {
                let mut joined = l.to_vec();
                joined.extend_from_slice(&r.to_vec());
                Ok(self.bytes(&joined))
            }
            (Object::List(l), Object::List(r)) => {
                let mut joined = l.lock().clone();
                joined.extend(r.lock().iter().cloned());
                Ok(HostRef::new(Object::List(Mutex::new(joined))))
            }
            _ => Err(self.type_err(format!(
                "unsupported operand type(s) for +: '{}' and '{}'",
                type_name(a),
                type_name(b)
            ))),
        }
    }

    fn get_attr_op(&self, obj: &HostRef, name: &HostRef) -> HostResult<HostRef> {
        let name = self.attr_name(name)?;
        get_attr(obj, &name).ok_or_else(|| {
            self.new_exception(
                &self.attribute_error,
                &format!("'{}' object has no attribute '{}'", type_name(obj), name),
            )
        })
    }

    fn set_attr_op(&self, obj: &HostRef, name: &HostRef, value: &HostRef) -> HostResult<HostRef> {
        let name = self.attr_name(name)?;
        match obj.downcast_ref::<Object>() {
            Some(Object::Instance(i)) if !i.frozen => store(&i.attrs, &name, value.clone()),
            Some(Object::Instance(_)) => {
                return Err(self.new_exception(
                    &self.attribute_error,
                    &format!("'{}' object attribute '{}' is read-only", type_name(obj), name),
                ))
            }
            Some(Object::Type(t)) => store(&t.attrs, &name, value.clone()),
            Some(Object::Module(m)) => store(&m.attrs, &name, value.clone()),
            _ => {
                return Err(self.new_exception(
                    &self.attribute_error,
                    &format!("'{}' object has no attribute '{}'", type_name(obj), name),
                ))
            }
        }
        Ok(self.none.clone())
    }

    fn index(&self, len: usize, key: &HostRef) -> HostResult<usize> {
        let raw = match key.downcast_ref::<Object>() {
            Some(Object::Int(i)) => *i,
            Some(Object::Bool(b)) => *b as i128,
            _ => {
                return Err(self.type_err(format!(
                    "indices must be integers, not '{}'",
                    type_name(key)
                )))
            }
        };
        let idx = if raw < 0 { raw + len as i128 } else { raw };
        if idx < 0 || idx >= len as i128 {
            return Err(self.new_exception(&self.index_error, "index out of range"));
        }
        Ok(idx as usize)
    }

    fn dict_get(&self, dict: &Mutex<Vec<(HostRef, HostRef)>>, key: &HostRef) -> HostResult<HostRef> {
        dict.lock()
            .iter()
            .find(|(k, _)| keys_equal(k, key))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| self.new_exception(&self.key_error, &describe(key)))
    }

    fn dict_set(&self, dict: &Mutex<Vec<(HostRef, HostRef)>>, key: &HostRef, value: &HostRef) {
        let mut entries = dict.lock();
        match entries.iter_mut().find(|(k, _)| keys_equal(k, key)) {
            Some(entry) => entry.1 = value.clone(),
            None => entries.push((key.clone(), value.clone())),
        }
    }

    fn get_item(&self, obj: &HostRef, key: &HostRef) -> HostResult<HostRef> {
        match obj.downcast_ref::<Object>() {
            Some(Object::List(items)) => {
                let items = items.lock();
                let idx = self.index(items.len(), key)?;
                Ok(items[idx].clone())
            }
            Some(Object::Dict(entries)) => self.dict_get(entries, key),
            Some(Object::Bytes(b)) => {
                let data = b.to_vec();
                let idx = self.index(data.len(), key)?;
                Ok(self.int(data[idx] as i128))
            }
            Some(Object::Str(s)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = self.index(chars.len(), key)?;
                Ok(HostRef::new(Object::Str(chars[idx].to_string())))
            }
            _ => Err(self.type_err(format!(
                "'{}' object is not subscriptable",
                type_name(obj)
            ))),
        }
    }

    fn set_item(&self, obj: &HostRef, key: &HostRef, value: &HostRef) -> HostResult<HostRef> {
        match obj.downcast_ref::<Object>() {
            Some(Object::List(items)) => {
                let mut items = items.lock();
                let idx = self.index(items.len(), key)?;
                items[idx] = value.clone();
            }
            Some(Object::Dict(entries)) => self.dict_set(entries, key, value),
            _ => {
                return Err(self.type_err(format!(
                    "'{}' object does not support item assignment",
                    type_name(obj)
                )))
            }
        }
        Ok(self.none.clone())
    }

    fn len(&self, obj: &HostRef) -> HostResult<HostRef> {
        let len = match obj.downcast_ref::<Object>() {
            Some(Object::Str(s)) => s.chars().count(),
            Some(Object::Bytes(b)) => b.len(),
            Some(Object::List(items)) => items.lock().len(),
            Some(Object::Dict(entries)) => entries.lock().len(),
            _ => {
                return Err(self.type_err(format!(
                    "object of type '{}' has no len()",
                    type_name(obj)
                )))
            }
        };
        Ok(self.int(len as i128))
    }

    fn expect_list<'a>(&self, obj: &'a HostRef) -> HostResult<&'a Mutex<Vec<HostRef>>> {
        match obj.downcast_ref::<Object>() {
            Some(Object::List(items)) => Ok(items),
            _ => Err(self.type_err(format!("expected list, {} found", type_name(obj)))),
        }
    }

    fn expect_dict<'a>(&self, obj: &'a HostRef) -> HostResult<&'a Mutex<Vec<(HostRef, HostRef)>>> {
        match obj.downcast_ref::<Object>() {
            Some(Object::Dict(entries)) => Ok(entries),
            _ => Err(self.type_err(format!("expected dict, {} found", type_name(obj)))),
        }
    }
}

fn new_type(name: &str, base: Option<HostRef>) -> HostRef {
    HostRef::new(Object::Type(TypeObject {
        name: name.to_string(),
        base,
        attrs: Mutex::new(Vec::new()),
    }))
}

fn class_lookup(class: &HostRef, name: &str) -> Option<HostRef> {
    let mut current = Some(class.clone());
    while let Some(cls) = current {
        let Some(Object::Type(t)) = cls.downcast_ref::<Object>() else {
            return None;
        };
        if let Some(v) = lookup(&t.attrs, name) {
            return Some(v);
        }
        current = t.base.clone();
    }
    None
}

fn get_attr(obj: &HostRef, name: &str) -> Option<HostRef> {
    match obj.downcast_ref::<Object>()? {
        Object::Instance(i) => lookup(&i.attrs, name).or_else(|| class_lookup(&i.class, name)),
        Object::Type(_) => class_lookup(obj, name),
        Object::Module(m) => lookup(&m.attrs, name),
        Object::Exception(e) => class_lookup(&e.exc_type, name),
        _ => None,
    }
}

fn is_subclass(class: &HostRef, base: &HostRef) -> bool {
    let mut current = Some(class.clone());
    while let Some(cls) = current {
        if cls.ptr_eq(base) {
            return true;
        }
        current = match cls.downcast_ref::<Object>() {
            Some(Object::Type(t)) => t.base.clone(),
            _ => None,
        };
    }
    false
}

fn keys_equal(a: &HostRef, b: &HostRef) -> bool {
    if a.ptr_eq(b) {
        return true;
    }
    match (a.downcast_ref::<Object>(), b.downcast_ref::<Object>()) {
        (Some(Object::Int(x)), Some(Object::Int(y))) => x == y,
        (Some(Object::Str(x)), Some(Object::Str(y))) => x == y,
        (Some(Object::Bool(x)), Some(Object::Bool(y))) => x == y,
        (Some(Object::Float(x)), Some(Object::Float(y))) => x == y,
        (Some(Object::None), Some(Object::None)) => true,
        (Some(Object::Bytes(x)), Some(Object::Bytes(y))) => x.to_vec() == y.to_vec(),
        _ => false,
    }
}

fn describe(obj: &HostRef) -> String {
    match obj.downcast_ref::<Object>() {
        Some(Object::Int(v)) => v.to_string(),
        Some(Object::Str(s)) => format!("'{s}'"),
        Some(Object::Bool(b)) => (if *b { "True" } else { "False" }).to_string(),
        Some(Object::None) => "None".to_string(),
        _ => format!("<{} object>", type_name(obj)),
    }
}

fn type_name(obj: &HostRef) -> String {
    match obj.downcast_ref::<Object>() {
        Some(Object::None) => "NoneType".to_string(),
        Some(Object::Bool(_)) => "bool".to_string(),
        Some(Object::Int(_)) => "int".to_string(),
        Some(Object::Float(_)) => "float".to_string(),
        Some(Object::Str(_)) => "str".to_string(),
        Some(Object::Bytes(_)) => "bytes".to_string(),
        Some(Object::List(_)) => "list".to_string(),
        Some(Object::Dict(_)) => "dict".to_string(),
        Some(Object::Type(_)) => "type".to_string(),
        Some(Object::Instance(i)) => class_name(&i.class),
        Some(Object::Exception(e)) => class_name(&e.exc_type),
        Some(Object::Function(_)) => "builtin_function_or_method".to_string(),
        Some(Object::Module(_)) => "module".to_string(),
        None => "foreign".to_string(),
    }
}

fn class_name(class: &HostRef) -> String {
    match class.downcast_ref::<Object>() {
        Some(Object::Type(t)) => t.name.clone(),
        _ => "object".to_string(),
    }
}

impl HostRuntime for MemoryHost {
    fn singleton(&self, which: Singleton) -> HostRef {
        match which {
            Singleton::None => self.none.clone(),
            Singleton::True => self.true_.clone(),
            Singleton::False => self.false_.clone(),
            Singleton::ValueError => self.value_error.clone(),
            Singleton::TypeError => self.type_error.clone(),
            Singleton::MemoryError => self.memory_error.clone(),
            Singleton::SystemError => self.system_error.clone(),
            Singleton::OverflowError => self.overflow_error.clone(),
        }
    }

    fn call(&self, op: HostOp, args: &[HostRef]) -> HostResult<HostRef> {
        self.hit();
        if args.len() != op.arity() {
            return Err(self.type_err(format!(
                "{}() takes {} arguments ({} given)",
                op.name(),
                op.arity(),
                args.len()
            )));
        }
        match op {
            HostOp::Add => self.add(&args[0], &args[1]),
            HostOp::GetAttr => self.get_attr_op(&args[0], &args[1]),
            HostOp::SetAttr => self.set_attr_op(&args[0], &args[1], &args[2]),
            HostOp::GetItem => self.get_item(&args[0], &args[1]),
            HostOp::SetItem => self.set_item(&args[0], &args[1], &args[2]),
            HostOp::Len => self.len(&args[0]),
            HostOp::ListAppend => {
                self.expect_list(&args[0])?.lock().push(args[1].clone());
                Ok(self.none.clone())
            }
            HostOp::DictSetItem => {
                let entries = self.expect_dict(&args[0])?;
                self.dict_set(entries, &args[1], &args[2]);
                Ok(self.none.clone())
            }
            HostOp::DictGetItem => {
                let entries = self.expect_dict(&args[0])?;
                self.dict_get(entries, &args[1])
            }
            HostOp::EncodeUtf8 => match args[0].downcast_ref::<Object>() {
                Some(Object::Str(s)) => Ok(self.bytes(s.as_bytes())),
                _ => Err(self.type_err(format!(
                    "bad argument type for built-in operation: '{}'",
                    type_name(&args[0])
                ))),
            },
        }
    }

    fn call_object(
        &self,
        callable: &HostRef,
        args: &[HostRef],
        kwargs: Option<&HostRef>,
    ) -> HostResult<HostRef> {
        self.hit();
        match callable.downcast_ref::<Object>() {
            Some(Object::Function(f)) => {
                if !f.keywords && kwargs.is_some_and(|kw| self.dict_len(kw) != Some(0)) {
                    return Err(self.type_err(format!(
                        "{}() takes no keyword arguments",
                        f.name
                    )));
                }
                (f.func)(args, kwargs)
            }
            Some(Object::Type(_)) if is_subclass(callable, &self.base_exception) => {
                let message = args
                    .first()
                    .and_then(|a| self.str_value(a))
                    .unwrap_or_default();
                Ok(self.new_exception(callable, &message).value)
            }
            Some(Object::Type(_)) => Ok(self.new_instance(callable)),
            _ => Err(self.type_err(format!(
                "'{}' object is not callable",
                type_name(callable)
            ))),
        }
    }

    fn is_true(&self, obj: &HostRef) -> HostResult<bool> {
        self.hit();
        match obj.downcast_ref::<Object>() {
            Some(Object::None) => Ok(false),
            Some(Object::Bool(b)) => Ok(*b),
            Some(Object::Int(v)) => Ok(*v != 0),
            Some(Object::Float(v)) => Ok(*v != 0.0),
            Some(Object::Str(s)) => Ok(!s.is_empty()),
            Some(Object::Bytes(b)) => Ok(b.len() != 0),
            Some(Object::List(items)) => Ok(!items.lock().is_empty()),
            Some(Object::Dict(entries)) => Ok(!entries.lock().is_empty()),
            Some(Object::Instance(i)) => {
                let Some(hook) = class_lookup(&i.class, "__bool__") else {
                    return Ok(true);
                };
                let result = self.call_object(&hook, std::slice::from_ref(obj), None)?;
                match result.downcast_ref::<Object>() {
                    Some(Object::Bool(b)) => Ok(*b),
                    _ => Err(self.type_err(format!(
                        "__bool__ should return bool, returned {}",
                        type_name(&result)
                    ))),
                }
            }
            _ => Ok(true),
        }
    }

    fn is_instance(&self, obj: &HostRef, kind: TypeKind) -> bool {
        self.hit();
        matches!(
            (kind, obj.downcast_ref::<Object>()),
            (TypeKind::Bytes, Some(Object::Bytes(_)))
                | (TypeKind::Unicode, Some(Object::Str(_)))
                | (TypeKind::List, Some(Object::List(_)))
                | (TypeKind::Dict, Some(Object::Dict(_)))
                | (TypeKind::Long, Some(Object::Int(_)))
                | (TypeKind::Long, Some(Object::Bool(_)))
        )
    }

    fn from_i64(&self, value: i64) -> HostResult<HostRef> {
        self.hit();
        Ok(self.int(value as i128))
    }

    fn from_u64(&self, value: u64) -> HostResult<HostRef> {
        self.hit();
        Ok(self.int(value as i128))
    }

    fn from_f64(&self, value: f64) -> HostResult<HostRef> {
        self.hit();
        Ok(HostRef::new(Object::Float(value)))
    }

    fn from_str(&self, value: &str) -> HostResult<HostRef> {
        self.hit();
        Ok(HostRef::new(Object::Str(value.to_string())))
    }

    fn from_bytes(&self, value: &[u8]) -> HostResult<HostRef> {
        self.hit();
        Ok(self.bytes(value))
    }

    fn as_i64(&self, obj: &HostRef) -> HostResult<i64> {
        self.hit();
        match obj.downcast_ref::<Object>() {
            Some(Object::Int(v)) => i64::try_from(*v).map_err(|_| {
                self.new_exception(
                    &self.overflow_error,
                    "int too large to convert to a native integer",
                )
            }),
            Some(Object::Bool(b)) => Ok(*b as i64),
            _ => Err(self.type_err(format!(
                "an integer is required (got type {})",
                type_name(obj)
            ))),
        }
    }

    fn as_f64(&self, obj: &HostRef) -> HostResult<f64> {
        self.hit();
        match obj.downcast_ref::<Object>() {
            Some(Object::Float(v)) => Ok(*v),
            Some(Object::Int(v)) => Ok(*v as f64),
            Some(Object::Bool(b)) => Ok(f64::from(u8::from(*b))),
            _ => Err(self.type_err(format!(
                "must be real number, not {}",
                type_name(obj)
            ))),
        }
    }

    fn new_list(&self, len: usize) -> HostResult<HostRef> {
        self.hit();
        Ok(HostRef::new(Object::List(Mutex::new(vec![
            self.none.clone();
            len
        ]))))
    }

    fn new_dict(&self) -> HostResult<HostRef> {
        self.hit();
        Ok(HostRef::new(Object::Dict(Mutex::new(Vec::new()))))
    }

    fn new_exception(&self, exc_type: &HostRef, message: &str) -> HostException {
        let value = HostRef::new(Object::Exception(ExceptionObject {
            exc_type: exc_type.clone(),
            message: message.to_string(),
        }));
        HostException::new(exc_type.clone(), value)
    }

    fn pin_bytes(&self, obj: &HostRef) -> HostResult<PinnedBuffer> {
        self.hit();
        let Some(Object::Bytes(b)) = obj.downcast_ref::<Object>() else {
            return Err(self.type_err(format!("expected bytes, {} found", type_name(obj))));
        };
        let data = b.data.lock();
        b.pins.fetch_add(1, Ordering::SeqCst);
        let guard = Box::new(BytesPin { obj: obj.clone() });
        // SAFETY: the buffer is NUL-terminated and `compact` skips pinned
        // strings; the guard retains the object until unpinned.
        Ok(unsafe { PinnedBuffer::new(data.as_ptr(), data.len() - 1, guard) })
    }

    fn create_module(&self, spec: ModuleSpec) -> HostResult<HostRef> {
        self.hit();
        let mut attrs = vec![(
            "__name__".to_string(),
            HostRef::new(Object::Str(spec.name.clone())),
        )];
        let doc = match &spec.doc {
            Some(d) => HostRef::new(Object::Str(d.clone())),
            None => self.none.clone(),
        };
        attrs.push(("__doc__".to_string(), doc));
        for FunctionSpec {
            name,
            doc,
            keywords,
            func,
        } in spec.functions
        {
            let f = HostRef::new(Object::Function(FunctionObject {
                name: name.clone(),
                doc,
                keywords,
                func,
            }));
            attrs.push((name, f));
        }
        Ok(HostRef::new(Object::Module(ModuleObject {
            name: spec.name,
            attrs: Mutex::new(attrs),
        })))
    }
}

struct BytesPin {
    obj: HostRef,
}

impl Drop for BytesPin {
    fn drop(&mut self) {
        if let Some(Object::Bytes(b)) = self.obj.downcast_ref::<Object>() {
            b.pins.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaimed_byte_strings_are_not_tracked_forever() {
        let host = MemoryHost::new();
        let kept = host.from_bytes(b"kept").unwrap();
        for i in 0..10_000u32 {
            drop(host.from_bytes(&i.to_le_bytes()).unwrap());
        }
        let tracked = host.byte_strings.lock().len();
        assert!(tracked <= 64, "{tracked} entries still tracked");
        assert_eq!(host.compact(), 1, "only the live string moves");
        assert_eq!(host.bytes_value(&kept).as_deref(), Some(&b"kept"[..]));
    }

    #[test]
    fn test_truthiness_dispatches_to_class_hook() {
        let host = MemoryHost::new();
        let class = host.new_class("Falsy");
        let falsy = host.singleton(Singleton::False);
        let hook = host.new_function("__bool__", move |_, _| Ok(falsy.clone()));
        host.set_class_attr(&class, "__bool__", hook);
        let obj = host.new_instance(&class);
        assert!(!host.is_true(&obj).unwrap());
        let plain = host.new_instance(&host.new_class("Plain"));
        assert!(host.is_true(&plain).unwrap());
    }

    #[test]
    fn test_frozen_instance_rejects_setattr() {
        let host = MemoryHost::new();
        let obj = host.new_frozen_instance(&host.new_class("Point"));
        let name = host.from_str("x").unwrap();
        let value = host.from_i64(1).unwrap();
        let err = host.call(HostOp::SetAttr, &[obj, name, value]).unwrap_err();
        assert!(err.exc_type.ptr_eq(&host.attribute_error()));
    }

    #[test]
    fn test_compact_skips_pinned_buffers() {
        let host = MemoryHost::new();
        let pinned = host.from_bytes(b"abc").unwrap();
        let loose = host.from_bytes(b"xyz").unwrap();
        let pin = host.pin_bytes(&pinned).unwrap();
        let before = pin.as_ptr();
        assert_eq!(host.compact(), 1);
        assert_eq!(host.pin_bytes(&pinned).unwrap().as_ptr(), before);
        drop(pin);
        assert_eq!(host.pin_count(&pinned), 0);
        assert_eq!(host.bytes_value(&loose).unwrap(), b"xyz");
    }

    #[test]
    fn test_add_overflow_raises() {
        let host = MemoryHost::new();
        let a = host.int(i128::MAX);
        let b = host.int(1);
        let err = host.call(HostOp::Add, &[a, b]).unwrap_err();
        assert!(err.exc_type.ptr_eq(&host.singleton(Singleton::OverflowError)));
    }
}
