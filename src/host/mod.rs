//! The managed host runtime as seen from the bridge.
//!
//! The bridge never owns objects. It holds [`HostRef`] retention tokens and
//! reaches host behavior only through the [`HostRuntime`] trait, so the same
//! shims work against any runtime that implements it.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

pub mod memory;

pub use memory::MemoryHost;

/// Result of a host capability: a value, or the exception the host raised.
pub type HostResult<T> = std::result::Result<T, HostException>;

/// A retained reference to an object owned by the host runtime.
///
/// Cloning retains the object again; dropping releases that retention. The
/// host may reclaim the object once no clone is left anywhere.
#[derive(Clone)]
pub struct HostRef(Arc<dyn Any + Send + Sync>);

impl HostRef {
    /// Wrap a host-side object.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the object as a concrete host type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Object identity.
    pub fn ptr_eq(&self, other: &HostRef) -> bool {
        self.addr() == other.addr()
    }

    /// Address of the referenced object, stable while any retention exists.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// A non-retaining reference, used to observe reclamation.
    pub fn downgrade(&self) -> WeakHostRef {
        WeakHostRef(Arc::downgrade(&self.0))
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostRef({:#x})", self.addr())
    }
}

/// A reference that does not keep the host object alive.
#[derive(Clone)]
pub struct WeakHostRef(Weak<dyn Any + Send + Sync>);

impl WeakHostRef {
    /// Whether some retention of the object still exists.
    pub fn is_retained(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// Retain the object again if it is still alive.
    pub fn upgrade(&self) -> Option<HostRef> {
        self.0.upgrade().map(HostRef)
    }
}

impl fmt::Debug for WeakHostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakHostRef(retained={})", self.is_retained())
    }
}

/// An exception raised by the host runtime.
#[derive(Clone, Debug)]
pub struct HostException {
    /// The exception's type object.
    pub exc_type: HostRef,
    /// The exception instance.
    pub value: HostRef,
}

impl HostException {
    /// Create an exception from its type and instance.
    pub fn new(exc_type: HostRef, value: HostRef) -> Self {
        Self { exc_type, value }
    }
}

/// Objects every context exposes as interned handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Singleton {
    /// The none value.
    None,
    /// Boolean true.
    True,
    /// Boolean false.
    False,
    /// Base type for bad values.
    ValueError,
    /// Base type for type mismatches.
    TypeError,
    /// Raised on allocation failure.
    MemoryError,
    /// Raised for internal bridge errors.
    SystemError,
    /// Raised when a number does not fit a native type.
    OverflowError,
}

impl Singleton {
    /// All singletons, in the order they are interned.
    pub const ALL: [Singleton; 8] = [
        Singleton::None,
        Singleton::True,
        Singleton::False,
        Singleton::ValueError,
        Singleton::TypeError,
        Singleton::MemoryError,
        Singleton::SystemError,
        Singleton::OverflowError,
    ];
}

/// Object protocol operations the bridge invokes by symbolic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    /// `a + b`.
    Add,
    /// Attribute read `(obj, name)`.
    GetAttr,
    /// Attribute write `(obj, name, value)`.
    SetAttr,
    /// Subscript read `(obj, key)`.
    GetItem,
    /// Subscript write `(obj, key, value)`.
    SetItem,
    /// Length of a sized object `(obj)`.
    Len,
    /// Append to a list `(list, item)`.
    ListAppend,
    /// Dictionary store `(dict, key, value)`.
    DictSetItem,
    /// Dictionary load `(dict, key)`.
    DictGetItem,
    /// Encode text as UTF-8 bytes `(str)`.
    EncodeUtf8,
}

impl HostOp {
    /// The symbolic name of the operation.
    pub fn name(self) -> &'static str {
        match self {
            HostOp::Add => "Number_Add",
            HostOp::GetAttr => "GetAttr",
            HostOp::SetAttr => "SetAttr",
            HostOp::GetItem => "GetItem",
            HostOp::SetItem => "SetItem",
            HostOp::Len => "Length",
            HostOp::ListAppend => "List_Append",
            HostOp::DictSetItem => "Dict_SetItem",
            HostOp::DictGetItem => "Dict_GetItem",
            HostOp::EncodeUtf8 => "Unicode_AsUTF8String",
        }
    }

    /// Number of positional operands the operation takes.
    pub fn arity(self) -> usize {
        match self {
            HostOp::Len | HostOp::EncodeUtf8 => 1,
            HostOp::SetAttr | HostOp::SetItem | HostOp::DictSetItem => 3,
            _ => 2,
        }
    }
}

/// Builtin types the `*_Check` predicates test for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Immutable byte strings.
    Bytes,
    /// Text strings.
    Unicode,
    /// Lists.
    List,
    /// Dictionaries.
    Dict,
    /// Integers.
    Long,
}

/// A raw view of a host byte buffer pinned against relocation.
///
/// The pointer stays valid, unmoved and NUL-terminated at `ptr[len]` until
/// the buffer is dropped.
pub struct PinnedBuffer {
    ptr: *const u8,
    len: usize,
    _guard: Box<dyn Any + Send + Sync>,
}

// The pointer is only read through the pin, which the host keeps alive.
unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    /// Create a pin.
    ///
    /// # Safety
    ///
    /// `ptr` must address `len + 1` readable bytes ending in NUL, and must
    /// stay valid and unmoved for as long as `guard` is alive.
    pub unsafe fn new(ptr: *const u8, len: usize, guard: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            ptr,
            len,
            _guard: guard,
        }
    }

    /// Start of the pinned bytes.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Number of bytes, excluding the terminating NUL.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// A host-callable function: `(positional, keywords) -> result`.
pub type HostFunction =
    Arc<dyn Fn(&[HostRef], Option<&HostRef>) -> HostResult<HostRef> + Send + Sync>;

/// One entry point of a module being registered.
#[derive(Clone)]
pub struct FunctionSpec {
    /// Attribute name in the module.
    pub name: String,
    /// Docstring, if any.
    pub doc: Option<String>,
    /// Whether the function accepts keyword arguments.
    pub keywords: bool,
    /// Implementation.
    pub func: HostFunction,
}

impl fmt::Debug for FunctionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionSpec")
            .field("name", &self.name)
            .field("keywords", &self.keywords)
            .finish()
    }
}

/// Everything the host needs to create a module object.
#[derive(Clone, Debug)]
pub struct ModuleSpec {
    /// Module name.
    pub name: String,
    /// Module docstring.
    pub doc: Option<String>,
    /// Entry points, in definition order.
    pub functions: Vec<FunctionSpec>,
}

/// Capabilities the bridge needs from the host runtime.
///
/// Every method runs synchronously on the calling thread. Failing methods
/// return the exception exactly as the host raised it.
pub trait HostRuntime: Send + Sync {
    /// The host object behind an interned singleton.
    fn singleton(&self, which: Singleton) -> HostRef;

    /// Invoke an object protocol operation by symbolic name.
    fn call(&self, op: HostOp, args: &[HostRef]) -> HostResult<HostRef>;

    /// Call a host callable.
    fn call_object(
        &self,
        callable: &HostRef,
        args: &[HostRef],
        kwargs: Option<&HostRef>,
    ) -> HostResult<HostRef>;

    /// Host truthiness, which may dispatch to user code.
    fn is_true(&self, obj: &HostRef) -> HostResult<bool>;

    /// Whether `obj` is an instance of a builtin type.
    fn is_instance(&self, obj: &HostRef, kind: TypeKind) -> bool;

    /// Integer from a signed native value.
    fn from_i64(&self, value: i64) -> HostResult<HostRef>;

    /// Integer from an unsigned native value.
    fn from_u64(&self, value: u64) -> HostResult<HostRef>;

    /// Float from a native double.
    fn from_f64(&self, value: f64) -> HostResult<HostRef>;

    /// Text from UTF-8.
    fn from_str(&self, value: &str) -> HostResult<HostRef>;

    /// Byte string from raw bytes.
    fn from_bytes(&self, value: &[u8]) -> HostResult<HostRef>;

    /// Integer value as a signed native value.
    fn as_i64(&self, obj: &HostRef) -> HostResult<i64>;

    /// Real number value as a native double.
    fn as_f64(&self, obj: &HostRef) -> HostResult<f64>;

    /// New list of `len` none values.
    fn new_list(&self, len: usize) -> HostResult<HostRef>;

    /// New empty dictionary.
    fn new_dict(&self) -> HostResult<HostRef>;

    /// Build an exception of `exc_type` carrying `message`.
    fn new_exception(&self, exc_type: &HostRef, message: &str) -> HostException;

    /// Pin the contents of a byte string and expose them raw.
    fn pin_bytes(&self, obj: &HostRef) -> HostResult<PinnedBuffer>;

    /// Register a module with the host's module system.
    fn create_module(&self, spec: ModuleSpec) -> HostResult<HostRef>;

    /// Raise a new exception of a singleton type.
    fn raise(&self, which: Singleton, message: &str) -> HostException {
        self.new_exception(&self.singleton(which), message)
    }
}
