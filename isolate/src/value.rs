use std::{any::Any, fmt, sync::Arc};

use crate::{GuestException, Heap, SymbolId};

/// Index of an object in a heap's arena. Only meaningful on the heap that
/// allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u32);

impl ObjectId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into a heap's class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub(crate) u32);

impl ClassId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Bool,
    Integer,
    Float,
    Symbol,
    String,
    Array,
    Hash,
    Range,
    Object,
    Exception,
    Class,
    Proc,
    Host,
    RawPointer,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nil => "nil",
            Self::Bool => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Symbol => "symbol",
            Self::String => "string",
            Self::Array => "array",
            Self::Hash => "hash",
            Self::Range => "range",
            Self::Object => "object",
            Self::Exception => "exception",
            Self::Class => "class",
            Self::Proc => "proc",
            Self::Host => "host handle",
            Self::RawPointer => "raw pointer",
        };
        f.write_str(name)
    }
}

/// A guest value. Immediates are stored inline, everything else refers into
/// the arena or class table of the heap that produced it.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Symbol(SymbolId),
    String(ObjectId),
    Array(ObjectId),
    Hash(ObjectId),
    Range(ObjectId),
    Object(ObjectId),
    Exception(ObjectId),
    Class(ClassId),
    Proc(ObjectId),
    /// Host object shared by reference between heaps.
    Host(HostRef),
    /// Raw host address bound to the heap that created it.
    RawPointer(usize),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Nil => ValueKind::Nil,
            Self::Bool(_) => ValueKind::Bool,
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::Symbol(_) => ValueKind::Symbol,
            Self::String(_) => ValueKind::String,
            Self::Array(_) => ValueKind::Array,
            Self::Hash(_) => ValueKind::Hash,
            Self::Range(_) => ValueKind::Range,
            Self::Object(_) => ValueKind::Object,
            Self::Exception(_) => ValueKind::Exception,
            Self::Class(_) => ValueKind::Class,
            Self::Proc(_) => ValueKind::Proc,
            Self::Host(_) => ValueKind::Host,
            Self::RawPointer(_) => ValueKind::RawPointer,
        }
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Arena slot of heap-resident values.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Self::String(id)
            | Self::Array(id)
            | Self::Hash(id)
            | Self::Range(id)
            | Self::Object(id)
            | Self::Exception(id)
            | Self::Proc(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<SymbolId> {
        match self {
            Self::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<ClassId> {
        match self {
            Self::Class(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<&HostRef> {
        match self {
            Self::Host(h) => Some(h),
            _ => None,
        }
    }
}

/// Identity comparison. Structural equality needs the owning heap, see
/// [`Heap::values_equal`].
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::Class(a), Self::Class(b)) => a == b,
            (Self::Host(a), Self::Host(b)) => a.ptr_eq(b),
            (Self::RawPointer(a), Self::RawPointer(b)) => a == b,
            (a, b) => match (a.object_id(), b.object_id()) {
                (Some(x), Some(y)) => x == y && a.kind() == b.kind(),
                _ => false,
            },
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Host-side object that guest values can hold a handle to.
pub trait HostObject: Any + Send + Sync + fmt::Debug {
    /// Name of the guest class the handle answers to.
    fn class_name(&self) -> &'static str;

    /// Whether the handle may be shared with another heap.
    fn shareable(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
pub struct HostRef(Arc<dyn HostObject>);

impl HostRef {
    pub fn new<T: HostObject>(object: T) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn HostObject>) -> Self {
        Self(object)
    }

    pub fn downcast_ref<T: HostObject>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn is<T: HostObject>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }

    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn class_name(&self) -> &'static str {
        self.0.class_name()
    }

    pub fn shareable(&self) -> bool {
        self.0.shareable()
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostRef({:?} @ {:#x})", self.0, self.addr())
    }
}

pub type NativeBody = dyn Fn(&mut Heap, &[Value]) -> Result<Value, GuestException> + Send + Sync;

/// A procedure implemented by the host. Runs on whatever heap calls it.
#[derive(Clone)]
pub struct NativeFn {
    name: String,
    body: Arc<NativeBody>,
}

impl NativeFn {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Heap, &[Value]) -> Result<Value, GuestException> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, heap: &mut Heap, args: &[Value]) -> Result<Value, GuestException> {
        (self.body)(heap, args)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFn").field("name", &self.name).finish()
    }
}

impl HostObject for NativeFn {
    fn class_name(&self) -> &'static str {
        "Proc"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Token;

    impl HostObject for Token {
        fn class_name(&self) -> &'static str {
            "Object"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Integer(0).is_truthy());
    }

    #[test]
    fn identity_equality_distinguishes_kinds() {
        let id = ObjectId(3);
        assert_eq!(Value::Array(id), Value::Array(id));
        assert_ne!(Value::Array(id), Value::Hash(id));
        assert_ne!(Value::Integer(1), Value::Float(1.0));
    }

    #[test]
    fn host_refs_compare_by_pointer() {
        let a = HostRef::new(Token);
        let b = a.clone();
        let c = HostRef::new(Token);
        assert_eq!(Value::Host(a.clone()), Value::Host(b));
        assert_ne!(Value::Host(a.clone()), Value::Host(c));
        assert!(a.is::<Token>());
        assert!(!a.is::<NativeFn>());
    }
}
