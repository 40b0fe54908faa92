use std::sync::Arc;

use crate::{ClassId, Heap, SymbolId, SymbolTable, Value, heap::OrderedMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Module,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: SymbolId,
    pub kind: ClassKind,
    pub superclass: Option<ClassId>,
    /// Lexical parent; `None` only for the roots.
    pub namespace: Option<ClassId>,
    pub consts: OrderedMap<SymbolId, Value>,
}

/// Classes every heap defines during bootstrap, in the same order.
#[derive(Debug, Clone, Copy)]
pub struct SpecialClasses {
    pub basic_object: ClassId,
    pub object: ClassId,
    pub module: ClassId,
    pub class: ClassId,
    pub kernel: ClassId,
    pub nil_class: ClassId,
    pub true_class: ClassId,
    pub false_class: ClassId,
    pub integer: ClassId,
    pub float: ClassId,
    pub symbol: ClassId,
    pub string: ClassId,
    pub array: ClassId,
    pub hash: ClassId,
    pub range: ClassId,
    pub proc_class: ClassId,
    pub exception: ClassId,
    pub standard_error: ClassId,
    pub runtime_error: ClassId,
    pub argument_error: ClassId,
    pub type_error: ClassId,
    pub name_error: ClassId,
    pub no_method_error: ClassId,
    pub zero_division_error: ClassId,
    pub range_error: ClassId,
    pub index_error: ClassId,
    pub stop_iteration: ClassId,
    pub system_stack_error: ClassId,
    pub thread_error: ClassId,
    pub closed_queue_error: ClassId,
    pub thread: ClassId,
    pub mutex: ClassId,
    pub queue: ClassId,
    pub sized_queue: ClassId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    Undefined,
    NotAClass,
}

#[derive(Debug)]
pub struct ClassTable {
    classes: Vec<ClassDef>,
    specials: SpecialClasses,
}

struct Bootstrap<'a> {
    classes: Vec<ClassDef>,
    symbols: &'a mut SymbolTable,
    object: ClassId,
}

impl Bootstrap<'_> {
    fn push(
        &mut self,
        name: &str,
        kind: ClassKind,
        superclass: Option<ClassId>,
        namespace: Option<ClassId>,
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        let name = self.symbols.intern(name);
        self.classes.push(ClassDef {
            name,
            kind,
            superclass,
            namespace,
            consts: OrderedMap::default(),
        });
        id
    }

    fn set_const(&mut self, outer: ClassId, name: &str, value: Value) {
        let name = self.symbols.intern(name);
        self.classes[outer.index()].consts.insert(name, value);
    }

    fn class(&mut self, name: &str, superclass: ClassId) -> ClassId {
        let object = self.object;
        let id = self.push(name, ClassKind::Class, Some(superclass), Some(object));
        self.set_const(object, name, Value::Class(id));
        id
    }

    fn module(&mut self, name: &str) -> ClassId {
        let object = self.object;
        let id = self.push(name, ClassKind::Module, None, Some(object));
        self.set_const(object, name, Value::Class(id));
        id
    }
}

impl ClassTable {
    pub(crate) fn bootstrap(symbols: &mut SymbolTable) -> Self {
        let mut b = Bootstrap {
            classes: Vec::new(),
            symbols,
            object: ClassId(1),
        };
        let basic_object = b.push("BasicObject", ClassKind::Class, None, None);
        let object = b.push("Object", ClassKind::Class, Some(basic_object), None);
        b.set_const(object, "BasicObject", Value::Class(basic_object));
        b.set_const(object, "Object", Value::Class(object));

        let module = b.class("Module", object);
        let class = b.class("Class", module);
        let kernel = b.module("Kernel");
        let nil_class = b.class("NilClass", object);
        let true_class = b.class("TrueClass", object);
        let false_class = b.class("FalseClass", object);
        let numeric = b.class("Numeric", object);
        let integer = b.class("Integer", numeric);
        let float = b.class("Float", numeric);
        let symbol = b.class("Symbol", object);
        let string = b.class("String", object);
        let array = b.class("Array", object);
        let hash = b.class("Hash", object);
        let range = b.class("Range", object);
        let proc_class = b.class("Proc", object);

        let exception = b.class("Exception", object);
        let script_error = b.class("ScriptError", exception);
        b.class("NotImplementedError", script_error);
        let standard_error = b.class("StandardError", exception);
        let runtime_error = b.class("RuntimeError", standard_error);
        let argument_error = b.class("ArgumentError", standard_error);
        let type_error = b.class("TypeError", standard_error);
        let name_error = b.class("NameError", standard_error);
        let no_method_error = b.class("NoMethodError", name_error);
        let zero_division_error = b.class("ZeroDivisionError", standard_error);
        let range_error = b.class("RangeError", standard_error);
        let index_error = b.class("IndexError", standard_error);
        b.class("KeyError", index_error);
        let stop_iteration = b.class("StopIteration", index_error);
        let system_stack_error = b.class("SystemStackError", exception);
        let thread_error = b.class("ThreadError", standard_error);
        let closed_queue_error = b.class("ClosedQueueError", stop_iteration);

        let thread = b.class("Thread", object);
        let mutex = b.class("Mutex", object);
        let queue = b.class("Queue", object);
        let sized_queue = b.class("SizedQueue", queue);
        b.set_const(thread, "Mutex", Value::Class(mutex));
        b.set_const(thread, "Queue", Value::Class(queue));
        b.set_const(thread, "SizedQueue", Value::Class(sized_queue));
        b.set_const(thread, "COPY_VALUES", Value::Bool(true));

        debug_assert_eq!(object, b.object);
        Self {
            classes: b.classes,
            specials: SpecialClasses {
                basic_object,
                object,
                module,
                class,
                kernel,
                nil_class,
                true_class,
                false_class,
                integer,
                float,
                symbol,
                string,
                array,
                hash,
                range,
                proc_class,
                exception,
                standard_error,
                runtime_error,
                argument_error,
                type_error,
                name_error,
                no_method_error,
                zero_division_error,
                range_error,
                index_error,
                stop_iteration,
                system_stack_error,
                thread_error,
                closed_queue_error,
                thread,
                mutex,
                queue,
                sized_queue,
            },
        }
    }

    pub fn specials(&self) -> &SpecialClasses {
        &self.specials
    }

    pub fn get(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Heap {
    pub fn specials(&self) -> &SpecialClasses {
        self.classes.specials()
    }

    pub fn class_def(&self, id: ClassId) -> Option<&ClassDef> {
        self.classes.get(id)
    }

    pub fn define_class(&mut self, name: &str, superclass: Option<ClassId>) -> ClassId {
        let object = self.specials().object;
        self.define_under(object, name, ClassKind::Class, superclass)
    }

    pub fn define_class_under(
        &mut self,
        outer: ClassId,
        name: &str,
        superclass: Option<ClassId>,
    ) -> ClassId {
        self.define_under(outer, name, ClassKind::Class, superclass)
    }

    pub fn define_module(&mut self, name: &str) -> ClassId {
        let object = self.specials().object;
        self.define_under(object, name, ClassKind::Module, None)
    }

    pub fn define_module_under(&mut self, outer: ClassId, name: &str) -> ClassId {
        self.define_under(outer, name, ClassKind::Module, None)
    }

    /// Defining an existing name reopens it.
    fn define_under(
        &mut self,
        outer: ClassId,
        name: &str,
        kind: ClassKind,
        superclass: Option<ClassId>,
    ) -> ClassId {
        let sym = self.intern(name);
        if let Some(Value::Class(existing)) = self.get_const(outer, sym) {
            return *existing;
        }
        let superclass = match kind {
            ClassKind::Class => Some(superclass.unwrap_or(self.specials().object)),
            ClassKind::Module => None,
        };
        let id = ClassId(self.classes.len() as u32);
        self.classes.classes.push(ClassDef {
            name: sym,
            kind,
            superclass,
            namespace: Some(outer),
            consts: OrderedMap::default(),
        });
        self.classes.classes[outer.index()]
            .consts
            .insert(sym, Value::Class(id));
        log::trace!("heap {:?}: defined {}", self.id(), self.class_path(id));
        id
    }

    pub fn set_const(&mut self, outer: ClassId, name: &str, value: Value) {
        let sym = self.intern(name);
        if let Some(def) = self.classes.classes.get_mut(outer.index()) {
            def.consts.insert(sym, value);
        }
    }

    pub fn get_const(&self, outer: ClassId, name: SymbolId) -> Option<&Value> {
        self.classes.get(outer)?.consts.get(&name)
    }

    pub fn class_name(&self, id: ClassId) -> Arc<str> {
        match self.classes.get(id) {
            Some(def) => self.symbol_name(def.name),
            None => Arc::from(""),
        }
    }

    /// `A::B` path of a class, starting below `Object`.
    pub fn class_path(&self, id: ClassId) -> String {
        let object = self.specials().object;
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(class) = current {
            let Some(def) = self.classes.get(class) else {
                break;
            };
            segments.push(self.symbol_name(def.name));
            current = def.namespace.filter(|&ns| ns != object);
        }
        segments.reverse();
        segments.join("::")
    }

    /// Resolve a `A::B` path starting at `Object`.
    pub fn resolve_path(&self, path: &str) -> Option<ClassId> {
        self.lookup_path(path).ok()
    }

    pub fn lookup_path(&self, path: &str) -> Result<ClassId, PathError> {
        let path = path.strip_prefix("::").unwrap_or(path);
        if path.is_empty() {
            return Err(PathError::Undefined);
        }
        let mut current = self.specials().object;
        for segment in path.split("::") {
            let sym = self.symbols.lookup(segment).ok_or(PathError::Undefined)?;
            current = match self.get_const(current, sym) {
                Some(Value::Class(class)) => *class,
                Some(_) => return Err(PathError::NotAClass),
                None => return Err(PathError::Undefined),
            };
        }
        Ok(current)
    }

    pub fn superclass(&self, id: ClassId) -> Option<ClassId> {
        self.classes.get(id)?.superclass
    }

    pub fn is_kind_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.superclass(c);
        }
        false
    }

    pub fn class_of(&self, value: &Value) -> ClassId {
        let s = self.specials();
        match value {
            Value::Nil => s.nil_class,
            Value::Bool(true) => s.true_class,
            Value::Bool(false) => s.false_class,
            Value::Integer(_) => s.integer,
            Value::Float(_) => s.float,
            Value::Symbol(_) => s.symbol,
            Value::String(_) => s.string,
            Value::Array(_) => s.array,
            Value::Hash(_) => s.hash,
            Value::Range(_) => s.range,
            Value::Proc(_) => s.proc_class,
            Value::Object(_) | Value::Exception(_) => match value.object_id().and_then(|id| self.get(id)) {
                Some(crate::HeapObject::Object(object)) => object.class,
                Some(crate::HeapObject::Exception(exc)) => exc.class,
                _ => s.object,
            },
            Value::Class(c) => match self.classes.get(*c).map(|def| def.kind) {
                Some(ClassKind::Module) => s.module,
                _ => s.class,
            },
            Value::Host(h) => self.resolve_path(h.class_name()).unwrap_or(s.object),
            Value::RawPointer(_) => s.object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_is_identical_across_heaps() {
        let a = Heap::open();
        let b = Heap::open();
        assert_eq!(a.classes.len(), b.classes.len());
        assert_eq!(a.specials().thread_error, b.specials().thread_error);
        assert_eq!(a.resolve_path("ClosedQueueError"), Some(a.specials().closed_queue_error));
    }

    #[test]
    fn nested_paths_round_trip() {
        let mut heap = Heap::open();
        let outer = heap.define_module("Outer");
        let inner = heap.define_class_under(outer, "Inner", None);
        assert_eq!(heap.class_path(inner), "Outer::Inner");
        assert_eq!(heap.resolve_path("Outer::Inner"), Some(inner));
        assert_eq!(heap.resolve_path("::Outer::Inner"), Some(inner));
        assert_eq!(heap.resolve_path("Outer::Missing"), None);
        assert_eq!(heap.class_path(heap.specials().object), "Object");
    }

    #[test]
    fn reopening_returns_the_existing_class() {
        let mut heap = Heap::open();
        let first = heap.define_class("Point", None);
        let second = heap.define_class("Point", None);
        assert_eq!(first, second);
    }

    #[test]
    fn non_class_constant_is_not_a_class() {
        let mut heap = Heap::open();
        let object = heap.specials().object;
        heap.set_const(object, "LIMIT", Value::Integer(3));
        assert_eq!(heap.lookup_path("LIMIT"), Err(PathError::NotAClass));
        assert_eq!(heap.lookup_path("Thread::COPY_VALUES"), Err(PathError::NotAClass));
        assert_eq!(heap.lookup_path("Nope"), Err(PathError::Undefined));
    }

    #[test]
    fn thread_aliases_resolve_to_the_toplevel_classes() {
        let heap = Heap::open();
        assert_eq!(heap.resolve_path("Thread::Mutex"), Some(heap.specials().mutex));
        assert_eq!(heap.class_path(heap.specials().sized_queue), "SizedQueue");
        let s = heap.specials();
        assert!(heap.is_kind_of(s.closed_queue_error, s.stop_iteration));
        assert!(heap.is_kind_of(s.thread_error, s.standard_error));
    }
}
