use std::{
    borrow::Cow,
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::RandomState;
use indexmap::IndexMap;

use crate::{
    ClassId, ClassTable, HostRef, Interrupts, ObjectId, Runtime, SymbolId, SymbolTable, Unit,
    UnitFlags, UnitId, Value,
    visitor::{Visitable, Visitor},
};

pub type OrderedMap<K, V> = IndexMap<K, V, RandomState>;

static NEXT_HEAP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u64);

#[derive(Debug, Clone, Default)]
pub struct HeapCreateInfo {
    /// Allocations between automatic collections.
    pub gc_threshold: Option<usize>,
    /// Guest call depth before `SystemStackError`.
    pub max_call_depth: Option<usize>,
    pub initial_capacity: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    pub gc_threshold: usize,
    pub max_call_depth: usize,
    pub initial_capacity: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            gc_threshold: 16 * 1024,
            max_call_depth: 200,
            initial_capacity: 256,
        }
    }
}

impl HeapSettings {
    pub fn from_info(info: &HeapCreateInfo) -> Self {
        let mut settings = Self::default();
        info.gc_threshold
            .inspect(|&val| settings.gc_threshold = val);
        info.max_call_depth
            .inspect(|&val| settings.max_call_depth = val);
        info.initial_capacity
            .inspect(|&val| settings.initial_capacity = val);
        settings
    }
}

/// Key under which a hash entry is stored. Strings hash by content, other
/// heap objects by identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(u64),
    Symbol(SymbolId),
    Bytes(Vec<u8>),
    Class(ClassId),
    Identity(ObjectId),
    Host(usize),
    RawPointer(usize),
}

#[derive(Debug, Clone, Default)]
pub struct RHash {
    entries: OrderedMap<HashKey, (Value, Value)>,
}

impl RHash {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.values().map(|(k, v)| (k, v))
    }

    pub fn get(&self, key: &HashKey) -> Option<&Value> {
        self.entries.get(key).map(|(_, v)| v)
    }

    fn insert(&mut self, hashed: HashKey, key: Value, value: Value) {
        match self.entries.get_mut(&hashed) {
            Some(entry) => entry.1 = value,
            None => {
                self.entries.insert(hashed, (key, value));
            }
        }
    }

    fn remove(&mut self, key: &HashKey) -> Option<Value> {
        self.entries.shift_remove(key).map(|(_, v)| v)
    }
}

#[derive(Debug, Clone)]
pub struct RRange {
    pub begin: Value,
    pub end: Value,
    pub exclusive: bool,
}

#[derive(Debug, Clone)]
pub struct RObject {
    pub class: ClassId,
    pub ivars: OrderedMap<SymbolId, Value>,
}

#[derive(Debug, Clone)]
pub struct RException {
    pub class: ClassId,
    pub message: Value,
    pub ivars: OrderedMap<SymbolId, Value>,
}

/// A closure: unit, captured variables and the enclosing closure.
#[derive(Debug, Clone)]
pub struct RProc {
    pub unit: UnitId,
    pub env: Vec<Value>,
    pub upper: Option<ObjectId>,
    pub target_class: Option<ClassId>,
}

#[derive(Debug, Clone)]
pub enum HeapObject {
    String(Vec<u8>),
    Array(Vec<Value>),
    Hash(RHash),
    Range(RRange),
    Object(RObject),
    Exception(RException),
    Proc(RProc),
}

#[derive(Debug)]
struct UnitSlot {
    unit: Arc<Unit>,
    refs: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub freed_objects: usize,
    pub freed_units: usize,
    pub live_objects: usize,
}

/// One interpreter heap. Owned by exactly one task at a time; values taken
/// from it must only be used with it.
pub struct Heap {
    id: HeapId,
    settings: HeapSettings,
    pub(crate) symbols: SymbolTable,
    pub(crate) classes: ClassTable,
    globals: OrderedMap<SymbolId, Value>,
    objects: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    units: Vec<Option<UnitSlot>>,
    free_units: Vec<u32>,
    pinned: Vec<Value>,
    allocated_since_gc: usize,
    pub(crate) active_frames: usize,
    pub(crate) runtime: Option<Runtime>,
    pub(crate) interrupts: Arc<Interrupts>,
    pub(crate) current_thread: Option<HostRef>,
}

impl Heap {
    /// Open a standalone heap with default settings and the bootstrap
    /// classes. Such a heap cannot start threads.
    pub fn open() -> Self {
        Self::with_info(&HeapCreateInfo::default())
    }

    pub fn with_info(info: &HeapCreateInfo) -> Self {
        Self::with_parts(info, None, Arc::new(Interrupts::detached()))
    }

    pub(crate) fn with_parts(
        info: &HeapCreateInfo,
        runtime: Option<Runtime>,
        interrupts: Arc<Interrupts>,
    ) -> Self {
        let settings = HeapSettings::from_info(info);
        let mut symbols = SymbolTable::new();
        let classes = ClassTable::bootstrap(&mut symbols);
        let id = HeapId(NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed));
        log::trace!("opened heap {id:?}");
        Self {
            id,
            objects: Vec::with_capacity(settings.initial_capacity),
            settings,
            symbols,
            classes,
            globals: OrderedMap::default(),
            free: Vec::new(),
            units: Vec::new(),
            free_units: Vec::new(),
            pinned: Vec::new(),
            allocated_since_gc: 0,
            active_frames: 0,
            runtime,
            interrupts,
            current_thread: None,
        }
    }

    /// Release the heap and everything it owns.
    pub fn close(self) {
        drop(self);
    }

    pub fn id(&self) -> HeapId {
        self.id
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn runtime(&self) -> Option<&Runtime> {
        self.runtime.as_ref()
    }

    pub fn interrupts(&self) -> &Arc<Interrupts> {
        &self.interrupts
    }

    /// The thread handle this heap runs for, if it is a worker heap.
    pub fn current_thread(&self) -> Option<&HostRef> {
        self.current_thread.as_ref()
    }

    // ── symbols ────────────────────────────────────────────────────

    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    pub fn resolve_symbol(&self, sym: SymbolId) -> Option<&str> {
        self.symbols.resolve(sym).map(|s| s.as_ref())
    }

    /// Owned name of a symbol; empty for an id this heap never handed out.
    pub fn symbol_name(&self, sym: SymbolId) -> Arc<str> {
        self.symbols
            .resolve(sym)
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    // ── globals ────────────────────────────────────────────────────

    pub fn set_global(&mut self, name: &str, value: Value) {
        let sym = self.intern(name);
        self.globals.insert(sym, value);
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.symbols
            .lookup(name)
            .and_then(|sym| self.globals.get(&sym))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub(crate) fn set_global_sym(&mut self, sym: SymbolId, value: Value) {
        self.globals.insert(sym, value);
    }

    pub(crate) fn get_global_sym(&self, sym: SymbolId) -> Value {
        self.globals.get(&sym).cloned().unwrap_or(Value::Nil)
    }

    /// Globals in definition order.
    pub fn globals(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.globals.iter().map(|(sym, value)| {
            let name = self.symbols.resolve(*sym).map(|s| s.as_ref()).unwrap_or("");
            (name, value)
        })
    }

    // ── arena ──────────────────────────────────────────────────────

    fn alloc(&mut self, object: HeapObject) -> ObjectId {
        self.allocated_since_gc += 1;
        match self.free.pop() {
            Some(slot) => {
                self.objects[slot as usize] = Some(object);
                ObjectId(slot)
            }
            None => {
                self.objects.push(Some(object));
                ObjectId((self.objects.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.objects.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.objects.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len() - self.free.len()
    }

    /// Keep `value` alive across collections until unpinned.
    pub fn pin(&mut self, value: Value) {
        if value.object_id().is_some() {
            self.pinned.push(value);
        }
    }

    pub fn unpin(&mut self, value: &Value) {
        if let Some(pos) = self.pinned.iter().position(|v| v == value) {
            self.pinned.swap_remove(pos);
        }
    }

    // ── strings ────────────────────────────────────────────────────

    pub fn new_string(&mut self, bytes: impl AsRef<[u8]>) -> Value {
        Value::String(self.alloc(HeapObject::String(bytes.as_ref().to_vec())))
    }

    pub fn string_bytes(&self, value: &Value) -> Option<&[u8]> {
        match value {
            Value::String(id) => match self.get(*id)? {
                HeapObject::String(bytes) => Some(bytes),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn string_lossy(&self, value: &Value) -> Option<Cow<'_, str>> {
        self.string_bytes(value).map(String::from_utf8_lossy)
    }

    pub(crate) fn string_append(&mut self, target: &Value, bytes: &[u8]) -> bool {
        match target {
            Value::String(id) => match self.get_mut(*id) {
                Some(HeapObject::String(buf)) => {
                    buf.extend_from_slice(bytes);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    // ── arrays ─────────────────────────────────────────────────────

    pub fn new_array(&mut self, items: Vec<Value>) -> Value {
        Value::Array(self.alloc(HeapObject::Array(items)))
    }

    pub fn array_items(&self, value: &Value) -> Option<&[Value]> {
        match value {
            Value::Array(id) => match self.get(*id)? {
                HeapObject::Array(items) => Some(items),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn array_items_mut(&mut self, value: &Value) -> Option<&mut Vec<Value>> {
        match value {
            Value::Array(id) => match self.get_mut(*id)? {
                HeapObject::Array(items) => Some(items),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn array_push(&mut self, array: &Value, item: Value) -> bool {
        match self.array_items_mut(array) {
            Some(items) => {
                items.push(item);
                true
            }
            None => false,
        }
    }

    // ── hashes ─────────────────────────────────────────────────────

    pub fn new_hash(&mut self) -> Value {
        Value::Hash(self.alloc(HeapObject::Hash(RHash::default())))
    }

    pub fn hash_key(&self, key: &Value) -> HashKey {
        match key {
            Value::Nil => HashKey::Nil,
            Value::Bool(b) => HashKey::Bool(*b),
            Value::Integer(i) => HashKey::Integer(*i),
            Value::Float(f) => HashKey::Float(f.to_bits()),
            Value::Symbol(s) => HashKey::Symbol(*s),
            Value::String(_) => {
                HashKey::Bytes(self.string_bytes(key).map(<[u8]>::to_vec).unwrap_or_default())
            }
            Value::Class(c) => HashKey::Class(*c),
            Value::Host(h) => HashKey::Host(h.addr()),
            Value::RawPointer(p) => HashKey::RawPointer(*p),
            Value::Array(id)
            | Value::Hash(id)
            | Value::Range(id)
            | Value::Object(id)
            | Value::Exception(id)
            | Value::Proc(id) => HashKey::Identity(*id),
        }
    }

    pub fn rhash(&self, value: &Value) -> Option<&RHash> {
        match value {
            Value::Hash(id) => match self.get(*id)? {
                HeapObject::Hash(hash) => Some(hash),
                _ => None,
            },
            _ => None,
        }
    }

    fn rhash_mut(&mut self, value: &Value) -> Option<&mut RHash> {
        match value {
            Value::Hash(id) => match self.get_mut(*id)? {
                HeapObject::Hash(hash) => Some(hash),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn hash_set(&mut self, hash: &Value, key: Value, value: Value) -> bool {
        let hashed = self.hash_key(&key);
        match self.rhash_mut(hash) {
            Some(h) => {
                h.insert(hashed, key, value);
                true
            }
            None => false,
        }
    }

    pub fn hash_get(&self, hash: &Value, key: &Value) -> Option<Value> {
        let hashed = self.hash_key(key);
        self.rhash(hash)?.get(&hashed).cloned()
    }

    pub fn hash_delete(&mut self, hash: &Value, key: &Value) -> Option<Value> {
        let hashed = self.hash_key(key);
        self.rhash_mut(hash)?.remove(&hashed)
    }

    /// Snapshot of the entries in insertion order.
    pub fn hash_entries(&self, hash: &Value) -> Option<Vec<(Value, Value)>> {
        Some(
            self.rhash(hash)?
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    // ── ranges ─────────────────────────────────────────────────────

    pub fn new_range(&mut self, begin: Value, end: Value, exclusive: bool) -> Value {
        Value::Range(self.alloc(HeapObject::Range(RRange {
            begin,
            end,
            exclusive,
        })))
    }

    pub fn range(&self, value: &Value) -> Option<&RRange> {
        match value {
            Value::Range(id) => match self.get(*id)? {
                HeapObject::Range(range) => Some(range),
                _ => None,
            },
            _ => None,
        }
    }

    // ── objects and exceptions ─────────────────────────────────────

    /// Allocate a bare instance of `class` without running any initializer.
    pub fn new_object(&mut self, class: ClassId) -> Value {
        Value::Object(self.alloc(HeapObject::Object(RObject {
            class,
            ivars: OrderedMap::default(),
        })))
    }

    pub fn new_exception(&mut self, class: ClassId, message: &str) -> Value {
        let message = self.new_string(message);
        self.new_exception_with(class, message)
    }

    pub fn new_exception_with(&mut self, class: ClassId, message: Value) -> Value {
        Value::Exception(self.alloc(HeapObject::Exception(RException {
            class,
            message,
            ivars: OrderedMap::default(),
        })))
    }

    pub fn exception(&self, value: &Value) -> Option<&RException> {
        match value {
            Value::Exception(id) => match self.get(*id)? {
                HeapObject::Exception(exc) => Some(exc),
                _ => None,
            },
            _ => None,
        }
    }

    /// Message of an exception as text; the class path when it has none.
    pub fn exception_message(&self, value: &Value) -> Option<String> {
        let exc = self.exception(value)?;
        Some(match self.string_lossy(&exc.message) {
            Some(text) => text.into_owned(),
            None if exc.message.is_nil() => self.class_path(exc.class),
            None => self.inspect(&exc.message),
        })
    }

    pub fn ivars(&self, value: &Value) -> Option<&OrderedMap<SymbolId, Value>> {
        match self.get(value.object_id()?)? {
            HeapObject::Object(object) => Some(&object.ivars),
            HeapObject::Exception(exc) => Some(&exc.ivars),
            _ => None,
        }
    }

    pub fn ivar_get(&self, value: &Value, name: SymbolId) -> Value {
        self.ivars(value)
            .and_then(|ivars| ivars.get(&name))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub fn ivar_set(&mut self, target: &Value, name: SymbolId, value: Value) -> bool {
        let Some(id) = target.object_id() else {
            return false;
        };
        match self.get_mut(id) {
            Some(HeapObject::Object(object)) => {
                object.ivars.insert(name, value);
                true
            }
            Some(HeapObject::Exception(exc)) => {
                exc.ivars.insert(name, value);
                true
            }
            _ => false,
        }
    }

    // ── procs ──────────────────────────────────────────────────────

    /// Create a closure over `unit`. The closure holds a reference to the
    /// unit until it is collected.
    pub fn new_proc(&mut self, unit: UnitId, env: Vec<Value>, upper: Option<ObjectId>) -> Value {
        let target_class = Some(self.classes.specials().object);
        self.new_proc_in(unit, env, upper, target_class)
    }

    pub(crate) fn new_proc_in(
        &mut self,
        unit: UnitId,
        env: Vec<Value>,
        upper: Option<ObjectId>,
        target_class: Option<ClassId>,
    ) -> Value {
        self.retain_unit(unit);
        Value::Proc(self.alloc(HeapObject::Proc(RProc {
            unit,
            env,
            upper,
            target_class,
        })))
    }

    pub fn proc(&self, value: &Value) -> Option<&RProc> {
        match value {
            Value::Proc(id) => self.proc_by_id(*id),
            _ => None,
        }
    }

    pub(crate) fn proc_by_id(&self, id: ObjectId) -> Option<&RProc> {
        match self.get(id)? {
            HeapObject::Proc(proc) => Some(proc),
            _ => None,
        }
    }

    pub(crate) fn proc_mut(&mut self, id: ObjectId) -> Option<&mut RProc> {
        match self.get_mut(id)? {
            HeapObject::Proc(proc) => Some(proc),
            _ => None,
        }
    }

    /// Overwrite a captured variable, growing the environment if needed.
    pub fn set_proc_env(&mut self, proc: &Value, idx: usize, value: Value) -> bool {
        let Value::Proc(id) = proc else {
            return false;
        };
        match self.proc_mut(*id) {
            Some(p) => {
                if p.env.len() <= idx {
                    p.env.resize(idx + 1, Value::Nil);
                }
                p.env[idx] = value;
                true
            }
            None => false,
        }
    }

    // ── unit pool ──────────────────────────────────────────────────

    /// Add a unit to the pool. It starts unreferenced and is released by the
    /// next collection unless a closure or a parent unit refers to it.
    pub fn add_unit(&mut self, unit: Unit) -> UnitId {
        for &child in &unit.children {
            self.retain_unit(child);
        }
        let slot = UnitSlot {
            unit: Arc::new(unit),
            refs: 0,
        };
        match self.free_units.pop() {
            Some(idx) => {
                self.units[idx as usize] = Some(slot);
                UnitId(idx)
            }
            None => {
                self.units.push(Some(slot));
                UnitId((self.units.len() - 1) as u32)
            }
        }
    }

    pub fn unit(&self, id: UnitId) -> Option<&Arc<Unit>> {
        self.units
            .get(id.index())
            .and_then(Option::as_ref)
            .map(|slot| &slot.unit)
    }

    pub fn unit_refs(&self, id: UnitId) -> usize {
        self.units
            .get(id.index())
            .and_then(Option::as_ref)
            .map_or(0, |slot| slot.refs)
    }

    pub fn live_units(&self) -> usize {
        self.units.len() - self.free_units.len()
    }

    pub(crate) fn set_unit_literal(&mut self, id: UnitId, idx: usize, value: Value) -> bool {
        let Some(slot) = self.units.get_mut(id.index()).and_then(Option::as_mut) else {
            return false;
        };
        match Arc::make_mut(&mut slot.unit).literals.get_mut(idx) {
            Some(literal) => {
                *literal = value;
                true
            }
            None => false,
        }
    }

    fn retain_unit(&mut self, id: UnitId) {
        if let Some(slot) = self.units.get_mut(id.index()).and_then(Option::as_mut) {
            slot.refs += 1;
        }
    }

    fn release_unit(&mut self, id: UnitId) {
        if let Some(slot) = self.units.get_mut(id.index()).and_then(Option::as_mut) {
            slot.refs = slot.refs.saturating_sub(1);
        }
    }

    // ── collection ─────────────────────────────────────────────────

    pub(crate) fn should_collect(&self) -> bool {
        self.active_frames == 0 && self.allocated_since_gc >= self.settings.gc_threshold
    }

    /// Mark and sweep. Roots are globals, constants, pinned values, literals
    /// of referenced units and `extra_roots`.
    pub fn collect(&mut self, extra_roots: &[Value]) -> GcStats {
        let mut marker = Marker {
            marks: vec![false; self.objects.len()],
            gray: Vec::new(),
        };
        self.globals.values().for_each(|v| marker.visit(v));
        self.pinned.iter().for_each(|v| marker.visit(v));
        extra_roots.iter().for_each(|v| marker.visit(v));
        for class in self.classes.iter() {
            class.visit_edges(&mut marker);
        }
        for slot in self.units.iter().flatten() {
            if slot.refs > 0 || slot.unit.flags.contains(UnitFlags::NO_FREE) {
                slot.unit.visit_edges(&mut marker);
            }
        }
        while let Some(id) = marker.gray.pop() {
            if let Some(object) = self.get(id) {
                object.visit_edges(&mut marker);
            }
        }
        let marks = marker.marks;

        let mut stats = GcStats::default();
        for idx in 0..self.objects.len() {
            if marks[idx] || self.objects[idx].is_none() {
                continue;
            }
            if let Some(HeapObject::Proc(proc)) = self.objects[idx].take() {
                self.release_unit(proc.unit);
            }
            self.free.push(idx as u32);
            stats.freed_objects += 1;
        }

        loop {
            let dead: Vec<usize> = self
                .units
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| {
                    let slot = slot.as_ref()?;
                    (slot.refs == 0 && !slot.unit.flags.contains(UnitFlags::NO_FREE)).then_some(i)
                })
                .collect();
            if dead.is_empty() {
                break;
            }
            for idx in dead {
                if let Some(slot) = self.units[idx].take() {
                    for &child in &slot.unit.children {
                        self.release_unit(child);
                    }
                    self.free_units.push(idx as u32);
                    stats.freed_units += 1;
                }
            }
        }

        self.allocated_since_gc = 0;
        stats.live_objects = self.live_objects();
        log::debug!(
            "heap {:?}: collected {} objects and {} units, {} objects live",
            self.id,
            stats.freed_objects,
            stats.freed_units,
            stats.live_objects
        );
        stats
    }

    // ── comparison and printing ────────────────────────────────────

    /// Guest `==`: numbers by value, strings by content, containers by their
    /// elements, everything else by identity.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        self.values_equal_inner(a, b, &mut HashSet::new())
    }

    fn values_equal_inner(
        &self,
        a: &Value,
        b: &Value,
        in_progress: &mut HashSet<(ObjectId, ObjectId)>,
    ) -> bool {
        match (a, b) {
            (Value::Integer(x), Value::Float(y)) | (Value::Float(y), Value::Integer(x)) => {
                (*x as f64) == *y
            }
            (Value::String(_), Value::String(_)) => self.string_bytes(a) == self.string_bytes(b),
            (Value::Array(x), Value::Array(y))
            | (Value::Hash(x), Value::Hash(y))
            | (Value::Range(x), Value::Range(y)) => {
                if x == y || !in_progress.insert((*x, *y)) {
                    return true;
                }
                let equal = self.containers_equal(a, b, in_progress);
                in_progress.remove(&(*x, *y));
                equal
            }
            _ => a == b,
        }
    }

    fn containers_equal(
        &self,
        a: &Value,
        b: &Value,
        in_progress: &mut HashSet<(ObjectId, ObjectId)>,
    ) -> bool {
        if let (Some(xs), Some(ys)) = (self.array_items(a), self.array_items(b)) {
            return xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|(x, y)| self.values_equal_inner(x, y, in_progress));
        }
        if let (Some(x), Some(y)) = (self.rhash(a), self.rhash(b)) {
            return x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    y.get(&self.hash_key(k))
                        .is_some_and(|w| self.values_equal_inner(v, w, in_progress))
                });
        }
        if let (Some(x), Some(y)) = (self.range(a), self.range(b)) {
            return x.exclusive == y.exclusive
                && self.values_equal_inner(&x.begin, &y.begin, in_progress)
                && self.values_equal_inner(&x.end, &y.end, in_progress);
        }
        false
    }

    /// Guest `inspect`.
    pub fn inspect(&self, value: &Value) -> String {
        let mut out = String::new();
        self.inspect_into(value, &mut out, &mut Vec::new());
        out
    }

    /// Guest `to_s`: strings print their content, everything else inspects.
    pub fn to_display(&self, value: &Value) -> String {
        match self.string_lossy(value) {
            Some(text) => text.into_owned(),
            None if value.is_nil() => String::new(),
            None => self.inspect(value),
        }
    }

    fn inspect_into(&self, value: &Value, out: &mut String, seen: &mut Vec<ObjectId>) {
        use std::fmt::Write as _;

        if let Some(id) = value.object_id() {
            if seen.contains(&id) {
                out.push_str(match value {
                    Value::Hash(_) => "{...}",
                    _ => "[...]",
                });
                return;
            }
        }
        match value {
            Value::Nil => out.push_str("nil"),
            Value::Bool(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Integer(i) => {
                let _ = write!(out, "{i}");
            }
            Value::Float(f) => {
                let _ = write!(out, "{f:?}");
            }
            Value::Symbol(s) => {
                let _ = write!(out, ":{}", self.symbol_name(*s));
            }
            Value::String(_) => {
                let text = self.string_lossy(value).unwrap_or_default();
                let _ = write!(out, "\"{}\"", text.escape_debug());
            }
            Value::Array(id) => {
                seen.push(*id);
                out.push('[');
                for (i, item) in self.array_items(value).unwrap_or_default().iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.inspect_into(item, out, seen);
                }
                out.push(']');
                seen.pop();
            }
            Value::Hash(id) => {
                seen.push(*id);
                out.push('{');
                if let Some(hash) = self.rhash(value) {
                    for (i, (k, v)) in hash.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        self.inspect_into(k, out, seen);
                        out.push_str(" => ");
                        self.inspect_into(v, out, seen);
                    }
                }
                out.push('}');
                seen.pop();
            }
            Value::Range(id) => {
                if let Some(range) = self.range(value) {
                    seen.push(*id);
                    self.inspect_into(&range.begin, out, seen);
                    out.push_str(if range.exclusive { "..." } else { ".." });
                    self.inspect_into(&range.end, out, seen);
                    seen.pop();
                }
            }
            Value::Object(id) => {
                let class = self.class_of(value);
                let _ = write!(out, "#<{}", self.class_path(class));
                seen.push(*id);
                if let Some(ivars) = self.ivars(value) {
                    for (i, (name, v)) in ivars.iter().enumerate() {
                        out.push_str(if i == 0 { " " } else { ", " });
                        let _ = write!(out, "{}=", self.symbol_name(*name));
                        self.inspect_into(v, out, seen);
                    }
                }
                seen.pop();
                out.push('>');
            }
            Value::Exception(_) => {
                let class = self.class_of(value);
                let message = self.exception_message(value).unwrap_or_default();
                let _ = write!(out, "#<{}: {}>", self.class_path(class), message);
            }
            Value::Class(c) => out.push_str(&self.class_path(*c)),
            Value::Proc(id) => {
                let _ = write!(out, "#<Proc:{:#x}>", id.index());
            }
            Value::Host(h) => {
                let _ = write!(out, "#<{}:{:#x}>", h.class_name(), h.addr());
            }
            Value::RawPointer(p) => {
                let _ = write!(out, "#<Pointer:{p:#x}>");
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        log::trace!(
            "closed heap {:?} ({} objects, {} units)",
            self.id,
            self.live_objects(),
            self.live_units()
        );
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.id)
            .field("objects", &self.live_objects())
            .field("units", &self.live_units())
            .field("symbols", &self.symbols.len())
            .finish()
    }
}

// Units are kept alive by reference counts, so the marker only follows
// object edges.
struct Marker {
    marks: Vec<bool>,
    gray: Vec<ObjectId>,
}

impl Marker {
    fn mark(&mut self, id: ObjectId) {
        if let Some(mark) = self.marks.get_mut(id.index()) {
            if !*mark {
                *mark = true;
                self.gray.push(id);
            }
        }
    }
}

impl Visitor for Marker {
    fn visit(&mut self, value: &Value) {
        if let Some(id) = value.object_id() {
            self.mark(id);
        }
    }

    fn visit_upper(&mut self, proc: ObjectId) {
        self.mark(proc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BytecodeBuilder;

    fn trivial_unit(heap: &mut Heap) -> UnitId {
        let mut b = BytecodeBuilder::new();
        b.load_nil();
        b.return_();
        heap.add_unit(Unit::new(b.into_bytes()))
    }

    #[test]
    fn settings_fold_overrides_into_defaults() {
        let settings = HeapSettings::from_info(&HeapCreateInfo {
            max_call_depth: Some(8),
            ..HeapCreateInfo::default()
        });
        assert_eq!(settings.max_call_depth, 8);
        assert_eq!(settings.gc_threshold, HeapSettings::default().gc_threshold);
    }

    #[test]
    fn heaps_get_distinct_ids() {
        let a = Heap::open();
        let b = Heap::open();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn globals_keep_definition_order() {
        let mut heap = Heap::open();
        heap.set_global("$b", Value::Integer(2));
        heap.set_global("$a", Value::Integer(1));
        heap.set_global("$b", Value::Integer(3));
        let names: Vec<_> = heap.globals().map(|(n, _)| n.to_owned()).collect();
        assert_eq!(names, vec!["$b", "$a"]);
        assert_eq!(heap.get_global("$b"), Value::Integer(3));
        assert_eq!(heap.get_global("$missing"), Value::Nil);
    }

    #[test]
    fn hash_keys_strings_by_content() {
        let mut heap = Heap::open();
        let hash = heap.new_hash();
        let k1 = heap.new_string("k");
        let k2 = heap.new_string("k");
        heap.hash_set(&hash, k1, Value::Integer(1));
        heap.hash_set(&hash, k2.clone(), Value::Integer(2));
        assert_eq!(heap.rhash(&hash).map(RHash::len), Some(1));
        assert_eq!(heap.hash_get(&hash, &k2), Some(Value::Integer(2)));
        assert_eq!(heap.hash_get(&hash, &Value::Integer(1)), None);
    }

    #[test]
    fn structural_equality_handles_cycles() {
        let mut heap = Heap::open();
        let a = heap.new_array(vec![Value::Integer(1)]);
        let b = heap.new_array(vec![Value::Integer(1)]);
        heap.array_push(&a, a.clone());
        heap.array_push(&b, b.clone());
        assert!(heap.values_equal(&a, &b));
        assert_eq!(heap.inspect(&a), "[1, [...]]");
    }

    #[test]
    fn collection_frees_unreachable_objects() {
        let mut heap = Heap::open();
        let kept = heap.new_string("kept");
        heap.set_global("$kept", kept.clone());
        let _dropped = heap.new_array(vec![Value::Integer(1)]);
        let before = heap.live_objects();
        let stats = heap.collect(&[]);
        assert_eq!(stats.freed_objects, 1);
        assert_eq!(heap.live_objects(), before - 1);
        assert_eq!(heap.string_lossy(&kept).as_deref(), Some("kept"));
    }

    #[test]
    fn units_are_released_with_their_last_closure() {
        let mut heap = Heap::open();
        let unit = trivial_unit(&mut heap);
        let proc = heap.new_proc(unit, Vec::new(), None);
        assert_eq!(heap.unit_refs(unit), 1);

        heap.collect(&[proc.clone()]);
        assert!(heap.unit(unit).is_some());

        heap.collect(&[]);
        assert_eq!(heap.unit_refs(unit), 0);
        assert!(heap.unit(unit).is_none());
    }

    #[test]
    fn no_free_units_survive_collection() {
        let mut heap = Heap::open();
        let mut b = BytecodeBuilder::new();
        b.return_();
        let unit = heap.add_unit(Unit::new(b.into_bytes()).with_flags(UnitFlags::NO_FREE));
        heap.collect(&[]);
        assert!(heap.unit(unit).is_some());
    }

    #[test]
    fn child_units_live_as_long_as_their_parent() {
        let mut heap = Heap::open();
        let child = trivial_unit(&mut heap);
        let mut b = BytecodeBuilder::new();
        b.make_proc(0, 0);
        b.return_();
        let parent = heap.add_unit(Unit::new(b.into_bytes()).with_children(vec![child]));
        let proc = heap.new_proc(parent, Vec::new(), None);
        heap.collect(&[proc]);
        assert_eq!(heap.unit_refs(child), 1);
        heap.collect(&[]);
        heap.collect(&[]);
        assert!(heap.unit(parent).is_none());
        assert!(heap.unit(child).is_none());
    }
}
