use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use ahash::RandomState;
use thiserror::Error;

use crate::{
    ClassId, FormatError, Heap, HeapObject, ObjectId, PathError, SymbolId, UnitFlags, UnitId,
    Value, ValueKind, bytecode::is_live_literal,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MigrationError {
    #[error("cannot migrate a {0}")]
    Unmigratable(ValueKind),
    #[error("undefined class/module {0}")]
    UnknownClassPath(String),
    #[error("{0} does not refer to class/module")]
    NotAClass(String),
    #[error("value refers to a freed object")]
    DanglingReference,
    #[error("procedure refers to a unit that is not in the pool")]
    MissingUnit,
    #[error("bytecode transfer failed: {0}")]
    Format(#[from] FormatError),
}

/// Names of the globals a snapshot carried over and the ones it left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalSnapshot {
    pub copied: Vec<String>,
    pub skipped: Vec<String>,
}

/// Copies value graphs from `src` into `dst`.
///
/// Everything migrated through one migrator shares a map from source object
/// to destination value, so cycles re-link to the copy under construction
/// and two references to one source object end up as two references to one
/// destination object.
pub struct Migrator<'s, 'd> {
    src: &'s Heap,
    dst: &'d mut Heap,
    objects: HashMap<ObjectId, Value, RandomState>,
    units: HashMap<UnitId, UnitId, RandomState>,
    classes: HashMap<ClassId, ClassId, RandomState>,
}

impl<'s, 'd> Migrator<'s, 'd> {
    pub fn new(src: &'s Heap, dst: &'d mut Heap) -> Self {
        Self {
            src,
            dst,
            objects: HashMap::default(),
            units: HashMap::default(),
            classes: HashMap::default(),
        }
    }

    pub fn migrate(&mut self, value: &Value) -> Result<Value, MigrationError> {
        match value {
            Value::Nil | Value::Bool(_) | Value::Integer(_) | Value::Float(_) => Ok(value.clone()),
            Value::Symbol(sym) => Ok(Value::Symbol(self.migrate_symbol(*sym))),
            Value::Class(class) => Ok(Value::Class(self.resolve_class(*class)?)),
            Value::Host(host) if host.shareable() => Ok(value.clone()),
            Value::Host(_) | Value::RawPointer(_) => Err(MigrationError::Unmigratable(value.kind())),
            Value::String(id)
            | Value::Array(id)
            | Value::Hash(id)
            | Value::Range(id)
            | Value::Object(id)
            | Value::Exception(id)
            | Value::Proc(id) => match self.objects.get(id) {
                Some(done) => Ok(done.clone()),
                None => self.migrate_object(*id),
            },
        }
    }

    pub fn migrate_symbol(&mut self, sym: SymbolId) -> SymbolId {
        intern_across(self.src, self.dst, sym)
    }

    /// Find the class with the same path in the destination.
    pub fn resolve_class(&mut self, class: ClassId) -> Result<ClassId, MigrationError> {
        if let Some(&done) = self.classes.get(&class) {
            return Ok(done);
        }
        let path = self.src.class_path(class);
        let resolved = match self.dst.lookup_path(&path) {
            Ok(resolved) => resolved,
            Err(PathError::Undefined) => return Err(MigrationError::UnknownClassPath(path)),
            Err(PathError::NotAClass) => return Err(MigrationError::NotAClass(path)),
        };
        self.classes.insert(class, resolved);
        Ok(resolved)
    }

    fn record(&mut self, id: ObjectId, value: &Value) {
        self.objects.insert(id, value.clone());
    }

    fn migrate_object(&mut self, id: ObjectId) -> Result<Value, MigrationError> {
        let src = self.src;
        let object = src.get(id).ok_or(MigrationError::DanglingReference)?;
        match object {
            HeapObject::String(bytes) => {
                let copy = self.dst.new_string(bytes);
                self.record(id, &copy);
                Ok(copy)
            }
            HeapObject::Array(items) => {
                let copy = self.dst.new_array(Vec::with_capacity(items.len()));
                self.record(id, &copy);
                for item in items {
                    let item = self.migrate(item)?;
                    self.dst.array_push(&copy, item);
                }
                Ok(copy)
            }
            HeapObject::Hash(hash) => {
                let copy = self.dst.new_hash();
                self.record(id, &copy);
                for (key, value) in hash.iter() {
                    let key = self.migrate(key)?;
                    let value = self.migrate(value)?;
                    self.dst.hash_set(&copy, key, value);
                }
                Ok(copy)
            }
            HeapObject::Range(range) => {
                let copy = self.dst.new_range(Value::Nil, Value::Nil, range.exclusive);
                self.record(id, &copy);
                let begin = self.migrate(&range.begin)?;
                let end = self.migrate(&range.end)?;
                if let Some(HeapObject::Range(r)) = copy.object_id().and_then(|c| self.dst.get_mut(c)) {
                    r.begin = begin;
                    r.end = end;
                }
                Ok(copy)
            }
            HeapObject::Object(object) => {
                let class = self.resolve_class(object.class)?;
                let copy = self.dst.new_object(class);
                self.record(id, &copy);
                self.migrate_ivars(&object.ivars, &copy)?;
                Ok(copy)
            }
            HeapObject::Exception(exc) => {
                let class = self.resolve_class(exc.class)?;
                let copy = self.dst.new_exception_with(class, Value::Nil);
                self.record(id, &copy);
                let message = self.migrate(&exc.message)?;
                if let Some(HeapObject::Exception(e)) =
                    copy.object_id().and_then(|c| self.dst.get_mut(c))
                {
                    e.message = message;
                }
                self.migrate_ivars(&exc.ivars, &copy)?;
                Ok(copy)
            }
            HeapObject::Proc(_) => self.migrate_proc(id),
        }
    }

    fn migrate_ivars(
        &mut self,
        ivars: &crate::heap::OrderedMap<SymbolId, Value>,
        target: &Value,
    ) -> Result<(), MigrationError> {
        for (name, value) in ivars {
            let name = self.migrate_symbol(*name);
            let value = self.migrate(value)?;
            self.dst.ivar_set(target, name, value);
        }
        Ok(())
    }

    fn migrate_proc(&mut self, id: ObjectId) -> Result<Value, MigrationError> {
        let src = self.src;
        let proc = src.proc_by_id(id).ok_or(MigrationError::DanglingReference)?;
        let target_class = proc
            .target_class
            .map(|class| self.resolve_class(class))
            .transpose()?;
        let (unit, fresh) = self.copy_unit(proc.unit)?;

        // Recorded before the unit's literals and the environment so a
        // closure that reaches itself through either re-links to this copy.
        let copy = self.dst.new_proc_in(unit, Vec::new(), None, target_class);
        self.record(id, &copy);
        if fresh {
            self.patch_unit(proc.unit, unit)?;
        }

        let mut env = Vec::with_capacity(proc.env.len());
        for value in &proc.env {
            env.push(self.migrate(value)?);
        }
        let upper = match proc.upper {
            Some(upper) => match self.migrate(&Value::Proc(upper))? {
                Value::Proc(upper) => Some(upper),
                _ => return Err(MigrationError::DanglingReference),
            },
            None => None,
        };

        if let Some(new_id) = copy.object_id() {
            if let Some(p) = self.dst.proc_mut(new_id) {
                p.env = env;
                p.upper = upper;
            }
        }
        Ok(copy)
    }

    /// Copy a unit tree into the destination pool.
    ///
    /// The structure travels through the portable encoding; literals that
    /// are live heap values are then migrated one by one and patched into
    /// the copy. `NO_FREE` units are copied again for every reference.
    pub fn migrate_unit(&mut self, unit: UnitId) -> Result<UnitId, MigrationError> {
        let (copy, fresh) = self.copy_unit(unit)?;
        if fresh {
            self.patch_unit(unit, copy)?;
        }
        Ok(copy)
    }

    /// The destination unit tree for `unit`, with live literals still `nil`
    /// when it was decoded just now (`true`).
    fn copy_unit(&mut self, unit: UnitId) -> Result<(UnitId, bool), MigrationError> {
        if let Some(&done) = self.units.get(&unit) {
            return Ok((done, false));
        }
        let src = self.src;
        let source = src.unit(unit).ok_or(MigrationError::MissingUnit)?;
        let shared = !source.flags.contains(UnitFlags::NO_FREE);

        let bytes = src.serialize_unit(unit)?;
        let copy = self.dst.deserialize_unit(&bytes)?;
        if shared {
            self.units.insert(unit, copy);
        }
        Ok((copy, true))
    }

    fn patch_unit(&mut self, unit: UnitId, copy: UnitId) -> Result<(), MigrationError> {
        let src = self.src;
        let source: Arc<_> = Arc::clone(src.unit(unit).ok_or(MigrationError::MissingUnit)?);
        let copied_children = self
            .dst
            .unit(copy)
            .ok_or(MigrationError::MissingUnit)?
            .children
            .clone();

        // Visible while the literals are migrated, so a literal closure over
        // this very unit shares the copy.
        let previous = self.units.insert(unit, copy);
        let patched = self.patch_literals(&source.literals, copy);
        match previous {
            Some(previous) => {
                self.units.insert(unit, previous);
            }
            None => {
                self.units.remove(&unit);
            }
        }
        patched?;

        for (&child, copied) in source.children.iter().zip(copied_children) {
            let child_shared = src
                .unit(child)
                .is_some_and(|c| !c.flags.contains(UnitFlags::NO_FREE));
            if child_shared {
                self.units.entry(child).or_insert(copied);
            }
            self.patch_unit(child, copied)?;
        }
        Ok(())
    }

    fn patch_literals(&mut self, literals: &[Value], copy: UnitId) -> Result<(), MigrationError> {
        for (idx, literal) in literals.iter().enumerate() {
            if is_live_literal(literal) {
                let value = self.migrate(literal)?;
                self.dst.set_unit_literal(copy, idx, value);
            }
        }
        Ok(())
    }

    /// Copy every safe global of the source. Unsafe globals are skipped and
    /// reported; a failure part way leaves the globals copied so far in
    /// place.
    pub fn copy_globals(&mut self) -> Result<GlobalSnapshot, MigrationError> {
        let src = self.src;
        let mut snapshot = GlobalSnapshot::default();
        for (name, value) in src.globals() {
            if !is_safe_global(src, value) {
                log::debug!("not copying global {name}: holds a {}", value.kind());
                snapshot.skipped.push(name.to_owned());
                continue;
            }
            let copy = self.migrate(value)?;
            self.dst.set_global(name, copy);
            snapshot.copied.push(name.to_owned());
        }
        log::trace!(
            "copied {} globals, skipped {}",
            snapshot.copied.len(),
            snapshot.skipped.len()
        );
        Ok(snapshot)
    }
}

/// Copy one value graph from `src` into `dst`.
pub fn migrate(src: &Heap, dst: &mut Heap, value: &Value) -> Result<Value, MigrationError> {
    Migrator::new(src, dst).migrate(value)
}

/// Destination id of a source symbol, by name.
pub fn intern_across(src: &Heap, dst: &mut Heap, sym: SymbolId) -> SymbolId {
    dst.intern(&src.symbol_name(sym))
}

/// Intern every source symbol into `dst` in source order. On a freshly
/// opened destination this makes the ids of all existing symbols agree.
pub fn prime_symbols(src: &Heap, dst: &mut Heap) {
    for (_, name) in src.symbols().iter() {
        dst.intern(name);
    }
}

/// Whether a global may be handed to a new thread: its whole graph is made
/// of primitives, strings, symbols, shareable host handles, arrays, hashes
/// and ranges of those, and procs whose captures, enclosing procs and live
/// literals are made of those too.
pub fn is_safe_global(heap: &Heap, value: &Value) -> bool {
    is_safe_inner(heap, value, &mut Seen::default())
}

#[derive(Default)]
struct Seen {
    objects: HashSet<ObjectId, RandomState>,
    units: HashSet<UnitId, RandomState>,
}

fn is_safe_inner(heap: &Heap, value: &Value, seen: &mut Seen) -> bool {
    match value {
        Value::Nil
        | Value::Bool(_)
        | Value::Integer(_)
        | Value::Float(_)
        | Value::Symbol(_)
        | Value::String(_) => true,
        Value::Host(host) => host.shareable(),
        Value::Object(_) | Value::Exception(_) | Value::Class(_) | Value::RawPointer(_) => false,
        Value::Array(id) | Value::Hash(id) | Value::Range(id) | Value::Proc(id) => {
            if !seen.objects.insert(*id) {
                return true;
            }
            match heap.get(*id) {
                Some(HeapObject::Array(items)) => items.iter().all(|v| is_safe_inner(heap, v, seen)),
                Some(HeapObject::Hash(hash)) => hash
                    .iter()
                    .all(|(k, v)| is_safe_inner(heap, k, seen) && is_safe_inner(heap, v, seen)),
                Some(HeapObject::Range(range)) => {
                    is_safe_inner(heap, &range.begin, seen) && is_safe_inner(heap, &range.end, seen)
                }
                Some(HeapObject::Proc(proc)) => {
                    let object = heap.specials().object;
                    proc.target_class.is_none_or(|class| class == object)
                        && proc.env.iter().all(|v| is_safe_inner(heap, v, seen))
                        && proc
                            .upper
                            .is_none_or(|upper| is_safe_inner(heap, &Value::Proc(upper), seen))
                        && is_safe_unit(heap, proc.unit, seen)
                }
                _ => false,
            }
        }
    }
}

fn is_safe_unit(heap: &Heap, unit: UnitId, seen: &mut Seen) -> bool {
    if !seen.units.insert(unit) {
        return true;
    }
    let Some(unit) = heap.unit(unit) else {
        return false;
    };
    unit.literals
        .iter()
        .filter(|literal| is_live_literal(literal))
        .all(|literal| is_safe_inner(heap, literal, seen))
        && unit.children.iter().all(|&child| is_safe_unit(heap, child, seen))
}
