mod bindings;
mod builtins;
mod bytecode;
mod class;
mod heap;
mod interning;
mod interpreter;
mod migrate;
mod parker;
mod runtime;
mod scheduler;
mod sync;
mod threads;
mod value;
mod visitor;

#[cfg(test)]
mod test_support;

pub use bytecode::*;
pub use class::{ClassDef, ClassKind, ClassTable, PathError, SpecialClasses};
pub use heap::{
    GcStats, HashKey, Heap, HeapCreateInfo, HeapId, HeapObject, HeapSettings, OrderedMap,
    RException, RHash, RObject, RProc, RRange,
};
pub use interning::{SymbolId, SymbolTable};
pub use interpreter::GuestException;
pub use migrate::{
    GlobalSnapshot, MigrationError, Migrator, intern_across, is_safe_global, migrate,
    prime_symbols,
};
pub use parker::Parker;
pub use runtime::{Interrupts, POLL_INTERVAL, Runtime, RuntimeCreateInfo};
pub use scheduler::{Job, ScaleConfig, Scheduler, SchedulerError, WorkerId};
pub use sync::*;
pub use threads::{ThreadContext, ThreadError, ThreadState, ThreadStatus};
pub use value::{ClassId, HostObject, HostRef, NativeBody, NativeFn, ObjectId, Value, ValueKind};
pub use visitor::{Visitable, Visitor};
