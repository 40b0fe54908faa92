use crate::{BytecodeBuilder, Heap, Unit, Value};

/// Compile a closure whose literal pool holds the given selectors as
/// symbols, in order.
pub(crate) fn compile(
    heap: &mut Heap,
    arity: u8,
    selectors: &[&str],
    build: impl FnOnce(&mut BytecodeBuilder),
) -> Value {
    let literals = selectors
        .iter()
        .map(|name| Value::Symbol(heap.intern(name)))
        .collect();
    compile_with(heap, arity, literals, build)
}

pub(crate) fn compile_with(
    heap: &mut Heap,
    arity: u8,
    literals: Vec<Value>,
    build: impl FnOnce(&mut BytecodeBuilder),
) -> Value {
    let mut b = BytecodeBuilder::new();
    build(&mut b);
    let unit = heap.add_unit(
        Unit::new(b.into_bytes())
            .with_arity(arity)
            .with_locals(4)
            .with_literals(literals),
    );
    heap.new_proc(unit, Vec::new(), None)
}

/// `fib(n) = n < 2 ? n : fib(n - 1) + fib(n - 2)`, recursing through
/// `LoadProc`.
pub(crate) fn fib_proc(heap: &mut Heap) -> Value {
    compile(heap, 1, &["<", "-", "call", "+"], |b| {
        b.load_arg(0);
        b.load_smi(2);
        b.send(0, 1);
        let recurse = b.jump_if_false();
        b.load_arg(0);
        b.return_();
        b.bind(recurse);
        b.load_proc();
        b.load_arg(0);
        b.load_smi(1);
        b.send(1, 1);
        b.send(2, 1);
        b.load_proc();
        b.load_arg(0);
        b.load_smi(2);
        b.send(1, 1);
        b.send(2, 1);
        b.send(3, 1);
        b.return_();
    })
}

/// A closure returning `value` (a small integer).
pub(crate) fn constant_proc(heap: &mut Heap, value: i32) -> Value {
    compile(heap, 0, &[], |b| {
        b.load_smi(value);
        b.return_();
    })
}

/// A closure raising a `RuntimeError` with `message`.
pub(crate) fn raising_proc(heap: &mut Heap, message: &str) -> Value {
    let message = heap.new_string(message);
    compile_with(heap, 0, vec![message], |b| {
        b.load_literal(0);
        b.raise();
    })
}
