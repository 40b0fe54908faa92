use std::sync::Arc;

use crate::{BytecodeDecoder, ClassId, Heap, Instruction, NativeFn, ObjectId, SymbolId, Unit, Value};

/// A raised guest exception. The value belongs to the heap that raised it.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestException(pub Value);

impl GuestException {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

struct Frame {
    proc: ObjectId,
    unit: Arc<Unit>,
    receiver: Value,
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
}

impl Frame {
    #[inline]
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }
}

impl Heap {
    /// Run a procedure (a guest closure or a [`NativeFn`] handle) on this
    /// heap. Collects first when called from the top level and enough has
    /// been allocated since the last collection.
    pub fn invoke(
        &mut self,
        target: &Value,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, GuestException> {
        if self.should_collect() {
            let mut roots = Vec::with_capacity(args.len() + 2);
            roots.push(target.clone());
            roots.push(receiver.clone());
            roots.extend_from_slice(args);
            self.collect(&roots);
        }
        self.call_value(target, receiver, args)
    }

    pub(crate) fn call_value(
        &mut self,
        target: &Value,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, GuestException> {
        match target {
            Value::Proc(id) => self.call_proc(*id, receiver, args),
            Value::Host(host) => match host.downcast_ref::<NativeFn>() {
                Some(native) => {
                    self.enter_frame()?;
                    let result = native.call(self, args);
                    self.active_frames -= 1;
                    result
                }
                None => Err(self.type_error(format!("{} is not callable", host.class_name()))),
            },
            other => {
                let text = self.inspect(other);
                Err(self.type_error(format!("{text} is not callable")))
            }
        }
    }

    fn enter_frame(&mut self) -> Result<(), GuestException> {
        if self.active_frames >= self.settings().max_call_depth {
            let class = self.specials().system_stack_error;
            return Err(self.raise_error(class, "stack level too deep"));
        }
        self.active_frames += 1;
        Ok(())
    }

    fn call_proc(
        &mut self,
        id: ObjectId,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, GuestException> {
        let Some(unit) = self
            .proc_by_id(id)
            .and_then(|proc| self.unit(proc.unit))
            .cloned()
        else {
            return Err(self.runtime_error("procedure has no code"));
        };
        self.enter_frame()?;
        let mut frame = Frame {
            proc: id,
            locals: vec![Value::Nil; unit.nlocals as usize],
            unit,
            receiver,
            args: args.to_vec(),
            stack: Vec::new(),
        };
        let result = self.run(&mut frame);
        self.active_frames -= 1;
        result
    }

    fn run(&mut self, frame: &mut Frame) -> Result<Value, GuestException> {
        let unit = Arc::clone(&frame.unit);
        let mut decoder = BytecodeDecoder::new(&unit.code);

        loop {
            if self.interrupts.pending() {
                self.poll_interrupts()?;
            }
            let inst = match decoder.decode_next() {
                Some(Ok(inst)) => inst,
                Some(Err(err)) => return Err(self.runtime_error(format!("malformed bytecode: {err}"))),
                None => return Ok(frame.stack.pop().unwrap_or(Value::Nil)),
            };

            match inst {
                Instruction::LoadNil => frame.push(Value::Nil),
                Instruction::LoadTrue => frame.push(Value::Bool(true)),
                Instruction::LoadFalse => frame.push(Value::Bool(false)),
                Instruction::LoadSelf => {
                    let receiver = frame.receiver.clone();
                    frame.push(receiver);
                }
                Instruction::LoadSmi { value } => frame.push(Value::Integer(value as i64)),
                Instruction::LoadLiteral { idx } => {
                    let value = self.literal(&unit, idx)?;
                    frame.push(value);
                }
                Instruction::LoadArg { idx } => {
                    let value = frame.args.get(idx as usize).cloned().unwrap_or(Value::Nil);
                    frame.push(value);
                }
                Instruction::LoadLocal { reg } => {
                    let value = frame.locals.get(reg as usize).cloned().unwrap_or(Value::Nil);
                    frame.push(value);
                }
                Instruction::StoreLocal { reg } => {
                    let value = self.pop(frame)?;
                    let reg = reg as usize;
                    if frame.locals.len() <= reg {
                        frame.locals.resize(reg + 1, Value::Nil);
                    }
                    frame.locals[reg] = value;
                }
                Instruction::LoadEnv { depth, idx } => {
                    let owner = self.env_owner(frame.proc, depth)?;
                    let value = self
                        .proc_by_id(owner)
                        .and_then(|proc| proc.env.get(idx as usize).cloned())
                        .unwrap_or(Value::Nil);
                    frame.push(value);
                }
                Instruction::StoreEnv { depth, idx } => {
                    let value = self.pop(frame)?;
                    let owner = self.env_owner(frame.proc, depth)?;
                    self.set_proc_env(&Value::Proc(owner), idx as usize, value);
                }
                Instruction::LoadProc => frame.push(Value::Proc(frame.proc)),
                Instruction::LoadGlobal { name_idx } => {
                    let name = self.symbol_literal(&unit, name_idx)?;
                    let value = self.get_global_sym(name);
                    frame.push(value);
                }
                Instruction::StoreGlobal { name_idx } => {
                    let name = self.symbol_literal(&unit, name_idx)?;
                    let value = self.pop(frame)?;
                    self.set_global_sym(name, value);
                }
                Instruction::LoadIvar { name_idx } => {
                    let name = self.symbol_literal(&unit, name_idx)?;
                    let value = self.ivar_get(&frame.receiver, name);
                    frame.push(value);
                }
                Instruction::StoreIvar { name_idx } => {
                    let name = self.symbol_literal(&unit, name_idx)?;
                    let value = self.pop(frame)?;
                    if !self.ivar_set(&frame.receiver, name, value) {
                        let text = self.inspect(&frame.receiver);
                        return Err(self.runtime_error(format!(
                            "can't set instance variable on {text}"
                        )));
                    }
                }
                Instruction::LoadConst { path_idx } => {
                    let path = self.literal(&unit, path_idx)?;
                    let path = match &path {
                        Value::Symbol(sym) => self.symbol_name(*sym).to_string(),
                        _ => self.to_display(&path),
                    };
                    let value = self.lookup_const(&path)?;
                    frame.push(value);
                }
                Instruction::Send {
                    name_idx,
                    argc,
                    block,
                } => {
                    let name = self.symbol_literal(&unit, name_idx)?;
                    let block = match block {
                        true => Some(self.pop(frame)?),
                        false => None,
                    };
                    let args = self.pop_n(frame, argc as usize)?;
                    let receiver = self.pop(frame)?;
                    let name = self.symbol_name(name);
                    let result = self.send(&receiver, &name, &args, block.as_ref())?;
                    frame.push(result);
                }
                Instruction::MakeArray { count } => {
                    let items = self.pop_n(frame, count as usize)?;
                    let array = self.new_array(items);
                    frame.push(array);
                }
                Instruction::MakeHash { pairs } => {
                    let flat = self.pop_n(frame, pairs as usize * 2)?;
                    let hash = self.new_hash();
                    for pair in flat.chunks_exact(2) {
                        self.hash_set(&hash, pair[0].clone(), pair[1].clone());
                    }
                    frame.push(hash);
                }
                Instruction::MakeRange { exclusive } => {
                    let end = self.pop(frame)?;
                    let begin = self.pop(frame)?;
                    let range = self.new_range(begin, end, exclusive);
                    frame.push(range);
                }
                Instruction::MakeProc { child, captures } => {
                    let env = self.pop_n(frame, captures as usize)?;
                    let Some(&child_unit) = unit.children.get(child as usize) else {
                        return Err(self.runtime_error(format!("no nested unit #{child}")));
                    };
                    let target_class = self.proc_by_id(frame.proc).and_then(|p| p.target_class);
                    let proc = self.new_proc_in(child_unit, env, Some(frame.proc), target_class);
                    frame.push(proc);
                }
                Instruction::Pop => {
                    self.pop(frame)?;
                }
                Instruction::Dup => {
                    let Some(top) = frame.stack.last().cloned() else {
                        return Err(self.runtime_error("stack underflow"));
                    };
                    frame.push(top);
                }
                Instruction::Jump { offset } => self.jump(&mut decoder, offset)?,
                Instruction::JumpIfTrue { offset } => {
                    if self.pop(frame)?.is_truthy() {
                        self.jump(&mut decoder, offset)?;
                    }
                }
                Instruction::JumpIfFalse { offset } => {
                    if !self.pop(frame)?.is_truthy() {
                        self.jump(&mut decoder, offset)?;
                    }
                }
                Instruction::Raise => {
                    let value = self.pop(frame)?;
                    return Err(self.make_exception(value));
                }
                Instruction::Return => return Ok(frame.stack.pop().unwrap_or(Value::Nil)),
            }
        }
    }

    fn pop(&mut self, frame: &mut Frame) -> Result<Value, GuestException> {
        match frame.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.runtime_error("stack underflow")),
        }
    }

    /// Pop `n` operands, oldest first.
    fn pop_n(&mut self, frame: &mut Frame, n: usize) -> Result<Vec<Value>, GuestException> {
        if frame.stack.len() < n {
            return Err(self.runtime_error("stack underflow"));
        }
        let at = frame.stack.len() - n;
        Ok(frame.stack.split_off(at))
    }

    fn jump(&mut self, decoder: &mut BytecodeDecoder<'_>, offset: i16) -> Result<(), GuestException> {
        decoder
            .jump(offset)
            .map_err(|err| self.runtime_error(format!("malformed bytecode: {err}")))
    }

    fn literal(&mut self, unit: &Unit, idx: u16) -> Result<Value, GuestException> {
        match unit.literals.get(idx as usize) {
            Some(value) => Ok(value.clone()),
            None => Err(self.runtime_error(format!("literal #{idx} out of range"))),
        }
    }

    fn symbol_literal(&mut self, unit: &Unit, idx: u16) -> Result<SymbolId, GuestException> {
        match self.literal(unit, idx)? {
            Value::Symbol(sym) => Ok(sym),
            other => {
                let text = self.inspect(&other);
                Err(self.type_error(format!("{text} is not a symbol")))
            }
        }
    }

    /// The closure `depth` lexical levels above `proc`.
    fn env_owner(&mut self, proc: ObjectId, depth: u8) -> Result<ObjectId, GuestException> {
        let mut current = proc;
        for _ in 0..depth {
            match self.proc_by_id(current).and_then(|p| p.upper) {
                Some(upper) => current = upper,
                None => {
                    return Err(self.runtime_error(format!("no enclosing closure at depth {depth}")));
                }
            }
        }
        Ok(current)
    }

    /// Resolve `A::B::C` starting at `Object`.
    fn lookup_const(&mut self, path: &str) -> Result<Value, GuestException> {
        let mut scope = self.specials().object;
        let mut found = None;
        for segment in path.trim_start_matches("::").split("::") {
            if let Some(value) = found.take() {
                scope = match value {
                    Value::Class(class) => class,
                    _ => return Err(self.type_error(format!("{path} is not a class/module"))),
                };
            }
            found = self
                .symbols
                .lookup(segment)
                .and_then(|sym| self.get_const(scope, sym))
                .cloned();
            if found.is_none() {
                let class = self.specials().name_error;
                return Err(self.raise_error(class, format!("uninitialized constant {path}")));
            }
        }
        found.ok_or_else(|| {
            let class = self.specials().name_error;
            self.raise_error(class, format!("uninitialized constant {path}"))
        })
    }

    /// Park while a stop is requested; fail once the heap is cancelled.
    pub(crate) fn poll_interrupts(&mut self) -> Result<(), GuestException> {
        let interrupts = Arc::clone(&self.interrupts);
        if !interrupts.is_cancelled() {
            interrupts.wait_while_stopped();
        }
        if interrupts.is_cancelled() {
            return Err(self.cancellation());
        }
        Ok(())
    }

    /// The exception unwinding a killed or shut down heap.
    pub(crate) fn cancellation(&mut self) -> GuestException {
        let message = match self.interrupts.is_killed() {
            true => "thread killed",
            false => "interpreter shutting down",
        };
        let class = self.specials().thread_error;
        self.raise_error(class, message)
    }

    pub fn raise_error(&mut self, class: ClassId, message: impl AsRef<str>) -> GuestException {
        GuestException(self.new_exception(class, message.as_ref()))
    }

    pub(crate) fn runtime_error(&mut self, message: impl AsRef<str>) -> GuestException {
        let class = self.specials().runtime_error;
        self.raise_error(class, message)
    }

    pub(crate) fn type_error(&mut self, message: impl AsRef<str>) -> GuestException {
        let class = self.specials().type_error;
        self.raise_error(class, message)
    }

    pub(crate) fn argument_error(&mut self, message: impl AsRef<str>) -> GuestException {
        let class = self.specials().argument_error;
        self.raise_error(class, message)
    }

    /// What `raise value` raises.
    pub(crate) fn make_exception(&mut self, value: Value) -> GuestException {
        let specials = *self.specials();
        match value {
            Value::Exception(_) => GuestException(value),
            Value::String(_) => GuestException(self.new_exception_with(specials.runtime_error, value)),
            Value::Class(class) if self.is_kind_of(class, specials.exception) => {
                let name = self.class_path(class);
                self.raise_error(class, name)
            }
            _ => self.type_error("exception class/object expected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapCreateInfo, test_support::*};

    #[test]
    fn adds_small_integers() {
        let mut heap = Heap::open();
        let proc = compile(&mut heap, 0, &["+"], |b| {
            b.load_smi(21);
            b.load_smi(21);
            b.send(0, 1);
            b.return_();
        });
        assert_eq!(heap.invoke(&proc, Value::Nil, &[]), Ok(Value::Integer(42)));
    }

    #[test]
    fn recursive_closure_through_load_proc() {
        let mut heap = Heap::open();
        let fib = fib_proc(&mut heap);
        assert_eq!(heap.invoke(&fib, Value::Nil, &[Value::Integer(15)]), Ok(Value::Integer(610)));
        assert_eq!(heap.active_frames, 0);
    }

    #[test]
    fn locals_and_backward_jumps() {
        // sum = 0; i = 0; while i < 10 { i += 1; sum += i }; sum
        let mut heap = Heap::open();
        let proc = compile(&mut heap, 0, &["<", "+"], |b| {
            b.load_smi(0);
            b.store_local(0);
            b.load_smi(0);
            b.store_local(1);
            let top = b.current_offset();
            b.load_local(1);
            b.load_smi(10);
            b.send(0, 1);
            let exit = b.jump_if_false();
            b.load_local(1);
            b.load_smi(1);
            b.send(1, 1);
            b.store_local(1);
            b.load_local(0);
            b.load_local(1);
            b.send(1, 1);
            b.store_local(0);
            b.jump_back(top);
            b.bind(exit);
            b.load_local(0);
            b.return_();
        });
        assert_eq!(heap.invoke(&proc, Value::Nil, &[]), Ok(Value::Integer(55)));
    }

    #[test]
    fn closures_read_and_write_enclosing_environments() {
        let mut heap = Heap::open();
        // inner: env^1[0] = env^1[0] + arg0; env^1[0]
        let mut b = crate::BytecodeBuilder::new();
        b.load_env(1, 0);
        b.load_arg(0);
        b.send(0, 1);
        b.store_env(1, 0);
        b.load_env(1, 0);
        b.return_();
        let plus = Value::Symbol(heap.intern("+"));
        let inner = heap.add_unit(Unit::new(b.into_bytes()).with_arity(1).with_literals(vec![plus]));

        // outer: returns a closure over its own environment.
        let mut b = crate::BytecodeBuilder::new();
        b.make_proc(0, 0);
        b.return_();
        let outer_unit = heap.add_unit(Unit::new(b.into_bytes()).with_children(vec![inner]));
        let outer = heap.new_proc(outer_unit, vec![Value::Integer(100)], None);

        let counter = heap.invoke(&outer, Value::Nil, &[]).unwrap();
        assert_eq!(heap.invoke(&counter, Value::Nil, &[Value::Integer(5)]), Ok(Value::Integer(105)));
        assert_eq!(heap.invoke(&counter, Value::Nil, &[Value::Integer(5)]), Ok(Value::Integer(110)));
        assert_eq!(heap.proc(&outer).unwrap().env, vec![Value::Integer(110)]);
    }

    #[test]
    fn captures_are_copied_into_the_new_closure() {
        let mut heap = Heap::open();
        let mut b = crate::BytecodeBuilder::new();
        b.load_env(0, 1);
        b.return_();
        let inner = heap.add_unit(Unit::new(b.into_bytes()));
        let mut b = crate::BytecodeBuilder::new();
        b.load_smi(1);
        b.load_smi(2);
        b.make_proc(0, 2);
        b.return_();
        let outer_unit = heap.add_unit(Unit::new(b.into_bytes()).with_children(vec![inner]));
        let outer = heap.new_proc(outer_unit, Vec::new(), None);
        let closure = heap.invoke(&outer, Value::Nil, &[]).unwrap();
        assert_eq!(heap.invoke(&closure, Value::Nil, &[]), Ok(Value::Integer(2)));
    }

    #[test]
    fn raising_a_string_makes_a_runtime_error() {
        let mut heap = Heap::open();
        let boom = heap.new_string("boom");
        let proc = compile_with(&mut heap, 0, vec![boom], |b| {
            b.load_literal(0);
            b.raise();
        });
        let err = heap.invoke(&proc, Value::Nil, &[]).unwrap_err();
        assert_eq!(heap.exception_message(err.value()).as_deref(), Some("boom"));
        let class = heap.class_of(err.value());
        assert_eq!(class, heap.specials().runtime_error);
    }

    #[test]
    fn raising_an_exception_class() {
        let mut heap = Heap::open();
        let class = Value::Class(heap.specials().argument_error);
        let proc = compile_with(&mut heap, 0, vec![class], |b| {
            b.load_literal(0);
            b.raise();
        });
        let err = heap.invoke(&proc, Value::Nil, &[]).unwrap_err();
        assert_eq!(heap.exception_message(err.value()).as_deref(), Some("ArgumentError"));
    }

    #[test]
    fn deep_recursion_is_a_system_stack_error() {
        let mut heap = Heap::with_info(&HeapCreateInfo {
            max_call_depth: Some(32),
            ..HeapCreateInfo::default()
        });
        let proc = compile(&mut heap, 0, &["call"], |b| {
            b.load_proc();
            b.send(0, 0);
            b.return_();
        });
        let err = heap.invoke(&proc, Value::Nil, &[]).unwrap_err();
        assert_eq!(heap.class_of(err.value()), heap.specials().system_stack_error);
        assert_eq!(heap.active_frames, 0);
    }

    #[test]
    fn constants_resolve_by_path() {
        let mut heap = Heap::open();
        let path = heap.new_string("Thread::COPY_VALUES");
        let proc = compile_with(&mut heap, 0, vec![path], |b| {
            b.load_const(0);
            b.return_();
        });
        assert_eq!(heap.invoke(&proc, Value::Nil, &[]), Ok(Value::Bool(true)));

        let missing = Value::Symbol(heap.intern("Nope"));
        let proc = compile_with(&mut heap, 0, vec![missing], |b| {
            b.load_const(0);
            b.return_();
        });
        let err = heap.invoke(&proc, Value::Nil, &[]).unwrap_err();
        assert_eq!(heap.class_of(err.value()), heap.specials().name_error);
    }

    #[test]
    fn globals_and_ivars() {
        let mut heap = Heap::open();
        let object = heap.specials().object;
        let receiver = heap.new_object(object);
        let proc = compile(&mut heap, 0, &["$counter", "@seen"], |b| {
            b.load_smi(7);
            b.store_global(0);
            b.load_global(0);
            b.store_ivar(1);
            b.load_ivar(1);
            b.return_();
        });
        assert_eq!(heap.invoke(&proc, receiver.clone(), &[]), Ok(Value::Integer(7)));
        assert_eq!(heap.get_global("$counter"), Value::Integer(7));
        let seen = heap.intern("@seen");
        assert_eq!(heap.ivar_get(&receiver, seen), Value::Integer(7));
    }

    #[test]
    fn native_functions_are_callable() {
        let mut heap = Heap::open();
        let double = NativeFn::new("double", |_heap, args| match args.first() {
            Some(Value::Integer(i)) => Ok(Value::Integer(i * 2)),
            _ => Ok(Value::Nil),
        });
        let target = Value::Host(crate::HostRef::new(double));
        assert_eq!(heap.invoke(&target, Value::Nil, &[Value::Integer(4)]), Ok(Value::Integer(8)));
        assert!(heap.invoke(&Value::Integer(1), Value::Nil, &[]).is_err());
    }

    #[test]
    fn killed_heaps_stop_at_the_next_instruction() {
        let mut heap = Heap::open();
        let proc = compile(&mut heap, 0, &[], |b| {
            b.load_nil();
            b.return_();
        });
        heap.interrupts().kill();
        let err = heap.invoke(&proc, Value::Nil, &[]).unwrap_err();
        assert_eq!(heap.class_of(err.value()), heap.specials().thread_error);
        assert_eq!(heap.exception_message(err.value()).as_deref(), Some("thread killed"));
    }

    #[test]
    fn top_level_invoke_collects_garbage() {
        let mut heap = Heap::with_info(&HeapCreateInfo {
            gc_threshold: Some(8),
            ..HeapCreateInfo::default()
        });
        let proc = compile(&mut heap, 0, &[], |b| {
            for _ in 0..4 {
                b.make_array(0);
                b.pop();
            }
            b.load_nil();
            b.return_();
        });
        for _ in 0..10 {
            heap.invoke(&proc, Value::Nil, &[]).unwrap();
        }
        assert!(heap.live_objects() < 12, "{} objects live", heap.live_objects());
        assert!(heap.proc(&proc).is_some(), "target survives collection");
    }
}
