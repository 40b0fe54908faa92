use std::sync::Arc;

use super::{
    MethodResult, check_args, expect_block, expect_integer, expect_interval, expect_name,
    no_method, yield_to,
};
use crate::{ClassId, ClassKind, GuestException, Heap, Value};

/// Methods every value answers to.
pub fn universal_method(
    heap: &mut Heap,
    receiver: &Value,
    name: &str,
    args: &[Value],
    block: Option<&Value>,
) -> MethodResult {
    let value = match name {
        "==" | "eql?" | "===" => {
            check_args(heap, args, 1, 1)?;
            Value::Bool(heap.values_equal(receiver, &args[0]))
        }
        "!=" => {
            check_args(heap, args, 1, 1)?;
            Value::Bool(!heap.values_equal(receiver, &args[0]))
        }
        "equal?" => {
            check_args(heap, args, 1, 1)?;
            Value::Bool(*receiver == args[0])
        }
        "!" => Value::Bool(!receiver.is_truthy()),
        "nil?" => Value::Bool(receiver.is_nil()),
        "class" => Value::Class(heap.class_of(receiver)),
        "inspect" => {
            let text = heap.inspect(receiver);
            heap.new_string(text)
        }
        "to_s" => {
            let text = heap.to_display(receiver);
            heap.new_string(text)
        }
        "is_a?" | "kind_of?" | "instance_of?" => {
            check_args(heap, args, 1, 1)?;
            let Value::Class(ancestor) = args[0] else {
                return Err(heap.type_error("class or module required"));
            };
            let class = heap.class_of(receiver);
            Value::Bool(match name {
                "instance_of?" => class == ancestor,
                _ => heap.is_kind_of(class, ancestor),
            })
        }
        "instance_variable_get" => {
            check_args(heap, args, 1, 1)?;
            let ivar = expect_name(heap, &args[0])?;
            let ivar = heap.intern(&ivar);
            heap.ivar_get(receiver, ivar)
        }
        "instance_variable_set" => {
            check_args(heap, args, 2, 2)?;
            let ivar = expect_name(heap, &args[0])?;
            let ivar = heap.intern(&ivar);
            if !heap.ivar_set(receiver, ivar, args[1].clone()) {
                let text = heap.inspect(receiver);
                return Err(heap.runtime_error(format!("can't set instance variable on {text}")));
            }
            args[1].clone()
        }
        "instance_variables" => {
            let names: Vec<_> = heap
                .ivars(receiver)
                .map(|ivars| ivars.keys().copied().map(Value::Symbol).collect())
                .unwrap_or_default();
            heap.new_array(names)
        }
        "send" | "__send__" | "public_send" => {
            check_args(heap, args, 1, usize::MAX)?;
            let method = expect_name(heap, &args[0])?;
            return heap.send(receiver, &method, &args[1..], block).map(Some);
        }
        "puts" => {
            if args.is_empty() {
                println!();
            }
            for arg in args {
                let items = heap.array_items(arg).map(<[Value]>::to_vec);
                for item in items.unwrap_or_else(|| vec![arg.clone()]) {
                    println!("{}", heap.to_display(&item));
                }
            }
            Value::Nil
        }
        "print" => {
            for arg in args {
                print!("{}", heap.to_display(arg));
            }
            Value::Nil
        }
        "p" => {
            for arg in args {
                println!("{}", heap.inspect(arg));
            }
            match args {
                [] => Value::Nil,
                [one] => one.clone(),
                many => heap.new_array(many.to_vec()),
            }
        }
        "raise" => {
            check_args(heap, args, 0, 2)?;
            return Err(match args {
                [] => heap.runtime_error("unhandled exception"),
                [value] => heap.make_exception(value.clone()),
                [class, message, ..] => match class {
                    Value::Class(class) => GuestException(heap.new_exception_with(*class, message.clone())),
                    _ => heap.type_error("exception class/object expected"),
                },
            });
        }
        "sleep" => {
            check_args(heap, args, 0, 1)?;
            let interval = expect_interval(heap, args.first())?;
            let interrupts = Arc::clone(heap.interrupts());
            let slept = interrupts.sleep(interval);
            if interrupts.is_cancelled() {
                return Err(heap.cancellation());
            }
            Value::Integer(slept.as_secs_f64().round() as i64)
        }
        "loop" => {
            let block = expect_block(heap, block, "loop")?;
            let stop_iteration = heap.specials().stop_iteration;
            loop {
                heap.poll_interrupts()?;
                if let Err(err) = yield_to(heap, &block, &[]) {
                    let class = heap.class_of(err.value());
                    if heap.is_kind_of(class, stop_iteration) {
                        break Value::Nil;
                    }
                    return Err(err);
                }
            }
        }
        "freeze" | "itself" => receiver.clone(),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

pub fn proc_method(heap: &mut Heap, receiver: &Value, name: &str, args: &[Value]) -> MethodResult {
    let value = match name {
        "call" | "()" | "yield" | "[]" | "===" => heap.call_value(receiver, Value::Nil, args)?,
        "arity" => match heap.proc(receiver).and_then(|p| heap.unit(p.unit)) {
            Some(unit) => Value::Integer(unit.arity as i64),
            None => Value::Integer(-1),
        },
        "lambda?" => Value::Bool(false),
        "to_proc" => receiver.clone(),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

pub fn exception_method(
    heap: &mut Heap,
    receiver: &Value,
    name: &str,
    args: &[Value],
) -> MethodResult {
    let value = match name {
        "message" | "to_s" => {
            check_args(heap, args, 0, 0)?;
            match heap.exception(receiver).map(|exc| exc.message.clone()) {
                Some(message @ Value::String(_)) => message,
                Some(message) => {
                    let text = heap.to_display(&message);
                    heap.new_string(text)
                }
                None => Value::Nil,
            }
        }
        "full_message" => {
            let class = heap.class_of(receiver);
            let text = format!(
                "{} ({})",
                heap.exception_message(receiver).unwrap_or_default(),
                heap.class_path(class)
            );
            heap.new_string(text)
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn instantiate(heap: &mut Heap, class: ClassId, args: &[Value]) -> MethodResult {
    let s = *heap.specials();
    if heap.class_def(class).map(|def| def.kind) == Some(ClassKind::Module) {
        return Err(no_method(heap, &Value::Class(class), "new"));
    }
    let value = if heap.is_kind_of(class, s.exception) {
        check_args(heap, args, 0, 1)?;
        let message = match args.first() {
            Some(message) => message.clone(),
            None => {
                let name = heap.class_path(class);
                heap.new_string(name)
            }
        };
        heap.new_exception_with(class, message)
    } else if class == s.string {
        check_args(heap, args, 0, 1)?;
        let bytes = match args.first() {
            Some(text) => super::expect_string(heap, text)?,
            None => String::new(),
        };
        heap.new_string(bytes)
    } else if class == s.array {
        check_args(heap, args, 0, 2)?;
        let len = match args.first() {
            Some(len) => expect_integer(heap, len)?,
            None => 0,
        };
        let Ok(len) = usize::try_from(len) else {
            return Err(heap.argument_error("negative array size"));
        };
        let fill = args.get(1).cloned().unwrap_or(Value::Nil);
        heap.new_array(vec![fill; len])
    } else if class == s.hash {
        heap.new_hash()
    } else if [
        s.integer, s.float, s.symbol, s.nil_class, s.true_class, s.false_class, s.proc_class,
        s.range, s.class, s.module,
    ]
    .iter()
    .any(|&builtin| heap.is_kind_of(class, builtin))
    {
        return Err(no_method(heap, &Value::Class(class), "new"));
    } else {
        check_args(heap, args, 0, 0)?;
        heap.new_object(class)
    };
    Ok(Some(value))
}

pub fn class_method(heap: &mut Heap, class: ClassId, name: &str, args: &[Value]) -> MethodResult {
    let value = match name {
        "new" => return instantiate(heap, class, args),
        "name" | "to_s" | "inspect" => {
            let path = heap.class_path(class);
            heap.new_string(path)
        }
        "superclass" => heap.superclass(class).map_or(Value::Nil, Value::Class),
        "===" => {
            check_args(heap, args, 1, 1)?;
            let other = heap.class_of(&args[0]);
            Value::Bool(heap.is_kind_of(other, class))
        }
        "<=" => {
            check_args(heap, args, 1, 1)?;
            match args[0] {
                Value::Class(other) => Value::Bool(heap.is_kind_of(class, other)),
                _ => return Err(heap.type_error("compared with non class/module")),
            }
        }
        "const_get" => {
            check_args(heap, args, 1, 1)?;
            let const_name = expect_name(heap, &args[0])?;
            let sym = heap.intern(&const_name);
            match heap.get_const(class, sym).cloned() {
                Some(value) => value,
                None => {
                    let path = heap.class_path(class);
                    let error = heap.specials().name_error;
                    return Err(heap.raise_error(
                        error,
                        format!("uninitialized constant {path}::{const_name}"),
                    ));
                }
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{compile, raising_proc};

    #[test]
    fn equality_is_structural_and_identity_is_not() {
        let mut heap = Heap::open();
        let a = heap.new_string("x");
        let b = heap.new_string("x");
        assert_eq!(heap.send(&a, "==", &[b.clone()], None), Ok(Value::Bool(true)));
        assert_eq!(heap.send(&a, "equal?", &[b], None), Ok(Value::Bool(false)));
        assert_eq!(heap.send(&Value::Integer(1), "==", &[Value::Float(1.0)], None), Ok(Value::Bool(true)));
    }

    #[test]
    fn class_queries() {
        let mut heap = Heap::open();
        let s = *heap.specials();
        assert_eq!(heap.send(&Value::Integer(1), "class", &[], None), Ok(Value::Class(s.integer)));
        let err = heap.new_exception(s.closed_queue_error, "queue closed");
        assert_eq!(
            heap.send(&err, "is_a?", &[Value::Class(s.stop_iteration)], None),
            Ok(Value::Bool(true))
        );
        let name = heap.send(&Value::Class(s.closed_queue_error), "name", &[], None).unwrap();
        assert_eq!(heap.string_lossy(&name).as_deref(), Some("ClosedQueueError"));
        assert_eq!(
            heap.send(&Value::Class(s.sized_queue), "superclass", &[], None),
            Ok(Value::Class(s.queue))
        );
    }

    #[test]
    fn exception_classes_instantiate_with_a_message() {
        let mut heap = Heap::open();
        let s = *heap.specials();
        let message = heap.new_string("bad");
        let exc = heap.send(&Value::Class(s.argument_error), "new", &[message], None).unwrap();
        let text = heap.send(&exc, "message", &[], None).unwrap();
        assert_eq!(heap.string_lossy(&text).as_deref(), Some("bad"));

        let plain = heap.send(&Value::Class(s.runtime_error), "new", &[], None).unwrap();
        assert_eq!(heap.exception_message(&plain).as_deref(), Some("RuntimeError"));
    }

    #[test]
    fn user_classes_instantiate_objects() {
        let mut heap = Heap::open();
        let point = heap.define_class("Point", None);
        let obj = heap.send(&Value::Class(point), "new", &[], None).unwrap();
        let x = heap.new_string("@x");
        heap.send(&obj, "instance_variable_set", &[x.clone(), Value::Integer(3)], None).unwrap();
        assert_eq!(heap.send(&obj, "instance_variable_get", &[x], None), Ok(Value::Integer(3)));
        assert_eq!(heap.inspect(&obj), "#<Point @x=3>");
        let integer = Value::Class(heap.specials().integer);
        assert!(heap.send(&integer, "new", &[], None).is_err());
    }

    #[test]
    fn dynamic_send() {
        let mut heap = Heap::open();
        let plus = Value::Symbol(heap.intern("+"));
        assert_eq!(
            heap.send(&Value::Integer(2), "send", &[plus, Value::Integer(3)], None),
            Ok(Value::Integer(5))
        );
        let missing = heap.new_string("nope");
        let err = heap.send(&Value::Integer(2), "send", &[missing], None).unwrap_err();
        assert_eq!(heap.class_of(err.value()), heap.specials().no_method_error);
    }

    #[test]
    fn loop_ends_on_stop_iteration() {
        let mut heap = Heap::open();
        // $n += 1; raise StopIteration if $n == 3
        let stop = Value::Class(heap.specials().stop_iteration);
        let n = Value::Symbol(heap.intern("$n"));
        let plus = Value::Symbol(heap.intern("+"));
        let eq = Value::Symbol(heap.intern("=="));
        let body = crate::test_support::compile_with(&mut heap, 0, vec![n, plus, eq, stop], |b| {
            b.load_global(0);
            b.load_smi(1);
            b.send(1, 1);
            b.dup();
            b.store_global(0);
            b.load_smi(3);
            b.send(2, 1);
            let done = b.jump_if_false();
            b.load_literal(3);
            b.raise();
            b.bind(done);
            b.load_nil();
            b.return_();
        });
        heap.set_global("$n", Value::Integer(0));
        assert_eq!(heap.send(&Value::Nil, "loop", &[], Some(&body)), Ok(Value::Nil));
        assert_eq!(heap.get_global("$n"), Value::Integer(3));

        let boom = raising_proc(&mut heap, "boom");
        assert!(heap.send(&Value::Nil, "loop", &[], Some(&boom)).is_err());
    }

    #[test]
    fn procs_are_callable_by_message() {
        let mut heap = Heap::open();
        let inc = compile(&mut heap, 1, &["+"], |b| {
            b.load_arg(0);
            b.load_smi(1);
            b.send(0, 1);
            b.return_();
        });
        assert_eq!(heap.send(&inc, "call", &[Value::Integer(1)], None), Ok(Value::Integer(2)));
        assert_eq!(heap.send(&inc, "arity", &[], None), Ok(Value::Integer(1)));
    }
}
