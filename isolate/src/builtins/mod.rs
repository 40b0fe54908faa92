use std::time::Duration;

use crate::{GuestException, Heap, Value, bindings};

pub mod collections;
pub mod numeric;
pub mod object;
pub mod string;

/// What a per-kind method table returns: `None` when it has no method of
/// that name and dispatch should fall through to the universal methods.
pub(crate) type MethodResult = Result<Option<Value>, GuestException>;

impl Heap {
    /// Guest method dispatch for built-in classes.
    pub fn send(
        &mut self,
        receiver: &Value,
        name: &str,
        args: &[Value],
        block: Option<&Value>,
    ) -> Result<Value, GuestException> {
        let handled = match receiver {
            Value::Integer(i) => numeric::integer_method(self, *i, name, args, block)?,
            Value::Float(f) => numeric::float_method(self, *f, name, args)?,
            Value::String(_) => string::string_method(self, receiver, name, args)?,
            Value::Symbol(sym) => string::symbol_method(self, *sym, name, args)?,
            Value::Array(_) => collections::array_method(self, receiver, name, args, block)?,
            Value::Hash(_) => collections::hash_method(self, receiver, name, args, block)?,
            Value::Range(_) => collections::range_method(self, receiver, name, args, block)?,
            Value::Proc(_) => object::proc_method(self, receiver, name, args)?,
            Value::Exception(_) => object::exception_method(self, receiver, name, args)?,
            Value::Class(class) => match bindings::class_method(self, *class, name, args, block)? {
                Some(value) => Some(value),
                None => object::class_method(self, *class, name, args)?,
            },
            Value::Host(host) => match host.downcast_ref::<crate::NativeFn>() {
                Some(_) => object::proc_method(self, receiver, name, args)?,
                None => bindings::host_method(self, host, name, args, block)?,
            },
            Value::Nil | Value::Bool(_) | Value::Object(_) | Value::RawPointer(_) => None,
        };
        if let Some(value) = handled {
            return Ok(value);
        }
        if let Some(value) = object::universal_method(self, receiver, name, args, block)? {
            return Ok(value);
        }
        Err(no_method(self, receiver, name))
    }
}

pub(crate) fn no_method(heap: &mut Heap, receiver: &Value, name: &str) -> GuestException {
    let target = match receiver {
        Value::Nil => "nil".to_string(),
        Value::Class(class) => format!("class {}", heap.class_path(*class)),
        _ => {
            let class = heap.class_of(receiver);
            format!("an instance of {}", heap.class_path(class))
        }
    };
    let class = heap.specials().no_method_error;
    heap.raise_error(class, format!("undefined method '{name}' for {target}"))
}

pub(crate) fn check_args(
    heap: &mut Heap,
    args: &[Value],
    min: usize,
    max: usize,
) -> Result<(), GuestException> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = match min == max {
        true => min.to_string(),
        false if max == usize::MAX => format!("{min}+"),
        false => format!("{min}..{max}"),
    };
    Err(heap.argument_error(format!(
        "wrong number of arguments (given {}, expected {expected})",
        args.len()
    )))
}

fn conversion_error(heap: &mut Heap, value: &Value, into: &str) -> GuestException {
    let name = match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        _ => {
            let class = heap.class_of(value);
            heap.class_path(class)
        }
    };
    heap.type_error(format!("no implicit conversion of {name} into {into}"))
}

pub(crate) fn expect_integer(heap: &mut Heap, value: &Value) -> Result<i64, GuestException> {
    match value {
        Value::Integer(i) => Ok(*i),
        other => Err(conversion_error(heap, other, "Integer")),
    }
}

pub(crate) fn expect_string(heap: &mut Heap, value: &Value) -> Result<String, GuestException> {
    match heap.string_lossy(value) {
        Some(text) => Ok(text.into_owned()),
        None => Err(conversion_error(heap, value, "String")),
    }
}

/// A method name given as a symbol or a string.
pub(crate) fn expect_name(heap: &mut Heap, value: &Value) -> Result<String, GuestException> {
    match value {
        Value::Symbol(sym) => Ok(heap.symbol_name(*sym).to_string()),
        Value::String(_) => expect_string(heap, value),
        other => {
            let text = heap.inspect(other);
            Err(heap.type_error(format!("{text} is not a symbol nor a string")))
        }
    }
}

pub(crate) fn expect_block(
    heap: &mut Heap,
    block: Option<&Value>,
    name: &str,
) -> Result<Value, GuestException> {
    match block {
        Some(block) => Ok(block.clone()),
        None => Err(heap.argument_error(format!("{name} called without a block"))),
    }
}

/// A sleep interval in seconds; `nil` means forever.
pub(crate) fn expect_interval(
    heap: &mut Heap,
    value: Option<&Value>,
) -> Result<Option<Duration>, GuestException> {
    let seconds = match value {
        None | Some(Value::Nil) => return Ok(None),
        Some(Value::Integer(i)) => *i as f64,
        Some(Value::Float(f)) => *f,
        Some(other) => return Err(conversion_error(heap, other, "time interval")),
    };
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(heap.argument_error("time interval must not be negative"));
    }
    Ok(Some(Duration::from_secs_f64(seconds)))
}

/// Call a block with no meaningful receiver.
pub(crate) fn yield_to(
    heap: &mut Heap,
    block: &Value,
    args: &[Value],
) -> Result<Value, GuestException> {
    heap.call_value(block, Value::Nil, args)
}
