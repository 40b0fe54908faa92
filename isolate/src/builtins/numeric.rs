use std::cmp::Ordering;

use super::{MethodResult, check_args, expect_block, yield_to};
use crate::{GuestException, Heap, Value};

fn zero_division(heap: &mut Heap) -> GuestException {
    let class = heap.specials().zero_division_error;
    heap.raise_error(class, "divided by 0")
}

fn overflow(heap: &mut Heap) -> GuestException {
    let class = heap.specials().range_error;
    heap.raise_error(class, "integer overflow")
}

fn not_a_number(heap: &mut Heap, lhs: &str, rhs: &Value) -> GuestException {
    let class = heap.class_of(rhs);
    let name = heap.class_path(class);
    heap.type_error(format!("{name} can't be coerced into {lhs}"))
}

pub(crate) fn compare_numbers(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
        _ => lhs.as_float()?.partial_cmp(&rhs.as_float()?),
    }
}

fn floor_div(heap: &mut Heap, a: i64, b: i64) -> Result<i64, GuestException> {
    if b == 0 {
        return Err(zero_division(heap));
    }
    let Some(q) = a.checked_div(b) else {
        return Err(overflow(heap));
    };
    Ok(match a % b != 0 && (a < 0) != (b < 0) {
        true => q - 1,
        false => q,
    })
}

fn floor_mod(heap: &mut Heap, a: i64, b: i64) -> Result<i64, GuestException> {
    if b == 0 {
        return Err(zero_division(heap));
    }
    let r = a.checked_rem(b).unwrap_or(0);
    Ok(match r != 0 && (r < 0) != (b < 0) {
        true => r + b,
        false => r,
    })
}

fn integer_arith(heap: &mut Heap, op: &str, a: i64, b: i64) -> Result<Value, GuestException> {
    let result = match op {
        "+" => a.checked_add(b),
        "-" => a.checked_sub(b),
        "*" => a.checked_mul(b),
        "/" => Some(floor_div(heap, a, b)?),
        "%" => Some(floor_mod(heap, a, b)?),
        "**" if b < 0 => return Ok(Value::Float((a as f64).powf(b as f64))),
        "**" => u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp)),
        _ => None,
    };
    result.map(Value::Integer).ok_or_else(|| overflow(heap))
}

fn float_arith(op: &str, a: f64, b: f64) -> Value {
    Value::Float(match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "%" => a - b * (a / b).floor(),
        _ => a.powf(b),
    })
}

/// Comparison operators shared by Integer and Float.
fn compare(heap: &mut Heap, lhs: &Value, op: &str, rhs: &Value) -> Result<Value, GuestException> {
    let ordering = compare_numbers(lhs, rhs);
    if op == "<=>" {
        return Ok(ordering.map_or(Value::Nil, |o| Value::Integer(o as i64)));
    }
    let Some(ordering) = ordering else {
        let lhs = heap.class_of(lhs);
        let lhs = heap.class_path(lhs);
        let rhs = heap.inspect(rhs);
        return Err(heap.argument_error(format!("comparison of {lhs} with {rhs} failed")));
    };
    Ok(Value::Bool(match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        _ => ordering.is_ge(),
    }))
}

pub fn integer_method(
    heap: &mut Heap,
    receiver: i64,
    name: &str,
    args: &[Value],
    block: Option<&Value>,
) -> MethodResult {
    let value = match name {
        "+" | "-" | "*" | "/" | "%" | "**" => {
            check_args(heap, args, 1, 1)?;
            match &args[0] {
                Value::Integer(rhs) => integer_arith(heap, name, receiver, *rhs)?,
                Value::Float(rhs) => float_arith(name, receiver as f64, *rhs),
                other => return Err(not_a_number(heap, "Integer", other)),
            }
        }
        "<" | "<=" | ">" | ">=" | "<=>" => {
            check_args(heap, args, 1, 1)?;
            compare(heap, &Value::Integer(receiver), name, &args[0])?
        }
        "-@" => match receiver.checked_neg() {
            Some(n) => Value::Integer(n),
            None => return Err(overflow(heap)),
        },
        "abs" => match receiver.checked_abs() {
            Some(n) => Value::Integer(n),
            None => return Err(overflow(heap)),
        },
        "succ" | "next" => match receiver.checked_add(1) {
            Some(n) => Value::Integer(n),
            None => return Err(overflow(heap)),
        },
        "to_i" | "to_int" => Value::Integer(receiver),
        "to_f" => Value::Float(receiver as f64),
        "zero?" => Value::Bool(receiver == 0),
        "even?" => Value::Bool(receiver % 2 == 0),
        "odd?" => Value::Bool(receiver % 2 != 0),
        "times" => {
            let block = expect_block(heap, block, "times")?;
            for i in 0..receiver {
                yield_to(heap, &block, &[Value::Integer(i)])?;
            }
            Value::Integer(receiver)
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

pub fn float_method(heap: &mut Heap, receiver: f64, name: &str, args: &[Value]) -> MethodResult {
    let value = match name {
        "+" | "-" | "*" | "/" | "%" | "**" => {
            check_args(heap, args, 1, 1)?;
            match args[0].as_float() {
                Some(rhs) => float_arith(name, receiver, rhs),
                None => return Err(not_a_number(heap, "Float", &args[0])),
            }
        }
        "<" | "<=" | ">" | ">=" | "<=>" => {
            check_args(heap, args, 1, 1)?;
            compare(heap, &Value::Float(receiver), name, &args[0])?
        }
        "-@" => Value::Float(-receiver),
        "abs" => Value::Float(receiver.abs()),
        "to_f" => Value::Float(receiver),
        "to_i" | "to_int" | "floor" | "ceil" | "round" => {
            let rounded = match name {
                "floor" => receiver.floor(),
                "ceil" => receiver.ceil(),
                "round" => receiver.round(),
                _ => receiver.trunc(),
            };
            if !rounded.is_finite() || rounded.abs() >= i64::MAX as f64 {
                let class = heap.specials().range_error;
                return Err(heap.raise_error(class, format!("{receiver:?} out of range of integer")));
            }
            Value::Integer(rounded as i64)
        }
        "nan?" => Value::Bool(receiver.is_nan()),
        "infinite?" => match receiver.is_infinite() {
            true => Value::Integer(receiver.signum() as i64),
            false => Value::Nil,
        },
        "zero?" => Value::Bool(receiver == 0.0),
        _ => return Ok(None),
    };
    Ok(Some(value))
}
