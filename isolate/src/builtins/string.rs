use super::{MethodResult, check_args, expect_integer, expect_string};
use crate::{Heap, SymbolId, Value};

pub fn string_method(heap: &mut Heap, receiver: &Value, name: &str, args: &[Value]) -> MethodResult {
    let bytes = heap.string_bytes(receiver).map(<[u8]>::to_vec).unwrap_or_default();
    let value = match name {
        "+" => {
            check_args(heap, args, 1, 1)?;
            let rhs = expect_string(heap, &args[0])?;
            let mut joined = bytes;
            joined.extend_from_slice(rhs.as_bytes());
            heap.new_string(joined)
        }
        "*" => {
            check_args(heap, args, 1, 1)?;
            let count = expect_integer(heap, &args[0])?;
            let Ok(count) = usize::try_from(count) else {
                return Err(heap.argument_error("negative argument"));
            };
            heap.new_string(bytes.repeat(count))
        }
        "<<" | "concat" => {
            check_args(heap, args, 1, 1)?;
            let rhs = expect_string(heap, &args[0])?;
            heap.string_append(receiver, rhs.as_bytes());
            receiver.clone()
        }
        "size" | "length" => Value::Integer(String::from_utf8_lossy(&bytes).chars().count() as i64),
        "bytesize" => Value::Integer(bytes.len() as i64),
        "empty?" => Value::Bool(bytes.is_empty()),
        "to_sym" | "intern" => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            Value::Symbol(heap.intern(&text))
        }
        "to_str" => receiver.clone(),
        "upcase" => heap.new_string(bytes.to_ascii_uppercase()),
        "downcase" => heap.new_string(bytes.to_ascii_lowercase()),
        "to_i" => {
            let text = String::from_utf8_lossy(&bytes);
            let text = text.trim();
            let end = text
                .char_indices()
                .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
                .map_or(text.len(), |(i, _)| i);
            Value::Integer(text[..end].parse().unwrap_or(0))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

pub fn symbol_method(heap: &mut Heap, receiver: SymbolId, name: &str, args: &[Value]) -> MethodResult {
    let value = match name {
        "to_s" | "name" | "id2name" => {
            check_args(heap, args, 0, 0)?;
            let text = heap.symbol_name(receiver);
            heap.new_string(text.as_bytes())
        }
        "to_sym" => Value::Symbol(receiver),
        "size" | "length" => Value::Integer(heap.symbol_name(receiver).chars().count() as i64),
        _ => return Ok(None),
    };
    Ok(Some(value))
}
