use super::{MethodResult, check_args, expect_block, expect_integer, expect_string, yield_to};
use crate::{GuestException, Heap, Value};

/// Longest integer range `to_a` and friends will materialize.
const MAX_RANGE_ITEMS: i64 = 1 << 24;

fn index_in(len: usize, idx: i64) -> Option<usize> {
    let idx = match idx < 0 {
        true => len as i64 + idx,
        false => idx,
    };
    usize::try_from(idx).ok()
}

pub fn array_method(
    heap: &mut Heap,
    receiver: &Value,
    name: &str,
    args: &[Value],
    block: Option<&Value>,
) -> MethodResult {
    let items = heap.array_items(receiver).map(<[Value]>::to_vec).unwrap_or_default();
    let value = match name {
        "[]" | "at" => {
            check_args(heap, args, 1, 1)?;
            let idx = expect_integer(heap, &args[0])?;
            index_in(items.len(), idx)
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Nil)
        }
        "[]=" => {
            check_args(heap, args, 2, 2)?;
            let idx = expect_integer(heap, &args[0])?;
            let Some(i) = index_in(items.len(), idx) else {
                let class = heap.specials().index_error;
                return Err(heap.raise_error(
                    class,
                    format!("index {idx} too small for array; minimum: -{}", items.len()),
                ));
            };
            if let Some(items) = heap.array_items_mut(receiver) {
                if items.len() <= i {
                    items.resize(i + 1, Value::Nil);
                }
                items[i] = args[1].clone();
            }
            args[1].clone()
        }
        "push" | "<<" | "append" => {
            if name == "<<" {
                check_args(heap, args, 1, 1)?;
            }
            for item in args {
                heap.array_push(receiver, item.clone());
            }
            receiver.clone()
        }
        "pop" => heap
            .array_items_mut(receiver)
            .and_then(Vec::pop)
            .unwrap_or(Value::Nil),
        "shift" => match heap.array_items_mut(receiver) {
            Some(items) if !items.is_empty() => items.remove(0),
            _ => Value::Nil,
        },
        "unshift" | "prepend" => {
            if let Some(items) = heap.array_items_mut(receiver) {
                items.splice(0..0, args.iter().cloned());
            }
            receiver.clone()
        }
        "size" | "length" => Value::Integer(items.len() as i64),
        "empty?" => Value::Bool(items.is_empty()),
        "first" => items.first().cloned().unwrap_or(Value::Nil),
        "last" => items.last().cloned().unwrap_or(Value::Nil),
        "include?" => {
            check_args(heap, args, 1, 1)?;
            Value::Bool(items.iter().any(|item| heap.values_equal(item, &args[0])))
        }
        "each" => {
            let block = expect_block(heap, block, "each")?;
            for item in items {
                yield_to(heap, &block, &[item])?;
            }
            receiver.clone()
        }
        "map" | "collect" => {
            let block = expect_block(heap, block, "map")?;
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                mapped.push(yield_to(heap, &block, &[item])?);
            }
            heap.new_array(mapped)
        }
        "join" => {
            check_args(heap, args, 0, 1)?;
            let separator = match args.first() {
                Some(sep) => expect_string(heap, sep)?,
                None => String::new(),
            };
            let parts: Vec<String> = items.iter().map(|item| heap.to_display(item)).collect();
            heap.new_string(parts.join(&separator))
        }
        "dup" | "to_a" => heap.new_array(items),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

pub fn hash_method(
    heap: &mut Heap,
    receiver: &Value,
    name: &str,
    args: &[Value],
    block: Option<&Value>,
) -> MethodResult {
    let value = match name {
        "[]" => {
            check_args(heap, args, 1, 1)?;
            heap.hash_get(receiver, &args[0]).unwrap_or(Value::Nil)
        }
        "[]=" | "store" => {
            check_args(heap, args, 2, 2)?;
            heap.hash_set(receiver, args[0].clone(), args[1].clone());
            args[1].clone()
        }
        "size" | "length" => Value::Integer(heap.rhash(receiver).map_or(0, |h| h.len()) as i64),
        "empty?" => Value::Bool(heap.rhash(receiver).is_none_or(|h| h.is_empty())),
        "key?" | "has_key?" | "include?" | "member?" => {
            check_args(heap, args, 1, 1)?;
            Value::Bool(heap.hash_get(receiver, &args[0]).is_some())
        }
        "delete" => {
            check_args(heap, args, 1, 1)?;
            heap.hash_delete(receiver, &args[0]).unwrap_or(Value::Nil)
        }
        "keys" | "values" | "to_a" => {
            let entries = heap.hash_entries(receiver).unwrap_or_default();
            let items = match name {
                "keys" => entries.into_iter().map(|(k, _)| k).collect(),
                "values" => entries.into_iter().map(|(_, v)| v).collect(),
                _ => entries
                    .into_iter()
                    .map(|(k, v)| heap.new_array(vec![k, v]))
                    .collect(),
            };
            heap.new_array(items)
        }
        "each" | "each_pair" => {
            let block = expect_block(heap, block, "each")?;
            for (key, value) in heap.hash_entries(receiver).unwrap_or_default() {
                yield_to(heap, &block, &[key, value])?;
            }
            receiver.clone()
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Integer bounds of a range as a half-open interval.
fn integer_span(heap: &mut Heap, receiver: &Value) -> Result<(i64, i64), GuestException> {
    let Some(range) = heap.range(receiver).cloned() else {
        return Err(heap.type_error("not a range"));
    };
    let begin = expect_integer(heap, &range.begin)?;
    let end = expect_integer(heap, &range.end)?;
    let end = match range.exclusive {
        true => end,
        false => end.saturating_add(1),
    };
    Ok((begin, end.max(begin)))
}

fn integer_items(heap: &mut Heap, receiver: &Value) -> Result<Vec<Value>, GuestException> {
    let (begin, end) = integer_span(heap, receiver)?;
    if end.saturating_sub(begin) > MAX_RANGE_ITEMS {
        let class = heap.specials().range_error;
        return Err(heap.raise_error(class, "range too large"));
    }
    Ok((begin..end).map(Value::Integer).collect())
}

pub fn range_method(
    heap: &mut Heap,
    receiver: &Value,
    name: &str,
    args: &[Value],
    block: Option<&Value>,
) -> MethodResult {
    let Some(range) = heap.range(receiver).cloned() else {
        return Ok(None);
    };
    let value = match name {
        "first" | "begin" => range.begin,
        "last" | "end" => range.end,
        "exclude_end?" => Value::Bool(range.exclusive),
        "size" | "count" => {
            let (begin, end) = integer_span(heap, receiver)?;
            Value::Integer(end.saturating_sub(begin))
        }
        "include?" | "member?" | "===" => {
            check_args(heap, args, 1, 1)?;
            let lower = super::numeric::compare_numbers(&range.begin, &args[0]);
            let upper = super::numeric::compare_numbers(&args[0], &range.end);
            Value::Bool(match (lower, upper) {
                (Some(lower), Some(upper)) => {
                    lower.is_le() && (upper.is_lt() || (!range.exclusive && upper.is_eq()))
                }
                _ => false,
            })
        }
        "to_a" => {
            let items = integer_items(heap, receiver)?;
            heap.new_array(items)
        }
        "each" => {
            let block = expect_block(heap, block, "each")?;
            let (begin, end) = integer_span(heap, receiver)?;
            for i in begin..end {
                yield_to(heap, &block, &[Value::Integer(i)])?;
            }
            receiver.clone()
        }
        "map" | "collect" => {
            let block = expect_block(heap, block, "map")?;
            let items = integer_items(heap, receiver)?;
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                mapped.push(yield_to(heap, &block, &[item])?);
            }
            heap.new_array(mapped)
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::compile;

    #[test]
    fn negative_indices_count_from_the_end() {
        let mut heap = Heap::open();
        let array = heap.new_array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
        assert_eq!(heap.send(&array, "[]", &[Value::Integer(-1)], None), Ok(Value::Integer(3)));
        assert_eq!(heap.send(&array, "[]", &[Value::Integer(5)], None), Ok(Value::Nil));
        heap.send(&array, "[]=", &[Value::Integer(4), Value::Integer(9)], None).unwrap();
        assert_eq!(heap.inspect(&array), "[1, 2, 3, nil, 9]");
        assert!(heap.send(&array, "[]=", &[Value::Integer(-9), Value::Nil], None).is_err());
    }

    #[test]
    fn map_yields_every_item() {
        let mut heap = Heap::open();
        let double = compile(&mut heap, 1, &["*"], |b| {
            b.load_arg(0);
            b.load_smi(2);
            b.send(0, 1);
            b.return_();
        });
        let array = heap.new_array(vec![Value::Integer(1), Value::Integer(2)]);
        let mapped = heap.send(&array, "map", &[], Some(&double)).unwrap();
        assert_eq!(heap.inspect(&mapped), "[2, 4]");

        let range = heap.new_range(Value::Integer(1), Value::Integer(3), true);
        let mapped = heap.send(&range, "map", &[], Some(&double)).unwrap();
        assert_eq!(heap.inspect(&mapped), "[2, 4]");
    }

    #[test]
    fn join_uses_display_form() {
        let mut heap = Heap::open();
        let s = heap.new_string("a");
        let array = heap.new_array(vec![s, Value::Integer(1), Value::Nil]);
        let sep = heap.new_string("-");
        let joined = heap.send(&array, "join", &[sep], None).unwrap();
        assert_eq!(heap.string_lossy(&joined).as_deref(), Some("a-1-"));
    }

    #[test]
    fn hashes_keep_insertion_order() {
        let mut heap = Heap::open();
        let hash = heap.new_hash();
        let b = heap.new_string("b");
        heap.send(&hash, "[]=", &[b, Value::Integer(2)], None).unwrap();
        heap.send(&hash, "[]=", &[Value::Integer(1), Value::Integer(1)], None).unwrap();
        let keys = heap.send(&hash, "keys", &[], None).unwrap();
        assert_eq!(heap.inspect(&keys), "[\"b\", 1]");
        let b = heap.new_string("b");
        assert_eq!(heap.send(&hash, "[]", &[b], None), Ok(Value::Integer(2)));
        assert_eq!(heap.send(&hash, "delete", &[Value::Integer(1)], None), Ok(Value::Integer(1)));
        assert_eq!(heap.send(&hash, "size", &[], None), Ok(Value::Integer(1)));
    }

    #[test]
    fn ranges() {
        let mut heap = Heap::open();
        let inclusive = heap.new_range(Value::Integer(1), Value::Integer(5), false);
        let exclusive = heap.new_range(Value::Integer(1), Value::Integer(5), true);
        assert_eq!(heap.send(&inclusive, "size", &[], None), Ok(Value::Integer(5)));
        assert_eq!(heap.send(&exclusive, "size", &[], None), Ok(Value::Integer(4)));
        assert_eq!(heap.send(&exclusive, "include?", &[Value::Integer(5)], None), Ok(Value::Bool(false)));
        assert_eq!(heap.send(&inclusive, "include?", &[Value::Float(4.5)], None), Ok(Value::Bool(true)));
        let huge = heap.new_range(Value::Integer(0), Value::Integer(i64::MAX), false);
        assert!(heap.send(&huge, "to_a", &[], None).is_err());
    }
}
