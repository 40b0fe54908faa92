use std::io::Read;

use thiserror::Error;

use super::{BytecodeDecoder, DecodeError, Unit, UnitFlags, UnitId};
use crate::{Heap, Value};

/// Transient in-memory encoding of a unit tree, used to move bytecode
/// between heaps. Never persisted.
pub const FORMAT_MAGIC: [u8; 4] = *b"IREP";
pub const FORMAT_VERSION: u16 = 1;

const TAG_NIL: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_SYMBOL: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_LIVE: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("bad unit header")]
    BadMagic,
    #[error("unsupported unit format version {0}")]
    UnsupportedVersion(u16),
    #[error("unexpected end of unit data")]
    UnexpectedEof,
    #[error("unknown literal tag {0}")]
    BadLiteralTag(u8),
    #[error("symbol literal is not valid utf-8")]
    InvalidSymbol,
    #[error("unit refers to a unit that is not in the pool")]
    MissingUnit,
    #[error("unit has too many {0} to encode")]
    TooLarge(&'static str),
    #[error("{0} bytes after the unit tree")]
    TrailingData(usize),
    #[error("malformed code: {0}")]
    BadCode(#[from] DecodeError),
}

fn encode_len<T: TryFrom<usize>>(len: usize, what: &'static str) -> Result<T, FormatError> {
    T::try_from(len).map_err(|_| FormatError::TooLarge(what))
}

/// Literals that only exist as heap values and are carried over by the
/// migrator instead of by the encoding.
pub(crate) fn is_live_literal(value: &Value) -> bool {
    !matches!(
        value,
        Value::Nil
            | Value::Bool(_)
            | Value::Integer(_)
            | Value::Float(_)
            | Value::Symbol(_)
            | Value::String(_)
    )
}

impl Heap {
    /// Encode a unit and all of its nested units.
    pub fn serialize_unit(&self, id: UnitId) -> Result<Vec<u8>, FormatError> {
        let mut out = Vec::new();
        out.extend_from_slice(&FORMAT_MAGIC);
        write_u16(&mut out, FORMAT_VERSION);
        self.write_unit(&mut out, id)?;
        Ok(out)
    }

    fn write_unit(&self, out: &mut Vec<u8>, id: UnitId) -> Result<(), FormatError> {
        let unit = self.unit(id).ok_or(FormatError::MissingUnit)?;
        write_u8(out, unit.flags.bits());
        write_u8(out, unit.arity);
        write_u8(out, unit.nlocals);
        write_u32(out, encode_len(unit.code.len(), "code bytes")?);
        out.extend_from_slice(&unit.code);

        write_u16(out, encode_len(unit.literals.len(), "literals")?);
        for literal in &unit.literals {
            self.write_literal(out, literal);
        }

        write_u16(out, encode_len(unit.children.len(), "children")?);
        for &child in &unit.children {
            self.write_unit(out, child)?;
        }
        Ok(())
    }

    fn write_literal(&self, out: &mut Vec<u8>, literal: &Value) {
        match literal {
            Value::Nil => write_u8(out, TAG_NIL),
            Value::Bool(true) => write_u8(out, TAG_TRUE),
            Value::Bool(false) => write_u8(out, TAG_FALSE),
            Value::Integer(i) => {
                write_u8(out, TAG_INTEGER);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(f) => {
                write_u8(out, TAG_FLOAT);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Value::Symbol(sym) => {
                write_u8(out, TAG_SYMBOL);
                write_bytes(out, self.symbol_name(*sym).as_bytes());
            }
            Value::String(_) => {
                write_u8(out, TAG_STRING);
                write_bytes(out, self.string_bytes(literal).unwrap_or_default());
            }
            _ => write_u8(out, TAG_LIVE),
        }
    }

    /// Decode a unit tree into this heap's pool. Live literals come back as
    /// `nil` and are patched by the migrator. The copy is always owned by
    /// this heap, so `NO_FREE` is dropped.
    pub fn deserialize_unit(&mut self, bytes: &[u8]) -> Result<UnitId, FormatError> {
        let mut r = bytes;
        let mut magic = [0u8; 4];
        read_exact(&mut r, &mut magic)?;
        if magic != FORMAT_MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = read_u16(&mut r)?;
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }
        let id = self.read_unit(&mut r)?;
        if !r.is_empty() {
            return Err(FormatError::TrailingData(r.len()));
        }
        Ok(id)
    }

    fn read_unit(&mut self, r: &mut &[u8]) -> Result<UnitId, FormatError> {
        let flags = UnitFlags::from_bits_truncate(read_u8(r)?).difference(UnitFlags::NO_FREE);
        let arity = read_u8(r)?;
        let nlocals = read_u8(r)?;
        let code_len = read_u32(r)? as usize;
        let code = read_vec(r, code_len)?;
        for inst in BytecodeDecoder::new(&code) {
            inst?;
        }

        let literal_count = read_u16(r)?;
        let mut literals = Vec::with_capacity(literal_count as usize);
        for _ in 0..literal_count {
            literals.push(self.read_literal(r)?);
        }

        let child_count = read_u16(r)?;
        let mut children = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            children.push(self.read_unit(r)?);
        }

        Ok(self.add_unit(Unit {
            code,
            literals,
            children,
            arity,
            nlocals,
            flags,
        }))
    }

    fn read_literal(&mut self, r: &mut &[u8]) -> Result<Value, FormatError> {
        let tag = read_u8(r)?;
        Ok(match tag {
            TAG_NIL | TAG_LIVE => Value::Nil,
            TAG_TRUE => Value::Bool(true),
            TAG_FALSE => Value::Bool(false),
            TAG_INTEGER => Value::Integer(i64::from_le_bytes(read_array(r)?)),
            TAG_FLOAT => Value::Float(f64::from_bits(u64::from_le_bytes(read_array(r)?))),
            TAG_SYMBOL => {
                let len = read_u32(r)? as usize;
                let bytes = read_vec(r, len)?;
                let name = std::str::from_utf8(&bytes).map_err(|_| FormatError::InvalidSymbol)?;
                Value::Symbol(self.intern(name))
            }
            TAG_STRING => {
                let len = read_u32(r)? as usize;
                let bytes = read_vec(r, len)?;
                self.new_string(bytes)
            }
            other => return Err(FormatError::BadLiteralTag(other)),
        })
    }
}

fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn read_exact(r: &mut &[u8], buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(|_| FormatError::UnexpectedEof)
}

fn read_array<const N: usize>(r: &mut &[u8]) -> Result<[u8; N], FormatError> {
    let mut buf = [0u8; N];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

fn read_u8(r: &mut &[u8]) -> Result<u8, FormatError> {
    Ok(read_array::<1>(r)?[0])
}

fn read_u16(r: &mut &[u8]) -> Result<u16, FormatError> {
    Ok(u16::from_le_bytes(read_array(r)?))
}

fn read_u32(r: &mut &[u8]) -> Result<u32, FormatError> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn read_vec(r: &mut &[u8], len: usize) -> Result<Vec<u8>, FormatError> {
    if r.len() < len {
        return Err(FormatError::UnexpectedEof);
    }
    let (head, tail) = r.split_at(len);
    *r = tail;
    Ok(head.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BytecodeBuilder;

    fn sample(heap: &mut Heap) -> UnitId {
        let mut b = BytecodeBuilder::new();
        b.load_arg(0);
        b.return_();
        let child = heap.add_unit(Unit::new(b.into_bytes()).with_arity(1));

        let name = heap.new_string("hello");
        let sym = heap.intern("greeting");
        let list = heap.new_array(vec![Value::Integer(1)]);
        let mut b = BytecodeBuilder::new();
        b.load_literal(1);
        b.make_proc(0, 0);
        b.pop();
        b.return_();
        heap.add_unit(
            Unit::new(b.into_bytes())
                .with_locals(2)
                .with_literals(vec![
                    Value::Nil,
                    name,
                    Value::Symbol(sym),
                    Value::Integer(-7),
                    Value::Float(2.5),
                    Value::Bool(true),
                    list,
                ])
                .with_children(vec![child])
                .with_flags(UnitFlags::NO_FREE),
        )
    }

    #[test]
    fn unit_tree_survives_the_encoding() {
        let mut src = Heap::open();
        let id = sample(&mut src);
        let bytes = src.serialize_unit(id).unwrap();
        assert_eq!(&bytes[..4], b"IREP");

        let mut dst = Heap::open();
        dst.intern("padding");
        let copy = dst.deserialize_unit(&bytes).unwrap();
        let unit = dst.unit(copy).unwrap().clone();
        let original = src.unit(id).unwrap().clone();

        assert_eq!(unit.code, original.code);
        assert_eq!(unit.nlocals, 2);
        assert!(!unit.flags.contains(UnitFlags::NO_FREE));
        assert_eq!(dst.string_lossy(&unit.literals[1]).as_deref(), Some("hello"));
        let sym = unit.literals[2].as_symbol().unwrap();
        assert_eq!(dst.resolve_symbol(sym), Some("greeting"));
        assert_eq!(unit.literals[3], Value::Integer(-7));
        assert_eq!(unit.literals[4], Value::Float(2.5));
        assert_eq!(unit.literals[5], Value::Bool(true));
        assert_eq!(unit.literals[6], Value::Nil, "live literal is a placeholder");

        let child = dst.unit(unit.children[0]).unwrap();
        assert_eq!(child.arity, 1);
        assert_eq!(dst.unit_refs(unit.children[0]), 1);
    }

    #[test]
    fn rejects_foreign_headers() {
        let mut src = Heap::open();
        let id = sample(&mut src);
        let mut bytes = src.serialize_unit(id).unwrap();
        let mut dst = Heap::open();

        bytes[4] = 9;
        assert_eq!(dst.deserialize_unit(&bytes), Err(FormatError::UnsupportedVersion(9)));
        bytes[0] = b'X';
        assert_eq!(dst.deserialize_unit(&bytes), Err(FormatError::BadMagic));
    }

    #[test]
    fn truncated_data_is_an_error() {
        let mut src = Heap::open();
        let id = sample(&mut src);
        let bytes = src.serialize_unit(id).unwrap();
        let mut dst = Heap::open();
        for cut in [3, 6, 10, bytes.len() - 1] {
            assert_eq!(
                dst.deserialize_unit(&bytes[..cut]),
                Err(FormatError::UnexpectedEof),
                "cut at {cut}"
            );
        }
        let mut long = bytes.clone();
        long.push(0);
        assert_eq!(dst.deserialize_unit(&long), Err(FormatError::TrailingData(1)));
    }

    #[test]
    fn bad_tags_and_code_are_reported() {
        let mut heap = Heap::open();
        let mut b = BytecodeBuilder::new();
        b.return_();
        let id = heap.add_unit(Unit::new(b.into_bytes()).with_literals(vec![Value::Nil]));
        let bytes = heap.serialize_unit(id).unwrap();

        // header(6) + flags/arity/nlocals(3) + code_len(4) + code(1) + count(2)
        let tag_at = 6 + 3 + 4 + 1 + 2;
        let mut bad_tag = bytes.clone();
        bad_tag[tag_at] = 42;
        assert_eq!(heap.deserialize_unit(&bad_tag), Err(FormatError::BadLiteralTag(42)));

        let mut bad_code = bytes.clone();
        bad_code[6 + 3 + 4] = 0xff;
        assert!(matches!(
            heap.deserialize_unit(&bad_code),
            Err(FormatError::BadCode(DecodeError::UnknownOp { byte: 0xff, .. }))
        ));
    }

    #[test]
    fn oversized_pools_are_refused() {
        let mut heap = Heap::open();
        let mut b = BytecodeBuilder::new();
        b.return_();
        let code = b.into_bytes();
        let id = heap.add_unit(Unit::new(code.clone()).with_literals(vec![Value::Nil; 70_000]));
        assert_eq!(heap.serialize_unit(id), Err(FormatError::TooLarge("literals")));

        let leaf = heap.add_unit(Unit::new(code.clone()));
        let id = heap.add_unit(Unit::new(code).with_children(vec![leaf; 65_536]));
        assert_eq!(heap.serialize_unit(id), Err(FormatError::TooLarge("children")));
    }

    #[test]
    fn missing_units_cannot_be_serialized() {
        let heap = Heap::open();
        assert_eq!(heap.serialize_unit(UnitId(3)), Err(FormatError::MissingUnit));
    }
}
