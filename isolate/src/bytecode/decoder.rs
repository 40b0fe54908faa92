use thiserror::Error;

use super::{instruction::Instruction, op::Op, op::SEND_BLOCK};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {byte:#04x} at offset {offset}")]
    UnknownOp { byte: u8, offset: usize },
    #[error("truncated instruction at offset {0}")]
    Truncated(usize),
    #[error("prefix {prefix:?} is not valid before {op:?}")]
    BadPrefix { prefix: Op, op: Op },
    #[error("jump to {0} leaves the code")]
    JumpOutOfBounds(isize),
}

/// Operand width selected by an optional prefix byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Normal,
    Wide,
    ExtraWide,
}

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Units reach a heap through deserialization, so every read is checked and
/// malformed code surfaces as a [`DecodeError`].
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Move by a relative offset, as taken by a jump that was just decoded.
    pub fn jump(&mut self, offset: i16) -> Result<(), DecodeError> {
        let target = self.pos as isize + offset as isize;
        if target < 0 || target as usize > self.bytes.len() {
            return Err(DecodeError::JumpOutOfBounds(target));
        }
        self.pos = target as usize;
        Ok(())
    }

    /// Decode the next instruction, or `None` at end-of-stream. A decoding
    /// error ends the stream.
    pub fn decode_next(&mut self) -> Option<Result<Instruction, DecodeError>> {
        if self.is_at_end() {
            return None;
        }
        let decoded = self.decode();
        if decoded.is_err() {
            self.pos = self.bytes.len();
        }
        Some(decoded)
    }

    fn decode(&mut self) -> Result<Instruction, DecodeError> {
        let op = self.read_op()?;
        match op {
            Op::Wide | Op::ExtraWide => {
                let next = self.read_op()?;
                if next != Op::LoadSmi {
                    return Err(DecodeError::BadPrefix {
                        prefix: op,
                        op: next,
                    });
                }
                let width = if op == Op::Wide {
                    Width::Wide
                } else {
                    Width::ExtraWide
                };
                self.decode_op(next, width)
            }
            _ => self.decode_op(op, Width::Normal),
        }
    }

    fn decode_op(&mut self, op: Op, width: Width) -> Result<Instruction, DecodeError> {
        let inst = match op {
            Op::Wide | Op::ExtraWide => {
                return Err(DecodeError::BadPrefix { prefix: op, op });
            }
            Op::LoadNil => Instruction::LoadNil,
            Op::LoadTrue => Instruction::LoadTrue,
            Op::LoadFalse => Instruction::LoadFalse,
            Op::LoadSelf => Instruction::LoadSelf,
            Op::LoadSmi => {
                let value = match width {
                    Width::Normal => self.read_u8()? as i8 as i32,
                    Width::Wide => self.read_i16()? as i32,
                    Width::ExtraWide => self.read_u32()? as i32,
                };
                Instruction::LoadSmi { value }
            }
            Op::LoadLiteral => Instruction::LoadLiteral {
                idx: self.read_u16()?,
            },
            Op::LoadArg => Instruction::LoadArg {
                idx: self.read_u8()?,
            },
            Op::LoadLocal => Instruction::LoadLocal {
                reg: self.read_u8()?,
            },
            Op::StoreLocal => Instruction::StoreLocal {
                reg: self.read_u8()?,
            },
            Op::LoadEnv => Instruction::LoadEnv {
                depth: self.read_u8()?,
                idx: self.read_u8()?,
            },
            Op::StoreEnv => Instruction::StoreEnv {
                depth: self.read_u8()?,
                idx: self.read_u8()?,
            },
            Op::LoadProc => Instruction::LoadProc,
            Op::LoadGlobal => Instruction::LoadGlobal {
                name_idx: self.read_u16()?,
            },
            Op::StoreGlobal => Instruction::StoreGlobal {
                name_idx: self.read_u16()?,
            },
            Op::LoadIvar => Instruction::LoadIvar {
                name_idx: self.read_u16()?,
            },
            Op::StoreIvar => Instruction::StoreIvar {
                name_idx: self.read_u16()?,
            },
            Op::LoadConst => Instruction::LoadConst {
                path_idx: self.read_u16()?,
            },
            Op::Send => Instruction::Send {
                name_idx: self.read_u16()?,
                argc: self.read_u8()?,
                block: self.read_u8()? & SEND_BLOCK != 0,
            },
            Op::MakeArray => Instruction::MakeArray {
                count: self.read_u8()?,
            },
            Op::MakeHash => Instruction::MakeHash {
                pairs: self.read_u8()?,
            },
            Op::MakeRange => Instruction::MakeRange {
                exclusive: self.read_u8()? != 0,
            },
            Op::MakeProc => Instruction::MakeProc {
                child: self.read_u16()?,
                captures: self.read_u8()?,
            },
            Op::Pop => Instruction::Pop,
            Op::Dup => Instruction::Dup,
            Op::Jump => Instruction::Jump {
                offset: self.read_i16()?,
            },
            Op::JumpIfTrue => Instruction::JumpIfTrue {
                offset: self.read_i16()?,
            },
            Op::JumpIfFalse => Instruction::JumpIfFalse {
                offset: self.read_i16()?,
            },
            Op::Raise => Instruction::Raise,
            Op::Return => Instruction::Return,
        };
        Ok(inst)
    }

    // ── read helpers ───────────────────────────────────────────────

    fn read_op(&mut self) -> Result<Op, DecodeError> {
        let offset = self.pos;
        let byte = self.read_u8()?;
        Op::try_from(byte).map_err(|byte| DecodeError::UnknownOp { byte, offset })
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated(self.pos))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    #[inline(always)]
    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    #[inline(always)]
    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    #[inline(always)]
    fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.take()?))
    }

    #[inline(always)]
    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next()
    }
}
