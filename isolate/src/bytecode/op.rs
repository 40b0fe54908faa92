/// Bytecode opcodes of the stack machine.
///
/// Operands follow the opcode byte in little-endian order. Literal pool and
/// name indices are always 16-bit, argument, local and environment slots are
/// 8-bit, jump offsets are signed 16-bit and relative to the end of the jump.
///
/// [`Wide`](Op::Wide) and [`ExtraWide`](Op::ExtraWide) prefixes are only
/// valid before [`LoadSmi`](Op::LoadSmi).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Prefix: the next `LoadSmi` carries an `i16`.
    Wide = 0x00,

    /// Prefix: the next `LoadSmi` carries an `i32`.
    ExtraWide,

    LoadNil,
    LoadTrue,
    LoadFalse,

    /// Push the receiver of the current frame.
    LoadSelf,

    /// Push a small integer.
    /// Operands: `value:i8` (wide: `i16`, extra-wide: `i32`)
    LoadSmi,

    /// Push a literal pool entry.
    /// Operands: `idx:u16`
    LoadLiteral,

    /// Push a call argument (nil when absent).
    /// Operands: `idx:u8`
    LoadArg,

    /// Operands: `reg:u8`
    LoadLocal,

    /// Pop into a frame local.
    /// Operands: `reg:u8`
    StoreLocal,

    /// Push a captured variable. `depth` 0 is the running closure, each
    /// further level follows the `upper` link.
    /// Operands: `depth:u8`, `idx:u8`
    LoadEnv,

    /// Pop into a captured variable.
    /// Operands: `depth:u8`, `idx:u8`
    StoreEnv,

    /// Push the running closure itself.
    LoadProc,

    /// Push a global; the name is a symbol literal.
    /// Operands: `name_idx:u16`
    LoadGlobal,

    /// Operands: `name_idx:u16`
    StoreGlobal,

    /// Push an instance variable of the receiver.
    /// Operands: `name_idx:u16`
    LoadIvar,

    /// Operands: `name_idx:u16`
    StoreIvar,

    /// Resolve a `A::B` path literal to a class.
    /// Operands: `path_idx:u16`
    LoadConst,

    /// Pop receiver, `argc` arguments and (when flagged) a block, push the
    /// result of the call.
    /// Operands: `name_idx:u16`, `argc:u8`, `flags:u8`
    Send,

    /// Operands: `count:u8`
    MakeArray,

    /// Pop `pairs` key/value pairs.
    /// Operands: `pairs:u8`
    MakeHash,

    /// Pop begin and end.
    /// Operands: `exclusive:u8`
    MakeRange,

    /// Create a closure from a nested unit, capturing the top `captures`
    /// stack values as its environment.
    /// Operands: `child:u16`, `captures:u8`
    MakeProc,

    Pop,
    Dup,

    /// Operands: `offset:i16`
    Jump,

    /// Pop the condition.
    /// Operands: `offset:i16`
    JumpIfTrue,

    /// Pop the condition.
    /// Operands: `offset:i16`
    JumpIfFalse,

    /// Pop a message, exception or exception class and raise it.
    Raise,

    /// Pop the result and leave the frame.
    Return,
}

/// `Send` flag: the last popped operand is a block.
pub const SEND_BLOCK: u8 = 0b01;

impl Op {
    pub const COUNT: usize = Op::Return as usize + 1;
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
