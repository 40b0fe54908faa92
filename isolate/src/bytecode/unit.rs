use std::fmt::Write as _;

use bitflags::bitflags;

use super::{BytecodeDecoder, DecodeError};
use crate::Value;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnitFlags: u8 {
        /// The heap does not own the unit and never releases it.
        const NO_FREE = 0b0000_0001;
    }
}

/// Index into a heap's unit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub(crate) u32);

impl UnitId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A compiled procedure body: instructions, literal pool and the units of
/// closures created inside it.
#[derive(Debug, Clone, Default)]
pub struct Unit {
    pub code: Vec<u8>,
    pub literals: Vec<Value>,
    pub children: Vec<UnitId>,
    pub arity: u8,
    pub nlocals: u8,
    pub flags: UnitFlags,
}

impl Unit {
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    pub fn with_arity(mut self, arity: u8) -> Self {
        self.arity = arity;
        self
    }

    pub fn with_locals(mut self, nlocals: u8) -> Self {
        self.nlocals = nlocals;
        self
    }

    pub fn with_literals(mut self, literals: Vec<Value>) -> Self {
        self.literals = literals;
        self
    }

    pub fn with_children(mut self, children: Vec<UnitId>) -> Self {
        self.children = children;
        self
    }

    pub fn with_flags(mut self, flags: UnitFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn disassemble(&self) -> Result<String, DecodeError> {
        let mut out = String::new();
        let mut decoder = BytecodeDecoder::new(&self.code);
        loop {
            let offset = decoder.offset();
            let Some(inst) = decoder.decode_next() else {
                break;
            };
            let _ = writeln!(out, "{offset:04}: {}", inst?);
        }
        Ok(out)
    }
}
