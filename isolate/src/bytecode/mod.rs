mod builder;
mod decoder;
mod format;
mod instruction;
mod op;
mod unit;

pub use builder::{BytecodeBuilder, Label};
pub use decoder::{BytecodeDecoder, DecodeError};
pub use format::{FORMAT_MAGIC, FORMAT_VERSION, FormatError};
pub(crate) use format::is_live_literal;
pub use instruction::Instruction;
pub use op::{Op, SEND_BLOCK};
pub use unit::{Unit, UnitFlags, UnitId};
