use super::op::{Op, SEND_BLOCK};

/// A forward jump whose offset has not yet been resolved.
///
/// Created by [`BytecodeBuilder::jump`], [`BytecodeBuilder::jump_if_true`],
/// and [`BytecodeBuilder::jump_if_false`]. Resolve it with
/// [`BytecodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Position of the i16 offset bytes in the buffer.
    offset_pos: usize,
    /// Position right after the jump instruction (base for relative offset).
    base: usize,
}

/// Builds a bytecode byte sequence.
///
/// The builder picks the narrowest `LoadSmi` encoding and emits the
/// [`Op::Wide`] / [`Op::ExtraWide`] prefix when needed.
pub struct BytecodeBuilder {
    buf: Vec<u8>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    pub fn load_nil(&mut self) {
        self.emit_op(Op::LoadNil);
    }

    pub fn load_true(&mut self) {
        self.emit_op(Op::LoadTrue);
    }

    pub fn load_false(&mut self) {
        self.emit_op(Op::LoadFalse);
    }

    pub fn load_self(&mut self) {
        self.emit_op(Op::LoadSelf);
    }

    /// `LoadSmi <value>`, 8-bit, 16-bit (`Wide`) or 32-bit (`ExtraWide`)
    /// depending on the value.
    pub fn load_smi(&mut self, value: i32) {
        if let Ok(v) = i8::try_from(value) {
            self.emit_op(Op::LoadSmi);
            self.emit_u8(v as u8);
        } else if let Ok(v) = i16::try_from(value) {
            self.emit_op(Op::Wide);
            self.emit_op(Op::LoadSmi);
            self.emit_i16(v);
        } else {
            self.emit_op(Op::ExtraWide);
            self.emit_op(Op::LoadSmi);
            self.emit_u32(value as u32);
        }
    }

    pub fn load_literal(&mut self, idx: u16) {
        self.emit_op(Op::LoadLiteral);
        self.emit_u16(idx);
    }

    pub fn load_arg(&mut self, idx: u8) {
        self.emit_op(Op::LoadArg);
        self.emit_u8(idx);
    }

    pub fn load_local(&mut self, reg: u8) {
        self.emit_op(Op::LoadLocal);
        self.emit_u8(reg);
    }

    pub fn store_local(&mut self, reg: u8) {
        self.emit_op(Op::StoreLocal);
        self.emit_u8(reg);
    }

    pub fn load_env(&mut self, depth: u8, idx: u8) {
        self.emit_op(Op::LoadEnv);
        self.emit_u8(depth);
        self.emit_u8(idx);
    }

    pub fn store_env(&mut self, depth: u8, idx: u8) {
        self.emit_op(Op::StoreEnv);
        self.emit_u8(depth);
        self.emit_u8(idx);
    }

    pub fn load_proc(&mut self) {
        self.emit_op(Op::LoadProc);
    }

    pub fn load_global(&mut self, name_idx: u16) {
        self.emit_op(Op::LoadGlobal);
        self.emit_u16(name_idx);
    }

    pub fn store_global(&mut self, name_idx: u16) {
        self.emit_op(Op::StoreGlobal);
        self.emit_u16(name_idx);
    }

    pub fn load_ivar(&mut self, name_idx: u16) {
        self.emit_op(Op::LoadIvar);
        self.emit_u16(name_idx);
    }

    pub fn store_ivar(&mut self, name_idx: u16) {
        self.emit_op(Op::StoreIvar);
        self.emit_u16(name_idx);
    }

    pub fn load_const(&mut self, path_idx: u16) {
        self.emit_op(Op::LoadConst);
        self.emit_u16(path_idx);
    }

    /// `Send <name_idx:u16> <argc:u8> 0`
    pub fn send(&mut self, name_idx: u16, argc: u8) {
        self.emit_op(Op::Send);
        self.emit_u16(name_idx);
        self.emit_u8(argc);
        self.emit_u8(0);
    }

    /// `Send` whose last operand on the stack is a block.
    pub fn send_with_block(&mut self, name_idx: u16, argc: u8) {
        self.emit_op(Op::Send);
        self.emit_u16(name_idx);
        self.emit_u8(argc);
        self.emit_u8(SEND_BLOCK);
    }

    pub fn make_array(&mut self, count: u8) {
        self.emit_op(Op::MakeArray);
        self.emit_u8(count);
    }

    pub fn make_hash(&mut self, pairs: u8) {
        self.emit_op(Op::MakeHash);
        self.emit_u8(pairs);
    }

    pub fn make_range(&mut self, exclusive: bool) {
        self.emit_op(Op::MakeRange);
        self.emit_u8(exclusive as u8);
    }

    pub fn make_proc(&mut self, child: u16, captures: u8) {
        self.emit_op(Op::MakeProc);
        self.emit_u16(child);
        self.emit_u8(captures);
    }

    pub fn pop(&mut self) {
        self.emit_op(Op::Pop);
    }

    pub fn dup(&mut self) {
        self.emit_op(Op::Dup);
    }

    pub fn raise(&mut self) {
        self.emit_op(Op::Raise);
    }

    pub fn return_(&mut self) {
        self.emit_op(Op::Return);
    }

    // ── jumps ──────────────────────────────────────────────────────

    /// Emit an unconditional forward jump. Returns a [`Label`] to bind later.
    pub fn jump(&mut self) -> Label {
        self.emit_jump_placeholder(Op::Jump)
    }

    pub fn jump_if_true(&mut self) -> Label {
        self.emit_jump_placeholder(Op::JumpIfTrue)
    }

    pub fn jump_if_false(&mut self) -> Label {
        self.emit_jump_placeholder(Op::JumpIfFalse)
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.buf.len();
        let offset = (target as isize - label.base as isize) as i16;
        self.buf[label.offset_pos..label.offset_pos + 2].copy_from_slice(&offset.to_le_bytes());
    }

    /// Emit an unconditional backward jump to `target` (a byte offset obtained
    /// from [`current_offset`](Self::current_offset)).
    pub fn jump_back(&mut self, target: usize) {
        self.emit_back(Op::Jump, target);
    }

    pub fn jump_back_if_true(&mut self, target: usize) {
        self.emit_back(Op::JumpIfTrue, target);
    }

    fn emit_back(&mut self, op: Op, target: usize) {
        self.emit_op(op);
        let base = self.buf.len() + 2;
        let offset = (target as isize - base as isize) as i16;
        self.emit_i16(offset);
    }

    fn emit_jump_placeholder(&mut self, op: Op) -> Label {
        self.emit_op(op);
        let offset_pos = self.buf.len();
        self.emit_i16(0);
        let base = self.buf.len();
        Label { offset_pos, base }
    }
}

impl Default for BytecodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
