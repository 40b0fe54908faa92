use core::fmt;

/// A decoded instruction with its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    LoadNil,
    LoadTrue,
    LoadFalse,
    LoadSelf,
    LoadSmi { value: i32 },
    LoadLiteral { idx: u16 },
    LoadArg { idx: u8 },
    LoadLocal { reg: u8 },
    StoreLocal { reg: u8 },
    LoadEnv { depth: u8, idx: u8 },
    StoreEnv { depth: u8, idx: u8 },
    LoadProc,
    LoadGlobal { name_idx: u16 },
    StoreGlobal { name_idx: u16 },
    LoadIvar { name_idx: u16 },
    StoreIvar { name_idx: u16 },
    LoadConst { path_idx: u16 },
    Send { name_idx: u16, argc: u8, block: bool },
    MakeArray { count: u8 },
    MakeHash { pairs: u8 },
    MakeRange { exclusive: bool },
    MakeProc { child: u16, captures: u8 },
    Pop,
    Dup,
    Jump { offset: i16 },
    JumpIfTrue { offset: i16 },
    JumpIfFalse { offset: i16 },
    Raise,
    Return,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadNil => write!(f, "LoadNil"),
            Self::LoadTrue => write!(f, "LoadTrue"),
            Self::LoadFalse => write!(f, "LoadFalse"),
            Self::LoadSelf => write!(f, "LoadSelf"),
            Self::LoadSmi { value } => write!(f, "LoadSmi {value}"),
            Self::LoadLiteral { idx } => write!(f, "LoadLiteral #{idx}"),
            Self::LoadArg { idx } => write!(f, "LoadArg a{idx}"),
            Self::LoadLocal { reg } => write!(f, "LoadLocal r{reg}"),
            Self::StoreLocal { reg } => write!(f, "StoreLocal r{reg}"),
            Self::LoadEnv { depth, idx } => write!(f, "LoadEnv ^{depth}[{idx}]"),
            Self::StoreEnv { depth, idx } => write!(f, "StoreEnv ^{depth}[{idx}]"),
            Self::LoadProc => write!(f, "LoadProc"),
            Self::LoadGlobal { name_idx } => write!(f, "LoadGlobal #{name_idx}"),
            Self::StoreGlobal { name_idx } => write!(f, "StoreGlobal #{name_idx}"),
            Self::LoadIvar { name_idx } => write!(f, "LoadIvar #{name_idx}"),
            Self::StoreIvar { name_idx } => write!(f, "StoreIvar #{name_idx}"),
            Self::LoadConst { path_idx } => write!(f, "LoadConst #{path_idx}"),
            Self::Send {
                name_idx,
                argc,
                block,
            } => {
                if *block {
                    write!(f, "Send #{name_idx} {argc} &")
                } else {
                    write!(f, "Send #{name_idx} {argc}")
                }
            }
            Self::MakeArray { count } => write!(f, "MakeArray {count}"),
            Self::MakeHash { pairs } => write!(f, "MakeHash {pairs}"),
            Self::MakeRange { exclusive } => {
                write!(f, "MakeRange {}", if *exclusive { "..." } else { ".." })
            }
            Self::MakeProc { child, captures } => write!(f, "MakeProc #{child} {captures}"),
            Self::Pop => write!(f, "Pop"),
            Self::Dup => write!(f, "Dup"),
            Self::Jump { offset } => write!(f, "Jump {offset:+}"),
            Self::JumpIfTrue { offset } => write!(f, "JumpIfTrue {offset:+}"),
            Self::JumpIfFalse { offset } => write!(f, "JumpIfFalse {offset:+}"),
            Self::Raise => write!(f, "Raise"),
            Self::Return => write!(f, "Return"),
        }
    }
}
