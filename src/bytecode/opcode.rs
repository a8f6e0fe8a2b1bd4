// Strand Bytecode Instructions

use std::fmt;

/// Bytecode operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Nop,

    // Constants and stack
    Constant, // u16 constant index
    Pop,

    // Variables
    GetVar,  // u8 local index
    SetVar,  // u8 local index
    GetGVar, // u16 module global index
    SetGVar, // u16 module global index

    // Arithmetic and comparison
    Add,
    Sub,
    Lt,

    // Control flow
    Jump,  // i16 relative offset
    JumpZ, // u16 forward offset, pops the condition

    // Calls
    Frame,       // u8 locals, u8 returned values
    Return,
    CallLocal,   // u24 func ip, u32 args info
    CallNative,  // u16 native index, u32 args info
    CallFuncPtr, // u32 args info, pops the func pointer

    // Closures
    GetFuncIpPtr,     // u24 func index
    GetFuncNativePtr, // u16 native index
    SetUpval,         // u8 frame local index, u8 callee local index

    // Collections
    NewList, // u8 items count

    // Blocks, u16 block size
    Scope,
    Defer,
    Paral,
    ParalAll,
}

impl Opcode {
    pub const ALL: [Opcode; 25] = [
        Opcode::Nop,
        Opcode::Constant,
        Opcode::Pop,
        Opcode::GetVar,
        Opcode::SetVar,
        Opcode::GetGVar,
        Opcode::SetGVar,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Lt,
        Opcode::Jump,
        Opcode::JumpZ,
        Opcode::Frame,
        Opcode::Return,
        Opcode::CallLocal,
        Opcode::CallNative,
        Opcode::CallFuncPtr,
        Opcode::GetFuncIpPtr,
        Opcode::GetFuncNativePtr,
        Opcode::SetUpval,
        Opcode::NewList,
        Opcode::Scope,
        Opcode::Defer,
        Opcode::Paral,
        Opcode::ParalAll,
    ];

    /// Byte widths of the operands following the opcode
    pub fn operand_widths(&self) -> &'static [usize] {
        match self {
            Opcode::Nop
            | Opcode::Pop
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Lt
            | Opcode::Return => &[],

            Opcode::GetVar | Opcode::SetVar | Opcode::NewList => &[1],

            Opcode::Constant
            | Opcode::GetGVar
            | Opcode::SetGVar
            | Opcode::Jump
            | Opcode::JumpZ
            | Opcode::GetFuncNativePtr
            | Opcode::Scope
            | Opcode::Defer
            | Opcode::Paral
            | Opcode::ParalAll => &[2],

            Opcode::Frame | Opcode::SetUpval => &[1, 1],
            Opcode::GetFuncIpPtr => &[3],
            Opcode::CallFuncPtr => &[4],
            Opcode::CallLocal => &[3, 4],
            Opcode::CallNative => &[2, 4],
        }
    }

    pub fn operands_size(&self) -> usize {
        self.operand_widths().iter().sum()
    }

    /// Opcodes whose operand is the size of the block that follows
    pub fn is_block(&self) -> bool {
        matches!(
            self,
            Opcode::Scope | Opcode::Defer | Opcode::Paral | Opcode::ParalAll
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Opcode::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
