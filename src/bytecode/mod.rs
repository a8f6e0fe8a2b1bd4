// Strand Bytecode Module
// Opcodes, code chunks and compiled modules

pub mod args;
pub mod chunk;
pub mod module;
pub mod opcode;

pub use args::FuncArgsInfo;
pub use chunk::Chunk;
pub use module::{Const, FuncSymbol, Module, ModuleBuilder, Segment};
pub use opcode::Opcode;
