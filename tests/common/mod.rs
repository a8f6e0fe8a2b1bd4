// Shared helpers for the integration tests
#![allow(dead_code)]

use strand::bytecode::{Chunk, Const, FuncArgsInfo, Module, ModuleBuilder, Opcode};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Builtin natives, in registration order
pub const SUSPEND: u16 = 0;
pub const YIELD: u16 = 1;
pub const FAIL: u16 = 2;

/// Tiny assembler over `ModuleBuilder`
pub struct Asm {
    builder: ModuleBuilder,
    line: u32,
    init: bool,
}

impl Asm {
    pub fn new(name: &str) -> Self {
        Self {
            builder: ModuleBuilder::new(name),
            line: 1,
            init: false,
        }
    }

    pub fn line(&mut self, line: u32) -> &mut Self {
        self.line = line;
        self
    }

    /// Switch to writing the module init code
    pub fn init_code(&mut self) -> &mut Self {
        self.init = true;
        self
    }

    pub fn main_code(&mut self) -> &mut Self {
        self.init = false;
        self
    }

    pub fn gvars(&mut self, num: usize) -> &mut Self {
        self.builder.gvars(num);
        self
    }

    pub fn func(&mut self, name: &str, args: u8, returns: u8) -> u32 {
        self.builder.func(name, args, returns)
    }

    pub fn func_ip(&self, idx: u32) -> u32 {
        self.builder.func_ip(idx) as u32
    }

    fn chunk(&mut self) -> &mut Chunk {
        if self.init {
            self.builder.init_code()
        } else {
            self.builder.code()
        }
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        let line = self.line;
        self.chunk().write_op(op, line);
        self
    }

    fn op_u8(&mut self, op: Opcode, a: u8) -> &mut Self {
        let line = self.line;
        let chunk = self.chunk();
        chunk.write_op(op, line);
        chunk.write_u8(a, line);
        self
    }

    fn op_u16(&mut self, op: Opcode, a: u16) -> &mut Self {
        let line = self.line;
        let chunk = self.chunk();
        chunk.write_op(op, line);
        chunk.write_u16(a, line);
        self
    }

    pub fn num(&mut self, n: f64) -> &mut Self {
        let idx = self.builder.constant(Const::Num(n));
        self.op_u16(Opcode::Constant, idx)
    }

    pub fn boolean(&mut self, b: bool) -> &mut Self {
        let idx = self.builder.constant(Const::Bool(b));
        self.op_u16(Opcode::Constant, idx)
    }

    pub fn frame(&mut self, locals: u8, returns: u8) -> &mut Self {
        let line = self.line;
        let chunk = self.chunk();
        chunk.write_op(Opcode::Frame, line);
        chunk.write_u8(locals, line);
        chunk.write_u8(returns, line);
        self
    }

    pub fn get_var(&mut self, idx: u8) -> &mut Self {
        self.op_u8(Opcode::GetVar, idx)
    }

    pub fn set_var(&mut self, idx: u8) -> &mut Self {
        self.op_u8(Opcode::SetVar, idx)
    }

    pub fn get_gvar(&mut self, idx: u16) -> &mut Self {
        self.op_u16(Opcode::GetGVar, idx)
    }

    pub fn set_gvar(&mut self, idx: u16) -> &mut Self {
        self.op_u16(Opcode::SetGVar, idx)
    }

    /// Store a number into a global
    pub fn mark(&mut self, gvar: u16, n: f64) -> &mut Self {
        self.num(n).set_gvar(gvar)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Return)
    }

    pub fn call_local(&mut self, func_idx: u32, args: usize) -> &mut Self {
        let ip = self.func_ip(func_idx);
        let line = self.line;
        let chunk = self.chunk();
        chunk.write_op(Opcode::CallLocal, line);
        chunk.write_u24(ip, line);
        chunk.write_u32(FuncArgsInfo::with_args(args).bits(), line);
        self
    }

    pub fn call_native(&mut self, idx: u16, args: usize) -> &mut Self {
        let line = self.line;
        let chunk = self.chunk();
        chunk.write_op(Opcode::CallNative, line);
        chunk.write_u16(idx, line);
        chunk.write_u32(FuncArgsInfo::with_args(args).bits(), line);
        self
    }

    pub fn call_func_ptr(&mut self, args: usize) -> &mut Self {
        let line = self.line;
        let chunk = self.chunk();
        chunk.write_op(Opcode::CallFuncPtr, line);
        chunk.write_u32(FuncArgsInfo::with_args(args).bits(), line);
        self
    }

    pub fn func_ptr(&mut self, func_idx: u32) -> &mut Self {
        let line = self.line;
        let chunk = self.chunk();
        chunk.write_op(Opcode::GetFuncIpPtr, line);
        chunk.write_u24(func_idx, line);
        self
    }

    pub fn native_ptr(&mut self, idx: u16) -> &mut Self {
        self.op_u16(Opcode::GetFuncNativePtr, idx)
    }

    pub fn set_upval(&mut self, frame_local: u8, func_local: u8) -> &mut Self {
        let line = self.line;
        let chunk = self.chunk();
        chunk.write_op(Opcode::SetUpval, line);
        chunk.write_u8(frame_local, line);
        chunk.write_u8(func_local, line);
        self
    }

    pub fn new_list(&mut self, count: u8) -> &mut Self {
        self.op_u8(Opcode::NewList, count)
    }

    /// Emit a Scope/Defer/Paral/ParalAll block around `body`
    pub fn block(&mut self, op: Opcode, body: impl FnOnce(&mut Self)) -> &mut Self {
        let line = self.line;
        let offset = self.chunk().begin_block(op, line);
        body(self);
        self.chunk().end_block(offset);
        self
    }

    pub fn scope(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.block(Opcode::Scope, body)
    }

    pub fn defer(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.block(Opcode::Defer, body)
    }

    pub fn paral(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.block(Opcode::Paral, body)
    }

    pub fn paral_all(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.block(Opcode::ParalAll, body)
    }

    /// Forward jump, patched with `patch`
    pub fn jump(&mut self, op: Opcode) -> usize {
        let line = self.line;
        self.chunk().write_jump(op, line)
    }

    pub fn patch(&mut self, offset: usize) -> &mut Self {
        self.chunk().patch_jump(offset);
        self
    }

    pub fn offset(&mut self) -> usize {
        self.chunk().current_offset()
    }

    pub fn jump_back(&mut self, target: usize) -> &mut Self {
        let line = self.line;
        self.chunk().write_loop(target, line);
        self
    }

    pub fn build(self) -> Module {
        self.builder.build()
    }
}
