// Strand Call Frames

use std::rc::Rc;

use super::heap::Heap;
use super::stack::{StackRef, ValueStack};
use crate::bytecode::{Chunk, FuncArgsInfo, Module, Segment};
use crate::error::{Fault, FaultResult};

/// One function activation
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub module: Option<Rc<Module>>,
    pub segment: Segment,
    pub start_ip: i32,
    pub return_ip: i32,
    /// Index of the first region owned by this frame, -1 before the call
    pub region_mark: i32,
    pub args_info: FuncArgsInfo,
    /// Stack hosting the locals window, set on frame entry
    pub locals: Option<StackRef>,
    pub locals_offset: usize,
    pub locals_vars_num: usize,
    pub return_vars_num: usize,
}

impl Frame {
    pub fn init_with_module(&mut self, module: Rc<Module>, start_ip: i32) {
        self.init(Some(module), Segment::Main, start_ip);
    }

    /// Runs the module's static initializer code
    pub fn init_for_module_init(&mut self, module: Rc<Module>, start_ip: i32) {
        self.init(Some(module), Segment::Init, start_ip);
    }

    /// Same code context as `origin`, used for native transitions
    pub fn init_with_origin(&mut self, origin: &Frame, start_ip: i32) {
        self.init(origin.module.clone(), origin.segment, start_ip);
    }

    fn init(&mut self, module: Option<Rc<Module>>, segment: Segment, start_ip: i32) {
        self.module = module;
        self.segment = segment;
        self.start_ip = start_ip;
        self.return_ip = -1;
        self.region_mark = -1;
        self.locals = None;
        self.locals_offset = 0;
        self.locals_vars_num = 0;
        self.return_vars_num = 0;
    }

    pub fn chunk(&self) -> Option<&Chunk> {
        self.module.as_ref().map(|m| m.chunk(self.segment))
    }

    /// Release every handle inside the locals window and nothing past it
    pub fn clean_locals(&mut self, heap: &mut Heap) {
        let Some(locals) = self.locals.take() else {
            return;
        };
        let mut stack = locals.borrow_mut();
        for idx in self.locals_offset..self.locals_offset + self.locals_vars_num {
            if let Ok(value) = stack.get_mut(idx) {
                heap.release(value);
            }
        }
    }

    /// Move the returned values from the top of `stack` down to
    /// `locals_offset` and retract `sp` right past them.
    ///
    /// Slots left behind are cleared, not released, their references
    /// were already consumed.
    pub fn return_vars(&self, stack: &mut ValueStack) -> FaultResult<()> {
        let ret = self.return_vars_num;
        let src = stack
            .sp()
            .checked_sub(ret)
            .filter(|src| *src >= self.locals_offset)
            .ok_or(Fault::StackUnderflow)?;

        for i in 0..ret {
            if src + i != self.locals_offset + i {
                let value = stack.take(src + i)?;
                stack.replace(self.locals_offset + i, value)?;
            }
        }
        stack.truncate(self.locals_offset + ret);
        Ok(())
    }
}
