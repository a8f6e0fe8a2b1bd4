// Strand Fibers
// One cooperative thread of script execution

use std::rc::Rc;

use super::coroutine::Status;
use super::exec::ExecState;
use super::frame::Frame;
use super::value::Value;
use super::vm::Runtime;
use crate::bytecode::{FuncArgsInfo, FuncSymbol, Module};
use crate::config::VmConfig;
use crate::error::FaultResult;

pub type FiberId = u32;

#[derive(Debug)]
pub struct Fiber {
    id: FiberId,
    pub(crate) exec: ExecState,
    tick: u64,
    status: Status,
}

impl Fiber {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            id: 0,
            exec: ExecState::from_config(config),
            tick: 0,
            status: Status::None,
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Ticks done so far
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Prepare a call to `func`, taking ownership of `args`
    pub(crate) fn attach(
        &mut self,
        id: FiberId,
        module: Rc<Module>,
        func: &FuncSymbol,
        args: Vec<Value>,
        max_depth: usize,
    ) -> FaultResult<()> {
        self.id = id;
        self.tick = 0;
        self.status = Status::None;
        enter_func(&mut self.exec, module, func, args, max_depth)
    }

    /// Run until the fiber yields or finishes, returns the resulting status
    pub(crate) fn tick(&mut self, rt: &mut Runtime) -> FaultResult<Status> {
        self.tick += 1;
        self.exec.execute(rt, 0)?;
        self.status = self.exec.status;
        Ok(self.status)
    }

    /// Hand over whatever the entry function returned
    pub(crate) fn take_results(&mut self) -> Vec<Value> {
        self.exec.stack.borrow_mut().drain()
    }

    pub(crate) fn teardown(&mut self, rt: &mut Runtime) -> FaultResult<()> {
        self.exec.reset(rt)
    }
}

/// Push `args`, the entry frame and its region onto `exec`
pub(crate) fn enter_func(
    exec: &mut ExecState,
    module: Rc<Module>,
    func: &FuncSymbol,
    args: Vec<Value>,
    max_depth: usize,
) -> FaultResult<()> {
    let mut frame = Frame::default();
    frame.init_with_module(module, func.ip as i32);
    frame.args_info = FuncArgsInfo::with_args(args.len());

    {
        let mut stack = exec.stack.borrow_mut();
        for arg in args {
            stack.push(arg);
        }
    }
    let idx = exec.push_frame(frame, max_depth)?;
    exec.push_frame_region(idx);
    Ok(())
}
