// Strand Parallel Blocks
// Branches of a paral block run on their own exec state, ticked in turn

use smallvec::SmallVec;
use std::mem;

use super::coroutine::{Coroutine, Status};
use super::defer::{self, DeferBlock};
use super::exec::{ExecState, EXIT_FRAME_IP};
use super::vm::Runtime;
use crate::error::{Fault, FaultResult};

/// One scope block of a paral.
///
/// Frame 0 of the nested exec is a copy of the enclosing frame, its locals
/// keep living on the enclosing stack.
#[derive(Debug)]
pub struct Branch {
    min_ip: i32,
    max_ip: i32,
    pub(crate) exec: Box<ExecState>,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            min_ip: 0,
            max_ip: 0,
            exec: Box::new(ExecState::with_capacity(32, 32, 128)),
        }
    }
}

impl Branch {
    pub fn min_ip(&self) -> i32 {
        self.min_ip
    }

    pub fn max_ip(&self) -> i32 {
        self.max_ip
    }

    pub(crate) fn init(&mut self, ext: &ExecState, min_ip: i32, max_ip: i32) -> FaultResult<()> {
        self.min_ip = min_ip;
        self.max_ip = max_ip;

        let mut frame = ext.frames.last().cloned().ok_or(Fault::NoCode)?;
        frame.region_mark = 0;
        self.exec.frames.push(frame);
        self.exec.push_region(0, min_ip, max_ip);
        self.exec.ip = min_ip;
        Ok(())
    }

    pub(crate) fn tick(&mut self, rt: &mut Runtime, ext: &mut ExecState) -> FaultResult<Status> {
        self.exec.execute(rt, 0)?;

        let status = self.exec.status;
        if status == Status::Success {
            // jump and return targets pass through as is
            ext.ip = if self.exec.ip > self.min_ip && self.exec.ip < self.max_ip {
                self.max_ip + 1
            } else {
                self.exec.ip
            };
        }
        Ok(status)
    }

    pub(crate) fn cleanup(&mut self, rt: &mut Runtime, ext: &mut ExecState) -> FaultResult<()> {
        let exec = &mut *self.exec;
        if let Some(coro) = exec.coroutine.take() {
            rt.release_coroutine(coro, exec)?;
        }

        let returns = exec.frames.first().map(|f| f.return_vars_num).unwrap_or(0);
        exec.unwind(rt, 1)?;

        {
            let mut stack = exec.stack.borrow_mut();
            if exec.ip == EXIT_FRAME_IP && returns > 0 {
                // a return inside the branch hands its values to the enclosing frame
                let start = stack.sp().checked_sub(returns).ok_or(Fault::StackUnderflow)?;
                let mut ext_stack = ext.stack.borrow_mut();
                for idx in start..stack.sp() {
                    ext_stack.push(stack.take(idx)?);
                }
                stack.truncate(start);
            }
            rt.heap.release_stack(&mut stack);
        }

        exec.regions.clear();
        exec.status = Status::None;
        exec.ip = 0;
        Ok(())
    }
}

/// Shared state of Paral and ParalAll
#[derive(Debug, Default)]
pub struct ParalBlock {
    min_ip: i32,
    max_ip: i32,
    /// Branch currently being ticked
    i: usize,
    branches: Vec<Box<Coroutine>>,
    defers: SmallVec<[DeferBlock; 2]>,
}

impl ParalBlock {
    pub fn min_ip(&self) -> i32 {
        self.min_ip
    }

    pub fn max_ip(&self) -> i32 {
        self.max_ip
    }

    pub(crate) fn init(&mut self, min_ip: i32, max_ip: i32) {
        self.min_ip = min_ip;
        self.max_ip = max_ip;
        self.i = 0;
    }

    pub(crate) fn attach(&mut self, branch: Box<Coroutine>) {
        self.branches.push(branch);
    }

    pub(crate) fn add_defer(&mut self, defer: DeferBlock) {
        self.defers.push(defer);
    }

    pub fn branches(&self) -> impl Iterator<Item = &Coroutine> {
        self.branches.iter().map(|b| &**b)
    }

    pub fn current(&self) -> Option<&Coroutine> {
        self.branches.get(self.i).map(|b| &**b)
    }

    fn leave_block(&self, ext: &mut ExecState) {
        // a branch finishing inside the block continues after it
        if ext.ip >= self.min_ip && ext.ip <= self.max_ip {
            ext.ip = self.max_ip + 1;
        }
    }

    /// Tick every branch, the first one reaching a terminal status decides
    pub(crate) fn tick_race(&mut self, rt: &mut Runtime, ext: &mut ExecState) -> FaultResult<Status> {
        ext.ip = self.min_ip;

        self.i = 0;
        while self.i < self.branches.len() {
            let status = self.branches[self.i].tick(rt, ext)?;
            if status != Status::Running {
                let branch = self.branches.remove(self.i);
                rt.release_coroutine(branch, ext)?;
                self.leave_block(ext);
                return Ok(status);
            }
            self.i += 1;
        }

        if self.branches.is_empty() {
            self.leave_block(ext);
            return Ok(Status::Success);
        }
        Ok(Status::Running)
    }

    /// Tick every branch, done once all succeed or one fails
    pub(crate) fn tick_all(&mut self, rt: &mut Runtime, ext: &mut ExecState) -> FaultResult<Status> {
        ext.ip = self.min_ip;

        self.i = 0;
        while self.i < self.branches.len() {
            let status = self.branches[self.i].tick(rt, ext)?;

            // jumped out of the block, the rest is cancelled on cleanup
            if ext.ip < self.min_ip - 1 || ext.ip > self.max_ip + 1 {
                let branch = self.branches.remove(self.i);
                rt.release_coroutine(branch, ext)?;
                return Ok(Status::Success);
            }

            match status {
                Status::Success => {
                    let branch = self.branches.remove(self.i);
                    rt.release_coroutine(branch, ext)?;
                }
                Status::Failure => {
                    let branch = self.branches.remove(self.i);
                    rt.release_coroutine(branch, ext)?;
                    return Ok(Status::Failure);
                }
                _ => self.i += 1,
            }
        }

        if !self.branches.is_empty() {
            return Ok(Status::Running);
        }
        self.leave_block(ext);
        Ok(Status::Success)
    }

    pub(crate) fn cleanup(&mut self, rt: &mut Runtime, ext: &mut ExecState) -> FaultResult<()> {
        for branch in mem::take(&mut self.branches) {
            rt.release_coroutine(branch, ext)?;
        }
        self.i = 0;

        let defers = mem::take(&mut self.defers);
        defer::exit_scope(&defers, ext, rt)
    }
}
