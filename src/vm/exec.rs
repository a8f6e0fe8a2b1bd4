// Strand Execution State
// Value stack, call frames and the region stack, stepped by one non-recursive loop

use smallvec::SmallVec;
use std::mem;
use tracing::trace;

use super::closure::{self, FuncTarget};
use super::coroutine::{Coroutine, CoroutineKind, Status};
use super::defer::{self, DeferBlock};
use super::frame::Frame;
use super::interner::intern;
use super::stack::{StackRef, ValueStack};
use super::value::Value;
use super::vm::Runtime;
use crate::bytecode::{Chunk, FuncArgsInfo, Opcode, Segment};
use crate::config::VmConfig;
use crate::error::{Fault, FaultResult, TraceItem};

/// Upper bound of a function region, no real ip ever reaches it
pub const STOP_IP: i32 = i32::MAX - 2;
/// Setting ip to this value makes the loop exit the current frame
pub const EXIT_FRAME_IP: i32 = STOP_IP - 1;

/// Contiguous ip range executed within one frame
#[derive(Debug, Clone, Default)]
pub struct Region {
    pub frame_idx: usize,
    pub min_ip: i32,
    pub max_ip: i32,
    pub defers: SmallVec<[DeferBlock; 2]>,
}

#[derive(Debug)]
pub struct ExecState {
    pub status: Status,
    pub ip: i32,
    /// Active coroutine, ticked before anything else
    pub coroutine: Option<Box<Coroutine>>,
    pub regions: Vec<Region>,
    pub frames: Vec<Frame>,
    pub stack: StackRef,
}

impl Default for ExecState {
    fn default() -> Self {
        Self::with_capacity(32, 16, 32)
    }
}

impl ExecState {
    pub fn with_capacity(regions: usize, frames: usize, stack: usize) -> Self {
        Self {
            status: Status::None,
            ip: 0,
            coroutine: None,
            regions: Vec::with_capacity(regions),
            frames: Vec::with_capacity(frames),
            stack: ValueStack::new_ref(stack),
        }
    }

    pub fn from_config(config: &VmConfig) -> Self {
        Self::with_capacity(
            config.regions_capacity,
            config.frames_capacity,
            config.stack_capacity,
        )
    }

    pub fn push_frame(&mut self, frame: Frame, max_depth: usize) -> FaultResult<usize> {
        if self.frames.len() >= max_depth {
            return Err(Fault::StackOverflow(max_depth));
        }
        self.frames.push(frame);
        Ok(self.frames.len() - 1)
    }

    pub fn push_region(&mut self, frame_idx: usize, min_ip: i32, max_ip: i32) {
        trace!(frame_idx, min_ip, max_ip, "region pushed");
        self.regions.push(Region {
            frame_idx,
            min_ip,
            max_ip,
            defers: SmallVec::new(),
        });
    }

    /// Enter the frame at `frame_idx` from outside of any bytecode call
    pub fn push_frame_region(&mut self, frame_idx: usize) {
        let mark = self.regions.len() as i32;
        let frame = &mut self.frames[frame_idx];
        frame.region_mark = mark;
        self.ip = frame.start_ip;
        self.push_region(frame_idx, -1, STOP_IP);
    }

    fn call_frame(&mut self, frame_idx: usize, ip: &mut i32) {
        let mark = self.regions.len() as i32;
        let frame = &mut self.frames[frame_idx];
        frame.return_ip = *ip;
        frame.region_mark = mark;
        let start_ip = frame.start_ip;
        self.push_region(frame_idx, -1, STOP_IP);
        // the loop advances ip right after dispatch
        *ip = start_ip - 1;
    }

    /// Step until the region stack shrinks to `region_stop` or the status
    /// stops being SUCCESS
    pub fn execute(&mut self, rt: &mut Runtime, region_stop: usize) -> FaultResult<()> {
        self.status = Status::Success;
        while self.regions.len() > region_stop && self.status == Status::Success {
            self.execute_once(rt)?;
        }
        Ok(())
    }

    pub fn execute_once(&mut self, rt: &mut Runtime) -> FaultResult<()> {
        if self.coroutine.is_some() {
            return self.execute_coroutine(rt);
        }

        let region_idx = match self.regions.len().checked_sub(1) {
            Some(idx) => idx,
            None => return Ok(()),
        };
        let region = &self.regions[region_idx];
        let frame_idx = region.frame_idx;

        if self.ip < region.min_ip || self.ip > region.max_ip {
            self.exit_region_scope(rt, region_idx)?;
            self.regions.pop();
            trace!(region_idx, ip = self.ip, "region popped");
            return Ok(());
        }

        if self.ip == EXIT_FRAME_IP {
            return self.exit_frame(rt);
        }

        self.dispatch(rt, frame_idx, region_idx)?;
        self.ip += 1;
        Ok(())
    }

    fn execute_coroutine(&mut self, rt: &mut Runtime) -> FaultResult<()> {
        self.status = Status::Success;
        // coroutines resume past the opcode which created them
        self.ip += 1;

        let Some(mut coro) = self.coroutine.take() else {
            return Ok(());
        };
        let status = match coro.tick(rt, self) {
            Ok(status) => status,
            Err(e) => {
                // left in place so the trace can walk through it
                self.coroutine = Some(coro);
                return Err(e);
            }
        };
        self.status = status;

        match status {
            Status::Running => {
                self.ip -= 1;
                self.coroutine = Some(coro);
            }
            Status::Failure => {
                rt.release_coroutine(coro, self)?;
                self.ip = EXIT_FRAME_IP - 1;
                if let Some(region_idx) = self.regions.len().checked_sub(1) {
                    self.exit_region_scope(rt, region_idx)?;
                    self.regions.pop();
                }
            }
            Status::Success => rt.release_coroutine(coro, self)?,
            Status::None => {
                rt.release_coroutine(coro, self)?;
                return Err(Fault::BadStatus(status));
            }
        }
        Ok(())
    }

    fn exit_frame(&mut self, rt: &mut Runtime) -> FaultResult<()> {
        let frame_idx = self.frames.len().checked_sub(1).ok_or(Fault::NoCode)?;
        self.exit_frame_regions(rt, frame_idx)?;

        let Some(mut frame) = self.frames.pop() else {
            return Err(Fault::NoCode);
        };
        frame.clean_locals(&mut rt.heap);
        frame.return_vars(&mut self.stack.borrow_mut())?;
        self.ip = frame.return_ip + 1;
        Ok(())
    }

    /// Run the defers of every region owned by the frame and drop those regions
    fn exit_frame_regions(&mut self, rt: &mut Runtime, frame_idx: usize) -> FaultResult<()> {
        let mark = usize::try_from(self.frames[frame_idx].region_mark)
            .unwrap_or(0)
            .min(self.regions.len());
        for region_idx in (mark..self.regions.len()).rev() {
            self.exit_region_scope(rt, region_idx)?;
        }
        self.regions.truncate(mark);
        Ok(())
    }

    pub(crate) fn exit_region_scope(&mut self, rt: &mut Runtime, region_idx: usize) -> FaultResult<()> {
        if self.regions[region_idx].defers.is_empty() {
            return Ok(());
        }
        let defers = mem::take(&mut self.regions[region_idx].defers);
        defer::exit_scope(&defers, self, rt)
    }

    /// Tear down everything still active: the coroutine, pending defers and
    /// every frame's locals
    pub fn exit_frames(&mut self, rt: &mut Runtime) -> FaultResult<()> {
        if let Some(coro) = self.coroutine.take() {
            rt.release_coroutine(coro, self)?;
        }
        self.unwind(rt, 0)?;
        self.regions.clear();
        Ok(())
    }

    /// Tear down and drop every remaining value so the state can be reused
    pub fn reset(&mut self, rt: &mut Runtime) -> FaultResult<()> {
        let result = self.exit_frames(rt);
        rt.heap.release_stack(&mut self.stack.borrow_mut());
        self.frames.clear();
        self.regions.clear();
        self.status = Status::None;
        self.ip = 0;
        result
    }

    /// Pop frames, cleaning the locals of those at or above `keep`
    pub(crate) fn unwind(&mut self, rt: &mut Runtime, keep: usize) -> FaultResult<()> {
        while let Some(frame_idx) = self.frames.len().checked_sub(1) {
            self.exit_frame_regions(rt, frame_idx)?;
            if let Some(mut frame) = self.frames.pop() {
                if frame_idx >= keep {
                    frame.clean_locals(&mut rt.heap);
                }
            }
        }
        Ok(())
    }

    fn local(&self, frame_idx: usize, idx: usize) -> FaultResult<Value> {
        let frame = &self.frames[frame_idx];
        if idx >= frame.locals_vars_num {
            return Err(Fault::BadLocal(idx));
        }
        let locals = frame.locals.as_ref().ok_or(Fault::BadLocal(idx))?;
        let value = locals.borrow().get(frame.locals_offset + idx)?.clone();
        Ok(value)
    }

    fn set_local(&self, frame_idx: usize, idx: usize, value: Value) -> FaultResult<Value> {
        let frame = &self.frames[frame_idx];
        if idx >= frame.locals_vars_num {
            return Err(Fault::BadLocal(idx));
        }
        let locals = frame.locals.as_ref().ok_or(Fault::BadLocal(idx))?;
        let old = locals.borrow_mut().replace(frame.locals_offset + idx, value)?;
        Ok(old)
    }

    fn dispatch(&mut self, rt: &mut Runtime, frame_idx: usize, region_idx: usize) -> FaultResult<()> {
        let frame = &self.frames[frame_idx];
        let module = frame.module.clone().ok_or(Fault::NoCode)?;
        let chunk = module.chunk(frame.segment);
        let mut ip = self.ip;

        let opcode = chunk.opcode_at(ip)?;
        match opcode {
            Opcode::Nop => {}

            Opcode::Constant => {
                let idx = chunk.decode16(&mut ip)? as usize;
                let constant = module.constants.get(idx).ok_or(Fault::BadConstant(idx))?;
                self.stack.borrow_mut().push(constant.to_value());
            }

            Opcode::Pop => {
                let mut value = self.stack.borrow_mut().pop()?;
                rt.heap.release(&mut value);
            }

            Opcode::GetVar => {
                let idx = chunk.decode8(&mut ip)? as usize;
                let value = self.local(frame_idx, idx)?;
                rt.heap.retain(&value);
                self.stack.borrow_mut().push(value);
            }

            Opcode::SetVar => {
                let idx = chunk.decode8(&mut ip)? as usize;
                let mut value = self.stack.borrow_mut().pop()?;
                match self.set_local(frame_idx, idx, value.clone()) {
                    Ok(mut old) => rt.heap.release(&mut old),
                    Err(e) => {
                        rt.heap.release(&mut value);
                        return Err(e);
                    }
                }
            }

            Opcode::GetGVar => {
                let idx = chunk.decode16(&mut ip)? as usize;
                let globals = rt
                    .globals
                    .get(&module.name)
                    .ok_or_else(|| Fault::ModuleNotFound(module.name.to_string()))?;
                let value = globals.get(idx).ok_or(Fault::BadGlobal(idx))?.clone();
                rt.heap.retain(&value);
                self.stack.borrow_mut().push(value);
            }

            Opcode::SetGVar => {
                let idx = chunk.decode16(&mut ip)? as usize;
                let value = self.stack.borrow_mut().pop()?;
                let globals = rt
                    .globals
                    .get_mut(&module.name)
                    .ok_or_else(|| Fault::ModuleNotFound(module.name.to_string()))?;
                let slot = globals.get_mut(idx).ok_or(Fault::BadGlobal(idx))?;
                let mut old = mem::replace(slot, value);
                rt.heap.release(&mut old);
            }

            Opcode::Add => self.binary_number_op(rt, |a, b| Value::num(a + b))?,
            Opcode::Sub => self.binary_number_op(rt, |a, b| Value::num(a - b))?,
            Opcode::Lt => self.binary_number_op(rt, |a, b| Value::bool(a < b))?,

            Opcode::Jump => {
                let offset = chunk.decode16(&mut ip)? as i16;
                ip += offset as i32;
            }

            Opcode::JumpZ => {
                let offset = chunk.decode16(&mut ip)? as i32;
                let mut cond = self.stack.borrow_mut().pop()?;
                let truthy = cond.as_bool();
                rt.heap.release(&mut cond);
                if !truthy? {
                    ip += offset;
                }
            }

            Opcode::Frame => {
                let locals_vars_num = chunk.decode8(&mut ip)? as usize;
                let return_vars_num = chunk.decode8(&mut ip)? as usize;

                let stack_ref = self.stack.clone();
                let mut stack = self.stack.borrow_mut();
                let frame = &mut self.frames[frame_idx];
                let args_num = frame.args_info.count_args();
                frame.locals_offset = stack.sp().checked_sub(args_num).ok_or(Fault::StackUnderflow)?;
                frame.locals_vars_num = locals_vars_num;
                frame.return_vars_num = return_vars_num;
                frame.locals = Some(stack_ref);
                if locals_vars_num > args_num {
                    stack.reserve(locals_vars_num - args_num);
                }
            }

            Opcode::Return => {
                ip = EXIT_FRAME_IP - 1;
            }

            Opcode::CallLocal => {
                let func_ip = chunk.decode24(&mut ip)? as i32;
                let args_info = FuncArgsInfo::from_bits(chunk.decode32(&mut ip)?);

                let mut frame = Frame::default();
                frame.init_with_origin(&self.frames[frame_idx], func_ip);
                frame.args_info = args_info;
                let new_idx = self.push_frame(frame, rt.config.max_call_depth)?;
                self.call_frame(new_idx, &mut ip);
            }

            Opcode::CallNative => {
                let native_idx = chunk.decode16(&mut ip)? as usize;
                let args_info = FuncArgsInfo::from_bits(chunk.decode32(&mut ip)?);
                self.ip = ip;
                let suspended = self.call_native(rt, native_idx, args_info)?;
                ip = if suspended { self.ip - 1 } else { self.ip };
            }

            Opcode::CallFuncPtr => {
                let args_info = FuncArgsInfo::from_bits(chunk.decode32(&mut ip)?);
                let mut ptr = self.stack.borrow_mut().pop()?;
                let id = match ptr.as_closure() {
                    Ok(id) => id,
                    Err(e) => {
                        rt.heap.release(&mut ptr);
                        return Err(e);
                    }
                };

                let result = self.call_closure(rt, frame_idx, id, args_info, &mut ip);
                rt.heap.release(&mut ptr);
                result?;
            }

            Opcode::GetFuncIpPtr => {
                let func_idx = chunk.decode24(&mut ip)? as usize;
                let symbol = module
                    .func_at(func_idx)
                    .ok_or_else(|| Fault::FuncNotFound(format!("#{}", func_idx)))?;
                let ptr = rt.heap.new_closure(FuncTarget::Script {
                    module: module.clone(),
                    ip: symbol.ip,
                });
                self.stack.borrow_mut().push(ptr);
            }

            Opcode::GetFuncNativePtr => {
                let native_idx = chunk.decode16(&mut ip)? as usize;
                rt.natives.get(native_idx)?;
                let ptr = rt.heap.new_closure(FuncTarget::Native(native_idx));
                self.stack.borrow_mut().push(ptr);
            }

            Opcode::SetUpval => {
                let frame_local_idx = chunk.decode8(&mut ip)? as usize;
                let func_local_idx = chunk.decode8(&mut ip)? as usize;
                let id = self.stack.borrow().peek()?.as_closure()?;
                let value = self.local(frame_idx, frame_local_idx)?;
                rt.heap.retain(&value);
                rt.heap.push_upval(id, func_local_idx, value);
            }

            Opcode::NewList => {
                let count = chunk.decode8(&mut ip)? as usize;
                let mut stack = self.stack.borrow_mut();
                let start = stack.sp().checked_sub(count).ok_or(Fault::StackUnderflow)?;
                let mut items = Vec::with_capacity(count);
                for idx in start..stack.sp() {
                    items.push(stack.take(idx)?);
                }
                stack.truncate(start);
                stack.push(rt.heap.new_list(items));
            }

            Opcode::Scope => {
                let size = chunk.decode16(&mut ip)? as i32;
                self.push_region(frame_idx, ip + 1, ip + size);
            }

            Opcode::Defer => {
                let size = chunk.decode16(&mut ip)? as i32;
                self.regions[region_idx]
                    .defers
                    .push(DeferBlock::new(ip + 1, ip + size));
                ip += size;
            }

            Opcode::Paral | Opcode::ParalAll => {
                let size = chunk.decode16(&mut ip)? as i32;
                let kind = if opcode == Opcode::Paral {
                    CoroutineKind::Paral
                } else {
                    CoroutineKind::ParalAll
                };
                let mut paral = rt.coroutines.acquire(kind);
                if let Err(e) = self.fetch_blocks(rt, chunk, &mut paral, ip, size) {
                    rt.release_coroutine(paral, self)?;
                    return Err(e);
                }
                self.coroutine = Some(paral);
                // re-entered through the coroutine path which steps ip forward
                ip -= 1;
            }
        }

        self.ip = ip;
        Ok(())
    }

    fn binary_number_op(&mut self, rt: &mut Runtime, op: fn(f64, f64) -> Value) -> FaultResult<()> {
        let mut stack = self.stack.borrow_mut();
        let mut b = stack.pop()?;
        let mut a = stack.pop()?;
        let result = a.as_num().and_then(|a| b.as_num().map(|b| op(a, b)));
        rt.heap.release(&mut a);
        rt.heap.release(&mut b);
        stack.push(result?);
        Ok(())
    }

    /// Returns true when the native left the fiber waiting on a coroutine or
    /// changed its status, ip must then stay on the call
    /// Call through the closure `id`, the caller keeps its pointer reference
    fn call_closure(
        &mut self,
        rt: &mut Runtime,
        frame_idx: usize,
        id: u32,
        args_info: FuncArgsInfo,
        ip: &mut i32,
    ) -> FaultResult<()> {
        let native = match rt.heap.closure(id).target {
            FuncTarget::Native(native_idx) => Some(native_idx),
            _ => None,
        };
        if let Some(native_idx) = native {
            self.ip = *ip;
            let suspended = self.call_native(rt, native_idx, args_info)?;
            *ip = if suspended { self.ip - 1 } else { self.ip };
            return Ok(());
        }

        // staged upvalues live above sp, nothing unwinds them
        let max_depth = rt.config.max_call_depth;
        if self.frames.len() >= max_depth {
            return Err(Fault::StackOverflow(max_depth));
        }
        let mut frame = Frame::default();
        closure::init_frame(
            &mut rt.heap,
            id,
            &mut frame,
            &self.frames[frame_idx],
            &mut self.stack.borrow_mut(),
            args_info,
        )?;
        let new_idx = self.push_frame(frame, max_depth)?;
        self.call_frame(new_idx, ip);
        Ok(())
    }

    fn call_native(&mut self, rt: &mut Runtime, native_idx: usize, args_info: FuncArgsInfo) -> FaultResult<bool> {
        let cb = rt.natives.get(native_idx)?.cb.clone();
        match cb(rt, self, args_info)? {
            Some(coro) => {
                self.coroutine = Some(coro);
                Ok(true)
            }
            None => Ok(self.status != Status::Success),
        }
    }

    /// Collect the child blocks of a Paral/ParalAll spanning `ip + 1 ..= ip + size`
    fn fetch_blocks(
        &self,
        rt: &mut Runtime,
        chunk: &Chunk,
        parent: &mut Coroutine,
        ip: i32,
        size: i32,
    ) -> FaultResult<()> {
        parent.init_block(ip + 1, ip + size);

        let end = ip + size;
        let mut tmp = ip;
        while tmp < end {
            tmp += 1;
            let opcode = chunk.opcode_at(tmp)?;
            let child_size = chunk.decode16(&mut tmp)? as i32;
            match opcode {
                Opcode::Scope => {
                    let mut branch = rt.coroutines.acquire(CoroutineKind::Branch);
                    branch.init_branch(self, tmp + 1, tmp + child_size)?;
                    parent.attach(branch)?;
                }
                Opcode::Paral | Opcode::ParalAll => {
                    let kind = if opcode == Opcode::Paral {
                        CoroutineKind::Paral
                    } else {
                        CoroutineKind::ParalAll
                    };
                    let mut nested = rt.coroutines.acquire(kind);
                    self.fetch_blocks(rt, chunk, &mut nested, tmp, child_size)?;
                    parent.attach(nested)?;
                }
                Opcode::Defer => parent.add_defer(DeferBlock::new(tmp + 1, tmp + child_size))?,
                other => return Err(Fault::BadBlock(other.to_string())),
            }
            tmp += child_size;
        }
        Ok(())
    }

    /// Snapshot of the active calls, innermost first.
    ///
    /// Descends into the active coroutine so calls made inside parallel
    /// branches are part of the trace.
    pub fn stack_trace(&self) -> Vec<TraceItem> {
        let mut calls: Vec<&Frame> = Vec::new();
        let mut deepest_ip = self.ip;
        collect_calls(self, 0, &mut calls, &mut deepest_ip);

        let mut trace = Vec::with_capacity(calls.len());
        for (i, frame) in calls.iter().enumerate() {
            // a caller is positioned where its callee will return to
            let ip = match calls.get(i + 1) {
                Some(callee) => callee.return_ip,
                None => deepest_ip,
            };
            trace.push(trace_item(frame, ip));
        }
        trace.reverse();
        trace
    }
}

fn collect_calls<'a>(exec: &'a ExecState, skip: usize, calls: &mut Vec<&'a Frame>, deepest_ip: &mut i32) {
    calls.extend(exec.frames.iter().skip(skip));
    *deepest_ip = exec.ip;
    if let Some(coro) = exec.coroutine.as_deref() {
        collect_coroutine_calls(coro, calls, deepest_ip);
    }
}

fn collect_coroutine_calls<'a>(coro: &'a Coroutine, calls: &mut Vec<&'a Frame>, deepest_ip: &mut i32) {
    match coro {
        // frame 0 of a branch is a copy of the enclosing frame
        Coroutine::Branch(branch) => collect_calls(&branch.exec, 1, calls, deepest_ip),
        Coroutine::Paral(paral) | Coroutine::ParalAll(paral) => {
            if let Some(current) = paral.current() {
                collect_coroutine_calls(current, calls, deepest_ip);
            }
        }
        Coroutine::Suspend | Coroutine::Yield { .. } => {}
    }
}

fn trace_item(frame: &Frame, ip: i32) -> TraceItem {
    let Some(module) = frame.module.as_ref() else {
        return TraceItem::new(intern("?"), intern("?"), 0, ip);
    };
    let func = if frame.segment == Segment::Init {
        intern("$init")
    } else {
        module
            .map_ip_to_func(frame.start_ip)
            .map(|symbol| symbol.name.clone())
            .unwrap_or_else(|| intern("?"))
    };
    let line = frame.chunk().map_or(0, |chunk| chunk.line_at(ip));
    TraceItem::new(module.file.clone(), func, line, ip)
}
