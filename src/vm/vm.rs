// Strand Virtual Machine
// Loads modules, runs functions synchronously or as fibers ticked by the host

use rustc_hash::FxHashMap;
use serde::Serialize;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::coroutine::{Coroutine, CoroutinePool, Status};
use super::exec::ExecState;
use super::fiber::{enter_func, Fiber, FiberId};
use super::frame::Frame;
use super::heap::{Heap, HeapStats};
use super::natives::Natives;
use super::pool::{Pool, PoolStats};
use super::value::Value;
use crate::bytecode::{FuncArgsInfo, FuncSymbol, Module};
use crate::config::VmConfig;
use crate::error::{Fault, FaultResult, StrandError, StrandResult, TraceItem};

/// Everything bytecode can reach while it runs
#[derive(Debug, Default)]
pub struct Runtime {
    pub heap: Heap,
    pub coroutines: CoroutinePool,
    pub natives: Natives,
    /// Global variables per module name
    pub globals: FxHashMap<Arc<str>, Vec<Value>>,
    pub config: VmConfig,
}

impl Runtime {
    pub fn new(config: VmConfig) -> Self {
        Self {
            natives: Natives::with_builtins(),
            config,
            ..Self::default()
        }
    }

    /// Clean up `coro` and put it back into its pool
    pub fn release_coroutine(&mut self, mut coro: Box<Coroutine>, ext: &mut ExecState) -> FaultResult<()> {
        coro.cleanup(self, ext)?;
        self.coroutines.release(coro);
        Ok(())
    }
}

/// Outcome of a finished fiber
#[derive(Debug, Clone, PartialEq)]
pub struct FiberResult {
    pub status: Status,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VmPoolStats {
    pub heap: HeapStats,
    pub coroutines: PoolStats,
    pub fibers: PoolStats,
    pub executors: PoolStats,
}

#[derive(Debug)]
pub struct Vm {
    rt: Runtime,
    modules: Vec<Rc<Module>>,
    /// Running fibers in start order
    fibers: Vec<Fiber>,
    fiber_pool: Pool<Fiber>,
    executors: Pool<ExecState>,
    results: FxHashMap<FiberId, FiberResult>,
    next_fiber_id: FiberId,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            rt: Runtime::new(config),
            modules: Vec::new(),
            fibers: Vec::new(),
            fiber_pool: Pool::new(),
            executors: Pool::new(),
            results: FxHashMap::default(),
            next_fiber_id: 0,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.rt.config
    }

    pub fn heap(&self) -> &Heap {
        &self.rt.heap
    }

    pub fn coroutines(&self) -> &CoroutinePool {
        &self.rt.coroutines
    }

    pub fn natives_mut(&mut self) -> &mut Natives {
        &mut self.rt.natives
    }

    pub fn globals(&self, module: &str) -> Option<&[Value]> {
        self.rt.globals.get(module).map(|g| g.as_slice())
    }

    /// Drop a reference handed out by the VM
    pub fn release(&mut self, value: &mut Value) {
        self.rt.heap.release(value);
    }

    /// Make `module` callable and run its init code
    pub fn load_module(&mut self, module: Module) -> StrandResult<Rc<Module>> {
        let module = Rc::new(module);

        let globals = vec![Value::nil(); module.gvars_num];
        if let Some(mut old) = self.rt.globals.insert(module.name.clone(), globals) {
            for value in old.iter_mut() {
                self.rt.heap.release(value);
            }
        }
        self.modules.retain(|m| m.name != module.name);
        self.modules.push(module.clone());

        if !module.init_code.is_empty() {
            let mut exec = self.acquire_executor();
            let mut frame = Frame::default();
            frame.init_for_module_init(module.clone(), 0);
            let outcome = exec
                .push_frame(frame, self.rt.config.max_call_depth)
                .map(|idx| exec.push_frame_region(idx));
            let result = match outcome {
                Ok(()) => self.run_sync(&mut exec, "module init"),
                Err(cause) => Err(StrandError::from(cause)),
            };
            let result = result.and_then(|mut values| {
                for value in values.iter_mut() {
                    self.rt.heap.release(value);
                }
                Ok(())
            });
            self.release_executor(exec, result)?;
        }

        debug!(module = %module.name, funcs = module.funcs().len(), "module loaded");
        Ok(module)
    }

    /// Lookup `func` or `module.func` across loaded modules, latest first
    pub fn find_func(&self, name: &str) -> FaultResult<(Rc<Module>, FuncSymbol)> {
        let (module_name, func_name) = match name.split_once('.') {
            Some((m, f)) => (Some(m), f),
            None => (None, name),
        };
        for module in self.modules.iter().rev() {
            if module_name.is_some_and(|m| m != module.name.as_ref()) {
                continue;
            }
            if let Some(symbol) = module.func(func_name) {
                return Ok((module.clone(), symbol.clone()));
            }
        }
        Err(Fault::FuncNotFound(name.to_string()))
    }

    /// Run `func` to completion and return its results.
    ///
    /// A function left waiting on a coroutine is an error, so is a FAILURE.
    pub fn execute(&mut self, func: &str, args: Vec<Value>) -> StrandResult<Vec<Value>> {
        let (module, symbol) = self.find_func(func)?;

        let mut exec = self.acquire_executor();
        let result = match enter_func(&mut exec, module, &symbol, args, self.rt.config.max_call_depth) {
            Ok(()) => self.run_sync(&mut exec, func),
            Err(cause) => Err(StrandError::from(cause)),
        };
        self.release_executor(exec, result)
    }

    fn run_sync(&mut self, exec: &mut ExecState, name: &str) -> StrandResult<Vec<Value>> {
        if let Err(cause) = exec.execute(&mut self.rt, 0) {
            return Err(StrandError::new(cause, exec.stack_trace()));
        }
        match exec.status {
            Status::Success => Ok(exec.stack.borrow_mut().drain()),
            Status::Running => Err(StrandError::new(
                Fault::StillRunning(name.to_string()),
                exec.stack_trace(),
            )),
            status => Err(StrandError::new(Fault::BadStatus(status), exec.stack_trace())),
        }
    }

    fn acquire_executor(&mut self) -> ExecState {
        let config = &self.rt.config;
        self.executors.acquire_with(|| ExecState::from_config(config))
    }

    fn release_executor<T>(&mut self, mut exec: ExecState, result: StrandResult<T>) -> StrandResult<T> {
        let teardown = exec.reset(&mut self.rt);
        self.executors.release(exec);
        let value = result?;
        teardown?;
        Ok(value)
    }

    /// Start `func` as a new fiber, it runs on the next tick
    pub fn start(&mut self, func: &str, args: Vec<Value>) -> StrandResult<FiberId> {
        let (module, symbol) = self.find_func(func)?;

        let config = &self.rt.config;
        let mut fiber = self.fiber_pool.acquire_with(|| Fiber::new(config));
        self.next_fiber_id += 1;
        let id = self.next_fiber_id;

        if let Err(cause) = fiber.attach(id, module, &symbol, args, self.rt.config.max_call_depth) {
            let teardown = fiber.teardown(&mut self.rt);
            self.fiber_pool.release(fiber);
            teardown?;
            return Err(cause.into());
        }

        debug!(fiber = id, func, "fiber started");
        self.fibers.push(fiber);
        Ok(id)
    }

    pub fn is_running(&self, id: FiberId) -> bool {
        self.fibers.iter().any(|f| f.id() == id)
    }

    pub fn fibers_count(&self) -> usize {
        self.fibers.len()
    }

    /// Tick one fiber, returns true while it keeps running.
    ///
    /// A finished fiber leaves its results behind for `take_result`. A fiber
    /// which faults is torn down and the fault is returned with its trace.
    pub fn tick_fiber(&mut self, id: FiberId) -> StrandResult<bool> {
        let pos = self
            .fibers
            .iter()
            .position(|f| f.id() == id)
            .ok_or(Fault::FiberNotFound(id))?;

        let fiber = &mut self.fibers[pos];
        match fiber.tick(&mut self.rt) {
            Ok(Status::Running) => Ok(true),
            Ok(status) => {
                let mut fiber = self.fibers.remove(pos);
                let values = if status == Status::Success {
                    fiber.take_results()
                } else {
                    Vec::new()
                };
                debug!(fiber = id, %status, ticks = fiber.ticks(), "fiber finished");
                self.results.insert(id, FiberResult { status, values });
                self.recycle(fiber)?;
                Ok(false)
            }
            Err(cause) => {
                let error = StrandError::new(cause, fiber.exec.stack_trace());
                warn!(fiber = id, error = %error, "fiber failed");
                let fiber = self.fibers.remove(pos);
                self.recycle(fiber)?;
                Err(error)
            }
        }
    }

    /// Tick every fiber in start order, returns how many are still running
    pub fn tick(&mut self) -> StrandResult<usize> {
        let ids: Vec<FiberId> = self.fibers.iter().map(|f| f.id()).collect();
        for id in ids {
            self.tick_fiber(id)?;
        }
        Ok(self.fibers.len())
    }

    /// Tear the fiber down right away, pending defers still run
    pub fn stop(&mut self, id: FiberId) -> StrandResult<()> {
        let pos = self
            .fibers
            .iter()
            .position(|f| f.id() == id)
            .ok_or(Fault::FiberNotFound(id))?;
        let fiber = self.fibers.remove(pos);
        debug!(fiber = id, "fiber stopped");
        self.recycle(fiber)
    }

    /// Stop every fiber, latest started first
    pub fn stop_all(&mut self) -> StrandResult<()> {
        let mut result = Ok(());
        while let Some(fiber) = self.fibers.pop() {
            let id = fiber.id();
            if let Err(e) = self.recycle(fiber) {
                warn!(fiber = id, error = %e, "fiber stop failed");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn recycle(&mut self, mut fiber: Fiber) -> StrandResult<()> {
        let teardown = fiber.teardown(&mut self.rt);
        self.fiber_pool.release(fiber);
        teardown?;
        Ok(())
    }

    pub fn take_result(&mut self, id: FiberId) -> Option<FiberResult> {
        self.results.remove(&id)
    }

    /// Trace of a running fiber, innermost call first
    pub fn fiber_trace(&self, id: FiberId) -> Option<Vec<TraceItem>> {
        self.fibers
            .iter()
            .find(|f| f.id() == id)
            .map(|f| f.exec.stack_trace())
    }

    /// Coroutine tree of a running fiber
    pub fn dump_fiber(&self, id: FiberId) -> Option<String> {
        let fiber = self.fibers.iter().find(|f| f.id() == id)?;
        Some(fiber.exec.coroutine.as_ref().map(|c| c.dump()).unwrap_or_default())
    }

    pub fn pool_stats(&self) -> VmPoolStats {
        let coroutines = &self.rt.coroutines;
        let (miss, busy) = (coroutines.miss(), coroutines.busy());
        VmPoolStats {
            heap: self.rt.heap.stats(),
            coroutines: PoolStats {
                hits: coroutines.hits(),
                miss,
                idle: miss - busy,
                busy,
            },
            fibers: self.fiber_pool.stats(),
            executors: self.executors.stats(),
        }
    }

    /// Register a native callable from bytecode, returns its index
    pub fn register_native<F>(&mut self, name: &str, returns: u8, cb: F) -> u16
    where
        F: Fn(&mut Runtime, &mut ExecState, FuncArgsInfo) -> FaultResult<Option<Box<Coroutine>>> + 'static,
    {
        self.rt.natives.register(name, returns, cb)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        if let Err(e) = self.stop_all() {
            warn!(error = %e, "fibers left in a bad state");
        }
    }
}
