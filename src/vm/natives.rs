// Strand Native Functions
// Provides: suspend, yield, fail

use rustc_hash::FxHashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use super::coroutine::{Coroutine, CoroutineKind, Status};
use super::exec::ExecState;
use super::interner::intern;
use super::vm::Runtime;
use crate::bytecode::FuncArgsInfo;
use crate::error::{Fault, FaultResult};

/// Native callback. Returning a coroutine parks the caller on it until the
/// coroutine leaves RUNNING.
pub type NativeFn =
    Rc<dyn Fn(&mut Runtime, &mut ExecState, FuncArgsInfo) -> FaultResult<Option<Box<Coroutine>>>>;

#[derive(Clone)]
pub struct NativeFunc {
    pub name: Arc<str>,
    pub returns: u8,
    pub cb: NativeFn,
}

impl fmt::Debug for NativeFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunc")
            .field("name", &self.name)
            .field("returns", &self.returns)
            .finish()
    }
}

/// Natives addressed by index from bytecode, by name from the host
#[derive(Debug, Default)]
pub struct Natives {
    funcs: Vec<NativeFunc>,
    index: FxHashMap<Arc<str>, usize>,
}

impl Natives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut natives = Self::new();
        natives.register("suspend", 0, native_suspend);
        natives.register("yield", 0, native_yield);
        natives.register("fail", 0, native_fail);
        natives
    }

    /// Register or replace `name`, returns its index
    pub fn register<F>(&mut self, name: &str, returns: u8, cb: F) -> u16
    where
        F: Fn(&mut Runtime, &mut ExecState, FuncArgsInfo) -> FaultResult<Option<Box<Coroutine>>> + 'static,
    {
        let func = NativeFunc {
            name: intern(name),
            returns,
            cb: Rc::new(cb),
        };
        if let Some(&idx) = self.index.get(name) {
            self.funcs[idx] = func;
            return idx as u16;
        }
        self.index.insert(func.name.clone(), self.funcs.len());
        self.funcs.push(func);
        (self.funcs.len() - 1) as u16
    }

    pub fn get(&self, idx: usize) -> FaultResult<&NativeFunc> {
        self.funcs
            .get(idx)
            .ok_or_else(|| Fault::NativeNotFound(format!("#{}", idx)))
    }

    pub fn find(&self, name: &str) -> FaultResult<u16> {
        self.index
            .get(name)
            .map(|&idx| idx as u16)
            .ok_or_else(|| Fault::NativeNotFound(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

fn native_suspend(rt: &mut Runtime, _exec: &mut ExecState, _args: FuncArgsInfo) -> FaultResult<Option<Box<Coroutine>>> {
    Ok(Some(rt.coroutines.acquire(CoroutineKind::Suspend)))
}

fn native_yield(rt: &mut Runtime, _exec: &mut ExecState, _args: FuncArgsInfo) -> FaultResult<Option<Box<Coroutine>>> {
    Ok(Some(rt.coroutines.acquire(CoroutineKind::Yield)))
}

fn native_fail(_rt: &mut Runtime, exec: &mut ExecState, _args: FuncArgsInfo) -> FaultResult<Option<Box<Coroutine>>> {
    exec.status = Status::Failure;
    Ok(None)
}
