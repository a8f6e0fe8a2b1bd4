// Strand Deferred Blocks

use std::fmt;

use super::coroutine::Status;
use super::exec::ExecState;
use super::vm::Runtime;
use crate::error::{Fault, FaultResult};

/// Bytecode range run when its owning scope exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferBlock {
    pub ip: i32,
    pub max_ip: i32,
}

impl DeferBlock {
    pub fn new(ip: i32, max_ip: i32) -> Self {
        Self { ip, max_ip }
    }

    /// Run the block to completion inside a nested region of `exec`.
    ///
    /// The block must finish with SUCCESS within this call, a block that
    /// suspends or fails is a fault. The caller's ip is restored.
    pub fn execute(&self, exec: &mut ExecState, rt: &mut Runtime) -> FaultResult<()> {
        let ip_orig = exec.ip;
        exec.ip = self.ip;

        let frame_idx = exec.frames.len().checked_sub(1).ok_or(Fault::NoCode)?;
        exec.push_region(frame_idx, self.ip, self.max_ip);
        let stop = exec.regions.len() - 1;
        exec.execute(rt, stop)?;
        if exec.status != Status::Success {
            return Err(Fault::DeferStatus(exec.status));
        }

        exec.ip = ip_orig;
        Ok(())
    }
}

impl fmt::Display for DeferBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Defer block: {} {}", self.ip, self.max_ip)
    }
}

/// Run `defers` last registered first.
///
/// The active coroutine is detached meanwhile and the exec status is kept,
/// so unwinding after a failure still reports the failure.
pub fn exit_scope(defers: &[DeferBlock], exec: &mut ExecState, rt: &mut Runtime) -> FaultResult<()> {
    if defers.is_empty() {
        return Ok(());
    }

    let coroutine = exec.coroutine.take();
    let status = exec.status;

    let mut result = Ok(());
    for defer in defers.iter().rev() {
        if let Err(e) = defer.execute(exec, rt) {
            result = Err(e);
            break;
        }
    }

    // left behind by a block which did not complete
    if let Some(stray) = exec.coroutine.take() {
        let released = rt.release_coroutine(stray, exec);
        if result.is_ok() {
            result = released;
        }
    }

    exec.coroutine = coroutine;
    exec.status = status;
    result
}
