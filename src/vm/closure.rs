// Strand Closures
// Refcounted function pointers with captured upvalues

use smallvec::SmallVec;
use std::rc::Rc;

use super::exec::EXIT_FRAME_IP;
use super::frame::Frame;
use super::heap::Heap;
use super::stack::ValueStack;
use super::value::{Refs, Value};
use crate::bytecode::{FuncArgsInfo, Module};
use crate::error::{Fault, FaultResult};

/// What a closure calls
#[derive(Debug, Clone, Default)]
pub enum FuncTarget {
    #[default]
    None,
    Script { module: Rc<Module>, ip: usize },
    Native(usize),
}

/// Captured value and the callee local slot it is restored into
#[derive(Debug, Clone)]
pub struct Upval {
    pub local_idx: usize,
    pub value: Value,
}

#[derive(Debug, Default)]
pub struct Closure {
    pub refs: Refs,
    pub target: FuncTarget,
    pub upvals: SmallVec<[Upval; 4]>,
}

impl Closure {
    pub fn is_native(&self) -> bool {
        matches!(self.target, FuncTarget::Native(_))
    }
}

/// Prepare `frame` for calling the closure `id` from `origin`.
///
/// Native targets never enter the dispatch loop, their frame points at the
/// exit ip right away. Script targets get their upvalues staged in the
/// callee locals right above `sp`, each copy retained.
pub fn init_frame(
    heap: &mut Heap,
    id: u32,
    frame: &mut Frame,
    origin: &Frame,
    stack: &mut ValueStack,
    args_info: FuncArgsInfo,
) -> FaultResult<()> {
    frame.args_info = args_info;

    let closure = heap.closure(id);
    let (module, ip) = match &closure.target {
        FuncTarget::Native(_) => {
            frame.init_with_origin(origin, EXIT_FRAME_IP);
            return Ok(());
        }
        FuncTarget::Script { module, ip } => (module.clone(), *ip),
        FuncTarget::None => return Err(Fault::NotCallable),
    };
    let upvals = closure.upvals.clone();

    frame.init_with_module(module, ip as i32);

    let args_num = args_info.count_args();
    if let Some(upval) = upvals.iter().find(|u| u.local_idx < args_num) {
        return Err(Fault::BadLocal(upval.local_idx));
    }
    for upval in upvals {
        heap.retain(&upval.value);
        stack.stage(upval.local_idx - args_num, upval.value);
    }
    Ok(())
}
