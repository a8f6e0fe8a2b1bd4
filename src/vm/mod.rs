// Strand Virtual Machine Module
// Stack-based bytecode execution with cooperative fibers

pub mod closure;
pub mod coroutine;
pub mod defer;
pub mod exec;
pub mod fiber;
pub mod frame;
pub mod heap;
pub mod interner;
pub mod natives;
pub mod paral;
pub mod pool;
pub mod stack;
pub mod task;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;

pub use coroutine::{Coroutine, CoroutineKind, CoroutinePool, Status};
pub use exec::{ExecState, EXIT_FRAME_IP, STOP_IP};
pub use fiber::FiberId;
pub use natives::{NativeFn, Natives};
pub use task::{FiberTask, Task, TaskManager};
pub use value::{Value, ValueKind};
pub use vm::{FiberResult, Runtime, Vm, VmPoolStats};
