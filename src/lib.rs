// Strand Virtual Machine
// Execution core for compiled bytecode modules: fibers, regions, defers and parallel blocks

pub mod bytecode;
pub mod config;
pub mod error;
pub mod vm;

pub use config::VmConfig;
pub use error::{ErrorReport, Fault, StrandError, StrandResult, TraceFormat, TraceItem};
pub use vm::{Status, Value, Vm};
