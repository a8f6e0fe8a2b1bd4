// Strand Error Handling Module
// Runtime faults, captured stack traces and flat error reports

use colored::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::vm::coroutine::Status;

/// Messages longer than this are shown as a head/tail excerpt
pub const MESSAGE_MAX_LEN: usize = 200;
const MESSAGE_EXCERPT_LEN: usize = 100;

/// How a captured trace is rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    #[default]
    Compact,
    Verbose,
}

/// One active call in a captured trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceItem {
    pub file: Arc<str>,
    pub func: Arc<str>,
    pub line: u32,
    pub ip: i32,
}

impl TraceItem {
    pub fn new(file: impl Into<Arc<str>>, func: impl Into<Arc<str>>, line: u32, ip: i32) -> Self {
        Self {
            file: file.into(),
            func: func.into(),
            line,
            ip,
        }
    }

    pub fn render(&self, format: TraceFormat) -> String {
        match format {
            TraceFormat::Compact => format!("at {}(..) in {}:{}", self.func, self.file, self.line),
            TraceFormat::Verbose => format!(
                "at {}(..) +{} in {}:{}",
                self.func, self.ip, self.file, self.line
            ),
        }
    }
}

impl fmt::Display for TraceItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(TraceFormat::Compact))
    }
}

/// Render a trace, innermost call first, one line per item
pub fn render_trace(trace: &[TraceItem], format: TraceFormat) -> String {
    let mut out = String::new();
    for item in trace {
        out.push_str(&item.render(format));
        out.push('\n');
    }
    out
}

/// Cause of an aborted execution
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("Defer execution invalid status: {0}")]
    DeferStatus(Status),
    #[error("Nested region left in status {0}, synchronous completion required")]
    RegionStatus(Status),
    #[error("Not expected to be running: {0}")]
    StillRunning(String),
    #[error("Bad status: {0}")]
    BadStatus(Status),
    #[error("Invalid opcode {opcode} at ip {ip}")]
    BadOpcode { opcode: u8, ip: i32 },
    #[error("Bytecode ended unexpectedly at ip {0}")]
    Truncated(i32),
    #[error("Frame has no bytecode to execute")]
    NoCode,
    #[error("Not supported block type: {0}")]
    BadBlock(String),
    #[error("Stack underflow")]
    StackUnderflow,
    #[error("Stack overflow: call depth limit {0} exceeded")]
    StackOverflow(usize),
    #[error("Invalid constant index: {0}")]
    BadConstant(usize),
    #[error("Invalid global variable index: {0}")]
    BadGlobal(usize),
    #[error("Invalid local variable index: {0}")]
    BadLocal(usize),
    #[error("No such function: {0}")]
    FuncNotFound(String),
    #[error("No such native function: {0}")]
    NativeNotFound(String),
    #[error("No such module: {0}")]
    ModuleNotFound(String),
    #[error("No such fiber: {0}")]
    FiberNotFound(u32),
    #[error("Value is not callable")]
    NotCallable,
    #[error("Type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: &'static str, found: String },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Native(String),
}

pub type FaultResult<T> = Result<T, Fault>;

/// A fault together with the trace captured where it happened
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{cause}")]
pub struct StrandError {
    pub cause: Fault,
    pub trace: Vec<TraceItem>,
}

impl StrandError {
    pub fn new(cause: Fault, trace: Vec<TraceItem>) -> Self {
        Self { cause, trace }
    }

    pub fn trace_string(&self, format: TraceFormat) -> String {
        render_trace(&self.trace, format)
    }

    /// Flat report anchored at the innermost trace item
    pub fn report(&self, format: TraceFormat) -> ErrorReport {
        let (file, line) = match self.trace.first() {
            Some(item) => (item.file.to_string(), item.line),
            None => (String::new(), 0),
        };
        ErrorReport::new(self.cause.to_string(), file, line, 1).with_stack_trace(self.trace_string(format))
    }

    /// Format the error for terminal display
    pub fn format(&self, format: TraceFormat) -> String {
        let mut output = String::new();

        let header = match self.trace.first() {
            Some(item) => format!(
                "{}: {} at {}:{}",
                "RuntimeError".red().bold(),
                self.cause.to_string().white().bold(),
                item.file,
                item.line
            ),
            None => format!("{}: {}", "RuntimeError".red().bold(), self.cause.to_string().white().bold()),
        };
        output.push_str(&header);
        output.push('\n');

        if !self.trace.is_empty() {
            output.push_str(&format!("\n{}:\n", "Stack trace".yellow().bold()));
            for item in &self.trace {
                output.push_str(&format!("  {}\n", item.render(format)));
            }
        }

        output
    }
}

impl From<Fault> for StrandError {
    fn from(cause: Fault) -> Self {
        Self::new(cause, Vec::new())
    }
}

pub type StrandResult<T> = Result<T, StrandError>;

/// Structured error exported to tooling as a flat JSON object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub stack_trace: String,
}

impl ErrorReport {
    pub fn new(error: impl Into<String>, file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            error: error.into(),
            file: file.into(),
            line,
            column,
            stack_trace: String::new(),
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = trace.into();
        self
    }

    /// Human readable one-liner, long messages are excerpted
    pub fn message(&self) -> String {
        make_message(&self.file, self.line, self.column, &self.error)
    }

    pub fn to_json(&self) -> String {
        let safe = ErrorReport {
            error: make_json_safe(&self.error),
            file: self.file.replace('\\', "/"),
            line: self.line,
            column: self.column,
            stack_trace: make_json_safe(&self.stack_trace),
        };
        // plain strings and integers always serialize
        serde_json::to_string(&safe).unwrap_or_default()
    }
}

/// Neutralize backslashes and line breaks so the value stays on one line
pub fn make_json_safe(msg: &str) -> String {
    msg.replace('\\', " ").replace('\n', " ").replace('\r', " ")
}

pub fn make_message(file: &str, line: u32, column: u32, msg: &str) -> String {
    format!("{}@({},{}) : {}", file, line, column, excerpt(msg))
}

fn excerpt(msg: &str) -> String {
    let len = msg.chars().count();
    if len <= MESSAGE_MAX_LEN {
        return msg.to_string();
    }
    let head: String = msg.chars().take(MESSAGE_EXCERPT_LEN).collect();
    let tail: String = msg.chars().skip(len - MESSAGE_EXCERPT_LEN).collect();
    format!("{}...{}", head, tail)
}

/// Show the offending source line with a marker under the column
pub fn show_error_place(source: &str, line: u32, column: u32) -> String {
    let lines: Vec<&str> = source.split('\n').collect();
    let idx = line as usize;
    if idx > 0 && idx <= lines.len() {
        let mut hint = lines[idx - 1].replace('\t', "    ");
        hint.push('\n');
        hint.push_str(&"-".repeat(column as usize));
        hint.push('^');
        hint
    } else {
        format!("??? @({}:{})", line, column)
    }
}
