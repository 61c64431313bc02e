//! # Errors Module
//!
//! The error type shared by the whole debugger.
//!
//! Errors are grouped by how the session reacts to them:
//!
//! - launch failures end the `run` command but not the session
//! - address and memory errors reject a single operation
//! - malformed debug info disables the affected queries
//! - query failures (no line info, unknown variable, missing source file) are reported and the
//!   session goes on
//!
//! Exits and deaths by signal are not errors, they are [`StopEvent`](crate::inferior::StopEvent)s.

use std::path::PathBuf;

use thiserror::Error;

use crate::addr::Addr;

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, DebuggerError>;

#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Executable does not exist: {0}")]
    ExecutableDoesNotExist(String),
    #[error("Executable is not a file: {0}")]
    ExecutableIsNotAFile(String),
    #[error("Could not launch the debuggee: {0}")]
    Launch(String),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),
    #[error("Tried to do something that requires a running debuggee, but none is running")]
    NoDebuggee,
    #[error("The debuggee has already terminated")]
    ProcessExited,
    #[error("Address {0} is not inside mapped executable memory")]
    InvalidAddress(Addr),
    #[error("Could not access debuggee memory at {0}")]
    AccessError(Addr),
    #[error("Malformed debug info: {0}")]
    MalformedDebugInfo(String),
    #[error("Error while reading DWARF data: {0}")]
    Gimli(#[from] gimli::Error),
    #[error("Error while parsing the executable: {0}")]
    Object(#[from] object::Error),
    #[error("Can not unwind the frame at {pc}: {reason}")]
    Unwind { pc: Addr, reason: String },
    #[error("No line information for {0}")]
    NoLineInfo(Addr),
    #[error("No variable named '{0}' is in scope")]
    VariableNotFound(String),
    #[error("Location expression of '{name}' is not supported: {form}")]
    UnsupportedLocationExpr { name: String, form: String },
    #[error("Could not read the value of '{name}' at {addr}")]
    ReadError { name: String, addr: Addr },
    #[error("Source file is unavailable: {}", .0.display())]
    SourceFileUnavailable(PathBuf),
    #[error("Source file {} has no line {line}", .file.display())]
    NoSuchSourceLine { file: PathBuf, line: u64 },
    #[error("No function named '{0}' in the debug info")]
    UnknownFunction(String),
    #[error("No code is associated with line {0}")]
    UnknownLine(u64),
    #[error("No breakpoint at {0}")]
    NoBreakpoint(Addr),
    #[error("No breakpoint number {0}")]
    UnknownBreakpointId(usize),
    #[error("waitpid returned a status the debugger does not handle: {0}")]
    UnexpectedWaitStatus(String),
    #[error("Unsupported register: {0}")]
    UnsupportedRegister(String),
    #[error("Could not parse command: {0}")]
    ParseCommand(String),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "cli")]
    #[error("Could not read user input: {0}")]
    Dialoguer(#[from] dialoguer::Error),
}
