//! # deet
//!
//! A debugger for x86_64 Linux programs that can step by source line, print the source line a
//! program stopped at and print the values of variables using the DWARF debug information of the
//! program.
//!
//! The library is split into two halves:
//!
//! - process control: [`inferior::Inferior`] drives a debuggee through the [`tracee::Tracee`]
//!   trait (implemented with ptrace by [`process::PtraceProcess`]) and keeps the
//!   [`breakpoint::BreakpointSet`] in sync with debuggee memory. [`step::StepController`] builds
//!   line stepping on top of single instruction steps.
//! - debug info queries: [`dbginfo::DwarfData`] holds the [`linetable::SourceLineTable`] and the
//!   [`scope::VariableScope`] trees of every function, and answers "which line is this address"
//!   and "what is the value of this variable". The call frame information of the program
//!   ([`unwind::CallFrameInfo`]) finds the canonical frame address and the caller of a frame.
//!
//! [`debugger::Debugger`] ties both together into a session that is driven by a
//! [`ui::DebuggerUI`].

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DebuggerError;

pub mod addr;
pub mod backtrace;
pub mod breakpoint;
pub mod config;
pub mod consts;
pub mod dbginfo;
pub mod debugger;
pub mod disassemble;
pub mod dwarf_parse;
pub mod errors;
pub mod feedback;
pub mod inferior;
pub mod linetable;
pub mod memorymap;
pub mod process;
pub mod scope;
pub mod source;
pub mod step;
pub mod tracee;
pub mod ui;
pub mod unwind;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use addr::Addr;
pub use errors::Result;

/// A machine word of the debuggee, as ptrace reads and writes them
pub type Word = i64;

/// Size of a [`Word`] in bytes
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

/// The registers the debugger reads from or reports about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum Register {
    rip,
    rbp,
    rsp,
}

impl Register {
    /// Maps a DWARF register number (x86_64 System V numbering) to a [`Register`]
    pub fn from_dwarf(register: gimli::Register) -> Option<Self> {
        match register.0 {
            6 => Some(Register::rbp),
            7 => Some(Register::rsp),
            16 => Some(Register::rip),
            _ => None,
        }
    }
}

impl Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl FromStr for Register {
    type Err = DebuggerError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "rip" | "pc" => Register::rip,
            "rbp" | "fp" => Register::rbp,
            "rsp" | "sp" => Register::rsp,
            other => return Err(DebuggerError::UnsupportedRegister(other.to_string())),
        })
    }
}

/// The registers of a stopped debuggee that the debugger works with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    /// Program counter (`rip`)
    pub pc: Addr,
    /// Frame pointer (`rbp`)
    pub frame_pointer: Addr,
    /// Stack pointer (`rsp`)
    pub stack_pointer: Addr,
}

impl RegisterSnapshot {
    pub fn get(&self, register: Register) -> Addr {
        match register {
            Register::rip => self.pc,
            Register::rbp => self.frame_pointer,
            Register::rsp => self.stack_pointer,
        }
    }
}

impl Display for RegisterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "rip  {}", self.pc)?;
        writeln!(f, "rbp  {}", self.frame_pointer)?;
        write!(f, "rsp  {}", self.stack_pointer)
    }
}
