//! # User Interface Module
//!
//! The interface between the [`Debugger`](crate::debugger::Debugger) and whatever drives it.
//!
//! A front end implements [`DebuggerUI`]: it receives the [`Feedback`] of the last command and
//! returns the next command as a [`Status`]. Two front ends come with the crate, an interactive
//! prompt in [`cli`] and a JSON-lines interface in [`json`].

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{DebuggerError, Result};
use crate::feedback::Feedback;
use crate::{Addr, Word};

#[cfg(feature = "cli")]
pub mod cli;
pub mod json;

/// Where a breakpoint should go, as the user wrote it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakpointSpec {
    /// `*0x401136`
    Address(Addr),
    /// `12` or `main.c:12`
    Line { file: Option<String>, line: u64 },
    /// `main`
    Function(String),
    /// The number of an existing breakpoint, only meaningful for commands that act on one
    Id(usize),
}

impl BreakpointSpec {
    /// Parses the argument of a command that acts on an existing breakpoint
    ///
    /// Like [`BreakpointSpec::from_str`], except that a bare number is a breakpoint id and not a
    /// line.
    pub fn parse_existing(s: &str) -> Result<Self> {
        match s.parse::<usize>() {
            Ok(id) => Ok(BreakpointSpec::Id(id)),
            Err(_) => s.parse(),
        }
    }
}

impl FromStr for BreakpointSpec {
    type Err = DebuggerError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(DebuggerError::ParseCommand(
                "empty breakpoint location".to_string(),
            ));
        }
        if let Some(raw) = s.strip_prefix('*') {
            return Ok(BreakpointSpec::Address(parse_addr(raw)?));
        }
        if let Ok(line) = s.parse::<u64>() {
            return Ok(BreakpointSpec::Line { file: None, line });
        }
        if let Some((file, line)) = s.rsplit_once(':') {
            if let Ok(line) = line.parse::<u64>() {
                return Ok(BreakpointSpec::Line {
                    file: Some(file.to_string()),
                    line,
                });
            }
        }
        Ok(BreakpointSpec::Function(s.to_string()))
    }
}

impl Display for BreakpointSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointSpec::Address(addr) => write!(f, "*{addr}"),
            BreakpointSpec::Line { file: None, line } => write!(f, "{line}"),
            BreakpointSpec::Line {
                file: Some(file),
                line,
            } => write!(f, "{file}:{line}"),
            BreakpointSpec::Function(name) => write!(f, "{name}"),
            BreakpointSpec::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// Parses a hexadecimal address, with or without `0x`
pub fn parse_addr(raw: &str) -> Result<Addr> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    usize::from_str_radix(digits, 16)
        .map(Addr::from)
        .map_err(|e| DebuggerError::ParseCommand(format!("invalid address '{raw}': {e}")))
}

/// The commands a front end can give
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Start the program (again) with these arguments
    Run(Vec<String>),
    Continue,
    /// Step to the next source line
    StepLine,
    /// Execute a single instruction
    StepSingle,
    SetBreakpoint(BreakpointSpec),
    DelBreakpoint(BreakpointSpec),
    EnableBreakpoint(BreakpointSpec),
    DisableBreakpoint(BreakpointSpec),
    ListBreakpoints,
    Backtrace,
    PrintVariable(String),
    /// Show the current source line and this many lines around it
    PrintSource(u64),
    DumpRegisters,
    ReadMem(Addr, usize),
    WriteMem(Addr, Word),
    /// Disassemble this many bytes at the address, or at the program counter. The flag shows
    /// breakpoints as the `int3` bytes they are in memory.
    DisassembleAt(Option<Addr>, usize, bool),
    Kill,
    DebuggerQuit,
}

pub trait DebuggerUI {
    fn process(&mut self, feedback: Feedback) -> Result<Status>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_breakpoint_specs() {
        assert_eq!(
            "*0x401136".parse::<BreakpointSpec>().unwrap(),
            BreakpointSpec::Address(Addr::from(0x401136usize))
        );
        assert_eq!(
            "*401136".parse::<BreakpointSpec>().unwrap(),
            BreakpointSpec::Address(Addr::from(0x401136usize))
        );
        assert_eq!(
            "12".parse::<BreakpointSpec>().unwrap(),
            BreakpointSpec::Line {
                file: None,
                line: 12
            }
        );
        assert_eq!(
            "src/main.c:7".parse::<BreakpointSpec>().unwrap(),
            BreakpointSpec::Line {
                file: Some("src/main.c".to_string()),
                line: 7
            }
        );
        assert_eq!(
            "std::rt::lang_start".parse::<BreakpointSpec>().unwrap(),
            BreakpointSpec::Function("std::rt::lang_start".to_string())
        );
        assert!("*zz".parse::<BreakpointSpec>().is_err());
    }

    #[test]
    fn test_existing_breakpoint_by_id() {
        assert_eq!(
            BreakpointSpec::parse_existing("3").unwrap(),
            BreakpointSpec::Id(3)
        );
        assert_eq!(
            BreakpointSpec::parse_existing("main").unwrap(),
            BreakpointSpec::Function("main".to_string())
        );
    }

    #[test]
    fn test_status_json_round_trip() {
        let status = Status::SetBreakpoint(BreakpointSpec::Line {
            file: Some("main.c".to_string()),
            line: 3,
        });
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(serde_json::from_str::<Status>(&json).unwrap(), status);
    }
}
