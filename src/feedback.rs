//! # Feedback Module
//!
//! What the debugger tells its front end after each command.
//!
//! The [`Display`] implementation is the human readable rendering used by the
//! [`CliUi`](crate::ui::cli::CliUi). Machine readable front ends format the variants themselves,
//! see [`JsonUi::format_feedback`](crate::ui::json::JsonUi::format_feedback).

use std::fmt::Display;

use crate::backtrace::Backtrace;
use crate::breakpoint::Breakpoint;
use crate::disassemble::Disassembly;
use crate::errors::DebuggerError;
use crate::inferior::StopEvent;
use crate::linetable::SourceLocation;
use crate::value::Value;
use crate::{Addr, RegisterSnapshot, Word};

/// Bytes shown per line of a memory dump
const DUMP_WIDTH: usize = 16;

#[derive(Debug)]
pub enum Feedback {
    Ok,
    Text(String),
    /// The debuggee stopped (or ended), with where it is now if that is known
    Stopped {
        event: StopEvent,
        function: Option<String>,
        location: Option<SourceLocation>,
        /// text of the source line at `location`
        source: Option<String>,
    },
    Variable {
        name: String,
        value: Value,
    },
    /// Numbered source lines around `location`
    Source {
        location: SourceLocation,
        lines: Vec<(u64, String)>,
    },
    Registers(RegisterSnapshot),
    Memory {
        addr: Addr,
        bytes: Vec<u8>,
    },
    Word(Word),
    /// A breakpoint that was just set
    Breakpoint(Breakpoint),
    Breakpoints(Vec<Breakpoint>),
    Backtrace(Backtrace),
    Disassembly(Disassembly),
    Error(DebuggerError),
}

impl Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feedback::Ok => write!(f, "Ok")?,
            Feedback::Error(e) => write!(f, "Error: {e}")?,
            Feedback::Text(t) => write!(f, "{t}")?,
            Feedback::Stopped {
                event,
                function,
                location,
                source,
            } => {
                match event {
                    StopEvent::SteppedOne => (),
                    StopEvent::Exited(_) | StopEvent::Signaled(_) => return write!(f, "{event}"),
                    other => writeln!(f, "{other}")?,
                }
                match (function, location) {
                    (Some(func), Some(loc)) => write!(f, "Stopped at {func} ({loc})")?,
                    (None, Some(loc)) => write!(f, "Stopped at unknown func ({loc})")?,
                    (Some(func), None) => write!(f, "Stopped at {func} (source file not found)")?,
                    (None, None) => write!(f, "Stopped at unknown func (source file not found)")?,
                }
                if let (Some(loc), Some(text)) = (location, source) {
                    write!(f, "\n{}\t{text}", loc.line)?;
                }
            }
            Feedback::Variable { name, value } => write!(f, "{name} = {value}")?,
            Feedback::Source { location, lines } => {
                for (idx, (number, text)) in lines.iter().enumerate() {
                    if idx > 0 {
                        writeln!(f)?;
                    }
                    let marker = if *number == location.line { "=>" } else { "  " };
                    write!(f, "{marker} {number:<5}{text}")?;
                }
            }
            Feedback::Registers(regs) => write!(f, "{regs}")?,
            Feedback::Memory { addr, bytes } => {
                for (idx, chunk) in bytes.chunks(DUMP_WIDTH).enumerate() {
                    if idx > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}:", *addr + idx * DUMP_WIDTH)?;
                    for byte in chunk {
                        write!(f, " {byte:02x}")?;
                    }
                }
            }
            Feedback::Word(w) => write!(f, "Word: {w:#018x}")?,
            Feedback::Breakpoint(bp) => write!(f, "Set breakpoint {} at {}", bp.id(), bp.addr())?,
            Feedback::Breakpoints(bps) => {
                if bps.is_empty() {
                    write!(f, "No breakpoints")?;
                }
                for (idx, bp) in bps.iter().enumerate() {
                    if idx > 0 {
                        writeln!(f)?;
                    }
                    write!(
                        f,
                        "{:<4}{} {}",
                        bp.id(),
                        bp.addr(),
                        if bp.enabled() { "enabled" } else { "disabled" }
                    )?;
                }
            }
            Feedback::Backtrace(bt) => write!(f, "{}", bt.to_string().trim_end())?,
            Feedback::Disassembly(d) => write!(f, "{}", d.to_string().trim_end())?,
        }

        Ok(())
    }
}

impl From<Result<Feedback, DebuggerError>> for Feedback {
    fn from(value: Result<Feedback, DebuggerError>) -> Self {
        match value {
            Ok(f) => f,
            Err(e) => Feedback::Error(e),
        }
    }
}
