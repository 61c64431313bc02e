//! # Backtrace Module
//!
//! Walks the call stack of a stopped debuggee with the call frame information of the executable.
//!
//! The unwind row of each frame gives its canonical frame address and where the return address
//! and the caller's `rbp` were saved, which yields the registers of the caller. This works at any
//! instruction, including the prologue and epilogue of a function, and for code that does not
//! keep a frame pointer. The walk stops at the first frame without unwind information.

use std::fmt::Display;

use serde::Serialize;
use tracing::{debug, warn};

use crate::dbginfo::DwarfData;
use crate::errors::Result;
use crate::linetable::SourceLocation;
use crate::scope::MemoryAccess;
use crate::{Addr, RegisterSnapshot};

/// Upper bound for the walk, in case the stack is corrupted into a loop
const MAX_FRAMES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BacktraceFrame {
    /// runtime address of the frame: the program counter for the innermost frame, the return
    /// address for all others
    pub addr: Addr,
    pub function: Option<String>,
    pub location: Option<SourceLocation>,
}

impl Display for BacktraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.function {
            Some(name) => write!(f, "{name}")?,
            None => write!(f, "unknown func")?,
        }
        match &self.location {
            Some(location) => write!(f, " ({location})"),
            None => write!(f, " (source file not found)"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Backtrace {
    pub frames: Vec<BacktraceFrame>,
}

impl Backtrace {
    /// Walks the stack starting at the registers of the innermost frame
    ///
    /// The walk ends after `main`, after a frame outside of any known function, at a frame without
    /// unwind information, or when a saved register can not be read. A failure to unwind is
    /// logged and ends the walk, the frames found so far are returned.
    pub fn capture<M: MemoryAccess>(
        dwarf: &DwarfData,
        regs: &RegisterSnapshot,
        load_bias: Addr,
        mem: &mut M,
    ) -> Result<Self> {
        let mut frames = Vec::new();
        let mut regs = *regs;

        while frames.len() < MAX_FRAMES {
            // a return address points behind the call, its line and unwind row are the ones of
            // the call
            let lookup = if frames.is_empty() {
                regs.pc.unrelocate(load_bias)
            } else {
                regs.pc.unrelocate(load_bias) - 1
            };
            let function = dwarf.function_at(lookup);
            let frame = BacktraceFrame {
                addr: regs.pc,
                function: function.map(|f| f.display_name()),
                location: dwarf.location_at(lookup),
            };
            debug!("frame #{}: {frame}", frames.len());
            frames.push(frame);

            match function {
                Some(f) if f.name() != "main" => (),
                _ => break,
            }

            let row = match dwarf.unwind_row(lookup) {
                Ok(Some(row)) => row,
                Ok(None) => {
                    warn!("no unwind information for {}", regs.pc);
                    break;
                }
                Err(e) => {
                    warn!("could not read the unwind information for {}: {e}", regs.pc);
                    break;
                }
            };
            let caller = match row.caller(&regs, mem) {
                Ok(Some(caller)) => caller,
                Ok(None) => break,
                Err(e) => {
                    warn!("could not unwind the frame at {}: {e}", regs.pc);
                    break;
                }
            };
            // the stack grows down, a caller frame is always above its callee
            if caller.pc == Addr::NULL || caller.stack_pointer <= regs.stack_pointer {
                warn!("stack looks corrupted above {}", regs.pc);
                break;
            }
            regs = caller;
        }

        Ok(Self { frames })
    }

    pub fn frames(&self) -> &[BacktraceFrame] {
        &self.frames
    }
}

impl Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, frame) in self.frames.iter().enumerate() {
            writeln!(f, "#{idx} {} {frame}", frame.addr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::inferior::{Inferior, StopEvent};
    use crate::testing::{
        sample_dwarf, SimulatedProcess, HELPER, HELPER_BODY, HELPER_END, MAIN, MAIN_AFTER_CALL,
        MAIN_END,
    };
    use crate::unwind::CallFrameInfo;

    fn stopped_at(addr: Addr) -> Inferior<SimulatedProcess> {
        let mut inferior = Inferior::from_tracee(SimulatedProcess::sample());
        inferior.add_breakpoint(addr).unwrap();
        assert_eq!(
            inferior.continue_execution().unwrap(),
            StopEvent::BreakpointHit(addr)
        );
        inferior
    }

    fn names(bt: &Backtrace) -> Vec<String> {
        bt.frames()
            .iter()
            .map(|f| f.function.clone().unwrap())
            .collect()
    }

    #[test]
    fn test_backtrace_in_main_is_one_frame() {
        let dwarf = sample_dwarf();
        let mut inferior = Inferior::from_tracee(SimulatedProcess::sample());
        let regs = inferior.registers().unwrap();
        let bt = Backtrace::capture(&dwarf, &regs, Addr::NULL, &mut inferior).unwrap();
        assert_eq!(bt.frames().len(), 1);
        assert_eq!(bt.frames()[0].addr, MAIN);
        assert_eq!(bt.frames()[0].function.as_deref(), Some("main"));
        assert_eq!(bt.frames()[0].location.as_ref().unwrap().line, 1);
    }

    #[test]
    fn test_backtrace_at_callee_entry() {
        let dwarf = sample_dwarf();
        let mut inferior = stopped_at(HELPER);
        let regs = inferior.registers().unwrap();
        let bt = Backtrace::capture(&dwarf, &regs, Addr::NULL, &mut inferior).unwrap();
        assert_eq!(names(&bt), vec!["helper", "main"]);
        assert_eq!(bt.frames()[1].addr, MAIN_AFTER_CALL);
        // the caller frame reports the line of the call
        assert_eq!(bt.frames()[1].location.as_ref().unwrap().line, 3);

        let text = bt.to_string();
        assert!(text.starts_with("#0 0x0000000000401020 helper (main.c:10)"));
        assert!(text.contains("#1 0x0000000000401017 main (main.c:3)"));
    }

    #[test]
    fn test_backtrace_at_every_instruction_of_the_callee() {
        let dwarf = sample_dwarf();
        let mut inferior = stopped_at(HELPER);
        let mut checked = 0;
        loop {
            let regs = inferior.registers().unwrap();
            if regs.pc < HELPER || regs.pc >= HELPER_END {
                break;
            }
            checked += 1;
            let bt = Backtrace::capture(&dwarf, &regs, Addr::NULL, &mut inferior).unwrap();
            assert_eq!(names(&bt), vec!["helper", "main"], "at {}", regs.pc);
            assert_eq!(bt.frames()[1].addr, MAIN_AFTER_CALL, "at {}", regs.pc);
            inferior.single_step().unwrap();
        }
        assert_eq!(checked, 5);
    }

    #[test]
    fn test_backtrace_needs_unwind_information() {
        let dwarf = sample_dwarf().with_call_frame_info(CallFrameInfo::default());
        let mut inferior = stopped_at(HELPER_BODY);
        let regs = inferior.registers().unwrap();
        let bt = Backtrace::capture(&dwarf, &regs, Addr::NULL, &mut inferior).unwrap();
        assert_eq!(names(&bt), vec!["helper"]);
    }

    #[test]
    fn test_backtrace_stops_at_unknown_function() {
        let dwarf = sample_dwarf();
        let mut tracee = SimulatedProcess::sample();
        crate::tracee::Tracee::set_pc(&mut tracee, MAIN_END).unwrap();
        let mut inferior = Inferior::from_tracee(tracee);
        let regs = inferior.registers().unwrap();
        let bt = Backtrace::capture(&dwarf, &regs, Addr::NULL, &mut inferior).unwrap();
        assert_eq!(bt.frames().len(), 1);
        assert_eq!(
            bt.frames()[0].to_string(),
            "unknown func (source file not found)"
        );
    }
}
