//! # Step Module
//!
//! Line stepping on top of single instruction steps.
//!
//! [`StepController::next_line`] single steps the inferior until the program counter is on a
//! different source line than where it started, or has left code with line information. Calls
//! are stepped into: the first line of the callee is a different line. A step that lands on the
//! entry of a function goes on through its prologue and ends at the first line of the body,
//! where the frame is set up and the locals can be read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::config::DEFAULT_MAX_STEPS;
use crate::dbginfo::DwarfData;
use crate::errors::{DebuggerError, Result};
use crate::inferior::{Inferior, StopEvent};
use crate::tracee::Tracee;
use crate::Addr;

/// A flag that asks a running step loop to stop
///
/// Clones share the flag. Setting it only stores to an atomic, so it may be done from a signal
/// handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct StepController<'dwarf> {
    dwarf: &'dwarf DwarfData,
    max_steps: usize,
    cancel: Option<CancelToken>,
    load_bias: Addr,
}

impl<'dwarf> StepController<'dwarf> {
    pub fn new(dwarf: &'dwarf DwarfData) -> Self {
        Self {
            dwarf,
            max_steps: DEFAULT_MAX_STEPS,
            cancel: None,
            load_bias: Addr::NULL,
        }
    }

    /// Gives up after this many instructions
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Runtime addresses minus this are debug info addresses
    pub fn with_load_bias(mut self, load_bias: Addr) -> Self {
        self.load_bias = load_bias;
        self
    }

    /// Steps until the source line changes
    ///
    /// Returns [`StopEvent::SteppedOne`] when the inferior is on a new line or outside of known
    /// code, and any other event (breakpoint, signal, exit) as soon as a single step reports it.
    /// If the cancel token is set the inferior is stopped and [`StopEvent::Cancelled`] returned.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoLineInfo`] if the line does not change within the step
    /// limit, for example in an endless loop on one line. Steps through a prologue count towards
    /// the limit.
    pub fn next_line<T: Tracee>(&self, inferior: &mut Inferior<T>) -> Result<StopEvent> {
        let lines = self.dwarf.lines();
        let start_pc = inferior.registers()?.pc;
        let start = lines.lookup(start_pc.unrelocate(self.load_bias)).copied();
        trace!("line step from {start_pc}, line {:?}", start.map(|r| r.line));

        // (entry, body start) of a function whose prologue is being stepped through
        let mut prologue: Option<(Addr, Addr)> = None;
        let mut pc = start_pc;
        for step in 0..self.max_steps {
            if let Some(cancel) = &self.cancel {
                if cancel.is_cancelled() {
                    cancel.reset();
                    debug!("line step cancelled after {step} steps");
                    return inferior.request_stop();
                }
            }

            let event = inferior.single_step()?;
            if event != StopEvent::SteppedOne {
                return Ok(event);
            }
            pc = inferior.registers()?.pc;
            let debug_pc = pc.unrelocate(self.load_bias);

            if let Some((entry, body)) = prologue {
                let left = self.dwarf.function_at(debug_pc).map(|f| f.entry()) != Some(entry);
                if debug_pc == body || left {
                    trace!("line step ended after the prologue at {pc}");
                    return Ok(event);
                }
                continue;
            }

            match (lines.lookup(debug_pc), &start) {
                (Some(record), Some(start)) if record.same_line(start) => continue,
                _ => {
                    if let Some(found) = self.prologue_at(debug_pc) {
                        trace!("stepping through the prologue at {pc}");
                        prologue = Some(found);
                        continue;
                    }
                    trace!("line step ended at {pc} after {} steps", step + 1);
                    return Ok(event);
                }
            }
        }

        debug!("no new line after {} steps", self.max_steps);
        Err(DebuggerError::NoLineInfo(pc))
    }

    /// `(entry, body start)` if `pc` is the entry of a function with a prologue
    fn prologue_at(&self, pc: Addr) -> Option<(Addr, Addr)> {
        let function = self.dwarf.function_at(pc)?;
        let body = self.dwarf.body_start(function);
        (function.entry() == pc && body != pc).then_some((pc, body))
    }
}
