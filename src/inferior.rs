//! # Inferior Module
//!
//! The [`Inferior`] is the debuggee as the rest of the debugger sees it: a process that can be
//! resumed, single stepped, inspected and patched with breakpoints, and that reports *why* it
//! stopped as a [`StopEvent`].
//!
//! ## Breakpoints while stopped
//!
//! Enabled breakpoints stay installed while the inferior is stopped. When it stops on one, the
//! program counter is rewound to the breakpoint address so it points at the instruction that was
//! patched. Resuming from there would immediately trap again, so both
//! [`Inferior::continue_execution`] and [`Inferior::single_step`] first take the breakpoint out,
//! execute the one original instruction and put it back.
//!
//! Memory reads through [`Inferior::read_memory`] are raw and show the `int3` bytes, writes over
//! an installed breakpoint update the saved byte and leave the trap in place.
//!
//! ## States
//!
//! ```text
//! Created -> Running <-> Stopped -> Exited | Signaled
//! ```
//!
//! Every transition happens inside a control call (continue, step, stop request, kill). Control
//! calls on an inferior that has exited fail with [`DebuggerError::ProcessExited`].

use std::fmt::Display;
use std::path::Path;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::breakpoint::{Breakpoint, BreakpointSet};
use crate::config::DebuggerConfig;
use crate::consts::is_software_trap;
use crate::disassemble::Disassembly;
use crate::errors::{DebuggerError, Result};
use crate::memorymap::ProcessMemoryMap;
use crate::process::PtraceProcess;
use crate::scope::MemoryAccess;
use crate::tracee::{Resume, Tracee, WaitOutcome};
use crate::{Addr, RegisterSnapshot};

/// Why the inferior stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// Stopped on the breakpoint at this address, the program counter points at it
    BreakpointHit(Addr),
    /// A single step finished
    SteppedOne,
    /// Stopped by a signal, which is delivered when the inferior is resumed
    Stopped(Signal),
    /// Stopped on request of the user
    Cancelled,
    /// The process exited with this code
    Exited(i32),
    /// The process was killed by this signal
    Signaled(Signal),
}

impl StopEvent {
    /// The process is gone after this event
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopEvent::Exited(_) | StopEvent::Signaled(_))
    }
}

impl Display for StopEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopEvent::BreakpointHit(addr) => write!(f, "Breakpoint hit at {addr}"),
            StopEvent::SteppedOne => write!(f, "Stepped"),
            StopEvent::Stopped(signal) => write!(f, "Stopped by {signal}"),
            StopEvent::Cancelled => write!(f, "Cancelled"),
            StopEvent::Exited(code) => write!(f, "Child exited (status {code})"),
            StopEvent::Signaled(signal) => write!(f, "Child was killed by {signal}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferiorStatus {
    /// Launched and waiting at its first instruction
    Created,
    Running,
    Stopped(StopEvent),
    Exited(i32),
    Signaled(Signal),
}

impl InferiorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InferiorStatus::Exited(_) | InferiorStatus::Signaled(_))
    }
}

/// A debuggee process under control of the debugger
#[derive(Debug)]
pub struct Inferior<T: Tracee = PtraceProcess> {
    tracee: T,
    breakpoints: BreakpointSet,
    status: InferiorStatus,
    /// signal that stopped the inferior and is delivered on the next resume
    pending_signal: Option<Signal>,
    /// a stop was requested, the next `SIGSTOP` is ours
    stop_requested: bool,
}

impl<T: Tracee> Inferior<T> {
    /// Starts `path` with `args`, stopped before its first instruction
    ///
    /// # Errors
    ///
    /// Fails if the executable does not exist, is not a file, or if the process could not be
    /// started and traced.
    pub fn launch(path: &Path, args: &[String], config: &DebuggerConfig) -> Result<Self> {
        let tracee = T::spawn(path, args, config)?;
        info!("launched inferior with pid {}", tracee.pid());
        Ok(Self::from_tracee(tracee))
    }

    /// Takes control of an already started and stopped tracee
    pub fn from_tracee(tracee: T) -> Self {
        Self {
            tracee,
            breakpoints: BreakpointSet::new(),
            status: InferiorStatus::Created,
            pending_signal: None,
            stop_requested: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.tracee.pid()
    }

    pub fn status(&self) -> InferiorStatus {
        self.status
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn breakpoints(&self) -> &BreakpointSet {
        &self.breakpoints
    }

    pub fn tracee(&self) -> &T {
        &self.tracee
    }

    fn err_if_exited(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(DebuggerError::ProcessExited)
        }
    }

    pub fn registers(&self) -> Result<RegisterSnapshot> {
        self.err_if_exited()?;
        self.tracee.registers()
    }

    pub fn memory_map(&self) -> Result<ProcessMemoryMap> {
        self.err_if_exited()?;
        self.tracee.memory_map()
    }

    /// Sets a breakpoint at `addr` and installs it right away
    ///
    /// Setting a breakpoint where one already is enables it again.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::InvalidAddress`] if `addr` is not inside mapped executable
    /// memory.
    pub fn add_breakpoint(&mut self, addr: Addr) -> Result<Breakpoint> {
        self.err_if_exited()?;
        if !self.tracee.memory_map()?.is_executable(addr) {
            return Err(DebuggerError::InvalidAddress(addr));
        }
        let existed = self.breakpoints.get(addr).is_some();
        self.breakpoints.add(addr);
        if let Err(e) = self.breakpoints.install(&mut self.tracee, addr) {
            if !existed {
                self.breakpoints.remove(addr);
            }
            return Err(e);
        }
        self.breakpoints
            .get(addr)
            .cloned()
            .ok_or(DebuggerError::NoBreakpoint(addr))
    }

    /// Removes the breakpoint at `addr`, restoring the original byte
    ///
    /// Removing a breakpoint that does not exist does nothing.
    pub fn remove_breakpoint(&mut self, addr: Addr) -> Result<()> {
        if self.is_alive() {
            self.breakpoints.uninstall(&mut self.tracee, addr)?;
        }
        if self.breakpoints.remove(addr).is_some() {
            debug!("removed breakpoint at {addr}");
        }
        Ok(())
    }

    pub fn enable_breakpoint(&mut self, addr: Addr) -> Result<()> {
        self.breakpoints.set_enabled(addr, true)?;
        if self.is_alive() {
            self.breakpoints.install(&mut self.tracee, addr)?;
        }
        Ok(())
    }

    pub fn disable_breakpoint(&mut self, addr: Addr) -> Result<()> {
        self.breakpoints.set_enabled(addr, false)?;
        if self.is_alive() {
            self.breakpoints.uninstall(&mut self.tracee, addr)?;
        }
        Ok(())
    }

    /// Reads up to `len` bytes at `addr`, exactly as they are in memory
    ///
    /// The read stops early at the end of a mapping.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::AccessError`] if not a single byte can be read.
    pub fn read_memory(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        self.err_if_exited()?;
        let mut buf = vec![0u8; len];
        let read = self
            .tracee
            .read_bytes(addr, &mut buf)
            .map_err(|_| DebuggerError::AccessError(addr))?;
        if read == 0 && len > 0 {
            return Err(DebuggerError::AccessError(addr));
        }
        buf.truncate(read);
        Ok(buf)
    }

    /// Writes `data` to `addr`
    ///
    /// Bytes that fall on an installed breakpoint replace the byte the breakpoint saved, the
    /// `int3` stays in memory.
    pub fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        self.err_if_exited()?;
        let mut chunk_start = 0;
        for idx in 0..=data.len() {
            let at_breakpoint = idx < data.len() && self.breakpoints.is_installed(addr + idx);
            if idx == data.len() || at_breakpoint {
                if chunk_start < idx {
                    self.write_chunk(addr + chunk_start, &data[chunk_start..idx])?;
                }
                chunk_start = idx + 1;
            }
            if at_breakpoint {
                trace!("write at {} goes to the saved byte of a breakpoint", addr + idx);
                self.breakpoints.replace_saved_byte(addr + idx, data[idx]);
            }
        }
        Ok(())
    }

    fn write_chunk(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        let written = self
            .tracee
            .write_bytes(addr, data)
            .map_err(|_| DebuggerError::AccessError(addr))?;
        if written != data.len() {
            return Err(DebuggerError::AccessError(addr + written));
        }
        Ok(())
    }

    /// Disassembles `len` bytes at `addr`
    ///
    /// Unless `literal` is set, installed breakpoints are shown with their original bytes.
    pub fn disassemble(&mut self, addr: Addr, len: usize, literal: bool) -> Result<Disassembly> {
        let mut bytes = self.read_memory(addr, len)?;
        let mut marks = Vec::new();
        for bp in self.breakpoints.iter() {
            if bp.addr() < addr || bp.addr() >= addr + bytes.len() {
                continue;
            }
            marks.push(bp.addr());
            if let (false, Some(saved)) = (literal, bp.saved_byte()) {
                bytes[bp.addr() - addr] = saved;
            }
        }
        Ok(Disassembly::disassemble(&bytes, addr, &marks))
    }

    /// Runs until the next breakpoint, signal or exit
    pub fn continue_execution(&mut self) -> Result<StopEvent> {
        self.err_if_exited()?;
        if let Some(event) = self.step_past_breakpoint()? {
            return Ok(event);
        }
        for addr in self.breakpoints.install_enabled(&mut self.tracee) {
            warn!("could not install the breakpoint at {addr}");
        }
        let signal = self.pending_signal.take();
        self.resume(Resume::Continue, signal)?;
        let outcome = self.tracee.wait()?;
        self.classify(outcome, false)
    }

    /// Executes exactly one instruction
    pub fn single_step(&mut self) -> Result<StopEvent> {
        self.err_if_exited()?;
        let pc = self.tracee.registers()?.pc;
        if self.breakpoints.is_installed(pc) {
            return self.step_over_installed(pc);
        }
        let signal = self.pending_signal.take();
        self.resume(Resume::Step, signal)?;
        let outcome = self.tracee.wait()?;
        self.classify(outcome, true)
    }

    /// Makes a stopped inferior report [`StopEvent::Cancelled`], or interrupts a running one
    pub fn request_stop(&mut self) -> Result<StopEvent> {
        self.err_if_exited()?;
        if self.status != InferiorStatus::Running {
            self.status = InferiorStatus::Stopped(StopEvent::Cancelled);
            return Ok(StopEvent::Cancelled);
        }
        self.stop_requested = true;
        self.tracee.interrupt()?;
        let outcome = self.tracee.wait()?;
        self.classify(outcome, false)
    }

    /// Kills the inferior, restoring all breakpoint bytes first
    pub fn kill(&mut self) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        if let Err(e) = self.breakpoints.sweep(&mut self.tracee) {
            warn!("could not remove all breakpoints before killing: {e}");
        }
        self.tracee.kill()?;
        self.breakpoints.forget_installed();
        self.status = InferiorStatus::Signaled(Signal::SIGKILL);
        info!("killed inferior {}", self.pid());
        Ok(())
    }

    /// If the program counter is on an installed breakpoint, executes the original instruction
    ///
    /// Returns an event if that single step already stopped for another reason.
    fn step_past_breakpoint(&mut self) -> Result<Option<StopEvent>> {
        let pc = self.tracee.registers()?.pc;
        if !self.breakpoints.is_installed(pc) {
            return Ok(None);
        }
        match self.step_over_installed(pc)? {
            StopEvent::SteppedOne => Ok(None),
            other => Ok(Some(other)),
        }
    }

    fn step_over_installed(&mut self, pc: Addr) -> Result<StopEvent> {
        trace!("stepping over the breakpoint at {pc}");
        self.breakpoints.uninstall(&mut self.tracee, pc)?;
        let signal = self.pending_signal.take();
        self.resume(Resume::Step, signal)?;
        let outcome = self.tracee.wait()?;
        let event = self.classify(outcome, true)?;
        if self.is_alive() {
            if let Some(true) = self.breakpoints.get(pc).map(Breakpoint::enabled) {
                self.breakpoints.install(&mut self.tracee, pc)?;
            }
        }
        Ok(event)
    }

    fn resume(&mut self, mode: Resume, signal: Option<Signal>) -> Result<()> {
        if let Some(signal) = signal {
            debug!("delivering {signal} to the inferior");
        }
        self.tracee.resume(mode, signal)?;
        self.status = InferiorStatus::Running;
        Ok(())
    }

    /// Turns what `waitpid` said into a [`StopEvent`] and updates the status
    fn classify(&mut self, outcome: WaitOutcome, stepping: bool) -> Result<StopEvent> {
        let event = match outcome {
            WaitOutcome::Exited(code) => {
                self.breakpoints.forget_installed();
                self.status = InferiorStatus::Exited(code);
                info!("inferior exited with {code}");
                return Ok(StopEvent::Exited(code));
            }
            WaitOutcome::Signaled(signal) => {
                self.breakpoints.forget_installed();
                self.status = InferiorStatus::Signaled(signal);
                info!("inferior was killed by {signal}");
                return Ok(StopEvent::Signaled(signal));
            }
            WaitOutcome::Stopped {
                signal: Signal::SIGTRAP,
                code,
            } if is_software_trap(code) => {
                let pc = self.tracee.registers()?.pc;
                let bp_addr = pc - 1;
                if self.breakpoints.is_installed(bp_addr) {
                    self.tracee.set_pc(bp_addr)?;
                    StopEvent::BreakpointHit(bp_addr)
                } else {
                    // an int3 the program itself contains
                    debug!("trap at {pc} without a breakpoint");
                    StopEvent::Stopped(Signal::SIGTRAP)
                }
            }
            WaitOutcome::Stopped {
                signal: Signal::SIGTRAP,
                ..
            } if stepping => StopEvent::SteppedOne,
            WaitOutcome::Stopped {
                signal: Signal::SIGTRAP,
                ..
            } => StopEvent::Stopped(Signal::SIGTRAP),
            WaitOutcome::Stopped {
                signal: Signal::SIGINT,
                ..
            } => StopEvent::Cancelled,
            WaitOutcome::Stopped {
                signal: Signal::SIGSTOP,
                ..
            } => {
                if std::mem::take(&mut self.stop_requested) {
                    StopEvent::Cancelled
                } else {
                    StopEvent::Stopped(Signal::SIGSTOP)
                }
            }
            WaitOutcome::Stopped { signal, .. } => {
                self.pending_signal = Some(signal);
                StopEvent::Stopped(signal)
            }
        };
        debug!("inferior stopped: {event}");
        self.status = InferiorStatus::Stopped(event);
        Ok(event)
    }
}

impl<T: Tracee> MemoryAccess for Inferior<T> {
    fn read_memory(&mut self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        Inferior::read_memory(self, addr, len)
    }
}
