//! # Tracee Module
//!
//! The seam between the debugger's process control logic and the operating system.
//!
//! [`Tracee`] is the small set of primitives that [`Inferior`](crate::inferior::Inferior) needs:
//! word and byte sized memory access, the registers it cares about, resuming in one of two
//! [`Resume`] modes and waiting for the next [`WaitOutcome`]. Everything that decides *what* a
//! stop means (breakpoint hit, finished step, cancellation) lives in the inferior, so it can be
//! tested against a simulated process instead of a real one.

use std::path::Path;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::config::DebuggerConfig;
use crate::errors::Result;
use crate::memorymap::ProcessMemoryMap;
use crate::{Addr, RegisterSnapshot, Word};

/// How a stopped tracee should be resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Run until the next signal or exit (`PTRACE_CONT`)
    Continue,
    /// Execute exactly one instruction (`PTRACE_SINGLESTEP`)
    Step,
}

/// What `waitpid` reported about the tracee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The tracee is in a signal-delivery stop
    Stopped {
        /// The signal that stopped the tracee
        signal: Signal,
        /// `si_code` of the signal, used to classify `SIGTRAP`s
        code: i32,
    },
    /// The tracee exited normally with this exit code
    Exited(i32),
    /// The tracee was killed by this signal
    Signaled(Signal),
}

impl WaitOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WaitOutcome::Exited(_) | WaitOutcome::Signaled(_))
    }
}

/// Low level control over a traced process
///
/// All methods assume the tracee is currently stopped, except [`Tracee::wait`] which blocks until
/// it is.
pub trait Tracee {
    /// Starts `path` with `args` as a traced process, stopped before its first instruction
    ///
    /// # Errors
    ///
    /// Fails if the executable does not exist or the process could not be started.
    fn spawn(path: &Path, args: &[String], config: &DebuggerConfig) -> Result<Self>
    where
        Self: Sized;

    /// Process id of the tracee
    fn pid(&self) -> Pid;

    /// Reads the machine word at `addr`
    fn read_word(&mut self, addr: Addr) -> Result<Word>;

    /// Writes the machine word at `addr`
    fn write_word(&mut self, addr: Addr, word: Word) -> Result<()>;

    /// Reads up to `buf.len()` bytes starting at `addr`, returning how many were read
    fn read_bytes(&mut self, addr: Addr, buf: &mut [u8]) -> Result<usize>;

    /// Writes `data` starting at `addr`, returning how many bytes were written
    fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<usize>;

    /// Reads the program counter, frame pointer and stack pointer
    fn registers(&self) -> Result<RegisterSnapshot>;

    /// Sets the program counter
    fn set_pc(&mut self, pc: Addr) -> Result<()>;

    /// Resumes the tracee, delivering `signal` if given
    fn resume(&mut self, mode: Resume, signal: Option<Signal>) -> Result<()>;

    /// Blocks until the tracee stops or terminates
    fn wait(&mut self) -> Result<WaitOutcome>;

    /// Asks a running tracee to stop, the stop is then reported by [`Tracee::wait`]
    fn interrupt(&mut self) -> Result<()>;

    /// Kills the tracee and reaps it
    fn kill(&mut self) -> Result<()>;

    /// The current memory map of the tracee
    fn memory_map(&self) -> Result<ProcessMemoryMap>;
}
