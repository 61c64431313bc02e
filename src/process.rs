//! # Process Module
//!
//! [`PtraceProcess`] is the [`Tracee`] implementation for real Linux processes.
//!
//! The debuggee is forked, marks itself as traced with `PTRACE_TRACEME` and then `execv`s the
//! target. The kernel stops it with a `SIGTRAP` right after the exec, before the first instruction
//! of the new program runs, which is where [`PtraceProcess::spawn`] hands it over.
//!
//! Word sized accesses use `PTRACE_PEEKDATA`/`PTRACE_POKEDATA`, larger reads and writes go through
//! `/proc/<pid>/mem`.

use std::ffi::CString;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};
use tracing::{debug, error, info, trace, warn};

use crate::config::DebuggerConfig;
use crate::errors::{DebuggerError, Result};
use crate::memorymap::ProcessMemoryMap;
use crate::tracee::{Resume, Tracee, WaitOutcome};
use crate::{Addr, RegisterSnapshot, Word};

/// Exit code of the forked child when `execv` fails
const EXEC_FAILED: i32 = 127;

/// A debuggee process controlled with ptrace
#[derive(Debug)]
pub struct PtraceProcess {
    pid: Pid,
    executable: PathBuf,
    reaped: bool,
}

impl PtraceProcess {
    /// Resolves `path` like a shell would: paths with a slash are used as is, bare names are
    /// looked up in `PATH`
    pub fn resolve_executable(path: &Path) -> Result<PathBuf> {
        let resolved = if path.components().count() == 1 && !path.exists() {
            which::which(path)
                .map_err(|_| DebuggerError::ExecutableDoesNotExist(path.display().to_string()))?
        } else {
            path.to_path_buf()
        };

        if !resolved.exists() {
            return Err(DebuggerError::ExecutableDoesNotExist(
                resolved.display().to_string(),
            ));
        }
        if !resolved.is_file() {
            return Err(DebuggerError::ExecutableIsNotAFile(
                resolved.display().to_string(),
            ));
        }
        Ok(resolved)
    }

    /// The executable that was started
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn mem_file(&self, write: bool) -> Result<std::fs::File> {
        Ok(std::fs::File::options()
            .read(!write)
            .write(write)
            .open(format!("/proc/{}/mem", self.pid))?)
    }
}

impl Tracee for PtraceProcess {
    fn spawn(path: &Path, args: &[String], config: &DebuggerConfig) -> Result<Self> {
        let executable = match Self::resolve_executable(path) {
            Ok(p) => p,
            Err(err) => {
                error!("{err}");
                return Err(err);
            }
        };

        // everything the child needs is prepared before forking
        let cpath = CString::new(executable.to_string_lossy().as_bytes())?;
        let mut argv = vec![cpath.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_str())?);
        }
        let disable_aslr = config.disable_aslr;

        match unsafe { fork() } {
            Err(e) => {
                error!("could not fork the debuggee: {e}");
                Err(DebuggerError::Launch(e.to_string()))
            }
            Ok(ForkResult::Child) => {
                if disable_aslr {
                    let _ = personality::set(Persona::ADDR_NO_RANDOMIZE);
                }
                if ptrace::traceme().is_ok() {
                    let _ = execv(&cpath, &argv);
                }
                // SAFETY: leaves the forked child without running any destructors of the parent
                unsafe { nix::libc::_exit(EXEC_FAILED) }
            }
            Ok(ForkResult::Parent { child: pid }) => {
                info!("started debuggee {} with pid {pid}", executable.display());
                let mut process = PtraceProcess {
                    pid,
                    executable,
                    reaped: false,
                };
                match process.wait()? {
                    WaitOutcome::Stopped {
                        signal: Signal::SIGTRAP,
                        ..
                    } => {
                        ptrace::setoptions(pid, ptrace::Options::PTRACE_O_EXITKILL)?;
                        Ok(process)
                    }
                    WaitOutcome::Exited(code) => Err(DebuggerError::Launch(format!(
                        "the debuggee exited with {code} before it could be traced"
                    ))),
                    other => {
                        let _ = process.kill();
                        Err(DebuggerError::Launch(format!(
                            "the debuggee reported {other:?} instead of the exec trap"
                        )))
                    }
                }
            }
        }
    }

    fn pid(&self) -> Pid {
        self.pid
    }

    fn read_word(&mut self, addr: Addr) -> Result<Word> {
        Ok(ptrace::read(self.pid, addr.into())?)
    }

    fn write_word(&mut self, addr: Addr, word: Word) -> Result<()> {
        Ok(ptrace::write(self.pid, addr.into(), word)?)
    }

    fn read_bytes(&mut self, addr: Addr, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.mem_file(false)?;
        file.seek(std::io::SeekFrom::Start(addr.into()))?;
        Ok(file.read(buf)?)
    }

    fn write_bytes(&mut self, addr: Addr, data: &[u8]) -> Result<usize> {
        let mut file = self.mem_file(true)?;
        file.seek(std::io::SeekFrom::Start(addr.into()))?;
        Ok(file.write(data)?)
    }

    fn registers(&self) -> Result<RegisterSnapshot> {
        let regs = ptrace::getregs(self.pid)?;
        Ok(RegisterSnapshot {
            pc: regs.rip.into(),
            frame_pointer: regs.rbp.into(),
            stack_pointer: regs.rsp.into(),
        })
    }

    fn set_pc(&mut self, pc: Addr) -> Result<()> {
        let mut regs = ptrace::getregs(self.pid)?;
        regs.rip = pc.u64();
        ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    fn resume(&mut self, mode: Resume, signal: Option<Signal>) -> Result<()> {
        trace!("resuming {} with {mode:?}, signal {signal:?}", self.pid);
        match mode {
            Resume::Continue => ptrace::cont(self.pid, signal)?,
            Resume::Step => ptrace::step(self.pid, signal)?,
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<WaitOutcome> {
        let outcome = match waitpid(self.pid, None)? {
            WaitStatus::Exited(_, code) => WaitOutcome::Exited(code),
            WaitStatus::Signaled(_, signal, _core_dumped) => WaitOutcome::Signaled(signal),
            WaitStatus::Stopped(_, signal) => {
                let code = match ptrace::getsiginfo(self.pid) {
                    Ok(info) => info.si_code,
                    Err(e) => {
                        warn!("could not get the siginfo of the stop: {e}");
                        0
                    }
                };
                WaitOutcome::Stopped { signal, code }
            }
            other => return Err(DebuggerError::UnexpectedWaitStatus(format!("{other:?}"))),
        };
        if outcome.is_terminal() {
            self.reaped = true;
        }
        debug!("debuggee {}: {outcome:?}", self.pid);
        Ok(outcome)
    }

    fn interrupt(&mut self) -> Result<()> {
        signal::kill(self.pid, Signal::SIGSTOP)?;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        ptrace::kill(self.pid)?;
        // reap it so no zombie is left behind
        loop {
            match waitpid(self.pid, None)? {
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => break,
                _ => continue,
            }
        }
        self.reaped = true;
        Ok(())
    }

    fn memory_map(&self) -> Result<ProcessMemoryMap> {
        Ok(proc_maps::get_process_maps(self.pid.into())?.into())
    }
}
